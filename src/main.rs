//! Trade position mirroring service
//!
//! Watches the open positions of a provider trading account and keeps one or
//! more receiver accounts in step: new positions are copied with per-receiver
//! sizing, SL/TP changes are propagated and closes are mirrored.

mod api;
mod bot;
mod db;
mod events;
mod models;
mod trading;

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tokio::sync::{mpsc, RwLock};
use tracing::{error, info, warn, Level};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use uuid::Uuid;

use crate::api::{BridgeAccount, BridgeSession, BridgeTerminal, PaperVenue, Terminal};
use crate::bot::Bot;
use crate::db::StateStore;
use crate::events::{action_channel, ActionSender, Notification, Notifier};
use crate::models::{short_id, LegState, LegView, TradeSide, TradeView};
use crate::trading::{AccountConfig, CopierConfig, CopyEngine, ReceiverHandle, Settings};

/// Trade position mirroring CLI.
#[derive(Parser)]
#[command(name = "mtmirror")]
#[command(about = "Mirror provider account positions onto receiver accounts", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config/config.json", global = true)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the copier
    Run {
        /// Use simulated in-memory accounts instead of the terminal gateway
        #[arg(long)]
        paper: bool,
    },

    /// Show persisted trade state
    State,

    /// Show the effective configuration (passwords masked)
    Config,
}

/// Latest snapshot, shared between the observer and the command reader.
type SharedView = Arc<RwLock<Vec<TradeView>>>;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(log_level).into())
        .from_env_lossy();
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run { paper } => run(&cli.config, paper).await?,
        Commands::State => show_state(&cli.config).await?,
        Commands::Config => show_config(&cli.config)?,
    }

    Ok(())
}

async fn run(config_path: &Path, paper: bool) -> Result<()> {
    let config = CopierConfig::load(config_path)?;
    let settings = config.settings.clone();

    info!(
        paper = paper,
        receivers = config.receivers.len(),
        cycle_interval_ms = settings.cycle_interval_ms,
        "Starting trade copier"
    );

    let store = StateStore::new(&settings.state_file);
    let records = store.load().await;
    let (notifier, notifications) = Notifier::channel(settings.notification_capacity);
    let (actions_tx, actions) = action_channel();

    let venue = paper.then(PaperVenue::new);
    let (provider, receivers) = match &venue {
        Some(venue) => paper_accounts(venue, &config).await,
        None => bridge_accounts(&config)?,
    };
    let provider_name = provider.name().to_string();

    let engine = CopyEngine::new(&config, provider, receivers, store, records, notifier);
    let mut bot = Bot::new(engine, actions);
    bot.initialize().await?;
    let shutdown = bot.shutdown_signal();

    let latest = SharedView::default();
    let observer = tokio::spawn(observe(notifications, latest.clone()));
    let commands = tokio::spawn(read_commands(
        actions_tx,
        shutdown,
        latest,
        venue.map(|v| (v, provider_name)),
    ));

    println!("Copier running. Commands: close <uid>, close-all, quit");
    if paper {
        println!("Paper mode: provider-open <symbol> <buy|sell> <volume> [sl] [tp], provider-close <ticket>");
    }

    // The bot bounds its own wait on an in-flight cycle, then saves and disconnects
    match tokio::spawn(async move { bot.run().await }).await {
        Ok(Ok(())) => info!("Copier stopped"),
        Ok(Err(e)) => error!(error = %format!("{:#}", e), "Copier stopped with an error"),
        Err(e) => error!(error = %e, "Copier task failed"),
    }

    commands.abort();
    let _ = tokio::time::timeout(Duration::from_secs(1), observer).await;
    Ok(())
}

async fn paper_accounts(
    venue: &Arc<PaperVenue>,
    config: &CopierConfig,
) -> (Arc<dyn Terminal>, Vec<ReceiverHandle>) {
    let provider: Arc<dyn Terminal> = Arc::new(venue.terminal(&config.provider.name()).await);

    let mut receivers = Vec::with_capacity(config.receivers.len());
    for receiver in &config.receivers {
        let terminal = Arc::new(venue.terminal(&receiver.name()).await);
        receivers.push(ReceiverHandle::new(
            receiver.clone(),
            terminal,
            config.settings.retry_interval(),
        ));
    }
    (provider, receivers)
}

fn bridge_accounts(config: &CopierConfig) -> Result<(Arc<dyn Terminal>, Vec<ReceiverHandle>)> {
    let session = BridgeSession::new(&config.settings.bridge_url)?;
    let account = |name: String, login: &AccountConfig| BridgeAccount {
        name,
        login: login.account,
        password: login.password.clone().unwrap_or_default(),
        server: login.server.clone(),
    };

    let provider: Arc<dyn Terminal> = Arc::new(BridgeTerminal::new(
        session.clone(),
        account(config.provider.name(), &config.provider.login),
    ));
    let receivers = config
        .receivers
        .iter()
        .map(|receiver| {
            ReceiverHandle::new(
                receiver.clone(),
                Arc::new(BridgeTerminal::new(
                    session.clone(),
                    account(receiver.name(), &receiver.login),
                )),
                config.settings.retry_interval(),
            )
        })
        .collect();
    Ok((provider, receivers))
}

/// Console observer: prints events, and snapshots only when they change.
async fn observe(mut notifications: mpsc::Receiver<Notification>, latest: SharedView) {
    let mut last_summary: Vec<String> = Vec::new();

    while let Some(notification) = notifications.recv().await {
        match notification {
            Notification::Status { source, message } => {
                println!("[{}] {} {}", Utc::now().format("%H:%M:%S"), source, message);
            }
            Notification::Error { source, message } => {
                println!(
                    "[{}] {} ERROR: {}",
                    Utc::now().format("%H:%M:%S"),
                    source,
                    message
                );
            }
            Notification::Snapshot { records } => {
                let summary: Vec<String> = records.iter().map(summarize).collect();
                if summary != last_summary {
                    if summary.is_empty() {
                        println!("\nNo tracked trades.");
                    } else {
                        println!(
                            "\n{:<10} {:<10} {:<5} {:>8} {:<14} RECEIVERS",
                            "UID", "SYMBOL", "SIDE", "VOLUME", "PROVIDER"
                        );
                        println!("{}", "-".repeat(80));
                        for line in &summary {
                            println!("{}", line);
                        }
                    }
                    last_summary = summary;
                }
                *latest.write().await = records;
            }
        }
    }
}

fn summarize(view: &TradeView) -> String {
    let provider = &view.provider;
    let mut flags = String::new();
    if view.is_duplicate {
        flags.push_str(" [DUP]");
    }
    if view.manually_closed {
        flags.push_str(" [CLOSING]");
    }

    let receivers: Vec<String> = view
        .receivers
        .iter()
        .map(|leg| format!("{}={}", leg.account, leg_label(leg)))
        .collect();

    format!(
        "{:<10} {:<10} {:<5} {:>8} {:<14} {}{}",
        short_id(&view.universal_id),
        truncate(provider.symbol.as_deref().unwrap_or("-"), 10),
        provider.side.map_or("-", |s| s.as_str()),
        provider.volume.map(|v| v.to_string()).unwrap_or_default(),
        leg_label(provider),
        receivers.join(", "),
        flags
    )
}

fn leg_label(leg: &LegView) -> String {
    let ticket = leg.ticket.map(|t| format!(" #{}", t)).unwrap_or_default();
    match leg.state {
        LegState::Live => format!("live{}", ticket),
        LegState::LastKnown => format!("last{}", ticket),
        LegState::AttemptingCopy => "copying".to_string(),
        LegState::NotFoundLive => format!("missing{}", ticket),
        LegState::NotCopied => "-".to_string(),
    }
}

/// stdin command producer for the Action Intake.
async fn read_commands(
    actions: ActionSender,
    shutdown: Arc<AtomicBool>,
    latest: SharedView,
    paper: Option<(Arc<PaperVenue>, String)>,
) {
    let mut lines = stdin_lines();

    while let Some(line) = lines.recv().await {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some((command, args)) = parts.split_first() else {
            continue;
        };

        let result = match (*command, args) {
            ("quit" | "exit", _) => {
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
            ("close-all", _) => {
                actions.close_all();
                Ok(())
            }
            ("close", [uid]) => match resolve_uid(&latest, uid).await {
                Ok(id) => {
                    actions.close_trade(id);
                    Ok(())
                }
                Err(e) => Err(e),
            },
            ("provider-open" | "provider-close", _) => match &paper {
                Some((venue, provider)) => paper_command(venue, provider, command, args).await,
                None => Err(anyhow::anyhow!("{} is only available in paper mode", command)),
            },
            _ => Err(anyhow::anyhow!("Unknown command: {}", line.trim())),
        };

        if let Err(e) = result {
            println!("{:#}", e);
        }
    }
}

/// Lines from stdin, read on a plain thread that runtime shutdown does not
/// wait for.
fn stdin_lines() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    let spawned = std::thread::Builder::new()
        .name("stdin".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                match line {
                    Ok(line) => {
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to read stdin, command input disabled");
                        break;
                    }
                }
            }
        });
    if let Err(e) = spawned {
        warn!(error = %e, "Failed to start stdin reader, command input disabled");
    }
    rx
}

/// Accept a full universal id or a unique prefix of one being displayed.
async fn resolve_uid(latest: &SharedView, raw: &str) -> Result<Uuid> {
    if let Ok(id) = Uuid::parse_str(raw) {
        return Ok(id);
    }
    let prefix = raw.to_lowercase();
    let matches: Vec<Uuid> = latest
        .read()
        .await
        .iter()
        .map(|v| v.universal_id)
        .filter(|id| id.simple().to_string().starts_with(&prefix))
        .collect();

    match matches.as_slice() {
        [id] => Ok(*id),
        [] => bail!("No tracked trade matches {}", raw),
        _ => bail!("{} matches {} trades, use more characters", raw, matches.len()),
    }
}

async fn paper_command(
    venue: &Arc<PaperVenue>,
    provider: &str,
    command: &str,
    args: &[&str],
) -> Result<()> {
    match (command, args) {
        ("provider-open", [symbol, side, volume, stops @ ..]) => {
            let side = match side.to_lowercase().as_str() {
                "buy" => TradeSide::Buy,
                "sell" => TradeSide::Sell,
                other => bail!("Unknown side {}", other),
            };
            let volume = Decimal::from_str(volume).context("Invalid volume")?;
            let stop = |i: usize| -> Result<Decimal> {
                stops
                    .get(i)
                    .map(|s| Decimal::from_str(s).context("Invalid price"))
                    .unwrap_or(Ok(Decimal::ZERO))
            };
            let ticket = venue
                .place_position(
                    provider,
                    &symbol.to_uppercase(),
                    side,
                    volume,
                    stop(0)?,
                    stop(1)?,
                    "",
                    Utc::now(),
                )
                .await?;
            println!("Opened provider position {}", ticket);
            Ok(())
        }
        ("provider-close", [ticket]) => {
            let ticket: u64 = ticket.parse().context("Invalid ticket")?;
            if venue.remove_position(provider, ticket).await {
                println!("Closed provider position {}", ticket);
                Ok(())
            } else {
                bail!("Provider position {} not found", ticket)
            }
        }
        _ => bail!("Usage: provider-open <symbol> <buy|sell> <volume> [sl] [tp] | provider-close <ticket>"),
    }
}

async fn show_state(config_path: &Path) -> Result<()> {
    let settings = settings_or_default(config_path);
    let store = StateStore::new(&settings.state_file);
    let records = store.load().await;

    if records.is_empty() {
        println!("No persisted trades in {}", store.path().display());
        return Ok(());
    }

    println!(
        "\n{:<10} {:>10} {:<10} {:<5} {:>8} {:<12} RECEIVERS",
        "UID", "TICKET", "SYMBOL", "SIDE", "VOLUME", "FLAGS"
    );
    println!("{}", "-".repeat(90));

    for record in records.values() {
        let mut flags = Vec::new();
        if record.is_duplicate {
            flags.push("dup");
        }
        if record.duplicate_opened {
            flags.push("dup-open");
        }
        if record.duplicate_permanent_failure {
            flags.push("dup-fail");
        }
        if record.manually_closed {
            flags.push("closing");
        }
        let receivers: Vec<String> = record
            .receivers
            .iter()
            .map(|(name, copy)| match copy.ticket() {
                Some(ticket) => format!("{}={}#{}", name, copy.status().as_str(), ticket),
                None => format!("{}={}", name, copy.status().as_str()),
            })
            .collect();

        println!(
            "{:<10} {:>10} {:<10} {:<5} {:>8} {:<12} {}",
            record.short_id(),
            record
                .provider_ticket
                .map(|t| t.to_string())
                .unwrap_or_else(|| "-".to_string()),
            truncate(&record.provider_symbol, 10),
            record.side.as_str(),
            record.volume.to_string(),
            flags.join(","),
            receivers.join(", ")
        );
    }

    println!("\n{} records in {}", records.len(), store.path().display());
    Ok(())
}

fn show_config(config_path: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(config_path)
        .with_context(|| format!("Failed to read configuration {}", config_path.display()))?;
    let mut config = CopierConfig::from_json(&raw)?;
    config.apply_env_credentials();

    println!("{}", serde_json::to_string_pretty(&config.redacted())?);

    match config.validate() {
        Ok(()) => println!("\nConfiguration is valid."),
        Err(e) => println!("\nConfiguration is invalid: {:#}", e),
    }
    Ok(())
}

/// Settings from the config file, or defaults when it cannot be read.
fn settings_or_default(config_path: &Path) -> Settings {
    match std::fs::read_to_string(config_path)
        .map_err(anyhow::Error::from)
        .and_then(|raw| CopierConfig::from_json(&raw))
    {
        Ok(config) => config.settings,
        Err(e) => {
            warn!(
                path = %config_path.display(),
                error = %format!("{:#}", e),
                "Configuration unavailable, using default settings"
            );
            Settings::default()
        }
    }
}

/// Truncate string to max length with ellipsis.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}
