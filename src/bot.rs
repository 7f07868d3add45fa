//! Bot runner: owns the engine and drives it on a fixed schedule.
//!
//! Handles:
//! - Connecting the provider and receivers at startup
//! - Draining queued close commands into each cycle
//! - Running reconciliation cycles until shutdown is requested
//! - Final save and disconnect on the way out

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::Utc;
use futures::FutureExt;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::api::{DealQuery, PositionFilter};
use crate::events::{ActionQueue, SYSTEM_SOURCE};
use crate::trading::CopyEngine;

/// Main bot runner.
pub struct Bot {
    engine: CopyEngine,
    actions: ActionQueue,
    shutdown: Arc<AtomicBool>,
    cycle_interval: Duration,
    shutdown_timeout: Duration,
}

impl Bot {
    pub fn new(engine: CopyEngine, actions: ActionQueue) -> Self {
        let cycle_interval = engine.settings().cycle_interval();
        let shutdown_timeout = engine.settings().shutdown_timeout();
        Self {
            engine,
            actions,
            shutdown: Arc::new(AtomicBool::new(false)),
            cycle_interval,
            shutdown_timeout,
        }
    }

    /// Get shutdown signal for external control.
    pub fn shutdown_signal(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn engine(&self) -> &CopyEngine {
        &self.engine
    }

    /// Connect every account. Only a provider failure is fatal.
    pub async fn initialize(&mut self) -> Result<()> {
        let provider = self.engine.provider().clone();
        let notifier = self.engine.notifier().clone();

        if let Err(e) = provider.connect().await {
            error!(account = provider.name(), error = %e, "Provider connection failed");
            notifier.error(provider.name(), format!("Connection failed: {}", e));
            bail!("Provider {} connection failed: {}", provider.name(), e);
        }
        info!(account = provider.name(), "Provider connected");
        self.log_diagnostics().await;

        for receiver in self.engine.receivers() {
            match receiver.terminal().connect().await {
                Ok(()) => info!(account = receiver.name(), "Receiver connected"),
                Err(e) => {
                    warn!(
                        account = receiver.name(),
                        error = %e,
                        "Receiver connection failed, will retry every cycle"
                    );
                    notifier.status(
                        receiver.name(),
                        format!("Connection failed, retrying each cycle: {}", e),
                    );
                }
            }
        }

        info!(
            receivers = self.engine.receivers().count(),
            records = self.engine.records().len(),
            "Trade manager initialized"
        );
        notifier.status(SYSTEM_SOURCE, "Trade Manager Started.");
        Ok(())
    }

    /// Startup visibility into the provider account.
    async fn log_diagnostics(&self) {
        let provider = self.engine.provider();
        if !provider.ensure_context().await {
            warn!(account = provider.name(), "Provider context unavailable for diagnostics");
            return;
        }

        let positions = provider.list_positions(&PositionFilter::all()).await;
        let orders = provider.list_orders().await;
        let now = Utc::now();
        let deals = provider
            .list_recent_deals(DealQuery::Window {
                from: now - chrono::Duration::hours(24),
                to: now,
            })
            .await;

        match (positions, orders, deals) {
            (Ok(positions), Ok(orders), Ok(deals)) => info!(
                account = provider.name(),
                positions = positions.len(),
                orders = orders.len(),
                deals_24h = deals.len(),
                "Provider account state"
            ),
            (positions, orders, deals) => warn!(
                account = provider.name(),
                positions_ok = positions.is_ok(),
                orders_ok = orders.is_ok(),
                deals_ok = deals.is_ok(),
                "Provider diagnostics incomplete"
            ),
        }
    }

    /// Main run loop.
    pub async fn run(&mut self) -> Result<()> {
        info!(
            cycle_interval_ms = self.cycle_interval.as_millis() as u64,
            "Starting trade manager loop"
        );

        let mut ticker = interval(self.cycle_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Register shutdown handler
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
            shutdown.store(true, Ordering::SeqCst);
        });

        let shutdown = self.shutdown.clone();
        let grace = self.shutdown_timeout;
        while !shutdown.load(Ordering::SeqCst) {
            ticker.tick().await;
            if shutdown.load(Ordering::SeqCst) {
                break;
            }

            let cycle = self.tick();
            tokio::pin!(cycle);
            let finished = tokio::select! {
                _ = &mut cycle => true,
                _ = shutdown_requested(&shutdown) => {
                    tokio::time::timeout(grace, &mut cycle).await.is_ok()
                }
            };
            if !finished {
                warn!(
                    timeout_ms = grace.as_millis() as u64,
                    "Cycle still running at shutdown timeout, abandoning it"
                );
                break;
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// One cycle. Errors and panics are reported and the loop goes on.
    async fn tick(&mut self) {
        let actions = self.actions.drain();
        let outcome = AssertUnwindSafe(self.engine.run_cycle(actions))
            .catch_unwind()
            .await;

        let message = match outcome {
            Ok(Ok(report)) => {
                debug!(?report, "Cycle complete");
                return;
            }
            Ok(Err(e)) => format!("{:#}", e),
            Err(panic) => panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "cycle panicked".to_string()),
        };

        error!(error = %message, "Error in trade manager cycle");
        self.engine
            .notifier()
            .error(SYSTEM_SOURCE, format!("TradeManager loop error: {}", message));
    }

    /// Graceful shutdown.
    async fn shutdown(&mut self) {
        info!("Shutting down trade manager...");

        let pending = self.actions.drain();
        if !pending.is_empty() {
            warn!(actions = pending.len(), "Dropping queued actions at shutdown");
        }

        self.engine.persist().await;

        for receiver in self.engine.receivers() {
            receiver.terminal().disconnect().await;
        }
        self.engine.provider().disconnect().await;

        self.engine
            .notifier()
            .status(SYSTEM_SOURCE, "Trade Manager Stopped.");
        info!("Trade manager shutdown complete");
    }
}

/// Resolves once the shutdown flag is set.
async fn shutdown_requested(flag: &AtomicBool) {
    while !flag.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::PaperVenue;
    use crate::db::StateStore;
    use crate::events::{action_channel, Notification, Notifier};
    use crate::models::{RecordMap, TradeSide};
    use crate::trading::{CopierConfig, ReceiverHandle};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use tempfile::TempDir;
    use tokio_test::{assert_err, assert_ok};

    async fn bot(
        venue: &Arc<PaperVenue>,
        dir: &TempDir,
    ) -> (Bot, tokio::sync::mpsc::Receiver<Notification>) {
        let config = CopierConfig::from_json(
            r#"{"settings": {"cycle_interval_ms": 20, "shutdown_timeout_secs": 1},
                "provider": {"account": 1, "password": "p"},
                "receivers": [{"account": 2, "password": "r", "tag": 5}]}"#,
        )
        .unwrap();
        let provider = Arc::new(venue.terminal(&config.provider.name()).await);
        let receiver = config.receivers[0].clone();
        let terminal = Arc::new(venue.terminal(&receiver.name()).await);
        let handles = vec![ReceiverHandle::new(
            receiver,
            terminal,
            config.settings.retry_interval(),
        )];

        let (notifier, rx) = Notifier::channel(1024);
        let (_, actions) = action_channel();
        let engine = CopyEngine::new(
            &config,
            provider,
            handles,
            StateStore::new(dir.path().join("state.json")),
            RecordMap::new(),
            notifier,
        );
        (Bot::new(engine, actions), rx)
    }

    #[tokio::test]
    async fn test_unreachable_provider_is_fatal() {
        let venue = PaperVenue::new();
        let dir = TempDir::new().unwrap();
        let (mut bot, _rx) = bot(&venue, &dir).await;
        venue.set_reachable("Provider-1", false).await;

        assert_err!(bot.initialize().await);
    }

    #[tokio::test]
    async fn test_unreachable_receiver_is_not_fatal() {
        let venue = PaperVenue::new();
        let dir = TempDir::new().unwrap();
        let (mut bot, mut rx) = bot(&venue, &dir).await;
        venue.set_reachable("Receiver-2", false).await;

        assert_ok!(bot.initialize().await);
        let mut started = false;
        while let Ok(n) = rx.try_recv() {
            if matches!(&n, Notification::Status { message, .. } if message == "Trade Manager Started.") {
                started = true;
            }
        }
        assert!(started);
    }

    #[tokio::test]
    async fn test_run_copies_then_stops() {
        let venue = PaperVenue::new();
        let dir = TempDir::new().unwrap();
        let (mut bot, mut rx) = bot(&venue, &dir).await;
        assert_ok!(bot.initialize().await);
        venue
            .place_position(
                "Provider-1",
                "EURUSD",
                TradeSide::Buy,
                dec!(1),
                Decimal::ZERO,
                Decimal::ZERO,
                "",
                Utc::now(),
            )
            .await
            .unwrap();

        let shutdown = bot.shutdown_signal();
        let handle = tokio::spawn(async move {
            bot.run().await.unwrap();
            bot
        });
        tokio::time::sleep(Duration::from_millis(300)).await;
        shutdown.store(true, Ordering::SeqCst);
        let bot = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(venue.positions("Receiver-2").await.len(), 1);
        assert_eq!(bot.engine().records().len(), 1);

        let mut stopped = false;
        while let Ok(n) = rx.try_recv() {
            if matches!(&n, Notification::Status { message, .. } if message == "Trade Manager Stopped.") {
                stopped = true;
            }
        }
        assert!(stopped);
    }

    #[tokio::test]
    async fn test_stuck_cycle_still_saves_and_disconnects() {
        let venue = PaperVenue::new();
        let dir = TempDir::new().unwrap();
        let (mut bot, mut rx) = bot(&venue, &dir).await;
        assert_ok!(bot.initialize().await);
        venue
            .place_position(
                "Provider-1",
                "EURUSD",
                TradeSide::Sell,
                dec!(1),
                Decimal::ZERO,
                Decimal::ZERO,
                "",
                Utc::now(),
            )
            .await
            .unwrap();

        let shutdown = bot.shutdown_signal();
        let handle = tokio::spawn(async move { bot.run().await });
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(venue.positions("Receiver-2").await.len(), 1);

        venue.set_stalled("Provider-1", true).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.store(true, Ordering::SeqCst);

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_ok!(result);

        let saved = StateStore::new(dir.path().join("state.json")).load().await;
        assert_eq!(saved.len(), 1);
        assert!(!venue.is_connected("Provider-1").await);
        assert!(!venue.is_connected("Receiver-2").await);

        let stopped = std::iter::from_fn(|| rx.try_recv().ok()).any(|n| {
            matches!(&n, Notification::Status { message, .. } if message == "Trade Manager Stopped.")
        });
        assert!(stopped);
    }

    #[tokio::test]
    async fn test_cycle_error_reported_and_loop_continues() {
        let venue = PaperVenue::new();
        let dir = TempDir::new().unwrap();
        let (mut bot, mut rx) = bot(&venue, &dir).await;
        assert_ok!(bot.initialize().await);
        venue.set_reachable("Provider-1", false).await;

        bot.tick().await;
        bot.tick().await;

        let errors = std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|n| matches!(n, Notification::Error { message, .. } if message.starts_with("TradeManager loop error")))
            .count();
        assert_eq!(errors, 2);
    }
}
