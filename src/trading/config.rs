//! Copier configuration.
//!
//! Loaded from a JSON file. Keys written by older versions of the copier
//! (`magic_number`, `provider_lot_size_multiplied_by`, `SymbolMapping`, the
//! `RecieverSymbol` misspelling, ...) are accepted as aliases.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::models::TradeSide;

/// Environment variable prefix for account passwords: `MTMIRROR_PASSWORD_<account>`.
pub const PASSWORD_ENV_PREFIX: &str = "MTMIRROR_PASSWORD_";

fn default_cycle_interval_ms() -> u64 {
    1_000
}

fn default_retry_interval_secs() -> u64 {
    30
}

fn default_state_file() -> PathBuf {
    PathBuf::from("data/trade_copier_state.json")
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}

fn default_notification_capacity() -> usize {
    256
}

fn default_bridge_url() -> String {
    "http://127.0.0.1:8228".to_string()
}

fn default_deviation() -> u32 {
    50
}

fn default_true() -> bool {
    true
}

fn default_multiplier() -> Decimal {
    Decimal::ONE
}

fn default_max_age_minutes() -> i64 {
    5
}

/// Engine-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Period of the reconciliation loop
    #[serde(
        default = "default_cycle_interval_ms",
        alias = "default_processing_interval_ms"
    )]
    pub cycle_interval_ms: u64,

    /// Minimum wait before retrying a failed copy
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,

    /// Place a second provider order for every manual provider trade
    #[serde(default)]
    pub duplicate_provider_trades: bool,

    #[serde(
        default = "default_retry_interval_secs",
        alias = "duplicate_retry_interval_seconds"
    )]
    pub duplicate_retry_interval_secs: u64,

    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    /// Only log actionable events; routine cycle chatter drops to trace
    #[serde(default)]
    pub log_actions_only: bool,

    /// How long shutdown waits for the running cycle to finish
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    /// Capacity of the outbound notification channel
    #[serde(default = "default_notification_capacity")]
    pub notification_capacity: usize,

    /// Terminal gateway base URL
    #[serde(default = "default_bridge_url")]
    pub bridge_url: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cycle_interval_ms: default_cycle_interval_ms(),
            retry_interval_secs: default_retry_interval_secs(),
            duplicate_provider_trades: false,
            duplicate_retry_interval_secs: default_retry_interval_secs(),
            state_file: default_state_file(),
            log_actions_only: false,
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            notification_capacity: default_notification_capacity(),
            bridge_url: default_bridge_url(),
        }
    }
}

impl Settings {
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_millis(self.cycle_interval_ms)
    }

    pub fn retry_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.retry_interval_secs as i64)
    }

    pub fn duplicate_retry_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.duplicate_retry_interval_secs as i64)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Login details shared by provider and receivers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub account: u64,

    /// Falls back to `MTMIRROR_PASSWORD_<account>`
    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub server: String,

    /// Attribution marker stamped on orders this account places
    #[serde(default, alias = "magic_number")]
    pub tag: i64,

    #[serde(default = "default_deviation")]
    pub price_deviation_points: u32,
}

impl AccountConfig {
    fn fill_password_from_env(&mut self) {
        let missing = self.password.as_deref().map_or(true, str::is_empty);
        if missing {
            if let Ok(password) = std::env::var(format!("{}{}", PASSWORD_ENV_PREFIX, self.account)) {
                self.password = Some(password);
            }
        }
    }

    fn has_password(&self) -> bool {
        self.password.as_deref().map_or(false, |p| !p.is_empty())
    }
}

/// The account whose positions are mirrored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(flatten)]
    pub login: AccountConfig,

    /// Tag for orders placed by the duplication policy; defaults to `tag`
    #[serde(default, alias = "duplicate_magic_number")]
    pub duplicate_tag: Option<i64>,
}

impl ProviderConfig {
    pub fn name(&self) -> String {
        format!("Provider-{}", self.login.account)
    }

    pub fn duplicate_tag(&self) -> i64 {
        self.duplicate_tag.unwrap_or(self.login.tag)
    }
}

/// One provider -> receiver symbol rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolMapping {
    #[serde(alias = "ProviderSymbol", alias = "providerSymbol")]
    pub provider_symbol: String,

    #[serde(
        default,
        alias = "ReceiverSymbol",
        alias = "RecieverSymbol",
        alias = "receiverSymbol",
        alias = "recieverSymbol",
        alias = "reciever_symbol"
    )]
    pub receiver_symbol: String,
}

/// An account that replicates the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverConfig {
    #[serde(flatten)]
    pub login: AccountConfig,

    /// Identifier used in state and notifications; defaults to `Receiver-<account>`
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(
        default = "default_multiplier",
        alias = "provider_lot_size_multiplied_by"
    )]
    pub volume_multiplier: Decimal,

    #[serde(default = "default_true")]
    pub copy_buy_trades: bool,

    #[serde(default = "default_true")]
    pub copy_sell_trades: bool,

    /// Provider positions older than this are not copied
    #[serde(
        default = "default_max_age_minutes",
        alias = "exclude_trades_older_than_minutes"
    )]
    pub max_trade_age_minutes: i64,

    #[serde(default, alias = "SymbolMapping")]
    pub symbol_mapping: Vec<SymbolMapping>,
}

impl ReceiverConfig {
    pub fn name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("Receiver-{}", self.login.account))
    }

    pub fn allows(&self, side: TradeSide) -> bool {
        match side {
            TradeSide::Buy => self.copy_buy_trades,
            TradeSide::Sell => self.copy_sell_trades,
        }
    }

    pub fn max_trade_age(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.max_trade_age_minutes)
    }

    /// Receiver-side symbol for `provider_symbol`. First matching rule wins;
    /// a rule with an empty target keeps the provider symbol.
    pub fn map_symbol<'a>(&'a self, provider_symbol: &'a str) -> &'a str {
        self.symbol_mapping
            .iter()
            .find(|m| m.provider_symbol == provider_symbol)
            .map(|m| m.receiver_symbol.as_str())
            .filter(|s| !s.is_empty())
            .unwrap_or(provider_symbol)
    }
}

/// Complete copier configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopierConfig {
    #[serde(default)]
    pub settings: Settings,

    pub provider: ProviderConfig,

    #[serde(default)]
    pub receivers: Vec<ReceiverConfig>,
}

impl CopierConfig {
    /// Load, fill credentials from the environment, and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration {}", path.display()))?;
        let mut config = Self::from_json(&raw)
            .with_context(|| format!("Failed to parse configuration {}", path.display()))?;

        config.apply_env_credentials();
        config.validate()?;

        info!(
            path = %path.display(),
            receivers = config.receivers.len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Parse and drop disabled receivers.
    pub fn from_json(raw: &str) -> Result<Self> {
        let mut config: CopierConfig = serde_json::from_str(raw)?;
        let before = config.receivers.len();
        config.receivers.retain(|r| r.enabled);
        if config.receivers.len() < before {
            info!(disabled = before - config.receivers.len(), "Skipping disabled receivers");
        }
        Ok(config)
    }

    pub fn apply_env_credentials(&mut self) {
        self.provider.login.fill_password_from_env();
        for receiver in &mut self.receivers {
            receiver.login.fill_password_from_env();
        }
    }

    /// Check everything needed to start. Errors here are fatal.
    pub fn validate(&self) -> Result<()> {
        if self.provider.login.account == 0 {
            bail!("provider.account is required");
        }
        if !self.provider.login.has_password() {
            bail!(
                "Missing password for provider account {} (set it in the config or {}{})",
                self.provider.login.account,
                PASSWORD_ENV_PREFIX,
                self.provider.login.account
            );
        }
        if self.settings.cycle_interval_ms == 0 {
            bail!("settings.cycle_interval_ms must be positive");
        }
        if self.settings.notification_capacity == 0 {
            bail!("settings.notification_capacity must be positive");
        }
        if self.receivers.is_empty() {
            warn!("No enabled receivers configured; only provider-side features will run");
        }

        let mut names = HashSet::new();
        for receiver in &self.receivers {
            let name = receiver.name();
            if !names.insert(name.clone()) {
                bail!("Duplicate receiver name {}", name);
            }
            if !receiver.login.has_password() {
                bail!(
                    "Missing password for receiver {} (set it in the config or {}{})",
                    name,
                    PASSWORD_ENV_PREFIX,
                    receiver.login.account
                );
            }
            if receiver.volume_multiplier <= Decimal::ZERO {
                bail!("Receiver {} has a non-positive volume multiplier", name);
            }
        }

        Ok(())
    }

    /// Copy with passwords masked, for display.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        let mask = |login: &mut AccountConfig| {
            if login.password.is_some() {
                login.password = Some("****".to_string());
            }
        };
        mask(&mut copy.provider.login);
        for receiver in &mut copy.receivers {
            mask(&mut receiver.login);
        }
        copy
    }
}
