//! Terminal-side data: open positions, pending orders, deals and symbol constraints.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "BUY",
            TradeSide::Sell => "SELL",
        }
    }

    /// Terminal order-type code (0 = buy, 1 = sell).
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(TradeSide::Buy),
            1 => Some(TradeSide::Sell),
            _ => None,
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            TradeSide::Buy => 0,
            TradeSide::Sell => 1,
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            TradeSide::Buy => TradeSide::Sell,
            TradeSide::Sell => TradeSide::Buy,
        }
    }
}

impl std::fmt::Display for TradeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Open position as reported by a terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Venue-assigned position ticket
    pub ticket: u64,

    pub symbol: String,

    pub side: TradeSide,

    /// Volume in lots
    pub volume: Decimal,

    pub open_price: Decimal,

    /// Zero means no stop-loss set
    #[serde(default)]
    pub stop_loss: Decimal,

    /// Zero means no take-profit set
    #[serde(default)]
    pub take_profit: Decimal,

    pub open_time: DateTime<Utc>,

    #[serde(default)]
    pub profit: Decimal,

    /// Attribution marker (magic number) of the order that opened this position
    #[serde(default)]
    pub tag: i64,

    #[serde(default)]
    pub comment: String,
}

impl Position {
    /// Age of the position relative to `now`.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.open_time
    }
}

/// Pending order as reported by a terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub ticket: u64,
    pub symbol: String,
    pub side: TradeSide,
    pub volume: Decimal,
    #[serde(default)]
    pub price: Decimal,
    #[serde(default)]
    pub tag: i64,
    #[serde(default)]
    pub comment: String,
}

/// Executed deal from the account history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deal {
    pub ticket: u64,
    /// Position the deal opened, modified or closed
    pub position_id: u64,
    pub symbol: String,
    pub side: TradeSide,
    pub volume: Decimal,
    pub price: Decimal,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub tag: i64,
    #[serde(default)]
    pub comment: String,
}

/// Trading constraints for one symbol on one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub name: String,
    pub volume_min: Decimal,
    pub volume_max: Decimal,
    pub volume_step: Decimal,
    /// Price precision
    #[serde(default = "default_digits")]
    pub digits: u32,
}

fn default_digits() -> u32 {
    5
}

impl SymbolInfo {
    /// Round a price to the symbol's precision. Zero stays zero.
    pub fn normalize_price(&self, price: Decimal) -> Decimal {
        if price.is_zero() {
            return price;
        }
        price.round_dp(self.digits)
    }
}
