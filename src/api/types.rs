//! Wire types for the terminal gateway HTTP API.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::{Deal, Order, Position, SymbolInfo, TradeSide};

/// Login request for `/login`.
#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest<'a> {
    pub login: u64,
    pub password: &'a str,
    pub server: &'a str,
}

/// Account currently active in the gateway's terminal.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountResponse {
    pub login: Option<u64>,
    #[serde(default)]
    pub trade_allowed: bool,
}

/// Position as returned by `/positions`.
#[derive(Debug, Clone, Deserialize)]
pub struct PositionResponse {
    pub ticket: u64,
    pub symbol: String,
    /// 0 = buy, 1 = sell
    #[serde(rename = "type")]
    pub kind: i64,
    pub volume: Decimal,
    pub price_open: Decimal,
    #[serde(default)]
    pub sl: Decimal,
    #[serde(default)]
    pub tp: Decimal,
    /// Unix seconds
    pub time: i64,
    #[serde(default)]
    pub profit: Decimal,
    #[serde(default)]
    pub magic: i64,
    #[serde(default)]
    pub comment: String,
}

impl PositionResponse {
    pub fn into_position(self) -> Option<Position> {
        Some(Position {
            ticket: self.ticket,
            symbol: self.symbol,
            side: TradeSide::from_code(self.kind)?,
            volume: self.volume,
            open_price: self.price_open,
            stop_loss: self.sl,
            take_profit: self.tp,
            open_time: from_unix(self.time),
            profit: self.profit,
            tag: self.magic,
            comment: self.comment,
        })
    }
}

/// Pending order as returned by `/orders`.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderResponse {
    pub ticket: u64,
    pub symbol: String,
    #[serde(rename = "type")]
    pub kind: i64,
    pub volume_current: Decimal,
    #[serde(default)]
    pub price_open: Decimal,
    #[serde(default)]
    pub magic: i64,
    #[serde(default)]
    pub comment: String,
}

impl OrderResponse {
    /// Pending orders of non-market types (limits, stops) map onto their direction.
    pub fn into_order(self) -> Order {
        let side = if self.kind % 2 == 0 {
            TradeSide::Buy
        } else {
            TradeSide::Sell
        };
        Order {
            ticket: self.ticket,
            symbol: self.symbol,
            side,
            volume: self.volume_current,
            price: self.price_open,
            tag: self.magic,
            comment: self.comment,
        }
    }
}

/// Deal as returned by `/deals`.
#[derive(Debug, Clone, Deserialize)]
pub struct DealResponse {
    pub ticket: u64,
    pub position_id: u64,
    pub symbol: String,
    #[serde(rename = "type")]
    pub kind: i64,
    pub volume: Decimal,
    pub price: Decimal,
    pub time: i64,
    #[serde(default)]
    pub magic: i64,
    #[serde(default)]
    pub comment: String,
}

impl DealResponse {
    /// Balance and commission deals have no direction and are skipped.
    pub fn into_deal(self) -> Option<Deal> {
        Some(Deal {
            ticket: self.ticket,
            position_id: self.position_id,
            symbol: self.symbol,
            side: TradeSide::from_code(self.kind)?,
            volume: self.volume,
            price: self.price,
            time: from_unix(self.time),
            tag: self.magic,
            comment: self.comment,
        })
    }
}

/// Symbol constraints as returned by `/symbols/{name}`.
#[derive(Debug, Clone, Deserialize)]
pub struct SymbolResponse {
    pub name: String,
    pub volume_min: Decimal,
    pub volume_max: Decimal,
    pub volume_step: Decimal,
    #[serde(default)]
    pub digits: u32,
    #[serde(default = "default_visible")]
    pub visible: bool,
}

fn default_visible() -> bool {
    true
}

impl From<SymbolResponse> for SymbolInfo {
    fn from(s: SymbolResponse) -> Self {
        SymbolInfo {
            name: s.name,
            volume_min: s.volume_min,
            volume_max: s.volume_max,
            volume_step: s.volume_step,
            digits: s.digits,
        }
    }
}

/// Body for `/order_send`.
#[derive(Debug, Clone, Serialize)]
pub struct TradeRequest {
    pub action: &'static str,
    pub symbol: Option<String>,
    pub position: Option<u64>,
    pub volume: Option<Decimal>,
    #[serde(rename = "type")]
    pub kind: Option<i64>,
    pub sl: Option<Decimal>,
    pub tp: Option<Decimal>,
    pub deviation: Option<u32>,
    pub magic: Option<i64>,
    pub comment: Option<String>,
}

/// Result of `/order_send`.
#[derive(Debug, Clone, Deserialize)]
pub struct TradeResponse {
    pub retcode: u32,
    #[serde(default)]
    pub order: u64,
    #[serde(default)]
    pub deal: u64,
    #[serde(default)]
    pub position: u64,
    #[serde(default)]
    pub volume: Decimal,
    #[serde(default)]
    pub price: Decimal,
    #[serde(default)]
    pub comment: String,
}

/// Error body returned alongside non-2xx statuses.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorResponse {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

pub fn from_unix(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}
