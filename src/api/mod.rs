//! Terminal adapters: the per-account connection and order primitives the
//! copier drives.
//!
//! Every account (provider and each receiver) is reached through a
//! [`Terminal`]. Implementations:
//! - [`BridgeTerminal`]: HTTP/JSON client for a terminal gateway process
//! - [`PaperTerminal`]: in-memory simulated account, used in paper mode and tests

mod bridge_client;
mod paper;
mod types;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use crate::models::{Deal, Order, Position, SymbolInfo, TradeSide};

pub use bridge_client::{BridgeAccount, BridgeSession, BridgeTerminal};
pub use paper::PaperVenue;

/// Trade server return codes the copier cares about.
pub mod retcode {
    /// Request placed
    pub const PLACED: u32 = 10008;
    /// Request completed
    pub const DONE: u32 = 10009;
    /// Request rejected
    pub const REJECT: u32 = 10006;
    /// Auto-trading disabled by the server
    pub const SERVER_DISABLES_AT: u32 = 10026;
    /// Auto-trading disabled by the client terminal
    pub const CLIENT_DISABLES_AT: u32 = 10027;
    /// Request locked for processing
    pub const LOCKED: u32 = 10028;
    /// Position with the given identifier already closed
    pub const POSITION_CLOSED: u32 = 10036;
}

/// Errors raised by a terminal adapter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TerminalError {
    #[error("terminal unreachable: {0}")]
    Unreachable(String),

    #[error("account context could not be established for {0}")]
    ContextLost(String),

    #[error("request rejected (retcode {code}): {message}")]
    Rejected { code: u32, message: String },

    #[error("symbol {0} not available")]
    SymbolUnavailable(String),

    #[error("position {0} not found")]
    NotFound(u64),

    #[error("transport error: {0}")]
    Transport(String),
}

impl TerminalError {
    /// Failures that will not go away by retrying (auto-trading disabled).
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            TerminalError::Rejected { code, .. }
                if matches!(
                    *code,
                    retcode::SERVER_DISABLES_AT | retcode::CLIENT_DISABLES_AT | retcode::LOCKED
                )
        )
    }

    /// Close failures that mean the position is already gone.
    pub fn is_already_closed(&self) -> bool {
        match self {
            TerminalError::NotFound(_) => true,
            TerminalError::Rejected { code, .. } => *code == retcode::POSITION_CLOSED,
            _ => false,
        }
    }
}

/// Optional restriction for [`Terminal::list_positions`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PositionFilter {
    pub symbol: Option<String>,
    pub tag: Option<i64>,
}

impl PositionFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn tagged(tag: Option<i64>) -> Self {
        Self { symbol: None, tag }
    }

    pub fn matches(&self, position: &Position) -> bool {
        self.symbol.as_ref().map_or(true, |s| *s == position.symbol)
            && self.tag.map_or(true, |t| t == position.tag)
    }
}

/// Selection for [`Terminal::list_recent_deals`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DealQuery {
    /// Deals executed inside a time window
    Window {
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },
    /// The deal with this exact ticket
    Ticket(u64),
}

/// Market order to open a new position.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenRequest {
    pub symbol: String,
    pub volume: Decimal,
    pub side: TradeSide,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    /// Maximum price deviation in points
    pub deviation: u32,
    /// Attribution marker (magic number)
    pub tag: i64,
    pub comment: String,
}

/// Accepted order.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderResult {
    pub retcode: u32,
    pub order: u64,
    pub deal: Option<u64>,
    /// Resulting position, when the terminal reports it directly
    pub position_ticket: Option<u64>,
    pub volume: Decimal,
    pub price: Decimal,
    pub comment: String,
}

/// One trading account behind a terminal.
///
/// Implementations share a single non-reentrant terminal context, so every
/// call must go through [`Terminal::ensure_context`] first and callers must
/// not issue calls concurrently.
#[async_trait]
pub trait Terminal: Send + Sync {
    /// Display name of the account, e.g. `Receiver-5512`.
    fn name(&self) -> &str;

    async fn connect(&self) -> Result<(), TerminalError>;

    async fn disconnect(&self);

    /// Make subsequent calls target this account. Reconnects when needed.
    async fn ensure_context(&self) -> bool;

    async fn list_positions(&self, filter: &PositionFilter) -> Result<Vec<Position>, TerminalError>;

    async fn list_orders(&self) -> Result<Vec<Order>, TerminalError>;

    async fn list_recent_deals(&self, query: DealQuery) -> Result<Vec<Deal>, TerminalError>;

    /// Trading constraints for `symbol`, `None` when the account lacks it.
    async fn symbol_info(&self, symbol: &str) -> Result<Option<SymbolInfo>, TerminalError>;

    async fn open(&self, request: &OpenRequest) -> Result<OrderResult, TerminalError>;

    async fn close(
        &self,
        ticket: u64,
        volume: Decimal,
        deviation: u32,
        comment: &str,
    ) -> Result<(), TerminalError>;

    async fn modify_stop_levels(
        &self,
        ticket: u64,
        stop_loss: Decimal,
        take_profit: Decimal,
    ) -> Result<(), TerminalError>;
}
