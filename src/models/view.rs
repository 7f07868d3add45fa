//! Joined view of tracked trades, sent to the observer once per cycle.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use super::{MirrorRecord, Position, TradeSide};

/// Where the numbers in a [`LegView`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LegState {
    /// Read live from the terminal this cycle
    Live,
    /// Live read missed it; last known state fields are shown
    LastKnown,
    /// Copy order sent, not yet confirmed
    AttemptingCopy,
    /// Expected on the terminal but not found
    NotFoundLive,
    /// Nothing was ever sent for this receiver
    NotCopied,
}

/// One side (provider or receiver) of a tracked trade.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LegView {
    pub account: String,
    pub state: LegState,
    pub ticket: Option<u64>,
    pub symbol: Option<String>,
    pub side: Option<TradeSide>,
    pub volume: Option<Decimal>,
    pub open_price: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub profit: Option<Decimal>,
    pub open_time: Option<DateTime<Utc>>,
}

impl LegView {
    pub fn live(account: &str, position: &Position) -> Self {
        Self {
            account: account.to_string(),
            state: LegState::Live,
            ticket: Some(position.ticket),
            symbol: Some(position.symbol.clone()),
            side: Some(position.side),
            volume: Some(position.volume),
            open_price: Some(position.open_price),
            stop_loss: Some(position.stop_loss),
            take_profit: Some(position.take_profit),
            profit: Some(position.profit),
            open_time: Some(position.open_time),
        }
    }

    /// Provider leg rebuilt from the fields stored on the record.
    pub fn last_known(account: &str, record: &MirrorRecord) -> Self {
        Self {
            account: account.to_string(),
            state: LegState::LastKnown,
            ticket: record.provider_ticket,
            symbol: Some(record.provider_symbol.clone()),
            side: Some(record.side),
            volume: Some(record.volume),
            open_price: Some(record.open_price),
            stop_loss: Some(record.stop_loss),
            take_profit: Some(record.take_profit),
            profit: None,
            open_time: Some(record.open_time),
        }
    }

    /// Placeholder row carrying only a ticket and a status.
    pub fn placeholder(account: &str, state: LegState, ticket: Option<u64>) -> Self {
        Self {
            account: account.to_string(),
            state,
            ticket,
            symbol: None,
            side: None,
            volume: None,
            open_price: None,
            stop_loss: None,
            take_profit: None,
            profit: None,
            open_time: None,
        }
    }
}

/// One mirror record joined with live terminal data.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TradeView {
    pub universal_id: Uuid,
    pub manually_closed: bool,
    pub is_duplicate: bool,
    pub provider: LegView,
    pub receivers: Vec<LegView>,
}
