//! Mirror records: the engine's unit of tracking for one provider position
//! and its copies on every receiver.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::{Position, TradeSide};

/// Comment prefix marking a provider order placed by the duplication policy.
pub const DUPLICATE_COMMENT_PREFIX: &str = "DUPLICATE_OF:";

/// All tracked records keyed by universal id.
pub type RecordMap = BTreeMap<Uuid, MirrorRecord>;

/// Copy progress of one record on one receiver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CopyStatus {
    #[default]
    NotAttempted,
    Attempted,
    Copied,
}

impl CopyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CopyStatus::NotAttempted => "not_attempted",
            CopyStatus::Attempted => "attempted",
            CopyStatus::Copied => "copied",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid copy status transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: CopyStatus,
    pub to: CopyStatus,
}

/// One receiver's copy of a mirror record.
///
/// `ticket` is present exactly when `status` is [`CopyStatus::Copied`]; the
/// fields are private so the only way to change them is through the
/// transition methods.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiverCopy {
    #[serde(default)]
    ticket: Option<u64>,
    #[serde(default)]
    status: CopyStatus,
    #[serde(default, rename = "last_attempt")]
    last_attempt_time: Option<DateTime<Utc>>,
}

impl ReceiverCopy {
    /// Rebuild a copy from possibly inconsistent persisted parts.
    ///
    /// A ticket always wins: an entry holding a ticket is `Copied`. A `Copied`
    /// entry without a ticket cannot be trusted and starts over.
    pub fn from_parts(
        ticket: Option<u64>,
        status: Option<CopyStatus>,
        last_attempt_time: Option<DateTime<Utc>>,
    ) -> Self {
        let ticket = ticket.filter(|t| *t > 0);
        let status = match (ticket, status) {
            (Some(_), _) => CopyStatus::Copied,
            (None, Some(CopyStatus::Attempted)) => CopyStatus::Attempted,
            (None, _) => CopyStatus::NotAttempted,
        };
        let last_attempt_time = match status {
            CopyStatus::Attempted => Some(last_attempt_time.unwrap_or_else(Utc::now)),
            _ => last_attempt_time,
        };

        Self {
            ticket,
            status,
            last_attempt_time,
        }
    }

    /// Entry for a copy that is already confirmed on the receiver.
    pub fn copied(ticket: u64) -> Self {
        Self::from_parts(Some(ticket), Some(CopyStatus::Copied), None)
    }

    pub fn ticket(&self) -> Option<u64> {
        self.ticket
    }

    pub fn status(&self) -> CopyStatus {
        self.status
    }

    pub fn last_attempt_time(&self) -> Option<DateTime<Utc>> {
        self.last_attempt_time
    }

    pub fn is_copied(&self) -> bool {
        self.status == CopyStatus::Copied
    }

    /// Record that an open is about to be sent.
    pub fn begin_attempt(&mut self, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        if self.status == CopyStatus::Copied {
            return Err(InvalidTransition {
                from: self.status,
                to: CopyStatus::Attempted,
            });
        }
        self.status = CopyStatus::Attempted;
        self.last_attempt_time = Some(now);
        Ok(())
    }

    /// Record a confirmed copy.
    pub fn confirm(&mut self, ticket: u64) -> Result<(), InvalidTransition> {
        if self.status != CopyStatus::Attempted || ticket == 0 {
            return Err(InvalidTransition {
                from: self.status,
                to: CopyStatus::Copied,
            });
        }
        self.status = CopyStatus::Copied;
        self.ticket = Some(ticket);
        Ok(())
    }

    /// Whether a failed attempt may be retried at `now`.
    pub fn retry_due(&self, now: DateTime<Utc>, interval: Duration) -> bool {
        match self.status {
            CopyStatus::NotAttempted => true,
            CopyStatus::Copied => false,
            CopyStatus::Attempted => self
                .last_attempt_time
                .map_or(true, |last| now - last >= interval),
        }
    }
}

/// Tracking entry for one provider position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorRecord {
    pub id: Uuid,

    /// Absent only for records restored from damaged state
    pub provider_ticket: Option<u64>,
    pub provider_symbol: String,
    pub side: TradeSide,
    pub volume: Decimal,
    #[serde(default)]
    pub open_price: Decimal,
    #[serde(default)]
    pub stop_loss: Decimal,
    #[serde(default)]
    pub take_profit: Decimal,
    pub open_time: DateTime<Utc>,
    #[serde(default)]
    pub comment: String,

    /// Provider order was itself placed by the duplication policy
    #[serde(default)]
    pub is_duplicate: bool,
    #[serde(default)]
    pub duplicate_opened: bool,
    #[serde(default)]
    pub duplicate_permanent_failure: bool,
    #[serde(default)]
    pub duplicate_attempt_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub manually_closed: bool,

    #[serde(default)]
    pub receivers: BTreeMap<String, ReceiverCopy>,
}

impl MirrorRecord {
    /// Create a record for a newly observed provider position.
    pub fn from_position(position: &Position) -> Self {
        Self {
            id: Uuid::new_v4(),
            provider_ticket: Some(position.ticket),
            provider_symbol: position.symbol.clone(),
            side: position.side,
            volume: position.volume,
            open_price: position.open_price,
            stop_loss: position.stop_loss,
            take_profit: position.take_profit,
            open_time: position.open_time,
            comment: position.comment.clone(),
            is_duplicate: is_duplicate_comment(&position.comment),
            duplicate_opened: false,
            duplicate_permanent_failure: false,
            duplicate_attempt_time: None,
            manually_closed: false,
            receivers: BTreeMap::new(),
        }
    }

    /// Refresh the provider snapshot fields from a live read.
    pub fn refresh_from(&mut self, position: &Position) {
        self.provider_symbol = position.symbol.clone();
        self.side = position.side;
        self.volume = position.volume;
        self.open_price = position.open_price;
        self.stop_loss = position.stop_loss;
        self.take_profit = position.take_profit;
        self.open_time = position.open_time;
        self.comment = position.comment.clone();
    }

    /// First eight characters of the universal id, for messages.
    pub fn short_id(&self) -> String {
        short_id(&self.id)
    }

    pub fn receiver(&self, name: &str) -> Option<&ReceiverCopy> {
        self.receivers.get(name)
    }

    /// Copied receivers and their tickets.
    pub fn copied_tickets(&self) -> impl Iterator<Item = (&str, u64)> {
        self.receivers
            .iter()
            .filter_map(|(name, copy)| copy.ticket().map(|t| (name.as_str(), t)))
    }

    /// Whether the duplication policy may try again at `now`.
    pub fn duplicate_due(&self, now: DateTime<Utc>, interval: Duration) -> bool {
        if self.is_duplicate || self.duplicate_opened || self.duplicate_permanent_failure {
            return false;
        }
        self.duplicate_attempt_time
            .map_or(true, |last| now - last >= interval)
    }
}

pub fn short_id(id: &Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}

pub fn is_duplicate_comment(comment: &str) -> bool {
    comment.starts_with(DUPLICATE_COMMENT_PREFIX)
}

pub fn duplicate_comment(provider_ticket: u64) -> String {
    format!("{}{}", DUPLICATE_COMMENT_PREFIX, provider_ticket)
}
