//! Versioned loaders for the state file.
//!
//! Each loader handles exactly one on-disk shape:
//! - v1: the legacy top-level `{uid: {...}}` map, where a receiver entry may be
//!   a bare ticket number, a `{ticket}` object without a status, or a full
//!   `{ticket, status, last_attempt}` object; times are epoch seconds
//! - v2: `{"version": 2, "records": {uid: MirrorRecord}}`

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::warn;
use uuid::Uuid;

use crate::models::{
    is_duplicate_comment, CopyStatus, MirrorRecord, ReceiverCopy, RecordMap, TradeSide,
};

pub const CURRENT_VERSION: u64 = 2;

/// Detect the file's version and dispatch to its loader.
pub fn decode(raw: &str) -> Result<RecordMap> {
    let value: Value = serde_json::from_str(raw).context("State file is not valid JSON")?;
    let Value::Object(root) = value else {
        bail!("State file root is not an object");
    };

    match root.get("version") {
        Some(Value::Number(n)) => match n.as_u64() {
            Some(2) => load_v2(Value::Object(root)),
            other => bail!("Unsupported state version {:?}", other),
        },
        Some(other) => bail!("Unrecognised state version field {}", other),
        None => Ok(load_v1(root)),
    }
}

#[derive(Deserialize)]
struct V2File {
    records: Map<String, Value>,
}

fn load_v2(value: Value) -> Result<RecordMap> {
    let file: V2File = serde_json::from_value(value).context("Malformed v2 state")?;

    let mut records = RecordMap::new();
    for (key, raw) in file.records {
        let mut record: MirrorRecord = match serde_json::from_value(raw) {
            Ok(record) => record,
            Err(e) => {
                warn!(key = %key, error = %e, "Skipping malformed record");
                continue;
            }
        };
        let id = match Uuid::parse_str(&key) {
            Ok(id) => id,
            Err(_) => {
                warn!(key = %key, "Record key is not a uuid, keeping the embedded id");
                record.id
            }
        };
        record.id = id;
        // Re-validate copies written by hand or by a buggy build
        for copy in record.receivers.values_mut() {
            *copy =
                ReceiverCopy::from_parts(copy.ticket(), Some(copy.status()), copy.last_attempt_time());
        }
        records.insert(id, record);
    }
    Ok(records)
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct LegacyRecord {
    provider_ticket: Option<Value>,
    provider_symbol: String,
    provider_type: Option<i64>,
    provider_volume: Option<Decimal>,
    provider_price_open: Option<Decimal>,
    provider_sl: Option<Decimal>,
    provider_tp: Option<Decimal>,
    provider_open_time: Option<f64>,
    provider_comment: Option<String>,
    is_duplicate: Option<bool>,
    duplicate_opened: bool,
    duplicate_permanent_failure: bool,
    duplicate_attempt_time: Option<f64>,
    manually_closed: bool,
    receivers: Option<Value>,
}

fn load_v1(root: Map<String, Value>) -> RecordMap {
    let mut records = RecordMap::new();

    for (key, entry) in root {
        let legacy: LegacyRecord = match serde_json::from_value(entry) {
            Ok(legacy) => legacy,
            Err(e) => {
                warn!(uid = %key, error = %e, "Skipping unreadable legacy record");
                continue;
            }
        };
        let id = Uuid::parse_str(&key).unwrap_or_else(|_| {
            let id = Uuid::new_v4();
            warn!(uid = %key, new_id = %id, "Legacy uid is not a uuid, reassigning");
            id
        });

        let comment = legacy.provider_comment.unwrap_or_default();
        let record = MirrorRecord {
            id,
            provider_ticket: legacy.provider_ticket.as_ref().and_then(ticket_from),
            provider_symbol: legacy.provider_symbol,
            side: legacy
                .provider_type
                .and_then(TradeSide::from_code)
                .unwrap_or(TradeSide::Buy),
            volume: legacy.provider_volume.unwrap_or_default(),
            open_price: legacy.provider_price_open.unwrap_or_default(),
            stop_loss: legacy.provider_sl.unwrap_or_default(),
            take_profit: legacy.provider_tp.unwrap_or_default(),
            open_time: legacy
                .provider_open_time
                .and_then(from_epoch)
                .unwrap_or_default(),
            is_duplicate: legacy
                .is_duplicate
                .unwrap_or_else(|| is_duplicate_comment(&comment)),
            comment,
            duplicate_opened: legacy.duplicate_opened,
            duplicate_permanent_failure: legacy.duplicate_permanent_failure,
            // 0 was written for "never attempted"
            duplicate_attempt_time: legacy.duplicate_attempt_time.and_then(from_epoch),
            manually_closed: legacy.manually_closed,
            receivers: legacy
                .receivers
                .map(|r| migrate_receivers(&key, r))
                .unwrap_or_default(),
        };
        records.insert(id, record);
    }

    records
}

fn migrate_receivers(uid: &str, value: Value) -> BTreeMap<String, ReceiverCopy> {
    let Value::Object(entries) = value else {
        warn!(uid, "Legacy receivers field is not a map, dropping it");
        return BTreeMap::new();
    };

    entries
        .into_iter()
        .map(|(name, entry)| {
            let copy = migrate_receiver_entry(&entry);
            (name, copy)
        })
        .collect()
}

/// Rewrite one legacy receiver value into a validated copy.
pub fn migrate_receiver_entry(entry: &Value) -> ReceiverCopy {
    match entry {
        Value::Number(_) => ReceiverCopy::from_parts(ticket_from(entry), Some(CopyStatus::Copied), None),
        Value::Object(fields) => {
            let ticket = fields.get("ticket").and_then(ticket_from);
            let status = fields
                .get("status")
                .and_then(Value::as_str)
                .and_then(parse_status);
            let last_attempt = fields
                .get("last_attempt")
                .or_else(|| fields.get("last_attempt_time"))
                .and_then(time_from);
            ReceiverCopy::from_parts(ticket, status, last_attempt)
        }
        _ => ReceiverCopy::default(),
    }
}

fn parse_status(raw: &str) -> Option<CopyStatus> {
    match raw.to_ascii_lowercase().as_str() {
        "copied" => Some(CopyStatus::Copied),
        "attempted" => Some(CopyStatus::Attempted),
        "not_attempted" | "notattempted" => Some(CopyStatus::NotAttempted),
        _ => None,
    }
}

/// Tickets were written as ints, and occasionally as floats.
fn ticket_from(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_f64().filter(|f| *f > 0.0).map(|f| f as u64))
        .filter(|t| *t > 0)
}

fn time_from(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n.as_f64().and_then(from_epoch),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        _ => None,
    }
}

fn from_epoch(secs: f64) -> Option<DateTime<Utc>> {
    if secs <= 0.0 {
        return None;
    }
    Utc.timestamp_millis_opt((secs * 1000.0) as i64).single()
}
