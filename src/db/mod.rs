//! State Store: durable snapshot of every mirror record.
//!
//! Everything needed to resume after a restart lives in one JSON file:
//! - which provider tickets are tracked, under which universal id
//! - each receiver's copy status, ticket and last attempt time
//! - duplication and manual-close flags
//!
//! Saves write a sibling temp file and rename it over the target, so a crash
//! mid-write leaves the previous snapshot intact. Loads never fail: an
//! unreadable file is logged and treated as empty.

mod migrate;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

use crate::models::RecordMap;

use migrate::{decode, CURRENT_VERSION};

#[derive(Serialize)]
struct SnapshotFile<'a> {
    version: u64,
    saved_at: DateTime<Utc>,
    records: &'a RecordMap,
}

/// JSON-file persistence for the record map.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load persisted records, migrating older layouts.
    ///
    /// A missing file is a fresh start. A malformed one is logged and
    /// yields an empty map; it is left on disk until the next save.
    pub async fn load(&self) -> RecordMap {
        match self.try_load().await {
            Ok(Some(records)) => {
                info!(
                    path = %self.path.display(),
                    records = records.len(),
                    "Loaded trade state"
                );
                records
            }
            Ok(None) => {
                info!(path = %self.path.display(), "No saved trade state, starting fresh");
                RecordMap::new()
            }
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %format!("{:#}", e),
                    "Failed to load trade state, starting with an empty map"
                );
                RecordMap::new()
            }
        }
    }

    async fn try_load(&self) -> Result<Option<RecordMap>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read {}", self.path.display()))
            }
        };
        if raw.trim().is_empty() {
            return Ok(Some(RecordMap::new()));
        }
        decode(&raw).map(Some)
    }

    /// Write the full record map atomically.
    pub async fn save(&self, records: &RecordMap) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let body = serde_json::to_vec_pretty(&SnapshotFile {
            version: CURRENT_VERSION,
            saved_at: Utc::now(),
            records,
        })
        .context("Failed to serialize trade state")?;

        let tmp = self.temp_path();
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .with_context(|| format!("Failed to create {}", tmp.display()))?;
        file.write_all(&body).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            error!(path = %self.path.display(), error = %e, "Failed to replace trade state");
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e).context("Failed to replace trade state file");
        }

        debug!(path = %self.path.display(), records = records.len(), "Saved trade state");
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "state".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MirrorRecord, Position, ReceiverCopy, TradeSide};
    use chrono::Duration;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use tempfile::TempDir;

    fn record(ticket: u64) -> MirrorRecord {
        MirrorRecord::from_position(&Position {
            ticket,
            symbol: "EURUSD".to_string(),
            side: TradeSide::Buy,
            volume: dec!(1.0),
            open_price: dec!(1.08345),
            stop_loss: dec!(1.08),
            take_profit: Decimal::ZERO,
            open_time: Utc::now() - Duration::minutes(2),
            profit: Decimal::ZERO,
            tag: 0,
            comment: String::new(),
        })
    }

    #[tokio::test]
    async fn test_save_then_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path().join("data").join("state.json"));

        let mut copied = record(1001);
        copied
            .receivers
            .insert("Receiver-2".to_string(), ReceiverCopy::copied(88001));
        let mut pending = ReceiverCopy::default();
        pending.begin_attempt(Utc::now()).unwrap();
        copied.receivers.insert("Receiver-3".to_string(), pending);

        let mut closed = record(1002);
        closed.manually_closed = true;

        let mut records = RecordMap::new();
        records.insert(copied.id, copied);
        records.insert(closed.id, closed);

        store.save(&records).await.unwrap();
        let loaded = store.load().await;

        assert_eq!(loaded, records);
        assert!(!store.temp_path().exists());
    }

    #[tokio::test]
    async fn test_legacy_file_is_migrated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trade_copier_state.json");
        std::fs::write(
            &path,
            r#"{"0d5b3a52-94f4-4f55-9bd6-7a2b1bcbf2a1": {
                "provider_ticket": 1001, "provider_symbol": "EURUSD", "provider_type": 0,
                "provider_volume": 1.0, "provider_sl": 0.0, "provider_tp": 0.0,
                "provider_open_time": 1700000000, "provider_comment": "",
                "receivers": {"Receiver-2": 88001}
            }}"#,
        )
        .unwrap();

        let store = StateStore::new(&path);
        let loaded = store.load().await;
        assert_eq!(loaded.len(), 1);
        let record = loaded.values().next().unwrap();
        assert_eq!(record.receivers["Receiver-2"].ticket(), Some(88001));
        assert!(record.receivers["Receiver-2"].is_copied());

        // Next save upgrades the layout
        store.save(&loaded).await.unwrap();
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"version\": 2"));
        assert_eq!(store.load().await, loaded);
    }

    #[tokio::test]
    async fn test_corrupt_file_yields_empty_map() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{ not json").unwrap();

        let store = StateStore::new(&path);
        assert!(store.load().await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_file_yields_empty_map() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path().join("absent.json"));
        assert!(store.load().await.is_empty());
    }
}
