//! Provider-side duplication: opens one extra provider position mirroring
//! each original, tagged so it is recognised as a duplicate when it comes
//! back in the next provider read.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::api::OpenRequest;
use crate::models::{duplicate_comment, Position};

use super::CopyEngine;

impl CopyEngine {
    /// Attempt a duplicate for every eligible open original.
    ///
    /// Returns the number of duplicates opened.
    pub(super) async fn run_duplication(
        &mut self,
        snapshot: &HashMap<u64, Position>,
        now: DateTime<Utc>,
    ) -> usize {
        let interval = self.settings.duplicate_retry_interval();
        let due: Vec<(Uuid, Position)> = self
            .records
            .values()
            .filter(|r| !r.manually_closed && r.duplicate_due(now, interval))
            .filter_map(|r| {
                let position = snapshot.get(&r.provider_ticket?)?;
                Some((r.id, position.clone()))
            })
            .collect();

        let mut opened = 0;
        for (id, position) in due {
            if self.duplicate_one(id, &position, now).await {
                opened += 1;
            }
        }
        opened
    }

    async fn duplicate_one(&mut self, id: Uuid, original: &Position, now: DateTime<Utc>) -> bool {
        let provider_name = self.provider.name().to_string();
        let Some(record) = self.records.get_mut(&id) else {
            return false;
        };
        record.duplicate_attempt_time = Some(now);
        let sid = record.short_id();
        self.persist().await;

        info!(uid = %id, ticket = original.ticket, "Duplicating provider trade");
        self.notifier.status(
            &provider_name,
            format!("Duplicating trade {} (UID:{})", original.ticket, sid),
        );

        let request = OpenRequest {
            symbol: original.symbol.clone(),
            volume: original.volume,
            side: original.side,
            stop_loss: original.stop_loss,
            take_profit: original.take_profit,
            deviation: self.provider_config.login.price_deviation_points,
            tag: self.provider_config.duplicate_tag(),
            comment: duplicate_comment(original.ticket),
        };

        let result = self.provider.open(&request).await;
        let Some(record) = self.records.get_mut(&id) else {
            return false;
        };
        match result {
            Ok(result) => {
                record.duplicate_opened = true;
                let reported = result
                    .position_ticket
                    .or(result.deal)
                    .unwrap_or(result.order);
                info!(uid = %id, original = original.ticket, duplicate = reported, "Duplicate opened");
                self.notifier.status(
                    &provider_name,
                    format!("Duplicate opened as {} for {}", reported, original.ticket),
                );
                self.persist().await;
                true
            }
            Err(e) if e.is_permanent() => {
                record.duplicate_permanent_failure = true;
                error!(uid = %id, ticket = original.ticket, error = %e, "Duplicate aborted, auto-trading disabled");
                self.notifier.error(
                    &provider_name,
                    format!(
                        "Duplicate aborted (enable Algo Trading) for {}",
                        original.ticket
                    ),
                );
                self.persist().await;
                false
            }
            Err(e) => {
                warn!(uid = %id, ticket = original.ticket, error = %e, "Duplicate failed, will retry");
                self.notifier.error(
                    &provider_name,
                    format!("Duplicate failed for {}: {}", original.ticket, e),
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::copy_engine::tests::{Harness, PROVIDER, RECEIVER};
    use crate::api::{retcode, TerminalError};
    use crate::events::Notification;
    use crate::models::{duplicate_comment, TradeSide};
    use rust_decimal_macros::dec;

    const RECEIVER_CONFIG: &str = r#"{"account": 2, "password": "r", "tag": 77}"#;

    #[tokio::test]
    async fn test_duplicate_opened_once_and_copied() {
        let mut h = Harness::new(
            r#", "duplicate_provider_trades": true, "duplicate_retry_interval_secs": 0"#,
            RECEIVER_CONFIG,
        )
        .await;
        let original = h.provider_open("EURUSD", TradeSide::Buy, dec!(0.2)).await;

        let report = h.cycle().await;
        assert_eq!(report.duplicated, 1);
        let provider = h.venue.positions(PROVIDER).await;
        assert_eq!(provider.len(), 2);
        let duplicate = provider.iter().find(|p| p.ticket != original).unwrap();
        assert_eq!(duplicate.comment, duplicate_comment(original));
        assert_eq!(duplicate.volume, dec!(0.2));

        // Next cycle picks the duplicate up as its own record, never duplicated again
        let report = h.cycle().await;
        assert_eq!(report.new_records, 1);
        assert_eq!(report.duplicated, 0);
        assert!(h.record_for(original).unwrap().duplicate_opened);
        assert!(h.record_for(duplicate.ticket).unwrap().is_duplicate);
        assert_eq!(h.venue.positions(PROVIDER).await.len(), 2);
        assert_eq!(h.venue.positions(RECEIVER).await.len(), 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_stops_duplication() {
        let mut h = Harness::new(
            r#", "duplicate_provider_trades": true, "duplicate_retry_interval_secs": 0"#,
            RECEIVER_CONFIG,
        )
        .await;
        let original = h.provider_open("EURUSD", TradeSide::Buy, dec!(1)).await;
        h.venue
            .fail_next_open(
                PROVIDER,
                TerminalError::Rejected {
                    code: retcode::CLIENT_DISABLES_AT,
                    message: "AutoTrading disabled by client".to_string(),
                },
            )
            .await;

        h.cycle().await;
        h.cycle().await;

        let record = h.record_for(original).unwrap();
        assert!(record.duplicate_permanent_failure);
        assert!(!record.duplicate_opened);
        assert_eq!(h.venue.calls(PROVIDER).await.opens, 1);
        assert!(h.drain().iter().any(|n| matches!(
            n,
            Notification::Error { message, .. } if message.contains("enable Algo Trading")
        )));
    }

    #[tokio::test]
    async fn test_transient_failure_waits_for_interval() {
        let mut h = Harness::new(r#", "duplicate_provider_trades": true"#, RECEIVER_CONFIG).await;
        let original = h.provider_open("EURUSD", TradeSide::Sell, dec!(1)).await;
        h.venue
            .fail_next_open(PROVIDER, TerminalError::Transport("timeout".to_string()))
            .await;

        h.cycle().await;
        h.cycle().await;

        let record = h.record_for(original).unwrap();
        assert!(!record.duplicate_opened);
        assert!(!record.duplicate_permanent_failure);
        assert!(record.duplicate_attempt_time.is_some());
        assert_eq!(h.venue.calls(PROVIDER).await.opens, 1);
    }

    #[tokio::test]
    async fn test_duplication_disabled_by_default() {
        let mut h = Harness::new("", RECEIVER_CONFIG).await;
        h.provider_open("EURUSD", TradeSide::Buy, dec!(1)).await;

        let report = h.cycle().await;
        assert_eq!(report.duplicated, 0);
        assert_eq!(h.venue.calls(PROVIDER).await.opens, 0);
    }
}
