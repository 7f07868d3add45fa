//! Operator-requested closes and closed-record cleanup.
//!
//! Closing a trade group closes the provider position and every receiver
//! copy, then marks the record `manually_closed` so nothing reopens or
//! modifies it. Deletion only happens once every leg is confirmed absent.

use std::collections::HashMap;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::events::{Action, SYSTEM_SOURCE};
use crate::models::{short_id, Position};

use super::copy_engine::routine;
use super::CopyEngine;

/// Result of closing one trade group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CloseOutcome {
    /// Close orders sent, provider and receivers
    pub attempted: usize,
    /// Close orders rejected by a terminal
    pub failed: usize,
    /// Record deleted in the same pass
    pub removed: bool,
}

/// Totals over every group closed by one close-all.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CloseAllOutcome {
    pub groups: usize,
    pub attempted: usize,
    pub failed: usize,
    pub removed: usize,
}

impl CloseAllOutcome {
    fn add(&mut self, outcome: CloseOutcome) {
        self.groups += 1;
        self.attempted += outcome.attempted;
        self.failed += outcome.failed;
        self.removed += usize::from(outcome.removed);
    }
}

impl CopyEngine {
    pub(super) async fn apply_action(&mut self, action: Action) {
        match action {
            Action::CloseTrade { id } => {
                self.close_trade(id).await;
            }
            Action::CloseAll => {
                self.close_all().await;
            }
        }
    }

    /// Close the provider position and all receiver copies of one record.
    pub async fn close_trade(&mut self, id: Uuid) -> CloseOutcome {
        let mut outcome = CloseOutcome::default();
        let sid = short_id(&id);

        let Some(record) = self.records.get(&id) else {
            warn!(uid = %id, "Close requested for unknown trade");
            self.notifier.error(
                SYSTEM_SOURCE,
                format!("Trade {} not found, nothing to close", sid),
            );
            return outcome;
        };
        let provider_ticket = record.provider_ticket;
        let copies: Vec<(String, u64)> = record
            .copied_tickets()
            .map(|(name, ticket)| (name.to_string(), ticket))
            .collect();

        info!(uid = %id, ?provider_ticket, copies = copies.len(), "Manual close requested");
        let comment = format!("Close UID {}", sid);

        if let Some(ticket) = provider_ticket {
            let provider_name = self.provider.name().to_string();
            let live = self.provider_positions().await;
            match live {
                Ok(live) => match live.get(&ticket) {
                    Some(position) => {
                        outcome.attempted += 1;
                        self.notifier.status(
                            &provider_name,
                            format!("Closing trade {} (UID {}) initiated.", ticket, sid),
                        );
                        if let Err(e) = self
                            .provider
                            .close(
                                ticket,
                                position.volume,
                                self.provider_config.login.price_deviation_points,
                                &comment,
                            )
                            .await
                        {
                            if !e.is_already_closed() {
                                outcome.failed += 1;
                                error!(uid = %id, ticket, error = %e, "Failed to close provider trade");
                                self.notifier.error(
                                    &provider_name,
                                    format!("Failed to close trade {} (UID {}): {}", ticket, sid, e),
                                );
                            }
                        }
                    }
                    None => {
                        self.notifier.status(
                            &provider_name,
                            format!("Trade {} (UID {}) already closed.", ticket, sid),
                        );
                    }
                },
                Err(e) => {
                    outcome.failed += 1;
                    error!(uid = %id, error = %format!("{:#}", e), "Provider unavailable for manual close");
                    self.notifier
                        .error(&provider_name, format!("Cannot close trade {}: {:#}", ticket, e));
                }
            }
        }

        for (name, ticket) in copies {
            let Some(handle) = self.receivers.iter().find(|h| h.name() == name).cloned() else {
                debug!(receiver = %name, "Copy belongs to a receiver no longer configured");
                continue;
            };
            let live = match handle.live_positions().await {
                Ok(live) => live,
                Err(e) => {
                    outcome.failed += 1;
                    error!(receiver = %name, uid = %id, error = %e, "Receiver unavailable for manual close");
                    self.notifier
                        .error(&name, format!("Cannot close trade {}: {}", ticket, e));
                    continue;
                }
            };
            let Some(position) = live.get(&ticket) else {
                self.notifier.status(
                    &name,
                    format!("Trade {} (UID {}) already closed.", ticket, sid),
                );
                continue;
            };

            outcome.attempted += 1;
            self.notifier.status(
                &name,
                format!("Closing trade {} (UID {}) initiated.", ticket, sid),
            );
            match handle
                .terminal()
                .close(ticket, position.volume, handle.deviation(), &comment)
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_already_closed() => {}
                Err(e) => {
                    outcome.failed += 1;
                    error!(receiver = %name, ticket, error = %e, "Failed to close receiver trade");
                    self.notifier.error(
                        &name,
                        format!("Failed to close trade {} (UID {}): {}", ticket, sid, e),
                    );
                }
            }
        }

        if let Some(record) = self.records.get_mut(&id) {
            record.manually_closed = true;
        }
        outcome.removed = self.cleanup_closed(vec![id], None).await > 0;
        self.persist().await;

        outcome
    }

    /// Close every trade group not already manually closed.
    pub async fn close_all(&mut self) -> CloseAllOutcome {
        let mut totals = CloseAllOutcome::default();
        let ids: Vec<Uuid> = self
            .records
            .values()
            .filter(|r| !r.manually_closed)
            .map(|r| r.id)
            .collect();

        if ids.is_empty() {
            self.notifier.status(SYSTEM_SOURCE, "No active trades to close.");
            return totals;
        }

        info!(groups = ids.len(), "Closing all trade groups");
        for id in ids {
            totals.add(self.close_trade(id).await);
        }
        info!(?totals, "Close all finished");
        self.notifier.status(
            SYSTEM_SOURCE,
            format!(
                "Attempted to close {} trade groups: {} close orders sent, {} failed, {} removed.",
                totals.groups, totals.attempted, totals.failed, totals.removed
            ),
        );
        totals
    }

    /// Delete candidate records whose provider position and every receiver
    /// copy are confirmed gone. Anything that cannot be confirmed stays.
    ///
    /// `provider_snapshot` is this cycle's provider read; without it the
    /// provider is read again.
    pub(super) async fn cleanup_closed(
        &mut self,
        candidates: Vec<Uuid>,
        provider_snapshot: Option<&HashMap<u64, Position>>,
    ) -> usize {
        if candidates.is_empty() {
            return 0;
        }
        let quiet = self.quiet();

        let fresh;
        let provider_live = match provider_snapshot {
            Some(snapshot) => Some(snapshot),
            None => {
                fresh = self.provider_positions().await.ok();
                fresh.as_ref()
            }
        };

        // One read per receiver per pass; None means unreadable
        let mut receiver_live: HashMap<String, Option<HashMap<u64, Position>>> = HashMap::new();
        let mut removed = 0;

        for id in candidates {
            let Some(record) = self.records.get(&id) else {
                continue;
            };

            let provider_gone = match (record.provider_ticket, provider_live) {
                (None, _) => true,
                (Some(ticket), Some(live)) => !live.contains_key(&ticket),
                (Some(_), None) => false,
            };
            if !provider_gone {
                routine!(quiet, uid = %id, "Provider position still open, keeping record");
                continue;
            }

            let copies: Vec<(String, u64)> = record
                .copied_tickets()
                .map(|(name, ticket)| (name.to_string(), ticket))
                .collect();

            let mut all_gone = true;
            for (name, ticket) in copies {
                let Some(handle) = self.receivers.iter().find(|h| h.name() == name).cloned()
                else {
                    // Receiver removed from configuration; nothing left to close
                    continue;
                };
                if !receiver_live.contains_key(&name) {
                    let live = match handle.live_positions().await {
                        Ok(live) => Some(live),
                        Err(e) => {
                            warn!(receiver = %name, error = %e, "Cannot confirm receiver closure");
                            None
                        }
                    };
                    receiver_live.insert(name.clone(), live);
                }
                match receiver_live.get(&name).and_then(|l| l.as_ref()) {
                    Some(live) if !live.contains_key(&ticket) => {}
                    _ => {
                        all_gone = false;
                        break;
                    }
                }
            }

            if all_gone {
                self.records.remove(&id);
                removed += 1;
                info!(uid = %id, "All legs closed, record removed");
            } else {
                routine!(quiet, uid = %id, "Receiver copy still open, deferring removal");
            }
        }

        removed
    }
}
