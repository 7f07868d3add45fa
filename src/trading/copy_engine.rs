//! Reconciliation engine: mirrors provider positions onto every receiver.
//!
//! One cycle, in order:
//! 1. apply queued close commands
//! 2. read the provider's open positions
//! 3. schedule receiver closes for provider positions that disappeared
//! 4. schedule SL/TP checks for positions still open
//! 5. start tracking new provider positions
//! 6. run the duplication policy (when enabled)
//! 7. decide which receivers need a copy opened
//! 8. per receiver, against one live read: closes, then modifies, then opens
//! 9. delete records confirmed closed everywhere
//! 10. persist
//! 11. publish one joined snapshot
//!
//! The engine owns every terminal handle and calls them one at a time;
//! nothing here runs concurrently.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::api::{DealQuery, OpenRequest, OrderResult, PositionFilter, Terminal, TerminalError};
use crate::db::StateStore;
use crate::events::{Action, Notifier, SYSTEM_SOURCE};
use crate::models::{
    short_id, CopyStatus, LegState, LegView, MirrorRecord, Position, RecordMap, SymbolInfo,
    TradeView,
};

use super::{CopierConfig, PositionSizer, ProviderConfig, ReceiverConfig, Settings};

/// SL/TP differences at or below this are not propagated.
pub const STOP_TOLERANCE: Decimal = Decimal::from_parts(1, 0, 0, false, 5);

/// Pause before re-reading a receiver whose copied position was missing.
const SNAPSHOT_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Routine per-cycle chatter: `debug`, or `trace` in actions-only mode.
macro_rules! routine {
    ($quiet:expr, $($arg:tt)+) => {
        if $quiet {
            ::tracing::trace!($($arg)+)
        } else {
            ::tracing::debug!($($arg)+)
        }
    };
}
pub(super) use routine;

/// True when the receiver's stops must be updated to the provider's.
///
/// Zero means "no stop": zero on one side and non-zero on the other always
/// diverges; otherwise the difference must exceed [`STOP_TOLERANCE`].
pub fn stops_diverged(
    provider_sl: Decimal,
    provider_tp: Decimal,
    receiver_sl: Decimal,
    receiver_tp: Decimal,
) -> bool {
    level_diverged(provider_sl, receiver_sl) || level_diverged(provider_tp, receiver_tp)
}

fn level_diverged(wanted: Decimal, actual: Decimal) -> bool {
    if wanted.is_zero() != actual.is_zero() {
        return true;
    }
    (wanted - actual).abs() > STOP_TOLERANCE
}

/// A receiver account and its copy rules.
pub struct ReceiverHandle {
    name: String,
    terminal: Arc<dyn Terminal>,
    sizer: PositionSizer,
}

impl ReceiverHandle {
    pub fn new(
        config: ReceiverConfig,
        terminal: Arc<dyn Terminal>,
        retry_interval: chrono::Duration,
    ) -> Self {
        Self {
            name: config.name(),
            terminal,
            sizer: PositionSizer::new(config, retry_interval),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn terminal(&self) -> &Arc<dyn Terminal> {
        &self.terminal
    }

    pub fn config(&self) -> &ReceiverConfig {
        self.sizer.receiver()
    }

    pub(super) fn deviation(&self) -> u32 {
        self.config().login.price_deviation_points
    }

    /// This receiver's copies, keyed by ticket.
    pub(super) async fn live_positions(&self) -> Result<HashMap<u64, Position>, TerminalError> {
        if !self.terminal.ensure_context().await {
            return Err(TerminalError::ContextLost(self.name.clone()));
        }
        let positions = self
            .terminal
            .list_positions(&PositionFilter::tagged(Some(self.config().login.tag)))
            .await?;
        Ok(positions.into_iter().map(|p| (p.ticket, p)).collect())
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub new_records: usize,
    pub opened: usize,
    pub failed_opens: usize,
    pub closed: usize,
    pub modified: usize,
    pub duplicated: usize,
    pub removed: usize,
}

#[derive(Debug)]
struct ModifyPlan {
    id: Uuid,
    ticket: u64,
    stop_loss: Decimal,
    take_profit: Decimal,
}

#[derive(Debug)]
struct OpenPlan {
    id: Uuid,
    provider_ticket: u64,
    request: OpenRequest,
}

/// Actions for one receiver in one cycle.
#[derive(Debug, Default)]
struct ReceiverBatch {
    closes: Vec<(Uuid, u64)>,
    modifies: Vec<ModifyPlan>,
    opens: Vec<OpenPlan>,
}

impl ReceiverBatch {
    fn is_empty(&self) -> bool {
        self.closes.is_empty() && self.modifies.is_empty() && self.opens.is_empty()
    }
}

/// How far a new copy could be confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Confirmation {
    /// Ticket known and seen in a live read
    Visible(u64),
    /// Ticket known, not yet visible
    Unconfirmed(u64),
    /// Order accepted but no position ticket could be resolved
    Unresolved,
}

/// Reconciliation engine state.
pub struct CopyEngine {
    pub(super) settings: Settings,
    pub(super) provider: Arc<dyn Terminal>,
    pub(super) provider_config: ProviderConfig,
    pub(super) receivers: Vec<Arc<ReceiverHandle>>,
    pub(super) records: RecordMap,
    pub(super) store: StateStore,
    pub(super) notifier: Notifier,
}

impl CopyEngine {
    pub fn new(
        config: &CopierConfig,
        provider: Arc<dyn Terminal>,
        receivers: Vec<ReceiverHandle>,
        store: StateStore,
        records: RecordMap,
        notifier: Notifier,
    ) -> Self {
        Self {
            settings: config.settings.clone(),
            provider,
            provider_config: config.provider.clone(),
            receivers: receivers.into_iter().map(Arc::new).collect(),
            records,
            store,
            notifier,
        }
    }

    pub fn records(&self) -> &RecordMap {
        &self.records
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn provider(&self) -> &Arc<dyn Terminal> {
        &self.provider
    }

    pub fn receivers(&self) -> impl Iterator<Item = &ReceiverHandle> {
        self.receivers.iter().map(|r| r.as_ref())
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub(super) fn quiet(&self) -> bool {
        self.settings.log_actions_only
    }

    /// Save the record map; failures are reported, never raised.
    pub async fn persist(&self) -> bool {
        match self.store.save(&self.records).await {
            Ok(()) => true,
            Err(e) => {
                error!(error = %format!("{:#}", e), "Failed to save trade state");
                self.notifier
                    .error(SYSTEM_SOURCE, format!("Failed to save trade state: {:#}", e));
                false
            }
        }
    }

    /// Live provider positions keyed by ticket.
    pub(super) async fn provider_positions(&self) -> Result<HashMap<u64, Position>> {
        let name = self.provider.name();
        if !self.provider.ensure_context().await {
            bail!("Provider {} unreachable", name);
        }
        let positions = self
            .provider
            .list_positions(&PositionFilter::all())
            .await
            .with_context(|| format!("Failed to read positions from {}", name))?;
        Ok(positions.into_iter().map(|p| (p.ticket, p)).collect())
    }

    /// Run one full reconciliation cycle.
    ///
    /// Errors mean the provider could not be read; nothing was changed.
    pub async fn run_cycle(&mut self, actions: Vec<Action>) -> Result<CycleReport> {
        let quiet = self.quiet();
        let mut report = CycleReport::default();
        routine!(quiet, actions = actions.len(), "Starting synchronization cycle");

        for action in actions {
            self.apply_action(action).await;
        }

        let snapshot = self.provider_positions().await?;
        if snapshot.is_empty() {
            routine!(quiet, "Provider has no open positions");
        } else {
            routine!(quiet, positions = snapshot.len(), "Read provider positions");
        }
        let now = Utc::now();

        let (batches, closing) = self.plan_closes_and_modifies(&snapshot);
        report.new_records = self.track_new_positions(&snapshot);

        if self.settings.duplicate_provider_trades {
            report.duplicated = self.run_duplication(&snapshot, now).await;
        }

        for (index, batch) in batches.into_iter().enumerate() {
            self.sync_receiver(index, batch, &snapshot, now, &mut report)
                .await;
        }

        report.removed = self.cleanup_closed(closing, Some(&snapshot)).await;

        self.persist().await;

        let views = self.build_snapshot(&snapshot).await;
        self.notifier.snapshot(views);

        routine!(quiet, ?report, "Synchronization cycle finished");
        Ok(report)
    }

    /// Steps 3 and 4: receiver closes for vanished provider positions and
    /// SL/TP candidates for open ones. Returns the records awaiting closure.
    fn plan_closes_and_modifies(
        &mut self,
        snapshot: &HashMap<u64, Position>,
    ) -> (Vec<ReceiverBatch>, Vec<Uuid>) {
        let mut batches: Vec<ReceiverBatch> =
            self.receivers.iter().map(|_| ReceiverBatch::default()).collect();
        let mut closing = Vec::new();

        for record in self.records.values_mut() {
            match record.provider_ticket.and_then(|t| snapshot.get(&t)) {
                None => {
                    let mut scheduled = 0;
                    for (batch, handle) in batches.iter_mut().zip(&self.receivers) {
                        if let Some(ticket) = record.receiver(&handle.name).and_then(|c| c.ticket()) {
                            batch.closes.push((record.id, ticket));
                            scheduled += 1;
                        }
                    }
                    if scheduled > 0 {
                        info!(
                            uid = %record.id,
                            provider_ticket = ?record.provider_ticket,
                            receivers = scheduled,
                            "Provider trade closed, scheduling closure on receivers"
                        );
                    }
                    closing.push(record.id);
                }
                Some(position) => {
                    record.refresh_from(position);
                    if record.manually_closed {
                        continue;
                    }
                    for (batch, handle) in batches.iter_mut().zip(&self.receivers) {
                        if let Some(ticket) = record.receiver(&handle.name).and_then(|c| c.ticket()) {
                            batch.modifies.push(ModifyPlan {
                                id: record.id,
                                ticket,
                                stop_loss: position.stop_loss,
                                take_profit: position.take_profit,
                            });
                        }
                    }
                }
            }
        }

        (batches, closing)
    }

    /// Step 5: one new record per untracked provider position.
    fn track_new_positions(&mut self, snapshot: &HashMap<u64, Position>) -> usize {
        let tracked: HashSet<u64> = self
            .records
            .values()
            .filter_map(|r| r.provider_ticket)
            .collect();
        let mut fresh: Vec<&Position> = snapshot
            .values()
            .filter(|p| !tracked.contains(&p.ticket))
            .collect();
        fresh.sort_by_key(|p| p.ticket);

        for position in &fresh {
            let record = MirrorRecord::from_position(position);
            info!(
                uid = %record.id,
                ticket = position.ticket,
                symbol = %position.symbol,
                volume = %position.volume,
                side = %position.side,
                duplicate = record.is_duplicate,
                "New provider trade detected"
            );
            self.notifier.status(
                self.provider.name(),
                format!(
                    "New trade: {} {} lot {} (UID: {}){}",
                    position.symbol,
                    position.volume,
                    position.side,
                    record.short_id(),
                    if record.is_duplicate { " [DUPLICATE]" } else { "" }
                ),
            );
            self.records.insert(record.id, record);
        }

        fresh.len()
    }

    /// Steps 7 and 8 for one receiver.
    async fn sync_receiver(
        &mut self,
        index: usize,
        mut batch: ReceiverBatch,
        snapshot: &HashMap<u64, Position>,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) {
        let quiet = self.quiet();
        let handle = Arc::clone(&self.receivers[index]);
        let name = handle.name();

        let candidates: Vec<(Uuid, Position)> = self
            .records
            .values()
            .filter(|r| !r.manually_closed)
            .filter_map(|r| {
                let position = snapshot.get(&r.provider_ticket?)?;
                match handle.sizer.check_eligible(r.receiver(name), position, now) {
                    Ok(()) => Some((r.id, position.clone())),
                    Err(reason) => {
                        routine!(quiet, uid = %r.id, receiver = name, %reason, "Skipping copy");
                        None
                    }
                }
            })
            .collect();

        if batch.is_empty() && candidates.is_empty() {
            return;
        }

        if !handle.terminal.ensure_context().await {
            warn!(receiver = name, "Receiver unreachable, skipping this cycle");
            self.notifier
                .error(name, format!("{} unreachable, actions deferred", name));
            return;
        }

        let mut symbols: HashMap<String, Option<SymbolInfo>> = HashMap::new();
        for (id, position) in candidates {
            if let Some(plan) = self
                .plan_open(&handle, &mut symbols, id, &position)
                .await
            {
                batch.opens.push(plan);
            }
        }

        if batch.is_empty() {
            return;
        }

        routine!(
            quiet,
            receiver = name,
            opens = batch.opens.len(),
            closes = batch.closes.len(),
            modifies = batch.modifies.len(),
            "Executing receiver actions"
        );

        let live = match handle.live_positions().await {
            Ok(live) => live,
            Err(e) => {
                error!(receiver = name, error = %e, "Failed to read receiver positions");
                self.notifier
                    .error(name, format!("Failed to read positions: {}", e));
                return;
            }
        };

        for (id, ticket) in batch.closes {
            let Some(position) = live.get(&ticket) else {
                routine!(quiet, receiver = name, ticket, uid = %id, "Receiver position already gone");
                continue;
            };
            let sid = short_id(&id);
            info!(receiver = name, ticket, uid = %id, "Closing receiver trade");
            self.notifier
                .status(name, format!("Closing trade {} (UID {})", ticket, sid));
            match handle
                .terminal
                .close(ticket, position.volume, handle.deviation(), &format!("ProvClose UID {}", sid))
                .await
            {
                Ok(()) => report.closed += 1,
                Err(e) if e.is_already_closed() => {
                    debug!(receiver = name, ticket, "Position already closed");
                }
                Err(e) => {
                    error!(receiver = name, ticket, error = %e, "Failed to close receiver trade");
                    self.notifier.error(
                        name,
                        format!("Failed to close {} (UID {}): {}", ticket, sid, e),
                    );
                }
            }
        }

        for mut plan in batch.modifies {
            let Some(position) = live.get(&plan.ticket) else {
                continue;
            };
            if let Some(info) = lookup_symbol(&handle, &mut symbols, &position.symbol).await {
                plan.stop_loss = info.normalize_price(plan.stop_loss);
                plan.take_profit = info.normalize_price(plan.take_profit);
            }
            if !stops_diverged(
                plan.stop_loss,
                plan.take_profit,
                position.stop_loss,
                position.take_profit,
            ) {
                continue;
            }
            info!(
                receiver = name,
                ticket = plan.ticket,
                uid = %plan.id,
                sl = %plan.stop_loss,
                tp = %plan.take_profit,
                "Modifying SL/TP"
            );
            match handle
                .terminal
                .modify_stop_levels(plan.ticket, plan.stop_loss, plan.take_profit)
                .await
            {
                Ok(()) => {
                    report.modified += 1;
                    self.notifier.status(
                        name,
                        format!("Modified SL/TP for {} (UID {})", plan.ticket, short_id(&plan.id)),
                    );
                }
                Err(e) => {
                    error!(receiver = name, ticket = plan.ticket, error = %e, "Failed to modify SL/TP");
                    self.notifier.error(
                        name,
                        format!("Failed to modify SL/TP for {}: {}", plan.ticket, e),
                    );
                }
            }
        }

        for plan in batch.opens {
            if self.execute_open(&handle, plan).await {
                report.opened += 1;
            } else {
                report.failed_opens += 1;
            }
        }
    }

    /// Resolve symbol and volume for one eligible copy.
    async fn plan_open(
        &self,
        handle: &ReceiverHandle,
        symbols: &mut HashMap<String, Option<SymbolInfo>>,
        id: Uuid,
        position: &Position,
    ) -> Option<OpenPlan> {
        let name = handle.name();
        let symbol = handle.sizer.receiver_symbol(&position.symbol).to_string();
        if symbol != position.symbol {
            routine!(self.quiet(), receiver = name, from = %position.symbol, to = %symbol, "Mapped symbol");
        }

        let Some(info) = lookup_symbol(handle, symbols, &symbol).await else {
            error!(receiver = name, uid = %id, symbol = %symbol, "Symbol not available, cannot copy");
            self.notifier.error(
                name,
                format!(
                    "Cannot copy P:{} (UID:{}): symbol {} not available",
                    position.ticket,
                    short_id(&id),
                    symbol
                ),
            );
            return None;
        };

        let volume = handle.sizer.copy_volume(&info, position.volume);
        if volume <= Decimal::ZERO {
            warn!(
                receiver = name,
                uid = %id,
                provider_volume = %position.volume,
                "Calculated copy volume is zero, skipping"
            );
            return None;
        }

        let config = handle.config();
        Some(OpenPlan {
            id,
            provider_ticket: position.ticket,
            request: OpenRequest {
                symbol,
                volume,
                side: position.side,
                stop_loss: info.normalize_price(position.stop_loss),
                take_profit: info.normalize_price(position.take_profit),
                deviation: config.login.price_deviation_points,
                tag: config.login.tag,
                comment: position.ticket.to_string(),
            },
        })
    }

    /// Send one copy order. Returns true when the copy is recorded `Copied`.
    async fn execute_open(&mut self, handle: &ReceiverHandle, plan: OpenPlan) -> bool {
        let name = handle.name();
        let Some(record) = self.records.get_mut(&plan.id) else {
            return false;
        };
        let sid = record.short_id();
        let copy = record.receivers.entry(name.to_string()).or_default();
        if let Err(e) = copy.begin_attempt(Utc::now()) {
            warn!(receiver = name, uid = %plan.id, error = %e, "Copy not attempted");
            return false;
        }

        // The attempt must be on disk before the order goes out
        self.persist().await;

        info!(
            receiver = name,
            uid = %plan.id,
            provider_ticket = plan.provider_ticket,
            volume = %plan.request.volume,
            "Attempting to copy"
        );
        self.notifier.status(
            name,
            format!(
                "Copying P:{} (UID:{}) Vol:{}",
                plan.provider_ticket, sid, plan.request.volume
            ),
        );

        let result = match handle.terminal.open(&plan.request).await {
            Ok(result) => result,
            Err(e) => {
                let hint = if e.is_permanent() {
                    format!(
                        " (auto-trading disabled, retrying every {}s until enabled)",
                        self.settings.retry_interval().num_seconds()
                    )
                } else {
                    String::new()
                };
                error!(receiver = name, uid = %plan.id, error = %e, "Failed to copy trade");
                self.notifier.error(
                    name,
                    format!(
                        "Failed to copy P:{} (UID:{}){}. Reason: {}",
                        plan.provider_ticket, sid, hint, e
                    ),
                );
                return false;
            }
        };

        let ticket = match confirm_open(handle, &result).await {
            Confirmation::Visible(ticket) => ticket,
            Confirmation::Unconfirmed(ticket) => {
                warn!(
                    receiver = name,
                    uid = %plan.id,
                    ticket,
                    "Copy accepted but not yet visible, recording it anyway"
                );
                ticket
            }
            Confirmation::Unresolved => {
                error!(
                    receiver = name,
                    uid = %plan.id,
                    order = result.order,
                    "Copy accepted but no position ticket reported"
                );
                self.notifier.error(
                    name,
                    format!(
                        "Order {} for P:{} (UID:{}) accepted without a position ticket",
                        result.order, plan.provider_ticket, sid
                    ),
                );
                return false;
            }
        };

        let confirmed = self
            .records
            .get_mut(&plan.id)
            .and_then(|r| r.receivers.get_mut(name))
            .map(|copy| copy.confirm(ticket));
        match confirmed {
            Some(Ok(())) => {
                info!(receiver = name, uid = %plan.id, ticket, "Copied trade");
                self.notifier.status(
                    name,
                    format!("Copied P:{} to R:{}", plan.provider_ticket, ticket),
                );
                true
            }
            Some(Err(e)) => {
                warn!(receiver = name, uid = %plan.id, error = %e, "Could not record copy");
                false
            }
            None => false,
        }
    }

    /// Step 11: join records with live terminal data.
    async fn build_snapshot(&self, fallback: &HashMap<u64, Position>) -> Vec<TradeView> {
        let quiet = self.quiet();
        let provider_live = match self.provider_positions().await {
            Ok(live) => live,
            Err(e) => {
                routine!(quiet, error = %format!("{:#}", e), "Provider re-read failed, using cycle snapshot");
                fallback.clone()
            }
        };

        let mut receiver_live: Vec<Option<HashMap<u64, Position>>> =
            Vec::with_capacity(self.receivers.len());
        for handle in &self.receivers {
            let expected: Vec<u64> = self
                .records
                .values()
                .filter_map(|r| r.receiver(&handle.name).and_then(|c| c.ticket()))
                .collect();
            if expected.is_empty() {
                receiver_live.push(None);
                continue;
            }

            let mut live = handle.live_positions().await.ok();
            let missing = live
                .as_ref()
                .map_or(true, |l| expected.iter().any(|t| !l.contains_key(t)));
            if missing {
                routine!(quiet, receiver = %handle.name, "Copied position missing from live read, retrying");
                tokio::time::sleep(SNAPSHOT_RETRY_DELAY).await;
                if let Ok(retry) = handle.live_positions().await {
                    live = Some(retry);
                }
            }
            receiver_live.push(live);
        }

        let provider_name = self.provider.name();
        self.records
            .values()
            .map(|record| {
                let provider = match record.provider_ticket.and_then(|t| provider_live.get(&t)) {
                    Some(position) => LegView::live(provider_name, position),
                    None => LegView::last_known(provider_name, record),
                };

                let receivers = self
                    .receivers
                    .iter()
                    .zip(&receiver_live)
                    .map(|(handle, live)| {
                        let copy = record.receiver(&handle.name);
                        match copy.map(|c| (c.status(), c.ticket())) {
                            Some((CopyStatus::Copied, Some(ticket))) => {
                                match live.as_ref().and_then(|l| l.get(&ticket)) {
                                    Some(position) => LegView::live(&handle.name, position),
                                    None => LegView::placeholder(
                                        &handle.name,
                                        LegState::NotFoundLive,
                                        Some(ticket),
                                    ),
                                }
                            }
                            Some((CopyStatus::Attempted, _)) => {
                                LegView::placeholder(&handle.name, LegState::AttemptingCopy, None)
                            }
                            _ => LegView::placeholder(&handle.name, LegState::NotCopied, None),
                        }
                    })
                    .collect();

                TradeView {
                    universal_id: record.id,
                    manually_closed: record.manually_closed,
                    is_duplicate: record.is_duplicate,
                    provider,
                    receivers,
                }
            })
            .collect()
    }
}

/// Symbol properties on one receiver, looked up once per cycle.
async fn lookup_symbol(
    handle: &ReceiverHandle,
    symbols: &mut HashMap<String, Option<SymbolInfo>>,
    symbol: &str,
) -> Option<SymbolInfo> {
    if let Some(info) = symbols.get(symbol) {
        return info.clone();
    }
    let info = match handle.terminal.symbol_info(symbol).await {
        Ok(info) => info,
        Err(e) => {
            warn!(receiver = handle.name(), symbol, error = %e, "Symbol lookup failed");
            None
        }
    };
    symbols.insert(symbol.to_string(), info.clone());
    info
}

/// Resolve the position ticket of an accepted copy and wait, bounded, for it
/// to show up in a live read.
///
/// A missing position ticket is looked up by the exact deal ticket.
async fn confirm_open(handle: &ReceiverHandle, result: &OrderResult) -> Confirmation {
    let mut policy = ExponentialBackoff {
        initial_interval: Duration::from_millis(100),
        max_interval: Duration::from_millis(400),
        max_elapsed_time: Some(Duration::from_secs(1)),
        ..Default::default()
    };
    policy.reset();

    let mut ticket = result.position_ticket.filter(|t| *t > 0);
    loop {
        if ticket.is_none() {
            if let Some(deal) = result.deal {
                ticket = match handle.terminal.list_recent_deals(DealQuery::Ticket(deal)).await {
                    Ok(deals) => deals
                        .iter()
                        .find(|d| d.ticket == deal)
                        .map(|d| d.position_id)
                        .filter(|p| *p > 0),
                    Err(e) => {
                        debug!(receiver = %handle.name, deal, error = %e, "Deal lookup failed");
                        None
                    }
                };
            }
        }

        if let Some(ticket) = ticket {
            match handle.live_positions().await {
                Ok(live) if live.contains_key(&ticket) => return Confirmation::Visible(ticket),
                Ok(_) => {}
                Err(e) => debug!(receiver = %handle.name, error = %e, "Confirmation read failed"),
            }
        }

        match policy.next_backoff() {
            Some(delay) => tokio::time::sleep(delay).await,
            None => break,
        }
    }

    match ticket {
        Some(ticket) => Confirmation::Unconfirmed(ticket),
        None => Confirmation::Unresolved,
    }
}

#[cfg(test)]
pub(super) mod tests {
    use super::*;
    use crate::api::{retcode, PaperVenue};
    use crate::events::Notification;
    use crate::models::TradeSide;
    use rust_decimal_macros::dec;
    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use tokio_test::assert_err;

    pub(crate) const PROVIDER: &str = "Provider-1";
    pub(crate) const RECEIVER: &str = "Receiver-2";

    pub(crate) struct Harness {
        pub venue: Arc<PaperVenue>,
        pub engine: CopyEngine,
        pub rx: mpsc::Receiver<Notification>,
        _dir: TempDir,
    }

    impl Harness {
        pub async fn new(settings: &str, receivers: &str) -> Self {
            let dir = TempDir::new().unwrap();
            let raw = format!(
                r#"{{"settings": {{"state_file": "unused" {}}},
                    "provider": {{"account": 1, "password": "p", "tag": 0}},
                    "receivers": [{}]}}"#,
                settings, receivers
            );
            let config = CopierConfig::from_json(&raw).unwrap();

            let venue = PaperVenue::new();
            let provider = venue.terminal(&config.provider.name()).await;
            provider.connect().await.unwrap();

            let mut handles = Vec::new();
            for receiver in &config.receivers {
                let terminal = venue.terminal(&receiver.name()).await;
                terminal.connect().await.unwrap();
                handles.push(ReceiverHandle::new(
                    receiver.clone(),
                    Arc::new(terminal),
                    config.settings.retry_interval(),
                ));
            }

            let (notifier, rx) = Notifier::channel(4096);
            let engine = CopyEngine::new(
                &config,
                Arc::new(provider),
                handles,
                StateStore::new(dir.path().join("state.json")),
                RecordMap::new(),
                notifier,
            );

            Self {
                venue,
                engine,
                rx,
                _dir: dir,
            }
        }

        pub async fn default_receiver() -> Self {
            Self::new("", r#"{"account": 2, "password": "r", "tag": 77}"#).await
        }

        pub async fn provider_open(&self, symbol: &str, side: TradeSide, volume: Decimal) -> u64 {
            self.venue
                .place_position(
                    PROVIDER,
                    symbol,
                    side,
                    volume,
                    Decimal::ZERO,
                    Decimal::ZERO,
                    "",
                    Utc::now(),
                )
                .await
                .unwrap()
        }

        pub async fn cycle(&mut self) -> CycleReport {
            self.engine.run_cycle(Vec::new()).await.unwrap()
        }

        pub fn record_for(&self, provider_ticket: u64) -> Option<&MirrorRecord> {
            self.engine
                .records()
                .values()
                .find(|r| r.provider_ticket == Some(provider_ticket))
        }

        pub fn drain(&mut self) -> Vec<Notification> {
            let mut out = Vec::new();
            while let Ok(n) = self.rx.try_recv() {
                out.push(n);
            }
            out
        }
    }

    #[test]
    fn test_stop_tolerance() {
        let zero = Decimal::ZERO;
        assert!(!stops_diverged(dec!(1.10001), zero, dec!(1.1), zero));
        assert!(stops_diverged(dec!(1.1001), zero, dec!(1.1), zero));
        assert!(stops_diverged(zero, zero, dec!(1.1), zero));
        assert!(stops_diverged(zero, dec!(1.2), zero, zero));
        assert!(!stops_diverged(zero, zero, zero, zero));
    }

    #[tokio::test]
    async fn test_new_position_copied_with_multiplier() {
        let mut h = Harness::new(
            "",
            r#"{"account": 2, "password": "r", "tag": 77, "provider_lot_size_multiplied_by": 0.1}"#,
        )
        .await;
        let ticket = h.provider_open("EURUSD", TradeSide::Buy, dec!(1.0)).await;

        let report = h.cycle().await;
        assert_eq!(report.new_records, 1);
        assert_eq!(report.opened, 1);

        let record = h.record_for(ticket).unwrap();
        let copy = record.receiver(RECEIVER).unwrap();
        assert_eq!(copy.status(), CopyStatus::Copied);

        let copies = h.venue.positions(RECEIVER).await;
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].ticket, copy.ticket().unwrap());
        assert_eq!(copies[0].volume, dec!(0.1));
        assert_eq!(copies[0].comment, ticket.to_string());
        assert_eq!(copies[0].tag, 77);
    }

    #[tokio::test]
    async fn test_second_cycle_is_idempotent() {
        let mut h = Harness::default_receiver().await;
        h.provider_open("EURUSD", TradeSide::Sell, dec!(0.5)).await;

        h.cycle().await;
        let report = h.cycle().await;

        assert_eq!(report.new_records, 0);
        assert_eq!(report.opened, 0);
        assert_eq!(h.venue.calls(RECEIVER).await.opens, 1);
        assert_eq!(h.venue.positions(RECEIVER).await.len(), 1);
    }

    #[tokio::test]
    async fn test_sl_tp_propagation_respects_tolerance() {
        let mut h = Harness::default_receiver().await;
        let ticket = h
            .venue
            .place_position(
                PROVIDER,
                "EURUSD",
                TradeSide::Buy,
                dec!(1),
                dec!(1.1),
                dec!(1.2),
                "",
                Utc::now(),
            )
            .await
            .unwrap();
        h.cycle().await;
        assert_eq!(h.venue.positions(RECEIVER).await[0].stop_loss, dec!(1.1));

        h.venue.set_stops(PROVIDER, ticket, dec!(1.10001), dec!(1.2)).await;
        h.cycle().await;
        assert_eq!(h.venue.calls(RECEIVER).await.modifies, 0);

        h.venue.set_stops(PROVIDER, ticket, dec!(1.1001), dec!(1.2)).await;
        let report = h.cycle().await;
        assert_eq!(report.modified, 1);
        h.cycle().await;
        assert_eq!(h.venue.calls(RECEIVER).await.modifies, 1);
        assert_eq!(h.venue.positions(RECEIVER).await[0].stop_loss, dec!(1.1001));
    }

    #[tokio::test]
    async fn test_removed_stop_is_propagated() {
        let mut h = Harness::default_receiver().await;
        let ticket = h
            .venue
            .place_position(
                PROVIDER,
                "EURUSD",
                TradeSide::Buy,
                dec!(1),
                dec!(1.1),
                Decimal::ZERO,
                "",
                Utc::now(),
            )
            .await
            .unwrap();
        h.cycle().await;

        h.venue.set_stops(PROVIDER, ticket, Decimal::ZERO, Decimal::ZERO).await;
        h.cycle().await;
        assert_eq!(h.venue.positions(RECEIVER).await[0].stop_loss, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_provider_close_waits_for_confirmed_receiver_close() {
        let mut h = Harness::default_receiver().await;
        let ticket = h.provider_open("EURUSD", TradeSide::Buy, dec!(1)).await;
        h.cycle().await;
        let id = h.record_for(ticket).unwrap().id;

        h.venue.remove_position(PROVIDER, ticket).await;
        h.venue
            .fail_next_close(RECEIVER, TerminalError::Transport("timeout".to_string()))
            .await;
        let report = h.cycle().await;
        assert_eq!(report.removed, 0);
        let record = &h.engine.records()[&id];
        assert!(record.receiver(RECEIVER).unwrap().is_copied());
        assert_eq!(h.venue.positions(RECEIVER).await.len(), 1);

        let report = h.cycle().await;
        assert_eq!(report.closed, 1);
        assert_eq!(report.removed, 1);
        assert!(h.engine.records().is_empty());
        assert!(h.venue.positions(RECEIVER).await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_copy_waits_for_retry_interval() {
        let mut h = Harness::default_receiver().await;
        let ticket = h.provider_open("EURUSD", TradeSide::Buy, dec!(1)).await;
        h.venue
            .fail_next_open(
                RECEIVER,
                TerminalError::Rejected {
                    code: 10004,
                    message: "Requote".to_string(),
                },
            )
            .await;

        let report = h.cycle().await;
        assert_eq!(report.failed_opens, 1);
        let copy = h.record_for(ticket).unwrap().receiver(RECEIVER).unwrap();
        assert_eq!(copy.status(), CopyStatus::Attempted);
        assert_eq!(copy.ticket(), None);

        h.cycle().await;
        assert_eq!(h.venue.calls(RECEIVER).await.opens, 1);
        assert!(h
            .drain()
            .iter()
            .any(|n| matches!(n, Notification::Error { message, .. } if message.contains("Requote"))));
    }

    #[tokio::test]
    async fn test_failed_copy_retried_after_interval() {
        let mut h = Harness::new(
            r#", "retry_interval_secs": 0"#,
            r#"{"account": 2, "password": "r"}"#,
        )
        .await;
        let ticket = h.provider_open("GBPUSD", TradeSide::Buy, dec!(1)).await;
        h.venue
            .fail_next_open(RECEIVER, TerminalError::Transport("timeout".to_string()))
            .await;

        h.cycle().await;
        let report = h.cycle().await;

        assert_eq!(report.opened, 1);
        assert!(h.record_for(ticket).unwrap().receiver(RECEIVER).unwrap().is_copied());
    }

    #[tokio::test]
    async fn test_symbol_unavailable_skips_receiver() {
        let mut h = Harness::default_receiver().await;
        h.venue.remove_symbol(RECEIVER, "XAUUSD").await;
        let ticket = h.provider_open("XAUUSD", TradeSide::Buy, dec!(1)).await;

        let report = h.cycle().await;
        assert_eq!(report.opened, 0);
        assert_eq!(h.venue.calls(RECEIVER).await.opens, 0);
        assert!(h.record_for(ticket).unwrap().receiver(RECEIVER).is_none());
        assert!(h.drain().iter().any(
            |n| matches!(n, Notification::Error { message, .. } if message.contains("XAUUSD"))
        ));
    }

    #[tokio::test]
    async fn test_symbol_mapping() {
        let mut h = Harness::new(
            "",
            r#"{"account": 2, "password": "r",
                "SymbolMapping": [{"ProviderSymbol": "XAUUSD", "RecieverSymbol": "GOLD"}]}"#,
        )
        .await;
        h.venue
            .add_symbol(
                RECEIVER,
                SymbolInfo {
                    name: "GOLD".to_string(),
                    volume_min: dec!(0.1),
                    volume_max: dec!(50),
                    volume_step: dec!(0.1),
                    digits: 2,
                },
            )
            .await;
        h.provider_open("XAUUSD", TradeSide::Sell, dec!(0.35)).await;

        h.cycle().await;
        let copies = h.venue.positions(RECEIVER).await;
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].symbol, "GOLD");
        assert_eq!(copies[0].volume, dec!(0.3));
    }

    #[tokio::test]
    async fn test_stops_compared_at_receiver_precision() {
        let mut h = Harness::new(
            "",
            r#"{"account": 2, "password": "r",
                "SymbolMapping": [{"ProviderSymbol": "XAUUSD", "RecieverSymbol": "GOLD"}]}"#,
        )
        .await;
        h.venue
            .add_symbol(
                RECEIVER,
                SymbolInfo {
                    name: "GOLD".to_string(),
                    volume_min: dec!(0.01),
                    volume_max: dec!(50),
                    volume_step: dec!(0.01),
                    digits: 2,
                },
            )
            .await;
        h.venue.set_price("GOLD", dec!(1962.4)).await;
        let ticket = h
            .venue
            .place_position(
                PROVIDER,
                "XAUUSD",
                TradeSide::Buy,
                dec!(1),
                dec!(1950.127),
                dec!(1980.5),
                "",
                Utc::now(),
            )
            .await
            .unwrap();

        h.cycle().await;
        let copy = &h.venue.positions(RECEIVER).await[0];
        assert_eq!(copy.open_price, dec!(1962.4));
        assert_eq!(copy.stop_loss, dec!(1950.13));

        let report = h.cycle().await;
        assert_eq!(report.modified, 0);
        assert_eq!(h.venue.calls(RECEIVER).await.modifies, 0);

        h.venue.set_stops(PROVIDER, ticket, dec!(1948.004), dec!(1980.5)).await;
        let report = h.cycle().await;
        assert_eq!(report.modified, 1);
        assert_eq!(h.venue.positions(RECEIVER).await[0].stop_loss, dec!(1948.00));
        h.cycle().await;
        assert_eq!(h.venue.calls(RECEIVER).await.modifies, 1);
    }

    #[tokio::test]
    async fn test_old_and_disabled_trades_not_copied() {
        let mut h = Harness::new(
            "",
            r#"{"account": 2, "password": "r", "copy_sell_trades": false}"#,
        )
        .await;
        h.venue
            .place_position(
                PROVIDER,
                "EURUSD",
                TradeSide::Buy,
                dec!(1),
                Decimal::ZERO,
                Decimal::ZERO,
                "",
                Utc::now() - chrono::Duration::minutes(30),
            )
            .await
            .unwrap();
        h.provider_open("EURUSD", TradeSide::Sell, dec!(1)).await;

        let report = h.cycle().await;
        assert_eq!(report.new_records, 2);
        assert_eq!(h.venue.calls(RECEIVER).await.opens, 0);
    }

    #[tokio::test]
    async fn test_ticket_resolved_from_deal() {
        let mut h = Harness::default_receiver().await;
        h.venue.set_deal_only_results(RECEIVER, true).await;
        let ticket = h.provider_open("EURUSD", TradeSide::Buy, dec!(1)).await;

        h.cycle().await;
        let copy = h.record_for(ticket).unwrap().receiver(RECEIVER).unwrap();
        assert!(copy.is_copied());
        assert_eq!(copy.ticket(), Some(h.venue.positions(RECEIVER).await[0].ticket));
    }

    #[tokio::test]
    async fn test_late_visibility_still_recorded() {
        let mut h = Harness::default_receiver().await;
        h.venue.delay_visibility(RECEIVER, 100).await;
        let ticket = h.provider_open("EURUSD", TradeSide::Buy, dec!(1)).await;

        h.cycle().await;
        assert!(h.record_for(ticket).unwrap().receiver(RECEIVER).unwrap().is_copied());
        assert_eq!(h.venue.calls(RECEIVER).await.opens, 1);
    }

    #[tokio::test]
    async fn test_unreachable_receiver_is_retried() {
        let mut h = Harness::default_receiver().await;
        let ticket = h.provider_open("EURUSD", TradeSide::Buy, dec!(1)).await;
        h.venue.set_reachable(RECEIVER, false).await;

        let report = h.cycle().await;
        assert_eq!(report.opened, 0);
        assert!(h.record_for(ticket).unwrap().receiver(RECEIVER).is_none());

        h.venue.set_reachable(RECEIVER, true).await;
        let report = h.cycle().await;
        assert_eq!(report.opened, 1);
    }

    #[tokio::test]
    async fn test_unreachable_provider_fails_cycle() {
        let mut h = Harness::default_receiver().await;
        h.venue.set_reachable(PROVIDER, false).await;
        assert_err!(h.engine.run_cycle(Vec::new()).await);
    }

    #[tokio::test]
    async fn test_one_snapshot_per_cycle() {
        let mut h = Harness::default_receiver().await;
        let ticket = h.provider_open("EURUSD", TradeSide::Buy, dec!(1)).await;
        h.cycle().await;

        let snapshots: Vec<Vec<TradeView>> = h
            .drain()
            .into_iter()
            .filter_map(|n| match n {
                Notification::Snapshot { records } => Some(records),
                _ => None,
            })
            .collect();
        assert_eq!(snapshots.len(), 1);
        let view = &snapshots[0][0];
        assert_eq!(view.provider.ticket, Some(ticket));
        assert_eq!(view.provider.state, LegState::Live);
        assert_eq!(view.receivers[0].state, LegState::Live);
    }

    #[tokio::test]
    async fn test_state_persisted_each_cycle() {
        let mut h = Harness::default_receiver().await;
        h.provider_open("EURUSD", TradeSide::Buy, dec!(1)).await;
        h.cycle().await;

        let loaded = h.engine.store.load().await;
        assert_eq!(&loaded, h.engine.records());
    }

    #[tokio::test]
    async fn test_permanent_error_classification_reported() {
        let mut h = Harness::default_receiver().await;
        h.provider_open("EURUSD", TradeSide::Buy, dec!(1)).await;
        h.venue
            .fail_next_open(
                RECEIVER,
                TerminalError::Rejected {
                    code: retcode::CLIENT_DISABLES_AT,
                    message: "AutoTrading disabled by client".to_string(),
                },
            )
            .await;

        h.cycle().await;
        assert!(h.drain().iter().any(|n| matches!(
            n,
            Notification::Error { message, .. }
                if message.contains("auto-trading disabled, retrying every 30s")
        )));
    }

    /// Receiver wrapper that reads the state file when an order goes out.
    struct StateCheckingTerminal {
        inner: Arc<dyn Terminal>,
        store: StateStore,
        seen: std::sync::Mutex<Vec<Option<(CopyStatus, bool)>>>,
    }

    #[async_trait::async_trait]
    impl Terminal for StateCheckingTerminal {
        fn name(&self) -> &str {
            self.inner.name()
        }

        async fn connect(&self) -> Result<(), TerminalError> {
            self.inner.connect().await
        }

        async fn disconnect(&self) {
            self.inner.disconnect().await
        }

        async fn ensure_context(&self) -> bool {
            self.inner.ensure_context().await
        }

        async fn list_positions(&self, filter: &PositionFilter) -> Result<Vec<Position>, TerminalError> {
            self.inner.list_positions(filter).await
        }

        async fn list_orders(&self) -> Result<Vec<crate::models::Order>, TerminalError> {
            self.inner.list_orders().await
        }

        async fn list_recent_deals(&self, query: DealQuery) -> Result<Vec<crate::models::Deal>, TerminalError> {
            self.inner.list_recent_deals(query).await
        }

        async fn symbol_info(&self, symbol: &str) -> Result<Option<SymbolInfo>, TerminalError> {
            self.inner.symbol_info(symbol).await
        }

        async fn open(&self, request: &OpenRequest) -> Result<OrderResult, TerminalError> {
            let on_disk = self.store.load().await;
            let copy = on_disk
                .values()
                .find_map(|r| r.receiver(self.name()))
                .map(|c| (c.status(), c.last_attempt_time().is_some()));
            if let Ok(mut seen) = self.seen.lock() {
                seen.push(copy);
            }
            self.inner.open(request).await
        }

        async fn close(
            &self,
            ticket: u64,
            volume: Decimal,
            deviation: u32,
            comment: &str,
        ) -> Result<(), TerminalError> {
            self.inner.close(ticket, volume, deviation, comment).await
        }

        async fn modify_stop_levels(
            &self,
            ticket: u64,
            stop_loss: Decimal,
            take_profit: Decimal,
        ) -> Result<(), TerminalError> {
            self.inner.modify_stop_levels(ticket, stop_loss, take_profit).await
        }
    }

    #[tokio::test]
    async fn test_attempt_saved_before_order_sent() {
        let mut h = Harness::default_receiver().await;
        let terminal = Arc::new(StateCheckingTerminal {
            inner: Arc::clone(h.engine.receivers[0].terminal()),
            store: h.engine.store.clone(),
            seen: std::sync::Mutex::new(Vec::new()),
        });
        let config = h.engine.receivers[0].config().clone();
        h.engine.receivers = vec![Arc::new(ReceiverHandle::new(
            config,
            terminal.clone(),
            h.engine.settings.retry_interval(),
        ))];
        let ticket = h.provider_open("EURUSD", TradeSide::Buy, dec!(1)).await;

        h.cycle().await;

        let seen = terminal.seen.lock().unwrap().clone();
        assert_eq!(seen, vec![Some((CopyStatus::Attempted, true))]);
        assert!(h.record_for(ticket).unwrap().receiver(RECEIVER).unwrap().is_copied());
    }
}
