//! Simulated terminal for paper trading and tests.
//!
//! A [`PaperVenue`] holds the books of any number of accounts; each
//! [`PaperTerminal`] is a handle onto one of them. Fills are immediate at the
//! symbol's configured price. Failures can be injected per account.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::Mutex;
use tracing::debug;

use crate::models::{Deal, Order, Position, SymbolInfo, TradeSide};

use super::{retcode, DealQuery, OpenRequest, OrderResult, PositionFilter, Terminal, TerminalError};

/// Call counters for one paper account.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub opens: usize,
    pub closes: usize,
    pub modifies: usize,
}

#[derive(Debug, Default)]
struct PaperAccount {
    positions: BTreeMap<u64, Position>,
    orders: Vec<Order>,
    deals: Vec<Deal>,
    symbols: HashMap<String, SymbolInfo>,
    connected: bool,
    reachable: bool,
    open_failures: VecDeque<TerminalError>,
    close_failures: VecDeque<TerminalError>,
    /// Report only the deal ticket on fills, not the position
    deal_only_results: bool,
    /// Fills stay invisible to position reads for this many reads
    hidden_reads: usize,
    pending_visibility: Vec<u64>,
    /// Position reads never complete
    stalled: bool,
    calls: CallCounts,
}

#[derive(Debug)]
struct VenueState {
    accounts: HashMap<String, PaperAccount>,
    default_symbols: Vec<SymbolInfo>,
    prices: HashMap<String, Decimal>,
    next_ticket: u64,
}

impl VenueState {
    fn ticket(&mut self) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        ticket
    }

    fn account(&mut self, name: &str) -> Result<&mut PaperAccount, TerminalError> {
        self.accounts
            .get_mut(name)
            .ok_or_else(|| TerminalError::ContextLost(name.to_string()))
    }
}

/// Shared simulated venue.
#[derive(Debug)]
pub struct PaperVenue {
    state: Mutex<VenueState>,
}

impl PaperVenue {
    /// Create a venue offering the usual FX majors with 0.01 lot steps.
    pub fn new() -> Arc<Self> {
        let default_symbols = ["EURUSD", "GBPUSD", "USDJPY", "XAUUSD"]
            .iter()
            .map(|name| SymbolInfo {
                name: name.to_string(),
                volume_min: dec!(0.01),
                volume_max: dec!(100),
                volume_step: dec!(0.01),
                digits: if *name == "USDJPY" { 3 } else { 5 },
            })
            .collect();

        Arc::new(Self {
            state: Mutex::new(VenueState {
                accounts: HashMap::new(),
                default_symbols,
                prices: HashMap::new(),
                next_ticket: 5000,
            }),
        })
    }

    /// Handle for `account`, creating its book on first use.
    pub async fn terminal(self: &Arc<Self>, account: &str) -> PaperTerminal {
        let mut state = self.state.lock().await;
        let symbols = state
            .default_symbols
            .iter()
            .map(|s| (s.name.clone(), s.clone()))
            .collect();
        state
            .accounts
            .entry(account.to_string())
            .or_insert_with(|| PaperAccount {
                symbols,
                reachable: true,
                ..Default::default()
            });

        PaperTerminal {
            venue: Arc::clone(self),
            account: account.to_string(),
        }
    }

    /// Open a position directly, as a trader at the terminal would.
    #[allow(clippy::too_many_arguments)]
    pub async fn place_position(
        &self,
        account: &str,
        symbol: &str,
        side: TradeSide,
        volume: Decimal,
        stop_loss: Decimal,
        take_profit: Decimal,
        comment: &str,
        open_time: DateTime<Utc>,
    ) -> Result<u64, TerminalError> {
        let mut state = self.state.lock().await;
        let ticket = state.ticket();
        let price = state.prices.get(symbol).copied().unwrap_or(Decimal::ONE);
        let book = state.account(account)?;
        book.positions.insert(
            ticket,
            Position {
                ticket,
                symbol: symbol.to_string(),
                side,
                volume,
                open_price: price,
                stop_loss,
                take_profit,
                open_time,
                profit: Decimal::ZERO,
                tag: 0,
                comment: comment.to_string(),
            },
        );
        Ok(ticket)
    }

    /// Remove a position without going through the order path.
    pub async fn remove_position(&self, account: &str, ticket: u64) -> bool {
        let mut state = self.state.lock().await;
        match state.account(account) {
            Ok(book) => book.positions.remove(&ticket).is_some(),
            Err(_) => false,
        }
    }

    pub async fn set_stops(
        &self,
        account: &str,
        ticket: u64,
        stop_loss: Decimal,
        take_profit: Decimal,
    ) -> bool {
        let mut state = self.state.lock().await;
        let Ok(book) = state.account(account) else {
            return false;
        };
        match book.positions.get_mut(&ticket) {
            Some(pos) => {
                pos.stop_loss = stop_loss;
                pos.take_profit = take_profit;
                true
            }
            None => false,
        }
    }

    /// Fill price for new positions on `symbol`.
    pub async fn set_price(&self, symbol: &str, price: Decimal) {
        self.state.lock().await.prices.insert(symbol.to_string(), price);
    }

    pub async fn positions(&self, account: &str) -> Vec<Position> {
        let mut state = self.state.lock().await;
        match state.account(account) {
            Ok(book) => book.positions.values().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    pub async fn is_connected(&self, account: &str) -> bool {
        let mut state = self.state.lock().await;
        state.account(account).map(|b| b.connected).unwrap_or(false)
    }

    pub async fn calls(&self, account: &str) -> CallCounts {
        let mut state = self.state.lock().await;
        state.account(account).map(|b| b.calls).unwrap_or_default()
    }

    /// Make the next open on `account` fail with `error`.
    pub async fn fail_next_open(&self, account: &str, error: TerminalError) {
        if let Ok(book) = self.state.lock().await.account(account) {
            book.open_failures.push_back(error);
        }
    }

    /// Make the next close on `account` fail with `error`.
    pub async fn fail_next_close(&self, account: &str, error: TerminalError) {
        if let Ok(book) = self.state.lock().await.account(account) {
            book.close_failures.push_back(error);
        }
    }

    pub async fn set_reachable(&self, account: &str, reachable: bool) {
        if let Ok(book) = self.state.lock().await.account(account) {
            book.reachable = reachable;
            if !reachable {
                book.connected = false;
            }
        }
    }

    pub async fn set_deal_only_results(&self, account: &str, enabled: bool) {
        if let Ok(book) = self.state.lock().await.account(account) {
            book.deal_only_results = enabled;
        }
    }

    /// Hide new fills from the next `reads` position reads.
    pub async fn delay_visibility(&self, account: &str, reads: usize) {
        if let Ok(book) = self.state.lock().await.account(account) {
            book.hidden_reads = reads;
        }
    }

    /// Make position reads on `account` hang, as a wedged terminal does.
    pub async fn set_stalled(&self, account: &str, stalled: bool) {
        if let Ok(book) = self.state.lock().await.account(account) {
            book.stalled = stalled;
        }
    }

    pub async fn remove_symbol(&self, account: &str, symbol: &str) {
        if let Ok(book) = self.state.lock().await.account(account) {
            book.symbols.remove(symbol);
        }
    }

    pub async fn add_symbol(&self, account: &str, info: SymbolInfo) {
        if let Ok(book) = self.state.lock().await.account(account) {
            book.symbols.insert(info.name.clone(), info);
        }
    }
}

/// Handle onto one paper account.
#[derive(Debug, Clone)]
pub struct PaperTerminal {
    venue: Arc<PaperVenue>,
    account: String,
}

fn check_live(book: &PaperAccount, account: &str) -> Result<(), TerminalError> {
    if !book.reachable {
        return Err(TerminalError::Unreachable(account.to_string()));
    }
    if !book.connected {
        return Err(TerminalError::ContextLost(account.to_string()));
    }
    Ok(())
}

#[async_trait]
impl Terminal for PaperTerminal {
    fn name(&self) -> &str {
        &self.account
    }

    async fn connect(&self) -> Result<(), TerminalError> {
        let mut state = self.venue.state.lock().await;
        let book = state.account(&self.account)?;
        if !book.reachable {
            return Err(TerminalError::Unreachable(self.account.clone()));
        }
        book.connected = true;
        Ok(())
    }

    async fn disconnect(&self) {
        if let Ok(book) = self.venue.state.lock().await.account(&self.account) {
            book.connected = false;
        }
    }

    async fn ensure_context(&self) -> bool {
        let mut state = self.venue.state.lock().await;
        match state.account(&self.account) {
            Ok(book) if book.reachable => {
                book.connected = true;
                true
            }
            _ => false,
        }
    }

    async fn list_positions(&self, filter: &PositionFilter) -> Result<Vec<Position>, TerminalError> {
        if self.venue.state.lock().await.account(&self.account)?.stalled {
            debug!(account = %self.account, "Position read stalled");
            std::future::pending::<()>().await;
        }

        let mut state = self.venue.state.lock().await;
        let book = state.account(&self.account)?;
        check_live(book, &self.account)?;

        let hidden: Vec<u64> = if book.hidden_reads > 0 {
            book.hidden_reads -= 1;
            book.pending_visibility.clone()
        } else {
            book.pending_visibility.clear();
            Vec::new()
        };

        Ok(book
            .positions
            .values()
            .filter(|p| filter.matches(p) && !hidden.contains(&p.ticket))
            .cloned()
            .collect())
    }

    async fn list_orders(&self) -> Result<Vec<Order>, TerminalError> {
        let mut state = self.venue.state.lock().await;
        let book = state.account(&self.account)?;
        check_live(book, &self.account)?;
        Ok(book.orders.clone())
    }

    async fn list_recent_deals(&self, query: DealQuery) -> Result<Vec<Deal>, TerminalError> {
        let mut state = self.venue.state.lock().await;
        let book = state.account(&self.account)?;
        check_live(book, &self.account)?;
        Ok(book
            .deals
            .iter()
            .filter(|d| match query {
                DealQuery::Window { from, to } => d.time >= from && d.time <= to,
                DealQuery::Ticket(ticket) => d.ticket == ticket,
            })
            .cloned()
            .collect())
    }

    async fn symbol_info(&self, symbol: &str) -> Result<Option<SymbolInfo>, TerminalError> {
        let mut state = self.venue.state.lock().await;
        let book = state.account(&self.account)?;
        check_live(book, &self.account)?;
        Ok(book.symbols.get(symbol).cloned())
    }

    async fn open(&self, request: &OpenRequest) -> Result<OrderResult, TerminalError> {
        let mut state = self.venue.state.lock().await;
        let order = state.ticket();
        let deal = state.ticket();
        let position_ticket = state.ticket();
        let price = state
            .prices
            .get(&request.symbol)
            .copied()
            .unwrap_or(Decimal::ONE);

        let book = state.account(&self.account)?;
        check_live(book, &self.account)?;
        book.calls.opens += 1;

        if let Some(err) = book.open_failures.pop_front() {
            return Err(err);
        }
        let Some(info) = book.symbols.get(&request.symbol).cloned() else {
            return Err(TerminalError::SymbolUnavailable(request.symbol.clone()));
        };
        if request.volume < info.volume_min || request.volume > info.volume_max {
            return Err(TerminalError::Rejected {
                code: 10014,
                message: format!("Invalid volume {}", request.volume),
            });
        }

        let now = Utc::now();
        book.positions.insert(
            position_ticket,
            Position {
                ticket: position_ticket,
                symbol: request.symbol.clone(),
                side: request.side,
                volume: request.volume,
                open_price: price,
                stop_loss: info.normalize_price(request.stop_loss),
                take_profit: info.normalize_price(request.take_profit),
                open_time: now,
                profit: Decimal::ZERO,
                tag: request.tag,
                comment: request.comment.clone(),
            },
        );
        book.deals.push(Deal {
            ticket: deal,
            position_id: position_ticket,
            symbol: request.symbol.clone(),
            side: request.side,
            volume: request.volume,
            price,
            time: now,
            tag: request.tag,
            comment: request.comment.clone(),
        });
        if book.hidden_reads > 0 {
            book.pending_visibility.push(position_ticket);
        }

        debug!(account = %self.account, ticket = position_ticket, "Paper fill");

        Ok(OrderResult {
            retcode: retcode::DONE,
            order,
            deal: Some(deal),
            position_ticket: (!book.deal_only_results).then_some(position_ticket),
            volume: request.volume,
            price,
            comment: "Request executed".to_string(),
        })
    }

    async fn close(
        &self,
        ticket: u64,
        volume: Decimal,
        _deviation: u32,
        comment: &str,
    ) -> Result<(), TerminalError> {
        let mut state = self.venue.state.lock().await;
        let deal = state.ticket();
        let book = state.account(&self.account)?;
        check_live(book, &self.account)?;
        book.calls.closes += 1;

        if let Some(err) = book.close_failures.pop_front() {
            return Err(err);
        }
        let Some(position) = book.positions.get(&ticket).cloned() else {
            return Err(TerminalError::NotFound(ticket));
        };

        if volume >= position.volume {
            book.positions.remove(&ticket);
        } else if let Some(pos) = book.positions.get_mut(&ticket) {
            pos.volume -= volume;
        }
        book.deals.push(Deal {
            ticket: deal,
            position_id: ticket,
            symbol: position.symbol.clone(),
            side: position.side.opposite(),
            volume: volume.min(position.volume),
            price: position.open_price,
            time: Utc::now(),
            tag: position.tag,
            comment: comment.to_string(),
        });
        Ok(())
    }

    async fn modify_stop_levels(
        &self,
        ticket: u64,
        stop_loss: Decimal,
        take_profit: Decimal,
    ) -> Result<(), TerminalError> {
        let mut state = self.venue.state.lock().await;
        let book = state.account(&self.account)?;
        check_live(book, &self.account)?;
        book.calls.modifies += 1;

        let position = book
            .positions
            .get_mut(&ticket)
            .ok_or(TerminalError::NotFound(ticket))?;
        position.stop_loss = stop_loss;
        position.take_profit = take_profit;
        Ok(())
    }
}
