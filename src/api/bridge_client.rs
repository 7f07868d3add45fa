//! HTTP client for a terminal gateway.
//!
//! The gateway fronts a single terminal process that can be logged into one
//! account at a time. All [`BridgeTerminal`]s built on the same
//! [`BridgeSession`] share its session guard, so requests for different
//! accounts never interleave and each request first switches the gateway to
//! the right account when needed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoff;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::models::{Deal, Order, Position, SymbolInfo};

use super::types::*;
use super::{retcode, DealQuery, OpenRequest, OrderResult, PositionFilter, Terminal, TerminalError};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Which account the gateway is currently logged into.
#[derive(Debug, Default)]
struct ActiveAccount {
    login: Option<u64>,
}

impl ActiveAccount {
    /// Drop the cached login when the gateway lost or never had our session.
    fn check<T>(&mut self, result: Result<T, TerminalError>) -> Result<T, TerminalError> {
        if let Err(TerminalError::ContextLost(_) | TerminalError::Unreachable(_)) = &result {
            self.login = None;
        }
        result
    }
}

/// Connection to one gateway process, shared by all accounts it serves.
pub struct BridgeSession {
    http: Client,
    base_url: String,
    active: Mutex<ActiveAccount>,
}

impl BridgeSession {
    pub fn new(base_url: &str) -> anyhow::Result<Arc<Self>> {
        let http = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Arc::new(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            active: Mutex::new(ActiveAccount::default()),
        }))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// GET with bounded retries on transport errors. Reads only.
    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, TerminalError> {
        let policy = ExponentialBackoff {
            initial_interval: Duration::from_millis(100),
            max_elapsed_time: Some(Duration::from_secs(2)),
            ..Default::default()
        };

        backoff::future::retry(policy, || async {
            let response = self
                .http
                .get(self.url(path))
                .query(query)
                .send()
                .await
                .map_err(|e| backoff::Error::transient(transport(e)))?;
            decode(response).await.map_err(|e| match e {
                TerminalError::Transport(_) => backoff::Error::transient(e),
                other => backoff::Error::permanent(other),
            })
        })
        .await
    }

    /// POST without retries: order requests must not be replayed.
    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, TerminalError> {
        let response = self
            .http
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(transport)?;
        decode(response).await
    }
}

fn transport(e: reqwest::Error) -> TerminalError {
    if e.is_connect() {
        TerminalError::Unreachable(e.to_string())
    } else {
        TerminalError::Transport(e.to_string())
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, TerminalError> {
    let status = response.status();
    if status.is_success() {
        return response
            .json()
            .await
            .map_err(|e| TerminalError::Transport(format!("Failed to parse response: {}", e)));
    }

    let body = response.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<ErrorResponse>(&body)
        .map(|e| format!("{} ({})", e.message, e.code))
        .unwrap_or(body);
    match status {
        StatusCode::SERVICE_UNAVAILABLE | StatusCode::BAD_GATEWAY => {
            Err(TerminalError::Unreachable(detail))
        }
        StatusCode::CONFLICT => Err(TerminalError::ContextLost(detail)),
        s if s.is_server_error() => Err(TerminalError::Transport(format!("{} - {}", s, detail))),
        s => Err(TerminalError::Rejected {
            code: retcode::REJECT,
            message: format!("{} - {}", s, detail),
        }),
    }
}

/// Credentials and identity of one account on the gateway.
#[derive(Debug, Clone)]
pub struct BridgeAccount {
    pub name: String,
    pub login: u64,
    pub password: String,
    pub server: String,
}

/// One account reached through a gateway.
pub struct BridgeTerminal {
    session: Arc<BridgeSession>,
    account: BridgeAccount,
}

impl BridgeTerminal {
    pub fn new(session: Arc<BridgeSession>, account: BridgeAccount) -> Self {
        Self { session, account }
    }

    /// Lock the gateway and make sure it is logged into this account.
    ///
    /// With `verify` the gateway is asked which account is active even when
    /// the cached login already matches.
    async fn activate(&self, verify: bool) -> Result<MutexGuard<'_, ActiveAccount>, TerminalError> {
        let mut active = self.session.active.lock().await;

        if verify || active.login != Some(self.account.login) {
            let result = self.switch_account().await;
            active.login = None;
            active.check(result)?;
            active.login = Some(self.account.login);
        }

        Ok(active)
    }

    async fn switch_account(&self) -> Result<(), TerminalError> {
        let current: AccountResponse = self.session.get("/account", &[]).await?;
        let current = if current.login == Some(self.account.login) {
            current
        } else {
            debug!(account = %self.account.name, active = ?current.login, "Switching gateway account");
            self.session
                .post(
                    "/login",
                    &LoginRequest {
                        login: self.account.login,
                        password: &self.account.password,
                        server: &self.account.server,
                    },
                )
                .await
                .map_err(|e| match e {
                    TerminalError::Rejected { message, .. } => {
                        TerminalError::ContextLost(format!("{}: {}", self.account.name, message))
                    }
                    other => other,
                })?
        };

        if !current.trade_allowed {
            warn!(account = %self.account.name, "Trading is not allowed on this account");
        }
        Ok(())
    }

    async fn order_send(&self, request: TradeRequest) -> Result<TradeResponse, TerminalError> {
        let mut active = self.activate(false).await?;
        let response: TradeResponse =
            active.check(self.session.post("/order_send", &request).await)?;
        if response.retcode != retcode::DONE && response.retcode != retcode::PLACED {
            return Err(TerminalError::Rejected {
                code: response.retcode,
                message: response.comment,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl Terminal for BridgeTerminal {
    fn name(&self) -> &str {
        &self.account.name
    }

    async fn connect(&self) -> Result<(), TerminalError> {
        let _guard = self.activate(true).await?;
        info!(account = %self.account.name, server = %self.account.server, "Connected");
        Ok(())
    }

    async fn disconnect(&self) {
        let mut active = self.session.active.lock().await;
        if active.login == Some(self.account.login) {
            if let Err(e) = self
                .session
                .post::<_, serde_json::Value>("/logout", &serde_json::json!({}))
                .await
            {
                warn!(account = %self.account.name, error = %e, "Logout failed");
            }
            active.login = None;
        }
        info!(account = %self.account.name, "Disconnected");
    }

    async fn ensure_context(&self) -> bool {
        match self.activate(true).await {
            Ok(_) => true,
            Err(e) => {
                error!(account = %self.account.name, error = %e, "Failed to ensure account context");
                false
            }
        }
    }

    async fn list_positions(&self, filter: &PositionFilter) -> Result<Vec<Position>, TerminalError> {
        let mut active = self.activate(false).await?;
        let mut query = Vec::new();
        if let Some(symbol) = &filter.symbol {
            query.push(("symbol", symbol.clone()));
        }
        if let Some(tag) = filter.tag {
            query.push(("magic", tag.to_string()));
        }

        let raw: Vec<PositionResponse> = active.check(self.session.get("/positions", &query).await)?;
        Ok(raw
            .into_iter()
            .filter_map(PositionResponse::into_position)
            .filter(|p| filter.matches(p))
            .collect())
    }

    async fn list_orders(&self) -> Result<Vec<Order>, TerminalError> {
        let mut active = self.activate(false).await?;
        let raw: Vec<OrderResponse> = active.check(self.session.get("/orders", &[]).await)?;
        Ok(raw.into_iter().map(OrderResponse::into_order).collect())
    }

    async fn list_recent_deals(&self, query: DealQuery) -> Result<Vec<Deal>, TerminalError> {
        let mut active = self.activate(false).await?;
        let params = match query {
            DealQuery::Window { from, to } => vec![
                ("from", from.timestamp().to_string()),
                ("to", to.timestamp().to_string()),
            ],
            DealQuery::Ticket(ticket) => vec![("ticket", ticket.to_string())],
        };
        let raw: Vec<DealResponse> = active.check(self.session.get("/deals", &params).await)?;
        Ok(raw.into_iter().filter_map(DealResponse::into_deal).collect())
    }

    async fn symbol_info(&self, symbol: &str) -> Result<Option<SymbolInfo>, TerminalError> {
        let mut active = self.activate(false).await?;
        let result = self
            .session
            .get::<SymbolResponse>(&format!("/symbols/{}", symbol), &[])
            .await;
        match active.check(result) {
            Ok(info) if info.visible => Ok(Some(info.into())),
            Ok(_) => Ok(None),
            Err(TerminalError::Rejected { message, .. }) => {
                debug!(symbol, message = %message, "Symbol lookup rejected");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn open(&self, request: &OpenRequest) -> Result<OrderResult, TerminalError> {
        info!(
            account = %self.account.name,
            symbol = %request.symbol,
            side = %request.side,
            volume = %request.volume,
            "Sending open request"
        );
        let response = self
            .order_send(TradeRequest {
                action: "deal",
                symbol: Some(request.symbol.clone()),
                position: None,
                volume: Some(request.volume),
                kind: Some(request.side.code()),
                sl: Some(request.stop_loss),
                tp: Some(request.take_profit),
                deviation: Some(request.deviation),
                magic: Some(request.tag),
                comment: Some(request.comment.clone()),
            })
            .await?;

        Ok(OrderResult {
            retcode: response.retcode,
            order: response.order,
            deal: (response.deal > 0).then_some(response.deal),
            position_ticket: (response.position > 0).then_some(response.position),
            volume: response.volume,
            price: response.price,
            comment: response.comment,
        })
    }

    async fn close(
        &self,
        ticket: u64,
        volume: Decimal,
        deviation: u32,
        comment: &str,
    ) -> Result<(), TerminalError> {
        info!(account = %self.account.name, ticket, volume = %volume, "Sending close request");
        self.order_send(TradeRequest {
            action: "close",
            symbol: None,
            position: Some(ticket),
            volume: Some(volume),
            kind: None,
            sl: None,
            tp: None,
            deviation: Some(deviation),
            magic: None,
            comment: Some(comment.to_string()),
        })
        .await
        .map(|_| ())
    }

    async fn modify_stop_levels(
        &self,
        ticket: u64,
        stop_loss: Decimal,
        take_profit: Decimal,
    ) -> Result<(), TerminalError> {
        info!(
            account = %self.account.name,
            ticket,
            sl = %stop_loss,
            tp = %take_profit,
            "Sending SL/TP modification"
        );
        self.order_send(TradeRequest {
            action: "sltp",
            symbol: None,
            position: Some(ticket),
            volume: None,
            kind: None,
            sl: Some(stop_loss),
            tp: Some(take_profit),
            deviation: None,
            magic: None,
            comment: None,
        })
        .await
        .map(|_| ())
    }
}
