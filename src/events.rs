//! Cross-boundary queues between the copier and the outside world.
//!
//! - Action Intake: unbounded FIFO of close commands, drained at the start of
//!   every cycle
//! - Notifications: bounded FIFO of status/error events and one snapshot per
//!   cycle; emission never waits, a full channel drops the event

use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::TradeView;

/// Source name for engine-wide events.
pub const SYSTEM_SOURCE: &str = "System";

/// Externally requested command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    CloseTrade { id: Uuid },
    CloseAll,
}

/// Producer side of the Action Intake.
#[derive(Debug, Clone)]
pub struct ActionSender {
    tx: mpsc::UnboundedSender<Action>,
}

impl ActionSender {
    /// Queue an action. Returns false once the copier has stopped.
    pub fn send(&self, action: Action) -> bool {
        self.tx.send(action).is_ok()
    }

    pub fn close_trade(&self, id: Uuid) -> bool {
        self.send(Action::CloseTrade { id })
    }

    pub fn close_all(&self) -> bool {
        self.send(Action::CloseAll)
    }
}

/// Consumer side of the Action Intake, owned by the scheduler.
#[derive(Debug)]
pub struct ActionQueue {
    rx: mpsc::UnboundedReceiver<Action>,
}

impl ActionQueue {
    /// Take everything queued so far, in enqueue order.
    pub fn drain(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        while let Ok(action) = self.rx.try_recv() {
            actions.push(action);
        }
        actions
    }
}

pub fn action_channel() -> (ActionSender, ActionQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ActionSender { tx }, ActionQueue { rx })
}

/// Outbound event for the observer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    Status { source: String, message: String },
    Error { source: String, message: String },
    Snapshot { records: Vec<TradeView> },
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::Status { .. } => "status",
            Notification::Error { .. } => "error",
            Notification::Snapshot { .. } => "snapshot",
        }
    }
}

/// Non-blocking producer for [`Notification`]s.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: mpsc::Sender<Notification>,
}

impl Notifier {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    pub fn status(&self, source: &str, message: impl Into<String>) {
        self.emit(Notification::Status {
            source: source.to_string(),
            message: message.into(),
        });
    }

    pub fn error(&self, source: &str, message: impl Into<String>) {
        self.emit(Notification::Error {
            source: source.to_string(),
            message: message.into(),
        });
    }

    pub fn snapshot(&self, records: Vec<TradeView>) {
        self.emit(Notification::Snapshot { records });
    }

    fn emit(&self, notification: Notification) {
        match self.tx.try_send(notification) {
            Ok(()) => {}
            Err(TrySendError::Full(dropped)) => {
                warn!(kind = dropped.kind(), "Notification channel full, dropping event");
            }
            Err(TrySendError::Closed(dropped)) => {
                debug!(kind = dropped.kind(), "No observer attached, dropping event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_actions_drain_in_order() {
        let (sender, mut queue) = action_channel();
        let id = Uuid::new_v4();
        assert!(sender.close_trade(id));
        assert!(sender.close_all());

        assert_eq!(
            queue.drain(),
            vec![Action::CloseTrade { id }, Action::CloseAll]
        );
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn test_full_channel_drops_without_blocking() {
        let (notifier, mut rx) = Notifier::channel(1);
        notifier.status(SYSTEM_SOURCE, "first");
        notifier.error(SYSTEM_SOURCE, "second");

        assert_eq!(
            rx.try_recv().unwrap(),
            Notification::Status {
                source: SYSTEM_SOURCE.to_string(),
                message: "first".to_string()
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_serialized_shape() {
        let json = serde_json::to_value(Notification::Error {
            source: "Receiver-2".to_string(),
            message: "boom".to_string(),
        })
        .unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["source"], "Receiver-2");
    }
}
