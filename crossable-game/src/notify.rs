//! Publish/subscribe channel for balance and session changes.
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::constants::EVENT_CHANNEL_CAPACITY;
use crate::money::Cents;
use crate::session::SessionStatus;

/// Events emitted to presentation layers after a mutation is durable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    BalanceChanged {
        user_id: String,
        balance: Cents,
    },
    SessionEnded {
        session_id: Uuid,
        user_id: String,
        status: SessionStatus,
    },
}

/// Cloneable handle to a broadcast channel; every subscriber sees every
/// event published after it subscribed.
#[derive(Debug, Clone)]
pub struct NotificationBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl NotificationBus {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(EVENT_CHANNEL_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Publish an event; having no subscribers is not an error.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}
