//! The broadcast bus used for cross-instance coordination (conventionally
//! named `api-cache-dedup`). FIFO per sender, no cross-sender
//! ordering, many-to-many, no locking.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::cache_manager::StoredResponse;

/// A message exchanged on the dedup bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BusMessage {
    TaskHeartbeat { key: String, owner_id: Uuid, timestamp_ms: i64 },
    TaskEnd { key: String },
    ResponseReady { key: String, response: StoredResponse },
}

impl BusMessage {
    pub fn key(&self) -> &str {
        match self {
            BusMessage::TaskHeartbeat { key, .. }
            | BusMessage::TaskEnd { key, .. }
            | BusMessage::ResponseReady { key, .. } => key,
        }
    }
}

/// A handle to the named broadcast channel. Cheaply cloneable; every
/// instance sharing a `Bus` value is a peer on the same bus.
#[derive(Clone)]
pub struct Bus {
    sender: broadcast::Sender<BusMessage>,
}

impl Bus {
    /// Create a fresh bus with room for `capacity` buffered messages per
    /// lagging subscriber before they start missing messages. Delivery is
    /// best-effort; a subscriber that falls behind simply misses messages.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, message: BusMessage) {
        // A broadcast channel with no active subscribers returns an error
        // that carries no actionable information for the publisher.
        let _ = self.sender.send(message);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.sender.subscribe()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new(1024)
    }
}
