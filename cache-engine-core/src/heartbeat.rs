//! Heartbeat records and the manager that tracks which dedup keys have a
//! live owner. A heartbeat is published every 500ms while a fetch is in
//! flight; an owner is considered alive if its most recent heartbeat is
//! younger than 1000ms.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use uuid::Uuid;

use crate::bus::{Bus, BusMessage};

pub const HEARTBEAT_INTERVAL_MS: u64 = 500;
pub const HEARTBEAT_LIVENESS_WINDOW_MS: i64 = 1000;

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[derive(Debug, Clone, Copy)]
pub struct HeartbeatRecord {
    pub owner_id: Uuid,
    pub timestamp_ms: i64,
}

/// Tracks the liveness of dedup-key owners, local and remote alike, by
/// observing [`BusMessage::TaskHeartbeat`]/[`BusMessage::TaskEnd`] on the
/// bus, and lets this instance publish its own heartbeats.
pub struct HeartbeatManager {
    owner_id: Uuid,
    bus: Bus,
    table: Mutex<HashMap<String, HeartbeatRecord>>,
    publishers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl HeartbeatManager {
    pub fn new(bus: Bus, owner_id: Uuid) -> Self {
        Self {
            owner_id,
            bus,
            table: Mutex::new(HashMap::new()),
            publishers: Mutex::new(HashMap::new()),
        }
    }

    pub fn owner_id(&self) -> Uuid {
        self.owner_id
    }

    /// Record an observed heartbeat, ours or a peer's.
    pub fn observe(&self, key: &str, owner_id: Uuid, timestamp_ms: i64) {
        self.table.lock().unwrap().insert(
            key.to_string(),
            HeartbeatRecord { owner_id, timestamp_ms },
        );
    }

    /// Forget a key on receipt of `task-end`.
    pub fn forget(&self, key: &str) {
        self.table.lock().unwrap().remove(key);
    }

    pub fn is_owner_alive(&self, key: &str) -> bool {
        match self.table.lock().unwrap().get(key) {
            Some(record) => now_ms() - record.timestamp_ms < HEARTBEAT_LIVENESS_WINDOW_MS,
            None => false,
        }
    }

    /// Begin publishing heartbeats for `key` every 500ms until
    /// [`Self::end_heartbeat`] is called. Idempotent: a second call for an
    /// already-running key replaces the previous publisher task.
    pub fn start_heartbeat(&self, key: &str) {
        let bus = self.bus.clone();
        let owner_id = self.owner_id;
        let key_owned = key.to_string();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(HEARTBEAT_INTERVAL_MS));
            loop {
                ticker.tick().await;
                bus.publish(BusMessage::TaskHeartbeat {
                    key: key_owned.clone(),
                    owner_id,
                    timestamp_ms: now_ms(),
                });
            }
        });
        // Publish one immediately rather than waiting for the first tick.
        self.bus.publish(BusMessage::TaskHeartbeat {
            key: key.to_string(),
            owner_id: self.owner_id,
            timestamp_ms: now_ms(),
        });
        if let Some(previous) = self.publishers.lock().unwrap().insert(key.to_string(), handle) {
            previous.abort();
        }
    }

    /// Stop publishing for `key` and announce `task-end`.
    pub fn end_heartbeat(&self, key: &str) {
        if let Some(handle) = self.publishers.lock().unwrap().remove(key) {
            handle.abort();
        }
        self.bus.publish(BusMessage::TaskEnd { key: key.to_string() });
        self.forget(key);
    }

    /// Abort every locally-started publisher and forget all tracked
    /// liveness state. Does not affect peers sharing the same bus.
    pub fn dispose(&self) {
        for (_, handle) in self.publishers.lock().unwrap().drain() {
            handle.abort();
        }
        self.table.lock().unwrap().clear();
    }
}
