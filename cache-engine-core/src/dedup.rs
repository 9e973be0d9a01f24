//! The cross-instance deduplication layer: at most one fetch in flight
//! per dedup key, with peers (local or across the bus) awaiting its
//! result instead of launching their own.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use tokio::sync::broadcast;
use tokio::time::{sleep, Duration};
use uuid::Uuid;

use crate::bus::{Bus, BusMessage};
use crate::cache_manager::StoredResponse;
use crate::error::{EngineError, Result};
use crate::heartbeat::{HeartbeatManager, HEARTBEAT_INTERVAL_MS};

pub const DEFAULT_DEDUP_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone)]
enum DedupOutcome {
    Ready(StoredResponse),
    Failed(String),
}

/// Coordinates fetches across instances sharing a [`Bus`]. One
/// `DedupLayer` per [`crate::context::EngineContext`].
pub struct DedupLayer {
    heartbeats: Arc<HeartbeatManager>,
    bus: Bus,
    in_flight: Mutex<HashMap<String, broadcast::Sender<DedupOutcome>>>,
    listener: tokio::task::JoinHandle<()>,
}

impl Drop for DedupLayer {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

impl DedupLayer {
    pub fn new(bus: Bus) -> Arc<Self> {
        Self::with_owner(bus, Uuid::new_v4())
    }

    pub fn with_owner(bus: Bus, owner_id: Uuid) -> Arc<Self> {
        let heartbeats = Arc::new(HeartbeatManager::new(bus.clone(), owner_id));
        let in_flight: Mutex<HashMap<String, broadcast::Sender<DedupOutcome>>> =
            Mutex::new(HashMap::new());

        Arc::new_cyclic(|weak: &std::sync::Weak<Self>| {
            let mut rx = bus.subscribe();
            let weak = weak.clone();
            let listener = tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(message) => {
                            let Some(this) = weak.upgrade() else { break };
                            this.handle_bus_message(message);
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("dedup bus: listener lagged, skipped {skipped} messages");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            });

            Self { heartbeats, bus, in_flight, listener }
        })
    }

    fn handle_bus_message(&self, message: BusMessage) {
        match message {
            BusMessage::TaskHeartbeat { key, owner_id, timestamp_ms } => {
                self.heartbeats.observe(&key, owner_id, timestamp_ms);
            }
            BusMessage::TaskEnd { key } => {
                // No effect on any pending local wait; timeouts alone
                // govern abandonment.
                self.heartbeats.forget(&key);
            }
            BusMessage::ResponseReady { key, response } => {
                if let Some(sender) = self.in_flight.lock().unwrap().get(&key) {
                    let _ = sender.send(DedupOutcome::Ready(response));
                }
            }
        }
    }

    pub fn dispose(&self) {
        self.heartbeats.dispose();
        self.listener.abort();
    }

    /// Run `fetcher` for `key`, or await a peer already running it.
    /// `timeout_ms` of zero means "no timeout" is not supported; the
    /// caller always bounds the wait (the default bound is 10000ms).
    pub async fn dedupe<F, Fut>(
        &self,
        key: &str,
        fetcher: F,
        timeout_ms: u64,
    ) -> Result<StoredResponse>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<StoredResponse>>,
    {
        if let Some(receiver) = self.existing_receiver(key) {
            debug!("dedup: joining in-flight fetch for {key}");
            return self.await_outcome(key, receiver, timeout_ms).await;
        }

        let peer_already_fetching = self.heartbeats.is_owner_alive(key);
        let (sender, receiver) = broadcast::channel(1);
        self.in_flight.lock().unwrap().insert(key.to_string(), sender.clone());

        if peer_already_fetching {
            debug!("dedup: peer already fetching {key}, waiting");
            let outcome = self.await_outcome(key, receiver, timeout_ms).await;
            self.in_flight.lock().unwrap().remove(key);
            return outcome;
        }

        self.heartbeats.start_heartbeat(key);
        let result = fetcher().await;
        self.heartbeats.end_heartbeat(key);
        self.in_flight.lock().unwrap().remove(key);

        match result {
            Ok(response) => {
                self.bus.publish(BusMessage::ResponseReady {
                    key: key.to_string(),
                    response: response.clone(),
                });
                let _ = sender.send(DedupOutcome::Ready(response.clone()));
                Ok(response)
            }
            Err(error) => {
                let _ = sender.send(DedupOutcome::Failed(error.to_string()));
                Err(error)
            }
        }
    }

    fn existing_receiver(&self, key: &str) -> Option<broadcast::Receiver<DedupOutcome>> {
        self.in_flight.lock().unwrap().get(key).map(|s| s.subscribe())
    }

    /// Wait on `receiver` up to `timeout_ms`; if it elapses while a peer
    /// is still observably alive, keep waiting rather than fail.
    async fn await_outcome(
        &self,
        key: &str,
        mut receiver: broadcast::Receiver<DedupOutcome>,
        timeout_ms: u64,
    ) -> Result<StoredResponse> {
        let mut remaining = Duration::from_millis(timeout_ms);
        loop {
            let recv = receiver.recv();
            tokio::select! {
                outcome = recv => {
                    return match outcome {
                        Ok(DedupOutcome::Ready(response)) => Ok(response),
                        Ok(DedupOutcome::Failed(message)) => {
                            Err(EngineError::NetworkFailure(message))
                        }
                        Err(_) => Err(EngineError::DedupTimeout(key.to_string())),
                    };
                }
                _ = sleep(remaining) => {
                    if self.heartbeats.is_owner_alive(key) {
                        remaining = Duration::from_millis(HEARTBEAT_INTERVAL_MS);
                        continue;
                    }
                    return Err(EngineError::DedupTimeout(key.to_string()));
                }
            }
        }
    }
}
