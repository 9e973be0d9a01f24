//! The Policy Sync Client: keeps a [`crate::policy::PolicyStore`]
//! current from a remote source, preferring a persistent stream and
//! falling back to polling while disconnected.

use std::sync::Arc;

use log::{debug, info, warn};
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Duration};

use crate::error::{EngineError, Result};
use crate::policy::CachePolicy;

const INITIAL_BACKOFF_MS: u64 = 1000;
const MAX_BACKOFF_MS: u64 = 30_000;

/// A half-open stream of raw policy messages from a persistent transport.
#[async_trait::async_trait]
pub trait PolicyStream: Send {
    /// Next message, or `None` once the stream has closed.
    async fn recv(&mut self) -> Option<Result<String>>;
}

/// Opens a [`PolicyStream`], e.g. a WebSocket connection.
#[async_trait::async_trait]
pub trait PolicySource: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn PolicyStream>>;
}

/// A single-shot fallback fetch, used while the stream transport is down.
#[async_trait::async_trait]
pub trait PolicyPoller: Send + Sync {
    async fn poll(&self) -> Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closed,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    data: serde_json::Value,
}

/// Drives reconnect/backoff over a streaming [`PolicySource`], with an
/// optional [`PolicyPoller`] fallback while disconnected.
pub struct SyncClient {
    source: Option<Arc<dyn PolicySource>>,
    poller: Option<Arc<dyn PolicyPoller>>,
    poll_interval_ms: u64,
    on_receive: Arc<dyn Fn(CachePolicy) + Send + Sync>,
    state: Mutex<ConnectionState>,
    last_seen: Mutex<Option<String>>,
}

impl SyncClient {
    pub fn new(
        source: Option<Arc<dyn PolicySource>>,
        poller: Option<Arc<dyn PolicyPoller>>,
        poll_interval_ms: u64,
        on_receive: Arc<dyn Fn(CachePolicy) + Send + Sync>,
    ) -> Arc<Self> {
        Arc::new(Self {
            source,
            poller,
            poll_interval_ms,
            on_receive,
            state: Mutex::new(ConnectionState::Idle),
            last_seen: Mutex::new(None),
        })
    }

    /// Run the reconnect loop and the poll loop concurrently until
    /// cancelled. Intended to be spawned and aborted on
    /// [`crate::context::EngineContext`] teardown; a single `JoinHandle`
    /// covers both.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let me = Arc::clone(self);
        tokio::spawn(async move {
            tokio::join!(Arc::clone(&me).run(), me.poll_loop());
        })
    }

    async fn run(self: Arc<Self>) {
        let Some(source) = self.source.clone() else {
            // No stream source: `state` stays `Idle` forever, so the poll
            // loop running alongside polls unconditionally.
            return;
        };

        let mut backoff_ms = INITIAL_BACKOFF_MS;
        loop {
            *self.state.lock().await = ConnectionState::Connecting;
            match source.connect().await {
                Ok(mut stream) => {
                    info!("policy sync: stream connected");
                    *self.state.lock().await = ConnectionState::Open;
                    backoff_ms = INITIAL_BACKOFF_MS;

                    while let Some(message) = stream.recv().await {
                        match message {
                            Ok(text) => self.handle_stream_message(&text).await,
                            Err(e) => {
                                warn!("policy sync: stream error, reconnecting: {e}");
                                break;
                            }
                        }
                    }
                }
                Err(e) => warn!("policy sync: connect failed: {e}"),
            }

            *self.state.lock().await = ConnectionState::Closed;
            debug!("policy sync: backing off {backoff_ms}ms before reconnect");
            sleep(Duration::from_millis(backoff_ms)).await;
            backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
        }
    }

    /// Poll on a fixed interval whenever the stream isn't `Open` — skipped
    /// while currently connected or when no poll URL is configured, per
    /// the stream-preferred-with-poll-fallback design.
    async fn poll_loop(self: Arc<Self>) {
        let Some(poller) = self.poller.clone() else { return };
        let mut ticker = interval(Duration::from_millis(self.poll_interval_ms));
        loop {
            ticker.tick().await;
            if *self.state.lock().await == ConnectionState::Open {
                continue;
            }
            match poller.poll().await {
                Ok(text) => self.handle_poll_message(&text).await,
                Err(e) => warn!("policy sync: poll failed: {e}"),
            }
        }
    }

    /// Parse an enveloped stream message (`{"type":"CACHE_CONFIG","data":
    /// <CachePolicy>}`).
    async fn handle_stream_message(&self, text: &str) {
        let envelope: Envelope = match serde_json::from_str(text) {
            Ok(e) => e,
            Err(e) => {
                warn!("policy sync: malformed message, ignoring: {e}");
                return;
            }
        };
        if envelope.kind != "CACHE_CONFIG" {
            debug!("policy sync: ignoring unrecognized message type {}", envelope.kind);
            return;
        }
        let policy: CachePolicy = match serde_json::from_value(envelope.data) {
            Ok(p) => p,
            Err(e) => {
                warn!("policy sync: invalid CACHE_CONFIG payload, ignoring: {e}");
                return;
            }
        };
        self.apply_policy(policy).await;
    }

    /// Parse a bare `CachePolicy` poll response — the HTTP fallback's wire
    /// format carries no envelope, unlike the stream transport.
    async fn handle_poll_message(&self, text: &str) {
        let policy: CachePolicy = match serde_json::from_str(text) {
            Ok(p) => p,
            Err(e) => {
                warn!("policy sync: invalid poll payload, ignoring: {e}");
                return;
            }
        };
        self.apply_policy(policy).await;
    }

    /// Compare against the last-seen policy and forward to `on_receive`
    /// only on change. Dedup lives here deliberately — the store itself
    /// fires `on_set` unconditionally.
    async fn apply_policy(&self, policy: CachePolicy) {
        let canonical = match serde_json::to_string(&policy) {
            Ok(s) => s,
            Err(e) => {
                warn!("policy sync: failed to canonicalize policy: {e}");
                return;
            }
        };

        let mut last_seen = self.last_seen.lock().await;
        if last_seen.as_deref() == Some(canonical.as_str()) {
            debug!("policy sync: unchanged policy, suppressing");
            return;
        }
        *last_seen = Some(canonical);
        drop(last_seen);

        (self.on_receive)(policy);
    }
}
