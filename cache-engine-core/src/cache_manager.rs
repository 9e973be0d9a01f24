//! The Response Cache Manager: content-storage operations on
//! top of a keyed blob store, plus the freshness decision.

use std::collections::BTreeMap;

use log::warn;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::Result;
use crate::key::revert_cache_key;
use crate::policy::{CachePolicy, MergedSettings};
use crate::request::InterceptedRequest;

/// The engine-managed header carrying the insertion time.
pub const X_CACHE_TIMESTAMP: &str = "x-cache-timestamp";

/// A stored response, as put into / read out of the blob store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl StoredResponse {
    /// Parse the `x-cache-timestamp` header. `None` means the entry is
    /// corrupt and must be deleted on sight.
    pub fn timestamp(&self) -> Option<i64> {
        self.headers.get(X_CACHE_TIMESTAMP).and_then(|v| v.parse().ok())
    }

    pub fn stamp(&mut self, now_ms: i64) {
        self.headers.insert(X_CACHE_TIMESTAMP.to_string(), now_ms.to_string());
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Thin ownership layer over a named blob store holding
/// `(Cache Key, StoredResponse)` pairs.
#[async_trait::async_trait]
pub trait ResponseCacheManager: Send + Sync + 'static {
    async fn put(&self, key: &Url, response: StoredResponse) -> Result<()>;
    async fn get(&self, key: &Url) -> Result<Option<StoredResponse>>;
    async fn delete(&self, key: &Url) -> Result<()>;
    /// All stored keys. Best-effort: the result may already be stale by
    /// the time the caller acts on it.
    async fn keys(&self) -> Result<Vec<Url>>;

    /// Enumerate all stored keys and delete each.
    async fn clear(&self) -> Result<()> {
        for key in self.keys().await? {
            if let Err(e) = self.delete(&key).await {
                warn!("response cache: failed clearing {key}: {e}");
            }
        }
        Ok(())
    }
}

/// The outcome of a freshness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Stale,
    /// No settings applicable to this entry; treat as bypass (no cache
    /// usage).
    Bypass,
}

/// Apply the freshness rule: `last_modified` wins over `ttl` when both are
/// present.
pub fn check_freshness(
    stored_at_ms: i64,
    settings: &MergedSettings,
    now_ms: i64,
) -> Freshness {
    if let Some(last_modified) = settings.last_modified {
        if stored_at_ms >= last_modified {
            Freshness::Fresh
        } else {
            Freshness::Stale
        }
    } else if let Some(ttl) = settings.ttl {
        if stored_at_ms + ttl > now_ms {
            Freshness::Fresh
        } else {
            Freshness::Stale
        }
    } else {
        Freshness::Bypass
    }
}

/// Reconstruct the original request a stored key was derived from, well
/// enough to resolve its policy again.
fn revert_to_request(key: &Url) -> Option<InterceptedRequest> {
    let method = crate::key::revert_cache_key_method(key).unwrap_or_else(|| "GET".to_string());
    let url = revert_cache_key(key).ok()?;
    Some(InterceptedRequest::new(method, url))
}

/// Sweep every stored entry, deleting whatever is stale under the current
/// policy or structurally corrupt (missing its timestamp header). Tolerates
/// entries disappearing mid-sweep.
pub async fn delete_stale_entries(
    manager: &dyn ResponseCacheManager,
    policy: Option<&CachePolicy>,
    now_ms: i64,
) -> Result<()> {
    for key in manager.keys().await? {
        let Some(stored) = manager.get(&key).await? else { continue };

        let Some(timestamp) = stored.timestamp() else {
            warn!("response cache: corrupt entry at {key} missing x-cache-timestamp, deleting");
            let _ = manager.delete(&key).await;
            continue;
        };

        let Some(original_request) = revert_to_request(&key) else {
            continue;
        };

        let settings = policy.and_then(|p| p.resolve_request_settings(&original_request, &[]));
        let stale = match settings {
            Some(settings) => {
                matches!(check_freshness(timestamp, &settings, now_ms), Freshness::Stale)
            }
            // No policy covers this entry any more: treat as stale so a
            // policy reset/narrowing purges it.
            None => true,
        };

        if stale {
            let _ = manager.delete(&key).await;
        }
    }
    Ok(())
}
