//! The Policy Store: hierarchical cache-policy resolution and persistence
//! with time-to-live.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::request::InterceptedRequest;

/// Engine-declared prefetch eligibility for an endpoint+method leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PrefetchMode {
    /// Always eligible for prefetch, regardless of trigger.
    Always,
    /// Eligible only when a tab first loads.
    OnLoad,
    /// Eligible only as part of a policy-update warm-up sweep.
    OnUpdate,
    /// Never prefetched.
    #[default]
    Never,
}

/// A merged leaf of the policy hierarchy. Every field is optional at a
/// single tree level; merging fills gaps from ancestors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Server-authoritative modification time, ms since epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<i64>,
    /// Response freshness window, in ms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,
    /// Request headers whose values participate in the cache key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_headers: Option<Vec<String>>,
    /// Prefetch eligibility.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefetch: Option<PrefetchMode>,
}

impl CacheSettings {
    /// Deep-merge `self` (parent) with `child`, child fields taking
    /// precedence wherever they are set.
    fn merged_with(&self, child: &CacheSettings) -> CacheSettings {
        CacheSettings {
            last_modified: child.last_modified.or(self.last_modified),
            ttl: child.ttl.or(self.ttl),
            key_headers: child
                .key_headers
                .clone()
                .or_else(|| self.key_headers.clone()),
            prefetch: child.prefetch.or(self.prefetch),
        }
    }
}

/// The fully merged settings for one (origin, path, method) triple, ready
/// to drive cache-key construction and freshness checks.
#[derive(Debug, Clone)]
pub struct MergedSettings {
    pub last_modified: Option<i64>,
    pub ttl: Option<i64>,
    pub key_headers: Vec<String>,
    pub prefetch: PrefetchMode,
}

impl From<CacheSettings> for MergedSettings {
    fn from(s: CacheSettings) -> Self {
        MergedSettings {
            last_modified: s.last_modified,
            ttl: s.ttl,
            key_headers: s.key_headers.unwrap_or_default(),
            prefetch: s.prefetch.unwrap_or_default(),
        }
    }
}

/// Uppercased-method leaf of an endpoint node.
pub type MethodMap = HashMap<String, CacheSettings>;

/// One normalized path under a host.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointNode {
    #[serde(default)]
    pub settings: CacheSettings,
    #[serde(default)]
    pub methods: MethodMap,
}

/// One origin in the policy tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostNode {
    #[serde(default)]
    pub settings: CacheSettings,
    #[serde(default)]
    pub endpoints: HashMap<String, EndpointNode>,
}

/// The full four-level policy tree delivered by the server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CachePolicy {
    #[serde(default)]
    pub settings: CacheSettings,
    #[serde(default)]
    pub hosts: HashMap<String, HostNode>,
    /// After this many ms a persisted copy is considered expired.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_ttl: Option<i64>,
}

/// Strip a single leading and single trailing slash so policy-tree keys and
/// lookup paths use the same normalization.
pub fn normalize_path(path: &str) -> &str {
    let stripped = path.strip_prefix('/').unwrap_or(path);
    stripped.strip_suffix('/').unwrap_or(stripped)
}

impl CachePolicy {
    /// Resolve the merged settings for a request, or `None` on bypass:
    /// ignored origin, unknown host, unknown path, or a merged result with
    /// neither `ttl` nor `last_modified` set — at least one of the two must
    /// be present for a response to be eligible for caching.
    pub fn resolve_request_settings(
        &self,
        request: &InterceptedRequest,
        ignore_origins: &[String],
    ) -> Option<MergedSettings> {
        let origin = request.origin();
        if ignore_origins.iter().any(|o| o == &origin) {
            return None;
        }
        let host = self.hosts.get(&origin)?;
        let merged_host = self.settings.merged_with(&host.settings);

        let path = normalize_path(request.url.path());
        let endpoint = host.endpoints.get(path)?;
        let merged_endpoint = merged_host.merged_with(&endpoint.settings);

        let method = request.method.to_ascii_uppercase();
        let leaf = endpoint.methods.get(&method)?;
        let merged: MergedSettings = merged_endpoint.merged_with(leaf).into();

        if merged.ttl.is_none() && merged.last_modified.is_none() {
            return None;
        }
        Some(merged)
    }

    /// Enumerate every (origin, path, method) triple declared anywhere in
    /// the tree, resolve its merged settings, and return the synthetic
    /// requests whose prefetch mode is in `mode_set`.
    pub fn prefetch_requests(
        &self,
        mode_set: &[PrefetchMode],
    ) -> Vec<InterceptedRequest> {
        let mut out = Vec::new();
        for (origin, host) in &self.hosts {
            for (path, endpoint) in &host.endpoints {
                for method in endpoint.methods.keys() {
                    let Ok(req) =
                        InterceptedRequest::synthetic(origin, path, method)
                    else {
                        continue;
                    };
                    if let Some(settings) =
                        self.resolve_request_settings(&req, &[])
                    {
                        if mode_set.contains(&settings.prefetch) {
                            out.push(req);
                        }
                    }
                }
            }
        }
        out
    }
}

/// A persisted policy record: the policy plus the time it was saved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedPolicy {
    pub policy: CachePolicy,
    pub saved_at_ms: i64,
}

/// Durable single-row storage for the active policy (conventionally the
/// `api-cache-config`/`config`/`latest` triple). Any backend offering
/// atomic put-or-replace on one key can implement this.
#[async_trait::async_trait]
pub trait PolicyPersistence: Send + Sync + 'static {
    async fn load(&self) -> Result<Option<PersistedPolicy>>;
    async fn save(&self, record: &PersistedPolicy) -> Result<()>;
    async fn clear(&self) -> Result<()>;
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Callback fired after every `set` call. The store fires unconditionally
/// per call; dedup against repeated identical payloads happens upstream
/// in the sync client.
pub type OnSet = Arc<dyn Fn(Option<&CachePolicy>) + Send + Sync>;
/// Callback fired when the policy is reset to `None`.
pub type OnReset = Arc<dyn Fn() + Send + Sync>;

struct Inner {
    policy: Option<CachePolicy>,
    cleanup: Option<JoinHandle<()>>,
}

/// Owns the currently active policy and its persisted copy.
pub struct PolicyStore<P: PolicyPersistence> {
    persistence: P,
    inner: Mutex<Inner>,
    on_set: OnSet,
    on_reset: OnReset,
    reset_notify: Arc<Notify>,
}

impl<P: PolicyPersistence> PolicyStore<P> {
    pub fn new(persistence: P, on_set: OnSet, on_reset: OnReset) -> Arc<Self> {
        Arc::new(Self {
            persistence,
            inner: Mutex::new(Inner { policy: None, cleanup: None }),
            on_set,
            on_reset,
            reset_notify: Arc::new(Notify::new()),
        })
    }

    /// The currently active policy, if any.
    pub fn current(&self) -> Option<CachePolicy> {
        self.inner.lock().unwrap().policy.clone()
    }

    /// Replace the current policy. Persists (if `config_ttl > 0`) and
    /// schedules the TTL cleanup timer; fires `on_set` unconditionally.
    pub async fn set(self: &Arc<Self>, policy: Option<CachePolicy>) {
        {
            let mut guard = self.inner.lock().unwrap();
            if let Some(handle) = guard.cleanup.take() {
                handle.abort();
            }
            guard.policy = policy.clone();
        }

        match &policy {
            Some(p) if p.config_ttl.unwrap_or(0) > 0 => {
                let record = PersistedPolicy { policy: p.clone(), saved_at_ms: now_ms() };
                if let Err(e) = self.persistence.save(&record).await {
                    warn!("policy store: persistence failure on set: {e}");
                }
                self.schedule_cleanup(p.config_ttl.unwrap() as u64);
            }
            Some(_) => {
                if let Err(e) = self.persistence.clear().await {
                    warn!("policy store: persistence failure clearing unsaved policy: {e}");
                }
            }
            None => {
                if let Err(e) = self.persistence.clear().await {
                    warn!("policy store: persistence failure on reset: {e}");
                }
            }
        }

        (self.on_set)(policy.as_ref());
        if policy.is_none() {
            (self.on_reset)();
            self.reset_notify.notify_waiters();
        }
    }

    /// `set(None)`.
    pub async fn reset(self: &Arc<Self>) {
        self.set(None).await;
    }

    fn schedule_cleanup(self: &Arc<Self>, ttl_ms: u64) {
        let me = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ttl_ms)).await;
            me.reset().await;
        });
        self.inner.lock().unwrap().cleanup = Some(handle);
    }

    /// Adopt a persisted record if it is still within `config_ttl`,
    /// scheduling cleanup for the remaining window; otherwise clear it.
    /// An expired persisted policy is never returned.
    pub async fn load_from_persistence_if_valid(self: &Arc<Self>) -> Result<()> {
        let Some(record) = self.persistence.load().await? else {
            return Ok(());
        };
        let ttl = record.policy.config_ttl.unwrap_or(0);
        let age = now_ms() - record.saved_at_ms;
        if ttl > 0 && age < ttl {
            {
                let mut guard = self.inner.lock().unwrap();
                guard.policy = Some(record.policy.clone());
            }
            (self.on_set)(Some(&record.policy));
            self.schedule_cleanup((ttl - age).max(0) as u64);
        } else {
            self.persistence.clear().await?;
        }
        Ok(())
    }

    pub fn resolve_request_settings(
        &self,
        request: &InterceptedRequest,
        ignore_origins: &[String],
    ) -> Option<MergedSettings> {
        self.current()?.resolve_request_settings(request, ignore_origins)
    }

    pub fn prefetch_requests(
        &self,
        mode_set: &[PrefetchMode],
    ) -> Vec<InterceptedRequest> {
        match self.current() {
            Some(p) => p.prefetch_requests(mode_set),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(ttl: Option<i64>, lm: Option<i64>) -> CacheSettings {
        CacheSettings { ttl, last_modified: lm, key_headers: None, prefetch: None }
    }

    #[test]
    fn normalize_strips_one_leading_and_trailing_slash() {
        assert_eq!(normalize_path("/users/"), "users");
        assert_eq!(normalize_path("users"), "users");
        assert_eq!(normalize_path("/users"), "users");
        assert_eq!(normalize_path("//users//"), "/users/");
    }

    #[test]
    fn resolution_merges_top_down_with_child_precedence() {
        let mut methods = MethodMap::new();
        methods.insert("GET".into(), leaf(Some(60_000), None));
        let mut endpoints = HashMap::new();
        endpoints.insert(
            "users".to_string(),
            EndpointNode { settings: CacheSettings::default(), methods },
        );
        let mut hosts = HashMap::new();
        hosts.insert(
            "https://api.example.com".to_string(),
            HostNode {
                settings: CacheSettings {
                    key_headers: Some(vec!["authorization".into()]),
                    ..Default::default()
                },
                endpoints,
            },
        );
        let policy = CachePolicy { settings: CacheSettings::default(), hosts, config_ttl: None };

        let req = InterceptedRequest::synthetic(
            "https://api.example.com",
            "users",
            "GET",
        )
        .unwrap();
        let merged = policy.resolve_request_settings(&req, &[]).unwrap();
        assert_eq!(merged.ttl, Some(60_000));
        assert_eq!(merged.key_headers, vec!["authorization".to_string()]);
    }

    #[test]
    fn no_ttl_or_last_modified_is_bypass() {
        let mut methods = MethodMap::new();
        methods.insert("GET".into(), leaf(None, None));
        let mut endpoints = HashMap::new();
        endpoints.insert(
            "users".to_string(),
            EndpointNode { settings: CacheSettings::default(), methods },
        );
        let mut hosts = HashMap::new();
        hosts.insert(
            "https://api.example.com".to_string(),
            HostNode { settings: CacheSettings::default(), endpoints },
        );
        let policy = CachePolicy { settings: CacheSettings::default(), hosts, config_ttl: None };
        let req = InterceptedRequest::synthetic(
            "https://api.example.com",
            "users",
            "GET",
        )
        .unwrap();
        assert!(policy.resolve_request_settings(&req, &[]).is_none());
    }

    #[test]
    fn ignored_origin_is_bypass() {
        let policy = CachePolicy::default();
        let req = InterceptedRequest::synthetic(
            "https://dev.example",
            "x",
            "GET",
        )
        .unwrap();
        assert!(policy
            .resolve_request_settings(
                &req,
                &["https://dev.example".to_string()]
            )
            .is_none());
    }
}
