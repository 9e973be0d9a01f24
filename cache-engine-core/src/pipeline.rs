//! The Request Pipeline: `resolve -> key -> lookup -> serve-cached | fetch`,
//! wired to the Policy Store, Response Cache Manager, and the
//! deduplication layer.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, warn};

use crate::cache_manager::{check_freshness, delete_stale_entries, Freshness, ResponseCacheManager, StoredResponse};
use crate::debounce::Debouncer;
use crate::dedup::{DedupLayer, DEFAULT_DEDUP_TIMEOUT_MS};
use crate::error::Result;
use crate::key::build_cache_key;
use crate::policy::{CachePolicy, PolicyPersistence, PolicyStore, PrefetchMode};
use crate::request::InterceptedRequest;

pub const WARMUP_DEBOUNCE_MS: u64 = 500;

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Performs the actual upstream request. The pipeline never speaks HTTP
/// itself; a host wires in whatever client it already uses.
#[async_trait::async_trait]
pub trait Fetcher: Send + Sync + 'static {
    async fn fetch(&self, request: &InterceptedRequest) -> Result<StoredResponse>;
}

/// Wires the Policy Store, Response Cache Manager, and dedup layer into
/// the `resolve -> key -> lookup -> serve-cached | fetch` pipeline, and
/// drives stale-sweep-then-warm-up on policy updates.
pub struct RequestPipeline<P: PolicyPersistence, M: ResponseCacheManager, F: Fetcher> {
    policy_store: Arc<PolicyStore<P>>,
    cache_manager: Arc<M>,
    dedup: Arc<DedupLayer>,
    fetcher: Arc<F>,
    ignore_origins: Vec<String>,
    warmup_debouncer: Debouncer<()>,
}

impl<P: PolicyPersistence, M: ResponseCacheManager, F: Fetcher> RequestPipeline<P, M, F> {
    pub fn new(
        policy_store: Arc<PolicyStore<P>>,
        cache_manager: Arc<M>,
        dedup: Arc<DedupLayer>,
        fetcher: Arc<F>,
        ignore_origins: Vec<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            policy_store,
            cache_manager,
            dedup,
            fetcher,
            ignore_origins,
            warmup_debouncer: Debouncer::new(WARMUP_DEBOUNCE_MS),
        })
    }

    /// Handle one intercepted request, consulting policy, cache, and dedup
    /// in turn. Bypassed requests (no policy coverage) pass straight
    /// through to the fetcher with no cache interaction.
    pub async fn handle(&self, request: &InterceptedRequest) -> Result<StoredResponse> {
        let Some(settings) = self.policy_store.resolve_request_settings(request, &self.ignore_origins) else {
            debug!("pipeline: bypass for {} {}", request.method, request.url);
            return self.fetcher.fetch(request).await;
        };

        let key = build_cache_key(request, &settings.key_headers)?;

        if let Some(stored) = self.cache_manager.get(&key).await? {
            match stored.timestamp() {
                None => {
                    warn!("pipeline: corrupt entry at {key}, discarding");
                    let _ = self.cache_manager.delete(&key).await;
                }
                Some(timestamp) => {
                    if check_freshness(timestamp, &settings, now_ms()) == Freshness::Fresh {
                        debug!("pipeline: cache hit for {key}");
                        return Ok(stored);
                    }
                    debug!("pipeline: stale entry for {key}, refetching");
                }
            }
        }

        let fetcher = self.fetcher.clone();
        let request_owned = request.clone();
        let response = self
            .dedup
            .dedupe(
                key.as_str(),
                move || async move { fetcher.fetch(&request_owned).await },
                DEFAULT_DEDUP_TIMEOUT_MS,
            )
            .await?;

        if response.is_success() {
            let mut stamped = response.clone();
            stamped.stamp(now_ms());
            if let Err(e) = self.cache_manager.put(&key, stamped).await {
                warn!("pipeline: failed storing {key}: {e}");
            }
        } else {
            debug!("pipeline: not caching non-2xx ({}) response for {key}", response.status);
        }

        Ok(response)
    }

    /// Stale-sweep then warm-up, in that order: a narrowed policy must
    /// evict before prefetch can repopulate under it. Warm-up itself is
    /// debounced so a burst of policy updates coalesces into one sweep.
    pub async fn on_policy_update(self: &Arc<Self>, policy: CachePolicy) {
        if let Err(e) = delete_stale_entries(&*self.cache_manager, Some(&policy), now_ms()).await {
            warn!("pipeline: stale sweep failed: {e}");
        }
        self.warm_up(policy, &[PrefetchMode::Always, PrefetchMode::OnUpdate]).await;
    }

    /// Run the `on-load` warm-up sweep for the currently active policy.
    pub async fn on_load(self: &Arc<Self>, policy: CachePolicy) {
        self.warm_up(policy, &[PrefetchMode::Always, PrefetchMode::OnLoad]).await;
    }

    async fn warm_up(self: &Arc<Self>, policy: CachePolicy, modes: &[PrefetchMode]) {
        let requests = policy.prefetch_requests(modes);
        if requests.is_empty() {
            return;
        }
        let me = Arc::clone(self);
        self.warmup_debouncer
            .schedule(move || async move {
                for request in &requests {
                    if let Err(e) = me.handle(request).await {
                        warn!("pipeline: warm-up fetch failed for {}: {e}", request.url);
                    }
                }
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Bus;
    use crate::managers::moka::MokaResponseManager;
    use crate::persistence::InMemoryPolicyPersistence;
    use crate::policy::{CacheSettings, CachePolicy, EndpointNode, HostNode, MethodMap};
    use std::collections::{BTreeMap, HashMap};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use url::Url;

    struct CountingFetcher(AtomicUsize);

    #[async_trait::async_trait]
    impl Fetcher for CountingFetcher {
        async fn fetch(&self, _request: &InterceptedRequest) -> Result<StoredResponse> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(StoredResponse { status: 200, headers: BTreeMap::new(), body: b"body".to_vec() })
        }
    }

    struct FixedStatusFetcher {
        status: u16,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Fetcher for FixedStatusFetcher {
        async fn fetch(&self, _request: &InterceptedRequest) -> Result<StoredResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(StoredResponse { status: self.status, headers: BTreeMap::new(), body: b"body".to_vec() })
        }
    }

    fn policy_with_ttl(ttl_ms: i64) -> CachePolicy {
        let mut methods = MethodMap::new();
        methods.insert(
            "GET".into(),
            CacheSettings { ttl: Some(ttl_ms), ..Default::default() },
        );
        let mut endpoints = HashMap::new();
        endpoints.insert("users".to_string(), EndpointNode { settings: CacheSettings::default(), methods });
        let mut hosts = HashMap::new();
        hosts.insert(
            "https://api.example.com".to_string(),
            HostNode { settings: CacheSettings::default(), endpoints },
        );
        CachePolicy { settings: CacheSettings::default(), hosts, config_ttl: None }
    }

    #[tokio::test]
    async fn second_request_is_served_from_cache() {
        let policy_store = PolicyStore::new(
            InMemoryPolicyPersistence::default(),
            Arc::new(|_| {}),
            Arc::new(|| {}),
        );
        policy_store.set(Some(policy_with_ttl(60_000))).await;

        let fetcher = Arc::new(CountingFetcher(AtomicUsize::new(0)));
        let pipeline = RequestPipeline::new(
            policy_store,
            Arc::new(MokaResponseManager::default()),
            DedupLayer::new(Bus::default()),
            fetcher.clone(),
            Vec::new(),
        );

        let request = InterceptedRequest::new("GET", Url::parse("https://api.example.com/users").unwrap());
        pipeline.handle(&request).await.unwrap();
        pipeline.handle(&request).await.unwrap();

        assert_eq!(fetcher.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn bypass_request_never_touches_cache() {
        let policy_store = PolicyStore::new(
            InMemoryPolicyPersistence::default(),
            Arc::new(|_| {}),
            Arc::new(|| {}),
        );

        let fetcher = Arc::new(CountingFetcher(AtomicUsize::new(0)));
        let pipeline = RequestPipeline::new(
            policy_store,
            Arc::new(MokaResponseManager::default()),
            DedupLayer::new(Bus::default()),
            fetcher.clone(),
            Vec::new(),
        );

        let request = InterceptedRequest::new("GET", Url::parse("https://api.example.com/users").unwrap());
        pipeline.handle(&request).await.unwrap();
        pipeline.handle(&request).await.unwrap();

        assert_eq!(fetcher.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_2xx_response_is_returned_but_not_stored() {
        let policy_store = PolicyStore::new(
            InMemoryPolicyPersistence::default(),
            Arc::new(|_| {}),
            Arc::new(|| {}),
        );
        policy_store.set(Some(policy_with_ttl(60_000))).await;

        let fetcher = Arc::new(FixedStatusFetcher { status: 404, calls: AtomicUsize::new(0) });
        let pipeline = RequestPipeline::new(
            policy_store,
            Arc::new(MokaResponseManager::default()),
            DedupLayer::new(Bus::default()),
            fetcher.clone(),
            Vec::new(),
        );

        let request = InterceptedRequest::new("GET", Url::parse("https://api.example.com/users").unwrap());
        let first = pipeline.handle(&request).await.unwrap();
        assert_eq!(first.status, 404);

        let second = pipeline.handle(&request).await.unwrap();
        assert_eq!(second.status, 404);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }
}
