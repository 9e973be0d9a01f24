//! End-to-end scenarios exercising the pieces wired together, mirroring
//! the acceptance scenarios the engine is expected to satisfy.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use cache_engine_core::bus::Bus;
use cache_engine_core::context::EngineContext;
use cache_engine_core::dedup::DedupLayer;
use cache_engine_core::env::EngineEnv;
use cache_engine_core::error::EngineError;
use cache_engine_core::managers::moka::MokaResponseManager;
use cache_engine_core::persistence::InMemoryPolicyPersistence;
use cache_engine_core::pipeline::{Fetcher, RequestPipeline};
use cache_engine_core::policy::{
    CachePolicy, CacheSettings, EndpointNode, HostNode, MethodMap, PolicyStore,
};
use cache_engine_core::request::InterceptedRequest;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::StubFetcher;

const ORIGIN: &str = "https://api.example.com";

fn policy(ttl_ms: Option<i64>, last_modified: Option<i64>) -> CachePolicy {
    let mut methods = MethodMap::new();
    methods.insert(
        "GET".into(),
        CacheSettings { ttl: ttl_ms, last_modified, ..Default::default() },
    );
    let mut endpoints = HashMap::new();
    endpoints.insert("widgets".to_string(), EndpointNode { settings: CacheSettings::default(), methods });
    let mut hosts = HashMap::new();
    hosts.insert(ORIGIN.to_string(), HostNode { settings: CacheSettings::default(), endpoints });
    CachePolicy { settings: CacheSettings::default(), hosts, config_ttl: None }
}

fn request() -> InterceptedRequest {
    InterceptedRequest::new("GET", Url::parse(&format!("{ORIGIN}/widgets")).unwrap())
}

#[tokio::test]
async fn bypass_scenario_never_caches() {
    let store = PolicyStore::new(InMemoryPolicyPersistence::default(), Arc::new(|_| {}), Arc::new(|| {}));
    // No policy set: every request is a bypass.
    let fetcher = Arc::new(StubFetcher::new("hello"));
    let pipeline = RequestPipeline::new(
        store,
        Arc::new(MokaResponseManager::default()),
        DedupLayer::new(Bus::default()),
        fetcher.clone(),
        Vec::new(),
    );

    pipeline.handle(&request()).await.unwrap();
    pipeline.handle(&request()).await.unwrap();

    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn fresh_hit_scenario_serves_from_cache() {
    let store = PolicyStore::new(InMemoryPolicyPersistence::default(), Arc::new(|_| {}), Arc::new(|| {}));
    store.set(Some(policy(Some(60_000), None))).await;

    let fetcher = Arc::new(StubFetcher::new("hello"));
    let pipeline = RequestPipeline::new(
        store,
        Arc::new(MokaResponseManager::default()),
        DedupLayer::new(Bus::default()),
        fetcher.clone(),
        Vec::new(),
    );

    let first = pipeline.handle(&request()).await.unwrap();
    let second = pipeline.handle(&request()).await.unwrap();

    assert_eq!(first.body, second.body);
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn last_modified_bump_forces_eviction() {
    let store = PolicyStore::new(InMemoryPolicyPersistence::default(), Arc::new(|_| {}), Arc::new(|| {}));
    store.set(Some(policy(None, Some(1_000)))).await;

    let fetcher = Arc::new(StubFetcher::new("hello"));
    let manager = Arc::new(MokaResponseManager::default());
    let pipeline = RequestPipeline::new(
        store.clone(),
        manager,
        DedupLayer::new(Bus::default()),
        fetcher.clone(),
        Vec::new(),
    );

    pipeline.handle(&request()).await.unwrap();
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

    // A server-authoritative modification after the entry was cached makes
    // the stored response stale regardless of its age.
    let future_last_modified = now_ms() + 10_000;
    store.set(Some(policy(None, Some(future_last_modified)))).await;

    pipeline.handle(&request()).await.unwrap();
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}

#[tokio::test]
async fn cross_instance_dedup_shares_one_fetch() {
    let bus = Bus::default();
    let layer_a = DedupLayer::new(bus.clone());
    let layer_b = DedupLayer::new(bus);

    let fetcher = Arc::new(StubFetcher::slow("shared", 60));
    let a_fetcher = fetcher.clone();
    let a_layer = layer_a.clone();
    let a = tokio::spawn(async move {
        a_layer
            .dedupe(
                "key",
                move || async move { a_fetcher.fetch(&request()).await },
                2000,
            )
            .await
    });

    tokio::time::sleep(Duration::from_millis(10)).await;
    let b = layer_b
        .dedupe("key", || async { unreachable!("peer should have won") }, 2000)
        .await
        .unwrap();

    let a = a.await.unwrap().unwrap();
    assert_eq!(a.body, b.body);
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn dedup_wait_times_out_once_owner_heartbeat_stops() {
    let bus = Bus::default();
    let layer_a = DedupLayer::new(bus.clone());
    let layer_b = DedupLayer::new(bus);

    let a_layer = layer_a.clone();
    let handle = tokio::spawn(async move {
        let _ = a_layer
            .dedupe(
                "key",
                || async {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    unreachable!("torn down before this resolves")
                },
                5000,
            )
            .await;
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    layer_a.dispose();

    let err = layer_b
        .dedupe("key", || async { unreachable!() }, 1200)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::DedupTimeout(_)));

    handle.abort();
}

#[tokio::test]
async fn engine_context_wiring_serves_cached_responses() {
    let env = EngineEnv::parse(r#"{"cacheName":"scenario"}"#).unwrap();
    let fetcher = Arc::new(StubFetcher::new("wired"));

    let context = EngineContext::install(
        env,
        InMemoryPolicyPersistence::default(),
        MokaResponseManager::default(),
        StubFetcherWrapper(fetcher.clone()),
        Bus::default(),
        None,
        None,
    );
    context.activate().await;

    // No policy installed yet: bypass.
    context.fetch(&request()).await.unwrap();
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

    context.deactivate().await;
}

/// `EngineContext` takes its `Fetcher` by value; wrap the shared stub so
/// the same call counter is observable from the test.
struct StubFetcherWrapper(Arc<StubFetcher>);

#[async_trait::async_trait]
impl cache_engine_core::pipeline::Fetcher for StubFetcherWrapper {
    async fn fetch(
        &self,
        request: &InterceptedRequest,
    ) -> cache_engine_core::error::Result<cache_engine_core::cache_manager::StoredResponse> {
        self.0.fetch(request).await
    }
}

#[tokio::test]
async fn http_poll_fallback_reads_policy_from_server() {
    // The HTTP fallback's wire format is a bare `CachePolicy`, with no
    // `{"type":...}` envelope (that envelope is stream-only).
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/policy"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"{"hosts":{"https://api.example.com":{"settings":{},"endpoints":{}}}}"#,
        ))
        .mount(&server)
        .await;

    let poller = Arc::new(cache_engine_sync_ws::HttpPollPoller::new(
        Url::parse(&format!("{}/policy", server.uri())).unwrap(),
    ));

    let received = Arc::new(std::sync::Mutex::new(None));
    let received2 = received.clone();
    let client = cache_engine_core::sync::SyncClient::new(
        None,
        Some(poller),
        20,
        Arc::new(move |policy: CachePolicy| {
            *received2.lock().unwrap() = Some(policy);
        }),
    );
    let handle = client.spawn();

    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.abort();

    let policy = received.lock().unwrap().clone().expect("poll fallback should have delivered a policy");
    assert!(policy.hosts.contains_key("https://api.example.com"));
}
