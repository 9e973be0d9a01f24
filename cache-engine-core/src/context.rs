//! [`EngineContext`]: the object a host actually holds — threaded context
//! instead of a module-level singleton, so a process can run more than
//! one independently-configured engine. Owns the wiring between the
//! Policy Store, Response Cache Manager, sync client, and dedup layer,
//! and exposes the `install`/`activate`/`fetch`/`deactivate` lifecycle.

use std::sync::{Arc, Mutex, Weak};

use log::warn;
use tokio::task::JoinHandle;

use crate::bus::Bus;
use crate::cache_manager::{ResponseCacheManager, StoredResponse};
use crate::dedup::DedupLayer;
use crate::env::EngineEnv;
use crate::error::Result;
use crate::noop::NoopEngine;
use crate::pipeline::{Fetcher, RequestPipeline};
use crate::policy::{CachePolicy, OnReset, OnSet, PolicyPersistence, PolicyStore};
use crate::request::InterceptedRequest;
use crate::sync::{PolicyPoller, PolicySource, SyncClient};

/// Owns one complete instance of the engine: a policy store, a response
/// cache, a sync client (if configured with a transport), and a
/// deduplication layer sharing a bus with any other instance constructed
/// against the same [`Bus`].
pub struct EngineContext<P: PolicyPersistence, M: ResponseCacheManager, F: Fetcher> {
    env: EngineEnv,
    policy_store: Arc<PolicyStore<P>>,
    pipeline: Arc<RequestPipeline<P, M, F>>,
    dedup: Arc<DedupLayer>,
    sync_client: Option<Arc<SyncClient>>,
    sync_handle: Mutex<Option<JoinHandle<()>>>,
}

impl<P: PolicyPersistence, M: ResponseCacheManager, F: Fetcher> EngineContext<P, M, F> {
    /// Wire up one instance. `bus` is shared across every `EngineContext`
    /// meant to coordinate dedup with one another; pass a fresh [`Bus`]
    /// for an isolated instance.
    #[allow(clippy::too_many_arguments)]
    pub fn install(
        env: EngineEnv,
        persistence: P,
        cache_manager: M,
        fetcher: F,
        bus: Bus,
        source: Option<Arc<dyn PolicySource>>,
        poller: Option<Arc<dyn PolicyPoller>>,
    ) -> Arc<Self> {
        let pipeline_cell: Arc<Mutex<Option<Weak<RequestPipeline<P, M, F>>>>> =
            Arc::new(Mutex::new(None));

        let cell_for_on_set = pipeline_cell.clone();
        let on_set: OnSet = Arc::new(move |policy: Option<&CachePolicy>| {
            let Some(policy) = policy.cloned() else { return };
            let cell = cell_for_on_set.clone();
            tokio::spawn(async move {
                let weak = cell.lock().unwrap().clone();
                if let Some(pipeline) = weak.and_then(|w| w.upgrade()) {
                    pipeline.on_policy_update(policy).await;
                }
            });
        });
        let on_reset: OnReset = Arc::new(|| {});

        let policy_store = PolicyStore::new(persistence, on_set, on_reset);
        let dedup = DedupLayer::new(bus);
        let pipeline = RequestPipeline::new(
            policy_store.clone(),
            Arc::new(cache_manager),
            dedup.clone(),
            Arc::new(fetcher),
            env.ignore_origins.clone(),
        );
        *pipeline_cell.lock().unwrap() = Some(Arc::downgrade(&pipeline));

        let on_receive_store = policy_store.clone();
        let on_receive: Arc<dyn Fn(CachePolicy) + Send + Sync> = Arc::new(move |policy| {
            let store = on_receive_store.clone();
            tokio::spawn(async move { store.set(Some(policy)).await });
        });

        let has_transport = source.is_some() || poller.is_some();
        let poll_interval_ms = env.fallback_polling_interval_ms;
        let sync_client = has_transport
            .then(move || SyncClient::new(source, poller, poll_interval_ms, on_receive));

        Arc::new(Self {
            env,
            policy_store,
            pipeline,
            dedup,
            sync_client,
            sync_handle: Mutex::new(None),
        })
    }

    /// Adopt any still-valid persisted policy, start the sync client, and
    /// run the `on-load` warm-up sweep.
    pub async fn activate(self: &Arc<Self>) {
        if let Err(e) = self.policy_store.load_from_persistence_if_valid().await {
            warn!("engine[{}]: failed loading persisted policy: {e}", self.env.cache_name);
        }
        if let Some(sync_client) = &self.sync_client {
            *self.sync_handle.lock().unwrap() = Some(sync_client.spawn());
        }
        if let Some(policy) = self.policy_store.current() {
            self.pipeline.on_load(policy).await;
        }
    }

    /// Run one request through the pipeline.
    pub async fn fetch(&self, request: &InterceptedRequest) -> Result<StoredResponse> {
        self.pipeline.handle(request).await
    }

    /// Tear down this instance's background tasks. Does not affect peers
    /// sharing the same [`Bus`].
    pub async fn deactivate(&self) {
        if let Some(handle) = self.sync_handle.lock().unwrap().take() {
            handle.abort();
        }
        self.dedup.dispose();
    }
}

/// What a host gets back from [`install_env`]: a fully wired engine, or an
/// inert bypass engine when required configuration was missing.
pub enum EngineHandle<P: PolicyPersistence, M: ResponseCacheManager, F: Fetcher> {
    Active(Arc<EngineContext<P, M, F>>),
    Bypass(Arc<NoopEngine<F>>),
}

impl<P: PolicyPersistence, M: ResponseCacheManager, F: Fetcher> EngineHandle<P, M, F> {
    pub async fn activate(&self) {
        match self {
            EngineHandle::Active(context) => context.activate().await,
            EngineHandle::Bypass(engine) => engine.activate().await,
        }
    }

    pub async fn fetch(&self, request: &InterceptedRequest) -> Result<StoredResponse> {
        match self {
            EngineHandle::Active(context) => context.fetch(request).await,
            EngineHandle::Bypass(engine) => engine.fetch(request).await,
        }
    }

    pub async fn deactivate(&self) {
        match self {
            EngineHandle::Active(context) => context.deactivate().await,
            EngineHandle::Bypass(engine) => engine.deactivate().await,
        }
    }
}

/// Parse the raw `env` JSON and wire up an engine, or fall back to a
/// no-op bypass engine when `cacheName` is missing/malformed or
/// `websocketServerUrl` is absent, per the external interface's
/// configuration contract.
#[allow(clippy::too_many_arguments)]
pub fn install_env<P: PolicyPersistence, M: ResponseCacheManager, F: Fetcher>(
    raw_env: &str,
    persistence: P,
    cache_manager: M,
    fetcher: F,
    bus: Bus,
    source: Option<Arc<dyn PolicySource>>,
    poller: Option<Arc<dyn PolicyPoller>>,
) -> EngineHandle<P, M, F> {
    match EngineEnv::parse(raw_env) {
        Ok(env) if env.websocket_server_url.is_some() => EngineHandle::Active(EngineContext::install(
            env,
            persistence,
            cache_manager,
            fetcher,
            bus,
            source,
            poller,
        )),
        Ok(_) => {
            warn!("engine: missing websocketServerUrl, initializing in bypass mode");
            EngineHandle::Bypass(NoopEngine::install(fetcher))
        }
        Err(e) => {
            warn!("engine: invalid env ({e}), initializing in bypass mode");
            EngineHandle::Bypass(NoopEngine::install(fetcher))
        }
    }
}
