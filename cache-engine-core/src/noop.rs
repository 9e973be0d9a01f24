//! The no-op bypass engine: what a host gets instead of a panic when the
//! required configuration is missing (no `cacheName`, no
//! `websocketServerUrl`). Every request passes straight through to the
//! fetcher; no policy, cache, dedup, or sync bookkeeping happens.

use std::sync::Arc;

use crate::cache_manager::StoredResponse;
use crate::error::Result;
use crate::pipeline::Fetcher;
use crate::request::InterceptedRequest;

/// An inert stand-in for [`crate::context::EngineContext`], with the same
/// `activate`/`fetch`/`deactivate` lifecycle surface minus any caching.
pub struct NoopEngine<F: Fetcher> {
    fetcher: Arc<F>,
}

impl<F: Fetcher> NoopEngine<F> {
    pub fn install(fetcher: F) -> Arc<Self> {
        Arc::new(Self { fetcher: Arc::new(fetcher) })
    }

    /// Nothing to establish: there is no sync client and no persisted
    /// policy to load.
    pub async fn activate(self: &Arc<Self>) {}

    /// Pass the request straight through.
    pub async fn fetch(&self, request: &InterceptedRequest) -> Result<StoredResponse> {
        self.fetcher.fetch(request).await
    }

    /// Nothing to tear down.
    pub async fn deactivate(&self) {}
}
