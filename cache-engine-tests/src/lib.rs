#![allow(unused_imports, dead_code)]

#[cfg(test)]
mod scenarios;

use cache_engine_core::cache_manager::StoredResponse;
use cache_engine_core::error::Result;
use cache_engine_core::pipeline::Fetcher;
use cache_engine_core::request::InterceptedRequest;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A [`Fetcher`] that always succeeds with a fixed body, and counts how
/// many times it actually ran an upstream fetch.
pub(crate) struct StubFetcher {
    pub calls: Arc<AtomicUsize>,
    pub body: Vec<u8>,
    pub delay_ms: u64,
}

impl StubFetcher {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self { calls: Arc::new(AtomicUsize::new(0)), body: body.into(), delay_ms: 0 }
    }

    pub fn slow(body: impl Into<Vec<u8>>, delay_ms: u64) -> Self {
        Self { calls: Arc::new(AtomicUsize::new(0)), body: body.into(), delay_ms }
    }
}

#[async_trait::async_trait]
impl Fetcher for StubFetcher {
    async fn fetch(&self, _request: &InterceptedRequest) -> Result<StoredResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
        }
        Ok(StoredResponse { status: 200, headers: BTreeMap::new(), body: self.body.clone() })
    }
}
