//! An in-memory [`ResponseCacheManager`] backed by
//! [`moka`](https://github.com/moka-rs/moka).

use std::fmt;
use std::sync::Arc;

use moka::future::Cache;
use url::Url;

use crate::cache_manager::{ResponseCacheManager, StoredResponse};
use crate::error::{EngineError, Result};

/// Implements [`ResponseCacheManager`] with `moka` as the backend.
#[derive(Clone)]
pub struct MokaResponseManager {
    cache: Arc<Cache<String, Arc<Vec<u8>>>>,
}

impl fmt::Debug for MokaResponseManager {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MokaResponseManager").finish_non_exhaustive()
    }
}

impl Default for MokaResponseManager {
    fn default() -> Self {
        Self::new(Cache::new(10_000))
    }
}

impl MokaResponseManager {
    pub fn new(cache: Cache<String, Arc<Vec<u8>>>) -> Self {
        Self { cache: Arc::new(cache) }
    }
}

#[async_trait::async_trait]
impl ResponseCacheManager for MokaResponseManager {
    async fn put(&self, key: &Url, response: StoredResponse) -> Result<()> {
        let bytes = postcard::to_allocvec(&response)
            .map_err(EngineError::Postcard)?;
        self.cache.insert(key.to_string(), Arc::new(bytes)).await;
        Ok(())
    }

    async fn get(&self, key: &Url) -> Result<Option<StoredResponse>> {
        match self.cache.get(key.as_str()).await {
            Some(bytes) => Ok(Some(
                postcard::from_bytes(&bytes).map_err(EngineError::Postcard)?,
            )),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &Url) -> Result<()> {
        self.cache.invalidate(key.as_str()).await;
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<Url>> {
        Ok(self
            .cache
            .iter()
            .filter_map(|(k, _)| Url::parse(&k).ok())
            .collect())
    }
}
