//! A disk-backed [`ResponseCacheManager`] using
//! [`cacache`](https://github.com/zkat/cacache-rs).

use futures::StreamExt;
use url::Url;

use crate::cache_manager::{ResponseCacheManager, StoredResponse};
use crate::error::{EngineError, Result};

/// Implements [`ResponseCacheManager`] with `cacache` as the backend.
#[derive(Debug, Clone)]
pub struct CacacheResponseManager {
    /// Directory where the blob store lives.
    pub path: String,
}

impl CacacheResponseManager {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for CacacheResponseManager {
    fn default() -> Self {
        Self { path: "./cache-engine-responses".into() }
    }
}

#[async_trait::async_trait]
impl ResponseCacheManager for CacacheResponseManager {
    async fn put(&self, key: &Url, response: StoredResponse) -> Result<()> {
        let bytes = postcard::to_allocvec(&response)
            .map_err(EngineError::Postcard)?;
        cacache::write(&self.path, key.as_str(), bytes)
            .await
            .map_err(EngineError::CaCache)?;
        Ok(())
    }

    async fn get(&self, key: &Url) -> Result<Option<StoredResponse>> {
        match cacache::read(&self.path, key.as_str()).await {
            Ok(bytes) => Ok(Some(
                postcard::from_bytes(&bytes).map_err(EngineError::Postcard)?,
            )),
            Err(cacache::Error::EntryNotFound(..)) => Ok(None),
            Err(e) => Err(EngineError::CaCache(e)),
        }
    }

    async fn delete(&self, key: &Url) -> Result<()> {
        cacache::remove(&self.path, key.as_str())
            .await
            .map_err(EngineError::CaCache)?;
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<Url>> {
        let mut keys = Vec::new();
        let mut stream = cacache::list(&self.path);
        while let Some(entry) = stream.next().await {
            let Ok(metadata) = entry else { continue };
            if let Ok(url) = Url::parse(&metadata.key) {
                keys.push(url);
            }
        }
        Ok(keys)
    }
}
