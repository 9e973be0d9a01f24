//! [`PolicyPersistence`] backends for the durable policy record
//! (conventionally the `api-cache-config`/`config`/`latest` triple — a
//! single-row, single-writer resource).

use std::sync::Mutex;

use crate::error::Result;
use crate::policy::{PersistedPolicy, PolicyPersistence};

/// An in-memory policy persistence backend, useful for hosts without a
/// durable store and for tests. Not actually durable across process
/// restarts — the engine degrades to "no persisted policy" instead.
#[derive(Default)]
pub struct InMemoryPolicyPersistence {
    record: Mutex<Option<PersistedPolicy>>,
}

#[async_trait::async_trait]
impl PolicyPersistence for InMemoryPolicyPersistence {
    async fn load(&self) -> Result<Option<PersistedPolicy>> {
        Ok(self.record.lock().unwrap().clone())
    }

    async fn save(&self, record: &PersistedPolicy) -> Result<()> {
        *self.record.lock().unwrap() = Some(record.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.record.lock().unwrap() = None;
        Ok(())
    }
}

/// `cacache`-backed policy persistence: the policy record is stored as a
/// single entry under a fixed key, the same pattern used for response
/// entries elsewhere in this crate ("any embedded key-value store that
/// offers atomic put-or-replace on a single key" is sufficient).
#[cfg(feature = "manager-cacache")]
pub struct CacachePolicyPersistence {
    path: String,
}

#[cfg(feature = "manager-cacache")]
impl CacachePolicyPersistence {
    const KEY: &'static str = "latest";

    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

#[cfg(feature = "manager-cacache")]
#[async_trait::async_trait]
impl PolicyPersistence for CacachePolicyPersistence {
    async fn load(&self) -> Result<Option<PersistedPolicy>> {
        match cacache::read(&self.path, Self::KEY).await {
            Ok(bytes) => Ok(Some(
                serde_json::from_slice(&bytes)
                    .map_err(crate::error::EngineError::Json)?,
            )),
            Err(cacache::Error::EntryNotFound(..)) => Ok(None),
            Err(e) => Err(crate::error::EngineError::CaCache(e)),
        }
    }

    async fn save(&self, record: &PersistedPolicy) -> Result<()> {
        let bytes = serde_json::to_vec(record)
            .map_err(crate::error::EngineError::Json)?;
        cacache::write(&self.path, Self::KEY, bytes)
            .await
            .map_err(crate::error::EngineError::CaCache)?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        cacache::remove(&self.path, Self::KEY)
            .await
            .map_err(crate::error::EngineError::CaCache)?;
        Ok(())
    }
}
