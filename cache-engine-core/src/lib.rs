#![forbid(unsafe_code)]
#![deny(future_incompatible, nonstandard_style, unused_import_braces, unused_extern_crates)]
//! A client-side response caching engine driven by a server-pushed policy
//! tree rather than per-response cache-control headers.
//!
//! An [`EngineContext`](context::EngineContext) wires together four
//! subsystems:
//!
//! - The [Policy Store](policy) holds the hierarchical cache policy and
//!   persists it with a time-to-live.
//! - The [Policy Sync Client](sync) keeps the store current from a
//!   streaming or polling transport.
//! - The [Response Cache Manager](cache_manager) stores fetched responses
//!   keyed by a canonical [Cache Key](key).
//! - The [dedup layer](dedup) ensures at most one fetch per key is in
//!   flight across every instance sharing a [`bus::Bus`].
//!
//! [`pipeline::RequestPipeline`] drives the request-handling state
//! machine over all four.

pub mod bus;
pub mod cache_manager;
pub mod context;
pub mod debounce;
pub mod dedup;
pub mod env;
pub mod error;
pub mod heartbeat;
pub mod key;
pub mod managers;
pub mod noop;
pub mod persistence;
pub mod pipeline;
pub mod policy;
pub mod request;
pub mod sync;

pub use bus::{Bus, BusMessage};
pub use cache_manager::{check_freshness, Freshness, ResponseCacheManager, StoredResponse};
pub use context::{EngineContext, EngineHandle};
pub use dedup::DedupLayer;
pub use env::EngineEnv;
pub use noop::NoopEngine;
pub use error::{EngineError, Result};
pub use key::{build_cache_key, revert_cache_key};
pub use pipeline::{Fetcher, RequestPipeline};
pub use policy::{CachePolicy, PolicyPersistence, PolicyStore, PrefetchMode};
pub use request::InterceptedRequest;
pub use sync::{PolicyPoller, PolicySource, SyncClient};
