use thiserror::Error;

/// A `Result` typedef to use with the [`EngineError`] type
pub type Result<T> = std::result::Result<T, EngineError>;

/// The error taxonomy for the caching engine, organized by kind rather than
/// by source type (see design §7: propagation policy recovers locally except
/// on the request-path fetch).
#[derive(Error, Debug)]
pub enum EngineError {
    /// Malformed `env` configuration or malformed policy stream message.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Stream open/send/receive failure, or HTTP poll failure.
    #[error("policy transport failure: {0}")]
    TransportFailure(String),

    /// Blob or key-value store I/O failure. Always logged and swallowed at
    /// the call site; never retried, never surfaced to request handling.
    #[error("store failure: {0}")]
    StoreFailure(String),

    /// Upstream fetch failure on the request path (propagated to the
    /// caller) or during prefetch (logged and swallowed per-entry by the
    /// caller).
    #[error("network failure: {0}")]
    NetworkFailure(String),

    /// No heartbeat owner alive within the dedup wait window.
    #[error("dedup wait for key `{0}` timed out with no live owner")]
    DedupTimeout(String),

    /// Error building or parsing an `http` request/response.
    #[error(transparent)]
    Http(#[from] http::Error),

    /// Error parsing an HTTP header value.
    #[error(transparent)]
    HeaderToStr(#[from] http::header::ToStrError),

    /// Error parsing a URL.
    #[error(transparent)]
    InvalidUrl(#[from] url::ParseError),

    /// Error (de)serializing JSON.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Error from the cacache-backed response store.
    #[cfg(feature = "manager-cacache")]
    #[error(transparent)]
    CaCache(#[from] cacache::Error),

    /// Error (de)serializing a stored cache entry.
    #[cfg(any(feature = "manager-cacache", feature = "manager-moka"))]
    #[error(transparent)]
    Postcard(#[from] postcard::Error),
}

impl EngineError {
    /// True for errors that §7 classifies as recoverable without surfacing
    /// to the request path (everything except `NetworkFailure` on a
    /// request-path fetch, which the pipeline handles by propagating
    /// directly rather than constructing this variant).
    pub fn is_store_or_transport(&self) -> bool {
        matches!(
            self,
            EngineError::StoreFailure(_) | EngineError::TransportFailure(_)
        )
    }
}
