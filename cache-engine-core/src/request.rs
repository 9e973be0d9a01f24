//! The minimal request shape the engine intercepts. Deliberately not tied
//! to any particular HTTP client/server crate so the core stays usable
//! from any host; the bootstrap/registration surface that feeds it
//! requests is out of scope here.

use std::collections::BTreeMap;

use url::Url;

use crate::error::{EngineError, Result};

/// One intercepted request, as seen by the Request Pipeline.
#[derive(Debug, Clone)]
pub struct InterceptedRequest {
    pub method: String,
    pub url: Url,
    /// Header names are lower-cased; a header with repeated values keeps
    /// only the first (cache-key construction and policy resolution only
    /// ever read a single value per name).
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl InterceptedRequest {
    pub fn new(method: impl Into<String>, url: Url) -> Self {
        Self { method: method.into(), url, headers: BTreeMap::new(), body: Vec::new() }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// The request's origin: `scheme://host[:port]`, no trailing slash.
    pub fn origin(&self) -> String {
        let mut s = format!(
            "{}://{}",
            self.url.scheme(),
            self.url.host_str().unwrap_or("")
        );
        if let Some(port) = self.url.port() {
            s.push(':');
            s.push_str(&port.to_string());
        }
        s
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Build a synthetic GET-like request for a declared (origin, path,
    /// method) triple, used by prefetch enumeration.
    pub fn synthetic(origin: &str, path: &str, method: &str) -> Result<Self> {
        let url = Url::parse(&format!("{origin}/{path}"))
            .map_err(EngineError::InvalidUrl)?;
        Ok(Self::new(method, url))
    }
}
