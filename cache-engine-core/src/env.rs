//! Parses the `env` configuration surface: the parameters a host passes
//! when installing the engine. Malformed or incomplete configuration
//! degrades to bypass rather than erroring the install.

use serde::Deserialize;

/// Parsed engine configuration. Construct via [`EngineEnv::parse`].
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineEnv {
    pub cache_name: String,
    #[serde(default)]
    pub websocket_server_url: Option<String>,
    #[serde(default)]
    pub fallback_polling_server_url: Option<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub fallback_polling_interval_ms: u64,
    #[serde(default)]
    pub ignore_origins: Vec<String>,
}

fn default_poll_interval_ms() -> u64 {
    30_000
}

impl EngineEnv {
    /// Parse a JSON-encoded `env` value. Missing `cacheName` or a value
    /// that isn't a JSON object is a configuration error; the host should
    /// fall back to an inert, bypass-everything engine.
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// True if the engine has a transport to receive policy updates from.
    pub fn has_transport(&self) -> bool {
        self.websocket_server_url.is_some() || self.fallback_polling_server_url.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_env() {
        let env = EngineEnv::parse(r#"{"cacheName":"api-cache-v1"}"#).unwrap();
        assert_eq!(env.cache_name, "api-cache-v1");
        assert_eq!(env.fallback_polling_interval_ms, 30_000);
        assert!(env.ignore_origins.is_empty());
    }

    #[test]
    fn missing_cache_name_is_an_error() {
        assert!(EngineEnv::parse(r#"{"websocketServerUrl":"wss://x"}"#).is_err());
    }

    #[test]
    fn parses_full_env() {
        let env = EngineEnv::parse(
            r#"{
                "cacheName": "api-cache-v1",
                "websocketServerUrl": "wss://sync.example.com/policy",
                "fallbackPollingServerUrl": "https://sync.example.com/policy",
                "fallbackPollingIntervalMs": 5000,
                "ignoreOrigins": ["https://dev.example.com"]
            }"#,
        )
        .unwrap();
        assert_eq!(env.fallback_polling_interval_ms, 5000);
        assert_eq!(env.ignore_origins, vec!["https://dev.example.com".to_string()]);
        assert!(env.has_transport());
    }
}
