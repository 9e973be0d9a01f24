//! Concrete policy transports for [`cache_engine_core::sync::SyncClient`]:
//! a WebSocket [`PolicySource`] for the primary stream, and an HTTP
//! [`PolicyPoller`] for the fallback.

use cache_engine_core::error::{EngineError, Result};
use cache_engine_core::sync::{PolicyPoller, PolicySource, PolicyStream};
use futures::StreamExt;
use log::debug;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

/// Opens a WebSocket connection to the configured `websocketServerUrl`
/// and yields every text frame as a raw policy message.
pub struct WebSocketPolicySource {
    url: Url,
}

impl WebSocketPolicySource {
    pub fn new(url: Url) -> Self {
        Self { url }
    }
}

#[async_trait::async_trait]
impl PolicySource for WebSocketPolicySource {
    async fn connect(&self) -> Result<Box<dyn PolicyStream>> {
        let (stream, _response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| EngineError::TransportFailure(e.to_string()))?;
        Ok(Box::new(WsPolicyStream { stream }))
    }
}

struct WsPolicyStream {
    stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
}

#[async_trait::async_trait]
impl PolicyStream for WsPolicyStream {
    async fn recv(&mut self) -> Option<Result<String>> {
        loop {
            let message = self.stream.next().await?;
            match message {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Close(_)) => return None,
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Binary(_)) => {
                    debug!("cache-engine-sync-ws: ignoring non-text frame");
                    continue;
                }
                Ok(Message::Frame(_)) => continue,
                Err(e) => return Some(Err(EngineError::TransportFailure(e.to_string()))),
            }
        }
    }
}

/// Fetches the current policy over plain HTTP, used as the fallback
/// transport while the WebSocket stream is disconnected.
pub struct HttpPollPoller {
    client: reqwest::Client,
    url: Url,
}

impl HttpPollPoller {
    pub fn new(url: Url) -> Self {
        Self { client: reqwest::Client::new(), url }
    }
}

#[async_trait::async_trait]
impl PolicyPoller for HttpPollPoller {
    async fn poll(&self) -> Result<String> {
        let response = self
            .client
            .get(self.url.clone())
            .send()
            .await
            .map_err(|e| EngineError::TransportFailure(e.to_string()))?;
        response
            .text()
            .await
            .map_err(|e| EngineError::TransportFailure(e.to_string()))
    }
}
