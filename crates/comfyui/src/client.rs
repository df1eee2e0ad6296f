//! WebSocket client for a ComfyUI instance's push channel.
//!
//! [`ComfyUIClient`] holds the connection configuration. Call
//! [`ComfyUIClient::connect`] with a job's correlation id to open a
//! [`ComfyUIConnection`] that receives that job's events.

use std::time::Duration;

use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// Default bound on the WebSocket handshake. Receives are not bounded
/// here; see [`crate::wait`].
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// The raw stream type produced by [`ComfyUIClient::connect`].
pub type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Configuration handle for a ComfyUI push channel.
#[derive(Debug, Clone)]
pub struct ComfyUIClient {
    ws_url: String,
    connect_timeout: Duration,
}

/// A live WebSocket connection scoped to one client id.
pub struct ComfyUIConnection {
    /// Correlation id sent during the handshake.
    pub client_id: String,
    /// The raw WebSocket stream for reading frames.
    pub ws_stream: WsStream,
}

impl ComfyUIClient {
    /// * `ws_url` - WebSocket base URL, e.g. `ws://host:8188`.
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into().trim_end_matches('/').to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// WebSocket base URL (e.g. `ws://host:8188`).
    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    /// Full channel URL for a correlation id.
    pub fn channel_url(&self, client_id: &str) -> String {
        format!("{}/ws?clientId={}", self.ws_url, client_id)
    }

    /// Connect to the ComfyUI WebSocket endpoint.
    ///
    /// ComfyUI routes prompt events to the socket whose `clientId`
    /// matches the `client_id` the prompt was submitted with.
    pub async fn connect(&self, client_id: &str) -> Result<ComfyUIConnection, ComfyUIClientError> {
        let url = self.channel_url(client_id);

        let (ws_stream, _response) = tokio::time::timeout(self.connect_timeout, connect_async(&url))
            .await
            .map_err(|_| {
                ComfyUIClientError::Connection(format!(
                    "Timed out after {:?} connecting to ComfyUI at {}",
                    self.connect_timeout, self.ws_url
                ))
            })?
            .map_err(|e| {
                ComfyUIClientError::Connection(format!(
                    "Failed to connect to ComfyUI at {}: {e}",
                    self.ws_url
                ))
            })?;

        tracing::debug!(client_id = %client_id, "Connected to ComfyUI at {}", self.ws_url);

        Ok(ComfyUIConnection {
            client_id: client_id.to_string(),
            ws_stream,
        })
    }
}

impl std::fmt::Debug for ComfyUIConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComfyUIConnection")
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

impl ComfyUIConnection {
    /// Send a close frame. Failures are logged, not returned.
    pub async fn close(mut self) {
        if let Err(e) = self.ws_stream.close(None).await {
            tracing::debug!(client_id = %self.client_id, error = %e, "WebSocket close failed");
        } else {
            tracing::debug!(client_id = %self.client_id, "WebSocket closed");
        }
    }
}

/// Errors that can occur when working with the WebSocket client.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIClientError {
    /// Failed to establish the WebSocket connection.
    #[error("Connection error: {0}")]
    Connection(String),
}
