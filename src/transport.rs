//! Duplex transport abstraction and the production WebSocket
//! implementation.
//!
//! The connection manager talks to the wire through the object-safe
//! [`Transport`] / [`TransportConnection`] traits, so tests can inject an
//! in-memory duplex. The production [`WsTransport`] dials a
//! tokio-tungstenite WebSocket, mapping `http(s)` base URLs to `ws(s)` and
//! attaching the bearer credential header.

use crate::auth::Credential;
use crate::error::{LaneLinkError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// One frame received from the transport.
#[derive(Debug, Clone)]
pub enum TransportFrame {
    /// A text frame carrying a wire envelope.
    Text(String),
    /// Protocol-level ping; the connection manager answers with a pong.
    Ping(Bytes),
    /// Protocol-level pong (response to our ping).
    Pong(Bytes),
    /// The peer closed the connection, with an optional close code.
    Closed(Option<u16>),
}

/// An established duplex connection.
#[async_trait]
pub trait TransportConnection: Send {
    /// Send a text frame.
    async fn send_text(&mut self, text: &str) -> Result<()>;

    /// Send a protocol-level pong.
    async fn send_pong(&mut self, payload: Bytes) -> Result<()>;

    /// Receive the next frame. `None` means the stream ended.
    async fn recv(&mut self) -> Option<Result<TransportFrame>>;

    /// Close the connection. Best-effort; errors are swallowed.
    async fn close(&mut self);
}

/// Factory for duplex connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Dial `endpoint`, authenticating with `credential`.
    ///
    /// Implementations must map a server-side credential rejection to
    /// [`LaneLinkError::Auth`] so the connection manager can escalate it
    /// instead of retrying.
    async fn connect(
        &self,
        endpoint: &str,
        credential: &Credential,
    ) -> Result<Box<dyn TransportConnection>>;
}

// ── WebSocket implementation ────────────────────────────────────────────────

/// Map an `http(s)` or `ws(s)` base URL to the WebSocket sync endpoint.
///
/// A bare authority gets the default `/v1/sync` path appended; an explicit
/// path is kept as-is.
pub(crate) fn resolve_ws_url(base_url: &str) -> Result<String> {
    let ws = if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if base_url.starts_with("ws://") || base_url.starts_with("wss://") {
        base_url.to_string()
    } else {
        return Err(LaneLinkError::Configuration(format!(
            "Unsupported URL scheme in '{}'",
            base_url
        )));
    };

    let authority_start = ws.find("://").map(|i| i + 3).unwrap_or(0);
    if ws[authority_start..].contains('/') {
        Ok(ws)
    } else {
        Ok(format!("{}/v1/sync", ws))
    }
}

/// Production WebSocket transport.
pub struct WsTransport {
    connection_timeout: Duration,
}

impl WsTransport {
    /// Create a transport with the given connection-establishment timeout.
    pub fn new(connection_timeout: Duration) -> Self {
        Self { connection_timeout }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(
        &self,
        endpoint: &str,
        credential: &Credential,
    ) -> Result<Box<dyn TransportConnection>> {
        let url = resolve_ws_url(endpoint)?;
        log::debug!("[lane-link] Dialing {}", url);

        let mut request = url
            .into_client_request()
            .map_err(|e| LaneLinkError::Configuration(format!("Invalid endpoint: {}", e)))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", credential.access_token))
            .map_err(|e| LaneLinkError::Configuration(format!("Invalid access token: {}", e)))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let connect_result = if crate::timeouts::LaneLinkTimeouts::is_no_timeout(self.connection_timeout)
        {
            Ok(connect_async(request).await)
        } else {
            tokio::time::timeout(self.connection_timeout, connect_async(request)).await
        };

        let stream = match connect_result {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(tokio_tungstenite::tungstenite::Error::Http(response))) => {
                let status = response.status();
                let body = response
                    .into_body()
                    .as_ref()
                    .map(|b| String::from_utf8_lossy(b).into_owned())
                    .unwrap_or_default();
                return Err(match status.as_u16() {
                    // Server rejected the credential at the upgrade;
                    // escalated, never retried at this level.
                    401 | 403 => LaneLinkError::Auth(format!(
                        "Connection rejected ({}): {}",
                        status, body
                    )),
                    code => LaneLinkError::Connection(format!(
                        "WebSocket upgrade failed ({}): {}",
                        code, body
                    )),
                });
            },
            Ok(Err(e)) => {
                return Err(LaneLinkError::Connection(format!("Connection failed: {}", e)))
            },
            Err(_) => {
                return Err(LaneLinkError::Timeout(format!(
                    "Connection timeout ({:?})",
                    self.connection_timeout
                )))
            },
        };

        Ok(Box::new(WsConnection { stream }))
    }
}

struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
}

#[async_trait]
impl TransportConnection for WsConnection {
    async fn send_text(&mut self, text: &str) -> Result<()> {
        self.stream
            .send(Message::Text(text.to_string().into()))
            .await
            .map_err(|e| LaneLinkError::Connection(format!("Send failed: {}", e)))
    }

    async fn send_pong(&mut self, payload: Bytes) -> Result<()> {
        self.stream
            .send(Message::Pong(payload))
            .await
            .map_err(|e| LaneLinkError::Connection(format!("Pong failed: {}", e)))
    }

    async fn recv(&mut self) -> Option<Result<TransportFrame>> {
        loop {
            return match self.stream.next().await? {
                Ok(Message::Text(text)) => Some(Ok(TransportFrame::Text(text.to_string()))),
                Ok(Message::Ping(payload)) => Some(Ok(TransportFrame::Ping(payload))),
                Ok(Message::Pong(payload)) => Some(Ok(TransportFrame::Pong(payload))),
                Ok(Message::Close(frame)) => Some(Ok(TransportFrame::Closed(
                    frame.map(|f| f.code.into()),
                ))),
                // This protocol is text-only; skip stray binary and raw frames.
                Ok(Message::Binary(_)) | Ok(Message::Frame(_)) => continue,
                Err(e) => Some(Err(LaneLinkError::Connection(e.to_string()))),
            };
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}
