//! WebSocket implementation of [`LiveTransport`].
//!
//! The bearer credential travels in the `Authorization` header of the
//! upgrade request; the server answers 401/403 before upgrading when it
//! rejects the credential.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use carechat_shared::constants::DEFAULT_CONNECT_TIMEOUT_MS;
use carechat_shared::protocol::{ClientFrame, ServerFrame};
use carechat_shared::types::Credential;
use carechat_shared::ChatError;

use crate::transport::{LiveLink, LiveTransport};

pub struct WsTransport {
    url: String,
    connect_timeout: Duration,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl LiveTransport for WsTransport {
    async fn open(&self, credential: &Credential) -> Result<Box<dyn LiveLink>, ChatError> {
        if credential.is_empty() {
            return Err(ChatError::Auth("no credential available".into()));
        }

        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ChatError::Transport(format!("Invalid live URL {}: {e}", self.url)))?;
        let header = HeaderValue::from_str(&credential.authorization_header())
            .map_err(|_| ChatError::Auth("credential is not a valid header value".into()))?;
        request.headers_mut().insert(AUTHORIZATION, header);

        let connect = tokio_tungstenite::connect_async(request);
        let (stream, _response) = match tokio::time::timeout(self.connect_timeout, connect).await {
            Err(_) => {
                return Err(ChatError::Transport(format!(
                    "handshake timed out after {:?}",
                    self.connect_timeout
                )))
            }
            Ok(Err(WsError::Http(response)))
                if response.status() == StatusCode::UNAUTHORIZED
                    || response.status() == StatusCode::FORBIDDEN =>
            {
                return Err(ChatError::Auth(format!(
                    "server rejected credential ({})",
                    response.status()
                )))
            }
            Ok(Err(e)) => return Err(ChatError::Transport(e.to_string())),
            Ok(Ok(pair)) => pair,
        };

        info!(url = %self.url, "Live link established");
        Ok(Box::new(WsLink { stream }))
    }
}

struct WsLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl LiveLink for WsLink {
    async fn send(&mut self, frame: &ClientFrame) -> Result<(), ChatError> {
        let text = frame.to_json()?;
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| ChatError::Transport(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<ServerFrame, ChatError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => {
                    return Some(
                        ServerFrame::from_json(&text)
                            .map_err(|e| ChatError::Protocol(format!("malformed frame: {e}"))),
                    );
                }
                Ok(Message::Close(frame)) => {
                    debug!(frame = ?frame, "Server closed live link");
                    return None;
                }
                Ok(Message::Binary(data)) => {
                    debug!(len = data.len(), "Ignoring binary frame");
                }
                // Ping/pong are answered by tungstenite itself.
                Ok(_) => {}
                Err(e) => return Some(Err(ChatError::Transport(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!(error = %e, "Error while closing live link");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_credential_is_an_auth_error() {
        let transport = WsTransport::new("ws://127.0.0.1:9/ws");
        let err = transport.open(&Credential::new("  ")).await.err().unwrap();
        assert!(matches!(err, ChatError::Auth(_)));
    }

    #[tokio::test]
    async fn unreachable_server_is_a_transport_error() {
        // Port 9 (discard) is closed on test machines.
        let transport = WsTransport::new("ws://127.0.0.1:9/ws")
            .with_connect_timeout(Duration::from_secs(2));
        let err = transport.open(&Credential::new("t")).await.err().unwrap();
        assert!(matches!(err, ChatError::Transport(_)));
    }
}
