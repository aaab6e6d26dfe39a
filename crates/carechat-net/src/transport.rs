//! Transport seam between the connection manager and the wire.

use async_trait::async_trait;

use carechat_shared::protocol::{ClientFrame, ServerFrame};
use carechat_shared::types::Credential;
use carechat_shared::ChatError;

/// Opens authenticated live links.
#[async_trait]
pub trait LiveTransport: Send + Sync {
    /// Open a link, presenting `credential` during the handshake.
    ///
    /// Returns [`ChatError::Auth`] when the credential is missing or rejected
    /// and [`ChatError::Transport`] for network-level failures.
    async fn open(&self, credential: &Credential) -> Result<Box<dyn LiveLink>, ChatError>;
}

/// One open bidirectional link.
#[async_trait]
pub trait LiveLink: Send {
    async fn send(&mut self, frame: &ClientFrame) -> Result<(), ChatError>;

    /// Next inbound frame. `None` once the link is closed.
    ///
    /// Must be cancel-safe: the manager drops pending `recv` futures when a
    /// command arrives first.
    async fn recv(&mut self) -> Option<Result<ServerFrame, ChatError>>;

    async fn close(&mut self);
}
