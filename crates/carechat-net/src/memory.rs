//! In-process transport backed by channels.
//!
//! Every successful `open` hands a [`MemoryPeer`] to whoever holds the
//! receiver returned by [`MemoryTransport::new`]. Dropping the peer closes
//! the link from the "server" side.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use carechat_shared::protocol::{ClientFrame, ServerFrame};
use carechat_shared::types::Credential;
use carechat_shared::ChatError;

use crate::transport::{LiveLink, LiveTransport};

/// Server side of one in-memory link.
pub struct MemoryPeer {
    /// Credential presented when the link was opened.
    pub credential: String,
    pub to_client: mpsc::UnboundedSender<ServerFrame>,
    pub from_client: mpsc::UnboundedReceiver<ClientFrame>,
}

struct Inner {
    accepted_token: Option<String>,
    scripted_failures: VecDeque<ChatError>,
    opens: u32,
}

pub struct MemoryTransport {
    inner: Mutex<Inner>,
    peers: mpsc::UnboundedSender<MemoryPeer>,
}

impl MemoryTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryPeer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        let transport = Self {
            inner: Mutex::new(Inner {
                accepted_token: None,
                scripted_failures: VecDeque::new(),
                opens: 0,
            }),
            peers,
        };
        (transport, rx)
    }

    /// Only accept this exact token; anything else is an auth failure.
    pub fn accept_only(self, token: impl Into<String>) -> Self {
        self.lock().accepted_token = Some(token.into());
        self
    }

    /// Fail the next `open` with `err`. Calls queue up in order.
    pub fn fail_next(&self, err: ChatError) {
        self.lock().scripted_failures.push_back(err);
    }

    /// Number of `open` calls made so far, failed ones included.
    pub fn open_count(&self) -> u32 {
        self.lock().opens
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl LiveTransport for MemoryTransport {
    async fn open(&self, credential: &Credential) -> Result<Box<dyn LiveLink>, ChatError> {
        {
            let mut inner = self.lock();
            inner.opens += 1;
            if let Some(err) = inner.scripted_failures.pop_front() {
                return Err(err);
            }
            if credential.is_empty() {
                return Err(ChatError::Auth("no credential available".into()));
            }
            if let Some(expected) = &inner.accepted_token {
                if credential.expose() != expected {
                    return Err(ChatError::Auth("server rejected credential".into()));
                }
            }
        }

        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, from_client) = mpsc::unbounded_channel();
        self.peers
            .send(MemoryPeer {
                credential: credential.expose().to_string(),
                to_client,
                from_client,
            })
            .map_err(|_| ChatError::Transport("memory listener is gone".into()))?;

        Ok(Box::new(MemoryLink { inbound, outbound }))
    }
}

struct MemoryLink {
    inbound: mpsc::UnboundedReceiver<ServerFrame>,
    outbound: mpsc::UnboundedSender<ClientFrame>,
}

#[async_trait]
impl LiveLink for MemoryLink {
    async fn send(&mut self, frame: &ClientFrame) -> Result<(), ChatError> {
        self.outbound
            .send(frame.clone())
            .map_err(|_| ChatError::Transport("peer closed the link".into()))
    }

    async fn recv(&mut self) -> Option<Result<ServerFrame, ChatError>> {
        self.inbound.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.inbound.close();
    }
}
