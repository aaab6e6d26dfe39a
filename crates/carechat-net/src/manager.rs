//! Connection manager with a tokio command/notification loop.
//!
//! The live link runs in a dedicated tokio task. Callers talk to it through
//! a command channel; inbound frames come out of an mpsc receiver and
//! lifecycle transitions go to a broadcast channel. The current
//! [`ConnectionState`] sits in a `watch` channel so [`ConnectionManager::state`]
//! never waits on the task.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use carechat_shared::protocol::{ClientFrame, ServerFrame};
use carechat_shared::types::{ConnectionState, Credential};
use carechat_shared::ChatError;

use crate::backoff::ReconnectPolicy;
use crate::transport::{LiveLink, LiveTransport};

const INBOUND_BUFFER: usize = 256;
const COMMAND_BUFFER: usize = 64;
const LIFECYCLE_BUFFER: usize = 32;
/// How long `disconnect` waits for the link task before aborting it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Lifecycle notifications
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `disconnect()` was called.
    Requested,
    /// The link closed unexpectedly; a reconnect window follows.
    TransportLost(String),
    /// A reconnect attempt was refused by the server. Terminal.
    AuthRejected(String),
    /// `max_attempts` reconnects failed. Terminal.
    GaveUp,
}

/// Notifications published by the manager. Carries no message content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Connected,
    Disconnected(DisconnectReason),
    Reconnecting { attempt: u32, delay: Duration },
}

// ---------------------------------------------------------------------------
// Commands into the link task
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum LinkCommand {
    Emit {
        frame: ClientFrame,
        reply: oneshot::Sender<Result<(), ChatError>>,
    },
    Shutdown,
}

struct Running {
    cmd_tx: mpsc::Sender<LinkCommand>,
    task: JoinHandle<()>,
}

/// State shared between the manager handle and its link task.
struct Shared {
    state_tx: watch::Sender<ConnectionState>,
    lifecycle_tx: broadcast::Sender<LifecycleEvent>,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "Connection state changed");
        }
    }

    fn notify(&self, event: LifecycleEvent) {
        // No subscribers is fine.
        let _ = self.lifecycle_tx.send(event);
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Owns the single live connection of a session.
pub struct ConnectionManager {
    transport: Arc<dyn LiveTransport>,
    policy: ReconnectPolicy,
    shared: Arc<Shared>,
    inbound_tx: mpsc::Sender<ServerFrame>,
    running: Mutex<Option<Running>>,
}

impl ConnectionManager {
    /// Create a manager and the receiver on which inbound frames are dispatched.
    pub fn new(
        transport: Arc<dyn LiveTransport>,
        policy: ReconnectPolicy,
    ) -> (Self, mpsc::Receiver<ServerFrame>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (lifecycle_tx, _) = broadcast::channel(LIFECYCLE_BUFFER);

        let manager = Self {
            transport,
            policy,
            shared: Arc::new(Shared {
                state_tx,
                lifecycle_tx,
            }),
            inbound_tx,
            running: Mutex::new(None),
        };
        (manager, inbound_rx)
    }

    /// Open the live connection.
    ///
    /// The first handshake happens inline so its failure reaches the caller
    /// as [`ChatError::Auth`] or [`ChatError::Transport`]. Later drops are
    /// handled by the background reconnect loop. Calling `connect` while
    /// already connected is a no-op.
    pub async fn connect(&self, credential: &Credential) -> Result<(), ChatError> {
        let mut running = self.running.lock().await;
        if let Some(current) = running.as_ref() {
            if !current.task.is_finished() {
                debug!("connect() called while link task is running");
                return Ok(());
            }
        }
        *running = None;

        self.shared.set_state(ConnectionState::Connecting);
        let link = match self.transport.open(credential).await {
            Ok(link) => link,
            Err(e) => {
                warn!(error = %e, "Live connection failed");
                self.shared.set_state(ConnectionState::Disconnected);
                if let ChatError::Auth(msg) = &e {
                    self.shared
                        .notify(LifecycleEvent::Disconnected(DisconnectReason::AuthRejected(
                            msg.clone(),
                        )));
                }
                return Err(e);
            }
        };

        self.shared.set_state(ConnectionState::Connected);
        self.shared.notify(LifecycleEvent::Connected);
        info!("Live connection established");

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let task = LinkTask {
            transport: Arc::clone(&self.transport),
            credential: credential.clone(),
            policy: self.policy.clone(),
            shared: Arc::clone(&self.shared),
            inbound_tx: self.inbound_tx.clone(),
            cmd_rx,
        };
        *running = Some(Running {
            cmd_tx,
            task: tokio::spawn(task.run(link)),
        });
        Ok(())
    }

    /// Tear down the live connection. Idempotent.
    ///
    /// Once this returns the link task has stopped, so no further frames
    /// are pushed to the inbound receiver.
    pub async fn disconnect(&self) {
        let running = self.running.lock().await.take();
        let Some(Running { cmd_tx, mut task }) = running else {
            self.shared.set_state(ConnectionState::Disconnected);
            return;
        };

        let _ = cmd_tx.send(LinkCommand::Shutdown).await;
        match tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_cancelled() => {}
            Ok(Err(e)) => error!(error = %e, "Link task panicked"),
            Err(_) => {
                warn!("Link task did not stop in time, aborting");
                task.abort();
                let _ = task.await;
            }
        }

        let was = *self.shared.state_tx.borrow();
        self.shared.set_state(ConnectionState::Disconnected);
        if was != ConnectionState::Disconnected {
            self.shared
                .notify(LifecycleEvent::Disconnected(DisconnectReason::Requested));
        }
        info!("Live connection closed");
    }

    /// Send a frame over the live link.
    ///
    /// Fails with [`ChatError::Transport`] when there is no open link,
    /// including during a reconnect window.
    pub async fn emit(&self, frame: ClientFrame) -> Result<(), ChatError> {
        let cmd_tx = self
            .running
            .lock()
            .await
            .as_ref()
            .map(|r| r.cmd_tx.clone())
            .ok_or_else(|| ChatError::Transport("not connected".into()))?;

        let (reply, reply_rx) = oneshot::channel();
        cmd_tx
            .send(LinkCommand::Emit { frame, reply })
            .await
            .map_err(|_| ChatError::Transport("connection closed".into()))?;
        reply_rx
            .await
            .map_err(|_| ChatError::Transport("connection closed".into()))?
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.shared.lifecycle_tx.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Link task
// ---------------------------------------------------------------------------

/// Why the connected phase ended.
enum LinkExit {
    Lost(String),
    Stop,
}

struct LinkTask {
    transport: Arc<dyn LiveTransport>,
    credential: Credential,
    policy: ReconnectPolicy,
    shared: Arc<Shared>,
    inbound_tx: mpsc::Sender<ServerFrame>,
    cmd_rx: mpsc::Receiver<LinkCommand>,
}

impl LinkTask {
    async fn run(mut self, mut link: Box<dyn LiveLink>) {
        loop {
            let reason = match self.pump(link.as_mut()).await {
                LinkExit::Stop => {
                    link.close().await;
                    break;
                }
                LinkExit::Lost(reason) => reason,
            };

            warn!(reason = %reason, "Live connection lost");
            self.shared.set_state(ConnectionState::Connecting);
            self.shared
                .notify(LifecycleEvent::Disconnected(DisconnectReason::TransportLost(
                    reason,
                )));

            match self.reconnect().await {
                Some(new_link) => {
                    link = new_link;
                    self.shared.set_state(ConnectionState::Connected);
                    self.shared.notify(LifecycleEvent::Connected);
                    info!("Live connection re-established");
                }
                None => break,
            }
        }
        debug!("Link task terminated");
    }

    /// Connected phase: relay commands out and frames in until the link
    /// drops or a shutdown arrives.
    async fn pump(&mut self, link: &mut dyn LiveLink) -> LinkExit {
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(LinkCommand::Emit { frame, reply }) => {
                        let result = link.send(&frame).await;
                        let failed = match &result {
                            Err(e) => Some(e.to_string()),
                            Ok(()) => None,
                        };
                        let _ = reply.send(result);
                        if let Some(reason) = failed {
                            return LinkExit::Lost(reason);
                        }
                    }
                    Some(LinkCommand::Shutdown) | None => {
                        info!("Live connection shutdown requested");
                        return LinkExit::Stop;
                    }
                },
                frame = link.recv() => match frame {
                    Some(Ok(frame)) => {
                        debug!(frame = frame_name(&frame), "Inbound frame");
                        if self.inbound_tx.send(frame).await.is_err() {
                            debug!("Inbound receiver dropped, stopping link task");
                            return LinkExit::Stop;
                        }
                    }
                    Some(Err(e @ (ChatError::Protocol(_) | ChatError::Serialization(_)))) => {
                        warn!(error = %e, "Dropping malformed frame");
                    }
                    Some(Err(e)) => return LinkExit::Lost(e.to_string()),
                    None => return LinkExit::Lost("closed by server".into()),
                },
            }
        }
    }

    /// Reconnect window. Returns `None` when the task should end.
    async fn reconnect(&mut self) -> Option<Box<dyn LiveLink>> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            if let Some(max) = self.policy.max_attempts {
                if attempt > max {
                    warn!(attempts = max, "Giving up on reconnecting");
                    self.finish(DisconnectReason::GaveUp);
                    return None;
                }
            }

            let delay = self.policy.delay_for(attempt);
            self.shared
                .notify(LifecycleEvent::Reconnecting { attempt, delay });
            debug!(attempt, delay_ms = delay.as_millis() as u64, "Waiting before reconnect");

            if !self.wait(delay).await {
                self.shared.set_state(ConnectionState::Disconnected);
                return None;
            }

            match self.transport.open(&self.credential).await {
                Ok(link) => return Some(link),
                Err(ChatError::Auth(msg)) => {
                    error!(error = %msg, "Credential rejected while reconnecting");
                    self.finish(DisconnectReason::AuthRejected(msg));
                    return None;
                }
                Err(e) => warn!(attempt, error = %e, "Reconnect attempt failed"),
            }
        }
    }

    /// Sleep for `delay` while refusing emits. Returns `false` on shutdown.
    async fn wait(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(LinkCommand::Emit { reply, .. }) => {
                        let _ = reply.send(Err(ChatError::Transport("reconnecting".into())));
                    }
                    Some(LinkCommand::Shutdown) | None => return false,
                },
            }
        }
    }

    fn finish(&self, reason: DisconnectReason) {
        self.shared.set_state(ConnectionState::Disconnected);
        self.shared.notify(LifecycleEvent::Disconnected(reason));
    }
}

fn frame_name(frame: &ServerFrame) -> &'static str {
    match frame {
        ServerFrame::Ready(_) => "ready",
        ServerFrame::NewMessage(_) => "new_message",
        ServerFrame::TypingIndicator(_) => "typing_indicator",
        ServerFrame::UserStatusChange(_) => "user_status_change",
        ServerFrame::MessageStatus(_) => "message_status",
        ServerFrame::MessageDeleted(_) => "message_deleted",
        ServerFrame::Error(_) => "error",
    }
}
