//! Public handle over the chat engine and the live connection.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info};

use carechat_net::{ConnectionManager, LifecycleEvent, LiveTransport, WsTransport};
use carechat_shared::protocol::{ClientFrame, TypingUpdate, UnreadCounts};
use carechat_shared::types::{ClientId, ConnectionState, ConversationKey, ServerMessageId, UserId};
use carechat_shared::{ChatError, ValidationError};

use crate::api::{DirectorySource, HttpApi, PersistenceApi};
use crate::config::ClientConfig;
use crate::directory::RoleFilter;
use crate::engine::{self, Command, EngineParts};
use crate::events::ChatUpdate;
use crate::message_store::Draft;
use crate::presentation::{ConnectionBanner, ConversationView, CounterpartyView, MessageView};
use crate::session::Session;

const UPDATE_BUFFER: usize = 256;

/// One signed-in chat session.
///
/// Cheap queries and all mutations go through the engine task; the handle
/// itself holds no message state.
pub struct ChatClient {
    session: Session,
    connection: Arc<ConnectionManager>,
    commands: mpsc::Sender<Command>,
    updates: broadcast::Sender<ChatUpdate>,
    engine: Mutex<Option<JoinHandle<()>>>,
}

impl ChatClient {
    /// Build a client talking to the HTTP API and WebSocket endpoint from
    /// `config`. Does not connect.
    pub fn start(session: Session, config: &ClientConfig) -> Result<Self, ChatError> {
        let api = Arc::new(HttpApi::new(
            config.api_url.clone(),
            session.credential.clone(),
            config.request_timeout,
        )?);
        let transport =
            Arc::new(WsTransport::new(config.ws_url.clone()).with_connect_timeout(config.connect_timeout));
        Ok(Self::with_parts(session, config, api.clone(), api, transport))
    }

    /// Build a client from explicit collaborators. Must be called from
    /// within a tokio runtime.
    pub fn with_parts(
        session: Session,
        config: &ClientConfig,
        api: Arc<dyn PersistenceApi>,
        directory_source: Arc<dyn DirectorySource>,
        transport: Arc<dyn LiveTransport>,
    ) -> Self {
        let (connection, inbound) = ConnectionManager::new(transport, config.reconnect.clone());
        let connection = Arc::new(connection);
        let (updates, _) = broadcast::channel(UPDATE_BUFFER);

        let (commands, handle) = engine::spawn(EngineParts {
            local: session.user.clone(),
            api,
            directory_source,
            connection: Arc::clone(&connection),
            inbound,
            lifecycle: connection.subscribe(),
            updates: updates.clone(),
            request_timeout: config.request_timeout,
            history_page: config.history_page,
            max_content_len: config.max_content_len,
        });

        Self {
            session,
            connection,
            commands,
            updates,
            engine: Mutex::new(Some(handle)),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Key of the conversation with `counterparty`.
    pub fn conversation_key(&self, counterparty: &UserId) -> ConversationKey {
        ConversationKey::between(self.session.user_id(), counterparty)
    }

    // -- Connection --------------------------------------------------------

    /// Open the live connection with the session credential.
    pub async fn connect(&self) -> Result<(), ChatError> {
        self.connection.connect(&self.session.credential).await
    }

    /// Disconnect and stop the engine. Pending requests resolve with
    /// [`ChatError::Closed`].
    pub async fn shutdown(&self) {
        self.connection.disconnect().await;
        let _ = self.commands.send(Command::Shutdown).await;
        if let Some(handle) = self.engine.lock().await.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "Chat engine panicked");
            }
        }
        info!(user = %self.session.user_id(), "Chat client shut down");
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn banner(&self) -> ConnectionBanner {
        ConnectionBanner::for_state(self.connection.state())
    }

    pub fn subscribe_lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.connection.subscribe()
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<ChatUpdate> {
        self.updates.subscribe()
    }

    // -- Sending -----------------------------------------------------------

    /// Send a text message in `key`.
    ///
    /// Resolves once the message is persisted (with the settled view) or
    /// has failed. The pending entry is visible to subscribers immediately.
    pub async fn send(
        &self,
        key: &ConversationKey,
        content: impl Into<String>,
        reply_to: Option<ServerMessageId>,
    ) -> Result<MessageView, ChatError> {
        let recipient = key
            .counterparty(self.session.user_id())
            .cloned()
            .ok_or_else(|| ChatError::Protocol(format!("{key} is not a conversation of this user")))?;
        let mut draft = Draft::text(recipient, content);
        if let Some(target) = reply_to {
            draft = draft.replying_to(target);
        }
        self.send_draft(draft).await
    }

    pub async fn send_draft(&self, draft: Draft) -> Result<MessageView, ChatError> {
        self.request(|reply| Command::Send { draft, reply }).await?
    }

    /// Resend a failed message as a new entry.
    pub async fn resend(&self, client_id: ClientId) -> Result<MessageView, ChatError> {
        self.request(|reply| Command::Resend { client_id, reply })
            .await?
    }

    /// Delete one of our own saved messages on the server and locally. The
    /// counterparty's session drops it when the deletion notice arrives.
    pub async fn delete_message(&self, client_id: ClientId) -> Result<(), ChatError> {
        self.request(|reply| Command::Delete { client_id, reply })
            .await?
    }

    /// Best-effort typing indicator over the live link.
    pub async fn typing(&self, counterparty: &UserId, is_typing: bool) -> Result<(), ChatError> {
        if counterparty == self.session.user_id() {
            return Err(ValidationError::SelfConversation.into());
        }
        self.connection
            .emit(ClientFrame::Typing(TypingUpdate {
                recipient_id: counterparty.clone(),
                is_typing,
            }))
            .await
    }

    /// Tell other users we stepped away, or came back.
    pub async fn set_away(&self, away: bool) -> Result<(), ChatError> {
        let frame = if away {
            ClientFrame::UserAway
        } else {
            ClientFrame::UserBack
        };
        self.connection.emit(frame).await
    }

    // -- Conversations -----------------------------------------------------

    /// Make the conversation with `counterparty` active, clear its unread
    /// count and start loading history if it was never loaded.
    pub async fn select_conversation(&self, counterparty: &UserId) -> Result<ConversationKey, ChatError> {
        let counterparty = counterparty.clone();
        self.request(|reply| Command::SelectConversation { counterparty, reply })
            .await?
    }

    /// Fetch the newest history page of `key` and merge it. Concurrent
    /// loads of the same conversation share one request.
    pub async fn load_history(&self, key: &ConversationKey) -> Result<Vec<MessageView>, ChatError> {
        let key = key.clone();
        self.request(|reply| Command::LoadHistory { key, reply })
            .await?
    }

    /// Fetch the page before the oldest message held for `key`.
    pub async fn load_older(&self, key: &ConversationKey) -> Result<Vec<MessageView>, ChatError> {
        let key = key.clone();
        self.request(|reply| Command::LoadOlder { key, reply })
            .await?
    }

    /// Ordered messages of `key` as currently held locally.
    pub async fn messages(&self, key: &ConversationKey) -> Result<Vec<MessageView>, ChatError> {
        let key = key.clone();
        self.request(|reply| Command::Messages { key, reply }).await
    }

    pub async fn conversations(&self) -> Result<Vec<ConversationView>, ChatError> {
        self.request(|reply| Command::Conversations { reply }).await
    }

    /// Re-seed conversations from the server's summaries.
    pub async fn refresh_conversations(&self) -> Result<Vec<ConversationView>, ChatError> {
        self.request(|reply| Command::RefreshConversations { reply })
            .await?
    }

    /// Unread totals as the server counts them, across every conversation.
    pub async fn unread_counts(&self) -> Result<UnreadCounts, ChatError> {
        self.request(|reply| Command::UnreadCounts { reply })
            .await?
    }

    // -- Directory ---------------------------------------------------------

    pub async fn counterparties(
        &self,
        filter: RoleFilter,
        search: impl Into<String>,
    ) -> Result<Vec<CounterpartyView>, ChatError> {
        let search = search.into();
        self.request(|reply| Command::Counterparties {
            filter,
            search,
            reply,
        })
        .await
    }

    /// Re-fetch the eligible counterparties. Returns how many are listed.
    pub async fn refresh_directory(&self) -> Result<usize, ChatError> {
        self.request(|reply| Command::RefreshDirectory { reply })
            .await?
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, ChatError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| ChatError::Closed)?;
        rx.await.map_err(|_| ChatError::Closed)
    }
}
