//! Delivery pipeline event loop.
//!
//! The engine task exclusively owns the message store and the directory.
//! Every mutation runs on this loop, one at a time: UI commands, completed
//! persistence requests, inbound live frames and connection lifecycle
//! events. Network requests run in spawned tasks that post their result
//! back, so the loop keeps processing live frames while a send is in
//! flight.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use carechat_net::{ConnectionManager, DisconnectReason, LifecycleEvent};
use carechat_shared::protocol::{
    ClientFrame, ConversationSummary, Counterparty, DeletedMessage, DeliveryReceipt, MessageRecord,
    ServerFrame, UnreadCounts,
};
use carechat_shared::types::{ClientId, ConnectionState, ConversationKey, ServerMessageId, UserId};
use carechat_shared::{ChatError, ValidationError};

use crate::api::{DirectorySource, PersistenceApi};
use crate::directory::{eligible_roles, ConversationDirectory, RoleFilter};
use crate::events::ChatUpdate;
use crate::message_store::{ChatMessage, Draft, IncomingOutcome, MessageStore};
use crate::presentation::{
    conversation_views, counterparty_view, message_view, message_views, ConversationView,
    CounterpartyView, MessageView,
};
use crate::session::LocalUser;

const COMMAND_BUFFER: usize = 64;

type Reply<T> = oneshot::Sender<Result<T, ChatError>>;

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Requests from the [`ChatClient`](crate::ChatClient) handle.
pub(crate) enum Command {
    Send {
        draft: Draft,
        reply: Reply<MessageView>,
    },
    Resend {
        client_id: ClientId,
        reply: Reply<MessageView>,
    },
    SelectConversation {
        counterparty: UserId,
        reply: Reply<ConversationKey>,
    },
    LoadHistory {
        key: ConversationKey,
        reply: Reply<Vec<MessageView>>,
    },
    LoadOlder {
        key: ConversationKey,
        reply: Reply<Vec<MessageView>>,
    },
    Delete {
        client_id: ClientId,
        reply: Reply<()>,
    },
    UnreadCounts {
        reply: Reply<UnreadCounts>,
    },
    Messages {
        key: ConversationKey,
        reply: oneshot::Sender<Vec<MessageView>>,
    },
    Conversations {
        reply: oneshot::Sender<Vec<ConversationView>>,
    },
    RefreshConversations {
        reply: Reply<Vec<ConversationView>>,
    },
    Counterparties {
        filter: RoleFilter,
        search: String,
        reply: oneshot::Sender<Vec<CounterpartyView>>,
    },
    RefreshDirectory {
        reply: Reply<usize>,
    },
    Shutdown,
}

/// Results of spawned requests, posted back to the loop.
enum Internal {
    PersistDone {
        client_id: ClientId,
        result: Result<MessageRecord, ChatError>,
    },
    HistoryDone {
        key: ConversationKey,
        page: HistoryPage,
        result: Result<Vec<MessageRecord>, ChatError>,
    },
    DeleteDone {
        server_id: ServerMessageId,
        result: Result<(), ChatError>,
        reply: Reply<()>,
    },
    /// The live link refused a broadcast; retried on the next connect.
    BroadcastFailed {
        record: MessageRecord,
    },
    SummariesDone {
        result: Result<Vec<ConversationSummary>, ChatError>,
        reply: Reply<Vec<ConversationView>>,
    },
    DirectoryDone {
        result: Result<Vec<Counterparty>, ChatError>,
        reply: Reply<usize>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HistoryFetch {
    /// Newest page, counting back from the server's latest message.
    Latest,
    /// The page before everything held locally.
    Older,
}

/// One history request in a possibly multi-page load.
#[derive(Debug, Clone, Copy)]
struct HistoryPage {
    kind: HistoryFetch,
    offset: u32,
    /// Keep paging back while full pages miss everything held locally.
    fill_gap: bool,
    /// Entries inserted by earlier pages of this load.
    inserted: usize,
}

pub(crate) struct EngineParts {
    pub local: LocalUser,
    pub api: Arc<dyn PersistenceApi>,
    pub directory_source: Arc<dyn DirectorySource>,
    pub connection: Arc<ConnectionManager>,
    pub inbound: mpsc::Receiver<ServerFrame>,
    pub lifecycle: broadcast::Receiver<LifecycleEvent>,
    pub updates: broadcast::Sender<ChatUpdate>,
    pub request_timeout: Duration,
    pub history_page: u32,
    pub max_content_len: usize,
}

/// Spawn the engine task. Must be called from within a tokio runtime.
pub(crate) fn spawn(parts: EngineParts) -> (mpsc::Sender<Command>, JoinHandle<()>) {
    let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
    let (internal_tx, internal_rx) = mpsc::unbounded_channel();

    let engine = Engine {
        store: MessageStore::new(parts.local.clone()),
        directory: ConversationDirectory::new(parts.local.id.clone(), parts.local.role),
        local: parts.local,
        api: parts.api,
        directory_source: parts.directory_source,
        connection: parts.connection,
        updates: parts.updates,
        request_timeout: parts.request_timeout,
        history_page: parts.history_page,
        max_content_len: parts.max_content_len,
        internal_tx,
        pending_sends: HashMap::new(),
        history_in_flight: HashMap::new(),
        older_in_flight: HashMap::new(),
        unbroadcast: Vec::new(),
        resync_on_connect: false,
    };

    let handle = tokio::spawn(engine.run(command_rx, internal_rx, parts.inbound, parts.lifecycle));
    (command_tx, handle)
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct Engine {
    local: LocalUser,
    store: MessageStore,
    directory: ConversationDirectory,
    api: Arc<dyn PersistenceApi>,
    directory_source: Arc<dyn DirectorySource>,
    connection: Arc<ConnectionManager>,
    updates: broadcast::Sender<ChatUpdate>,
    request_timeout: Duration,
    history_page: u32,
    max_content_len: usize,
    internal_tx: mpsc::UnboundedSender<Internal>,
    /// Callers waiting for a send to settle, by client id.
    pending_sends: HashMap<ClientId, Reply<MessageView>>,
    /// History fetches in flight and the callers waiting on each.
    history_in_flight: HashMap<ConversationKey, Vec<Reply<Vec<MessageView>>>>,
    older_in_flight: HashMap<ConversationKey, Vec<Reply<Vec<MessageView>>>>,
    /// Persisted messages whose live broadcast was refused.
    unbroadcast: Vec<MessageRecord>,
    /// Set when the link dropped; history is re-fetched on reconnect.
    resync_on_connect: bool,
}

impl Engine {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
        mut inbound: mpsc::Receiver<ServerFrame>,
        mut lifecycle: broadcast::Receiver<LifecycleEvent>,
    ) {
        info!(user = %self.local.id, "Chat engine started");
        let mut inbound_open = true;
        let mut lifecycle_open = true;

        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Shutdown) | None => break,
                    Some(cmd) => self.handle_command(cmd),
                },
                Some(event) = internal.recv() => self.handle_internal(event),
                frame = inbound.recv(), if inbound_open => match frame {
                    Some(frame) => self.handle_frame(frame),
                    None => inbound_open = false,
                },
                event = lifecycle.recv(), if lifecycle_open => match event {
                    Ok(event) => self.handle_lifecycle(event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Lifecycle events lagged");
                        self.publish(ChatUpdate::Connection { state: self.connection.state() });
                    }
                    Err(RecvError::Closed) => lifecycle_open = false,
                },
            }
        }

        for (_, reply) in self.pending_sends.drain() {
            let _ = reply.send(Err(ChatError::Closed));
        }
        info!("Chat engine stopped");
    }

    fn publish(&self, update: ChatUpdate) {
        // No subscribers is fine.
        let _ = self.updates.send(update);
    }

    fn publish_message(&self, client_id: &ClientId, added: bool) -> Option<MessageView> {
        let message = self.store.get(client_id)?;
        let view = message_view(&self.store, message);
        let conversation = message.conversation.to_string();
        self.publish(if added {
            ChatUpdate::MessageAdded {
                conversation,
                message: view.clone(),
            }
        } else {
            ChatUpdate::MessageUpdated {
                conversation,
                message: view.clone(),
            }
        });
        Some(view)
    }

    // -- Commands ----------------------------------------------------------

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Send { draft, reply } => {
                if let Err(e) = draft.validate(&self.local.id, self.max_content_len) {
                    debug!(error = %e, "Send rejected locally");
                    let _ = reply.send(Err(e.into()));
                    return;
                }
                let message = self.store.insert_pending(draft, Utc::now());
                self.begin_send(message, reply);
            }
            Command::Resend { client_id, reply } => {
                match self.store.retry_failed(&client_id, Utc::now()) {
                    Ok(message) => {
                        info!(client_id = %client_id, retry = %message.client_id, "Resending failed message");
                        self.begin_send(message, reply);
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e.into()));
                    }
                }
            }
            Command::SelectConversation { counterparty, reply } => {
                let _ = reply.send(self.select_conversation(&counterparty));
            }
            Command::LoadHistory { key, reply } => {
                if key.counterparty(&self.local.id).is_none() {
                    let _ = reply.send(Err(ChatError::Protocol(format!(
                        "{key} is not a conversation of {}",
                        self.local.id
                    ))));
                    return;
                }
                self.start_history(key, Some(reply));
            }
            Command::LoadOlder { key, reply } => self.start_older(key, reply),
            Command::Delete { client_id, reply } => {
                let server_id = match self.store.deletable_server_id(&client_id) {
                    Ok(id) => id,
                    Err(e) => {
                        let _ = reply.send(Err(e.into()));
                        return;
                    }
                };
                let api = Arc::clone(&self.api);
                let target = server_id.clone();
                debug!(client_id = %client_id, msg_id = %server_id, "Deleting message");
                self.spawn_request(
                    async move { api.delete_message(&target).await },
                    move |result| Internal::DeleteDone {
                        server_id,
                        result,
                        reply,
                    },
                );
            }
            Command::UnreadCounts { reply } => {
                let api = Arc::clone(&self.api);
                let timeout = self.request_timeout;
                tokio::spawn(async move {
                    let _ = reply.send(bounded(timeout, api.unread_counts()).await);
                });
            }
            Command::Messages { key, reply } => {
                let _ = reply.send(message_views(&self.store, &key));
            }
            Command::Conversations { reply } => {
                let _ = reply.send(conversation_views(&self.store, &self.directory));
            }
            Command::RefreshConversations { reply } => {
                let api = Arc::clone(&self.api);
                self.spawn_request(
                    async move { api.list_conversations().await },
                    |result| Internal::SummariesDone { result, reply },
                );
            }
            Command::Counterparties {
                filter,
                search,
                reply,
            } => {
                let views = self
                    .directory
                    .list(filter, &search)
                    .into_iter()
                    .map(|c| counterparty_view(c, &self.store, &self.directory))
                    .collect();
                let _ = reply.send(views);
            }
            Command::RefreshDirectory { reply } => {
                let source = Arc::clone(&self.directory_source);
                let roles = eligible_roles(self.directory.role());
                self.spawn_request(
                    async move { source.eligible_counterparties(roles).await },
                    |result| Internal::DirectoryDone { result, reply },
                );
            }
            Command::Shutdown => {}
        }
    }

    /// Run `request` under the bounded timeout and post its result back.
    fn spawn_request<T, F>(&self, request: F, wrap: impl FnOnce(Result<T, ChatError>) -> Internal + Send + 'static)
    where
        T: Send + 'static,
        F: std::future::Future<Output = Result<T, ChatError>> + Send + 'static,
    {
        let tx = self.internal_tx.clone();
        let timeout = self.request_timeout;
        tokio::spawn(async move {
            let result = bounded(timeout, request).await;
            let _ = tx.send(wrap(result));
        });
    }

    fn begin_send(&mut self, message: ChatMessage, reply: Reply<MessageView>) {
        let client_id = message.client_id;
        self.publish_message(&client_id, true);
        self.publish(ChatUpdate::ConversationsChanged);
        self.pending_sends.insert(client_id, reply);

        let api = Arc::clone(&self.api);
        let request = message.to_request();
        debug!(client_id = %client_id, conversation = %message.conversation, "Persisting message");
        self.spawn_request(
            async move { api.post_message(&request).await },
            move |result| Internal::PersistDone { client_id, result },
        );
    }

    fn select_conversation(&mut self, counterparty: &UserId) -> Result<ConversationKey, ChatError> {
        let key = self.store.ensure_conversation(counterparty)?;
        self.directory.set_active(key.clone());
        self.store.mark_read(&key);
        self.spawn_mark_read(counterparty.clone());

        let loaded = self
            .store
            .conversation(&key)
            .is_some_and(|c| c.history_loaded);
        if !loaded {
            self.start_history(key.clone(), None);
        }
        info!(conversation = %key, "Conversation selected");
        self.publish(ChatUpdate::ConversationsChanged);
        Ok(key)
    }

    fn spawn_mark_read(&self, counterparty: UserId) {
        let api = Arc::clone(&self.api);
        let timeout = self.request_timeout;
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, api.mark_read(&counterparty)).await {
                Ok(Ok(())) => debug!(counterparty = %counterparty, "Marked conversation read"),
                Ok(Err(e)) => warn!(counterparty = %counterparty, error = %e, "Failed to mark conversation read"),
                Err(_) => warn!(counterparty = %counterparty, "Mark-read request timed out"),
            }
        });
    }

    /// Start (or join) a load of the newest history page for `key`.
    ///
    /// For a conversation loaded before, pages keep coming until one reaches
    /// a message held locally, so a reconnect leaves no gap.
    fn start_history(&mut self, key: ConversationKey, waiter: Option<Reply<Vec<MessageView>>>) {
        if key.counterparty(&self.local.id).is_none() {
            return;
        }
        let entry = self.history_in_flight.entry(key.clone());
        let already_running = matches!(entry, Entry::Occupied(_));
        let waiters = entry.or_default();
        if let Some(waiter) = waiter {
            waiters.push(waiter);
        }
        if already_running {
            debug!(conversation = %key, "History load already in flight");
            return;
        }

        let fill_gap = self.store.conversation(&key).is_some_and(|c| {
            c.history_loaded && c.messages().iter().any(|m| m.server_id.is_some())
        });
        self.fetch_page(
            key,
            HistoryPage {
                kind: HistoryFetch::Latest,
                offset: 0,
                fill_gap,
                inserted: 0,
            },
        );
    }

    /// Load the page before the oldest message held for `key`.
    fn start_older(&mut self, key: ConversationKey, reply: Reply<Vec<MessageView>>) {
        if key.counterparty(&self.local.id).is_none() {
            let _ = reply.send(Err(ChatError::Protocol(format!(
                "{key} is not a conversation of {}",
                self.local.id
            ))));
            return;
        }
        match self.older_in_flight.entry(key.clone()) {
            Entry::Occupied(mut waiting) => {
                waiting.get_mut().push(reply);
                return;
            }
            Entry::Vacant(slot) => {
                slot.insert(vec![reply]);
            }
        }

        let held = self
            .store
            .messages(&key)
            .iter()
            .filter(|m| m.server_id.is_some())
            .count();
        let offset = u32::try_from(held).unwrap_or(u32::MAX);
        self.fetch_page(
            key,
            HistoryPage {
                kind: HistoryFetch::Older,
                offset,
                fill_gap: false,
                inserted: 0,
            },
        );
    }

    fn fetch_page(&self, key: ConversationKey, page: HistoryPage) {
        let Some(counterparty) = key.counterparty(&self.local.id).cloned() else {
            return;
        };
        let api = Arc::clone(&self.api);
        let limit = self.history_page;
        debug!(conversation = %key, kind = ?page.kind, offset = page.offset, "Requesting history page");
        self.spawn_request(
            async move { api.fetch_history(&counterparty, limit, page.offset).await },
            move |result| Internal::HistoryDone { key, page, result },
        );
    }

    fn spawn_broadcast(&self, record: MessageRecord) {
        let connection = Arc::clone(&self.connection);
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let msg_id = record.id.clone();
            match connection.emit(ClientFrame::SendMessage(record.clone())).await {
                Ok(()) => debug!(msg_id = %msg_id, "Live broadcast emitted"),
                Err(e) => {
                    warn!(msg_id = %msg_id, error = %e, "Live broadcast failed, retrying on reconnect");
                    let _ = tx.send(Internal::BroadcastFailed { record });
                }
            }
        });
    }

    fn spawn_receipt(&self, receipt: DeliveryReceipt) {
        let connection = Arc::clone(&self.connection);
        tokio::spawn(async move {
            if let Err(e) = connection.emit(ClientFrame::MessageDelivered(receipt)).await {
                debug!(error = %e, "Delivery receipt not sent");
            }
        });
    }

    // -- Request results ---------------------------------------------------

    fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::PersistDone { client_id, result } => self.finish_send(client_id, result),
            Internal::HistoryDone { key, page, result } => self.finish_history(key, page, result),
            Internal::DeleteDone {
                server_id,
                result,
                reply,
            } => {
                let outcome = match result {
                    Ok(()) => {
                        self.remove_message(&server_id);
                        Ok(())
                    }
                    Err(e) => {
                        warn!(msg_id = %server_id, error = %e, "Delete failed");
                        Err(e)
                    }
                };
                let _ = reply.send(outcome);
            }
            Internal::BroadcastFailed { record } => {
                if self.connection.state() == ConnectionState::Connected {
                    // The link came back before this report arrived.
                    self.spawn_broadcast(record);
                } else if !self.unbroadcast.iter().any(|r| r.id == record.id) {
                    self.unbroadcast.push(record);
                }
            }
            Internal::SummariesDone { result, reply } => {
                let summaries = match result {
                    Ok(summaries) => summaries,
                    Err(e) => {
                        warn!(error = %e, "Failed to refresh conversations");
                        let _ = reply.send(Err(e));
                        return;
                    }
                };
                for summary in &summaries {
                    self.directory.learn(summary.counterparty.clone());
                    self.store.seed_summary(summary, self.directory.active());
                }
                debug!(count = summaries.len(), "Conversation summaries refreshed");
                self.publish(ChatUpdate::ConversationsChanged);
                let _ = reply.send(Ok(conversation_views(&self.store, &self.directory)));
            }
            Internal::DirectoryDone { result, reply } => {
                let list = match result {
                    Ok(list) => list,
                    Err(e) => {
                        warn!(error = %e, "Failed to refresh directory");
                        let _ = reply.send(Err(e));
                        return;
                    }
                };
                self.directory.replace_counterparties(list);
                self.publish(ChatUpdate::DirectoryChanged);
                let _ = reply.send(Ok(self.directory.list(RoleFilter::All, "").len()));
            }
        }
    }

    fn finish_send(&mut self, client_id: ClientId, result: Result<MessageRecord, ChatError>) {
        let reply = self.pending_sends.remove(&client_id);
        let outcome = match result {
            Ok(record) => match self.store.reconcile_sent(&client_id, &record) {
                Ok(status) => {
                    info!(client_id = %client_id, msg_id = %record.id, status = ?status, "Message sent");
                    self.spawn_broadcast(record);
                    self.publish(ChatUpdate::ConversationsChanged);
                    self.publish_message(&client_id, false)
                        .ok_or(ChatError::Validation(ValidationError::UnknownMessage(client_id)))
                }
                Err(e) => {
                    error!(client_id = %client_id, error = %e, "Acknowledged message could not be reconciled");
                    Err(ChatError::Persistence(e.to_string()))
                }
            },
            Err(e) => {
                let error = send_failure(e);
                match self.store.mark_failed(&client_id) {
                    Ok(true) => {
                        warn!(client_id = %client_id, error = %error, "Message not saved");
                        self.publish_message(&client_id, false);
                        if let Some(message) = self.store.get(&client_id) {
                            self.publish(ChatUpdate::SendFailed {
                                conversation: message.conversation.to_string(),
                                client_id,
                                reason: error.to_string(),
                            });
                        }
                        Err(error)
                    }
                    // Settled meanwhile through a history merge: it did persist.
                    Ok(false) => self
                        .store
                        .get(&client_id)
                        .map(|m| message_view(&self.store, m))
                        .ok_or(ChatError::Validation(ValidationError::UnknownMessage(client_id))),
                    Err(e) => {
                        error!(client_id = %client_id, error = %e, "Failed send could not be recorded");
                        Err(error)
                    }
                }
            }
        };

        if let Some(reply) = reply {
            let _ = reply.send(outcome);
        }
        if let Some(key) = self.store.get(&client_id).map(|m| m.conversation.clone()) {
            self.release_held_echoes(&key);
        }
    }

    /// Own messages from other sessions held back while a send was pending.
    fn release_held_echoes(&mut self, key: &ConversationKey) {
        let released = self.store.flush_early_echoes(key);
        if released.is_empty() {
            return;
        }
        debug!(conversation = %key, count = released.len(), "Held echoes added");
        for client_id in &released {
            self.publish_message(client_id, true);
        }
        self.publish(ChatUpdate::ConversationsChanged);
    }

    fn remove_message(&mut self, server_id: &ServerMessageId) {
        self.unbroadcast.retain(|r| &r.id != server_id);
        if let Some(removed) = self.store.remove_by_server_id(server_id) {
            info!(msg_id = %server_id, conversation = %removed.conversation, "Message removed");
            self.publish(ChatUpdate::MessageRemoved {
                conversation: removed.conversation.to_string(),
                client_id: removed.client_id,
            });
            self.publish(ChatUpdate::ConversationsChanged);
        }
    }

    fn finish_history(
        &mut self,
        key: ConversationKey,
        page: HistoryPage,
        result: Result<Vec<MessageRecord>, ChatError>,
    ) {
        let records = match result {
            Ok(records) => records,
            Err(e) => {
                warn!(conversation = %key, offset = page.offset, error = %e, "History load failed");
                for waiter in self.take_history_waiters(page.kind, &key) {
                    let _ = waiter.send(Err(replicate(&e)));
                }
                return;
            }
        };

        let received = u32::try_from(records.len()).unwrap_or(u32::MAX);
        let full = received >= self.history_page;
        // Pages are ascending, so the first record is the oldest.
        let reached_held = records
            .first()
            .is_some_and(|r| self.store.find_by_server_id(&r.id).is_some());

        let report = self.store.merge_history(&key, records);
        for client_id in &report.reconciled {
            self.publish_message(client_id, false);
        }
        self.release_held_echoes(&key);
        let inserted = page.inserted + report.inserted;

        if page.fill_gap && full && !reached_held {
            debug!(conversation = %key, inserted, "Page missed held messages, paging back");
            self.fetch_page(
                key,
                HistoryPage {
                    offset: page.offset.saturating_add(received),
                    inserted,
                    ..page
                },
            );
            return;
        }

        self.publish(ChatUpdate::HistoryLoaded {
            conversation: key.to_string(),
            inserted,
        });
        self.publish(ChatUpdate::ConversationsChanged);

        let views = message_views(&self.store, &key);
        for waiter in self.take_history_waiters(page.kind, &key) {
            let _ = waiter.send(Ok(views.clone()));
        }
    }

    fn take_history_waiters(
        &mut self,
        kind: HistoryFetch,
        key: &ConversationKey,
    ) -> Vec<Reply<Vec<MessageView>>> {
        let in_flight = match kind {
            HistoryFetch::Latest => &mut self.history_in_flight,
            HistoryFetch::Older => &mut self.older_in_flight,
        };
        in_flight.remove(key).unwrap_or_default()
    }

    // -- Live frames -------------------------------------------------------

    fn handle_frame(&mut self, frame: ServerFrame) {
        match frame {
            ServerFrame::Ready(ready) => {
                if ready.user_id != self.local.id {
                    warn!(expected = %self.local.id, got = %ready.user_id, "Live session bound to another user");
                } else {
                    debug!("Live session ready");
                }
            }
            ServerFrame::NewMessage(record) => self.receive(record),
            ServerFrame::MessageStatus(update) => {
                if let Some(client_id) = self.store.mark_delivered(&update.message_id) {
                    debug!(msg_id = %update.message_id, "Delivery confirmed");
                    self.publish_message(&client_id, false);
                }
            }
            ServerFrame::TypingIndicator(notice) => self.publish(ChatUpdate::Typing {
                user_id: notice.sender_id,
                is_typing: notice.is_typing,
            }),
            ServerFrame::UserStatusChange(presence) => {
                self.directory
                    .set_presence(presence.user_id.clone(), presence.status);
                self.publish(ChatUpdate::Presence {
                    user_id: presence.user_id,
                    status: presence.status,
                });
            }
            ServerFrame::MessageDeleted(notice) => self.deleted_remotely(notice),
            ServerFrame::Error(notice) => {
                warn!(message = %notice.message, "Server reported an error");
            }
        }
    }

    fn deleted_remotely(&mut self, notice: DeletedMessage) {
        if notice.sender_id != self.local.id && notice.recipient_id != self.local.id {
            warn!(msg_id = %notice.message_id, "Deletion notice for another conversation");
            return;
        }
        self.remove_message(&notice.message_id);
    }

    fn receive(&mut self, record: MessageRecord) {
        let sender = record.sender_id.clone();
        let msg_id = record.id.clone();
        if sender != self.local.id && self.directory.counterparty(&sender).is_none() {
            self.directory.learn(Counterparty {
                id: sender.clone(),
                display_name: record.sender_name.clone(),
                role: record.sender_role,
                specialty: String::new(),
                is_active: true,
            });
        }

        match self.store.apply_incoming(record, self.directory.active()) {
            IncomingOutcome::Inserted { client_id, unread } => {
                debug!(msg_id = %msg_id, unread, "Live message inserted");
                self.publish_message(&client_id, true);
                self.publish(ChatUpdate::ConversationsChanged);
                if !unread {
                    self.spawn_mark_read(sender.clone());
                }
                self.spawn_receipt(DeliveryReceipt {
                    message_id: msg_id,
                    sender_id: sender,
                });
            }
            IncomingOutcome::OwnEcho {
                promoted: Some(client_id),
            } => {
                self.publish_message(&client_id, false);
            }
            IncomingOutcome::OwnInserted { client_id } => {
                debug!(msg_id = %msg_id, "Own message from another session");
                self.publish_message(&client_id, true);
                self.publish(ChatUpdate::ConversationsChanged);
            }
            IncomingOutcome::OwnEcho { promoted: None }
            | IncomingOutcome::Duplicate
            | IncomingOutcome::Foreign => {}
        }
    }

    // -- Connection lifecycle ----------------------------------------------

    fn handle_lifecycle(&mut self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::Connected => {
                let queued = std::mem::take(&mut self.unbroadcast);
                if !queued.is_empty() {
                    info!(count = queued.len(), "Re-broadcasting messages saved while offline");
                }
                for record in queued {
                    self.spawn_broadcast(record);
                }
                if std::mem::take(&mut self.resync_on_connect) {
                    let keys = self.store.loaded_conversations();
                    info!(conversations = keys.len(), "Reconnected, re-fetching history");
                    for key in keys {
                        self.start_history(key, None);
                    }
                }
            }
            LifecycleEvent::Disconnected(reason) => {
                if matches!(reason, DisconnectReason::TransportLost(_)) {
                    self.resync_on_connect = true;
                }
                self.directory.clear_presence();
            }
            LifecycleEvent::Reconnecting { attempt, delay } => {
                debug!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting");
            }
        }
        self.publish(ChatUpdate::Connection {
            state: self.connection.state(),
        });
    }
}

/// Await `request`, turning a timeout into a network error.
async fn bounded<T>(
    timeout: Duration,
    request: impl std::future::Future<Output = Result<T, ChatError>>,
) -> Result<T, ChatError> {
    match tokio::time::timeout(timeout, request).await {
        Ok(result) => result,
        Err(_) => Err(ChatError::Network(format!(
            "no response within {} ms",
            timeout.as_millis()
        ))),
    }
}

/// Failures of a send surface as "your message didn't save", keeping the
/// cause in the text. Auth and local validation keep their kind.
fn send_failure(e: ChatError) -> ChatError {
    match e {
        ChatError::Persistence(_) | ChatError::Auth(_) | ChatError::Validation(_) => e,
        ChatError::Network(cause) => ChatError::Persistence(format!("message not saved: {cause}")),
        other => ChatError::Persistence(other.to_string()),
    }
}

/// `ChatError` is not `Clone`; rebuild an equivalent value for each waiter.
fn replicate(e: &ChatError) -> ChatError {
    match e {
        ChatError::Auth(m) => ChatError::Auth(m.clone()),
        ChatError::Transport(m) => ChatError::Transport(m.clone()),
        ChatError::Persistence(m) => ChatError::Persistence(m.clone()),
        ChatError::Network(m) => ChatError::Network(m.clone()),
        ChatError::Validation(v) => ChatError::Validation(v.clone()),
        ChatError::Protocol(m) => ChatError::Protocol(m.clone()),
        ChatError::Serialization(inner) => ChatError::Protocol(inner.to_string()),
        ChatError::Closed => ChatError::Closed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_failures_read_as_not_saved() {
        let e = send_failure(ChatError::Network("timed out".into()));
        assert!(matches!(&e, ChatError::Persistence(m) if m.contains("timed out")));

        let e = send_failure(ChatError::Persistence("400: Recipient not found".into()));
        assert!(matches!(e, ChatError::Persistence(_)));
        assert!(matches!(
            send_failure(ChatError::Auth("expired".into())),
            ChatError::Auth(_)
        ));
    }

    #[test]
    fn replicate_preserves_kind() {
        assert!(matches!(
            replicate(&ChatError::Network("offline".into())),
            ChatError::Network(m) if m == "offline"
        ));
        assert!(matches!(replicate(&ChatError::Closed), ChatError::Closed));
    }
}
