//! In-process fakes for engine and client tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use carechat_shared::protocol::{
    ConversationSummary, Counterparty, LastMessage, MessageRecord, SendMessageRequest,
    UnreadCounts,
};
use carechat_shared::types::{ClientId, ConversationKey, Credential, Role, ServerMessageId, UserId};
use carechat_shared::ChatError;

use crate::api::{DirectorySource, PersistenceApi};
use crate::events::ChatUpdate;
use crate::session::{LocalUser, Session};

pub(crate) fn user(id: &str, name: &str, role: Role) -> LocalUser {
    LocalUser {
        id: UserId::from(id),
        display_name: name.into(),
        role,
    }
}

pub(crate) fn session_for(user: &LocalUser) -> Session {
    Session {
        user: user.clone(),
        credential: Credential::new(format!("token-{}", user.id)),
    }
}

#[derive(Default)]
struct State {
    users: Vec<Counterparty>,
    messages: Vec<MessageRecord>,
    post_failures: VecDeque<ChatError>,
    history_failures: VecDeque<ChatError>,
    ack_delay: Duration,
    history_delay: Duration,
    next_id: u64,
    posts: usize,
    history_calls: usize,
    read_marks: Vec<(UserId, UserId)>,
}

/// Shared server-side state behind every [`FakeApi`].
#[derive(Default)]
pub(crate) struct FakeServer {
    state: Mutex<State>,
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn add_user(&self, user: &LocalUser, specialty: &str) {
        self.lock().users.push(Counterparty {
            id: user.id.clone(),
            display_name: user.display_name.clone(),
            role: user.role,
            specialty: specialty.into(),
            is_active: true,
        });
    }

    pub fn api_for(self: &Arc<Self>, user: &LocalUser) -> Arc<FakeApi> {
        Arc::new(FakeApi {
            server: Arc::clone(self),
            user: user.clone(),
        })
    }

    pub fn fail_next_post(&self, err: ChatError) {
        self.lock().post_failures.push_back(err);
    }

    pub fn fail_next_history(&self, err: ChatError) {
        self.lock().history_failures.push_back(err);
    }

    /// Delay between storing a posted message and acknowledging it.
    pub fn set_ack_delay(&self, delay: Duration) {
        self.lock().ack_delay = delay;
    }

    pub fn set_history_delay(&self, delay: Duration) {
        self.lock().history_delay = delay;
    }

    /// Persist a message directly, as if sent from another device.
    pub fn store(&self, sender: &LocalUser, recipient: &UserId, content: &str) -> MessageRecord {
        let mut state = self.lock();
        let record = state.record(sender, recipient.clone(), content.into(), None);
        state.messages.push(record.clone());
        record
    }

    pub fn messages(&self) -> Vec<MessageRecord> {
        self.lock().messages.clone()
    }

    pub fn posts(&self) -> usize {
        self.lock().posts
    }

    pub fn history_calls(&self) -> usize {
        self.lock().history_calls
    }

    pub fn read_marks(&self) -> Vec<(UserId, UserId)> {
        self.lock().read_marks.clone()
    }
}

impl State {
    fn record(
        &mut self,
        sender: &LocalUser,
        recipient_id: UserId,
        content: String,
        client_ref: Option<ClientId>,
    ) -> MessageRecord {
        self.next_id += 1;
        MessageRecord {
            id: ServerMessageId::new(format!("srv-{}", self.next_id)),
            sender_id: sender.id.clone(),
            sender_name: sender.display_name.clone(),
            sender_role: sender.role,
            recipient_id,
            content,
            message_type: Default::default(),
            attachment: None,
            reply_to: None,
            client_ref,
            created_at: base_time() + chrono::Duration::seconds(self.next_id as i64),
            read: false,
        }
    }
}

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

/// One user's view of the [`FakeServer`].
pub(crate) struct FakeApi {
    server: Arc<FakeServer>,
    user: LocalUser,
}

#[async_trait]
impl PersistenceApi for FakeApi {
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, ChatError> {
        let state = self.server.lock();
        let me = &self.user.id;
        let mut summaries: Vec<ConversationSummary> = Vec::new();
        for user in state.users.iter().filter(|u| &u.id != me) {
            let key = ConversationKey::between(me, &user.id);
            let thread: Vec<_> = state
                .messages
                .iter()
                .filter(|m| m.conversation_key() == key)
                .collect();
            let Some(last) = thread.last() else { continue };
            summaries.push(ConversationSummary {
                counterparty: user.clone(),
                last_message: Some(LastMessage {
                    content: last.content.clone(),
                    sender_id: last.sender_id.clone(),
                    message_type: last.message_type,
                    timestamp: last.created_at,
                }),
                unread_count: thread
                    .iter()
                    .filter(|m| &m.recipient_id == me && !m.read)
                    .count() as u32,
                last_activity: Some(last.created_at),
            });
        }
        Ok(summaries)
    }

    async fn fetch_history(
        &self,
        counterparty: &UserId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<MessageRecord>, ChatError> {
        let delay = {
            let mut state = self.server.lock();
            state.history_calls += 1;
            if let Some(err) = state.history_failures.pop_front() {
                return Err(err);
            }
            state.history_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let key = ConversationKey::between(&self.user.id, counterparty);
        let state = self.server.lock();
        let thread: Vec<_> = state
            .messages
            .iter()
            .filter(|m| m.conversation_key() == key)
            .cloned()
            .collect();
        let end = thread.len().saturating_sub(offset as usize);
        let start = end.saturating_sub(limit as usize);
        Ok(thread[start..end].to_vec())
    }

    async fn post_message(&self, request: &SendMessageRequest) -> Result<MessageRecord, ChatError> {
        let (record, delay) = {
            let mut state = self.server.lock();
            state.posts += 1;
            if let Some(err) = state.post_failures.pop_front() {
                return Err(err);
            }
            let existing = state
                .messages
                .iter()
                .find(|m| m.sender_id == self.user.id && m.client_ref.is_some() && m.client_ref == request.client_ref)
                .cloned();
            let record = match existing {
                Some(record) => record,
                None => {
                    let mut record = state.record(
                        &self.user,
                        request.recipient_id.clone(),
                        request.content.clone(),
                        request.client_ref,
                    );
                    record.message_type = request.message_type;
                    record.attachment = request.attachment.clone();
                    record.reply_to = request.reply_to.clone();
                    state.messages.push(record.clone());
                    record
                }
            };
            (record, state.ack_delay)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(record)
    }

    async fn mark_read(&self, counterparty: &UserId) -> Result<(), ChatError> {
        let mut state = self.server.lock();
        for m in state
            .messages
            .iter_mut()
            .filter(|m| &m.sender_id == counterparty && m.recipient_id == self.user.id)
        {
            m.read = true;
        }
        state
            .read_marks
            .push((self.user.id.clone(), counterparty.clone()));
        Ok(())
    }

    async fn delete_message(&self, id: &ServerMessageId) -> Result<(), ChatError> {
        let mut state = self.server.lock();
        let Some(pos) = state.messages.iter().position(|m| &m.id == id) else {
            return Err(ChatError::Persistence("404 Not Found: Message not found".into()));
        };
        if state.messages[pos].sender_id != self.user.id {
            return Err(ChatError::Persistence(
                "403 Forbidden: You can only delete your own messages".into(),
            ));
        }
        state.messages.remove(pos);
        Ok(())
    }

    async fn unread_counts(&self) -> Result<UnreadCounts, ChatError> {
        let state = self.server.lock();
        let mut counts = UnreadCounts::default();
        for m in state
            .messages
            .iter()
            .filter(|m| m.recipient_id == self.user.id && !m.read)
        {
            counts.total_unread += 1;
            *counts
                .unread_by_conversation
                .entry(m.conversation_key().to_string())
                .or_default() += 1;
        }
        Ok(counts)
    }
}

#[async_trait]
impl DirectorySource for FakeApi {
    async fn eligible_counterparties(&self, roles: &[Role]) -> Result<Vec<Counterparty>, ChatError> {
        let state = self.server.lock();
        Ok(state
            .users
            .iter()
            .filter(|u| u.id != self.user.id && roles.contains(&u.role))
            .cloned()
            .collect())
    }
}

/// Wait for the first update matching `pred`.
pub(crate) async fn next_update(
    rx: &mut broadcast::Receiver<ChatUpdate>,
    mut pred: impl FnMut(&ChatUpdate) -> bool,
) -> ChatUpdate {
    let wait = async {
        loop {
            match rx.recv().await {
                Ok(update) if pred(&update) => return update,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => panic!("update channel closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(30), wait)
        .await
        .expect("expected update was not published")
}

/// Poll `cond` until it holds.
pub(crate) async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never became true");
}
