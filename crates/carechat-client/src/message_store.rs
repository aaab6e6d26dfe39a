//! Per-conversation message log with optimistic entries.
//!
//! Each message moves through a small state machine:
//!
//! ```text
//! (none) --compose--> pending --persist ack--> sent --live ack--> delivered
//!                        |---persist failure--> failed
//! ```
//!
//! Until the server assigns an id, entries are identified by their
//! [`ClientId`]; afterwards every dedup decision is keyed on the
//! [`ServerMessageId`]. A message deleted on the server leaves the log
//! entirely.

use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use carechat_shared::protocol::{Attachment, ConversationSummary, MessageRecord, SendMessageRequest};
use carechat_shared::types::{ClientId, ConversationKey, MessageKind, Role, ServerMessageId, UserId};
use carechat_shared::ValidationError;

use crate::session::LocalUser;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Sent,
    Delivered,
    Failed,
}

impl MessageStatus {
    /// The only legal forward transitions.
    pub fn can_advance_to(self, next: MessageStatus) -> bool {
        matches!(
            (self, next),
            (MessageStatus::Pending, MessageStatus::Sent)
                | (MessageStatus::Pending, MessageStatus::Failed)
                | (MessageStatus::Sent, MessageStatus::Delivered)
        )
    }

    /// Accepted by the server.
    pub fn is_settled(self) -> bool {
        matches!(self, MessageStatus::Sent | MessageStatus::Delivered)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageStoreError {
    #[error("Unknown message {0}")]
    UnknownMessage(ClientId),

    #[error("Message {client_id} cannot move from {from:?} to {to:?}")]
    IllegalTransition {
        client_id: ClientId,
        from: MessageStatus,
        to: MessageStatus,
    },
}

impl From<MessageStoreError> for ValidationError {
    fn from(e: MessageStoreError) -> Self {
        match e {
            MessageStoreError::UnknownMessage(id) => ValidationError::UnknownMessage(id),
            MessageStoreError::IllegalTransition { client_id, .. } => {
                ValidationError::NotResendable(client_id)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Drafts and messages
// ---------------------------------------------------------------------------

/// What the user composed, before it becomes a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Draft {
    pub recipient_id: UserId,
    pub content: String,
    pub kind: MessageKind,
    pub attachment: Option<Attachment>,
    pub reply_to: Option<ServerMessageId>,
}

impl Draft {
    pub fn text(recipient_id: UserId, content: impl Into<String>) -> Self {
        Self {
            recipient_id,
            content: content.into(),
            kind: MessageKind::Text,
            attachment: None,
            reply_to: None,
        }
    }

    pub fn replying_to(mut self, target: ServerMessageId) -> Self {
        self.reply_to = Some(target);
        self
    }

    pub fn with_attachment(mut self, kind: MessageKind, attachment: Attachment) -> Self {
        self.kind = kind;
        self.attachment = Some(attachment);
        self
    }

    /// Local checks run before anything touches the store or the network.
    pub fn validate(&self, sender: &UserId, max_len: usize) -> Result<(), ValidationError> {
        if &self.recipient_id == sender {
            return Err(ValidationError::SelfConversation);
        }
        if self.kind.needs_attachment() {
            if self.attachment.is_none() {
                return Err(ValidationError::MissingAttachment(self.kind.as_str()));
            }
        } else if self.content.trim().is_empty() {
            return Err(ValidationError::EmptyContent);
        }
        let len = self.content.chars().count();
        if len > max_len {
            return Err(ValidationError::ContentTooLong { len, max: max_len });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub client_id: ClientId,
    pub server_id: Option<ServerMessageId>,
    pub conversation: ConversationKey,
    pub sender_id: UserId,
    pub sender_name: String,
    pub sender_role: Role,
    pub recipient_id: UserId,
    pub content: String,
    pub kind: MessageKind,
    pub attachment: Option<Attachment>,
    /// Client clock while pending, server clock once settled.
    pub created_at: DateTime<Utc>,
    pub status: MessageStatus,
    pub reply_to: Option<ServerMessageId>,
    /// For a resend, the failed entry it retries.
    pub resend_of: Option<ClientId>,
    /// Submission order, used to order pending entries.
    seq: u64,
    /// Newest settled time in the conversation when this entry was composed.
    /// A failed entry sorts here instead of at its client clock.
    anchor: DateTime<Utc>,
}

impl ChatMessage {
    /// Body of the persistence request for this (pending) entry.
    pub fn to_request(&self) -> SendMessageRequest {
        SendMessageRequest {
            recipient_id: self.recipient_id.clone(),
            content: self.content.clone(),
            message_type: self.kind,
            reply_to: self.reply_to.clone(),
            attachment: self.attachment.clone(),
            client_ref: Some(self.client_id),
        }
    }

    fn from_record(record: MessageRecord, status: MessageStatus, seq: u64) -> Self {
        Self {
            client_id: record.client_ref.unwrap_or_default(),
            conversation: record.conversation_key(),
            server_id: Some(record.id),
            sender_id: record.sender_id,
            sender_name: record.sender_name,
            sender_role: record.sender_role,
            recipient_id: record.recipient_id,
            content: record.content,
            kind: record.message_type,
            attachment: record.attachment,
            created_at: record.created_at,
            status,
            reply_to: record.reply_to,
            resend_of: None,
            seq,
            anchor: record.created_at,
        }
    }

    /// Position in canonical order for non-pending entries.
    fn order_time(&self) -> DateTime<Utc> {
        if self.status == MessageStatus::Failed {
            self.anchor
        } else {
            self.created_at
        }
    }
}

/// Canonical order: settled entries by server timestamp with failed entries
/// at their anchor, then pending entries in submission order. Client clocks
/// never decide order.
fn canonical_order(a: &ChatMessage, b: &ChatMessage) -> Ordering {
    let pending_a = a.status == MessageStatus::Pending;
    let pending_b = b.status == MessageStatus::Pending;
    match (pending_a, pending_b) {
        (true, true) => a.seq.cmp(&b.seq),
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a
            .order_time()
            .cmp(&b.order_time())
            .then_with(|| {
                let failed_a = a.status == MessageStatus::Failed;
                let failed_b = b.status == MessageStatus::Failed;
                failed_a.cmp(&failed_b)
            })
            .then_with(|| a.server_id.cmp(&b.server_id))
            .then_with(|| a.seq.cmp(&b.seq)),
    }
}

// ---------------------------------------------------------------------------
// Conversations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Conversation {
    pub key: ConversationKey,
    pub counterparty_id: UserId,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub unread_count: u32,
    pub history_loaded: bool,
    /// Preview seeded from a server summary before history is loaded.
    pub summary_preview: Option<String>,
    messages: Vec<ChatMessage>,
}

impl Conversation {
    fn new(key: ConversationKey, counterparty_id: UserId) -> Self {
        Self {
            key,
            counterparty_id,
            last_activity_at: None,
            unread_count: 0,
            history_loaded: false,
            summary_preview: None,
            messages: Vec::new(),
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn last_message(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    fn touch(&mut self, at: DateTime<Utc>) {
        if self.last_activity_at.map_or(true, |prev| at > prev) {
            self.last_activity_at = Some(at);
        }
    }

    fn sort(&mut self) {
        self.messages.sort_by(canonical_order);
    }

    fn position(&self, client_id: &ClientId) -> Option<usize> {
        self.messages.iter().position(|m| &m.client_id == client_id)
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncomingOutcome {
    /// New entry inserted as delivered.
    Inserted { client_id: ClientId, unread: bool },
    /// Already present under this server id.
    Duplicate,
    /// Echo of our own send. `promoted` when it moved an entry to delivered.
    OwnEcho { promoted: Option<ClientId> },
    /// Own message sent from another session, added to the log.
    OwnInserted { client_id: ClientId },
    /// Frame about a conversation the local user is not part of.
    Foreign,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub inserted: usize,
    /// Pending entries settled through their client reference.
    pub reconciled: Vec<ClientId>,
    pub duplicates: usize,
}

/// Reply reference resolved against the local log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyRef<'a> {
    Resolved(&'a ChatMessage),
    /// Target not present locally; render a placeholder.
    Stub(&'a ServerMessageId),
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct MessageStore {
    local: LocalUser,
    conversations: HashMap<ConversationKey, Conversation>,
    by_client: HashMap<ClientId, ConversationKey>,
    by_server: HashMap<ServerMessageId, ClientId>,
    /// Own echoes that arrived while a send in their conversation was still
    /// pending. Held until that send settles, then added if unmatched.
    early_echoes: HashMap<ServerMessageId, MessageRecord>,
    next_seq: u64,
}

impl MessageStore {
    pub fn new(local: LocalUser) -> Self {
        Self {
            local,
            conversations: HashMap::new(),
            by_client: HashMap::new(),
            by_server: HashMap::new(),
            early_echoes: HashMap::new(),
            next_seq: 0,
        }
    }

    pub fn local_user(&self) -> &LocalUser {
        &self.local
    }

    fn seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Materialise the conversation with `counterparty`.
    pub fn ensure_conversation(
        &mut self,
        counterparty: &UserId,
    ) -> Result<ConversationKey, ValidationError> {
        if counterparty == &self.local.id {
            return Err(ValidationError::SelfConversation);
        }
        let key = ConversationKey::between(&self.local.id, counterparty);
        self.conversation_entry(&key);
        Ok(key)
    }

    fn conversation_entry(&mut self, key: &ConversationKey) -> &mut Conversation {
        let local = &self.local.id;
        self.conversations.entry(key.clone()).or_insert_with(|| {
            let counterparty = key
                .counterparty(local)
                .cloned()
                .unwrap_or_else(|| key.participants().1.clone());
            Conversation::new(key.clone(), counterparty)
        })
    }

    pub fn conversation(&self, key: &ConversationKey) -> Option<&Conversation> {
        self.conversations.get(key)
    }

    /// All conversations, most recently active first.
    pub fn conversations(&self) -> Vec<&Conversation> {
        let mut list: Vec<_> = self.conversations.values().collect();
        list.sort_by(|a, b| {
            b.last_activity_at
                .cmp(&a.last_activity_at)
                .then_with(|| a.key.cmp(&b.key))
        });
        list
    }

    pub fn messages(&self, key: &ConversationKey) -> &[ChatMessage] {
        self.conversations
            .get(key)
            .map(|c| c.messages())
            .unwrap_or_default()
    }

    pub fn get(&self, client_id: &ClientId) -> Option<&ChatMessage> {
        let key = self.by_client.get(client_id)?;
        let conv = self.conversations.get(key)?;
        conv.messages.iter().find(|m| &m.client_id == client_id)
    }

    pub fn find_by_server_id(&self, id: &ServerMessageId) -> Option<&ChatMessage> {
        self.by_server.get(id).and_then(|cid| self.get(cid))
    }

    /// Conversations whose history has been fetched at least once.
    pub fn loaded_conversations(&self) -> Vec<ConversationKey> {
        self.conversations
            .values()
            .filter(|c| c.history_loaded)
            .map(|c| c.key.clone())
            .collect()
    }

    fn entry_mut(&mut self, client_id: &ClientId) -> Option<(&mut Conversation, usize)> {
        let key = self.by_client.get(client_id)?;
        let conv = self.conversations.get_mut(key)?;
        let idx = conv.position(client_id)?;
        Some((conv, idx))
    }

    fn has_pending(&self, key: &ConversationKey) -> bool {
        self.conversations
            .get(key)
            .is_some_and(|c| c.messages.iter().any(|m| m.status == MessageStatus::Pending))
    }

    fn insert_entry(&mut self, message: ChatMessage) {
        if let Some(server_id) = &message.server_id {
            self.early_echoes.remove(server_id);
            self.by_server.insert(server_id.clone(), message.client_id);
        }
        self.by_client
            .insert(message.client_id, message.conversation.clone());
        let created_at = message.created_at;
        let conv = self.conversation_entry(&message.conversation.clone());
        conv.messages.push(message);
        conv.touch(created_at);
        conv.sort();
    }

    // -- Send path ---------------------------------------------------------

    /// Insert an optimistic entry for a validated draft.
    pub fn insert_pending(&mut self, draft: Draft, now: DateTime<Utc>) -> ChatMessage {
        self.insert_pending_with(draft, now, None)
    }

    fn insert_pending_with(
        &mut self,
        draft: Draft,
        now: DateTime<Utc>,
        resend_of: Option<ClientId>,
    ) -> ChatMessage {
        let mut client_id = ClientId::new();
        while self.by_client.contains_key(&client_id) {
            client_id = ClientId::new();
        }
        let seq = self.seq();
        let conversation = ConversationKey::between(&self.local.id, &draft.recipient_id);
        let anchor = self
            .conversations
            .get(&conversation)
            .and_then(|c| {
                c.messages
                    .iter()
                    .filter(|m| m.status.is_settled())
                    .map(|m| m.created_at)
                    .max()
            })
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let message = ChatMessage {
            client_id,
            server_id: None,
            conversation,
            sender_id: self.local.id.clone(),
            sender_name: self.local.display_name.clone(),
            sender_role: self.local.role,
            recipient_id: draft.recipient_id,
            content: draft.content,
            kind: draft.kind,
            attachment: draft.attachment,
            created_at: now,
            status: MessageStatus::Pending,
            reply_to: draft.reply_to,
            resend_of,
            seq,
            anchor,
        };
        debug!(client_id = %client_id, conversation = %message.conversation, "Pending entry inserted");
        self.insert_entry(message.clone());
        message
    }

    /// Settle a pending entry with the server's canonical record.
    ///
    /// Returns the entry's status afterwards. An entry already settled
    /// through a history merge is left as is.
    pub fn reconcile_sent(
        &mut self,
        client_id: &ClientId,
        record: &MessageRecord,
    ) -> Result<MessageStatus, MessageStoreError> {
        // A history load may have inserted a separate copy of this message
        // before the ack arrived. Ours wins; carry over its status.
        let mut copy_status = None;
        if let Some(other) = self.by_server.get(&record.id).copied() {
            if &other != client_id {
                copy_status = self.remove_entry(&other).map(|m| m.status);
                debug!(msg_id = %record.id, "Dropped duplicate copy during reconciliation");
            }
        }

        let delivered_early =
            self.early_echoes.remove(&record.id).is_some()
                || copy_status == Some(MessageStatus::Delivered);

        let (conv, idx) = self
            .entry_mut(client_id)
            .ok_or(MessageStoreError::UnknownMessage(*client_id))?;
        let entry = &mut conv.messages[idx];

        match entry.status {
            MessageStatus::Pending => {
                entry.server_id = Some(record.id.clone());
                entry.created_at = record.created_at;
                entry.content = record.content.clone();
                entry.status = if delivered_early {
                    MessageStatus::Delivered
                } else {
                    MessageStatus::Sent
                };
            }
            MessageStatus::Sent | MessageStatus::Delivered => {
                if delivered_early && entry.status == MessageStatus::Sent {
                    entry.status = MessageStatus::Delivered;
                }
            }
            MessageStatus::Failed => {
                return Err(MessageStoreError::IllegalTransition {
                    client_id: *client_id,
                    from: MessageStatus::Failed,
                    to: MessageStatus::Sent,
                })
            }
        }
        let status = entry.status;
        conv.touch(record.created_at);
        conv.sort();
        self.by_server.insert(record.id.clone(), *client_id);
        Ok(status)
    }

    /// Mark a pending entry failed. Returns `false` when the entry was
    /// already settled by another path (its persistence did succeed).
    pub fn mark_failed(&mut self, client_id: &ClientId) -> Result<bool, MessageStoreError> {
        let (conv, idx) = self
            .entry_mut(client_id)
            .ok_or(MessageStoreError::UnknownMessage(*client_id))?;
        let entry = &mut conv.messages[idx];
        match entry.status {
            MessageStatus::Pending => {
                entry.status = MessageStatus::Failed;
                conv.sort();
                Ok(true)
            }
            status if status.is_settled() => Ok(false),
            from => Err(MessageStoreError::IllegalTransition {
                client_id: *client_id,
                from,
                to: MessageStatus::Failed,
            }),
        }
    }

    /// Record that the live stream confirmed `server_id`. Returns the entry
    /// promoted to delivered, if any. Ids not held locally are ignored.
    pub fn mark_delivered(&mut self, server_id: &ServerMessageId) -> Option<ClientId> {
        let client_id = self.by_server.get(server_id).copied()?;
        let (conv, idx) = self.entry_mut(&client_id)?;
        let entry = &mut conv.messages[idx];
        if entry.status.can_advance_to(MessageStatus::Delivered) {
            entry.status = MessageStatus::Delivered;
            Some(client_id)
        } else {
            None
        }
    }

    /// Create a new pending entry with the content of a failed one. The
    /// failed entry stays in the log.
    pub fn retry_failed(
        &mut self,
        client_id: &ClientId,
        now: DateTime<Utc>,
    ) -> Result<ChatMessage, ValidationError> {
        let failed = self
            .get(client_id)
            .ok_or(ValidationError::UnknownMessage(*client_id))?;
        if failed.status != MessageStatus::Failed {
            return Err(ValidationError::NotResendable(*client_id));
        }
        let draft = Draft {
            recipient_id: failed.recipient_id.clone(),
            content: failed.content.clone(),
            kind: failed.kind,
            attachment: failed.attachment.clone(),
            reply_to: failed.reply_to.clone(),
        };
        Ok(self.insert_pending_with(draft, now, Some(*client_id)))
    }

    fn remove_entry(&mut self, client_id: &ClientId) -> Option<ChatMessage> {
        let key = self.by_client.remove(client_id)?;
        let conv = self.conversations.get_mut(&key)?;
        let idx = conv.position(client_id)?;
        let removed = conv.messages.remove(idx);
        if let Some(server_id) = &removed.server_id {
            if self.by_server.get(server_id) == Some(client_id) {
                self.by_server.remove(server_id);
            }
        }
        Some(removed)
    }

    /// Server id of an own settled message, the only kind that can be
    /// deleted.
    pub fn deletable_server_id(&self, client_id: &ClientId) -> Result<ServerMessageId, ValidationError> {
        let message = self
            .get(client_id)
            .ok_or(ValidationError::UnknownMessage(*client_id))?;
        match &message.server_id {
            Some(id) if message.sender_id == self.local.id && message.status.is_settled() => {
                Ok(id.clone())
            }
            _ => Err(ValidationError::NotDeletable(*client_id)),
        }
    }

    /// Drop a message deleted on the server. An unread inbound message also
    /// leaves the unread count.
    pub fn remove_by_server_id(&mut self, server_id: &ServerMessageId) -> Option<ChatMessage> {
        self.early_echoes.remove(server_id);
        let client_id = self.by_server.get(server_id).copied()?;
        let key = self.by_client.get(&client_id)?.clone();

        // Unread messages are the newest `unread_count` inbound ones.
        let was_unread = self.conversations.get(&key).is_some_and(|conv| {
            let inbound: Vec<_> = conv
                .messages
                .iter()
                .filter(|m| m.sender_id != self.local.id)
                .collect();
            let first_unread = inbound.len().saturating_sub(conv.unread_count as usize);
            inbound[first_unread..].iter().any(|m| m.client_id == client_id)
        });

        let removed = self.remove_entry(&client_id)?;
        if was_unread {
            if let Some(conv) = self.conversations.get_mut(&key) {
                conv.unread_count = conv.unread_count.saturating_sub(1);
            }
        }
        debug!(msg_id = %server_id, conversation = %key, was_unread, "Message removed");
        Some(removed)
    }

    // -- Receive path ------------------------------------------------------

    /// Apply a live `new_message`.
    pub fn apply_incoming(
        &mut self,
        record: MessageRecord,
        active: Option<&ConversationKey>,
    ) -> IncomingOutcome {
        if record.sender_id == self.local.id {
            return self.apply_own_echo(record);
        }
        if record.recipient_id != self.local.id {
            warn!(msg_id = %record.id, "Dropping message not addressed to the local user");
            return IncomingOutcome::Foreign;
        }
        if self.by_server.contains_key(&record.id) {
            debug!(msg_id = %record.id, "Duplicate live message discarded");
            return IncomingOutcome::Duplicate;
        }

        let key = record.conversation_key();
        let unread = active != Some(&key);
        let seq = self.seq();
        let mut message = ChatMessage::from_record(record, MessageStatus::Delivered, seq);
        message.client_id = self.fresh_client_id(message.client_id);
        let client_id = message.client_id;
        self.insert_entry(message);
        if unread {
            self.conversation_entry(&key).unread_count += 1;
        }
        IncomingOutcome::Inserted { client_id, unread }
    }

    /// Our own message relayed back. It either settles a local entry, waits
    /// for a pending send in its conversation, or was sent elsewhere.
    fn apply_own_echo(&mut self, record: MessageRecord) -> IncomingOutcome {
        if self.by_server.contains_key(&record.id) {
            return IncomingOutcome::OwnEcho {
                promoted: self.mark_delivered(&record.id),
            };
        }

        if let Some(client_ref) = record.client_ref {
            let pending = self
                .get(&client_ref)
                .is_some_and(|m| m.status == MessageStatus::Pending);
            if pending && self.reconcile_sent(&client_ref, &record).is_ok() {
                debug!(msg_id = %record.id, client_id = %client_ref, "Echo settled a pending send");
                return IncomingOutcome::OwnEcho {
                    promoted: self.mark_delivered(&record.id),
                };
            }
        }

        let key = record.conversation_key();
        if self.has_pending(&key) {
            debug!(msg_id = %record.id, conversation = %key, "Holding echo until pending sends settle");
            self.early_echoes.insert(record.id.clone(), record);
            return IncomingOutcome::OwnEcho { promoted: None };
        }

        IncomingOutcome::OwnInserted {
            client_id: self.insert_own_copy(record),
        }
    }

    fn insert_own_copy(&mut self, record: MessageRecord) -> ClientId {
        let seq = self.seq();
        let mut message = ChatMessage::from_record(record, MessageStatus::Delivered, seq);
        message.client_id = self.fresh_client_id(message.client_id);
        let client_id = message.client_id;
        self.insert_entry(message);
        client_id
    }

    /// Add held echoes of `key` that no send claimed. Does nothing while a
    /// send in `key` is still pending. Returns the inserted entries.
    pub fn flush_early_echoes(&mut self, key: &ConversationKey) -> Vec<ClientId> {
        if self.early_echoes.is_empty() || self.has_pending(key) {
            return Vec::new();
        }
        let held: Vec<ServerMessageId> = self
            .early_echoes
            .iter()
            .filter(|(_, record)| &record.conversation_key() == key)
            .map(|(id, _)| id.clone())
            .collect();

        let mut inserted = Vec::new();
        for id in held {
            if let Some(record) = self.early_echoes.remove(&id) {
                if !self.by_server.contains_key(&id) {
                    inserted.push(self.insert_own_copy(record));
                }
            }
        }
        inserted
    }

    /// Client ids of foreign messages come from the sender's `clientRef`; make
    /// sure they never collide with a local entry.
    fn fresh_client_id(&self, proposed: ClientId) -> ClientId {
        let mut id = proposed;
        while self.by_client.contains_key(&id) {
            id = ClientId::new();
        }
        id
    }

    /// Merge a fetched history page into `key`, deduplicating by server id.
    pub fn merge_history(&mut self, key: &ConversationKey, records: Vec<MessageRecord>) -> MergeReport {
        let mut report = MergeReport::default();
        self.conversation_entry(key);

        for record in records {
            if &record.conversation_key() != key {
                warn!(msg_id = %record.id, conversation = %key, "History record from another conversation");
                continue;
            }
            if self.by_server.contains_key(&record.id) {
                report.duplicates += 1;
                continue;
            }

            let own = record.sender_id == self.local.id;
            if own {
                if let Some(client_ref) = record.client_ref {
                    let pending = self
                        .get(&client_ref)
                        .is_some_and(|m| m.status == MessageStatus::Pending);
                    if pending && self.reconcile_sent(&client_ref, &record).is_ok() {
                        report.reconciled.push(client_ref);
                        continue;
                    }
                }
            }

            let status = if own && !record.read {
                MessageStatus::Sent
            } else {
                MessageStatus::Delivered
            };
            let seq = self.seq();
            let mut message = ChatMessage::from_record(record, status, seq);
            message.client_id = self.fresh_client_id(message.client_id);
            self.insert_entry(message);
            report.inserted += 1;
        }

        self.conversation_entry(key).history_loaded = true;
        debug!(
            conversation = %key,
            inserted = report.inserted,
            reconciled = report.reconciled.len(),
            duplicates = report.duplicates,
            "History merged"
        );
        report
    }

    // -- Conversation state ------------------------------------------------

    pub fn mark_read(&mut self, key: &ConversationKey) {
        if let Some(conv) = self.conversations.get_mut(key) {
            conv.unread_count = 0;
        }
    }

    /// Seed a conversation from a server summary.
    pub fn seed_summary(&mut self, summary: &ConversationSummary, active: Option<&ConversationKey>) {
        let key = ConversationKey::between(&self.local.id, &summary.counterparty.id);
        let is_active = active == Some(&key);
        let conv = self.conversation_entry(&key);
        conv.unread_count = if is_active { 0 } else { summary.unread_count };
        if let Some(at) = summary.last_activity {
            conv.touch(at);
        }
        conv.summary_preview = summary.last_message.as_ref().map(|m| m.content.clone());
    }

    /// Resolve `reply_to` within `key` only.
    pub fn resolve_reply<'a>(&'a self, key: &ConversationKey, reply_to: &'a ServerMessageId) -> ReplyRef<'a> {
        match self.find_by_server_id(reply_to) {
            Some(target) if &target.conversation == key => ReplyRef::Resolved(target),
            _ => ReplyRef::Stub(reply_to),
        }
    }
}
