//! View-models handed to presentation shells.
//!
//! Nothing here knows about a UI framework; records are plain serializable
//! structs built from the message store and the directory.

use chrono::{DateTime, Utc};
use serde::Serialize;

use carechat_shared::constants::{REPLY_EXCERPT_LEN, REPLY_STUB_TEXT};
use carechat_shared::protocol::{Attachment, Counterparty};
use carechat_shared::types::{
    ClientId, ConnectionState, ConversationKey, MessageKind, Role, ServerMessageId, UserId,
};

use crate::directory::ConversationDirectory;
use crate::message_store::{ChatMessage, Conversation, MessageStatus, MessageStore, ReplyRef};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyPreview {
    pub target_id: ServerMessageId,
    pub sender_display_name: Option<String>,
    pub excerpt: String,
    /// Target not loaded locally; `excerpt` holds placeholder text.
    pub is_stub: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    pub client_id: ClientId,
    pub server_id: Option<ServerMessageId>,
    pub sender_id: UserId,
    pub sender_display_name: String,
    pub is_own: bool,
    pub content: String,
    pub kind: MessageKind,
    pub attachment: Option<Attachment>,
    pub created_at: DateTime<Utc>,
    pub status: MessageStatus,
    pub reply_preview: Option<ReplyPreview>,
    /// Failed entries offer an explicit resend.
    pub can_retry: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationView {
    pub key: String,
    pub counterparty_id: UserId,
    pub counterparty_name: String,
    pub counterparty_role: Option<Role>,
    pub last_message_preview: Option<String>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub unread_count: u32,
    pub is_active: bool,
    pub is_online: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterpartyView {
    pub id: UserId,
    pub display_name: String,
    pub role: Role,
    pub specialty: String,
    pub is_online: bool,
    pub unread_count: u32,
}

/// Non-blocking connection banner. Composing stays possible in every state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionBanner {
    Hidden,
    Connecting,
    Offline,
}

impl ConnectionBanner {
    pub fn for_state(state: ConnectionState) -> Self {
        match state {
            ConnectionState::Connected => ConnectionBanner::Hidden,
            ConnectionState::Connecting => ConnectionBanner::Connecting,
            ConnectionState::Disconnected => ConnectionBanner::Offline,
        }
    }

    pub fn text(&self) -> Option<&'static str> {
        match self {
            ConnectionBanner::Hidden => None,
            ConnectionBanner::Connecting => Some("Reconnecting… messages will still be saved"),
            ConnectionBanner::Offline => Some("Offline. Live updates are paused"),
        }
    }
}

fn excerpt(content: &str) -> String {
    let mut chars = content.chars();
    let head: String = chars.by_ref().take(REPLY_EXCERPT_LEN).collect();
    if chars.next().is_some() {
        format!("{head}…")
    } else {
        head
    }
}

pub fn message_view(store: &MessageStore, message: &ChatMessage) -> MessageView {
    let reply_preview = message.reply_to.as_ref().map(|target| {
        match store.resolve_reply(&message.conversation, target) {
            ReplyRef::Resolved(original) => ReplyPreview {
                target_id: target.clone(),
                sender_display_name: Some(original.sender_name.clone()),
                excerpt: excerpt(&original.content),
                is_stub: false,
            },
            ReplyRef::Stub(_) => ReplyPreview {
                target_id: target.clone(),
                sender_display_name: None,
                excerpt: REPLY_STUB_TEXT.to_string(),
                is_stub: true,
            },
        }
    });

    MessageView {
        client_id: message.client_id,
        server_id: message.server_id.clone(),
        sender_id: message.sender_id.clone(),
        sender_display_name: message.sender_name.clone(),
        is_own: message.sender_id == store.local_user().id,
        content: message.content.clone(),
        kind: message.kind,
        attachment: message.attachment.clone(),
        created_at: message.created_at,
        status: message.status,
        reply_preview,
        can_retry: message.status == MessageStatus::Failed,
    }
}

/// Ordered view of one conversation.
pub fn message_views(store: &MessageStore, key: &ConversationKey) -> Vec<MessageView> {
    store
        .messages(key)
        .iter()
        .map(|m| message_view(store, m))
        .collect()
}

pub fn conversation_view(
    conversation: &Conversation,
    directory: &ConversationDirectory,
) -> ConversationView {
    let counterparty = directory.counterparty(&conversation.counterparty_id);
    let last_message_preview = conversation
        .last_message()
        .map(|m| excerpt(&m.content))
        .or_else(|| conversation.summary_preview.as_deref().map(excerpt));

    ConversationView {
        key: conversation.key.to_string(),
        counterparty_id: conversation.counterparty_id.clone(),
        counterparty_name: counterparty
            .map(|c| c.display_name.clone())
            .unwrap_or_else(|| conversation.counterparty_id.to_string()),
        counterparty_role: counterparty.map(|c| c.role),
        last_message_preview,
        last_activity_at: conversation.last_activity_at,
        unread_count: conversation.unread_count,
        is_active: directory.active() == Some(&conversation.key),
        is_online: directory.is_online(&conversation.counterparty_id),
    }
}

pub fn conversation_views(
    store: &MessageStore,
    directory: &ConversationDirectory,
) -> Vec<ConversationView> {
    store
        .conversations()
        .into_iter()
        .map(|c| conversation_view(c, directory))
        .collect()
}

pub fn counterparty_view(
    counterparty: &Counterparty,
    store: &MessageStore,
    directory: &ConversationDirectory,
) -> CounterpartyView {
    let key = ConversationKey::between(&store.local_user().id, &counterparty.id);
    CounterpartyView {
        id: counterparty.id.clone(),
        display_name: counterparty.display_name.clone(),
        role: counterparty.role,
        specialty: counterparty.specialty.clone(),
        is_online: directory.is_online(&counterparty.id),
        unread_count: store.conversation(&key).map_or(0, |c| c.unread_count),
    }
}
