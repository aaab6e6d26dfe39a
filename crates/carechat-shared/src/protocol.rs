//! Wire representations shared by the persistence API and the live transport.
//!
//! REST bodies and live frames are JSON with camelCase field names. Live
//! frames are externally tagged as `{"event": "<name>", "data": {...}}`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{
    ClientId, ConversationKey, MessageKind, PresenceStatus, Role, ServerMessageId, UserId,
};

// ---------------------------------------------------------------------------
// Persisted message representation
// ---------------------------------------------------------------------------

/// Reference to an uploaded file carried by `file` and `image` messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub file_name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// A message as stored by the server. Also the payload of live
/// `send_message` / `new_message` frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: ServerMessageId,
    pub sender_id: UserId,
    pub sender_name: String,
    pub sender_role: Role,
    pub recipient_id: UserId,
    pub content: String,
    pub message_type: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    #[serde(default)]
    pub reply_to: Option<ServerMessageId>,
    /// Client-generated reference echoed back so optimistic entries can be matched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<ClientId>,
    /// Canonical server timestamp.
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
}

impl MessageRecord {
    pub fn conversation_key(&self) -> ConversationKey {
        ConversationKey::between(&self.sender_id, &self.recipient_id)
    }
}

// ---------------------------------------------------------------------------
// REST bodies
// ---------------------------------------------------------------------------

/// Body of `POST messages`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub recipient_id: UserId,
    pub content: String,
    #[serde(default)]
    pub message_type: MessageKind,
    #[serde(default)]
    pub reply_to: Option<ServerMessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<ClientId>,
}

/// An eligible counterparty as returned by the directory collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Counterparty {
    pub id: UserId,
    pub display_name: String,
    pub role: Role,
    #[serde(default)]
    pub specialty: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LastMessage {
    pub content: String,
    pub sender_id: UserId,
    pub message_type: MessageKind,
    pub timestamp: DateTime<Utc>,
}

/// One entry of `GET conversations`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub counterparty: Counterparty,
    #[serde(default)]
    pub last_message: Option<LastMessage>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default)]
    pub last_activity: Option<DateTime<Utc>>,
}

/// Body of `GET unread-count`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UnreadCounts {
    pub total_unread: u32,
    /// Keyed by conversation key.
    #[serde(default)]
    pub unread_by_conversation: BTreeMap<String, u32>,
}

/// Envelope wrapping every REST response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message.into()),
        }
    }

    /// Unwrap the payload, or return the server's message.
    pub fn into_result(self) -> Result<T, String> {
        match (self.success, self.data) {
            (true, Some(data)) => Ok(data),
            (true, None) => Err("response has no data".to_string()),
            (false, _) => Err(self
                .message
                .unwrap_or_else(|| "request failed".to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Live frames
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TypingUpdate {
    pub recipient_id: UserId,
    pub is_typing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReceipt {
    pub message_id: ServerMessageId,
    /// Original sender, who should learn about the delivery.
    pub sender_id: UserId,
}

/// Frames a client sends over the live connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Broadcast of an already persisted message.
    SendMessage(MessageRecord),
    Typing(TypingUpdate),
    MessageDelivered(DeliveryReceipt),
    /// The user stepped away; shown to others as `away`.
    UserAway,
    UserBack,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReadyInfo {
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TypingNotice {
    pub sender_id: UserId,
    pub is_typing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpdate {
    pub user_id: UserId,
    pub status: PresenceStatus,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptStatus {
    Delivered,
    Read,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub message_id: ServerMessageId,
    pub status: ReceiptStatus,
}

/// A message removed by its sender.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeletedMessage {
    pub message_id: ServerMessageId,
    pub sender_id: UserId,
    pub recipient_id: UserId,
}

impl DeletedMessage {
    pub fn conversation_key(&self) -> ConversationKey {
        ConversationKey::between(&self.sender_id, &self.recipient_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorNotice {
    pub message: String,
}

/// Frames the server pushes over the live connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Handshake accepted.
    Ready(ReadyInfo),
    NewMessage(MessageRecord),
    TypingIndicator(TypingNotice),
    UserStatusChange(PresenceUpdate),
    MessageStatus(StatusUpdate),
    MessageDeleted(DeletedMessage),
    Error(ErrorNotice),
}

impl ClientFrame {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }
}

impl ServerFrame {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }
}
