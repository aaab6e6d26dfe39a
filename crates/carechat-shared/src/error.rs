use thiserror::Error;

use crate::types::ClientId;

/// Error taxonomy surfaced by the messaging core.
#[derive(Error, Debug)]
pub enum ChatError {
    /// Credential missing or rejected at connect time.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Live connection failure. Handled by the reconnect policy.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The persistence API rejected or failed a request.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// The persistence API could not be reached (offline, timeout).
    #[error("Network error: {0}")]
    Network(String),

    /// Caught locally before any network call.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// A peer sent a frame or body we do not understand.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The client engine stopped before answering.
    #[error("Chat client is shut down")]
    Closed,
}

impl ChatError {
    /// Whether repeating the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChatError::Transport(_) | ChatError::Persistence(_) | ChatError::Network(_)
        )
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Message content is empty")]
    EmptyContent,

    #[error("Message content is too long: {len} characters (max {max})")]
    ContentTooLong { len: usize, max: usize },

    #[error("A {0} message needs an attachment")]
    MissingAttachment(&'static str),

    #[error("Cannot open a conversation with yourself")]
    SelfConversation,

    #[error("Unknown message {0}")]
    UnknownMessage(ClientId),

    #[error("Message {0} has not failed and cannot be resent")]
    NotResendable(ClientId),

    #[error("Message {0} is not a saved message of yours and cannot be deleted")]
    NotDeletable(ClientId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(ChatError::Network("offline".into()).is_retryable());
        assert!(ChatError::Persistence("500".into()).is_retryable());
        assert!(!ChatError::Auth("rejected".into()).is_retryable());
        assert!(!ChatError::from(ValidationError::EmptyContent).is_retryable());
    }
}
