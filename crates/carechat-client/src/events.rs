use serde::Serialize;

use carechat_shared::types::{ClientId, ConnectionState, PresenceStatus, UserId};

use crate::presentation::MessageView;

/// Store and session changes pushed to presentation shells.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatUpdate {
    MessageAdded {
        conversation: String,
        message: MessageView,
    },
    MessageUpdated {
        conversation: String,
        message: MessageView,
    },
    /// Deleted on the server; drop it from the rendered log.
    MessageRemoved {
        conversation: String,
        client_id: ClientId,
    },
    SendFailed {
        conversation: String,
        client_id: ClientId,
        reason: String,
    },
    HistoryLoaded {
        conversation: String,
        inserted: usize,
    },
    ConversationsChanged,
    DirectoryChanged,
    Typing {
        user_id: UserId,
        is_typing: bool,
    },
    Presence {
        user_id: UserId,
        status: PresenceStatus,
    },
    Connection {
        state: ConnectionState,
    },
}
