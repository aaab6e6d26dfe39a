//! Session context passed into every component at construction time.

use carechat_shared::types::{Credential, Role, UserId};

/// Identity of the signed-in user, as supplied by the authentication
/// collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalUser {
    pub id: UserId,
    pub display_name: String,
    pub role: Role,
}

/// Everything the chat core needs to know about the current session.
#[derive(Debug, Clone)]
pub struct Session {
    pub user: LocalUser,
    pub credential: Credential,
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        role: Role,
        credential: Credential,
    ) -> Self {
        Self {
            user: LocalUser {
                id: UserId::new(id),
                display_name: display_name.into(),
                role,
            },
            credential,
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.user.id
    }
}
