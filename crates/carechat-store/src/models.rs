//! Domain model structs persisted in the server database.
//!
//! Messages are stored and returned as the shared
//! [`MessageRecord`](carechat_shared::protocol::MessageRecord); only users
//! need a store-specific shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use carechat_shared::protocol::Counterparty;
use carechat_shared::types::{Role, UserId};

/// A registered user as known to the chat server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub display_name: String,
    pub role: Role,
    /// Specialty or context line shown next to the name.
    #[serde(default)]
    pub specialty: String,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_active() -> bool {
    true
}

impl User {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>, role: Role) -> Self {
        Self {
            id: UserId::new(id),
            display_name: display_name.into(),
            role,
            specialty: String::new(),
            is_active: true,
            created_at: Utc::now(),
        }
    }

    pub fn with_specialty(mut self, specialty: impl Into<String>) -> Self {
        self.specialty = specialty.into();
        self
    }

    /// Directory representation handed to other users.
    pub fn to_counterparty(&self) -> Counterparty {
        Counterparty {
            id: self.id.clone(),
            display_name: self.display_name.clone(),
            role: self.role,
            specialty: self.specialty.clone(),
            is_active: self.is_active,
        }
    }
}
