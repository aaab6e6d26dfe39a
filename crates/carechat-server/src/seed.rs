//! Startup import of the user directory.
//!
//! User accounts belong to the wider platform; the chat server only needs a
//! copy of who exists and which bearer token maps to whom. `USERS_FILE`
//! points at a JSON array of users, each optionally carrying a `token`.

use std::path::Path;

use serde::Deserialize;
use tracing::info;

use carechat_store::{Database, User};

#[derive(Debug, Deserialize)]
struct SeedUser {
    #[serde(flatten)]
    user: User,
    #[serde(default)]
    token: Option<String>,
}

/// Upsert every user in `path` and register their tokens.
/// Returns the number of users imported.
pub fn import_users(db: &Database, path: &Path) -> anyhow::Result<usize> {
    let raw = std::fs::read_to_string(path)?;
    let users: Vec<SeedUser> = serde_json::from_str(&raw)?;

    for seed in &users {
        db.upsert_user(&seed.user)?;
        if let Some(token) = seed.token.as_deref().filter(|t| !t.is_empty()) {
            db.register_token(token, &seed.user.id)?;
        }
    }

    info!(count = users.len(), path = %path.display(), "Imported users");
    Ok(users.len())
}
