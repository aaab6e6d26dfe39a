//! v001 -- Initial schema creation.
//!
//! Creates `users`, `sessions` and `messages`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id           TEXT PRIMARY KEY NOT NULL,
    display_name TEXT NOT NULL,
    role         TEXT NOT NULL,               -- mom | doctor | midwife | service_provider | admin
    specialty    TEXT NOT NULL DEFAULT '',
    is_active    INTEGER NOT NULL DEFAULT 1,  -- boolean 0/1
    created_at   TEXT NOT NULL                -- RFC-3339
);

CREATE INDEX IF NOT EXISTS idx_users_role ON users(role);

-- ----------------------------------------------------------------
-- Bearer sessions
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS sessions (
    token      TEXT PRIMARY KEY NOT NULL,
    user_id    TEXT NOT NULL,
    created_at TEXT NOT NULL,

    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id               TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    conversation_key TEXT NOT NULL,              -- "<low>_<high>"
    sender_id        TEXT NOT NULL,
    recipient_id     TEXT NOT NULL,
    content          TEXT NOT NULL,
    message_type     TEXT NOT NULL,              -- text | file | image
    attachment_json  TEXT,
    reply_to         TEXT,
    client_ref       TEXT,                       -- sender's local message id
    created_at       TEXT NOT NULL,              -- RFC-3339, fixed precision
    read_at          TEXT,

    FOREIGN KEY (sender_id) REFERENCES users(id),
    FOREIGN KEY (recipient_id) REFERENCES users(id)
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation_ts
    ON messages(conversation_key, created_at);

CREATE INDEX IF NOT EXISTS idx_messages_unread
    ON messages(recipient_id, read_at);

-- A retried post with the same client reference returns the stored row.
CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_sender_client_ref
    ON messages(sender_id, client_ref)
    WHERE client_ref IS NOT NULL;
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
