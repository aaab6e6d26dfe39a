use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension};

use carechat_shared::protocol::{
    Attachment, ConversationSummary, LastMessage, MessageRecord, UnreadCounts,
};
use carechat_shared::types::{ClientId, ConversationKey, MessageKind, Role, ServerMessageId, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::users::parse_timestamp;

const MESSAGE_SELECT: &str = "SELECT m.id, m.sender_id, s.display_name, s.role, m.recipient_id,
        m.content, m.message_type, m.attachment_json, m.reply_to, m.client_ref,
        m.created_at, m.read_at
     FROM messages m JOIN users s ON s.id = m.sender_id";

/// Timestamps are stored with a fixed precision so text order matches time order.
fn stored_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl Database {
    pub fn insert_message(&self, record: &MessageRecord) -> Result<()> {
        let attachment_json = record
            .attachment
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.conn().execute(
            "INSERT INTO messages (id, conversation_key, sender_id, recipient_id, content,
                                   message_type, attachment_json, reply_to, client_ref,
                                   created_at, read_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, NULL)",
            params![
                record.id.as_str(),
                record.conversation_key().to_string(),
                record.sender_id.as_str(),
                record.recipient_id.as_str(),
                record.content,
                record.message_type.as_str(),
                attachment_json,
                record.reply_to.as_ref().map(|id| id.as_str()),
                record.client_ref.map(|c| c.to_string()),
                stored_timestamp(&record.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_message(&self, id: &ServerMessageId) -> Result<MessageRecord> {
        self.conn()
            .query_row(
                &format!("{MESSAGE_SELECT} WHERE m.id = ?1"),
                params![id.as_str()],
                row_to_record,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// A message previously posted by `sender` with the same client reference.
    pub fn find_by_client_ref(
        &self,
        sender: &UserId,
        client_ref: &ClientId,
    ) -> Result<Option<MessageRecord>> {
        let record = self
            .conn()
            .query_row(
                &format!("{MESSAGE_SELECT} WHERE m.sender_id = ?1 AND m.client_ref = ?2"),
                params![sender.as_str(), client_ref.to_string()],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// One page of a conversation in ascending canonical order.
    ///
    /// Pages are counted back from the newest message: `offset` skips the
    /// `offset` most recent messages.
    pub fn conversation_history(
        &self,
        key: &ConversationKey,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<MessageRecord>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT * FROM (
                {MESSAGE_SELECT}
                WHERE m.conversation_key = ?1
                ORDER BY m.created_at DESC, m.id DESC
                LIMIT ?2 OFFSET ?3
             ) ORDER BY created_at ASC, id ASC"
        ))?;

        let rows = stmt.query_map(params![key.to_string(), limit, offset], row_to_record)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    pub fn delete_message(&self, id: &ServerMessageId) -> Result<()> {
        let changed = self
            .conn()
            .execute("DELETE FROM messages WHERE id = ?1", params![id.as_str()])?;
        if changed == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Mark every unread message from `counterparty` to `reader` as read.
    /// Returns the number of rows changed.
    pub fn mark_conversation_read(
        &self,
        reader: &UserId,
        counterparty: &UserId,
        at: DateTime<Utc>,
    ) -> Result<usize> {
        let changed = self.conn().execute(
            "UPDATE messages SET read_at = ?3
             WHERE recipient_id = ?1 AND sender_id = ?2 AND read_at IS NULL",
            params![reader.as_str(), counterparty.as_str(), stored_timestamp(&at)],
        )?;
        Ok(changed)
    }

    pub fn unread_count(&self, reader: &UserId, counterparty: &UserId) -> Result<u32> {
        let count: u32 = self.conn().query_row(
            "SELECT COUNT(*) FROM messages
             WHERE recipient_id = ?1 AND sender_id = ?2 AND read_at IS NULL",
            params![reader.as_str(), counterparty.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Unread messages addressed to `user`, in total and per conversation.
    pub fn unread_counts(&self, user: &UserId) -> Result<UnreadCounts> {
        let mut stmt = self.conn().prepare(
            "SELECT conversation_key, COUNT(*) FROM messages
             WHERE recipient_id = ?1 AND read_at IS NULL
             GROUP BY conversation_key",
        )?;
        let rows = stmt.query_map(params![user.as_str()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
        })?;

        let mut counts = UnreadCounts::default();
        for row in rows {
            let (key, count) = row?;
            counts.total_unread += count;
            counts.unread_by_conversation.insert(key, count);
        }
        Ok(counts)
    }

    /// Conversations `user` takes part in, most recently active first.
    pub fn conversation_summaries(&self, user: &UserId) -> Result<Vec<ConversationSummary>> {
        let mut stmt = self.conn().prepare(
            "SELECT CASE WHEN sender_id = ?1 THEN recipient_id ELSE sender_id END AS counterparty,
                    MAX(created_at) AS last_activity
             FROM messages
             WHERE sender_id = ?1 OR recipient_id = ?1
             GROUP BY counterparty
             ORDER BY last_activity DESC",
        )?;
        let rows = stmt.query_map(params![user.as_str()], |row| row.get::<_, String>(0))?;
        let mut counterparties = Vec::new();
        for row in rows {
            counterparties.push(UserId::new(row?));
        }

        let mut summaries = Vec::with_capacity(counterparties.len());
        for counterparty_id in counterparties {
            let counterparty = match self.get_user(&counterparty_id) {
                Ok(u) => u,
                Err(StoreError::NotFound) => {
                    tracing::warn!(user = %counterparty_id, "conversation with unknown user");
                    continue;
                }
                Err(e) => return Err(e),
            };

            let key = ConversationKey::between(user, &counterparty_id);
            let last = self.conversation_history(&key, 1, 0)?.pop();
            let unread_count = self.unread_count(user, &counterparty_id)?;

            summaries.push(ConversationSummary {
                counterparty: counterparty.to_counterparty(),
                last_activity: last.as_ref().map(|m| m.created_at),
                last_message: last.map(|m| LastMessage {
                    content: m.content,
                    sender_id: m.sender_id,
                    message_type: m.message_type,
                    timestamp: m.created_at,
                }),
                unread_count,
            });
        }
        Ok(summaries)
    }
}

fn conversion_failure(
    idx: usize,
    err: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, err.into())
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRecord> {
    let id: String = row.get(0)?;
    let sender_id: String = row.get(1)?;
    let sender_name: String = row.get(2)?;
    let role_str: String = row.get(3)?;
    let recipient_id: String = row.get(4)?;
    let content: String = row.get(5)?;
    let kind_str: String = row.get(6)?;
    let attachment_json: Option<String> = row.get(7)?;
    let reply_to: Option<String> = row.get(8)?;
    let client_ref: Option<String> = row.get(9)?;
    let ts_str: String = row.get(10)?;
    let read_at: Option<String> = row.get(11)?;

    let sender_role = role_str
        .parse::<Role>()
        .map_err(|e| conversion_failure(3, e))?;
    let message_type = kind_str
        .parse::<MessageKind>()
        .map_err(|e| conversion_failure(6, e))?;
    let attachment = attachment_json
        .map(|json| serde_json::from_str::<Attachment>(&json))
        .transpose()
        .map_err(|e| conversion_failure(7, e))?;
    let client_ref = client_ref
        .map(|s| s.parse::<ClientId>())
        .transpose()
        .map_err(|e| conversion_failure(9, e))?;

    Ok(MessageRecord {
        id: ServerMessageId::new(id),
        sender_id: UserId::new(sender_id),
        sender_name,
        sender_role,
        recipient_id: UserId::new(recipient_id),
        content,
        message_type,
        attachment,
        reply_to: reply_to.map(ServerMessageId::new),
        client_ref,
        created_at: parse_timestamp(10, &ts_str)?,
        read: read_at.is_some(),
    })
}
