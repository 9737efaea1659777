//! CRUD operations for [`Conversation`] records.

use rusqlite::{params, OptionalExtension};

use parley_shared::{ConversationId, MessageId, UserId};

use crate::database::{column_ts, column_user, column_uuid, format_ts, now, Database};
use crate::error::{not_found, Result};
use crate::models::{ordered_pair, Conversation};

pub(crate) const FLAG_DELETED: &str = "deleted";
pub(crate) const FLAG_BLOCKED: &str = "blocked";

const SELECT_CONVERSATION: &str =
    "SELECT id, user_a, user_b, latest_message_id, created_at, updated_at FROM conversations";

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Find the conversation for the unordered pair, creating it if absent.
    ///
    /// Returns the conversation and whether this call created it. Creation
    /// relies on the `UNIQUE (user_a, user_b)` constraint, so concurrent
    /// callers converge on the same row.
    pub fn find_or_create_conversation(
        &self,
        a: &UserId,
        b: &UserId,
    ) -> Result<(Conversation, bool)> {
        let [user_a, user_b] = ordered_pair(a, b);
        let ts = format_ts(now());
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO conversations (id, user_a, user_b, latest_message_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, NULL, ?4, ?4)",
            params![
                ConversationId::new().to_string(),
                user_a.as_str(),
                user_b.as_str(),
                ts,
            ],
        )?;

        let conversation = self
            .find_conversation(a, b)?
            .ok_or(crate::StoreError::NotFound)?;

        if inserted > 0 {
            tracing::debug!(conversation = %conversation.id, "created conversation");
        }
        Ok((conversation, inserted > 0))
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Look up the conversation for the unordered pair without creating it.
    pub fn find_conversation(&self, a: &UserId, b: &UserId) -> Result<Option<Conversation>> {
        let [user_a, user_b] = ordered_pair(a, b);
        let row = self
            .conn()
            .query_row(
                &format!("{SELECT_CONVERSATION} WHERE user_a = ?1 AND user_b = ?2"),
                params![user_a.as_str(), user_b.as_str()],
                row_to_conversation,
            )
            .optional()?;

        row.map(|c| self.with_flags(c)).transpose()
    }

    pub fn get_conversation(&self, id: ConversationId) -> Result<Conversation> {
        let conversation = self
            .conn()
            .query_row(
                &format!("{SELECT_CONVERSATION} WHERE id = ?1"),
                params![id.to_string()],
                row_to_conversation,
            )
            .map_err(not_found)?;
        self.with_flags(conversation)
    }

    /// Conversations involving `user` that `user` has not hidden, most
    /// recently active first.
    pub fn conversations_for(&self, user: &UserId) -> Result<Vec<Conversation>> {
        let mut stmt = self.conn().prepare(&format!(
            "{SELECT_CONVERSATION}
             WHERE (user_a = ?1 OR user_b = ?1)
               AND NOT EXISTS (
                   SELECT 1 FROM conversation_flags f
                   WHERE f.conversation_id = conversations.id
                     AND f.user_id = ?1 AND f.kind = ?2)
             ORDER BY updated_at DESC"
        ))?;

        let rows = stmt.query_map(params![user.as_str(), FLAG_DELETED], row_to_conversation)?;

        let mut conversations = Vec::new();
        for row in rows {
            conversations.push(self.with_flags(row?)?);
        }
        Ok(conversations)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Hide the conversation for `user`. Returns `true` if it was already
    /// hidden.
    pub fn hide_conversation(&self, id: ConversationId, user: &UserId) -> Result<bool> {
        let inserted = self.insert_flag(id, user, FLAG_DELETED)?;
        Ok(!inserted)
    }

    /// Add `user` to `blocked_by`. Returns the updated conversation and
    /// whether the flag was newly set.
    pub fn block_conversation(
        &self,
        id: ConversationId,
        user: &UserId,
    ) -> Result<(Conversation, bool)> {
        let inserted = self.insert_flag(id, user, FLAG_BLOCKED)?;
        Ok((self.get_conversation(id)?, inserted))
    }

    /// Remove `user` from `blocked_by`. Returns the updated conversation and
    /// whether a flag was removed.
    pub fn unblock_conversation(
        &self,
        id: ConversationId,
        user: &UserId,
    ) -> Result<(Conversation, bool)> {
        let removed = self.conn().execute(
            "DELETE FROM conversation_flags
             WHERE conversation_id = ?1 AND user_id = ?2 AND kind = ?3",
            params![id.to_string(), user.as_str(), FLAG_BLOCKED],
        )?;
        Ok((self.get_conversation(id)?, removed > 0))
    }

    fn insert_flag(&self, id: ConversationId, user: &UserId, kind: &str) -> Result<bool> {
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO conversation_flags (conversation_id, user_id, kind, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![id.to_string(), user.as_str(), kind, format_ts(now())],
        )?;
        Ok(inserted > 0)
    }

    fn with_flags(&self, mut conversation: Conversation) -> Result<Conversation> {
        let mut stmt = self.conn().prepare_cached(
            "SELECT user_id, kind FROM conversation_flags
             WHERE conversation_id = ?1
             ORDER BY created_at ASC, rowid ASC",
        )?;
        let rows = stmt.query_map(params![conversation.id.to_string()], |row| {
            Ok((column_user(row, 0)?, row.get::<_, String>(1)?))
        })?;

        for row in rows {
            let (user, kind) = row?;
            match kind.as_str() {
                FLAG_DELETED => conversation.deleted_by.push(user),
                FLAG_BLOCKED => conversation.blocked_by.push(user),
                other => tracing::warn!(kind = other, "ignoring unknown conversation flag"),
            }
        }
        Ok(conversation)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Map a `rusqlite::Row` to a [`Conversation`] without its flags.
fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let latest: Option<String> = row.get(3)?;
    let latest_message = latest
        .map(|s| uuid::Uuid::parse_str(&s).map(MessageId))
        .transpose()
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(Conversation {
        id: ConversationId(column_uuid(row, 0)?),
        participants: [column_user(row, 1)?, column_user(row, 2)?],
        latest_message,
        deleted_by: Vec::new(),
        blocked_by: Vec::new(),
        created_at: column_ts(row, 4)?,
        updated_at: column_ts(row, 5)?,
    })
}
