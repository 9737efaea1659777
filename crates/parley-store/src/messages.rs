use rusqlite::{params, OptionalExtension};

use parley_shared::{ConversationId, MessageId, MessageStatus, UserId};

use crate::conversations::{FLAG_BLOCKED, FLAG_DELETED};
use crate::database::{column_opt_ts, column_ts, column_user, column_uuid, format_ts, now, Database};
use crate::error::{not_found, Result, StoreError};
use crate::models::{Message, NewMessage};

const SELECT_MESSAGE: &str = "SELECT id, conversation_id, sender, receiver, text, uuid, status,
        created_at, received_at, read_at, edited_at, deleted_at,
        edited_after_received, deleted_after_received
 FROM messages";

impl Database {
    /// Insert a message unless one with the same `(sender, receiver, uuid)`
    /// exists.
    ///
    /// On insert the conversation's `latest_message` is updated and every
    /// `deleted_by` flag is cleared, in the same transaction. Returns the
    /// stored message and whether this call created it.
    pub fn insert_message(&self, new: &NewMessage) -> Result<(Message, bool)> {
        let tx = self.conn().unchecked_transaction()?;
        let id = MessageId::new();
        let ts = format_ts(now());

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO messages (id, conversation_id, sender, receiver, text, uuid, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)",
            params![
                id.to_string(),
                new.conversation_id.to_string(),
                new.sender.as_str(),
                new.receiver.as_str(),
                new.text,
                new.uuid,
                ts,
            ],
        )?;

        if inserted > 0 {
            tx.execute(
                "UPDATE conversations SET latest_message_id = ?1, updated_at = ?2 WHERE id = ?3",
                params![id.to_string(), ts, new.conversation_id.to_string()],
            )?;
            tx.execute(
                "DELETE FROM conversation_flags WHERE conversation_id = ?1 AND kind = ?2",
                params![new.conversation_id.to_string(), FLAG_DELETED],
            )?;
        }
        tx.commit()?;

        let message = self
            .find_by_idempotency_key(&new.sender, &new.receiver, &new.uuid)?
            .ok_or(StoreError::NotFound)?;
        Ok((message, inserted > 0))
    }

    pub fn find_by_idempotency_key(
        &self,
        sender: &UserId,
        receiver: &UserId,
        uuid: &str,
    ) -> Result<Option<Message>> {
        Ok(self
            .conn()
            .query_row(
                &format!("{SELECT_MESSAGE} WHERE sender = ?1 AND receiver = ?2 AND uuid = ?3"),
                params![sender.as_str(), receiver.as_str(), uuid],
                row_to_message,
            )
            .optional()?)
    }

    pub fn get_message(&self, id: MessageId) -> Result<Message> {
        self.conn()
            .query_row(
                &format!("{SELECT_MESSAGE} WHERE id = ?1"),
                params![id.to_string()],
                row_to_message,
            )
            .map_err(not_found)
    }

    /// Replace the text of a live message. Flags the edit for resync when
    /// the receiver already acknowledged the message.
    pub fn edit_message(&self, id: MessageId, text: &str) -> Result<Message> {
        let affected = self.conn().execute(
            "UPDATE messages
             SET text = ?2,
                 edited_at = ?3,
                 edited_after_received = CASE WHEN received_at IS NOT NULL THEN 1
                                              ELSE edited_after_received END
             WHERE id = ?1 AND deleted_at IS NULL",
            params![id.to_string(), text, format_ts(now())],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        self.get_message(id)
    }

    /// Soft-delete a message. Flags the removal for resync when the
    /// receiver already acknowledged the message.
    pub fn remove_message(&self, id: MessageId) -> Result<Message> {
        let affected = self.conn().execute(
            "UPDATE messages
             SET deleted_at = ?2,
                 deleted_after_received = CASE WHEN received_at IS NOT NULL THEN 1 ELSE 0 END
             WHERE id = ?1 AND deleted_at IS NULL",
            params![id.to_string(), format_ts(now())],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        self.get_message(id)
    }

    /// Record the receiver's delivery acknowledgment. Keeps the first
    /// timestamp when applied twice.
    pub fn mark_received(&self, id: MessageId) -> Result<Message> {
        self.conn().execute(
            "UPDATE messages SET received_at = COALESCE(received_at, ?2) WHERE id = ?1",
            params![id.to_string(), format_ts(now())],
        )?;
        self.get_message(id)
    }

    /// Record that the receiver read the message. Keeps the first timestamp.
    pub fn mark_read(&self, id: MessageId) -> Result<Message> {
        self.conn().execute(
            "UPDATE messages SET read_at = COALESCE(read_at, ?2) WHERE id = ?1",
            params![id.to_string(), format_ts(now())],
        )?;
        self.get_message(id)
    }

    /// Move the sender-side status forward. Never regresses; returns `true`
    /// if the status changed.
    pub fn advance_status(&self, id: MessageId, status: MessageStatus) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE messages SET status = ?2 WHERE id = ?1 AND status < ?2",
            params![id.to_string(), status.rank()],
        )?;
        Ok(affected > 0)
    }

    pub fn clear_edited_flag(&self, id: MessageId) -> Result<()> {
        self.conn().execute(
            "UPDATE messages SET edited_after_received = 0 WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(())
    }

    pub fn clear_deleted_flag(&self, id: MessageId) -> Result<()> {
        self.conn().execute(
            "UPDATE messages SET deleted_after_received = 0 WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(())
    }

    /// Everything `user`'s connection has not been told about yet.
    ///
    /// As receiver: undelivered messages, and edits or removals made after
    /// delivery. As sender: delivery or read receipts not yet acknowledged.
    /// Messages in conversations with any block are excluded. Ordered by
    /// creation time.
    pub fn pending_messages_for(&self, user: &UserId) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "{SELECT_MESSAGE}
             WHERE (
                 (receiver = ?1 AND (
                     (status = 0 AND received_at IS NULL AND deleted_at IS NULL)
                     OR edited_after_received = 1
                     OR deleted_after_received = 1))
                 OR (sender = ?1 AND (
                     (received_at IS NOT NULL AND status = 0)
                     OR (read_at IS NOT NULL AND status < 2)))
             )
             AND NOT EXISTS (
                 SELECT 1 FROM conversation_flags f
                 WHERE f.conversation_id = messages.conversation_id AND f.kind = ?2)
             ORDER BY created_at ASC, rowid ASC"
        ))?;

        let rows = stmt.query_map(params![user.as_str(), FLAG_BLOCKED], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let rank: u8 = row.get(6)?;
    let status = MessageStatus::from_rank(rank).ok_or_else(|| {
        rusqlite::Error::IntegralValueOutOfRange(6, i64::from(rank))
    })?;

    Ok(Message {
        id: MessageId(column_uuid(row, 0)?),
        conversation_id: ConversationId(column_uuid(row, 1)?),
        sender: column_user(row, 2)?,
        receiver: column_user(row, 3)?,
        text: row.get(4)?,
        uuid: row.get(5)?,
        status,
        created_at: column_ts(row, 7)?,
        received_at: column_opt_ts(row, 8)?,
        read_at: column_opt_ts(row, 9)?,
        edited_at: column_opt_ts(row, 10)?,
        deleted_at: column_opt_ts(row, 11)?,
        edited_after_received: row.get(12)?,
        deleted_after_received: row.get(13)?,
    })
}
