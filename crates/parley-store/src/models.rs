//! Domain model structs persisted in the SQLite database.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use parley_shared::protocol::MessageView;
use parley_shared::{ConversationId, MessageId, MessageStatus, UserId};

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// An identity that has connected at least once.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// A two-party conversation. Participants are stored in sorted order so the
/// unordered pair maps to exactly one row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    pub id: ConversationId,
    pub participants: [UserId; 2],
    pub latest_message: Option<MessageId>,
    /// Participants who hid the conversation locally.
    pub deleted_by: Vec<UserId>,
    /// Participants who blocked the conversation, in blocking order.
    pub blocked_by: Vec<UserId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn is_participant(&self, user: &UserId) -> bool {
        self.participants.contains(user)
    }

    /// The participant that is not `user`. Meaningless if `user` is not a
    /// participant.
    pub fn other(&self, user: &UserId) -> &UserId {
        if &self.participants[0] == user {
            &self.participants[1]
        } else {
            &self.participants[0]
        }
    }

    pub fn is_hidden_by(&self, user: &UserId) -> bool {
        self.deleted_by.contains(user)
    }

    pub fn is_blocked_by(&self, user: &UserId) -> bool {
        self.blocked_by.contains(user)
    }

    pub fn has_block(&self) -> bool {
        !self.blocked_by.is_empty()
    }
}

/// Order a pair so that `(a, b)` and `(b, a)` produce the same key.
pub fn ordered_pair(a: &UserId, b: &UserId) -> [UserId; 2] {
    if a <= b {
        [a.clone(), b.clone()]
    } else {
        [b.clone(), a.clone()]
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A single chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender: UserId,
    pub receiver: UserId,
    pub text: String,
    /// Client-generated idempotency key, unique per `(sender, receiver)`.
    pub uuid: String,
    /// Status as acknowledged by the sender's connection.
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    /// Set when the receiver's connection acknowledged delivery.
    pub received_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub edited_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    /// Edited after the receiver acknowledged it; cleared once the edit
    /// reaches the receiver.
    pub edited_after_received: bool,
    /// Removed after the receiver acknowledged it; cleared once the removal
    /// reaches the receiver.
    pub deleted_after_received: bool,
}

impl Message {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn is_received(&self) -> bool {
        self.received_at.is_some()
    }

    /// Projection pushed to clients. Bookkeeping flags stay server-side and
    /// removed messages lose their text.
    pub fn view(&self) -> MessageView {
        MessageView {
            id: self.id,
            conversation_id: self.conversation_id,
            sender: self.sender.clone(),
            receiver: self.receiver.clone(),
            text: if self.is_deleted() {
                None
            } else {
                Some(self.text.clone())
            },
            uuid: self.uuid.clone(),
            status: self.status,
            created_at: self.created_at,
            received_at: self.received_at,
            read_at: self.read_at,
            edited_at: self.edited_at,
            deleted_at: self.deleted_at,
        }
    }
}

/// Input for [`crate::Database::insert_message`].
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub sender: UserId,
    pub receiver: UserId,
    pub text: String,
    pub uuid: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uid(s: &str) -> UserId {
        UserId::parse(s).unwrap()
    }

    #[test]
    fn test_ordered_pair_is_symmetric() {
        assert_eq!(
            ordered_pair(&uid("bob"), &uid("alice")),
            ordered_pair(&uid("alice"), &uid("bob"))
        );
    }

    #[test]
    fn test_removed_message_view_hides_text() {
        let now = Utc::now();
        let message = Message {
            id: MessageId::new(),
            conversation_id: ConversationId::new(),
            sender: uid("alice"),
            receiver: uid("bob"),
            text: "secret".into(),
            uuid: "u1".into(),
            status: MessageStatus::Pending,
            created_at: now,
            received_at: None,
            read_at: None,
            edited_at: None,
            deleted_at: Some(now),
            edited_after_received: false,
            deleted_after_received: false,
        };
        assert_eq!(message.view().text, None);
    }
}
