use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{MAX_CLIENT_UUID_LEN, MAX_TEXT_LEN};
use crate::error::ProtocolError;
use crate::types::{ConversationId, MessageId, MessageStatus, PresenceStatus, UserId};

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// Everything a client writes on the socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientFrame {
    /// Invoke a handler. `ack` is the callback id the reply is sent to; a
    /// request without one is rejected without side effects.
    Request {
        #[serde(default)]
        ack: Option<u64>,
        request: serde_json::Value,
    },

    /// Answer to a server push that asked for acknowledgment.
    Ack { id: u64, reply: AckReply },
}

/// Everything the server writes on the socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerFrame {
    /// A pushed event. When `ack` is set the client must answer with a
    /// [`ClientFrame::Ack`] carrying the same id.
    Event { ack: Option<u64>, event: ServerEvent },

    /// Reply to a [`ClientFrame::Request`].
    Ack { id: u64, reply: AckReply },
}

impl ServerFrame {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl ClientFrame {
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

// ---------------------------------------------------------------------------
// Client requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientRequest {
    SendMessage(SendMessage),
    ReadMessage(MessageRef),
    EditMessage(EditMessage),
    RemoveMessage(MessageRef),
    BlockConversation(ConversationRef),
    UnblockConversation(ConversationRef),
    RemoveConversation(ConversationRef),
    JoinConversation(PeerRef),
}

impl ClientRequest {
    pub fn from_value(value: serde_json::Value) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::SendMessage(_) => "send-message",
            Self::ReadMessage(_) => "read-message",
            Self::EditMessage(_) => "edit-message",
            Self::RemoveMessage(_) => "remove-message",
            Self::BlockConversation(_) => "block-conversation",
            Self::UnblockConversation(_) => "unblock-conversation",
            Self::RemoveConversation(_) => "remove-conversation",
            Self::JoinConversation(_) => "join-conversation",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessage {
    pub to: String,
    pub text: String,
    pub uuid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditMessage {
    pub id: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRef {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRef {
    pub id: String,
}

/// `join-conversation` addresses the counterpart, not the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRef {
    pub id: String,
}

/// Trim and bound message text.
pub fn validate_text(text: &str) -> Result<String, ProtocolError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(ProtocolError::EmptyText);
    }
    if text.chars().count() > MAX_TEXT_LEN {
        return Err(ProtocolError::TextTooLong { max: MAX_TEXT_LEN });
    }
    Ok(text.to_string())
}

pub fn validate_client_uuid(uuid: &str) -> Result<String, ProtocolError> {
    let uuid = uuid.trim();
    if uuid.is_empty() || uuid.len() > MAX_CLIENT_UUID_LEN {
        return Err(ProtocolError::InvalidClientUuid {
            max: MAX_CLIENT_UUID_LEN,
        });
    }
    Ok(uuid.to_string())
}

// ---------------------------------------------------------------------------
// Server events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// Conversation list pushed once per connect.
    Conversations(Vec<ConversationView>),
    NewConversation(ConversationView),
    ReceiveMessage(MessageView),
    StatusMessage(StatusChange),
    EditMessage(MessageView),
    RemoveMessage(MessageView),
    BlockConversation(ConversationNotice),
    UnblockConversation(ConversationNotice),
    StatusUpdate(PeerView),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Conversations(_) => "conversations",
            Self::NewConversation(_) => "new-conversation",
            Self::ReceiveMessage(_) => "receive-message",
            Self::StatusMessage(_) => "status-message",
            Self::EditMessage(_) => "edit-message",
            Self::RemoveMessage(_) => "remove-message",
            Self::BlockConversation(_) => "block-conversation",
            Self::UnblockConversation(_) => "unblock-conversation",
            Self::StatusUpdate(_) => "status-update",
        }
    }
}

/// Receiver-safe projection of a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageView {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender: UserId,
    pub receiver: UserId,
    /// `None` once the message has been removed.
    pub text: Option<String>,
    pub uuid: String,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    pub received_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub edited_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationView {
    pub id: ConversationId,
    pub participants: Vec<UserId>,
    /// The participant that is not the recipient of this view.
    pub peer: UserId,
    pub peer_status: PresenceStatus,
    pub latest_message: Option<MessageView>,
    pub blocked_by: Vec<UserId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusChange {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub status: MessageStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationNotice {
    pub conversation_id: ConversationId,
    pub by: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerView {
    pub user_id: UserId,
    pub status: PresenceStatus,
}

// ---------------------------------------------------------------------------
// Acknowledgments
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    #[default]
    Success,
    Failure,
}

/// Application-level acknowledgment, in both directions.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AckReply {
    pub status: AckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<MessageView>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation: Option<ConversationView>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer: Option<PeerView>,
    /// Set by `remove-conversation`: whether the caller had already hidden it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub already_removed: Option<bool>,
}

impl AckReply {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            status: AckStatus::Failure,
            error: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn with_message(mut self, message: MessageView) -> Self {
        self.message = Some(message);
        self
    }

    pub fn with_conversation(mut self, conversation: Option<ConversationView>) -> Self {
        self.conversation = conversation;
        self
    }

    pub fn with_peer(mut self, peer: PeerView) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == AckStatus::Success
    }
}
