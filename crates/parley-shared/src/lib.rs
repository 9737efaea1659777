//! # parley-shared
//!
//! Identifiers, the WebSocket wire protocol and payload validation shared by
//! the store and the server.

pub mod constants;
pub mod protocol;
pub mod types;

mod error;

pub use error::ProtocolError;
pub use types::{ConversationId, MessageId, MessageStatus, PresenceStatus, UserId};
