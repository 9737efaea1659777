use thiserror::Error;

/// Payload validation failures. The display text is what the client sees in
/// a failure acknowledgment.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("invalid user id: {0:?}")]
    InvalidUserId(String),

    #[error("invalid id: {0:?}")]
    InvalidId(String),

    #[error("text must not be empty")]
    EmptyText,

    #[error("text exceeds {max} characters")]
    TextTooLong { max: usize },

    #[error("uuid must be 1 to {max} characters")]
    InvalidClientUuid { max: usize },

    #[error("malformed payload: {0}")]
    Malformed(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Malformed(err.to_string())
    }
}
