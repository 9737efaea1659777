use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use parley_shared::protocol::AckReply;
use parley_shared::ProtocolError;
use parley_store::StoreError;

/// Errors on the HTTP surface (before a socket is upgraded).
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServerError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        };

        let body = serde_json::json!({
            "error": self.to_string(),
        });

        (status, axum::Json(body)).into_response()
    }
}

/// Failures of the presence key-value store.
#[derive(Debug, Error)]
pub enum PresenceError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Invalid connection handle in presence store: {0}")]
    InvalidHandle(String),
}

/// Outcome of a failed handler, reported through the caller's acknowledgment.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Forbidden(&'static str),

    #[error("{0}")]
    NotFound(&'static str),

    #[error("conversation is blocked")]
    Blocked,

    #[error("internal error: {0}")]
    Internal(String),
}

impl HandlerError {
    /// Failure acknowledgment for the caller. Internal details stay in the
    /// logs.
    pub fn into_reply(self) -> AckReply {
        match self {
            HandlerError::Internal(detail) => {
                tracing::error!(error = %detail, "handler failed");
                AckReply::failure("internal error")
            }
            other => AckReply::failure(other.to_string()),
        }
    }
}

impl From<ProtocolError> for HandlerError {
    fn from(err: ProtocolError) -> Self {
        HandlerError::Validation(err.to_string())
    }
}

impl From<StoreError> for HandlerError {
    fn from(err: StoreError) -> Self {
        HandlerError::Internal(err.to_string())
    }
}

impl From<PresenceError> for HandlerError {
    fn from(err: PresenceError) -> Self {
        HandlerError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_errors_are_generic_for_callers() {
        let reply = HandlerError::Internal("disk on fire".into()).into_reply();
        assert_eq!(reply.error.as_deref(), Some("internal error"));
    }

    #[test]
    fn test_blocked_reason() {
        let reply = HandlerError::Blocked.into_reply();
        assert!(!reply.is_success());
        assert_eq!(reply.error.as_deref(), Some("conversation is blocked"));
    }
}
