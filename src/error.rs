use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
    #[error("counter store timed out after {0:?}")]
    TimedOut(Duration),
    #[error("counter store rejected key {key}: {reason}")]
    KeyRejected { key: String, reason: String },
}

impl StoreError {
    /// Whether the caller may retry the same operation.
    ///
    /// Every store failure is treated as transient, including a rejected key.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Unavailable(_) | StoreError::TimedOut(_) | StoreError::KeyRejected { .. }
        )
    }
}

// Client-side timeouts land here too; only `bounded` knows the real deadline,
// so they are reported as unavailability with the client's own message.
impl From<redis::RedisError> for StoreError {
    fn from(error: redis::RedisError) -> Self {
        StoreError::Unavailable(error.to_string())
    }
}

#[derive(Error, Debug)]
pub enum DeliveryFailure {
    #[error("subscriber disconnected")]
    Disconnected,
    #[error("failed to encode snapshot: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Error, Debug)]
pub enum SubscribeError {
    #[error("hub is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Error, Debug)]
pub enum VoteError {
    #[error("Vote rejected")]
    Rejected,
    #[error("Counter store error: {0}")]
    Store(#[from] StoreError),
}

impl IntoResponse for VoteError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            VoteError::Rejected => (StatusCode::CONFLICT, "Vote rejected"),
            VoteError::Store(_) => (StatusCode::SERVICE_UNAVAILABLE, "Counter store unavailable"),
        };

        let body = Json(json!({
            "error": error_message,
            "details": self.to_string()
        }));

        (status, body).into_response()
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid {key} value {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}
