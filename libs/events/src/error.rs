//! Error types for event handling.

use thiserror::Error;

/// Errors that can occur when decoding events.
#[derive(Debug, Error, Clone)]
pub enum EventError {
    /// The event type string is unknown.
    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    /// The status string is unknown.
    #[error("unknown instance status: {0}")]
    UnknownStatus(String),

    /// The origin string is unknown.
    #[error("unknown event origin: {0}")]
    UnknownOrigin(String),

    /// The payload does not match its declared type.
    #[error("invalid event payload: {0}")]
    InvalidPayload(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::InvalidPayload(err.to_string())
    }
}
