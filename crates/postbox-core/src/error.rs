//! Error types shared across the workspace.

use thiserror::Error;

use crate::models::{EventId, EventType};

/// Result type alias using [`CoreError`].
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors for domain-level operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A strategy is already registered for this event type.
    #[error("strategy already registered for event type '{0}'")]
    DuplicateEventType(EventType),

    /// No strategy is registered for this event type.
    #[error("no strategy registered for event type '{0}'")]
    UnknownEventType(EventType),

    /// Event payload could not be decoded into the strategy's input type.
    #[error("payload for event {event_id} does not match expected shape: {reason}")]
    PayloadTypeMismatch {
        /// Event whose payload failed to decode.
        event_id: EventId,
        /// Decode failure detail.
        reason: String,
    },

    /// Envelope state does not permit the requested operation.
    #[error("invalid envelope {event_id}: {reason}")]
    InvalidEnvelope {
        /// Offending event.
        event_id: EventId,
        /// What was wrong with it.
        reason: String,
    },
}

impl CoreError {
    /// Creates a payload mismatch error.
    pub fn payload_mismatch(event_id: EventId, reason: impl Into<String>) -> Self {
        Self::PayloadTypeMismatch { event_id, reason: reason.into() }
    }

    /// Creates an invalid envelope error.
    pub fn invalid_envelope(event_id: EventId, reason: impl Into<String>) -> Self {
        Self::InvalidEnvelope { event_id, reason: reason.into() }
    }
}
