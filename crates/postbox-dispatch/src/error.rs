//! Error types for dispatch operations.
//!
//! Distinguishes configuration errors that abort startup from per-event
//! failures that are contained within a single envelope's processing.
//! Per-event errors carry a retryability classification that drives the
//! result resolver.

use std::time::Duration;

use postbox_core::CoreError;
use thiserror::Error;

/// Result type alias for dispatch operations.
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Errors produced by the dispatch engine and its collaborators.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Registry or payload error from the core layer.
    ///
    /// Covers duplicate registration (fatal at startup), unknown event types
    /// and payload shape mismatches (per-event, non-retryable).
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Handler returned an error instead of an outcome.
    #[error("handler failed: {reason}")]
    HandlerFailed {
        /// Error reported by the handler.
        reason: String,
    },

    /// Handler exceeded its execution timeout.
    #[error("handler timed out after {timeout:?}")]
    HandlerTimeout {
        /// Configured handler timeout.
        timeout: Duration,
    },

    /// Handler task panicked; the dispatch loop contains the panic.
    #[error("handler panicked: {reason}")]
    HandlerPanicked {
        /// Panic or join failure detail.
        reason: String,
    },

    /// Event store operation failed.
    #[error("store error: {message}")]
    Store {
        /// Store failure detail.
        message: String,
    },

    /// Graceful shutdown did not complete within the configured timeout.
    #[error("shutdown timeout exceeded after {timeout:?}")]
    ShutdownTimeout {
        /// Configured shutdown timeout.
        timeout: Duration,
    },

    /// A dispatch worker task panicked.
    #[error("worker {worker_id} panicked: {error}")]
    WorkerPanic {
        /// Identifier of the panicked worker.
        worker_id: usize,
        /// Join error detail.
        error: String,
    },
}

impl DispatchError {
    /// Creates a handler failure from any error message.
    pub fn handler_failed(reason: impl Into<String>) -> Self {
        Self::HandlerFailed { reason: reason.into() }
    }

    /// Creates a handler timeout error.
    pub fn handler_timeout(timeout: Duration) -> Self {
        Self::HandlerTimeout { timeout }
    }

    /// Creates a handler panic error.
    pub fn handler_panicked(reason: impl Into<String>) -> Self {
        Self::HandlerPanicked { reason: reason.into() }
    }

    /// Creates a store error.
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store { message: message.into() }
    }

    /// Whether this failure should be retried.
    ///
    /// Handler errors, timeouts and panics are transient from the
    /// dispatcher's point of view. Missing handlers and payload mismatches
    /// cannot be fixed by retrying, so they route the envelope to failed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::HandlerFailed { .. }
            | Self::HandlerTimeout { .. }
            | Self::HandlerPanicked { .. }
            | Self::Store { .. } => true,

            Self::Core(_) | Self::ShutdownTimeout { .. } | Self::WorkerPanic { .. } => false,
        }
    }
}
