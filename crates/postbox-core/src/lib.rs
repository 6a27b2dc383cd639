//! Core domain model for the postbox outbox dispatcher.
//!
//! Provides strongly-typed identifiers, the persisted envelope model with its
//! status state machine, the closed handler-outcome variant, clock
//! abstractions, and the core error taxonomy. The dispatch crate builds on
//! these foundational types; nothing here performs I/O.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{EnvelopeStatus, EventEnvelope, EventId, EventType, HandleOutcome, LockKey};
pub use time::{Clock, SystemClock, TestClock};
