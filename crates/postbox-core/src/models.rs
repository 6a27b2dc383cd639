//! Domain models and strongly-typed identifiers.
//!
//! Defines the persisted outbox envelope, its status state machine, newtype
//! wrappers for identifiers, and the closed outcome variant produced by
//! handler strategies. Status transitions are strictly controlled; the store
//! enforces them again with a compare-and-swap update.

use std::{fmt, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Strongly-typed envelope identifier.
///
/// Wraps a UUID to prevent mixing with other ID types. Envelopes are created
/// once by the producer and this ID follows them through their entire
/// lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
    /// Creates a new random envelope ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EventId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Stable event type tag.
///
/// Distinguishes event kinds across restarts and routes each envelope to the
/// single strategy registered for it. Case-sensitive, compared verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventType(String);

impl EventType {
    /// Creates an event type tag from a stable name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The tag as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EventType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Key serializing the processing of causally related envelopes.
///
/// Typically an aggregate or entity ID. Two envelopes sharing a lock key are
/// never processed concurrently; an empty key never acquires a lock and the
/// envelope is deferred.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockKey(String);

impl LockKey {
    /// Creates a lock key. Must be deterministic and stable for the lifetime
    /// of the event it is derived from.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the key is empty. Empty keys are never lockable.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for LockKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

/// Envelope lifecycle status.
///
/// Envelopes progress through these states during dispatch. Transitions are
/// strictly controlled:
///
/// ```text
/// Pending --------> Processing -> Processed
///    ^                  |
///    |                  |-> Failed
/// RetryScheduled <------'
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeStatus {
    /// Persisted by the producer, waiting for a first dispatch attempt.
    Pending,

    /// A worker has claimed this envelope and is invoking the strategy.
    ///
    /// Prevents duplicate processing should the lock coordinator ever be
    /// bypassed.
    Processing,

    /// Successfully handled. Terminal; never revisited.
    Processed,

    /// Permanently failed. Terminal.
    ///
    /// Reached after retries are exhausted, after an explicit failure
    /// outcome, or for configuration errors such as a missing strategy.
    /// Retained for operator inspection and replay.
    Failed,

    /// Waiting for its next attempt time after a transient failure.
    RetryScheduled,
}

impl EnvelopeStatus {
    /// Whether this status is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Processed | Self::Failed)
    }

    /// Whether a transition to `next` is legal.
    ///
    /// The store's compare-and-swap update is the real guard against racing
    /// workers; this is the in-process check used by the mock store and by
    /// tests.
    pub fn can_transition_to(self, next: Self) -> bool {
        match self {
            Self::Pending | Self::RetryScheduled => matches!(next, Self::Processing | Self::Failed),
            Self::Processing => {
                matches!(next, Self::Processed | Self::Failed | Self::RetryScheduled)
            },
            Self::Processed | Self::Failed => false,
        }
    }
}

impl fmt::Display for EnvelopeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Processing => write!(f, "processing"),
            Self::Processed => write!(f, "processed"),
            Self::Failed => write!(f, "failed"),
            Self::RetryScheduled => write!(f, "retry_scheduled"),
        }
    }
}

/// Persisted outbox envelope.
///
/// The unit of work pulled from the store: a serialized payload plus the
/// routing tag, lock key, and dispatch bookkeeping. The dispatcher only
/// reads and updates status fields; the payload is owned by the producer and
/// never modified here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique identifier for this envelope.
    pub id: EventId,

    /// Routing tag resolving the handling strategy.
    pub event_type: EventType,

    /// Serialized payload, deserialized per-strategy into its typed form.
    pub payload: serde_json::Value,

    /// Key serializing processing of causally related envelopes.
    pub lock_key: LockKey,

    /// Current lifecycle status.
    pub status: EnvelopeStatus,

    /// Number of completed dispatch attempts.
    ///
    /// Incremented only on transient failure. The envelope fails permanently
    /// when this reaches the configured ceiling.
    pub attempts: u32,

    /// Reason recorded for the most recent retry or failure.
    pub fail_reason: Option<String>,

    /// Earliest time the next attempt may run. `None` means immediately.
    pub next_attempt_at: Option<DateTime<Utc>>,

    /// When the producer persisted the envelope.
    ///
    /// Dispatch order is oldest-first on this field, which bounds worst-case
    /// staleness and yields per-key FIFO ordering.
    pub created_at: DateTime<Utc>,
}

impl EventEnvelope {
    /// Creates a pending envelope as a producer would persist it.
    pub fn new(
        event_type: EventType,
        payload: serde_json::Value,
        lock_key: LockKey,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: EventId::new(),
            event_type,
            payload,
            lock_key,
            status: EnvelopeStatus::Pending,
            attempts: 0,
            fail_reason: None,
            next_attempt_at: None,
            created_at,
        }
    }

    /// Whether the envelope is eligible for dispatch at `now`.
    ///
    /// Eligible means non-terminal, not currently claimed, and past its
    /// next-attempt time (if any).
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        let eligible_status =
            matches!(self.status, EnvelopeStatus::Pending | EnvelopeStatus::RetryScheduled);
        eligible_status && self.next_attempt_at.is_none_or(|at| at <= now)
    }
}

/// Outcome of one strategy invocation.
///
/// Produced exclusively by a strategy's handling call and consumed
/// exclusively by the result resolver. The variant is closed: unexpected
/// handler errors are mapped to [`HandleOutcome::Retry`] at the dispatch
/// boundary so a misbehaving handler cannot destabilize the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleOutcome {
    /// The event was handled; the envelope becomes terminal `Processed`.
    Processed,

    /// A transient failure; schedule another attempt.
    Retry {
        /// Reason recorded on the envelope for operators.
        reason: String,

        /// Strategy-supplied delay overriding the computed backoff for this
        /// attempt, e.g. a rate-limit reset interval.
        delay_hint: Option<Duration>,
    },

    /// The handler declares the event unrecoverable; terminal `Failed`
    /// regardless of attempt count.
    Fail {
        /// Reason recorded on the envelope for operators.
        reason: String,
    },
}

impl HandleOutcome {
    /// A successful outcome.
    pub fn processed() -> Self {
        Self::Processed
    }

    /// A transient failure with the computed backoff.
    pub fn retry(reason: impl Into<String>) -> Self {
        Self::Retry { reason: reason.into(), delay_hint: None }
    }

    /// A transient failure with a strategy-supplied delay.
    pub fn retry_after(reason: impl Into<String>, delay: Duration) -> Self {
        Self::Retry { reason: reason.into(), delay_hint: Some(delay) }
    }

    /// A permanent failure.
    pub fn fail(reason: impl Into<String>) -> Self {
        Self::Fail { reason: reason.into() }
    }
}
