//! Event store abstraction for the dispatch engine.
//!
//! The durable outbox table is an external collaborator; the engine only
//! needs to fetch due envelopes and issue conditional status updates. The
//! trait boundary keeps dispatch logic testable without a database and lets
//! deployments plug in their own storage.

use std::{future::Future, pin::Pin};

use chrono::{DateTime, Utc};
use postbox_core::models::{EnvelopeStatus, EventEnvelope, EventId};

use crate::error::Result;

/// Conditional status update for one envelope.
///
/// `from` is the status the caller observed; the store applies the update
/// only when it still matches, so two workers racing on the same envelope
/// cannot both progress it.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    /// Envelope to update.
    pub id: EventId,
    /// Status the envelope is expected to be in.
    pub from: EnvelopeStatus,
    /// Status to transition to.
    pub to: EnvelopeStatus,
    /// Attempt count to record.
    pub attempts: u32,
    /// Most recent failure or retry reason, if any.
    pub fail_reason: Option<String>,
    /// When the envelope becomes due again, for retry scheduling.
    pub next_attempt_at: Option<DateTime<Utc>>,
}

/// Result of a conditional status update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The update was applied.
    Updated,
    /// The envelope was no longer in the expected status.
    ///
    /// Another worker already progressed it; callers log and skip, this is
    /// an expected race rather than an error.
    Conflict,
}

/// Storage operations required by the dispatch engine.
pub trait EventStore: Send + Sync + 'static {
    /// Fetches envelopes due for processing.
    ///
    /// Returns up to `limit` envelopes in `Pending` or `RetryScheduled`
    /// status whose next-attempt time has passed, ordered by creation time
    /// oldest first to bound worst-case staleness.
    fn fetch_due(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<EventEnvelope>>> + Send + '_>>;

    /// Applies a conditional status update.
    ///
    /// Returns [`UpdateOutcome::Conflict`] when the envelope's current
    /// status no longer matches `update.from`.
    fn update_status(
        &self,
        update: StatusUpdate,
    ) -> Pin<Box<dyn Future<Output = Result<UpdateOutcome>> + Send + '_>>;

    /// Pushes an envelope's next-attempt time forward without consuming an
    /// attempt.
    ///
    /// Used for envelopes that were fetched but cannot be processed in this
    /// pass, such as disabled event types, so they stop dominating
    /// oldest-first batches. Conditional on the envelope still being in
    /// `from` status; returns [`UpdateOutcome::Conflict`] when it is not.
    fn defer(
        &self,
        id: EventId,
        from: EnvelopeStatus,
        next_attempt_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<UpdateOutcome>> + Send + '_>>;

    /// Looks up one envelope by id.
    fn find_envelope(
        &self,
        id: EventId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<EventEnvelope>>> + Send + '_>>;
}

pub mod mock {
    //! In-memory store for tests and single-process deployments.

    use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

    use chrono::{DateTime, Utc};
    use postbox_core::{
        models::{EnvelopeStatus, EventEnvelope, EventId},
        CoreError,
    };
    use tokio::sync::RwLock;

    use super::{EventStore, StatusUpdate, UpdateOutcome};
    use crate::error::{DispatchError, Result};

    /// Deterministic in-memory event store.
    ///
    /// Supports injecting fetch failures to exercise the engine's error
    /// paths.
    pub struct InMemoryStore {
        envelopes: Arc<RwLock<HashMap<EventId, EventEnvelope>>>,
        fetch_error: Arc<RwLock<Option<String>>>,
    }

    impl InMemoryStore {
        /// Creates an empty store.
        pub fn new() -> Self {
            Self {
                envelopes: Arc::new(RwLock::new(HashMap::new())),
                fetch_error: Arc::new(RwLock::new(None)),
            }
        }

        /// Inserts an envelope, replacing any previous one with the same id.
        pub async fn insert(&self, envelope: EventEnvelope) {
            self.envelopes.write().await.insert(envelope.id, envelope);
        }

        /// Injects an error returned by the next `fetch_due` call.
        pub async fn inject_fetch_error(&self, message: impl Into<String>) {
            *self.fetch_error.write().await = Some(message.into());
        }

        /// Current status of an envelope, if present.
        pub async fn status_of(&self, id: EventId) -> Option<EnvelopeStatus> {
            self.envelopes.read().await.get(&id).map(|e| e.status)
        }

        /// Current attempt count of an envelope, if present.
        pub async fn attempts_of(&self, id: EventId) -> Option<u32> {
            self.envelopes.read().await.get(&id).map(|e| e.attempts)
        }
    }

    impl Default for InMemoryStore {
        fn default() -> Self {
            Self::new()
        }
    }

    impl EventStore for InMemoryStore {
        fn fetch_due(
            &self,
            limit: usize,
            now: DateTime<Utc>,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<EventEnvelope>>> + Send + '_>> {
            let envelopes = self.envelopes.clone();
            let fetch_error = self.fetch_error.clone();

            Box::pin(async move {
                if let Some(message) = fetch_error.write().await.take() {
                    return Err(DispatchError::store(message));
                }

                let mut due: Vec<EventEnvelope> = envelopes
                    .read()
                    .await
                    .values()
                    .filter(|e| {
                        matches!(
                            e.status,
                            EnvelopeStatus::Pending | EnvelopeStatus::RetryScheduled
                        ) && e.is_due(now)
                    })
                    .cloned()
                    .collect();

                due.sort_by_key(|e| e.created_at);
                due.truncate(limit);
                Ok(due)
            })
        }

        fn update_status(
            &self,
            update: StatusUpdate,
        ) -> Pin<Box<dyn Future<Output = Result<UpdateOutcome>> + Send + '_>> {
            let envelopes = self.envelopes.clone();

            Box::pin(async move {
                let mut envelopes = envelopes.write().await;
                let envelope = envelopes
                    .get_mut(&update.id)
                    .ok_or_else(|| DispatchError::store(format!("envelope {} not found", update.id)))?;

                if envelope.status != update.from {
                    return Ok(UpdateOutcome::Conflict);
                }
                if !update.from.can_transition_to(update.to) {
                    return Err(CoreError::invalid_envelope(
                        update.id,
                        format!("illegal transition {} -> {}", update.from, update.to),
                    )
                    .into());
                }

                envelope.status = update.to;
                envelope.attempts = update.attempts;
                envelope.fail_reason = update.fail_reason;
                envelope.next_attempt_at = update.next_attempt_at;
                Ok(UpdateOutcome::Updated)
            })
        }

        fn defer(
            &self,
            id: EventId,
            from: EnvelopeStatus,
            next_attempt_at: DateTime<Utc>,
        ) -> Pin<Box<dyn Future<Output = Result<UpdateOutcome>> + Send + '_>> {
            let envelopes = self.envelopes.clone();

            Box::pin(async move {
                let mut envelopes = envelopes.write().await;
                let envelope = envelopes
                    .get_mut(&id)
                    .ok_or_else(|| DispatchError::store(format!("envelope {id} not found")))?;

                if envelope.status != from {
                    return Ok(UpdateOutcome::Conflict);
                }

                envelope.next_attempt_at = Some(next_attempt_at);
                Ok(UpdateOutcome::Updated)
            })
        }

        fn find_envelope(
            &self,
            id: EventId,
        ) -> Pin<Box<dyn Future<Output = Result<Option<EventEnvelope>>> + Send + '_>> {
            let envelopes = self.envelopes.clone();
            Box::pin(async move { Ok(envelopes.read().await.get(&id).cloned()) })
        }
    }

    #[cfg(test)]
    mod tests {
        use postbox_core::models::{EventType, LockKey};
        use serde_json::json;

        use super::*;

        fn envelope_created_at(created_at: DateTime<Utc>) -> EventEnvelope {
            EventEnvelope::new(
                EventType::new("order.placed"),
                json!({ "order_id": "ord-1" }),
                LockKey::new("order-1"),
                created_at,
            )
        }

        #[tokio::test]
        async fn fetch_due_orders_oldest_first_and_respects_limit() {
            let store = InMemoryStore::new();
            let now = Utc::now();

            let newest = envelope_created_at(now);
            let oldest = envelope_created_at(now - chrono::Duration::minutes(10));
            let middle = envelope_created_at(now - chrono::Duration::minutes(5));

            store.insert(newest.clone()).await;
            store.insert(oldest.clone()).await;
            store.insert(middle.clone()).await;

            let due = store.fetch_due(2, now).await.expect("fetch succeeds");
            assert_eq!(due.len(), 2);
            assert_eq!(due[0].id, oldest.id);
            assert_eq!(due[1].id, middle.id);
        }

        #[tokio::test]
        async fn fetch_due_skips_envelopes_not_yet_due() {
            let store = InMemoryStore::new();
            let now = Utc::now();

            let mut scheduled = envelope_created_at(now);
            scheduled.status = EnvelopeStatus::RetryScheduled;
            scheduled.next_attempt_at = Some(now + chrono::Duration::minutes(5));
            store.insert(scheduled.clone()).await;

            assert!(store.fetch_due(10, now).await.expect("fetch succeeds").is_empty());

            let later = now + chrono::Duration::minutes(6);
            let due = store.fetch_due(10, later).await.expect("fetch succeeds");
            assert_eq!(due.len(), 1);
            assert_eq!(due[0].id, scheduled.id);
        }

        #[tokio::test]
        async fn update_status_detects_conflicts() {
            let store = InMemoryStore::new();
            let envelope = envelope_created_at(Utc::now());
            store.insert(envelope.clone()).await;

            let claim = StatusUpdate {
                id: envelope.id,
                from: EnvelopeStatus::Pending,
                to: EnvelopeStatus::Processing,
                attempts: 0,
                fail_reason: None,
                next_attempt_at: None,
            };

            assert_eq!(
                store.update_status(claim.clone()).await.expect("update succeeds"),
                UpdateOutcome::Updated
            );
            // Second claim observes stale status.
            assert_eq!(
                store.update_status(claim).await.expect("update succeeds"),
                UpdateOutcome::Conflict
            );
        }

        #[tokio::test]
        async fn defer_pushes_due_time_without_consuming_attempts() {
            let store = InMemoryStore::new();
            let now = Utc::now();
            let envelope = envelope_created_at(now);
            store.insert(envelope.clone()).await;

            let later = now + chrono::Duration::seconds(30);
            assert_eq!(
                store
                    .defer(envelope.id, EnvelopeStatus::Pending, later)
                    .await
                    .expect("defer succeeds"),
                UpdateOutcome::Updated
            );

            assert!(store.fetch_due(10, now).await.expect("fetch succeeds").is_empty());
            let due = store.fetch_due(10, later).await.expect("fetch succeeds");
            assert_eq!(due.len(), 1);
            assert_eq!(due[0].attempts, 0);
            assert_eq!(due[0].status, EnvelopeStatus::Pending);

            // A stale status observation does not move the due time.
            assert_eq!(
                store
                    .defer(envelope.id, EnvelopeStatus::Processing, later)
                    .await
                    .expect("defer succeeds"),
                UpdateOutcome::Conflict
            );
        }

        #[tokio::test]
        async fn injected_fetch_error_fires_once() {
            let store = InMemoryStore::new();
            store.inject_fetch_error("connection reset").await;

            let err = store.fetch_due(10, Utc::now()).await.unwrap_err();
            assert!(err.to_string().contains("connection reset"));

            assert!(store.fetch_due(10, Utc::now()).await.is_ok());
        }
    }
}
