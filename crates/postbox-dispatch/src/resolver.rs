//! Outcome resolution and state transitions.
//!
//! Interprets the [`HandleOutcome`] a handler produced and issues the
//! corresponding conditional status update. Retryable outcomes consult the
//! retry schedule; exhausted envelopes transition to failed with their
//! accumulated reason trail.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use postbox_core::models::{EnvelopeStatus, EventEnvelope, HandleOutcome};
use tracing::{debug, error, warn};

use crate::{
    config::DispatchConfig,
    error::Result,
    retry::{RetryDecision, RetrySchedule},
    store::{EventStore, StatusUpdate, UpdateOutcome},
};

/// State transition the resolver applied for one envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Envelope reached the terminal processed state.
    Processed,
    /// Envelope was scheduled for another attempt.
    RetryScheduled {
        /// When the envelope becomes due again.
        next_attempt_at: DateTime<Utc>,
    },
    /// Envelope reached the terminal failed state.
    Failed,
    /// Another worker progressed the envelope first; nothing was written.
    Conflict,
}

/// Translates handler outcomes into envelope state transitions.
pub struct ResultResolver {
    store: Arc<dyn EventStore>,
    config: DispatchConfig,
}

impl ResultResolver {
    /// Creates a resolver writing through the given store.
    pub fn new(store: Arc<dyn EventStore>, config: DispatchConfig) -> Self {
        Self { store, config }
    }

    /// Resolves one outcome for an envelope currently in `Processing`.
    ///
    /// All writes are conditional on the envelope still being in
    /// `Processing`; a conflict means another worker got there first and is
    /// logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns error only when the store itself fails.
    pub async fn resolve(
        &self,
        envelope: &EventEnvelope,
        outcome: HandleOutcome,
        now: DateTime<Utc>,
    ) -> Result<Resolution> {
        match outcome {
            HandleOutcome::Processed => self.mark_processed(envelope).await,
            HandleOutcome::Retry { reason, delay_hint } => {
                self.schedule_retry(envelope, reason, delay_hint, now).await
            },
            HandleOutcome::Fail { reason } => {
                self.mark_failed(envelope, EnvelopeStatus::Processing, envelope.attempts, reason)
                    .await
            },
        }
    }

    /// Fails an envelope that never reached a handler.
    ///
    /// Used for unknown event types; the envelope transitions from its
    /// current eligible status straight to `Failed` with the attempt count
    /// unchanged, since no attempt was made.
    pub async fn fail_unresolved(
        &self,
        envelope: &EventEnvelope,
        reason: impl Into<String>,
    ) -> Result<Resolution> {
        self.mark_failed(envelope, envelope.status, envelope.attempts, reason.into()).await
    }

    async fn mark_processed(&self, envelope: &EventEnvelope) -> Result<Resolution> {
        let outcome = self
            .store
            .update_status(StatusUpdate {
                id: envelope.id,
                from: EnvelopeStatus::Processing,
                to: EnvelopeStatus::Processed,
                attempts: envelope.attempts,
                fail_reason: None,
                next_attempt_at: None,
            })
            .await?;

        match outcome {
            UpdateOutcome::Updated => {
                debug!(event_id = %envelope.id, event_type = %envelope.event_type, "envelope processed");
                Ok(Resolution::Processed)
            },
            UpdateOutcome::Conflict => Ok(self.log_conflict(envelope, "processed")),
        }
    }

    async fn schedule_retry(
        &self,
        envelope: &EventEnvelope,
        reason: String,
        delay_hint: Option<std::time::Duration>,
        now: DateTime<Utc>,
    ) -> Result<Resolution> {
        let attempts = envelope.attempts + 1;
        let trail = append_reason(envelope.fail_reason.as_deref(), &reason);

        let policy = self.config.retry_policy_for(&envelope.event_type);
        let schedule = RetrySchedule::new(policy);

        match schedule.decide(attempts, delay_hint, now) {
            RetryDecision::Retry { next_attempt_at } => {
                let outcome = self
                    .store
                    .update_status(StatusUpdate {
                        id: envelope.id,
                        from: EnvelopeStatus::Processing,
                        to: EnvelopeStatus::RetryScheduled,
                        attempts,
                        fail_reason: Some(trail),
                        next_attempt_at: Some(next_attempt_at),
                    })
                    .await?;

                match outcome {
                    UpdateOutcome::Updated => {
                        warn!(
                            event_id = %envelope.id,
                            event_type = %envelope.event_type,
                            attempt = attempts,
                            next_attempt_at = %next_attempt_at,
                            reason = %reason,
                            "handler failed, retry scheduled"
                        );
                        Ok(Resolution::RetryScheduled { next_attempt_at })
                    },
                    UpdateOutcome::Conflict => Ok(self.log_conflict(envelope, "retry_scheduled")),
                }
            },
            RetryDecision::GiveUp { reason: give_up } => {
                self.mark_failed(
                    envelope,
                    EnvelopeStatus::Processing,
                    attempts,
                    format!("{trail} ({give_up})"),
                )
                .await
            },
        }
    }

    async fn mark_failed(
        &self,
        envelope: &EventEnvelope,
        from: EnvelopeStatus,
        attempts: u32,
        reason: String,
    ) -> Result<Resolution> {
        let outcome = self
            .store
            .update_status(StatusUpdate {
                id: envelope.id,
                from,
                to: EnvelopeStatus::Failed,
                attempts,
                fail_reason: Some(reason.clone()),
                next_attempt_at: None,
            })
            .await?;

        match outcome {
            UpdateOutcome::Updated => {
                error!(
                    event_id = %envelope.id,
                    event_type = %envelope.event_type,
                    attempt = attempts,
                    reason = %reason,
                    "envelope permanently failed"
                );
                Ok(Resolution::Failed)
            },
            UpdateOutcome::Conflict => Ok(self.log_conflict(envelope, "failed")),
        }
    }

    fn log_conflict(&self, envelope: &EventEnvelope, intended: &str) -> Resolution {
        warn!(
            event_id = %envelope.id,
            event_type = %envelope.event_type,
            intended,
            "status update conflicted, another worker progressed this envelope"
        );
        Resolution::Conflict
    }
}

/// Appends the newest failure reason to the accumulated trail.
fn append_reason(previous: Option<&str>, reason: &str) -> String {
    match previous {
        Some(previous) => format!("{previous}; {reason}"),
        None => reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use postbox_core::models::{EventType, LockKey};
    use serde_json::json;

    use super::*;
    use crate::store::mock::InMemoryStore;

    fn processing_envelope(attempts: u32) -> EventEnvelope {
        let mut envelope = EventEnvelope::new(
            EventType::new("order.placed"),
            json!({ "order_id": "ord-1" }),
            LockKey::new("order-1"),
            Utc::now(),
        );
        envelope.status = EnvelopeStatus::Processing;
        envelope.attempts = attempts;
        envelope
    }

    async fn resolver_with(envelope: &EventEnvelope) -> (ResultResolver, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        store.insert(envelope.clone()).await;
        (ResultResolver::new(store.clone(), DispatchConfig::default()), store)
    }

    #[tokio::test]
    async fn processed_outcome_is_terminal() {
        let envelope = processing_envelope(0);
        let (resolver, store) = resolver_with(&envelope).await;

        let resolution = resolver
            .resolve(&envelope, HandleOutcome::processed(), Utc::now())
            .await
            .expect("resolve succeeds");

        assert_eq!(resolution, Resolution::Processed);
        assert_eq!(store.status_of(envelope.id).await, Some(EnvelopeStatus::Processed));
    }

    #[tokio::test]
    async fn retry_outcome_increments_attempts_and_schedules() {
        let envelope = processing_envelope(0);
        let (resolver, store) = resolver_with(&envelope).await;
        let now = Utc::now();

        let resolution = resolver
            .resolve(&envelope, HandleOutcome::retry("downstream 503"), now)
            .await
            .expect("resolve succeeds");

        match resolution {
            Resolution::RetryScheduled { next_attempt_at } => assert!(next_attempt_at > now),
            other => unreachable!("expected retry, got {other:?}"),
        }
        assert_eq!(store.status_of(envelope.id).await, Some(EnvelopeStatus::RetryScheduled));
        assert_eq!(store.attempts_of(envelope.id).await, Some(1));
    }

    #[tokio::test]
    async fn retry_at_ceiling_fails_permanently() {
        // Default policy allows 3 attempts; this retry is the third.
        let envelope = processing_envelope(2);
        let (resolver, store) = resolver_with(&envelope).await;

        let resolution = resolver
            .resolve(&envelope, HandleOutcome::retry("still down"), Utc::now())
            .await
            .expect("resolve succeeds");

        assert_eq!(resolution, Resolution::Failed);
        assert_eq!(store.status_of(envelope.id).await, Some(EnvelopeStatus::Failed));
        assert_eq!(store.attempts_of(envelope.id).await, Some(3));
    }

    #[tokio::test]
    async fn fail_outcome_ignores_attempt_count() {
        let envelope = processing_envelope(0);
        let (resolver, store) = resolver_with(&envelope).await;

        let resolution = resolver
            .resolve(&envelope, HandleOutcome::fail("payload can never be delivered"), Utc::now())
            .await
            .expect("resolve succeeds");

        assert_eq!(resolution, Resolution::Failed);
        assert_eq!(store.status_of(envelope.id).await, Some(EnvelopeStatus::Failed));
        assert_eq!(store.attempts_of(envelope.id).await, Some(0));
    }

    #[tokio::test]
    async fn delay_hint_drives_retry_time() {
        let envelope = processing_envelope(0);
        let (resolver, store) = resolver_with(&envelope).await;
        let now = Utc::now();
        let hint = std::time::Duration::from_secs(3600);

        let resolution = resolver
            .resolve(&envelope, HandleOutcome::retry_after("rate limited", hint), now)
            .await
            .expect("resolve succeeds");

        match resolution {
            Resolution::RetryScheduled { next_attempt_at } => {
                assert_eq!(next_attempt_at, now + chrono::Duration::seconds(3600));
            },
            other => unreachable!("expected retry, got {other:?}"),
        }
        assert_eq!(store.status_of(envelope.id).await, Some(EnvelopeStatus::RetryScheduled));
    }

    #[tokio::test]
    async fn conflict_leaves_store_untouched() {
        let mut stale = processing_envelope(0);
        let (resolver, store) = resolver_with(&stale).await;

        // Another worker already resolved this envelope.
        resolver
            .resolve(&stale, HandleOutcome::processed(), Utc::now())
            .await
            .expect("first resolve succeeds");

        stale.attempts = 0;
        let resolution = resolver
            .resolve(&stale, HandleOutcome::retry("late outcome"), Utc::now())
            .await
            .expect("resolve succeeds");

        assert_eq!(resolution, Resolution::Conflict);
        assert_eq!(store.status_of(stale.id).await, Some(EnvelopeStatus::Processed));
    }

    #[tokio::test]
    async fn reason_trail_accumulates() {
        let mut envelope = processing_envelope(1);
        envelope.fail_reason = Some("downstream 503".to_string());
        let (resolver, store) = resolver_with(&envelope).await;

        resolver
            .resolve(&envelope, HandleOutcome::retry("connection refused"), Utc::now())
            .await
            .expect("resolve succeeds");

        let stored = store.find_envelope(envelope.id).await.expect("find succeeds").unwrap();
        let trail = stored.fail_reason.expect("trail recorded");
        assert!(trail.contains("downstream 503"));
        assert!(trail.contains("connection refused"));
    }

    #[tokio::test]
    async fn fail_unresolved_keeps_attempts_unchanged() {
        let mut envelope = processing_envelope(2);
        envelope.status = EnvelopeStatus::Pending;
        let (resolver, store) = resolver_with(&envelope).await;

        let resolution = resolver
            .fail_unresolved(&envelope, "no strategy registered for event type 'order.placed'")
            .await
            .expect("resolve succeeds");

        assert_eq!(resolution, Resolution::Failed);
        assert_eq!(store.status_of(envelope.id).await, Some(EnvelopeStatus::Failed));
        assert_eq!(store.attempts_of(envelope.id).await, Some(2));
    }
}
