//! Dispatch worker processing envelopes from the store.
//!
//! Each worker repeatedly fetches due envelopes, resolves the handler for
//! each, serializes processing per lock key, bounds handler execution with a
//! timeout, and hands the outcome to the result resolver. Per-event failures
//! are contained; nothing a handler does can crash the worker loop.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use postbox_core::{
    models::{EnvelopeStatus, EventEnvelope, HandleOutcome},
    Clock,
};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::DispatchConfig,
    engine::EngineStats,
    error::{DispatchError, Result},
    handler::{ErasedHandler, StrategyRegistry},
    lock::LockCoordinator,
    resolver::{Resolution, ResultResolver},
    store::{EventStore, StatusUpdate, UpdateOutcome},
};

/// Individual worker that dispatches outbox envelopes.
pub(crate) struct DispatchWorker {
    id: usize,
    store: Arc<dyn EventStore>,
    registry: Arc<StrategyRegistry>,
    locks: Arc<dyn LockCoordinator>,
    resolver: Arc<ResultResolver>,
    config: DispatchConfig,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    clock: Arc<dyn Clock>,
}

impl DispatchWorker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: usize,
        store: Arc<dyn EventStore>,
        registry: Arc<StrategyRegistry>,
        locks: Arc<dyn LockCoordinator>,
        resolver: Arc<ResultResolver>,
        config: DispatchConfig,
        stats: Arc<RwLock<EngineStats>>,
        cancellation_token: CancellationToken,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { id, store, registry, locks, resolver, config, stats, cancellation_token, clock }
    }

    /// Main worker loop. Fetches and processes envelopes until cancelled.
    pub(crate) async fn run(&self) -> Result<()> {
        info!(worker_id = self.id, "dispatch worker starting");

        loop {
            if self.cancellation_token.is_cancelled() {
                info!(worker_id = self.id, "dispatch worker received shutdown signal");
                break;
            }

            match self.process_pass().await {
                Ok(0) => {
                    tokio::select! {
                        () = self.clock.sleep(self.config.poll_interval) => {},
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
                Ok(_) => {},
                Err(error) => {
                    error!(
                        worker_id = self.id,
                        error = %error,
                        "worker pass failed"
                    );
                    // Wait before retrying to avoid tight error loops.
                    tokio::select! {
                        () = self.clock.sleep(Duration::from_secs(5)) => {},
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
            }
        }

        info!(worker_id = self.id, "dispatch worker stopped");
        Ok(())
    }

    /// Fetches one batch of due envelopes and processes them in order.
    ///
    /// Returns the number of envelopes that made progress. Envelopes skipped
    /// over a held lock key or a disabled event type do not count, so a
    /// batch where nothing progressed paces the loop at the poll interval
    /// instead of refetching immediately. Per-envelope failures are logged
    /// and contained; only a store fetch failure propagates.
    pub(crate) async fn process_pass(&self) -> Result<usize> {
        let envelopes = self.store.fetch_due(self.config.batch_size, self.clock.now()).await?;

        debug!(worker_id = self.id, batch_size = envelopes.len(), "processing envelope batch");

        let mut progressed = 0;
        for envelope in envelopes {
            if self.cancellation_token.is_cancelled() {
                break;
            }

            match self.process_envelope(envelope).await {
                Ok(true) => progressed += 1,
                Ok(false) => {},
                Err(error) => {
                    error!(
                        worker_id = self.id,
                        error = %error,
                        "envelope processing failed"
                    );
                },
            }
        }

        Ok(progressed)
    }

    /// Processes a single envelope through the dispatch pipeline.
    ///
    /// Returns whether the envelope made progress, meaning its store state
    /// changed or another worker already progressed it.
    async fn process_envelope(&self, envelope: EventEnvelope) -> Result<bool> {
        if !self.config.is_type_enabled(&envelope.event_type) {
            debug!(
                worker_id = self.id,
                event_id = %envelope.id,
                event_type = %envelope.event_type,
                "event type disabled, deferring"
            );
            self.defer_envelope(&envelope).await?;
            return Ok(false);
        }

        if envelope.lock_key.is_empty() {
            warn!(
                worker_id = self.id,
                event_id = %envelope.id,
                event_type = %envelope.event_type,
                "envelope has an empty lock key and cannot be dispatched, deferring"
            );
            self.defer_envelope(&envelope).await?;
            return Ok(false);
        }

        // A missing handler cannot be fixed by retrying.
        let handler = match self.registry.resolve(&envelope.event_type) {
            Ok(handler) => handler,
            Err(error) => {
                let resolution = self.resolver.fail_unresolved(&envelope, error.to_string()).await?;
                let mut stats = self.stats.write().await;
                stats.events_processed += 1;
                match resolution {
                    Resolution::Failed => stats.permanent_failures += 1,
                    _ => stats.update_conflicts += 1,
                }
                return Ok(true);
            },
        };

        if !self.locks.try_acquire(&envelope.lock_key, self.config.lock_ttl).await {
            debug!(
                worker_id = self.id,
                event_id = %envelope.id,
                lock_key = %envelope.lock_key,
                "lock key held, envelope deferred to a later pass"
            );
            self.stats.write().await.lock_skips += 1;
            return Ok(false);
        }

        {
            let mut stats = self.stats.write().await;
            stats.in_flight += 1;
        }

        // The lock must be released on every exit path from here on.
        let result = self.process_locked(&envelope, handler).await;
        self.locks.release(&envelope.lock_key).await;

        {
            let mut stats = self.stats.write().await;
            stats.in_flight -= 1;
            stats.events_processed += 1;
        }

        let resolution = result?;
        let mut stats = self.stats.write().await;
        match resolution {
            Some(Resolution::Processed) => stats.processed += 1,
            Some(Resolution::RetryScheduled { .. }) => stats.retries_scheduled += 1,
            Some(Resolution::Failed) => stats.permanent_failures += 1,
            Some(Resolution::Conflict) | None => stats.update_conflicts += 1,
        }

        Ok(true)
    }

    /// Pushes the envelope's due time past the next poll without consuming
    /// an attempt.
    ///
    /// Keeps envelopes that cannot be dispatched right now from occupying
    /// the head of every oldest-first batch and starving younger envelopes.
    async fn defer_envelope(&self, envelope: &EventEnvelope) -> Result<()> {
        let next_attempt_at = chrono::Duration::from_std(self.config.poll_interval)
            .ok()
            .and_then(|horizon| self.clock.now().checked_add_signed(horizon))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        if self.store.defer(envelope.id, envelope.status, next_attempt_at).await?
            == UpdateOutcome::Conflict
        {
            debug!(
                worker_id = self.id,
                event_id = %envelope.id,
                "defer conflicted, another worker already progressed this envelope"
            );
        }
        Ok(())
    }

    /// Claims the envelope, runs the handler, and resolves the outcome.
    ///
    /// Returns `None` when the claim conflicted and nothing ran.
    async fn process_locked(
        &self,
        envelope: &EventEnvelope,
        handler: Arc<dyn ErasedHandler>,
    ) -> Result<Option<Resolution>> {
        let claim = self
            .store
            .update_status(StatusUpdate {
                id: envelope.id,
                from: envelope.status,
                to: EnvelopeStatus::Processing,
                attempts: envelope.attempts,
                fail_reason: envelope.fail_reason.clone(),
                next_attempt_at: None,
            })
            .await?;

        if claim == UpdateOutcome::Conflict {
            warn!(
                worker_id = self.id,
                event_id = %envelope.id,
                "claim conflicted, another worker already progressed this envelope"
            );
            return Ok(None);
        }

        debug!(
            worker_id = self.id,
            event_id = %envelope.id,
            event_type = %envelope.event_type,
            lock_key = %envelope.lock_key,
            attempt = envelope.attempts + 1,
            "invoking handler"
        );

        let outcome = self.invoke_handler(envelope, handler).await;
        let resolution = self.resolver.resolve(envelope, outcome, self.clock.now()).await?;
        Ok(Some(resolution))
    }

    /// Runs the handler on its own task, bounded by the handler timeout.
    ///
    /// Errors, timeouts and panics all map to an outcome instead of
    /// propagating; a misbehaving handler must not take down the dispatch
    /// loop.
    async fn invoke_handler(
        &self,
        envelope: &EventEnvelope,
        handler: Arc<dyn ErasedHandler>,
    ) -> HandleOutcome {
        let mut task = tokio::spawn(handler.invoke(envelope));

        match tokio::time::timeout(self.config.handler_timeout, &mut task).await {
            Ok(Ok(Ok(outcome))) => outcome,
            Ok(Ok(Err(error))) => {
                if error.is_retryable() {
                    HandleOutcome::retry(error.to_string())
                } else {
                    HandleOutcome::fail(error.to_string())
                }
            },
            Ok(Err(join_error)) => {
                let error = DispatchError::handler_panicked(join_error.to_string());
                warn!(
                    worker_id = self.id,
                    event_id = %envelope.id,
                    error = %error,
                    "handler panicked"
                );
                HandleOutcome::retry(error.to_string())
            },
            Err(_elapsed) => {
                task.abort();
                let error = DispatchError::handler_timeout(self.config.handler_timeout);
                warn!(
                    worker_id = self.id,
                    event_id = %envelope.id,
                    error = %error,
                    "handler timed out"
                );
                HandleOutcome::retry(error.to_string())
            },
        }
    }
}
