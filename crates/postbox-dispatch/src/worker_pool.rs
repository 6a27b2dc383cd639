//! Worker pool management with structured concurrency.
//!
//! Provides lifecycle management and graceful shutdown for supervised
//! dispatch worker tasks.

use std::{sync::Arc, time::Duration};

use postbox_core::Clock;
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    config::DispatchConfig,
    engine::EngineStats,
    error::{DispatchError, Result},
    handler::StrategyRegistry,
    lock::LockCoordinator,
    resolver::ResultResolver,
    store::EventStore,
    worker::DispatchWorker,
};

/// Pool of supervised dispatch worker tasks.
///
/// Workers run until cancellation is requested. Dropping the pool without a
/// graceful shutdown cancels the workers so no orphaned tasks keep claiming
/// envelopes.
pub(crate) struct WorkerPool {
    store: Arc<dyn EventStore>,
    registry: Arc<StrategyRegistry>,
    locks: Arc<dyn LockCoordinator>,
    resolver: Arc<ResultResolver>,
    config: DispatchConfig,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    worker_handles: Vec<JoinHandle<Result<()>>>,
    clock: Arc<dyn Clock>,
}

impl WorkerPool {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        store: Arc<dyn EventStore>,
        registry: Arc<StrategyRegistry>,
        locks: Arc<dyn LockCoordinator>,
        resolver: Arc<ResultResolver>,
        config: DispatchConfig,
        stats: Arc<RwLock<EngineStats>>,
        cancellation_token: CancellationToken,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            registry,
            locks,
            resolver,
            config,
            stats,
            cancellation_token,
            worker_handles: Vec::new(),
            clock,
        }
    }

    /// Spawns all configured workers and begins processing.
    ///
    /// # Errors
    ///
    /// Currently never returns error but the signature allows for future
    /// validation.
    pub(crate) async fn spawn_workers(&mut self) -> Result<()> {
        info!(worker_count = self.config.worker_count, "spawning dispatch workers");

        {
            let mut stats = self.stats.write().await;
            stats.active_workers = self.config.worker_count;
        }

        for worker_id in 0..self.config.worker_count {
            let worker = DispatchWorker::new(
                worker_id,
                self.store.clone(),
                self.registry.clone(),
                self.locks.clone(),
                self.resolver.clone(),
                self.config.clone(),
                self.stats.clone(),
                self.cancellation_token.clone(),
                self.clock.clone(),
            );

            let handle = tokio::spawn(async move {
                let result = worker.run().await;

                if let Err(ref error) = result {
                    error!(
                        worker_id,
                        error = %error,
                        "dispatch worker terminated with error"
                    );
                }

                result
            });

            self.worker_handles.push(handle);
        }

        info!(spawned_workers = self.worker_handles.len(), "all dispatch workers spawned");
        Ok(())
    }

    /// Gracefully shuts down all workers within `timeout`.
    ///
    /// Signals cancellation, then waits for each worker to finish its
    /// in-flight envelope.
    ///
    /// # Errors
    ///
    /// Returns error if the timeout is exceeded before all workers join.
    pub(crate) async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            worker_count = self.worker_handles.len(),
            timeout_seconds = timeout.as_secs(),
            "initiating graceful worker shutdown"
        );

        self.cancellation_token.cancel();

        let shutdown_future = async {
            let mut results = Vec::new();

            for (worker_id, handle) in
                std::mem::take(&mut self.worker_handles).into_iter().enumerate()
            {
                match handle.await {
                    Ok(worker_result) => {
                        if let Err(error) = worker_result {
                            warn!(
                                worker_id,
                                error = %error,
                                "worker completed with error during shutdown"
                            );
                        }
                        results.push(Ok(()));
                    },
                    Err(join_error) => {
                        error!(
                            worker_id,
                            error = %join_error,
                            "worker task panicked during shutdown"
                        );
                        results.push(Err(DispatchError::WorkerPanic {
                            worker_id,
                            error: format!("{join_error}"),
                        }));
                    },
                }
            }

            {
                let mut stats = self.stats.write().await;
                stats.active_workers = 0;
            }

            results
        };

        match tokio::time::timeout(timeout, shutdown_future).await {
            Ok(results) => {
                let error_count = results.iter().filter(|r| r.is_err()).count();
                if error_count > 0 {
                    warn!(
                        error_count,
                        total_workers = results.len(),
                        "some workers panicked during shutdown"
                    );
                }
                info!("worker pool shutdown completed");
                Ok(())
            },
            Err(_timeout) => {
                error!(
                    timeout_seconds = timeout.as_secs(),
                    "worker shutdown timed out, some workers may still be running"
                );
                Err(DispatchError::ShutdownTimeout { timeout })
            },
        }
    }

    /// Whether any workers are still running.
    pub(crate) fn has_active_workers(&self) -> bool {
        self.worker_handles.iter().any(|h| !h.is_finished())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if self.has_active_workers() && !self.cancellation_token.is_cancelled() {
            let active = self.worker_handles.iter().filter(|h| !h.is_finished()).count();
            error!(
                active_workers = active,
                "worker pool dropped with active workers, forcing cancellation"
            );
            self.cancellation_token.cancel();
        }
    }
}
