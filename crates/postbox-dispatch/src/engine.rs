//! Dispatch engine coordinating the worker pool.
//!
//! The engine owns the strategy registry, the lock coordinator and the
//! result resolver, and spawns the configured number of dispatch workers.
//! Workers stop picking up new envelopes as soon as shutdown is signalled;
//! in-flight handler calls get the configured grace period to finish.

use std::sync::Arc;

use postbox_core::Clock;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    config::DispatchConfig,
    error::Result,
    handler::StrategyRegistry,
    lock::{InMemoryLocks, LockCoordinator},
    resolver::ResultResolver,
    store::EventStore,
    worker::DispatchWorker,
    worker_pool::WorkerPool,
};

/// Counters for engine monitoring.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    /// Number of active dispatch workers.
    pub active_workers: usize,
    /// Total envelopes that went through the pipeline since startup.
    pub events_processed: u64,
    /// Envelopes that reached the processed state.
    pub processed: u64,
    /// Envelopes scheduled for another attempt.
    pub retries_scheduled: u64,
    /// Envelopes that reached the failed state.
    pub permanent_failures: u64,
    /// Envelopes deferred because their lock key was held.
    pub lock_skips: u64,
    /// Status updates that lost a race to another worker.
    pub update_conflicts: u64,
    /// Envelopes currently inside a handler call.
    pub in_flight: u64,
}

/// Dispatch engine routing outbox envelopes to their handlers.
pub struct DispatchEngine {
    store: Arc<dyn EventStore>,
    registry: Arc<StrategyRegistry>,
    locks: Arc<dyn LockCoordinator>,
    resolver: Arc<ResultResolver>,
    config: DispatchConfig,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    worker_pool: Option<WorkerPool>,
    clock: Arc<dyn Clock>,
}

impl DispatchEngine {
    /// Creates an engine with the in-process lock coordinator.
    ///
    /// Sufficient for a single instance owning the store. Deployments where
    /// multiple instances share one store must use
    /// [`DispatchEngine::with_lock_coordinator`] with a distributed backend.
    pub fn new(
        store: Arc<dyn EventStore>,
        registry: StrategyRegistry,
        config: DispatchConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let locks = Arc::new(InMemoryLocks::new(clock.clone()));
        Self::with_lock_coordinator(store, registry, locks, config, clock)
    }

    /// Creates an engine with a custom lock coordinator backend.
    pub fn with_lock_coordinator(
        store: Arc<dyn EventStore>,
        registry: StrategyRegistry,
        locks: Arc<dyn LockCoordinator>,
        config: DispatchConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let resolver = Arc::new(ResultResolver::new(store.clone(), config.clone()));
        Self {
            store,
            registry: Arc::new(registry),
            locks,
            resolver,
            config,
            stats: Arc::new(RwLock::new(EngineStats::default())),
            cancellation_token: CancellationToken::new(),
            worker_pool: None,
            clock,
        }
    }

    /// Starts the configured worker pool.
    ///
    /// Returns immediately after spawning workers. Use
    /// [`DispatchEngine::shutdown`] to stop gracefully.
    ///
    /// # Errors
    ///
    /// Returns error if the worker pool fails to spawn.
    pub async fn start(&mut self) -> Result<()> {
        info!(
            worker_count = self.config.worker_count,
            batch_size = self.config.batch_size,
            registered_types = self.registry.len(),
            "starting dispatch engine"
        );

        let mut worker_pool = WorkerPool::new(
            self.store.clone(),
            self.registry.clone(),
            self.locks.clone(),
            self.resolver.clone(),
            self.config.clone(),
            self.stats.clone(),
            self.cancellation_token.clone(),
            self.clock.clone(),
        );

        worker_pool.spawn_workers().await?;
        self.worker_pool = Some(worker_pool);

        info!("dispatch engine started");
        Ok(())
    }

    /// Gracefully shuts down the engine.
    ///
    /// Signals all workers to stop fetching new envelopes and waits for
    /// in-flight processing to finish within the configured shutdown
    /// timeout.
    ///
    /// # Errors
    ///
    /// Returns error if the shutdown timeout is exceeded.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("shutting down dispatch engine");

        if let Some(worker_pool) = self.worker_pool.take() {
            worker_pool.shutdown_graceful(self.config.shutdown_timeout).await?;
        } else {
            info!("dispatch engine was not started, shutdown completed immediately");
        }
        Ok(())
    }

    /// Returns a snapshot of the engine counters.
    pub async fn stats(&self) -> EngineStats {
        self.stats.read().await.clone()
    }

    /// Processes exactly one batch of due envelopes synchronously.
    ///
    /// Unlike [`DispatchEngine::start`] this does not spawn persistent
    /// workers; it runs a single pass and returns the number of envelopes
    /// that made progress. Intended for tests and controlled batch
    /// processing.
    ///
    /// # Errors
    ///
    /// Returns error if the store fetch fails.
    pub async fn process_batch(&self) -> Result<usize> {
        let worker = DispatchWorker::new(
            0,
            self.store.clone(),
            self.registry.clone(),
            self.locks.clone(),
            self.resolver.clone(),
            self.config.clone(),
            self.stats.clone(),
            self.cancellation_token.clone(),
            self.clock.clone(),
        );

        worker.process_pass().await
    }
}
