//! Dispatch core of a transactional-outbox event delivery engine.
//!
//! Routes persisted, not-yet-delivered events to their registered handlers
//! with at-least-once semantics. Envelopes sharing a lock key are never
//! processed concurrently, and handler outcomes drive status transitions and
//! retry scheduling.
//!
//! # Architecture
//!
//! The engine runs a pool of async workers pulling from a shared
//! [`store::EventStore`]. Each worker handles the full dispatch lifecycle:
//!
//! 1. **Fetch** - pull due envelopes, oldest first
//! 2. **Resolve** - look up the handler for the envelope's event type
//! 3. **Lock** - acquire the lock key, or defer the envelope to a later pass
//! 4. **Claim** - conditionally transition the envelope to processing
//! 5. **Invoke** - run the handler, bounded by a timeout
//! 6. **Resolve outcome** - record the result and schedule retries
//!
//! The lock is released on every exit path, and all status writes are
//! compare-and-swap so racing workers cannot both progress an envelope.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use postbox_core::SystemClock;
//! use postbox_dispatch::{
//!     store::mock::InMemoryStore, DispatchConfig, DispatchEngine, Result, StrategyRegistry,
//! };
//!
//! # async fn example(registry: StrategyRegistry) -> Result<()> {
//! let store = Arc::new(InMemoryStore::new());
//! let config = DispatchConfig::default();
//! let mut engine = DispatchEngine::new(store, registry, config, Arc::new(SystemClock));
//!
//! engine.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod handler;
pub mod lock;
pub mod resolver;
pub mod retry;
pub mod store;
mod worker;
mod worker_pool;

// Re-export main public API
pub use config::{DispatchConfig, TypeOverride};
pub use engine::{DispatchEngine, EngineStats};
pub use error::{DispatchError, Result};
pub use handler::{BoxError, HandleStrategy, StrategyRegistry};
pub use lock::{InMemoryLocks, LockCoordinator};
pub use retry::{BackoffStrategy, RetryDecision, RetryPolicy, RetrySchedule};

/// Default number of concurrent dispatch workers.
pub const DEFAULT_WORKER_COUNT: usize = 3;

/// Default batch size for fetching due envelopes.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default handler execution timeout in seconds.
pub const DEFAULT_HANDLER_TIMEOUT_SECONDS: u64 = 120;
