//! Per-key lock coordination for dispatch workers.
//!
//! Envelopes sharing a lock key must never be processed concurrently. Within
//! a single process the [`InMemoryLocks`] coordinator is sufficient; when
//! multiple instances share one store, exclusion must be enforced at the
//! store level and a distributed [`LockCoordinator`] backend plugged in.

use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use postbox_core::{models::LockKey, Clock};
use tokio::sync::Mutex;
use tracing::warn;

/// Grants mutually exclusive processing rights per lock key.
///
/// Acquisition is non-blocking: a contended key is skipped for the current
/// pass rather than awaited, which preserves per-key ordering without
/// stalling the batch. `release` is idempotent and must run on every exit
/// path so a failed handler cannot starve its key permanently.
pub trait LockCoordinator: Send + Sync + 'static {
    /// Attempts to acquire the lock for `key`, held at most for `ttl`.
    ///
    /// Returns `false` when the key is already held. An empty key never
    /// acquires; envelopes without a meaningful key are not serialized.
    fn try_acquire(
        &self,
        key: &LockKey,
        ttl: std::time::Duration,
    ) -> Pin<Box<dyn Future<Output = bool> + Send + '_>>;

    /// Releases the lock for `key`. Releasing an unheld key is a no-op.
    fn release(&self, key: &LockKey) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// In-process lock coordinator backed by a keyed expiry map.
///
/// Entries carry a TTL so a holder that crashed without releasing cannot
/// starve its key forever: a later acquisition succeeds once the previous
/// entry has expired.
pub struct InMemoryLocks {
    held: Mutex<HashMap<LockKey, DateTime<Utc>>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryLocks {
    /// Creates an empty lock coordinator.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { held: Mutex::new(HashMap::new()), clock }
    }

    /// Number of keys currently held, expired entries included.
    pub async fn held_count(&self) -> usize {
        self.held.lock().await.len()
    }
}

impl LockCoordinator for InMemoryLocks {
    fn try_acquire(
        &self,
        key: &LockKey,
        ttl: std::time::Duration,
    ) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        let key = key.clone();
        Box::pin(async move {
            if key.is_empty() {
                return false;
            }

            let now = self.clock.now();
            let expires_at = chrono::Duration::from_std(ttl)
                .ok()
                .and_then(|ttl| now.checked_add_signed(ttl))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);

            let mut held = self.held.lock().await;
            match held.get(&key) {
                Some(held_until) if *held_until > now => false,
                Some(_) => {
                    // Previous holder overran its TTL. Take over the key.
                    warn!(lock_key = %key, "acquiring lock whose previous holder expired");
                    held.insert(key, expires_at);
                    true
                },
                None => {
                    held.insert(key, expires_at);
                    true
                },
            }
        })
    }

    fn release(&self, key: &LockKey) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        let key = key.clone();
        Box::pin(async move {
            self.held.lock().await.remove(&key);
        })
    }
}
