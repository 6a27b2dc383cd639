//! Time abstractions for testable timing operations.
//!
//! The dispatcher schedules retries and paces its poll loop against a
//! [`Clock`] rather than the ambient system time, so tests can drive
//! retry windows and backoff deterministically.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};

/// Clock abstraction for time operations.
///
/// Production code uses [`SystemClock`]; tests inject [`TestClock`] to
/// control time progression.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Returns the current time for timestamps and due-time comparisons.
    fn now(&self) -> DateTime<Utc>;

    /// Sleeps for the specified duration.
    ///
    /// In production this maps to `tokio::time::sleep`; in tests it advances
    /// virtual time immediately.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Real clock backed by system time and tokio's async sleep.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Creates a new system clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Test clock for deterministic time control.
///
/// Time only moves when [`TestClock::advance`] is called or a task sleeps on
/// it. Clones share the same underlying time source.
#[derive(Debug, Clone)]
pub struct TestClock {
    /// Microseconds since UNIX epoch.
    epoch_micros: Arc<AtomicI64>,
}

impl TestClock {
    /// Creates a test clock starting at the current system time.
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Creates a test clock starting at a specific time.
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self { epoch_micros: Arc::new(AtomicI64::new(start.timestamp_micros())) }
    }

    /// Advances the clock by the specified duration.
    pub fn advance(&self, duration: Duration) {
        let micros = i64::try_from(duration.as_micros()).unwrap_or(i64::MAX);
        self.epoch_micros.fetch_add(micros, Ordering::AcqRel);
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        let micros = self.epoch_micros.load(Ordering::Acquire);
        DateTime::<Utc>::from_timestamp_micros(micros).unwrap_or_default()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        // Sleeping on the test clock advances it, then yields so other tasks
        // observing the new time get to run.
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}
