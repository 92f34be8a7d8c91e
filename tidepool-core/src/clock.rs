#![forbid(unsafe_code)]

//! Injectable time source. Components that reason about time take an
//! `Arc<dyn Clock>` so tests can drive quiescence and window rollover
//! without sleeping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};

/// Monotonic plus wall time, injectable for tests.
///
/// `monotonic` is an offset from an arbitrary per-clock origin; only
/// differences between two readings are meaningful. `wall` is real calendar
/// time and is what window identities are derived from, so that checkpointed
/// windows stay meaningful across restarts.
pub trait Clock: Send + Sync {
    /// Monotonic offset since the clock's origin.
    fn monotonic(&self) -> Duration;
    /// Current wall-clock time.
    fn wall(&self) -> SystemTime;
}

/// Production clock backed by `Instant` and `SystemTime`.
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn monotonic(&self) -> Duration {
        self.origin.elapsed()
    }

    fn wall(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Test clock advanced by hand. Wall time is the Unix epoch plus the
/// monotonic offset, which keeps the two readings coherent.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the clock at the given wall offset from the epoch.
    pub fn at(offset: Duration) -> Self {
        let c = Self::new();
        c.advance(offset);
        c
    }

    /// Move time forward.
    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn monotonic(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }

    fn wall(&self) -> SystemTime {
        SystemTime::UNIX_EPOCH + self.monotonic()
    }
}
