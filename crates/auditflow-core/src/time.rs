//! Injectable time and randomness sources.
//!
//! All timestamp and jitter decisions in the pipeline go through the
//! [`Clock`] and [`JitterSource`] traits instead of calling `Utc::now()` or
//! the thread RNG directly. Retry schedules, watermark arithmetic and run
//! bookkeeping become deterministic under test by swapping in the fixed
//! implementations.

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

/// Source of the current wall-clock time.
pub trait Clock: Send + Sync {
    /// Returns the current instant in UTC.
    fn now_utc(&self) -> DateTime<Utc>;
}

/// Production clock backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock pinned to a fixed instant, advanced explicitly.
///
/// Intended for tests that need reproducible run timestamps.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    /// Creates a clock frozen at `instant`.
    #[must_use]
    pub fn new(instant: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(instant),
        }
    }

    /// Moves the clock forward by `delta`.
    pub fn advance(&self, delta: Duration) {
        let mut now = self.now.lock().expect("fixed clock lock poisoned");
        *now += delta;
    }
}

impl Clock for FixedClock {
    fn now_utc(&self) -> DateTime<Utc> {
        *self.now.lock().expect("fixed clock lock poisoned")
    }
}

/// Source of uniformly distributed backoff jitter.
pub trait JitterSource: Send + Sync {
    /// Returns a value in `[0, upper_ms)`, or 0 when `upper_ms` is 0.
    fn jitter_ms(&self, upper_ms: u64) -> u64;
}

/// Production jitter backed by the thread-local RNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadRngJitter;

impl JitterSource for ThreadRngJitter {
    fn jitter_ms(&self, upper_ms: u64) -> u64 {
        if upper_ms == 0 {
            return 0;
        }
        use rand::Rng;
        rand::thread_rng().gen_range(0..upper_ms)
    }
}

/// Jitter source that always returns zero. Used in tests so backoff
/// schedules are exact.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoJitter;

impl JitterSource for NoJitter {
    fn jitter_ms(&self, _upper_ms: u64) -> u64 {
        0
    }
}
