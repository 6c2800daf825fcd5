//! Clock abstractions so refill timing can be faked in tests.

use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;

/// Source of "now" for bucket transitions, in seconds since the Unix epoch.
///
/// Must be wall-clock time: stamps are compared across processes sharing a
/// remote store.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_secs(&self) -> f64;
}

/// Wall clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> f64 {
        Utc::now().timestamp_micros() as f64 / 1_000_000.0
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<f64>,
}

impl ManualClock {
    /// Create a clock frozen at `start` seconds.
    pub fn new(start: f64) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by.as_secs_f64();
    }

    /// Jump to an absolute time, which may be in the past.
    pub fn set(&self, secs: f64) {
        *self.now.lock() = secs;
    }
}

impl Clock for ManualClock {
    fn now_secs(&self) -> f64 {
        *self.now.lock()
    }
}
