//! # Injectable time capability.
//!
//! Timestamps recorded on tasks and signals flow through [`Clock`] so tests
//! can pin them. Only bookkeeping depends on this clock; claim arbitration
//! uses log offsets, and timer waits ride on the tokio runtime clock
//! (pausable in tests via `start_paused`).

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Shared handle to a clock implementation.
pub type ClockRef = Arc<dyn Clock>;

/// Provides the current wall-clock time.
pub trait Clock: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> SystemTime;
}

/// Production clock backed by [`SystemTime::now`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Test clock returning a settable fixed time.
#[derive(Debug)]
pub struct FixedClock {
    time: Mutex<SystemTime>,
}

impl FixedClock {
    /// Creates a clock pinned to `time`.
    pub fn new(time: SystemTime) -> Self {
        Self { time: Mutex::new(time) }
    }

    /// Creates a clock pinned to the epoch plus `offset`.
    pub fn at_epoch_plus(offset: Duration) -> Self {
        Self::new(UNIX_EPOCH + offset)
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut t = self.time.lock().expect("clock poisoned");
        *t += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> SystemTime {
        *self.time.lock().expect("clock poisoned")
    }
}

/// Milliseconds since the UNIX epoch, saturating at zero for pre-epoch times.
pub(crate) fn unix_millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_clock_is_deterministic() {
        let c = FixedClock::at_epoch_plus(Duration::from_secs(10));
        assert_eq!(c.now(), c.now());
        c.advance(Duration::from_secs(5));
        assert_eq!(unix_millis(c.now()), 15_000);
    }
}
