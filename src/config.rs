//! # Global runtime configuration.
//!
//! [`Config`] defines the node's timing and capacity knobs: consumer poll
//! bound, the grace period a fresh task waits before contending for a claim,
//! node heartbeat cadence, claim-scheduling jitter, producer retry policy,
//! and channel capacities.
//!
//! Defaults follow the original deployment values (500ms poll, 1s new-state
//! wait, 1s node heartbeat).
//!
//! # Example
//! ```
//! use std::time::Duration;
//! use taskherd::Config;
//!
//! let mut cfg = Config::default();
//! cfg.wait_in_new_state = Duration::from_millis(500);
//! cfg.read_old_signals = false;
//!
//! assert_eq!(cfg.consumer_poll_time, Duration::from_millis(500));
//! ```

use std::time::Duration;

use crate::log::StartPosition;

/// Retry backoff for transient produce failures.
///
/// The sender retries a failed publish with a growing delay; after
/// [`Config::send_retries`] attempts the error is treated as loop-fatal.
#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    /// Initial delay before the first retry.
    pub first: Duration,
    /// Maximum delay cap for retries.
    pub max: Duration,
    /// Multiplicative growth factor (`>= 1.0` recommended).
    pub factor: f64,
}

impl Default for BackoffPolicy {
    /// `first = 100ms`, `max = 5s`, `factor = 2.0`.
    fn default() -> Self {
        Self {
            first: Duration::from_millis(100),
            max: Duration::from_secs(5),
            factor: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// Computes the next delay based on the previous one.
    ///
    /// `None` yields `first` clamped to `max`; otherwise the previous delay
    /// is multiplied by `factor` and capped at `max`.
    pub fn next(&self, prev: Option<Duration>) -> Duration {
        let unclamped = match prev {
            None => self.first,
            Some(d) => {
                let mul = d.as_secs_f64() * self.factor;
                if !mul.is_finite() {
                    self.max
                } else {
                    d.mul_f64(self.factor)
                }
            }
        };
        unclamped.min(self.max)
    }
}

/// Global configuration for a [`Node`](crate::Node).
#[derive(Clone, Debug)]
pub struct Config {
    /// Upper bound for one consumer poll; also the flush granularity used
    /// during shutdown.
    pub consumer_poll_time: Duration,
    /// How long a freshly registered task idles before its first claim
    /// attempt, giving replayed history a chance to reveal a current owner.
    pub wait_in_new_state: Duration,
    /// Cadence of the node-level `DOHEARTBEAT` self-announcement.
    pub heart_beat_period: Duration,
    /// Maximum random jitter added to claim scheduling so simultaneous
    /// contenders diverge.
    pub claiming_jitter: Duration,
    /// Producer retry policy for transient publish failures.
    pub send_backoff: BackoffPolicy,
    /// Publish attempts before a produce error becomes loop-fatal.
    pub send_retries: u32,
    /// Where the signals watcher starts tailing the sync topic.
    pub start_position: StartPosition,
    /// Whether to replay recent history before serving, so a late-starting
    /// node learns about claims that predate it.
    pub read_old_signals: bool,
    /// How many records of history the watcher rewinds for the replay.
    pub old_signal_window: u64,
    /// Capacity of the in-process event bus.
    pub bus_capacity: usize,
    /// Capacity of the internal-signal queue feeding the watcher loop.
    pub signal_queue_capacity: usize,
    /// Capacity of the outbound publish queue feeding the sender loop.
    pub sender_queue_capacity: usize,
    /// Extra wait during shutdown, on top of one poll interval, to let
    /// unclaim echoes flush through the log.
    pub shutdown_flush: Duration,
}

impl Default for Config {
    /// Provides the defaults the protocol was tuned with:
    /// - `consumer_poll_time = 500ms`
    /// - `wait_in_new_state = 1s`
    /// - `heart_beat_period = 1s`
    /// - `claiming_jitter = 200ms`
    /// - `start_position = Latest`, `read_old_signals = true`
    fn default() -> Self {
        Self {
            consumer_poll_time: Duration::from_millis(500),
            wait_in_new_state: Duration::from_secs(1),
            heart_beat_period: Duration::from_secs(1),
            claiming_jitter: Duration::from_millis(200),
            send_backoff: BackoffPolicy::default(),
            send_retries: 5,
            start_position: StartPosition::Latest,
            read_old_signals: true,
            old_signal_window: 1000,
            bus_capacity: 1024,
            signal_queue_capacity: 256,
            sender_queue_capacity: 256,
            shutdown_flush: Duration::from_secs(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let b = BackoffPolicy {
            first: Duration::from_millis(100),
            max: Duration::from_secs(1),
            factor: 2.0,
        };
        assert_eq!(b.next(None), Duration::from_millis(100));
        assert_eq!(b.next(Some(Duration::from_millis(100))), Duration::from_millis(200));
        assert_eq!(b.next(Some(Duration::from_secs(30))), Duration::from_secs(1));
    }
}
