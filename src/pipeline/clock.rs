//! Monotonic receiver clock
//!
//! Every deadline in the pipeline is a millisecond count on this clock. The
//! base is an `Instant`, so the timeline is monotonic and immune to wall
//! clock steps; wall time appears only in human-facing session statistics.
//! Sender timestamps live on their own timeline and are related to this one
//! solely through each session's sync baseline.

use std::time::{Duration, Instant};

/// Shared time base for the estimator, sync engine, jitter buffers and
/// subtitle scheduler.
///
/// Cloning is cheap; clones observe the same base instant.
#[derive(Debug, Clone, Copy)]
pub struct ReceiverClock {
    base: Instant,
}

impl ReceiverClock {
    /// Create a clock starting now
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
        }
    }

    /// Create a clock with a specific base instant
    pub fn with_base(base: Instant) -> Self {
        Self { base }
    }

    /// Milliseconds elapsed since the clock base
    pub fn now_ms(&self) -> u64 {
        self.base.elapsed().as_millis() as u64
    }

    /// The base instant
    pub fn base(&self) -> Instant {
        self.base
    }

    /// Convert a local-clock millisecond value back to an `Instant`
    pub fn instant_at(&self, local_ms: u64) -> Instant {
        self.base + Duration::from_millis(local_ms)
    }
}

impl Default for ReceiverClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_monotonic() {
        let clock = ReceiverClock::new();
        let a = clock.now_ms();
        thread::sleep(Duration::from_millis(15));
        let b = clock.now_ms();
        assert!(b >= a + 10, "clock advanced only {} -> {}", a, b);
    }

    #[test]
    fn test_clones_share_base() {
        let clock = ReceiverClock::new();
        let other = clock;
        thread::sleep(Duration::from_millis(5));
        let diff = (clock.now_ms() as i64 - other.now_ms() as i64).abs();
        assert!(diff <= 1);
    }

    #[test]
    fn test_instant_at_roundtrip() {
        let clock = ReceiverClock::new();
        let at = clock.instant_at(250);
        assert_eq!(at.duration_since(clock.base()), Duration::from_millis(250));
    }
}
