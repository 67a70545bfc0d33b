//! Monotonic elapsed-time source shared by the instrumented streams.
//!
//! All launch and retirement timestamps in a dispatch run come from a single
//! [`MillisecondTimer`] created when the streams are built, so entries from
//! different workers are directly comparable.

use std::time::Instant;

use crate::stats::round_to;

/// Digits kept when rounding millisecond timestamps.
pub(crate) const TIME_ROUNDING: i32 = 1;

/// Guard added to elapsed time in rate denominators (milliseconds).
pub const TIME_EPSILON: f64 = 0.01;

/// Reports time elapsed since construction, in milliseconds.
#[derive(Debug, Clone)]
pub struct MillisecondTimer {
    start: Instant,
}

impl MillisecondTimer {
    /// Creates a timer anchored at the current instant.
    #[must_use]
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Returns milliseconds since construction, rounded to one decimal digit.
    #[must_use]
    pub fn now_ms(&self) -> f64 {
        round_to(self.start.elapsed().as_secs_f64() * 1000.0, TIME_ROUNDING)
    }
}

impl Default for MillisecondTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_starts_near_zero() {
        let timer = MillisecondTimer::new();
        let elapsed = timer.now_ms();
        assert!(elapsed >= 0.0);
        assert!(elapsed < 100.0, "fresh timer reported {elapsed}ms");
    }

    #[test]
    fn test_timer_is_monotonic() {
        let timer = MillisecondTimer::new();
        let first = timer.now_ms();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = timer.now_ms();
        assert!(second >= first);
        assert!(second >= 5.0, "expected at least 5ms elapsed, got {second}");
    }

    #[test]
    fn test_timer_rounds_to_one_digit() {
        let timer = MillisecondTimer::new();
        let elapsed = timer.now_ms();
        let rescaled = (elapsed * 10.0).round() / 10.0;
        assert!((elapsed - rescaled).abs() < f64::EPSILON);
    }
}
