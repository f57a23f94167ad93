//! Time sources for the scheduling core
//!
//! Wall-clock timestamps come from chrono and are used for persisted state;
//! latency measurements use the monotonic clock so they survive wall-clock
//! adjustments.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;

static PROCESS_START: Lazy<Instant> = Lazy::new(Instant::now);

/// Process-wide clock
#[derive(Debug, Clone, Copy, Default)]
pub struct Clock;

impl Clock {
    /// Current wall-clock time
    pub fn now() -> DateTime<Utc> {
        Utc::now()
    }

    /// Monotonic time elapsed since process start
    pub fn uptime() -> Duration {
        PROCESS_START.elapsed()
    }

    /// Start a monotonic latency measurement
    pub fn start() -> Instant {
        Instant::now()
    }

    /// Epoch of the hour containing `at`, used for metrics bucket keys
    pub fn hour_epoch(at: DateTime<Utc>) -> i64 {
        let ts = at.timestamp();
        ts - ts.rem_euclid(3600)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_hour_epoch_truncates() {
        let at = Utc.with_ymd_and_hms(2025, 6, 1, 14, 37, 12).unwrap();
        let top = Utc.with_ymd_and_hms(2025, 6, 1, 14, 0, 0).unwrap();
        assert_eq!(Clock::hour_epoch(at), top.timestamp());
    }

    #[test]
    fn test_uptime_is_monotonic() {
        let a = Clock::uptime();
        let b = Clock::uptime();
        assert!(b >= a);
    }
}
