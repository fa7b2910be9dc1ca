use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::cache::record::Timespec;

pub const SECONDS_PER_HOUR: i64 = 3600;

/// Wall clock used for hour bucketing and sync delay checks.
pub trait ClockSource: Send + Sync {
    /// Current time in whole seconds since the Unix epoch.
    fn now(&self) -> i64;

    /// Current time with nanoseconds.
    fn now_ts(&self) -> Timespec {
        Timespec::new(self.now(), 0)
    }
}

/// Reads the operating system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    fn now(&self) -> i64 {
        self.now_ts().sec
    }

    fn now_ts(&self) -> Timespec {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);

        Timespec::new(elapsed.as_secs() as i64, elapsed.subsec_nanos() as i32)
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now: i64) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::Relaxed);
    }

    pub fn advance(&self, seconds: i64) {
        self.now.fetch_add(seconds, Ordering::Relaxed);
    }
}

impl ClockSource for ManualClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::Relaxed)
    }
}

/// Truncates a timestamp down to the start of its hour.
pub fn hour_start(sec: i64) -> i64 {
    sec - sec.rem_euclid(SECONDS_PER_HOUR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hour_start() {
        assert_eq!(hour_start(0), 0);
        assert_eq!(hour_start(3599), 0);
        assert_eq!(hour_start(3600), 3600);
        assert_eq!(hour_start(3700), 3600);
        assert_eq!(hour_start(-1), -3600);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(100);
        clock.advance(50);
        assert_eq!(clock.now(), 150);
        clock.set(7);
        assert_eq!(clock.now_ts(), Timespec::new(7, 0));
    }

    #[test]
    fn test_system_clock_after_2020() {
        // 2020-01-01T00:00:00Z.
        assert!(SystemClock.now() > 1_577_836_800);
        let ts = SystemClock.now_ts();
        assert!((0..1_000_000_000).contains(&ts.ns));
    }
}
