//! Clock sources.
//!
//! The engine samples the clock while it holds the store lock, so the time a
//! mutation is judged against is the time it is applied.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Supplies the current time in whole unix seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> u64;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// Settable clock for tests and simulations. Never moves backwards.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: u64) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    /// Jump to `t`. Earlier values are ignored.
    pub fn set(&self, t: u64) {
        self.now.fetch_max(t, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: u64) {
        let _ = self
            .now
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |t| {
                Some(t.saturating_add(secs))
            });
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_recent() {
        // After 2024
        assert!(SystemClock.now() > 1_700_000_000);
    }

    #[test]
    fn test_manual_clock_monotonic() {
        let clock = ManualClock::new(100);
        clock.advance(50);
        assert_eq!(clock.now(), 150);

        clock.set(120);
        assert_eq!(clock.now(), 150, "set must not move backwards");

        clock.set(7_776_001);
        assert_eq!(clock.now(), 7_776_001);
    }
}
