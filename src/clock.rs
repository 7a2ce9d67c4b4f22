//! Coarse monotonic clock, refreshed once per tick.
//!
//! All scheduling decisions inside one tick observe the same millisecond
//! timestamp: the dispatcher calls [`TickClock::refresh`] at the top of the
//! loop and every other reader uses the cached value. Submitter threads read
//! the cache too, so a submission timestamp is at most one tick stale.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

/// Millisecond clock with a per-tick cache.
///
/// The zero point is the moment the clock was created (dispatcher startup).
#[derive(Debug)]
pub struct TickClock {
    base: Instant,
    cached_ms: AtomicU64,
    live: AtomicBool,
}

impl TickClock {
    /// Creates a clock anchored at the current instant. The cached value
    /// starts at zero until the first [`refresh`](Self::refresh).
    #[must_use]
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            cached_ms: AtomicU64::new(0),
            live: AtomicBool::new(false),
        }
    }

    /// Samples the underlying monotonic source and publishes it as the
    /// tick-wide timestamp. Only the dispatcher thread calls this.
    pub fn refresh(&self) -> u64 {
        let now = self.base.elapsed().as_millis() as u64;
        self.cached_ms.store(now, Ordering::Release);
        self.live.store(true, Ordering::Release);
        now
    }

    /// Returns the cached tick timestamp in milliseconds.
    #[must_use]
    pub fn now_ms(&self) -> u64 {
        self.cached_ms.load(Ordering::Acquire)
    }

    /// True once the clock has been refreshed at least once.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }
}

impl Default for TickClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn starts_at_zero_and_not_live() {
        let clock = TickClock::new();
        assert_eq!(clock.now_ms(), 0);
        assert!(!clock.is_live());
    }

    #[test]
    fn refresh_publishes_elapsed_time() {
        let clock = TickClock::new();
        thread::sleep(Duration::from_millis(15));
        let sampled = clock.refresh();
        assert!(clock.is_live());
        assert!(sampled >= 10, "refresh should observe elapsed time, got {sampled}");
        assert_eq!(clock.now_ms(), sampled);
    }

    #[test]
    fn cached_value_is_stable_between_refreshes() {
        let clock = TickClock::new();
        let first = clock.refresh();
        thread::sleep(Duration::from_millis(10));
        assert_eq!(clock.now_ms(), first);
        let second = clock.refresh();
        assert!(second >= first);
    }
}
