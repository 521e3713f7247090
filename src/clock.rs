//! Clock abstractions used by bucket bookkeeping and the global gate.

use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

/// Clock abstraction so timing can be faked in tests.
///
/// `now_millis` is a monotonic timeline local to the clock; every deadline the
/// dispatcher stores (bucket resets, global retry-after) lives on it.
/// `unix_millis` is only consulted to translate absolute server timestamps
/// (`X-RateLimit-Reset`) onto the monotonic timeline.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_millis(&self) -> u64;

    fn unix_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or_default()
    }
}

/// Monotonic clock backed by `tokio::time::Instant`.
///
/// Notes: follows tokio's paused/advanced time in tests, so deadlines computed
/// here agree with `tokio::time::sleep`. Resets when the process restarts.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    start: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self { start: Instant::now() }
    }
}

impl Clock for MonotonicClock {
    fn now_millis(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn monotonic_clock_follows_tokio_time() {
        let clock = MonotonicClock::default();
        assert_eq!(clock.now_millis(), 0);
        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_eq!(clock.now_millis(), 1500);
    }

    #[test]
    fn unix_millis_is_after_2020() {
        #[derive(Debug)]
        struct Fixed;
        impl Clock for Fixed {
            fn now_millis(&self) -> u64 {
                0
            }
        }
        assert!(Fixed.unix_millis() > 1_577_836_800_000);
    }
}
