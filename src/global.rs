//! Global limit gate.
//!
//! A single deadline shared by every bucket. Tripping it pauses all admission
//! until the deadline passes; the gate clears itself on the first inspection
//! after that. Lock-free: the deadline lives in a single atomic.

use crate::clock::Clock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const OPEN: u64 = 0;

#[derive(Debug)]
pub struct GlobalGate {
    /// Store-clock millis until which the gate is closed; `OPEN` when clear.
    closed_until: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl GlobalGate {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { closed_until: AtomicU64::new(OPEN), clock }
    }

    /// Close the gate for `retry_after`. Overlapping trips keep the later deadline.
    pub fn trip(&self, retry_after: Duration) {
        let millis = u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX);
        let until = self.clock.now_millis().saturating_add(millis).max(1);
        let previous = self.closed_until.fetch_max(until, Ordering::AcqRel);
        if previous < until {
            tracing::info!(retry_after_ms = millis, "global rate limit tripped");
        }
    }

    /// Whether requests may be admitted. Clears an expired trip.
    pub fn is_open(&self) -> bool {
        self.wait_time().is_none()
    }

    /// Remaining time until the gate reopens, or `None` when open.
    pub fn wait_time(&self) -> Option<Duration> {
        let until = self.closed_until.load(Ordering::Acquire);
        if until == OPEN {
            return None;
        }
        let now = self.clock.now_millis();
        if now >= until {
            // only clear the deadline we observed; a newer trip wins
            let _ = self.closed_until.compare_exchange(
                until,
                OPEN,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            tracing::debug!("global rate limit cleared");
            return None;
        }
        Some(Duration::from_millis(until - now))
    }
}
