//! Per-bucket quota state and the process-wide store holding it.

use super::BucketKey;
use crate::clock::Clock;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Quota reported by the server for one bucket.
///
/// `reset_at` is expressed on the store clock's monotonic timeline
/// (milliseconds); see [`crate::headers`] for the translation from headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quota {
    pub remaining: u32,
    pub limit: u32,
    pub reset_at: u64,
    /// Opaque server-side bucket id, when the server sends one.
    pub bucket_id: Option<String>,
}

/// Why a bucket cannot admit a request right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Blocked {
    /// Exhausted until the given instant (store-clock millis).
    Until(u64),
    /// Exhausted, reset time unknown; a response in flight will tell.
    AwaitingResponse,
}

/// Quota bookkeeping for a single bucket.
///
/// Invariants:
/// - `remaining <= limit` after every server update applied via [`BucketState::apply`]
///   (the server is trusted), and `remaining` never underflows (unsigned + checked).
/// - `limit >= 1`.
/// - While `now < retry_until` nothing is admitted, whatever headers arrive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketState {
    remaining: u32,
    limit: u32,
    reset_at: Option<u64>,
    retry_until: u64,
    in_flight: u32,
    bucket_id: Option<String>,
}

impl BucketState {
    /// Optimistic state for a bucket never seen before: one call, reset immediately.
    pub fn fresh(now: u64) -> Self {
        Self {
            remaining: 1,
            limit: 1,
            reset_at: Some(now),
            retry_until: 0,
            in_flight: 0,
            bucket_id: None,
        }
    }

    /// Take one slot if the bucket allows it.
    pub fn try_acquire(&mut self, now: u64) -> Result<(), Blocked> {
        if now < self.retry_until {
            return Err(Blocked::Until(self.retry_until));
        }
        if let Some(reset_at) = self.reset_at {
            if now >= reset_at {
                self.remaining = self.limit;
                // next deadline is learned from the next response
                self.reset_at = None;
            }
        }
        if self.remaining > 0 {
            self.remaining -= 1;
            self.in_flight += 1;
            return Ok(());
        }
        match self.reset_at {
            Some(reset_at) => Err(Blocked::Until(reset_at)),
            None if self.in_flight > 0 => Err(Blocked::AwaitingResponse),
            None => {
                // nothing in flight will ever report back; probe with one request
                self.in_flight += 1;
                Ok(())
            }
        }
    }

    /// Overwrite with server-reported quota.
    pub fn apply(&mut self, quota: Quota) {
        self.remaining = quota.remaining.min(quota.limit);
        self.limit = quota.limit.max(1);
        self.reset_at = Some(quota.reset_at);
        if quota.bucket_id.is_some() {
            self.bucket_id = quota.bucket_id;
        }
    }

    /// Mark the bucket exhausted until `until` after a per-route rejection.
    pub fn exhaust(&mut self, until: u64) {
        self.remaining = 0;
        self.reset_at = Some(until);
        self.retry_until = self.retry_until.max(until);
    }

    /// A dispatched request finished (any outcome).
    pub fn release(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn reset_at(&self) -> Option<u64> {
        self.reset_at
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight
    }

    pub fn bucket_id(&self) -> Option<&str> {
        self.bucket_id.as_deref()
    }

    /// Time until the bucket may admit again, if it is currently exhausted.
    pub fn wait_time(&self, now: u64) -> Option<Duration> {
        let until = if now < self.retry_until {
            self.retry_until
        } else if self.remaining == 0 {
            self.reset_at?
        } else {
            return None;
        };
        (until > now).then(|| Duration::from_millis(until - now))
    }
}

/// Shared handle to one bucket's state.
pub type BucketHandle = Arc<Mutex<BucketState>>;

pub(crate) fn lock(handle: &BucketHandle) -> MutexGuard<'_, BucketState> {
    // plain data, consistent between statements, so a poisoned lock is still usable
    handle.lock().unwrap_or_else(|e| e.into_inner())
}

/// Process-wide mapping from bucket key to quota state.
///
/// The map lock is held only for the O(1) lookup/insert; each bucket has its
/// own lock, so unrelated buckets never contend on quota updates.
#[derive(Debug)]
pub struct BucketStore {
    buckets: Mutex<HashMap<BucketKey, BucketHandle>>,
    clock: Arc<dyn Clock>,
}

impl BucketStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { buckets: Mutex::new(HashMap::new()), clock }
    }

    /// Handle for `key`, created with [`BucketState::fresh`] if absent.
    pub fn handle(&self, key: &BucketKey) -> BucketHandle {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = buckets.get(key) {
            return handle.clone();
        }
        let handle = Arc::new(Mutex::new(BucketState::fresh(self.clock.now_millis())));
        buckets.insert(key.clone(), handle.clone());
        handle
    }

    /// Copy of the current state for `key` (created lazily).
    pub fn get(&self, key: &BucketKey) -> BucketState {
        lock(&self.handle(key)).clone()
    }

    /// Copy of the state for `key` without creating it.
    pub fn snapshot(&self, key: &BucketKey) -> Option<BucketState> {
        let buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        buckets.get(key).map(|handle| lock(handle).clone())
    }

    /// Overwrite the quota for `key`.
    pub fn update(&self, key: &BucketKey, quota: Quota) {
        lock(&self.handle(key)).apply(quota);
    }

    pub fn len(&self) -> usize {
        self.buckets.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Method;

    fn quota(remaining: u32, limit: u32, reset_at: u64) -> Quota {
        Quota { remaining, limit, reset_at, bucket_id: None }
    }

    #[test]
    fn fresh_bucket_admits_one_then_waits_for_the_response() {
        let mut state = BucketState::fresh(0);
        assert!(state.try_acquire(0).is_ok());
        assert_eq!(state.try_acquire(0), Err(Blocked::AwaitingResponse));
        state.release();
        // nothing in flight anymore: probe
        assert!(state.try_acquire(0).is_ok());
    }

    #[test]
    fn consumes_down_to_zero_then_blocks_until_reset() {
        let mut state = BucketState::fresh(0);
        state.apply(quota(3, 3, 1_000));
        for _ in 0..3 {
            assert!(state.try_acquire(10).is_ok());
        }
        assert_eq!(state.remaining(), 0);
        assert_eq!(state.try_acquire(10), Err(Blocked::Until(1_000)));
        assert_eq!(state.wait_time(10), Some(Duration::from_millis(990)));

        assert!(state.try_acquire(1_000).is_ok());
        assert_eq!(state.remaining(), 2);
        assert_eq!(state.reset_at(), None);
    }

    #[test]
    fn server_update_overwrites_local_count() {
        let mut state = BucketState::fresh(0);
        state.apply(quota(5, 5, 10_000));
        for _ in 0..5 {
            state.try_acquire(0).unwrap();
        }
        state.apply(quota(4, 5, 10_000));
        assert_eq!(state.remaining(), 4);
        assert!(state.try_acquire(1).is_ok());
    }

    #[test]
    fn remaining_is_clamped_to_limit_and_limit_to_one() {
        let mut state = BucketState::fresh(0);
        state.apply(quota(9, 0, 5));
        assert_eq!(state.limit(), 1);
        assert_eq!(state.remaining(), 0);
    }

    #[test]
    fn rejection_penalty_survives_header_updates() {
        let mut state = BucketState::fresh(0);
        state.apply(quota(5, 5, 100));
        state.exhaust(2_000);
        state.apply(quota(4, 5, 500));
        assert_eq!(state.try_acquire(600), Err(Blocked::Until(2_000)));
        assert_eq!(state.wait_time(600), Some(Duration::from_millis(1_400)));
        assert!(state.try_acquire(2_000).is_ok());
    }

    #[test]
    fn store_creates_lazily_and_shares_state() {
        let store = BucketStore::new(Arc::new(crate::clock::MonotonicClock::default()));
        let key = BucketKey::unpartitioned(Method::Get, "/gateway");
        assert!(store.snapshot(&key).is_none());
        assert_eq!(store.get(&key).remaining(), 1);
        store.update(&key, Quota { remaining: 2, limit: 5, reset_at: 50, bucket_id: Some("abc".into()) });
        let state = store.snapshot(&key).unwrap();
        assert_eq!(state.remaining(), 2);
        assert_eq!(state.limit(), 5);
        assert_eq!(state.bucket_id(), Some("abc"));
        assert_eq!(store.len(), 1);
    }
}
