//! Per-bucket FIFO queues and admission.
//!
//! Each bucket key owns a [`Lane`]: an ordered queue of pending requests, the
//! bucket's quota handle, a wakeup for its worker, and a flag saying whether a
//! worker task is currently running for it. Admission pops the head of the
//! queue only when both the global gate and the bucket's quota allow it;
//! requeued requests go back to the head so their position relative to newer
//! arrivals is preserved.
//!
//! Lock order: lane, then bucket. Nothing takes the lane lock while holding a
//! bucket lock.

use crate::bucket::{state, Blocked, BucketHandle, BucketKey, BucketStore};
use crate::error::ApiError;
use crate::global::GlobalGate;
use crate::request::{ApiResponse, RequestDescriptor};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};

pub(crate) type Reply = oneshot::Sender<Result<ApiResponse, ApiError>>;

/// A submitted request, owned by its lane until dispatched.
#[derive(Debug)]
pub(crate) struct QueuedRequest {
    pub(crate) id: u64,
    pub(crate) descriptor: Arc<RequestDescriptor>,
    pub(crate) reply: Reply,
    /// Store-clock millis at first submission.
    pub(crate) enqueued_at: u64,
    /// Transport invocations so far (rate-limit requeues included).
    pub(crate) attempts: u32,
}

impl QueuedRequest {
    /// Resolve the caller's handle. Consumes the request: exactly one reply.
    pub(crate) fn complete(self, result: Result<ApiResponse, ApiError>) {
        // receiver gone means the caller stopped caring
        let _ = self.reply.send(result);
    }
}

/// Result of an admission attempt.
#[derive(Debug)]
pub(crate) enum Admission {
    /// Hand this request to the transport now.
    Ready(QueuedRequest),
    /// Gate or bucket closed; try again after this long (or on wakeup).
    Wait(Duration),
    /// Bucket exhausted with an unknown reset; wait for an in-flight response.
    AwaitResponse,
    /// Queue empty. The lane's worker flag has been cleared; the worker must exit.
    Idle,
}

#[derive(Debug, Default)]
struct LaneInner {
    pending: VecDeque<QueuedRequest>,
    worker: bool,
}

#[derive(Debug)]
pub(crate) struct Lane {
    key: BucketKey,
    bucket: BucketHandle,
    inner: Mutex<LaneInner>,
    notify: Notify,
}

impl Lane {
    fn new(key: BucketKey, bucket: BucketHandle) -> Self {
        Self { key, bucket, inner: Mutex::new(LaneInner::default()), notify: Notify::new() }
    }

    pub(crate) fn key(&self) -> &BucketKey {
        &self.key
    }

    pub(crate) fn bucket(&self) -> &BucketHandle {
        &self.bucket
    }

    fn lock(&self) -> MutexGuard<'_, LaneInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append in arrival order. Returns `true` if the caller must start a worker.
    pub(crate) fn enqueue(&self, request: QueuedRequest) -> bool {
        let spawn = {
            let mut inner = self.lock();
            inner.pending.push_back(request);
            !std::mem::replace(&mut inner.worker, true)
        };
        self.wake();
        spawn
    }

    /// Put a rate-limited request back at the head. Returns `true` if the
    /// caller must start a worker.
    pub(crate) fn requeue(&self, request: QueuedRequest) -> bool {
        let spawn = {
            let mut inner = self.lock();
            inner.pending.push_front(request);
            !std::mem::replace(&mut inner.worker, true)
        };
        self.wake();
        spawn
    }

    /// Pop the head of the queue if the gate and the bucket allow it.
    pub(crate) fn admit(&self, gate: &GlobalGate, now: u64) -> Admission {
        let mut inner = self.lock();
        if inner.pending.is_empty() {
            inner.worker = false;
            return Admission::Idle;
        }
        if let Some(wait) = gate.wait_time() {
            return Admission::Wait(wait);
        }
        match state::lock(&self.bucket).try_acquire(now) {
            Ok(()) => match inner.pending.pop_front() {
                Some(request) => Admission::Ready(request),
                None => Admission::Idle,
            },
            Err(Blocked::Until(until)) => {
                Admission::Wait(Duration::from_millis(until.saturating_sub(now).max(1)))
            }
            Err(Blocked::AwaitingResponse) => Admission::AwaitResponse,
        }
    }

    /// Remove a request that has not been dispatched yet.
    pub(crate) fn withdraw(&self, id: u64) -> Option<QueuedRequest> {
        let mut inner = self.lock();
        let index = inner.pending.iter().position(|r| r.id == id)?;
        inner.pending.remove(index)
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Wake the lane's worker (quota changed or work arrived).
    pub(crate) fn wake(&self) {
        // notify_one stores a permit when nobody waits, so wakeups are never lost
        self.notify.notify_one();
    }

    pub(crate) async fn woken(&self) {
        self.notify.notified().await
    }

    /// Take every pending request (used on shutdown).
    pub(crate) fn drain(&self) -> Vec<QueuedRequest> {
        let mut inner = self.lock();
        inner.worker = false;
        inner.pending.drain(..).collect()
    }
}

/// Lanes by bucket key, created lazily alongside the bucket state.
#[derive(Debug, Default)]
pub(crate) struct QueueManager {
    lanes: Mutex<HashMap<BucketKey, Arc<Lane>>>,
}

impl QueueManager {
    fn lanes(&self) -> MutexGuard<'_, HashMap<BucketKey, Arc<Lane>>> {
        self.lanes.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn lane(&self, key: &BucketKey, store: &BucketStore) -> Arc<Lane> {
        let mut lanes = self.lanes();
        if let Some(lane) = lanes.get(key) {
            return lane.clone();
        }
        let lane = Arc::new(Lane::new(key.clone(), store.handle(key)));
        lanes.insert(key.clone(), lane.clone());
        lane
    }

    pub(crate) fn get(&self, key: &BucketKey) -> Option<Arc<Lane>> {
        self.lanes().get(key).cloned()
    }

    pub(crate) fn all(&self) -> Vec<Arc<Lane>> {
        self.lanes().values().cloned().collect()
    }
}
