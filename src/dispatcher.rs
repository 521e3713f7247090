//! Rate-limited dispatch.
//!
//! Semantics:
//! - [`Dispatcher::submit`] never blocks: it appends to the bucket's queue and
//!   returns a [`ResponseHandle`]. The handle resolves exactly once.
//! - One worker task runs per bucket with pending work. It admits requests in
//!   FIFO order while the global gate is open and the bucket has quota, calls
//!   the transport synchronously (so transport invocation order equals queue
//!   order), and spawns a completion task per in-flight call.
//! - Completion applies quota headers, then:
//!   - 429 route scope: bucket exhausted for `retry_after`, request back to the
//!     head of its queue;
//!   - 429 global scope: global gate tripped, request back to the head;
//!   - transport failure: surfaced once, never retried;
//!   - any other status: delivered (2xx/3xx) or surfaced as
//!     [`ApiError::RemoteRejection`].
//! - Results are delivered from the completion task, not from the caller's
//!   task; callers synchronise their own shared state.
//! - Telemetry events are handed to the sink on tasks of their own. A slow or
//!   failing sink never holds up admission, requeueing or delivery.
//!
//! Invariants:
//! - A queued request is owned by exactly one place at a time (its lane, or
//!   one completion task), so it is never in flight twice.
//! - Requeues are invisible to the caller apart from latency.
//!
//! Example
//! ```rust
//! use ratelane::{Dispatcher, Method, RawResponse, RequestDescriptor, Route};
//! use ratelane::transport::TransportFuture;
//! use futures::FutureExt;
//! use std::sync::Arc;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let transport = |_request: Arc<RequestDescriptor>| -> TransportFuture {
//!     async { Ok(RawResponse::new(200).body(r#"{"id":"1"}"#)) }.boxed()
//! };
//! let dispatcher = Dispatcher::new(transport);
//! let route = Route::new(Method::Get, "/channels/{channel_id}").param("channel_id", 1);
//! let response = dispatcher.execute(route.request().unwrap()).await.unwrap();
//! assert_eq!(response.status, 200);
//! # });
//! ```

use crate::bucket::{state, BucketKey, BucketStore};
use crate::clock::{Clock, MonotonicClock};
use crate::config::DispatcherConfig;
use crate::error::{ApiError, BoxError, RateLimitScope, TransportError};
use crate::global::GlobalGate;
use crate::headers::{self, Now, QuotaHeaders};
use crate::queue::{Admission, Lane, QueueManager, QueuedRequest};
use crate::request::{ApiRequest, ApiResponse, RawResponse, RequestDescriptor};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::telemetry::{boxed_sink, emit_best_effort, DispatchEvent, EventSink, Outcome};
use crate::transport::{Transport, TransportFuture};
use pin_project::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tower_service::Service;
use tracing::{debug, warn};

struct Shared {
    transport: Box<dyn Transport>,
    config: DispatcherConfig,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    buckets: BucketStore,
    gate: GlobalGate,
    queues: QueueManager,
    // BoxCloneService is Send but not Sync
    sink: Option<Mutex<EventSink>>,
    next_id: AtomicU64,
}

impl Drop for Shared {
    fn drop(&mut self) {
        for lane in self.queues.all() {
            for request in lane.drain() {
                request.complete(Err(ApiError::Shutdown));
            }
            lane.wake();
        }
    }
}

/// The rate-limited dispatch core.
///
/// Clones share queues, bucket state and the global gate. When the last clone
/// is dropped, still-queued requests resolve to [`ApiError::Shutdown`];
/// requests already in flight still deliver their result.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.shared.config)
            .field("buckets", &self.shared.buckets.len())
            .field("global_open", &self.shared.gate.is_open())
            .field("transport", &"<transport>")
            .finish()
    }
}

impl Dispatcher {
    /// Dispatcher with default configuration, tokio time and no telemetry.
    pub fn new<T: Transport>(transport: T) -> Self {
        Self::builder(transport).build()
    }

    pub fn builder<T: Transport>(transport: T) -> DispatcherBuilder {
        DispatcherBuilder::new(transport)
    }

    /// Queue `descriptor` under `key`. Must be called within a tokio runtime.
    ///
    /// Default headers from the configuration are merged in (request-specific
    /// values win); the descriptor is immutable from here on.
    pub fn submit(&self, mut descriptor: RequestDescriptor, key: BucketKey) -> ResponseHandle {
        let shared = &self.shared;
        descriptor.headers.fill_from(shared.config.default_headers());

        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();
        let lane = shared.queues.lane(&key, &shared.buckets);
        let request = QueuedRequest {
            id,
            descriptor: Arc::new(descriptor),
            reply,
            enqueued_at: shared.clock.now_millis(),
            attempts: 0,
        };

        debug!(request_id = id, bucket = %key, "request queued");
        if lane.enqueue(request) {
            Shared::start_worker(shared, lane.clone());
        }

        ResponseHandle { rx, id, lane, shared: Arc::downgrade(shared) }
    }

    /// Queue a prepared [`ApiRequest`].
    pub fn execute(&self, request: ApiRequest) -> ResponseHandle {
        self.submit(request.descriptor, request.bucket)
    }

    /// Number of requests waiting (not in flight) on `key`.
    pub fn queued(&self, key: &BucketKey) -> usize {
        self.shared.queues.get(key).map_or(0, |lane| lane.len())
    }

    pub fn buckets(&self) -> &BucketStore {
        &self.shared.buckets
    }

    pub fn global_gate(&self) -> &GlobalGate {
        &self.shared.gate
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.shared.config
    }
}

impl Service<ApiRequest> for Dispatcher {
    type Response = ApiResponse;
    type Error = ApiError;
    type Future = ResponseHandle;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // admission happens per bucket after submission; the queue is unbounded
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: ApiRequest) -> Self::Future {
        self.execute(request)
    }
}

/// Builder for [`Dispatcher`].
pub struct DispatcherBuilder {
    transport: Box<dyn Transport>,
    config: DispatcherConfig,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    sink: Option<EventSink>,
}

impl DispatcherBuilder {
    pub fn new<T: Transport>(transport: T) -> Self {
        Self {
            transport: Box::new(transport),
            config: DispatcherConfig::default(),
            clock: Arc::new(MonotonicClock::default()),
            sleeper: Arc::new(TokioSleeper),
            sink: None,
        }
    }

    pub fn config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the clock (useful for deterministic tests).
    pub fn clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Send dispatch events to `sink` (best-effort).
    pub fn telemetry<S>(mut self, sink: S) -> Self
    where
        S: Service<DispatchEvent, Response = ()> + Clone + Send + 'static,
        S::Error: Into<BoxError>,
        S::Future: Send + 'static,
    {
        self.sink = Some(boxed_sink(sink));
        self
    }

    pub fn build(self) -> Dispatcher {
        let shared = Shared {
            transport: self.transport,
            buckets: BucketStore::new(self.clock.clone()),
            gate: GlobalGate::new(self.clock.clone()),
            config: self.config,
            clock: self.clock,
            sleeper: self.sleeper,
            queues: QueueManager::default(),
            sink: self.sink.map(Mutex::new),
            next_id: AtomicU64::new(1),
        };
        Dispatcher { shared: Arc::new(shared) }
    }
}

impl Shared {
    fn start_worker(this: &Arc<Self>, lane: Arc<Lane>) {
        debug!(bucket = %lane.key(), "starting bucket worker");
        tokio::spawn(drive(Arc::downgrade(this), lane));
    }

    fn sink(&self) -> Option<EventSink> {
        let sink = self.sink.as_ref()?;
        let guard = sink.lock().unwrap_or_else(|e| e.into_inner());
        Some(guard.clone())
    }

    /// Hand `event` to the sink on its own task; dispatch never waits on telemetry.
    fn emit(&self, event: DispatchEvent) {
        if let (Some(sink), Ok(runtime)) = (self.sink(), tokio::runtime::Handle::try_current()) {
            runtime.spawn(emit_best_effort(sink, event));
        }
    }

    fn now(&self) -> Now {
        Now { monotonic: self.clock.now_millis(), unix: self.clock.unix_millis() }
    }

    /// Hand an admitted request to the transport and track its completion.
    fn dispatch(this: &Arc<Self>, lane: &Arc<Lane>, mut request: QueuedRequest) {
        request.attempts += 1;
        let waited = this.clock.now_millis().saturating_sub(request.enqueued_at);
        debug!(
            request_id = request.id,
            bucket = %lane.key(),
            attempt = request.attempts,
            waited_ms = waited,
            "dispatching request"
        );
        let in_flight = this.transport.send(request.descriptor.clone());
        this.emit(DispatchEvent::Dispatched {
            key: lane.key().clone(),
            request_id: request.id,
            attempt: request.attempts,
        });
        tokio::spawn(complete(Arc::downgrade(this), lane.clone(), request, in_flight));
    }

    /// Fold one transport result into bucket/global state and resolve or requeue.
    fn settle(
        this: &Arc<Self>,
        lane: &Arc<Lane>,
        request: QueuedRequest,
        result: Result<RawResponse, TransportError>,
    ) {
        let key = lane.key().clone();
        let response = match result {
            Ok(response) => response,
            Err(error) => {
                state::lock(lane.bucket()).release();
                lane.wake();
                warn!(request_id = request.id, bucket = %key, error = %error, "transport failure");
                this.emit(DispatchEvent::Completed {
                    key,
                    request_id: request.id,
                    outcome: Outcome::TransportFailed,
                });
                request.complete(Err(error.into()));
                return;
            }
        };

        let now = this.now();
        let rate_limited =
            (response.status == 429).then(|| headers::parse_rejection(&response, &this.config));
        {
            let mut bucket = state::lock(lane.bucket());
            bucket.release();
            match headers::parse_quota(&response.headers, now, this.config.reset_cushion()) {
                QuotaHeaders::Present(quota) => {
                    debug!(
                        bucket = %key,
                        remaining = quota.remaining,
                        limit = quota.limit,
                        reset_in_ms = quota.reset_at.saturating_sub(now.monotonic),
                        "quota updated"
                    );
                    bucket.apply(quota);
                }
                QuotaHeaders::Absent => {}
                QuotaHeaders::Malformed(reason) => {
                    warn!(bucket = %key, reason, "ignoring malformed rate-limit headers");
                }
            }
            if let Some(limited) = rate_limited {
                if limited.scope == RateLimitScope::Route {
                    bucket.exhaust(now.monotonic.saturating_add(millis(limited.retry_after)));
                }
            }
        }

        if let Some(limited) = rate_limited {
            if limited.scope == RateLimitScope::Global {
                this.gate.trip(limited.retry_after);
                this.emit(DispatchEvent::GlobalLimitTripped { retry_after: limited.retry_after });
            }
            warn!(
                request_id = request.id,
                bucket = %key,
                scope = %limited.scope,
                retry_after_ms = millis(limited.retry_after),
                "rate limited; requeueing at head"
            );
            let request_id = request.id;
            if lane.requeue(request) {
                Shared::start_worker(this, lane.clone());
            }
            this.emit(DispatchEvent::Requeued {
                key,
                request_id,
                scope: limited.scope,
                retry_after: limited.retry_after,
            });
            return;
        }

        lane.wake();
        let status = response.status;
        let request_id = request.id;
        let (result, outcome) = classify(response);
        debug!(request_id, bucket = %key, status, "request completed");
        this.emit(DispatchEvent::Completed { key, request_id, outcome });
        request.complete(result);
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn classify(response: RawResponse) -> (Result<ApiResponse, ApiError>, Outcome) {
    let status = response.status;
    if response.is_success() {
        (Ok(response.into()), Outcome::Delivered { status })
    } else {
        (
            Err(ApiError::RemoteRejection { status, body: response.body }),
            Outcome::Rejected { status },
        )
    }
}

/// Per-bucket worker: admit, dispatch, wait, until the queue drains.
async fn drive(shared: Weak<Shared>, lane: Arc<Lane>) {
    loop {
        let sleep = {
            let Some(this) = shared.upgrade() else { return };
            match lane.admit(&this.gate, this.clock.now_millis()) {
                Admission::Ready(request) => {
                    Shared::dispatch(&this, &lane, request);
                    continue;
                }
                Admission::Wait(wait) => {
                    debug!(bucket = %lane.key(), wait_ms = millis(wait), "bucket waiting");
                    Some(this.sleeper.sleep(wait))
                }
                Admission::AwaitResponse => None,
                Admission::Idle => {
                    debug!(bucket = %lane.key(), "bucket worker idle");
                    return;
                }
            }
        };
        match sleep {
            Some(sleep) => {
                tokio::select! {
                    _ = sleep => {}
                    _ = lane.woken() => {}
                }
            }
            None => lane.woken().await,
        }
    }
}

async fn complete(
    shared: Weak<Shared>,
    lane: Arc<Lane>,
    request: QueuedRequest,
    in_flight: TransportFuture,
) {
    let result = in_flight.await;
    match shared.upgrade() {
        Some(this) => Shared::settle(&this, &lane, request, result),
        None => {
            // nobody left to requeue into; a throttled request cannot be retried
            let delivered = match result {
                Ok(response) if response.status == 429 => Err(ApiError::Shutdown),
                Ok(response) => classify(response).0,
                Err(error) => Err(error.into()),
            };
            request.complete(delivered);
        }
    }
}

/// Completion handle for a submitted request.
///
/// Resolves exactly once. Dropping it does not cancel the request; use
/// [`ResponseHandle::cancel`] to withdraw a request that is still queued.
#[pin_project]
pub struct ResponseHandle {
    #[pin]
    rx: oneshot::Receiver<Result<ApiResponse, ApiError>>,
    id: u64,
    lane: Arc<Lane>,
    shared: Weak<Shared>,
}

impl std::fmt::Debug for ResponseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseHandle")
            .field("id", &self.id)
            .field("bucket", self.lane.key())
            .finish()
    }
}

impl ResponseHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn bucket(&self) -> &BucketKey {
        self.lane.key()
    }

    /// Withdraw the request if it has not been dispatched yet.
    ///
    /// Returns `true` if it was withdrawn; the handle then resolves to
    /// [`ApiError::Cancelled`]. Once dispatch has begun this returns `false`
    /// and the in-flight result is still delivered.
    pub fn cancel(&self) -> bool {
        let Some(request) = self.lane.withdraw(self.id) else { return false };
        debug!(request_id = self.id, bucket = %self.lane.key(), "request cancelled");
        request.complete(Err(ApiError::Cancelled));
        self.lane.wake();
        if let Some(shared) = self.shared.upgrade() {
            shared.emit(DispatchEvent::Cancelled {
                key: self.lane.key().clone(),
                request_id: self.id,
            });
        }
        true
    }
}

impl Future for ResponseHandle {
    type Output = Result<ApiResponse, ApiError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.project().rx.poll(cx).map(|received| received.unwrap_or(Err(ApiError::Shutdown)))
    }
}
