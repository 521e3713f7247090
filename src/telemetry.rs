//! Telemetry for the dispatch pipeline.
//!
//! The dispatcher emits a [`DispatchEvent`] at every state transition of a
//! queued request. Events flow into a sink, which is any
//! `tower::Service<DispatchEvent, Response = ()>`; emission is best-effort and
//! never delays or fails dispatch.
//!
//! ```rust
//! use ratelane::telemetry::{MemorySink, DispatchEvent};
//! use tower::Service;
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let mut sink = MemorySink::new();
//! sink.call(DispatchEvent::GlobalLimitTripped { retry_after: Duration::from_secs(1) })
//!     .await
//!     .unwrap();
//! assert_eq!(sink.len(), 1);
//! # }
//! ```

use crate::bucket::BucketKey;
use crate::error::{BoxError, RateLimitScope};
use std::collections::VecDeque;
use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tower::util::BoxCloneService;
use tower::{Service, ServiceExt};

/// Terminal outcome of a request, as reported in [`DispatchEvent::Completed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// 2xx/3xx response delivered.
    Delivered { status: u16 },
    /// Non-429 4xx/5xx delivered as an error.
    Rejected { status: u16 },
    /// The transport failed; surfaced once, not retried.
    TransportFailed,
}

/// Events emitted by the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchEvent {
    /// A request left its queue and was handed to the transport.
    Dispatched { key: BucketKey, request_id: u64, attempt: u32 },
    /// A 429 sent the request back to the head of its queue.
    Requeued { key: BucketKey, request_id: u64, scope: RateLimitScope, retry_after: Duration },
    /// A global rejection closed the gate for every bucket.
    GlobalLimitTripped { retry_after: Duration },
    /// The request reached a terminal state.
    Completed { key: BucketKey, request_id: u64, outcome: Outcome },
    /// The request was withdrawn before dispatch.
    Cancelled { key: BucketKey, request_id: u64 },
}

impl fmt::Display for DispatchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchEvent::Dispatched { key, request_id, attempt } => {
                write!(f, "Dispatched(#{request_id}, {key}, attempt={attempt})")
            }
            DispatchEvent::Requeued { key, request_id, scope, retry_after } => write!(
                f,
                "Requeued(#{request_id}, {key}, scope={scope}, retry_after={retry_after:?})"
            ),
            DispatchEvent::GlobalLimitTripped { retry_after } => {
                write!(f, "GlobalLimitTripped(retry_after={retry_after:?})")
            }
            DispatchEvent::Completed { key, request_id, outcome } => {
                write!(f, "Completed(#{request_id}, {key}, {outcome:?})")
            }
            DispatchEvent::Cancelled { key, request_id } => {
                write!(f, "Cancelled(#{request_id}, {key})")
            }
        }
    }
}

/// Type-erased sink stored by the dispatcher.
pub type EventSink = BoxCloneService<DispatchEvent, (), BoxError>;

/// Erase any compatible tower service into an [`EventSink`].
pub fn boxed_sink<S>(sink: S) -> EventSink
where
    S: Service<DispatchEvent, Response = ()> + Clone + Send + 'static,
    S::Error: Into<BoxError>,
    S::Future: Send + 'static,
{
    BoxCloneService::new(sink.map_err(|e: S::Error| -> BoxError { e.into() }))
}

/// Best-effort emit helper that honors `poll_ready` and swallows errors.
pub async fn emit_best_effort<S>(sink: S, event: DispatchEvent)
where
    S: Service<DispatchEvent, Response = ()> + Send + Clone + 'static,
    S::Future: Send + 'static,
{
    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

type Ready = Pin<Box<dyn Future<Output = Result<(), Infallible>> + Send>>;

/// A no-op sink that discards all events.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<DispatchEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: DispatchEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

/// A sink that logs events using the `tracing` crate.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<DispatchEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: DispatchEvent) -> Self::Future {
        tracing::info!(event = %event, "dispatch_event");
        Box::pin(async { Ok(()) })
    }
}

/// A sink that stores events in memory, evicting the oldest past `capacity`.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<VecDeque<DispatchEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    /// Creates a bounded memory sink (default cap: 10,000).
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn events(&self) -> Vec<DispatchEvent> {
        self.lock().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<DispatchEvent>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<DispatchEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: DispatchEvent) -> Self::Future {
        let mut events = self.lock();
        if events.len() >= self.capacity {
            events.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        events.push_back(event);
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Method;

    fn key() -> BucketKey {
        BucketKey::unpartitioned(Method::Get, "/gateway")
    }

    #[tokio::test]
    async fn memory_sink_evicts_oldest() {
        let mut sink = MemorySink::with_capacity(2);
        for id in 0..3 {
            sink.call(DispatchEvent::Cancelled { key: key(), request_id: id }).await.unwrap();
        }
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.evicted(), 1);
        assert_eq!(sink.events()[0], DispatchEvent::Cancelled { key: key(), request_id: 1 });
    }

    #[tokio::test]
    async fn boxed_sink_feeds_the_inner_sink() {
        let memory = MemorySink::new();
        let boxed = boxed_sink(memory.clone());
        emit_best_effort(boxed, DispatchEvent::GlobalLimitTripped { retry_after: Duration::ZERO })
            .await;
        assert_eq!(memory.len(), 1);
    }

    #[tokio::test]
    async fn null_and_log_sinks_accept_everything() {
        emit_best_effort(NullSink, DispatchEvent::Cancelled { key: key(), request_id: 1 }).await;
        emit_best_effort(LogSink, DispatchEvent::Cancelled { key: key(), request_id: 1 }).await;
    }

    #[test]
    fn display_is_compact() {
        let event = DispatchEvent::Requeued {
            key: key(),
            request_id: 7,
            scope: RateLimitScope::Route,
            retry_after: Duration::from_secs(2),
        };
        assert_eq!(event.to_string(), "Requeued(#7, GET /gateway, scope=route, retry_after=2s)");
    }
}
