//! Transports and response builders shared by the integration tests.

use futures::future::{self, BoxFuture};
use futures::FutureExt;
use ratelane::transport::{Transport, TransportFuture};
use ratelane::{
    ApiRequest, BucketKey, DispatchEvent, Method, RawResponse, RequestDescriptor, Route,
    TransportError,
};
use std::collections::VecDeque;
use std::convert::Infallible;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tower::Service;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// `POST /channels/{channel_id}/messages` carrying `label` as its body.
pub fn message(channel_id: u64, label: &str) -> ApiRequest {
    let mut request = Route::new(Method::Post, "/channels/{channel_id}/messages")
        .param("channel_id", channel_id)
        .request()
        .expect("static route");
    request.descriptor = request.descriptor.body(label.to_owned());
    request
}

pub fn message_key(channel_id: u64) -> BucketKey {
    message(channel_id, "").bucket
}

/// Body of a recorded request as text.
pub fn label(request: &RequestDescriptor) -> String {
    request.body.as_deref().map(|b| String::from_utf8_lossy(b).into_owned()).unwrap_or_default()
}

/// A 200 carrying quota headers.
pub fn with_quota(remaining: u32, limit: u32, reset_after_secs: f64) -> RawResponse {
    RawResponse::new(200)
        .header("X-RateLimit-Limit", limit.to_string())
        .header("X-RateLimit-Remaining", remaining.to_string())
        .header("X-RateLimit-Reset-After", reset_after_secs.to_string())
}

/// A 429 whose JSON body states the scope.
pub fn too_many_requests(retry_after_secs: f64, global: bool) -> RawResponse {
    RawResponse::new(429).header("Retry-After", retry_after_secs.ceil().to_string()).body(format!(
        r#"{{"message":"You are being rate limited.","retry_after":{retry_after_secs},"global":{global}}}"#
    ))
}

/// One transport invocation held open until the test answers it.
pub struct Call {
    pub request: Arc<RequestDescriptor>,
    pub at: Instant,
    reply: oneshot::Sender<Result<RawResponse, TransportError>>,
}

impl Call {
    pub fn label(&self) -> String {
        label(&self.request)
    }

    pub fn respond(self, response: RawResponse) {
        let _ = self.reply.send(Ok(response));
    }

    pub fn fail(self, error: TransportError) {
        let _ = self.reply.send(Err(error));
    }
}

/// Transport whose calls are answered by hand through the returned receiver.
#[derive(Clone)]
pub struct ManualTransport {
    calls: mpsc::UnboundedSender<Call>,
}

impl ManualTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Call>) {
        let (calls, rx) = mpsc::unbounded_channel();
        (Self { calls }, rx)
    }
}

impl Transport for ManualTransport {
    fn send(&self, request: Arc<RequestDescriptor>) -> TransportFuture {
        let (reply, response) = oneshot::channel();
        let _ = self.calls.send(Call { request, at: Instant::now(), reply });
        async move {
            response
                .await
                .unwrap_or_else(|_| Err(TransportError::Connection("call dropped by test".into())))
        }
        .boxed()
    }
}

/// Receive the next call, failing the test if none arrives within `within`.
pub async fn next_call(rx: &mut mpsc::UnboundedReceiver<Call>, within: Duration) -> Call {
    tokio::time::timeout(within, rx.recv())
        .await
        .expect("transport was not called in time")
        .expect("transport dropped")
}

/// Assert that no call arrives within `within`.
pub async fn no_call(rx: &mut mpsc::UnboundedReceiver<Call>, within: Duration) {
    if let Ok(Some(call)) = tokio::time::timeout(within, rx.recv()).await {
        panic!("unexpected call to {} ({})", call.request.path, call.label());
    }
}

/// Transport answering immediately from a script, then with a plain 200.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    script: Arc<Mutex<VecDeque<Result<RawResponse, TransportError>>>>,
    log: Arc<Mutex<Vec<(Arc<RequestDescriptor>, Instant)>>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(self, response: RawResponse) -> Self {
        self.script.lock().unwrap().push_back(Ok(response));
        self
    }

    pub fn then_fail(self, error: TransportError) -> Self {
        self.script.lock().unwrap().push_back(Err(error));
        self
    }

    pub fn labels(&self) -> Vec<String> {
        self.log.lock().unwrap().iter().map(|(r, _)| label(r)).collect()
    }

    pub fn times(&self) -> Vec<Instant> {
        self.log.lock().unwrap().iter().map(|(_, at)| *at).collect()
    }

    pub fn requests(&self) -> Vec<Arc<RequestDescriptor>> {
        self.log.lock().unwrap().iter().map(|(r, _)| r.clone()).collect()
    }
}

impl Transport for ScriptedTransport {
    fn send(&self, request: Arc<RequestDescriptor>) -> TransportFuture {
        self.log.lock().unwrap().push((request, Instant::now()));
        let next = self.script.lock().unwrap().pop_front();
        let result = next.unwrap_or_else(|| Ok(RawResponse::new(200).body("{}")));
        async move { result }.boxed()
    }
}

/// Yield until `condition` holds; events are delivered on their own tasks.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..1_000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition never became true");
}

/// Telemetry sink that takes `delay` to accept each event.
#[derive(Clone)]
pub struct SlowSink {
    delay: Duration,
    events: Arc<Mutex<Vec<DispatchEvent>>>,
}

impl SlowSink {
    pub fn new(delay: Duration) -> Self {
        Self { delay, events: Arc::default() }
    }

    pub fn events(&self) -> Vec<DispatchEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl Service<DispatchEvent> for SlowSink {
    type Response = ();
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: DispatchEvent) -> Self::Future {
        let (delay, events) = (self.delay, self.events.clone());
        async move {
            tokio::time::sleep(delay).await;
            events.lock().unwrap().push(event);
            Ok(())
        }
        .boxed()
    }
}

/// Telemetry sink that errors on every event, either in `poll_ready` or in `call`.
#[derive(Clone)]
pub struct FailingSink {
    fail_ready: bool,
    attempts: Arc<AtomicUsize>,
}

impl FailingSink {
    pub fn on_ready() -> Self {
        Self { fail_ready: true, attempts: Arc::default() }
    }

    pub fn on_call() -> Self {
        Self { fail_ready: false, attempts: Arc::default() }
    }

    /// Events the dispatcher tried to hand over.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Service<DispatchEvent> for FailingSink {
    type Response = ();
    type Error = io::Error;
    type Future = future::Ready<Result<(), io::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        if self.fail_ready {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, "sink unavailable")));
        }
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: DispatchEvent) -> Self::Future {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        future::ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "sink closed")))
    }
}
