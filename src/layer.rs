//! Tower integration: a [`Layer`] that turns a [`Transport`] into a
//! rate-limited [`Dispatcher`] service.

use crate::config::DispatcherConfig;
use crate::dispatcher::Dispatcher;
use crate::error::BoxError;
use crate::telemetry::{boxed_sink, DispatchEvent, EventSink};
use crate::transport::Transport;
use tower_layer::Layer;
use tower_service::Service;

/// Wraps a transport in a [`Dispatcher`].
///
/// Each call to [`Layer::layer`] builds an independent dispatcher with its own
/// bucket state; clone the resulting service to share it.
///
/// ```rust
/// use ratelane::{ApiRequest, RateLimitLayer, RawResponse, RequestDescriptor};
/// use ratelane::transport::TransportFuture;
/// use futures::FutureExt;
/// use std::sync::Arc;
/// use tower::{ServiceBuilder, ServiceExt};
///
/// # #[tokio::main]
/// # async fn main() {
/// let transport = |_request: Arc<RequestDescriptor>| -> TransportFuture {
///     async { Ok(RawResponse::new(204)) }.boxed()
/// };
/// let service = ServiceBuilder::new().layer(RateLimitLayer::default()).service(transport);
/// let request = ratelane::endpoints::get_gateway().request().unwrap();
/// let response = service.oneshot(request).await.unwrap();
/// assert_eq!(response.status, 204);
/// # }
/// ```
#[derive(Clone, Default)]
pub struct RateLimitLayer {
    config: DispatcherConfig,
    sink: Option<EventSink>,
}

impl std::fmt::Debug for RateLimitLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitLayer")
            .field("config", &self.config)
            .field("telemetry", &self.sink.is_some())
            .finish()
    }
}

impl RateLimitLayer {
    pub fn new(config: DispatcherConfig) -> Self {
        Self { config, sink: None }
    }

    /// Attach a telemetry sink to every dispatcher this layer builds.
    pub fn with_telemetry<S>(mut self, sink: S) -> Self
    where
        S: Service<DispatchEvent, Response = ()> + Clone + Send + 'static,
        S::Error: Into<BoxError>,
        S::Future: Send + 'static,
    {
        self.sink = Some(boxed_sink(sink));
        self
    }
}

impl<T: Transport> Layer<T> for RateLimitLayer {
    type Service = Dispatcher;

    fn layer(&self, transport: T) -> Self::Service {
        let builder = Dispatcher::builder(transport).config(self.config.clone());
        match &self.sink {
            Some(sink) => builder.telemetry(sink.clone()).build(),
            None => builder.build(),
        }
    }
}
