//! The HTTP transport consumed by the dispatcher.
//!
//! The dispatcher never touches sockets. It hands each admitted request to a
//! [`Transport`] and waits for the returned future. `send` itself is called
//! synchronously in queue order, so transports that record or forward calls in
//! `send` observe strict per-bucket FIFO order.

use crate::error::TransportError;
use crate::request::{RawResponse, RequestDescriptor};
use futures::future::BoxFuture;
use std::sync::Arc;

/// Future returned by [`Transport::send`].
pub type TransportFuture = BoxFuture<'static, Result<RawResponse, TransportError>>;

/// Performs one HTTP exchange.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, request: Arc<RequestDescriptor>) -> TransportFuture;
}

impl<F> Transport for F
where
    F: Fn(Arc<RequestDescriptor>) -> TransportFuture + Send + Sync + 'static,
{
    fn send(&self, request: Arc<RequestDescriptor>) -> TransportFuture {
        self(request)
    }
}
