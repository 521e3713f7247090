#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # ratelane
//!
//! Rate-limited dispatch core for chat-platform REST clients.
//!
//! Every outbound call passes through a [`Dispatcher`], which
//!
//! - keys each request to a rate-limit bucket (method, route template, major
//!   parameter),
//! - queues requests per bucket in strict FIFO order,
//! - admits them only while the bucket has quota and the global gate is open,
//! - learns quota from response headers and absorbs 429s by requeueing at the
//!   head of the bucket's queue.
//!
//! Sockets are not part of the crate: plug any HTTP client in through the
//! [`Transport`] trait.
//!
//! ## Quick Start
//!
//! ```rust
//! use ratelane::{Client, Dispatcher, DispatcherConfig, RawResponse, RequestDescriptor, Snowflake};
//! use ratelane::endpoints;
//! use ratelane::transport::TransportFuture;
//! use futures::FutureExt;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = |request: Arc<RequestDescriptor>| -> TransportFuture {
//!         assert_eq!(request.headers.get("authorization"), Some("Bot TOKEN"));
//!         async {
//!             Ok(RawResponse::new(200)
//!                 .header("X-RateLimit-Limit", "5")
//!                 .header("X-RateLimit-Remaining", "4")
//!                 .header("X-RateLimit-Reset-After", "1")
//!                 .body(r#"{"id":"80351110224678912","name":"general"}"#))
//!         }
//!         .boxed()
//!     };
//!
//!     let config = DispatcherConfig::builder().token("Bot TOKEN").build()?;
//!     let client = Client::new(Dispatcher::builder(transport).config(config).build());
//!
//!     let channel: serde_json::Value =
//!         client.fetch(endpoints::get_channel(Snowflake(80351110224678912)).request()?).await?;
//!     assert_eq!(channel["name"], "general");
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod bucket;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod endpoints;
pub mod error;
pub mod global;
pub mod headers;
pub mod layer;
mod queue;
pub mod request;
pub mod sleeper;
pub mod snowflake;
pub mod telemetry;
pub mod transport;

// Re-exports
pub use api::{leave_group_dm, Client, RestApi};
pub use bucket::{BucketKey, BucketState, BucketStore, MajorParameter, Quota, Route, RouteError};
pub use clock::{Clock, MonotonicClock};
pub use config::{ConfigError, DispatcherConfig, DispatcherConfigBuilder, RetryAfterUnit};
pub use dispatcher::{Dispatcher, DispatcherBuilder, ResponseHandle};
pub use endpoints::{ModifyChannel, ValidationError};
pub use error::{ApiError, BoxError, RateLimitScope, TransportError};
pub use global::GlobalGate;
pub use layer::RateLimitLayer;
pub use request::{ApiRequest, ApiResponse, Headers, Method, RawResponse, RequestDescriptor};
pub use sleeper::{Sleeper, TokioSleeper, TrackingSleeper};
pub use snowflake::Snowflake;
pub use telemetry::{DispatchEvent, LogSink, MemorySink, NullSink, Outcome};
pub use transport::Transport;
