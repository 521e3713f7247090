//! Rate-limit buckets: identity ([`BucketKey`]) and quota state ([`BucketStore`]).

pub mod key;
pub mod state;

pub use key::{BucketKey, MajorParameter, Route, RouteError};
pub use state::{Blocked, BucketHandle, BucketState, BucketStore, Quota};
