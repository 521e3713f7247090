//! Reading rate-limit signals from responses.
//!
//! Quota headers (all case-insensitive):
//!
//! | header                    | meaning                                    |
//! |---------------------------|--------------------------------------------|
//! | `X-RateLimit-Limit`       | calls per window                           |
//! | `X-RateLimit-Remaining`   | calls left in the current window           |
//! | `X-RateLimit-Reset-After` | seconds until the window resets (preferred)|
//! | `X-RateLimit-Reset`       | unix seconds at which the window resets    |
//! | `X-RateLimit-Bucket`      | opaque server bucket id                    |
//!
//! Rejections are 429 responses. The JSON body's `global` field decides the
//! scope; the `X-RateLimit-Global` header is consulted only when the body
//! does not say.

use crate::bucket::Quota;
use crate::config::DispatcherConfig;
use crate::error::{RateLimitScope, RateLimited};
use crate::request::{Headers, RawResponse};
use serde::Deserialize;
use std::time::Duration;

pub const LIMIT: &str = "x-ratelimit-limit";
pub const REMAINING: &str = "x-ratelimit-remaining";
pub const RESET: &str = "x-ratelimit-reset";
pub const RESET_AFTER: &str = "x-ratelimit-reset-after";
pub const BUCKET: &str = "x-ratelimit-bucket";
pub const GLOBAL: &str = "x-ratelimit-global";
pub const SCOPE: &str = "x-ratelimit-scope";
pub const RETRY_AFTER: &str = "retry-after";

/// Outcome of reading quota headers from one response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaHeaders {
    /// No quota headers at all (route is not limited, or the server omitted them).
    Absent,
    /// Some headers present but unusable; prior state must be kept.
    Malformed(&'static str),
    Present(Quota),
}

/// Timeline anchors used to convert server times into store-clock millis.
#[derive(Debug, Clone, Copy)]
pub struct Now {
    /// Monotonic store-clock millis.
    pub monotonic: u64,
    /// Wall-clock unix millis at the same moment.
    pub unix: u64,
}

/// Parse quota headers. `cushion` is added to the computed reset deadline.
pub fn parse_quota(headers: &Headers, now: Now, cushion: Duration) -> QuotaHeaders {
    let any = [LIMIT, REMAINING, RESET, RESET_AFTER].iter().any(|h| headers.contains(h));
    if !any {
        return QuotaHeaders::Absent;
    }

    let Some(limit) = headers.get(LIMIT).and_then(|v| v.trim().parse::<u32>().ok()) else {
        return QuotaHeaders::Malformed("limit missing or not an integer");
    };
    if limit == 0 {
        return QuotaHeaders::Malformed("limit is zero");
    }
    let Some(remaining) = headers.get(REMAINING).and_then(|v| v.trim().parse::<u32>().ok()) else {
        return QuotaHeaders::Malformed("remaining missing or not an integer");
    };

    let reset_in = match seconds(headers, RESET_AFTER) {
        Some(after) => Some(after),
        None => seconds(headers, RESET).map(|unix_secs| {
            let reset_ms = (unix_secs.as_millis()).min(u128::from(u64::MAX)) as u64;
            Duration::from_millis(reset_ms.saturating_sub(now.unix))
        }),
    };
    let Some(reset_in) = reset_in else {
        return QuotaHeaders::Malformed("reset missing or not a number");
    };

    let wait = reset_in.saturating_add(cushion);
    let reset_at =
        now.monotonic.saturating_add(u64::try_from(wait.as_millis()).unwrap_or(u64::MAX));

    QuotaHeaders::Present(Quota {
        remaining,
        limit,
        reset_at,
        bucket_id: headers.get(BUCKET).map(str::to_owned),
    })
}

fn seconds(headers: &Headers, name: &str) -> Option<Duration> {
    let value = headers.get(name)?.trim().parse::<f64>().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(value).ok()
}

#[derive(Debug, Default, Deserialize)]
struct RejectionBody {
    #[serde(default)]
    retry_after: Option<f64>,
    #[serde(default)]
    global: Option<bool>,
}

/// Interpret a 429 response.
pub(crate) fn parse_rejection(response: &RawResponse, config: &DispatcherConfig) -> RateLimited {
    let body: RejectionBody = serde_json::from_slice(&response.body).unwrap_or_default();
    let unit = config.retry_after_unit();

    let global = body.global.unwrap_or_else(|| {
        let flag = response.headers.get(GLOBAL).map(|v| v.trim().eq_ignore_ascii_case("true"));
        let scope = response.headers.get(SCOPE).map(|v| v.trim().eq_ignore_ascii_case("global"));
        flag.or(scope).unwrap_or(false)
    });

    let retry_after = body
        .retry_after
        .and_then(|v| unit.to_duration(v))
        .or_else(|| {
            let header = response.headers.get(RETRY_AFTER)?.trim().parse::<f64>().ok()?;
            unit.to_duration(header)
        })
        .unwrap_or_else(|| config.fallback_retry_after());

    RateLimited {
        scope: if global { RateLimitScope::Global } else { RateLimitScope::Route },
        retry_after: config.effective_wait(retry_after),
    }
}
