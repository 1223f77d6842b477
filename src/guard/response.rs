//! Quota headers and the 429 rejection response.

use chrono::{DateTime, SecondsFormat, Utc};
use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use http::{Response, StatusCode};
use serde_json::{json, Value};

use crate::ratelimit::Decision;

/// Machine-readable code carried by every rejection body.
pub const RATE_LIMIT_EXCEEDED: &str = "RATE_LIMIT_EXCEEDED";

/// Requests allowed per window
pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
/// Requests left in the current window
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
/// Epoch seconds at which the window resets
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Quota telemetry attached to every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaHeaders {
    /// The policy's quota
    pub limit: u64,
    /// Requests left before rejection
    pub remaining: u64,
    /// When the current window resets
    pub reset_at: DateTime<Utc>,
}

impl QuotaHeaders {
    /// The reset time as epoch seconds, rounded up to agree with
    /// `Retry-After`.
    pub fn reset_epoch_secs(&self) -> i64 {
        let secs = self.reset_at.timestamp();
        if self.reset_at.timestamp_subsec_nanos() > 0 {
            secs + 1
        } else {
            secs
        }
    }

    /// Write the `X-RateLimit-*` headers.
    pub fn apply(&self, headers: &mut HeaderMap) {
        headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(self.limit));
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(self.remaining));
        headers.insert(X_RATELIMIT_RESET, HeaderValue::from(self.reset_epoch_secs()));
    }
}

impl From<&Decision> for QuotaHeaders {
    fn from(decision: &Decision) -> Self {
        Self {
            limit: decision.limit,
            remaining: decision.remaining,
            reset_at: decision.reset_at,
        }
    }
}

/// A request turned away by its policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// Quota telemetry at rejection time
    pub quota: QuotaHeaders,
    /// Seconds until the window resets, rounded up
    pub retry_after: u64,
    /// The policy's rejection message
    pub message: String,
}

impl Rejection {
    pub(crate) fn new(decision: &Decision, message: &str) -> Self {
        Self {
            quota: QuotaHeaders::from(decision),
            retry_after: decision.retry_after_secs(),
            message: message.to_string(),
        }
    }

    /// Always `429 Too Many Requests`.
    pub fn status(&self) -> StatusCode {
        StatusCode::TOO_MANY_REQUESTS
    }

    /// Quota headers plus `Retry-After`.
    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        self.quota.apply(&mut headers);
        headers.insert(RETRY_AFTER, HeaderValue::from(self.retry_after));
        headers
    }

    /// The JSON error envelope.
    pub fn body(&self) -> Value {
        json!({
            "success": false,
            "error": {
                "code": RATE_LIMIT_EXCEEDED,
                "message": self.message,
                "details": {
                    "limit": self.quota.limit,
                    "remaining": self.quota.remaining,
                    "resetTime": self.quota.reset_at.to_rfc3339_opts(SecondsFormat::Millis, true),
                    "retryAfter": self.retry_after,
                }
            },
            "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        })
    }

    /// Render as a complete HTTP response.
    pub fn into_response(self) -> Response<String> {
        let mut response = Response::new(self.body().to_string());
        *response.status_mut() = self.status();

        let headers = response.headers_mut();
        headers.extend(self.headers());
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response
    }
}
