//! Wrapping protected operations with an admission check.
//!
//! [`Limiter::run`] checks the request, short-circuits with a [`Rejection`]
//! when over quota, and otherwise runs the operation and settles its charge
//! according to how it finished. The operation's own error is returned
//! unchanged.

mod response;

use std::future::Future;

use http::Response;
use tracing::debug;

pub use response::{
    QuotaHeaders, Rejection, RATE_LIMIT_EXCEEDED, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING,
    X_RATELIMIT_RESET,
};

use crate::ratelimit::{Decision, Limiter, Outcome, RequestContext};

/// The value of an admitted operation, with its quota telemetry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admitted<T> {
    /// What the operation returned
    pub value: T,
    /// Quota telemetry, after any rollback of this request's charge
    pub quota: QuotaHeaders,
}

impl<B> Admitted<Response<B>> {
    /// The operation's response with quota headers attached.
    pub fn into_response(self) -> Response<B> {
        let mut response = self.value;
        self.quota.apply(response.headers_mut());
        response
    }
}

/// What a guarded call produced, short of the operation failing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Guarded<T> {
    /// The request was admitted and the operation succeeded.
    Admitted(Admitted<T>),
    /// The request was over quota; the operation never ran.
    Rejected(Rejection),
}

impl<T> Guarded<T> {
    /// Whether the operation ran.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Guarded::Admitted(_))
    }

    /// The operation's value, if it ran.
    pub fn admitted(self) -> Option<T> {
        match self {
            Guarded::Admitted(admitted) => Some(admitted.value),
            Guarded::Rejected(_) => None,
        }
    }

    /// The rejection, if the operation was turned away.
    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Guarded::Admitted(_) => None,
            Guarded::Rejected(rejection) => Some(rejection),
        }
    }
}

impl Guarded<Response<String>> {
    /// Collapse into the response to send: the operation's response with
    /// quota headers, or the 429.
    pub fn into_response(self) -> Response<String> {
        match self {
            Guarded::Admitted(admitted) => admitted.into_response(),
            Guarded::Rejected(rejection) => rejection.into_response(),
        }
    }
}

/// An admitted request's charge, awaiting its outcome.
///
/// Dropped unsettled, the operation was cancelled or timed out, which
/// settles as a failure.
struct PendingCharge<'a> {
    limiter: &'a Limiter,
    decision: &'a Decision,
    settled: bool,
}

impl<'a> PendingCharge<'a> {
    fn new(limiter: &'a Limiter, decision: &'a Decision) -> Self {
        Self {
            limiter,
            decision,
            settled: false,
        }
    }

    fn settle(mut self, outcome: Outcome) -> bool {
        self.settled = true;
        self.limiter.settle(self.decision, outcome)
    }
}

impl Drop for PendingCharge<'_> {
    fn drop(&mut self) {
        if !self.settled {
            debug!(key = %self.decision.key, "Protected operation abandoned");
            self.limiter.settle(self.decision, Outcome::Failed);
        }
    }
}

impl Limiter {
    /// Run `operation` for `req` if the policy admits it.
    ///
    /// Returns `Ok(Guarded::Rejected)` without running the operation when
    /// over quota, `Ok(Guarded::Admitted)` when it succeeds, and the
    /// operation's own `Err` when it fails. Dropping the returned future
    /// after admission counts as a failure.
    pub async fn run<F, Fut, T, E>(&self, req: &RequestContext, operation: F) -> Result<Guarded<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let decision = self.check(req);
        if !decision.admitted {
            return Ok(Guarded::Rejected(Rejection::new(
                &decision,
                self.policy().message(),
            )));
        }

        let pending = PendingCharge::new(self, &decision);
        match operation().await {
            Ok(value) => {
                let mut quota = QuotaHeaders::from(&decision);
                if pending.settle(Outcome::Succeeded) {
                    quota.remaining = (quota.remaining + 1).min(quota.limit);
                }
                Ok(Guarded::Admitted(Admitted { value, quota }))
            }
            Err(err) => {
                pending.settle(Outcome::Failed);
                Err(err)
            }
        }
    }
}
