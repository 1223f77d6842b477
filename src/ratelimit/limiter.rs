//! Core admission decision.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::identity::{RequestContext, LOOPBACK_IDENTITY};
use super::policy::{AdmissionPolicy, Outcome};
use super::store::{StoreStats, SweeperHandle, WindowStore};
use crate::error::Result;

/// Observer called for every rejected request.
///
/// The request is absent when the check was made by key. A panicking hook
/// is caught and logged; it never changes the decision.
pub type RejectHook = Arc<dyn Fn(&Decision, Option<&RequestContext>) + Send + Sync>;

/// The result of one admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// Identity key the request was charged to
    pub key: String,
    /// Whether the request may proceed
    pub admitted: bool,
    /// The policy quota
    pub limit: u64,
    /// Requests left in the window after this one
    pub remaining: u64,
    /// Requests charged in the window, this one included
    pub total_in_window: u64,
    /// Wall-clock time at which the window resets
    pub reset_at: DateTime<Utc>,
    window_start: Instant,
    window_end: Instant,
}

impl Decision {
    /// Time until the window resets.
    pub fn retry_after(&self) -> Duration {
        self.window_end.saturating_duration_since(Instant::now())
    }

    /// [`Decision::retry_after`] in whole seconds, rounded up.
    pub fn retry_after_secs(&self) -> u64 {
        let wait = self.retry_after();
        wait.as_secs() + u64::from(wait.subsec_nanos() > 0)
    }
}

/// Applies one admission policy against its own window store.
pub struct Limiter {
    policy: AdmissionPolicy,
    store: Arc<WindowStore>,
    on_reject: Option<RejectHook>,
    sweeper: Mutex<Option<SweeperHandle>>,
}

impl fmt::Debug for Limiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Limiter")
            .field("policy", &self.policy)
            .field("keys", &self.store.len())
            .field("sweeping", &self.sweeper.lock().is_some())
            .finish()
    }
}

impl Limiter {
    /// Create a limiter with a fresh store.
    pub fn new(policy: AdmissionPolicy) -> Result<Self> {
        policy.validate()?;
        Ok(Self {
            policy,
            store: Arc::new(WindowStore::new()),
            on_reject: None,
            sweeper: Mutex::new(None),
        })
    }

    /// Install an observer for rejected requests.
    pub fn with_reject_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Decision, Option<&RequestContext>) + Send + Sync + 'static,
    {
        self.on_reject = Some(Arc::new(hook));
        self
    }

    /// Charge `req` to its identity and decide whether it is admitted.
    pub fn check(&self, req: &RequestContext) -> Decision {
        let key = self.policy.extractor().extract(req);
        self.evaluate(key, Some(req))
    }

    /// Charge `key` directly, for callers that already know the identity.
    pub fn check_key(&self, key: &str) -> Decision {
        let key = if key.trim().is_empty() {
            format!("ip:{LOOPBACK_IDENTITY}")
        } else {
            key.to_string()
        };
        self.evaluate(key, None)
    }

    fn evaluate(&self, key: String, req: Option<&RequestContext>) -> Decision {
        // The charge happens before the decision, so a sustained flood
        // keeps counting instead of resetting itself.
        let record = self.store.increment(&key, self.policy.window());
        let limit = self.policy.quota();

        let decision = Decision {
            admitted: record.count <= limit,
            limit,
            remaining: limit.saturating_sub(record.count),
            total_in_window: record.count,
            reset_at: record.reset_at,
            window_start: record.window_start,
            window_end: record.window_end,
            key,
        };

        trace!(
            policy = %self.policy.name(),
            key = %decision.key,
            count = decision.total_in_window,
            limit,
            "Checked admission"
        );

        if !decision.admitted {
            debug!(
                policy = %self.policy.name(),
                key = %decision.key,
                count = decision.total_in_window,
                limit,
                "Admission rejected"
            );
            self.notify_rejected(&decision, req);
        }

        decision
    }

    fn notify_rejected(&self, decision: &Decision, req: Option<&RequestContext>) {
        if let Some(ref hook) = self.on_reject {
            if catch_unwind(AssertUnwindSafe(|| hook(decision, req))).is_err() {
                warn!(
                    policy = %self.policy.name(),
                    key = %decision.key,
                    "Rejection hook panicked"
                );
            }
        }
    }

    /// Settle an admitted request once its operation has finished.
    ///
    /// When the policy excludes `outcome` from the quota, the request's
    /// charge is taken back. Rejected requests keep their charge. Returns
    /// whether a charge was rolled back.
    pub fn settle(&self, decision: &Decision, outcome: Outcome) -> bool {
        if !decision.admitted || self.policy.counts(outcome) {
            return false;
        }

        let rolled_back = self.store.rollback(&decision.key, decision.window_start);
        debug!(
            policy = %self.policy.name(),
            key = %decision.key,
            outcome = ?outcome,
            rolled_back,
            "Settled admission charge"
        );
        rolled_back
    }

    /// Forget all charges for `key`.
    pub fn reset(&self, key: &str) -> bool {
        let removed = self.store.reset(key);
        info!(policy = %self.policy.name(), key = %key, removed, "Reset identity");
        removed
    }

    /// Snapshot of this limiter's store.
    pub fn stats(&self) -> StoreStats {
        self.store.stats()
    }

    /// The policy this limiter applies.
    pub fn policy(&self) -> &AdmissionPolicy {
        &self.policy
    }

    /// The backing store.
    pub fn store(&self) -> &WindowStore {
        &self.store
    }

    /// Start sweeping expired windows every `interval`, replacing any
    /// sweeper already running. Must be called from within a Tokio runtime.
    pub fn start_sweeper(&self, interval: Duration) {
        let handle = self.store.spawn_sweeper(interval);
        if let Some(previous) = self.sweeper.lock().replace(handle) {
            previous.stop();
        }
        info!(
            policy = %self.policy.name(),
            interval_secs = interval.as_secs(),
            "Started window sweeper"
        );
    }

    /// Stop the sweeper and drop every record.
    pub fn shutdown(&self) {
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.stop();
        }
        self.store.clear();
        info!(policy = %self.policy.name(), "Limiter shut down");
    }
}
