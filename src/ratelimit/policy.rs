//! Admission policies.
//!
//! A policy is fixed at construction: window, quota, rejection message,
//! which downstream outcomes count against the quota, and how requests are
//! keyed. [`PolicyRule`] is its configuration-file form, applied on top of
//! a built-in default.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::identity::IdentityExtractor;
use crate::error::{Result, TurnstileError};

/// Message returned to rejected callers unless a policy sets its own.
pub const DEFAULT_REJECTION_MESSAGE: &str = "Too many requests, please try again later.";

/// Longest window a policy may use.
pub const MAX_WINDOW: Duration = Duration::from_secs(366 * 24 * 60 * 60);

/// How a protected operation finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The operation returned a value
    Succeeded,
    /// The operation returned an error, was cancelled, or timed out
    Failed,
}

/// An immutable admission policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionPolicy {
    name: String,
    window: Duration,
    quota: u64,
    message: String,
    count_successful: bool,
    count_failed: bool,
    extractor: IdentityExtractor,
}

impl AdmissionPolicy {
    /// Create a policy admitting `quota` requests per `window` per client
    /// address. Both outcomes count against the quota.
    pub fn new(name: impl Into<String>, window: Duration, quota: u64) -> Self {
        Self {
            name: name.into(),
            window,
            quota,
            message: DEFAULT_REJECTION_MESSAGE.to_string(),
            count_successful: true,
            count_failed: true,
            extractor: IdentityExtractor::Address,
        }
    }

    /// Set the message returned to rejected callers.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Set how requests are keyed.
    pub fn with_extractor(mut self, extractor: IdentityExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    /// Whether successful operations keep their charge.
    pub fn count_successful(mut self, count: bool) -> Self {
        self.count_successful = count;
        self
    }

    /// Whether failed operations keep their charge.
    pub fn count_failed(mut self, count: bool) -> Self {
        self.count_failed = count;
        self
    }

    /// Return a copy with every field set in `rule` overridden.
    pub fn apply(&self, rule: &PolicyRule) -> Self {
        let mut policy = self.clone();
        if let Some(secs) = rule.window_secs {
            policy.window = Duration::from_secs(secs);
        }
        if let Some(quota) = rule.quota {
            policy.quota = quota;
        }
        if let Some(ref message) = rule.message {
            policy.message = message.clone();
        }
        if let Some(count) = rule.count_successful {
            policy.count_successful = count;
        }
        if let Some(count) = rule.count_failed {
            policy.count_failed = count;
        }
        if let Some(ref extractor) = rule.extractor {
            policy.extractor = extractor.clone();
        }
        policy
    }

    /// Reject policies that could never admit a request or never expire.
    pub fn validate(&self) -> Result<()> {
        if self.quota == 0 {
            return Err(TurnstileError::InvalidPolicy(format!(
                "{}: quota must be positive",
                self.name
            )));
        }
        if self.window.is_zero() {
            return Err(TurnstileError::InvalidPolicy(format!(
                "{}: window must be positive",
                self.name
            )));
        }
        if self.window > MAX_WINDOW {
            return Err(TurnstileError::InvalidPolicy(format!(
                "{}: window of {}s exceeds the maximum of {}s",
                self.name,
                self.window.as_secs(),
                MAX_WINDOW.as_secs()
            )));
        }
        if let IdentityExtractor::Resource { ref marker } = self.extractor {
            if marker.is_empty() {
                return Err(TurnstileError::InvalidPolicy(format!(
                    "{}: resource extractor needs a path marker",
                    self.name
                )));
            }
        }
        Ok(())
    }

    /// Whether a request that ended with `outcome` keeps its charge.
    pub fn counts(&self, outcome: Outcome) -> bool {
        match outcome {
            Outcome::Succeeded => self.count_successful,
            Outcome::Failed => self.count_failed,
        }
    }

    /// Policy name, used in logs and reports.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Window length.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Admitted requests per window per key.
    pub fn quota(&self) -> u64 {
        self.quota
    }

    /// Message returned to rejected callers.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Identity extractor for this policy.
    pub fn extractor(&self) -> &IdentityExtractor {
        &self.extractor
    }
}

/// Configuration-file overrides for a policy. Unset fields keep the
/// default's value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Window length in seconds
    #[serde(default)]
    pub window_secs: Option<u64>,
    /// Admitted requests per window per key
    #[serde(default)]
    pub quota: Option<u64>,
    /// Rejection message
    #[serde(default)]
    pub message: Option<String>,
    /// Whether successful operations keep their charge
    #[serde(default)]
    pub count_successful: Option<bool>,
    /// Whether failed operations keep their charge
    #[serde(default)]
    pub count_failed: Option<bool>,
    /// How requests are keyed
    #[serde(default)]
    pub extractor: Option<IdentityExtractor>,
}
