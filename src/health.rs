//! Store telemetry and health.
//!
//! A store that keeps growing past the threshold usually means the sweeper
//! isn't running or an extractor is minting unbounded keys.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::ratelimit::{OperationClass, PolicyRegistry, StoreStats};

/// Live keys above which a store is reported degraded.
pub const DEFAULT_DEGRADED_THRESHOLD: usize = 10_000;

/// Overall health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Live keys below the threshold
    Healthy,
    /// Live keys at or above the threshold
    Degraded,
}

/// Health snapshot for the admin surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// Overall status from the summed key count
    pub status: HealthStatus,
    /// Stats summed across every class
    pub stats: StoreStats,
    /// Live keys at which the status degrades
    pub threshold: usize,
    /// Per-class breakdown, keyed by class name
    pub classes: BTreeMap<OperationClass, StoreStats>,
    /// When the snapshot was taken
    pub timestamp: DateTime<Utc>,
}

/// Judges store stats against a key-count threshold.
#[derive(Debug, Clone, Copy)]
pub struct HealthReporter {
    threshold: usize,
}

impl Default for HealthReporter {
    fn default() -> Self {
        Self::new(DEFAULT_DEGRADED_THRESHOLD)
    }
}

impl HealthReporter {
    /// Create a reporter that degrades at `threshold` live keys.
    pub fn new(threshold: usize) -> Self {
        Self { threshold }
    }

    /// Healthy while the live key count is below the threshold.
    pub fn assess(&self, stats: &StoreStats) -> HealthStatus {
        if stats.total_keys < self.threshold {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        }
    }

    /// Snapshot every class in `registry`.
    pub fn report(&self, registry: &PolicyRegistry) -> HealthReport {
        let classes: BTreeMap<_, _> = registry
            .iter()
            .map(|(class, limiter)| (class, limiter.stats()))
            .collect();
        let stats = classes.values().fold(StoreStats::default(), |mut total, stats| {
            total += *stats;
            total
        });

        let status = self.assess(&stats);
        if status == HealthStatus::Degraded {
            warn!(
                total_keys = stats.total_keys,
                threshold = self.threshold,
                "Admission store size above threshold"
            );
        }

        HealthReport {
            status,
            stats,
            threshold: self.threshold,
            classes,
            timestamp: Utc::now(),
        }
    }
}
