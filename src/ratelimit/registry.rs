//! The fixed table of policies, one per operation class.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::identity::IdentityExtractor;
use super::limiter::Limiter;
use super::policy::{AdmissionPolicy, PolicyRule};
use super::store::StoreStats;
use crate::error::Result;

const MINUTE: Duration = Duration::from_secs(60);

/// Classes of protected operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationClass {
    /// Login and credential checks
    Auth,
    /// General authenticated API traffic
    Api,
    /// Anonymous public submissions such as contact forms
    PublicSubmission,
    /// File uploads
    Upload,
    /// Report and data exports
    Export,
    /// Administrative operations
    Admin,
}

impl OperationClass {
    /// Every class, in registry order.
    pub const ALL: [OperationClass; 6] = [
        OperationClass::Auth,
        OperationClass::Api,
        OperationClass::PublicSubmission,
        OperationClass::Upload,
        OperationClass::Export,
        OperationClass::Admin,
    ];

    /// Stable name used in logs, reports and configuration.
    pub fn name(&self) -> &'static str {
        match self {
            OperationClass::Auth => "auth",
            OperationClass::Api => "api",
            OperationClass::PublicSubmission => "public_submission",
            OperationClass::Upload => "upload",
            OperationClass::Export => "export",
            OperationClass::Admin => "admin",
        }
    }

    /// The built-in policy for this class.
    pub fn default_policy(&self) -> AdmissionPolicy {
        let name = self.name();
        match self {
            // Failed attempts do not consume quota.
            OperationClass::Auth => AdmissionPolicy::new(name, 15 * MINUTE, 5)
                .with_message("Too many authentication attempts, please try again later.")
                .count_failed(false),
            OperationClass::Api => AdmissionPolicy::new(name, MINUTE, 100)
                .with_extractor(IdentityExtractor::Subject),
            OperationClass::PublicSubmission => AdmissionPolicy::new(name, MINUTE, 5)
                .with_message("Too many submissions, please try again later."),
            OperationClass::Upload => AdmissionPolicy::new(name, MINUTE, 10)
                .with_message("Too many uploads, please try again later.")
                .with_extractor(IdentityExtractor::Subject),
            OperationClass::Export => AdmissionPolicy::new(name, 60 * MINUTE, 3)
                .with_message("Export limit reached, please try again later.")
                .with_extractor(IdentityExtractor::resource("/reports/")),
            OperationClass::Admin => AdmissionPolicy::new(name, MINUTE, 500)
                .with_extractor(IdentityExtractor::Subject),
        }
    }
}

impl fmt::Display for OperationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One limiter per operation class, each with its own store.
#[derive(Debug)]
pub struct PolicyRegistry {
    limiters: Vec<(OperationClass, Arc<Limiter>)>,
}

impl PolicyRegistry {
    /// Build the registry from the built-in policies.
    pub fn new() -> Result<Self> {
        Self::with_overrides(&HashMap::new())
    }

    /// Build the registry, applying `overrides` on top of the built-in
    /// policies.
    pub fn with_overrides(overrides: &HashMap<OperationClass, PolicyRule>) -> Result<Self> {
        let limiters = OperationClass::ALL
            .iter()
            .map(|&class| {
                let policy = match overrides.get(&class) {
                    Some(rule) => class.default_policy().apply(rule),
                    None => class.default_policy(),
                };
                info!(
                    class = %class,
                    window_secs = policy.window().as_secs(),
                    quota = policy.quota(),
                    extractor = ?policy.extractor(),
                    "Registered admission policy"
                );
                Ok((class, Arc::new(Limiter::new(policy)?)))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { limiters })
    }

    /// The limiter for `class`.
    pub fn limiter(&self, class: OperationClass) -> &Arc<Limiter> {
        // `limiters` is built from `ALL`, whose order matches the
        // declaration order of the variants.
        &self.limiters[class as usize].1
    }

    /// Every class with its limiter.
    pub fn iter(&self) -> impl Iterator<Item = (OperationClass, &Arc<Limiter>)> {
        self.limiters.iter().map(|(class, limiter)| (*class, limiter))
    }

    /// Administrative unblock of `key` under `class`.
    pub fn reset(&self, class: OperationClass, key: &str) -> bool {
        self.limiter(class).reset(key)
    }

    /// Stats summed across every class.
    pub fn stats(&self) -> StoreStats {
        self.iter().fold(StoreStats::default(), |mut total, (_, limiter)| {
            total += limiter.stats();
            total
        })
    }

    /// Start every limiter's sweeper. Must be called from within a Tokio
    /// runtime.
    pub fn start_sweepers(&self, interval: Duration) {
        for (_, limiter) in self.iter() {
            limiter.start_sweeper(interval);
        }
    }

    /// Stop every sweeper and drop all counting state.
    pub fn shutdown(&self) {
        for (_, limiter) in self.iter() {
            limiter.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{Outcome, RequestContext};

    #[test]
    fn test_class_order_matches_discriminants() {
        for (index, class) in OperationClass::ALL.iter().enumerate() {
            assert_eq!(*class as usize, index);
        }
    }

    #[test]
    fn test_default_policies_are_valid() {
        for class in OperationClass::ALL {
            let policy = class.default_policy();
            tokio_test::assert_ok!(policy.validate());
            assert_eq!(policy.name(), class.name());
        }
    }

    #[test]
    fn test_default_policy_shapes() {
        let auth = OperationClass::Auth.default_policy();
        assert!(!auth.counts(Outcome::Failed));
        assert!(auth.counts(Outcome::Succeeded));
        assert_eq!(auth.extractor(), &IdentityExtractor::Address);

        let export = OperationClass::Export.default_policy();
        let api = OperationClass::Api.default_policy();
        assert!(export.window() > api.window());
        assert!(export.quota() < api.quota());
        assert!(matches!(export.extractor(), IdentityExtractor::Resource { .. }));

        let admin = OperationClass::Admin.default_policy();
        assert!(admin.quota() > api.quota());
        assert_eq!(admin.extractor(), &IdentityExtractor::Subject);

        assert_eq!(
            OperationClass::PublicSubmission.default_policy().extractor(),
            &IdentityExtractor::Address
        );
    }

    #[test]
    fn test_registry_lookup() {
        let registry = PolicyRegistry::new().unwrap();

        for class in OperationClass::ALL {
            assert_eq!(registry.limiter(class).policy().name(), class.name());
        }
        assert_eq!(registry.iter().count(), OperationClass::ALL.len());
    }

    #[test]
    fn test_overrides_apply_to_named_class_only() {
        let mut overrides = HashMap::new();
        overrides.insert(
            OperationClass::Upload,
            PolicyRule {
                quota: Some(2),
                ..PolicyRule::default()
            },
        );

        let registry = PolicyRegistry::with_overrides(&overrides).unwrap();

        assert_eq!(registry.limiter(OperationClass::Upload).policy().quota(), 2);
        assert_eq!(
            registry.limiter(OperationClass::Api).policy().quota(),
            OperationClass::Api.default_policy().quota()
        );
    }

    #[test]
    fn test_invalid_override_fails_build() {
        let mut overrides = HashMap::new();
        overrides.insert(
            OperationClass::Export,
            PolicyRule {
                quota: Some(0),
                ..PolicyRule::default()
            },
        );

        tokio_test::assert_err!(PolicyRegistry::with_overrides(&overrides));
    }

    #[test]
    fn test_classes_do_not_share_quota() {
        let registry = PolicyRegistry::new().unwrap();
        let req = RequestContext::new("/login").with_header("x-forwarded-for", "10.0.0.1");

        for _ in 0..5 {
            assert!(registry.limiter(OperationClass::Auth).check(&req).admitted);
        }
        assert!(!registry.limiter(OperationClass::Auth).check(&req).admitted);
        assert!(registry
            .limiter(OperationClass::PublicSubmission)
            .check(&req)
            .admitted);
    }

    #[test]
    fn test_aggregate_stats_and_reset() {
        let registry = PolicyRegistry::new().unwrap();
        registry.limiter(OperationClass::Api).check_key("user:a");
        registry.limiter(OperationClass::Api).check_key("user:a");
        registry.limiter(OperationClass::Upload).check_key("user:b");

        let stats = registry.stats();
        assert_eq!(stats.total_keys, 2);
        assert_eq!(stats.total_requests, 3);

        assert!(registry.reset(OperationClass::Api, "user:a"));
        assert!(!registry.reset(OperationClass::Api, "user:b"));
        assert_eq!(registry.stats().total_keys, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_clears_everything() {
        let registry = PolicyRegistry::new().unwrap();
        registry.start_sweepers(Duration::from_secs(300));
        registry.limiter(OperationClass::Admin).check_key("user:root");

        registry.shutdown();

        assert_eq!(registry.stats(), StoreStats::default());
    }
}
