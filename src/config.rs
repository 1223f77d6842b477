//! Configuration management for Turnstile.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, TurnstileError};
use crate::health::DEFAULT_DEGRADED_THRESHOLD;
use crate::ratelimit::{OperationClass, PolicyRule, DEFAULT_SWEEP_INTERVAL};

/// Prefix for environment overrides, e.g. `TURNSTILE__STORE__SWEEP_INTERVAL_SECS`.
const ENV_PREFIX: &str = "TURNSTILE";
const ENV_SEPARATOR: &str = "__";

/// Main configuration for Turnstile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Window store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Health reporting configuration
    #[serde(default)]
    pub health: HealthConfig,

    /// Per-class overrides of the built-in policies
    #[serde(default)]
    pub policies: HashMap<OperationClass, PolicyRule>,
}

/// Window store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Seconds between sweeps of expired windows
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl StoreConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn default_sweep_interval() -> u64 {
    DEFAULT_SWEEP_INTERVAL.as_secs()
}

/// Health reporting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Live keys at which health degrades
    #[serde(default = "default_degraded_threshold")]
    pub degraded_threshold: usize,

    /// Seconds between logged health reports
    #[serde(default = "default_report_interval")]
    pub report_interval_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            degraded_threshold: default_degraded_threshold(),
            report_interval_secs: default_report_interval(),
        }
    }
}

impl HealthConfig {
    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }
}

fn default_degraded_threshold() -> usize {
    DEFAULT_DEGRADED_THRESHOLD
}

fn default_report_interval() -> u64 {
    60
}

impl TurnstileConfig {
    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from an optional file, then apply
    /// `TURNSTILE__*` environment overrides on top.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(config::File::from(path));
        }

        let config: TurnstileConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.store.sweep_interval_secs == 0 {
            return Err(TurnstileError::Config(
                "store.sweep_interval_secs must be positive".to_string(),
            ));
        }
        if self.health.report_interval_secs == 0 {
            return Err(TurnstileError::Config(
                "health.report_interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TurnstileConfig::default();

        assert_eq!(config.store.sweep_interval(), Duration::from_secs(300));
        assert_eq!(config.health.degraded_threshold, DEFAULT_DEGRADED_THRESHOLD);
        assert_eq!(config.health.report_interval(), Duration::from_secs(60));
        assert!(config.policies.is_empty());
        tokio_test::assert_ok!(config.validate());
    }

    #[test]
    fn test_parse_partial_yaml() {
        let yaml = r#"
store:
  sweep_interval_secs: 30
policies:
  auth:
    quota: 3
    window_secs: 600
  export:
    extractor:
      kind: resource
      marker: /exports/
"#;
        let config = TurnstileConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.store.sweep_interval_secs, 30);
        assert_eq!(config.health.degraded_threshold, DEFAULT_DEGRADED_THRESHOLD);
        assert_eq!(config.policies[&OperationClass::Auth].quota, Some(3));
        assert_eq!(config.policies[&OperationClass::Auth].window_secs, Some(600));
        assert!(config.policies[&OperationClass::Export].extractor.is_some());
    }

    #[test]
    fn test_parse_empty_yaml() {
        let config = TurnstileConfig::from_yaml("{}").unwrap();
        assert_eq!(config.store.sweep_interval_secs, 300);
    }

    #[test]
    fn test_zero_sweep_interval_rejected() {
        tokio_test::assert_err!(TurnstileConfig::from_yaml("store:\n  sweep_interval_secs: 0\n"));
    }

    #[test]
    fn test_unknown_class_rejected() {
        tokio_test::assert_err!(TurnstileConfig::from_yaml("policies:\n  billing:\n    quota: 1\n"));
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("turnstile-config-{}.yaml", std::process::id()));
        std::fs::write(
            &path,
            "health:\n  degraded_threshold: 250\npolicies:\n  upload:\n    quota: 4\n",
        )
        .unwrap();

        let loaded = TurnstileConfig::load(Some(path.as_path()));
        std::fs::remove_file(&path).unwrap();

        let config = loaded.unwrap();
        assert_eq!(config.health.degraded_threshold, 250);
        assert_eq!(config.policies[&OperationClass::Upload].quota, Some(4));

        let from_file = TurnstileConfig::from_file(std::env::temp_dir().join("turnstile-missing.yaml"));
        assert!(matches!(from_file, Err(TurnstileError::Io(_))));
    }
}
