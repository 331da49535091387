//! Controller Configuration
//!
//! Static parameters injected into the reconcilers at start-up. Loaded from
//! an optional YAML file; command-line flags override individual fields.

use crate::error::{Error, Result};
use crate::state::BackoffPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default topology label carrying the node's zone
pub const DEFAULT_TOPOLOGY_KEY: &str = "topology.kubernetes.io/zone";

/// Node allocatable resource advertising the attachable disk count
pub const DEFAULT_ATTACHABLE_VOLUMES_RESOURCE: &str = "attachable-volumes-azure-disk";

/// Configuration for the controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ControllerConfig {
    /// Failures after which an operation lands in its *Failed state
    pub max_retries: u32,

    /// Backoff after the first failure, in milliseconds
    pub backoff_base_ms: u64,

    /// Upper bound on backoff, in milliseconds
    pub backoff_cap_ms: u64,

    /// Deadline for every provisioner call, in seconds
    pub operation_timeout_secs: u64,

    /// Node label key used for zone matching
    pub topology_key: String,

    /// Slot count used when a node does not advertise one
    pub default_max_volumes_per_node: u32,

    /// Allocatable resource name holding a node's attachable volume limit
    pub attachable_volumes_resource: String,

    /// Size of the reconcile worker pool
    pub worker_count: usize,

    /// Promote replicas away from nodes whose Ready condition is not True
    pub failover_on_not_ready: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 300_000,
            operation_timeout_secs: 300,
            topology_key: DEFAULT_TOPOLOGY_KEY.to_string(),
            default_max_volumes_per_node: 8,
            attachable_volumes_resource: DEFAULT_ATTACHABLE_VOLUMES_RESOURCE.to_string(),
            worker_count: 10,
            failover_on_not_ready: true,
        }
    }
}

impl ControllerConfig {
    /// Parse a YAML document; missing fields keep their defaults
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: ControllerConfig = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&raw)
    }

    /// Reject settings the reconcilers cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(Error::Configuration("workerCount must be at least 1".into()));
        }
        if self.max_retries == 0 {
            return Err(Error::Configuration("maxRetries must be at least 1".into()));
        }
        if self.backoff_base_ms > self.backoff_cap_ms {
            return Err(Error::Configuration(format!(
                "backoffBaseMs ({}) exceeds backoffCapMs ({})",
                self.backoff_base_ms, self.backoff_cap_ms
            )));
        }
        if self.operation_timeout_secs == 0 {
            return Err(Error::Configuration(
                "operationTimeoutSecs must be positive".into(),
            ));
        }
        if self.topology_key.is_empty() {
            return Err(Error::Configuration("topologyKey must not be empty".into()));
        }
        Ok(())
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.backoff_base_ms),
            cap: Duration::from_millis(self.backoff_cap_ms),
            max_retries: self.max_retries,
        }
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = ControllerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.backoff_policy().max_retries, 5);
        assert_eq!(config.operation_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = ControllerConfig::from_yaml_str("maxRetries: 3\nworkerCount: 2\n").unwrap();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.worker_count, 2);
        assert_eq!(config.topology_key, DEFAULT_TOPOLOGY_KEY);
    }

    #[test]
    fn test_invalid_settings_rejected() {
        assert_matches!(
            ControllerConfig::from_yaml_str("workerCount: 0"),
            Err(Error::Configuration(_))
        );
        assert_matches!(
            ControllerConfig::from_yaml_str("backoffBaseMs: 10\nbackoffCapMs: 5"),
            Err(Error::Configuration(_))
        );
        assert_matches!(
            ControllerConfig::from_yaml_str("maxRetries: [1]"),
            Err(Error::YamlParse(_))
        );
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "defaultMaxVolumesPerNode: 16").unwrap();
        writeln!(file, "failoverOnNotReady: false").unwrap();

        let config = ControllerConfig::from_yaml_file(file.path()).unwrap();
        assert_eq!(config.default_max_volumes_per_node, 16);
        assert!(!config.failover_on_not_ready);
    }
}
