//! Value types shared by the DiskVolume and DiskVolumeAttachment resources
//!
//! Capacity ranges, access capabilities, topology requirements and the
//! structured error record written to resource status.

use crate::error::Error;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Capacity
// =============================================================================

/// Requested size bounds for a volume
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CapacityRange {
    /// Minimum size the volume must have
    #[serde(default)]
    pub required_bytes: i64,

    /// Maximum size the volume may have (0 = unbounded)
    #[serde(default)]
    pub limit_bytes: i64,
}

impl CapacityRange {
    pub fn new(required_bytes: i64) -> Self {
        Self {
            required_bytes,
            limit_bytes: 0,
        }
    }

    /// Check the range is internally consistent
    pub fn validate(&self) -> Result<(), Error> {
        if self.required_bytes < 0 || self.limit_bytes < 0 {
            return Err(Error::InvalidArgument(format!(
                "capacity range must not be negative: required={}, limit={}",
                self.required_bytes, self.limit_bytes
            )));
        }
        if self.required_bytes == 0 && self.limit_bytes == 0 {
            return Err(Error::InvalidArgument(
                "capacity range must request a size".into(),
            ));
        }
        if self.limit_bytes > 0 && self.limit_bytes < self.required_bytes {
            return Err(Error::InvalidArgument(format!(
                "limit {} is smaller than required {}",
                self.limit_bytes, self.required_bytes
            )));
        }
        Ok(())
    }

    /// Size the provider should allocate for this range
    pub fn target_bytes(&self) -> i64 {
        if self.required_bytes > 0 {
            self.required_bytes
        } else {
            self.limit_bytes
        }
    }
}

// =============================================================================
// Capabilities
// =============================================================================

/// How a volume is exposed to the workload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum AccessType {
    Block,
    #[default]
    Mount,
}

/// Node/writer multiplicity a volume must support
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum AccessMode {
    #[default]
    SingleNodeWriter,
    SingleNodeReaderOnly,
    MultiNodeReaderOnly,
    MultiNodeSingleWriter,
    MultiNodeMultiWriter,
}

impl std::fmt::Display for AccessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessMode::SingleNodeWriter => write!(f, "single-node-writer"),
            AccessMode::SingleNodeReaderOnly => write!(f, "single-node-reader-only"),
            AccessMode::MultiNodeReaderOnly => write!(f, "multi-node-reader-only"),
            AccessMode::MultiNodeSingleWriter => write!(f, "multi-node-single-writer"),
            AccessMode::MultiNodeMultiWriter => write!(f, "multi-node-multi-writer"),
        }
    }
}

/// A capability the volume must satisfy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeCapability {
    #[serde(default)]
    pub access_type: AccessType,

    #[serde(default)]
    pub access_mode: AccessMode,

    /// Filesystem for mount access
    #[serde(default)]
    pub fs_type: Option<String>,

    #[serde(default)]
    pub mount_flags: Vec<String>,
}

// =============================================================================
// Content Source
// =============================================================================

/// Kind of object a volume is cloned from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ContentSourceKind {
    Snapshot,
    Volume,
}

/// Origin of a volume's initial content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContentVolumeSource {
    pub content_source: ContentSourceKind,
    pub content_source_id: String,
}

// =============================================================================
// Topology
// =============================================================================

/// A set of topology segments, e.g. `topology.kubernetes.io/zone=eastus-1`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Topology {
    #[serde(default)]
    pub segments: BTreeMap<String, String>,
}

impl Topology {
    pub fn zone(key: &str, zone: &str) -> Self {
        let mut segments = BTreeMap::new();
        segments.insert(key.to_string(), zone.to_string());
        Self { segments }
    }

    /// All segments are present with equal values in `labels`
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.segments
            .iter()
            .all(|(key, value)| labels.get(key) == Some(value))
    }
}

/// Where attachments of a volume are allowed to land
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TopologyRequirement {
    /// Hard constraint: one of these must match
    #[serde(default)]
    pub requisite: Vec<Topology>,

    /// Soft preference, used as the constraint when no requisite is given
    #[serde(default)]
    pub preferred: Vec<Topology>,
}

impl TopologyRequirement {
    /// Check whether a node carrying `labels` satisfies the requirement
    pub fn admits(&self, labels: &BTreeMap<String, String>) -> bool {
        let candidates = if self.requisite.is_empty() {
            &self.preferred
        } else {
            &self.requisite
        };
        candidates.is_empty() || candidates.iter().any(|t| t.matches(labels))
    }
}

// =============================================================================
// Structured Error
// =============================================================================

/// Error record stored verbatim on resource status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceError {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub retryable: bool,
}

impl ResourceError {
    /// Build the status record for an error hit while reconciling `resource`
    pub fn from_error(err: &Error, resource: &str) -> Self {
        let mut parameters = BTreeMap::new();
        parameters.insert("resource".to_string(), resource.to_string());
        if let Error::Provisioner { operation, .. } = err {
            parameters.insert("operation".to_string(), operation.clone());
        }
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            parameters,
            retryable: err.is_retryable(),
        }
    }
}
