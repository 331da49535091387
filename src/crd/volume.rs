//! DiskVolume CRD
//!
//! Tracks a logical network-attached block volume: what was requested, what
//! the provider allocated, and where the volume is in its lifecycle.

use super::common::{CapacityRange, ContentVolumeSource, ResourceError, Topology, TopologyRequirement, VolumeCapability};
use super::intent::Intent;
use super::{API_VERSION_ANNOTATION, CURRENT_API_VERSION, VOLUME_FINALIZER};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// DiskVolume CRD
// =============================================================================

/// DiskVolume is the controller's record of one provisioned disk.
/// It is mutated only by the volume reconciler once created.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "disk.replicated.io",
    version = "v1beta2",
    kind = "DiskVolume",
    plural = "diskvolumes",
    shortname = "dv",
    status = "DiskVolumeStatus",
    printcolumn = r#"{"name": "Capacity", "type": "integer", "jsonPath": ".spec.capacityRange.requiredBytes"}"#,
    printcolumn = r#"{"name": "Replicas", "type": "integer", "jsonPath": ".spec.maxMountReplicaCount"}"#,
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.state"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct DiskVolumeSpec {
    /// Name of the disk at the provider
    pub volume_name: String,

    /// Requested size bounds
    #[serde(default)]
    pub capacity_range: CapacityRange,

    /// Capabilities the disk must support
    #[serde(default)]
    pub volume_capability: Vec<VolumeCapability>,

    /// Opaque provider parameters
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,

    /// Opaque provider secrets
    #[serde(default)]
    pub secrets: BTreeMap<String, String>,

    /// Clone or snapshot origin, immutable once set
    #[serde(default)]
    pub content_volume_source: Option<ContentVolumeSource>,

    /// Zones the disk and its attachments must live in
    #[serde(default)]
    pub accessibility_requirements: Option<TopologyRequirement>,

    /// Number of standby replica attachments to keep (maxShares - 1)
    #[serde(default)]
    pub max_mount_replica_count: u32,

    /// PersistentVolume this disk backs, if any
    #[serde(default)]
    pub persistent_volume: Option<String>,
}

// =============================================================================
// Status
// =============================================================================

/// Volume lifecycle state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum VolumeState {
    #[default]
    Pending,
    Creating,
    Created,
    CreationFailed,
    Updating,
    UpdateFailed,
    Deleting,
    DeletionFailed,
}

impl VolumeState {
    /// States only ever held while an operation is in flight
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            VolumeState::Creating | VolumeState::Updating | VolumeState::Deleting
        )
    }

    /// Failed states that are not retried automatically
    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            VolumeState::CreationFailed | VolumeState::UpdateFailed | VolumeState::DeletionFailed
        )
    }

    /// Stable state a crashed transient operation resumes from
    pub fn recovery_target(&self) -> VolumeState {
        match self {
            VolumeState::Creating => VolumeState::Pending,
            VolumeState::Updating | VolumeState::Deleting => VolumeState::Created,
            other => *other,
        }
    }
}

impl std::fmt::Display for VolumeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VolumeState::Pending => write!(f, "Pending"),
            VolumeState::Creating => write!(f, "Creating"),
            VolumeState::Created => write!(f, "Created"),
            VolumeState::CreationFailed => write!(f, "CreationFailed"),
            VolumeState::Updating => write!(f, "Updating"),
            VolumeState::UpdateFailed => write!(f, "UpdateFailed"),
            VolumeState::Deleting => write!(f, "Deleting"),
            VolumeState::DeletionFailed => write!(f, "DeletionFailed"),
        }
    }
}

/// What the provider reported for the disk
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeStatusDetail {
    /// Provider ID, never changes once assigned
    pub volume_id: String,

    #[serde(default)]
    pub capacity_bytes: i64,

    #[serde(default)]
    pub volume_context: BTreeMap<String, String>,

    #[serde(default)]
    pub content_source: Option<ContentVolumeSource>,

    #[serde(default)]
    pub accessible_topology: Vec<Topology>,
}

/// Status of the DiskVolume
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DiskVolumeStatus {
    #[serde(default)]
    pub state: VolumeState,

    #[serde(default)]
    pub detail: Option<VolumeStatusDetail>,

    #[serde(default)]
    pub error: Option<ResourceError>,

    /// Wire encoding of the typed intents
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

// =============================================================================
// Implementations
// =============================================================================

impl DiskVolume {
    /// A new record stamped with the current schema version and our finalizer
    pub fn build(name: &str, spec: DiskVolumeSpec) -> Self {
        let mut volume = DiskVolume::new(name, spec);
        volume
            .annotations_mut()
            .insert(API_VERSION_ANNOTATION.to_string(), CURRENT_API_VERSION.to_string());
        volume.add_finalizer();
        volume
    }

    /// Current lifecycle state
    pub fn state(&self) -> VolumeState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }

    /// Provider ID, if the disk has been created
    pub fn volume_id(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.detail.as_ref())
            .map(|d| d.volume_id.as_str())
            .filter(|id| !id.is_empty())
    }

    /// Capacity the provider reported
    pub fn status_capacity_bytes(&self) -> i64 {
        self.status
            .as_ref()
            .and_then(|s| s.detail.as_ref())
            .map(|d| d.capacity_bytes)
            .unwrap_or(0)
    }

    /// Status, created on first access
    pub fn status_mut(&mut self) -> &mut DiskVolumeStatus {
        self.status.get_or_insert_with(DiskVolumeStatus::default)
    }

    /// Status annotations, empty when there is no status yet
    pub fn status_annotations(&self) -> BTreeMap<String, String> {
        self.status
            .as_ref()
            .map(|s| s.annotations.clone())
            .unwrap_or_default()
    }

    /// Declared inline in a pod spec rather than provisioned by us.
    ///
    /// The marker is written to metadata at creation and to status
    /// annotations once the volume is recorded as created.
    pub fn is_inline(&self) -> bool {
        let key = Intent::InlineVolume.key();
        self.annotations().contains_key(key) || self.status_annotations().contains_key(key)
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .map(|f| f.iter().any(|x| x == VOLUME_FINALIZER))
            .unwrap_or(false)
    }

    /// Returns true if the finalizer was added
    pub fn add_finalizer(&mut self) -> bool {
        if self.has_finalizer() {
            return false;
        }
        self.metadata
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(VOLUME_FINALIZER.to_string());
        true
    }

    /// Returns true if the finalizer was removed
    pub fn remove_finalizer(&mut self) -> bool {
        match self.metadata.finalizers.as_mut() {
            Some(finalizers) => {
                let before = finalizers.len();
                finalizers.retain(|f| f != VOLUME_FINALIZER);
                before != finalizers.len()
            }
            None => false,
        }
    }

    /// More space is requested than the provider reported
    pub fn needs_expansion(&self) -> bool {
        self.volume_id().is_some()
            && self.spec.capacity_range.required_bytes > self.status_capacity_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volume() -> DiskVolume {
        DiskVolume::new(
            "vol-a",
            DiskVolumeSpec {
                volume_name: "vol-a".into(),
                capacity_range: CapacityRange::new(10),
                volume_capability: vec![VolumeCapability::default()],
                parameters: BTreeMap::new(),
                secrets: BTreeMap::new(),
                content_volume_source: None,
                accessibility_requirements: None,
                max_mount_replica_count: 1,
                persistent_volume: None,
            },
        )
    }

    #[test]
    fn test_finalizer_helpers() {
        let mut vol = volume();
        assert!(!vol.has_finalizer());
        assert!(vol.add_finalizer());
        assert!(!vol.add_finalizer());
        assert!(vol.has_finalizer());
        assert!(vol.remove_finalizer());
        assert!(!vol.has_finalizer());
    }

    #[test]
    fn test_needs_expansion() {
        let mut vol = volume();
        assert!(!vol.needs_expansion());

        vol.status_mut().detail = Some(VolumeStatusDetail {
            volume_id: "disk-1".into(),
            capacity_bytes: 10,
            ..Default::default()
        });
        assert!(!vol.needs_expansion());

        vol.spec.capacity_range.required_bytes = 20;
        assert!(vol.needs_expansion());
    }

    #[test]
    fn test_inline_marker() {
        let mut vol = volume();
        assert!(!vol.is_inline());
        vol.metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(Intent::InlineVolume.key().to_string(), "default/web-0".into());
        assert!(vol.is_inline());
    }

    #[test]
    fn test_recovery_targets() {
        assert_eq!(VolumeState::Creating.recovery_target(), VolumeState::Pending);
        assert_eq!(VolumeState::Updating.recovery_target(), VolumeState::Created);
        assert_eq!(VolumeState::Deleting.recovery_target(), VolumeState::Created);
        assert_eq!(VolumeState::Created.recovery_target(), VolumeState::Created);
        assert!(VolumeState::Creating.is_transient());
        assert!(!VolumeState::CreationFailed.is_transient());
    }
}
