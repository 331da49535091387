//! DiskVolumeAttachment CRD
//!
//! Binds one DiskVolume to one node with a role. The primary attachment
//! serves I/O; replicas are pre-attached standbys for fast failover.

use super::common::ResourceError;
use super::{
    API_VERSION_ANNOTATION, ATTACHMENT_FINALIZER, CURRENT_API_VERSION, NODE_NAME_LABEL, ROLE_LABEL,
    VOLUME_NAME_LABEL,
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Publish-context key carrying the device slot on the node
pub const LUN_KEY: &str = "LUN";

// =============================================================================
// DiskVolumeAttachment CRD
// =============================================================================

/// DiskVolumeAttachment records that a volume should be (or is) attached to a node.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "disk.replicated.io",
    version = "v1beta2",
    kind = "DiskVolumeAttachment",
    plural = "diskvolumeattachments",
    shortname = "dva",
    status = "DiskVolumeAttachmentStatus",
    printcolumn = r#"{"name": "Volume", "type": "string", "jsonPath": ".spec.volumeName"}"#,
    printcolumn = r#"{"name": "Node", "type": "string", "jsonPath": ".spec.nodeName"}"#,
    printcolumn = r#"{"name": "Role", "type": "string", "jsonPath": ".spec.role"}"#,
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.state"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct DiskVolumeAttachmentSpec {
    /// DiskVolume this attachment belongs to
    pub volume_name: String,

    /// Provider ID of the disk
    pub volume_id: String,

    /// Node the disk is attached to
    pub node_name: String,

    /// Desired role
    pub role: AttachmentRole,

    /// Volume context passed through to the node
    #[serde(default)]
    pub volume_context: BTreeMap<String, String>,
}

// =============================================================================
// Sub-Types
// =============================================================================

/// Role of an attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum AttachmentRole {
    Primary,
    Replica,
}

impl std::fmt::Display for AttachmentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttachmentRole::Primary => write!(f, "Primary"),
            AttachmentRole::Replica => write!(f, "Replica"),
        }
    }
}

/// Attachment lifecycle state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum AttachmentState {
    #[default]
    Pending,
    Attaching,
    Attached,
    AttachFailed,
    Detaching,
    Detached,
    DetachFailed,
}

impl AttachmentState {
    pub fn is_transient(&self) -> bool {
        matches!(self, AttachmentState::Attaching | AttachmentState::Detaching)
    }

    /// Stable state a crashed transient operation resumes from
    pub fn recovery_target(&self) -> AttachmentState {
        match self {
            AttachmentState::Attaching => AttachmentState::Pending,
            AttachmentState::Detaching => AttachmentState::Attached,
            other => *other,
        }
    }

    /// Whether the attachment holds a slot on its node.
    ///
    /// A slot is reserved when attaching starts and given back once the
    /// attach fails or the detach completes.
    pub fn occupies_slot(&self) -> bool {
        matches!(
            self,
            AttachmentState::Attaching
                | AttachmentState::Attached
                | AttachmentState::Detaching
                | AttachmentState::DetachFailed
        )
    }
}

impl std::fmt::Display for AttachmentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttachmentState::Pending => write!(f, "Pending"),
            AttachmentState::Attaching => write!(f, "Attaching"),
            AttachmentState::Attached => write!(f, "Attached"),
            AttachmentState::AttachFailed => write!(f, "AttachFailed"),
            AttachmentState::Detaching => write!(f, "Detaching"),
            AttachmentState::Detached => write!(f, "Detached"),
            AttachmentState::DetachFailed => write!(f, "DetachFailed"),
        }
    }
}

/// Observed attachment details
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentStatusDetail {
    /// Role currently in effect
    pub role: Option<AttachmentRole>,

    #[serde(default)]
    pub previous_role: Option<AttachmentRole>,

    /// Provider publish context (device slot etc.)
    #[serde(default)]
    pub publish_context: BTreeMap<String, String>,
}

/// Status of the DiskVolumeAttachment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DiskVolumeAttachmentStatus {
    #[serde(default)]
    pub state: AttachmentState,

    #[serde(default)]
    pub detail: Option<AttachmentStatusDetail>,

    #[serde(default)]
    pub error: Option<ResourceError>,

    /// Wire encoding of the typed intents
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

// =============================================================================
// Implementations
// =============================================================================

/// Deterministic attachment name for a volume/node pair
pub fn attachment_name(volume_name: &str, node_name: &str) -> String {
    format!("{}-{}-attachment", volume_name, node_name).to_lowercase()
}

impl DiskVolumeAttachment {
    /// Build a fresh attachment record carrying the lookup labels and finalizer
    pub fn for_volume(
        volume_name: &str,
        volume_id: &str,
        node_name: &str,
        role: AttachmentRole,
        volume_context: BTreeMap<String, String>,
    ) -> Self {
        let mut attachment = DiskVolumeAttachment::new(
            &attachment_name(volume_name, node_name),
            DiskVolumeAttachmentSpec {
                volume_name: volume_name.to_string(),
                volume_id: volume_id.to_string(),
                node_name: node_name.to_string(),
                role,
                volume_context,
            },
        );
        let labels = attachment.metadata.labels.get_or_insert_with(BTreeMap::new);
        labels.insert(VOLUME_NAME_LABEL.to_string(), volume_name.to_string());
        labels.insert(NODE_NAME_LABEL.to_string(), node_name.to_string());
        labels.insert(ROLE_LABEL.to_string(), role.to_string());
        attachment
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(API_VERSION_ANNOTATION.to_string(), CURRENT_API_VERSION.to_string());
        attachment.metadata.finalizers = Some(vec![ATTACHMENT_FINALIZER.to_string()]);
        attachment.status = Some(DiskVolumeAttachmentStatus::default());
        attachment
    }

    pub fn state(&self) -> AttachmentState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }

    /// Role currently in effect (falls back to the desired role)
    pub fn current_role(&self) -> AttachmentRole {
        self.status
            .as_ref()
            .and_then(|s| s.detail.as_ref())
            .and_then(|d| d.role)
            .unwrap_or(self.spec.role)
    }

    pub fn status_mut(&mut self) -> &mut DiskVolumeAttachmentStatus {
        self.status
            .get_or_insert_with(DiskVolumeAttachmentStatus::default)
    }

    pub fn status_annotations(&self) -> BTreeMap<String, String> {
        self.status
            .as_ref()
            .map(|s| s.annotations.clone())
            .unwrap_or_default()
    }

    /// Device slot the provider published
    pub fn lun(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.detail.as_ref())
            .and_then(|d| d.publish_context.get(LUN_KEY))
            .map(String::as_str)
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Set the desired role, keeping the lookup label in sync
    pub fn set_role(&mut self, role: AttachmentRole) {
        self.spec.role = role;
        self.metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(ROLE_LABEL.to_string(), role.to_string());
    }

    /// Returns true if the finalizer was removed
    pub fn remove_finalizer(&mut self) -> bool {
        match self.metadata.finalizers.as_mut() {
            Some(finalizers) => {
                let before = finalizers.len();
                finalizers.retain(|f| f != ATTACHMENT_FINALIZER);
                before != finalizers.len()
            }
            None => false,
        }
    }

    /// Creation time used for oldest-first ordering
    pub fn created_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.metadata.creation_timestamp.as_ref().map(|t| t.0)
    }
}
