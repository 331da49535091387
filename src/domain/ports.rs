//! Domain Ports - Capability traits consumed by the reconciliation engine
//!
//! These traits define the boundaries between the controller logic and the
//! systems it drives: the remote disk provider, the store that persists
//! DiskVolume/DiskVolumeAttachment resources, and the read-only view of the
//! cluster's pods and nodes. Adapters implement these traits.

use crate::crd::{
    CapacityRange, ContentVolumeSource, DiskVolume, DiskVolumeAttachment,
    DiskVolumeAttachmentStatus, DiskVolumeStatus, TopologyRequirement, VolumeCapability,
    VolumeStatusDetail,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Opaque provider data returned by a publish (e.g. the device LUN)
pub type PublishContext = BTreeMap<String, String>;

/// Attempts made by the read-modify-write helpers before giving up
pub const CONFLICT_RETRIES: usize = 5;

/// In-place edit of a volume's status
pub type VolumeStatusEdit<'a> = &'a (dyn Fn(&mut DiskVolumeStatus) + Send + Sync);

/// In-place edit of a volume's metadata or spec
pub type VolumeEdit<'a> = &'a (dyn Fn(&mut DiskVolume) + Send + Sync);

/// In-place edit of an attachment's status
pub type AttachmentStatusEdit<'a> = &'a (dyn Fn(&mut DiskVolumeAttachmentStatus) + Send + Sync);

/// In-place edit of an attachment's metadata or spec
pub type AttachmentEdit<'a> = &'a (dyn Fn(&mut DiskVolumeAttachment) + Send + Sync);

// =============================================================================
// Volume Provisioner Port
// =============================================================================

/// Request to create a disk at the provider
#[derive(Debug, Clone, PartialEq)]
pub struct CreateVolumeRequest {
    pub volume_name: String,
    pub capacity_range: CapacityRange,
    pub capabilities: Vec<VolumeCapability>,
    pub parameters: BTreeMap<String, String>,
    pub secrets: BTreeMap<String, String>,
    pub content_source: Option<ContentVolumeSource>,
    pub accessibility: Option<TopologyRequirement>,
}

impl CreateVolumeRequest {
    pub fn from_volume(volume: &DiskVolume) -> Self {
        Self {
            volume_name: volume.spec.volume_name.clone(),
            capacity_range: volume.spec.capacity_range,
            capabilities: volume.spec.volume_capability.clone(),
            parameters: volume.spec.parameters.clone(),
            secrets: volume.spec.secrets.clone(),
            content_source: volume.spec.content_volume_source.clone(),
            accessibility: volume.spec.accessibility_requirements.clone(),
        }
    }
}

/// Port for disk lifecycle operations at the remote provider.
///
/// Calls must be idempotent on the provider side: create with a known name
/// returns the existing disk, delete of a missing disk succeeds.
#[async_trait]
pub trait VolumeProvisioner: Send + Sync {
    /// Create (or look up) the disk
    async fn create_volume(&self, request: CreateVolumeRequest) -> Result<VolumeStatusDetail>;

    /// Delete the disk
    async fn delete_volume(&self, volume_id: &str, secrets: &BTreeMap<String, String>) -> Result<()>;

    /// Grow the disk to the requested range
    async fn expand_volume(
        &self,
        volume_id: &str,
        capacity_range: CapacityRange,
        secrets: &BTreeMap<String, String>,
    ) -> Result<VolumeStatusDetail>;
}

// =============================================================================
// Attachment Provisioner Port
// =============================================================================

/// Request to attach a disk to a node
#[derive(Debug, Clone, PartialEq)]
pub struct PublishRequest {
    pub volume_id: String,
    pub node_name: String,
    pub capability: Option<VolumeCapability>,
    pub volume_context: BTreeMap<String, String>,
}

/// Port for attach/detach at the remote provider.
///
/// Attach and detach are not instantaneous: publish/unpublish start the
/// operation and the wait calls block until the provider reports completion.
#[async_trait]
pub trait AttachmentProvisioner: Send + Sync {
    /// Start attaching, returning the provisional publish context
    async fn publish_volume(&self, request: PublishRequest) -> Result<PublishContext>;

    /// Start detaching; `NotFound` means the disk is not attached
    async fn unpublish_volume(&self, volume_id: &str, node_name: &str) -> Result<()>;

    /// Wait until attached and return the confirmed publish context;
    /// `NotFound` means no attach is in progress or complete
    async fn wait_for_attach(&self, volume_id: &str, node_name: &str) -> Result<PublishContext>;

    /// Wait until detached
    async fn wait_for_detach(&self, volume_id: &str, node_name: &str) -> Result<()>;
}

// =============================================================================
// Resource Store Port
// =============================================================================

/// Port for reading and writing the persisted resources.
///
/// Deleting a resource that still carries finalizers only marks it for
/// deletion; it disappears once an update removes the last finalizer.
/// Updates carrying an outdated resource version fail with `Conflict`;
/// the `modify_*` helpers re-read and re-apply their edit in that case.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get_volume(&self, name: &str) -> Result<Option<DiskVolume>>;

    async fn list_volumes(&self) -> Result<Vec<DiskVolume>>;

    /// Fails with `AlreadyExists` when the name is taken
    async fn create_volume(&self, volume: &DiskVolume) -> Result<DiskVolume>;

    /// Persist metadata and spec
    async fn update_volume(&self, volume: &DiskVolume) -> Result<DiskVolume>;

    /// Persist status
    async fn update_volume_status(&self, volume: &DiskVolume) -> Result<DiskVolume>;

    async fn delete_volume(&self, name: &str) -> Result<()>;

    async fn get_attachment(&self, name: &str) -> Result<Option<DiskVolumeAttachment>>;

    async fn list_attachments(&self) -> Result<Vec<DiskVolumeAttachment>>;

    /// Fails with `AlreadyExists` when the name is taken
    async fn create_attachment(&self, attachment: &DiskVolumeAttachment) -> Result<DiskVolumeAttachment>;

    /// Persist metadata and spec
    async fn update_attachment(&self, attachment: &DiskVolumeAttachment) -> Result<DiskVolumeAttachment>;

    /// Persist status
    async fn update_attachment_status(
        &self,
        attachment: &DiskVolumeAttachment,
    ) -> Result<DiskVolumeAttachment>;

    async fn delete_attachment(&self, name: &str) -> Result<()>;

    /// Re-read the volume and apply `edit` to its status
    async fn modify_volume_status(&self, name: &str, edit: VolumeStatusEdit<'_>) -> Result<DiskVolume> {
        for _ in 0..CONFLICT_RETRIES {
            let mut volume = self
                .get_volume(name)
                .await?
                .ok_or_else(|| Error::not_found("DiskVolume", name))?;
            edit(volume.status_mut());
            match self.update_volume_status(&volume).await {
                Err(e) if e.is_conflict() => continue,
                other => return other,
            }
        }
        Err(Error::aborted("DiskVolume", name))
    }

    /// Re-read the volume and apply `edit` to its metadata or spec
    async fn modify_volume(&self, name: &str, edit: VolumeEdit<'_>) -> Result<DiskVolume> {
        for _ in 0..CONFLICT_RETRIES {
            let mut volume = self
                .get_volume(name)
                .await?
                .ok_or_else(|| Error::not_found("DiskVolume", name))?;
            edit(&mut volume);
            match self.update_volume(&volume).await {
                Err(e) if e.is_conflict() => continue,
                other => return other,
            }
        }
        Err(Error::aborted("DiskVolume", name))
    }

    /// Re-read the attachment and apply `edit` to its status
    async fn modify_attachment_status(
        &self,
        name: &str,
        edit: AttachmentStatusEdit<'_>,
    ) -> Result<DiskVolumeAttachment> {
        for _ in 0..CONFLICT_RETRIES {
            let mut attachment = self
                .get_attachment(name)
                .await?
                .ok_or_else(|| Error::not_found("DiskVolumeAttachment", name))?;
            edit(attachment.status_mut());
            match self.update_attachment_status(&attachment).await {
                Err(e) if e.is_conflict() => continue,
                other => return other,
            }
        }
        Err(Error::aborted("DiskVolumeAttachment", name))
    }

    /// Re-read the attachment and apply `edit` to its metadata or spec
    async fn modify_attachment(&self, name: &str, edit: AttachmentEdit<'_>) -> Result<DiskVolumeAttachment> {
        for _ in 0..CONFLICT_RETRIES {
            let mut attachment = self
                .get_attachment(name)
                .await?
                .ok_or_else(|| Error::not_found("DiskVolumeAttachment", name))?;
            edit(&mut attachment);
            match self.update_attachment(&attachment).await {
                Err(e) if e.is_conflict() => continue,
                other => return other,
            }
        }
        Err(Error::aborted("DiskVolumeAttachment", name))
    }

    /// Attachments of one volume
    async fn list_attachments_for_volume(&self, volume_name: &str) -> Result<Vec<DiskVolumeAttachment>> {
        Ok(self
            .list_attachments()
            .await?
            .into_iter()
            .filter(|a| a.spec.volume_name == volume_name)
            .collect())
    }

    /// Attachments on one node
    async fn list_attachments_for_node(&self, node_name: &str) -> Result<Vec<DiskVolumeAttachment>> {
        Ok(self
            .list_attachments()
            .await?
            .into_iter()
            .filter(|a| a.spec.node_name == node_name)
            .collect())
    }
}

// =============================================================================
// Cluster View Port
// =============================================================================

/// Read-only view of the cluster objects the controller reacts to
#[async_trait]
pub trait ClusterView: Send + Sync {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;

    async fn list_pods(&self) -> Result<Vec<Pod>>;

    async fn get_node(&self, name: &str) -> Result<Option<Node>>;

    async fn list_nodes(&self) -> Result<Vec<Node>>;

    /// DiskVolume backing a claim, if the claim is bound to one of ours
    async fn resolve_claim(&self, namespace: &str, claim: &str) -> Result<Option<String>>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type VolumeProvisionerRef = Arc<dyn VolumeProvisioner>;
pub type AttachmentProvisionerRef = Arc<dyn AttachmentProvisioner>;
pub type ResourceStoreRef = Arc<dyn ResourceStore>;
pub type ClusterViewRef = Arc<dyn ClusterView>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{DiskVolumeSpec, VolumeState};
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Memory store whose next status writes lose a race
    struct Racing {
        inner: MemoryStore,
        conflicts: AtomicUsize,
    }

    #[async_trait]
    impl ResourceStore for Racing {
        async fn get_volume(&self, name: &str) -> Result<Option<DiskVolume>> {
            self.inner.get_volume(name).await
        }
        async fn list_volumes(&self) -> Result<Vec<DiskVolume>> {
            self.inner.list_volumes().await
        }
        async fn create_volume(&self, volume: &DiskVolume) -> Result<DiskVolume> {
            self.inner.create_volume(volume).await
        }
        async fn update_volume(&self, volume: &DiskVolume) -> Result<DiskVolume> {
            self.inner.update_volume(volume).await
        }
        async fn update_volume_status(&self, volume: &DiskVolume) -> Result<DiskVolume> {
            let left = self.conflicts.load(Ordering::SeqCst);
            if left > 0 {
                self.conflicts.store(left - 1, Ordering::SeqCst);
                return Err(Error::conflict("DiskVolume", "vol-a"));
            }
            self.inner.update_volume_status(volume).await
        }
        async fn delete_volume(&self, name: &str) -> Result<()> {
            self.inner.delete_volume(name).await
        }
        async fn get_attachment(&self, name: &str) -> Result<Option<DiskVolumeAttachment>> {
            self.inner.get_attachment(name).await
        }
        async fn list_attachments(&self) -> Result<Vec<DiskVolumeAttachment>> {
            self.inner.list_attachments().await
        }
        async fn create_attachment(&self, attachment: &DiskVolumeAttachment) -> Result<DiskVolumeAttachment> {
            self.inner.create_attachment(attachment).await
        }
        async fn update_attachment(&self, attachment: &DiskVolumeAttachment) -> Result<DiskVolumeAttachment> {
            self.inner.update_attachment(attachment).await
        }
        async fn update_attachment_status(
            &self,
            attachment: &DiskVolumeAttachment,
        ) -> Result<DiskVolumeAttachment> {
            self.inner.update_attachment_status(attachment).await
        }
        async fn delete_attachment(&self, name: &str) -> Result<()> {
            self.inner.delete_attachment(name).await
        }
    }

    fn spec() -> DiskVolumeSpec {
        DiskVolumeSpec {
            volume_name: "vol-a".into(),
            capacity_range: CapacityRange::new(1 << 30),
            volume_capability: vec![VolumeCapability::default()],
            parameters: BTreeMap::new(),
            secrets: BTreeMap::new(),
            content_volume_source: None,
            accessibility_requirements: None,
            max_mount_replica_count: 0,
            persistent_volume: None,
        }
    }

    fn racing(conflicts: usize) -> Racing {
        let store = Racing {
            inner: MemoryStore::new(),
            conflicts: AtomicUsize::new(0),
        };
        tokio_test::block_on(store.create_volume(&DiskVolume::build("vol-a", spec()))).unwrap();
        store.conflicts.store(conflicts, Ordering::SeqCst);
        store
    }

    #[test]
    fn test_modify_retries_conflicts() {
        let store = racing(CONFLICT_RETRIES - 1);
        let updated = tokio_test::block_on(
            store.modify_volume_status("vol-a", &|s| s.state = VolumeState::Created),
        )
        .unwrap();
        assert_eq!(updated.state(), VolumeState::Created);
    }

    #[test]
    fn test_modify_gives_up_after_repeated_conflicts() {
        let store = racing(CONFLICT_RETRIES);
        let err = tokio_test::block_on(
            store.modify_volume_status("vol-a", &|s| s.state = VolumeState::Created),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Aborted { .. }));
        assert!(matches!(
            tokio_test::block_on(store.modify_volume_status("vol-x", &|_| {})),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_create_request_from_volume() {
        let mut parameters = BTreeMap::new();
        parameters.insert("skuName".to_string(), "Premium_LRS".to_string());
        let volume = DiskVolume::new("vol-a", DiskVolumeSpec { parameters, ..spec() });

        let request = CreateVolumeRequest::from_volume(&volume);
        assert_eq!(request.volume_name, "vol-a");
        assert_eq!(request.capacity_range.required_bytes, 1 << 30);
        assert_eq!(request.parameters.get("skuName").map(String::as_str), Some("Premium_LRS"));
    }
}
