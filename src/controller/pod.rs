//! Pod Reconciler
//!
//! Maintains the pod/claim index from pod specs, materializes inline disk
//! volumes, places replicas of the volumes used by running pods and, when the
//! last pod using a claim goes away, asks for the claim's replicas to detach.
//! Primaries are never detached because of a pod deletion alone.

use super::attachment::ensure_replicas;
use super::{ContextRef, ControllerContext, ReconcileOutcome, Reconciler, ResourceKind};
use crate::crd::{
    AccessMode, AccessType, AttachmentRole, CapacityRange, DiskVolume, DiskVolumeSpec, Intent,
    IntentSet, VolumeCapability, VolumeState, VolumeStatusDetail,
};
use crate::error::{Error, ErrorCode, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{AzureDiskVolumeSource, Pod};
use kube::ResourceExt;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Claim key prefix used for volumes declared inline in a pod
const INLINE_CLAIM_PREFIX: &str = "inline:";

/// Index key of a pod: `namespace/name`
pub fn pod_key(pod: &Pod) -> String {
    format!(
        "{}/{}",
        pod.namespace().unwrap_or_else(|| "default".to_string()),
        pod.name_any()
    )
}

/// Scheduled and running
pub fn is_running(pod: &Pod) -> bool {
    let scheduled = pod
        .spec
        .as_ref()
        .and_then(|s| s.node_name.as_deref())
        .map(|n| !n.is_empty())
        .unwrap_or(false);
    let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
    scheduled && phase == Some("Running")
}

/// Terminating or terminated pods no longer hold their claims
pub(crate) fn is_finished(pod: &Pod) -> bool {
    let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
    pod.metadata.deletion_timestamp.is_some() || matches!(phase, Some("Succeeded") | Some("Failed"))
}

/// Record the claims `pod` references and return the DiskVolumes behind them.
///
/// Inline disks get a DiskVolume on first sight. Claims the pod dropped are
/// released when no other pod references them.
pub(crate) async fn index_pod(ctx: &ControllerContext, pod: &Pod) -> Result<Vec<String>> {
    let key = pod_key(pod);
    let namespace = pod.namespace().unwrap_or_else(|| "default".to_string());
    let sources = pod
        .spec
        .as_ref()
        .and_then(|s| s.volumes.clone())
        .unwrap_or_default();

    let mut claims = BTreeSet::new();
    let mut volumes = Vec::new();
    for source in &sources {
        if let Some(pvc) = &source.persistent_volume_claim {
            let claim = format!("{}/{}", namespace, pvc.claim_name);
            match ctx.cluster.resolve_claim(&namespace, &pvc.claim_name).await? {
                Some(volume) => {
                    ctx.state.bind_claim(&claim, &volume);
                    claims.insert(claim);
                    volumes.push(volume);
                }
                None => debug!(pod = %key, claim = %claim, "Claim is not backed by a DiskVolume"),
            }
        } else if let Some(disk) = &source.azure_disk {
            let volume = ensure_inline_volume(ctx, &key, disk).await?;
            let claim = format!("{}{}", INLINE_CLAIM_PREFIX, volume);
            ctx.state.bind_claim(&claim, &volume);
            claims.insert(claim);
            volumes.push(volume);
        }
    }

    let orphaned = ctx.state.set_pod_claims(&key, claims);
    release_claims(ctx, &orphaned).await?;
    Ok(volumes)
}

/// Create the DiskVolume of an inline disk, already in `Created` state
async fn ensure_inline_volume(
    ctx: &ControllerContext,
    pod: &str,
    disk: &AzureDiskVolumeSource,
) -> Result<String> {
    let name = disk.disk_name.to_lowercase();
    if ctx.store.get_volume(&name).await?.is_some() {
        return Ok(name);
    }

    let mut parameters = BTreeMap::new();
    if let Some(caching) = &disk.caching_mode {
        parameters.insert("cachingMode".to_string(), caching.clone());
    }
    if let Some(kind) = &disk.kind {
        parameters.insert("kind".to_string(), kind.clone());
    }
    let access_mode = if disk.read_only.unwrap_or(false) {
        AccessMode::SingleNodeReaderOnly
    } else {
        AccessMode::SingleNodeWriter
    };

    let mut volume = DiskVolume::build(
        &name,
        DiskVolumeSpec {
            volume_name: disk.disk_name.clone(),
            capacity_range: CapacityRange::default(),
            volume_capability: vec![VolumeCapability {
                access_type: AccessType::Mount,
                access_mode,
                fs_type: disk.fs_type.clone(),
                mount_flags: Vec::new(),
            }],
            parameters,
            secrets: BTreeMap::new(),
            content_volume_source: None,
            accessibility_requirements: None,
            max_mount_replica_count: 0,
            persistent_volume: None,
        },
    );
    volume
        .metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(Intent::InlineVolume.key().to_string(), pod.to_string());

    match ctx.store.create_volume(&volume).await {
        Ok(_) => {}
        Err(e) if e.code() == ErrorCode::AlreadyExists => return Ok(name),
        Err(e) => return Err(e),
    }

    let detail = VolumeStatusDetail {
        volume_id: disk.disk_uri.clone(),
        ..Default::default()
    };
    ctx.store
        .modify_volume_status(&name, &|s| {
            if s.detail.is_none() {
                s.state = VolumeState::Created;
                s.detail = Some(detail.clone());
                s.annotations.set_intent(Intent::InlineVolume, pod);
            }
        })
        .await?;
    info!(volume = %name, pod = %pod, disk_uri = %disk.disk_uri, "Inline volume recorded");
    Ok(name)
}

/// Ask replicas of claims nobody references anymore to detach
async fn release_claims(ctx: &ControllerContext, claims: &[String]) -> Result<()> {
    for claim in claims {
        let Some(volume) = ctx.state.volume_for_claim(claim) else {
            continue;
        };
        for attachment in ctx.store.list_attachments_for_volume(&volume).await? {
            if attachment.spec.role != AttachmentRole::Replica
                || attachment.is_deleting()
                || attachment.status_annotations().has_intent(Intent::DetachRequest)
            {
                continue;
            }
            ctx.store
                .modify_attachment_status(&attachment.name_any(), &|s| {
                    s.annotations.set_intent(Intent::DetachRequest, "pod-deleted");
                })
                .await?;
            info!(claim = %claim, attachment = %attachment.name_any(), "Replica no longer needed");
        }
    }
    Ok(())
}

// =============================================================================
// Pod Reconciler
// =============================================================================

pub struct PodReconciler {
    ctx: ContextRef,
}

impl PodReconciler {
    pub fn new(ctx: ContextRef) -> Self {
        Self { ctx }
    }

    async fn pod_removed(&self, key: &str) -> Result<ReconcileOutcome> {
        let orphaned = self.ctx.state.remove_pod(key);
        if !orphaned.is_empty() {
            info!(pod = %key, claims = ?orphaned, "Last pod using claims is gone");
        }
        release_claims(&self.ctx, &orphaned).await?;
        Ok(ReconcileOutcome::Done)
    }

    /// Place missing replicas of the pod's volumes, preferring nodes that
    /// already hold replicas of the pod's other volumes
    async fn place_replicas(&self, key: &str, volumes: &[String]) -> Result<()> {
        let mut replica_nodes: BTreeMap<&str, BTreeSet<String>> = BTreeMap::new();
        for volume in volumes {
            let nodes = self
                .ctx
                .store
                .list_attachments_for_volume(volume)
                .await?
                .into_iter()
                .filter(|a| a.spec.role == AttachmentRole::Replica && !a.is_deleting())
                .map(|a| a.spec.node_name)
                .collect();
            replica_nodes.insert(volume.as_str(), nodes);
        }

        for volume in volumes {
            let preferred: BTreeSet<String> = replica_nodes
                .iter()
                .filter(|(other, _)| **other != volume.as_str())
                .flat_map(|(_, nodes)| nodes.iter().cloned())
                .collect();
            let created = ensure_replicas(&self.ctx, volume, &preferred).await?;
            if created > 0 {
                debug!(pod = %key, volume = %volume, created, "Replicas requested for pod");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Reconciler for PodReconciler {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Pod
    }

    async fn reconcile(&self, key: &str) -> Result<ReconcileOutcome> {
        let Some((namespace, name)) = key.split_once('/') else {
            return Err(Error::InvalidArgument(format!(
                "pod key {} is not namespace/name",
                key
            )));
        };
        let pod = match self.ctx.cluster.get_pod(namespace, name).await? {
            Some(pod) if !is_finished(&pod) => pod,
            _ => return self.pod_removed(key).await,
        };

        let volumes = index_pod(&self.ctx, &pod).await?;
        if is_running(&pod) && !volumes.is_empty() {
            self.place_replicas(key, &volumes).await?;
        }
        Ok(ReconcileOutcome::Done)
    }
}
