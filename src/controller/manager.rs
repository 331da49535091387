//! Controller
//!
//! Wires the reconcilers into a [`Dispatcher`], turns store change events
//! into reconcile requests and exposes the volume lifecycle entrypoints the
//! host protocol calls (provision, delete, publish, unpublish, expand).

use super::node::is_schedulable;
use super::{
    AttachmentReconciler, ContextRef, Dispatcher, NodeReconciler, PodReconciler, ReconcileOutcome,
    ReconcilerRef, RecoveryCoordinator, RecoveryReport, ResourceKey, VolumeReconciler,
};
use crate::crd::{
    attachment_name, AttachmentRole, AttachmentState, CapacityRange, DiskVolume, DiskVolumeAttachment,
    DiskVolumeSpec, Intent, IntentSet, VolumeState,
};
use crate::controller::pod::pod_key;
use crate::error::{Error, ErrorCode, Result};
use crate::store::ResourceEvent;
use kube::ResourceExt;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct Controller {
    ctx: ContextRef,
    volumes: Arc<VolumeReconciler>,
    dispatcher: Arc<Dispatcher>,
}

impl Controller {
    pub fn new(ctx: ContextRef) -> Self {
        let volumes = Arc::new(VolumeReconciler::new(ctx.clone()));
        let reconcilers: Vec<ReconcilerRef> = vec![
            volumes.clone(),
            Arc::new(AttachmentReconciler::new(ctx.clone())),
            Arc::new(PodReconciler::new(ctx.clone())),
            Arc::new(NodeReconciler::new(ctx.clone())),
        ];
        let dispatcher = Dispatcher::new(ctx.clone(), reconcilers);
        Self {
            ctx,
            volumes,
            dispatcher,
        }
    }

    pub fn context(&self) -> &ContextRef {
        &self.ctx
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Rebuild in-memory state from the store and queue what needs work.
    /// Must run before the workers start.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let report = RecoveryCoordinator::new(self.ctx.clone()).recover().await?;
        for key in &report.requeue {
            self.dispatcher.enqueue(key.clone());
        }
        Ok(report)
    }

    /// Reconcile one resource inline
    pub async fn reconcile(&self, key: &ResourceKey) -> Result<ReconcileOutcome> {
        self.dispatcher.reconcile(key).await
    }

    /// Run the workers and feed them from `events` until `cancel` fires
    pub async fn run(&self, mut events: broadcast::Receiver<ResourceEvent>, cancel: CancellationToken) -> Result<()> {
        let workers = self.dispatcher.start(self.ctx.config.worker_count);
        info!(workers = workers.len(), "Controller running");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => {
                        for key in event.keys() {
                            self.dispatcher.enqueue(key);
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Change events dropped, resyncing everything");
                        self.resync().await?;
                    }
                    Err(RecvError::Closed) => {
                        info!("Change event stream closed");
                        break;
                    }
                },
            }
        }

        self.dispatcher.shutdown();
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "Reconcile worker ended abnormally");
            }
        }
        info!("Controller stopped");
        Ok(())
    }

    /// Queue every known resource
    pub async fn resync(&self) -> Result<usize> {
        let mut keys = Vec::new();
        for volume in self.ctx.store.list_volumes().await? {
            keys.push(ResourceKey::volume(volume.name_any()));
        }
        for attachment in self.ctx.store.list_attachments().await? {
            keys.push(ResourceKey::attachment(attachment.name_any()));
        }
        for node in self.ctx.cluster.list_nodes().await? {
            keys.push(ResourceKey::node(node.name_any()));
        }
        for pod in self.ctx.cluster.list_pods().await? {
            keys.push(ResourceKey::new(super::ResourceKind::Pod, pod_key(&pod)));
        }
        let count = keys.len();
        for key in keys {
            self.dispatcher.enqueue(key);
        }
        debug!(count, "Resync queued");
        Ok(count)
    }

    // =========================================================================
    // Volume entrypoints
    // =========================================================================

    /// Record a new volume; the volume reconciler creates the disk.
    ///
    /// Repeating a request with the same name and a compatible size returns
    /// the existing volume.
    pub async fn provision_volume(&self, name: &str, spec: DiskVolumeSpec) -> Result<DiskVolume> {
        let volume = DiskVolume::build(name, spec);
        VolumeReconciler::validate(&volume)?;

        let stored = match self.ctx.store.create_volume(&volume).await {
            // Status is not written on create; mark the disk as ours to delete
            Ok(_) => {
                self.ctx
                    .store
                    .modify_volume_status(name, &|s| {
                        s.annotations.set_intent(Intent::DeleteRequest, "provisioned");
                    })
                    .await?
            }
            Err(e) if e.code() == ErrorCode::AlreadyExists => {
                let existing = self
                    .ctx
                    .store
                    .get_volume(name)
                    .await?
                    .ok_or_else(|| Error::aborted("DiskVolume", name))?;
                let wanted = volume.spec.capacity_range.required_bytes;
                if existing.spec.capacity_range.required_bytes < wanted
                    || existing.spec.volume_name != volume.spec.volume_name
                {
                    return Err(Error::AlreadyExists {
                        kind: "DiskVolume".to_string(),
                        name: name.to_string(),
                    });
                }
                existing
            }
            Err(e) => return Err(e),
        };

        info!(volume = %name, bytes = stored.spec.capacity_range.required_bytes, "Volume provision requested");
        self.dispatcher.enqueue(ResourceKey::volume(name));
        Ok(stored)
    }

    /// Delete a provisioned volume together with its disk
    pub async fn delete_volume(&self, name: &str) -> Result<()> {
        let Some(volume) = self.ctx.store.get_volume(name).await? else {
            debug!(volume = %name, "Volume already gone");
            return Ok(());
        };
        if !volume.status_annotations().has_intent(Intent::DeleteRequest) {
            self.ctx
                .store
                .modify_volume_status(name, &|s| {
                    s.annotations.set_intent(Intent::DeleteRequest, "delete-volume");
                })
                .await?;
        }
        self.ctx.store.delete_volume(name).await?;
        info!(volume = %name, "Volume deletion requested");
        self.dispatcher.enqueue(ResourceKey::volume(name));
        Ok(())
    }

    /// Grow a volume; `Aborted` while another operation holds it
    pub async fn expand_volume(&self, name: &str, capacity: CapacityRange) -> Result<DiskVolume> {
        let volume = self.volumes.request_expansion(name, capacity).await?;
        info!(volume = %name, bytes = capacity.required_bytes, "Volume expansion requested");
        self.dispatcher.enqueue(ResourceKey::volume(name));
        Ok(volume)
    }

    // =========================================================================
    // Attachment entrypoints
    // =========================================================================

    /// Make `node` the primary of `volume_name` and return the attachment name.
    ///
    /// An attached replica on the node is promoted. Any primary elsewhere is
    /// demoted when the volume keeps replicas, otherwise detached.
    pub async fn publish_volume(&self, volume_name: &str, node: &str) -> Result<String> {
        let store = &self.ctx.store;
        let volume = store
            .get_volume(volume_name)
            .await?
            .ok_or_else(|| Error::not_found("DiskVolume", volume_name))?;
        if volume.is_deleting() {
            return Err(Error::not_found("DiskVolume", volume_name));
        }
        let detail = volume
            .status
            .as_ref()
            .and_then(|s| s.detail.clone())
            .filter(|_| volume.state() == VolumeState::Created)
            .ok_or_else(|| Error::aborted("DiskVolume", volume_name))?;

        let attachments = store.list_attachments_for_volume(volume_name).await?;
        let leaving = |a: &DiskVolumeAttachment| {
            a.is_deleting() || a.status_annotations().has_intent(Intent::DetachRequest)
        };

        let name = match attachments.iter().find(|a| a.spec.node_name == node) {
            Some(existing) if leaving(existing) => {
                return Err(Error::aborted("DiskVolumeAttachment", &existing.name_any()));
            }
            Some(existing) if existing.spec.role == AttachmentRole::Primary => {
                debug!(volume = %volume_name, node = %node, "Already published");
                return Ok(existing.name_any());
            }
            Some(existing) => {
                let name = existing.name_any();
                store
                    .modify_attachment(&name, &|a| a.set_role(AttachmentRole::Primary))
                    .await?;
                store
                    .modify_attachment_status(&name, &|s| {
                        s.annotations.set_intent(Intent::PromoteRequest, "publish");
                    })
                    .await?;
                info!(volume = %volume_name, node = %node, "Promoting replica to primary");
                name
            }
            None => {
                let primary = DiskVolumeAttachment::for_volume(
                    volume_name,
                    &detail.volume_id,
                    node,
                    AttachmentRole::Primary,
                    detail.volume_context.clone(),
                );
                let created = match store.create_attachment(&primary).await {
                    Ok(created) => created.name_any(),
                    Err(e) if e.code() == ErrorCode::AlreadyExists => {
                        return Err(Error::aborted("DiskVolumeAttachment", &primary.name_any()));
                    }
                    Err(e) => return Err(e),
                };
                self.ctx.state.track_attachment(volume_name, &created);
                info!(volume = %volume_name, node = %node, "Primary attachment created");
                created
            }
        };
        self.dispatcher.enqueue(ResourceKey::attachment(name.as_str()));

        let keep_replicas = volume.spec.max_mount_replica_count > 0 && !volume.is_inline();
        for old in attachments.iter().filter(|a| {
            a.spec.node_name != node && a.spec.role == AttachmentRole::Primary && !leaving(*a)
        }) {
            let old_name = old.name_any();
            if keep_replicas {
                store
                    .modify_attachment(&old_name, &|a| a.set_role(AttachmentRole::Replica))
                    .await?;
                store
                    .modify_attachment_status(&old_name, &|s| {
                        s.annotations.set_intent(Intent::DemoteRequest, "publish");
                    })
                    .await?;
                info!(volume = %volume_name, node = %old.spec.node_name, "Demoting previous primary");
            } else {
                store
                    .modify_attachment_status(&old_name, &|s| {
                        s.annotations.set_intent(Intent::DetachRequest, "publish");
                    })
                    .await?;
                info!(volume = %volume_name, node = %old.spec.node_name, "Detaching previous primary");
            }
            self.dispatcher.enqueue(ResourceKey::attachment(old_name));
        }
        Ok(name)
    }

    /// Release `node`'s attachment of `volume_name`.
    ///
    /// A primary is kept as a replica when the volume is short of replicas
    /// and the node can still hold one; otherwise it is detached.
    pub async fn unpublish_volume(&self, volume_name: &str, node: &str) -> Result<()> {
        let store = &self.ctx.store;
        let name = attachment_name(volume_name, node);
        let Some(attachment) = store.get_attachment(&name).await? else {
            debug!(volume = %volume_name, node = %node, "Nothing to unpublish");
            return Ok(());
        };
        if attachment.is_deleting() || attachment.status_annotations().has_intent(Intent::DetachRequest) {
            return Ok(());
        }

        if attachment.spec.role == AttachmentRole::Primary && self.can_demote(volume_name, node).await? {
            store
                .modify_attachment(&name, &|a| a.set_role(AttachmentRole::Replica))
                .await?;
            store
                .modify_attachment_status(&name, &|s| {
                    s.annotations.set_intent(Intent::DemoteRequest, "unpublish");
                })
                .await?;
            info!(volume = %volume_name, node = %node, "Primary demoted to replica");
        } else {
            store
                .modify_attachment_status(&name, &|s| {
                    s.annotations.set_intent(Intent::DetachRequest, "unpublish");
                })
                .await?;
            info!(volume = %volume_name, node = %node, "Detach requested");
        }
        self.dispatcher.enqueue(ResourceKey::attachment(name));
        Ok(())
    }

    async fn can_demote(&self, volume_name: &str, node: &str) -> Result<bool> {
        let Some(volume) = self.ctx.store.get_volume(volume_name).await? else {
            return Ok(false);
        };
        let wanted = volume.spec.max_mount_replica_count as usize;
        if wanted == 0 || volume.is_deleting() || volume.is_inline() {
            return Ok(false);
        }
        let schedulable = self
            .ctx
            .cluster
            .get_node(node)
            .await?
            .map(|n| is_schedulable(&n))
            .unwrap_or(false);
        if !schedulable {
            return Ok(false);
        }
        let replicas = self
            .ctx
            .store
            .list_attachments_for_volume(volume_name)
            .await?
            .iter()
            .filter(|a| {
                a.spec.role == AttachmentRole::Replica
                    && !a.is_deleting()
                    && !a.status_annotations().has_intent(Intent::DetachRequest)
                    && a.state() != AttachmentState::AttachFailed
            })
            .count();
        Ok(replicas < wanted)
    }
}
