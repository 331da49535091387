//! Attachment Reconciler
//!
//! Drives a DiskVolumeAttachment through its lifecycle:
//!
//! ```text
//! Pending  -> Attaching -> Attached | AttachFailed
//! Attached -> Detaching -> Detached (resource removed) | DetachFailed
//! Attached -> (role change) -> Attached
//! ```
//!
//! Node slots are reserved when attaching starts and given back when the
//! attach fails or the detach completes. Replica placement and primary
//! failover live here as well; the pod and node reconcilers call into them.

use super::placement::{PlacementEngine, PlacementRequest, PodConstraints};
use super::{drain_queue, ContextRef, ControllerContext, ReconcileOutcome, Reconciler, ResourceKind, DEPENDENCY_POLL_INTERVAL};
use crate::crd::{
    AttachmentRole, AttachmentState, AttachmentStatusDetail, DiskVolumeAttachment, Intent,
    IntentSet, ResourceError, VolumeState, LUN_KEY,
};
use crate::domain::ports::{PublishContext, PublishRequest};
use crate::error::{Error, ErrorCode, Result};
use crate::state::{OperationKind, OperationRequest, RetryDecision, RetryTracker};
use async_trait::async_trait;
use kube::ResourceExt;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub struct AttachmentReconciler {
    ctx: ContextRef,
    retries: RetryTracker,
}

impl AttachmentReconciler {
    pub fn new(ctx: ContextRef) -> Self {
        let retries = RetryTracker::new(ctx.config.backoff_policy());
        Self { ctx, retries }
    }

    /// Operation the attachment needs next, if any
    pub fn next_operation(attachment: &DiskVolumeAttachment) -> Option<OperationKind> {
        let state = attachment.state();
        let annotations = attachment.status_annotations();

        if attachment.is_deleting() || annotations.has_intent(Intent::DetachRequest) {
            return (state != AttachmentState::DetachFailed).then_some(OperationKind::Detach);
        }
        match state {
            AttachmentState::Pending => Some(OperationKind::Attach),
            AttachmentState::Attached
                if annotations.has_intent(Intent::PromoteRequest)
                    || annotations.has_intent(Intent::DemoteRequest)
                    || attachment.current_role() != attachment.spec.role =>
            {
                Some(OperationKind::UpdateRole)
            }
            _ => None,
        }
    }

    /// Promote a replica away from `lost_node`; see [`failover_primary`]
    pub async fn failover_primary(&self, volume: &str, lost_node: &str) -> Result<Option<String>> {
        failover_primary(&self.ctx, volume, lost_node).await
    }

    /// Create missing replicas of `volume`; see [`ensure_replicas`]
    pub async fn ensure_replicas(&self, volume: &str, preferred: &BTreeSet<String>) -> Result<usize> {
        ensure_replicas(&self.ctx, volume, preferred).await
    }

    fn forget(&self, name: &str) {
        self.ctx.state.attachment_queues.remove_queue(name);
        self.retries.reset(name);
    }

    async fn execute(&self, name: &str, request: OperationRequest) -> Result<ReconcileOutcome> {
        let Some(attachment) = self.ctx.store.get_attachment(name).await? else {
            debug!(attachment = %name, operation = %request.kind, "Dropping request for deleted attachment");
            return Ok(ReconcileOutcome::Done);
        };
        if Self::next_operation(&attachment) != Some(request.kind) {
            debug!(attachment = %name, operation = %request.kind, "Request no longer applies");
            return Ok(ReconcileOutcome::Done);
        }

        match request.kind {
            OperationKind::Attach => self.attach(attachment).await,
            OperationKind::Detach => self.detach(attachment).await,
            OperationKind::UpdateRole => self.update_role(attachment).await,
            other => {
                warn!(attachment = %name, operation = %other, "Unsupported attachment operation");
                Ok(ReconcileOutcome::Done)
            }
        }
    }

    // =========================================================================
    // Attach
    // =========================================================================

    async fn attach(&self, attachment: DiskVolumeAttachment) -> Result<ReconcileOutcome> {
        let name = attachment.name_any();
        let store = &self.ctx.store;
        let volume_name = attachment.spec.volume_name.clone();
        let node = attachment.spec.node_name.clone();

        let volume = match store.get_volume(&volume_name).await? {
            Some(volume) if !volume.is_deleting() => volume,
            _ => {
                info!(attachment = %name, volume = %volume_name, "Volume is gone, detaching");
                store
                    .modify_attachment_status(&name, &|s| {
                        s.annotations.set_intent(Intent::DetachRequest, "volume-missing");
                    })
                    .await?;
                return Ok(ReconcileOutcome::Done);
            }
        };
        let Some(volume_id) = volume
            .volume_id()
            .filter(|_| volume.state() == VolumeState::Created)
            .map(str::to_string)
        else {
            debug!(attachment = %name, volume = %volume_name, state = %volume.state(), "Waiting for volume to be created");
            return Ok(ReconcileOutcome::RequeueAfter(DEPENDENCY_POLL_INTERVAL));
        };

        if attachment.spec.volume_id != volume_id {
            store
                .modify_attachment(&name, &|a| a.spec.volume_id = volume_id.clone())
                .await?;
        }

        if !super::node::ensure_node_tracked(&self.ctx, &node).await? {
            let err = Error::not_found("Node", &node);
            return self.handle_attach_failure(&attachment, err, false).await;
        }
        if !self.ctx.state.reserve_slot(&node) {
            let err = Error::Unavailable(format!("node {} has no free attachment slots", node));
            return self.handle_attach_failure(&attachment, err, false).await;
        }

        store
            .modify_attachment_status(&name, &|s| s.state = AttachmentState::Attaching)
            .await?;

        info!(attachment = %name, volume_id = %volume_id, node = %node, role = %attachment.spec.role, "Attaching volume");
        let request = PublishRequest {
            volume_id: volume_id.clone(),
            node_name: node.clone(),
            capability: volume.spec.volume_capability.first().cloned(),
            volume_context: attachment.spec.volume_context.clone(),
        };
        let context = match self.publish(&name, request).await {
            Ok(context) => context,
            Err(err) => return self.handle_attach_failure(&attachment, err, true).await,
        };

        if let Err(err) = self.validate_lun(&name, &node, &context).await {
            let unpublish = self
                .ctx
                .call_provisioner(
                    "UnpublishVolume",
                    &name,
                    self.ctx.attachment_provisioner.unpublish_volume(&volume_id, &node),
                )
                .await;
            if let Err(e) = unpublish {
                warn!(attachment = %name, error = %e, "Failed to undo conflicting attach");
            }
            return self.handle_attach_failure(&attachment, err, true).await;
        }

        let role = attachment.spec.role;
        let updated = store
            .modify_attachment_status(&name, &|s| {
                let previous_role = s.detail.as_ref().and_then(|d| d.previous_role);
                s.state = AttachmentState::Attached;
                s.detail = Some(AttachmentStatusDetail {
                    role: Some(role),
                    previous_role,
                    publish_context: context.clone(),
                });
                s.error = None;
                s.annotations.clear_intent(Intent::AttachFailed);
            })
            .await?;
        self.retries.reset(&name);
        self.ctx.state.track_attachment(&volume_name, &name);
        info!(attachment = %name, node = %node, lun = ?updated.lun(), "Volume attached");

        if role == AttachmentRole::Primary {
            if let Err(e) = ensure_replicas(&self.ctx, &volume_name, &BTreeSet::new()).await {
                warn!(volume = %volume_name, error = %e, "Failed to place replicas");
            }
        }
        Ok(ReconcileOutcome::Done)
    }

    /// Publish and wait for the attach to complete.
    ///
    /// After an attempt whose outcome is unknown the provider is asked first;
    /// the disk is only published again when no attach is in progress.
    async fn publish(&self, name: &str, request: PublishRequest) -> Result<PublishContext> {
        let provisioner = &self.ctx.attachment_provisioner;
        let (volume_id, node) = (request.volume_id.clone(), request.node_name.clone());

        if self.retries.outcome_unknown(name) {
            let existing = self
                .ctx
                .call_provisioner("WaitForAttach", name, provisioner.wait_for_attach(&volume_id, &node))
                .await;
            match existing {
                Ok(context) => {
                    info!(attachment = %name, "Attach from an earlier attempt completed");
                    return Ok(context);
                }
                Err(e) if e.code() == ErrorCode::NotFound => {
                    debug!(attachment = %name, "No attach in progress, publishing again");
                }
                Err(e) => return Err(e),
            }
        }

        let mut context = self
            .ctx
            .call_provisioner("PublishVolume", name, provisioner.publish_volume(request))
            .await?;
        let confirmed = self
            .ctx
            .call_provisioner("WaitForAttach", name, provisioner.wait_for_attach(&volume_id, &node))
            .await?;
        context.extend(confirmed);
        Ok(context)
    }

    /// The published device slot must exist and be unique on the node
    async fn validate_lun(&self, name: &str, node: &str, context: &PublishContext) -> Result<()> {
        let Some(lun) = context.get(LUN_KEY) else {
            return Err(Error::Internal(format!(
                "attach of {} on {} returned no device slot",
                name, node
            )));
        };
        let on_node = self.ctx.store.list_attachments_for_node(node).await?;
        if let Some(other) = on_node
            .iter()
            .find(|a| a.name_any() != name && a.state().occupies_slot() && a.lun() == Some(lun.as_str()))
        {
            return Err(Error::Internal(format!(
                "device slot {} on {} is already used by {}",
                lun,
                node,
                other.name_any()
            )));
        }
        Ok(())
    }

    async fn handle_attach_failure(
        &self,
        attachment: &DiskVolumeAttachment,
        err: Error,
        reserved: bool,
    ) -> Result<ReconcileOutcome> {
        let name = attachment.name_any();
        let volume = &attachment.spec.volume_name;
        let node = &attachment.spec.node_name;

        if reserved {
            self.ctx.state.release_slot(node);
        }
        self.ctx.state.mark_visited(volume, node);
        let record = ResourceError::from_error(&err, &name);

        let decision = if err.is_retryable() {
            self.retries.record_failure(&name, err.is_outcome_unknown())
        } else {
            RetryDecision::Exhausted {
                failures: self.retries.failures(&name) + 1,
            }
        };

        match decision {
            RetryDecision::RetryAfter(delay) => {
                warn!(attachment = %name, node = %node, error = %err, retry_in = ?delay, "Attach failed, will retry");
                self.ctx
                    .store
                    .modify_attachment_status(&name, &|s| {
                        s.state = AttachmentState::Pending;
                        s.error = Some(record.clone());
                    })
                    .await?;
                Ok(ReconcileOutcome::RequeueAfter(delay))
            }
            RetryDecision::Exhausted { failures } => {
                error!(attachment = %name, node = %node, error = %err, failures, "Attach failed permanently");
                self.retries.reset(&name);
                let code = err.code().to_string();
                self.ctx
                    .store
                    .modify_attachment_status(&name, &|s| {
                        s.state = AttachmentState::AttachFailed;
                        s.error = Some(record.clone());
                        s.annotations.set_intent(Intent::AttachFailed, code.clone());
                    })
                    .await?;

                if attachment.spec.role == AttachmentRole::Replica {
                    if let Err(e) = ensure_replicas(&self.ctx, volume, &BTreeSet::new()).await {
                        warn!(volume = %volume, error = %e, "Failed to place substitute replica");
                    }
                }
                Ok(ReconcileOutcome::Done)
            }
        }
    }

    // =========================================================================
    // Detach
    // =========================================================================

    async fn detach(&self, attachment: DiskVolumeAttachment) -> Result<ReconcileOutcome> {
        let name = attachment.name_any();
        let store = &self.ctx.store;
        let node = attachment.spec.node_name.clone();
        let prior = attachment.state();

        if prior != AttachmentState::Detached {
            store
                .modify_attachment_status(&name, &|s| s.state = AttachmentState::Detaching)
                .await?;

            if !attachment.spec.volume_id.is_empty() {
                info!(attachment = %name, node = %node, "Detaching volume");
                if let Err(err) = self.unpublish(&name, &attachment.spec.volume_id, &node).await {
                    return self.handle_detach_failure(&name, err, prior).await;
                }
            }

            store
                .modify_attachment_status(&name, &|s| {
                    s.state = AttachmentState::Detached;
                    s.error = None;
                })
                .await?;
            if prior.occupies_slot() {
                self.ctx.state.release_slot(&node);
            }
        }
        self.ctx
            .state
            .untrack_attachment(&attachment.spec.volume_name, &name);
        self.retries.reset(&name);

        if !attachment.is_deleting() {
            store.delete_attachment(&name).await?;
        }
        match store
            .modify_attachment(&name, &|a| {
                a.remove_finalizer();
            })
            .await
        {
            Ok(_) => {}
            Err(e) if e.code() == ErrorCode::NotFound => {}
            Err(e) => return Err(e),
        }

        info!(attachment = %name, node = %node, "Volume detached");
        Ok(ReconcileOutcome::Done)
    }

    /// Unpublish and wait; a disk that is not attached counts as detached
    async fn unpublish(&self, name: &str, volume_id: &str, node: &str) -> Result<()> {
        let provisioner = &self.ctx.attachment_provisioner;
        let started = self
            .ctx
            .call_provisioner("UnpublishVolume", name, provisioner.unpublish_volume(volume_id, node))
            .await;
        match started {
            Ok(()) => {}
            Err(e) if e.code() == ErrorCode::NotFound => return Ok(()),
            Err(e) => return Err(e),
        }
        match self
            .ctx
            .call_provisioner("WaitForDetach", name, provisioner.wait_for_detach(volume_id, node))
            .await
        {
            Err(e) if e.code() != ErrorCode::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    async fn handle_detach_failure(
        &self,
        name: &str,
        err: Error,
        prior: AttachmentState,
    ) -> Result<ReconcileOutcome> {
        let record = ResourceError::from_error(&err, name);
        let decision = if err.is_retryable() {
            self.retries.record_failure(name, err.is_outcome_unknown())
        } else {
            RetryDecision::Exhausted {
                failures: self.retries.failures(name) + 1,
            }
        };

        let (state, outcome) = match decision {
            RetryDecision::RetryAfter(delay) => {
                warn!(attachment = %name, error = %err, retry_in = ?delay, "Detach failed, will retry");
                (prior.recovery_target(), ReconcileOutcome::RequeueAfter(delay))
            }
            RetryDecision::Exhausted { failures } => {
                error!(attachment = %name, error = %err, failures, "Detach failed permanently");
                self.retries.reset(name);
                (AttachmentState::DetachFailed, ReconcileOutcome::Done)
            }
        };

        self.ctx
            .store
            .modify_attachment_status(name, &|s| {
                s.state = state;
                s.error = Some(record.clone());
            })
            .await?;
        Ok(outcome)
    }

    // =========================================================================
    // Role change
    // =========================================================================

    async fn update_role(&self, attachment: DiskVolumeAttachment) -> Result<ReconcileOutcome> {
        let name = attachment.name_any();
        let node = attachment.spec.node_name.clone();
        let role = attachment.spec.role;

        // Re-validate the publish context before the role takes effect
        let confirmed = self
            .ctx
            .call_provisioner(
                "WaitForAttach",
                &name,
                self.ctx
                    .attachment_provisioner
                    .wait_for_attach(&attachment.spec.volume_id, &node),
            )
            .await
            .and_then(|context| {
                if context.contains_key(LUN_KEY) {
                    Ok(context)
                } else {
                    Err(Error::Internal(format!("attach of {} lost its device slot", name)))
                }
            });

        let context = match confirmed {
            Ok(context) => context,
            Err(err) if err.code() == ErrorCode::NotFound => {
                warn!(attachment = %name, node = %node, "Disk no longer attached, attaching again");
                self.ctx.state.release_slot(&node);
                self.ctx
                    .store
                    .modify_attachment_status(&name, &|s| {
                        s.state = AttachmentState::Pending;
                        s.error = Some(ResourceError::from_error(&err, &name));
                    })
                    .await?;
                return Ok(ReconcileOutcome::Done);
            }
            Err(err) => return self.handle_role_failure(&attachment, err).await,
        };

        self.ctx
            .store
            .modify_attachment_status(&name, &|s| {
                let detail = s.detail.get_or_insert_with(AttachmentStatusDetail::default);
                if detail.role != Some(role) {
                    detail.previous_role = detail.role;
                }
                detail.role = Some(role);
                detail.publish_context = context.clone();
                s.error = None;
                s.annotations.clear_intent(Intent::PromoteRequest);
                s.annotations.clear_intent(Intent::DemoteRequest);
            })
            .await?;
        self.retries.reset(&name);

        info!(attachment = %name, node = %node, role = %role, "Attachment role updated");
        Ok(ReconcileOutcome::Done)
    }

    async fn handle_role_failure(
        &self,
        attachment: &DiskVolumeAttachment,
        err: Error,
    ) -> Result<ReconcileOutcome> {
        let name = attachment.name_any();
        let record = ResourceError::from_error(&err, &name);

        if err.is_retryable() {
            if let RetryDecision::RetryAfter(delay) =
                self.retries.record_failure(&name, err.is_outcome_unknown())
            {
                warn!(attachment = %name, error = %err, retry_in = ?delay, "Role change failed, will retry");
                self.ctx
                    .store
                    .modify_attachment_status(&name, &|s| s.error = Some(record.clone()))
                    .await?;
                return Ok(ReconcileOutcome::RequeueAfter(delay));
            }
        }

        // The disk is still attached: the slot stays held until the detach
        // actually happens
        error!(attachment = %name, error = %err, "Role change failed permanently, detaching");
        self.retries.reset(&name);
        let code = err.code().to_string();
        self.ctx
            .store
            .modify_attachment_status(&name, &|s| {
                s.error = Some(record.clone());
                s.annotations.set_intent(Intent::AttachFailed, code.clone());
                s.annotations.set_intent(Intent::DetachRequest, "role-change-failed");
            })
            .await?;

        let volume = &attachment.spec.volume_name;
        if let Err(e) = ensure_replicas(&self.ctx, volume, &BTreeSet::new()).await {
            warn!(volume = %volume, error = %e, "Failed to place substitute replica");
        }
        Ok(ReconcileOutcome::RequeueAfter(Duration::ZERO))
    }
}

#[async_trait]
impl Reconciler for AttachmentReconciler {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Attachment
    }

    async fn reconcile(&self, name: &str) -> Result<ReconcileOutcome> {
        let Some(attachment) = self.ctx.store.get_attachment(name).await? else {
            self.forget(name);
            return Ok(ReconcileOutcome::Done);
        };
        let Some(kind) = Self::next_operation(&attachment) else {
            return Ok(ReconcileOutcome::Done);
        };
        if let Some(wait) = self.retries.remaining_backoff(name) {
            debug!(attachment = %name, wait = ?wait, "Backing off");
            return Ok(ReconcileOutcome::RequeueAfter(wait));
        }

        drain_queue(&self.ctx.state.attachment_queues, name, kind, move |request| {
            self.execute(name, request)
        })
        .await
    }
}

// =============================================================================
// Failover
// =============================================================================

/// Oldest first; attachments without a creation time sort last, then by name
fn promotion_order(a: &DiskVolumeAttachment, b: &DiskVolumeAttachment) -> Ordering {
    let by_age = match (a.created_at(), b.created_at()) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_age.then_with(|| a.name_any().cmp(&b.name_any()))
}

/// Replace the primary of `volume` on `lost_node` with its oldest attached
/// replica, mark the old primary for detachment and restore redundancy.
///
/// Returns the promoted attachment, if one was eligible. Without a candidate
/// the old primary is left alone so it can recover with its node.
pub(crate) async fn failover_primary(
    ctx: &ControllerContext,
    volume: &str,
    lost_node: &str,
) -> Result<Option<String>> {
    let store = &ctx.store;
    let attachments = store.list_attachments_for_volume(volume).await?;

    let lost_primaries: Vec<String> = attachments
        .iter()
        .filter(|a| {
            a.spec.node_name == lost_node
                && a.spec.role == AttachmentRole::Primary
                && !a.is_deleting()
                && !a.status_annotations().has_intent(Intent::DetachRequest)
        })
        .map(|a| a.name_any())
        .collect();
    if lost_primaries.is_empty() {
        return Ok(None);
    }

    let candidate = attachments
        .iter()
        .filter(|a| {
            a.spec.role == AttachmentRole::Replica
                && a.state() == AttachmentState::Attached
                && a.spec.node_name != lost_node
                && !a.is_deleting()
                && !a.status_annotations().has_intent(Intent::DetachRequest)
        })
        .min_by(|a, b| promotion_order(a, b));

    let Some(candidate) = candidate else {
        warn!(volume = %volume, node = %lost_node, "No attached replica available for failover");
        return Ok(None);
    };
    let promoted = candidate.name_any();

    store
        .modify_attachment(&promoted, &|a| a.set_role(AttachmentRole::Primary))
        .await?;
    store
        .modify_attachment_status(&promoted, &|s| {
            s.annotations.set_intent(Intent::PromoteRequest, lost_node);
        })
        .await?;
    for old in &lost_primaries {
        store
            .modify_attachment_status(old, &|s| {
                s.annotations.set_intent(Intent::DetachRequest, "failover");
            })
            .await?;
    }
    ctx.metrics.record_failover();
    info!(volume = %volume, lost_node = %lost_node, promoted = %promoted, node = %candidate.spec.node_name, "Promoted replica to primary");

    ctx.state.clear_visited(volume);
    ensure_replicas(ctx, volume, &BTreeSet::new()).await?;
    Ok(Some(promoted))
}

// =============================================================================
// Replica Placement
// =============================================================================

/// Create Pending replica attachments until `volume` has as many live
/// replicas as it asks for, or no eligible node is left.
///
/// Returns the number of attachments created.
pub(crate) async fn ensure_replicas(
    ctx: &ControllerContext,
    volume_name: &str,
    preferred: &BTreeSet<String>,
) -> Result<usize> {
    let store = &ctx.store;
    let Some(volume) = store.get_volume(volume_name).await? else {
        return Ok(0);
    };
    let wanted = volume.spec.max_mount_replica_count as usize;
    if wanted == 0
        || volume.state() != VolumeState::Created
        || volume.is_deleting()
        || volume.is_inline()
    {
        return Ok(0);
    }
    let Some(detail) = volume.status.as_ref().and_then(|s| s.detail.clone()) else {
        return Ok(0);
    };

    let attachments = store.list_attachments_for_volume(volume_name).await?;
    let live = attachments
        .iter()
        .filter(|a| {
            a.spec.role == AttachmentRole::Replica
                && !a.is_deleting()
                && !a.status_annotations().has_intent(Intent::DetachRequest)
                && a.state() != AttachmentState::AttachFailed
        })
        .count();
    if live >= wanted {
        return Ok(0);
    }

    let nodes = ctx.cluster.list_nodes().await?;
    for node in &nodes {
        super::node::track_node(ctx, node).await?;
    }

    // Until a primary exists, the pod's node is where it will land
    let has_primary = attachments
        .iter()
        .any(|a| a.spec.role == AttachmentRole::Primary && !a.is_deleting());
    let mut pod_constraints = Vec::new();
    let mut pod_nodes = BTreeSet::new();
    if let Some(claim) = ctx.state.claim_for_volume(volume_name) {
        for pod_key in ctx.state.pods_for_claim(&claim) {
            let Some((namespace, pod_name)) = pod_key.split_once('/') else {
                continue;
            };
            if let Some(pod) = ctx.cluster.get_pod(namespace, pod_name).await? {
                if has_primary && super::pod::is_running(&pod) {
                    if let Some(node) = pod.spec.as_ref().and_then(|s| s.node_name.clone()) {
                        pod_nodes.insert(node);
                    }
                }
                pod_constraints.push(PodConstraints::from_pod(&pod));
            }
        }
    }

    let request = PlacementRequest {
        count: wanted - live,
        excluded_nodes: attachments.iter().map(|a| a.spec.node_name.clone()).collect(),
        visited_nodes: ctx.state.visited_nodes(volume_name),
        pod_nodes,
        preferred_nodes: preferred.clone(),
        topology: volume.spec.accessibility_requirements.as_ref(),
        accessible_topology: &detail.accessible_topology,
        pod_constraints,
    };
    let availability = ctx.state.snapshot_availability();
    let placement = PlacementEngine::select(&nodes, &availability, &request);

    let mut created = 0;
    for candidate in &placement.selected {
        let replica = DiskVolumeAttachment::for_volume(
            volume_name,
            &detail.volume_id,
            &candidate.node_name,
            AttachmentRole::Replica,
            detail.volume_context.clone(),
        );
        match store.create_attachment(&replica).await {
            Ok(created_replica) => {
                ctx.state.track_attachment(volume_name, &created_replica.name_any());
                created += 1;
                info!(volume = %volume_name, node = %candidate.node_name, "Replica attachment created");
            }
            Err(e) if e.code() == ErrorCode::AlreadyExists => {
                debug!(volume = %volume_name, node = %candidate.node_name, "Replica attachment already exists");
            }
            Err(e) => return Err(e),
        }
    }
    if placement.unplaced > 0 {
        info!(
            volume = %volume_name,
            unplaced = placement.unplaced,
            rejected = ?placement.rejected,
            "Not enough eligible nodes for all replicas"
        );
    }
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::ResourceStore;
    use crate::crd::attachment_name;
    use crate::testing::{Harness, GIB};
    use std::time::Duration;

    /// Create a volume and drive it to Created
    async fn created_volume(h: &Harness, name: &str, replicas: u32) -> String {
        h.create_volume(name, 10 * GIB, replicas).await;
        super::super::VolumeReconciler::new(h.ctx.clone())
            .reconcile(name)
            .await
            .unwrap();
        h.volume(name).await.volume_id().unwrap().to_string()
    }

    async fn converge(h: &Harness, reconciler: &AttachmentReconciler) {
        for _ in 0..4 {
            for attachment in h.store.list_attachments().await.unwrap() {
                reconciler.reconcile(&attachment.name_any()).await.unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_attach_reserves_slot_and_records_lun() {
        let h = Harness::with_nodes(&[("node-1", "zone-1", 4)]).await;
        let volume_id = created_volume(&h, "vol-a", 0).await;
        let primary = h.create_attachment("vol-a", &volume_id, "node-1", AttachmentRole::Primary).await;
        let reconciler = AttachmentReconciler::new(h.ctx.clone());

        reconciler.reconcile(&primary).await.unwrap();
        let attached = h.attachment(&primary).await;
        assert_eq!(attached.state(), AttachmentState::Attached);
        assert_eq!(attached.current_role(), AttachmentRole::Primary);
        assert!(attached.lun().is_some());
        assert_eq!(h.ctx.state.available_slots("node-1"), Some(3));

        // Converged: nothing more is sent to the provider
        reconciler.reconcile(&primary).await.unwrap();
        assert_eq!(h.provisioner.calls("PublishVolume"), 1);
    }

    #[tokio::test]
    async fn test_primary_attach_places_replicas_on_distinct_nodes() {
        let h = Harness::with_nodes(&[
            ("node-1", "zone-1", 4),
            ("node-2", "zone-1", 4),
            ("node-3", "zone-1", 2),
            ("node-4", "zone-1", 8),
        ])
        .await;
        let volume_id = created_volume(&h, "vol-a", 2).await;
        h.create_attachment("vol-a", &volume_id, "node-1", AttachmentRole::Primary).await;
        let reconciler = AttachmentReconciler::new(h.ctx.clone());
        converge(&h, &reconciler).await;

        let attachments = h.store.list_attachments_for_volume("vol-a").await.unwrap();
        let primaries: Vec<_> = attachments
            .iter()
            .filter(|a| a.spec.role == AttachmentRole::Primary)
            .collect();
        let replicas: Vec<_> = attachments
            .iter()
            .filter(|a| a.spec.role == AttachmentRole::Replica)
            .collect();
        assert_eq!(primaries.len(), 1);
        assert_eq!(replicas.len(), 2);
        assert!(attachments.iter().all(|a| a.state() == AttachmentState::Attached));

        let nodes: BTreeSet<_> = attachments.iter().map(|a| a.spec.node_name.clone()).collect();
        assert_eq!(nodes.len(), 3);
        // Most free slots first: node-4 (8), then node-2 (4)
        assert!(nodes.contains("node-4"));
        assert!(nodes.contains("node-2"));
    }

    #[tokio::test]
    async fn test_replica_exhaustion_marks_failed_and_substitutes() {
        let h = Harness::with_nodes(&[
            ("node-1", "zone-1", 4),
            ("node-2", "zone-1", 8),
            ("node-3", "zone-1", 4),
        ])
        .await;
        let volume_id = created_volume(&h, "vol-a", 1).await;
        let replica = h.create_attachment("vol-a", &volume_id, "node-2", AttachmentRole::Replica).await;
        h.provisioner
            .fail_next("PublishVolume", 3, || Error::Unavailable("attach throttled".into()));
        let reconciler = AttachmentReconciler::new(h.ctx.clone());

        for _ in 0..3 {
            reconciler.reconcile(&replica).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let failed = h.attachment(&replica).await;
        assert_eq!(failed.state(), AttachmentState::AttachFailed);
        assert!(failed.status_annotations().has_intent(Intent::AttachFailed));
        assert_eq!(failed.status.unwrap().error.unwrap().code, "Unavailable");
        assert_eq!(h.ctx.state.available_slots("node-2"), Some(8));
        assert!(h.ctx.state.visited_nodes("vol-a").contains("node-2"));

        // Never auto-deleted; a substitute lands on a node not yet tried
        assert!(h.store.get_attachment(&replica).await.unwrap().is_some());
        let substitute = attachment_name("vol-a", "node-1");
        let alt = attachment_name("vol-a", "node-3");
        let exists = h.store.get_attachment(&substitute).await.unwrap().is_some()
            || h.store.get_attachment(&alt).await.unwrap().is_some();
        assert!(exists);

        // Terminal: further passes leave it alone
        assert_eq!(reconciler.reconcile(&replica).await.unwrap(), ReconcileOutcome::Done);
    }

    #[tokio::test]
    async fn test_conflicting_device_slot_undoes_attach() {
        let h = Harness::with_nodes(&[("node-1", "zone-1", 4)]).await;
        let id_a = created_volume(&h, "vol-a", 0).await;
        let id_b = created_volume(&h, "vol-b", 0).await;

        // Recorded as holding LUN 0 while the provider has nothing on the node
        let holder = h.create_attachment("vol-b", &id_b, "node-1", AttachmentRole::Primary).await;
        h.store
            .modify_attachment_status(&holder, &|s| {
                s.state = AttachmentState::Attached;
                s.detail = Some(AttachmentStatusDetail {
                    role: Some(AttachmentRole::Primary),
                    previous_role: None,
                    publish_context: [(LUN_KEY.to_string(), "0".to_string())].into(),
                });
            })
            .await
            .unwrap();

        let primary = h.create_attachment("vol-a", &id_a, "node-1", AttachmentRole::Primary).await;
        let reconciler = AttachmentReconciler::new(h.ctx.clone());

        assert!(reconciler.reconcile(&primary).await.unwrap().requeue());
        let pending = h.attachment(&primary).await;
        assert_eq!(pending.state(), AttachmentState::Pending);
        assert!(pending.status.unwrap().error.unwrap().message.contains("device slot 0"));
        assert_eq!(h.provisioner.calls("UnpublishVolume"), 1);
        assert_eq!(h.ctx.state.available_slots("node-1"), Some(4));

        for _ in 0..2 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            reconciler.reconcile(&primary).await.unwrap();
        }
        let failed = h.attachment(&primary).await;
        assert_eq!(failed.state(), AttachmentState::AttachFailed);
        assert_eq!(failed.status.unwrap().error.unwrap().code, "Internal");
        assert_eq!(h.provisioner.calls("UnpublishVolume"), 3);
        assert_eq!(h.attachment(&holder).await.lun(), Some("0"));
    }

    #[tokio::test]
    async fn test_unknown_outcome_is_queried_before_republishing() {
        let h = Harness::with_nodes(&[("node-1", "zone-1", 4)]).await;
        let volume_id = created_volume(&h, "vol-a", 0).await;
        let primary = h.create_attachment("vol-a", &volume_id, "node-1", AttachmentRole::Primary).await;
        h.provisioner.fail_next("WaitForAttach", 1, || Error::DeadlineExceeded {
            operation: "WaitForAttach".into(),
            after: Duration::from_secs(1),
        });
        let reconciler = AttachmentReconciler::new(h.ctx.clone());

        assert!(reconciler.reconcile(&primary).await.unwrap().requeue());
        assert_eq!(h.attachment(&primary).await.state(), AttachmentState::Pending);
        assert_eq!(h.ctx.state.available_slots("node-1"), Some(4));

        tokio::time::sleep(Duration::from_millis(20)).await;
        reconciler.reconcile(&primary).await.unwrap();
        assert_eq!(h.attachment(&primary).await.state(), AttachmentState::Attached);
        // The first publish did land; it is not repeated
        assert_eq!(h.provisioner.calls("PublishVolume"), 1);
    }

    #[tokio::test]
    async fn test_detach_request_releases_slot_and_removes_attachment() {
        let h = Harness::with_nodes(&[("node-1", "zone-1", 4), ("node-2", "zone-1", 4)]).await;
        let volume_id = created_volume(&h, "vol-a", 0).await;
        let replica = h.create_attachment("vol-a", &volume_id, "node-2", AttachmentRole::Replica).await;
        let reconciler = AttachmentReconciler::new(h.ctx.clone());
        reconciler.reconcile(&replica).await.unwrap();
        assert_eq!(h.ctx.state.available_slots("node-2"), Some(3));

        h.store
            .modify_attachment_status(&replica, &|s| {
                s.annotations.set_intent(Intent::DetachRequest, "test");
            })
            .await
            .unwrap();
        reconciler.reconcile(&replica).await.unwrap();

        assert!(h.store.get_attachment(&replica).await.unwrap().is_none());
        assert_eq!(h.ctx.state.available_slots("node-2"), Some(4));
        assert_eq!(h.provisioner.calls("UnpublishVolume"), 1);
        assert!(h.ctx.state.attachments_of("vol-a").is_empty());
    }

    #[tokio::test]
    async fn test_failed_role_change_holds_slot_until_detached() {
        let h = Harness::with_nodes(&[("node-1", "zone-1", 4)]).await;
        let volume_id = created_volume(&h, "vol-a", 0).await;
        let primary = h.create_attachment("vol-a", &volume_id, "node-1", AttachmentRole::Primary).await;
        let reconciler = AttachmentReconciler::new(h.ctx.clone());
        reconciler.reconcile(&primary).await.unwrap();
        assert_eq!(h.ctx.state.available_slots("node-1"), Some(3));

        h.store
            .modify_attachment_status(&primary, &|s| {
                s.annotations.set_intent(Intent::PromoteRequest, "test");
            })
            .await
            .unwrap();
        h.provisioner
            .fail_next("WaitForAttach", 3, || Error::Unavailable("attach state unknown".into()));
        for _ in 0..3 {
            reconciler.reconcile(&primary).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let failed = h.attachment(&primary).await;
        assert_eq!(failed.state(), AttachmentState::Attached);
        assert!(failed.status_annotations().has_intent(Intent::AttachFailed));
        assert!(failed.status_annotations().has_intent(Intent::DetachRequest));
        assert_eq!(h.ctx.state.available_slots("node-1"), Some(3));

        reconciler.reconcile(&primary).await.unwrap();
        assert!(h.store.get_attachment(&primary).await.unwrap().is_none());
        assert_eq!(h.ctx.state.available_slots("node-1"), Some(4));
        assert_eq!(h.provisioner.calls("UnpublishVolume"), 1);
    }

    #[tokio::test]
    async fn test_failover_promotes_oldest_replica() {
        let h = Harness::with_nodes(&[
            ("node-1", "zone-1", 4),
            ("node-2", "zone-1", 4),
            ("node-3", "zone-1", 4),
            ("node-4", "zone-1", 4),
        ])
        .await;
        let volume_id = created_volume(&h, "vol-a", 2).await;
        let primary = h.create_attachment("vol-a", &volume_id, "node-1", AttachmentRole::Primary).await;
        let older = h.create_attachment("vol-a", &volume_id, "node-3", AttachmentRole::Replica).await;
        let newer = h.create_attachment("vol-a", &volume_id, "node-2", AttachmentRole::Replica).await;
        let reconciler = AttachmentReconciler::new(h.ctx.clone());
        converge(&h, &reconciler).await;

        let promoted = reconciler.failover_primary("vol-a", "node-1").await.unwrap();
        assert_eq!(promoted.as_deref(), Some(older.as_str()));
        assert_eq!(h.ctx.metrics.failover_count(), 1);

        let old_primary = h.attachment(&primary).await;
        assert!(old_primary.status_annotations().has_intent(Intent::DetachRequest));
        converge(&h, &reconciler).await;

        let promoted = h.attachment(&older).await;
        assert_eq!(promoted.current_role(), AttachmentRole::Primary);
        assert_eq!(promoted.status.unwrap().detail.unwrap().previous_role, Some(AttachmentRole::Replica));
        assert!(!h.attachment(&older).await.status_annotations().has_intent(Intent::PromoteRequest));
        assert_eq!(h.attachment(&newer).await.current_role(), AttachmentRole::Replica);
        assert!(h.store.get_attachment(&primary).await.unwrap().is_none());

        // Redundancy restored on the remaining node
        let replicas: Vec<_> = h
            .store
            .list_attachments_for_volume("vol-a")
            .await
            .unwrap()
            .into_iter()
            .filter(|a| a.spec.role == AttachmentRole::Replica)
            .collect();
        assert_eq!(replicas.len(), 2);
        assert!(replicas.iter().any(|a| a.spec.node_name == "node-4"));
    }

    #[tokio::test]
    async fn test_attach_waits_for_volume() {
        let h = Harness::with_nodes(&[("node-1", "zone-1", 4)]).await;
        h.create_volume("vol-a", 10 * GIB, 0).await;
        let primary = h.create_attachment("vol-a", "", "node-1", AttachmentRole::Primary).await;
        let reconciler = AttachmentReconciler::new(h.ctx.clone());

        let outcome = reconciler.reconcile(&primary).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::RequeueAfter(DEPENDENCY_POLL_INTERVAL));
        assert_eq!(h.provisioner.calls("PublishVolume"), 0);

        super::super::VolumeReconciler::new(h.ctx.clone())
            .reconcile("vol-a")
            .await
            .unwrap();
        reconciler.reconcile(&primary).await.unwrap();
        let attached = h.attachment(&primary).await;
        assert_eq!(attached.state(), AttachmentState::Attached);
        assert!(!attached.spec.volume_id.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_attach_serializes_provider_calls() {
        let h = Harness::with_nodes(&[("node-1", "zone-1", 8), ("node-2", "zone-1", 8)]).await;
        h.provisioner.set_delay(Duration::from_millis(10));
        let volume_id = created_volume(&h, "vol-a", 0).await;
        let first = h.create_attachment("vol-a", &volume_id, "node-1", AttachmentRole::Primary).await;
        let second = h.create_attachment("vol-a", &volume_id, "node-2", AttachmentRole::Replica).await;
        let reconciler = std::sync::Arc::new(AttachmentReconciler::new(h.ctx.clone()));

        let mut handles = Vec::new();
        for i in 0..12 {
            let reconciler = reconciler.clone();
            let name = if i % 2 == 0 { first.clone() } else { second.clone() };
            handles.push(tokio::spawn(async move { reconciler.reconcile(&name).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(h.provisioner.max_concurrency_per_resource(), 1);
        assert_eq!(h.provisioner.calls("PublishVolume"), 2);
    }
}
