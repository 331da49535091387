//! Volume Reconciler
//!
//! Drives a DiskVolume through its lifecycle:
//!
//! ```text
//! Pending -> Creating -> Created | CreationFailed
//! Created -> Updating -> Created | UpdateFailed
//! *       -> Deleting -> (finalizer removed) | DeletionFailed
//! ```
//!
//! Deletion waits until every attachment of the volume is gone; the provider
//! disk is only deleted when the volume carries the delete-request intent.

use super::{drain_queue, ContextRef, ReconcileOutcome, Reconciler, ResourceKind, DEPENDENCY_POLL_INTERVAL};
use crate::crd::{
    AccessType, CapacityRange, DiskVolume, Intent, IntentSet, ResourceError, VolumeState,
    VolumeStatusDetail,
};
use crate::domain::ports::CreateVolumeRequest;
use crate::error::{Error, ErrorCode, Result};
use crate::state::{OperationKind, OperationRequest, RetryDecision, RetryTracker};
use async_trait::async_trait;
use kube::ResourceExt;
use tracing::{debug, error, info, warn};

pub struct VolumeReconciler {
    ctx: ContextRef,
    retries: RetryTracker,
}

impl VolumeReconciler {
    pub fn new(ctx: ContextRef) -> Self {
        let retries = RetryTracker::new(ctx.config.backoff_policy());
        Self { ctx, retries }
    }

    /// Operation the volume needs next, if any
    pub fn next_operation(volume: &DiskVolume) -> Option<OperationKind> {
        let state = volume.state();
        if volume.is_deleting() {
            return (volume.has_finalizer() && state != VolumeState::DeletionFailed)
                .then_some(OperationKind::Delete);
        }
        match state {
            VolumeState::Pending if !volume.is_inline() => Some(OperationKind::Create),
            VolumeState::Created if volume.needs_expansion() => Some(OperationKind::Expand),
            _ => None,
        }
    }

    /// Check the request before anything is sent to the provider
    pub fn validate(volume: &DiskVolume) -> Result<()> {
        if volume.spec.volume_name.is_empty() {
            return Err(Error::InvalidArgument("volume name must not be empty".into()));
        }
        volume.spec.capacity_range.validate()?;
        if volume.spec.volume_capability.is_empty() {
            return Err(Error::InvalidArgument(
                "at least one volume capability is required".into(),
            ));
        }
        if let Some(cap) = volume
            .spec
            .volume_capability
            .iter()
            .find(|c| c.access_type == AccessType::Block && c.fs_type.is_some())
        {
            return Err(Error::InvalidArgument(format!(
                "block access cannot carry a filesystem type ({:?})",
                cap.fs_type
            )));
        }
        Ok(())
    }

    /// Record a capacity request, rejected while another operation runs
    pub async fn request_expansion(&self, name: &str, capacity: CapacityRange) -> Result<DiskVolume> {
        let mut volume = self
            .ctx
            .store
            .get_volume(name)
            .await?
            .ok_or_else(|| Error::not_found("DiskVolume", name))?;

        if volume.state().is_transient() || self.ctx.state.volume_queues.is_active(name) {
            return Err(Error::aborted("DiskVolume", name));
        }
        if volume.state() != VolumeState::Created {
            return Err(Error::InvalidArgument(format!(
                "volume {} is {} and cannot be expanded",
                name,
                volume.state()
            )));
        }
        capacity.validate()?;
        if capacity.required_bytes < volume.spec.capacity_range.required_bytes {
            return Err(Error::InvalidArgument(format!(
                "cannot shrink volume {} from {} to {} bytes",
                name, volume.spec.capacity_range.required_bytes, capacity.required_bytes
            )));
        }

        volume.spec.capacity_range = capacity;
        self.ctx.store.update_volume(&volume).await
    }

    fn forget(&self, name: &str) {
        self.ctx.state.volume_queues.remove_queue(name);
        self.ctx.state.forget_volume(name);
        self.retries.reset(name);
    }

    async fn execute(&self, name: &str, request: OperationRequest) -> Result<ReconcileOutcome> {
        let Some(volume) = self.ctx.store.get_volume(name).await? else {
            debug!(volume = %name, operation = %request.kind, "Dropping request for deleted volume");
            return Ok(ReconcileOutcome::Done);
        };
        if Self::next_operation(&volume) != Some(request.kind) {
            debug!(volume = %name, operation = %request.kind, "Request no longer applies");
            return Ok(ReconcileOutcome::Done);
        }

        match request.kind {
            OperationKind::Create => self.create(volume).await,
            OperationKind::Expand => self.expand(volume).await,
            OperationKind::Delete => self.delete(volume).await,
            other => {
                warn!(volume = %name, operation = %other, "Unsupported volume operation");
                Ok(ReconcileOutcome::Done)
            }
        }
    }

    // =========================================================================
    // Create
    // =========================================================================

    async fn create(&self, volume: DiskVolume) -> Result<ReconcileOutcome> {
        let name = volume.name_any();
        let store = &self.ctx.store;

        if let Err(err) = Self::validate(&volume) {
            warn!(volume = %name, error = %err, "Rejecting invalid volume");
            let record = ResourceError::from_error(&err, &name);
            store
                .modify_volume_status(&name, &|s| {
                    s.state = VolumeState::CreationFailed;
                    s.error = Some(record.clone());
                })
                .await?;
            return Err(err);
        }

        if !volume.has_finalizer() {
            store
                .modify_volume(&name, &|v| {
                    v.add_finalizer();
                })
                .await?;
        }
        let volume = store
            .modify_volume_status(&name, &|s| s.state = VolumeState::Creating)
            .await?;

        info!(volume = %name, capacity = volume.spec.capacity_range.target_bytes(), "Creating volume");
        let request = CreateVolumeRequest::from_volume(&volume);
        let result = self
            .ctx
            .call_provisioner(
                "CreateVolume",
                &name,
                self.ctx.volume_provisioner.create_volume(request),
            )
            .await;

        match result {
            Ok(detail) => self.finish_create(&volume, detail).await,
            Err(err) if err.code() == ErrorCode::AlreadyExists => {
                let existing = volume.status.as_ref().and_then(|s| s.detail.clone());
                match existing.filter(|d| !d.volume_id.is_empty()) {
                    Some(detail) => self.finish_create(&volume, detail).await,
                    None => {
                        self.handle_failure(&name, err, VolumeState::Pending, VolumeState::CreationFailed)
                            .await
                    }
                }
            }
            Err(err) => {
                self.handle_failure(&name, err, VolumeState::Pending, VolumeState::CreationFailed)
                    .await
            }
        }
    }

    async fn finish_create(
        &self,
        volume: &DiskVolume,
        detail: VolumeStatusDetail,
    ) -> Result<ReconcileOutcome> {
        let name = volume.name_any();
        if let Some(existing) = volume.volume_id() {
            if existing != detail.volume_id {
                let err = Error::Internal(format!(
                    "provider returned volume ID {} but {} is already recorded",
                    detail.volume_id, existing
                ));
                return self
                    .handle_failure(&name, err, VolumeState::Pending, VolumeState::CreationFailed)
                    .await;
            }
        }

        let volume_id = detail.volume_id.clone();
        self.ctx
            .store
            .modify_volume_status(&name, &|s| {
                s.state = VolumeState::Created;
                s.detail = Some(detail.clone());
                s.error = None;
            })
            .await?;
        self.retries.reset(&name);

        info!(volume = %name, volume_id = %volume_id, "Volume created");
        Ok(ReconcileOutcome::Done)
    }

    // =========================================================================
    // Expand
    // =========================================================================

    async fn expand(&self, volume: DiskVolume) -> Result<ReconcileOutcome> {
        let name = volume.name_any();
        let Some(volume_id) = volume.volume_id().map(str::to_string) else {
            return Ok(ReconcileOutcome::Done);
        };
        let from = volume.status_capacity_bytes();
        let capacity = volume.spec.capacity_range;

        self.ctx
            .store
            .modify_volume_status(&name, &|s| s.state = VolumeState::Updating)
            .await?;

        info!(volume = %name, from, to = capacity.target_bytes(), "Expanding volume");
        let result = self
            .ctx
            .call_provisioner(
                "ExpandVolume",
                &name,
                self.ctx
                    .volume_provisioner
                    .expand_volume(&volume_id, capacity, &volume.spec.secrets),
            )
            .await;

        let detail = match result {
            Ok(detail) if !detail.volume_id.is_empty() && detail.volume_id != volume_id => {
                let err = Error::Internal(format!(
                    "expansion of {} reported a different volume ID {}",
                    volume_id, detail.volume_id
                ));
                return self
                    .handle_failure(&name, err, VolumeState::Created, VolumeState::UpdateFailed)
                    .await;
            }
            Ok(detail) => detail,
            Err(err) => {
                return self
                    .handle_failure(&name, err, VolumeState::Created, VolumeState::UpdateFailed)
                    .await
            }
        };

        let new_capacity = detail.capacity_bytes.max(capacity.required_bytes);
        self.ctx
            .store
            .modify_volume_status(&name, &|s| {
                if let Some(current) = s.detail.as_mut() {
                    current.capacity_bytes = new_capacity;
                }
                s.state = VolumeState::Created;
                s.error = None;
            })
            .await?;
        self.retries.reset(&name);

        info!(volume = %name, capacity = new_capacity, "Volume expanded");
        Ok(ReconcileOutcome::Done)
    }

    // =========================================================================
    // Delete
    // =========================================================================

    async fn delete(&self, volume: DiskVolume) -> Result<ReconcileOutcome> {
        let name = volume.name_any();
        let store = &self.ctx.store;

        let attachments = store.list_attachments_for_volume(&name).await?;
        for tracked in self.ctx.state.attachments_of(&name) {
            if !attachments.iter().any(|a| a.name_any() == tracked) {
                self.ctx.state.untrack_attachment(&name, &tracked);
            }
        }

        if !attachments.is_empty() {
            for attachment in attachments {
                let attachment_name = attachment.name_any();
                self.ctx.state.track_attachment(&name, &attachment_name);
                if attachment.status_annotations().has_intent(Intent::DetachRequest) {
                    continue;
                }
                store
                    .modify_attachment_status(&attachment_name, &|s| {
                        s.annotations.set_intent(Intent::DetachRequest, "volume-deletion");
                    })
                    .await?;
                info!(volume = %name, attachment = %attachment_name, "Requested detach before volume deletion");
            }
            debug!(volume = %name, "Waiting for attachments to be removed");
            return Ok(ReconcileOutcome::RequeueAfter(DEPENDENCY_POLL_INTERVAL));
        }

        let resume_state = volume.state().recovery_target();
        let volume = store
            .modify_volume_status(&name, &|s| s.state = VolumeState::Deleting)
            .await?;

        let delete_disk = volume.status_annotations().has_intent(Intent::DeleteRequest);
        match (delete_disk, volume.volume_id()) {
            (true, Some(volume_id)) => {
                info!(volume = %name, volume_id = %volume_id, "Deleting disk");
                let result = self
                    .ctx
                    .call_provisioner(
                        "DeleteVolume",
                        &name,
                        self.ctx
                            .volume_provisioner
                            .delete_volume(volume_id, &volume.spec.secrets),
                    )
                    .await;
                match result {
                    Ok(()) => {}
                    Err(err) if err.code() == ErrorCode::NotFound => {
                        debug!(volume = %name, "Disk already gone");
                    }
                    Err(err) => {
                        return self
                            .handle_failure(&name, err, resume_state, VolumeState::DeletionFailed)
                            .await
                    }
                }
            }
            _ => debug!(volume = %name, "Keeping provider disk"),
        }

        store
            .modify_volume(&name, &|v| {
                v.remove_finalizer();
            })
            .await?;
        self.forget(&name);

        info!(volume = %name, "Volume deleted");
        Ok(ReconcileOutcome::Done)
    }

    // =========================================================================
    // Failure handling
    // =========================================================================

    /// Record the error on status and either schedule a retry (going back to
    /// `retry_state`) or land in `failed_state`.
    async fn handle_failure(
        &self,
        name: &str,
        err: Error,
        retry_state: VolumeState,
        failed_state: VolumeState,
    ) -> Result<ReconcileOutcome> {
        let record = ResourceError::from_error(&err, name);

        let (state, outcome) = if err.is_retryable() {
            match self.retries.record_failure(name, err.is_outcome_unknown()) {
                RetryDecision::RetryAfter(delay) => {
                    warn!(volume = %name, error = %err, retry_in = ?delay, "Volume operation failed, will retry");
                    (retry_state, ReconcileOutcome::RequeueAfter(delay))
                }
                RetryDecision::Exhausted { failures } => {
                    error!(volume = %name, error = %err, failures, "Volume operation failed permanently");
                    self.retries.reset(name);
                    (failed_state, ReconcileOutcome::Done)
                }
            }
        } else {
            error!(volume = %name, error = %err, "Volume operation failed");
            self.retries.reset(name);
            (failed_state, ReconcileOutcome::Done)
        };

        self.ctx
            .store
            .modify_volume_status(name, &|s| {
                s.state = state;
                s.error = Some(record.clone());
            })
            .await?;
        Ok(outcome)
    }
}

#[async_trait]
impl Reconciler for VolumeReconciler {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Volume
    }

    async fn reconcile(&self, name: &str) -> Result<ReconcileOutcome> {
        let Some(volume) = self.ctx.store.get_volume(name).await? else {
            self.forget(name);
            return Ok(ReconcileOutcome::Done);
        };
        let Some(kind) = Self::next_operation(&volume) else {
            return Ok(ReconcileOutcome::Done);
        };
        if let Some(wait) = self.retries.remaining_backoff(name) {
            debug!(volume = %name, wait = ?wait, "Backing off");
            return Ok(ReconcileOutcome::RequeueAfter(wait));
        }

        drain_queue(&self.ctx.state.volume_queues, name, kind, move |request| {
            self.execute(name, request)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::ResourceStore;
    use crate::crd::{DiskVolumeAttachment, AttachmentRole};
    use crate::testing::{Harness, GIB};
    use assert_matches::assert_matches;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let h = Harness::new();
        h.create_volume("vol-a", 10 * GIB, 0).await;
        let reconciler = VolumeReconciler::new(h.ctx.clone());

        reconciler.reconcile("vol-a").await.unwrap();
        let created = h.volume("vol-a").await;
        assert_eq!(created.state(), VolumeState::Created);
        assert!(created.volume_id().is_some());
        assert!(created.has_finalizer());

        reconciler.reconcile("vol-a").await.unwrap();
        let again = h.volume("vol-a").await;
        assert_eq!(again.status, created.status);
        assert_eq!(h.provisioner.calls("CreateVolume"), 1);
    }

    #[tokio::test]
    async fn test_expand_updates_status_capacity() {
        let h = Harness::new();
        h.create_volume("vol-a", 10 * GIB, 0).await;
        let reconciler = VolumeReconciler::new(h.ctx.clone());
        reconciler.reconcile("vol-a").await.unwrap();
        assert_eq!(h.volume("vol-a").await.status_capacity_bytes(), 10 * GIB);

        reconciler
            .request_expansion("vol-a", CapacityRange::new(20 * GIB))
            .await
            .unwrap();
        reconciler.reconcile("vol-a").await.unwrap();

        let expanded = h.volume("vol-a").await;
        assert_eq!(expanded.state(), VolumeState::Created);
        assert_eq!(expanded.status_capacity_bytes(), 20 * GIB);
        assert_eq!(h.provisioner.calls("ExpandVolume"), 1);
    }

    #[tokio::test]
    async fn test_expand_rejected_while_transient() {
        let h = Harness::new();
        h.create_volume("vol-a", 10 * GIB, 0).await;
        let reconciler = VolumeReconciler::new(h.ctx.clone());

        assert_matches!(
            reconciler
                .request_expansion("vol-a", CapacityRange::new(20 * GIB))
                .await,
            Err(Error::InvalidArgument(_))
        );

        let mut volume = h.volume("vol-a").await;
        volume.status_mut().state = VolumeState::Creating;
        h.store.update_volume_status(&volume).await.unwrap();
        assert_matches!(
            reconciler
                .request_expansion("vol-a", CapacityRange::new(20 * GIB))
                .await,
            Err(Error::Aborted { .. })
        );
    }

    #[tokio::test]
    async fn test_invalid_volume_fails_without_provider_call() {
        let h = Harness::new();
        let mut volume = h.create_volume("vol-bad", 10 * GIB, 0).await;
        volume.spec.volume_capability.clear();
        h.store.update_volume(&volume).await.unwrap();

        let reconciler = VolumeReconciler::new(h.ctx.clone());
        assert_matches!(
            reconciler.reconcile("vol-bad").await,
            Err(Error::InvalidArgument(_))
        );

        let failed = h.volume("vol-bad").await;
        assert_eq!(failed.state(), VolumeState::CreationFailed);
        assert_eq!(failed.status.unwrap().error.unwrap().code, "InvalidArgument");
        assert_eq!(h.provisioner.calls("CreateVolume"), 0);

        // Terminal: another pass does nothing
        assert_eq!(
            reconciler.reconcile("vol-bad").await.unwrap(),
            ReconcileOutcome::Done
        );
    }

    #[tokio::test]
    async fn test_transient_failures_retry_then_fail() {
        let h = Harness::new();
        h.create_volume("vol-a", 10 * GIB, 0).await;
        h.provisioner
            .fail_next("CreateVolume", 10, || Error::Unavailable("throttled".into()));
        let reconciler = VolumeReconciler::new(h.ctx.clone());

        let outcome = reconciler.reconcile("vol-a").await.unwrap();
        assert!(outcome.requeue());
        let pending = h.volume("vol-a").await;
        assert_eq!(pending.state(), VolumeState::Pending);
        let error = pending.status.unwrap().error.unwrap();
        assert_eq!(error.code, "Unavailable");
        assert!(error.retryable);

        // max_retries is 3 in the harness
        for _ in 0..2 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            reconciler.reconcile("vol-a").await.unwrap();
        }
        assert_eq!(h.volume("vol-a").await.state(), VolumeState::CreationFailed);
        assert_eq!(h.provisioner.calls("CreateVolume"), 3);
    }

    #[tokio::test]
    async fn test_delete_waits_for_attachments() {
        let h = Harness::new();
        h.create_volume("vol-a", 10 * GIB, 1).await;
        let reconciler = VolumeReconciler::new(h.ctx.clone());
        reconciler.reconcile("vol-a").await.unwrap();
        let volume_id = h.volume("vol-a").await.volume_id().unwrap().to_string();

        let replica = DiskVolumeAttachment::for_volume(
            "vol-a",
            &volume_id,
            "node-2",
            AttachmentRole::Replica,
            BTreeMap::new(),
        );
        h.store.create_attachment(&replica).await.unwrap();

        h.store.delete_volume("vol-a").await.unwrap();
        let outcome = reconciler.reconcile("vol-a").await.unwrap();
        assert!(outcome.requeue());

        let volume = h.volume("vol-a").await;
        assert!(volume.has_finalizer());
        let replica = h.attachment(&replica.name_any()).await;
        assert!(replica.status_annotations().has_intent(Intent::DetachRequest));

        // Attachment goes away, then the finalizer may be dropped
        h.store.delete_attachment(&replica.name_any()).await.unwrap();
        h.store
            .modify_attachment(&replica.name_any(), &|a| {
                a.remove_finalizer();
            })
            .await
            .unwrap();

        reconciler.reconcile("vol-a").await.unwrap();
        assert!(h.store.get_volume("vol-a").await.unwrap().is_none());
        // No delete-request intent: the disk is retained
        assert_eq!(h.provisioner.calls("DeleteVolume"), 0);
    }

    #[tokio::test]
    async fn test_delete_request_removes_disk() {
        let h = Harness::new();
        h.create_volume("vol-a", 10 * GIB, 0).await;
        let reconciler = VolumeReconciler::new(h.ctx.clone());
        reconciler.reconcile("vol-a").await.unwrap();

        let mut volume = h.volume("vol-a").await;
        volume
            .status_mut()
            .annotations
            .set_intent(Intent::DeleteRequest, "controller");
        h.store.update_volume_status(&volume).await.unwrap();
        h.store.delete_volume("vol-a").await.unwrap();

        reconciler.reconcile("vol-a").await.unwrap();
        assert!(h.store.get_volume("vol-a").await.unwrap().is_none());
        assert_eq!(h.provisioner.calls("DeleteVolume"), 1);
        assert!(!h.ctx.state.volume_queues.contains("vol-a"));
    }

    #[tokio::test]
    async fn test_concurrent_reconciles_serialize_provider_calls() {
        let h = Harness::new();
        h.provisioner.set_delay(Duration::from_millis(20));
        h.create_volume("vol-a", 10 * GIB, 0).await;
        h.create_volume("vol-b", 10 * GIB, 0).await;
        let reconciler = Arc::new(VolumeReconciler::new(h.ctx.clone()));

        let mut handles = Vec::new();
        for i in 0..16 {
            let reconciler = reconciler.clone();
            let name = if i % 2 == 0 { "vol-a" } else { "vol-b" };
            handles.push(tokio::spawn(async move { reconciler.reconcile(name).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(h.provisioner.max_concurrency_per_resource(), 1);
        assert_eq!(h.provisioner.calls("CreateVolume"), 2);
        assert_eq!(h.volume("vol-a").await.state(), VolumeState::Created);
        assert_eq!(h.volume("vol-b").await.state(), VolumeState::Created);
    }
}
