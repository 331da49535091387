//! Reconciliation engine
//!
//! One reconciler per [`ResourceKind`], all sharing a [`ControllerContext`].
//! Volume and attachment reconcilers turn the observed resource into an
//! operation, queue it on the resource's [`OperationQueues`] entry and
//! drain the queue while holding it, so at most one provisioner call per
//! resource is ever in flight.

pub mod attachment;
pub mod config;
pub mod dispatcher;
pub mod manager;
pub mod metrics;
pub mod node;
pub mod placement;
pub mod pod;
pub mod recovery;
pub mod volume;

pub use attachment::AttachmentReconciler;
pub use config::ControllerConfig;
pub use dispatcher::Dispatcher;
pub use manager::Controller;
pub use metrics::ControllerMetrics;
pub use node::NodeReconciler;
pub use placement::{PlacementEngine, PlacementRequest, PlacementResult, PodConstraints};
pub use pod::PodReconciler;
pub use recovery::{RecoveryCoordinator, RecoveryReport};
pub use volume::VolumeReconciler;

use crate::domain::ports::{
    AttachmentProvisionerRef, ClusterViewRef, ResourceStoreRef, VolumeProvisionerRef,
};
use crate::error::{Error, Result};
use crate::state::{OperationKind, OperationQueues, OperationRequest, SharedState};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

/// Poll interval while waiting on another resource to converge
pub const DEPENDENCY_POLL_INTERVAL: Duration = Duration::from_secs(2);

// =============================================================================
// Resource Kind
// =============================================================================

/// Resource kinds the controller reconciles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Volume,
    Attachment,
    Pod,
    Node,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::Volume,
        ResourceKind::Attachment,
        ResourceKind::Pod,
        ResourceKind::Node,
    ];
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Volume => write!(f, "DiskVolume"),
            ResourceKind::Attachment => write!(f, "DiskVolumeAttachment"),
            ResourceKind::Pod => write!(f, "Pod"),
            ResourceKind::Node => write!(f, "Node"),
        }
    }
}

/// Identifies one reconcile target; pods are keyed `namespace/name`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub kind: ResourceKind,
    pub name: String,
}

impl ResourceKey {
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    pub fn volume(name: impl Into<String>) -> Self {
        Self::new(ResourceKind::Volume, name)
    }

    pub fn attachment(name: impl Into<String>) -> Self {
        Self::new(ResourceKind::Attachment, name)
    }

    pub fn pod(namespace: &str, name: &str) -> Self {
        Self::new(ResourceKind::Pod, format!("{}/{}", namespace, name))
    }

    pub fn node(name: impl Into<String>) -> Self {
        Self::new(ResourceKind::Node, name)
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

// =============================================================================
// Reconcile Outcome
// =============================================================================

/// What the caller should do after a successful reconcile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Converged or waiting on an external change
    Done,
    /// Run again after the delay
    RequeueAfter(Duration),
}

impl ReconcileOutcome {
    pub fn requeue(&self) -> bool {
        matches!(self, ReconcileOutcome::RequeueAfter(_))
    }

    pub fn requeue_after(&self) -> Option<Duration> {
        match self {
            ReconcileOutcome::Done => None,
            ReconcileOutcome::RequeueAfter(d) => Some(*d),
        }
    }

    /// Keep the earliest requested requeue
    pub fn merge(self, other: ReconcileOutcome) -> ReconcileOutcome {
        match (self.requeue_after(), other.requeue_after()) {
            (Some(a), Some(b)) => ReconcileOutcome::RequeueAfter(a.min(b)),
            (Some(a), None) => ReconcileOutcome::RequeueAfter(a),
            (None, Some(b)) => ReconcileOutcome::RequeueAfter(b),
            (None, None) => ReconcileOutcome::Done,
        }
    }
}

// =============================================================================
// Reconciler Trait
// =============================================================================

/// Idempotent convergence of one resource kind
#[async_trait]
pub trait Reconciler: Send + Sync {
    fn kind(&self) -> ResourceKind;

    /// Converge the named resource; safe to call redundantly
    async fn reconcile(&self, name: &str) -> Result<ReconcileOutcome>;
}

pub type ReconcilerRef = Arc<dyn Reconciler>;

// =============================================================================
// Controller Context
// =============================================================================

/// Handles shared by every reconciler
pub struct ControllerContext {
    pub config: ControllerConfig,
    pub state: Arc<SharedState>,
    pub store: ResourceStoreRef,
    pub cluster: ClusterViewRef,
    pub volume_provisioner: VolumeProvisionerRef,
    pub attachment_provisioner: AttachmentProvisionerRef,
    pub metrics: ControllerMetrics,
}

impl ControllerContext {
    /// Run a provisioner call under the configured deadline.
    ///
    /// Failures are wrapped with the operation and resource name. A timeout
    /// becomes `DeadlineExceeded`, meaning the call may still have applied.
    pub async fn call_provisioner<T, F>(&self, operation: &str, resource: &str, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let timeout = self.config.operation_timeout();
        let started = Instant::now();
        let result = match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(Error::DeadlineExceeded {
                operation: operation.to_string(),
                after: timeout,
            }),
        };
        self.metrics
            .observe_provisioner_call(operation, result.is_ok(), started.elapsed());
        result.map_err(|e| Error::provisioner(operation, resource, e))
    }
}

pub type ContextRef = Arc<ControllerContext>;

// =============================================================================
// Queue Draining
// =============================================================================

/// Queue `kind` for `name` and, if no other worker holds the resource,
/// execute queued requests in order until the queue is empty.
///
/// A worker that finds the resource held returns `Done`: the holder picks up
/// the new request before it lets go.
pub(crate) async fn drain_queue<F, Fut>(
    queues: &OperationQueues,
    name: &str,
    kind: OperationKind,
    mut execute: F,
) -> Result<ReconcileOutcome>
where
    F: FnMut(OperationRequest) -> Fut,
    Fut: Future<Output = Result<ReconcileOutcome>>,
{
    queues.enqueue(name, kind);
    let Some(mut request) = queues.try_lock(name) else {
        trace!(resource = %name, operation = %kind, "Resource held by another worker");
        return Ok(ReconcileOutcome::Done);
    };

    let mut outcome = ReconcileOutcome::Done;
    loop {
        match execute(request).await {
            Ok(next) => outcome = outcome.merge(next),
            Err(e) => {
                queues.release(name);
                return Err(e);
            }
        }
        match queues.unlock(name) {
            Some(next) => request = next,
            None => return Ok(outcome),
        }
    }
}
