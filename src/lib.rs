//! Replicated Disk Operator - Attachment Scheduling and Replica Management
//!
//! Reconciles network-attached block volumes and their node attachments.
//! Each volume has one Primary attachment serving I/O and up to
//! `maxMountReplicaCount` standby Replica attachments that can be promoted
//! when the primary's node is lost.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                 Watch streams (DiskVolume, Attachment, Pod, Node)            │
//! └───────────────────────────────────┬─────────────────────────────────────────┘
//!                                     │ ResourceEvent
//! ┌───────────────────────────────────┴─────────────────────────────────────────┐
//! │                    Dispatcher (de-duplicating worker pool)                   │
//! ├──────────────────┬──────────────────┬──────────────────┬────────────────────┤
//! │ Volume           │ Attachment       │ Pod              │ Node               │
//! │ Reconciler       │ Reconciler       │ Reconciler       │ Reconciler         │
//! └────────┬─────────┴────────┬─────────┴────────┬─────────┴─────────┬──────────┘
//!          │                  │                  │                   │
//! ┌────────┴──────────────────┴──────────────────┴───────────────────┴──────────┐
//! │   Shared State: operation queues · node slots · claim/pod indexes            │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │   Ports: VolumeProvisioner · AttachmentProvisioner · ResourceStore · Cluster │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controller`]: Reconcilers, placement, recovery, dispatcher
//! - [`crd`]: DiskVolume and DiskVolumeAttachment resources
//! - [`domain`]: Capability traits the controller is written against
//! - [`state`]: Shared in-memory state, operation queues, retry tracking
//! - [`store`]: In-memory and Kubernetes resource stores
//! - [`provisioner`]: Simulated disk provider
//! - [`error`]: Error types and handling

pub mod controller;
pub mod crd;
pub mod domain;
pub mod error;
pub mod provisioner;
pub mod state;
pub mod store;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use controller::{
    Controller, ControllerConfig, ControllerContext, ControllerMetrics, Dispatcher, ReconcileOutcome,
    Reconciler, RecoveryReport, ResourceKey, ResourceKind,
};

pub use crd::{
    AttachmentRole, AttachmentState, CapacityRange, DiskVolume, DiskVolumeAttachment,
    DiskVolumeAttachmentSpec, DiskVolumeSpec, Intent, VolumeState,
};

pub use domain::ports::{AttachmentProvisioner, ClusterView, ResourceStore, VolumeProvisioner};

pub use error::{Error, ErrorAction, ErrorCode, Result};

pub use provisioner::{SimulatedConfig, SimulatedProvisioner};

pub use state::{OperationQueues, RetryTracker, SharedState};

pub use store::{EventSource, KubeStore, MemoryStore, ResourceEvent};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
