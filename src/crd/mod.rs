//! Custom Resource Definitions persisted by the controller
//!
//! This module contains the CRD types:
//! - DiskVolume: one provisioned block disk and its lifecycle
//! - DiskVolumeAttachment: one volume/node binding with a Primary or Replica role

pub mod attachment;
pub mod common;
pub mod intent;
pub mod volume;

pub use attachment::*;
pub use common::*;
pub use intent::*;
pub use volume::*;

/// Finalizer held on volumes until their attachments are gone
pub const VOLUME_FINALIZER: &str = "disk.replicated.io/volume-finalizer";

/// Finalizer held on attachments until the provider detach completed
pub const ATTACHMENT_FINALIZER: &str = "disk.replicated.io/attachment-finalizer";

pub const VOLUME_NAME_LABEL: &str = "disk.replicated.io/volume-name";
pub const NODE_NAME_LABEL: &str = "disk.replicated.io/node-name";
pub const ROLE_LABEL: &str = "disk.replicated.io/role";

/// Metadata annotation recording the schema version a resource was written with
pub const API_VERSION_ANNOTATION: &str = "disk.replicated.io/api-version";

/// Legacy metadata annotation naming the PersistentVolume a disk backs
pub const PERSISTENT_VOLUME_ANNOTATION: &str = "disk.replicated.io/persistent-volume";

/// Schema version written by this controller
pub const CURRENT_API_VERSION: &str = "v1beta2";

/// Oldest schema version the recovery pass still converts
pub const LEGACY_API_VERSION: &str = "v1beta1";

/// Annotations on metadata that belong to the system rather than the user
pub fn is_system_annotation(key: &str) -> bool {
    key == API_VERSION_ANNOTATION
        || key == PERSISTENT_VOLUME_ANNOTATION
        || key.starts_with("kubectl.kubernetes.io/")
}
