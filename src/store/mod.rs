//! Resource store adapters
//!
//! - [`MemoryStore`]: in-process store used in standalone mode and tests
//! - [`KubeStore`]: DiskVolume/DiskVolumeAttachment custom resources plus
//!   the cluster's pods, nodes and claims through the Kubernetes API
//!
//! Both publish a [`ResourceEvent`] for every change they observe so the
//! controller can reconcile what was touched.

pub mod kubernetes;
pub mod memory;

pub use kubernetes::KubeStore;
pub use memory::MemoryStore;

use crate::controller::ResourceKey;
use tokio::sync::broadcast;

/// Capacity of the change-notification channel
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// A resource was created, changed or removed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceEvent {
    Volume { name: String },
    Attachment { name: String, volume: String },
    /// Keyed `namespace/name`
    Pod { key: String },
    Node { name: String },
}

impl ResourceEvent {
    /// Reconcile targets affected by the change.
    ///
    /// An attachment change also wakes its volume, whose deletion waits on
    /// the attachments going away.
    pub fn keys(&self) -> Vec<ResourceKey> {
        match self {
            ResourceEvent::Volume { name } => vec![ResourceKey::volume(name.as_str())],
            ResourceEvent::Attachment { name, volume } => vec![
                ResourceKey::attachment(name.as_str()),
                ResourceKey::volume(volume.as_str()),
            ],
            ResourceEvent::Pod { key } => {
                vec![ResourceKey::new(crate::controller::ResourceKind::Pod, key.as_str())]
            }
            ResourceEvent::Node { name } => vec![ResourceKey::node(name.as_str())],
        }
    }
}

/// Source of change notifications
pub trait EventSource: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<ResourceEvent>;
}
