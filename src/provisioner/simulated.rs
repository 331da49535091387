//! Simulated Disk Provider
//!
//! Keeps disks and their node attachments in memory. Attach hands out the
//! lowest free LUN on the node; shared disks may be attached to several
//! nodes at once, which is what replicas rely on.

use super::round_up_gib;
use crate::controller::config::DEFAULT_TOPOLOGY_KEY;
use crate::crd::{CapacityRange, ContentSourceKind, Topology, VolumeStatusDetail, LUN_KEY};
use crate::domain::ports::{
    AttachmentProvisioner, CreateVolumeRequest, PublishContext, PublishRequest, VolumeProvisioner,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the simulated provider
#[derive(Debug, Clone)]
pub struct SimulatedConfig {
    /// Subscription segment of generated disk IDs
    pub subscription: String,
    /// Resource group segment of generated disk IDs
    pub resource_group: String,
    /// Device slots per node
    pub max_luns_per_node: u32,
    /// Time an attach or detach takes to settle
    pub settle_delay: Duration,
    /// Node label the disk's zone is reported under
    pub topology_key: String,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            subscription: "00000000-0000-0000-0000-000000000000".to_string(),
            resource_group: "simulated".to_string(),
            max_luns_per_node: 64,
            settle_delay: Duration::ZERO,
            topology_key: DEFAULT_TOPOLOGY_KEY.to_string(),
        }
    }
}

// =============================================================================
// Disk State
// =============================================================================

#[derive(Debug, Clone)]
struct DiskState {
    name: String,
    capacity_bytes: i64,
    detail: VolumeStatusDetail,
    /// node -> LUN
    attachments: BTreeMap<String, u32>,
}

#[derive(Debug, Default)]
struct Inventory {
    /// volume ID -> disk
    disks: BTreeMap<String, DiskState>,
}

impl Inventory {
    fn by_name(&self, name: &str) -> Option<&DiskState> {
        self.disks.values().find(|d| d.name == name)
    }

    fn luns_on(&self, node: &str) -> BTreeSet<u32> {
        self.disks
            .values()
            .filter_map(|d| d.attachments.get(node).copied())
            .collect()
    }
}

// =============================================================================
// Simulated Provisioner
// =============================================================================

pub struct SimulatedProvisioner {
    config: SimulatedConfig,
    inventory: RwLock<Inventory>,
}

impl Default for SimulatedProvisioner {
    fn default() -> Self {
        Self::new(SimulatedConfig::default())
    }
}

impl SimulatedProvisioner {
    pub fn new(config: SimulatedConfig) -> Self {
        Self {
            config,
            inventory: RwLock::new(Inventory::default()),
        }
    }

    fn disk_id(&self, name: &str) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Compute/disks/{}",
            self.config.subscription, self.config.resource_group, name
        )
    }

    /// Size to allocate for a range, rejecting ranges whole GiB cannot meet
    fn allocation(range: &CapacityRange) -> Result<i64> {
        range.validate()?;
        let size = round_up_gib(range.target_bytes());
        if range.limit_bytes > 0 && size > range.limit_bytes {
            return Err(Error::InvalidArgument(format!(
                "no whole-GiB size fits between {} and {} bytes",
                range.required_bytes, range.limit_bytes
            )));
        }
        Ok(size)
    }

    async fn settle(&self) {
        if !self.config.settle_delay.is_zero() {
            tokio::time::sleep(self.config.settle_delay).await;
        }
    }

    /// Nodes the disk is attached to
    pub async fn attached_nodes(&self, volume_id: &str) -> Vec<String> {
        self.inventory
            .read()
            .await
            .disks
            .get(volume_id)
            .map(|d| d.attachments.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn disk_count(&self) -> usize {
        self.inventory.read().await.disks.len()
    }
}

#[async_trait]
impl VolumeProvisioner for SimulatedProvisioner {
    async fn create_volume(&self, request: CreateVolumeRequest) -> Result<VolumeStatusDetail> {
        if request.volume_name.is_empty() {
            return Err(Error::InvalidArgument("disk name must not be empty".into()));
        }
        let size = Self::allocation(&request.capacity_range)?;

        let mut inventory = self.inventory.write().await;
        if let Some(existing) = inventory.by_name(&request.volume_name) {
            if existing.capacity_bytes < size {
                return Err(Error::AlreadyExists {
                    kind: "Disk".into(),
                    name: request.volume_name,
                });
            }
            debug!(disk = %existing.name, "Disk already exists");
            return Ok(existing.detail.clone());
        }

        if let Some(source) = &request.content_source {
            if source.content_source == ContentSourceKind::Volume
                && !inventory.disks.contains_key(&source.content_source_id)
            {
                return Err(Error::not_found("Disk", &source.content_source_id));
            }
        }

        // Disks are zonal; without a requested zone they are reachable anywhere
        let key = &self.config.topology_key;
        let accessible_topology: Vec<Topology> = request
            .accessibility
            .as_ref()
            .and_then(|a| a.requisite.first().or_else(|| a.preferred.first()))
            .and_then(|t| t.segments.get(key))
            .map(|zone| Topology::zone(key, zone))
            .into_iter()
            .collect();

        let volume_id = self.disk_id(&request.volume_name);
        let detail = VolumeStatusDetail {
            volume_id: volume_id.clone(),
            capacity_bytes: size,
            volume_context: request.parameters.clone(),
            content_source: request.content_source.clone(),
            accessible_topology,
        };
        inventory.disks.insert(
            volume_id.clone(),
            DiskState {
                name: request.volume_name,
                capacity_bytes: size,
                detail: detail.clone(),
                attachments: BTreeMap::new(),
            },
        );

        info!(volume_id = %volume_id, capacity = size, "Disk created");
        Ok(detail)
    }

    async fn delete_volume(&self, volume_id: &str, _secrets: &BTreeMap<String, String>) -> Result<()> {
        let mut inventory = self.inventory.write().await;
        match inventory.disks.get(volume_id) {
            Some(disk) if !disk.attachments.is_empty() => Err(Error::Unavailable(format!(
                "disk {} is still attached to {:?}",
                volume_id,
                disk.attachments.keys().collect::<Vec<_>>()
            ))),
            Some(_) => {
                inventory.disks.remove(volume_id);
                info!(volume_id = %volume_id, "Disk deleted");
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn expand_volume(
        &self,
        volume_id: &str,
        capacity_range: CapacityRange,
        _secrets: &BTreeMap<String, String>,
    ) -> Result<VolumeStatusDetail> {
        let size = Self::allocation(&capacity_range)?;
        let mut inventory = self.inventory.write().await;
        let disk = inventory
            .disks
            .get_mut(volume_id)
            .ok_or_else(|| Error::not_found("Disk", volume_id))?;

        if size > disk.capacity_bytes {
            disk.capacity_bytes = size;
            disk.detail.capacity_bytes = size;
            info!(volume_id = %volume_id, capacity = size, "Disk expanded");
        }
        Ok(disk.detail.clone())
    }
}

#[async_trait]
impl AttachmentProvisioner for SimulatedProvisioner {
    async fn publish_volume(&self, request: PublishRequest) -> Result<PublishContext> {
        let mut inventory = self.inventory.write().await;
        let used = inventory.luns_on(&request.node_name);
        let disk = inventory
            .disks
            .get_mut(&request.volume_id)
            .ok_or_else(|| Error::not_found("Disk", &request.volume_id))?;

        let lun = match disk.attachments.get(&request.node_name) {
            Some(lun) => *lun,
            None => {
                let lun = (0..self.config.max_luns_per_node)
                    .find(|l| !used.contains(l))
                    .ok_or_else(|| {
                        Error::Unavailable(format!("no free LUN on node {}", request.node_name))
                    })?;
                disk.attachments.insert(request.node_name.clone(), lun);
                debug!(volume_id = %request.volume_id, node = %request.node_name, lun, "Disk attached");
                lun
            }
        };

        let mut context = PublishContext::new();
        context.insert(LUN_KEY.to_string(), lun.to_string());
        Ok(context)
    }

    async fn unpublish_volume(&self, volume_id: &str, node_name: &str) -> Result<()> {
        let mut inventory = self.inventory.write().await;
        let removed = inventory
            .disks
            .get_mut(volume_id)
            .and_then(|d| d.attachments.remove(node_name));
        match removed {
            Some(lun) => {
                debug!(volume_id = %volume_id, node = %node_name, lun, "Disk detached");
                Ok(())
            }
            None => Err(Error::not_found("Attachment", &format!("{}@{}", volume_id, node_name))),
        }
    }

    async fn wait_for_attach(&self, volume_id: &str, node_name: &str) -> Result<PublishContext> {
        self.settle().await;
        let inventory = self.inventory.read().await;
        let lun = inventory
            .disks
            .get(volume_id)
            .and_then(|d| d.attachments.get(node_name))
            .ok_or_else(|| Error::not_found("Attachment", &format!("{}@{}", volume_id, node_name)))?;

        let mut context = PublishContext::new();
        context.insert(LUN_KEY.to_string(), lun.to_string());
        Ok(context)
    }

    async fn wait_for_detach(&self, volume_id: &str, node_name: &str) -> Result<()> {
        self.settle().await;
        let attached = self
            .inventory
            .read()
            .await
            .disks
            .get(volume_id)
            .map(|d| d.attachments.contains_key(node_name))
            .unwrap_or(false);
        if attached {
            return Err(Error::Unavailable(format!(
                "disk {} is attached to {} again",
                volume_id, node_name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ContentVolumeSource, VolumeCapability};
    use crate::error::ErrorCode;
    use crate::provisioner::GIB;
    use assert_matches::assert_matches;

    fn request(name: &str, bytes: i64) -> CreateVolumeRequest {
        CreateVolumeRequest {
            volume_name: name.into(),
            capacity_range: CapacityRange::new(bytes),
            capabilities: vec![VolumeCapability::default()],
            parameters: BTreeMap::new(),
            secrets: BTreeMap::new(),
            content_source: None,
            accessibility: None,
        }
    }

    fn publish(volume_id: &str, node: &str) -> PublishRequest {
        PublishRequest {
            volume_id: volume_id.into(),
            node_name: node.into(),
            capability: None,
            volume_context: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_create_rounds_up_and_is_idempotent() {
        let provider = SimulatedProvisioner::default();
        let first = provider.create_volume(request("disk-a", GIB + 1)).await.unwrap();
        assert_eq!(first.capacity_bytes, 2 * GIB);
        assert!(first.volume_id.ends_with("/disks/disk-a"));

        let again = provider.create_volume(request("disk-a", GIB)).await.unwrap();
        assert_eq!(again, first);
        assert_eq!(provider.disk_count().await, 1);

        assert_matches!(
            provider.create_volume(request("disk-a", 4 * GIB)).await,
            Err(Error::AlreadyExists { .. })
        );
    }

    #[tokio::test]
    async fn test_clone_requires_source_disk() {
        let provider = SimulatedProvisioner::default();
        let mut clone = request("disk-b", GIB);
        clone.content_source = Some(ContentVolumeSource {
            content_source: ContentSourceKind::Volume,
            content_source_id: "/missing".into(),
        });
        let err = provider.create_volume(clone).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn test_lowest_free_lun_per_node() {
        let provider = SimulatedProvisioner::default();
        let a = provider.create_volume(request("disk-a", GIB)).await.unwrap();
        let b = provider.create_volume(request("disk-b", GIB)).await.unwrap();

        let lun_a = provider.publish_volume(publish(&a.volume_id, "node-1")).await.unwrap();
        let lun_b = provider.publish_volume(publish(&b.volume_id, "node-1")).await.unwrap();
        assert_eq!(lun_a.get(LUN_KEY).map(String::as_str), Some("0"));
        assert_eq!(lun_b.get(LUN_KEY).map(String::as_str), Some("1"));

        // Same disk on another node starts over; republish is idempotent
        let other = provider.publish_volume(publish(&a.volume_id, "node-2")).await.unwrap();
        assert_eq!(other.get(LUN_KEY).map(String::as_str), Some("0"));
        let again = provider.publish_volume(publish(&a.volume_id, "node-1")).await.unwrap();
        assert_eq!(again, lun_a);

        provider.unpublish_volume(&a.volume_id, "node-1").await.unwrap();
        let reused = provider.publish_volume(publish(&b.volume_id, "node-3")).await.unwrap();
        assert_eq!(reused.get(LUN_KEY).map(String::as_str), Some("0"));
    }

    #[tokio::test]
    async fn test_not_found_semantics() {
        let provider = SimulatedProvisioner::default();
        let a = provider.create_volume(request("disk-a", GIB)).await.unwrap();

        let err = provider.wait_for_attach(&a.volume_id, "node-1").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
        let err = provider.unpublish_volume(&a.volume_id, "node-1").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
        assert!(provider.wait_for_detach(&a.volume_id, "node-1").await.is_ok());
    }

    #[tokio::test]
    async fn test_attached_disk_cannot_be_deleted() {
        let provider = SimulatedProvisioner::default();
        let a = provider.create_volume(request("disk-a", GIB)).await.unwrap();
        provider.publish_volume(publish(&a.volume_id, "node-1")).await.unwrap();

        let err = provider.delete_volume(&a.volume_id, &BTreeMap::new()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Unavailable);

        provider.unpublish_volume(&a.volume_id, "node-1").await.unwrap();
        provider.delete_volume(&a.volume_id, &BTreeMap::new()).await.unwrap();
        // Missing disks delete fine
        provider.delete_volume(&a.volume_id, &BTreeMap::new()).await.unwrap();
        assert_eq!(provider.disk_count().await, 0);
    }

    #[tokio::test]
    async fn test_reports_zone_under_configured_key() {
        let provider = SimulatedProvisioner::new(SimulatedConfig {
            topology_key: "example.io/zone".into(),
            ..Default::default()
        });
        let mut requested = Topology::zone("example.io/zone", "zone-2");
        requested
            .segments
            .insert("kubernetes.io/hostname".into(), "node-7".into());
        let mut zonal = request("disk-a", GIB);
        zonal.accessibility = Some(crate::crd::TopologyRequirement {
            requisite: vec![requested],
            preferred: vec![],
        });
        let detail = provider.create_volume(zonal).await.unwrap();
        assert_eq!(
            detail.accessible_topology,
            vec![Topology::zone("example.io/zone", "zone-2")]
        );

        // A requirement without the zone label leaves the disk unrestricted
        let mut pinned = request("disk-b", GIB);
        pinned.accessibility = Some(crate::crd::TopologyRequirement {
            requisite: vec![Topology::zone(DEFAULT_TOPOLOGY_KEY, "zone-1")],
            preferred: vec![],
        });
        let detail = provider.create_volume(pinned).await.unwrap();
        assert!(detail.accessible_topology.is_empty());
    }

    #[tokio::test]
    async fn test_lun_exhaustion() {
        let provider = SimulatedProvisioner::new(SimulatedConfig {
            max_luns_per_node: 1,
            ..Default::default()
        });
        let a = provider.create_volume(request("disk-a", GIB)).await.unwrap();
        let b = provider.create_volume(request("disk-b", GIB)).await.unwrap();
        provider.publish_volume(publish(&a.volume_id, "node-1")).await.unwrap();
        let err = provider.publish_volume(publish(&b.volume_id, "node-1")).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Unavailable);
    }
}
