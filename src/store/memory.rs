//! In-memory resource store
//!
//! Behaves like the API server for the parts the controller relies on:
//! resource versions reject stale writes, finalizers delay removal, status
//! and spec are written separately, and every write is announced on a
//! broadcast channel. Also serves as the cluster view, holding the pods,
//! nodes and claim bindings fed to it.

use super::{EventSource, ResourceEvent, EVENT_CHANNEL_CAPACITY};
use crate::crd::{DiskVolume, DiskVolumeAttachment};
use crate::domain::ports::{ClusterView, ResourceStore};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::trace;

// =============================================================================
// Stored resource abstraction
// =============================================================================

/// The two custom resources share storage semantics
trait StoredResource: Clone {
    const KIND: &'static str;

    fn object_meta(&self) -> &ObjectMeta;
    fn object_meta_mut(&mut self) -> &mut ObjectMeta;

    /// Copy the status over from `other`
    fn copy_status(&mut self, other: &Self);

    fn event(&self) -> ResourceEvent;
}

impl StoredResource for DiskVolume {
    const KIND: &'static str = "DiskVolume";

    fn object_meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn object_meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn copy_status(&mut self, other: &Self) {
        self.status = other.status.clone();
    }

    fn event(&self) -> ResourceEvent {
        ResourceEvent::Volume {
            name: self.name_any(),
        }
    }
}

impl StoredResource for DiskVolumeAttachment {
    const KIND: &'static str = "DiskVolumeAttachment";

    fn object_meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn object_meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn copy_status(&mut self, other: &Self) {
        self.status = other.status.clone();
    }

    fn event(&self) -> ResourceEvent {
        ResourceEvent::Attachment {
            name: self.name_any(),
            volume: self.spec.volume_name.clone(),
        }
    }
}

fn has_finalizers(meta: &ObjectMeta) -> bool {
    meta.finalizers.as_ref().map(|f| !f.is_empty()).unwrap_or(false)
}

fn object_key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

// =============================================================================
// Memory Store
// =============================================================================

#[derive(Default)]
struct Objects {
    volumes: BTreeMap<String, DiskVolume>,
    attachments: BTreeMap<String, DiskVolumeAttachment>,
    pods: BTreeMap<String, Pod>,
    nodes: BTreeMap<String, Node>,
    /// `namespace/claim` -> DiskVolume name
    claims: BTreeMap<String, String>,
}

pub struct MemoryStore {
    objects: RwLock<Objects>,
    revision: AtomicU64,
    /// Last creation timestamp handed out; creation order stays total
    last_created: Mutex<Option<DateTime<Utc>>>,
    events: broadcast::Sender<ResourceEvent>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let objects = self.objects.read();
        f.debug_struct("MemoryStore")
            .field("volumes", &objects.volumes.len())
            .field("attachments", &objects.attachments.len())
            .field("pods", &objects.pods.len())
            .field("nodes", &objects.nodes.len())
            .finish()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            objects: RwLock::new(Objects::default()),
            revision: AtomicU64::new(0),
            last_created: Mutex::new(None),
            events,
        }
    }

    fn next_revision(&self) -> String {
        (self.revision.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    /// Strictly increasing creation time
    fn creation_time(&self) -> Time {
        let mut last = self.last_created.lock();
        let mut now = Utc::now();
        if let Some(previous) = *last {
            if now <= previous {
                now = previous + Duration::microseconds(1);
            }
        }
        *last = Some(now);
        Time(now)
    }

    fn publish(&self, event: ResourceEvent) {
        trace!(?event, "Store event");
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn check_version<K: StoredResource>(stored: &K, incoming: &K, name: &str) -> Result<()> {
        match incoming.object_meta().resource_version.as_deref() {
            Some(version) if Some(version) != stored.object_meta().resource_version.as_deref() => {
                Err(Error::conflict(K::KIND, name))
            }
            _ => Ok(()),
        }
    }

    fn create_in<K: StoredResource>(
        &self,
        map: &mut BTreeMap<String, K>,
        object: &K,
    ) -> Result<K> {
        let name = object
            .object_meta()
            .name
            .clone()
            .ok_or_else(|| Error::InvalidArgument(format!("{} without a name", K::KIND)))?;
        if map.contains_key(&name) {
            return Err(Error::AlreadyExists {
                kind: K::KIND.to_string(),
                name,
            });
        }
        let mut stored = object.clone();
        let meta = stored.object_meta_mut();
        meta.resource_version = Some(self.next_revision());
        meta.deletion_timestamp = None;
        if meta.creation_timestamp.is_none() {
            meta.creation_timestamp = Some(self.creation_time());
        }
        map.insert(name, stored.clone());
        Ok(stored)
    }

    /// Persist metadata and spec; the stored status is kept
    fn update_in<K: StoredResource>(
        &self,
        map: &mut BTreeMap<String, K>,
        object: &K,
    ) -> Result<K> {
        let name = object.object_meta().name.clone().unwrap_or_default();
        let stored = map
            .get(&name)
            .ok_or_else(|| Error::not_found(K::KIND, &name))?;
        Self::check_version(stored, object, &name)?;

        let mut updated = object.clone();
        updated.copy_status(stored);
        let kept = stored.object_meta().clone();
        let meta = updated.object_meta_mut();
        meta.creation_timestamp = kept.creation_timestamp;
        meta.deletion_timestamp = kept.deletion_timestamp;
        meta.uid = kept.uid;
        meta.resource_version = Some(self.next_revision());

        if meta.deletion_timestamp.is_some() && !has_finalizers(meta) {
            map.remove(&name);
            return Ok(updated);
        }
        map.insert(name, updated.clone());
        Ok(updated)
    }

    /// Persist status only
    fn update_status_in<K: StoredResource>(
        &self,
        map: &mut BTreeMap<String, K>,
        object: &K,
    ) -> Result<K> {
        let name = object.object_meta().name.clone().unwrap_or_default();
        let stored = map
            .get_mut(&name)
            .ok_or_else(|| Error::not_found(K::KIND, &name))?;
        Self::check_version(stored, object, &name)?;

        stored.copy_status(object);
        stored.object_meta_mut().resource_version = Some(self.next_revision());
        Ok(stored.clone())
    }

    /// Remove, or only mark for deletion while finalizers remain
    fn delete_in<K: StoredResource>(&self, map: &mut BTreeMap<String, K>, name: &str) -> Result<K> {
        let stored = map
            .get_mut(name)
            .ok_or_else(|| Error::not_found(K::KIND, name))?;
        if has_finalizers(stored.object_meta()) {
            let meta = stored.object_meta_mut();
            if meta.deletion_timestamp.is_none() {
                meta.deletion_timestamp = Some(Time(Utc::now()));
                meta.resource_version = Some(self.next_revision());
            }
            return Ok(stored.clone());
        }
        map.remove(name)
            .ok_or_else(|| Error::not_found(K::KIND, name))
    }

    // =========================================================================
    // Cluster mutators
    // =========================================================================

    /// Add or replace a pod
    pub fn put_pod(&self, pod: Pod) {
        let key = object_key(
            pod.metadata.namespace.as_deref().unwrap_or("default"),
            &pod.name_any(),
        );
        self.objects.write().pods.insert(key.clone(), pod);
        self.publish(ResourceEvent::Pod { key });
    }

    pub fn remove_pod(&self, namespace: &str, name: &str) {
        let key = object_key(namespace, name);
        self.objects.write().pods.remove(&key);
        self.publish(ResourceEvent::Pod { key });
    }

    /// Add or replace a node
    pub fn put_node(&self, node: Node) {
        let name = node.name_any();
        self.objects.write().nodes.insert(name.clone(), node);
        self.publish(ResourceEvent::Node { name });
    }

    pub fn remove_node(&self, name: &str) {
        self.objects.write().nodes.remove(name);
        self.publish(ResourceEvent::Node {
            name: name.to_string(),
        });
    }

    /// Bind a claim to a DiskVolume, as a bound PersistentVolume would
    pub fn bind_claim(&self, namespace: &str, claim: &str, volume: &str) {
        self.objects
            .write()
            .claims
            .insert(object_key(namespace, claim), volume.to_string());
    }
}

impl EventSource for MemoryStore {
    fn subscribe(&self) -> broadcast::Receiver<ResourceEvent> {
        self.events.subscribe()
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get_volume(&self, name: &str) -> Result<Option<DiskVolume>> {
        Ok(self.objects.read().volumes.get(name).cloned())
    }

    async fn list_volumes(&self) -> Result<Vec<DiskVolume>> {
        Ok(self.objects.read().volumes.values().cloned().collect())
    }

    async fn create_volume(&self, volume: &DiskVolume) -> Result<DiskVolume> {
        let created = {
            let mut objects = self.objects.write();
            self.create_in(&mut objects.volumes, volume)?
        };
        self.publish(created.event());
        Ok(created)
    }

    async fn update_volume(&self, volume: &DiskVolume) -> Result<DiskVolume> {
        let updated = {
            let mut objects = self.objects.write();
            self.update_in(&mut objects.volumes, volume)?
        };
        self.publish(updated.event());
        Ok(updated)
    }

    async fn update_volume_status(&self, volume: &DiskVolume) -> Result<DiskVolume> {
        let updated = {
            let mut objects = self.objects.write();
            self.update_status_in(&mut objects.volumes, volume)?
        };
        self.publish(updated.event());
        Ok(updated)
    }

    async fn delete_volume(&self, name: &str) -> Result<()> {
        let deleted = {
            let mut objects = self.objects.write();
            self.delete_in(&mut objects.volumes, name)?
        };
        self.publish(deleted.event());
        Ok(())
    }

    async fn get_attachment(&self, name: &str) -> Result<Option<DiskVolumeAttachment>> {
        Ok(self.objects.read().attachments.get(name).cloned())
    }

    async fn list_attachments(&self) -> Result<Vec<DiskVolumeAttachment>> {
        Ok(self.objects.read().attachments.values().cloned().collect())
    }

    async fn create_attachment(&self, attachment: &DiskVolumeAttachment) -> Result<DiskVolumeAttachment> {
        let created = {
            let mut objects = self.objects.write();
            self.create_in(&mut objects.attachments, attachment)?
        };
        self.publish(created.event());
        Ok(created)
    }

    async fn update_attachment(&self, attachment: &DiskVolumeAttachment) -> Result<DiskVolumeAttachment> {
        let updated = {
            let mut objects = self.objects.write();
            self.update_in(&mut objects.attachments, attachment)?
        };
        self.publish(updated.event());
        Ok(updated)
    }

    async fn update_attachment_status(
        &self,
        attachment: &DiskVolumeAttachment,
    ) -> Result<DiskVolumeAttachment> {
        let updated = {
            let mut objects = self.objects.write();
            self.update_status_in(&mut objects.attachments, attachment)?
        };
        self.publish(updated.event());
        Ok(updated)
    }

    async fn delete_attachment(&self, name: &str) -> Result<()> {
        let deleted = {
            let mut objects = self.objects.write();
            self.delete_in(&mut objects.attachments, name)?
        };
        self.publish(deleted.event());
        Ok(())
    }
}

#[async_trait]
impl ClusterView for MemoryStore {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        Ok(self
            .objects
            .read()
            .pods
            .get(&object_key(namespace, name))
            .cloned())
    }

    async fn list_pods(&self) -> Result<Vec<Pod>> {
        Ok(self.objects.read().pods.values().cloned().collect())
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        Ok(self.objects.read().nodes.get(name).cloned())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        Ok(self.objects.read().nodes.values().cloned().collect())
    }

    async fn resolve_claim(&self, namespace: &str, claim: &str) -> Result<Option<String>> {
        Ok(self
            .objects
            .read()
            .claims
            .get(&object_key(namespace, claim))
            .cloned())
    }
}
