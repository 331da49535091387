//! Test fixtures shared by the controller tests
//!
//! A [`Harness`] wires a controller context to an in-memory store and a
//! [`CountingProvisioner`], which wraps the simulated provider to count
//! calls, inject failures and record how many calls ran at once per
//! resource.

use crate::controller::{node::track_node, ContextRef, ControllerConfig, ControllerContext, ControllerMetrics};
use crate::crd::{
    AttachmentRole, CapacityRange, DiskVolume, DiskVolumeAttachment, DiskVolumeSpec, VolumeCapability,
    VolumeStatusDetail,
};
use crate::domain::ports::{
    AttachmentProvisioner, CreateVolumeRequest, PublishContext, PublishRequest, ResourceStore,
    VolumeProvisioner,
};
use crate::error::{Error, Result};
use crate::provisioner::SimulatedProvisioner;
use crate::state::SharedState;
use crate::store::MemoryStore;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Container, Node, NodeCondition, NodeStatus, PersistentVolumeClaimVolumeSource, Pod, PodSpec,
    PodStatus, Volume,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub use crate::provisioner::GIB;

// =============================================================================
// Cluster objects
// =============================================================================

/// A Ready node in `zone` advertising `max_volumes` attachable disks
pub fn node(name: &str, zone: &str, max_volumes: u32) -> Node {
    let config = ControllerConfig::default();
    let mut labels = BTreeMap::new();
    labels.insert(config.topology_key.clone(), zone.to_string());
    labels.insert("kubernetes.io/hostname".to_string(), name.to_string());

    let mut allocatable = BTreeMap::new();
    allocatable.insert(
        config.attachable_volumes_resource.clone(),
        Quantity(max_volumes.to_string()),
    );

    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: None,
        status: Some(NodeStatus {
            allocatable: Some(allocatable),
            conditions: Some(vec![NodeCondition {
                type_: "Ready".into(),
                status: "True".into(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

/// A pod using `claims`; running when scheduled onto `node`
pub fn pod(namespace: &str, name: &str, node: Option<&str>, claims: &[&str]) -> Pod {
    let volumes = claims
        .iter()
        .map(|claim| Volume {
            name: claim.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: claim.to_string(),
                read_only: None,
            }),
            ..Default::default()
        })
        .collect();

    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: node.map(str::to_string),
            containers: vec![Container {
                name: "app".into(),
                ..Default::default()
            }],
            volumes: Some(volumes),
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some(if node.is_some() { "Running" } else { "Pending" }.to_string()),
            ..Default::default()
        }),
    }
}

// =============================================================================
// Counting Provisioner
// =============================================================================

type ErrorFactory = Box<dyn Fn() -> Error + Send + Sync>;

struct Injected {
    remaining: usize,
    make: ErrorFactory,
}

/// Simulated provider that counts calls per operation
#[derive(Default)]
pub struct CountingProvisioner {
    inner: SimulatedProvisioner,
    calls: Mutex<BTreeMap<String, usize>>,
    failures: Mutex<BTreeMap<String, Injected>>,
    delay: Mutex<Duration>,
    in_flight: Mutex<BTreeMap<String, usize>>,
    max_in_flight: AtomicUsize,
}

impl CountingProvisioner {
    pub fn calls(&self, operation: &str) -> usize {
        self.calls.lock().get(operation).copied().unwrap_or(0)
    }

    /// Fail the next `count` calls of `operation` with `make()`
    pub fn fail_next<F>(&self, operation: &str, count: usize, make: F)
    where
        F: Fn() -> Error + Send + Sync + 'static,
    {
        self.failures.lock().insert(
            operation.to_string(),
            Injected {
                remaining: count,
                make: Box::new(make),
            },
        );
    }

    /// Hold every call for `delay`
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// Most calls ever running at once for a single resource
    pub fn max_concurrency_per_resource(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn simulated(&self) -> &SimulatedProvisioner {
        &self.inner
    }

    fn take_failure(&self, operation: &str) -> Option<Error> {
        let mut failures = self.failures.lock();
        let injected = failures.get_mut(operation)?;
        if injected.remaining == 0 {
            return None;
        }
        injected.remaining -= 1;
        Some((injected.make)())
    }

    async fn track<T, F>(&self, operation: &str, resource: String, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        *self.calls.lock().entry(operation.to_string()).or_default() += 1;
        {
            let mut in_flight = self.in_flight.lock();
            let running = in_flight.entry(resource.clone()).or_default();
            *running += 1;
            self.max_in_flight.fetch_max(*running, Ordering::SeqCst);
        }

        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let result = match self.take_failure(operation) {
            Some(err) => Err(err),
            None => call.await,
        };

        if let Some(running) = self.in_flight.lock().get_mut(&resource) {
            *running -= 1;
        }
        result
    }
}

fn attachment_key(volume_id: &str, node: &str) -> String {
    format!("{}@{}", volume_id, node)
}

#[async_trait]
impl VolumeProvisioner for CountingProvisioner {
    async fn create_volume(&self, request: CreateVolumeRequest) -> Result<VolumeStatusDetail> {
        let resource = request.volume_name.clone();
        self.track("CreateVolume", resource, self.inner.create_volume(request))
            .await
    }

    async fn delete_volume(&self, volume_id: &str, secrets: &BTreeMap<String, String>) -> Result<()> {
        self.track(
            "DeleteVolume",
            volume_id.to_string(),
            self.inner.delete_volume(volume_id, secrets),
        )
        .await
    }

    async fn expand_volume(
        &self,
        volume_id: &str,
        capacity_range: CapacityRange,
        secrets: &BTreeMap<String, String>,
    ) -> Result<VolumeStatusDetail> {
        self.track(
            "ExpandVolume",
            volume_id.to_string(),
            self.inner.expand_volume(volume_id, capacity_range, secrets),
        )
        .await
    }
}

#[async_trait]
impl AttachmentProvisioner for CountingProvisioner {
    async fn publish_volume(&self, request: PublishRequest) -> Result<PublishContext> {
        let resource = attachment_key(&request.volume_id, &request.node_name);
        self.track("PublishVolume", resource, self.inner.publish_volume(request))
            .await
    }

    async fn unpublish_volume(&self, volume_id: &str, node_name: &str) -> Result<()> {
        self.track(
            "UnpublishVolume",
            attachment_key(volume_id, node_name),
            self.inner.unpublish_volume(volume_id, node_name),
        )
        .await
    }

    async fn wait_for_attach(&self, volume_id: &str, node_name: &str) -> Result<PublishContext> {
        self.track(
            "WaitForAttach",
            attachment_key(volume_id, node_name),
            self.inner.wait_for_attach(volume_id, node_name),
        )
        .await
    }

    async fn wait_for_detach(&self, volume_id: &str, node_name: &str) -> Result<()> {
        self.track(
            "WaitForDetach",
            attachment_key(volume_id, node_name),
            self.inner.wait_for_detach(volume_id, node_name),
        )
        .await
    }
}

// =============================================================================
// Harness
// =============================================================================

/// Short retries so failure paths finish quickly
pub fn test_config() -> ControllerConfig {
    ControllerConfig {
        max_retries: 3,
        backoff_base_ms: 1,
        backoff_cap_ms: 10,
        operation_timeout_secs: 5,
        worker_count: 4,
        ..Default::default()
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub provisioner: Arc<CountingProvisioner>,
    pub ctx: ContextRef,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: ControllerConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let provisioner = Arc::new(CountingProvisioner::default());
        let ctx = Arc::new(ControllerContext {
            config,
            state: Arc::new(SharedState::new()),
            store: store.clone(),
            cluster: store.clone(),
            volume_provisioner: provisioner.clone(),
            attachment_provisioner: provisioner.clone(),
            metrics: ControllerMetrics::new().expect("metrics registry"),
        });
        Self {
            store,
            provisioner,
            ctx,
        }
    }

    /// Harness with `(name, zone, max volumes)` nodes registered and tracked
    pub async fn with_nodes(nodes: &[(&str, &str, u32)]) -> Self {
        let h = Self::new();
        for (name, zone, max_volumes) in nodes {
            let n = node(name, zone, *max_volumes);
            h.store.put_node(n.clone());
            track_node(&h.ctx, &n).await.expect("track node");
        }
        h
    }

    /// Store a new Pending volume
    pub async fn create_volume(&self, name: &str, bytes: i64, replicas: u32) -> DiskVolume {
        let volume = DiskVolume::build(
            name,
            DiskVolumeSpec {
                volume_name: name.to_string(),
                capacity_range: CapacityRange::new(bytes),
                volume_capability: vec![VolumeCapability::default()],
                parameters: BTreeMap::new(),
                secrets: BTreeMap::new(),
                content_volume_source: None,
                accessibility_requirements: None,
                max_mount_replica_count: replicas,
                persistent_volume: None,
            },
        );
        self.store
            .create_volume(&volume)
            .await
            .expect("create volume")
    }

    /// Store a new Pending attachment and return its name
    pub async fn create_attachment(
        &self,
        volume: &str,
        volume_id: &str,
        node: &str,
        role: AttachmentRole,
    ) -> String {
        let attachment =
            DiskVolumeAttachment::for_volume(volume, volume_id, node, role, BTreeMap::new());
        self.store
            .create_attachment(&attachment)
            .await
            .expect("create attachment")
            .name_any()
    }

    pub async fn volume(&self, name: &str) -> DiskVolume {
        self.store
            .get_volume(name)
            .await
            .expect("get volume")
            .unwrap_or_else(|| panic!("volume {} missing", name))
    }

    pub async fn attachment(&self, name: &str) -> DiskVolumeAttachment {
        self.store
            .get_attachment(name)
            .await
            .expect("get attachment")
            .unwrap_or_else(|| panic!("attachment {} missing", name))
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
