//! Kubernetes-backed resource store
//!
//! DiskVolume and DiskVolumeAttachment live as cluster-scoped custom
//! resources. Writes use `replace` so the API server's resource version
//! check rejects stale copies; a 409 surfaces as `Conflict` and the
//! `modify_*` helpers re-read and retry. Status writes that fail for other
//! transient reasons are retried with exponential backoff.

use super::{EventSource, ResourceEvent, EVENT_CHANNEL_CAPACITY};
use crate::crd::{DiskVolume, DiskVolumeAttachment};
use crate::domain::ports::{ClusterView, ResourceStore};
use crate::error::{Error, Result};
use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::{Node, PersistentVolume, PersistentVolumeClaim, Pod};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Field manager recorded on our writes
const FIELD_MANAGER: &str = "replicated-disk-operator";

/// Upper bound on retrying a status write
const STATUS_RETRY_WINDOW: Duration = Duration::from_secs(30);

/// Translate API server failures into the controller's taxonomy
fn map_api_error(err: kube::Error, kind: &str, name: &str) -> Error {
    match &err {
        kube::Error::Api(response) if response.code == 404 => Error::not_found(kind, name),
        kube::Error::Api(response) if response.code == 409 && response.reason == "AlreadyExists" => {
            Error::AlreadyExists {
                kind: kind.to_string(),
                name: name.to_string(),
            }
        }
        kube::Error::Api(response) if response.code == 409 => Error::conflict(kind, name),
        kube::Error::Api(response) if response.code == 422 || response.code == 400 => {
            Error::InvalidArgument(format!("{}/{}: {}", kind, name, response.message))
        }
        _ => Error::Kube(err),
    }
}

pub struct KubeStore {
    client: Client,
    events: broadcast::Sender<ResourceEvent>,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { client, events }
    }

    fn volumes(&self) -> Api<DiskVolume> {
        Api::all(self.client.clone())
    }

    fn attachments(&self) -> Api<DiskVolumeAttachment> {
        Api::all(self.client.clone())
    }

    async fn get_opt<K>(api: &Api<K>, kind: &str, name: &str) -> Result<Option<K>>
    where
        K: Resource + Clone + DeserializeOwned + Debug,
    {
        api.get_opt(name)
            .await
            .map_err(|e| map_api_error(e, kind, name))
    }

    async fn create<K>(api: &Api<K>, kind: &str, object: &K) -> Result<K>
    where
        K: Resource + Clone + DeserializeOwned + Serialize + Debug,
    {
        let name = object.meta().name.clone().unwrap_or_default();
        api.create(&PostParams::default(), object)
            .await
            .map_err(|e| map_api_error(e, kind, &name))
    }

    async fn replace<K>(api: &Api<K>, kind: &str, object: &K) -> Result<K>
    where
        K: Resource + Clone + DeserializeOwned + Serialize + Debug,
    {
        let name = object.meta().name.clone().unwrap_or_default();
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        api.replace(&name, &params, object)
            .await
            .map_err(|e| map_api_error(e, kind, &name))
    }

    /// Replace the status subresource; transient API failures are retried,
    /// conflicts and missing resources are returned at once
    async fn replace_status<K>(api: &Api<K>, kind: &str, object: &K) -> Result<K>
    where
        K: Resource + Clone + DeserializeOwned + Serialize + Debug,
    {
        let name = object.meta().name.clone().unwrap_or_default();
        let body = serde_json::to_vec(object)?;
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(200))
            .with_max_elapsed_time(Some(STATUS_RETRY_WINDOW))
            .build();

        let (name, body) = (&name, &body);
        backoff::future::retry(policy, move || async move {
            let params = PostParams {
                field_manager: Some(FIELD_MANAGER.to_string()),
                ..Default::default()
            };
            api.replace_status(name, &params, body.clone())
                .await
                .map_err(|e| match map_api_error(e, kind, name) {
                    err @ Error::Kube(_) => {
                        debug!(kind, name = %name, error = %err, "Status write failed, retrying");
                        backoff::Error::transient(err)
                    }
                    err => backoff::Error::permanent(err),
                })
        })
        .await
    }

    async fn delete<K>(api: &Api<K>, kind: &str, name: &str) -> Result<()>
    where
        K: Resource + Clone + DeserializeOwned + Debug,
    {
        api.delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| map_api_error(e, kind, name))
    }

    // =========================================================================
    // Watches
    // =========================================================================

    /// Start one watch per resource kind, feeding the event channel until
    /// `cancel` fires
    pub fn start_watchers(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        vec![
            spawn_watch(self.volumes(), self.events.clone(), cancel.clone(), |v| {
                Some(ResourceEvent::Volume { name: v.name_any() })
            }),
            spawn_watch(self.attachments(), self.events.clone(), cancel.clone(), |a| {
                Some(ResourceEvent::Attachment {
                    name: a.name_any(),
                    volume: a.spec.volume_name.clone(),
                })
            }),
            spawn_watch(
                Api::<Pod>::all(self.client.clone()),
                self.events.clone(),
                cancel.clone(),
                |p| {
                    let namespace = p.namespace()?;
                    Some(ResourceEvent::Pod {
                        key: format!("{}/{}", namespace, p.name_any()),
                    })
                },
            ),
            spawn_watch(
                Api::<Node>::all(self.client.clone()),
                self.events.clone(),
                cancel,
                |n| Some(ResourceEvent::Node { name: n.name_any() }),
            ),
        ]
    }
}

fn spawn_watch<K, F>(
    api: Api<K>,
    events: broadcast::Sender<ResourceEvent>,
    cancel: CancellationToken,
    to_event: F,
) -> JoinHandle<()>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
    F: Fn(&K) -> Option<ResourceEvent> + Send + 'static,
{
    tokio::spawn(async move {
        let kind = std::any::type_name::<K>();
        info!(kind, "Starting watch");
        let stream = watcher(api, watcher::Config::default())
            .default_backoff()
            .touched_objects();
        futures::pin_mut!(stream);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = stream.try_next() => match next {
                    Ok(Some(object)) => {
                        if let Some(event) = to_event(&object) {
                            let _ = events.send(event);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => warn!(kind, error = %e, "Watch error"),
                },
            }
        }
        info!(kind, "Watch stopped");
    })
}

impl EventSource for KubeStore {
    fn subscribe(&self) -> broadcast::Receiver<ResourceEvent> {
        self.events.subscribe()
    }
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn get_volume(&self, name: &str) -> Result<Option<DiskVolume>> {
        Self::get_opt(&self.volumes(), "DiskVolume", name).await
    }

    async fn list_volumes(&self) -> Result<Vec<DiskVolume>> {
        Ok(self.volumes().list(&ListParams::default()).await?.items)
    }

    async fn create_volume(&self, volume: &DiskVolume) -> Result<DiskVolume> {
        Self::create(&self.volumes(), "DiskVolume", volume).await
    }

    async fn update_volume(&self, volume: &DiskVolume) -> Result<DiskVolume> {
        Self::replace(&self.volumes(), "DiskVolume", volume).await
    }

    async fn update_volume_status(&self, volume: &DiskVolume) -> Result<DiskVolume> {
        Self::replace_status(&self.volumes(), "DiskVolume", volume).await
    }

    async fn delete_volume(&self, name: &str) -> Result<()> {
        Self::delete(&self.volumes(), "DiskVolume", name).await
    }

    async fn get_attachment(&self, name: &str) -> Result<Option<DiskVolumeAttachment>> {
        Self::get_opt(&self.attachments(), "DiskVolumeAttachment", name).await
    }

    async fn list_attachments(&self) -> Result<Vec<DiskVolumeAttachment>> {
        Ok(self.attachments().list(&ListParams::default()).await?.items)
    }

    async fn create_attachment(&self, attachment: &DiskVolumeAttachment) -> Result<DiskVolumeAttachment> {
        Self::create(&self.attachments(), "DiskVolumeAttachment", attachment).await
    }

    async fn update_attachment(&self, attachment: &DiskVolumeAttachment) -> Result<DiskVolumeAttachment> {
        Self::replace(&self.attachments(), "DiskVolumeAttachment", attachment).await
    }

    async fn update_attachment_status(
        &self,
        attachment: &DiskVolumeAttachment,
    ) -> Result<DiskVolumeAttachment> {
        Self::replace_status(&self.attachments(), "DiskVolumeAttachment", attachment).await
    }

    async fn delete_attachment(&self, name: &str) -> Result<()> {
        Self::delete(&self.attachments(), "DiskVolumeAttachment", name).await
    }

    async fn list_attachments_for_volume(&self, volume_name: &str) -> Result<Vec<DiskVolumeAttachment>> {
        let selector = format!("{}={}", crate::crd::VOLUME_NAME_LABEL, volume_name);
        Ok(self
            .attachments()
            .list(&ListParams::default().labels(&selector))
            .await?
            .items)
    }

    async fn list_attachments_for_node(&self, node_name: &str) -> Result<Vec<DiskVolumeAttachment>> {
        let selector = format!("{}={}", crate::crd::NODE_NAME_LABEL, node_name);
        Ok(self
            .attachments()
            .list(&ListParams::default().labels(&selector))
            .await?
            .items)
    }
}

#[async_trait]
impl ClusterView for KubeStore {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Self::get_opt(&api, "Pod", name).await
    }

    async fn list_pods(&self) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        Self::get_opt(&api, "Node", name).await
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    /// Claim -> bound PersistentVolume -> DiskVolume recording that PV, or
    /// whose provider ID is the PV's CSI volume handle
    async fn resolve_claim(&self, namespace: &str, claim: &str) -> Result<Option<String>> {
        let claims: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        let Some(pvc) = Self::get_opt(&claims, "PersistentVolumeClaim", claim).await? else {
            return Ok(None);
        };
        let Some(pv_name) = pvc
            .spec
            .and_then(|s| s.volume_name)
            .filter(|n| !n.is_empty())
        else {
            return Ok(None);
        };

        let pvs: Api<PersistentVolume> = Api::all(self.client.clone());
        let handle = Self::get_opt(&pvs, "PersistentVolume", &pv_name)
            .await?
            .and_then(|pv| pv.spec)
            .and_then(|s| s.csi)
            .map(|csi| csi.volume_handle);

        let volume = self.list_volumes().await?.into_iter().find(|v| {
            v.spec.persistent_volume.as_deref() == Some(pv_name.as_str())
                || (handle.is_some() && v.volume_id() == handle.as_deref())
        });
        Ok(volume.map(|v| v.name_any()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: "rejected".into(),
            reason: reason.into(),
            code,
        })
    }

    #[test]
    fn test_api_errors_map_to_taxonomy() {
        assert_eq!(
            map_api_error(api_error(404, "NotFound"), "DiskVolume", "vol-a").code(),
            ErrorCode::NotFound
        );
        assert!(map_api_error(api_error(409, "Conflict"), "DiskVolume", "vol-a").is_conflict());
        assert_eq!(
            map_api_error(api_error(409, "AlreadyExists"), "DiskVolume", "vol-a").code(),
            ErrorCode::AlreadyExists
        );
        assert_eq!(
            map_api_error(api_error(422, "Invalid"), "DiskVolume", "vol-a").code(),
            ErrorCode::InvalidArgument
        );
        assert_eq!(
            map_api_error(api_error(503, "ServiceUnavailable"), "DiskVolume", "vol-a").code(),
            ErrorCode::Unavailable
        );
    }
}
