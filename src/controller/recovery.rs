//! Recovery Coordinator
//!
//! Runs once at start-up (or on gaining leadership). In-memory state is
//! never trusted after a restart: the indexes are rebuilt from the persisted
//! resources and the cluster, resources stuck in a transient state without a
//! live queue entry are reset to the stable state they resume from, and
//! resources written under an older schema are converted in place.

use super::node::node_capacity;
use super::pod::{index_pod, is_finished, is_running, pod_key};
use super::{
    AttachmentReconciler, ContextRef, ResourceKey, VolumeReconciler,
};
use crate::crd::{
    is_system_annotation, AttachmentState, DiskVolume, DiskVolumeAttachment, Intent, IntentSet,
    API_VERSION_ANNOTATION, CURRENT_API_VERSION, LEGACY_API_VERSION, PERSISTENT_VOLUME_ANNOTATION,
};
use crate::error::Result;
use crate::state::NodeSlots;
use kube::ResourceExt;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// What a recovery pass found and changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub volumes: usize,
    pub attachments: usize,
    pub pods: usize,
    pub nodes: usize,
    /// Volumes reset out of a transient state
    pub recovered_volumes: usize,
    /// Attachments reset out of a transient state
    pub recovered_attachments: usize,
    /// Resources converted from an older schema
    pub converted: usize,
    /// Resources that need a reconcile pass
    pub requeue: Vec<ResourceKey>,
}

/// Metadata annotations to carry into status, if the resource predates the
/// current schema
fn legacy_annotations(annotations: &BTreeMap<String, String>) -> Option<BTreeMap<String, String>> {
    let version = annotations
        .get(API_VERSION_ANNOTATION)
        .map(String::as_str)
        .unwrap_or(LEGACY_API_VERSION);
    if version == CURRENT_API_VERSION {
        return None;
    }
    Some(
        annotations
            .iter()
            .filter(|(key, _)| !is_system_annotation(key))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    )
}

/// Outcome of bringing one resource to the current schema
enum Conversion<T> {
    Current(T),
    Converted(T),
    /// Deleted while recovery ran
    Gone,
}

pub struct RecoveryCoordinator {
    ctx: ContextRef,
}

impl RecoveryCoordinator {
    pub fn new(ctx: ContextRef) -> Self {
        Self { ctx }
    }

    /// Rebuild shared state and reset stale transient states
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let ctx = &self.ctx;
        let mut report = RecoveryReport::default();
        ctx.state.reset_indexes();

        let nodes = ctx.cluster.list_nodes().await?;
        let mut slots: BTreeMap<String, NodeSlots> = nodes
            .iter()
            .filter_map(|node| {
                let name = node.metadata.name.clone()?;
                let capacity = node_capacity(node, &ctx.config);
                Some((name, NodeSlots { capacity, used: 0 }))
            })
            .collect();
        report.nodes = slots.len();

        for volume in ctx.store.list_volumes().await? {
            report.volumes += 1;
            let name = volume.name_any();
            let volume = match self.convert_volume(volume).await {
                Ok(Conversion::Current(volume)) => volume,
                Ok(Conversion::Converted(volume)) => {
                    report.converted += 1;
                    volume
                }
                Ok(Conversion::Gone) => continue,
                Err(e) => {
                    warn!(volume = %name, error = %e, "Failed to convert volume");
                    report.requeue.push(ResourceKey::volume(&name));
                    continue;
                }
            };
            let volume = match self.reset_volume(volume).await? {
                (volume, true) => {
                    report.recovered_volumes += 1;
                    volume
                }
                (volume, false) => volume,
            };
            if let Some(pv) = &volume.spec.persistent_volume {
                debug!(volume = %name, persistent_volume = %pv, "Volume backs a PersistentVolume");
            }
            if VolumeReconciler::next_operation(&volume).is_some() {
                report.requeue.push(ResourceKey::volume(&name));
            }
        }

        for attachment in ctx.store.list_attachments().await? {
            report.attachments += 1;
            let name = attachment.name_any();
            let attachment = match self.convert_attachment(attachment).await {
                Ok(Conversion::Current(attachment)) => attachment,
                Ok(Conversion::Converted(attachment)) => {
                    report.converted += 1;
                    attachment
                }
                Ok(Conversion::Gone) => continue,
                Err(e) => {
                    warn!(attachment = %name, error = %e, "Failed to convert attachment");
                    report.requeue.push(ResourceKey::attachment(&name));
                    continue;
                }
            };
            let attachment = match self.reset_attachment(attachment).await? {
                (attachment, true) => {
                    report.recovered_attachments += 1;
                    attachment
                }
                (attachment, false) => attachment,
            };

            ctx.state
                .track_attachment(&attachment.spec.volume_name, &name);
            if attachment.state().occupies_slot() {
                slots
                    .entry(attachment.spec.node_name.clone())
                    .or_insert(NodeSlots {
                        capacity: ctx.config.default_max_volumes_per_node,
                        used: 0,
                    })
                    .used += 1;
            }
            if AttachmentReconciler::next_operation(&attachment).is_some() {
                report.requeue.push(ResourceKey::attachment(&name));
            }
        }

        for (node, record) in &slots {
            ctx.state.set_node_slots(node, *record);
        }

        for pod in ctx.cluster.list_pods().await? {
            if is_finished(&pod) {
                continue;
            }
            index_pod(ctx, &pod).await?;
            report.pods += 1;
            if is_running(&pod) {
                let key = pod_key(&pod);
                if let Some((namespace, name)) = key.split_once('/') {
                    report.requeue.push(ResourceKey::pod(namespace, name));
                }
            }
        }

        ctx.metrics
            .record_recovered("DiskVolume", report.recovered_volumes);
        ctx.metrics
            .record_recovered("DiskVolumeAttachment", report.recovered_attachments);
        info!(
            volumes = report.volumes,
            attachments = report.attachments,
            pods = report.pods,
            nodes = report.nodes,
            recovered_volumes = report.recovered_volumes,
            recovered_attachments = report.recovered_attachments,
            converted = report.converted,
            "Recovery complete"
        );
        Ok(report)
    }

    // =========================================================================
    // Schema conversion
    // =========================================================================

    async fn convert_volume(&self, volume: DiskVolume) -> Result<Conversion<DiskVolume>> {
        let name = volume.name_any();
        let Some(carried) = legacy_annotations(volume.annotations()) else {
            return Ok(Conversion::Current(volume));
        };
        let pv = volume.annotations().get(PERSISTENT_VOLUME_ANNOTATION).cloned();

        let store = &self.ctx.store;
        if store.get_volume(&name).await?.is_none() {
            return Ok(Conversion::Gone);
        }
        store
            .modify_volume(&name, &|v| {
                if v.spec.persistent_volume.is_none() {
                    v.spec.persistent_volume = pv.clone();
                }
                v.annotations_mut()
                    .insert(API_VERSION_ANNOTATION.to_string(), CURRENT_API_VERSION.to_string());
            })
            .await?;
        let converted = store
            .modify_volume_status(&name, &|s| {
                for (key, value) in &carried {
                    s.annotations.entry(key.clone()).or_insert_with(|| value.clone());
                }
            })
            .await?;
        info!(volume = %name, "Converted volume to {}", CURRENT_API_VERSION);
        Ok(Conversion::Converted(converted))
    }

    async fn convert_attachment(
        &self,
        attachment: DiskVolumeAttachment,
    ) -> Result<Conversion<DiskVolumeAttachment>> {
        let name = attachment.name_any();
        let Some(carried) = legacy_annotations(attachment.annotations()) else {
            return Ok(Conversion::Current(attachment));
        };

        let store = &self.ctx.store;
        if store.get_attachment(&name).await?.is_none() {
            return Ok(Conversion::Gone);
        }
        store
            .modify_attachment(&name, &|a| {
                a.annotations_mut()
                    .insert(API_VERSION_ANNOTATION.to_string(), CURRENT_API_VERSION.to_string());
            })
            .await?;
        let converted = store
            .modify_attachment_status(&name, &|s| {
                for (key, value) in &carried {
                    s.annotations.entry(key.clone()).or_insert_with(|| value.clone());
                }
            })
            .await?;
        info!(attachment = %name, "Converted attachment to {}", CURRENT_API_VERSION);
        Ok(Conversion::Converted(converted))
    }

    // =========================================================================
    // Transient state reset
    // =========================================================================

    async fn reset_volume(&self, volume: DiskVolume) -> Result<(DiskVolume, bool)> {
        let name = volume.name_any();
        let state = volume.state();
        if !state.is_transient() || self.ctx.state.volume_queues.contains(&name) {
            return Ok((volume, false));
        }

        let target = state.recovery_target();
        let stamp = chrono::Utc::now().to_rfc3339();
        let reset = self
            .ctx
            .store
            .modify_volume_status(&name, &|s| {
                s.state = target;
                s.annotations.set_intent(Intent::Recovered, stamp.clone());
            })
            .await?;
        info!(volume = %name, from = %state, to = %target, "Reset volume left in a transient state");
        Ok((reset, true))
    }

    async fn reset_attachment(
        &self,
        attachment: DiskVolumeAttachment,
    ) -> Result<(DiskVolumeAttachment, bool)> {
        let name = attachment.name_any();
        let state = attachment.state();
        if !state.is_transient() || self.ctx.state.attachment_queues.contains(&name) {
            return Ok((attachment, false));
        }

        let target: AttachmentState = state.recovery_target();
        let stamp = chrono::Utc::now().to_rfc3339();
        let reset = self
            .ctx
            .store
            .modify_attachment_status(&name, &|s| {
                s.state = target;
                s.annotations.set_intent(Intent::Recovered, stamp.clone());
            })
            .await?;
        info!(attachment = %name, from = %state, to = %target, "Reset attachment left in a transient state");
        Ok((reset, true))
    }
}
