//! Node Reconciler
//!
//! Keeps the node availability records in line with the cluster. A node
//! that disappears has its primaries failed over and every attachment on it
//! marked for detachment; a node that stops being Ready has its primaries
//! failed over when configured to.

use super::attachment::failover_primary;
use super::{ContextRef, ControllerConfig, ControllerContext, ReconcileOutcome, Reconciler, ResourceKind};
use crate::crd::{AttachmentRole, Intent, IntentSet};
use crate::error::Result;
use crate::state::NodeSlots;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

// =============================================================================
// Node helpers
// =============================================================================

/// The node's Ready condition is True
pub fn is_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| conds.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
        .unwrap_or(false)
}

/// Ready and not cordoned
pub fn is_schedulable(node: &Node) -> bool {
    let cordoned = node
        .spec
        .as_ref()
        .and_then(|s| s.unschedulable)
        .unwrap_or(false);
    is_ready(node) && !cordoned
}

/// Attachable volume count the node advertises, or the configured default
pub fn node_capacity(node: &Node, config: &ControllerConfig) -> u32 {
    node.status
        .as_ref()
        .and_then(|s| s.allocatable.as_ref())
        .and_then(|a| a.get(&config.attachable_volumes_resource))
        .and_then(|q| q.0.parse::<u32>().ok())
        .unwrap_or(config.default_max_volumes_per_node)
}

/// Zone label of the node, under the configured topology key
pub fn node_zone<'a>(node: &'a Node, config: &ControllerConfig) -> Option<&'a str> {
    node.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(&config.topology_key))
        .map(String::as_str)
}

/// Create or refresh the availability record of `node`.
///
/// A new record counts the attachments already holding slots on the node.
pub(crate) async fn track_node(ctx: &ControllerContext, node: &Node) -> Result<()> {
    let Some(name) = node.metadata.name.as_deref() else {
        return Ok(());
    };
    let capacity = node_capacity(node, &ctx.config);
    if ctx.state.has_node(name) {
        ctx.state.set_node_capacity(name, capacity);
        return Ok(());
    }

    let used = ctx
        .store
        .list_attachments_for_node(name)
        .await?
        .iter()
        .filter(|a| a.state().occupies_slot())
        .count() as u32;
    ctx.state.set_node_slots(name, NodeSlots { capacity, used });
    let zone = node_zone(node, &ctx.config).unwrap_or("none");
    debug!(node = %name, zone = %zone, capacity, used, "Tracking node");
    Ok(())
}

/// Make sure `name` has an availability record; false if the node is unknown
pub(crate) async fn ensure_node_tracked(ctx: &ControllerContext, name: &str) -> Result<bool> {
    if ctx.state.has_node(name) {
        return Ok(true);
    }
    match ctx.cluster.get_node(name).await? {
        Some(node) => {
            track_node(ctx, &node).await?;
            Ok(true)
        }
        None => Ok(false),
    }
}

// =============================================================================
// Node Reconciler
// =============================================================================

pub struct NodeReconciler {
    ctx: ContextRef,
}

impl NodeReconciler {
    pub fn new(ctx: ContextRef) -> Self {
        Self { ctx }
    }

    /// Fail over every live primary on `node`, returning the promotions made
    pub async fn failover_node(&self, node: &str) -> Result<usize> {
        let volumes: BTreeSet<String> = self
            .ctx
            .store
            .list_attachments_for_node(node)
            .await?
            .into_iter()
            .filter(|a| {
                a.spec.role == AttachmentRole::Primary
                    && !a.is_deleting()
                    && !a.status_annotations().has_intent(Intent::DetachRequest)
            })
            .map(|a| a.spec.volume_name)
            .collect();

        let mut promoted = 0;
        for volume in volumes {
            if failover_primary(&self.ctx, &volume, node).await?.is_some() {
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    async fn node_removed(&self, name: &str) -> Result<ReconcileOutcome> {
        let attachments = self.ctx.store.list_attachments_for_node(name).await?;
        if attachments.is_empty() && !self.ctx.state.has_node(name) {
            return Ok(ReconcileOutcome::Done);
        }

        let promoted = self.failover_node(name).await?;
        let mut detaching = 0;
        for attachment in attachments {
            if attachment.is_deleting()
                || attachment.status_annotations().has_intent(Intent::DetachRequest)
            {
                continue;
            }
            self.ctx
                .store
                .modify_attachment_status(&attachment.name_any(), &|s| {
                    s.annotations.set_intent(Intent::DetachRequest, "node-deleted");
                })
                .await?;
            detaching += 1;
        }
        self.ctx.state.remove_node(name);

        info!(node = %name, promoted, detaching, "Node removed");
        Ok(ReconcileOutcome::Done)
    }
}

#[async_trait]
impl Reconciler for NodeReconciler {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Node
    }

    async fn reconcile(&self, name: &str) -> Result<ReconcileOutcome> {
        let node = match self.ctx.cluster.get_node(name).await? {
            Some(node) if node.metadata.deletion_timestamp.is_none() => node,
            _ => return self.node_removed(name).await,
        };

        track_node(&self.ctx, &node).await?;

        if self.ctx.config.failover_on_not_ready && !is_ready(&node) {
            let promoted = self.failover_node(name).await?;
            if promoted > 0 {
                warn!(node = %name, promoted, "Node not ready, primaries failed over");
            }
        }
        Ok(ReconcileOutcome::Done)
    }
}
