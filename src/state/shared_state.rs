//! Shared State Store
//!
//! Process-wide bookkeeping for the reconcilers: node attachment slots, the
//! pod/claim index, claim/volume bindings, nodes already tried per volume and
//! the volume to attachment index. Every map is a `DashMap`, so locking is
//! per key (per shard) and unrelated resources never contend on one lock.
//! Guards are never held across an await point.

use super::operation_queue::OperationQueues;
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

// =============================================================================
// Node Slots
// =============================================================================

/// Attachment slot accounting for one node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeSlots {
    /// Max volumes the node can hold
    pub capacity: u32,
    /// Slots currently reserved or attached
    pub used: u32,
}

impl NodeSlots {
    pub fn available(&self) -> u32 {
        self.capacity.saturating_sub(self.used)
    }
}

// =============================================================================
// Shared State
// =============================================================================

/// Shared bookkeeping handle passed to every reconciler
#[derive(Debug, Default)]
pub struct SharedState {
    node_slots: DashMap<String, NodeSlots>,
    pod_to_claims: DashMap<String, BTreeSet<String>>,
    claim_to_pods: DashMap<String, BTreeSet<String>>,
    claim_to_volume: DashMap<String, String>,
    volume_to_claim: DashMap<String, String>,
    volume_to_visited_nodes: DashMap<String, BTreeSet<String>>,
    volume_to_attachments: DashMap<String, BTreeSet<String>>,

    /// Per-volume operation queues
    pub volume_queues: OperationQueues,
    /// Per-attachment operation queues
    pub attachment_queues: OperationQueues,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Node availability
    // =========================================================================

    /// Set a node's capacity, keeping its current usage
    pub fn set_node_capacity(&self, node: &str, capacity: u32) {
        self.node_slots
            .entry(node.to_string())
            .and_modify(|slots| slots.capacity = capacity)
            .or_insert(NodeSlots { capacity, used: 0 });
    }

    /// Replace a node's record wholesale (used by recovery and node resync)
    pub fn set_node_slots(&self, node: &str, slots: NodeSlots) {
        self.node_slots.insert(node.to_string(), slots);
    }

    pub fn remove_node(&self, node: &str) -> Option<NodeSlots> {
        self.node_slots.remove(node).map(|(_, slots)| slots)
    }

    pub fn has_node(&self, node: &str) -> bool {
        self.node_slots.contains_key(node)
    }

    pub fn available_slots(&self, node: &str) -> Option<u32> {
        self.node_slots.get(node).map(|s| s.available())
    }

    pub fn node_slots(&self, node: &str) -> Option<NodeSlots> {
        self.node_slots.get(node).map(|s| *s)
    }

    /// Point-in-time copy of available slots per node
    pub fn snapshot_availability(&self) -> BTreeMap<String, u32> {
        self.node_slots
            .iter()
            .map(|e| (e.key().clone(), e.value().available()))
            .collect()
    }

    /// Reserve one slot under the node's lock; false when none is left
    pub fn reserve_slot(&self, node: &str) -> bool {
        match self.node_slots.get_mut(node) {
            Some(mut slots) if slots.available() > 0 => {
                slots.used += 1;
                true
            }
            _ => false,
        }
    }

    /// Give back a slot taken by `reserve_slot`
    pub fn release_slot(&self, node: &str) {
        if let Some(mut slots) = self.node_slots.get_mut(node) {
            slots.used = slots.used.saturating_sub(1);
        }
    }

    // =========================================================================
    // Pod <-> claim index
    // =========================================================================

    /// Record the claims a pod references, replacing the previous set.
    ///
    /// Returns claims the pod no longer references and nobody else does.
    pub fn set_pod_claims(&self, pod: &str, claims: BTreeSet<String>) -> Vec<String> {
        let previous = self
            .pod_to_claims
            .insert(pod.to_string(), claims.clone())
            .unwrap_or_default();

        for claim in &claims {
            self.claim_to_pods
                .entry(claim.clone())
                .or_default()
                .insert(pod.to_string());
        }

        previous
            .difference(&claims)
            .filter_map(|claim| self.detach_pod_from_claim(pod, claim))
            .collect()
    }

    /// Drop a pod from the index, returning claims left without any pod
    pub fn remove_pod(&self, pod: &str) -> Vec<String> {
        let claims = match self.pod_to_claims.remove(pod) {
            Some((_, claims)) => claims,
            None => return Vec::new(),
        };
        let orphaned: Vec<String> = claims
            .iter()
            .filter_map(|claim| self.detach_pod_from_claim(pod, claim))
            .collect();
        debug!(pod = %pod, orphaned = orphaned.len(), "Pod removed from claim index");
        orphaned
    }

    fn detach_pod_from_claim(&self, pod: &str, claim: &str) -> Option<String> {
        let now_empty = match self.claim_to_pods.get_mut(claim) {
            Some(mut pods) => {
                pods.remove(pod);
                pods.is_empty()
            }
            None => return None,
        };
        if now_empty {
            self.claim_to_pods.remove_if(claim, |_, pods| pods.is_empty());
            Some(claim.to_string())
        } else {
            None
        }
    }

    pub fn claims_of_pod(&self, pod: &str) -> BTreeSet<String> {
        self.pod_to_claims
            .get(pod)
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    pub fn pods_for_claim(&self, claim: &str) -> BTreeSet<String> {
        self.claim_to_pods
            .get(claim)
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    pub fn has_claim(&self, claim: &str) -> bool {
        self.claim_to_pods.contains_key(claim)
    }

    // =========================================================================
    // Claim <-> volume bindings
    // =========================================================================

    pub fn bind_claim(&self, claim: &str, volume: &str) {
        self.claim_to_volume
            .insert(claim.to_string(), volume.to_string());
        self.volume_to_claim
            .insert(volume.to_string(), claim.to_string());
    }

    pub fn volume_for_claim(&self, claim: &str) -> Option<String> {
        self.claim_to_volume.get(claim).map(|v| v.clone())
    }

    pub fn claim_for_volume(&self, volume: &str) -> Option<String> {
        self.volume_to_claim.get(volume).map(|c| c.clone())
    }

    pub fn unbind_volume(&self, volume: &str) {
        if let Some((_, claim)) = self.volume_to_claim.remove(volume) {
            self.claim_to_volume.remove_if(&claim, |_, v| v == volume);
        }
    }

    // =========================================================================
    // Visited nodes
    // =========================================================================

    /// Remember that placing `volume` on `node` failed
    pub fn mark_visited(&self, volume: &str, node: &str) {
        self.volume_to_visited_nodes
            .entry(volume.to_string())
            .or_default()
            .insert(node.to_string());
    }

    pub fn visited_nodes(&self, volume: &str) -> BTreeSet<String> {
        self.volume_to_visited_nodes
            .get(volume)
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    pub fn clear_visited(&self, volume: &str) {
        self.volume_to_visited_nodes.remove(volume);
    }

    // =========================================================================
    // Volume -> attachments index
    // =========================================================================

    pub fn track_attachment(&self, volume: &str, attachment: &str) {
        self.volume_to_attachments
            .entry(volume.to_string())
            .or_default()
            .insert(attachment.to_string());
    }

    pub fn untrack_attachment(&self, volume: &str, attachment: &str) {
        if let Some(mut attachments) = self.volume_to_attachments.get_mut(volume) {
            attachments.remove(attachment);
        }
        self.volume_to_attachments
            .remove_if(volume, |_, a| a.is_empty());
    }

    pub fn attachments_of(&self, volume: &str) -> BTreeSet<String> {
        self.volume_to_attachments
            .get(volume)
            .map(|a| a.clone())
            .unwrap_or_default()
    }

    /// Forget every per-volume index entry
    pub fn forget_volume(&self, volume: &str) {
        self.volume_to_attachments.remove(volume);
        self.clear_visited(volume);
        self.unbind_volume(volume);
    }

    /// Clear the derived indexes before a recovery rebuild.
    ///
    /// Operation queues are kept: live entries mark in-flight work.
    pub fn reset_indexes(&self) {
        self.node_slots.clear();
        self.pod_to_claims.clear();
        self.claim_to_pods.clear();
        self.claim_to_volume.clear();
        self.volume_to_claim.clear();
        self.volume_to_visited_nodes.clear();
        self.volume_to_attachments.clear();
    }

    pub fn node_count(&self) -> usize {
        self.node_slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_slot_reservation_is_bounded() {
        let state = SharedState::new();
        state.set_node_capacity("node-1", 2);

        assert!(state.reserve_slot("node-1"));
        assert!(state.reserve_slot("node-1"));
        assert!(!state.reserve_slot("node-1"));
        assert_eq!(state.available_slots("node-1"), Some(0));

        state.release_slot("node-1");
        assert_eq!(state.available_slots("node-1"), Some(1));

        // Unknown nodes never hand out slots
        assert!(!state.reserve_slot("node-2"));
    }

    #[test]
    fn test_capacity_update_keeps_usage() {
        let state = SharedState::new();
        state.set_node_capacity("node-1", 4);
        state.reserve_slot("node-1");
        state.set_node_capacity("node-1", 8);
        assert_eq!(
            state.node_slots("node-1"),
            Some(NodeSlots { capacity: 8, used: 1 })
        );
    }

    #[test]
    fn test_pod_claim_index_orphans() {
        let state = SharedState::new();
        state.set_pod_claims("ns/pod-a", claims(&["ns/claim-1", "ns/claim-2"]));
        state.set_pod_claims("ns/pod-b", claims(&["ns/claim-2"]));

        assert_eq!(state.pods_for_claim("ns/claim-2").len(), 2);

        let orphaned = state.remove_pod("ns/pod-a");
        assert_eq!(orphaned, vec!["ns/claim-1".to_string()]);
        assert!(!state.has_claim("ns/claim-1"));
        assert!(state.has_claim("ns/claim-2"));

        let orphaned = state.remove_pod("ns/pod-b");
        assert_eq!(orphaned, vec!["ns/claim-2".to_string()]);
        assert!(state.remove_pod("ns/pod-b").is_empty());
    }

    #[test]
    fn test_pod_claim_update_releases_dropped_claims() {
        let state = SharedState::new();
        state.set_pod_claims("ns/pod-a", claims(&["ns/claim-1", "ns/claim-2"]));
        let orphaned = state.set_pod_claims("ns/pod-a", claims(&["ns/claim-2"]));
        assert_eq!(orphaned, vec!["ns/claim-1".to_string()]);
        assert_eq!(state.claims_of_pod("ns/pod-a"), claims(&["ns/claim-2"]));
    }

    #[test]
    fn test_attachment_index_and_visited() {
        let state = SharedState::new();
        state.track_attachment("vol-a", "vol-a-node-1-attachment");
        state.track_attachment("vol-a", "vol-a-node-2-attachment");
        state.mark_visited("vol-a", "node-3");
        state.bind_claim("ns/claim-1", "vol-a");

        state.untrack_attachment("vol-a", "vol-a-node-1-attachment");
        assert_eq!(state.attachments_of("vol-a").len(), 1);
        assert!(state.visited_nodes("vol-a").contains("node-3"));
        assert_eq!(state.volume_for_claim("ns/claim-1").as_deref(), Some("vol-a"));

        state.forget_volume("vol-a");
        assert!(state.attachments_of("vol-a").is_empty());
        assert!(state.visited_nodes("vol-a").is_empty());
        assert!(state.volume_for_claim("ns/claim-1").is_none());
    }
}
