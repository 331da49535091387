//! Replica Placement
//!
//! Chooses nodes for standby replica attachments. A node is eligible when it
//! does not already hold an attachment of the volume, satisfies the volume's
//! topology requirement and the scheduling constraints of the pods using the
//! volume, has a free attachment slot and has not already failed for this
//! volume. Eligible nodes are ordered by co-location preference, then free
//! slots, then name.

use k8s_openapi::api::core::v1::{Node, NodeSelectorRequirement, NodeSelectorTerm, Pod, Taint, Toleration};
use std::collections::{BTreeMap, BTreeSet};

// =============================================================================
// Pod Constraints
// =============================================================================

/// Node scheduling constraints propagated from a pod
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PodConstraints {
    pub node_selector: BTreeMap<String, String>,
    /// Required node affinity terms (ORed)
    pub required_terms: Vec<NodeSelectorTerm>,
    pub tolerations: Vec<Toleration>,
}

impl PodConstraints {
    pub fn from_pod(pod: &Pod) -> Self {
        let Some(spec) = pod.spec.as_ref() else {
            return Self::default();
        };
        let required_terms = spec
            .affinity
            .as_ref()
            .and_then(|a| a.node_affinity.as_ref())
            .and_then(|na| na.required_during_scheduling_ignored_during_execution.as_ref())
            .map(|selector| selector.node_selector_terms.clone())
            .unwrap_or_default();

        Self {
            node_selector: spec.node_selector.clone().unwrap_or_default(),
            required_terms,
            tolerations: spec.tolerations.clone().unwrap_or_default(),
        }
    }

    /// Whether the pod could be scheduled onto `node`
    pub fn admits(&self, node: &Node) -> bool {
        let labels = node.metadata.labels.clone().unwrap_or_default();
        let name = node.metadata.name.as_deref().unwrap_or_default();

        let selector_ok = self
            .node_selector
            .iter()
            .all(|(key, value)| labels.get(key) == Some(value));
        if !selector_ok {
            return false;
        }

        if !self.required_terms.is_empty()
            && !self
                .required_terms
                .iter()
                .any(|term| term_matches(term, &labels, name))
        {
            return false;
        }

        node_taints(node)
            .iter()
            .filter(|taint| taint.effect == "NoSchedule" || taint.effect == "NoExecute")
            .all(|taint| self.tolerations.iter().any(|t| tolerates(t, taint)))
    }
}

fn node_taints(node: &Node) -> Vec<Taint> {
    node.spec
        .as_ref()
        .and_then(|s| s.taints.clone())
        .unwrap_or_default()
}

/// All expressions of a term must match; an empty term matches nothing
fn term_matches(term: &NodeSelectorTerm, labels: &BTreeMap<String, String>, node_name: &str) -> bool {
    let expressions = term.match_expressions.as_deref().unwrap_or_default();
    let fields = term.match_fields.as_deref().unwrap_or_default();
    if expressions.is_empty() && fields.is_empty() {
        return false;
    }

    let mut field_values = BTreeMap::new();
    field_values.insert("metadata.name".to_string(), node_name.to_string());

    expressions.iter().all(|req| requirement_matches(req, labels))
        && fields.iter().all(|req| requirement_matches(req, &field_values))
}

fn requirement_matches(req: &NodeSelectorRequirement, labels: &BTreeMap<String, String>) -> bool {
    let values = req.values.as_deref().unwrap_or_default();
    let actual = labels.get(&req.key);
    match req.operator.as_str() {
        "In" => actual.map(|v| values.contains(v)).unwrap_or(false),
        "NotIn" => actual.map(|v| !values.contains(v)).unwrap_or(true),
        "Exists" => actual.is_some(),
        "DoesNotExist" => actual.is_none(),
        "Gt" | "Lt" => {
            let (Some(actual), Some(bound)) = (
                actual.and_then(|v| v.parse::<i64>().ok()),
                values.first().and_then(|v| v.parse::<i64>().ok()),
            ) else {
                return false;
            };
            if req.operator == "Gt" {
                actual > bound
            } else {
                actual < bound
            }
        }
        _ => false,
    }
}

fn tolerates(toleration: &Toleration, taint: &Taint) -> bool {
    if let Some(effect) = toleration.effect.as_deref() {
        if !effect.is_empty() && effect != taint.effect {
            return false;
        }
    }
    match toleration.operator.as_deref().unwrap_or("Equal") {
        "Exists" => match toleration.key.as_deref() {
            None | Some("") => true,
            Some(key) => key == taint.key,
        },
        _ => {
            toleration.key.as_deref() == Some(taint.key.as_str())
                && toleration.value.as_deref().unwrap_or_default()
                    == taint.value.as_deref().unwrap_or_default()
        }
    }
}

// =============================================================================
// Placement Candidate
// =============================================================================

/// A node considered for a replica
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementCandidate {
    pub node_name: String,
    pub available_slots: u32,
    /// A running pod using the volume sits on this node
    pub pod_node: bool,
    pub preferred: bool,
}

// =============================================================================
// Placement Request / Result
// =============================================================================

/// Everything the engine needs to place replicas of one volume
#[derive(Debug, Clone, Default)]
pub struct PlacementRequest<'a> {
    /// Number of replicas still missing
    pub count: usize,
    /// Nodes that already hold an attachment of the volume (primary included)
    pub excluded_nodes: BTreeSet<String>,
    /// Nodes that already failed for this volume
    pub visited_nodes: BTreeSet<String>,
    /// Nodes running pods that use the volume; ranked first
    pub pod_nodes: BTreeSet<String>,
    /// Nodes hosting replicas of sibling volumes of the same pod
    pub preferred_nodes: BTreeSet<String>,
    /// Zone constraint of the volume
    pub topology: Option<&'a crate::crd::TopologyRequirement>,
    /// Zones the provider reported the disk as reachable from
    pub accessible_topology: &'a [crate::crd::Topology],
    /// Constraints of every pod using the volume
    pub pod_constraints: Vec<PodConstraints>,
}

/// Result of placement calculation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlacementResult {
    pub selected: Vec<PlacementCandidate>,
    /// How many replicas could not be placed
    pub unplaced: usize,
    /// Why nodes were rejected, by node name
    pub rejected: BTreeMap<String, &'static str>,
}

// =============================================================================
// Placement Engine
// =============================================================================

pub struct PlacementEngine;

impl PlacementEngine {
    /// Select up to `request.count` nodes.
    ///
    /// `availability` maps node names to free slots; nodes missing from it
    /// are treated as full.
    pub fn select(
        nodes: &[Node],
        availability: &BTreeMap<String, u32>,
        request: &PlacementRequest<'_>,
    ) -> PlacementResult {
        let mut result = PlacementResult::default();
        if request.count == 0 {
            return result;
        }

        let mut candidates = Vec::new();
        for node in nodes {
            let Some(name) = node.metadata.name.as_deref() else {
                continue;
            };
            match Self::check_node(node, name, availability, request) {
                Ok(candidate) => candidates.push(candidate),
                Err(reason) => {
                    result.rejected.insert(name.to_string(), reason);
                }
            }
        }

        candidates.sort_by(|a, b| {
            b.pod_node
                .cmp(&a.pod_node)
                .then_with(|| b.preferred.cmp(&a.preferred))
                .then_with(|| b.available_slots.cmp(&a.available_slots))
                .then_with(|| a.node_name.cmp(&b.node_name))
        });
        candidates.truncate(request.count);

        result.unplaced = request.count - candidates.len();
        result.selected = candidates;
        result
    }

    fn check_node(
        node: &Node,
        name: &str,
        availability: &BTreeMap<String, u32>,
        request: &PlacementRequest<'_>,
    ) -> Result<PlacementCandidate, &'static str> {
        if request.excluded_nodes.contains(name) {
            return Err("already attached");
        }
        if request.visited_nodes.contains(name) {
            return Err("previously failed");
        }
        if !super::node::is_schedulable(node) {
            return Err("not ready or unschedulable");
        }

        let labels = node.metadata.labels.clone().unwrap_or_default();
        if let Some(topology) = request.topology {
            if !topology.admits(&labels) {
                return Err("topology mismatch");
            }
        }
        if !request.accessible_topology.is_empty()
            && !request.accessible_topology.iter().any(|t| t.matches(&labels))
        {
            return Err("disk not accessible");
        }
        if !request.pod_constraints.iter().all(|c| c.admits(node)) {
            return Err("pod constraints");
        }

        let available_slots = availability.get(name).copied().unwrap_or(0);
        if available_slots == 0 {
            return Err("no free slots");
        }

        Ok(PlacementCandidate {
            node_name: name.to_string(),
            available_slots,
            pod_node: request.pod_nodes.contains(name),
            preferred: request.preferred_nodes.contains(name),
        })
    }
}
