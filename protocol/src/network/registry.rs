//! # Node Registry
//!
//! The known-nodes map. A node enters the registry when it answers one of
//! our discovery requests, and stays `Active` while we keep hearing from it.
//!
//! ## Eviction
//!
//! Nodes that go quiet age out in two steps, driven by [`NodeRegistry::sweep`]:
//!
//! ```text
//! last_seen ─── stale_after ───▶ Stale ─── evict_after ───▶ removed
//! ```
//!
//! A stale node is no longer a direct connection (routing skips it) but any
//! message from it flips it back to `Active`. Eviction removes the record;
//! the caller is expected to drop routes through it.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::PROTOCOL_VERSION;

/// Functional role a node plays in the lattice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Core,
    Vitality,
    Wealth,
    Router,
    Gateway,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Core => "core",
            NodeRole::Vitality => "vitality",
            NodeRole::Wealth => "wealth",
            NodeRole::Router => "router",
            NodeRole::Gateway => "gateway",
        }
    }

    /// Directive families a node of this role advertises.
    pub fn specializations(&self) -> &'static [&'static str] {
        match self {
            NodeRole::Core => &["coordination", "error_correction"],
            NodeRole::Vitality => &["health_monitoring", "wellness_analysis"],
            NodeRole::Wealth => &["financial_analysis", "spending_review"],
            NodeRole::Router => &["message_routing", "topology_maintenance"],
            NodeRole::Gateway => &["external_bridge"],
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NodeRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "core" => Ok(NodeRole::Core),
            "vitality" => Ok(NodeRole::Vitality),
            "wealth" => Ok(NodeRole::Wealth),
            "router" => Ok(NodeRole::Router),
            "gateway" => Ok(NodeRole::Gateway),
            other => Err(format!("unknown node role {:?}", other)),
        }
    }
}

/// What a node advertises about itself in discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub roles: Vec<NodeRole>,
    #[serde(default)]
    pub specializations: Vec<String>,
    #[serde(default)]
    pub protocol_version: String,
}

impl Capabilities {
    pub fn for_role(role: NodeRole) -> Self {
        Self {
            roles: vec![role],
            specializations: role.specializations().iter().map(|s| s.to_string()).collect(),
            protocol_version: PROTOCOL_VERSION.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Active,
    Stale,
}

/// A peer we know about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkNode {
    pub node_id: String,
    pub role: NodeRole,
    /// Advertised Ed25519 key, hex. Informational only: discovery never
    /// grants trust.
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub endpoint: String,
    pub capabilities: Capabilities,
    pub last_seen: f64,
    pub status: NodeStatus,
}

impl NetworkNode {
    pub fn new(node_id: impl Into<String>, role: NodeRole, last_seen: f64) -> Self {
        Self {
            node_id: node_id.into(),
            role,
            public_key: None,
            endpoint: String::new(),
            capabilities: Capabilities::for_role(role),
            last_seen,
            status: NodeStatus::Active,
        }
    }
}

/// Result of [`NodeRegistry::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Added,
    Updated,
    /// Registry full; the node was not recorded.
    Rejected,
}

/// Thread-safe known-nodes map with capacity and age-based eviction.
#[derive(Debug)]
pub struct NodeRegistry {
    max_nodes: usize,
    stale_after: f64,
    evict_after: f64,
    nodes: RwLock<HashMap<String, NetworkNode>>,
}

impl NodeRegistry {
    pub fn new(max_nodes: usize, stale_after: Duration, evict_after: Duration) -> Self {
        Self {
            max_nodes,
            stale_after: stale_after.as_secs_f64(),
            evict_after: evict_after.as_secs_f64(),
            nodes: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or refresh a node record. A refreshed record is always `Active`.
    pub fn upsert(&self, mut node: NetworkNode) -> Upsert {
        node.status = NodeStatus::Active;
        let mut nodes = self.nodes.write();
        if let Some(existing) = nodes.get_mut(&node.node_id) {
            *existing = node;
            return Upsert::Updated;
        }
        if nodes.len() >= self.max_nodes {
            warn!(node_id = %node.node_id, max = self.max_nodes, "node registry full, ignoring node");
            return Upsert::Rejected;
        }
        info!(node_id = %node.node_id, role = %node.role, "discovered node");
        nodes.insert(node.node_id.clone(), node);
        Upsert::Added
    }

    /// Record that we heard from `node_id`. Unknown ids are ignored.
    pub fn touch(&self, node_id: &str, now: f64) -> bool {
        let mut nodes = self.nodes.write();
        match nodes.get_mut(node_id) {
            Some(node) => {
                if node.status == NodeStatus::Stale {
                    debug!(node_id, "stale node is active again");
                }
                node.last_seen = node.last_seen.max(now);
                node.status = NodeStatus::Active;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, node_id: &str) -> Option<NetworkNode> {
        self.nodes.read().get(node_id).cloned()
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.read().contains_key(node_id)
    }

    /// A direct connection is a known node that is currently `Active`.
    pub fn is_connected(&self, node_id: &str) -> bool {
        self.nodes
            .read()
            .get(node_id)
            .map_or(false, |n| n.status == NodeStatus::Active)
    }

    /// Active node ids, sorted.
    pub fn connected_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .nodes
            .read()
            .values()
            .filter(|n| n.status == NodeStatus::Active)
            .map(|n| n.node_id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Every known node id, sorted.
    pub fn known_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.nodes.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Snapshot of all records, sorted by id.
    pub fn nodes(&self) -> Vec<NetworkNode> {
        let mut all: Vec<NetworkNode> = self.nodes.read().values().cloned().collect();
        all.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        all
    }

    pub fn remove(&self, node_id: &str) -> Option<NetworkNode> {
        self.nodes.write().remove(node_id)
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    /// Age every record against `now`. Returns the ids that were evicted.
    pub fn sweep(&self, now: f64) -> Vec<String> {
        let mut nodes = self.nodes.write();
        let mut evicted = Vec::new();
        nodes.retain(|id, node| {
            let silent = now - node.last_seen;
            if silent > self.evict_after {
                evicted.push(id.clone());
                return false;
            }
            if silent > self.stale_after && node.status == NodeStatus::Active {
                debug!(node_id = %id, silent_secs = silent, "node went stale");
                node.status = NodeStatus::Stale;
            }
            true
        });
        evicted.sort();
        for id in &evicted {
            info!(node_id = %id, "evicted silent node");
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(max: usize) -> NodeRegistry {
        NodeRegistry::new(max, Duration::from_secs(90), Duration::from_secs(300))
    }

    #[test]
    fn upsert_and_refresh() {
        let reg = registry(8);
        assert_eq!(reg.upsert(NetworkNode::new("b", NodeRole::Wealth, 10.0)), Upsert::Added);
        assert_eq!(reg.upsert(NetworkNode::new("b", NodeRole::Wealth, 20.0)), Upsert::Updated);
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get("b").unwrap().last_seen, 20.0);
        assert!(reg.is_connected("b"));
    }

    #[test]
    fn capacity_rejects_new_nodes_only() {
        let reg = registry(1);
        reg.upsert(NetworkNode::new("a", NodeRole::Core, 0.0));
        assert_eq!(reg.upsert(NetworkNode::new("b", NodeRole::Core, 0.0)), Upsert::Rejected);
        assert_eq!(reg.upsert(NetworkNode::new("a", NodeRole::Core, 5.0)), Upsert::Updated);
        assert_eq!(reg.known_ids(), vec!["a"]);
    }

    #[test]
    fn sweep_marks_stale_then_evicts() {
        let reg = registry(8);
        reg.upsert(NetworkNode::new("quiet", NodeRole::Vitality, 0.0));
        reg.upsert(NetworkNode::new("chatty", NodeRole::Core, 0.0));

        reg.touch("chatty", 100.0);
        assert!(reg.sweep(100.0).is_empty());
        assert!(!reg.is_connected("quiet"));
        assert_eq!(reg.get("quiet").unwrap().status, NodeStatus::Stale);
        assert_eq!(reg.connected_ids(), vec!["chatty"]);

        assert_eq!(reg.sweep(301.0), vec!["quiet"]);
        assert!(!reg.contains("quiet"));
        assert!(reg.contains("chatty"));
    }

    #[test]
    fn touch_revives_stale_node() {
        let reg = registry(8);
        reg.upsert(NetworkNode::new("b", NodeRole::Router, 0.0));
        reg.sweep(120.0);
        assert!(!reg.is_connected("b"));
        assert!(reg.touch("b", 121.0));
        assert!(reg.is_connected("b"));
        assert!(!reg.touch("unknown", 121.0));
    }

    #[test]
    fn role_parsing_and_capabilities() {
        assert_eq!("ROUTER".parse::<NodeRole>().unwrap(), NodeRole::Router);
        assert!("mayor".parse::<NodeRole>().is_err());
        let caps = Capabilities::for_role(NodeRole::Wealth);
        assert_eq!(caps.roles, vec![NodeRole::Wealth]);
        assert!(caps.specializations.contains(&"financial_analysis".to_string()));
        assert_eq!(serde_json::to_value(NodeRole::Vitality).unwrap(), "vitality");
    }
}
