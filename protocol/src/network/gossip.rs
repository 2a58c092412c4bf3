//! # Control Frames
//!
//! Discovery, gossip and routing updates travel as plain JSON control frames
//! on the `lattice/network/*` and `lattice/{id}/discovery` topics. They are
//! unsigned and advisory: they shape the known-nodes map and the routing
//! table, never the trust store. A forged frame can at worst misroute
//! messages, which the destination still verifies.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::Result;
use crate::network::registry::NetworkNode;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    /// "Who is out there?" Published on the shared discovery topic.
    DiscoveryRequest { requester: NetworkNode, timestamp: f64 },
    /// Answer, published on the requester's reply topic.
    DiscoveryResponse { node: NetworkNode, timestamp: f64 },
    /// Periodic neighbour summary.
    NetworkGossip {
        node_id: String,
        known_nodes: Vec<String>,
        routing_table: BTreeMap<String, String>,
        timestamp: f64,
    },
    /// A router's view of which destinations it can reach.
    RoutingUpdate {
        router_id: String,
        routing_table: BTreeMap<String, String>,
        timestamp: f64,
    },
}

impl ControlFrame {
    /// Node that originated the frame.
    pub fn origin(&self) -> &str {
        match self {
            ControlFrame::DiscoveryRequest { requester, .. } => &requester.node_id,
            ControlFrame::DiscoveryResponse { node, .. } => &node.node_id,
            ControlFrame::NetworkGossip { node_id, .. } => node_id,
            ControlFrame::RoutingUpdate { router_id, .. } => router_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ControlFrame::DiscoveryRequest { .. } => "discovery_request",
            ControlFrame::DiscoveryResponse { .. } => "discovery_response",
            ControlFrame::NetworkGossip { .. } => "network_gossip",
            ControlFrame::RoutingUpdate { .. } => "routing_update",
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::registry::NodeRole;

    #[test]
    fn frames_are_tagged_json() {
        let frame = ControlFrame::NetworkGossip {
            node_id: "b".into(),
            known_nodes: vec!["a".into(), "c".into()],
            routing_table: BTreeMap::new(),
            timestamp: 1.0,
        };
        let value: serde_json::Value = serde_json::from_slice(&frame.to_bytes().unwrap()).unwrap();
        assert_eq!(value["type"], "network_gossip");
        assert_eq!(value["known_nodes"][1], "c");
        assert_eq!(frame.origin(), "b");
    }

    #[test]
    fn discovery_request_carries_requester() {
        let frame = ControlFrame::DiscoveryRequest {
            requester: NetworkNode::new("a", NodeRole::Core, 2.0),
            timestamp: 2.0,
        };
        let back = ControlFrame::from_bytes(&frame.to_bytes().unwrap()).unwrap();
        assert_eq!(back, frame);
        assert_eq!(back.kind(), "discovery_request");
        assert_eq!(back.origin(), "a");
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(ControlFrame::from_bytes(b"{\"type\":\"nope\"}").is_err());
        assert!(ControlFrame::from_bytes(b"not json").is_err());
    }
}
