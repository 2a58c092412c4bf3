//! Topic names.
//!
//! ```text
//! lattice/{node_id}/directives     addressed directives (and other typed messages)
//! lattice/{node_id}/responses      addressed responses
//! lattice/{node_id}/discovery      discovery replies for one requester
//! lattice/network/discovery        discovery requests
//! lattice/network/routing          router table updates
//! lattice/network/gossip           known-node gossip
//! lattice/broadcast/general        unaddressed messages
//! ```

use crate::config::TOPIC_ROOT;

pub fn directives(node_id: &str) -> String {
    format!("{}/{}/directives", TOPIC_ROOT, node_id)
}

pub fn responses(node_id: &str) -> String {
    format!("{}/{}/responses", TOPIC_ROOT, node_id)
}

pub fn discovery_reply(node_id: &str) -> String {
    format!("{}/{}/discovery", TOPIC_ROOT, node_id)
}

pub fn discovery() -> String {
    format!("{}/network/discovery", TOPIC_ROOT)
}

pub fn routing() -> String {
    format!("{}/network/routing", TOPIC_ROOT)
}

pub fn gossip() -> String {
    format!("{}/network/gossip", TOPIC_ROOT)
}

pub fn broadcast() -> String {
    format!("{}/broadcast/general", TOPIC_ROOT)
}
