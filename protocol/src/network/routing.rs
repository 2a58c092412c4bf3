//! # Routing
//!
//! `destination → next hop`, eventually consistent. Entries come from three
//! places: direct connections (router rebuild), gossip (a neighbour says it
//! knows a node we don't), and routing updates published by router nodes.
//!
//! ## Resolution order
//!
//! ```text
//! 1. destination is us                 → Local
//! 2. destination is a direct connection → Direct(destination)
//! 3. table has an entry                 → Table(next_hop)
//! 4. mesh, at least one connection      → Fallback(first connected)
//!    star, hub connected                → Fallback(hub)
//! 5. otherwise                          → NoRoute
//! ```

use parking_lot::RwLock;
use std::collections::BTreeMap;
use tracing::{debug, trace};

use crate::config::Topology;
use crate::error::{LatticeError, Result};
use crate::network::registry::NodeRegistry;

/// Where a message for some destination should go next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Local,
    Direct(String),
    Table(String),
    Fallback(String),
}

impl Route {
    /// Next hop, or `None` for local delivery.
    pub fn next_hop(&self) -> Option<&str> {
        match self {
            Route::Local => None,
            Route::Direct(hop) | Route::Table(hop) | Route::Fallback(hop) => Some(hop),
        }
    }
}

#[derive(Debug, Default)]
pub struct RoutingTable {
    routes: RwLock<BTreeMap<String, String>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_hop(&self, destination: &str) -> Option<String> {
        self.routes.read().get(destination).cloned()
    }

    pub fn insert(&self, destination: impl Into<String>, next_hop: impl Into<String>) {
        self.routes.write().insert(destination.into(), next_hop.into());
    }

    pub fn remove(&self, destination: &str) -> Option<String> {
        self.routes.write().remove(destination)
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.routes.read().clone()
    }

    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }

    /// Resolve the next step for `destination` from `local_id`'s point of view.
    pub fn resolve(
        &self,
        local_id: &str,
        destination: &str,
        registry: &NodeRegistry,
        topology: Topology,
        hub: Option<&str>,
    ) -> Result<Route> {
        if destination == local_id {
            return Ok(Route::Local);
        }
        if registry.is_connected(destination) {
            return Ok(Route::Direct(destination.to_string()));
        }
        if let Some(hop) = self.next_hop(destination) {
            if hop != local_id {
                return Ok(Route::Table(hop));
            }
        }
        let fallback = match topology {
            Topology::Mesh => registry.connected_ids().into_iter().next(),
            Topology::Star => hub
                .filter(|h| *h != local_id && registry.is_connected(h))
                .map(str::to_string),
        };
        match fallback {
            Some(hop) => {
                trace!(destination, hop = %hop, ?topology, "no known route, using fallback");
                Ok(Route::Fallback(hop))
            }
            None => Err(LatticeError::NoRoute(destination.to_string())),
        }
    }

    /// Merge a neighbour's view. Ids we already route, are connected to, or
    /// are ourselves stay untouched; the rest map to `gossiper`.
    /// Returns the number of new routes.
    pub fn merge_gossip<'a>(
        &self,
        local_id: &str,
        gossiper: &str,
        advertised: impl IntoIterator<Item = &'a str>,
        registry: &NodeRegistry,
    ) -> usize {
        let mut routes = self.routes.write();
        let mut added = 0;
        for dest in advertised {
            if dest == local_id
                || dest == gossiper
                || routes.contains_key(dest)
                || registry.is_connected(dest)
            {
                continue;
            }
            routes.insert(dest.to_string(), gossiper.to_string());
            added += 1;
        }
        if added > 0 {
            debug!(gossiper, added, "learned routes from gossip");
        }
        added
    }

    /// Apply a router's published table: every destination it can reach that
    /// is not a direct connection of ours is routed through the router.
    pub fn apply_router_update<'a>(
        &self,
        local_id: &str,
        router: &str,
        destinations: impl IntoIterator<Item = &'a str>,
        registry: &NodeRegistry,
    ) -> usize {
        let mut routes = self.routes.write();
        let mut changed = 0;
        for dest in destinations {
            if dest == local_id || dest == router || registry.is_connected(dest) {
                continue;
            }
            if routes.get(dest).map(String::as_str) != Some(router) {
                routes.insert(dest.to_string(), router.to_string());
                changed += 1;
            }
        }
        changed
    }

    /// Router rebuild: every direct connection routes to itself, learned
    /// routes survive only while their next hop is still connected.
    pub fn rebuild(&self, registry: &NodeRegistry) -> usize {
        let connected = registry.connected_ids();
        let mut routes = self.routes.write();
        routes.retain(|_, hop| connected.contains(hop));
        for id in &connected {
            routes.insert(id.clone(), id.clone());
        }
        routes.len()
    }

    /// Drop every route to or through `node_id`.
    pub fn forget_node(&self, node_id: &str) -> usize {
        let mut routes = self.routes.write();
        let before = routes.len();
        routes.retain(|dest, hop| dest != node_id && hop != node_id);
        before - routes.len()
    }
}
