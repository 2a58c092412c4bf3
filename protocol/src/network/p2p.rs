//! # P2P Network
//!
//! Glues one node's [`ProtocolEngine`] to a [`Transport`]: it owns the topic
//! subscriptions, runs discovery, gossip and router updates, resolves routes
//! for outbound messages, and forwards messages that pass through this node
//! on their way somewhere else.
//!
//! ## Forwarding
//!
//! A message arriving on our directive or response topic with someone else's
//! `recipient_id` is forwarded along our own route to that recipient. The
//! forwarder checks TTL only; the destination does the signature check.
//! Every message this node publishes or forwards is remembered in a bounded
//! seen cache, so a message looping back through a flooding path is dropped
//! instead of forwarded again.
//!
//! ## Inbound tasks
//!
//! A message frame is decoded and checked against the seen cache on the
//! transport's delivery path, then handled on a task of its own. The
//! publisher never waits for our handlers, so a handler may itself send a
//! directive back to the node that called it, and a slow handler does not
//! hold up the ones behind it. Control frames are small and stay inline.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use tracing::{debug, info, trace, warn};

use crate::config::{unix_now, Topology, FORWARD_SEEN_CACHE_SIZE, HEALTHY_CONNECTION_COUNT};
use crate::engine::{Inbound, ProtocolEngine};
use crate::error::{LatticeError, Result};
use crate::message::{Message, MessageType};
use crate::network::gossip::ControlFrame;
use crate::network::registry::{Capabilities, NetworkNode, NodeRole, NodeStatus};
use crate::network::routing::Route;
use crate::network::topics;
use crate::network::transport::{frame_handler, Transport};
use crate::node::NodeState;

/// Bounded FIFO set of message fingerprints.
#[derive(Debug, Default)]
struct SeenCache {
    order: VecDeque<String>,
    set: HashSet<String>,
}

impl SeenCache {
    /// `false` if the fingerprint was already present.
    fn insert(&mut self, fingerprint: String) -> bool {
        if !self.set.insert(fingerprint.clone()) {
            return false;
        }
        self.order.push_back(fingerprint);
        while self.order.len() > FORWARD_SEEN_CACHE_SIZE {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
        true
    }
}

/// Point-in-time view of what this node knows about the lattice.
#[derive(Debug, Clone, Serialize)]
pub struct NetworkTopology {
    pub node_id: String,
    pub role: NodeRole,
    pub topology: Topology,
    pub known_nodes: Vec<NetworkNode>,
    pub connected: Vec<String>,
    pub routing_table: BTreeMap<String, String>,
    /// `min(1, connected / 5)`.
    pub health: f64,
}

pub struct P2pNetwork {
    state: Arc<NodeState>,
    engine: Arc<ProtocolEngine>,
    transport: Arc<dyn Transport>,
    seen: Mutex<SeenCache>,
}

impl P2pNetwork {
    pub fn new(
        state: Arc<NodeState>,
        engine: Arc<ProtocolEngine>,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state,
            engine,
            transport,
            seen: Mutex::new(SeenCache::default()),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.state.config.node_id
    }

    /// Subscribe every topic this node listens on.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let id = self.node_id().to_string();
        for topic in [
            topics::directives(&id),
            topics::responses(&id),
            topics::broadcast(),
        ] {
            let weak = Arc::downgrade(self);
            self.transport
                .subscribe(
                    &topic,
                    frame_handler(move |bytes| {
                        let weak: Weak<P2pNetwork> = weak.clone();
                        async move {
                            if let Some(net) = weak.upgrade() {
                                net.on_message_frame(bytes);
                            }
                        }
                    }),
                )
                .await?;
        }
        for topic in [
            topics::discovery(),
            topics::discovery_reply(&id),
            topics::gossip(),
            topics::routing(),
        ] {
            let weak = Arc::downgrade(self);
            self.transport
                .subscribe(
                    &topic,
                    frame_handler(move |bytes| {
                        let weak: Weak<P2pNetwork> = weak.clone();
                        async move {
                            if let Some(net) = weak.upgrade() {
                                net.on_control_frame(bytes).await;
                            }
                        }
                    }),
                )
                .await?;
        }
        info!(node_id = %id, "p2p network started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        self.transport.unsubscribe_all().await?;
        info!(node_id = %self.node_id(), "p2p network stopped");
        Ok(())
    }

    fn remember(&self, message: &Message) -> bool {
        self.seen.lock().insert(message.fingerprint())
    }

    // ----- Outbound -----

    /// Route and publish a signed message.
    ///
    /// Unaddressed messages go to the broadcast topic. Addressed messages go
    /// to the next hop's directive or response topic, or straight into our
    /// own engine when we are the recipient. Returns the route taken, or
    /// `None` for a broadcast. Messages to ourselves are handled on their own
    /// task, like any other inbound message.
    pub async fn deliver(self: &Arc<Self>, message: Message) -> Result<Option<Route>> {
        self.remember(&message);
        let Some(recipient) = message.recipient_id.clone() else {
            self.publish_message(&topics::broadcast(), &message).await?;
            return Ok(None);
        };
        let route = self.resolve(&recipient)?;
        match route.next_hop() {
            None => self.spawn_handle(message),
            Some(hop) => {
                let topic = hop_topic(hop, message.message_type);
                trace!(to = %recipient, hop, ?route, "publishing");
                self.publish_message(&topic, &message).await?;
            }
        }
        Ok(Some(route))
    }

    fn resolve(&self, destination: &str) -> Result<Route> {
        let config = &self.state.config;
        self.state.routes.resolve(
            &config.node_id,
            destination,
            &self.state.registry,
            config.topology,
            config.hub_node.as_deref(),
        )
    }

    async fn publish_message(&self, topic: &str, message: &Message) -> Result<()> {
        self.transport.publish(topic, message.to_bytes()?).await
    }

    // ----- Inbound -----

    /// Decode and dedup here; everything else runs on a spawned task.
    fn on_message_frame(self: &Arc<Self>, bytes: Vec<u8>) {
        let message = match Message::from_bytes(&bytes) {
            Ok(m) => m,
            Err(e) => {
                warn!(node_id = %self.node_id(), error = %e, "undecodable message frame");
                self.state.stats.record_drop(&e);
                return;
            }
        };
        if !self.remember(&message) {
            trace!(node_id = %self.node_id(), msg = %message.message_id, "already seen");
            return;
        }
        self.spawn_handle(message);
    }

    fn spawn_handle(self: &Arc<Self>, message: Message) {
        let net = Arc::clone(self);
        tokio::spawn(async move { net.handle_message(message).await });
    }

    async fn handle_message(&self, message: Message) {
        match message.recipient_id.as_deref() {
            Some(recipient) if recipient != self.node_id() => {
                let recipient = recipient.to_string();
                self.forward(message, &recipient).await;
            }
            _ => {
                let outcome = self.engine.process_incoming_message(message).await;
                if let Inbound::Dropped(e) = &outcome {
                    debug!(node_id = %self.node_id(), reason = e.kind(), "inbound message dropped");
                }
            }
        }
    }

    async fn forward(&self, message: Message, recipient: &str) {
        let now = unix_now();
        if message.is_expired_at(now) {
            let e = LatticeError::StaleMessage {
                age_secs: message.age_at(now),
                limit_secs: message.ttl,
            };
            debug!(node_id = %self.node_id(), error = %e, "not forwarding expired message");
            self.state.stats.record_drop(&e);
            return;
        }
        let route = match self.resolve(recipient) {
            Ok(route) => route,
            Err(e) => {
                self.state.stats.record_no_route();
                warn!(node_id = %self.node_id(), error = %e, "cannot forward");
                return;
            }
        };
        let Some(hop) = route.next_hop() else {
            return;
        };
        let topic = hop_topic(hop, message.message_type);
        debug!(
            node_id = %self.node_id(),
            msg = %message.message_id,
            from = %message.sender_id,
            to = recipient,
            hop,
            "forwarding"
        );
        match self.publish_message(&topic, &message).await {
            Ok(()) => self.state.stats.record_forwarded(),
            Err(e) => warn!(node_id = %self.node_id(), error = %e, "forward failed"),
        }
    }

    async fn on_control_frame(&self, bytes: Vec<u8>) {
        let frame = match ControlFrame::from_bytes(&bytes) {
            Ok(f) => f,
            Err(e) => {
                warn!(node_id = %self.node_id(), error = %e, "undecodable control frame");
                return;
            }
        };
        if frame.origin() == self.node_id() {
            return;
        }
        trace!(node_id = %self.node_id(), kind = frame.kind(), from = frame.origin(), "control frame");
        let local = self.node_id().to_string();
        match frame {
            ControlFrame::DiscoveryRequest { requester, .. } => {
                let reply = ControlFrame::DiscoveryResponse {
                    node: self.self_record(),
                    timestamp: unix_now(),
                };
                if let Err(e) = self
                    .publish_control(&topics::discovery_reply(&requester.node_id), &reply)
                    .await
                {
                    warn!(node_id = %local, error = %e, "discovery reply failed");
                }
            }
            ControlFrame::DiscoveryResponse { mut node, .. } => {
                node.last_seen = unix_now();
                node.status = NodeStatus::Active;
                self.state.registry.upsert(node);
            }
            ControlFrame::NetworkGossip {
                node_id,
                known_nodes,
                routing_table,
                ..
            } => {
                self.state.registry.touch(&node_id, unix_now());
                let advertised = known_nodes
                    .iter()
                    .map(String::as_str)
                    .chain(
                        routing_table
                            .iter()
                            .filter(|(_, hop)| hop.as_str() != local)
                            .map(|(dest, _)| dest.as_str()),
                    );
                self.state
                    .routes
                    .merge_gossip(&local, &node_id, advertised, &self.state.registry);
            }
            ControlFrame::RoutingUpdate {
                router_id,
                routing_table,
                ..
            } => {
                if !self.state.registry.is_connected(&router_id) {
                    trace!(node_id = %local, router = %router_id, "ignoring update from unconnected router");
                    return;
                }
                let changed = self.state.routes.apply_router_update(
                    &local,
                    &router_id,
                    routing_table.keys().map(String::as_str),
                    &self.state.registry,
                );
                if changed > 0 {
                    debug!(node_id = %local, router = %router_id, changed, "applied routing update");
                }
            }
        }
    }

    async fn publish_control(&self, topic: &str, frame: &ControlFrame) -> Result<()> {
        self.transport.publish(topic, frame.to_bytes()?).await
    }

    // ----- Periodic work -----

    /// The record we hand out in discovery.
    pub fn self_record(&self) -> NetworkNode {
        let config = &self.state.config;
        NetworkNode {
            node_id: config.node_id.clone(),
            role: config.role,
            public_key: Some(self.state.crypto.public_key().to_hex()),
            endpoint: config.endpoint.clone(),
            capabilities: Capabilities::for_role(config.role),
            last_seen: unix_now(),
            status: NodeStatus::Active,
        }
    }

    /// Ask everyone in earshot to identify themselves.
    pub async fn discover(&self) -> Result<()> {
        let frame = ControlFrame::DiscoveryRequest {
            requester: self.self_record(),
            timestamp: unix_now(),
        };
        self.publish_control(&topics::discovery(), &frame).await
    }

    /// Tell neighbours who we can reach.
    pub async fn gossip(&self) -> Result<()> {
        let frame = ControlFrame::NetworkGossip {
            node_id: self.node_id().to_string(),
            known_nodes: self.state.registry.connected_ids(),
            routing_table: self.state.routes.snapshot(),
            timestamp: unix_now(),
        };
        self.publish_control(&topics::gossip(), &frame).await
    }

    /// Router nodes rebuild their table and publish it. Other roles do
    /// nothing and return `false`.
    pub async fn routing_update(&self) -> Result<bool> {
        if self.state.config.role != NodeRole::Router {
            return Ok(false);
        }
        let routes = self.state.routes.rebuild(&self.state.registry);
        debug!(node_id = %self.node_id(), routes, "routing table rebuilt");
        let frame = ControlFrame::RoutingUpdate {
            router_id: self.node_id().to_string(),
            routing_table: self.state.routes.snapshot(),
            timestamp: unix_now(),
        };
        self.publish_control(&topics::routing(), &frame).await?;
        Ok(true)
    }

    /// Age the registry and drop routes through evicted nodes.
    pub fn sweep_nodes(&self, now: f64) -> Vec<String> {
        let evicted = self.state.registry.sweep(now);
        for id in &evicted {
            let dropped = self.state.routes.forget_node(id);
            debug!(node_id = %self.node_id(), evicted = %id, routes = dropped, "routes dropped");
        }
        evicted
    }

    pub fn network_topology(&self) -> NetworkTopology {
        let config = &self.state.config;
        let connected = self.state.registry.connected_ids();
        let health = (connected.len() as f64 / HEALTHY_CONNECTION_COUNT as f64).min(1.0);
        NetworkTopology {
            node_id: config.node_id.clone(),
            role: config.role,
            topology: config.topology,
            known_nodes: self.state.registry.nodes(),
            connected,
            routing_table: self.state.routes.snapshot(),
            health,
        }
    }
}

fn hop_topic(hop: &str, message_type: MessageType) -> String {
    if message_type == MessageType::Response {
        topics::responses(hop)
    } else {
        topics::directives(hop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seen_cache_is_bounded_fifo() {
        let mut cache = SeenCache::default();
        assert!(cache.insert("first".into()));
        assert!(!cache.insert("first".into()));
        for i in 0..FORWARD_SEEN_CACHE_SIZE {
            cache.insert(format!("fp-{}", i));
        }
        assert_eq!(cache.order.len(), FORWARD_SEEN_CACHE_SIZE);
        // The oldest entry fell out and is new again.
        assert!(cache.insert("first".into()));
    }

    #[test]
    fn responses_and_everything_else_use_different_topics() {
        assert_eq!(hop_topic("b", MessageType::Response), "lattice/b/responses");
        assert_eq!(hop_topic("b", MessageType::Directive), "lattice/b/directives");
        assert_eq!(hop_topic("b", MessageType::Heartbeat), "lattice/b/directives");
    }
}
