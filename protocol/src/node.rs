//! # Lattice Node
//!
//! The runtime entity for one lattice participant. [`NodeState`] is the
//! shared aggregate every component reads and mutates: configuration,
//! crypto, pending directives, known nodes, routes and counters. Each map in
//! it carries its own lock, so the inbound path, outbound pump and periodic
//! loops can touch them concurrently.
//!
//! ```text
//! new() -> start() -> [running loops] -> stop()
//! ```
//!
//! `start()` spawns the outbound pump and the periodic loops (heartbeat,
//! discovery, gossip, routing for routers, maintenance). Each loop body is
//! also a public `*_tick()` method, so tests can call [`LatticeNode::start_dispatch`]
//! (pump only) and drive the lattice one step at a time.

use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{unix_now, LatticeConfig, SIGNING_ALGORITHM};
use crate::correlator::Correlator;
use crate::crypto::{CryptoManager, KeyStatus, LatticeKeypair, LatticePublicKey};
use crate::directive::{Directive, Response};
use crate::engine::{DirectiveHandler, EngineStats, ProtocolEngine, StatsSnapshot};
use crate::error::{LatticeError, Result};
use crate::message::Message;
use crate::network::p2p::{NetworkTopology, P2pNetwork};
use crate::network::registry::{NodeRegistry, NodeRole};
use crate::network::routing::RoutingTable;
use crate::network::transport::Transport;

/// Per-node shared state.
#[derive(Debug)]
pub struct NodeState {
    pub config: LatticeConfig,
    pub crypto: Arc<CryptoManager>,
    pub correlator: Correlator,
    pub registry: NodeRegistry,
    pub routes: RoutingTable,
    pub stats: EngineStats,
}

impl NodeState {
    pub fn new(config: LatticeConfig, crypto: Arc<CryptoManager>) -> Arc<Self> {
        let registry = NodeRegistry::new(
            config.max_nodes,
            Duration::from_secs(config.stale_after_seconds),
            Duration::from_secs(config.evict_after_seconds),
        );
        Arc::new(Self {
            config,
            crypto,
            correlator: Correlator::new(),
            registry,
            routes: RoutingTable::new(),
            stats: EngineStats::default(),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }
}

/// What a maintenance pass cleaned up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub evicted_nodes: Vec<String>,
    pub expired_keys: usize,
}

/// Everything the status endpoint reports.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatusReport {
    pub node_id: String,
    pub public_key: String,
    pub running: bool,
    pub uptime_seconds: u64,
    pub pending_directives: usize,
    pub commands: Vec<String>,
    pub network: NetworkTopology,
    pub keys: KeyStatus,
    pub stats: StatsSnapshot,
}

pub struct LatticeNode {
    state: Arc<NodeState>,
    engine: Arc<ProtocolEngine>,
    network: Arc<P2pNetwork>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started_at: Instant,
}

impl LatticeNode {
    /// Build a node with a fresh identity key.
    pub fn new(config: LatticeConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        Self::with_keypair(config, LatticeKeypair::generate(), transport)
    }

    pub fn with_keypair(
        config: LatticeConfig,
        keypair: LatticeKeypair,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;
        if transport.local_id() != config.node_id {
            return Err(LatticeError::Config(format!(
                "transport is attached as {:?} but node is {:?}",
                transport.local_id(),
                config.node_id
            )));
        }
        let crypto = Arc::new(CryptoManager::from_keypair(config.node_id.clone(), keypair));
        let state = NodeState::new(config, crypto);
        let engine = Arc::new(ProtocolEngine::new(state.clone()));
        let network = P2pNetwork::new(state.clone(), engine.clone(), transport);
        let (shutdown, _) = watch::channel(false);
        info!(
            node_id = %state.node_id(),
            role = %state.config.role,
            public_key = %state.crypto.public_key().short(),
            "lattice node created"
        );
        Ok(Self {
            state,
            engine,
            network,
            shutdown,
            tasks: Mutex::new(Vec::new()),
            started_at: Instant::now(),
        })
    }

    pub fn node_id(&self) -> &str {
        self.state.node_id()
    }

    pub fn config(&self) -> &LatticeConfig {
        &self.state.config
    }

    pub fn state(&self) -> &Arc<NodeState> {
        &self.state
    }

    pub fn engine(&self) -> &Arc<ProtocolEngine> {
        &self.engine
    }

    pub fn network(&self) -> &Arc<P2pNetwork> {
        &self.network
    }

    pub fn crypto(&self) -> &Arc<CryptoManager> {
        &self.state.crypto
    }

    pub fn public_key(&self) -> LatticePublicKey {
        self.state.crypto.public_key()
    }

    /// Record `node_id`'s Ed25519 key as trusted.
    pub fn trust(&self, node_id: &str, public_key: LatticePublicKey) -> Result<()> {
        self.state.crypto.trust_node(node_id, public_key, SIGNING_ALGORITHM)
    }

    pub fn register_directive_handler(
        &self,
        command: impl Into<String>,
        handler: impl DirectiveHandler + 'static,
    ) {
        self.engine.register_directive_handler(command, handler);
    }

    pub fn is_running(&self) -> bool {
        !self.tasks.lock().is_empty()
    }

    // ----- Lifecycle -----

    /// Subscribe topics and start the outbound pump only.
    pub async fn start_dispatch(&self) -> Result<()> {
        let outbound = self
            .engine
            .take_outbound_receiver()
            .ok_or_else(|| LatticeError::Config(format!("node {} already started", self.node_id())))?;
        self.network.start().await?;
        let handle = tokio::spawn(pump(
            self.network.clone(),
            self.state.clone(),
            outbound,
            self.shutdown.subscribe(),
        ));
        self.tasks.lock().push(handle);
        Ok(())
    }

    /// Full start: pump plus every periodic loop. Runs one discovery round
    /// immediately.
    pub async fn start(&self) -> Result<()> {
        self.start_dispatch().await?;
        let config = &self.state.config;

        let engine = self.engine.clone();
        self.spawn_loop("heartbeat", config.heartbeat_interval(), move || {
            let engine = engine.clone();
            async move {
                heartbeat(&engine);
            }
        });

        let network = self.network.clone();
        self.spawn_loop("discovery", config.discovery_interval(), move || {
            let network = network.clone();
            async move { discovery(&network).await }
        });

        let network = self.network.clone();
        self.spawn_loop("gossip", config.gossip_interval(), move || {
            let network = network.clone();
            async move { gossip(&network).await }
        });

        if config.role == NodeRole::Router {
            let network = self.network.clone();
            self.spawn_loop("routing", config.routing_interval(), move || {
                let network = network.clone();
                async move {
                    routing(&network).await;
                }
            });
        }

        let network = self.network.clone();
        let state = self.state.clone();
        self.spawn_loop("maintenance", config.maintenance_interval(), move || {
            let network = network.clone();
            let state = state.clone();
            async move {
                maintenance(&network, &state, unix_now());
            }
        });

        discovery(&self.network).await;
        info!(node_id = %self.node_id(), "lattice node started");
        Ok(())
    }

    fn spawn_loop<F, Fut>(&self, name: &'static str, period: Duration, tick: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut shutdown = self.shutdown.subscribe();
        let node_id = self.node_id().to_string();
        let handle = tokio::spawn(async move {
            debug!(node_id = %node_id, task = name, period_ms = period.as_millis() as u64, "loop started");
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(period) => tick().await,
                    _ = shutdown.changed() => break,
                }
            }
            debug!(node_id = %node_id, task = name, "loop stopped");
        });
        self.tasks.lock().push(handle);
    }

    /// Signal every task to stop, wait for them, and leave the transport.
    pub async fn stop(&self) -> Result<()> {
        let _ = self.shutdown.send(true);
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(node_id = %self.node_id(), error = %e, "task ended abnormally");
            }
        }
        self.network.stop().await?;
        info!(node_id = %self.node_id(), "lattice node stopped");
        Ok(())
    }

    // ----- Operations -----

    /// Send a directive and wait for its response, or `None` on timeout.
    pub async fn send_directive(
        &self,
        directive: Directive,
        recipient: &str,
    ) -> Result<Option<Response>> {
        self.engine.send_directive(directive, recipient).await
    }

    /// Like [`send_directive`](Self::send_directive), but a missing response
    /// is an [`Err(LatticeError::Timeout)`](LatticeError::Timeout).
    pub async fn request(&self, directive: Directive, recipient: &str) -> Result<Response> {
        self.engine.request(directive, recipient).await
    }

    /// Sign and queue any message.
    pub fn send_message(&self, message: Message) -> Result<String> {
        self.engine.send_message(message)
    }

    pub fn broadcast_message(&self, message: &Message, exclude: &[&str]) -> Result<usize> {
        self.engine.broadcast_message(message, exclude)
    }

    /// Rotate the identity key. Peers keep the old key until they re-trust.
    pub fn rotate_keys(&self) -> LatticePublicKey {
        let key = self.state.crypto.rotate_keys();
        info!(node_id = %self.node_id(), public_key = %key.short(), "identity key rotated");
        key
    }

    // ----- Ticks -----

    pub fn heartbeat_tick(&self) -> usize {
        heartbeat(&self.engine)
    }

    pub async fn discovery_tick(&self) {
        discovery(&self.network).await
    }

    pub async fn gossip_tick(&self) {
        gossip(&self.network).await
    }

    pub async fn routing_tick(&self) -> bool {
        routing(&self.network).await
    }

    pub fn maintenance_tick(&self) -> MaintenanceReport {
        maintenance(&self.network, &self.state, unix_now())
    }

    pub fn maintenance_tick_at(&self, now: f64) -> MaintenanceReport {
        maintenance(&self.network, &self.state, now)
    }

    pub fn network_topology(&self) -> NetworkTopology {
        self.network.network_topology()
    }

    pub fn status(&self) -> NodeStatusReport {
        NodeStatusReport {
            node_id: self.node_id().to_string(),
            public_key: self.public_key().to_hex(),
            running: self.is_running(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
            pending_directives: self.state.correlator.pending_count(),
            commands: self.engine.commands(),
            network: self.network.network_topology(),
            keys: self.state.crypto.key_status(),
            stats: self.state.stats.snapshot(),
        }
    }
}

impl Drop for LatticeNode {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

async fn pump(
    network: Arc<P2pNetwork>,
    state: Arc<NodeState>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            next = outbound.recv() => {
                let Some(message) = next else { break };
                match network.deliver(message).await {
                    Ok(_) => {}
                    Err(e @ LatticeError::NoRoute(_)) => {
                        state.stats.record_no_route();
                        warn!(node_id = %state.node_id(), error = %e, "message dropped");
                    }
                    Err(e) => warn!(node_id = %state.node_id(), error = %e, "delivery failed"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    debug!(node_id = %state.node_id(), "outbound pump stopped");
}

fn heartbeat(engine: &ProtocolEngine) -> usize {
    match engine.heartbeat() {
        Ok(n) => n,
        Err(e) => {
            warn!(node_id = %engine.node_id(), error = %e, "heartbeat failed");
            0
        }
    }
}

async fn discovery(network: &P2pNetwork) {
    if let Err(e) = network.discover().await {
        warn!(node_id = %network.node_id(), error = %e, "discovery failed");
    }
}

async fn gossip(network: &P2pNetwork) {
    if let Err(e) = network.gossip().await {
        warn!(node_id = %network.node_id(), error = %e, "gossip failed");
    }
}

async fn routing(network: &P2pNetwork) -> bool {
    match network.routing_update().await {
        Ok(ran) => ran,
        Err(e) => {
            warn!(node_id = %network.node_id(), error = %e, "routing update failed");
            false
        }
    }
}

fn maintenance(network: &P2pNetwork, state: &NodeState, now: f64) -> MaintenanceReport {
    let evicted_nodes = network.sweep_nodes(now);
    let expired_keys = state.crypto.cleanup_expired_keys_at(now);
    if !evicted_nodes.is_empty() || expired_keys > 0 {
        info!(
            node_id = %state.node_id(),
            evicted = evicted_nodes.len(),
            expired_keys,
            "maintenance pass"
        );
    }
    MaintenanceReport {
        evicted_nodes,
        expired_keys,
    }
}
