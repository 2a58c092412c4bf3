//! # Protocol Configuration & Constants
//!
//! Every timing knob and wire constant in the lattice lives here, along with
//! [`LatticeConfig`], the construction-time configuration surface of a node.
//!
//! Constants are the defaults. `LatticeConfig` carries the per-node values
//! and is what the runtime actually reads; the node binary fills it from a
//! JSON file and CLI overrides.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::LatticeError;
use crate::network::NodeRole;

// ---------------------------------------------------------------------------
// Protocol Version
// ---------------------------------------------------------------------------

/// Crate-level protocol version, reported by the node binary and `/status`.
pub const PROTOCOL_VERSION: &str = "0.1.0";

/// Root segment of every topic name.
pub const TOPIC_ROOT: &str = "lattice";

// ---------------------------------------------------------------------------
// Cryptographic Parameters
// ---------------------------------------------------------------------------

/// Signature algorithm for envelopes and secure messages.
pub const SIGNING_ALGORITHM: &str = "ed25519";

/// Algorithm label recorded on session keys.
pub const SESSION_ALGORITHM: &str = "x25519-blake3";

/// Ed25519 signature length.
pub const SIGNATURE_LENGTH: usize = 64;

/// AES-256-GCM key length in bytes.
pub const AES_KEY_LENGTH: usize = 32;

/// AES-256-GCM nonce length in bytes.
pub const AES_NONCE_LENGTH: usize = 12;

/// Replay-protection nonce carried by every `SecureMessage`.
pub const SECURE_NONCE_LENGTH: usize = 16;

/// Hex characters kept from the SHA-256 digest when deriving message ids.
pub const MESSAGE_ID_HEX_LENGTH: usize = 16;

/// BLAKE3 derive-key context for session keys. Changing it invalidates every
/// live session in the lattice.
pub const SESSION_KDF_CONTEXT: &str = "lattice-protocol v1 session key";

// ---------------------------------------------------------------------------
// Timing Constants
// ---------------------------------------------------------------------------

/// Default envelope time-to-live, in seconds.
pub const DEFAULT_MESSAGE_TTL_SECS: u64 = 300;

/// Freshness window for `SecureMessage` verification.
pub const FRESHNESS_WINDOW: Duration = Duration::from_secs(300);

/// Lifetime of an ephemeral per-peer session key.
pub const SESSION_KEY_LIFETIME: Duration = Duration::from_secs(3600);

/// Default wait for a directive's response.
pub const DEFAULT_DIRECTIVE_TIMEOUT: Duration = Duration::from_secs(30);

/// Heartbeat broadcast interval.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Gossip publication interval.
pub const GOSSIP_INTERVAL: Duration = Duration::from_secs(60);

/// Discovery request interval.
pub const DISCOVERY_INTERVAL: Duration = Duration::from_secs(30);

/// Routing-table rebuild interval (ROUTER role only).
pub const ROUTING_UPDATE_INTERVAL: Duration = Duration::from_secs(10);

/// Silence after which a known node is marked stale.
pub const NODE_STALE_AFTER: Duration = Duration::from_secs(90);

/// Silence after which a known node is evicted from the registry.
pub const NODE_EVICT_AFTER: Duration = Duration::from_secs(300);

/// How often the maintenance task sweeps the registry and key store.
pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Capacity Limits
// ---------------------------------------------------------------------------

/// Default ceiling on known nodes per registry.
pub const MAX_NODES: usize = 256;

/// Number of connected nodes at which network health reads as 1.0.
pub const HEALTHY_CONNECTION_COUNT: usize = 5;

/// Entries kept by the forwarding seen-cache before eviction kicks in.
pub const FORWARD_SEEN_CACHE_SIZE: usize = 10_000;

/// Replay nonces remembered per node.
pub const REPLAY_CACHE_SIZE: usize = 50_000;

/// Recently resolved directive ids remembered for duplicate classification.
pub const RESOLVED_HISTORY_SIZE: usize = 1024;

/// Largest frame accepted by the TCP transport.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Node Configuration
// ---------------------------------------------------------------------------

/// Network topology. Decides the last-resort routing step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    /// Unknown destinations are flooded through any connected node.
    Mesh,
    /// Unknown destinations go through the configured hub, if connected.
    Star,
}

/// Construction-time configuration of a lattice node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatticeConfig {
    /// Globally unique node identifier.
    pub node_id: String,
    /// Role advertised in discovery responses.
    pub role: NodeRole,
    /// Address other nodes can reach us at (informational for the local bus).
    pub endpoint: String,
    pub topology: Topology,
    /// Hub node for star topology.
    pub hub_node: Option<String>,
    pub max_nodes: usize,
    pub gossip_interval_seconds: u64,
    pub discovery_interval_seconds: u64,
    pub heartbeat_interval_seconds: u64,
    pub routing_interval_seconds: u64,
    pub maintenance_interval_seconds: u64,
    /// Per-directive default wait, used when a directive carries no timeout.
    pub default_timeout_seconds: f64,
    pub stale_after_seconds: u64,
    pub evict_after_seconds: u64,
    /// Reply `refused` to directives with no registered handler instead of
    /// staying silent.
    pub negative_acks: bool,
}

impl Default for LatticeConfig {
    fn default() -> Self {
        Self {
            node_id: "lattice-node".to_string(),
            role: NodeRole::Core,
            endpoint: String::new(),
            topology: Topology::Mesh,
            hub_node: None,
            max_nodes: MAX_NODES,
            gossip_interval_seconds: GOSSIP_INTERVAL.as_secs(),
            discovery_interval_seconds: DISCOVERY_INTERVAL.as_secs(),
            heartbeat_interval_seconds: HEARTBEAT_INTERVAL.as_secs(),
            routing_interval_seconds: ROUTING_UPDATE_INTERVAL.as_secs(),
            maintenance_interval_seconds: MAINTENANCE_INTERVAL.as_secs(),
            default_timeout_seconds: DEFAULT_DIRECTIVE_TIMEOUT.as_secs_f64(),
            stale_after_seconds: NODE_STALE_AFTER.as_secs(),
            evict_after_seconds: NODE_EVICT_AFTER.as_secs(),
            negative_acks: false,
        }
    }
}

impl LatticeConfig {
    /// Default configuration for a named node.
    pub fn for_node(node_id: impl Into<String>, role: NodeRole) -> Self {
        Self {
            node_id: node_id.into(),
            role,
            ..Self::default()
        }
    }

    /// Rejects configurations the runtime cannot honour.
    pub fn validate(&self) -> Result<(), LatticeError> {
        if self.node_id.trim().is_empty() {
            return Err(LatticeError::Config("node_id must not be empty".into()));
        }
        if self.node_id.contains('/') {
            return Err(LatticeError::Config(format!(
                "node_id {:?} must not contain '/' (it is a topic segment)",
                self.node_id
            )));
        }
        if self.max_nodes == 0 {
            return Err(LatticeError::Config("max_nodes must be positive".into()));
        }
        let intervals = [
            ("gossip_interval_seconds", self.gossip_interval_seconds),
            ("discovery_interval_seconds", self.discovery_interval_seconds),
            ("heartbeat_interval_seconds", self.heartbeat_interval_seconds),
            ("routing_interval_seconds", self.routing_interval_seconds),
            ("maintenance_interval_seconds", self.maintenance_interval_seconds),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(LatticeError::Config(format!("{} must be positive", name)));
            }
        }
        if !(self.default_timeout_seconds.is_finite() && self.default_timeout_seconds > 0.0) {
            return Err(LatticeError::Config(
                "default_timeout_seconds must be a positive number".into(),
            ));
        }
        if self.stale_after_seconds >= self.evict_after_seconds {
            return Err(LatticeError::Config(
                "stale_after_seconds must be below evict_after_seconds".into(),
            ));
        }
        if self.topology == Topology::Star && self.hub_node.is_none() {
            return Err(LatticeError::Config("star topology requires hub_node".into()));
        }
        Ok(())
    }

    pub fn gossip_interval(&self) -> Duration {
        Duration::from_secs(self.gossip_interval_seconds)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_seconds)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    pub fn routing_interval(&self) -> Duration {
        Duration::from_secs(self.routing_interval_seconds)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_seconds)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.default_timeout_seconds)
    }
}

/// Current unix time in seconds, with sub-second precision.
pub fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
