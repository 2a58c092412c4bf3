//! # Network Module
//!
//! P2P layer of the lattice: how nodes find each other, learn routes, and
//! move envelopes hop by hop without a central broker.
//!
//! ## Architecture
//!
//! ```text
//! transport.rs: Transport trait; in-process LocalBus and TCP pub/sub
//! topics.rs: Topic naming convention
//! registry.rs: Known nodes, roles, stale/evict aging
//! routing.rs: Destination → next hop table and route resolution
//! gossip.rs: Unsigned control frames: discovery, gossip, routing updates
//! p2p.rs: Subscriptions, delivery, forwarding, periodic network work
//! ```
//!
//! ## Design Decisions
//!
//! - Control frames are advisory. They shape routing, never trust; every
//!   envelope is still verified by its final recipient.
//! - Gossip-learned routes are weak: they never replace a direct connection
//!   or an existing entry. Router updates do replace learned entries.
//! - Locks are `parking_lot` and never held across an `.await`; transports
//!   clone handler lists before dispatching.

pub mod gossip;
pub mod p2p;
pub mod registry;
pub mod routing;
pub mod topics;
pub mod transport;

pub use gossip::ControlFrame;
pub use p2p::{NetworkTopology, P2pNetwork};
pub use registry::{Capabilities, NetworkNode, NodeRegistry, NodeRole, NodeStatus, Upsert};
pub use routing::{Route, RoutingTable};
pub use transport::{frame_handler, FrameHandler, LocalBus, LocalTransport, TcpTransport, Transport};
