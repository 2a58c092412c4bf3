// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Lattice Protocol: Core Library
//!
//! Secure peer-to-peer directive messaging for a lattice of cooperating
//! nodes. A node sends a *directive* (a command with parameters) to another
//! node and gets back at most one *response*, even when the two have no
//! direct link and the message has to hop through the lattice.
//!
//! ## Architecture
//!
//! - **message**: The signed, time-bounded envelope every byte rides in.
//! - **directive**: Directive and Response payloads.
//! - **crypto**: Ed25519 identity, trust store, replay cache, X25519 session
//!   keys, AES-256-GCM sealing.
//! - **correlator**: Pending directives and their single resolution.
//! - **engine**: Verification, handler dispatch, outbound queue, heartbeat.
//! - **network**: Transports, discovery, gossip, routing and forwarding.
//! - **node**: Per-node state and the start/stop lifecycle of its loops.
//! - **config**: Protocol constants and node configuration.
//!
//! ## Design Philosophy
//!
//! 1. Trust is explicit. Nothing a peer says about itself puts its key in
//!    our trust store.
//! 2. Bad input is dropped and logged, never propagated as a crash.
//! 3. No global state: every node owns its maps, each behind its own lock.
//! 4. Every loop can be driven by hand, so every behavior has a test.

pub mod config;
pub mod correlator;
pub mod crypto;
pub mod directive;
pub mod engine;
pub mod error;
pub mod message;
pub mod network;
pub mod node;

pub use config::{LatticeConfig, Topology};
pub use correlator::{Correlator, DirectiveState, PendingDirective};
pub use crypto::{CryptoManager, LatticeKeypair, LatticePublicKey};
pub use directive::{Directive, Response, ResponseStatus};
pub use engine::{
    AcknowledgeHandler, CorrectionHandler, CorrectionModel, DirectiveHandler, Inbound,
    MessageHandler, ProtocolEngine,
};
pub use error::{LatticeError, Result};
pub use message::{Message, MessageType, Payload, Priority};
pub use network::{LocalBus, NodeRole, TcpTransport, Transport};
pub use node::{LatticeNode, NodeState};
