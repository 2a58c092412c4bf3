//! # Cryptography for the Lattice
//!
//! Everything a node needs to prove who it is and to talk privately:
//!
//! - **Ed25519** identity keys and detached signatures ([`keys`]).
//! - Canonical-JSON signing shared by envelopes and secure payloads
//!   ([`signatures`]).
//! - **X25519 + BLAKE3** session establishment and **AES-256-GCM** sealing
//!   ([`session`]).
//! - The per-node [`CryptoManager`] tying keys, trust and replay protection
//!   together ([`manager`]).
//!
//! No primitive here is home-made; each module is a typed wrapper around an
//! audited crate.

pub mod keys;
pub mod manager;
pub mod session;
pub mod signatures;

pub use keys::{KeyError, LatticeKeypair, LatticePublicKey, LatticeSignature};
pub use manager::{
    CryptoManager, KeyRecord, KeyStatus, KeyType, PublicKeyExport, SecureMessage, TrustedKey,
};
pub use session::{SessionError, SessionKey};
pub use signatures::{canonical_bytes, sign_canonical, verify_canonical};
