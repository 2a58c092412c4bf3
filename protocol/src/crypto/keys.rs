//! # Node Keys
//!
//! Ed25519 identity keys for lattice nodes.
//!
//! Each node holds one active master keypair. Its public half is what peers
//! record when they `trust` the node; its private half never leaves the
//! process. Public keys and signatures travel as lowercase hex on the wire.
//!
//! `LatticeKeypair` deliberately does not implement `Serialize`. Exporting
//! secret material is an explicit `secret_key_hex()` call, used by the node
//! binary's `keygen` command and nowhere else.

use ed25519_dalek::{Signature as DalekSignature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::config::SIGNATURE_LENGTH;

/// Errors from parsing key and signature material.
///
/// Kept vague on purpose: nothing about the rejected bytes is echoed back.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid secret key material")]
    InvalidSecretKey,

    #[error("invalid public key material")]
    InvalidPublicKey,

    #[error("invalid signature encoding")]
    InvalidSignature,

    #[error("unsupported signature algorithm: {0}")]
    UnsupportedAlgorithm(String),
}

/// A node's Ed25519 signing keypair.
pub struct LatticeKeypair {
    signing_key: SigningKey,
}

/// The shareable half of a node identity.
///
/// Only constructed from bytes that decode to a valid Ed25519 point, so
/// verification never has to deal with a malformed key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LatticePublicKey {
    bytes: [u8; 32],
}

/// A detached Ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct LatticeSignature {
    bytes: [u8; SIGNATURE_LENGTH],
}

impl LatticeKeypair {
    /// Fresh keypair from the OS RNG.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Deterministic keypair from a 32-byte seed. Tests and fixtures only;
    /// production nodes should call [`generate`](Self::generate).
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Load a keypair from a hex-encoded 32-byte secret.
    pub fn from_secret_hex(hex_str: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_str.trim()).map_err(|_| KeyError::InvalidSecretKey)?;
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::InvalidSecretKey)?;
        Ok(Self::from_seed(&seed))
    }

    /// Hex-encoded secret. Handle with care: whoever holds this *is* the node.
    pub fn secret_key_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    pub fn public_key(&self) -> LatticePublicKey {
        LatticePublicKey {
            bytes: self.signing_key.verifying_key().to_bytes(),
        }
    }

    pub fn sign(&self, message: &[u8]) -> LatticeSignature {
        LatticeSignature {
            bytes: self.signing_key.sign(message).to_bytes(),
        }
    }

    pub fn verify(&self, message: &[u8], signature: &LatticeSignature) -> bool {
        self.public_key().verify(message, signature)
    }
}

impl Clone for LatticeKeypair {
    fn clone(&self) -> Self {
        Self::from_seed(&self.signing_key.to_bytes())
    }
}

impl fmt::Debug for LatticeKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Public half only.
        write!(f, "LatticeKeypair(pub={})", self.public_key().short())
    }
}

// ---------------------------------------------------------------------------
// LatticePublicKey
// ---------------------------------------------------------------------------

impl LatticePublicKey {
    /// Parse raw bytes, rejecting anything that is not a valid Ed25519 point.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| KeyError::InvalidPublicKey)?;
        VerifyingKey::from_bytes(&arr).map_err(|_| KeyError::InvalidPublicKey)?;
        Ok(Self { bytes: arr })
    }

    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(s.trim()).map_err(|_| KeyError::InvalidPublicKey)?;
        Self::from_bytes(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    /// First 8 bytes in hex, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.bytes[..8])
    }

    /// Verify a signature. Returns `false` on any failure, never panics.
    pub fn verify(&self, message: &[u8], signature: &LatticeSignature) -> bool {
        let Ok(verifying_key) = VerifyingKey::from_bytes(&self.bytes) else {
            return false;
        };
        let sig = DalekSignature::from_bytes(&signature.bytes);
        verifying_key.verify_strict(message, &sig).is_ok()
    }
}

impl TryFrom<String> for LatticePublicKey {
    type Error = KeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value)
    }
}

impl From<LatticePublicKey> for String {
    fn from(key: LatticePublicKey) -> Self {
        key.to_hex()
    }
}

impl fmt::Display for LatticePublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for LatticePublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LatticePublicKey({})", self.short())
    }
}

// ---------------------------------------------------------------------------
// LatticeSignature
// ---------------------------------------------------------------------------

impl LatticeSignature {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let arr: [u8; SIGNATURE_LENGTH] =
            bytes.try_into().map_err(|_| KeyError::InvalidSignature)?;
        Ok(Self { bytes: arr })
    }

    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(s).map_err(|_| KeyError::InvalidSignature)?;
        Self::from_bytes(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SIGNATURE_LENGTH] {
        &self.bytes
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }
}

impl fmt::Debug for LatticeSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex_str = self.to_hex();
        write!(f, "LatticeSignature({}..{})", &hex_str[..8], &hex_str[120..])
    }
}
