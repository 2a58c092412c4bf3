//! # Canonical Signing
//!
//! Signatures in the lattice are always computed over a *canonical* JSON
//! encoding: object keys sorted lexicographically at every depth, no
//! insignificant whitespace. Two nodes that agree on a value therefore agree
//! on the bytes, no matter how either side built its maps.
//!
//! Both envelope signing ([`crate::message::Message::sign`]) and secure
//! payload signing ([`super::manager::CryptoManager::sign_payload`]) go
//! through this module.

use serde::Serialize;
use serde_json::{Map, Value};

use super::keys::{LatticeKeypair, LatticePublicKey, LatticeSignature};
use crate::error::LatticeError;

/// Canonical JSON bytes of any serializable value.
pub fn canonical_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, LatticeError> {
    let value = serde_json::to_value(value)?;
    Ok(serde_json::to_vec(&canonicalize(value))?)
}

/// Rebuild a JSON value with every object's keys in sorted order.
pub fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (k, v) in entries {
                sorted.insert(k, canonicalize(v));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// Sign the canonical form of `value`, returning the hex signature.
pub fn sign_canonical<T: Serialize + ?Sized>(
    keypair: &LatticeKeypair,
    value: &T,
) -> Result<String, LatticeError> {
    let bytes = canonical_bytes(value)?;
    Ok(keypair.sign(&bytes).to_hex())
}

/// Verify a hex signature over the canonical form of `value`.
///
/// Fails closed: malformed hex, a value that will not serialize, or a
/// mismatched key all yield `false`.
pub fn verify_canonical<T: Serialize + ?Sized>(
    public_key: &LatticePublicKey,
    value: &T,
    signature_hex: &str,
) -> bool {
    let Ok(signature) = LatticeSignature::from_hex(signature_hex) else {
        return false;
    };
    let Ok(bytes) = canonical_bytes(value) else {
        return false;
    };
    public_key.verify(&bytes, &signature)
}
