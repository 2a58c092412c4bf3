//! # Message Envelope
//!
//! The signed, typed, time-bounded container for every byte that moves
//! between lattice nodes.
//!
//! ## Wire shape
//!
//! ```text
//! {
//!   "message_id":   "9f2c4e...",        16 hex chars
//!   "sender_id":    "core-01",
//!   "recipient_id": "wealth-01" | null,
//!   "message_type": "directive",        snake_case
//!   "priority":     3,                  1 (critical) .. 4 (low)
//!   "ttl":          300,                seconds
//!   "timestamp":    1735689600.25,      unix seconds
//!   "payload":      { ... },
//!   "signature":    "hex" | null,
//!   "public_key":   "hex" | null
//! }
//! ```
//!
//! `message_id` is the first 16 hex characters of
//! `SHA-256(sender_id || timestamp || message_type)`. Two messages from the
//! same sender, of the same type, at the same timestamp share an id. That is
//! accepted; ids are for correlation and logging, not deduplication.
//!
//! ## Signing
//!
//! The signature covers the canonical JSON of every field except `signature`
//! itself, including `public_key`. Any mutation of a covered field makes
//! [`Message::verify_signature`] return `false`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::config::{unix_now, DEFAULT_MESSAGE_TTL_SECS, MESSAGE_ID_HEX_LENGTH};
use crate::crypto::keys::{LatticeKeypair, LatticePublicKey};
use crate::crypto::signatures::{sign_canonical, verify_canonical};
use crate::error::{LatticeError, Result};

/// Opaque key/value body of a message.
pub type Payload = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Directive,
    Response,
    StateSync,
    Heartbeat,
    Discovery,
    RoutingUpdate,
    Error,
    CryptoSigned,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Directive => "directive",
            MessageType::Response => "response",
            MessageType::StateSync => "state_sync",
            MessageType::Heartbeat => "heartbeat",
            MessageType::Discovery => "discovery",
            MessageType::RoutingUpdate => "routing_update",
            MessageType::Error => "error",
            MessageType::CryptoSigned => "crypto_signed",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery priority. Serialized as its integer level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Priority {
    Critical = 1,
    High = 2,
    Normal = 3,
    Low = 4,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl TryFrom<u8> for Priority {
    type Error = String;

    fn try_from(level: u8) -> std::result::Result<Self, Self::Error> {
        match level {
            1 => Ok(Priority::Critical),
            2 => Ok(Priority::High),
            3 => Ok(Priority::Normal),
            4 => Ok(Priority::Low),
            other => Err(format!("priority must be 1..=4, got {}", other)),
        }
    }
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> u8 {
        p as u8
    }
}

/// A lattice message envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub sender_id: String,
    #[serde(default)]
    pub recipient_id: Option<String>,
    pub message_type: MessageType,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default = "default_ttl")]
    pub ttl: u64,
    pub timestamp: f64,
    #[serde(default)]
    pub payload: Payload,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub public_key: Option<String>,
}

fn default_ttl() -> u64 {
    DEFAULT_MESSAGE_TTL_SECS
}

/// Derive a message id from its identifying fields.
pub fn derive_message_id(sender_id: &str, timestamp: f64, message_type: MessageType) -> String {
    let digest = Sha256::digest(format!("{}{}{}", sender_id, timestamp, message_type.as_str()));
    hex::encode(digest)[..MESSAGE_ID_HEX_LENGTH].to_string()
}

impl Message {
    /// New unsigned message stamped with the current time.
    pub fn new(message_type: MessageType, sender_id: impl Into<String>, payload: Payload) -> Self {
        Self::new_at(message_type, sender_id, payload, unix_now())
    }

    /// New unsigned message with an explicit timestamp.
    pub fn new_at(
        message_type: MessageType,
        sender_id: impl Into<String>,
        payload: Payload,
        timestamp: f64,
    ) -> Self {
        let sender_id = sender_id.into();
        Self {
            message_id: derive_message_id(&sender_id, timestamp, message_type),
            sender_id,
            recipient_id: None,
            message_type,
            priority: Priority::Normal,
            ttl: DEFAULT_MESSAGE_TTL_SECS,
            timestamp,
            payload,
            signature: None,
            public_key: None,
        }
    }

    pub fn with_recipient(mut self, recipient_id: impl Into<String>) -> Self {
        self.recipient_id = Some(recipient_id.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_ttl(mut self, ttl: u64) -> Self {
        self.ttl = ttl;
        self
    }

    /// Canonical JSON of every field except `signature`.
    pub fn signing_view(&self) -> Result<Value> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut value {
            map.remove("signature");
        }
        Ok(value)
    }

    /// Stamp our public key and sign the envelope.
    pub fn sign(&mut self, keypair: &LatticeKeypair) -> Result<()> {
        self.public_key = Some(keypair.public_key().to_hex());
        let view = self.signing_view()?;
        self.signature = Some(sign_canonical(keypair, &view)?);
        Ok(())
    }

    /// Check the signature against the sender's trusted key.
    ///
    /// Never panics and never errors: a missing or malformed signature, a
    /// wrong key, or any mutation of a signed field yields `false`.
    pub fn verify_signature(&self, trusted_key: &LatticePublicKey) -> bool {
        let Some(signature) = self.signature.as_deref() else {
            return false;
        };
        match self.signing_view() {
            Ok(view) => verify_canonical(trusted_key, &view, signature),
            Err(_) => false,
        }
    }

    /// `now − timestamp > ttl`.
    pub fn is_expired_at(&self, now: f64) -> bool {
        now - self.timestamp > self.ttl as f64
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(unix_now())
    }

    pub fn age_at(&self, now: f64) -> f64 {
        now - self.timestamp
    }

    /// Same content under a fresh timestamp and id, unsigned.
    ///
    /// The new timestamp is strictly later than the original so the id
    /// always changes.
    pub fn resend(&self) -> Message {
        let timestamp = unix_now().max(self.timestamp + 1e-6);
        Message {
            message_id: derive_message_id(&self.sender_id, timestamp, self.message_type),
            timestamp,
            signature: None,
            public_key: None,
            ..self.clone()
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(LatticeError::from)
    }

    /// Fingerprint of the signed bytes, for forwarding dedup.
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.message_id.as_bytes());
        hasher.update(self.signature.as_deref().unwrap_or("").as_bytes());
        hex::encode(&hasher.finalize().as_bytes()[..16])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(v: Value) -> Payload {
        match v {
            Value::Object(m) => m,
            _ => Payload::new(),
        }
    }

    fn signed(kp: &LatticeKeypair) -> Message {
        let mut msg = Message::new(
            MessageType::Directive,
            "core-01",
            payload(json!({"directive": {"command": "rebalance", "parameters": {"ratio": 0.6}}})),
        )
        .with_recipient("wealth-01")
        .with_priority(Priority::High);
        msg.sign(kp).unwrap();
        msg
    }

    #[test]
    fn message_id_is_truncated_sha256() {
        let id = derive_message_id("core-01", 1700000000.5, MessageType::Heartbeat);
        let full = hex::encode(Sha256::digest("core-011700000000.5heartbeat"));
        assert_eq!(id, full[..16]);
    }

    #[test]
    fn identical_content_collides() {
        let a = Message::new_at(MessageType::Heartbeat, "n", Payload::new(), 10.0);
        let b = Message::new_at(MessageType::Heartbeat, "n", Payload::new(), 10.0);
        assert_eq!(a.message_id, b.message_id);
    }

    #[test]
    fn sign_then_verify() {
        let kp = LatticeKeypair::generate();
        let msg = signed(&kp);
        assert_eq!(msg.public_key.as_deref(), Some(kp.public_key().to_hex().as_str()));
        assert!(msg.verify_signature(&kp.public_key()));
    }

    #[test]
    fn unsigned_or_garbled_signature_fails_closed() {
        let kp = LatticeKeypair::generate();
        let mut msg = Message::new(MessageType::Heartbeat, "core-01", Payload::new());
        assert!(!msg.verify_signature(&kp.public_key()));
        msg.signature = Some("zz-not-hex".into());
        assert!(!msg.verify_signature(&kp.public_key()));
        msg.signature = Some("abcd".into());
        assert!(!msg.verify_signature(&kp.public_key()));
    }

    #[test]
    fn any_field_mutation_breaks_signature() {
        let kp = LatticeKeypair::generate();
        let original = signed(&kp);

        let mutations: Vec<Box<dyn Fn(&mut Message)>> = vec![
            Box::new(|m| m.message_id.push('0')),
            Box::new(|m| m.sender_id = "core-02".into()),
            Box::new(|m| m.recipient_id = Some("wealth-02".into())),
            Box::new(|m| m.recipient_id = None),
            Box::new(|m| m.message_type = MessageType::Response),
            Box::new(|m| m.priority = Priority::Low),
            Box::new(|m| m.ttl += 1),
            Box::new(|m| m.timestamp += 0.001),
            Box::new(|m| {
                m.payload.insert("extra".into(), json!(true));
            }),
            Box::new(|m| m.public_key = Some(LatticeKeypair::generate().public_key().to_hex())),
        ];

        for (i, mutate) in mutations.iter().enumerate() {
            let mut msg = original.clone();
            mutate(&mut msg);
            assert!(!msg.verify_signature(&kp.public_key()), "mutation {} verified", i);
        }
    }

    #[test]
    fn single_bit_flip_in_signature_fails() {
        let kp = LatticeKeypair::generate();
        let mut msg = signed(&kp);
        let mut sig = hex::decode(msg.signature.as_ref().unwrap()).unwrap();
        sig[10] ^= 0x01;
        msg.signature = Some(hex::encode(sig));
        assert!(!msg.verify_signature(&kp.public_key()));
    }

    #[test]
    fn wrong_key_fails() {
        let kp = LatticeKeypair::generate();
        let msg = signed(&kp);
        assert!(!msg.verify_signature(&LatticeKeypair::generate().public_key()));
    }

    #[test]
    fn expiry_is_strictly_after_ttl() {
        let msg = Message::new_at(MessageType::Heartbeat, "n", Payload::new(), 1000.0).with_ttl(300);
        assert!(!msg.is_expired_at(1300.0));
        assert!(msg.is_expired_at(1300.5));
    }

    #[test]
    fn wire_roundtrip_preserves_signature() {
        let kp = LatticeKeypair::generate();
        let msg = signed(&kp);
        let back = Message::from_json(&msg.to_json().unwrap()).unwrap();
        assert_eq!(back, msg);
        assert!(back.verify_signature(&kp.public_key()));
    }

    #[test]
    fn wire_format_uses_snake_case_and_integer_priority() {
        let msg = Message::new_at(MessageType::RoutingUpdate, "r", Payload::new(), 5.0)
            .with_priority(Priority::Critical);
        let v: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(v["message_type"], "routing_update");
        assert_eq!(v["priority"], 1);
        assert_eq!(v["ttl"], 300);
    }

    #[test]
    fn invalid_priority_rejected() {
        let json = r#"{"message_id":"x","sender_id":"a","message_type":"heartbeat","priority":9,"timestamp":1.0}"#;
        assert!(Message::from_json(json).is_err());
    }

    #[test]
    fn resend_changes_only_identity() {
        let kp = LatticeKeypair::generate();
        let msg = signed(&kp);
        let copy = msg.resend();
        assert_ne!(copy.message_id, msg.message_id);
        assert!(copy.timestamp > msg.timestamp);
        assert_eq!(copy.payload, msg.payload);
        assert_eq!(copy.recipient_id, msg.recipient_id);
        assert_eq!(copy.priority, msg.priority);
        assert!(copy.signature.is_none());
    }

    #[test]
    fn fingerprint_tracks_signature() {
        let kp = LatticeKeypair::generate();
        let a = signed(&kp);
        let mut b = a.clone();
        assert_eq!(a.fingerprint(), b.fingerprint());
        b.sign(&LatticeKeypair::generate()).unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
