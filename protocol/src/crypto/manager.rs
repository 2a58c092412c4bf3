//! # Cryptographic Manager
//!
//! Per-node owner of every piece of key material:
//!
//! - the active **master** Ed25519 keypair (plus retired masters until
//!   cleanup), used to sign envelopes and secure payloads;
//! - **session** keys, one per peer, established through an authenticated
//!   X25519 exchange and expiring after an hour;
//! - the **trusted-peer store**, populated only by explicit [`trust_node`]
//!   calls. Nothing a peer says over the network adds to it.
//!
//! Verification of a [`SecureMessage`] runs in a fixed order and stops at the
//! first failure: untrusted sender, expired trust record, bad signature,
//! stale timestamp, replayed nonce.
//!
//! Expired material is only removed by [`cleanup_expired_keys`], which the
//! node's maintenance task calls on an interval.
//!
//! [`trust_node`]: CryptoManager::trust_node
//! [`cleanup_expired_keys`]: CryptoManager::cleanup_expired_keys

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::keys::{KeyError, LatticeKeypair, LatticePublicKey};
use super::session::{EphemeralExchange, SessionError, SessionKey};
use super::signatures::{sign_canonical, verify_canonical};
use crate::config::{
    unix_now, FRESHNESS_WINDOW, MESSAGE_ID_HEX_LENGTH, REPLAY_CACHE_SIZE, SECURE_NONCE_LENGTH,
    SESSION_ALGORITHM, SESSION_KEY_LIFETIME, SIGNING_ALGORITHM,
};
use crate::error::{LatticeError, Result};
use crate::message::Message;

// ---------------------------------------------------------------------------
// Key records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    Signing,
    Encryption,
    Session,
    Master,
}

/// Private half of a key record. Never serialized.
#[derive(Debug, Clone)]
enum KeySecret {
    Signing(LatticeKeypair),
    Session(SessionKey),
}

/// A key held by this node.
#[derive(Debug, Clone, Serialize)]
pub struct KeyRecord {
    pub key_id: String,
    pub key_type: KeyType,
    pub algorithm: String,
    /// Hex public key for signing keys, key fingerprint for session keys.
    pub public_material: String,
    pub created_at: f64,
    pub expires_at: Option<f64>,
    pub metadata: Map<String, Value>,
    #[serde(skip)]
    secret: Option<KeySecret>,
}

impl KeyRecord {
    pub fn is_expired_at(&self, now: f64) -> bool {
        matches!(self.expires_at, Some(exp) if now >= exp)
    }
}

/// A peer's public key, recorded by an explicit trust call.
#[derive(Debug, Clone, Serialize)]
pub struct TrustedKey {
    pub node_id: String,
    pub public_key: LatticePublicKey,
    pub algorithm: String,
    pub trusted_at: f64,
    pub expires_at: Option<f64>,
}

impl TrustedKey {
    pub fn is_expired_at(&self, now: f64) -> bool {
        matches!(self.expires_at, Some(exp) if now >= exp)
    }
}

// ---------------------------------------------------------------------------
// Secure message
// ---------------------------------------------------------------------------

/// A signed payload with replay protection, independent of the envelope.
///
/// Used for session handshakes and anything else that must be verifiable on
/// its own, outside a [`Message`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecureMessage {
    pub message_id: String,
    pub sender_id: String,
    pub recipient_id: Option<String>,
    pub timestamp: f64,
    pub message_type: String,
    pub payload: Value,
    /// 16 random bytes, hex.
    pub nonce: String,
    pub session_key_id: Option<String>,
    pub algorithm: String,
    pub signature: String,
}

/// Everything in a `SecureMessage` that the signature covers.
#[derive(Serialize)]
struct SignedBody<'a> {
    message_id: &'a str,
    sender_id: &'a str,
    recipient_id: Option<&'a str>,
    timestamp: f64,
    message_type: &'a str,
    payload: &'a Value,
    nonce: &'a str,
    session_key_id: Option<&'a str>,
    algorithm: &'a str,
}

impl SecureMessage {
    fn body(&self) -> SignedBody<'_> {
        SignedBody {
            message_id: &self.message_id,
            sender_id: &self.sender_id,
            recipient_id: self.recipient_id.as_deref(),
            timestamp: self.timestamp,
            message_type: &self.message_type,
            payload: &self.payload,
            nonce: &self.nonce,
            session_key_id: self.session_key_id.as_deref(),
            algorithm: &self.algorithm,
        }
    }
}

// ---------------------------------------------------------------------------
// Status / export views
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct KeySummary {
    pub key_type: KeyType,
    pub algorithm: String,
    pub created_at: f64,
    pub expires_at: Option<f64>,
    pub is_expired: bool,
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct KeyStatus {
    pub node_id: String,
    pub active_master: String,
    pub total_keys: usize,
    pub trusted_nodes: usize,
    pub active_sessions: usize,
    pub keys: BTreeMap<String, KeySummary>,
    pub trusted_node_list: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublicKeyExport {
    pub node_id: String,
    pub exported_at: f64,
    pub keys: BTreeMap<String, KeyRecord>,
}

// ---------------------------------------------------------------------------
// Replay cache
// ---------------------------------------------------------------------------

/// Seen `(sender, nonce)` pairs, bounded in both size and age.
#[derive(Debug, Default)]
struct ReplayCache {
    seen: HashSet<(String, String)>,
    order: VecDeque<(f64, String, String)>,
}

impl ReplayCache {
    /// Returns `false` if the pair was already present.
    fn insert(&mut self, sender: &str, nonce: &str, now: f64) -> bool {
        self.prune(now);
        let key = (sender.to_string(), nonce.to_string());
        if self.seen.contains(&key) {
            return false;
        }
        self.seen.insert(key);
        self.order.push_back((now, sender.to_string(), nonce.to_string()));
        while self.order.len() > REPLAY_CACHE_SIZE {
            if let Some((_, s, n)) = self.order.pop_front() {
                self.seen.remove(&(s, n));
            }
        }
        true
    }

    fn prune(&mut self, now: f64) {
        let window = FRESHNESS_WINDOW.as_secs_f64();
        while let Some((seen_at, _, _)) = self.order.front() {
            if now - seen_at <= window {
                break;
            }
            if let Some((_, s, n)) = self.order.pop_front() {
                self.seen.remove(&(s, n));
            }
        }
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct KeyStore {
    active_master: String,
    active_public: LatticePublicKey,
    generation: u32,
    master_lifetime: Option<f64>,
    records: BTreeMap<String, KeyRecord>,
    /// peer node id -> session key id
    sessions: HashMap<String, String>,
}

/// Owns this node's keys, trust store, and replay cache.
#[derive(Debug)]
pub struct CryptoManager {
    node_id: String,
    store: RwLock<KeyStore>,
    trusted: DashMap<String, TrustedKey>,
    replay: Mutex<ReplayCache>,
    pending_offers: Mutex<HashMap<String, EphemeralExchange>>,
}

const SESSION_OFFER: &str = "session_offer";
const SESSION_ACCEPT: &str = "session_accept";

impl CryptoManager {
    /// New manager with a freshly generated master key.
    pub fn new(node_id: impl Into<String>) -> Self {
        Self::from_keypair(node_id, LatticeKeypair::generate())
    }

    /// New manager around supplied master key material.
    pub fn from_keypair(node_id: impl Into<String>, keypair: LatticeKeypair) -> Self {
        let node_id = node_id.into();
        let mut store = KeyStore {
            active_master: String::new(),
            active_public: keypair.public_key(),
            generation: 0,
            master_lifetime: None,
            records: BTreeMap::new(),
            sessions: HashMap::new(),
        };
        install_master(&node_id, &mut store, keypair, unix_now());
        info!(node = %node_id, key = %store.active_master, "cryptographic manager initialised");

        Self {
            node_id,
            store: RwLock::new(store),
            trusted: DashMap::new(),
            replay: Mutex::new(ReplayCache::default()),
            pending_offers: Mutex::new(HashMap::new()),
        }
    }

    /// Give master keys (current and future) a finite lifetime.
    pub fn with_master_lifetime(self, lifetime_secs: f64) -> Self {
        {
            let mut store = self.store.write();
            store.master_lifetime = Some(lifetime_secs);
            let active = store.active_master.clone();
            if let Some(record) = store.records.get_mut(&active) {
                record.expires_at = Some(record.created_at + lifetime_secs);
            }
        }
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Public key of the active master.
    pub fn public_key(&self) -> LatticePublicKey {
        self.store.read().active_public
    }

    pub fn active_key_id(&self) -> String {
        self.store.read().active_master.clone()
    }

    /// Clone of the active master keypair if it has not expired.
    fn signing_keypair(&self, now: f64) -> Result<LatticeKeypair> {
        let store = self.store.read();
        let record = store
            .records
            .get(&store.active_master)
            .ok_or_else(|| LatticeError::KeyNotFound(store.active_master.clone()))?;
        if record.is_expired_at(now) {
            return Err(LatticeError::ExpiredKey(record.key_id.clone()));
        }
        match &record.secret {
            Some(KeySecret::Signing(kp)) => Ok(kp.clone()),
            _ => Err(LatticeError::KeyNotFound(record.key_id.clone())),
        }
    }

    // ----- Trust store -----

    /// Record a peer's public key. Replaces any previous record for the peer.
    pub fn trust_node(
        &self,
        node_id: &str,
        public_key: LatticePublicKey,
        algorithm: &str,
    ) -> Result<()> {
        self.trust_node_until(node_id, public_key, algorithm, None)
    }

    /// Like [`trust_node`](Self::trust_node) with an expiry on the record.
    pub fn trust_node_until(
        &self,
        node_id: &str,
        public_key: LatticePublicKey,
        algorithm: &str,
        expires_at: Option<f64>,
    ) -> Result<()> {
        if !algorithm.eq_ignore_ascii_case(SIGNING_ALGORITHM) {
            return Err(KeyError::UnsupportedAlgorithm(algorithm.to_string()).into());
        }
        self.trusted.insert(
            node_id.to_string(),
            TrustedKey {
                node_id: node_id.to_string(),
                public_key,
                algorithm: SIGNING_ALGORITHM.to_string(),
                trusted_at: unix_now(),
                expires_at,
            },
        );
        info!(node = %self.node_id, peer = node_id, key = %public_key.short(), "trusted node");
        Ok(())
    }

    pub fn get_trusted_key(&self, node_id: &str) -> Option<TrustedKey> {
        self.trusted.get(node_id).map(|entry| entry.value().clone())
    }

    /// Forget a peer's key. Returns whether a record existed.
    pub fn revoke_trust(&self, node_id: &str) -> bool {
        let removed = self.trusted.remove(node_id).is_some();
        if removed {
            info!(node = %self.node_id, peer = node_id, "revoked trust");
        }
        removed
    }

    pub fn trusted_nodes(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.trusted.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Key that messages from `sender` must verify against.
    ///
    /// Our own id resolves to the active master; everyone else must be in
    /// the trust store with an unexpired record.
    fn verification_key(&self, sender: &str, now: f64) -> Result<LatticePublicKey> {
        if sender == self.node_id {
            return Ok(self.public_key());
        }
        let trusted = self
            .get_trusted_key(sender)
            .ok_or_else(|| LatticeError::UntrustedSender(sender.to_string()))?;
        if trusted.is_expired_at(now) {
            return Err(LatticeError::ExpiredKey(format!("trusted_{}", sender)));
        }
        Ok(trusted.public_key)
    }

    // ----- Envelope signing -----

    /// Sign an envelope with the active master key.
    pub fn sign_message(&self, message: &mut Message) -> Result<()> {
        let keypair = self.signing_keypair(unix_now())?;
        message.sign(&keypair)
    }

    /// Check an envelope's signature against the sender's trusted key.
    ///
    /// Only authenticity is checked here; TTL is the engine's concern.
    pub fn verify_message(&self, message: &Message) -> Result<()> {
        let key = self.verification_key(&message.sender_id, unix_now())?;
        if message.verify_signature(&key) {
            Ok(())
        } else {
            Err(LatticeError::InvalidSignature {
                sender: message.sender_id.clone(),
            })
        }
    }

    // ----- Secure messages -----

    /// Sign an arbitrary payload into a [`SecureMessage`].
    pub fn sign_payload(
        &self,
        payload: Value,
        recipient: Option<&str>,
        message_type: &str,
    ) -> Result<SecureMessage> {
        let now = unix_now();
        let keypair = self.signing_keypair(now)?;

        let mut nonce = [0u8; SECURE_NONCE_LENGTH];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let mut salt = [0u8; 8];
        rand::rngs::OsRng.fill_bytes(&mut salt);

        let digest = Sha256::digest(format!("{}{}{}", self.node_id, now, hex::encode(salt)));
        let message_id = hex::encode(digest)[..MESSAGE_ID_HEX_LENGTH].to_string();

        let session_key_id = recipient
            .and_then(|peer| self.live_session_at(peer, now).ok())
            .map(|(key_id, _)| key_id);

        let mut msg = SecureMessage {
            message_id,
            sender_id: self.node_id.clone(),
            recipient_id: recipient.map(str::to_string),
            timestamp: now,
            message_type: message_type.to_string(),
            payload,
            nonce: hex::encode(nonce),
            session_key_id,
            algorithm: SIGNING_ALGORITHM.to_string(),
            signature: String::new(),
        };
        msg.signature = sign_canonical(&keypair, &msg.body())?;
        Ok(msg)
    }

    /// Verify a secure message and return its payload.
    pub fn verify_secure_message(&self, msg: &SecureMessage) -> Result<Value> {
        self.verify_secure_message_at(msg, unix_now())
    }

    /// Verification against an explicit clock.
    pub fn verify_secure_message_at(&self, msg: &SecureMessage, now: f64) -> Result<Value> {
        let key = self.verification_key(&msg.sender_id, now).map_err(|err| {
            warn!(node = %self.node_id, sender = %msg.sender_id, error = %err, "secure message rejected");
            err
        })?;

        if !verify_canonical(&key, &msg.body(), &msg.signature) {
            warn!(node = %self.node_id, sender = %msg.sender_id, "invalid secure message signature");
            return Err(LatticeError::InvalidSignature {
                sender: msg.sender_id.clone(),
            });
        }

        let age = now - msg.timestamp;
        if age > FRESHNESS_WINDOW.as_secs_f64() {
            warn!(node = %self.node_id, id = %msg.message_id, age, "secure message too old");
            return Err(LatticeError::StaleMessage {
                age_secs: age,
                limit_secs: FRESHNESS_WINDOW.as_secs(),
            });
        }

        if !self.replay.lock().insert(&msg.sender_id, &msg.nonce, now) {
            warn!(node = %self.node_id, sender = %msg.sender_id, nonce = %msg.nonce, "replayed secure message");
            return Err(LatticeError::ReplayedMessage {
                sender: msg.sender_id.clone(),
                nonce: msg.nonce.clone(),
            });
        }

        Ok(msg.payload.clone())
    }

    // ----- Session establishment -----

    /// Start a session with `peer`. Send the returned message to the peer.
    pub fn offer_session(&self, peer: &str) -> Result<SecureMessage> {
        let exchange = EphemeralExchange::new();
        let payload = json!({
            "initiator": self.node_id,
            "responder": peer,
            "ephemeral_public": hex::encode(exchange.public_bytes()),
        });
        let offer = self.sign_payload(payload, Some(peer), SESSION_OFFER)?;
        self.pending_offers.lock().insert(peer.to_string(), exchange);
        debug!(node = %self.node_id, peer, "session offer created");
        Ok(offer)
    }

    /// Answer a peer's offer, installing the session key on our side.
    pub fn accept_session(&self, offer: &SecureMessage) -> Result<SecureMessage> {
        let payload = self.verify_secure_message(offer)?;
        let peer_public = parse_handshake(&payload, SESSION_OFFER, &offer.message_type)?;
        if payload.get("responder").and_then(Value::as_str) != Some(self.node_id.as_str()) {
            return Err(SessionError::MalformedHandshake("offer addressed elsewhere".into()).into());
        }
        let peer = offer.sender_id.clone();

        let mut exchange = EphemeralExchange::new();
        let our_public = exchange.public_bytes();
        let key = exchange.complete(&peer_public, &self.node_id, &peer)?;
        let key_id = self.install_session(&peer, key);

        let reply = json!({
            "initiator": peer,
            "responder": self.node_id,
            "ephemeral_public": hex::encode(our_public),
            "session_key_id": key_id,
        });
        self.sign_payload(reply, Some(&peer), SESSION_ACCEPT)
    }

    /// Finish a session we offered. Returns the new session key id.
    pub fn complete_session(&self, accept: &SecureMessage) -> Result<String> {
        let payload = self.verify_secure_message(accept)?;
        let peer_public = parse_handshake(&payload, SESSION_ACCEPT, &accept.message_type)?;
        let peer = accept.sender_id.clone();

        let mut exchange = self
            .pending_offers
            .lock()
            .remove(&peer)
            .ok_or_else(|| SessionError::NoPendingOffer(peer.clone()))?;
        let key = exchange.complete(&peer_public, &self.node_id, &peer)?;
        Ok(self.install_session(&peer, key))
    }

    fn install_session(&self, peer: &str, key: [u8; 32]) -> String {
        let now = unix_now();
        let session = SessionKey::new(
            key,
            &self.node_id,
            peer,
            now,
            SESSION_KEY_LIFETIME.as_secs_f64(),
        );
        let key_id = format!(
            "session_{}_{}_{}",
            self.node_id,
            peer,
            &Uuid::new_v4().simple().to_string()[..8]
        );
        let mut metadata = Map::new();
        metadata.insert("peer_node_id".into(), Value::String(peer.to_string()));

        let record = KeyRecord {
            key_id: key_id.clone(),
            key_type: KeyType::Session,
            algorithm: SESSION_ALGORITHM.to_string(),
            public_material: session.fingerprint(),
            created_at: now,
            expires_at: Some(session.expires_at),
            metadata,
            secret: Some(KeySecret::Session(session)),
        };

        let mut store = self.store.write();
        if let Some(old) = store.sessions.insert(peer.to_string(), key_id.clone()) {
            if let Some(old_record) = store.records.get_mut(&old) {
                old_record.expires_at = Some(now);
            }
        }
        store.records.insert(key_id.clone(), record);
        info!(node = %self.node_id, peer, key = %key_id, "session established");
        key_id
    }

    /// Session key shared with `peer`, or `None` if absent or expired.
    pub fn session_key(&self, peer: &str) -> Option<SessionKey> {
        self.session_key_at(peer, unix_now()).ok()
    }

    fn session_key_at(&self, peer: &str, now: f64) -> std::result::Result<SessionKey, SessionError> {
        self.live_session_at(peer, now).map(|(_, session)| session)
    }

    /// Id and key of the unexpired session with `peer`.
    fn live_session_at(
        &self,
        peer: &str,
        now: f64,
    ) -> std::result::Result<(String, SessionKey), SessionError> {
        let store = self.store.read();
        let key_id = store
            .sessions
            .get(peer)
            .ok_or_else(|| SessionError::NoSession(peer.to_string()))?;
        let record = store
            .records
            .get(key_id)
            .ok_or_else(|| SessionError::NoSession(peer.to_string()))?;
        if record.is_expired_at(now) {
            return Err(SessionError::Expired(peer.to_string()));
        }
        match &record.secret {
            Some(KeySecret::Session(session)) if !session.is_expired_at(now) => {
                Ok((key_id.clone(), session.clone()))
            }
            Some(KeySecret::Session(_)) => Err(SessionError::Expired(peer.to_string())),
            _ => Err(SessionError::NoSession(peer.to_string())),
        }
    }

    /// Encrypt for `peer` under the current session key.
    pub fn seal_for(&self, peer: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
        let session = self.session_key_at(peer, unix_now())?;
        Ok(session.seal(plaintext)?)
    }

    /// Decrypt data `peer` sealed for us.
    pub fn open_from(&self, peer: &str, sealed: &[u8]) -> Result<Vec<u8>> {
        let session = self.session_key_at(peer, unix_now())?;
        Ok(session.open(sealed)?)
    }

    // ----- Lifecycle -----

    /// Expire every non-master key, retire the active master, and generate a
    /// new one. Returns the new public key; peers must re-trust it.
    pub fn rotate_keys(&self) -> LatticePublicKey {
        let now = unix_now();
        let mut store = self.store.write();
        for record in store.records.values_mut() {
            if !record.is_expired_at(now) {
                record.expires_at = Some(now);
            }
        }
        let keypair = LatticeKeypair::generate();
        let public = keypair.public_key();
        install_master(&self.node_id, &mut store, keypair, now);
        self.pending_offers.lock().clear();
        info!(node = %self.node_id, key = %store.active_master, "keys rotated");
        public
    }

    /// Remove expired key records, expired trust records, and old replay
    /// nonces. Returns the number of key and trust records removed.
    pub fn cleanup_expired_keys(&self) -> usize {
        self.cleanup_expired_keys_at(unix_now())
    }

    pub fn cleanup_expired_keys_at(&self, now: f64) -> usize {
        let mut removed = 0;
        {
            let mut store = self.store.write();
            let active = store.active_master.clone();
            let expired: Vec<String> = store
                .records
                .values()
                .filter(|r| r.key_id != active && r.is_expired_at(now))
                .map(|r| r.key_id.clone())
                .collect();
            for key_id in &expired {
                store.records.remove(key_id);
                debug!(node = %self.node_id, key = %key_id, "removed expired key");
            }
            store.sessions.retain(|_, key_id| !expired.contains(key_id));
            removed += expired.len();
        }

        let before = self.trusted.len();
        self.trusted.retain(|_, t| !t.is_expired_at(now));
        removed += before - self.trusted.len();

        self.replay.lock().prune(now);

        if removed > 0 {
            info!(node = %self.node_id, removed, "cleaned up expired keys");
        }
        removed
    }

    pub fn key_status(&self) -> KeyStatus {
        let now = unix_now();
        let store = self.store.read();
        let keys = store
            .records
            .iter()
            .map(|(id, r)| {
                (
                    id.clone(),
                    KeySummary {
                        key_type: r.key_type,
                        algorithm: r.algorithm.clone(),
                        created_at: r.created_at,
                        expires_at: r.expires_at,
                        is_expired: r.is_expired_at(now),
                        metadata: r.metadata.clone(),
                    },
                )
            })
            .collect();
        let active_sessions = store
            .sessions
            .values()
            .filter(|id| store.records.get(*id).is_some_and(|r| !r.is_expired_at(now)))
            .count();
        KeyStatus {
            node_id: self.node_id.clone(),
            active_master: store.active_master.clone(),
            total_keys: store.records.len(),
            trusted_nodes: self.trusted.len(),
            active_sessions,
            keys,
            trusted_node_list: self.trusted_nodes(),
        }
    }

    /// Public material of every signing key we hold. Session keys are
    /// symmetric and never exported.
    pub fn export_public_keys(&self) -> PublicKeyExport {
        let store = self.store.read();
        let keys = store
            .records
            .iter()
            .filter(|(_, r)| matches!(r.secret, Some(KeySecret::Signing(_))))
            .map(|(id, r)| (id.clone(), r.clone()))
            .collect();
        PublicKeyExport {
            node_id: self.node_id.clone(),
            exported_at: unix_now(),
            keys,
        }
    }
}

fn install_master(node_id: &str, store: &mut KeyStore, keypair: LatticeKeypair, now: f64) {
    store.generation += 1;
    let key_id = format!("master_{}_{}", node_id, store.generation);
    store.active_public = keypair.public_key();
    let mut metadata = Map::new();
    metadata.insert("usage".into(), Value::String("node_authentication".into()));
    metadata.insert("generation".into(), Value::from(store.generation));

    store.records.insert(
        key_id.clone(),
        KeyRecord {
            key_id: key_id.clone(),
            key_type: KeyType::Master,
            algorithm: SIGNING_ALGORITHM.to_string(),
            public_material: keypair.public_key().to_hex(),
            created_at: now,
            expires_at: store.master_lifetime.map(|l| now + l),
            metadata,
            secret: Some(KeySecret::Signing(keypair)),
        },
    );
    store.active_master = key_id;
}

fn parse_handshake(payload: &Value, expected: &str, actual: &str) -> Result<[u8; 32]> {
    if actual != expected {
        return Err(SessionError::MalformedHandshake(format!(
            "expected {}, got {}",
            expected, actual
        ))
        .into());
    }
    let hex_str = payload
        .get("ephemeral_public")
        .and_then(Value::as_str)
        .ok_or_else(|| SessionError::MalformedHandshake("missing ephemeral_public".into()))?;
    let bytes = hex::decode(hex_str)
        .map_err(|_| SessionError::MalformedHandshake("ephemeral_public is not hex".into()))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| SessionError::MalformedHandshake("ephemeral_public must be 32 bytes".into()).into())
}
