//! # Peer Session Keys
//!
//! Ephemeral, peer-scoped symmetric keys.
//!
//! A session is established with an X25519 exchange: each side contributes a
//! fresh ephemeral public key (carried inside a signed `SecureMessage`, so the
//! exchange is authenticated by the nodes' Ed25519 identities), the raw DH
//! output is run through BLAKE3's `derive_key` mode, and the result is an
//! AES-256-GCM key that lives for [`SESSION_KEY_LIFETIME`].
//!
//! The KDF input binds both ephemeral public keys *and* both node ids, sorted
//! so the two sides feed identical bytes. A key derived for `(a, b)` is
//! useless between any other pair.
//!
//! ## Wire format of sealed data
//!
//! `nonce (12 bytes) || ciphertext || tag (16 bytes)`, the same layout the
//! node uses everywhere it carries AES-GCM output.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::config::{AES_KEY_LENGTH, AES_NONCE_LENGTH, SESSION_KDF_CONTEXT};

/// Errors in session establishment and sealing.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no pending session offer for {0}")]
    NoPendingOffer(String),

    #[error("ephemeral secret already consumed")]
    AlreadyCompleted,

    #[error("malformed session handshake: {0}")]
    MalformedHandshake(String),

    #[error("no session key for {0}")]
    NoSession(String),

    #[error("session key for {0} has expired")]
    Expired(String),

    #[error("encryption failed")]
    SealFailed,

    #[error("decryption failed: wrong key or corrupted data")]
    OpenFailed,
}

// ---------------------------------------------------------------------------
// Ephemeral exchange
// ---------------------------------------------------------------------------

/// One side of an in-flight X25519 exchange.
///
/// The secret is consumed by [`complete`](Self::complete); a second call
/// returns [`SessionError::AlreadyCompleted`].
pub struct EphemeralExchange {
    secret: Option<EphemeralSecret>,
    public: PublicKey,
}

impl EphemeralExchange {
    pub fn new() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self {
            secret: Some(secret),
            public,
        }
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Finish the exchange and derive the shared session key material.
    pub fn complete(
        &mut self,
        peer_public: &[u8; 32],
        local_node: &str,
        peer_node: &str,
    ) -> Result<[u8; AES_KEY_LENGTH], SessionError> {
        let secret = self.secret.take().ok_or(SessionError::AlreadyCompleted)?;
        let shared = secret.diffie_hellman(&PublicKey::from(*peer_public));
        Ok(derive_session_key(
            shared.as_bytes(),
            (&self.public.to_bytes(), local_node),
            (peer_public, peer_node),
        ))
    }
}

impl Default for EphemeralExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EphemeralExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralExchange")
            .field("public", &hex::encode(self.public.to_bytes()))
            .field("consumed", &self.secret.is_none())
            .finish()
    }
}

/// BLAKE3 derive-key over `shared || (pub, node) || (pub, node)`, with the two
/// contributions sorted by public key so both ends agree.
fn derive_session_key(
    shared_secret: &[u8; 32],
    ours: (&[u8; 32], &str),
    theirs: (&[u8; 32], &str),
) -> [u8; AES_KEY_LENGTH] {
    let (first, second) = if ours.0 <= theirs.0 {
        (ours, theirs)
    } else {
        (theirs, ours)
    };

    let mut hasher = blake3::Hasher::new_derive_key(SESSION_KDF_CONTEXT);
    hasher.update(shared_secret);
    for (public, node) in [first, second] {
        hasher.update(public);
        hasher.update(&(node.len() as u32).to_le_bytes());
        hasher.update(node.as_bytes());
    }

    let mut key = [0u8; AES_KEY_LENGTH];
    hasher.finalize_xof().fill(&mut key);
    key
}

// ---------------------------------------------------------------------------
// Session key
// ---------------------------------------------------------------------------

/// An established symmetric key shared with exactly one peer.
#[derive(Clone)]
pub struct SessionKey {
    key: [u8; AES_KEY_LENGTH],
    /// Associated data bound into every seal: both node ids, sorted.
    binding: Vec<u8>,
    pub peer_id: String,
    pub created_at: f64,
    pub expires_at: f64,
}

impl SessionKey {
    pub fn new(
        key: [u8; AES_KEY_LENGTH],
        local_node: &str,
        peer_node: &str,
        created_at: f64,
        lifetime_secs: f64,
    ) -> Self {
        let (a, b) = if local_node <= peer_node {
            (local_node, peer_node)
        } else {
            (peer_node, local_node)
        };
        let binding = format!("{}|{}", a, b).into_bytes();
        Self {
            key,
            binding,
            peer_id: peer_node.to_string(),
            created_at,
            expires_at: created_at + lifetime_secs,
        }
    }

    pub fn is_expired_at(&self, now: f64) -> bool {
        now >= self.expires_at
    }

    /// BLAKE3 fingerprint of the key, safe to log and compare.
    pub fn fingerprint(&self) -> String {
        hex::encode(&blake3::hash(&self.key).as_bytes()[..8])
    }

    /// AES-256-GCM encrypt, returning `nonce || ciphertext`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, SessionError> {
        let cipher = Aes256Gcm::new_from_slice(&self.key).map_err(|_| SessionError::SealFailed)?;

        let mut nonce_bytes = [0u8; AES_NONCE_LENGTH];
        OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad: &self.binding,
                },
            )
            .map_err(|_| SessionError::SealFailed)?;

        let mut out = Vec::with_capacity(AES_NONCE_LENGTH + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Inverse of [`seal`](Self::seal).
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, SessionError> {
        if sealed.len() < AES_NONCE_LENGTH {
            return Err(SessionError::OpenFailed);
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(AES_NONCE_LENGTH);
        let cipher = Aes256Gcm::new_from_slice(&self.key).map_err(|_| SessionError::OpenFailed)?;
        cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad: &self.binding,
                },
            )
            .map_err(|_| SessionError::OpenFailed)
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKey")
            .field("peer_id", &self.peer_id)
            .field("fingerprint", &self.fingerprint())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange(a: &str, b: &str) -> ([u8; 32], [u8; 32]) {
        let mut alice = EphemeralExchange::new();
        let mut bob = EphemeralExchange::new();
        let (alice_pub, bob_pub) = (alice.public_bytes(), bob.public_bytes());
        (
            alice.complete(&bob_pub, a, b).unwrap(),
            bob.complete(&alice_pub, b, a).unwrap(),
        )
    }

    #[test]
    fn both_sides_derive_same_key() {
        let (ka, kb) = exchange("core-01", "wealth-01");
        assert_eq!(ka, kb);
    }

    #[test]
    fn independent_exchanges_differ() {
        let (k1, _) = exchange("a", "b");
        let (k2, _) = exchange("a", "b");
        assert_ne!(k1, k2);
    }

    #[test]
    fn node_ids_are_bound_into_key() {
        let shared = [0x11; 32];
        let (pa, pb) = ([0x22; 32], [0x33; 32]);
        let k1 = derive_session_key(&shared, (&pa, "a"), (&pb, "b"));
        let k2 = derive_session_key(&shared, (&pb, "b"), (&pa, "a"));
        let k3 = derive_session_key(&shared, (&pa, "a"), (&pb, "c"));
        assert_eq!(k1, k2);
        assert_ne!(k1, k3);
    }

    #[test]
    fn exchange_is_single_use() {
        let mut ex = EphemeralExchange::new();
        assert!(ex.complete(&[9u8; 32], "a", "b").is_ok());
        assert!(matches!(
            ex.complete(&[9u8; 32], "a", "b"),
            Err(SessionError::AlreadyCompleted)
        ));
    }

    #[test]
    fn seal_open_between_peers() {
        let (ka, kb) = exchange("core-01", "vitality-01");
        let alice = SessionKey::new(ka, "core-01", "vitality-01", 0.0, 3600.0);
        let bob = SessionKey::new(kb, "vitality-01", "core-01", 0.0, 3600.0);

        let sealed = alice.seal(b"heart rate 62").unwrap();
        assert_eq!(bob.open(&sealed).unwrap(), b"heart rate 62");
        assert_eq!(alice.fingerprint(), bob.fingerprint());
    }

    #[test]
    fn tampered_or_truncated_data_fails() {
        let key = SessionKey::new([5u8; 32], "a", "b", 0.0, 10.0);
        let mut sealed = key.seal(b"data").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(key.open(&sealed).is_err());
        assert!(key.open(&[0u8; 4]).is_err());
    }

    #[test]
    fn expiry_boundary() {
        let key = SessionKey::new([5u8; 32], "a", "b", 100.0, 3600.0);
        assert!(!key.is_expired_at(3699.9));
        assert!(key.is_expired_at(3700.0));
    }

    #[test]
    fn debug_hides_key_bytes() {
        let key = SessionKey::new([0xAB; 32], "a", "b", 0.0, 1.0);
        assert!(!format!("{:?}", key).contains("abababab"));
    }
}
