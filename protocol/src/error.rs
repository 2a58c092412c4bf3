//! Error types for the lattice protocol.
//!
//! Every fallible protocol operation returns a [`LatticeError`]. Most of these
//! never reach a caller: inbound verification, staleness and routing failures
//! are logged and the offending message dropped. They exist as values so that
//! the drop reason can be counted and tested.

use thiserror::Error;

use crate::crypto::keys::KeyError;
use crate::crypto::session::SessionError;

/// Errors that can occur anywhere in the lattice protocol.
#[derive(Debug, Error)]
pub enum LatticeError {
    /// The signature is missing, malformed, or does not match the content.
    #[error("invalid signature on message from {sender}")]
    InvalidSignature {
        /// Claimed sender of the rejected message.
        sender: String,
    },

    /// No trusted public key is on record for the claimed sender.
    #[error("untrusted sender: {0}")]
    UntrustedSender(String),

    /// The message is older than its TTL or the freshness window.
    #[error("stale message: age {age_secs:.1}s exceeds {limit_secs}s")]
    StaleMessage {
        /// Observed age of the message in seconds.
        age_secs: f64,
        /// Allowed age in seconds.
        limit_secs: u64,
    },

    /// The key needed for this operation has expired.
    #[error("expired key: {0}")]
    ExpiredKey(String),

    /// No direct connection, routing entry, or fallback reaches the destination.
    #[error("no route to {0}")]
    NoRoute(String),

    /// A directive arrived for a command with no registered handler.
    #[error("no handler for command {0:?}")]
    NoHandlerForCommand(String),

    /// No response arrived for a directive within its timeout.
    #[error("directive {directive_id} timed out after {timeout_ms}ms")]
    Timeout {
        directive_id: String,
        timeout_ms: u64,
    },

    /// A directive id was registered while an earlier one with the same id
    /// is still pending.
    #[error("directive {0} is already pending")]
    DuplicateDirective(String),

    /// A response arrived for a directive that was already resolved.
    #[error("duplicate response for directive {0}")]
    DuplicateResponse(String),

    /// A response arrived for a directive this node never sent or already
    /// forgot (timed out long ago).
    #[error("response for unknown directive {0}")]
    UnknownDirective(String),

    /// The same signed message was presented twice inside the freshness window.
    #[error("replayed message from {sender} (nonce {nonce})")]
    ReplayedMessage { sender: String, nonce: String },

    /// A key lookup by id or peer found nothing.
    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("key error: {0}")]
    Key(#[from] KeyError),

    /// Session establishment or sealing failed.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Wire (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The transport could not deliver or subscribe.
    #[error("transport error: {0}")]
    Transport(String),

    /// The node configuration is unusable.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<serde_json::Error> for LatticeError {
    fn from(err: serde_json::Error) -> Self {
        LatticeError::Serialization(err.to_string())
    }
}

impl LatticeError {
    /// Short, stable label used for drop counters and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            LatticeError::InvalidSignature { .. } => "invalid_signature",
            LatticeError::UntrustedSender(_) => "untrusted_sender",
            LatticeError::StaleMessage { .. } => "stale_message",
            LatticeError::ExpiredKey(_) => "expired_key",
            LatticeError::NoRoute(_) => "no_route",
            LatticeError::NoHandlerForCommand(_) => "no_handler",
            LatticeError::Timeout { .. } => "timeout",
            LatticeError::DuplicateDirective(_) => "duplicate_directive",
            LatticeError::DuplicateResponse(_) => "duplicate_response",
            LatticeError::UnknownDirective(_) => "unknown_directive",
            LatticeError::ReplayedMessage { .. } => "replayed_message",
            LatticeError::KeyNotFound(_) => "key_not_found",
            LatticeError::Key(_) => "key",
            LatticeError::Session(_) => "session",
            LatticeError::Serialization(_) => "serialization",
            LatticeError::Transport(_) => "transport",
            LatticeError::Config(_) => "config",
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, LatticeError>;
