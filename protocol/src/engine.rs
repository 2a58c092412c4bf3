//! # Protocol Engine
//!
//! The per-node message processor. It owns the handler tables and the
//! outbound queue, and decides what happens to every envelope that reaches
//! this node.
//!
//! ## Inbound pipeline
//!
//! ```text
//! Message ─▶ verify signature ─▶ TTL ─▶ response?  ─▶ correlator
//!              │                  │     type handler? ─▶ handler
//!              ▼                  ▼     directive?  ─▶ command handler ─▶ Response
//!            Dropped            Dropped  otherwise ─▶ Ignored
//! ```
//!
//! Every step that fails is logged and the message dropped. The outcome is
//! returned as an [`Inbound`] value; nothing on this path returns an error or
//! panics, so a bad message can never take down the task handling it.
//!
//! ## Outbound
//!
//! Everything this node sends is signed here and pushed onto an unbounded
//! queue. The node runtime drains the queue into the P2P layer; tests can
//! take the receiver and inspect it directly.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::unix_now;
use crate::directive::{Directive, Response, ResponseStatus};
use crate::error::{LatticeError, Result};
use crate::message::{Message, MessageType, Payload, Priority};
use crate::node::NodeState;

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Answers one directive command.
#[async_trait]
pub trait DirectiveHandler: Send + Sync {
    async fn handle(&self, directive: Directive, message: Message) -> Result<Response>;
}

#[async_trait]
impl<F, Fut> DirectiveHandler for F
where
    F: Fn(Directive, Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Response>> + Send,
{
    async fn handle(&self, directive: Directive, message: Message) -> Result<Response> {
        (self)(directive, message).await
    }
}

/// Consumes every verified message of one [`MessageType`].
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message) -> Result<()>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle(&self, message: Message) -> Result<()> {
        (self)(message).await
    }
}

/// Replies `received` without doing anything else.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcknowledgeHandler;

#[async_trait]
impl DirectiveHandler for AcknowledgeHandler {
    async fn handle(&self, directive: Directive, _message: Message) -> Result<Response> {
        Ok(Response::acknowledged(&directive.directive_id))
    }
}

/// Source of correction content for a directive. The model itself lives
/// outside this crate; the engine only needs this one call.
pub trait CorrectionModel: Send + Sync {
    fn correct(&self, directive: &Directive) -> Result<Map<String, Value>>;
}

/// Runs a [`CorrectionModel`] and wraps its output in a success response
/// under `"correction"`.
pub struct CorrectionHandler<M> {
    model: M,
}

impl<M: CorrectionModel> CorrectionHandler<M> {
    pub fn new(model: M) -> Self {
        Self { model }
    }
}

#[async_trait]
impl<M: CorrectionModel> DirectiveHandler for CorrectionHandler<M> {
    async fn handle(&self, directive: Directive, _message: Message) -> Result<Response> {
        let correction = self.model.correct(&directive)?;
        let mut result = Map::new();
        result.insert("correction".into(), Value::Object(correction));
        result.insert("command".into(), Value::String(directive.command.clone()));
        Ok(Response::success(&directive.directive_id, result))
    }
}

// ---------------------------------------------------------------------------
// Outcome & stats
// ---------------------------------------------------------------------------

/// What happened to an inbound message.
#[derive(Debug)]
pub enum Inbound {
    /// A pending directive got its response.
    Resolved { directive_id: String },
    /// A registered message-type handler consumed it.
    Handled { message_type: MessageType },
    /// A command handler ran and its response was queued.
    Dispatched {
        command: String,
        status: ResponseStatus,
    },
    /// Verified, but nothing here is interested in it.
    Ignored { message_type: MessageType },
    Dropped(LatticeError),
}

/// Lock-free counters. Read with [`EngineStats::snapshot`].
#[derive(Debug, Default)]
pub struct EngineStats {
    sent: AtomicU64,
    verified: AtomicU64,
    dropped_invalid_signature: AtomicU64,
    dropped_untrusted: AtomicU64,
    dropped_stale: AtomicU64,
    dropped_expired_key: AtomicU64,
    dropped_malformed: AtomicU64,
    resolved: AtomicU64,
    duplicates: AtomicU64,
    timeouts: AtomicU64,
    dispatched: AtomicU64,
    unhandled: AtomicU64,
    forwarded: AtomicU64,
    no_route: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub sent: u64,
    pub verified: u64,
    pub dropped_invalid_signature: u64,
    pub dropped_untrusted: u64,
    pub dropped_stale: u64,
    pub dropped_expired_key: u64,
    pub dropped_malformed: u64,
    pub resolved: u64,
    pub duplicates: u64,
    pub timeouts: u64,
    pub dispatched: u64,
    pub unhandled: u64,
    pub forwarded: u64,
    pub no_route: u64,
}

impl StatsSnapshot {
    pub fn dropped(&self) -> u64 {
        self.dropped_invalid_signature
            + self.dropped_untrusted
            + self.dropped_stale
            + self.dropped_expired_key
            + self.dropped_malformed
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl EngineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            sent: get(&self.sent),
            verified: get(&self.verified),
            dropped_invalid_signature: get(&self.dropped_invalid_signature),
            dropped_untrusted: get(&self.dropped_untrusted),
            dropped_stale: get(&self.dropped_stale),
            dropped_expired_key: get(&self.dropped_expired_key),
            dropped_malformed: get(&self.dropped_malformed),
            resolved: get(&self.resolved),
            duplicates: get(&self.duplicates),
            timeouts: get(&self.timeouts),
            dispatched: get(&self.dispatched),
            unhandled: get(&self.unhandled),
            forwarded: get(&self.forwarded),
            no_route: get(&self.no_route),
        }
    }

    pub fn record_forwarded(&self) {
        bump(&self.forwarded);
    }

    pub fn record_no_route(&self) {
        bump(&self.no_route);
    }

    /// Count a verification-stage drop under its reason.
    pub fn record_drop(&self, error: &LatticeError) {
        match error {
            LatticeError::InvalidSignature { .. } => bump(&self.dropped_invalid_signature),
            LatticeError::UntrustedSender(_) => bump(&self.dropped_untrusted),
            LatticeError::StaleMessage { .. } => bump(&self.dropped_stale),
            LatticeError::ExpiredKey(_) => bump(&self.dropped_expired_key),
            _ => bump(&self.dropped_malformed),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct ProtocolEngine {
    state: Arc<NodeState>,
    message_handlers: RwLock<HashMap<MessageType, Arc<dyn MessageHandler>>>,
    directive_handlers: RwLock<HashMap<String, Arc<dyn DirectiveHandler>>>,
    outbound_tx: mpsc::UnboundedSender<Message>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
}

impl ProtocolEngine {
    pub fn new(state: Arc<NodeState>) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            state,
            message_handlers: RwLock::new(HashMap::new()),
            directive_handlers: RwLock::new(HashMap::new()),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.state.config.node_id
    }

    pub fn state(&self) -> &Arc<NodeState> {
        &self.state
    }

    /// Register (or replace) the handler for a directive command.
    pub fn register_directive_handler(
        &self,
        command: impl Into<String>,
        handler: impl DirectiveHandler + 'static,
    ) {
        let command = command.into();
        debug!(node_id = %self.node_id(), command = %command, "directive handler registered");
        self.directive_handlers.write().insert(command, Arc::new(handler));
    }

    /// Register (or replace) the handler for a message type. Responses always
    /// go to the correlator and are never routed here.
    pub fn register_message_handler(
        &self,
        message_type: MessageType,
        handler: impl MessageHandler + 'static,
    ) {
        self.message_handlers
            .write()
            .insert(message_type, Arc::new(handler));
    }

    pub fn commands(&self) -> Vec<String> {
        let mut commands: Vec<String> = self.directive_handlers.read().keys().cloned().collect();
        commands.sort();
        commands
    }

    /// Hand the outbound queue to whoever delivers it. Only the first call
    /// gets the receiver.
    pub fn take_outbound_receiver(&self) -> Option<mpsc::UnboundedReceiver<Message>> {
        self.outbound_rx.lock().take()
    }

    // ----- Inbound -----

    /// Verify, age-check and route one inbound envelope.
    #[instrument(skip_all, fields(node = %self.node_id(), msg = %message.message_id, from = %message.sender_id, kind = %message.message_type))]
    pub async fn process_incoming_message(&self, message: Message) -> Inbound {
        if let Err(e) = self.state.crypto.verify_message(&message) {
            warn!(error = %e, "dropping message that failed verification");
            self.state.stats.record_drop(&e);
            return Inbound::Dropped(e);
        }
        let now = unix_now();
        if message.is_expired_at(now) {
            let e = LatticeError::StaleMessage {
                age_secs: message.age_at(now),
                limit_secs: message.ttl,
            };
            warn!(error = %e, "dropping expired message");
            self.state.stats.record_drop(&e);
            return Inbound::Dropped(e);
        }
        bump(&self.state.stats.verified);
        self.state.registry.touch(&message.sender_id, now);

        if message.message_type == MessageType::Response {
            return self.resolve_response(&message);
        }

        let type_handler = self.message_handlers.read().get(&message.message_type).cloned();
        if let Some(handler) = type_handler {
            let message_type = message.message_type;
            return match handler.handle(message).await {
                Ok(()) => Inbound::Handled { message_type },
                Err(e) => {
                    warn!(error = %e, "message handler failed");
                    Inbound::Dropped(e)
                }
            };
        }

        if message.message_type == MessageType::Directive {
            return self.dispatch_directive(message).await;
        }

        trace!("no handler for message type");
        Inbound::Ignored {
            message_type: message.message_type,
        }
    }

    fn resolve_response(&self, message: &Message) -> Inbound {
        let response = match Response::from_message(message) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "malformed response payload");
                self.state.stats.record_drop(&e);
                return Inbound::Dropped(e);
            }
        };
        let directive_id = response.directive_id.clone();
        match self.state.correlator.resolve(response) {
            Ok(()) => {
                bump(&self.state.stats.resolved);
                Inbound::Resolved { directive_id }
            }
            Err(e) => {
                bump(&self.state.stats.duplicates);
                Inbound::Dropped(e)
            }
        }
    }

    async fn dispatch_directive(&self, message: Message) -> Inbound {
        let directive = match Directive::from_message(&message) {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "malformed directive payload");
                self.state.stats.record_drop(&e);
                return Inbound::Dropped(e);
            }
        };
        let command = directive.command.clone();
        let directive_id = directive.directive_id.clone();
        let reply_to = message.sender_id.clone();

        let handler = self.directive_handlers.read().get(&command).cloned();
        let Some(handler) = handler else {
            bump(&self.state.stats.unhandled);
            warn!(command = %command, directive = %directive_id, "no handler for command");
            if self.state.config.negative_acks {
                let refusal = Response::refused(&directive_id, format!("no handler for {}", command));
                if let Err(e) = self.reply(&refusal, &reply_to) {
                    warn!(error = %e, "failed to queue refusal");
                }
            }
            return Inbound::Dropped(LatticeError::NoHandlerForCommand(command));
        };

        let started = Instant::now();
        let mut response = match handler.handle(directive, message).await {
            Ok(r) => r,
            Err(e) => {
                warn!(command = %command, error = %e, "directive handler failed");
                Response::error(&directive_id, e.to_string())
            }
        };
        if response.processing_time.is_none() {
            response.processing_time = Some(started.elapsed().as_secs_f64());
        }
        let status = response.status;
        if let Err(e) = self.reply(&response, &reply_to) {
            warn!(command = %command, error = %e, "failed to queue response");
            return Inbound::Dropped(e);
        }
        bump(&self.state.stats.dispatched);
        debug!(command = %command, ?status, "directive dispatched");
        Inbound::Dispatched { command, status }
    }

    fn reply(&self, response: &Response, recipient: &str) -> Result<String> {
        let message = response.to_message(self.node_id(), recipient)?;
        self.send_message(message)
    }

    // ----- Outbound -----

    /// Sign and enqueue. Returns the message id.
    pub fn send_message(&self, mut message: Message) -> Result<String> {
        self.state.crypto.sign_message(&mut message)?;
        let id = message.message_id.clone();
        self.outbound_tx
            .send(message)
            .map_err(|_| LatticeError::Transport("outbound queue closed".into()))?;
        bump(&self.state.stats.sent);
        Ok(id)
    }

    /// Send a directive to `recipient` and wait for its response.
    ///
    /// `Ok(None)` means nothing came back within the directive's timeout.
    /// Errors are local: the directive could not be registered, signed or
    /// queued.
    pub async fn send_directive(
        &self,
        directive: Directive,
        recipient: &str,
    ) -> Result<Option<Response>> {
        let timeout = self.directive_timeout(&directive);
        let pending = self.state.correlator.register(&directive.directive_id)?;
        let message = directive.to_message(self.node_id(), Some(recipient))?;
        self.send_message(message)?;
        pending.mark_queued();
        debug!(
            node_id = %self.node_id(),
            directive = %directive.directive_id,
            command = %directive.command,
            to = recipient,
            "directive sent"
        );

        match pending.wait(timeout).await {
            Some(response) => Ok(Some(response)),
            None => {
                bump(&self.state.stats.timeouts);
                info!(
                    directive = %directive.directive_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "no response before timeout"
                );
                Ok(None)
            }
        }
    }

    /// [`send_directive`](Self::send_directive) for callers that treat
    /// silence as a failure: no response becomes [`LatticeError::Timeout`].
    pub async fn request(&self, directive: Directive, recipient: &str) -> Result<Response> {
        let directive_id = directive.directive_id.clone();
        let timeout_ms = self.directive_timeout(&directive).as_millis() as u64;
        self.send_directive(directive, recipient)
            .await?
            .ok_or(LatticeError::Timeout {
                directive_id,
                timeout_ms,
            })
    }

    fn directive_timeout(&self, directive: &Directive) -> Duration {
        if directive.timeout_seconds.is_finite() && directive.timeout_seconds > 0.0 {
            Duration::from_secs_f64(directive.timeout_seconds)
        } else {
            self.state.config.default_timeout()
        }
    }

    /// Send an independent copy of `message` to every connected node not in
    /// `exclude`. Each copy gets its own recipient, timestamp, id and
    /// signature. Returns how many copies were queued.
    pub fn broadcast_message(&self, message: &Message, exclude: &[&str]) -> Result<usize> {
        let mut queued = 0;
        for node_id in self.state.registry.connected_ids() {
            if node_id == self.node_id() || exclude.contains(&node_id.as_str()) {
                continue;
            }
            let copy = message.resend().with_recipient(node_id);
            self.send_message(copy)?;
            queued += 1;
        }
        Ok(queued)
    }

    /// Liveness beacon to every connected node.
    pub fn heartbeat(&self) -> Result<usize> {
        let mut payload = Payload::new();
        payload.insert("status".into(), json!("alive"));
        payload.insert("timestamp".into(), json!(unix_now()));
        payload.insert("role".into(), json!(self.state.config.role));
        let beat = Message::new(MessageType::Heartbeat, self.node_id(), payload)
            .with_priority(Priority::Low);
        self.broadcast_message(&beat, &[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LatticeConfig;
    use crate::crypto::CryptoManager;
    use crate::network::registry::{NetworkNode, NodeRole};
    use crate::node::NodeState;

    struct Pair {
        a: ProtocolEngine,
        a_out: mpsc::UnboundedReceiver<Message>,
        b: ProtocolEngine,
        b_out: mpsc::UnboundedReceiver<Message>,
    }

    fn engine(id: &str, role: NodeRole, negative_acks: bool) -> ProtocolEngine {
        let mut config = LatticeConfig::for_node(id, role);
        config.negative_acks = negative_acks;
        let state = NodeState::new(config, Arc::new(CryptoManager::new(id)));
        ProtocolEngine::new(state)
    }

    /// Two engines that trust each other; queues are drained by hand.
    fn pair(negative_acks: bool) -> Pair {
        let a = engine("a", NodeRole::Core, negative_acks);
        let b = engine("b", NodeRole::Wealth, negative_acks);
        a.state().crypto.trust_node("b", b.state().crypto.public_key(), "ed25519").unwrap();
        b.state().crypto.trust_node("a", a.state().crypto.public_key(), "ed25519").unwrap();
        let a_out = a.take_outbound_receiver().unwrap();
        let b_out = b.take_outbound_receiver().unwrap();
        Pair { a, a_out, b, b_out }
    }

    fn ping() -> Directive {
        Directive::new("ping").with_timeout(5.0)
    }

    #[tokio::test]
    async fn directive_round_trip_through_queues() {
        let Pair { a, mut a_out, b, mut b_out } = pair(false);
        b.register_directive_handler("ping", |d: Directive, _m: Message| async move {
            let mut result = Map::new();
            result.insert("pong".into(), json!(true));
            Ok::<_, LatticeError>(Response::success(&d.directive_id, result))
        });

        let a = Arc::new(a);
        let sender = {
            let a = a.clone();
            tokio::spawn(async move { a.send_directive(ping(), "b").await })
        };

        let outgoing = a_out.recv().await.unwrap();
        assert_eq!(outgoing.recipient_id.as_deref(), Some("b"));
        assert!(outgoing.signature.is_some());

        let outcome = b.process_incoming_message(outgoing).await;
        assert!(matches!(outcome, Inbound::Dispatched { ref command, status: ResponseStatus::Success } if command == "ping"));

        let reply = b_out.recv().await.unwrap();
        assert_eq!(reply.message_type, MessageType::Response);
        assert!(matches!(a.process_incoming_message(reply).await, Inbound::Resolved { .. }));

        let response = sender.await.unwrap().unwrap().unwrap();
        assert!(response.is_success());
        assert_eq!(response.result["pong"], true);
        assert!(response.processing_time.is_some());
        assert_eq!(a.state().stats.snapshot().resolved, 1);
    }

    #[tokio::test]
    async fn untrusted_sender_is_dropped() {
        let stranger = engine("stranger", NodeRole::Core, false);
        let b = engine("b", NodeRole::Core, false);
        let mut msg = ping().to_message("stranger", Some("b")).unwrap();
        stranger.state().crypto.sign_message(&mut msg).unwrap();

        let outcome = b.process_incoming_message(msg).await;
        assert!(matches!(outcome, Inbound::Dropped(LatticeError::UntrustedSender(ref s)) if s == "stranger"));
        assert_eq!(b.state().stats.snapshot().dropped_untrusted, 1);
    }

    #[tokio::test]
    async fn tampered_message_is_dropped() {
        let Pair { a, b, .. } = pair(false);
        let mut msg = ping().to_message("a", Some("b")).unwrap();
        a.state().crypto.sign_message(&mut msg).unwrap();
        msg.priority = Priority::Critical;
        let outcome = b.process_incoming_message(msg).await;
        assert!(matches!(outcome, Inbound::Dropped(LatticeError::InvalidSignature { .. })));
    }

    #[tokio::test]
    async fn expired_message_is_dropped_even_when_signed() {
        let Pair { a, b, .. } = pair(false);
        let mut msg = Message::new_at(MessageType::Directive, "a", Payload::new(), unix_now() - 10.0)
            .with_ttl(5);
        a.state().crypto.sign_message(&mut msg).unwrap();
        let outcome = b.process_incoming_message(msg).await;
        assert!(matches!(outcome, Inbound::Dropped(LatticeError::StaleMessage { limit_secs: 5, .. })));
        assert_eq!(b.state().stats.snapshot().dropped_stale, 1);
    }

    #[tokio::test]
    async fn unknown_command_is_silent_by_default() {
        let Pair { a, b, mut b_out, .. } = pair(false);
        let mut msg = ping().to_message("a", Some("b")).unwrap();
        a.state().crypto.sign_message(&mut msg).unwrap();
        let outcome = b.process_incoming_message(msg).await;
        assert!(matches!(outcome, Inbound::Dropped(LatticeError::NoHandlerForCommand(ref c)) if c == "ping"));
        assert!(b_out.try_recv().is_err());
        assert_eq!(b.state().stats.snapshot().unhandled, 1);
    }

    #[tokio::test]
    async fn unknown_command_refused_with_negative_acks() {
        let Pair { a, b, mut b_out, .. } = pair(true);
        let mut msg = ping().to_message("a", Some("b")).unwrap();
        a.state().crypto.sign_message(&mut msg).unwrap();
        b.process_incoming_message(msg).await;
        let refusal = Response::from_message(&b_out.try_recv().unwrap()).unwrap();
        assert_eq!(refusal.status, ResponseStatus::Refused);
    }

    #[tokio::test]
    async fn handler_error_becomes_error_response() {
        let Pair { a, b, mut b_out, .. } = pair(false);
        b.register_directive_handler("explode", |_d: Directive, _m: Message| async move {
            Err::<Response, _>(LatticeError::Config("model offline".into()))
        });
        let mut msg = Directive::new("explode").to_message("a", Some("b")).unwrap();
        a.state().crypto.sign_message(&mut msg).unwrap();
        let outcome = b.process_incoming_message(msg).await;
        assert!(matches!(outcome, Inbound::Dispatched { status: ResponseStatus::Error, .. }));
        let reply = Response::from_message(&b_out.try_recv().unwrap()).unwrap();
        assert!(reply.error.unwrap().contains("model offline"));
    }

    #[tokio::test]
    async fn duplicate_response_is_discarded() {
        let Pair { a, mut a_out, b, .. } = pair(false);
        let a = Arc::new(a);
        let directive = ping();
        let id = directive.directive_id.clone();
        let waiter = {
            let a = a.clone();
            tokio::spawn(async move { a.send_directive(directive, "b").await })
        };
        a_out.recv().await.unwrap();

        let first = Response::success(&id, Map::new());
        let second = Response::error(&id, "late");
        let mut m1 = first.to_message("b", "a").unwrap();
        let mut m2 = second.to_message("b", "a").unwrap();
        b.state().crypto.sign_message(&mut m1).unwrap();
        b.state().crypto.sign_message(&mut m2).unwrap();

        assert!(matches!(a.process_incoming_message(m1).await, Inbound::Resolved { .. }));
        assert!(matches!(
            a.process_incoming_message(m2).await,
            Inbound::Dropped(LatticeError::DuplicateResponse(_))
        ));
        let got = waiter.await.unwrap().unwrap().unwrap();
        assert!(got.is_success());
        assert_eq!(a.state().stats.snapshot().duplicates, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn send_directive_times_out_to_none() {
        let Pair { a, a_out: _keep, .. } = pair(false);
        let started = tokio::time::Instant::now();
        let result = a
            .send_directive(Directive::new("ping").with_timeout(2.0), "b")
            .await
            .unwrap();
        assert!(result.is_none());
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(a.state().correlator.pending_count(), 0);
        assert_eq!(a.state().stats.snapshot().timeouts, 1);
    }

    #[tokio::test]
    async fn type_handler_sees_heartbeats() {
        let Pair { a, b, .. } = pair(false);
        let seen = Arc::new(AtomicU64::new(0));
        let counter = seen.clone();
        b.register_message_handler(MessageType::Heartbeat, move |_m: Message| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, LatticeError>(())
            }
        });
        let mut beat = Message::new(MessageType::Heartbeat, "a", Payload::new());
        a.state().crypto.sign_message(&mut beat).unwrap();
        assert!(matches!(
            b.process_incoming_message(beat).await,
            Inbound::Handled { message_type: MessageType::Heartbeat }
        ));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn broadcast_copies_are_independent() {
        let a = engine("a", NodeRole::Core, false);
        let mut out = a.take_outbound_receiver().unwrap();
        for id in ["b", "c", "d"] {
            a.state().registry.upsert(NetworkNode::new(id, NodeRole::Core, unix_now()));
        }
        let mut payload = Payload::new();
        payload.insert("alert".into(), json!("rebalance"));
        let msg = Message::new(MessageType::StateSync, "a", payload);

        assert_eq!(a.broadcast_message(&msg, &["c"]).unwrap(), 2);
        let first = out.try_recv().unwrap();
        let second = out.try_recv().unwrap();
        assert_eq!(first.recipient_id.as_deref(), Some("b"));
        assert_eq!(second.recipient_id.as_deref(), Some("d"));
        assert_ne!(first.fingerprint(), second.fingerprint());
        assert_eq!(first.payload, second.payload);
        assert_ne!(first.signature, second.signature);
    }

    struct Halve;

    impl CorrectionModel for Halve {
        fn correct(&self, directive: &Directive) -> Result<Map<String, Value>> {
            let drift = directive.parameters.get("drift").and_then(Value::as_f64).unwrap_or(0.0);
            let mut out = Map::new();
            out.insert("adjustment".into(), json!(-drift / 2.0));
            Ok(out)
        }
    }

    #[tokio::test]
    async fn correction_and_acknowledge_handlers() {
        let directive = Directive::new("correct").with_parameter("drift", json!(0.5));
        let msg = directive.to_message("a", Some("b")).unwrap();
        let response = CorrectionHandler::new(Halve)
            .handle(directive.clone(), msg.clone())
            .await
            .unwrap();
        assert_eq!(response.result["correction"]["adjustment"], -0.25);

        let ack = AcknowledgeHandler.handle(directive, msg).await.unwrap();
        assert_eq!(ack.status, ResponseStatus::Received);
    }
}
