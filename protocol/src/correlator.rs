//! # Directive/Response Correlator
//!
//! Tracks directives this node has sent and hands each incoming response to
//! the one caller waiting for it.
//!
//! ## Lifecycle of an entry
//!
//! ```text
//! Created ──▶ SignedAndQueued ──▶ AwaitingResponse ──┬─▶ Resolved
//!                                                    └─▶ TimedOut
//! ```
//!
//! [`Correlator::register`] returns a [`PendingDirective`] guard. The guard
//! owns the receiving half of a oneshot channel; the correlator keeps the
//! sending half. Dropping the guard removes the entry, whatever path the
//! caller took out (response, timeout, error, or its own future being
//! dropped). Nothing is ever left pending.
//!
//! ## Exactly one resolution
//!
//! Resolution and timeout race under the same lock. Whichever wins flips the
//! entry's state; the loser observes it and backs off. A second response for
//! a resolved id is rejected with `DuplicateResponse`; a response for an id
//! that timed out, or was never sent, is rejected with `UnknownDirective`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::config::RESOLVED_HISTORY_SIZE;
use crate::directive::Response;
use crate::error::{LatticeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectiveState {
    Created,
    SignedAndQueued,
    AwaitingResponse,
    Resolved,
    TimedOut,
}

impl fmt::Display for DirectiveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DirectiveState::Created => "created",
            DirectiveState::SignedAndQueued => "signed_and_queued",
            DirectiveState::AwaitingResponse => "awaiting_response",
            DirectiveState::Resolved => "resolved",
            DirectiveState::TimedOut => "timed_out",
        };
        f.write_str(s)
    }
}

struct Entry {
    state: DirectiveState,
    responder: Option<oneshot::Sender<Response>>,
    registered_at: Instant,
}

#[derive(Default)]
struct Inner {
    pending: HashMap<String, Entry>,
    /// Ids resolved recently, oldest first, for duplicate classification.
    resolved_order: VecDeque<String>,
    resolved: HashSet<String>,
}

impl Inner {
    fn remember_resolved(&mut self, directive_id: &str) {
        if self.resolved.insert(directive_id.to_string()) {
            self.resolved_order.push_back(directive_id.to_string());
        }
        while self.resolved_order.len() > RESOLVED_HISTORY_SIZE {
            if let Some(old) = self.resolved_order.pop_front() {
                self.resolved.remove(&old);
            }
        }
    }
}

/// Pending-directive table shared between senders and the inbound path.
#[derive(Clone, Default)]
pub struct Correlator {
    inner: Arc<Mutex<Inner>>,
}

impl fmt::Debug for Correlator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Correlator")
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `directive_id`.
    pub fn register(&self, directive_id: &str) -> Result<PendingDirective> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock();
        if inner.pending.contains_key(directive_id) {
            return Err(LatticeError::DuplicateDirective(directive_id.to_string()));
        }
        // A reused id starts a fresh history.
        if inner.resolved.remove(directive_id) {
            inner.resolved_order.retain(|id| id != directive_id);
        }
        inner.pending.insert(
            directive_id.to_string(),
            Entry {
                state: DirectiveState::Created,
                responder: Some(tx),
                registered_at: Instant::now(),
            },
        );
        drop(inner);

        debug!(directive = directive_id, "directive registered");
        Ok(PendingDirective {
            directive_id: directive_id.to_string(),
            receiver: Some(rx),
            inner: Arc::clone(&self.inner),
        })
    }

    /// Deliver a response to its waiter.
    pub fn resolve(&self, response: Response) -> Result<()> {
        let directive_id = response.directive_id.clone();
        let mut inner = self.inner.lock();

        let Some(entry) = inner.pending.get_mut(&directive_id) else {
            let err = if inner.resolved.contains(&directive_id) {
                LatticeError::DuplicateResponse(directive_id)
            } else {
                LatticeError::UnknownDirective(directive_id)
            };
            drop(inner);
            warn!(error = %err, "discarding response");
            return Err(err);
        };

        match entry.state {
            DirectiveState::Resolved => {
                drop(inner);
                warn!(directive = %directive_id, "discarding duplicate response");
                return Err(LatticeError::DuplicateResponse(directive_id));
            }
            DirectiveState::TimedOut => {
                drop(inner);
                warn!(directive = %directive_id, "discarding response that arrived after timeout");
                return Err(LatticeError::UnknownDirective(directive_id));
            }
            _ => {}
        }

        entry.state = DirectiveState::Resolved;
        let responder = entry.responder.take();
        let elapsed = entry.registered_at.elapsed();
        inner.remember_resolved(&directive_id);
        drop(inner);

        if let Some(tx) = responder {
            // The guard holds the receiver until it is dropped, and dropping
            // it removes this entry, so the send only fails if the waiter is
            // already tearing down.
            let _ = tx.send(response);
        }
        debug!(directive = %directive_id, elapsed_ms = elapsed.as_millis() as u64, "directive resolved");
        Ok(())
    }

    pub fn state(&self, directive_id: &str) -> Option<DirectiveState> {
        self.inner.lock().pending.get(directive_id).map(|e| e.state)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn pending_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.lock().pending.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// RAII handle for one outstanding directive.
///
/// Dropping it removes the directive from the correlator.
pub struct PendingDirective {
    directive_id: String,
    receiver: Option<oneshot::Receiver<Response>>,
    inner: Arc<Mutex<Inner>>,
}

impl PendingDirective {
    pub fn directive_id(&self) -> &str {
        &self.directive_id
    }

    fn transition(&self, from: DirectiveState, to: DirectiveState) {
        if let Some(entry) = self.inner.lock().pending.get_mut(&self.directive_id) {
            if entry.state == from {
                entry.state = to;
            }
        }
    }

    /// The envelope is signed and sitting in the outbound queue.
    pub fn mark_queued(&self) {
        self.transition(DirectiveState::Created, DirectiveState::SignedAndQueued);
    }

    /// Suspend until the response arrives or `timeout` elapses.
    ///
    /// Returns `None` on timeout. Consumes the guard, so the entry is gone by
    /// the time this returns.
    pub async fn wait(mut self, timeout: Duration) -> Option<Response> {
        self.transition(DirectiveState::SignedAndQueued, DirectiveState::AwaitingResponse);
        self.transition(DirectiveState::Created, DirectiveState::AwaitingResponse);

        let mut receiver = self.receiver.take()?;
        match tokio::time::timeout(timeout, &mut receiver).await {
            Ok(Ok(response)) => Some(response),
            Ok(Err(_)) => None,
            Err(_) => {
                let resolved_meanwhile = {
                    let mut inner = self.inner.lock();
                    match inner.pending.get_mut(&self.directive_id) {
                        Some(entry) if entry.state == DirectiveState::Resolved => true,
                        Some(entry) => {
                            entry.state = DirectiveState::TimedOut;
                            entry.responder = None;
                            false
                        }
                        None => false,
                    }
                };
                if resolved_meanwhile {
                    return receiver.try_recv().ok();
                }
                warn!(
                    directive = %self.directive_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "directive timed out"
                );
                None
            }
        }
    }
}

impl Drop for PendingDirective {
    fn drop(&mut self) {
        self.inner.lock().pending.remove(&self.directive_id);
    }
}

impl fmt::Debug for PendingDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingDirective")
            .field("directive_id", &self.directive_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // 1. Response resolves the waiter
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn response_resolves_waiter() {
        let correlator = Correlator::new();
        let pending = correlator.register("d-1").unwrap();
        pending.mark_queued();
        assert_eq!(correlator.state("d-1"), Some(DirectiveState::SignedAndQueued));

        let c = correlator.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            c.resolve(Response::acknowledged("d-1")).unwrap();
        });

        let response = pending.wait(Duration::from_secs(2)).await.unwrap();
        assert_eq!(response.response_id, "ack_d-1");
        assert_eq!(correlator.pending_count(), 0);
    }

    // -----------------------------------------------------------------------
    // 2. Timeout yields None and cleans up
    // -----------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn timeout_yields_none_within_window() {
        let correlator = Correlator::new();
        let pending = correlator.register("d-2").unwrap();

        let start = tokio::time::Instant::now();
        let result = pending.wait(Duration::from_millis(500)).await;
        let elapsed = start.elapsed();

        assert!(result.is_none());
        assert!(elapsed >= Duration::from_millis(500));
        assert!(elapsed < Duration::from_millis(600));
        assert_eq!(correlator.pending_count(), 0);
    }

    // -----------------------------------------------------------------------
    // 3. Second response is a duplicate, never delivered
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn second_response_is_duplicate() {
        let correlator = Correlator::new();
        let pending = correlator.register("d-3").unwrap();

        let first = Response::acknowledged("d-3");
        let mut second = Response::error("d-3", "late");
        second.response_id = "second".into();

        correlator.resolve(first.clone()).unwrap();
        assert!(matches!(
            correlator.resolve(second.clone()),
            Err(LatticeError::DuplicateResponse(_))
        ));

        let got = pending.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(got, first);

        // Still a duplicate after the guard is gone.
        assert!(matches!(
            correlator.resolve(second),
            Err(LatticeError::DuplicateResponse(_))
        ));
    }

    // -----------------------------------------------------------------------
    // 4. Unknown and timed-out ids
    // -----------------------------------------------------------------------

    #[test]
    fn unknown_directive_rejected() {
        let correlator = Correlator::new();
        assert!(matches!(
            correlator.resolve(Response::acknowledged("never-sent")),
            Err(LatticeError::UnknownDirective(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn late_response_after_timeout_is_unknown() {
        let correlator = Correlator::new();
        let pending = correlator.register("d-4").unwrap();
        assert!(pending.wait(Duration::from_millis(10)).await.is_none());
        assert!(matches!(
            correlator.resolve(Response::acknowledged("d-4")),
            Err(LatticeError::UnknownDirective(_))
        ));
    }

    // -----------------------------------------------------------------------
    // 5. Dropping the guard cleans up on every path
    // -----------------------------------------------------------------------

    #[test]
    fn dropping_guard_removes_entry() {
        let correlator = Correlator::new();
        {
            let _pending = correlator.register("d-5").unwrap();
            assert_eq!(correlator.pending_count(), 1);
        }
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn cancelled_wait_removes_entry() {
        let correlator = Correlator::new();
        let pending = correlator.register("d-6").unwrap();
        let task = tokio::spawn(pending.wait(Duration::from_secs(60)));
        tokio::task::yield_now().await;
        task.abort();
        let _ = task.await;
        assert_eq!(correlator.pending_count(), 0);
    }

    #[test]
    fn duplicate_registration_rejected() {
        let correlator = Correlator::new();
        let _a = correlator.register("d-7").unwrap();
        assert!(matches!(
            correlator.register("d-7"),
            Err(LatticeError::DuplicateDirective(_))
        ));
    }

    #[tokio::test]
    async fn out_of_order_resolution() {
        let correlator = Correlator::new();
        let a = correlator.register("a").unwrap();
        let b = correlator.register("b").unwrap();
        correlator.resolve(Response::acknowledged("b")).unwrap();
        correlator.resolve(Response::acknowledged("a")).unwrap();
        assert_eq!(b.wait(Duration::from_secs(1)).await.unwrap().directive_id, "b");
        assert_eq!(a.wait(Duration::from_secs(1)).await.unwrap().directive_id, "a");
    }
}
