//! # Transports
//!
//! Named-topic pub/sub. The protocol never talks to sockets directly; it
//! subscribes handlers to topics and publishes byte payloads through a
//! [`Transport`]. Two implementations ship:
//!
//! - [`LocalTransport`] over a shared [`LocalBus`]: in-process dispatch. The
//!   bus is link-aware, so a test can wire `A ─ B ─ C` and A will never hear
//!   C directly.
//! - [`TcpTransport`]: every publish is queued for each configured peer and
//!   written as a length-prefixed JSON frame by that peer's writer task. The
//!   receiver dispatches it to whatever it has subscribed on that topic.
//!
//! `publish` awaits the subscribers it reaches in-process, and a TCP reader
//! awaits the subscribers of each frame it reads. Subscribers that do real
//! work should hand it to a task of their own and return.
//!
//! ## TCP framing
//!
//! ```text
//! ┌──────────────┬───────────────────────────────────────────────┐
//! │ len: u32 BE  │ {"origin": "...", "topic": "...", "payload": hex} │
//! └──────────────┴───────────────────────────────────────────────┘
//! ```
//!
//! Frames larger than [`MAX_FRAME_SIZE`] are refused on both sides.

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::MAX_FRAME_SIZE;
use crate::error::{LatticeError, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);
const PEER_QUEUE_CAPACITY: usize = 1024;

/// Callback invoked with the raw payload of every frame on a subscribed topic.
pub type FrameHandler = Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Box an async closure into a [`FrameHandler`].
pub fn frame_handler<F, Fut>(f: F) -> FrameHandler
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |bytes| Box::pin(f(bytes)))
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Node this transport publishes as.
    fn local_id(&self) -> &str;

    async fn subscribe(&self, topic: &str, handler: FrameHandler) -> Result<()>;

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;

    async fn unsubscribe_all(&self) -> Result<()>;
}

async fn dispatch(handlers: Vec<FrameHandler>, payload: Vec<u8>) {
    for handler in handlers {
        handler(payload.clone()).await;
    }
}

// ---------------------------------------------------------------------------
// In-process bus
// ---------------------------------------------------------------------------

struct Subscriber {
    node_id: String,
    handler: FrameHandler,
}

#[derive(Default)]
struct BusState {
    topics: HashMap<String, Vec<Subscriber>>,
    links: HashSet<(String, String)>,
    open: bool,
}

impl BusState {
    fn can_hear(&self, publisher: &str, subscriber: &str) -> bool {
        publisher == subscriber || self.open || self.links.contains(&link_key(publisher, subscriber))
    }
}

fn link_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

/// Shared in-process medium. Cloning shares the same bus.
#[derive(Clone, Default)]
pub struct LocalBus {
    state: Arc<RwLock<BusState>>,
}

impl LocalBus {
    /// A bus where nodes hear each other only once linked.
    pub fn new() -> Self {
        Self::default()
    }

    /// A bus where every node hears every other node.
    pub fn open() -> Self {
        let bus = Self::default();
        bus.state.write().open = true;
        bus
    }

    pub fn link(&self, a: &str, b: &str) {
        self.state.write().links.insert(link_key(a, b));
    }

    pub fn unlink(&self, a: &str, b: &str) {
        self.state.write().links.remove(&link_key(a, b));
    }

    pub fn linked(&self, a: &str, b: &str) -> bool {
        self.state.read().can_hear(a, b)
    }

    /// Attach a node to the bus.
    pub fn transport(&self, node_id: impl Into<String>) -> Arc<LocalTransport> {
        Arc::new(LocalTransport {
            node_id: node_id.into(),
            bus: self.clone(),
        })
    }
}

pub struct LocalTransport {
    node_id: String,
    bus: LocalBus,
}

#[async_trait]
impl Transport for LocalTransport {
    fn local_id(&self) -> &str {
        &self.node_id
    }

    async fn subscribe(&self, topic: &str, handler: FrameHandler) -> Result<()> {
        self.bus
            .state
            .write()
            .topics
            .entry(topic.to_string())
            .or_default()
            .push(Subscriber {
                node_id: self.node_id.clone(),
                handler,
            });
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let handlers: Vec<FrameHandler> = {
            let state = self.bus.state.read();
            state
                .topics
                .get(topic)
                .map(|subs| {
                    subs.iter()
                        .filter(|s| state.can_hear(&self.node_id, &s.node_id))
                        .map(|s| s.handler.clone())
                        .collect()
                })
                .unwrap_or_default()
        };
        trace!(node_id = %self.node_id, topic, receivers = handlers.len(), "local publish");
        dispatch(handlers, payload).await;
        Ok(())
    }

    async fn unsubscribe_all(&self) -> Result<()> {
        let mut state = self.bus.state.write();
        for subs in state.topics.values_mut() {
            subs.retain(|s| s.node_id != self.node_id);
        }
        state.topics.retain(|_, subs| !subs.is_empty());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// TCP
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct WireFrame {
    origin: String,
    topic: String,
    payload: String,
}

type Subscriptions = Arc<RwLock<HashMap<String, Vec<FrameHandler>>>>;

/// Outbound side of one peer: a bounded frame queue drained by its own
/// writer task.
struct PeerLink {
    addr: SocketAddr,
    frames: mpsc::Sender<Arc<Vec<u8>>>,
    writer: JoinHandle<()>,
}

impl PeerLink {
    fn spawn(peer: String, addr: SocketAddr) -> Self {
        let (frames, rx) = mpsc::channel(PEER_QUEUE_CAPACITY);
        let writer = tokio::spawn(peer_writer(peer, addr, rx));
        Self {
            addr,
            frames,
            writer,
        }
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        self.writer.abort();
    }
}

/// Networked pub/sub between a fixed set of peer endpoints.
///
/// `publish` only enqueues: each peer has a writer task that owns the
/// connection, so a slow or unreachable peer never holds up the others or
/// the caller.
pub struct TcpTransport {
    node_id: String,
    local_addr: SocketAddr,
    peers: RwLock<HashMap<String, PeerLink>>,
    subscriptions: Subscriptions,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl TcpTransport {
    /// Bind the listener and start accepting peer connections.
    pub async fn bind(node_id: impl Into<String>, listen: SocketAddr) -> Result<Arc<Self>> {
        let node_id = node_id.into();
        let listener = TcpListener::bind(listen)
            .await
            .map_err(|e| LatticeError::Transport(format!("bind {}: {}", listen, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| LatticeError::Transport(e.to_string()))?;
        info!(node_id = %node_id, addr = %local_addr, "tcp transport listening");

        let subscriptions: Subscriptions = Arc::new(RwLock::new(HashMap::new()));
        let task = tokio::spawn(accept_loop(listener, node_id.clone(), subscriptions.clone()));

        Ok(Arc::new(Self {
            node_id,
            local_addr,
            peers: RwLock::new(HashMap::new()),
            subscriptions,
            accept_task: Mutex::new(Some(task)),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Every publish from now on is also pushed to `addr`. Replaces any
    /// earlier link to the same peer. Must be called inside a runtime.
    pub fn add_peer(&self, node_id: impl Into<String>, addr: SocketAddr) {
        let node_id = node_id.into();
        debug!(peer = %node_id, %addr, "tcp peer added");
        let link = PeerLink::spawn(node_id.clone(), addr);
        self.peers.write().insert(node_id, link);
    }

    pub fn remove_peer(&self, node_id: &str) -> bool {
        self.peers.write().remove(node_id).is_some()
    }

    pub fn peers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.peers.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn peer_addr(&self, node_id: &str) -> Option<SocketAddr> {
        self.peers.read().get(node_id).map(|link| link.addr)
    }

    /// Stop accepting connections and stop every peer writer.
    pub fn close(&self) {
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
        self.peers.write().clear();
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn local_id(&self) -> &str {
        &self.node_id
    }

    async fn subscribe(&self, topic: &str, handler: FrameHandler) -> Result<()> {
        self.subscriptions
            .write()
            .entry(topic.to_string())
            .or_default()
            .push(handler);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let frame = serde_json::to_vec(&WireFrame {
            origin: self.node_id.clone(),
            topic: topic.to_string(),
            payload: hex::encode(&payload),
        })?;
        if frame.len() > MAX_FRAME_SIZE {
            return Err(LatticeError::Transport(format!(
                "frame of {} bytes exceeds {}",
                frame.len(),
                MAX_FRAME_SIZE
            )));
        }

        let local = handlers_for(&self.subscriptions, topic);
        dispatch(local, payload).await;

        let frame = Arc::new(frame);
        for (peer, link) in self.peers.read().iter() {
            match link.frames.try_send(Arc::clone(&frame)) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(peer = %peer, "peer queue full, frame dropped")
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    warn!(peer = %peer, "peer writer stopped, frame dropped")
                }
            }
        }
        Ok(())
    }

    async fn unsubscribe_all(&self) -> Result<()> {
        self.subscriptions.write().clear();
        Ok(())
    }
}

fn handlers_for(subscriptions: &Subscriptions, topic: &str) -> Vec<FrameHandler> {
    subscriptions.read().get(topic).cloned().unwrap_or_default()
}

async fn accept_loop(listener: TcpListener, node_id: String, subscriptions: Subscriptions) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                trace!(node_id = %node_id, %addr, "inbound tcp connection");
                tokio::spawn(read_loop(stream, node_id.clone(), subscriptions.clone()));
            }
            Err(e) => {
                warn!(node_id = %node_id, error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn read_loop(mut stream: TcpStream, node_id: String, subscriptions: Subscriptions) {
    loop {
        let bytes = match read_frame(&mut stream).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return,
            Err(e) => {
                debug!(node_id = %node_id, error = %e, "closing tcp connection");
                return;
            }
        };
        let frame: WireFrame = match serde_json::from_slice(&bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(node_id = %node_id, error = %e, "malformed tcp frame");
                continue;
            }
        };
        if frame.origin == node_id {
            continue;
        }
        let payload = match hex::decode(&frame.payload) {
            Ok(p) => p,
            Err(e) => {
                warn!(node_id = %node_id, error = %e, "tcp frame payload is not hex");
                continue;
            }
        };
        let handlers = handlers_for(&subscriptions, &frame.topic);
        if !handlers.is_empty() {
            dispatch(handlers, payload).await;
        }
    }
}

/// Owns the connection to one peer. Connects on the first frame, and after a
/// failed connect drops frames until [`RECONNECT_BACKOFF`] has passed.
async fn peer_writer(peer: String, addr: SocketAddr, mut frames: mpsc::Receiver<Arc<Vec<u8>>>) {
    let mut stream: Option<TcpStream> = None;
    let mut retry_at: Option<Instant> = None;
    while let Some(frame) = frames.recv().await {
        if stream.is_none() {
            if retry_at.is_some_and(|at| Instant::now() < at) {
                trace!(peer = %peer, "peer unreachable, frame dropped");
                continue;
            }
            match connect(addr).await {
                Ok(s) => {
                    debug!(peer = %peer, %addr, "tcp connection established");
                    stream = Some(s);
                    retry_at = None;
                }
                Err(e) => {
                    warn!(peer = %peer, error = %e, "tcp connect failed");
                    retry_at = Some(Instant::now() + RECONNECT_BACKOFF);
                    continue;
                }
            }
        }
        if let Some(s) = stream.as_mut() {
            if let Err(e) = write_frame(s, &frame).await {
                warn!(peer = %peer, error = %e, "tcp write failed");
                stream = None;
            }
        }
    }
    trace!(peer = %peer, "peer writer stopped");
}

async fn connect(addr: SocketAddr) -> Result<TcpStream> {
    tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| LatticeError::Transport(format!("connect to {} timed out", addr)))?
        .map_err(|e| LatticeError::Transport(format!("connect to {}: {}", addr, e)))
}

async fn write_frame(stream: &mut TcpStream, data: &[u8]) -> std::io::Result<()> {
    let len = data.len() as u32;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(data).await?;
    stream.flush().await
}

/// `Ok(None)` on a clean close between frames.
async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame too large: {}", len),
        ));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector() -> (FrameHandler, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = frame_handler(move |bytes| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(bytes);
            }
        });
        (handler, rx)
    }

    #[tokio::test]
    async fn local_bus_respects_links() {
        let bus = LocalBus::new();
        let a = bus.transport("a");
        let b = bus.transport("b");
        let c = bus.transport("c");
        bus.link("a", "b");

        let (hb, mut rb) = collector();
        let (hc, mut rc) = collector();
        b.subscribe("t", hb).await.unwrap();
        c.subscribe("t", hc).await.unwrap();

        a.publish("t", b"hello".to_vec()).await.unwrap();
        assert_eq!(rb.try_recv().unwrap(), b"hello");
        assert!(rc.try_recv().is_err());
        assert!(bus.linked("b", "a"));
        assert!(!bus.linked("a", "c"));
    }

    #[tokio::test]
    async fn local_publish_reaches_own_subscribers() {
        let bus = LocalBus::new();
        let a = bus.transport("a");
        let (h, mut r) = collector();
        a.subscribe("self", h).await.unwrap();
        a.publish("self", vec![1, 2, 3]).await.unwrap();
        assert_eq!(r.try_recv().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn open_bus_and_unsubscribe() {
        let bus = LocalBus::open();
        let a = bus.transport("a");
        let b = bus.transport("b");
        let (h, mut r) = collector();
        b.subscribe("t", h).await.unwrap();
        a.publish("t", vec![7]).await.unwrap();
        assert_eq!(r.try_recv().unwrap(), vec![7]);

        b.unsubscribe_all().await.unwrap();
        a.publish("t", vec![8]).await.unwrap();
        assert!(r.try_recv().is_err());
    }

    #[tokio::test]
    async fn unlink_cuts_delivery() {
        let bus = LocalBus::new();
        let a = bus.transport("a");
        let b = bus.transport("b");
        bus.link("a", "b");
        bus.unlink("b", "a");
        let (h, mut r) = collector();
        b.subscribe("t", h).await.unwrap();
        a.publish("t", vec![1]).await.unwrap();
        assert!(r.try_recv().is_err());
    }

    #[tokio::test]
    async fn tcp_frames_reach_subscribed_peer() {
        let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let a = TcpTransport::bind("a", any).await.unwrap();
        let b = TcpTransport::bind("b", any).await.unwrap();
        a.add_peer("b", b.local_addr());

        let (h, mut r) = collector();
        b.subscribe("lattice/b/directives", h).await.unwrap();

        a.publish("lattice/x/directives", b"ignored".to_vec()).await.unwrap();
        a.publish("lattice/b/directives", b"{\"k\":1}".to_vec()).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(5), r.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, b"{\"k\":1}");
        assert_eq!(a.peers(), vec!["b"]);
        a.close();
        b.close();
    }

    #[tokio::test]
    async fn unreachable_peer_does_not_hold_up_publish() {
        let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let a = TcpTransport::bind("a", any).await.unwrap();
        let b = TcpTransport::bind("b", any).await.unwrap();
        // Bound then dropped: nothing listens there any more.
        let dead = std::net::TcpListener::bind(any).unwrap().local_addr().unwrap();
        a.add_peer("dead", dead);
        a.add_peer("b", b.local_addr());
        assert_eq!(a.peer_addr("dead"), Some(dead));

        let (h, mut r) = collector();
        b.subscribe("t", h).await.unwrap();

        let started = tokio::time::Instant::now();
        for i in 0..50u8 {
            a.publish("t", vec![i]).await.unwrap();
        }
        assert!(started.elapsed() < Duration::from_millis(500));

        for i in 0..50u8 {
            let got = tokio::time::timeout(Duration::from_secs(5), r.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(got, vec![i]);
        }

        assert!(a.remove_peer("dead"));
        assert_eq!(a.peers(), vec!["b"]);
        a.close();
        b.close();
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_refused() {
        let mut data = ((MAX_FRAME_SIZE as u32) + 1).to_be_bytes().to_vec();
        data.extend_from_slice(b"xx");
        let mut reader = &data[..];
        let err = read_frame(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn clean_eof_is_not_an_error() {
        let mut reader: &[u8] = &[];
        assert!(read_frame(&mut reader).await.unwrap().is_none());
    }
}
