//! Live connections owned by this process.
//!
//! A [`ConnectionHandle`] is the push side of one WebSocket: it serializes
//! outbound frames onto the socket task, tracks acknowledgments the server is
//! waiting for, and holds the connection's subscription table (the
//! counterparts whose status and notices it receives). The [`Hub`] resolves
//! the handle ids stored in the presence registry back to handles.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use uuid::Uuid;

use parley_shared::protocol::{AckReply, ServerEvent, ServerFrame};
use parley_shared::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(pub Uuid);

impl HandleId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for HandleId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for HandleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub struct ConnectionHandle {
    id: HandleId,
    user: UserId,
    outbound: mpsc::UnboundedSender<ServerFrame>,
    pending_acks: Mutex<HashMap<u64, oneshot::Sender<AckReply>>>,
    next_ack: AtomicU64,
    closed: AtomicBool,
    /// Flipped once the connect-time resynchronization has finished.
    synced: watch::Sender<bool>,
    rooms: RwLock<HashSet<UserId>>,
}

impl ConnectionHandle {
    pub fn new(user: UserId, outbound: mpsc::UnboundedSender<ServerFrame>) -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            id: HandleId::new(),
            user,
            outbound,
            pending_acks: Mutex::new(HashMap::new()),
            next_ack: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            synced,
            rooms: RwLock::new(HashSet::new()),
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Fire-and-forget push. Returns `false` if the socket is gone.
    pub fn emit(&self, event: ServerEvent) -> bool {
        if self.is_closed() {
            return false;
        }
        self.outbound
            .send(ServerFrame::Event { ack: None, event })
            .is_ok()
    }

    /// Push an event and wait for the client's acknowledgment.
    ///
    /// Returns `None` when the timeout elapses or the connection closes
    /// first.
    pub async fn emit_with_ack(&self, event: ServerEvent, timeout: Duration) -> Option<AckReply> {
        if self.is_closed() {
            return None;
        }

        let ack_id = self.next_ack.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending_acks.lock().await.insert(ack_id, tx);

        let frame = ServerFrame::Event {
            ack: Some(ack_id),
            event,
        };
        if self.outbound.send(frame).is_err() {
            self.pending_acks.lock().await.remove(&ack_id);
            return None;
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Some(reply),
            Ok(Err(_)) => None,
            Err(_) => {
                self.pending_acks.lock().await.remove(&ack_id);
                None
            }
        }
    }

    /// Route a client acknowledgment to the push waiting for it. Late or
    /// unknown ids are dropped.
    pub async fn resolve_ack(&self, ack_id: u64, reply: AckReply) {
        match self.pending_acks.lock().await.remove(&ack_id) {
            Some(waiter) => {
                let _ = waiter.send(reply);
            }
            None => tracing::debug!(ack = ack_id, user = %self.user, "ignoring late acknowledgment"),
        }
    }

    /// Answer one of the client's own requests.
    pub fn reply(&self, ack_id: u64, reply: AckReply) {
        let _ = self.outbound.send(ServerFrame::Ack { id: ack_id, reply });
    }

    /// Stop accepting pushes and fail every outstanding acknowledgment wait.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.pending_acks.lock().await.clear();
        self.synced.send_replace(true);
    }

    // ------------------------------------------------------------------
    // Resync gate
    // ------------------------------------------------------------------

    pub fn mark_synced(&self) {
        self.synced.send_replace(true);
    }

    /// Wait until the connect-time resynchronization has finished.
    pub async fn wait_synced(&self) {
        let mut rx = self.synced.subscribe();
        let _ = rx.wait_for(|synced| *synced).await;
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    pub async fn join(&self, peer: &UserId) {
        self.rooms.write().await.insert(peer.clone());
    }

    pub async fn leave(&self, peer: &UserId) {
        self.rooms.write().await.remove(peer);
    }

    pub async fn is_subscribed(&self, peer: &UserId) -> bool {
        self.rooms.read().await.contains(peer)
    }

    pub async fn subscriptions(&self) -> Vec<UserId> {
        self.rooms.read().await.iter().cloned().collect()
    }
}

/// Handles of the connections living in this process.
#[derive(Default)]
pub struct Hub {
    connections: RwLock<HashMap<HandleId, Arc<ConnectionHandle>>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, handle: Arc<ConnectionHandle>) {
        self.connections.write().await.insert(handle.id(), handle);
    }

    pub async fn unregister(&self, id: HandleId) {
        self.connections.write().await.remove(&id);
    }

    pub async fn get(&self, id: HandleId) -> Option<Arc<ConnectionHandle>> {
        self.connections.read().await.get(&id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }
}
