//! Peer identity, transports and connection registry

use crate::framing::{Frame, FrameError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Unique peer identifier (derived from transport public key)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(pub [u8; 32]);

impl PeerId {
    /// Create from transport public key
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        Self(*public_key)
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// Transport a connection runs over. Each kind gets its own coordinator;
/// gossip on one transport never assumes reachability on another.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    /// Plain TCP/IP
    Clear,
    /// Tor-style onion transport
    Onion,
    /// I2P-style garlic transport
    Garlic,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransportKind::Clear => "clear",
            TransportKind::Onion => "onion",
            TransportKind::Garlic => "garlic",
        };
        write!(f, "{s}")
    }
}

/// Identifier of one connection, unique within a node's lifetime. A peer that
/// reconnects gets a fresh id, which is what lets per-connection state be
/// disposed without races.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Connection errors
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Connection closed")]
    Closed,
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
}

/// Outbound half of a connection to a peer. The frame sink is an mpsc channel
/// drained by the transport's writer task.
pub struct Connection {
    pub id: ConnectionId,
    pub peer: PeerId,
    tx: mpsc::Sender<Frame>,
    open: AtomicBool,
}

impl Connection {
    pub fn new(id: ConnectionId, peer: PeerId, tx: mpsc::Sender<Frame>) -> Self {
        Self {
            id,
            peer,
            tx,
            open: AtomicBool::new(true),
        }
    }

    /// Send a frame to this peer
    pub async fn send(&self, frame: Frame) -> Result<(), ConnectionError> {
        if !self.is_open() {
            return Err(ConnectionError::Closed);
        }
        self.tx
            .send(frame)
            .await
            .map_err(|_| ConnectionError::Closed)
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
    }
}

/// Live connections of one transport.
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Register a new connection and hand out its id.
    pub fn register(&self, peer: PeerId, tx: mpsc::Sender<Frame>) -> Arc<Connection> {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let conn = Arc::new(Connection::new(id, peer, tx));
        self.connections.write().insert(id, conn.clone());
        conn
    }

    /// Drop a connection, marking it closed first.
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let conn = self.connections.write().remove(&id);
        if let Some(c) = &conn {
            c.close();
        }
        conn
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.read().get(&id).cloned()
    }

    /// All open connections.
    pub fn list(&self) -> Vec<Arc<Connection>> {
        self.connections
            .read()
            .values()
            .filter(|c| c.is_open())
            .cloned()
            .collect()
    }

    /// Open connections for a peer (usually one, but reconnects can overlap).
    pub fn by_peer(&self, peer: PeerId) -> Vec<Arc<Connection>> {
        self.connections
            .read()
            .values()
            .filter(|c| c.peer == peer && c.is_open())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }
}

/// Event from a transport's accept/read loops.
#[derive(Debug)]
pub enum TransportEvent {
    /// New peer connected
    PeerConnected { connection: ConnectionId, peer: PeerId },
    /// Peer disconnected; per-connection state must be disposed
    PeerDisconnected { connection: ConnectionId, peer: PeerId },
    /// Frame received from a peer
    FrameReceived {
        connection: ConnectionId,
        peer: PeerId,
        frame: Frame,
    },
    /// Enough peers are connected for an initial inventory round
    Ready,
}
