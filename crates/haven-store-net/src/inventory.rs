//! Inventory request/response handling
//!
//! An inventory round is how a node catches up after connecting: it sends a
//! filter describing what it holds, and the peer answers with the requests
//! the filter is missing. One request may be in flight per connection; the
//! pending slot is disposed when the connection closes, so a response from a
//! dead connection can never complete a newer request.

use crate::framing::messages::{InventoryRequestMessage, InventoryResponseMessage};
use crate::peer::{Connection, ConnectionId};
use haven_store_core::filter::{FilterScope, Inventory};
use haven_store_core::store::DataStore;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

/// Inventory exchange errors
#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("Inventory request timed out")]
    Timeout,
    #[error("Connection closed before the response arrived")]
    ConnectionClosed,
    #[error("A request is already pending on this connection")]
    AlreadyPending,
    #[error("Frame error: {0}")]
    Frame(#[from] crate::framing::FrameError),
    #[error("Connection error: {0}")]
    Connection(#[from] crate::peer::ConnectionError),
}

/// Result of one inventory round against a peer.
#[derive(Debug)]
pub struct InventoryResult {
    pub inventory: Inventory,
    pub elapsed_ms: u64,
}

/// Answers inventory requests from our own store.
pub struct InventoryResponder {
    store: Arc<DataStore>,
    /// Upper bound on items per response, regardless of what the requester asks for
    max_items: usize,
}

impl InventoryResponder {
    pub fn new(store: Arc<DataStore>, max_items: usize) -> Self {
        Self { store, max_items }
    }

    pub fn handle(&self, request: &InventoryRequestMessage) -> InventoryResponseMessage {
        let limit = (request.max_items as usize).min(self.max_items);
        let inventory = self.store.diff(&request.filter, limit);
        InventoryResponseMessage { inventory }
    }
}

/// Tracks in-flight inventory requests, keyed by connection id.
pub struct InventoryRequestTracker {
    pending: Mutex<HashMap<ConnectionId, oneshot::Sender<InventoryResponseMessage>>>,
}

impl Default for InventoryRequestTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl InventoryRequestTracker {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Route a response to whoever is waiting on this connection. A response
    /// nobody asked for is dropped.
    pub fn complete(&self, connection: ConnectionId, response: InventoryResponseMessage) {
        if let Some(tx) = self.pending.lock().remove(&connection) {
            let _ = tx.send(response);
        } else {
            debug!(%connection, "unsolicited inventory response dropped");
        }
    }

    /// Dispose the pending request for a closed connection; the waiter gets
    /// `ConnectionClosed`.
    pub fn dispose(&self, connection: ConnectionId) {
        self.pending.lock().remove(&connection);
    }

    pub fn dispose_all(&self) {
        self.pending.lock().clear();
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Run one inventory round: compute our filter, send it, await the diff.
    pub async fn request(
        &self,
        connection: &Connection,
        store: &DataStore,
        scope: FilterScope,
        max_items: u32,
        timeout: Duration,
    ) -> Result<InventoryResult, InventoryError> {
        let started = Instant::now();

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            if pending.contains_key(&connection.id) {
                return Err(InventoryError::AlreadyPending);
            }
            pending.insert(connection.id, tx);
        }

        let message = InventoryRequestMessage {
            filter: store.compute_filter(scope),
            max_items,
        };
        let frame = match message.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                self.dispose(connection.id);
                return Err(e.into());
            }
        };
        if let Err(e) = connection.send(frame).await {
            self.dispose(connection.id);
            return Err(e.into());
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(InventoryResult {
                inventory: response.inventory,
                elapsed_ms: started.elapsed().as_millis() as u64,
            }),
            Ok(Err(_)) => Err(InventoryError::ConnectionClosed),
            Err(_) => {
                self.dispose(connection.id);
                Err(InventoryError::Timeout)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::FrameType;
    use crate::peer::{ConnectionRegistry, PeerId};
    use haven_store_core::crypto::KeyPair;
    use haven_store_core::request::{AddAuthenticatedRequest, MutationRequest};
    use haven_store_core::types::*;
    use tokio::sync::mpsc;

    fn add_req(data: &[u8], kp: &KeyPair) -> MutationRequest {
        let payload = AuthenticatedPayload {
            data: data.to_vec(),
            meta: MetaData {
                class_id: ClassId::new("offer"),
                ttl_ms: 600_000,
                max_records: 100,
            },
        };
        MutationRequest::AddAuthenticated(
            AddAuthenticatedRequest::new(payload, 1, kp, now_ms()).unwrap(),
        )
    }

    #[test]
    fn responder_serves_diff_within_bound() {
        let kp = KeyPair::from_seed(&[1; 32]);
        let store = Arc::new(DataStore::new());
        for i in 0u8..4 {
            store.apply(&add_req(&[i], &kp));
        }

        let responder = InventoryResponder::new(store.clone(), 3);
        let request = InventoryRequestMessage {
            filter: haven_store_core::filter::DataFilter::empty(FilterScope::All),
            max_items: 100,
        };

        let response = responder.handle(&request);
        assert_eq!(response.inventory.requests.len(), 3);
        assert_eq!(response.inventory.num_dropped, 1);
    }

    #[tokio::test]
    async fn request_resolves_on_completion() {
        let kp = KeyPair::from_seed(&[1; 32]);
        let store = Arc::new(DataStore::new());
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::channel(4);
        let conn = registry.register(PeerId([1; 32]), tx);

        let tracker = Arc::new(InventoryRequestTracker::new());
        let responder_store = Arc::new(DataStore::new());
        responder_store.apply(&add_req(b"remote", &kp));
        let responder = InventoryResponder::new(responder_store, 100);

        // Simulated peer: read the request frame, answer through the tracker
        let tracker2 = tracker.clone();
        let conn_id = conn.id;
        tokio::spawn(async move {
            let frame = rx.recv().await.unwrap();
            assert_eq!(frame.frame_type, FrameType::InventoryRequest);
            let request = InventoryRequestMessage::from_frame(&frame).unwrap();
            tracker2.complete(conn_id, responder.handle(&request));
        });

        let result = tracker
            .request(&conn, &store, FilterScope::All, 100, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(result.inventory.requests.len(), 1);
        assert_eq!(tracker.pending_count(), 0);
    }

    #[tokio::test]
    async fn request_times_out_and_disposes() {
        let store = Arc::new(DataStore::new());
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(4);
        let conn = registry.register(PeerId([1; 32]), tx);

        let tracker = InventoryRequestTracker::new();
        let err = tracker
            .request(
                &conn,
                &store,
                FilterScope::All,
                100,
                Duration::from_millis(20),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, InventoryError::Timeout));
        assert_eq!(tracker.pending_count(), 0);
    }

    #[tokio::test]
    async fn only_one_request_per_connection() {
        let store = Arc::new(DataStore::new());
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(4);
        let conn = registry.register(PeerId([1; 32]), tx);

        let tracker = Arc::new(InventoryRequestTracker::new());
        let (slot, _keep) = oneshot::channel();
        tracker.pending.lock().insert(conn.id, slot);

        let err = tracker
            .request(&conn, &store, FilterScope::All, 100, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, InventoryError::AlreadyPending));
    }
}
