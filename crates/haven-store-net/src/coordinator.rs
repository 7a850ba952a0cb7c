//! Per-transport coordination of gossip and inventory traffic
//!
//! One coordinator runs per transport. It owns that transport's connection
//! registry, answers inventory requests from the shared store, and forwards
//! decoded mutations to the aggregating service. Malformed frames from a peer
//! are logged and dropped; they never take the coordinator down.

use crate::broadcast::{BroadcastResult, Broadcaster};
use crate::framing::messages::{HelloMessage, InventoryRequestMessage, InventoryResponseMessage};
use crate::framing::{Frame, FrameType};
use crate::inventory::{InventoryError, InventoryRequestTracker, InventoryResponder, InventoryResult};
use crate::peer::{Connection, ConnectionId, ConnectionRegistry, PeerId, TransportEvent, TransportKind};
use haven_store_core::filter::FilterScope;
use haven_store_core::request::MutationRequest;
use haven_store_core::store::DataStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, trace, warn};

/// A mutation decoded from the wire, tagged with where it came from so the
/// service can relay it everywhere except back to its origin.
#[derive(Debug)]
pub struct InboundMutation {
    pub request: MutationRequest,
    pub origin: PeerId,
    pub transport: TransportKind,
    /// False for catch-up traffic (inventory responses), which must not be
    /// re-broadcast
    pub allow_relay: bool,
}

/// Tuning knobs for a coordinator.
#[derive(Clone, Copy, Debug)]
pub struct CoordinatorConfig {
    pub send_timeout: Duration,
    pub inventory_timeout: Duration,
    pub max_inventory_items: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(5),
            inventory_timeout: Duration::from_secs(30),
            max_inventory_items: 10_000,
        }
    }
}

/// Coordinator for one transport.
pub struct TransportCoordinator {
    kind: TransportKind,
    registry: Arc<ConnectionRegistry>,
    broadcaster: Broadcaster,
    tracker: InventoryRequestTracker,
    responder: InventoryResponder,
    store: Arc<DataStore>,
    config: CoordinatorConfig,
}

impl TransportCoordinator {
    pub fn new(kind: TransportKind, store: Arc<DataStore>, config: CoordinatorConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        Self {
            kind,
            broadcaster: Broadcaster::new(registry.clone(), config.send_timeout),
            tracker: InventoryRequestTracker::new(),
            responder: InventoryResponder::new(store.clone(), config.max_inventory_items as usize),
            registry,
            store,
            config,
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Fan a frame out to every connected peer on this transport.
    pub async fn broadcast(&self, frame: Frame) -> BroadcastResult {
        self.broadcaster.broadcast(frame).await
    }

    /// Fan a frame out, skipping the peer it arrived from.
    pub async fn re_broadcast(&self, frame: Frame, exclude: PeerId) -> BroadcastResult {
        self.broadcaster.re_broadcast(frame, exclude).await
    }

    /// Run one inventory round against a single peer.
    pub async fn request_inventory(
        &self,
        connection: &Connection,
        scope: FilterScope,
    ) -> Result<InventoryResult, InventoryError> {
        self.tracker
            .request(
                connection,
                &self.store,
                scope,
                self.config.max_inventory_items,
                self.config.inventory_timeout,
            )
            .await
    }

    /// Event loop: runs until the transport's event channel closes or
    /// shutdown is signalled.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<TransportEvent>,
        inbound_tx: mpsc::Sender<InboundMutation>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!(transport = %self.kind, "coordinator started");
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event, &inbound_tx).await,
                    None => break,
                },
                _ = shutdown.recv() => break,
            }
        }
        self.tracker.dispose_all();
        info!(transport = %self.kind, "coordinator stopped");
    }

    async fn handle_event(
        self: &Arc<Self>,
        event: TransportEvent,
        inbound_tx: &mpsc::Sender<InboundMutation>,
    ) {
        match event {
            TransportEvent::PeerConnected { connection, peer } => {
                debug!(transport = %self.kind, %connection, %peer, "peer connected");
            }
            TransportEvent::PeerDisconnected { connection, peer } => {
                debug!(transport = %self.kind, %connection, %peer, "peer disconnected");
                self.tracker.dispose(connection);
                self.registry.remove(connection);
            }
            TransportEvent::FrameReceived {
                connection,
                peer,
                frame,
            } => {
                self.handle_frame(connection, peer, frame, inbound_tx).await;
            }
            TransportEvent::Ready => {
                debug!(transport = %self.kind, "transport ready, starting inventory round");
                // Responses come back through this same event loop, so the
                // catch-up must not block it.
                let this = Arc::clone(self);
                let inbound_tx = inbound_tx.clone();
                tokio::spawn(async move { this.initial_sync(&inbound_tx).await });
            }
        }
    }

    async fn handle_frame(
        &self,
        connection: ConnectionId,
        peer: PeerId,
        frame: Frame,
        inbound_tx: &mpsc::Sender<InboundMutation>,
    ) {
        match frame.frame_type {
            FrameType::Ping => {
                self.reply(connection, Frame::pong()).await;
            }
            FrameType::Pong => {
                trace!(transport = %self.kind, %peer, "pong");
            }
            FrameType::Hello => match HelloMessage::from_frame(&frame) {
                Ok(hello) => {
                    debug!(
                        transport = %self.kind,
                        %peer,
                        key = %hex::encode(&hello.public_key[..8]),
                        "hello"
                    );
                }
                Err(e) => warn!(%peer, error = %e, "malformed hello frame"),
            },
            FrameType::AddData | FrameType::RemoveData | FrameType::RefreshData => {
                match frame.mutation() {
                    Ok(request) => {
                        let inbound = InboundMutation {
                            request,
                            origin: peer,
                            transport: self.kind,
                            allow_relay: true,
                        };
                        if inbound_tx.send(inbound).await.is_err() {
                            warn!(transport = %self.kind, "inbound channel closed, dropping mutation");
                        }
                    }
                    Err(e) => warn!(%peer, error = %e, "malformed mutation frame"),
                }
            }
            FrameType::InventoryRequest => match InventoryRequestMessage::from_frame(&frame) {
                Ok(request) => {
                    let response = self.responder.handle(&request);
                    debug!(
                        transport = %self.kind,
                        %peer,
                        served = response.inventory.requests.len(),
                        dropped = response.inventory.num_dropped,
                        "inventory request served"
                    );
                    match response.to_frame() {
                        Ok(reply) => self.reply(connection, reply).await,
                        Err(e) => warn!(error = %e, "inventory response too large to frame"),
                    }
                }
                Err(e) => warn!(%peer, error = %e, "malformed inventory request"),
            },
            FrameType::InventoryResponse => match InventoryResponseMessage::from_frame(&frame) {
                Ok(response) => self.tracker.complete(connection, response),
                Err(e) => warn!(%peer, error = %e, "malformed inventory response"),
            },
        }
    }

    async fn reply(&self, connection: ConnectionId, frame: Frame) {
        if let Some(conn) = self.registry.get(connection) {
            if let Err(e) = conn.send(frame).await {
                debug!(%connection, error = %e, "reply failed");
            }
        }
    }

    /// Catch-up round against every connected peer. Results are applied
    /// through the same inbound path as gossip, but with relay suppressed:
    /// inventory data is already old news to the network.
    async fn initial_sync(&self, inbound_tx: &mpsc::Sender<InboundMutation>) {
        for conn in self.registry.list() {
            match self.request_inventory(&conn, FilterScope::All).await {
                Ok(result) => {
                    debug!(
                        transport = %self.kind,
                        peer = %conn.peer,
                        received = result.inventory.requests.len(),
                        dropped = result.inventory.num_dropped,
                        elapsed_ms = result.elapsed_ms,
                        "inventory round complete"
                    );
                    for request in result.inventory.requests {
                        let inbound = InboundMutation {
                            request,
                            origin: conn.peer,
                            transport: self.kind,
                            allow_relay: false,
                        };
                        if inbound_tx.send(inbound).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    warn!(transport = %self.kind, peer = %conn.peer, error = %e, "inventory round failed");
                }
            }
        }
    }
}
