//! havenstored server - main service loop
//!
//! Wires the store, one clear-net coordinator and the data service together,
//! accepts TCP peers, and runs the background prune and snapshot cycles.
//! Each accepted socket is framed, handshaken with a Hello exchange and then
//! pumped into the coordinator's event channel.

use crate::config::Config;
use crate::storage::{Storage, StorageError};
use futures::{SinkExt, StreamExt};
use haven_store_core::crypto::KeyPair;
use haven_store_core::store::DataStore;
use haven_store_net::coordinator::{CoordinatorConfig, TransportCoordinator};
use haven_store_net::framing::messages::HelloMessage;
use haven_store_net::framing::{Frame, FrameCodec, FrameType};
use haven_store_net::peer::{PeerId, TransportEvent, TransportKind};
use haven_store_net::service::DataService;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::interval;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Handshake failed: {0}")]
    Handshake(String),
    #[error("Frame error: {0}")]
    Frame(#[from] haven_store_net::framing::FrameError),
}

/// Server state
pub struct Server {
    config: Config,
    keypair: KeyPair,
    storage: Arc<Storage>,
    store: Arc<DataStore>,
    service: Arc<DataService>,
    coordinator: Arc<TransportCoordinator>,
    shutdown_tx: broadcast::Sender<()>,
    ready_sent: AtomicBool,
}

impl Server {
    /// Create a new server instance, restoring the store from disk.
    pub fn new(config: Config) -> Result<Self, ServerError> {
        let storage = Arc::new(Storage::open(&config.data_dir)?);
        let keypair = KeyPair::from_seed(&storage.keypair_seed()?);

        let store = Arc::new(DataStore::new());
        let snapshot = storage.load_snapshot()?;
        let persisted = snapshot.entries.len();
        store.restore(snapshot);
        info!(
            persisted,
            restored = store.len(),
            "store restored from snapshot"
        );

        let coordinator = Arc::new(TransportCoordinator::new(
            TransportKind::Clear,
            store.clone(),
            CoordinatorConfig {
                send_timeout: Duration::from_secs(config.broadcast_timeout_secs),
                inventory_timeout: Duration::from_secs(config.inventory_timeout_secs),
                max_inventory_items: config.max_inventory_items,
            },
        ));
        let service = Arc::new(DataService::new(store.clone()));
        service.add_transport(coordinator.clone());

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            keypair,
            storage,
            store,
            service,
            coordinator,
            shutdown_tx,
            ready_sent: AtomicBool::new(false),
        })
    }

    /// Our peer id on the wire.
    pub fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(&self.keypair.public_key())
    }

    pub fn service(&self) -> &Arc<DataService> {
        &self.service
    }

    /// Run the server until shutdown.
    pub async fn run(self: Arc<Self>) -> Result<(), ServerError> {
        info!(listen = %self.config.listen, peer = %self.peer_id(), "starting havenstored");

        let (event_tx, event_rx) = mpsc::channel(1024);
        let (inbound_tx, inbound_rx) = mpsc::channel(1024);

        tokio::spawn(self.coordinator.clone().run(
            event_rx,
            inbound_tx,
            self.shutdown_tx.subscribe(),
        ));
        tokio::spawn(
            self.service
                .clone()
                .run(inbound_rx, self.shutdown_tx.subscribe()),
        );

        let prune_handle = self.spawn_prune_task();
        let snapshot_handle = self.spawn_snapshot_task();

        for addr in self.config.bootstrap.clone() {
            let server = self.clone();
            let event_tx = event_tx.clone();
            tokio::spawn(async move {
                if let Err(e) = server.connect_peer(addr, event_tx).await {
                    warn!(%addr, error = %e, "bootstrap connection failed");
                }
            });
        }

        let listener = TcpListener::bind(&self.config.listen).await?;
        info!(listen = %self.config.listen, "listening");

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            debug!(%addr, "accepted connection");
                            let server = self.clone();
                            let event_tx = event_tx.clone();
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, event_tx).await {
                                    warn!(%addr, error = %e, "connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "accept error");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("shutting down");
                    break;
                }
            }
        }

        prune_handle.abort();
        snapshot_handle.abort();

        // Final snapshot so the next start sees everything
        self.storage.save_snapshot(&self.store.snapshot())?;
        self.storage.flush()?;

        Ok(())
    }

    /// Handle an accepted inbound connection.
    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        event_tx: mpsc::Sender<TransportEvent>,
    ) -> Result<(), ServerError> {
        let framed = Framed::new(stream, FrameCodec::new());
        let (framed, peer) = self.handshake(framed).await?;
        self.run_peer(framed, peer, event_tx, false).await;
        Ok(())
    }

    /// Dial a bootstrap peer. The first bootstrap connection marks the peer
    /// group ready and triggers the initial inventory round.
    async fn connect_peer(
        self: Arc<Self>,
        addr: SocketAddr,
        event_tx: mpsc::Sender<TransportEvent>,
    ) -> Result<(), ServerError> {
        let stream = TcpStream::connect(addr).await?;
        let framed = Framed::new(stream, FrameCodec::new());
        let (framed, peer) = self.handshake(framed).await?;
        info!(%addr, %peer, "connected to bootstrap peer");

        self.run_peer(framed, peer, event_tx, true).await;
        Ok(())
    }

    /// Exchange Hello frames; both sides send first, then read.
    async fn handshake(
        &self,
        mut framed: Framed<TcpStream, FrameCodec>,
    ) -> Result<(Framed<TcpStream, FrameCodec>, PeerId), ServerError> {
        let hello = HelloMessage {
            public_key: self.keypair.public_key(),
        };
        framed.send(hello.to_frame()?).await?;

        let frame = match framed.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => return Err(e.into()),
            None => return Err(ServerError::Handshake("connection closed".into())),
        };
        if frame.frame_type != FrameType::Hello {
            return Err(ServerError::Handshake(format!(
                "expected hello, got {:?}",
                frame.frame_type
            )));
        }
        let peer_hello = HelloMessage::from_frame(&frame)?;
        Ok((framed, PeerId::from_public_key(&peer_hello.public_key)))
    }

    /// Pump a handshaken connection: registry registration, writer task and
    /// the read loop feeding the coordinator.
    async fn run_peer(
        &self,
        framed: Framed<TcpStream, FrameCodec>,
        peer: PeerId,
        event_tx: mpsc::Sender<TransportEvent>,
        announce_ready: bool,
    ) {
        let (frame_tx, mut frame_rx) = mpsc::channel::<Frame>(256);
        let conn = self.coordinator.registry().register(peer, frame_tx);
        let connection = conn.id;

        let _ = event_tx
            .send(TransportEvent::PeerConnected { connection, peer })
            .await;

        // Ready only once the connection is in the registry, so the initial
        // inventory round has a peer to ask.
        if announce_ready && !self.ready_sent.swap(true, Ordering::SeqCst) {
            let _ = event_tx.send(TransportEvent::Ready).await;
        }

        let (mut sink, mut stream) = framed.split();

        // Writer: drains the connection's frame channel onto the socket.
        // Ends when the coordinator drops the connection from its registry.
        let writer = tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                if let Err(e) = sink.send(frame).await {
                    debug!(error = %e, "write failed");
                    break;
                }
            }
        });

        while let Some(result) = stream.next().await {
            match result {
                Ok(frame) => {
                    if event_tx
                        .send(TransportEvent::FrameReceived {
                            connection,
                            peer,
                            frame,
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => {
                    warn!(%peer, error = %e, "read failed");
                    break;
                }
            }
        }

        let _ = event_tx
            .send(TransportEvent::PeerDisconnected { connection, peer })
            .await;
        writer.abort();
    }

    fn spawn_prune_task(&self) -> tokio::task::JoinHandle<()> {
        let store = self.store.clone();
        let interval_secs = self.config.prune_interval_secs;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(interval_secs));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let purged = store.prune_expired();
                        if purged > 0 {
                            info!(purged, "pruned expired records");
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }

    fn spawn_snapshot_task(&self) -> tokio::task::JoinHandle<()> {
        let store = self.store.clone();
        let storage = self.storage.clone();
        let interval_secs = self.config.snapshot_interval_secs;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(interval_secs));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match storage.save_snapshot(&store.snapshot()) {
                            Ok(()) => debug!(entries = storage.entry_count(), "snapshot saved"),
                            Err(e) => error!(error = %e, "snapshot failed"),
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }

    /// Shutdown the server
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get server statistics
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            peer_count: self.coordinator.registry().len(),
            record_count: self.store.len(),
            persisted_count: self.storage.entry_count(),
        }
    }
}

/// Server statistics
#[derive(Debug, Clone)]
pub struct ServerStats {
    pub peer_count: usize,
    pub record_count: usize,
    pub persisted_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use haven_store_core::request::{AddAuthenticatedRequest, MutationRequest};
    use haven_store_core::types::*;
    use tempfile::tempdir;

    fn test_config(data_dir: std::path::PathBuf) -> Config {
        Config {
            listen: "127.0.0.1:0".parse().unwrap(),
            data_dir,
            bootstrap: vec![],
            max_inventory_items: 100,
            broadcast_timeout_secs: 1,
            inventory_timeout_secs: 1,
            prune_interval_secs: 600,
            snapshot_interval_secs: 300,
            verbose: false,
            log_format: "pretty".to_string(),
        }
    }

    #[test]
    fn test_server_creation() {
        let dir = tempdir().unwrap();
        let server = Server::new(test_config(dir.path().into())).unwrap();

        assert_eq!(server.stats().peer_count, 0);
        assert_eq!(server.stats().record_count, 0);
    }

    #[test]
    fn test_peer_id_stable_across_restarts() {
        let dir = tempdir().unwrap();
        let id1 = Server::new(test_config(dir.path().into()))
            .unwrap()
            .peer_id();
        let id2 = Server::new(test_config(dir.path().into()))
            .unwrap()
            .peer_id();
        assert_eq!(id1, id2);
    }

    #[tokio::test]
    async fn bootstrap_ready_follows_registration() {
        let dir = tempdir().unwrap();
        let server = Arc::new(Server::new(test_config(dir.path().into())).unwrap());

        // Fake bootstrap peer: answers the Hello exchange, then idles.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, FrameCodec::new());
            let hello = HelloMessage {
                public_key: KeyPair::from_seed(&[9; 32]).public_key(),
            };
            framed.send(hello.to_frame().unwrap()).await.unwrap();
            let _ = framed.next().await;
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let (event_tx, mut event_rx) = mpsc::channel(16);
        {
            let server = server.clone();
            tokio::spawn(async move {
                let _ = server.connect_peer(addr, event_tx).await;
            });
        }

        // The connection must be registered before the catch-up trigger, or
        // the inventory round would find nobody to ask.
        assert!(matches!(
            event_rx.recv().await.unwrap(),
            TransportEvent::PeerConnected { .. }
        ));
        assert_eq!(server.stats().peer_count, 1);
        assert!(matches!(
            event_rx.recv().await.unwrap(),
            TransportEvent::Ready
        ));
    }

    #[test]
    fn test_store_restored_on_start() {
        let dir = tempdir().unwrap();
        let kp = KeyPair::from_seed(&[1; 32]);

        {
            let storage = Storage::open(dir.path()).unwrap();
            let store = DataStore::new();
            let payload = AuthenticatedPayload {
                data: b"persisted-offer".to_vec(),
                meta: MetaData {
                    class_id: ClassId::new("offer"),
                    ttl_ms: 600_000,
                    max_records: 100,
                },
            };
            store.apply(&MutationRequest::AddAuthenticated(
                AddAuthenticatedRequest::new(payload, 1, &kp, now_ms()).unwrap(),
            ));
            storage.save_snapshot(&store.snapshot()).unwrap();
            storage.flush().unwrap();
        }

        let server = Server::new(test_config(dir.path().into())).unwrap();
        assert_eq!(server.stats().record_count, 1);
    }
}
