//! Aggregating data service across transports
//!
//! The service owns the shared store and one coordinator per transport. All
//! mutations, local and inbound, funnel through it: it applies them to the
//! store, notifies listeners, and decides relay. A mutation that changed
//! local state is relayed on every transport; on the transport it arrived on
//! the origin peer is excluded. Duplicates and rejections are never relayed,
//! which is what terminates gossip floods.

use crate::broadcast::BroadcastResult;
use crate::coordinator::{InboundMutation, TransportCoordinator};
use crate::framing::{Frame, FrameError};
use crate::peer::TransportKind;
use haven_store_core::crypto::{derive_data_id, KeyPair};
use haven_store_core::filter::FilterScope;
use haven_store_core::request::*;
use haven_store_core::store::{DataStore, RejectReason, StoreOutcome};
use haven_store_core::types::*;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Service errors
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Mutation rejected: {0}")]
    Rejected(RejectReason),
    #[error("Core error: {0}")]
    Core(#[from] haven_store_core::Error),
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
}

/// Observer of store changes, local or gossiped.
pub trait DataListener: Send + Sync {
    fn on_record_added(&self, record: &Record);
    fn on_record_removed(&self, record: &Record);
}

/// Broadcast results keyed by transport, returned from local publishes.
pub type PublishResult = HashMap<TransportKind, BroadcastResult>;

/// The node-wide data service.
pub struct DataService {
    store: Arc<DataStore>,
    coordinators: RwLock<HashMap<TransportKind, Arc<TransportCoordinator>>>,
    listeners: RwLock<Vec<Arc<dyn DataListener>>>,
}

impl DataService {
    pub fn new(store: Arc<DataStore>) -> Self {
        Self {
            store,
            coordinators: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn store(&self) -> &Arc<DataStore> {
        &self.store
    }

    /// Live authenticated record data, optionally scoped to one class.
    pub fn authenticated_payloads(&self, scope: FilterScope) -> Vec<AuthenticatedData> {
        self.store.authenticated_payloads(scope)
    }

    /// Attach a transport's coordinator. Later coordinators for the same
    /// kind replace earlier ones.
    pub fn add_transport(&self, coordinator: Arc<TransportCoordinator>) {
        self.coordinators
            .write()
            .insert(coordinator.kind(), coordinator);
    }

    pub fn coordinator(&self, kind: TransportKind) -> Option<Arc<TransportCoordinator>> {
        self.coordinators.read().get(&kind).cloned()
    }

    pub fn add_listener(&self, listener: Arc<dyn DataListener>) {
        self.listeners.write().push(listener);
    }

    fn notify(&self, outcome: &StoreOutcome, request: &MutationRequest) {
        match outcome {
            StoreOutcome::Added => {
                if let Some(record) = request.record() {
                    for listener in self.listeners.read().iter() {
                        listener.on_record_added(&record);
                    }
                }
            }
            StoreOutcome::Removed(record) => {
                for listener in self.listeners.read().iter() {
                    listener.on_record_removed(record);
                }
            }
            _ => {}
        }
    }

    // =========================================================================
    // Local publish API
    // =========================================================================

    /// Apply a locally created mutation and broadcast it on every transport.
    ///
    /// A rejection is an error: the caller built an invalid request. A
    /// duplicate is not: the store already agrees, nothing is sent.
    pub async fn publish(&self, request: MutationRequest) -> Result<PublishResult, ServiceError> {
        let outcome = self.store.apply(&request);
        match &outcome {
            StoreOutcome::Rejected(reason) => {
                return Err(ServiceError::Rejected(reason.clone()));
            }
            StoreOutcome::DuplicateIgnored | StoreOutcome::NotFoundIgnored => {
                debug!(class = %request.class_id(), "local publish was a no-op");
                return Ok(PublishResult::new());
            }
            _ => {}
        }
        self.notify(&outcome, &request);

        let frame = Frame::from_mutation(&request)?;
        let mut results = PublishResult::new();
        let coordinators: Vec<_> = self.coordinators.read().values().cloned().collect();
        for coordinator in coordinators {
            let result = coordinator.broadcast(frame.clone()).await;
            results.insert(coordinator.kind(), result);
        }
        Ok(results)
    }

    /// Publish an authenticated record, picking the next sequence number
    /// from what the store already knows about this identity.
    pub async fn add_authenticated(
        &self,
        payload: AuthenticatedPayload,
        keypair: &KeyPair,
    ) -> Result<PublishResult, ServiceError> {
        let data_id = derive_data_id(&payload)?;
        let seq = self.next_sequence_number(&payload.meta.class_id, &data_id);
        let request = AddAuthenticatedRequest::new(payload, seq, keypair, now_ms())?;
        self.publish(MutationRequest::AddAuthenticated(request)).await
    }

    /// Tombstone one of our authenticated records.
    pub async fn remove_authenticated(
        &self,
        data_id: DataId,
        meta: MetaData,
        keypair: &KeyPair,
    ) -> Result<PublishResult, ServiceError> {
        let seq = self.next_sequence_number(&meta.class_id, &data_id);
        let request = RemoveAuthenticatedRequest::new(data_id, meta, seq, keypair, now_ms());
        self.publish(MutationRequest::RemoveAuthenticated(request))
            .await
    }

    /// Extend the liveness of one of our authenticated records.
    pub async fn refresh_authenticated(
        &self,
        data_id: DataId,
        meta: MetaData,
        keypair: &KeyPair,
    ) -> Result<PublishResult, ServiceError> {
        let seq = self.next_sequence_number(&meta.class_id, &data_id);
        let request = RefreshAuthenticatedRequest::new(data_id, meta, seq, keypair, now_ms());
        self.publish(MutationRequest::RefreshAuthenticated(request))
            .await
    }

    /// Seal a message for a receiver and publish it as a mailbox record.
    pub async fn add_mailbox(
        &self,
        plaintext: &[u8],
        meta: MetaData,
        sender: &KeyPair,
        receiver_pubkey: &Bytes32,
    ) -> Result<PublishResult, ServiceError> {
        let request = AddMailboxRequest::seal(plaintext, meta, 1, sender, receiver_pubkey, now_ms())?;
        self.publish(MutationRequest::AddMailbox(request)).await
    }

    /// Tombstone a mailbox record after pickup. `receiver` must hold the key
    /// the envelope was addressed to.
    pub async fn remove_mailbox(
        &self,
        data_id: DataId,
        meta: MetaData,
        receiver: &KeyPair,
    ) -> Result<PublishResult, ServiceError> {
        let seq = self.next_sequence_number(&meta.class_id, &data_id);
        let request = RemoveMailboxRequest::new(data_id, meta, seq, receiver, now_ms());
        self.publish(MutationRequest::RemoveMailbox(request)).await
    }

    /// Publish an append-only record.
    pub async fn add_append_only(
        &self,
        payload: AppendOnlyPayload,
    ) -> Result<PublishResult, ServiceError> {
        let request = AddAppendOnlyRequest::new(payload, now_ms());
        self.publish(MutationRequest::AddAppendOnly(request)).await
    }

    fn next_sequence_number(&self, class_id: &ClassId, data_id: &DataId) -> u64 {
        self.store.sequence_number(class_id, data_id) + 1
    }

    // =========================================================================
    // Inbound path
    // =========================================================================

    /// Drain inbound mutations from the coordinators until shutdown.
    pub async fn run(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<InboundMutation>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!("data service started");
        loop {
            tokio::select! {
                msg = inbound.recv() => match msg {
                    Some(msg) => self.handle_inbound(msg).await,
                    None => break,
                },
                _ = shutdown.recv() => break,
            }
        }
        info!("data service stopped");
    }

    async fn handle_inbound(&self, msg: InboundMutation) {
        let outcome = self.store.apply(&msg.request);
        if let StoreOutcome::Rejected(reason) = &outcome {
            warn!(
                origin = %msg.origin,
                transport = %msg.transport,
                class = %msg.request.class_id(),
                %reason,
                "inbound mutation rejected"
            );
            return;
        }
        self.notify(&outcome, &msg.request);

        if !outcome.should_relay() || !msg.allow_relay {
            return;
        }

        let frame = match Frame::from_mutation(&msg.request) {
            Ok(frame) => frame,
            Err(e) => {
                // The request decoded from this exact wire form, so this
                // cannot fail in practice
                warn!(error = %e, "could not re-frame mutation for relay");
                return;
            }
        };

        let coordinators: Vec<_> = self.coordinators.read().values().cloned().collect();
        for coordinator in coordinators {
            if coordinator.kind() == msg.transport {
                coordinator.re_broadcast(frame.clone(), msg.origin).await;
            } else {
                coordinator.broadcast(frame.clone()).await;
            }
        }
    }
}
