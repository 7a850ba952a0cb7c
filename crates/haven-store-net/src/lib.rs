//! Networking for the HavenMesh data layer
//!
//! This crate provides:
//! - Peer identity and per-transport connection registries
//! - Message framing over length-prefixed frames
//! - Best-effort broadcast with origin exclusion for relays
//! - Inventory request/response reconciliation
//! - The aggregating data service tying store, transports and listeners together

pub mod broadcast;
pub mod coordinator;
pub mod framing;
pub mod inventory;
pub mod peer;
pub mod service;

pub use broadcast::{BroadcastResult, Broadcaster};
pub use coordinator::{CoordinatorConfig, InboundMutation, TransportCoordinator};
pub use framing::{Frame, FrameCodec, FrameType};
pub use inventory::{InventoryRequestTracker, InventoryResponder};
pub use peer::{Connection, ConnectionId, ConnectionRegistry, PeerId, TransportEvent, TransportKind};
pub use service::{DataListener, DataService, ServiceError};
