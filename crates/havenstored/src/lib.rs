//! havenstored - HavenMesh Replicated Data Store Daemon
//!
//! This daemon provides:
//! - The class-partitioned replicated store with snapshot persistence
//! - Gossip broadcast and relay over clear-net TCP
//! - Inventory reconciliation with bootstrap peers
//! - Background pruning of expired records

pub mod config;
pub mod server;
pub mod storage;

pub use config::Config;
pub use server::Server;
pub use storage::Storage;
