//! HavenStore Core Library
//!
//! This crate provides the record model, validation rules and replicated
//! store for the HavenMesh data layer.
//!
//! # Modules
//!
//! - [`types`]: Record model (DataId, ClassId, AuthenticatedData, etc.)
//! - [`canonical`]: Deterministic serialization for hashing/signing
//! - [`crypto`]: Hash derivations, signatures and mailbox sealing
//! - [`request`]: Wire-level mutation requests
//! - [`store`]: Class-partitioned store with sequence-number validation
//! - [`filter`]: Filters and inventory batches for reconciliation
//! - [`error`]: Error types

pub mod canonical;
pub mod crypto;
pub mod error;
pub mod filter;
pub mod request;
pub mod store;
pub mod types;

#[cfg(test)]
mod test_vectors;

pub use error::{Error, Result};
pub use types::*;
