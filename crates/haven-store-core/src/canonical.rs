//! Canonical encoding for haven-store
//!
//! All hashed/signed objects use postcard serialization. Field order is Rust
//! struct field order, so the structs in [`crate::types`] are the wire truth:
//! two nodes that disagree on a payload's bytes disagree on its identity.

use crate::error::{Error, Result};
use serde::Serialize;

/// Serialize a value to canonical bytes using postcard.
///
/// This is the normative encoding for all hashing and signing operations.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    postcard::to_allocvec(value).map_err(Error::from)
}
