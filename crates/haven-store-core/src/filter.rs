//! Data filters and inventory batches for reconciliation
//!
//! A filter is a compact listing of what the requester already holds; the
//! responder answers with the requests the filter is missing. Tombstones are
//! listed too, so removals propagate to peers that were offline when the
//! remove was gossiped.

use crate::types::{ClassId, DataId};
use crate::request::MutationRequest;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One known identity with the freshest sequence number the requester holds.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FilterEntry {
    pub data_id: DataId,
    pub sequence_number: u64,
}

/// Scope of a filter or inventory exchange.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum FilterScope {
    /// All classes
    All,
    /// One class partition
    Class(ClassId),
}

/// Compact representation of a store's contents, sufficient for a peer to
/// diff against.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DataFilter {
    pub scope: FilterScope,
    pub entries: Vec<FilterEntry>,
}

impl DataFilter {
    pub fn empty(scope: FilterScope) -> Self {
        Self {
            scope,
            entries: Vec::new(),
        }
    }

    /// Index the entries for O(1) lookup during diffing.
    pub fn to_map(&self) -> HashMap<DataId, u64> {
        self.entries
            .iter()
            .map(|e| (e.data_id, e.sequence_number))
            .collect()
    }
}

/// A bounded batch of mutation requests answering a filter.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Inventory {
    pub requests: Vec<MutationRequest>,
    /// How many matching requests were cut by the response bound. A non-zero
    /// value tells the requester another round may be worthwhile.
    pub num_dropped: u32,
}

impl Inventory {
    pub fn empty() -> Self {
        Self {
            requests: Vec::new(),
            num_dropped: 0,
        }
    }
}
