//! Class-partitioned replicated store
//!
//! The store is the single authority on what a node currently holds. Every
//! mutation, local or gossiped, goes through [`DataStore::apply`], and the
//! returned outcome is what drives listener notification and relay: duplicate
//! and not-found outcomes suppress re-broadcast, which is what breaks gossip
//! loops without any extra bookkeeping.
//!
//! Each class partition has its own lock; classes are independent, so there
//! is no global lock.

use crate::crypto::receiver_key_digest;
use crate::filter::{DataFilter, FilterEntry, FilterScope, Inventory};
use crate::request::{MutationRequest, RefreshAuthenticatedRequest};
use crate::types::*;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

// =============================================================================
// OUTCOMES
// =============================================================================

/// Why a mutation was rejected. Rejections are reported, never silently
/// dropped, so the caller can decide whether to log or penalize the source.
/// A rejected request is never relayed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RejectReason {
    /// Signature does not verify against the embedded public key
    InvalidSignature,
    /// Sequence number not strictly greater than the stored one (replay)
    StaleSequenceNumber,
    /// Record's time-to-live has already elapsed
    Expired,
    /// Mutation signed by a key that does not own the stored record
    OwnerMismatch,
    /// Mutation kind does not fit the stored record kind
    KindMismatch,
    /// Payload could not be canonically encoded
    MalformedPayload,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RejectReason::InvalidSignature => "invalid signature",
            RejectReason::StaleSequenceNumber => "stale sequence number",
            RejectReason::Expired => "expired",
            RejectReason::OwnerMismatch => "owner mismatch",
            RejectReason::KindMismatch => "kind mismatch",
            RejectReason::MalformedPayload => "malformed payload",
        };
        write!(f, "{s}")
    }
}

/// Result of applying a mutation request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreOutcome {
    /// Record inserted; listeners should be notified and the request relayed
    Added,
    /// Record tombstoned; carries the removed record for listeners
    Removed(Record),
    /// Liveness extended and sequence number advanced
    Refreshed,
    /// Identity already present with equal or fresher state; no-op
    DuplicateIgnored,
    /// Nothing to remove or refresh; no-op (a remove still records the
    /// sequence number so a late add cannot resurrect the identity)
    NotFoundIgnored,
    /// Validation failed; never relay
    Rejected(RejectReason),
}

impl StoreOutcome {
    /// Whether the mutation changed local state and is worth relaying.
    pub fn should_relay(&self) -> bool {
        matches!(
            self,
            StoreOutcome::Added | StoreOutcome::Removed(_) | StoreOutcome::Refreshed
        )
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, StoreOutcome::Rejected(_))
    }
}

// =============================================================================
// ENTRIES
// =============================================================================

/// What a partition slot holds for one identity.
///
/// A live entry keeps the original add request (so inventory responses can
/// ship it with a verifiable signature) plus the freshest refresh, if any. A
/// tombstone keeps the remove request for the same reason.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
enum StoredEntry {
    Live {
        request: MutationRequest,
        refresh: Option<RefreshAuthenticatedRequest>,
        recorded_at_ms: u64,
    },
    Tombstone {
        request: MutationRequest,
        recorded_at_ms: u64,
    },
}

impl StoredEntry {
    fn live(request: MutationRequest, now_ms: u64) -> Self {
        StoredEntry::Live {
            request,
            refresh: None,
            recorded_at_ms: now_ms,
        }
    }

    fn tombstone(request: MutationRequest, now_ms: u64) -> Self {
        StoredEntry::Tombstone {
            request,
            recorded_at_ms: now_ms,
        }
    }

    fn is_tombstone(&self) -> bool {
        matches!(self, StoredEntry::Tombstone { .. })
    }

    /// Freshest sequence number known for this identity.
    fn sequence_number(&self) -> u64 {
        match self {
            StoredEntry::Live { request, refresh, .. } => refresh
                .as_ref()
                .map(|r| r.sequence_number)
                .unwrap_or(0)
                .max(request.sequence_number()),
            StoredEntry::Tombstone { request, .. } => request.sequence_number(),
        }
    }

    /// Start of the current TTL window. A refresh restarts it.
    fn created_at_ms(&self) -> u64 {
        match self {
            StoredEntry::Live { request, refresh, .. } => refresh
                .as_ref()
                .map(|r| r.created_at_ms)
                .unwrap_or_else(|| request.created_at_ms()),
            StoredEntry::Tombstone { recorded_at_ms, .. } => *recorded_at_ms,
        }
    }

    fn ttl_ms(&self) -> u64 {
        match self {
            StoredEntry::Live { request, .. } => request.meta().ttl_ms,
            StoredEntry::Tombstone { request, .. } => request.meta().ttl_ms,
        }
    }

    /// Logically absent? Expired entries must never be served or relayed,
    /// even while they still occupy storage. A tombstone guards resurrection
    /// for at least its record's TTL, measured from when it was recorded.
    fn is_expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.created_at_ms()) > self.ttl_ms()
    }

    fn recorded_at_ms(&self) -> u64 {
        match self {
            StoredEntry::Live { recorded_at_ms, .. } => *recorded_at_ms,
            StoredEntry::Tombstone { recorded_at_ms, .. } => *recorded_at_ms,
        }
    }

    /// Wire requests reproducing this entry on a peer.
    fn requests(&self) -> Vec<MutationRequest> {
        match self {
            StoredEntry::Live { request, refresh, .. } => {
                let mut out = vec![request.clone()];
                if let Some(r) = refresh {
                    out.push(MutationRequest::RefreshAuthenticated(r.clone()));
                }
                out
            }
            StoredEntry::Tombstone { request, .. } => vec![request.clone()],
        }
    }

    /// The record this entry holds, with the refreshed sequence number
    /// applied, if it is live.
    fn record(&self) -> Option<Record> {
        match self {
            StoredEntry::Live { request, refresh, .. } => {
                let mut record = request.record()?;
                if let (Record::Authenticated(data), Some(r)) = (&mut record, refresh) {
                    data.sequence_number = r.sequence_number;
                    data.created_at_ms = r.created_at_ms;
                }
                Some(record)
            }
            StoredEntry::Tombstone { .. } => None,
        }
    }
}

// =============================================================================
// EVICTION
// =============================================================================

/// Pluggable policy deciding which identity to drop when a class partition
/// exceeds its capacity bound.
pub trait EvictionPolicy: Send + Sync {
    fn select_victim(&self, entries: &HashMap<DataId, SlotView>) -> Option<DataId>;
}

/// Read-only view of a slot handed to eviction policies.
#[derive(Clone, Copy, Debug)]
pub struct SlotView {
    pub is_tombstone: bool,
    pub recorded_at_ms: u64,
    pub sequence_number: u64,
}

/// Default policy: drop the entry recorded longest ago.
pub struct EvictOldest;

impl EvictionPolicy for EvictOldest {
    fn select_victim(&self, entries: &HashMap<DataId, SlotView>) -> Option<DataId> {
        entries
            .iter()
            .min_by_key(|(id, slot)| (slot.recorded_at_ms, **id))
            .map(|(id, _)| *id)
    }
}

// =============================================================================
// STORE
// =============================================================================

struct ClassPartition {
    entries: Mutex<HashMap<DataId, StoredEntry>>,
}

impl ClassPartition {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

/// Persistable image of a store, for the persistence collaborator.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub entries: Vec<SnapshotEntry>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub request: MutationRequest,
    pub refresh: Option<RefreshAuthenticatedRequest>,
    pub recorded_at_ms: u64,
}

/// Authoritative, class-partitioned holder of records with validation.
pub struct DataStore {
    partitions: RwLock<HashMap<ClassId, Arc<ClassPartition>>>,
    eviction: Arc<dyn EvictionPolicy>,
}

impl Default for DataStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DataStore {
    pub fn new() -> Self {
        Self::with_eviction_policy(Arc::new(EvictOldest))
    }

    pub fn with_eviction_policy(eviction: Arc<dyn EvictionPolicy>) -> Self {
        Self {
            partitions: RwLock::new(HashMap::new()),
            eviction,
        }
    }

    fn partition(&self, class_id: &ClassId) -> Arc<ClassPartition> {
        if let Some(p) = self.partitions.read().get(class_id) {
            return p.clone();
        }
        let mut partitions = self.partitions.write();
        partitions
            .entry(class_id.clone())
            .or_insert_with(|| Arc::new(ClassPartition::new()))
            .clone()
    }

    fn partitions_for(&self, scope: &FilterScope) -> Vec<(ClassId, Arc<ClassPartition>)> {
        let partitions = self.partitions.read();
        match scope {
            FilterScope::All => partitions
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            FilterScope::Class(class_id) => partitions
                .get(class_id)
                .map(|p| vec![(class_id.clone(), p.clone())])
                .unwrap_or_default(),
        }
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Apply any mutation request, dispatching on its kind.
    pub fn apply(&self, request: &MutationRequest) -> StoreOutcome {
        self.apply_at(request, now_ms())
    }

    /// Apply with an explicit clock, for deterministic tests.
    pub fn apply_at(&self, request: &MutationRequest, now_ms: u64) -> StoreOutcome {
        match request {
            MutationRequest::AddAuthenticated(_)
            | MutationRequest::AddMailbox(_)
            | MutationRequest::AddAppendOnly(_) => self.add_at(request, now_ms),
            MutationRequest::RemoveAuthenticated(_) | MutationRequest::RemoveMailbox(_) => {
                self.remove_at(request, now_ms)
            }
            MutationRequest::RefreshAuthenticated(_) => self.refresh_at(request, now_ms),
        }
    }

    pub fn add(&self, request: &MutationRequest) -> StoreOutcome {
        self.add_at(request, now_ms())
    }

    pub fn add_at(&self, request: &MutationRequest, now_ms: u64) -> StoreOutcome {
        if !request.is_add() {
            return StoreOutcome::Rejected(RejectReason::KindMismatch);
        }
        if request.verify().is_err() {
            warn!(class = %request.class_id(), "invalid signature at add");
            return StoreOutcome::Rejected(RejectReason::InvalidSignature);
        }
        if request.is_expired(now_ms) {
            debug!(class = %request.class_id(), "expired at add");
            return StoreOutcome::Rejected(RejectReason::Expired);
        }
        let data_id = match request.data_id() {
            Ok(id) => id,
            Err(_) => return StoreOutcome::Rejected(RejectReason::MalformedPayload),
        };

        let partition = self.partition(request.class_id());
        let mut entries = partition.entries.lock();

        match entries.get(&data_id) {
            None => {}
            Some(entry) if entry.is_tombstone() => {
                // Resurrection gate: the tombstone's sequence number blocks
                // stale re-adds for as long as it lives.
                if !entry.is_expired(now_ms)
                    && request.sequence_number() <= entry.sequence_number()
                {
                    return StoreOutcome::Rejected(RejectReason::StaleSequenceNumber);
                }
            }
            Some(entry) => {
                // Append-only: first add wins, everything after is a no-op.
                if matches!(request, MutationRequest::AddAppendOnly(_)) {
                    return StoreOutcome::DuplicateIgnored;
                }
                if let (
                    StoredEntry::Live {
                        request: MutationRequest::AddAuthenticated(stored),
                        ..
                    },
                    MutationRequest::AddAuthenticated(incoming),
                ) = (entry, request)
                {
                    if stored.data.owner_key != incoming.data.owner_key {
                        return StoreOutcome::Rejected(RejectReason::OwnerMismatch);
                    }
                }
                // Same rule for mailbox: the envelope pins the identity, so a
                // re-add under another sender key is a forgery.
                if let (
                    StoredEntry::Live {
                        request: MutationRequest::AddMailbox(stored),
                        ..
                    },
                    MutationRequest::AddMailbox(incoming),
                ) = (entry, request)
                {
                    if stored.data.sender_key != incoming.data.sender_key {
                        return StoreOutcome::Rejected(RejectReason::OwnerMismatch);
                    }
                }
                let stored_seq = entry.sequence_number();
                if request.sequence_number() < stored_seq {
                    return StoreOutcome::Rejected(RejectReason::StaleSequenceNumber);
                }
                if request.sequence_number() == stored_seq {
                    return StoreOutcome::DuplicateIgnored;
                }
                // Fresher state for an identity we already hold: keep it, but
                // this is still a duplicate as far as listeners and relay go.
                entries.insert(data_id, StoredEntry::live(request.clone(), now_ms));
                return StoreOutcome::DuplicateIgnored;
            }
        }

        entries.insert(data_id, StoredEntry::live(request.clone(), now_ms));
        self.enforce_capacity(&mut entries, request.meta().max_records as usize);
        StoreOutcome::Added
    }

    pub fn remove(&self, request: &MutationRequest) -> StoreOutcome {
        self.remove_at(request, now_ms())
    }

    pub fn remove_at(&self, request: &MutationRequest, now_ms: u64) -> StoreOutcome {
        if !request.is_remove() {
            return StoreOutcome::Rejected(RejectReason::KindMismatch);
        }
        if request.verify().is_err() {
            warn!(class = %request.class_id(), "invalid signature at remove");
            return StoreOutcome::Rejected(RejectReason::InvalidSignature);
        }
        let data_id = match request.data_id() {
            Ok(id) => id,
            Err(_) => return StoreOutcome::Rejected(RejectReason::MalformedPayload),
        };

        let partition = self.partition(request.class_id());
        let mut entries = partition.entries.lock();

        let outcome = match entries.get(&data_id) {
            None => {
                // We never saw the add, but a stale one may still arrive:
                // keep the sequence number around as a tombstone.
                entries.insert(data_id, StoredEntry::tombstone(request.clone(), now_ms));
                StoreOutcome::NotFoundIgnored
            }
            Some(entry) if entry.is_tombstone() => {
                if request.sequence_number() > entry.sequence_number() {
                    entries.insert(data_id, StoredEntry::tombstone(request.clone(), now_ms));
                }
                StoreOutcome::NotFoundIgnored
            }
            Some(entry) => match (entry, request) {
                (
                    StoredEntry::Live {
                        request: MutationRequest::AddAuthenticated(stored),
                        ..
                    },
                    MutationRequest::RemoveAuthenticated(remove),
                ) => {
                    if remove.sequence_number <= entry.sequence_number() {
                        return StoreOutcome::Rejected(RejectReason::StaleSequenceNumber);
                    }
                    if remove.owner_key != stored.data.owner_key {
                        warn!(class = %request.class_id(), %data_id, "remove signed by non-owner");
                        return StoreOutcome::Rejected(RejectReason::OwnerMismatch);
                    }
                    let record = Record::Authenticated(stored.data.clone());
                    entries.insert(data_id, StoredEntry::tombstone(request.clone(), now_ms));
                    StoreOutcome::Removed(record)
                }
                (
                    StoredEntry::Live {
                        request: MutationRequest::AddMailbox(stored),
                        ..
                    },
                    MutationRequest::RemoveMailbox(remove),
                ) => {
                    if remove.sequence_number <= entry.sequence_number() {
                        return StoreOutcome::Rejected(RejectReason::StaleSequenceNumber);
                    }
                    // Only the addressee may remove a mailbox record.
                    if receiver_key_digest(&remove.receiver_key)
                        != stored.data.envelope.receiver_key_digest
                    {
                        warn!(class = %request.class_id(), %data_id, "mailbox remove by non-recipient");
                        return StoreOutcome::Rejected(RejectReason::OwnerMismatch);
                    }
                    let record = Record::Mailbox(stored.data.clone());
                    entries.insert(data_id, StoredEntry::tombstone(request.clone(), now_ms));
                    StoreOutcome::Removed(record)
                }
                (
                    StoredEntry::Live {
                        request: MutationRequest::AddAppendOnly(_),
                        ..
                    },
                    _,
                ) => StoreOutcome::NotFoundIgnored,
                _ => StoreOutcome::Rejected(RejectReason::KindMismatch),
            },
        };
        outcome
    }

    pub fn refresh(&self, request: &MutationRequest) -> StoreOutcome {
        self.refresh_at(request, now_ms())
    }

    pub fn refresh_at(&self, request: &MutationRequest, now_ms: u64) -> StoreOutcome {
        let MutationRequest::RefreshAuthenticated(refresh) = request else {
            return StoreOutcome::Rejected(RejectReason::KindMismatch);
        };
        if request.verify().is_err() {
            warn!(class = %request.class_id(), "invalid signature at refresh");
            return StoreOutcome::Rejected(RejectReason::InvalidSignature);
        }
        if request.is_expired(now_ms) {
            return StoreOutcome::Rejected(RejectReason::Expired);
        }

        let partition = self.partition(request.class_id());
        let mut entries = partition.entries.lock();

        match entries.get_mut(&refresh.data_id) {
            None | Some(StoredEntry::Tombstone { .. }) => StoreOutcome::NotFoundIgnored,
            Some(StoredEntry::Live {
                request: stored,
                refresh: slot,
                ..
            }) => {
                let MutationRequest::AddAuthenticated(add) = stored else {
                    return StoreOutcome::Rejected(RejectReason::KindMismatch);
                };
                let current_seq = slot
                    .as_ref()
                    .map(|r| r.sequence_number)
                    .unwrap_or(0)
                    .max(add.data.sequence_number);
                if refresh.sequence_number <= current_seq {
                    return StoreOutcome::Rejected(RejectReason::StaleSequenceNumber);
                }
                if refresh.owner_key != add.data.owner_key {
                    return StoreOutcome::Rejected(RejectReason::OwnerMismatch);
                }
                *slot = Some(refresh.clone());
                StoreOutcome::Refreshed
            }
        }
    }

    fn enforce_capacity(&self, entries: &mut HashMap<DataId, StoredEntry>, max_records: usize) {
        if max_records == 0 {
            return;
        }
        while entries.len() > max_records {
            let view: HashMap<DataId, SlotView> = entries
                .iter()
                .map(|(id, e)| {
                    (
                        *id,
                        SlotView {
                            is_tombstone: e.is_tombstone(),
                            recorded_at_ms: e.recorded_at_ms(),
                            sequence_number: e.sequence_number(),
                        },
                    )
                })
                .collect();
            match self.eviction.select_victim(&view) {
                Some(victim) => {
                    debug!(%victim, "evicting record over capacity bound");
                    entries.remove(&victim);
                }
                None => break,
            }
        }
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    pub fn compute_filter(&self, scope: FilterScope) -> DataFilter {
        self.compute_filter_at(scope, now_ms())
    }

    /// Compact listing of everything we hold (including tombstones, so peers
    /// do not resend what we removed). Expired entries are excluded.
    pub fn compute_filter_at(&self, scope: FilterScope, now_ms: u64) -> DataFilter {
        let mut filter_entries = Vec::new();
        for (_, partition) in self.partitions_for(&scope) {
            let entries = partition.entries.lock();
            for (data_id, entry) in entries.iter() {
                if entry.is_expired(now_ms) {
                    continue;
                }
                filter_entries.push(FilterEntry {
                    data_id: *data_id,
                    sequence_number: entry.sequence_number(),
                });
            }
        }
        DataFilter {
            scope,
            entries: filter_entries,
        }
    }

    pub fn diff(&self, filter: &DataFilter, max_items: usize) -> Inventory {
        self.diff_at(filter, max_items, now_ms())
    }

    /// Everything we hold that the filter is missing or holds with a lower
    /// sequence number, bounded by `max_items`. Sorted by identity so
    /// successive rounds against the same store are stable.
    pub fn diff_at(&self, filter: &DataFilter, max_items: usize, now_ms: u64) -> Inventory {
        let known = filter.to_map();
        let mut matched: Vec<(DataId, Vec<MutationRequest>)> = Vec::new();

        for (_, partition) in self.partitions_for(&filter.scope) {
            let entries = partition.entries.lock();
            for (data_id, entry) in entries.iter() {
                if entry.is_expired(now_ms) {
                    continue;
                }
                let wanted = match known.get(data_id) {
                    None => true,
                    Some(&seq) => entry.sequence_number() > seq,
                };
                if wanted {
                    matched.push((*data_id, entry.requests()));
                }
            }
        }

        matched.sort_by_key(|(id, _)| *id);

        let total: usize = matched.iter().map(|(_, reqs)| reqs.len()).sum();
        let mut requests = Vec::new();
        for (_, reqs) in matched {
            if requests.len() + reqs.len() > max_items {
                break;
            }
            requests.extend(reqs);
        }
        let num_dropped = (total - requests.len()) as u32;

        Inventory {
            requests,
            num_dropped,
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Freshest sequence number known for an identity, zero when unknown.
    /// Local publishers use this to pick the next number.
    pub fn sequence_number(&self, class_id: &ClassId, data_id: &DataId) -> u64 {
        let partition = self.partition(class_id);
        let entries = partition.entries.lock();
        entries.get(data_id).map(|e| e.sequence_number()).unwrap_or(0)
    }

    /// Live, non-expired record for an identity.
    pub fn get(&self, class_id: &ClassId, data_id: &DataId) -> Option<Record> {
        self.get_at(class_id, data_id, now_ms())
    }

    pub fn get_at(&self, class_id: &ClassId, data_id: &DataId, now_ms: u64) -> Option<Record> {
        let partition = self.partition(class_id);
        let entries = partition.entries.lock();
        entries
            .get(data_id)
            .filter(|e| !e.is_expired(now_ms))
            .and_then(|e| e.record())
    }

    /// All live, non-expired authenticated payloads, optionally scoped to one
    /// class. This is the synchronous read API for higher layers.
    pub fn authenticated_payloads(&self, scope: FilterScope) -> Vec<AuthenticatedData> {
        self.records_at(scope, now_ms())
            .into_iter()
            .filter_map(|record| match record {
                Record::Authenticated(data) => Some(data),
                _ => None,
            })
            .collect()
    }

    /// All live, non-expired records in scope.
    pub fn records_at(&self, scope: FilterScope, now_ms: u64) -> Vec<Record> {
        let mut out = Vec::new();
        for (_, partition) in self.partitions_for(&scope) {
            let entries = partition.entries.lock();
            for entry in entries.values() {
                if entry.is_expired(now_ms) {
                    continue;
                }
                if let Some(record) = entry.record() {
                    out.push(record);
                }
            }
        }
        out
    }

    /// Mailbox records addressed to the given receiver key digest.
    pub fn mailbox_records(&self, digest: &Bytes32) -> Vec<MailboxData> {
        self.records_at(FilterScope::All, now_ms())
            .into_iter()
            .filter_map(|record| match record {
                Record::Mailbox(data) if &data.envelope.receiver_key_digest == digest => Some(data),
                _ => None,
            })
            .collect()
    }

    pub fn class_ids(&self) -> Vec<ClassId> {
        self.partitions.read().keys().cloned().collect()
    }

    /// Total number of slots, live and tombstoned, expired or not.
    pub fn len(&self) -> usize {
        self.partitions
            .read()
            .values()
            .map(|p| p.entries.lock().len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // =========================================================================
    // Maintenance & persistence
    // =========================================================================

    /// Physically drop expired entries. Returns how many were purged.
    pub fn prune_expired(&self) -> usize {
        self.prune_expired_at(now_ms())
    }

    pub fn prune_expired_at(&self, now_ms: u64) -> usize {
        let mut purged = 0;
        for (_, partition) in self.partitions_for(&FilterScope::All) {
            let mut entries = partition.entries.lock();
            let before = entries.len();
            entries.retain(|_, entry| !entry.is_expired(now_ms));
            purged += before - entries.len();
        }
        purged
    }

    /// Image of the full store for the persistence collaborator.
    pub fn snapshot(&self) -> StoreSnapshot {
        let mut out = Vec::new();
        for (_, partition) in self.partitions_for(&FilterScope::All) {
            let entries = partition.entries.lock();
            for entry in entries.values() {
                let (request, refresh, recorded_at_ms) = match entry {
                    StoredEntry::Live {
                        request,
                        refresh,
                        recorded_at_ms,
                    } => (request.clone(), refresh.clone(), *recorded_at_ms),
                    StoredEntry::Tombstone {
                        request,
                        recorded_at_ms,
                    } => (request.clone(), None, *recorded_at_ms),
                };
                out.push(SnapshotEntry {
                    request,
                    refresh,
                    recorded_at_ms,
                });
            }
        }
        StoreSnapshot { entries: out }
    }

    /// Seed the store from a snapshot before any network activity. Entries
    /// come from our own disk, so signatures are not re-verified; expired
    /// entries are dropped on the way in.
    pub fn restore(&self, snapshot: StoreSnapshot) {
        self.restore_at(snapshot, now_ms())
    }

    pub fn restore_at(&self, snapshot: StoreSnapshot, now_ms: u64) {
        for item in snapshot.entries {
            let Ok(data_id) = item.request.data_id() else {
                continue;
            };
            let entry = if item.request.is_remove() {
                StoredEntry::Tombstone {
                    request: item.request,
                    recorded_at_ms: item.recorded_at_ms,
                }
            } else {
                StoredEntry::Live {
                    request: item.request,
                    refresh: item.refresh,
                    recorded_at_ms: item.recorded_at_ms,
                }
            };
            if entry.is_expired(now_ms) {
                continue;
            }
            let partition = self.partition(&match &entry {
                StoredEntry::Live { request, .. } => request.class_id().clone(),
                StoredEntry::Tombstone { request, .. } => request.class_id().clone(),
            });
            partition.entries.lock().insert(data_id, entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::request::*;

    const NOW: u64 = 1_000_000;

    fn meta(class: &str, ttl_ms: u64, max_records: u32) -> MetaData {
        MetaData {
            class_id: ClassId::new(class),
            ttl_ms,
            max_records,
        }
    }

    fn offer_meta() -> MetaData {
        meta("offer", 600_000, 100)
    }

    fn payload(data: &[u8]) -> AuthenticatedPayload {
        AuthenticatedPayload {
            data: data.to_vec(),
            meta: offer_meta(),
        }
    }

    fn add_req(data: &[u8], seq: u64, kp: &KeyPair) -> MutationRequest {
        MutationRequest::AddAuthenticated(
            AddAuthenticatedRequest::new(payload(data), seq, kp, NOW).unwrap(),
        )
    }

    fn remove_req(data: &[u8], seq: u64, kp: &KeyPair) -> MutationRequest {
        let id = crate::crypto::derive_data_id(&payload(data)).unwrap();
        MutationRequest::RemoveAuthenticated(RemoveAuthenticatedRequest::new(
            id,
            offer_meta(),
            seq,
            kp,
            NOW,
        ))
    }

    fn refresh_req(data: &[u8], seq: u64, kp: &KeyPair) -> MutationRequest {
        let id = crate::crypto::derive_data_id(&payload(data)).unwrap();
        MutationRequest::RefreshAuthenticated(RefreshAuthenticatedRequest::new(
            id,
            offer_meta(),
            seq,
            kp,
            NOW + 1,
        ))
    }

    #[test]
    fn add_is_idempotent() {
        let store = DataStore::new();
        let kp = KeyPair::from_seed(&[1; 32]);
        let req = add_req(b"offer-1", 1, &kp);

        assert_eq!(store.apply_at(&req, NOW), StoreOutcome::Added);
        assert_eq!(store.apply_at(&req, NOW), StoreOutcome::DuplicateIgnored);
        assert_eq!(store.records_at(FilterScope::All, NOW).len(), 1);
    }

    #[test]
    fn remove_requires_fresher_sequence_number() {
        let store = DataStore::new();
        let kp = KeyPair::from_seed(&[1; 32]);

        store.apply_at(&add_req(b"offer-1", 5, &kp), NOW);

        assert_eq!(
            store.apply_at(&remove_req(b"offer-1", 5, &kp), NOW),
            StoreOutcome::Rejected(RejectReason::StaleSequenceNumber)
        );
        assert!(matches!(
            store.apply_at(&remove_req(b"offer-1", 6, &kp), NOW),
            StoreOutcome::Removed(Record::Authenticated(_))
        ));
    }

    #[test]
    fn refresh_requires_fresher_sequence_number() {
        let store = DataStore::new();
        let kp = KeyPair::from_seed(&[1; 32]);

        store.apply_at(&add_req(b"offer-1", 2, &kp), NOW);

        assert_eq!(
            store.apply_at(&refresh_req(b"offer-1", 2, &kp), NOW),
            StoreOutcome::Rejected(RejectReason::StaleSequenceNumber)
        );
        assert_eq!(
            store.apply_at(&refresh_req(b"offer-1", 3, &kp), NOW),
            StoreOutcome::Refreshed
        );

        let id = crate::crypto::derive_data_id(&payload(b"offer-1")).unwrap();
        assert_eq!(store.sequence_number(&ClassId::new("offer"), &id), 3);
    }

    #[test]
    fn tombstone_blocks_resurrection() {
        let store = DataStore::new();
        let kp = KeyPair::from_seed(&[1; 32]);

        store.apply_at(&add_req(b"offer-1", 1, &kp), NOW);
        assert!(matches!(
            store.apply_at(&remove_req(b"offer-1", 2, &kp), NOW),
            StoreOutcome::Removed(_)
        ));

        // Re-add with a sequence number at or below the tombstone's
        assert_eq!(
            store.apply_at(&add_req(b"offer-1", 1, &kp), NOW),
            StoreOutcome::Rejected(RejectReason::StaleSequenceNumber)
        );
        assert_eq!(
            store.apply_at(&add_req(b"offer-1", 2, &kp), NOW),
            StoreOutcome::Rejected(RejectReason::StaleSequenceNumber)
        );
        // A genuinely newer add may resurrect
        assert_eq!(
            store.apply_at(&add_req(b"offer-1", 3, &kp), NOW),
            StoreOutcome::Added
        );
    }

    #[test]
    fn remove_before_add_leaves_sequence_tracking_tombstone() {
        let store = DataStore::new();
        let kp = KeyPair::from_seed(&[1; 32]);

        assert_eq!(
            store.apply_at(&remove_req(b"offer-1", 4, &kp), NOW),
            StoreOutcome::NotFoundIgnored
        );
        // The late add at an older sequence number must not land
        assert_eq!(
            store.apply_at(&add_req(b"offer-1", 3, &kp), NOW),
            StoreOutcome::Rejected(RejectReason::StaleSequenceNumber)
        );
    }

    #[test]
    fn remove_by_non_owner_rejected() {
        let store = DataStore::new();
        let owner = KeyPair::from_seed(&[1; 32]);
        let attacker = KeyPair::from_seed(&[2; 32]);

        store.apply_at(&add_req(b"offer-1", 1, &owner), NOW);

        assert_eq!(
            store.apply_at(&remove_req(b"offer-1", 2, &attacker), NOW),
            StoreOutcome::Rejected(RejectReason::OwnerMismatch)
        );
    }

    #[test]
    fn append_only_is_never_removed() {
        let store = DataStore::new();
        let req = MutationRequest::AddAppendOnly(AddAppendOnlyRequest::new(
            AppendOnlyPayload {
                data: b"witness".to_vec(),
                meta: meta("witness", 600_000, 100),
            },
            NOW,
        ));

        assert_eq!(store.apply_at(&req, NOW), StoreOutcome::Added);
        assert_eq!(store.apply_at(&req, NOW), StoreOutcome::DuplicateIgnored);
    }

    #[test]
    fn expired_records_are_invisible() {
        let store = DataStore::new();
        let kp = KeyPair::from_seed(&[1; 32]);
        let req = add_req(b"offer-1", 1, &kp);

        store.apply_at(&req, NOW);

        let later = NOW + 600_001;
        assert!(store.records_at(FilterScope::All, later).is_empty());
        assert!(store
            .compute_filter_at(FilterScope::All, later)
            .entries
            .is_empty());
        let empty = DataFilter::empty(FilterScope::All);
        assert!(store.diff_at(&empty, 100, later).requests.is_empty());
        // Still physically present until pruned
        assert_eq!(store.len(), 1);
        assert_eq!(store.prune_expired_at(later), 1);
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn expired_add_rejected() {
        let store = DataStore::new();
        let kp = KeyPair::from_seed(&[1; 32]);
        let req = add_req(b"offer-1", 1, &kp);

        assert_eq!(
            store.apply_at(&req, NOW + 600_001),
            StoreOutcome::Rejected(RejectReason::Expired)
        );
    }

    #[test]
    fn mailbox_remove_only_by_recipient() {
        let store = DataStore::new();
        let sender = KeyPair::from_seed(&[1; 32]);
        let receiver_signing = KeyPair::from_seed(&[3; 32]);
        let stranger = KeyPair::from_seed(&[4; 32]);

        let m = meta("mailbox", 60_000, 100);

        // Removal is authorized by whoever holds the key the envelope was
        // addressed to: the digest of the remover's key must match the
        // envelope's receiver digest.
        let add = AddMailboxRequest::seal(
            b"hi",
            m.clone(),
            1,
            &sender,
            &receiver_signing.public_key(),
            NOW,
        )
        .unwrap();
        let id = MutationRequest::AddMailbox(add.clone()).data_id().unwrap();
        assert_eq!(
            store.apply_at(&MutationRequest::AddMailbox(add), NOW),
            StoreOutcome::Added
        );

        let bad = MutationRequest::RemoveMailbox(RemoveMailboxRequest::new(
            id,
            m.clone(),
            2,
            &stranger,
            NOW,
        ));
        assert_eq!(
            store.apply_at(&bad, NOW),
            StoreOutcome::Rejected(RejectReason::OwnerMismatch)
        );

        let good = MutationRequest::RemoveMailbox(RemoveMailboxRequest::new(
            id,
            m,
            2,
            &receiver_signing,
            NOW,
        ));
        assert!(matches!(
            store.apply_at(&good, NOW),
            StoreOutcome::Removed(Record::Mailbox(_))
        ));
    }

    #[test]
    fn recipient_can_open_then_remove() {
        let store = DataStore::new();
        let sender = KeyPair::from_seed(&[1; 32]);
        let receiver = KeyPair::from_seed(&[3; 32]);
        let m = meta("mailbox", 60_000, 100);

        let add =
            AddMailboxRequest::seal(b"hi", m.clone(), 1, &sender, &receiver.public_key(), NOW)
                .unwrap();
        let envelope = add.data.envelope.clone();
        let id = MutationRequest::AddMailbox(add.clone()).data_id().unwrap();
        assert_eq!(
            store.apply_at(&MutationRequest::AddMailbox(add), NOW),
            StoreOutcome::Added
        );

        // One keypair does the whole pickup: decrypt the envelope, then sign
        // the remove the store accepts.
        assert_eq!(
            crate::crypto::open_envelope(&envelope, &receiver).unwrap(),
            b"hi"
        );
        let remove =
            MutationRequest::RemoveMailbox(RemoveMailboxRequest::new(id, m, 2, &receiver, NOW));
        assert!(matches!(
            store.apply_at(&remove, NOW),
            StoreOutcome::Removed(Record::Mailbox(_))
        ));
    }

    #[test]
    fn mailbox_readd_by_other_sender_rejected() {
        let store = DataStore::new();
        let sender = KeyPair::from_seed(&[1; 32]);
        let receiver = KeyPair::from_seed(&[3; 32]);
        let imposter = KeyPair::from_seed(&[4; 32]);
        let m = meta("mailbox", 60_000, 100);

        let add =
            AddMailboxRequest::seal(b"hi", m.clone(), 1, &sender, &receiver.public_key(), NOW)
                .unwrap();
        let envelope = add.data.envelope.clone();
        let id = MutationRequest::AddMailbox(add.clone()).data_id().unwrap();
        assert_eq!(
            store.apply_at(&MutationRequest::AddMailbox(add), NOW),
            StoreOutcome::Added
        );

        // Same envelope re-signed by someone else at a higher sequence number
        // must not displace the stored entry.
        let forged = AddMailboxRequest::new(envelope, m, 9, &imposter, NOW).unwrap();
        assert_eq!(
            store.apply_at(&MutationRequest::AddMailbox(forged), NOW),
            StoreOutcome::Rejected(RejectReason::OwnerMismatch)
        );
        assert_eq!(store.sequence_number(&ClassId::new("mailbox"), &id), 1);
    }

    #[test]
    fn capacity_bound_evicts_oldest() {
        let store = DataStore::new();
        let kp = KeyPair::from_seed(&[1; 32]);
        let m = meta("offer", 600_000, 2);

        for (i, t) in [(0u8, NOW), (1, NOW + 1), (2, NOW + 2)] {
            let req = MutationRequest::AddAuthenticated(
                AddAuthenticatedRequest::new(
                    AuthenticatedPayload {
                        data: vec![i],
                        meta: m.clone(),
                    },
                    1,
                    &kp,
                    t,
                )
                .unwrap(),
            );
            assert_eq!(store.apply_at(&req, t), StoreOutcome::Added);
        }

        assert_eq!(store.len(), 2);
        // The oldest record was evicted
        let first = AuthenticatedPayload {
            data: vec![0],
            meta: m.clone(),
        };
        let first_id = crate::crypto::derive_data_id(&first).unwrap();
        assert!(store
            .get_at(&m.class_id, &first_id, NOW + 2)
            .is_none());
    }

    #[test]
    fn convergence_under_reordering() {
        let kp = KeyPair::from_seed(&[1; 32]);
        let requests = vec![
            add_req(b"offer-1", 1, &kp),
            refresh_req(b"offer-1", 2, &kp),
            add_req(b"offer-2", 1, &kp),
            remove_req(b"offer-2", 2, &kp),
            add_req(b"offer-3", 1, &kp),
        ];

        // Each node sees the same set twice (gossip plus an inventory
        // round), in opposite orders. A refresh that outran its add lands
        // on the second delivery.
        let s1 = DataStore::new();
        for req in requests.iter().chain(requests.iter()) {
            s1.apply_at(req, NOW);
        }

        let s2 = DataStore::new();
        for req in requests.iter().rev().chain(requests.iter().rev()) {
            s2.apply_at(req, NOW);
        }

        let f1 = {
            let mut f = s1.compute_filter_at(FilterScope::All, NOW).entries;
            f.sort_by_key(|e| e.data_id);
            f
        };
        let f2 = {
            let mut f = s2.compute_filter_at(FilterScope::All, NOW).entries;
            f.sort_by_key(|e| e.data_id);
            f
        };
        assert_eq!(f1, f2);

        let mut r1 = s1.records_at(FilterScope::All, NOW);
        let mut r2 = s2.records_at(FilterScope::All, NOW);
        r1.sort_by_key(|r| format!("{r:?}"));
        r2.sort_by_key(|r| format!("{r:?}"));
        assert_eq!(r1, r2);
    }

    #[test]
    fn diff_returns_missing_and_fresher() {
        let kp = KeyPair::from_seed(&[1; 32]);
        let s1 = DataStore::new();
        let s2 = DataStore::new();

        let a = add_req(b"a", 1, &kp);
        let b = add_req(b"b", 1, &kp);
        let c = add_req(b"c", 1, &kp);

        for req in [&a, &b, &c] {
            s1.apply_at(req, NOW);
        }
        s2.apply_at(&a, NOW);

        let filter = s2.compute_filter_at(FilterScope::All, NOW);
        let inventory = s1.diff_at(&filter, 100, NOW);
        assert_eq!(inventory.requests.len(), 2);
        assert_eq!(inventory.num_dropped, 0);

        for req in &inventory.requests {
            s2.apply_at(req, NOW);
        }
        assert_eq!(s2.records_at(FilterScope::All, NOW).len(), 3);

        // Second round finds nothing
        let filter = s2.compute_filter_at(FilterScope::All, NOW);
        assert!(s1.diff_at(&filter, 100, NOW).requests.is_empty());
    }

    #[test]
    fn diff_ships_tombstones_and_refreshes() {
        let kp = KeyPair::from_seed(&[1; 32]);
        let s1 = DataStore::new();
        let s2 = DataStore::new();

        s1.apply_at(&add_req(b"gone", 1, &kp), NOW);
        s1.apply_at(&remove_req(b"gone", 2, &kp), NOW);
        s1.apply_at(&add_req(b"fresh", 1, &kp), NOW);
        s1.apply_at(&refresh_req(b"fresh", 5, &kp), NOW);

        // s2 has the stale view: both records at seq 1
        s2.apply_at(&add_req(b"gone", 1, &kp), NOW);
        s2.apply_at(&add_req(b"fresh", 1, &kp), NOW);

        let filter = s2.compute_filter_at(FilterScope::All, NOW);
        let inventory = s1.diff_at(&filter, 100, NOW);
        for req in &inventory.requests {
            s2.apply_at(req, NOW);
        }

        let records = s2.records_at(FilterScope::All, NOW);
        assert_eq!(records.len(), 1);
        match &records[0] {
            Record::Authenticated(data) => assert_eq!(data.sequence_number, 5),
            other => panic!("unexpected record {other:?}"),
        }
    }

    #[test]
    fn diff_bound_reports_dropped() {
        let kp = KeyPair::from_seed(&[1; 32]);
        let store = DataStore::new();
        for i in 0u8..5 {
            store.apply_at(&add_req(&[i], 1, &kp), NOW);
        }

        let empty = DataFilter::empty(FilterScope::All);
        let inventory = store.diff_at(&empty, 3, NOW);
        assert_eq!(inventory.requests.len(), 3);
        assert_eq!(inventory.num_dropped, 2);
    }

    #[test]
    fn class_scoped_filter() {
        let kp = KeyPair::from_seed(&[1; 32]);
        let store = DataStore::new();
        store.apply_at(&add_req(b"offer-1", 1, &kp), NOW);

        let witness = MutationRequest::AddAppendOnly(AddAppendOnlyRequest::new(
            AppendOnlyPayload {
                data: b"w".to_vec(),
                meta: meta("witness", 600_000, 10),
            },
            NOW,
        ));
        store.apply_at(&witness, NOW);

        let f = store.compute_filter_at(FilterScope::Class(ClassId::new("offer")), NOW);
        assert_eq!(f.entries.len(), 1);
        let f = store.compute_filter_at(FilterScope::All, NOW);
        assert_eq!(f.entries.len(), 2);
    }

    #[test]
    fn snapshot_roundtrip() {
        let kp = KeyPair::from_seed(&[1; 32]);
        let store = DataStore::new();
        store.apply_at(&add_req(b"offer-1", 1, &kp), NOW);
        store.apply_at(&refresh_req(b"offer-1", 2, &kp), NOW);
        store.apply_at(&add_req(b"offer-2", 1, &kp), NOW);
        store.apply_at(&remove_req(b"offer-2", 2, &kp), NOW);

        let snapshot = store.snapshot();
        let restored = DataStore::new();
        restored.restore_at(snapshot, NOW);

        assert_eq!(
            restored.records_at(FilterScope::All, NOW),
            store.records_at(FilterScope::All, NOW)
        );
        let id = crate::crypto::derive_data_id(&payload(b"offer-2")).unwrap();
        // Tombstone survives the roundtrip
        assert_eq!(restored.sequence_number(&ClassId::new("offer"), &id), 2);
    }
}
