//! Record model for the replicated data layer
//!
//! All types here are designed for deterministic serialization via postcard.
//! Field order matters for canonical encoding.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// 32-byte fixed-size array used for hashes and keys.
pub type Bytes32 = [u8; 32];

/// Current wall-clock time in unix milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// =============================================================================
// IDENTITY TYPES
// =============================================================================

/// Record identity: BLAKE3("data-id" || canonical_bytes(payload)).
///
/// For mailbox records the hash is taken over the sealed envelope instead of
/// the plaintext, so relaying nodes can address a record they cannot read.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DataId(pub Bytes32);

impl std::fmt::Display for DataId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// Record class identifier. Each class is an independent store partition with
/// its own TTL and capacity bound (offers, account-age witnesses, mailbox
/// messages, ...).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub String);

impl ClassId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClassId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-class storage metadata carried inside every payload.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetaData {
    /// Class this record belongs to
    pub class_id: ClassId,
    /// Time-to-live in milliseconds; a record older than this is logically absent
    pub ttl_ms: u64,
    /// Capacity bound of the class partition
    pub max_records: u32,
}

// =============================================================================
// AUTHENTICATED RECORDS
// =============================================================================

/// Owner-mutable payload. The application bytes are opaque to this layer.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthenticatedPayload {
    pub data: Vec<u8>,
    pub meta: MetaData,
}

/// Authenticated record: payload plus the freshness state the owner signs.
///
/// The signature (carried in the surrounding request) covers
/// `canonical_bytes(payload) || sequence_number`, so a replayed request cannot
/// claim a newer sequence number than it was signed for.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthenticatedData {
    pub payload: AuthenticatedPayload,
    /// Monotonically increasing per identity; replays with stale numbers are rejected
    pub sequence_number: u64,
    /// Ed25519 public key of the publisher
    pub owner_key: Bytes32,
    /// Creation time in unix millis; TTL is measured from here
    pub created_at_ms: u64,
}

impl AuthenticatedData {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.created_at_ms) > self.payload.meta.ttl_ms
    }
}

// =============================================================================
// APPEND-ONLY RECORDS
// =============================================================================

/// Immutable record: added once, never refreshed or removed, only TTL-expired.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppendOnlyPayload {
    pub data: Vec<u8>,
    pub meta: MetaData,
}

// =============================================================================
// MAILBOX RECORDS
// =============================================================================

/// Sealed point-to-point envelope. Only the recipient can open it; everyone
/// else stores and relays the ciphertext.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MailboxEnvelope {
    /// AEAD ciphertext of the application message
    pub ciphertext: Vec<u8>,
    /// Sender's ephemeral X25519 public key for the recipient's ECDH
    pub ephemeral_pubkey: Bytes32,
    /// BLAKE3 digest of the recipient's mailbox public key; lets the
    /// recipient pick out their messages without trial decryption
    pub receiver_key_digest: Bytes32,
}

/// Mailbox record: sealed envelope, signed by the sender.
///
/// Removal is authorized by the *receiver* (pickup-then-remove), which is why
/// the remove request carries the receiver key rather than the sender key.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MailboxData {
    pub envelope: MailboxEnvelope,
    pub sequence_number: u64,
    /// Ed25519 public key of the sender
    pub sender_key: Bytes32,
    pub created_at_ms: u64,
    pub meta: MetaData,
}

impl MailboxData {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.created_at_ms) > self.meta.ttl_ms
    }
}

// =============================================================================
// RECORD UNION
// =============================================================================

/// Union of the stored record kinds, as handed to listeners and read APIs.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Record {
    Authenticated(AuthenticatedData),
    AppendOnly(AppendOnlyPayload),
    Mailbox(MailboxData),
}

impl Record {
    pub fn class_id(&self) -> &ClassId {
        match self {
            Record::Authenticated(data) => &data.payload.meta.class_id,
            Record::AppendOnly(payload) => &payload.meta.class_id,
            Record::Mailbox(data) => &data.meta.class_id,
        }
    }
}
