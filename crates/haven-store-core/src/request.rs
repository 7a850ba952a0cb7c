//! Wire-level mutation requests
//!
//! Every mutation of the replicated store travels as one of these requests,
//! whether it was created locally or arrived as gossip or an inventory batch.
//! Each variant carries everything needed to validate authorship on its own;
//! the store only adds the comparison against its current state.

use crate::crypto::{
    self, auth_sign_bytes, derive_data_id, mailbox_sign_bytes, refresh_sign_bytes,
    remove_sign_bytes, verify_signature, KeyPair,
};
use crate::error::{Error, Result};
use crate::types::*;
use serde::{Deserialize, Serialize};

// =============================================================================
// REQUEST VARIANTS
// =============================================================================

/// Publish or update an authenticated record.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddAuthenticatedRequest {
    pub data: AuthenticatedData,
    /// Owner signature over `auth_sign_bytes(payload, seq)`
    pub signature: Vec<u8>,
}

/// Extend the liveness of an authenticated record without resending the payload.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RefreshAuthenticatedRequest {
    pub data_id: DataId,
    pub meta: MetaData,
    pub sequence_number: u64,
    pub owner_key: Bytes32,
    pub created_at_ms: u64,
    /// Owner signature over `refresh_sign_bytes(data_id, seq)`
    pub signature: Vec<u8>,
}

/// Tombstone an authenticated record.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoveAuthenticatedRequest {
    pub data_id: DataId,
    pub meta: MetaData,
    pub sequence_number: u64,
    pub owner_key: Bytes32,
    pub created_at_ms: u64,
    /// Owner signature over `remove_sign_bytes(data_id, seq)`
    pub signature: Vec<u8>,
}

/// Publish a mailbox record.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddMailboxRequest {
    pub data: MailboxData,
    /// Sender signature over `mailbox_sign_bytes(envelope, seq)`
    pub signature: Vec<u8>,
}

/// Tombstone a mailbox record after pickup. Authorized by the receiver, not
/// the sender: the receiver proves ownership of the key the envelope was
/// addressed to.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoveMailboxRequest {
    pub data_id: DataId,
    pub meta: MetaData,
    pub sequence_number: u64,
    pub receiver_key: Bytes32,
    pub created_at_ms: u64,
    /// Receiver signature over `remove_sign_bytes(data_id, seq)`
    pub signature: Vec<u8>,
}

/// Publish an append-only record. No authorship beyond the payload itself.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddAppendOnlyRequest {
    pub payload: AppendOnlyPayload,
    pub created_at_ms: u64,
}

// =============================================================================
// CONSTRUCTORS
// =============================================================================

impl AddAuthenticatedRequest {
    pub fn new(
        payload: AuthenticatedPayload,
        sequence_number: u64,
        keypair: &KeyPair,
        now_ms: u64,
    ) -> Result<Self> {
        let signature = keypair.sign(&auth_sign_bytes(&payload, sequence_number)?);
        Ok(Self {
            data: AuthenticatedData {
                payload,
                sequence_number,
                owner_key: keypair.public_key(),
                created_at_ms: now_ms,
            },
            signature,
        })
    }
}

impl RefreshAuthenticatedRequest {
    pub fn new(
        data_id: DataId,
        meta: MetaData,
        sequence_number: u64,
        keypair: &KeyPair,
        now_ms: u64,
    ) -> Self {
        let signature = keypair.sign(&refresh_sign_bytes(&data_id, sequence_number));
        Self {
            data_id,
            meta,
            sequence_number,
            owner_key: keypair.public_key(),
            created_at_ms: now_ms,
            signature,
        }
    }
}

impl RemoveAuthenticatedRequest {
    pub fn new(
        data_id: DataId,
        meta: MetaData,
        sequence_number: u64,
        keypair: &KeyPair,
        now_ms: u64,
    ) -> Self {
        let signature = keypair.sign(&remove_sign_bytes(&data_id, sequence_number));
        Self {
            data_id,
            meta,
            sequence_number,
            owner_key: keypair.public_key(),
            created_at_ms: now_ms,
            signature,
        }
    }
}

impl AddMailboxRequest {
    /// Seal `plaintext` for the holder of `receiver_pubkey` (an Ed25519
    /// signing key) and sign the envelope.
    pub fn seal(
        plaintext: &[u8],
        meta: MetaData,
        sequence_number: u64,
        sender: &KeyPair,
        receiver_pubkey: &Bytes32,
        now_ms: u64,
    ) -> Result<Self> {
        let envelope = crypto::seal_envelope(plaintext, receiver_pubkey)?;
        Self::new(envelope, meta, sequence_number, sender, now_ms)
    }

    pub fn new(
        envelope: MailboxEnvelope,
        meta: MetaData,
        sequence_number: u64,
        sender: &KeyPair,
        now_ms: u64,
    ) -> Result<Self> {
        let signature = sender.sign(&mailbox_sign_bytes(&envelope, sequence_number)?);
        Ok(Self {
            data: MailboxData {
                envelope,
                sequence_number,
                sender_key: sender.public_key(),
                created_at_ms: now_ms,
                meta,
            },
            signature,
        })
    }
}

impl RemoveMailboxRequest {
    pub fn new(
        data_id: DataId,
        meta: MetaData,
        sequence_number: u64,
        receiver: &KeyPair,
        now_ms: u64,
    ) -> Self {
        let signature = receiver.sign(&remove_sign_bytes(&data_id, sequence_number));
        Self {
            data_id,
            meta,
            sequence_number,
            receiver_key: receiver.public_key(),
            created_at_ms: now_ms,
            signature,
        }
    }
}

impl AddAppendOnlyRequest {
    pub fn new(payload: AppendOnlyPayload, now_ms: u64) -> Self {
        Self {
            payload,
            created_at_ms: now_ms,
        }
    }
}

// =============================================================================
// MUTATION REQUEST UNION
// =============================================================================

/// Closed union of every mutation that can travel between stores.
///
/// New record kinds are added by extending this enum; the store and the
/// broadcaster match exhaustively, so a new variant fails to compile until
/// both handle it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum MutationRequest {
    AddAuthenticated(AddAuthenticatedRequest),
    RefreshAuthenticated(RefreshAuthenticatedRequest),
    RemoveAuthenticated(RemoveAuthenticatedRequest),
    AddMailbox(AddMailboxRequest),
    RemoveMailbox(RemoveMailboxRequest),
    AddAppendOnly(AddAppendOnlyRequest),
}

impl MutationRequest {
    /// Record identity the request addresses. Recomputed from the payload for
    /// add requests so a forged id cannot displace someone else's record.
    pub fn data_id(&self) -> Result<DataId> {
        match self {
            MutationRequest::AddAuthenticated(req) => derive_data_id(&req.data.payload),
            MutationRequest::RefreshAuthenticated(req) => Ok(req.data_id),
            MutationRequest::RemoveAuthenticated(req) => Ok(req.data_id),
            MutationRequest::AddMailbox(req) => derive_data_id(&req.data.envelope),
            MutationRequest::RemoveMailbox(req) => Ok(req.data_id),
            MutationRequest::AddAppendOnly(req) => derive_data_id(&req.payload),
        }
    }

    pub fn class_id(&self) -> &ClassId {
        &self.meta().class_id
    }

    pub fn meta(&self) -> &MetaData {
        match self {
            MutationRequest::AddAuthenticated(req) => &req.data.payload.meta,
            MutationRequest::RefreshAuthenticated(req) => &req.meta,
            MutationRequest::RemoveAuthenticated(req) => &req.meta,
            MutationRequest::AddMailbox(req) => &req.data.meta,
            MutationRequest::RemoveMailbox(req) => &req.meta,
            MutationRequest::AddAppendOnly(req) => &req.payload.meta,
        }
    }

    /// Sequence number carried by the request. Append-only records have no
    /// freshness state and always report zero.
    pub fn sequence_number(&self) -> u64 {
        match self {
            MutationRequest::AddAuthenticated(req) => req.data.sequence_number,
            MutationRequest::RefreshAuthenticated(req) => req.sequence_number,
            MutationRequest::RemoveAuthenticated(req) => req.sequence_number,
            MutationRequest::AddMailbox(req) => req.data.sequence_number,
            MutationRequest::RemoveMailbox(req) => req.sequence_number,
            MutationRequest::AddAppendOnly(_) => 0,
        }
    }

    pub fn created_at_ms(&self) -> u64 {
        match self {
            MutationRequest::AddAuthenticated(req) => req.data.created_at_ms,
            MutationRequest::RefreshAuthenticated(req) => req.created_at_ms,
            MutationRequest::RemoveAuthenticated(req) => req.created_at_ms,
            MutationRequest::AddMailbox(req) => req.data.created_at_ms,
            MutationRequest::RemoveMailbox(req) => req.created_at_ms,
            MutationRequest::AddAppendOnly(req) => req.created_at_ms,
        }
    }

    /// Whether the record's time-to-live has elapsed.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.created_at_ms()) > self.meta().ttl_ms
    }

    pub fn is_add(&self) -> bool {
        matches!(
            self,
            MutationRequest::AddAuthenticated(_)
                | MutationRequest::AddMailbox(_)
                | MutationRequest::AddAppendOnly(_)
        )
    }

    pub fn is_remove(&self) -> bool {
        matches!(
            self,
            MutationRequest::RemoveAuthenticated(_) | MutationRequest::RemoveMailbox(_)
        )
    }

    /// Validate authorship independently of any store state.
    ///
    /// Append-only records carry no signature; authorization for those is an
    /// application concern above this layer.
    pub fn verify(&self) -> Result<()> {
        match self {
            MutationRequest::AddAuthenticated(req) => {
                let msg = auth_sign_bytes(&req.data.payload, req.data.sequence_number)?;
                verify_signature(&req.data.owner_key, &msg, &req.signature)
            }
            MutationRequest::RefreshAuthenticated(req) => {
                let msg = refresh_sign_bytes(&req.data_id, req.sequence_number);
                verify_signature(&req.owner_key, &msg, &req.signature)
            }
            MutationRequest::RemoveAuthenticated(req) => {
                let msg = remove_sign_bytes(&req.data_id, req.sequence_number);
                verify_signature(&req.owner_key, &msg, &req.signature)
            }
            MutationRequest::AddMailbox(req) => {
                let msg = mailbox_sign_bytes(&req.data.envelope, req.data.sequence_number)?;
                verify_signature(&req.data.sender_key, &msg, &req.signature)
            }
            MutationRequest::RemoveMailbox(req) => {
                let msg = remove_sign_bytes(&req.data_id, req.sequence_number);
                verify_signature(&req.receiver_key, &msg, &req.signature)
            }
            MutationRequest::AddAppendOnly(_) => Ok(()),
        }
    }

    /// The record an add request would store, for listener notification.
    pub fn record(&self) -> Option<Record> {
        match self {
            MutationRequest::AddAuthenticated(req) => {
                Some(Record::Authenticated(req.data.clone()))
            }
            MutationRequest::AddMailbox(req) => Some(Record::Mailbox(req.data.clone())),
            MutationRequest::AddAppendOnly(req) => Some(Record::AppendOnly(req.payload.clone())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_meta() -> MetaData {
        MetaData {
            class_id: ClassId::new("offer"),
            ttl_ms: 60_000,
            max_records: 100,
        }
    }

    fn test_payload() -> AuthenticatedPayload {
        AuthenticatedPayload {
            data: b"sell 1 btc".to_vec(),
            meta: test_meta(),
        }
    }

    #[test]
    fn add_authenticated_verifies() {
        let kp = KeyPair::from_seed(&[1; 32]);
        let req = AddAuthenticatedRequest::new(test_payload(), 1, &kp, 1_000).unwrap();
        let req = MutationRequest::AddAuthenticated(req);

        assert!(req.verify().is_ok());
        assert_eq!(req.sequence_number(), 1);
        assert!(req.is_add());
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let kp = KeyPair::from_seed(&[1; 32]);
        let mut req = AddAuthenticatedRequest::new(test_payload(), 1, &kp, 1_000).unwrap();
        req.data.payload.data = b"sell 100 btc".to_vec();

        assert!(MutationRequest::AddAuthenticated(req).verify().is_err());
    }

    #[test]
    fn tampered_sequence_number_fails_verification() {
        let kp = KeyPair::from_seed(&[1; 32]);
        let mut req = AddAuthenticatedRequest::new(test_payload(), 1, &kp, 1_000).unwrap();
        req.data.sequence_number = 5;

        assert!(MutationRequest::AddAuthenticated(req).verify().is_err());
    }

    #[test]
    fn remove_signed_by_other_key_fails() {
        let owner = KeyPair::from_seed(&[1; 32]);
        let attacker = KeyPair::from_seed(&[2; 32]);

        let add = AddAuthenticatedRequest::new(test_payload(), 1, &owner, 1_000).unwrap();
        let data_id = MutationRequest::AddAuthenticated(add).data_id().unwrap();

        let mut remove = RemoveAuthenticatedRequest::new(data_id, test_meta(), 2, &attacker, 2_000);
        // Claim the owner's key without the owner's signature
        remove.owner_key = owner.public_key();

        assert!(MutationRequest::RemoveAuthenticated(remove).verify().is_err());
    }

    #[test]
    fn mailbox_seal_sign_verify() {
        let sender = KeyPair::from_seed(&[3; 32]);
        let receiver = KeyPair::from_seed(&[4; 32]);

        let req = AddMailboxRequest::seal(
            b"take my offer",
            test_meta(),
            1,
            &sender,
            &receiver.public_key(),
            1_000,
        )
        .unwrap();

        let req = MutationRequest::AddMailbox(req);
        assert!(req.verify().is_ok());
    }

    #[test]
    fn expiry_uses_request_metadata() {
        let req = MutationRequest::AddAppendOnly(AddAppendOnlyRequest::new(
            AppendOnlyPayload {
                data: vec![1],
                meta: MetaData {
                    class_id: ClassId::new("witness"),
                    ttl_ms: 100,
                    max_records: 10,
                },
            },
            1_000,
        ));

        assert!(!req.is_expired(1_100));
        assert!(req.is_expired(1_101));
    }
}
