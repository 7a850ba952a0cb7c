//! Hash and signature derivations for the data layer
//!
//! All hash derivations use BLAKE3 with domain separation prefixes. Signing
//! and verification use Ed25519; mailbox envelopes are sealed with an
//! ephemeral X25519 exchange, HKDF-SHA256 and ChaCha20-Poly1305. The static
//! half of the exchange is the receiver's Ed25519 identity in Montgomery
//! form, so the keypair that decrypts an envelope is the same one that signs
//! the pickup remove.
//!
//! This module decides *what* gets hashed and signed; the store decides *when*
//! the checks run and what a failure means.

use crate::canonical::canonical_bytes;
use crate::error::{Error, Result};
use crate::types::*;
use blake3::Hasher;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use serde::Serialize;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519Public, StaticSecret};

// =============================================================================
// DOMAIN SEPARATION PREFIXES
// =============================================================================

/// Domain prefix for record identity derivation
pub const DOMAIN_DATA_ID: &[u8] = b"data-id";
/// Domain prefix for authenticated-record signatures
pub const DOMAIN_AUTH_SIG: &[u8] = b"auth-sig";
/// Domain prefix for mailbox-record signatures
pub const DOMAIN_MAILBOX_SIG: &[u8] = b"mailbox-sig";
/// Domain prefix for remove-request signatures
pub const DOMAIN_REMOVE_SIG: &[u8] = b"remove-sig";
/// Domain prefix for refresh-request signatures
pub const DOMAIN_REFRESH_SIG: &[u8] = b"refresh-sig";
/// Domain prefix for the recipient key digest in mailbox envelopes
pub const DOMAIN_RECEIVER: &[u8] = b"receiver-key";
/// HKDF info string for mailbox sealing
const MAILBOX_SEAL_INFO: &[u8] = b"haven-mailbox-seal";

// =============================================================================
// IDENTITY
// =============================================================================

/// Derive a record identity from its canonical payload bytes.
///
/// `DataId = BLAKE3("data-id" || canonical_bytes(payload))`
pub fn derive_data_id<T: Serialize>(payload: &T) -> Result<DataId> {
    let bytes = canonical_bytes(payload)?;

    let mut hasher = Hasher::new();
    hasher.update(DOMAIN_DATA_ID);
    hasher.update(&bytes);

    Ok(DataId(*hasher.finalize().as_bytes()))
}

/// Digest of a recipient's mailbox public key, stored in the envelope so the
/// recipient can pick out their records without trial decryption.
pub fn receiver_key_digest(receiver_pubkey: &Bytes32) -> Bytes32 {
    let mut hasher = Hasher::new();
    hasher.update(DOMAIN_RECEIVER);
    hasher.update(receiver_pubkey);
    *hasher.finalize().as_bytes()
}

// =============================================================================
// SIGN BYTES
// =============================================================================

/// Bytes an owner signs when adding or updating an authenticated record.
///
/// `sign_bytes = "auth-sig" || canonical_bytes(payload) || seq_le`
pub fn auth_sign_bytes(payload: &AuthenticatedPayload, sequence_number: u64) -> Result<Vec<u8>> {
    let payload_bytes = canonical_bytes(payload)?;
    let mut bytes = Vec::with_capacity(DOMAIN_AUTH_SIG.len() + payload_bytes.len() + 8);
    bytes.extend_from_slice(DOMAIN_AUTH_SIG);
    bytes.extend_from_slice(&payload_bytes);
    bytes.extend_from_slice(&sequence_number.to_le_bytes());
    Ok(bytes)
}

/// Bytes a sender signs when adding a mailbox record.
pub fn mailbox_sign_bytes(envelope: &MailboxEnvelope, sequence_number: u64) -> Result<Vec<u8>> {
    let envelope_bytes = canonical_bytes(envelope)?;
    let mut bytes = Vec::with_capacity(DOMAIN_MAILBOX_SIG.len() + envelope_bytes.len() + 8);
    bytes.extend_from_slice(DOMAIN_MAILBOX_SIG);
    bytes.extend_from_slice(&envelope_bytes);
    bytes.extend_from_slice(&sequence_number.to_le_bytes());
    Ok(bytes)
}

/// Bytes signed for a remove request. The identity stands in for the payload,
/// which a remover may no longer hold.
pub fn remove_sign_bytes(data_id: &DataId, sequence_number: u64) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(DOMAIN_REMOVE_SIG.len() + 32 + 8);
    bytes.extend_from_slice(DOMAIN_REMOVE_SIG);
    bytes.extend_from_slice(&data_id.0);
    bytes.extend_from_slice(&sequence_number.to_le_bytes());
    bytes
}

/// Bytes signed for a refresh request.
pub fn refresh_sign_bytes(data_id: &DataId, sequence_number: u64) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(DOMAIN_REFRESH_SIG.len() + 32 + 8);
    bytes.extend_from_slice(DOMAIN_REFRESH_SIG);
    bytes.extend_from_slice(&data_id.0);
    bytes.extend_from_slice(&sequence_number.to_le_bytes());
    bytes
}

// =============================================================================
// KEYPAIR
// =============================================================================

/// Ed25519 keypair used for record ownership and mailbox sender identity.
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Create from seed bytes (for deterministic testing)
    pub fn from_seed(seed: &Bytes32) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        Self { signing_key }
    }

    /// Get the public key bytes
    pub fn public_key(&self) -> Bytes32 {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_vec()
    }

    /// X25519 secret for the mailbox exchange, derived from the signing key.
    fn mailbox_secret(&self) -> StaticSecret {
        StaticSecret::from(self.signing_key.to_scalar_bytes())
    }
}

/// Verify a signature against a public key and message.
pub fn verify_signature(public_key: &Bytes32, message: &[u8], signature: &[u8]) -> Result<()> {
    let verifying_key = VerifyingKey::from_bytes(public_key)
        .map_err(|e| Error::InvalidPublicKey(e.to_string()))?;
    let sig = Signature::from_slice(signature).map_err(|_| Error::InvalidSignature)?;
    verifying_key
        .verify(message, &sig)
        .map_err(|_| Error::InvalidSignature)
}

// =============================================================================
// MAILBOX SEALING
// =============================================================================

fn seal_key(shared_secret: &[u8], ephemeral_pubkey: &Bytes32) -> Result<[u8; 32]> {
    let hkdf = Hkdf::<Sha256>::new(Some(ephemeral_pubkey), shared_secret);
    let mut key = [0u8; 32];
    hkdf.expand(MAILBOX_SEAL_INFO, &mut key)
        .map_err(|_| Error::SealFailed)?;
    Ok(key)
}

/// Seal a plaintext for the holder of `receiver_pubkey`, an Ed25519 signing
/// key. The exchange runs against its Montgomery form.
///
/// A fresh ephemeral X25519 key is used per envelope, so the AEAD nonce can be
/// constant. The recipient key digest is bound as associated data.
pub fn seal_envelope(plaintext: &[u8], receiver_pubkey: &Bytes32) -> Result<MailboxEnvelope> {
    let verifying_key = VerifyingKey::from_bytes(receiver_pubkey)
        .map_err(|e| Error::InvalidPublicKey(e.to_string()))?;
    let receiver_x25519 = X25519Public::from(verifying_key.to_montgomery().to_bytes());

    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_pubkey = X25519Public::from(&ephemeral).to_bytes();
    let shared = ephemeral.diffie_hellman(&receiver_x25519);

    let key = seal_key(shared.as_bytes(), &ephemeral_pubkey)?;
    let digest = receiver_key_digest(receiver_pubkey);

    let cipher = ChaCha20Poly1305::new_from_slice(&key).map_err(|_| Error::SealFailed)?;
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&[0u8; 12]),
            chacha20poly1305::aead::Payload {
                msg: plaintext,
                aad: &digest,
            },
        )
        .map_err(|_| Error::SealFailed)?;

    Ok(MailboxEnvelope {
        ciphertext,
        ephemeral_pubkey,
        receiver_key_digest: digest,
    })
}

/// Open an envelope addressed to `keypair`. Fails fast on a digest mismatch
/// before attempting any decryption.
pub fn open_envelope(envelope: &MailboxEnvelope, keypair: &KeyPair) -> Result<Vec<u8>> {
    let our_digest = receiver_key_digest(&keypair.public_key());
    if our_digest != envelope.receiver_key_digest {
        return Err(Error::WrongRecipient);
    }

    let shared = keypair
        .mailbox_secret()
        .diffie_hellman(&X25519Public::from(envelope.ephemeral_pubkey));
    let key = seal_key(shared.as_bytes(), &envelope.ephemeral_pubkey)?;

    let cipher = ChaCha20Poly1305::new_from_slice(&key).map_err(|_| Error::OpenFailed)?;
    cipher
        .decrypt(
            Nonce::from_slice(&[0u8; 12]),
            chacha20poly1305::aead::Payload {
                msg: &envelope.ciphertext,
                aad: &envelope.receiver_key_digest,
            },
        )
        .map_err(|_| Error::OpenFailed)
}
