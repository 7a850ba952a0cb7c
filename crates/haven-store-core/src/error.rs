//! Error types for haven-store

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// haven-store error types
#[derive(Debug, Error)]
pub enum Error {
    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    /// Invalid signature
    #[error("invalid signature")]
    InvalidSignature,

    /// Invalid public key
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Mailbox envelope could not be sealed
    #[error("mailbox seal failed")]
    SealFailed,

    /// Mailbox envelope could not be opened
    #[error("mailbox open failed")]
    OpenFailed,

    /// Envelope addressed to a different recipient
    #[error("envelope not addressed to this recipient")]
    WrongRecipient,
}
