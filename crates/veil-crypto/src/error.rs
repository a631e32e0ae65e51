//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// AEAD encryption failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (authentication failure)
    #[error("decryption failed: authentication failure")]
    DecryptionFailed,

    /// Invalid key length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Peer public key is a low-order point
    #[error("peer public key rejected: low-order point")]
    LowOrderPoint,

    /// Ed25519 signature is invalid or malformed
    #[error("invalid signature")]
    InvalidSignature,

    /// Bytes do not encode a valid Ed25519 public key
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Noise handshake failure
    #[error("handshake error: {0}")]
    Handshake(String),

    /// Handshake message arrived in a phase that cannot accept it
    #[error("invalid handshake state")]
    InvalidHandshakeState,

    /// Transport counter did not advance past the last accepted value
    #[error("replayed or reordered counter rejected")]
    ReplayedCounter,

    /// Nonce counter exhausted, session must be re-established
    #[error("nonce counter exhausted")]
    NonceExhausted,

    /// Random number generation failed
    #[error("random number generation failed")]
    RandomFailed,
}

impl From<snow::Error> for CryptoError {
    fn from(e: snow::Error) -> Self {
        CryptoError::Handshake(e.to_string())
    }
}
