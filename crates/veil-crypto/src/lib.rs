//! # VEIL Crypto
//!
//! Cryptographic primitives for the VEIL protocol.
//!
//! This crate provides:
//! - Noise-IK handshake for mutually authenticated sessions
//! - `XChaCha20-Poly1305` AEAD encryption with counter nonces
//! - Static-key boxes for the legacy protocol and pre-key payloads
//! - HKDF-SHA256 key derivation
//! - Ed25519 signatures for signed pre-keys
//! - Secure random number generation
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm | Security Level |
//! |----------|-----------|----------------|
//! | Key Exchange | X25519 | 128-bit |
//! | AEAD | XChaCha20-Poly1305 | 256-bit key |
//! | Hash | BLAKE3 | 128-bit collision |
//! | KDF | HKDF-SHA256 | 128-bit |
//! | Signatures | Ed25519 | 128-bit |
//! | Handshake | Noise IK (25519/ChaChaPoly/BLAKE2s) | 128-bit |

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod aead;
pub mod constant_time;
pub mod error;
pub mod hash;
pub mod kdf;
pub mod noise;
pub mod random;
pub mod signatures;
pub mod x25519;

pub use error::CryptoError;

/// X25519 public key size
pub const PUBLIC_KEY_SIZE: usize = 32;

/// X25519 secret key size
pub const SECRET_KEY_SIZE: usize = 32;

/// XChaCha20-Poly1305 nonce size
pub const NONCE_SIZE: usize = 24;

/// Poly1305 authentication tag size
pub const TAG_SIZE: usize = 16;

/// Ed25519 signature size
pub const SIGNATURE_SIZE: usize = 64;

/// Directional symmetric keys derived from a completed handshake.
///
/// Both sides derive the same pair from the handshake hash; which key
/// is used for sending depends on the handshake role.
#[derive(zeroize::Zeroize, zeroize::ZeroizeOnDrop)]
pub struct SessionKeys {
    /// Key for the sending cipher chain
    pub send_key: [u8; 32],
    /// Key for the receiving cipher chain
    pub recv_key: [u8; 32],
}
