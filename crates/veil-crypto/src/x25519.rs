//! X25519 Diffie-Hellman key exchange (RFC 7748).
//!
//! The long-lived identity of every VEIL peer is an X25519 keypair; the
//! 32-byte public key doubles as the peer's stable identifier. Pre-keys
//! and per-message ephemerals use the same curve.
//!
//! - Low-order point rejection
//! - Automatic key clamping (RFC 7748)
//! - Zeroization of secret material on drop

use crate::CryptoError;
use rand_core::{CryptoRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// X25519 private key (32 bytes).
#[derive(Clone, ZeroizeOnDrop, Zeroize)]
pub struct PrivateKey(x25519_dalek::StaticSecret);

/// X25519 public key (32 bytes).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(x25519_dalek::PublicKey);

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Only a short prefix; full keys stay out of logs.
        write!(f, "PublicKey({:02x}{:02x}{:02x}{:02x}..)", self.0.as_bytes()[0], self.0.as_bytes()[1], self.0.as_bytes()[2], self.0.as_bytes()[3])
    }
}

/// X25519 shared secret (32 bytes).
#[derive(ZeroizeOnDrop, Zeroize)]
pub struct SharedSecret(x25519_dalek::SharedSecret);

impl PrivateKey {
    /// Generate a new random private key with RFC 7748 clamping.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self(x25519_dalek::StaticSecret::random_from_rng(rng))
    }

    /// Derive the public key from this private key.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        PublicKey(x25519_dalek::PublicKey::from(&self.0))
    }

    /// Perform Diffie-Hellman key exchange.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::LowOrderPoint`] if the peer's public key is a
    /// low-order point.
    pub fn exchange(&self, peer_public: &PublicKey) -> Result<SharedSecret, CryptoError> {
        let shared = self.0.diffie_hellman(&peer_public.0);

        if shared.as_bytes() == &[0u8; 32] {
            return Err(CryptoError::LowOrderPoint);
        }

        Ok(SharedSecret(shared))
    }

    /// Export as bytes (for serialization).
    ///
    /// # Security
    ///
    /// The returned bytes contain the raw private key. Handle with care.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    /// Import from bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(x25519_dalek::StaticSecret::from(bytes))
    }
}

impl PublicKey {
    /// Export public key as bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 32] {
        *self.0.as_bytes()
    }

    /// Import public key from bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(x25519_dalek::PublicKey::from(bytes))
    }

    /// Get bytes as a reference.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

impl SharedSecret {
    /// Get shared secret as bytes.
    ///
    /// # Security
    ///
    /// The shared secret must be run through HKDF before use as an
    /// encryption key; see [`crate::kdf`].
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

/// A long-lived (public, private) identity pair.
pub struct Keypair {
    secret: PrivateKey,
    public: PublicKey,
}

impl Keypair {
    /// Generate a fresh keypair from the OS CSPRNG.
    #[must_use]
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let secret = PrivateKey::generate(rng);
        let public = secret.public_key();
        Self { secret, public }
    }

    /// Reconstruct a keypair from a stored private key.
    #[must_use]
    pub fn from_secret(secret: PrivateKey) -> Self {
        let public = secret.public_key();
        Self { secret, public }
    }

    /// The public half, the peer's stable identifier.
    #[must_use]
    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    /// The private half.
    #[must_use]
    pub fn secret(&self) -> &PrivateKey {
        &self.secret
    }
}

impl Clone for Keypair {
    fn clone(&self) -> Self {
        Self {
            secret: self.secret.clone(),
            public: self.public,
        }
    }
}
