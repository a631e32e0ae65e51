//! XChaCha20-Poly1305 AEAD encryption and static-key boxes.
//!
//! The ciphertext is always plaintext length + 16 (the Poly1305 tag).

use crate::x25519::{PrivateKey, PublicKey};
use crate::{CryptoError, kdf};
use chacha20poly1305::{
    XChaCha20Poly1305,
    aead::{Aead, KeyInit, Payload},
};

const BOX_KEY_INFO: &[u8] = b"veil box v1";

/// AEAD cipher for packet and message encryption
pub struct AeadCipher {
    cipher: XChaCha20Poly1305,
}

impl AeadCipher {
    /// Create a new AEAD cipher with the given key
    #[must_use]
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(key.into()),
        }
    }

    /// Encrypt plaintext with the given nonce and associated data
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::EncryptionFailed`] if the cipher rejects the input.
    pub fn encrypt(
        &self,
        nonce: &[u8; 24],
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let payload = Payload {
            msg: plaintext,
            aad,
        };

        self.cipher
            .encrypt(nonce.into(), payload)
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    /// Decrypt ciphertext with the given nonce and associated data
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::DecryptionFailed`] if the tag does not verify.
    pub fn decrypt(
        &self,
        nonce: &[u8; 24],
        ciphertext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let payload = Payload {
            msg: ciphertext,
            aad,
        };

        self.cipher
            .decrypt(nonce.into(), payload)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

/// Encrypt a message from `sender_secret` to `recipient_public`.
///
/// The symmetric key is HKDF-SHA256 over the X25519 shared secret; this
/// is the authenticated-encryption primitive of the legacy protocol and
/// of async message payloads.
///
/// # Errors
///
/// Returns [`CryptoError::LowOrderPoint`] for a degenerate recipient key
/// or [`CryptoError::EncryptionFailed`] on cipher failure.
pub fn box_encrypt(
    plaintext: &[u8],
    nonce: &[u8; 24],
    recipient_public: &PublicKey,
    sender_secret: &PrivateKey,
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let shared = sender_secret.exchange(recipient_public)?;
    let key = kdf::derive_key(shared.as_bytes(), BOX_KEY_INFO);
    AeadCipher::new(&key).encrypt(nonce, plaintext, aad)
}

/// Inverse of [`box_encrypt`].
///
/// # Errors
///
/// Returns [`CryptoError::DecryptionFailed`] if the tag does not verify.
pub fn box_decrypt(
    ciphertext: &[u8],
    nonce: &[u8; 24],
    sender_public: &PublicKey,
    recipient_secret: &PrivateKey,
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let shared = recipient_secret.exchange(sender_public)?;
    let key = kdf::derive_key(shared.as_bytes(), BOX_KEY_INFO);
    AeadCipher::new(&key).decrypt(nonce, ciphertext, aad)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TAG_SIZE;
    use rand_core::OsRng;

    #[test]
    fn test_aead_roundtrip() {
        let key = [0x42u8; 32];
        let nonce = [0x00u8; 24];
        let plaintext = b"hello veil";
        let aad = b"additional data";

        let cipher = AeadCipher::new(&key);

        let ciphertext = cipher.encrypt(&nonce, plaintext, aad).unwrap();
        assert_eq!(ciphertext.len(), plaintext.len() + TAG_SIZE);
        let decrypted = cipher.decrypt(&nonce, &ciphertext, aad).unwrap();

        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_aead_tamper_detection() {
        let key = [0x42u8; 32];
        let nonce = [0x00u8; 24];
        let cipher = AeadCipher::new(&key);

        let mut ciphertext = cipher.encrypt(&nonce, b"hello", b"").unwrap();
        ciphertext[0] ^= 0xFF;

        assert!(cipher.decrypt(&nonce, &ciphertext, b"").is_err());
    }

    #[test]
    fn test_aead_aad_mismatch() {
        let key = [0x42u8; 32];
        let nonce = [0x00u8; 24];
        let cipher = AeadCipher::new(&key);

        let ciphertext = cipher.encrypt(&nonce, b"hello", b"aad one").unwrap();
        assert!(cipher.decrypt(&nonce, &ciphertext, b"aad two").is_err());
    }

    #[test]
    fn test_box_roundtrip() {
        let sender = PrivateKey::generate(&mut OsRng);
        let recipient = PrivateKey::generate(&mut OsRng);
        let nonce = crate::random::random_nonce().unwrap();

        let ct = box_encrypt(
            b"boxed message",
            &nonce,
            &recipient.public_key(),
            &sender,
            b"",
        )
        .unwrap();

        let pt = box_decrypt(&ct, &nonce, &sender.public_key(), &recipient, b"").unwrap();
        assert_eq!(pt, b"boxed message");
    }

    #[test]
    fn test_box_wrong_recipient_fails() {
        let sender = PrivateKey::generate(&mut OsRng);
        let recipient = PrivateKey::generate(&mut OsRng);
        let other = PrivateKey::generate(&mut OsRng);
        let nonce = crate::random::random_nonce().unwrap();

        let ct = box_encrypt(b"secret", &nonce, &recipient.public_key(), &sender, b"").unwrap();

        assert!(box_decrypt(&ct, &nonce, &sender.public_key(), &other, b"").is_err());
    }
}
