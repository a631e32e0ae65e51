//! HKDF-SHA256 key derivation (RFC 5869).
//!
//! Every symmetric key in VEIL is derived through this module with a
//! domain-separating info label; raw DH outputs are never used directly.

use hkdf::Hkdf;
use sha2::Sha256;

/// Derive a 32-byte key from input key material and an info label.
#[must_use]
pub fn derive_key(ikm: &[u8], info: &[u8]) -> [u8; 32] {
    let mut output = [0u8; 32];
    derive(ikm, &[], info, &mut output);
    output
}

/// HKDF extract-then-expand with an explicit salt.
///
/// # Panics
///
/// Panics if `output` is longer than 255 SHA-256 blocks (8160 bytes),
/// which no caller in this workspace approaches.
pub fn derive(ikm: &[u8], salt: &[u8], info: &[u8], output: &mut [u8]) {
    let salt = if salt.is_empty() { None } else { Some(salt) };
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    hk.expand(info, output)
        .expect("HKDF output length within bounds");
}

/// Derive a 32-byte key from two concatenated DH outputs.
///
/// Used for async message keys, where the sender combines the
/// ephemeral/pre-key exchange with the static/static exchange.
#[must_use]
pub fn derive_key2(ikm_a: &[u8; 32], ikm_b: &[u8; 32], info: &[u8]) -> [u8; 32] {
    let mut ikm = [0u8; 64];
    ikm[..32].copy_from_slice(ikm_a);
    ikm[32..].copy_from_slice(ikm_b);
    let key = derive_key(&ikm, info);
    use zeroize::Zeroize;
    ikm.zeroize();
    key
}
