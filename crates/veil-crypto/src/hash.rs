//! BLAKE3 hashing and keyed authenticator tags.

/// BLAKE3 hash output (32 bytes).
pub type HashOutput = [u8; 32];

/// Compute BLAKE3 hash of input data.
#[must_use]
pub fn hash(data: &[u8]) -> HashOutput {
    *blake3::hash(data).as_bytes()
}

/// Compute a 16-byte keyed authenticator tag over `data`.
///
/// Used for the async delete authenticator; verify with
/// [`crate::constant_time::verify_16`], never with `==`.
#[must_use]
pub fn keyed_tag(key: &[u8; 32], data: &[u8]) -> [u8; 16] {
    let mut hasher = blake3::Hasher::new_keyed(key);
    hasher.update(data);
    let mut tag = [0u8; 16];
    tag.copy_from_slice(&hasher.finalize().as_bytes()[..16]);
    tag
}
