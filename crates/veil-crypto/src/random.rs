//! Secure random number generation.
//!
//! All randomness comes from the operating system CSPRNG.

use crate::CryptoError;

/// Fill a buffer with random bytes from the OS CSPRNG
pub fn fill_random(buf: &mut [u8]) -> Result<(), CryptoError> {
    getrandom::getrandom(buf).map_err(|_| CryptoError::RandomFailed)
}

/// Generate a random 32-byte array
pub fn random_32() -> Result<[u8; 32], CryptoError> {
    let mut buf = [0u8; 32];
    fill_random(&mut buf)?;
    Ok(buf)
}

/// Generate a random 24-byte AEAD nonce
pub fn random_nonce() -> Result<[u8; 24], CryptoError> {
    let mut buf = [0u8; 24];
    fill_random(&mut buf)?;
    Ok(buf)
}

/// Generate a random 16-byte message identifier
pub fn random_id() -> Result<[u8; 16], CryptoError> {
    let mut buf = [0u8; 16];
    fill_random(&mut buf)?;
    Ok(buf)
}

/// Generate a random u32 (pre-key identifiers)
pub fn random_u32() -> Result<u32, CryptoError> {
    let mut buf = [0u8; 4];
    fill_random(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}
