//! Constant-time comparisons.
//!
//! Authentication tags and authenticators are compared with these
//! helpers; execution time depends only on length, not content.

use subtle::ConstantTimeEq;

/// Constant-time comparison of byte slices.
///
/// Returns `true` if slices are equal, `false` otherwise.
#[must_use]
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    a.ct_eq(b).into()
}

/// Timing-safe 16-byte tag comparison.
#[must_use]
#[inline(never)]
pub fn verify_16(a: &[u8; 16], b: &[u8; 16]) -> bool {
    ct_eq(a, b)
}

/// Timing-safe 32-byte key comparison.
#[must_use]
#[inline(never)]
pub fn verify_32(a: &[u8; 32], b: &[u8; 32]) -> bool {
    ct_eq(a, b)
}
