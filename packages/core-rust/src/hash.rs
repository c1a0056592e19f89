//! FNV-1a hash utilities for content-based idempotency keys.
//!
//! The hash is a 32-bit non-cryptographic FNV-1a over raw bytes. It is only
//! used as the last-resort idempotency key when a delivery carries neither a
//! delivery id nor a correlation id, so collisions are tolerated: two distinct
//! messages with the same hash may be treated as duplicates, and two
//! content-identical messages are always treated as the same attempt.

/// FNV-1a offset basis (32-bit).
const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;

/// FNV-1a prime (32-bit).
const FNV_PRIME: u32 = 0x0100_0193;

/// Computes a 32-bit FNV-1a hash over a byte slice.
///
/// # Examples
///
/// ```
/// use courier_core::hash::fnv1a_hash;
///
/// assert_eq!(fnv1a_hash(b"hello"), 1_335_831_723);
/// assert_eq!(fnv1a_hash(b""), 2_166_136_261); // FNV offset basis
/// ```
#[must_use]
pub fn fnv1a_hash(bytes: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for &byte in bytes {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Renders a hash as a fixed-width lowercase hex string (8 characters).
#[must_use]
pub fn hash_hex(hash: u32) -> String {
    format!("{hash:08x}")
}
