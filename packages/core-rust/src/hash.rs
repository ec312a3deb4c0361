//! FNV-1a hashing for stable routing.
//!
//! Client groups are assigned to view-syncer shards by hashing their id, so
//! the hash must not change between releases or processes. `std`'s hashers
//! are randomly seeded and cannot be used for this.

/// FNV-1a offset basis (32-bit).
const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;

/// FNV-1a prime (32-bit).
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a over the UTF-8 bytes of `s`.
///
/// ```
/// use viewsync_core::hash::fnv1a_hash;
///
/// assert_eq!(fnv1a_hash(""), 0x811c_9dc5);
/// assert_eq!(fnv1a_hash("a"), 0xe40c_292c);
/// ```
#[must_use]
pub fn fnv1a_hash(s: &str) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in s.bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Index of the bucket owning `key` among `buckets` buckets. Zero buckets
/// route everything to 0.
#[must_use]
pub fn route(key: &str, buckets: usize) -> usize {
    if buckets == 0 {
        return 0;
    }
    // u32 always fits in usize on supported targets.
    fnv1a_hash(key) as usize % buckets
}
