//! The location hash.
//!
//! Locations must be the same in every process and every build of a target,
//! so this is a fixed 32-bit FNV-1a and never the (randomly keyed) std hasher.

const FNV_OFFSET_BASIS: u32 = 0x811C9DC5;
const FNV_PRIME: u32 = 0x01000193;

/// FNV-1a over the UTF-8 bytes of `key`, followed by the bytes of `seed`,
/// least significant first, until no set bits remain.
///
/// ```
/// # use libafl_forkrt::hash::fnv1a;
/// assert_eq!(fnv1a("", 0), 2166136261);
/// assert_eq!(fnv1a("moo", 23), 3934561083);
/// ```
#[must_use]
pub fn fnv1a(key: &str, seed: u64) -> u32 {
    let mut h = FNV_OFFSET_BASIS;
    for &byte in key.as_bytes() {
        h = step(h, byte);
    }
    feed(h, seed)
}

/// Continue a hash with the bytes of `value`, in the same way [`fnv1a`]
/// consumes its seed.
#[must_use]
pub fn feed(mut h: u32, mut value: u64) -> u32 {
    while value > 0 {
        h = step(h, value as u8);
        value >>= 8;
    }
    h
}

#[inline]
fn step(h: u32, byte: u8) -> u32 {
    (h ^ u32::from(byte)).wrapping_mul(FNV_PRIME)
}
