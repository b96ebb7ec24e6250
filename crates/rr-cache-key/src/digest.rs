use crate::cache_key::{CacheKey, CacheKeyHasher};
use std::hash::Hasher;

/// Compute a hex string digest of a [`CacheKey`] object, stable across releases and
/// platforms.
pub fn digest<H: CacheKey>(hashable: &H) -> String {
    let mut hasher = CacheKeyHasher::new();
    hashable.cache_key(&mut hasher);
    to_hex(hasher.finish())
}

fn to_hex(num: u64) -> String {
    hex::encode(num.to_le_bytes())
}
