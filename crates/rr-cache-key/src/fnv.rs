use fnv::FnvHasher;
use std::hash::Hasher;

/// Hex-encoded FNV-1a 64-bit digest of a sequence of parts, hashed in order with a
/// length-prefixed separator so `["ab", "c"]` and `["a", "bc"]` never collide.
///
/// Used where the cache key must match a specific, externally-mandated algorithm rather
/// than [`crate::digest`]'s internal [`seahash`] choice — currently the virtual
/// environment cache key, which folds together a Python version and two pip freeze
/// listings.
pub fn fnv_digest<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    let mut hasher = FnvHasher::default();
    for part in parts {
        hasher.write_usize(part.len());
        hasher.write(part.as_bytes());
    }
    hex::encode(hasher.finish().to_le_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_parts_hash_identically() {
        let a = fnv_digest(["3.11", "numpy==1.26.0", ""]);
        let b = fnv_digest(["3.11", "numpy==1.26.0", ""]);
        assert_eq!(a, b);
    }

    #[test]
    fn length_prefix_prevents_boundary_collisions() {
        let a = fnv_digest(["ab", "c"]);
        let b = fnv_digest(["a", "bc"]);
        assert_ne!(a, b);
    }

    #[test]
    fn differing_python_version_changes_digest() {
        let a = fnv_digest(["3.11", "numpy==1.26.0", ""]);
        let b = fnv_digest(["3.12", "numpy==1.26.0", ""]);
        assert_ne!(a, b);
    }
}
