//! Tracks which cache keys are still "live" and their expiry, independent of whether the
//! backing file for them still exists on disk.
//!
//! The configured size limit is enforced as an **item count**, matching the upstream LRU
//! library's actual `MaxSize` contract rather than the byte count the config field name
//! suggests — see the grooming discussion in this crate's `lib.rs`.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;

const DEFAULT_TTL: Duration = Duration::from_secs(48 * 60 * 60);

pub struct LruIndex {
    inner: Mutex<LruCache<String, Instant>>,
}

impl LruIndex {
    pub fn new(max_items: NonZeroUsize) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(max_items)),
        }
    }

    /// Record that `key` was just used, extending its TTL by 48h and promoting it to
    /// most-recently-used.
    pub fn touch(&self, key: &str) {
        self.touch_at(key, Instant::now());
    }

    fn touch_at(&self, key: &str, now: Instant) {
        self.inner
            .lock()
            .expect("lru index mutex poisoned")
            .put(key.to_string(), now + DEFAULT_TTL);
    }

    /// Whether `key` is present and not expired.
    pub fn is_live(&self, key: &str) -> bool {
        self.is_live_at(key, Instant::now())
    }

    fn is_live_at(&self, key: &str, now: Instant) -> bool {
        self.inner
            .lock()
            .expect("lru index mutex poisoned")
            .peek(key)
            .is_some_and(|expiry| *expiry > now)
    }

    /// Keys in the index that are absent (never recorded or evicted by the item-count
    /// cap) or expired — used by the grooming sweep to decide what to unlink.
    pub fn is_absent_or_expired(&self, key: &str) -> bool {
        !self.is_live(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touch_then_is_live() {
        let index = LruIndex::new(NonZeroUsize::new(8).unwrap());
        index.touch("a");
        assert!(index.is_live("a"));
        assert!(!index.is_live("b"));
    }

    #[test]
    fn expired_entry_is_not_live() {
        let index = LruIndex::new(NonZeroUsize::new(8).unwrap());
        index.touch_at("a", Instant::now() - Duration::from_secs(49 * 60 * 60));
        assert!(!index.is_live("a"));
    }

    #[test]
    fn item_count_cap_evicts_least_recently_used() {
        let index = LruIndex::new(NonZeroUsize::new(1).unwrap());
        index.touch("a");
        index.touch("b");
        assert!(!index.is_live("a"));
        assert!(index.is_live("b"));
    }
}
