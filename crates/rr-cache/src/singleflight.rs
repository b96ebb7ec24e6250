//! Run a job only once per key and let concurrent callers await the same result.
//!
//! Grounded on the `once-map` crate's `CacheMap`: a plain mutex-guarded hash map storing
//! either a waiting [`tokio::sync::Notify`] or the filled value, so multiple download
//! attempts for the same cache key collapse into one in-flight future.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;
use tokio::sync::Notify;

enum Slot<V> {
    Waiting(Arc<Notify>),
    Filled(Arc<V>),
}

/// A process-wide registry of in-flight jobs keyed by `K`.
pub struct SingleFlight<V> {
    items: Mutex<FxHashMap<String, Slot<V>>>,
}

impl<V> Default for SingleFlight<V> {
    fn default() -> Self {
        Self {
            items: Mutex::new(HashMap::default()),
        }
    }
}

impl<V> SingleFlight<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register intent to start a job for `key`.
    ///
    /// Returns `true` if the caller is now responsible for running the job and calling
    /// [`SingleFlight::done`] or [`SingleFlight::cancel`] — otherwise another caller is
    /// already working on it and this caller should [`SingleFlight::wait`].
    pub fn register(&self, key: &str) -> bool {
        let mut lock = self.items.lock().expect("singleflight mutex poisoned");
        if lock.contains_key(key) {
            return false;
        }
        lock.insert(key.to_string(), Slot::Waiting(Arc::new(Notify::new())));
        true
    }

    /// Submit the successful result of a job this caller registered.
    pub fn done(&self, key: &str, value: V) {
        let mut lock = self.items.lock().expect("singleflight mutex poisoned");
        if let Some(Slot::Waiting(notify)) = lock.insert(key.to_string(), Slot::Filled(Arc::new(value))) {
            notify.notify_waiters();
        }
    }

    /// Abandon a job this caller registered, waking any waiters so they can retry
    /// (typically by re-registering themselves).
    pub fn cancel(&self, key: &str) {
        let mut lock = self.items.lock().expect("singleflight mutex poisoned");
        if let Some(Slot::Waiting(notify)) = lock.remove(key) {
            notify.notify_waiters();
        }
    }

    /// Wait for the result of a job that's already running. Returns `None` if the job was
    /// cancelled rather than completed.
    pub async fn wait(&self, key: &str) -> Option<Arc<V>> {
        let notify = {
            let lock = self.items.lock().expect("singleflight mutex poisoned");
            match lock.get(key) {
                Some(Slot::Filled(value)) => return Some(Arc::clone(value)),
                Some(Slot::Waiting(notify)) => Arc::clone(notify),
                None => return None,
            }
        };

        notify.notified().await;

        let lock = self.items.lock().expect("singleflight mutex poisoned");
        match lock.get(key) {
            Some(Slot::Filled(value)) => Some(Arc::clone(value)),
            _ => None,
        }
    }
}
