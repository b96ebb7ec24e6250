//! Watches a directory of SSH authorized-keys files — one per queue name — and resolves
//! queue names to the fingerprint of the key an operator deposited for them.
//!
//! The in-memory mapping is rebuilt off to the side on every rescan and then swapped in
//! atomically, so lookups never observe a half-updated map while a rescan is in flight.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum SigError {
    #[error("no signature stored for queue {0:?}")]
    NotFound(String),
    #[error("malformed authorized-keys entry in {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },
    #[error("failed to watch {path}: {source}")]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
struct Entry {
    public_key: String,
    fingerprint: String,
}

/// A live view over a directory of authorized-keys files.
pub struct SignatureStore {
    dir: PathBuf,
    entries: RwLock<HashMap<String, Entry>>,
    // Held only to keep the OS watch alive for the store's lifetime.
    _watcher: RecommendedWatcher,
}

impl SignatureStore {
    /// Perform an initial scan of `dir`, then start watching it for changes and
    /// rescanning every `rescan_interval` regardless, returning a handle shared with the
    /// background task.
    pub async fn watch(dir: impl Into<PathBuf>, rescan_interval: Duration) -> Result<Arc<Self>, SigError> {
        let dir = dir.into();
        fs_err::create_dir_all(&dir)?;

        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let watcher_dir = dir.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(_event) => {
                    let _ = tx.send(());
                }
                Err(err) => warn!(dir = %watcher_dir.display(), %err, "signature directory watch error"),
            }
        })
        .map_err(|source| SigError::Watch { path: dir.clone(), source })?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|source| SigError::Watch { path: dir.clone(), source })?;

        let store = Arc::new(Self {
            dir: dir.clone(),
            entries: RwLock::new(HashMap::new()),
            _watcher: watcher,
        });
        store.rescan()?;

        let background = Arc::clone(&store);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(rescan_interval);
            ticker.tick().await; // first tick fires immediately; the initial scan already ran
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    maybe = rx.recv() => {
                        if maybe.is_none() {
                            return;
                        }
                    }
                }
                if let Err(err) = background.rescan() {
                    warn!(dir = %background.dir.display(), %err, "signature directory rescan failed");
                }
            }
        });

        Ok(store)
    }

    /// Build from an already-populated directory without spawning a watcher — useful for
    /// one-shot tools and tests.
    pub fn load(dir: impl Into<PathBuf>) -> Result<Self, SigError> {
        let store = Self {
            dir: dir.into(),
            entries: RwLock::new(HashMap::new()),
            _watcher: notify::recommended_watcher(|_: notify::Result<notify::Event>| {})
                .expect("constructing a no-op watcher never fails"),
        };
        store.rescan()?;
        Ok(store)
    }

    fn rescan(&self) -> Result<(), SigError> {
        let mut fresh = HashMap::new();
        for entry in fs_err::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if !entry.file_type()?.is_file() {
                continue;
            }
            let Some(queue_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let contents = fs_err::read_to_string(&path)?;
            let parsed = parse_authorized_key(contents.trim(), &path)?;
            fresh.insert(queue_name.to_string(), parsed);
        }

        let count = fresh.len();
        *self.entries.write().expect("signature map lock poisoned") = fresh;
        debug!(dir = %self.dir.display(), count, "signature directory rescanned");
        Ok(())
    }

    /// Exact-match lookup: the fingerprint for a key stored under exactly `queue_name`.
    pub fn get(&self, queue_name: &str) -> Result<String, SigError> {
        self.entries
            .read()
            .expect("signature map lock poisoned")
            .get(queue_name)
            .map(|e| e.fingerprint.clone())
            .ok_or_else(|| SigError::NotFound(queue_name.to_string()))
    }

    /// Longest-prefix-match lookup: the entry for the longest stored name that is a
    /// prefix of `queue_name`. Lets an operator authorize a whole family of queues
    /// (`project_team_`) with one key.
    pub fn select(&self, queue_name: &str) -> Result<String, SigError> {
        let entries = self.entries.read().expect("signature map lock poisoned");
        entries
            .iter()
            .filter(|(name, _)| queue_name.starts_with(name.as_str()))
            .max_by_key(|(name, _)| name.len())
            .map(|(_, entry)| entry.fingerprint.clone())
            .ok_or_else(|| SigError::NotFound(queue_name.to_string()))
    }

    /// The raw authorized-keys-formatted public key stored for `queue_name`, if any.
    pub fn public_key(&self, queue_name: &str) -> Option<String> {
        self.entries
            .read()
            .expect("signature map lock poisoned")
            .get(queue_name)
            .map(|e| e.public_key.clone())
    }
}

fn parse_authorized_key(line: &str, path: &Path) -> Result<Entry, SigError> {
    let malformed = |reason: &str| SigError::Malformed {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };

    let blob_b64 = line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| malformed("expected \"<type> <base64> [comment]\""))?;
    let blob = STANDARD
        .decode(blob_b64)
        .map_err(|err| malformed(&format!("invalid base64: {err}")))?;
    let digest = Sha256::digest(&blob);
    let fingerprint = format!("SHA256:{}", STANDARD_NO_PAD.encode(digest));

    Ok(Entry {
        public_key: line.to_string(),
        fingerprint,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_key(dir: &Path, name: &str, key: &str) {
        fs_err::write(dir.join(name), key).unwrap();
    }

    #[test]
    fn fingerprint_matches_known_ed25519_key() {
        let dir = tempfile::tempdir().unwrap();
        write_key(
            dir.path(),
            "rmq_ingest",
            "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIFITo06Pk8sqCMoMHPaQiQ7BY3pjf7OE8BDcsnYozmIG kmutch@awsdev",
        );
        let store = SignatureStore::load(dir.path()).unwrap();
        assert_eq!(
            store.get("rmq_ingest").unwrap(),
            "SHA256:rM9uPGQWiB8BrF542H5tJdVQoWU2+jw00w1KnXjywTY"
        );
    }

    #[test]
    fn get_is_exact_match_only() {
        let dir = tempfile::tempdir().unwrap();
        let key = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIFITo06Pk8sqCMoMHPaQiQ7BY3pjf7OE8BDcsnYozmIG x";
        for name in ["rmq_", "rmq_karl", "rmq_andrei", "rmq_k", "rmq_ka", "rmq_kar", "rmq_donn", "rmq_do"] {
            write_key(dir.path(), name, key);
        }
        let store = SignatureStore::load(dir.path()).unwrap();
        assert!(store.get("rmq_karlx").is_err());
    }

    #[test]
    fn select_is_longest_prefix_cascade() {
        let dir = tempfile::tempdir().unwrap();
        let key = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIFITo06Pk8sqCMoMHPaQiQ7BY3pjf7OE8BDcsnYozmIG x";
        for name in ["rmq_", "rmq_karl", "rmq_andrei", "rmq_k", "rmq_ka", "rmq_kar", "rmq_donn", "rmq_do"] {
            write_key(dir.path(), name, key);
        }
        let store = SignatureStore::load(dir.path()).unwrap();

        let expected = store.get("rmq_karl").unwrap();
        assert_eq!(store.select("rmq_karlx").unwrap(), expected);

        let expected = store.get("rmq_andrei").unwrap();
        assert_eq!(store.select("rmq_andrei_andrei").unwrap(), expected);

        assert!(store.select("r").is_err());
    }
}
