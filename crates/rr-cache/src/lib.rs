//! A content-addressed local disk cache sitting in front of an upstream [`Storage`]
//! backend: downloads are deduplicated across concurrent callers (in-process
//! singleflight), content lives under its upstream hash, and unused entries are groomed
//! off disk on a timer.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rr_storage::{LocalFileStorage, Storage};
use rr_warnings::Warnings;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod lru_index;
mod singleflight;

pub use lru_index::LruIndex;
pub use singleflight::SingleFlight;

const MAX_ATTEMPTS_PER_SIDE: u32 = 3;
const GROOM_PERIOD: Duration = Duration::from_secs(30);
const GROOM_JITTER: Duration = Duration::from_secs(3);
const REMOVED_SEND_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("no backing directory configured")]
    NotConfigured,
    #[error("failed to resolve upstream hash for {0:?}: {1}")]
    Hash(String, rr_storage::StorageError),
    #[error("exceeded retry budget ({attempts} attempts) fetching {name:?}")]
    RetryBudgetExceeded { name: String, attempts: u32 },
    #[error("waiting for download of {0:?} was cancelled")]
    Cancelled(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The artifact cache: a disk-backed, singleflight-deduplicated mirror of an upstream
/// [`Storage`].
pub struct ArtifactCache<S: Storage> {
    storage: Arc<S>,
    backing: Option<PathBuf>,
    lru: LruIndex,
    downloads: SingleFlight<()>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl<S: Storage + 'static> ArtifactCache<S> {
    /// `backing` is the local directory to mirror content into; `None` disables caching
    /// and every fetch passes straight through to `storage`. `max_items` bounds the LRU
    /// index by entry count (see [`LruIndex`] for why this is a count, not a byte size).
    pub fn new(storage: Arc<S>, backing: Option<PathBuf>, max_items: NonZeroUsize) -> Self {
        Self {
            storage,
            backing,
            lru: LruIndex::new(max_items),
            downloads: SingleFlight::new(),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
        }
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }

    /// Materialize the upstream object `name` at `output_path`, using the local cache
    /// when configured. `unpack` requests archive extraction rather than a verbatim copy.
    /// `max_bytes`, if set, caps (and truncates) how much of the object is written.
    pub async fn fetch(
        &self,
        name: &str,
        unpack: bool,
        output_path: &Path,
        max_bytes: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<(u64, Warnings), CacheError> {
        let mut warnings = Warnings::new();

        let Some(backing) = &self.backing else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
            debug!(name, "cache disabled, passing through to upstream");
            let size = fetch_from(&*self.storage, name, unpack, output_path, max_bytes).await?;
            return Ok((size, warnings));
        };

        let hash = self
            .storage
            .hash(name)
            .await
            .map_err(|err| CacheError::Hash(name.to_string(), err))?;
        let cache_key = format!("{hash}{}", extension_of(name));
        self.lru.touch(&cache_key);

        let local_view = LocalFileStorage::new(backing);
        let mut local_attempts = 0u32;
        let mut download_attempts = 0u32;
        let mut probed_once = false;

        loop {
            if cancel.is_cancelled() {
                return Err(CacheError::Cancelled(name.to_string()));
            }

            let local_path = backing.join(&cache_key);
            if fs_err::tokio::metadata(&local_path).await.is_ok() {
                local_attempts += 1;
                let first_probe = !probed_once;
                probed_once = true;

                match fetch_from(&local_view, &cache_key, unpack, output_path, max_bytes).await {
                    Ok(size) => {
                        if first_probe {
                            self.cache_hits.fetch_add(1, Ordering::Relaxed);
                            info!(counter.runner_cache_hits = 1u64, hash, "cache hit");
                        }
                        return Ok((size, warnings));
                    }
                    Err(err) => {
                        warnings.push(format!("local cache read of {cache_key:?} failed: {err}"));
                        if local_attempts >= MAX_ATTEMPTS_PER_SIDE {
                            return Err(CacheError::RetryBudgetExceeded {
                                name: name.to_string(),
                                attempts: local_attempts,
                            });
                        }
                    }
                }
            } else {
                self.cache_misses.fetch_add(1, Ordering::Relaxed);
                debug!(counter.runner_cache_misses = 1u64, hash, "cache miss");
            }

            download_attempts += 1;
            if download_attempts > MAX_ATTEMPTS_PER_SIDE {
                return Err(CacheError::RetryBudgetExceeded {
                    name: name.to_string(),
                    attempts: download_attempts,
                });
            }

            if self.downloads.register(&cache_key) {
                match self
                    .download_into(name, backing, &cache_key, unpack, output_path, max_bytes)
                    .await
                {
                    Ok(size) => {
                        self.lru.touch(&cache_key);
                        self.downloads.done(&cache_key, ());
                        // The download already streamed through a tap straight into
                        // `output_path`, so the caller's copy is in place now; no need to
                        // loop back and re-probe the local cache for it.
                        return Ok((size, warnings));
                    }
                    Err(err) => {
                        warnings.push(format!("download of {name:?} failed: {err}"));
                        self.downloads.cancel(&cache_key);
                    }
                }
            } else {
                match self.downloads.wait(&cache_key).await {
                    // The winner materialized its own output_path, not ours; loop back and
                    // serve this caller from the now-promoted local cache entry.
                    Some(_) => {}
                    None => {
                        warnings.push(format!("concurrent download of {name:?} was cancelled"));
                    }
                }
            }
        }
    }

    /// Single-object identifier lookup, forwarded to the upstream store.
    pub async fn hash(&self, name: &str) -> Result<String, CacheError> {
        self.storage
            .hash(name)
            .await
            .map_err(|err| CacheError::Hash(name.to_string(), err))
    }

    /// Download `name` into `output_path` (or `output_dir` for `unpack`), streaming the
    /// upstream read through a tap into `<backing>/.partial/<cache_key>` in the same pass
    /// so the object is persisted to the cache and materialized for the caller with a
    /// single upstream fetch, then promotes the partial file into the backing store.
    async fn download_into(
        &self,
        name: &str,
        backing: &Path,
        cache_key: &str,
        unpack: bool,
        output_path: &Path,
        max_bytes: Option<u64>,
    ) -> Result<u64, CacheError> {
        let partial_dir = backing.join(".partial");
        fs_err::tokio::create_dir_all(&partial_dir).await?;
        let partial_path = partial_dir.join(cache_key);

        // Claim the partial path exclusively. Concurrent callers in this process never
        // reach here for the same key (the singleflight registration above already
        // serialized them); this mainly guards against a stale partial left by a
        // previous crashed attempt.
        let claim = fs_err::tokio::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&partial_path)
            .await;
        let mut partial_file = match claim {
            Ok(file) => file,
            Err(err) => {
                warn!(cache_key, %err, "stale .partial file blocked a fresh download, removing it");
                fs_err::tokio::remove_file(&partial_path).await?;
                fs_err::tokio::File::create(&partial_path).await?
            }
        };

        let result = if unpack {
            self.storage
                .gather(name, output_path, max_bytes, Some(&mut partial_file))
                .await
        } else {
            self.storage
                .fetch(name, output_path, max_bytes, Some(&mut partial_file))
                .await
        };
        drop(partial_file);

        match result {
            Ok(size) => {
                let dest = backing.join(cache_key);
                fs_err::tokio::rename(&partial_path, &dest).await?;
                Ok(size)
            }
            Err(err) => {
                let _ = fs_err::tokio::remove_file(&partial_path).await;
                Err(CacheError::Io(std::io::Error::other(err.to_string())))
            }
        }
    }

    /// Remove all non-hidden regular files from the backing directory. Existing LRU
    /// entries become dangling and simply resolve to misses on next access.
    pub async fn clear_object_store(&self) -> Result<(), CacheError> {
        let Some(backing) = &self.backing else {
            return Ok(());
        };
        let mut entries = fs_err::tokio::read_dir(backing).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') {
                continue;
            }
            if entry.file_type().await?.is_file() {
                fs_err::tokio::remove_file(entry.path()).await?;
            }
        }
        Ok(())
    }

    /// Run the grooming sweep forever, paced by a jittered 30s/3s [`rr_trigger::Trigger`].
    /// Unlinked cache keys are reported on a bounded channel for observability; sends that
    /// can't complete within one second are dropped rather than blocking the sweep.
    pub async fn run_groomer(self: Arc<Self>, removed: mpsc::Sender<String>) {
        let mut trigger = rr_trigger::Trigger::start(GROOM_PERIOD, GROOM_JITTER, None);
        while trigger.recv().await.is_some() {
            if let Err(err) = self.groom_once(&removed).await {
                warn!(%err, "cache groom sweep failed");
            }
        }
    }

    async fn groom_once(&self, removed: &mpsc::Sender<String>) -> Result<(), CacheError> {
        let Some(backing) = &self.backing else {
            return Ok(());
        };
        let mut entries = fs_err::tokio::read_dir(backing).await?;
        let mut stale = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy().into_owned();
            if name.starts_with('.') || !entry.file_type().await?.is_file() {
                continue;
            }
            if self.lru.is_absent_or_expired(&name) {
                stale.push(name);
            }
        }

        for name in stale {
            fs_err::tokio::remove_file(backing.join(&name)).await?;
            match tokio::time::timeout(REMOVED_SEND_TIMEOUT, removed.send(name.clone())).await {
                Ok(Ok(())) => {}
                _ => debug!(name, "groomer removed-channel send dropped (no listener)"),
            }
        }
        Ok(())
    }
}

async fn fetch_from<S: Storage>(
    storage: &S,
    name: &str,
    unpack: bool,
    output_path: &Path,
    max_bytes: Option<u64>,
) -> Result<u64, CacheError> {
    if unpack {
        storage
            .gather(name, output_path, max_bytes, None)
            .await
            .map_err(|err| CacheError::Io(std::io::Error::other(err.to_string())))
    } else {
        storage
            .fetch(name, output_path, max_bytes, None)
            .await
            .map_err(|err| CacheError::Io(std::io::Error::other(err.to_string())))
    }
}

fn extension_of(name: &str) -> String {
    Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.split_once('.'))
        .map(|(_, ext)| format!(".{ext}"))
        .unwrap_or_default()
}
