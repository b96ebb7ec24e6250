//! Composition root: wires the cache, virtualenv, queue, and signature-store crates
//! together from a [`RunnerConfig`], and starts their background maintenance tasks.

pub mod config;
mod directories;
pub mod logging;

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rr_cache::ArtifactCache;
use rr_queue::LocalQueue;
use rr_sig::SignatureStore;
use rr_storage::Storage;
use rr_venv::VirtualEnvCache;
use tokio::sync::mpsc;

pub use config::{ConfigError, RunnerConfig};
pub use directories::{resolve_directory, DirectoryError};

const SIG_RESCAN_INTERVAL: Duration = Duration::from_secs(60);
/// Groomed cache keys are reported here; the composition root just logs them, since
/// metric registration into a live registry is an integration the caller owns.
const REMOVED_CHANNEL_CAPACITY: usize = 64;

pub struct Runner<S: Storage + 'static> {
    pub cache: Arc<ArtifactCache<S>>,
    pub venv: Arc<VirtualEnvCache>,
    pub queue: Arc<LocalQueue>,
    pub sig: Arc<SignatureStore>,
}

impl<S: Storage + 'static> Runner<S> {
    /// Resolve all configured directories, construct every subsystem, and spawn their
    /// background tasks (cache groomer, venv cleaner, signature-directory watch).
    pub async fn bootstrap(config: &RunnerConfig, storage: Arc<S>) -> anyhow::Result<Self> {
        let cache_dir = resolve_directory(config.cache_dir.as_deref(), "RUNNER_CACHE_DIR", "cache")
            .context("resolving cache directory")?;
        let venv_root = resolve_directory(config.venv_root.as_deref(), "RUNNER_VENV_ROOT", "venv")
            .context("resolving venv root")?;
        let queue_root = resolve_directory(config.queue_root.as_deref(), "RUNNER_QUEUE_ROOT", "queue")
            .context("resolving queue root")?;
        let sig_dir = resolve_directory(config.sig_dir.as_deref(), "RUNNER_SIG_DIR", "sig")
            .context("resolving signature directory")?;

        let max_items =
            NonZeroUsize::new(config.cache_max_items()).context("cache_max_items must be nonzero")?;
        let cache = Arc::new(ArtifactCache::new(storage, Some(cache_dir), max_items));

        let venv = VirtualEnvCache::with_max_unused_period(
            venv_root,
            Duration::from_secs(config.venv_max_unused_period_secs()),
        );

        let queue = Arc::new(LocalQueue::new(queue_root));

        let sig = SignatureStore::watch(sig_dir, SIG_RESCAN_INTERVAL)
            .await
            .context("starting signature directory watch")?;

        let (removed_tx, mut removed_rx) = mpsc::channel(REMOVED_CHANNEL_CAPACITY);
        tokio::spawn({
            let cache = Arc::clone(&cache);
            async move { cache.run_groomer(removed_tx).await }
        });
        tokio::spawn(async move {
            while let Some(cache_key) = removed_rx.recv().await {
                tracing::debug!(cache_key, "groomed stale cache entry");
            }
        });
        tokio::spawn(Arc::clone(&venv).run_cleaner());

        Ok(Self { cache, venv, queue, sig })
    }
}
