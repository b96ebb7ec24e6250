//! A cache of on-disk pyenv virtualenvs, keyed by the exact (groomed) package list that
//! was installed into them. Callers lease an entry by `unique_id` for the duration of a
//! run; an entry with no lessees for longer than `max_unused_period` is torn down by a
//! background cleaner.

mod grooming;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rr_cache_key::fnv_digest;
use tracing::{info, warn};

const GENVENV_TEMPLATE: &str = include_str!("templates/genvenv.sh.tmpl");
const RMVENV_TEMPLATE: &str = include_str!("templates/rmvenv.sh.tmpl");

const CLEAN_PERIOD: Duration = Duration::from_secs(5 * 60);
const CLEAN_JITTER: Duration = Duration::from_secs(30);
const DEFAULT_MAX_UNUSED_PERIOD: Duration = Duration::from_secs(2 * 60 * 60);
const INSTALL_RETRY_SENTINEL_EXIT: &str = "after 3 attempts";

#[derive(Debug, thiserror::Error)]
pub enum VenvError {
    #[error("virtualenv build script for {0:?} failed: {1}")]
    BuildFailed(String, String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// What a caller wants installed, before grooming.
#[derive(Debug, Clone)]
pub struct VirtualEnvRequest {
    pub python_version: String,
    pub general: Vec<String>,
    pub configured: Vec<String>,
}

/// Resource allocation context that affects which packages get installed, without being
/// part of the caller's explicit request.
#[derive(Debug, Clone, Copy, Default)]
pub struct Allocation {
    pub gpu: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Generating,
    Ready,
    Invalid,
    /// Was `Ready`, then explicitly invalidated via [`VirtualEnvCache::invalidate`].
    /// Unlike `Invalid` (the build itself never produced a usable environment), a
    /// `Stale` entry may still have a virtualenv on disk, but it's no longer trusted and
    /// is never leasable again.
    Stale,
}

/// A lease-able handle to a cached virtualenv.
#[derive(Debug, Clone)]
pub struct VirtualEnvEntry {
    pub unique_id: String,
}

struct EntryState {
    status: Status,
    num_clients: i64,
    num_used: u64,
    last_used: Instant,
}

struct Entry {
    unique_id: String,
    state: Mutex<EntryState>,
}

pub struct VirtualEnvCache {
    root: PathBuf,
    max_unused_period: Duration,
    entries: Mutex<HashMap<String, Arc<Entry>>>,
}

impl VirtualEnvCache {
    pub fn new(root: impl Into<PathBuf>) -> Arc<Self> {
        Self::with_max_unused_period(root, DEFAULT_MAX_UNUSED_PERIOD)
    }

    pub fn with_max_unused_period(root: impl Into<PathBuf>, max_unused_period: Duration) -> Arc<Self> {
        Arc::new(Self {
            root: root.into(),
            max_unused_period,
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// Look up or begin building the virtualenv for `request` under `allocation`.
    ///
    /// If the entry already exists (ready, generating, or invalid) it's returned
    /// immediately with its `last_used` timestamp refreshed. Otherwise a new entry is
    /// inserted in the `Generating` state and a build task is spawned in the background;
    /// callers must poll readiness via [`VirtualEnvCache::add_client`].
    pub fn get_entry(
        self: &Arc<Self>,
        request: &VirtualEnvRequest,
        allocation: Allocation,
        experiment_dir: &Path,
    ) -> VirtualEnvEntry {
        let general = grooming::groom_pip_list(&request.general, allocation.gpu);
        let configured = grooming::groom_pip_list(&request.configured, allocation.gpu);
        let unique_id = cache_key(&request.python_version, &general, &configured);

        let entry = {
            let mut entries = self.entries.lock().expect("venv cache mutex poisoned");
            if let Some(entry) = entries.get(&unique_id) {
                entry.state.lock().expect("venv entry mutex poisoned").last_used = Instant::now();
                return VirtualEnvEntry { unique_id };
            }
            let entry = Arc::new(Entry {
                unique_id: unique_id.clone(),
                state: Mutex::new(EntryState {
                    status: Status::Generating,
                    num_clients: -1,
                    num_used: 0,
                    last_used: Instant::now(),
                }),
            });
            entries.insert(unique_id.clone(), Arc::clone(&entry));
            entry
        };

        let cache = Arc::clone(self);
        let python_version = request.python_version.clone();
        let experiment_dir = experiment_dir.to_path_buf();
        tokio::spawn(async move {
            let result = cache
                .build(&entry.unique_id, &python_version, &general, &configured, &experiment_dir)
                .await;
            let mut state = entry.state.lock().expect("venv entry mutex poisoned");
            match result {
                Ok(()) => {
                    state.status = Status::Ready;
                    state.num_clients = -1;
                    state.last_used = Instant::now();
                    info!(unique_id = %entry.unique_id, "virtualenv ready");
                }
                Err(err) => {
                    warn!(unique_id = %entry.unique_id, %err, "virtualenv build failed");
                    state.status = Status::Invalid;
                    state.num_clients = 0;
                    state.last_used = Instant::now();
                }
            }
        });

        VirtualEnvEntry { unique_id }
    }

    /// Lease `unique_id` for `client_id`. Returns `(unique_id, false)` if the entry is
    /// missing, still generating, or invalid.
    pub fn add_client(&self, unique_id: &str, _client_id: &str) -> (String, bool) {
        let entries = self.entries.lock().expect("venv cache mutex poisoned");
        let Some(entry) = entries.get(unique_id) else {
            return (unique_id.to_string(), false);
        };
        let mut state = entry.state.lock().expect("venv entry mutex poisoned");
        if state.status != Status::Ready {
            return (unique_id.to_string(), false);
        }
        state.num_clients = if state.num_clients == -1 { 1 } else { state.num_clients + 1 };
        state.num_used += 1;
        state.last_used = Instant::now();
        (unique_id.to_string(), true)
    }

    /// Release a lease acquired via [`VirtualEnvCache::add_client`].
    pub fn remove_client(&self, unique_id: &str, _client_id: &str) {
        let entries = self.entries.lock().expect("venv cache mutex poisoned");
        if let Some(entry) = entries.get(unique_id) {
            let mut state = entry.state.lock().expect("venv entry mutex poisoned");
            if state.status == Status::Ready && state.num_clients > 0 {
                state.num_clients -= 1;
            }
        }
    }

    /// Mark a `Ready` entry `Stale`: it stops being leasable and is torn down by the next
    /// cleaner sweep regardless of `max_unused_period`, without waiting for existing
    /// lessees to finish (the cleaner still only removes it once `num_clients == 0`). A
    /// no-op if the entry is missing or already not `Ready`.
    pub fn invalidate(&self, unique_id: &str) {
        let entries = self.entries.lock().expect("venv cache mutex poisoned");
        if let Some(entry) = entries.get(unique_id) {
            let mut state = entry.state.lock().expect("venv entry mutex poisoned");
            if state.status == Status::Ready {
                state.status = Status::Stale;
                warn!(unique_id, "virtualenv entry invalidated");
            }
        }
    }

    /// Run the 5-minute-paced eviction sweep forever.
    pub async fn run_cleaner(self: Arc<Self>) {
        let mut trigger = rr_trigger::Trigger::start(CLEAN_PERIOD, CLEAN_JITTER, None);
        while trigger.recv().await.is_some() {
            self.clean_once().await;
        }
    }

    async fn clean_once(&self) {
        let now = Instant::now();
        let condemned: Vec<Arc<Entry>> = {
            let entries = self.entries.lock().expect("venv cache mutex poisoned");
            entries
                .values()
                .filter(|entry| {
                    let state = entry.state.lock().expect("venv entry mutex poisoned");
                    if state.num_clients != 0 {
                        return false;
                    }
                    matches!(state.status, Status::Invalid | Status::Stale)
                        || now.duration_since(state.last_used) > self.max_unused_period
                })
                .cloned()
                .collect()
        };

        for entry in condemned {
            {
                let mut entries = self.entries.lock().expect("venv cache mutex poisoned");
                entries.remove(&entry.unique_id);
            }
            if let Err(err) = self.delete_venv(&entry.unique_id).await {
                warn!(unique_id = %entry.unique_id, %err, "virtualenv delete script failed");
            }
        }
    }

    async fn build(
        &self,
        unique_id: &str,
        python_version: &str,
        general: &[String],
        configured: &[String],
        experiment_dir: &Path,
    ) -> Result<(), VenvError> {
        let script = GENVENV_TEMPLATE
            .replace("{{ PYTHON_VERSION_PREFIX }}", python_version)
            .replace("{{ VENV_NAME }}", unique_id)
            .replace("{{ GENERAL_PACKAGES }}", &quote_all(general))
            .replace("{{ CONFIGURED_PACKAGES }}", &quote_all(configured));
        let script_path = rr_fs::write_atomic(
            &self.scripts_dir(),
            &format!("genvenv-{unique_id}.sh"),
            script.as_bytes(),
        )?;
        make_executable(&script_path)?;

        let output = tokio::process::Command::new("bash")
            .arg(&script_path)
            .current_dir(experiment_dir)
            .output()
            .await?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(VenvError::BuildFailed(unique_id.to_string(), stderr.trim().to_string()))
        }
    }

    async fn delete_venv(&self, unique_id: &str) -> Result<(), VenvError> {
        let script = RMVENV_TEMPLATE.replace("{{ VENV_NAME }}", unique_id);
        let script_path = rr_fs::write_atomic(
            &self.scripts_dir(),
            &format!("rmvenv-{unique_id}.sh"),
            script.as_bytes(),
        )?;
        make_executable(&script_path)?;

        let output = tokio::process::Command::new("bash").arg(&script_path).output().await?;
        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(VenvError::BuildFailed(unique_id.to_string(), stderr.trim().to_string()))
        }
    }

    fn scripts_dir(&self) -> PathBuf {
        self.root.join("scripts")
    }
}

fn cache_key(python_version: &str, general: &[String], configured: &[String]) -> String {
    let mut parts = vec![python_version];
    parts.extend(general.iter().map(String::as_str));
    parts.extend(configured.iter().map(String::as_str));
    fnv_digest(parts)
}

fn quote_all(packages: &[String]) -> String {
    packages
        .iter()
        .map(|pkg| format!("\"{pkg}\""))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(target_family = "unix")]
fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs_err::set_permissions(path, std::fs::Permissions::from_mode(0o700))
}

#[cfg(not(target_family = "unix"))]
fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn request() -> VirtualEnvRequest {
        VirtualEnvRequest {
            python_version: "3.11".to_string(),
            general: vec!["requests==2.31.0".to_string()],
            configured: vec!["pipdeptree==2.0.0".to_string()],
        }
    }

    #[test]
    fn same_request_and_allocation_yields_the_same_cache_key() {
        let a = cache_key("3.11", &["requests".to_string()], &["x".to_string()]);
        let b = cache_key("3.11", &["requests".to_string()], &["x".to_string()]);
        assert_eq!(a, b);
    }

    #[test]
    fn gpu_allocation_changes_the_cache_key_via_grooming() {
        let cpu = grooming::groom_pip_list(&["tensorflow".to_string()], false);
        let gpu = grooming::groom_pip_list(&["tensorflow".to_string()], true);
        assert_ne!(
            cache_key("3.11", &cpu, &[]),
            cache_key("3.11", &gpu, &[])
        );
    }

    #[tokio::test]
    async fn repeated_get_entry_for_the_same_request_returns_the_same_id() {
        let root = tempfile::tempdir().unwrap();
        let cache = VirtualEnvCache::new(root.path());
        let experiment_dir = tempfile::tempdir().unwrap();

        let first = cache.get_entry(&request(), Allocation::default(), experiment_dir.path());
        let second = cache.get_entry(&request(), Allocation::default(), experiment_dir.path());

        assert_eq!(first.unique_id, second.unique_id);
        assert_eq!(cache.entries.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn add_client_is_refused_while_generating() {
        let root = tempfile::tempdir().unwrap();
        let cache = VirtualEnvCache::new(root.path());
        let experiment_dir = tempfile::tempdir().unwrap();

        let entry = cache.get_entry(&request(), Allocation::default(), experiment_dir.path());
        let (_id, valid) = cache.add_client(&entry.unique_id, "client-a");
        assert!(!valid);
    }

    #[tokio::test]
    async fn lease_counting_tracks_ready_entries() {
        let root = tempfile::tempdir().unwrap();
        let cache = VirtualEnvCache::new(root.path());

        let entry = Arc::new(Entry {
            unique_id: "abc".to_string(),
            state: Mutex::new(EntryState {
                status: Status::Ready,
                num_clients: -1,
                num_used: 0,
                last_used: Instant::now(),
            }),
        });
        cache.entries.lock().unwrap().insert("abc".to_string(), entry);

        let (_id, valid) = cache.add_client("abc", "client-a");
        assert!(valid);
        let (_id, valid) = cache.add_client("abc", "client-b");
        assert!(valid);
        {
            let entries = cache.entries.lock().unwrap();
            let state = entries["abc"].state.lock().unwrap();
            assert_eq!(state.num_clients, 2);
            assert_eq!(state.num_used, 2);
        }

        cache.remove_client("abc", "client-a");
        let entries = cache.entries.lock().unwrap();
        let state = entries["abc"].state.lock().unwrap();
        assert_eq!(state.num_clients, 1);
    }

    #[tokio::test]
    async fn cleaner_evicts_unused_ready_entries_past_the_deadline() {
        let root = tempfile::tempdir().unwrap();
        let cache = VirtualEnvCache::with_max_unused_period(root.path(), Duration::from_millis(10));

        let entry = Arc::new(Entry {
            unique_id: "abc".to_string(),
            state: Mutex::new(EntryState {
                status: Status::Ready,
                num_clients: 0,
                num_used: 1,
                last_used: Instant::now() - Duration::from_secs(1),
            }),
        });
        cache.entries.lock().unwrap().insert("abc".to_string(), entry);

        cache.clean_once().await;

        assert!(cache.entries.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cleaner_leaves_leased_entries_alone() {
        let root = tempfile::tempdir().unwrap();
        let cache = VirtualEnvCache::with_max_unused_period(root.path(), Duration::from_millis(10));

        let entry = Arc::new(Entry {
            unique_id: "abc".to_string(),
            state: Mutex::new(EntryState {
                status: Status::Ready,
                num_clients: 1,
                num_used: 1,
                last_used: Instant::now() - Duration::from_secs(1),
            }),
        });
        cache.entries.lock().unwrap().insert("abc".to_string(), entry);

        cache.clean_once().await;

        assert_eq!(cache.entries.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalidate_marks_a_ready_entry_stale_and_unleaseable() {
        let root = tempfile::tempdir().unwrap();
        let cache = VirtualEnvCache::new(root.path());

        let entry = Arc::new(Entry {
            unique_id: "abc".to_string(),
            state: Mutex::new(EntryState {
                status: Status::Ready,
                num_clients: -1,
                num_used: 0,
                last_used: Instant::now(),
            }),
        });
        cache.entries.lock().unwrap().insert("abc".to_string(), entry);

        cache.invalidate("abc");

        let (_id, valid) = cache.add_client("abc", "client-a");
        assert!(!valid);
        let entries = cache.entries.lock().unwrap();
        assert_eq!(entries["abc"].state.lock().unwrap().status, Status::Stale);
    }

    #[tokio::test]
    async fn cleaner_evicts_stale_entries_immediately_regardless_of_deadline() {
        let root = tempfile::tempdir().unwrap();
        let cache = VirtualEnvCache::with_max_unused_period(root.path(), Duration::from_secs(3600));

        let entry = Arc::new(Entry {
            unique_id: "abc".to_string(),
            state: Mutex::new(EntryState {
                status: Status::Stale,
                num_clients: 0,
                num_used: 1,
                last_used: Instant::now(),
            }),
        });
        cache.entries.lock().unwrap().insert("abc".to_string(), entry);

        cache.clean_once().await;

        assert!(cache.entries.lock().unwrap().is_empty());
    }

    #[test]
    fn retry_sentinel_text_matches_template() {
        assert!(GENVENV_TEMPLATE.contains(INSTALL_RETRY_SENTINEL_EXIT));
    }
}
