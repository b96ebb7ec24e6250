//! Directory resolution, following the same precedence used for the cache directory
//! throughout this family of tools: an explicit path wins, then an environment variable,
//! then an OS-appropriate project directory, then a dotfile in the current directory.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("failed to create or canonicalize directory {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Resolve one configured directory. `name` both names the dotfile fallback
/// (`.runnerd_<name>`) and is appended under the OS project-data directory.
pub fn resolve_directory(explicit: Option<&Path>, env_var: &str, name: &str) -> Result<PathBuf, DirectoryError> {
    let candidate = if let Some(path) = explicit {
        path.to_path_buf()
    } else if let Ok(path) = std::env::var(env_var) {
        PathBuf::from(path)
    } else if let Some(project_dirs) = ProjectDirs::from("", "", "runnerd") {
        project_dirs.data_dir().join(name)
    } else {
        PathBuf::from(format!(".runnerd_{name}"))
    };

    fs_err::create_dir_all(&candidate).map_err(|source| DirectoryError::Io {
        path: candidate.clone(),
        source,
    })?;
    fs_err::canonicalize(&candidate).map_err(|source| DirectoryError::Io {
        path: candidate,
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_path_wins_over_everything() {
        let dir = tempfile::tempdir().unwrap();
        let explicit = dir.path().join("explicit");
        let resolved = resolve_directory(Some(&explicit), "RUNNER_TEST_DOES_NOT_EXIST", "cache").unwrap();
        assert_eq!(resolved, fs_err::canonicalize(&explicit).unwrap());
    }

    #[test]
    fn env_var_is_used_when_no_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let env_path = dir.path().join("from-env");
        std::env::set_var("RR_RUNNER_TEST_DIR", &env_path);
        let resolved = resolve_directory(None, "RR_RUNNER_TEST_DIR", "cache").unwrap();
        std::env::remove_var("RR_RUNNER_TEST_DIR");
        assert_eq!(resolved, fs_err::canonicalize(&env_path).unwrap());
    }
}
