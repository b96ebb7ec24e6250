//! Small filesystem helpers shared by the cache, queue, and virtual-env stores: atomic
//! publication via scratch-dir-then-rename, and recursive removal with a byte/file
//! count.

use std::io;
use std::path::{Path, PathBuf};

mod removal;

pub use removal::{rm_rf, Removal};

/// Write `contents` to `dir/file_name` atomically: the payload is written to a unique
/// scratch subdirectory of `dir` first, then `rename`d into place, so a concurrent
/// directory scan never observes a partial file.
///
/// `dir` and the returned path must live on the same filesystem, since `rename` is only
/// atomic within one.
pub fn write_atomic(dir: &Path, file_name: &str, contents: &[u8]) -> io::Result<PathBuf> {
    let scratch_dir = dir.join(format!(".scratch-{}", uuid::Uuid::new_v4()));
    fs_err::create_dir_all(&scratch_dir)?;

    let result = (|| {
        let scratch_file = scratch_dir.join(file_name);
        fs_err::write(&scratch_file, contents)?;
        let dest = dir.join(file_name);
        fs_err::rename(&scratch_file, &dest)?;
        Ok(dest)
    })();

    // Best-effort: the scratch directory is empty on the success path and harmless
    // clutter on the error path, but either way it shouldn't block the caller.
    let _ = fs_err::remove_dir(&scratch_dir);

    result
}

/// A filename-safe, lexicographically sortable unique identifier for a newly published
/// entry: a ULID, so filenames generated closer together in time also sort closer
/// together rather than scattering randomly across a directory listing.
pub fn unique_id() -> String {
    ulid::Ulid::new().to_string()
}
