//! Per-repository advisory locking for working-tree checkouts.
//!
//! Cross-platform (fs2) advisory lock, exclusive and non-blocking:
//! two snapshot invocations must never switch the same working tree at once.
//!
//! Lock file path: <git-dir>/nshsnap.lock
//! Lock is released on Drop.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::error::{Result, SnapshotError};

pub const LOCK_FILE: &str = "nshsnap.lock";

pub struct RepoLock {
    file: File,
    path: PathBuf,
}

impl RepoLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        // unlock errors on drop are ignored; the OS drops the lock with the fd anyway
        let _ = self.file.unlock();
    }
}

pub fn lock_file_path(git_dir: &Path) -> PathBuf {
    git_dir.join(LOCK_FILE)
}

/// Try to take the exclusive lock for a repository whose git dir is `git_dir`.
/// Returns RepositoryState if another process (or another handle) already holds it.
pub fn try_lock_repository(git_dir: &Path) -> Result<RepoLock> {
    let path = lock_file_path(git_dir);
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&path)
        .map_err(|e| {
            SnapshotError::repository(git_dir, format!("open lock file {}: {}", path.display(), e))
        })?;

    file.try_lock_exclusive().map_err(|e| {
        SnapshotError::repository(
            git_dir,
            format!(
                "repository is locked by another snapshot ({}): {}",
                path.display(),
                e
            ),
        )
    })?;

    Ok(RepoLock { file, path })
}
