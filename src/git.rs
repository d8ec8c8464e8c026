//! Git state manager: inspect, capture, switch and restore the working-tree reference
//! of the repository backing a module directory.
//!
//! All calls shell out to `git -C <path> ...` and block until git exits.
//!
//! Lifecycle of a requested reference (per module):
//!   INITIAL -> FAILED            (not a repository / checkout refused)
//!   INITIAL -> CHECKED_OUT       (recorded in CheckoutGuard)
//!           -> RESTORE_PENDING   (copy attempted, whatever its outcome)
//!           -> RESTORED          (CheckoutGuard::restore_all or Drop)
//!
//! CheckoutGuard is the scoped-cleanup list: every successful checkout pushes
//! (path, original_ref); restoration runs exactly once, LIFO, on explicit
//! `restore_all()` or on Drop (early return, `?`, panic unwinding).

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Output;

use crate::error::{Result, SnapshotError};
use crate::lock::{try_lock_repository, RepoLock};
use crate::util::{run_tool, stderr_text, stdout_text};

fn git(path: &Path, args: &[&str]) -> std::io::Result<Output> {
    let path_s = path.to_string_lossy();
    let mut full: Vec<&str> = vec!["-C", path_s.as_ref()];
    full.extend_from_slice(args);
    run_tool("git", &full, None, None)
}

fn git_ok(path: &Path, args: &[&str]) -> Result<String> {
    let out = git(path, args)
        .map_err(|e| SnapshotError::repository(path, format!("failed to execute git: {e}")))?;
    if !out.status.success() {
        return Err(SnapshotError::repository(
            path,
            format!("git {} failed: {}", args.join(" "), stderr_text(&out)),
        ));
    }
    Ok(stdout_text(&out))
}

/// Non-mutating check: is `path` inside a git working tree?
pub fn is_repository(path: &Path) -> bool {
    match git(path, &["rev-parse", "--is-inside-work-tree"]) {
        Ok(out) => out.status.success() && stdout_text(&out) == "true",
        Err(_) => false,
    }
}

/// Symbolic branch name if HEAD is on a branch, otherwise the commit hash (detached).
pub fn current_reference(path: &Path) -> Result<String> {
    if let Ok(out) = git(path, &["symbolic-ref", "--short", "-q", "HEAD"]) {
        let name = stdout_text(&out);
        if out.status.success() && !name.is_empty() {
            return Ok(name);
        }
    }
    git_ok(path, &["rev-parse", "HEAD"])
}

/// Absolute path of the repository's git dir (`.git`, or the worktree's private dir).
pub fn git_dir(path: &Path) -> Result<PathBuf> {
    git_ok(path, &["rev-parse", "--absolute-git-dir"]).map(PathBuf::from)
}

/// Commit hash `reference` points at. Fails for anything that is not a
/// commit-ish: paths, option-like strings, unknown names.
pub fn verify_reference(path: &Path, reference: &str) -> Result<String> {
    if reference.is_empty() || reference.starts_with('-') {
        return Err(SnapshotError::repository(
            path,
            format!("invalid git reference {reference:?}"),
        ));
    }
    let spec = format!("{reference}^{{commit}}");
    git_ok(
        path,
        &["rev-parse", "--verify", "--quiet", "--end-of-options", &spec],
    )
    .map_err(|_| SnapshotError::repository(path, format!("unknown git reference {reference:?}")))
}

/// Switch the working tree to `reference`.
///
/// The reference is verified first and passed before `--`, so git never reads
/// it as a pathspec (that would overwrite uncommitted files and still exit 0).
pub fn switch_to(path: &Path, reference: &str) -> Result<()> {
    verify_reference(path, reference)?;
    git_ok(path, &["checkout", "-q", reference, "--"]).map(|_| ())
}

/// Best-effort checkout back to `reference`. Never fails; returns whether it worked.
pub fn restore(path: &Path, reference: &str) -> bool {
    match switch_to(path, reference) {
        Ok(()) => {
            info!("git: restored {} to {}", path.display(), reference);
            true
        }
        Err(e) => {
            warn!(
                "git: failed to restore {} to {}: {}",
                path.display(),
                reference,
                e
            );
            false
        }
    }
}

/// Is `path` itself excluded by its repository's ignore rules,
/// directly or through an ignored parent directory?
fn is_ignored_dir(path: &Path) -> bool {
    let Ok(prefix) = git_ok(path, &["rev-parse", "--show-prefix"]) else {
        return false;
    };
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return false;
    }
    let Ok(top) = git_ok(path, &["rev-parse", "--show-toplevel"]) else {
        return false;
    };
    matches!(
        git(Path::new(&top), &["check-ignore", "-q", "--", prefix]),
        Ok(out) if out.status.success()
    )
}

/// Paths under `path` that the repository itself reports as ignored
/// (`git ls-files --exclude-standard -o -i --directory`), relative to `path`,
/// as raw bytes. Directories keep their trailing '/'.
///
/// Outside a repository nothing is ignored. Below a directory the repository
/// ignores as a whole (a package inside `.venv/`) nothing is ignored either:
/// git refuses to list that case and the whole tree is wanted anyway.
pub fn ignored_paths(path: &Path) -> Result<Vec<Vec<u8>>> {
    if !is_repository(path) {
        return Ok(Vec::new());
    }
    if is_ignored_dir(path) {
        debug!(
            "git: {} is ignored by its repository; copying it whole",
            path.display()
        );
        return Ok(Vec::new());
    }
    let out = git(
        path,
        &["ls-files", "--exclude-standard", "-o", "-i", "--directory", "-z"],
    )
    .map_err(|e| SnapshotError::repository(path, format!("failed to execute git: {e}")))?;
    if !out.status.success() {
        return Err(SnapshotError::repository(
            path,
            format!("git ls-files failed: {}", stderr_text(&out)),
        ));
    }
    Ok(out
        .stdout
        .split(|b| *b == 0)
        .filter(|s| !s.is_empty())
        .map(<[u8]>::to_vec)
        .collect())
}

// ---------------- scoped restoration ----------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutOutcome {
    CheckedOut,
    Restored,
    RestoreFailed,
}

/// One successful checkout awaiting restoration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitCheckoutRecord {
    pub repository: PathBuf,
    pub original_reference: String,
    pub requested_reference: String,
    pub outcome: CheckoutOutcome,
}

/// A checkout that did not happen. `original` is set when the active
/// reference had already been captured.
#[derive(Debug)]
pub struct CheckoutFailure {
    pub original: Option<String>,
    pub error: SnapshotError,
}

impl CheckoutFailure {
    fn new(original: Option<String>, error: SnapshotError) -> Self {
        Self { original, error }
    }
}

/// Acquire-with-guaranteed-release list of checkouts made during one invocation.
#[derive(Default)]
pub struct CheckoutGuard {
    records: Vec<GitCheckoutRecord>,
    locks: Vec<(PathBuf, RepoLock)>,
    finished: bool,
}

impl CheckoutGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the advisory lock of the repository containing `path`.
    /// Repositories already locked by this guard are not locked twice.
    pub fn lock_repository(&mut self, path: &Path) -> Result<()> {
        let dir = git_dir(path)?;
        if self.locks.iter().any(|(d, _)| *d == dir) {
            return Ok(());
        }
        let lock = try_lock_repository(&dir)?;
        debug!("git: locked {}", lock.path().display());
        self.locks.push((dir, lock));
        Ok(())
    }

    /// Lock, capture, switch and record, in that order.
    ///
    /// The original reference is read only while the lock is held, so another
    /// invocation's temporary checkout is never taken for it.
    pub fn checkout(
        &mut self,
        path: &Path,
        reference: &str,
    ) -> std::result::Result<String, CheckoutFailure> {
        if !is_repository(path) {
            return Err(CheckoutFailure::new(
                None,
                SnapshotError::repository(path, "not a git repository"),
            ));
        }
        self.lock_repository(path)
            .map_err(|e| CheckoutFailure::new(None, e))?;
        let original = current_reference(path).map_err(|e| CheckoutFailure::new(None, e))?;
        switch_to(path, reference)
            .map_err(|e| CheckoutFailure::new(Some(original.clone()), e))?;
        self.record(path, &original, reference);
        info!(
            "git: {} switched {} -> {}",
            path.display(),
            original,
            reference
        );
        Ok(original)
    }

    pub fn record(&mut self, repository: &Path, original: &str, requested: &str) {
        self.records.push(GitCheckoutRecord {
            repository: repository.to_path_buf(),
            original_reference: original.to_string(),
            requested_reference: requested.to_string(),
            outcome: CheckoutOutcome::CheckedOut,
        });
    }

    pub fn records(&self) -> &[GitCheckoutRecord] {
        &self.records
    }

    /// Restore every recorded checkout in reverse order, then release the locks.
    /// Each restore is isolated: one failure does not stop the others.
    /// Idempotent: the second call is a no-op.
    pub fn restore_all(&mut self) -> &[GitCheckoutRecord] {
        if !self.finished {
            self.finished = true;
            for rec in self.records.iter_mut().rev() {
                rec.outcome = if restore(&rec.repository, &rec.original_reference) {
                    CheckoutOutcome::Restored
                } else {
                    CheckoutOutcome::RestoreFailed
                };
            }
            self.locks.clear();
        }
        &self.records
    }
}

impl Drop for CheckoutGuard {
    fn drop(&mut self) {
        if !self.finished {
            if !self.records.is_empty() {
                warn!(
                    "git: restoring {} checkout(s) on abnormal exit",
                    self.records.len()
                );
            }
            self.restore_all();
        }
    }
}
