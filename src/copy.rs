//! Tree copier: module directory -> snapshot package directory via `rsync -a`.
//!
//! Excluded:
//! - `.git` (file or directory, at any depth);
//! - every path the source repository reports as ignored (`git::ignored_paths`),
//!   anchored at the transfer root and fed to rsync on stdin (`--exclude-from=-`).
//!
//! Re-running into the same destination overwrites files in place.
//! Any failure here is a CopyError: fatal for the whole snapshot.

use log::{debug, info};
use std::fs;
use std::path::Path;

use crate::error::{Result, SnapshotError};
use crate::git::ignored_paths;
use crate::util::{run_tool, stderr_text};

pub const VCS_DIR: &str = ".git";

const WILDCARDS: &[u8] = b"*?[";

/// One literal path as an rsync pattern. rsync honours backslash escapes only in
/// patterns that contain a wildcard, so escaping is all or nothing.
fn literal_pattern(path: &[u8]) -> Vec<u8> {
    if !path.iter().any(|b| WILDCARDS.contains(b)) {
        return path.to_vec();
    }
    let mut out = Vec::with_capacity(path.len() + 4);
    for &b in path {
        if WILDCARDS.contains(&b) || b == b'\\' {
            out.push(b'\\');
        }
        out.push(b);
    }
    out
}

/// rsync exclude list: NUL-separated, anchored to the transfer root.
fn exclude_list(ignored: &[Vec<u8>]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(VCS_DIR.as_bytes());
    buf.push(0);
    for p in ignored {
        let rel = match p.iter().position(|b| *b != b'/') {
            Some(i) => &p[i..],
            None => continue,
        };
        buf.push(b'/');
        buf.extend_from_slice(&literal_pattern(rel));
        buf.push(0);
    }
    buf
}

/// Copy the contents of `source` into `destination` (created if missing).
pub fn copy_tree(source: &Path, destination: &Path) -> Result<()> {
    let fail = |reason: String| SnapshotError::Copy {
        source_dir: source.to_path_buf(),
        destination: destination.to_path_buf(),
        reason,
    };

    if !source.is_dir() {
        return Err(fail("source is not a directory".into()));
    }
    fs::create_dir_all(destination).map_err(|e| fail(format!("create destination: {e}")))?;

    let ignored = ignored_paths(source).map_err(|e| fail(format!("list ignored files: {e}")))?;
    debug!(
        "copy: {} ignored path(s) under {}",
        ignored.len(),
        source.display()
    );

    // trailing '/' => copy the directory's contents, not the directory itself
    let src_arg = format!("{}/", source.display());
    let dst_arg = format!("{}/", destination.display());
    let out = run_tool(
        "rsync",
        &["-a", "--from0", "--exclude-from=-", &src_arg, &dst_arg],
        None,
        Some(&exclude_list(&ignored)),
    )
    .map_err(|e| fail(format!("failed to execute rsync: {e}")))?;
    if !out.status.success() {
        return Err(fail(format!(
            "rsync exited with {}: {}",
            out.status,
            stderr_text(&out)
        )));
    }

    info!("copy: {} -> {}", source.display(), destination.display());
    Ok(())
}
