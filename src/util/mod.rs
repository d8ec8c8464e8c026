//! util: общие утилиты.
//!
//! Содержит:
//! - now_unix_ms(): текущее Unix-время в миллисекундах.
//! - snapshot_id(): упорядоченный по времени идентификатор снапшота.
//! - gitignored_dir(): каталог с `.gitignore` = "*".
//! - run_tool()/tool_available(): запуск внешних инструментов (git, rsync, python).

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

use log::debug;

use crate::error::{Result, ResultExt, SnapshotError};

/// Текущее Unix-время в миллисекундах.
#[inline]
pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Time-ordered snapshot id: `<unix-ms, 12 hex>-<random, 16 hex>`.
/// Lexicographic order of ids follows creation time.
pub fn snapshot_id() -> String {
    format!("{:012x}-{:016x}", now_unix_ms(), rand::random::<u64>())
}

/// Ensure `path` is a directory holding a `.gitignore` that excludes everything.
/// An existing `.gitignore` is left untouched.
pub fn gitignored_dir(path: &Path, create: bool) -> Result<PathBuf> {
    if create {
        fs::create_dir_all(path).ctx(|| format!("create {}", path.display()))?;
    }
    if !path.is_dir() {
        return Err(SnapshotError::Config(format!(
            "{} is not a directory",
            path.display()
        )));
    }

    let gitignore = path.join(".gitignore");
    if !gitignore.exists() {
        fs::write(&gitignore, "*\n").ctx(|| format!("write {}", gitignore.display()))?;
    }
    Ok(path.to_path_buf())
}

/// Run `<tool> --version`. Missing binary or non-zero exit => false.
pub fn tool_available(tool: &str) -> bool {
    Command::new(tool)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Run an external tool and capture its output. `stdin` is piped when given.
/// Only spawn/IO failures are errors here; exit status is left to the caller.
pub fn run_tool(program: &str, args: &[&str], cwd: Option<&Path>, stdin: Option<&[u8]>) -> std::io::Result<Output> {
    let mut cmd = Command::new(program);
    cmd.args(args);
    if let Some(c) = cwd {
        cmd.current_dir(c);
    }
    debug!("exec: {} {}", program, args.join(" "));

    match stdin {
        None => cmd.stdin(Stdio::null()).output(),
        Some(bytes) => {
            cmd.stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
            let mut child = cmd.spawn()?;
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(bytes)?;
                // pipe закрывается здесь, иначе rsync будет ждать EOF
            }
            child.wait_with_output()
        }
    }
}

/// Trimmed, lossily decoded stdout.
pub fn stdout_text(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

/// Trimmed, lossily decoded stderr.
pub fn stderr_text(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).trim().to_string()
}
