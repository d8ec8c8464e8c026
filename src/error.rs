//! Error taxonomy for snapshot creation.
//!
//! - Precondition: a required external tool (git/rsync) is missing. Checked once, fatal.
//! - ModuleNotFound: per module. Fatal under `raise`, recorded under `warn`.
//! - RepositoryState: not a repository / checkout failed / repository locked.
//!   Always recorded per module by the orchestrator, never globally fatal.
//! - Copy: tree copy failed. Always fatal: a half-copied module is not runnable.
//!
//! Restore failures during cleanup never become errors; they are logged.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("{tool} is not installed. Please install {tool} to use snapshot")]
    Precondition { tool: &'static str },

    #[error("module {module} not found: {reason}")]
    ModuleNotFound { module: String, reason: String },

    #[error("repository state error at {}: {reason}", path.display())]
    RepositoryState { path: PathBuf, reason: String },

    #[error("copy {} -> {} failed: {reason}", source_dir.display(), destination.display())]
    Copy {
        source_dir: PathBuf,
        destination: PathBuf,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("dependency capture failed: {0}")]
    Dependencies(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, SnapshotError>;

impl SnapshotError {
    pub fn module_not_found(module: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ModuleNotFound {
            module: module.into(),
            reason: reason.into(),
        }
    }

    pub fn repository(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::RepositoryState {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// `.with_context()`-style helper for io/json results, mirroring anyhow's API.
pub trait ResultExt<T> {
    fn ctx<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> ResultExt<T> for std::result::Result<T, std::io::Error> {
    fn ctx<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|source| SnapshotError::Io {
            context: f().into(),
            source,
        })
    }
}

impl<T> ResultExt<T> for std::result::Result<T, serde_json::Error> {
    fn ctx<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|source| SnapshotError::Json {
            context: f().into(),
            source,
        })
    }
}
