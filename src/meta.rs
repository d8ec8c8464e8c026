//! Snapshot metadata layout and persistence.
//!
//! <snapshot>/.nshsnapmeta/
//!   config.json        SnapshotConfig as given (pretty JSON)
//!   requirements.txt   `pip freeze --local`, best effort; may be absent
//!   meta.json          SnapshotMetadata: id, config, timestamp, pip list, per-module results
//!
//! JSON files are written atomically (tmp + rename).

use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::config::SnapshotConfig;
use crate::deps::{current_pip_dependencies, pip_freeze, PipDependencies};
use crate::error::{Result, ResultExt};
use crate::snapshot::ModuleResult;

pub const META_DIR: &str = ".nshsnapmeta";
pub const CONFIG_FILE: &str = "config.json";
pub const REQUIREMENTS_FILE: &str = "requirements.txt";
pub const META_FILE: &str = "meta.json";

pub fn metadata_dir(snapshot_dir: &Path) -> PathBuf {
    snapshot_dir.join(META_DIR)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub snapshot_id: String,
    pub config: SnapshotConfig,
    pub timestamp: DateTime<Utc>,
    /// Parsed `pip list --format=json`; None when pip was unavailable.
    pub pip_dependencies: Option<PipDependencies>,
    #[serde(default)]
    pub modules: Vec<ModuleResult>,
}

impl SnapshotMetadata {
    pub fn create(
        snapshot_id: String,
        config: SnapshotConfig,
        pip_dependencies: Option<PipDependencies>,
        modules: Vec<ModuleResult>,
    ) -> Self {
        Self {
            snapshot_id,
            config,
            timestamp: Utc::now(),
            pip_dependencies,
            modules,
        }
    }

    /// Like `create`, querying pip for the dependency list (None on failure).
    pub fn capture(snapshot_id: String, config: SnapshotConfig, modules: Vec<ModuleResult>) -> Self {
        let deps = match current_pip_dependencies(&config.python) {
            Ok(d) => Some(d),
            Err(e) => {
                warn!("meta: failed to list pip dependencies: {e}");
                None
            }
        };
        Self::create(snapshot_id, config, deps, modules)
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value).ctx(|| format!("serialize {}", path.display()))?;
    let tmp = path.with_extension("json.tmp");
    {
        let mut f = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp)
            .ctx(|| format!("open {}", tmp.display()))?;
        f.write_all(&bytes).ctx(|| format!("write {}", tmp.display()))?;
        f.sync_all().ctx(|| format!("fsync {}", tmp.display()))?;
    }
    fs::rename(&tmp, path).ctx(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}

/// Create `.nshsnapmeta`, write config.json and (best effort) requirements.txt.
pub fn write_snapshot_meta(config: &SnapshotConfig, snapshot_dir: &Path) -> Result<PathBuf> {
    let dir = metadata_dir(snapshot_dir);
    fs::create_dir_all(&dir).ctx(|| format!("create {}", dir.display()))?;

    write_json_atomic(&dir.join(CONFIG_FILE), config)?;

    match pip_freeze(&config.python) {
        Ok(text) => {
            let req = dir.join(REQUIREMENTS_FILE);
            if let Err(e) = fs::write(&req, text) {
                warn!("meta: failed to write {}: {}", req.display(), e);
            }
        }
        Err(e) => warn!("meta: failed to dump pip environment: {e}"),
    }
    Ok(dir)
}

pub fn write_metadata(snapshot_dir: &Path, meta: &SnapshotMetadata) -> Result<()> {
    let dir = metadata_dir(snapshot_dir);
    fs::create_dir_all(&dir).ctx(|| format!("create {}", dir.display()))?;
    write_json_atomic(&dir.join(META_FILE), meta)
}

pub fn read_metadata(snapshot_dir: &Path) -> Result<SnapshotMetadata> {
    let path = metadata_dir(snapshot_dir).join(META_FILE);
    let bytes = fs::read(&path).ctx(|| format!("read {}", path.display()))?;
    serde_json::from_slice(&bytes).ctx(|| format!("parse {}", path.display()))
}
