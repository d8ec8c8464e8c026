//! Snapshot orchestrator.
//!
//! Per module, strictly in input order and on one thread:
//!   locate -> [git: inspect, lock, capture, checkout] -> package dirs -> copy tree
//!
//! Failure routing:
//! - module not found:  `raise` => stop the loop, clean up, return the error;
//!                      `warn`  => ModuleResult(not_found), continue;
//! - git reference:     ModuleResult(git_reference_failed), continue (no copy);
//! - copy:              fatal, clean up, return the error.
//!
//! Every successful checkout is recorded in a CheckoutGuard; one cleanup pass after
//! the loop restores all of them, however the loop ended.

use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use crate::config::{NotFoundPolicy, SnapshotConfig};
use crate::copy::copy_tree;
use crate::error::{Result, ResultExt, SnapshotError};
use crate::git::{self, CheckoutGuard};
use crate::locate::{split_module_name, ModuleLocator};
use crate::meta::{read_metadata, write_metadata, write_snapshot_meta, SnapshotMetadata};
use crate::scripts::create_snapshot_scripts;
use crate::util::{gitignored_dir, snapshot_id, tool_available};

pub const REQUIRED_TOOLS: [&str; 2] = ["git", "rsync"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleStatus {
    Success,
    NotFound,
    GitReferenceFailed,
}

/// Outcome for one input module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleResult {
    pub name: String,
    pub status: ModuleStatus,
    /// Source directory the module was copied from.
    pub location: Option<PathBuf>,
    /// Final package directory inside the snapshot.
    pub destination: Option<PathBuf>,
    pub git_reference_requested: Option<String>,
    pub git_reference_original: Option<String>,
    /// Set iff the checkout of the requested reference succeeded.
    pub git_reference_used: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ModuleResult {
    fn not_found(name: &str, requested: Option<String>, err: &SnapshotError) -> Self {
        Self {
            name: name.to_string(),
            status: ModuleStatus::NotFound,
            location: None,
            destination: None,
            git_reference_requested: requested,
            git_reference_original: None,
            git_reference_used: None,
            error: Some(err.to_string()),
        }
    }

    fn git_failed(
        name: &str,
        location: &Path,
        requested: &str,
        original: Option<String>,
        err: &SnapshotError,
    ) -> Self {
        Self {
            name: name.to_string(),
            status: ModuleStatus::GitReferenceFailed,
            location: Some(location.to_path_buf()),
            destination: None,
            git_reference_requested: Some(requested.to_string()),
            git_reference_original: original,
            git_reference_used: None,
            error: Some(err.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ModuleStatus::Success
    }
}

/// Result of one orchestrator run: one ModuleResult per input module, same order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotResult {
    pub snapshot_dir: PathBuf,
    pub modules: Vec<ModuleResult>,
}

impl SnapshotResult {
    pub fn failures(&self) -> impl Iterator<Item = &ModuleResult> {
        self.modules.iter().filter(|m| !m.is_success())
    }
}

/// Fail fast if git or rsync is missing.
pub fn ensure_supported() -> Result<()> {
    for tool in REQUIRED_TOOLS {
        if !tool_available(tool) {
            return Err(SnapshotError::Precondition { tool });
        }
    }
    Ok(())
}

/// `<root>/<pkg>/.../<parent>` with an `__init__.py` in every level; returns
/// `<root>/<pkg>/.../<module>` (not created).
fn prepare_destination(root: &Path, module: &str) -> Result<PathBuf> {
    let (parents, last) = split_module_name(module);
    let mut dest = root.to_path_buf();
    for part in parents {
        dest.push(part);
        fs::create_dir_all(&dest).ctx(|| format!("create {}", dest.display()))?;
        let init = dest.join("__init__.py");
        // append: never truncate an __init__.py copied by an earlier module
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&init)
            .ctx(|| format!("touch {}", init.display()))?;
    }
    Ok(dest.join(last))
}

fn process_modules(
    root: &Path,
    modules: &[String],
    policy: NotFoundPolicy,
    git_references: &BTreeMap<String, String>,
    locator: &dyn ModuleLocator,
    guard: &mut CheckoutGuard,
    results: &mut Vec<ModuleResult>,
) -> Result<()> {
    for module in modules {
        let requested = git_references.get(module).cloned();

        let spec = match locator.locate(module) {
            Ok(spec) => spec,
            Err(e) => match policy {
                NotFoundPolicy::Raise => return Err(e),
                NotFoundPolicy::Warn => {
                    warn!("Module {module} not found: {e}");
                    results.push(ModuleResult::not_found(module, requested, &e));
                    continue;
                }
            },
        };

        let mut original = None;
        if let Some(reference) = requested.as_deref() {
            match guard.checkout(&spec.path, reference) {
                Ok(orig) => original = Some(orig),
                Err(failed) => {
                    warn!(
                        "Module {module}: failed to use git reference '{reference}': {}",
                        failed.error
                    );
                    results.push(ModuleResult::git_failed(
                        module,
                        &spec.path,
                        reference,
                        failed.original,
                        &failed.error,
                    ));
                    continue;
                }
            }
        }

        let destination = prepare_destination(root, module).map_err(|e| SnapshotError::Copy {
            source_dir: spec.path.clone(),
            destination: root.to_path_buf(),
            reason: e.to_string(),
        })?;
        copy_tree(&spec.path, &destination)?;
        info!(
            "Moved {} to {} for module={}",
            spec.path.display(),
            destination.display(),
            module
        );

        results.push(ModuleResult {
            name: module.clone(),
            status: ModuleStatus::Success,
            location: Some(spec.path),
            destination: Some(destination),
            git_reference_used: requested.clone(),
            git_reference_requested: requested,
            git_reference_original: original,
            error: None,
        });
    }
    Ok(())
}

/// Snapshot `modules` (in order) into `snapshot_dir`.
///
/// Returns Err only for fatal conditions (not-found under `raise`, copy failures);
/// every git checkout made here has been restored by the time this returns.
pub fn snapshot_modules(
    snapshot_dir: &Path,
    modules: &[String],
    policy: NotFoundPolicy,
    git_references: &BTreeMap<String, String>,
    locator: &dyn ModuleLocator,
) -> Result<SnapshotResult> {
    let root = if snapshot_dir.is_absolute() {
        snapshot_dir.to_path_buf()
    } else {
        std::env::current_dir().ctx(|| "current dir")?.join(snapshot_dir)
    };
    info!("Snapshotting modules={:?} to {}", modules, root.display());

    let mut guard = CheckoutGuard::new();
    let mut results = Vec::with_capacity(modules.len());
    let outcome = process_modules(
        &root,
        modules,
        policy,
        git_references,
        locator,
        &mut guard,
        &mut results,
    );

    // cleanup runs before any error is propagated
    for rec in guard.restore_all() {
        if rec.outcome == git::CheckoutOutcome::RestoreFailed {
            error!(
                "git: {} could not be restored to {}; restore it manually",
                rec.repository.display(),
                rec.original_reference
            );
        }
    }
    outcome?;

    Ok(SnapshotResult {
        snapshot_dir: root,
        modules: results,
    })
}

/// A created (or loaded) snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotInfo {
    pub snapshot_id: String,
    pub snapshot_dir: PathBuf,
    pub modules: Vec<ModuleResult>,
}

impl SnapshotInfo {
    pub fn module_names(&self) -> Vec<&str> {
        self.modules.iter().map(|m| m.name.as_str()).collect()
    }

    pub fn git_references_used(&self) -> impl Iterator<Item = (&str, &str)> {
        self.modules
            .iter()
            .filter_map(|m| m.git_reference_used.as_deref().map(|r| (m.name.as_str(), r)))
    }

    pub fn failures(&self) -> impl Iterator<Item = &ModuleResult> {
        self.modules.iter().filter(|m| !m.is_success())
    }
}

/// Full pipeline: tools check, directory, module list, metadata, scripts, modules.
pub fn snapshot(config: SnapshotConfig) -> Result<SnapshotInfo> {
    ensure_supported()?;

    // one id names both the default directory and meta.json
    let id = snapshot_id();
    let snapshot_dir = config.resolve_snapshot_dir(&id)?;
    let locator = config.locator();
    let modules = config.resolve_modules(locator.as_ref())?;

    gitignored_dir(&snapshot_dir, true)?;
    write_snapshot_meta(&config, &snapshot_dir)?;
    create_snapshot_scripts(&snapshot_dir)?;

    let result = snapshot_modules(
        &snapshot_dir,
        &modules,
        config.on_module_not_found,
        &config.git_references,
        locator.as_ref(),
    )?;

    let meta = SnapshotMetadata::capture(id.clone(), config, result.modules.clone());
    write_metadata(&result.snapshot_dir, &meta)?;

    Ok(SnapshotInfo {
        snapshot_id: id,
        snapshot_dir: result.snapshot_dir,
        modules: result.modules,
    })
}

/// Load a snapshot written by [`snapshot`] from its `meta.json`.
pub fn load_existing_snapshot(snapshot_dir: &Path) -> Result<SnapshotInfo> {
    let meta = read_metadata(snapshot_dir)?;
    Ok(SnapshotInfo {
        snapshot_id: meta.snapshot_id,
        snapshot_dir: snapshot_dir.to_path_buf(),
        modules: meta.modules,
    })
}
