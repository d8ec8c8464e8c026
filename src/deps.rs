//! Python environment dependency capture (best effort).
//!
//! - `pip list --format=json` -> Vec<PackageDependency> (regular | editable);
//!   an entry is editable iff it carries `editable_project_location`.
//! - `pip freeze --local` -> requirements.txt text.
//! - editable packages -> importable module names (for `editable_modules`).
//!
//! pip is always invoked as `<python> -m pip` so it matches the interpreter that
//! resolves modules.

use log::warn;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::NotFoundPolicy;
use crate::error::{Result, SnapshotError};
use crate::locate::ModuleLocator;
use crate::util::{run_tool, stderr_text};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegularPackageDependency {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditablePackageDependency {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    pub editable_project_location: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PackageDependency {
    Regular(RegularPackageDependency),
    Editable(EditablePackageDependency),
}

pub type PipDependencies = Vec<PackageDependency>;

/// Raw `pip list --format=json` row.
#[derive(Deserialize)]
struct PipListEntry {
    name: String,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    editable_project_location: Option<String>,
}

/// Parse `pip list --format=json` output.
pub fn parse_pip_list(json: &str) -> Result<PipDependencies> {
    let rows: Vec<PipListEntry> = serde_json::from_str(json)
        .map_err(|e| SnapshotError::Dependencies(format!("parse pip list output: {e}")))?;
    Ok(rows
        .into_iter()
        .map(|r| match r.editable_project_location {
            Some(loc) => PackageDependency::Editable(EditablePackageDependency {
                name: r.name,
                version: r.version,
                editable_project_location: loc,
            }),
            None => PackageDependency::Regular(RegularPackageDependency {
                name: r.name,
                version: r.version,
            }),
        })
        .collect())
}

fn pip(python: &str, args: &[&str]) -> Result<String> {
    let mut full = vec!["-m", "pip"];
    full.extend_from_slice(args);
    let out = run_tool(python, &full, None, None)
        .map_err(|e| SnapshotError::Dependencies(format!("run {python} -m pip: {e}")))?;
    if !out.status.success() {
        return Err(SnapshotError::Dependencies(format!(
            "{python} -m pip {} failed: {}",
            args.join(" "),
            stderr_text(&out)
        )));
    }
    Ok(String::from_utf8_lossy(&out.stdout).into_owned())
}

pub fn current_pip_dependencies(python: &str) -> Result<PipDependencies> {
    parse_pip_list(&pip(python, &["list", "--format=json"])?)
}

/// `pip freeze --local` text, for requirements.txt.
pub fn pip_freeze(python: &str) -> Result<String> {
    pip(python, &["freeze", "--local"])
}

/// First line of `top_level.txt` from an `*.egg-info` under the project (or its `src/`).
fn egg_info_top_level(project: &Path) -> Option<String> {
    for base in [project.to_path_buf(), project.join("src")] {
        let Ok(rd) = fs::read_dir(&base) else {
            continue;
        };
        let mut eggs: Vec<PathBuf> = rd
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                p.is_dir()
                    && p.file_name()
                        .map(|n| n.to_string_lossy().ends_with(".egg-info"))
                        .unwrap_or(false)
            })
            .collect();
        eggs.sort();
        for egg in eggs {
            if let Ok(text) = fs::read_to_string(egg.join("top_level.txt")) {
                if let Some(first) = text.lines().map(str::trim).find(|l| !l.is_empty()) {
                    return Some(first.to_string());
                }
            }
        }
    }
    None
}

impl EditablePackageDependency {
    /// Best guess at the importable module for this package; None if nothing resolves.
    pub fn importable_module_name(&self, locator: &dyn ModuleLocator) -> Option<String> {
        if let Some(top) = egg_info_top_level(Path::new(&self.editable_project_location)) {
            return Some(top);
        }

        // common naming conventions
        let lower = self.name.to_lowercase();
        let mut candidates = vec![
            self.name.clone(),
            self.name.replace('-', "_"),
            lower.clone(),
            lower.replace('-', "_"),
        ];
        candidates.dedup();
        candidates
            .into_iter()
            .find(|name| locator.locate(name).is_ok())
    }
}

/// Module names of every editable package in `deps`.
pub fn editable_module_names(
    deps: &[PackageDependency],
    locator: &dyn ModuleLocator,
    policy: NotFoundPolicy,
) -> Result<Vec<String>> {
    let mut out = Vec::new();
    for dep in deps {
        let PackageDependency::Editable(dep) = dep else {
            continue;
        };
        match dep.importable_module_name(locator) {
            Some(m) => out.push(m),
            None => {
                let msg = format!(
                    "could not find an importable module name for editable package {}. \
                     Delete any *.egg-info directories in {}, uninstall the package and reinstall it",
                    dep.name, dep.editable_project_location
                );
                match policy {
                    NotFoundPolicy::Raise => {
                        return Err(SnapshotError::module_not_found(dep.name.clone(), msg))
                    }
                    NotFoundPolicy::Warn => warn!("{msg}"),
                }
            }
        }
    }
    Ok(out)
}

/// Module names of every editable package installed for `python`.
pub fn editable_modules(
    python: &str,
    locator: &dyn ModuleLocator,
    policy: NotFoundPolicy,
) -> Result<Vec<String>> {
    let deps = current_pip_dependencies(python)?;
    editable_module_names(&deps, locator, policy)
}
