//! Centralized configuration and builder for snapshots.
//!
//! Goals:
//! - One serializable SnapshotConfig (it is written verbatim to `.nshsnapmeta/config.json`).
//! - SnapshotConfig::from_env() reads NSHSNAP_* overrides on top of the defaults.
//! - SnapshotConfigBuilder for library callers, mirroring the CLI flags.
//!
//! Env:
//! - NSHSNAP_DIR                  snapshot directory (default ~/.cache/nshsnap/snapshots/<id>)
//! - NSHSNAP_MODULES              comma separated module names
//! - NSHSNAP_ON_MODULE_NOT_FOUND  raise|warn (default warn)
//! - NSHSNAP_EDITABLE             1|true|on|yes => snapshot all editable packages (default on)
//! - NSHSNAP_SEARCH_PATH          PATH-style list of import roots (default: ask the interpreter)
//! - NSHSNAP_PYTHON               interpreter used for lookups and pip (default python3)

use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::deps::editable_modules;
use crate::error::{Result, ResultExt, SnapshotError};
use crate::locate::{InterpreterLocator, ModuleLocator, SearchPathLocator};
use crate::resolve::{resolve_modules, ResolveMode, Value};
use crate::util::gitignored_dir;

pub const DEFAULT_PYTHON: &str = "python3";

/// What to do when a module cannot be located.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum NotFoundPolicy {
    Raise,
    #[default]
    Warn,
}

impl fmt::Display for NotFoundPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NotFoundPolicy::Raise => "raise",
            NotFoundPolicy::Warn => "warn",
        })
    }
}

impl std::str::FromStr for NotFoundPolicy {
    type Err = SnapshotError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "raise" => Ok(NotFoundPolicy::Raise),
            "warn" => Ok(NotFoundPolicy::Warn),
            other => Err(SnapshotError::Config(format!(
                "on_module_not_found must be raise|warn, got {other:?}"
            ))),
        }
    }
}

/// Values to infer module names from (used when `modules` is empty).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResolveValuesConfig {
    pub values: Vec<Value>,
    /// How deep to resolve modules. Default: deep-builtin.
    #[serde(default)]
    pub deep: ResolveMode,
    /// Whether to ignore builtin modules. Default: true.
    #[serde(default = "default_true")]
    pub ignore_builtin: bool,
}

fn default_true() -> bool {
    true
}

fn default_python() -> String {
    DEFAULT_PYTHON.to_string()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// The directory to save the snapshot to. None => ~/.cache/nshsnap/snapshots/<id>.
    #[serde(default)]
    pub snapshot_dir: Option<PathBuf>,

    /// Modules to snapshot, in order.
    #[serde(default)]
    pub modules: Vec<String>,

    #[serde(default)]
    pub on_module_not_found: NotFoundPolicy,

    /// Snapshot all editable packages of the interpreter's environment.
    #[serde(default = "default_true")]
    pub editable_modules: bool,

    /// Module name -> git reference (branch, tag, commit hash) to snapshot it at.
    #[serde(default)]
    pub git_references: BTreeMap<String, String>,

    /// Explicit import roots. Empty => ask `python` where modules live.
    #[serde(default)]
    pub search_paths: Vec<PathBuf>,

    #[serde(default = "default_python")]
    pub python: String,

    #[serde(default)]
    pub values: Option<ResolveValuesConfig>,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            snapshot_dir: None,
            modules: Vec::new(),
            on_module_not_found: NotFoundPolicy::Warn,
            editable_modules: true,
            git_references: BTreeMap::new(),
            search_paths: Vec::new(),
            python: default_python(),
            values: None,
        }
    }
}

fn env_flag(v: &str) -> bool {
    let s = v.trim().to_ascii_lowercase();
    s == "1" || s == "true" || s == "on" || s == "yes"
}

impl SnapshotConfig {
    /// Defaults + NSHSNAP_* overrides. Malformed values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("NSHSNAP_DIR") {
            let s = v.trim();
            if !s.is_empty() {
                cfg.snapshot_dir = Some(PathBuf::from(s));
            }
        }

        if let Ok(v) = std::env::var("NSHSNAP_MODULES") {
            cfg.modules = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Ok(v) = std::env::var("NSHSNAP_ON_MODULE_NOT_FOUND") {
            match v.parse() {
                Ok(p) => cfg.on_module_not_found = p,
                Err(e) => warn!("ignoring NSHSNAP_ON_MODULE_NOT_FOUND: {e}"),
            }
        }

        if let Ok(v) = std::env::var("NSHSNAP_EDITABLE") {
            cfg.editable_modules = env_flag(&v);
        }

        if let Ok(v) = std::env::var("NSHSNAP_SEARCH_PATH") {
            cfg.search_paths = std::env::split_paths(&v)
                .filter(|p| !p.as_os_str().is_empty())
                .collect();
        }

        if let Ok(v) = std::env::var("NSHSNAP_PYTHON") {
            let s = v.trim();
            if !s.is_empty() {
                cfg.python = s.to_string();
            }
        }

        cfg
    }

    pub fn with_snapshot_dir<P: Into<PathBuf>>(mut self, dir: Option<P>) -> Self {
        self.snapshot_dir = dir.map(Into::into);
        self
    }

    pub fn with_modules<I, S>(mut self, modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.modules = modules.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_on_module_not_found(mut self, policy: NotFoundPolicy) -> Self {
        self.on_module_not_found = policy;
        self
    }

    pub fn with_editable_modules(mut self, on: bool) -> Self {
        self.editable_modules = on;
        self
    }

    pub fn with_git_reference<M: Into<String>, R: Into<String>>(mut self, module: M, reference: R) -> Self {
        self.git_references.insert(module.into(), reference.into());
        self
    }

    pub fn with_search_paths<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.search_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_python<S: Into<String>>(mut self, python: S) -> Self {
        self.python = python.into();
        self
    }

    pub fn with_values(mut self, values: Vec<Value>, deep: ResolveMode, ignore_builtin: bool) -> Self {
        self.values = Some(ResolveValuesConfig {
            values,
            deep,
            ignore_builtin,
        });
        self
    }

    /// The locator implied by this config.
    pub fn locator(&self) -> Box<dyn ModuleLocator> {
        if self.search_paths.is_empty() {
            Box::new(InterpreterLocator::new(self.python.clone()))
        } else {
            Box::new(SearchPathLocator::new(self.search_paths.iter().cloned()))
        }
    }

    /// Absolute snapshot directory. The default one, named `snapshot_id`, is
    /// created (gitignored) here.
    pub fn resolve_snapshot_dir(&self, snapshot_id: &str) -> Result<PathBuf> {
        match &self.snapshot_dir {
            Some(dir) => absolute(dir),
            None => default_snapshot_dir(snapshot_id),
        }
    }

    /// Final ordered module list.
    ///
    /// - explicit `modules`, or, when empty, the modules resolved from `values`;
    /// - with `editable_modules`, merged with every editable package's module
    ///   (deduplicated and sorted alphabetically).
    pub fn resolve_modules(&self, locator: &dyn ModuleLocator) -> Result<Vec<String>> {
        let mut modules = self.modules.clone();
        if modules.is_empty() {
            if let Some(rv) = &self.values {
                modules = resolve_modules(&rv.values, rv.deep, rv.ignore_builtin)
                    .into_iter()
                    .collect();
            }
        }

        if self.editable_modules {
            let editable = editable_modules(&self.python, locator, self.on_module_not_found)?;
            let merged: BTreeSet<String> = modules.into_iter().chain(editable).collect();
            modules = merged.into_iter().collect();
        }
        Ok(modules)
    }
}

fn absolute(p: &Path) -> Result<PathBuf> {
    if p.is_absolute() {
        return Ok(p.to_path_buf());
    }
    let cwd = std::env::current_dir().ctx(|| "current dir")?;
    Ok(cwd.join(p))
}

/// ~/.cache/nshsnap/snapshots/<snapshot_id>, created and gitignored.
pub fn default_snapshot_dir(snapshot_id: &str) -> Result<PathBuf> {
    let home = home::home_dir()
        .ok_or_else(|| SnapshotError::Config("cannot determine home directory".into()))?;
    snapshot_dir_under(&home, snapshot_id)
}

/// `<home>/.cache/nshsnap/snapshots/<snapshot_id>`, created and gitignored.
pub fn snapshot_dir_under(home: &Path, snapshot_id: &str) -> Result<PathBuf> {
    let snaps = home.join(".cache").join("nshsnap").join("snapshots");
    std::fs::create_dir_all(&snaps).ctx(|| format!("create {}", snaps.display()))?;
    gitignored_dir(&snaps.join(snapshot_id), true)
}

impl fmt::Display for SnapshotConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SnapshotConfig {{ \
             snapshot_dir: {}, \
             modules: [{}], \
             on_module_not_found: {}, \
             editable_modules: {}, \
             git_references: {}, \
             search_paths: {}, \
             python: {}, \
             values: {} \
             }}",
            self.snapshot_dir
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "default(~/.cache/nshsnap/snapshots/<id>)".to_string()),
            self.modules.join(", "),
            self.on_module_not_found,
            self.editable_modules,
            self.git_references.len(),
            if self.search_paths.is_empty() {
                "interpreter".to_string()
            } else {
                self.search_paths.len().to_string()
            },
            self.python,
            self.values
                .as_ref()
                .map(|v| format!("{} ({})", v.values.len(), v.deep))
                .unwrap_or_else(|| "none".to_string()),
        )
    }
}

/// Lightweight builder that produces a SnapshotConfig.
#[derive(Clone, Debug)]
pub struct SnapshotConfigBuilder {
    cfg: SnapshotConfig,
}

impl Default for SnapshotConfigBuilder {
    fn default() -> Self {
        // Start from env, then allow overrides.
        Self {
            cfg: SnapshotConfig::from_env(),
        }
    }
}

impl SnapshotConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a clean default (without reading env).
    pub fn from_default() -> Self {
        Self {
            cfg: SnapshotConfig::default(),
        }
    }

    pub fn snapshot_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.cfg.snapshot_dir = Some(dir.into());
        self
    }

    pub fn module<S: Into<String>>(mut self, module: S) -> Self {
        self.cfg.modules.push(module.into());
        self
    }

    pub fn on_module_not_found(mut self, policy: NotFoundPolicy) -> Self {
        self.cfg.on_module_not_found = policy;
        self
    }

    pub fn editable_modules(mut self, on: bool) -> Self {
        self.cfg.editable_modules = on;
        self
    }

    pub fn git_reference<M: Into<String>, R: Into<String>>(mut self, module: M, reference: R) -> Self {
        self.cfg.git_references.insert(module.into(), reference.into());
        self
    }

    pub fn search_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.cfg.search_paths.push(path.into());
        self
    }

    pub fn python<S: Into<String>>(mut self, python: S) -> Self {
        self.cfg.python = python.into();
        self
    }

    pub fn values(mut self, values: Vec<Value>, deep: ResolveMode, ignore_builtin: bool) -> Self {
        self.cfg.values = Some(ResolveValuesConfig {
            values,
            deep,
            ignore_builtin,
        });
        self
    }

    /// Finish the builder and obtain the configuration.
    pub fn build(self) -> SnapshotConfig {
        self.cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::TypeInfo;

    #[test]
    fn policy_parses_and_displays() {
        assert_eq!("RAISE".parse::<NotFoundPolicy>().unwrap(), NotFoundPolicy::Raise);
        assert_eq!(" warn ".parse::<NotFoundPolicy>().unwrap(), NotFoundPolicy::Warn);
        assert!("ignore".parse::<NotFoundPolicy>().is_err());
        assert_eq!(NotFoundPolicy::Raise.to_string(), "raise");
    }

    #[test]
    fn config_json_uses_defaults_for_missing_fields() {
        let cfg: SnapshotConfig =
            serde_json::from_str(r#"{"modules":["alpha"],"on_module_not_found":"raise"}"#).unwrap();
        assert_eq!(cfg.modules, vec!["alpha".to_string()]);
        assert_eq!(cfg.on_module_not_found, NotFoundPolicy::Raise);
        assert!(cfg.editable_modules);
        assert_eq!(cfg.python, DEFAULT_PYTHON);

        let back: SnapshotConfig = serde_json::from_str(&serde_json::to_string(&cfg).unwrap()).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn modules_fall_back_to_values_when_empty() {
        let cfg = SnapshotConfigBuilder::from_default()
            .editable_modules(false)
            .search_path(std::env::temp_dir())
            .values(
                vec![Value::Type(TypeInfo::new("B", "beta.x")), Value::Type(TypeInfo::new("A", "alpha"))],
                ResolveMode::Shallow,
                true,
            )
            .build();
        let loc = cfg.locator();
        assert_eq!(cfg.resolve_modules(loc.as_ref()).unwrap(), vec!["alpha", "beta.x"]);

        // explicit modules win and keep their order
        let cfg = cfg.with_modules(["zeta", "alpha"]);
        assert_eq!(cfg.resolve_modules(loc.as_ref()).unwrap(), vec!["zeta", "alpha"]);
    }

    #[test]
    fn relative_dir_becomes_absolute() {
        let cfg = SnapshotConfig::default().with_snapshot_dir(Some("snaps/x"));
        let dir = cfg.resolve_snapshot_dir("unused-id").unwrap();
        assert!(dir.is_absolute());
        assert!(dir.ends_with("snaps/x"));
    }

    #[test]
    fn default_dir_is_named_by_the_given_id() {
        let home = std::env::temp_dir().join(format!(
            "nshsnap-config-home-{}-{}",
            std::process::id(),
            crate::util::snapshot_id()
        ));
        let dir = snapshot_dir_under(&home, "0190abc-42").unwrap();
        assert!(dir.ends_with(".cache/nshsnap/snapshots/0190abc-42"));
        assert_eq!(std::fs::read_to_string(dir.join(".gitignore")).unwrap(), "*\n");
        let _ = std::fs::remove_dir_all(&home);
    }
}
