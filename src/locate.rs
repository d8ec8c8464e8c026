//! Module locator: dotted module name -> existing directories backing it.
//!
//! Two backends behind `ModuleLocator`:
//! - SearchPathLocator: walks an explicit list of import roots (+ `.pth` expansion),
//!   following package semantics (regular package wins, otherwise namespace portions).
//! - InterpreterLocator: asks a python interpreter for `submodule_search_locations`,
//!   so editable installs with custom finders resolve exactly like the job will see them.
//!
//! Both feed `normalize_locations()`: drop non-directories (loader hooks, zips, missing
//! paths), resolve symlinks, dedup keeping order. Several survivors (namespace package)
//! => the first one wins and the rest are reported as ignored.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, SnapshotError};
use crate::util::{run_tool, stderr_text};

/// A resolved module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleSpec {
    /// Dotted name, e.g. `pkg.sub`.
    pub name: String,
    /// Normalized search locations, in resolution order.
    pub search_locations: Vec<PathBuf>,
    /// The chosen primary directory (first of `search_locations`).
    pub path: PathBuf,
}

/// Parent package parts and the module's own last component.
pub fn split_module_name(name: &str) -> (Vec<&str>, &str) {
    let mut parts: Vec<&str> = name.split('.').collect();
    let last = parts.pop().unwrap_or_default();
    (parts, last)
}

/// Reject names that could escape the destination root or never be importable.
pub fn validate_module_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.split('.').all(|p| {
            !p.is_empty()
                && !p.starts_with(|c: char| c.is_ascii_digit())
                && p.chars().all(|c| c.is_alphanumeric() || c == '_')
        });
    if ok {
        Ok(())
    } else {
        Err(SnapshotError::module_not_found(name, "invalid module name"))
    }
}

/// Keep existing directories only, resolve symlinks, dedup preserving order.
pub fn normalize_locations<I, P>(raw: I) -> Vec<PathBuf>
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    let mut out: Vec<PathBuf> = Vec::new();
    for p in raw {
        let p = p.as_ref();
        if !p.is_dir() {
            debug!("locate: dropping non-directory location {}", p.display());
            continue;
        }
        let Ok(real) = fs::canonicalize(p) else {
            continue;
        };
        if !out.contains(&real) {
            out.push(real);
        }
    }
    out
}

pub trait ModuleLocator {
    /// Unnormalized locations as the backend reports them. Empty => not found.
    fn raw_locations(&self, module: &str) -> Result<Vec<PathBuf>>;

    /// Resolve `module` to a ModuleSpec with a single chosen directory.
    fn locate(&self, module: &str) -> Result<ModuleSpec> {
        validate_module_name(module)?;
        let locations = normalize_locations(self.raw_locations(module)?);
        let Some(first) = locations.first().cloned() else {
            return Err(SnapshotError::module_not_found(
                module,
                "no importable directory locations",
            ));
        };
        if locations.len() > 1 {
            let ignored: Vec<String> = locations[1..]
                .iter()
                .map(|p| p.display().to_string())
                .collect();
            warn!(
                "module {} has {} locations; using {} and ignoring {}",
                module,
                locations.len(),
                first.display(),
                ignored.join(", ")
            );
        }
        Ok(ModuleSpec {
            name: module.to_string(),
            search_locations: locations,
            path: first,
        })
    }
}

// ---------------- SearchPathLocator ----------------

/// Filesystem walk over an ordered list of import roots.
#[derive(Debug, Clone)]
pub struct SearchPathLocator {
    roots: Vec<PathBuf>,
}

impl SearchPathLocator {
    /// Roots are used in order; `.pth` files found directly in them append extra roots.
    pub fn new<I, P>(roots: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let mut all: Vec<PathBuf> = roots.into_iter().map(Into::into).collect();
        let mut extra = Vec::new();
        for root in &all {
            extra.extend(pth_entries(root));
        }
        for p in extra {
            if !all.contains(&p) {
                all.push(p);
            }
        }
        Self { roots: all }
    }

    /// Roots from a `PYTHONPATH`-style string.
    pub fn from_path_list(list: &str) -> Self {
        Self::new(std::env::split_paths(list).filter(|p| !p.as_os_str().is_empty()))
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }
}

/// Directories named by `*.pth` files inside `root`, in file-name order.
fn pth_entries(root: &Path) -> Vec<PathBuf> {
    let Ok(rd) = fs::read_dir(root) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = rd
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().map(|x| x == "pth").unwrap_or(false) && p.is_file())
        .collect();
    files.sort();

    let mut out = Vec::new();
    for f in files {
        let Ok(text) = fs::read_to_string(&f) else {
            continue;
        };
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty()
                || line.starts_with('#')
                || line.starts_with("import ")
                || line.starts_with("import\t")
            {
                continue;
            }
            let p = Path::new(line);
            let p = if p.is_absolute() {
                p.to_path_buf()
            } else {
                root.join(p)
            };
            if p.is_dir() {
                out.push(p);
            }
        }
    }
    out
}

impl ModuleLocator for SearchPathLocator {
    fn raw_locations(&self, module: &str) -> Result<Vec<PathBuf>> {
        let mut path_list = self.roots.clone();
        for part in module.split('.') {
            let mut portions = Vec::new();
            let mut regular = None;
            for entry in &path_list {
                let cand = entry.join(part);
                if !cand.is_dir() {
                    continue;
                }
                if cand.join("__init__.py").is_file() {
                    regular = Some(cand);
                    break;
                }
                portions.push(cand);
            }
            path_list = match regular {
                Some(p) => vec![p],
                None => portions,
            };
            if path_list.is_empty() {
                break;
            }
        }
        Ok(path_list)
    }
}

// ---------------- InterpreterLocator ----------------

const FIND_SPEC_SCRIPT: &str = "\
import importlib.util, json, sys
try:
    s = importlib.util.find_spec(sys.argv[1])
except Exception:
    s = None
print(json.dumps(list(s.submodule_search_locations or []) if s is not None else []))
";

/// Delegates lookup to a python interpreter's import system.
#[derive(Debug, Clone)]
pub struct InterpreterLocator {
    python: String,
}

impl InterpreterLocator {
    pub fn new(python: impl Into<String>) -> Self {
        Self {
            python: python.into(),
        }
    }

    pub fn python(&self) -> &str {
        &self.python
    }
}

impl ModuleLocator for InterpreterLocator {
    fn raw_locations(&self, module: &str) -> Result<Vec<PathBuf>> {
        let out = run_tool(&self.python, &["-c", FIND_SPEC_SCRIPT, module], None, None)
            .map_err(|e| {
                SnapshotError::module_not_found(module, format!("run {}: {}", self.python, e))
            })?;
        if !out.status.success() {
            return Err(SnapshotError::module_not_found(
                module,
                format!("{} find_spec failed: {}", self.python, stderr_text(&out)),
            ));
        }
        let raw: Vec<String> = serde_json::from_slice(&out.stdout).map_err(|e| {
            SnapshotError::module_not_found(module, format!("parse find_spec output: {e}"))
        })?;
        Ok(raw.into_iter().map(PathBuf::from).collect())
    }
}
