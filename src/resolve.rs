//! Module value resolver: infer which modules a set of runtime values depends on.
//!
//! Values arrive as a closed set of shapes (serde tag `kind`):
//!   type      {name, module, bases}
//!   mapping   {type, entries: [[key, value], ...]}
//!   container {type, items: [...]}
//!   object    {type, module?}   opaque value, optionally with its own defining module
//!
//! Modes:
//! - shallow:      only the value's own (type's) defining module;
//! - deep-builtin: also walk into containers whose type is builtin/stdlib;
//! - deep:         walk into every container and through base types.
//!
//! The memo is keyed by (defining module, mode, ignore_builtin); `resolve_modules`
//! uses a fresh one per call.

use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Synthetic module name of the entry script; never snapshot-able.
pub const MAIN_MODULE: &str = "__main__";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeInfo {
    pub name: String,
    pub module: String,
    #[serde(default)]
    pub bases: Vec<TypeInfo>,
}

impl TypeInfo {
    pub fn new(name: impl Into<String>, module: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            module: module.into(),
            bases: Vec::new(),
        }
    }

    pub fn with_base(mut self, base: TypeInfo) -> Self {
        self.bases.push(base);
        self
    }

    /// Convenience for builtin types (`builtins.<name>`).
    pub fn builtin(name: impl Into<String>) -> Self {
        Self::new(name, "builtins")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Value {
    Type(TypeInfo),
    Mapping {
        #[serde(rename = "type")]
        ty: TypeInfo,
        entries: Vec<(Value, Value)>,
    },
    Container {
        #[serde(rename = "type")]
        ty: TypeInfo,
        items: Vec<Value>,
    },
    Object {
        #[serde(rename = "type")]
        ty: TypeInfo,
        #[serde(default)]
        module: Option<String>,
    },
}

impl Value {
    /// Opaque instance of `ty`.
    pub fn object(ty: TypeInfo) -> Self {
        Value::Object { ty, module: None }
    }

    pub fn list(items: Vec<Value>) -> Self {
        Value::Container {
            ty: TypeInfo::builtin("list"),
            items,
        }
    }

    pub fn dict(entries: Vec<(Value, Value)>) -> Self {
        Value::Mapping {
            ty: TypeInfo::builtin("dict"),
            entries,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ResolveMode {
    Shallow,
    #[default]
    DeepBuiltin,
    Deep,
}

impl fmt::Display for ResolveMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResolveMode::Shallow => "shallow",
            ResolveMode::DeepBuiltin => "deep-builtin",
            ResolveMode::Deep => "deep",
        })
    }
}

/// Top-level names of CPython builtin and standard-library modules.
const STDLIB_MODULES: &[&str] = &[
    "__future__", "_abc", "_ast", "_asyncio", "_collections", "_collections_abc", "_functools",
    "_io", "_thread", "_weakref", "abc", "argparse", "array", "ast", "asyncio", "atexit",
    "base64", "bdb", "binascii", "bisect", "builtins", "bz2", "calendar", "cmath", "cmd",
    "code", "codecs", "collections", "colorsys", "concurrent", "configparser", "contextlib",
    "contextvars", "copy", "copyreg", "csv", "ctypes", "curses", "dataclasses", "datetime",
    "dbm", "decimal", "difflib", "dis", "doctest", "email", "encodings", "enum", "errno",
    "faulthandler", "fcntl", "filecmp", "fileinput", "fnmatch", "fractions", "ftplib",
    "functools", "gc", "getopt", "getpass", "gettext", "glob", "graphlib", "grp", "gzip",
    "hashlib", "heapq", "hmac", "html", "http", "imaplib", "importlib", "inspect", "io",
    "ipaddress", "itertools", "json", "keyword", "linecache", "locale", "logging", "lzma",
    "mailbox", "marshal", "math", "mimetypes", "mmap", "multiprocessing", "netrc",
    "numbers", "operator", "optparse", "os", "pathlib", "pdb", "pickle", "pkgutil",
    "platform", "plistlib", "poplib", "posix", "pprint", "profile", "pstats", "pty", "pwd",
    "queue", "quopri", "random", "re", "readline", "reprlib", "resource", "rlcompleter",
    "runpy", "sched", "secrets", "select", "selectors", "shelve", "shlex", "shutil",
    "signal", "site", "smtplib", "socket", "socketserver", "sqlite3", "ssl", "stat",
    "statistics", "string", "stringprep", "struct", "subprocess", "symtable", "sys",
    "sysconfig", "syslog", "tabnanny", "tarfile", "tempfile", "termios", "textwrap",
    "threading", "time", "timeit", "tkinter", "token", "tokenize", "tomllib", "trace",
    "traceback", "tracemalloc", "tty", "turtle", "types", "typing", "unicodedata",
    "unittest", "urllib", "uuid", "venv", "warnings", "wave", "weakref", "webbrowser",
    "wsgiref", "xml", "xmlrpc", "zipapp", "zipfile", "zipimport", "zlib", "zoneinfo",
];

/// Builtin/stdlib check on the top-level package of `module`.
pub fn is_builtin_module(module: &str) -> bool {
    let top = module.split('.').next().unwrap_or(module);
    STDLIB_MODULES.contains(&top)
}

/// Memo key: the resolved set depends on the rules as much as on the module.
type CacheKey = (String, ResolveMode, bool);

/// Memo: (defining module, mode, ignore_builtin) -> resolved module set.
/// Safe to reuse across calls with different settings.
#[derive(Debug, Default)]
pub struct ResolveCache {
    by_module: HashMap<CacheKey, BTreeSet<String>>,
}

impl ResolveCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_module.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_module.is_empty()
    }
}

struct Resolver<'a> {
    cache: &'a mut ResolveCache,
    mode: ResolveMode,
    ignore_builtin: bool,
}

impl Resolver<'_> {
    fn leaf(&self, module: &str, out: &mut BTreeSet<String>) {
        if self.ignore_builtin && is_builtin_module(module) {
            return;
        }
        out.insert(module.to_string());
    }

    fn resolve_type(&mut self, ty: &TypeInfo) -> BTreeSet<String> {
        let key = (ty.module.clone(), self.mode, self.ignore_builtin);
        if let Some(hit) = self.cache.by_module.get(&key) {
            return hit.clone();
        }
        let mut out = BTreeSet::new();
        self.leaf(&ty.module, &mut out);
        if self.mode == ResolveMode::Deep {
            for base in &ty.bases {
                out.extend(self.resolve_type(base));
            }
        }
        self.cache.by_module.insert(key, out.clone());
        out
    }

    /// Descend into a container of type `ty`?
    fn descend(&self, ty: &TypeInfo) -> bool {
        match self.mode {
            ResolveMode::Deep => true,
            // user-defined container => stop here, only its type counts
            ResolveMode::DeepBuiltin => is_builtin_module(&ty.module),
            ResolveMode::Shallow => false,
        }
    }

    fn resolve_value(&mut self, value: &Value) -> BTreeSet<String> {
        match value {
            Value::Type(ty) => self.resolve_type(ty),
            Value::Object { ty, module } => {
                let mut out = self.resolve_type(ty);
                if let Some(m) = module {
                    self.leaf(m, &mut out);
                }
                out
            }
            Value::Mapping { ty, entries } => {
                let mut out = self.resolve_type(ty);
                if self.descend(ty) {
                    for (k, v) in entries {
                        out.extend(self.resolve_value(k));
                        out.extend(self.resolve_value(v));
                    }
                }
                out
            }
            Value::Container { ty, items } => {
                let mut out = self.resolve_type(ty);
                if self.descend(ty) {
                    for item in items {
                        out.extend(self.resolve_value(item));
                    }
                }
                out
            }
        }
    }
}

/// Resolve the set of modules backing `values`.
pub fn resolve_modules(values: &[Value], mode: ResolveMode, ignore_builtin: bool) -> BTreeSet<String> {
    let mut cache = ResolveCache::new();
    resolve_modules_with(values, mode, ignore_builtin, &mut cache)
}

/// Same as [`resolve_modules`] with a caller-owned memo.
pub fn resolve_modules_with(
    values: &[Value],
    mode: ResolveMode,
    ignore_builtin: bool,
    cache: &mut ResolveCache,
) -> BTreeSet<String> {
    let mut r = Resolver {
        cache,
        mode,
        ignore_builtin,
    };
    let mut modules = BTreeSet::new();
    for value in values {
        let mut found = r.resolve_value(value);
        if found.remove(MAIN_MODULE) {
            warn!(
                "value {} is (or contains) a type defined in the main script; \
                 snapshotting the main script is not supported, skipping it",
                describe(value)
            );
        }
        modules.extend(found);
    }
    modules
}

fn describe(value: &Value) -> String {
    match value {
        Value::Type(ty) => format!("type {}", ty.name),
        Value::Mapping { ty, .. } | Value::Container { ty, .. } | Value::Object { ty, .. } => {
            format!("instance of {}", ty.name)
        }
    }
}
