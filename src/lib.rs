//! nshsnap: freeze importable source packages (optionally pinned to git references)
//! into a relocatable snapshot directory.

// Базовые модули
pub mod error;
pub mod config;
pub mod util;
pub mod lock;

// Движок снапшота
pub mod locate;   // dotted name -> backing directories
pub mod git;      // reference lookup / checkout / restore
pub mod copy;     // rsync tree copy
pub mod resolve;  // module inference from value descriptions
pub mod snapshot; // orchestrator

// Метаданные и окружение
pub mod deps;
pub mod meta;
pub mod scripts;

pub mod cli;

// Удобные реэкспорты
pub use config::{NotFoundPolicy, SnapshotConfig, SnapshotConfigBuilder};
pub use error::{Result, SnapshotError};
pub use locate::{InterpreterLocator, ModuleLocator, ModuleSpec, SearchPathLocator};
pub use resolve::{resolve_modules, ResolveMode, TypeInfo, Value};
pub use snapshot::{
    ensure_supported, load_existing_snapshot, snapshot, snapshot_modules, ModuleResult,
    ModuleStatus, SnapshotInfo, SnapshotResult,
};
