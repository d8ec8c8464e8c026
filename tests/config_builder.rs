use std::path::PathBuf;

use anyhow::Result;

use nshsnap::{NotFoundPolicy, SnapshotConfig, SnapshotConfigBuilder};

const VARS: [&str; 6] = [
    "NSHSNAP_DIR",
    "NSHSNAP_MODULES",
    "NSHSNAP_ON_MODULE_NOT_FOUND",
    "NSHSNAP_EDITABLE",
    "NSHSNAP_SEARCH_PATH",
    "NSHSNAP_PYTHON",
];

// Одна функция на все env-проверки: тесты в одном бинаре идут параллельно.
#[test]
fn env_overrides_then_builder_overrides() -> Result<()> {
    let search = std::env::join_paths([PathBuf::from("/opt/a"), PathBuf::from("/opt/b")])?;
    std::env::set_var("NSHSNAP_DIR", "/tmp/nshsnap-env-dir");
    std::env::set_var("NSHSNAP_MODULES", " alpha, ,beta.sub ");
    std::env::set_var("NSHSNAP_ON_MODULE_NOT_FOUND", "Raise");
    std::env::set_var("NSHSNAP_EDITABLE", "0");
    std::env::set_var("NSHSNAP_SEARCH_PATH", &search);
    std::env::set_var("NSHSNAP_PYTHON", "python3.12");

    let cfg = SnapshotConfig::from_env();
    assert_eq!(cfg.snapshot_dir, Some(PathBuf::from("/tmp/nshsnap-env-dir")));
    assert_eq!(cfg.modules, vec!["alpha", "beta.sub"]);
    assert_eq!(cfg.on_module_not_found, NotFoundPolicy::Raise);
    assert!(!cfg.editable_modules);
    assert_eq!(cfg.search_paths, vec![PathBuf::from("/opt/a"), PathBuf::from("/opt/b")]);
    assert_eq!(cfg.python, "python3.12");

    // builder starts from env, explicit setters win
    let cfg = SnapshotConfigBuilder::new()
        .on_module_not_found(NotFoundPolicy::Warn)
        .module("gamma")
        .git_reference("gamma", "v2")
        .build();
    assert_eq!(cfg.on_module_not_found, NotFoundPolicy::Warn);
    assert_eq!(cfg.modules, vec!["alpha", "beta.sub", "gamma"]);
    assert_eq!(cfg.git_references.get("gamma").map(String::as_str), Some("v2"));

    // malformed policy is ignored, the default stays
    std::env::set_var("NSHSNAP_ON_MODULE_NOT_FOUND", "explode");
    assert_eq!(SnapshotConfig::from_env().on_module_not_found, NotFoundPolicy::Warn);

    for v in VARS {
        std::env::remove_var(v);
    }
    let clean = SnapshotConfig::from_env();
    assert_eq!(clean, SnapshotConfig::default());
    Ok(())
}

#[test]
fn from_default_ignores_env_and_display_is_compact() {
    let cfg = SnapshotConfigBuilder::from_default()
        .module("alpha")
        .module("beta")
        .editable_modules(false)
        .git_reference("alpha", "main")
        .build();

    assert!(cfg.snapshot_dir.is_none());
    assert!(cfg.search_paths.is_empty());

    let s = cfg.to_string();
    assert!(s.contains("modules: [alpha, beta]"), "{s}");
    assert!(s.contains("on_module_not_found: warn"), "{s}");
    assert!(s.contains("editable_modules: false"), "{s}");
    assert!(s.contains("git_references: 1"), "{s}");
    assert!(s.contains("search_paths: interpreter"), "{s}");
    assert!(s.contains("values: none"), "{s}");
}
