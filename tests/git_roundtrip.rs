use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Result};

use nshsnap::git::{self, CheckoutGuard, CheckoutOutcome};
use nshsnap::lock::try_lock_repository;
use nshsnap::{snapshot_modules, ModuleStatus, NotFoundPolicy, SearchPathLocator, SnapshotError};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("nshsnaptest-git-{prefix}-{pid}-{t}-{id}"))
}

fn tools_available() -> bool {
    ["git", "rsync"].iter().all(|t| {
        Command::new(t)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    })
}

fn sh_git(dir: &Path, args: &[&str]) -> Result<String> {
    let out = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args([
            "-c",
            "user.name=nshsnap",
            "-c",
            "user.email=nshsnap@example.com",
            "-c",
            "commit.gpgsign=false",
        ])
        .args(args)
        .output()?;
    if !out.status.success() {
        bail!(
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&out.stderr)
        );
    }
    Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
}

/// Repository at <root>/src with package `alpha`:
/// - branch `main`:    alpha/core.py = "BRANCH = 'main'"
/// - branch `feature`: alpha/core.py = "BRANCH = 'feature'"
/// Working tree left on `main`.
fn make_repo(root: &Path) -> Result<PathBuf> {
    let src = root.join("src");
    fs::create_dir_all(src.join("alpha"))?;
    sh_git(&src, &["init", "-q"])?;
    sh_git(&src, &["checkout", "-q", "-b", "main"])?;

    fs::write(src.join(".gitignore"), "*.log\nbuild/\n")?;
    fs::write(src.join("alpha/__init__.py"), "")?;
    fs::write(src.join("alpha/core.py"), "BRANCH = 'main'\n")?;
    sh_git(&src, &["add", "-A"])?;
    sh_git(&src, &["commit", "-q", "-m", "main"])?;

    sh_git(&src, &["checkout", "-q", "-b", "feature"])?;
    fs::write(src.join("alpha/core.py"), "BRANCH = 'feature'\n")?;
    fs::write(src.join("alpha/extra.py"), "EXTRA = True\n")?;
    sh_git(&src, &["add", "-A"])?;
    sh_git(&src, &["commit", "-q", "-m", "feature"])?;

    sh_git(&src, &["checkout", "-q", "main"])?;
    Ok(src)
}

fn refs(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(m, r)| (m.to_string(), r.to_string()))
        .collect()
}

#[test]
fn requested_reference_is_copied_and_original_restored() -> Result<()> {
    if !tools_available() {
        return Ok(());
    }
    let root = unique_root("roundtrip");
    let src = make_repo(&root)?;
    let dest = root.join("snap");

    let res = snapshot_modules(
        &dest,
        &["alpha".to_string()],
        NotFoundPolicy::Raise,
        &refs(&[("alpha", "feature")]),
        &SearchPathLocator::new([src.clone()]),
    )?;

    let m = &res.modules[0];
    assert_eq!(m.status, ModuleStatus::Success);
    assert_eq!(m.git_reference_requested.as_deref(), Some("feature"));
    assert_eq!(m.git_reference_original.as_deref(), Some("main"));
    assert_eq!(m.git_reference_used.as_deref(), Some("feature"));

    assert_eq!(fs::read_to_string(dest.join("alpha/core.py"))?, "BRANCH = 'feature'\n");
    assert!(dest.join("alpha/extra.py").is_file());

    // the developer's checkout is back where it was
    assert_eq!(git::current_reference(&src)?, "main");
    assert_eq!(fs::read_to_string(src.join("alpha/core.py"))?, "BRANCH = 'main'\n");
    assert!(!src.join("alpha/extra.py").exists());

    let _ = fs::remove_dir_all(&root);
    Ok(())
}

#[test]
fn detached_head_is_restored_to_the_same_commit() -> Result<()> {
    if !tools_available() {
        return Ok(());
    }
    let root = unique_root("detached");
    let src = make_repo(&root)?;
    let head = sh_git(&src, &["rev-parse", "HEAD"])?;
    sh_git(&src, &["checkout", "-q", &head])?;
    assert_eq!(git::current_reference(&src)?, head);

    snapshot_modules(
        &root.join("snap"),
        &["alpha".to_string()],
        NotFoundPolicy::Warn,
        &refs(&[("alpha", "feature")]),
        &SearchPathLocator::new([src.clone()]),
    )?;

    assert_eq!(git::current_reference(&src)?, head);
    let _ = fs::remove_dir_all(&root);
    Ok(())
}

#[test]
fn unknown_reference_is_recorded_not_raised() -> Result<()> {
    if !tools_available() {
        return Ok(());
    }
    let root = unique_root("badref");
    let src = make_repo(&root)?;
    let dest = root.join("snap");

    let res = snapshot_modules(
        &dest,
        &["alpha".to_string()],
        NotFoundPolicy::Raise,
        &refs(&[("alpha", "no-such-branch")]),
        &SearchPathLocator::new([src.clone()]),
    )?;

    let m = &res.modules[0];
    assert_eq!(m.status, ModuleStatus::GitReferenceFailed);
    assert_eq!(m.git_reference_original.as_deref(), Some("main"));
    assert!(m.git_reference_used.is_none());
    assert!(m.destination.is_none());
    assert!(!dest.join("alpha").exists(), "no copy after a failed checkout");
    assert_eq!(git::current_reference(&src)?, "main");

    let _ = fs::remove_dir_all(&root);
    Ok(())
}

#[test]
fn reference_on_plain_directory_fails_that_module_only() -> Result<()> {
    if !tools_available() {
        return Ok(());
    }
    let root = unique_root("plain");
    let src = root.join("plain");
    fs::create_dir_all(src.join("beta"))?;
    fs::write(src.join("beta/__init__.py"), "")?;
    fs::create_dir_all(src.join("delta"))?;
    fs::write(src.join("delta/__init__.py"), "")?;

    let res = snapshot_modules(
        &root.join("snap"),
        &["beta".to_string(), "delta".to_string()],
        NotFoundPolicy::Raise,
        &refs(&[("beta", "v1")]),
        &SearchPathLocator::new([src]),
    )?;

    assert_eq!(res.modules[0].status, ModuleStatus::GitReferenceFailed);
    assert!(res.modules[0].git_reference_original.is_none());
    assert_eq!(res.modules[1].status, ModuleStatus::Success);

    let _ = fs::remove_dir_all(&root);
    Ok(())
}

#[test]
fn raise_abort_still_restores_earlier_checkouts() -> Result<()> {
    if !tools_available() {
        return Ok(());
    }
    let root = unique_root("raise");
    let src = make_repo(&root)?;

    let err = snapshot_modules(
        &root.join("snap"),
        &["alpha".to_string(), "missing".to_string()],
        NotFoundPolicy::Raise,
        &refs(&[("alpha", "feature")]),
        &SearchPathLocator::new([src.clone()]),
    )
    .unwrap_err();

    assert!(matches!(err, SnapshotError::ModuleNotFound { .. }));
    assert_eq!(git::current_reference(&src)?, "main");
    assert_eq!(fs::read_to_string(src.join("alpha/core.py"))?, "BRANCH = 'main'\n");

    let _ = fs::remove_dir_all(&root);
    Ok(())
}

#[test]
fn locked_repository_is_reported_per_module() -> Result<()> {
    if !tools_available() {
        return Ok(());
    }
    let root = unique_root("locked");
    let src = make_repo(&root)?;
    let other = try_lock_repository(&git::git_dir(&src)?)?;

    let res = snapshot_modules(
        &root.join("snap"),
        &["alpha".to_string()],
        NotFoundPolicy::Raise,
        &refs(&[("alpha", "feature")]),
        &SearchPathLocator::new([src.clone()]),
    )?;
    drop(other);

    assert_eq!(res.modules[0].status, ModuleStatus::GitReferenceFailed);
    // the lock comes before the capture: nothing was read from a locked tree
    assert!(res.modules[0].git_reference_original.is_none());
    assert_eq!(git::current_reference(&src)?, "main");

    let _ = fs::remove_dir_all(&root);
    Ok(())
}

#[test]
fn original_reference_is_never_read_from_a_foreign_checkout() -> Result<()> {
    if !tools_available() {
        return Ok(());
    }
    let root = unique_root("foreign");
    let src = make_repo(&root)?;
    let loc = SearchPathLocator::new([src.clone()]);
    let modules = ["alpha".to_string()];
    let want = refs(&[("alpha", "feature")]);

    // another invocation holds the repository and has it switched to `feature`
    let other = try_lock_repository(&git::git_dir(&src)?)?;
    sh_git(&src, &["checkout", "-q", "feature"])?;

    let res = snapshot_modules(&root.join("snap1"), &modules, NotFoundPolicy::Warn, &want, &loc)?;
    assert_eq!(res.modules[0].status, ModuleStatus::GitReferenceFailed);
    assert!(res.modules[0].git_reference_original.is_none());

    // it restores and lets go
    sh_git(&src, &["checkout", "-q", "main"])?;
    drop(other);

    let res = snapshot_modules(&root.join("snap2"), &modules, NotFoundPolicy::Warn, &want, &loc)?;
    assert_eq!(res.modules[0].status, ModuleStatus::Success);
    assert_eq!(res.modules[0].git_reference_original.as_deref(), Some("main"));
    assert_eq!(git::current_reference(&src)?, "main");

    let _ = fs::remove_dir_all(&root);
    Ok(())
}

#[test]
fn path_like_reference_never_touches_uncommitted_work() -> Result<()> {
    if !tools_available() {
        return Ok(());
    }
    let root = unique_root("pathspec");
    let src = make_repo(&root)?;
    fs::write(src.join("alpha/core.py"), "UNCOMMITTED WORK\n")?;
    let dest = root.join("snap");

    // `core.py` is a file inside the module, `-b` is an option: neither is a reference
    let res = snapshot_modules(
        &dest,
        &["alpha".to_string()],
        NotFoundPolicy::Raise,
        &refs(&[("alpha", "core.py")]),
        &SearchPathLocator::new([src.clone()]),
    )?;
    let m = &res.modules[0];
    assert_eq!(m.status, ModuleStatus::GitReferenceFailed);
    assert!(m.git_reference_used.is_none());
    assert_eq!(m.git_reference_original.as_deref(), Some("main"));
    assert!(!dest.join("alpha").exists());
    assert_eq!(fs::read_to_string(src.join("alpha/core.py"))?, "UNCOMMITTED WORK\n");

    let mut guard = CheckoutGuard::new();
    for bad in ["-b", "--orphan=x", ""] {
        let failed = guard.checkout(&src.join("alpha"), bad).unwrap_err();
        assert!(matches!(failed.error, SnapshotError::RepositoryState { .. }), "{bad:?}");
    }
    assert!(guard.records().is_empty());
    drop(guard);

    assert_eq!(git::current_reference(&src)?, "main");
    assert_eq!(fs::read_to_string(src.join("alpha/core.py"))?, "UNCOMMITTED WORK\n");
    let _ = fs::remove_dir_all(&root);
    Ok(())
}

#[test]
fn copy_failure_after_checkout_still_restores() -> Result<()> {
    if !tools_available() {
        return Ok(());
    }
    let root = unique_root("copyfail");
    let src = make_repo(&root)?;
    // destination root is a regular file: creating the package dir must fail
    let blocked = root.join("blocked");
    fs::write(&blocked, "")?;

    let err = snapshot_modules(
        &blocked,
        &["alpha".to_string()],
        NotFoundPolicy::Warn,
        &refs(&[("alpha", "feature")]),
        &SearchPathLocator::new([src.clone()]),
    )
    .unwrap_err();

    assert!(matches!(err, SnapshotError::Copy { .. }), "{err}");
    assert_eq!(git::current_reference(&src)?, "main");
    assert_eq!(fs::read_to_string(src.join("alpha/core.py"))?, "BRANCH = 'main'\n");

    let _ = fs::remove_dir_all(&root);
    Ok(())
}

#[test]
fn one_failed_restore_does_not_block_the_others() -> Result<()> {
    if !tools_available() {
        return Ok(());
    }
    let root = unique_root("isolated");
    let src = make_repo(&root)?;
    let plain = root.join("plain");
    fs::create_dir_all(&plain)?;

    let mut guard = CheckoutGuard::new();
    guard.checkout(&src, "feature").map_err(|f| f.error)?;
    // restored first (LIFO) and cannot succeed
    guard.record(&plain, "main", "feature");

    let outcomes: Vec<CheckoutOutcome> =
        guard.restore_all().iter().map(|r| r.outcome.clone()).collect();
    assert_eq!(
        outcomes,
        vec![CheckoutOutcome::Restored, CheckoutOutcome::RestoreFailed]
    );
    assert_eq!(git::current_reference(&src)?, "main");

    // second pass is a no-op
    assert_eq!(guard.restore_all().len(), 2);
    let _ = fs::remove_dir_all(&root);
    Ok(())
}

#[test]
fn guard_drop_restores_in_reverse_order() -> Result<()> {
    if !tools_available() {
        return Ok(());
    }
    let root = unique_root("guard");
    let src = make_repo(&root)?;

    {
        let mut guard = CheckoutGuard::new();
        assert_eq!(guard.checkout(&src, "feature").map_err(|f| f.error)?, "main");
        // same repository twice: the lock taken above is reused
        assert_eq!(guard.checkout(&src, "main").map_err(|f| f.error)?, "feature");
        sh_git(&src, &["checkout", "-q", "feature"])?;
        assert_eq!(guard.records().len(), 2);
        // dropped without restore_all()
    }
    assert_eq!(git::current_reference(&src)?, "main");

    let mut guard = CheckoutGuard::new();
    guard.checkout(&src, "feature").map_err(|f| f.error)?;
    let recs = guard.restore_all();
    assert_eq!(recs[0].outcome, CheckoutOutcome::Restored);
    assert_eq!(git::current_reference(&src)?, "main");

    let _ = fs::remove_dir_all(&root);
    Ok(())
}

#[test]
fn checkout_refuses_non_repository() -> Result<()> {
    if !tools_available() {
        return Ok(());
    }
    let root = unique_root("norepo");
    fs::create_dir_all(&root)?;
    assert!(!git::is_repository(&root));
    let failed = CheckoutGuard::new().checkout(&root, "main").unwrap_err();
    assert!(matches!(failed.error, SnapshotError::RepositoryState { .. }));
    assert!(failed.original.is_none());
    // restore never fails loudly
    assert!(!git::restore(&root, "main"));
    let _ = fs::remove_dir_all(&root);
    Ok(())
}
