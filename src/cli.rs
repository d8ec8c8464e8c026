use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{error, info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::config::{NotFoundPolicy, SnapshotConfig};
use crate::resolve::{resolve_modules, ResolveMode, Value};
use crate::snapshot::{load_existing_snapshot, snapshot, ModuleStatus, SnapshotInfo};

#[derive(Parser, Debug)]
#[command(
    name = "nshsnap",
    version,
    about = "Freeze importable source packages into a relocatable snapshot",
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

/// Options shared by `create` and `run`.
#[derive(Args, Debug, Clone)]
pub struct SnapshotArgs {
    /// Modules to include (dotted names)
    #[arg(long, num_args = 1..)]
    modules: Vec<String>,
    /// Snapshot all editable packages in the current environment
    #[arg(short = 'e', long, default_value_t = false)]
    editables: bool,
    /// Custom snapshot directory (default: ~/.cache/nshsnap/snapshots/<id>)
    #[arg(long)]
    dir: Option<PathBuf>,
    /// Pin a module to a git reference: MODULE:REF (repeatable)
    #[arg(long = "git-ref", value_name = "MODULE:REF")]
    git_refs: Vec<String>,
    /// What to do when a module cannot be located
    #[arg(long, value_enum)]
    on_module_not_found: Option<NotFoundPolicy>,
    /// Import roots to search instead of asking the interpreter (repeatable)
    #[arg(long = "search-path")]
    search_paths: Vec<PathBuf>,
    /// Python interpreter used for module lookup and pip
    #[arg(long)]
    python: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Create a snapshot
    ///
    /// Пример:
    ///   nshsnap create --modules mypkg --git-ref mypkg:v1.2.3
    ///   nshsnap create --editables --dir /tmp/snap --json
    Create {
        #[command(flatten)]
        snap: SnapshotArgs,
        /// JSON output (snapshot info)
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Create a snapshot and run a command within it
    ///
    /// Пример:
    ///   nshsnap run --modules mymodule -- python -m mymodule.main
    Run {
        #[command(flatten)]
        snap: SnapshotArgs,
        /// Command to execute (after `--`)
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Print the modules inferred from a JSON array of value descriptions
    Resolve {
        #[arg(long)]
        values_file: PathBuf,
        #[arg(long, value_enum, default_value_t = ResolveMode::DeepBuiltin)]
        deep: ResolveMode,
        /// Keep builtin/standard-library modules in the output
        #[arg(long, default_value_t = false)]
        include_builtin: bool,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Show metadata of an existing snapshot
    Inspect {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

/// Parse `MODULE:REF`.
pub fn parse_git_ref(s: &str) -> Result<(String, String)> {
    let (module, reference) = s
        .split_once(':')
        .ok_or_else(|| anyhow!("--git-ref expects MODULE:REF, got {s:?}"))?;
    let (module, reference) = (module.trim(), reference.trim());
    if module.is_empty() || reference.is_empty() {
        bail!("--git-ref expects MODULE:REF, got {s:?}");
    }
    Ok((module.to_string(), reference.to_string()))
}

/// CLI flags on top of SnapshotConfig::from_env().
pub fn args_to_config(args: &SnapshotArgs) -> Result<SnapshotConfig> {
    let mut cfg = SnapshotConfig::from_env().with_editable_modules(args.editables);
    if !args.modules.is_empty() {
        cfg.modules = args.modules.clone();
    }
    if cfg.modules.is_empty() && !cfg.editable_modules {
        bail!("at least one of --modules or --editables must be provided");
    }
    if let Some(dir) = &args.dir {
        cfg.snapshot_dir = Some(dir.clone());
    }
    if let Some(p) = args.on_module_not_found {
        cfg.on_module_not_found = p;
    }
    if !args.search_paths.is_empty() {
        cfg.search_paths = args.search_paths.clone();
    }
    if let Some(py) = &args.python {
        cfg.python = py.clone();
    }
    for raw in &args.git_refs {
        let (module, reference) = parse_git_ref(raw)?;
        if !cfg.editable_modules && !cfg.modules.contains(&module) {
            warn!("--git-ref for {module} which is not in --modules; it will be ignored");
        }
        cfg.git_references.insert(module, reference);
    }
    Ok(cfg)
}

fn report(info: &SnapshotInfo) {
    info!("Snapshot created at: {}", info.snapshot_dir.display());
    info!("Modules included: {}", info.module_names().join(", "));

    let used: Vec<(&str, &str)> = info.git_references_used().collect();
    if !used.is_empty() {
        info!("Git references used:");
        for (m, r) in used {
            info!("  {}: {}", m, r);
        }
    }

    let failed: Vec<_> = info.failures().collect();
    if !failed.is_empty() {
        warn!("Warnings/Errors:");
        for m in failed {
            match m.status {
                ModuleStatus::NotFound => warn!("  {}: Module not found", m.name),
                ModuleStatus::GitReferenceFailed => warn!(
                    "  {}: Failed to use git reference '{}'",
                    m.name,
                    m.git_reference_requested.as_deref().unwrap_or("")
                ),
                ModuleStatus::Success => {}
            }
        }
    }
}

fn print_info(info: &SnapshotInfo, json: bool) -> Result<()> {
    if json {
        let v = serde_json::json!({
            "snapshot_id": info.snapshot_id,
            "snapshot_dir": info.snapshot_dir,
            "modules": info.modules,
        });
        println!("{}", serde_json::to_string_pretty(&v)?);
        return Ok(());
    }
    println!("Snapshot created at: {}", info.snapshot_dir.display());
    println!("Modules included: {}", info.module_names().join(", "));
    println!("\nTo activate the snapshot, run:");
    println!("source {}/.bin/activate", info.snapshot_dir.display());
    println!("\nTo execute a command within the snapshot, run:");
    println!("{}/.bin/execute <command> [args...]", info.snapshot_dir.display());
    Ok(())
}

/// `PYTHONPATH` with `dir` in front of whatever is already set.
pub fn python_path_with(dir: &Path) -> Result<std::ffi::OsString> {
    let mut paths = vec![dir.to_path_buf()];
    if let Some(cur) = std::env::var_os("PYTHONPATH") {
        paths.extend(std::env::split_paths(&cur).filter(|p| !p.as_os_str().is_empty()));
    }
    std::env::join_paths(paths).context("join PYTHONPATH")
}

/// Run `command` with the snapshot first on PYTHONPATH; returns its exit code.
pub fn exec_in_snapshot(dir: &Path, command: &[String]) -> Result<i32> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| anyhow!("no command provided"))?;
    info!("Executing command: {}", command.join(" "));

    match Command::new(program)
        .args(args)
        .env("PYTHONPATH", python_path_with(dir)?)
        .status()
    {
        Ok(status) => Ok(exit_code(status)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            error!("Command not found: {program}");
            Ok(127)
        }
        Err(e) => Err(e).with_context(|| format!("execute {program}")),
    }
}

#[cfg(unix)]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(1)
}

#[cfg(not(unix))]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}

/// Entry point for the binary; returns the process exit code.
pub fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.cmd {
        Cmd::Create { snap, json } => {
            let cfg = args_to_config(&snap)?;
            let info = snapshot(cfg).context("create snapshot")?;
            report(&info);
            print_info(&info, json)?;
            Ok(0)
        }

        Cmd::Run { snap, command } => {
            let cfg = args_to_config(&snap)?;
            info!("Creating snapshot...");
            let info = snapshot(cfg).context("create snapshot")?;
            report(&info);
            exec_in_snapshot(&info.snapshot_dir, &command)
        }

        Cmd::Resolve {
            values_file,
            deep,
            include_builtin,
            json,
        } => {
            let text = fs::read_to_string(&values_file)
                .with_context(|| format!("read {}", values_file.display()))?;
            let values: Vec<Value> = serde_json::from_str(&text)
                .with_context(|| format!("parse {}", values_file.display()))?;
            let modules = resolve_modules(&values, deep, !include_builtin);
            if json {
                println!("{}", serde_json::to_string(&modules)?);
            } else {
                for m in modules {
                    println!("{m}");
                }
            }
            Ok(0)
        }

        Cmd::Inspect { dir, json } => {
            let info = load_existing_snapshot(&dir)
                .with_context(|| format!("load snapshot at {}", dir.display()))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&info.modules)?);
                return Ok(0);
            }
            println!("Snapshot {}", info.snapshot_id);
            println!("  dir = {}", info.snapshot_dir.display());
            for m in &info.modules {
                println!(
                    "  - {:30} {:?}  {}",
                    m.name,
                    m.status,
                    m.git_reference_used.as_deref().unwrap_or("-")
                );
            }
            Ok(0)
        }
    }
}
