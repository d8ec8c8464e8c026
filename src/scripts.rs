//! Activation / execution scripts under `<snapshot>/.bin`.
//!
//! - activate       bash/sh: prepend snapshot to PYTHONPATH, `deactivate` restores it
//! - activate.zsh   zsh flavour of the same
//! - activate.fish  fish
//! - activate.ps1   PowerShell
//! - execute        `execute <command> [args...]` runs a command inside the snapshot
//!
//! Nothing else is sandboxed: the snapshot only wins through PYTHONPATH ordering.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, ResultExt};

pub const SCRIPT_DIR: &str = ".bin";

/// Single-quote for POSIX shells (and fish, which accepts the same escaping here).
fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn ps_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn posix_activate(dir: &str, shebang: &str) -> String {
    let q = sh_quote(dir);
    format!(
        r#"#!{shebang}

# Add the snapshot directory to PYTHONPATH
export _NSHSNAP_OLD_PYTHONPATH="${{PYTHONPATH-}}"
if [ -n "${{PYTHONPATH-}}" ]; then
    export PYTHONPATH={q}:"$PYTHONPATH"
else
    export PYTHONPATH={q}
fi

export _NSHSNAP_OLD_PS1="${{PS1-}}"
export PS1="(snapshot) ${{PS1-}}"

deactivate() {{
    if [ -n "$_NSHSNAP_OLD_PYTHONPATH" ]; then
        export PYTHONPATH="$_NSHSNAP_OLD_PYTHONPATH"
    else
        unset PYTHONPATH
    fi
    export PS1="$_NSHSNAP_OLD_PS1"
    unset _NSHSNAP_OLD_PYTHONPATH _NSHSNAP_OLD_PS1
    unset -f deactivate
}}

echo "Snapshot environment activated. Use 'deactivate' to exit."
"#
    )
}

fn fish_activate(dir: &str) -> String {
    let q = sh_quote(dir);
    format!(
        r#"# source this file from fish

set -gx _NSHSNAP_OLD_PYTHONPATH "$PYTHONPATH"
if test -n "$PYTHONPATH"
    set -gx PYTHONPATH {q}":$PYTHONPATH"
else
    set -gx PYTHONPATH {q}
end

function deactivate
    if test -n "$_NSHSNAP_OLD_PYTHONPATH"
        set -gx PYTHONPATH "$_NSHSNAP_OLD_PYTHONPATH"
    else
        set -e PYTHONPATH
    end
    set -e _NSHSNAP_OLD_PYTHONPATH
    functions -e deactivate
end

echo "Snapshot environment activated. Use 'deactivate' to exit."
"#
    )
}

fn ps1_activate(dir: &str) -> String {
    let q = ps_quote(dir);
    format!(
        r#"# dot-source this file from PowerShell: . .bin/activate.ps1

$global:_NSHSNAP_OLD_PYTHONPATH = $env:PYTHONPATH
if ($env:PYTHONPATH) {{
    $env:PYTHONPATH = {q} + [IO.Path]::PathSeparator + $env:PYTHONPATH
}} else {{
    $env:PYTHONPATH = {q}
}}

function global:deactivate {{
    if ($global:_NSHSNAP_OLD_PYTHONPATH) {{
        $env:PYTHONPATH = $global:_NSHSNAP_OLD_PYTHONPATH
    }} else {{
        Remove-Item Env:PYTHONPATH -ErrorAction SilentlyContinue
    }}
    Remove-Variable -Name _NSHSNAP_OLD_PYTHONPATH -Scope Global -ErrorAction SilentlyContinue
    Remove-Item Function:deactivate
}}

Write-Host "Snapshot environment activated. Use 'deactivate' to exit."
"#
    )
}

fn execute_script(dir: &str) -> String {
    let q = sh_quote(dir);
    format!(
        r#"#!/bin/bash

if [ "$#" -eq 0 ]; then
    echo "Usage: $0 <command> [args...]"
    exit 1
fi

# Add the snapshot directory to PYTHONPATH
if [ -n "${{PYTHONPATH-}}" ]; then
    export PYTHONPATH={q}:"$PYTHONPATH"
else
    export PYTHONPATH={q}
fi

exec "$@"
"#
    )
}

fn write_script(path: &Path, content: &str, executable: bool) -> Result<()> {
    fs::write(path, content).ctx(|| format!("write {}", path.display()))?;
    #[cfg(unix)]
    if executable {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))
            .ctx(|| format!("chmod {}", path.display()))?;
    }
    #[cfg(not(unix))]
    let _ = executable;
    Ok(())
}

/// Write all scripts into `<snapshot_dir>/.bin`. Returns the script directory.
pub fn create_snapshot_scripts(snapshot_dir: &Path) -> Result<PathBuf> {
    let script_dir = snapshot_dir.join(SCRIPT_DIR);
    fs::create_dir_all(&script_dir).ctx(|| format!("create {}", script_dir.display()))?;
    let dir = snapshot_dir.display().to_string();

    write_script(&script_dir.join("activate"), &posix_activate(&dir, "/bin/bash"), true)?;
    write_script(&script_dir.join("activate.zsh"), &posix_activate(&dir, "/bin/zsh"), true)?;
    write_script(&script_dir.join("activate.fish"), &fish_activate(&dir), false)?;
    write_script(&script_dir.join("activate.ps1"), &ps1_activate(&dir), false)?;
    write_script(&script_dir.join("execute"), &execute_script(&dir), true)?;
    Ok(script_dir)
}
