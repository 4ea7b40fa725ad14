//! Cache clearing and server restart.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::Context;

pub const DEFAULT_CACHE_DIR: &str = ".cache/mockexam";
pub const DEFAULT_PORT: u16 = 8501;
pub const SERVER_BINARY: &str = "exam-server";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClearedDir {
    pub path: PathBuf,
    pub existed: bool,
}

/// Remove each directory tree; missing directories are not an error
pub fn clear_dirs(dirs: &[PathBuf]) -> anyhow::Result<Vec<ClearedDir>> {
    dirs.iter()
        .map(|dir| {
            let existed = dir.exists();
            if existed {
                remove(dir)?;
                tracing::info!(dir = %dir.display(), "Cleared cache directory");
            } else {
                tracing::debug!(dir = %dir.display(), "Cache directory absent");
            }
            Ok(ClearedDir {
                path: dir.clone(),
                existed,
            })
        })
        .collect()
}

fn remove(path: &Path) -> anyhow::Result<()> {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    result.with_context(|| format!("removing {}", path.display()))
}

/// `pkill -f exam-server`; returns whether anything was signalled
pub fn stop_server() -> anyhow::Result<bool> {
    let status = Command::new("pkill")
        .args(["-f", SERVER_BINARY])
        .status()
        .context("running pkill")?;

    // pkill exits 1 when no process matched
    match status.code() {
        Some(0) => Ok(true),
        Some(1) => Ok(false),
        _ => anyhow::bail!("pkill failed: {status}"),
    }
}

/// Start the server in the background bound to `port`; returns its PID
pub fn start_server(port: u16) -> anyhow::Result<u32> {
    let child = Command::new(SERVER_BINARY)
        .env("BIND_ADDR", format!("0.0.0.0:{port}"))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("starting {SERVER_BINARY}"))?;

    tracing::info!(pid = child.id(), port, "Restarted server");
    Ok(child.id())
}
