//! Worker subprocess spawning.
//!
//! Workers are the service binary re-executed with the hidden `worker`
//! subcommand. Settings travel as a single JSON argument so parent and
//! child enforce identical limits.

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};

use crate::config::Settings;
use crate::error::{PotatError, Result};

/// Spawn a worker subprocess with piped stdio.
///
/// stdout carries the IPC protocol; stderr is captured and re-logged
/// through tracing by [`log_worker_stderr`].
pub fn spawn_worker(settings: &Settings, worker_id: usize) -> Result<Child> {
    let exe_path = std::env::current_exe()
        .map_err(|e| PotatError::Worker(format!("Failed to get current executable: {e}")))?;

    let mut cmd = Command::new(&exe_path);
    cmd.arg("worker");
    cmd.arg("--settings");
    cmd.arg(settings.to_worker_arg());

    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| PotatError::Worker(format!("Failed to spawn worker: {e}")))?;

    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(log_worker_stderr(worker_id, stderr));
    }

    Ok(child)
}

/// Re-log worker stderr output through tracing.
///
/// The worker writes its own compact tracing output to stderr; lines are
/// classified by content so guest noise stays at debug.
async fn log_worker_stderr(worker_id: usize, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }

        let lower = line.to_lowercase();
        if lower.contains("error") {
            tracing::warn!(worker_id, "{line}");
        } else if lower.contains("warn") {
            tracing::debug!(worker_id, "{line}");
        } else {
            tracing::trace!(worker_id, "{line}");
        }
    }
}
