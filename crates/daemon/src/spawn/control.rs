//! SSH ControlMaster helpers.
//!
//! Sessions to the same `host:port:user` share one master connection via a
//! socket in the control directory. These helpers query and stop masters and
//! sweep sockets whose master has died.

use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;

use tokio::process::Command;

use super::ssh::{control_destination, control_path, SshOptions};
use crate::session::RemoteSessionConfig;

/// Timeout for `ssh -O check`.
pub const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for `ssh -O exit`.
pub const EXIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for the per-socket probe during cleanup.
pub const STALE_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// File name prefix of control sockets.
pub const SOCKET_PREFIX: &str = "ssh_control_";

/// Whether a live master connection exists for `cfg`.
pub async fn is_master_active(opts: &SshOptions, cfg: &RemoteSessionConfig) -> bool {
    let path = control_path(cfg, &opts.control_dir);
    if !path.exists() {
        return false;
    }

    let destination = control_destination(cfg);
    match run_control(&opts.program, "check", &path, &destination, CHECK_TIMEOUT).await {
        Some(output) => {
            let active = output.status.success();
            tracing::debug!(session = %cfg.name, active, "ControlMaster check");
            active
        }
        None => false,
    }
}

/// Ask the master for `cfg` to exit.
///
/// Returns true when the master stopped or there was none.
pub async fn terminate_master(opts: &SshOptions, cfg: &RemoteSessionConfig) -> bool {
    let path = control_path(cfg, &opts.control_dir);
    if !path.exists() {
        return true;
    }

    let destination = control_destination(cfg);
    match run_control(&opts.program, "exit", &path, &destination, EXIT_TIMEOUT).await {
        Some(output) if output.status.success() => {
            tracing::info!(session = %cfg.name, "Terminated ControlMaster");
            true
        }
        Some(output) => {
            tracing::warn!(
                session = %cfg.name,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "Failed to terminate ControlMaster"
            );
            false
        }
        None => false,
    }
}

/// Remove control sockets whose master no longer answers.
///
/// Returns the number of sockets removed.
pub async fn cleanup_stale_sockets(opts: &SshOptions) -> usize {
    let dir = &opts.control_dir;
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return 0;
    };

    let mut cleaned = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with(SOCKET_PREFIX) {
            continue;
        }
        let Ok(file_type) = entry.file_type().await else {
            continue;
        };
        if !is_socket(&file_type) {
            continue;
        }

        let path = entry.path();
        let stale = match run_control(&opts.program, "check", &path, "dummy", STALE_PROBE_TIMEOUT)
            .await
        {
            Some(output) => !output.status.success(),
            // Timed out or failed to run; treat as stale.
            None => true,
        };

        if stale {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    tracing::debug!(path = %path.display(), "Removed stale control socket");
                    cleaned += 1;
                }
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "Failed to remove control socket")
                }
            }
        }
    }

    if cleaned > 0 {
        tracing::info!(cleaned, "Cleaned up stale SSH control sockets");
    }
    cleaned
}

async fn run_control(
    program: &str,
    operation: &str,
    socket: &Path,
    destination: &str,
    timeout: Duration,
) -> Option<Output> {
    let mut command = Command::new(program);
    command
        .arg("-O")
        .arg(operation)
        .arg("-S")
        .arg(socket)
        .arg(destination)
        .stdin(Stdio::null())
        .kill_on_drop(true);

    match tokio::time::timeout(timeout, command.output()).await {
        Ok(Ok(output)) => Some(output),
        Ok(Err(e)) => {
            tracing::debug!(operation, error = %e, "Failed to run SSH control command");
            None
        }
        Err(_) => {
            tracing::warn!(operation, socket = %socket.display(), "SSH control command timed out");
            None
        }
    }
}

#[cfg(unix)]
fn is_socket(file_type: &std::fs::FileType) -> bool {
    use std::os::unix::fs::FileTypeExt;
    file_type.is_socket()
}

#[cfg(not(unix))]
fn is_socket(_file_type: &std::fs::FileType) -> bool {
    false
}
