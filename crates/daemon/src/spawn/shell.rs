//! Local shell selection, environment and working directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use super::ssh::{OSC7_HOST_DETECTION_SNIPPET, OSC7_PRINTF};
use crate::error::ValidationError;

/// Terminal protocol version advertised to shells.
///
/// Shell prompt integrations check this to decide whether to emit OSC 7.
pub const VTE_VERSION: &str = "7600";

/// Set for local shells started by Shellward.
pub const SHELL_INTEGRATION_VAR: &str = "SHELLWARD_SHELL_INTEGRATION";

/// Environment shared by local and remote sessions.
pub fn terminal_env() -> Vec<(String, String)> {
    vec![
        ("TERM".to_string(), "xterm-256color".to_string()),
        ("COLORTERM".to_string(), "truecolor".to_string()),
        ("VTE_VERSION".to_string(), VTE_VERSION.to_string()),
    ]
}

/// Environment for local shells.
pub fn local_env() -> Vec<(String, String)> {
    let mut env = terminal_env();
    env.push((SHELL_INTEGRATION_VAR.to_string(), "1".to_string()));
    env
}

/// Pick the shell to run.
///
/// Preference order: the configured shell, `$SHELL`, then the platform
/// default.
pub fn resolve_shell(configured: Option<&str>) -> String {
    if let Some(shell) = configured.filter(|s| !s.is_empty()) {
        return shell.to_string();
    }

    if cfg!(windows) {
        return "powershell.exe".to_string();
    }

    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

/// Shell followed by `-l` for login shells.
pub fn shell_argv(shell: &str, login: bool) -> Vec<String> {
    let mut argv = vec![shell.to_string()];
    if login && !cfg!(windows) {
        argv.push("-l".to_string());
    }
    argv
}

pub fn is_zsh(shell: &str) -> bool {
    Path::new(shell)
        .file_name()
        .is_some_and(|name| name == "zsh")
}

/// Write a temporary `ZDOTDIR` whose `.zshrc` installs a precmd hook that
/// announces the working directory, then sources the user's own `.zshrc`.
pub fn prepare_zsh_integration() -> io::Result<TempDir> {
    let dir = tempfile::Builder::new().prefix("shellward_zsh_").tempdir()?;

    let zshrc = format!(
        concat!(
            "_shellward_update_cwd() {{ {} {}; }}\n",
            "if [[ -z \"$precmd_functions\" ]]; then\n",
            "  typeset -a precmd_functions\n",
            "fi\n",
            "precmd_functions+=(_shellward_update_cwd)\n",
            "if [ -f \"$HOME/.zshrc\" ]; then . \"$HOME/.zshrc\"; fi\n",
        ),
        OSC7_HOST_DETECTION_SNIPPET, OSC7_PRINTF
    );
    fs::write(dir.path().join(".zshrc"), zshrc)?;

    Ok(dir)
}

pub fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"))
}

/// Expand `~` and make `requested` absolute, then require a directory.
pub fn check_working_directory(requested: &Path) -> Result<PathBuf, ValidationError> {
    let invalid = |reason: &str| ValidationError::InvalidWorkingDirectory {
        path: requested.to_path_buf(),
        reason: reason.to_string(),
    };

    let expanded = expand_home(requested);
    let absolute = if expanded.is_absolute() {
        expanded
    } else {
        std::env::current_dir()
            .map_err(|e| invalid(&e.to_string()))?
            .join(expanded)
    };

    let metadata = fs::metadata(&absolute).map_err(|_| invalid("does not exist"))?;
    if !metadata.is_dir() {
        return Err(invalid("not a directory"));
    }
    Ok(absolute)
}

/// The directory a local shell starts in.
///
/// Unusable requests are logged and replaced by the home directory.
pub fn resolve_working_directory(requested: Option<&Path>) -> PathBuf {
    let Some(requested) = requested.filter(|p| !p.as_os_str().is_empty()) else {
        return home_dir();
    };

    match check_working_directory(requested) {
        Ok(path) => path,
        Err(e) => {
            tracing::error!(error = %e, "Falling back to home directory");
            home_dir()
        }
    }
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => home_dir().join(rest),
        Err(_) => path.to_path_buf(),
    }
}
