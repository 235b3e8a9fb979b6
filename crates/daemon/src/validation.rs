//! Pre-spawn validation of remote session settings.
//!
//! Every check here runs synchronously before a process is started, so a
//! rejected configuration never leaves anything behind.

use std::fs::File;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{KeyError, ValidationError};
use crate::session::{RemoteAuth, RemoteSessionConfig};

/// Longest accepted hostname.
pub const MAX_HOSTNAME_LENGTH: usize = 253;

/// Longest accepted DNS label.
pub const MAX_LABEL_LENGTH: usize = 63;

/// Largest accepted private key file.
pub const MAX_KEY_FILE_SIZE: u64 = 16 * 1024;

/// Longest username kept by [`sanitize_username`].
pub const MAX_USERNAME_LENGTH: usize = 32;

/// Timeout for the diagnostic DNS lookup.
pub const RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Validate a remote session before spawning it.
///
/// Runs the hostname, port and key checks in order and returns the first
/// failure. Missing passwords and unusual usernames are logged only. When a
/// tokio runtime is available a background DNS lookup is started for the
/// logs; it never affects the result.
pub fn validate_remote_config(cfg: &RemoteSessionConfig) -> Result<(), ValidationError> {
    validate_hostname(&cfg.host)?;

    if cfg.port == 0 {
        return Err(ValidationError::InvalidPort(cfg.port));
    }

    match &cfg.auth {
        RemoteAuth::Key { path } if !path.as_os_str().is_empty() => validate_key_file(path)?,
        RemoteAuth::Key { .. } => {
            tracing::debug!(session = %cfg.name, "No key file given, using SSH client defaults");
        }
        RemoteAuth::Password { secret: None } => {
            tracing::warn!(
                session = %cfg.name,
                host = %cfg.host,
                "Password authentication without a stored password; it will be prompted for"
            );
        }
        RemoteAuth::Password { .. } => {}
    }

    if !cfg.user.is_empty() {
        validate_username(&cfg.user)?;
        let sanitized = sanitize_username(&cfg.user);
        if sanitized != cfg.user {
            tracing::warn!(
                session = %cfg.name,
                user = %cfg.user,
                sanitized = %sanitized,
                "Username contains unexpected characters"
            );
        }
    }

    spawn_resolution_check(cfg.host.trim());

    Ok(())
}

/// Check hostname syntax.
///
/// IP literals, optionally bracketed, are accepted as-is.
pub fn validate_hostname(host: &str) -> Result<(), ValidationError> {
    let invalid = |reason: &str| ValidationError::InvalidHostname {
        host: host.to_string(),
        reason: reason.to_string(),
    };

    let trimmed = host.trim();
    if trimmed.is_empty() {
        return Err(invalid("hostname cannot be empty"));
    }

    let unbracketed = trimmed
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .unwrap_or(trimmed);
    if unbracketed.parse::<IpAddr>().is_ok() {
        return Ok(());
    }

    if trimmed.len() > MAX_HOSTNAME_LENGTH {
        return Err(invalid("hostname is longer than 253 characters"));
    }

    if let Some(c) = trimmed
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '.' || *c == '-'))
    {
        return Err(invalid(&format!("unexpected character {:?}", c)));
    }

    for label in trimmed.split('.') {
        if label.is_empty() {
            return Err(invalid("empty label"));
        }
        if label.len() > MAX_LABEL_LENGTH {
            return Err(invalid("label is longer than 63 characters"));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(invalid("label starts or ends with '-'"));
        }
    }

    Ok(())
}

/// Check that a private key file is present, sane in size, private and readable.
pub fn validate_key_file(path: &Path) -> Result<(), KeyError> {
    let metadata = std::fs::metadata(path)
        .map_err(|_| KeyError::new(path, "key file does not exist"))?;

    if !metadata.is_file() {
        return Err(KeyError::new(path, "key path is not a file"));
    }

    let size = metadata.len();
    if size == 0 {
        return Err(KeyError::new(path, "key file is empty"));
    }
    if size > MAX_KEY_FILE_SIZE {
        return Err(KeyError::new(
            path,
            format!("key file too large: {} bytes", size),
        ));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        let mode = metadata.permissions().mode() & 0o777;
        if mode & 0o077 != 0 {
            return Err(KeyError::new(
                path,
                format!("insecure permissions {:04o}, should be 0600", mode),
            ));
        }
    }

    File::open(path).map_err(|e| KeyError::new(path, format!("key file is not readable: {}", e)))?;

    Ok(())
}

/// Reject usernames that ssh would parse as an option or that escape the
/// control directory.
pub fn validate_username(user: &str) -> Result<(), ValidationError> {
    let invalid = |reason: &str| ValidationError::InvalidUsername {
        user: user.to_string(),
        reason: reason.to_string(),
    };

    let trimmed = user.trim();
    if trimmed.starts_with('-') {
        return Err(invalid("username cannot start with '-'"));
    }
    if trimmed.contains(['/', '\\']) {
        return Err(invalid("username cannot contain path separators"));
    }
    if trimmed.chars().any(char::is_control) {
        return Err(invalid("username contains control characters"));
    }

    Ok(())
}

/// Strip characters outside `[A-Za-z0-9._-]`, drop leading `-` and cap the
/// length.
pub fn sanitize_username(user: &str) -> String {
    user.trim()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .skip_while(|c| *c == '-')
        .take(MAX_USERNAME_LENGTH)
        .collect()
}

fn spawn_resolution_check(host: &str) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        return;
    };

    let host = host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    if host.parse::<IpAddr>().is_ok() {
        return;
    }

    handle.spawn(async move {
        let lookup = tokio::net::lookup_host((host.as_str(), 0));
        match tokio::time::timeout(RESOLVE_TIMEOUT, lookup).await {
            Ok(Ok(mut addrs)) => match addrs.next() {
                Some(addr) => tracing::debug!(host = %host, ip = %addr.ip(), "Resolved host"),
                None => tracing::warn!(host = %host, "Host resolved to no addresses"),
            },
            Ok(Err(e)) => tracing::warn!(host = %host, error = %e, "Host name resolution failed"),
            Err(_) => tracing::warn!(host = %host, "Host name resolution timed out"),
        }
    });
}
