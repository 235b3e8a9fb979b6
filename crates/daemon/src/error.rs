//! Error taxonomy for session orchestration.
//!
//! Validation errors are returned synchronously before anything is spawned.
//! Spawn errors are delivered through the spawn handle and echoed to the
//! terminal surface. Termination failures are logged and never surface here.

use std::path::PathBuf;

use thiserror::Error;

use crate::session::SessionId;

/// Remediation hint for a failing key file.
const KEY_HINT: &str = "Check that the key file exists and is only readable by you (chmod 600)";

/// Remediation hint when the SSH client is missing.
pub const COMMAND_NOT_FOUND_HINT: &str =
    "Install the OpenSSH client or check that it is on PATH";

/// Problem with an SSH private key file.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("SSH key {}: {reason}", path.display())]
pub struct KeyError {
    /// The offending key path.
    pub path: PathBuf,
    /// What is wrong with it.
    pub reason: String,
}

impl KeyError {
    pub(crate) fn new(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Remediation hint shown to the user.
    pub fn hint(&self) -> &'static str {
        KEY_HINT
    }
}

/// Input rejected before any process is spawned.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// The hostname is syntactically invalid.
    #[error("invalid hostname {host:?}: {reason}")]
    InvalidHostname {
        /// The rejected hostname.
        host: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Port 0 is not connectable.
    #[error("invalid port: {0}")]
    InvalidPort(u16),

    /// The username would be read as an option or a path.
    #[error("invalid username {user:?}: {reason}")]
    InvalidUsername {
        /// The rejected username.
        user: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The key file failed validation.
    #[error(transparent)]
    Key(#[from] KeyError),

    /// The requested working directory is unusable.
    #[error("invalid working directory {}: {reason}", path.display())]
    InvalidWorkingDirectory {
        /// The rejected directory.
        path: PathBuf,
        /// Why it was rejected.
        reason: String,
    },
}

/// Failure to launch a session process.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SpawnError {
    /// No pseudo-terminal facility is available.
    #[error("pseudo-terminal support unavailable: {0}")]
    CapabilityUnavailable(String),

    /// The remote configuration was rejected.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A required program is not installed.
    #[error("{0} command not found on system")]
    CommandNotFound(String),

    /// The OS refused to execute the command.
    #[error("failed to execute: {message}")]
    Exec {
        /// Error reported by the OS or the surface.
        message: String,
    },

    /// The remote host could not be reached.
    #[error("connection to {host} failed: {message}")]
    RemoteConnection {
        /// Target host.
        host: String,
        /// Underlying error text.
        message: String,
    },

    /// The remote host rejected the credentials.
    #[error("authentication to {host} failed: {message}")]
    Authentication {
        /// Target host.
        host: String,
        /// Underlying error text.
        message: String,
    },

    /// The completion was dropped before the surface reported a result.
    #[error("spawn was cancelled before completion")]
    Cancelled,
}

impl SpawnError {
    /// Classify a raw OS error message for a remote spawn.
    pub fn remote(host: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if lower.contains("permission denied") || lower.contains("authentication") {
            SpawnError::Authentication {
                host: host.to_string(),
                message,
            }
        } else if lower.contains("not found") || lower.contains("no such file") {
            SpawnError::Exec { message }
        } else {
            SpawnError::RemoteConnection {
                host: host.to_string(),
                message,
            }
        }
    }

    /// Remediation hint, when one applies.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            SpawnError::Validation(ValidationError::Key(key)) => Some(key.hint()),
            SpawnError::CommandNotFound(_) => Some(COMMAND_NOT_FOUND_HINT),
            SpawnError::RemoteConnection { message, .. }
            | SpawnError::Authentication { message, .. } => {
                Some(crate::spawn::ssh_error_hint(message))
            }
            _ => None,
        }
    }
}

/// Session manager failures.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A creation request arrived inside the cooldown window.
    #[error("session creation rate limited, retry in {remaining_ms}ms")]
    RateLimited {
        /// Time left in the cooldown window.
        remaining_ms: u64,
    },

    /// No session has this id.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// The session could not be spawned.
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    /// The terminal surface failed an I/O operation.
    #[error("terminal surface error: {0}")]
    Surface(String),
}

impl From<ValidationError> for SessionError {
    fn from(err: ValidationError) -> Self {
        SessionError::Spawn(SpawnError::Validation(err))
    }
}
