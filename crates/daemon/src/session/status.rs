//! Session lifecycle status.

use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};

/// Lifecycle status of a session.
///
/// Transitions are advisory; the registry records whatever it is told.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Registered, process not yet started.
    Initializing,
    /// The child process is running.
    Running,
    /// Running and focused.
    Focused,
    /// Running and not focused.
    Unfocused,
    /// The terminal stream ended.
    Eof,
    /// The process could not be started.
    SpawnFailed,
    /// The child exited with this code.
    Exited(i32),
}

impl SessionStatus {
    /// Whether the session's process is gone for good.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Eof | SessionStatus::SpawnFailed | SessionStatus::Exited(_)
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Initializing => f.write_str("initializing"),
            SessionStatus::Running => f.write_str("running"),
            SessionStatus::Focused => f.write_str("focused"),
            SessionStatus::Unfocused => f.write_str("unfocused"),
            SessionStatus::Eof => f.write_str("eof"),
            SessionStatus::SpawnFailed => f.write_str("spawn_failed"),
            SessionStatus::Exited(code) => write!(f, "exited_{}", code),
        }
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initializing" => Ok(SessionStatus::Initializing),
            "running" => Ok(SessionStatus::Running),
            "focused" => Ok(SessionStatus::Focused),
            "unfocused" => Ok(SessionStatus::Unfocused),
            "eof" => Ok(SessionStatus::Eof),
            "spawn_failed" => Ok(SessionStatus::SpawnFailed),
            other => other
                .strip_prefix("exited_")
                .and_then(|code| code.parse().ok())
                .map(SessionStatus::Exited)
                .ok_or_else(|| format!("unknown session status: {}", other)),
        }
    }
}

impl Serialize for SessionStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
