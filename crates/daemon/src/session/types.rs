//! Session identity and launch targets.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::validation::sanitize_username;

/// Default SSH port.
pub const DEFAULT_SSH_PORT: u16 = 22;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide session identifier.
///
/// Ids increase monotonically from 1 and are never reused while the process
/// lives, even across independent managers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SessionId(u64);

impl SessionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The numeric value of this id.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether a session runs a local shell or an SSH client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Local,
    Remote,
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKind::Local => f.write_str("local"),
            SessionKind::Remote => f.write_str("remote"),
        }
    }
}

/// How the SSH client authenticates.
#[derive(Clone, PartialEq, Eq)]
pub enum RemoteAuth {
    /// Private key file passed with `-i`.
    Key { path: PathBuf },
    /// Password, supplied through the password helper when present.
    Password { secret: Option<String> },
}

impl Default for RemoteAuth {
    fn default() -> Self {
        RemoteAuth::Password { secret: None }
    }
}

impl fmt::Debug for RemoteAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteAuth::Key { path } => f.debug_struct("Key").field("path", path).finish(),
            RemoteAuth::Password { secret } => f
                .debug_struct("Password")
                .field("secret", &secret.as_ref().map(|_| "<redacted>"))
                .finish(),
        }
    }
}

/// A local port forward, `[local_host:]local_port:remote_host:remote_port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortForward {
    pub local_host: String,
    pub local_port: u16,
    /// Defaults to the session host when empty.
    pub remote_host: String,
    pub remote_port: u16,
}

impl PortForward {
    /// The `-L` argument for this forward, or `None` if a port is zero.
    pub fn spec(&self, session_host: &str) -> Option<String> {
        if self.local_port == 0 || self.remote_port == 0 {
            return None;
        }
        let local_host = if self.local_host.is_empty() {
            "localhost"
        } else {
            &self.local_host
        };
        let remote_host = if self.remote_host.is_empty() {
            session_host
        } else {
            &self.remote_host
        };
        if remote_host.is_empty() {
            return None;
        }
        Some(format!(
            "{}:{}:{}:{}",
            local_host, self.local_port, remote_host, self.remote_port
        ))
    }
}

impl FromStr for PortForward {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        let (local_host, rest) = match parts.len() {
            3 => ("", &parts[..]),
            4 => (parts[0], &parts[1..]),
            _ => return Err(format!("invalid forward spec: {s}")),
        };

        let parse_port = |p: &str| {
            p.parse::<u16>()
                .ok()
                .filter(|port| *port > 0)
                .ok_or_else(|| format!("invalid port in forward spec: {p}"))
        };

        Ok(PortForward {
            local_host: local_host.to_string(),
            local_port: parse_port(rest[0])?,
            remote_host: rest[1].to_string(),
            remote_port: parse_port(rest[2])?,
        })
    }
}

/// Connection settings for a managed SSH session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSessionConfig {
    /// Display name used in titles and quit warnings.
    pub name: String,
    pub host: String,
    pub port: u16,
    /// Remote user; empty means the SSH client default.
    pub user: String,
    pub auth: RemoteAuth,
    /// Command run on the remote host before the login shell.
    pub initial_command: Option<String>,
    pub x11_forwarding: bool,
    pub port_forwards: Vec<PortForward>,
}

impl RemoteSessionConfig {
    /// A password-authenticated session on the default port.
    pub fn new(name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port: DEFAULT_SSH_PORT,
            user: String::new(),
            auth: RemoteAuth::default(),
            initial_command: None,
            x11_forwarding: false,
            port_forwards: Vec::new(),
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_auth(mut self, auth: RemoteAuth) -> Self {
        self.auth = auth;
        self
    }

    /// `user@host` with the sanitized user, or the bare host without one.
    pub fn destination(&self) -> String {
        let user = sanitize_username(&self.user);
        if user.is_empty() {
            self.host.clone()
        } else {
            format!("{}@{}", user, self.host)
        }
    }

    /// `user@host`, with `:port` appended for non-default ports.
    pub fn connection_string(&self) -> String {
        if self.port == DEFAULT_SSH_PORT {
            self.destination()
        } else {
            format!("{}:{}", self.destination(), self.port)
        }
    }

    /// Whether the session can share a multiplexed control connection.
    ///
    /// Forwarding needs its own connection.
    pub fn uses_multiplexing(&self) -> bool {
        !self.x11_forwarding && self.port_forwards.is_empty()
    }

    /// Parse `[user@]host[:port]`.
    pub fn parse_destination(destination: &str) -> Option<(String, String, Option<u16>)> {
        let (user, host_port) = match destination.rsplit_once('@') {
            Some((user, rest)) => (user.to_string(), rest),
            None => (String::new(), destination),
        };

        let (host, port) = match host_port.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => (host, Some(port.parse().ok()?)),
            _ => (host_port, None),
        };

        if host.is_empty() {
            return None;
        }
        Some((user, host.to_string(), port))
    }
}

/// What a session runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionTarget {
    /// A local shell with a display name.
    Local { name: String },
    /// A managed SSH session.
    Remote(RemoteSessionConfig),
}

impl SessionTarget {
    pub fn local(name: impl Into<String>) -> Self {
        SessionTarget::Local { name: name.into() }
    }

    pub fn kind(&self) -> SessionKind {
        match self {
            SessionTarget::Local { .. } => SessionKind::Local,
            SessionTarget::Remote(_) => SessionKind::Remote,
        }
    }

    /// Display name of the session.
    pub fn name(&self) -> &str {
        match self {
            SessionTarget::Local { name } => name,
            SessionTarget::Remote(cfg) => &cfg.name,
        }
    }

    pub fn remote(&self) -> Option<&RemoteSessionConfig> {
        match self {
            SessionTarget::Remote(cfg) => Some(cfg),
            SessionTarget::Local { .. } => None,
        }
    }

    /// Human-readable description, `name (user@host)` for remote sessions.
    pub fn description(&self) -> String {
        match self {
            SessionTarget::Local { name } => name.clone(),
            SessionTarget::Remote(cfg) => format!("{} ({})", cfg.name, cfg.connection_string()),
        }
    }
}
