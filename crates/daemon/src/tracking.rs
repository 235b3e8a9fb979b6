//! Per-session working directory tracking.
//!
//! Terminal output is scanned for OSC 7 announcements. When the announced
//! directory changes, a new tab title is computed and returned to the caller,
//! which publishes it to subscribers.

use dashmap::DashMap;
use shellward_protocol::{DirectoryAnnouncement, Osc7Buffer, Osc7Parser, DEFAULT_HOSTNAME};

use crate::session::SessionId;

/// A session's directory changed and its title with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TitleChange {
    pub session_id: SessionId,
    pub title: String,
    pub announcement: DirectoryAnnouncement,
}

#[derive(Debug, Default)]
struct TrackedDirectory {
    buffer: Osc7Buffer,
    /// Display name of a managed remote session.
    managed_name: Option<String>,
    current: Option<DirectoryAnnouncement>,
    title: Option<String>,
}

/// Tracks the working directory of every session.
pub struct DirectoryTracker {
    parser: Osc7Parser,
    local_hostname: String,
    sessions: DashMap<SessionId, TrackedDirectory>,
}

impl DirectoryTracker {
    /// Create a tracker with an explicit home directory and local hostname.
    pub fn new(home: Option<String>, local_hostname: impl Into<String>) -> Self {
        let parser = match home {
            Some(home) => Osc7Parser::with_home(home),
            None => Osc7Parser::new(),
        };
        Self {
            parser,
            local_hostname: local_hostname.into(),
            sessions: DashMap::new(),
        }
    }

    /// Create a tracker using this machine's home directory and hostname.
    pub fn from_environment() -> Self {
        let home = dirs::home_dir().map(|home| home.display().to_string());
        let hostname = sysinfo::System::host_name().unwrap_or_else(|| DEFAULT_HOSTNAME.to_string());
        Self::new(home, hostname)
    }

    pub fn local_hostname(&self) -> &str {
        &self.local_hostname
    }

    /// Start tracking a session. `managed_name` prefixes titles of managed
    /// remote sessions.
    pub fn track(&self, id: SessionId, managed_name: Option<String>) {
        self.sessions.insert(
            id,
            TrackedDirectory {
                managed_name,
                ..TrackedDirectory::default()
            },
        );
        tracing::debug!(session_id = %id, "Tracking session directory");
    }

    /// Stop tracking a session. Returns whether it was tracked.
    pub fn untrack(&self, id: SessionId) -> bool {
        self.sessions.remove(&id).is_some()
    }

    pub fn is_tracking(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    /// Scan a chunk of terminal output.
    pub fn feed(&self, id: SessionId, chunk: &[u8]) -> Option<TitleChange> {
        let mut tracked = self.sessions.get_mut(&id)?;
        let announcement = tracked.buffer.feed(&self.parser, chunk)?;
        self.apply(id, &mut tracked, announcement)
    }

    /// Apply a `file://` URI reported by the surface itself.
    pub fn observe_uri(&self, id: SessionId, uri: &str) -> Option<TitleChange> {
        let mut tracked = self.sessions.get_mut(&id)?;
        let announcement = match self.parser.parse_uri(uri) {
            Ok(announcement) => announcement,
            Err(e) => {
                tracing::debug!(session_id = %id, error = %e, "Ignoring directory URI");
                return None;
            }
        };
        self.apply(id, &mut tracked, announcement)
    }

    /// Current title of a session, once a directory has been announced.
    pub fn title(&self, id: SessionId) -> Option<String> {
        self.sessions.get(&id)?.title.clone()
    }

    /// Last announced directory of a session.
    pub fn current(&self, id: SessionId) -> Option<DirectoryAnnouncement> {
        self.sessions.get(&id)?.current.clone()
    }

    /// Title for `announcement`.
    ///
    /// Managed sessions are prefixed with their name, foreign hosts with the
    /// hostname. Local directories show the path alone.
    pub fn compute_title(
        &self,
        announcement: &DirectoryAnnouncement,
        managed_name: Option<&str>,
    ) -> String {
        if let Some(name) = managed_name {
            return format!("{}:{}", name, announcement.display_path);
        }
        if !self.is_local_host(&announcement.hostname) {
            return format!("{}:{}", announcement.hostname, announcement.display_path);
        }
        announcement.display_path.clone()
    }

    /// Whether `hostname` refers to this machine.
    pub fn is_local_host(&self, hostname: &str) -> bool {
        if hostname.is_empty() || hostname.eq_ignore_ascii_case(DEFAULT_HOSTNAME) {
            return true;
        }
        let local = short_name(&self.local_hostname);
        !local.is_empty() && short_name(hostname).eq_ignore_ascii_case(local)
    }

    fn apply(
        &self,
        id: SessionId,
        tracked: &mut TrackedDirectory,
        announcement: DirectoryAnnouncement,
    ) -> Option<TitleChange> {
        if tracked
            .current
            .as_ref()
            .is_some_and(|current| current.path == announcement.path)
        {
            return None;
        }

        let title = self.compute_title(&announcement, tracked.managed_name.as_deref());
        tracing::debug!(
            session_id = %id,
            hostname = %announcement.hostname,
            path = %announcement.path,
            title = %title,
            "Directory changed"
        );

        tracked.title = Some(title.clone());
        tracked.current = Some(announcement.clone());
        Some(TitleChange {
            session_id: id,
            title,
            announcement,
        })
    }
}

fn short_name(hostname: &str) -> &str {
    hostname.split('.').next().unwrap_or(hostname)
}
