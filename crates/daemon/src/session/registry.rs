//! Session registry.
//!
//! Maps session ids to their metadata and a weak handle to the terminal
//! surface. The surface is owned by whoever displays it; once they drop it the
//! entry becomes dead and is removed by [`SessionRegistry::prune_dead`].

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use parking_lot::ReentrantMutex;
use serde::Serialize;

use super::status::SessionStatus;
use super::surface::TerminalSurface;
use super::types::{SessionId, SessionKind, SessionTarget};

/// Snapshot of a session's metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub kind: SessionKind,
    #[serde(skip)]
    pub target: SessionTarget,
    /// Display name.
    pub name: String,
    pub status: SessionStatus,
    /// Set once the spawn has succeeded.
    pub process_id: Option<u32>,
    pub created_at: SystemTime,
}

impl SessionInfo {
    /// Whether this is a remote session with a live process.
    pub fn is_active_remote(&self) -> bool {
        self.kind == SessionKind::Remote
            && self.process_id.is_some()
            && !self.status.is_terminal()
    }
}

struct Entry {
    info: SessionInfo,
    surface: Weak<dyn TerminalSurface>,
}

/// Thread-safe map of sessions keyed by id.
pub struct SessionRegistry {
    entries: ReentrantMutex<RefCell<BTreeMap<SessionId, Entry>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            entries: ReentrantMutex::new(RefCell::new(BTreeMap::new())),
        }
    }

    /// Register a new session and return its id.
    pub fn register(&self, surface: &Arc<dyn TerminalSurface>, target: SessionTarget) -> SessionId {
        let id = SessionId::next();
        let info = SessionInfo {
            id,
            kind: target.kind(),
            name: target.name().to_string(),
            target,
            status: SessionStatus::Initializing,
            process_id: None,
            created_at: SystemTime::now(),
        };

        tracing::debug!(session_id = %id, kind = %info.kind, name = %info.name, "Registered session");

        let guard = self.entries.lock();
        guard.borrow_mut().insert(
            id,
            Entry {
                info,
                surface: Arc::downgrade(surface),
            },
        );
        id
    }

    /// Attach the spawned pid and mark the session running.
    ///
    /// Returns false if the session is unknown.
    pub fn update_process(&self, id: SessionId, pid: u32) -> bool {
        let guard = self.entries.lock();
        let mut entries = guard.borrow_mut();
        match entries.get_mut(&id) {
            Some(entry) => {
                entry.info.process_id = Some(pid);
                entry.info.status = SessionStatus::Running;
                true
            }
            None => {
                tracing::debug!(session_id = %id, pid, "Process update for unknown session");
                false
            }
        }
    }

    /// Record a status change. Returns false if the session is unknown.
    pub fn update_status(&self, id: SessionId, status: SessionStatus) -> bool {
        let guard = self.entries.lock();
        let mut entries = guard.borrow_mut();
        match entries.get_mut(&id) {
            Some(entry) => {
                if entry.info.status != status {
                    tracing::debug!(session_id = %id, from = %entry.info.status, to = %status, "Session status changed");
                    entry.info.status = status;
                }
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: SessionId) -> Option<SessionInfo> {
        let guard = self.entries.lock();
        let entries = guard.borrow();
        entries.get(&id).map(|entry| entry.info.clone())
    }

    pub fn status(&self, id: SessionId) -> Option<SessionStatus> {
        let guard = self.entries.lock();
        let entries = guard.borrow();
        entries.get(&id).map(|entry| entry.info.status)
    }

    /// The session's surface, if it is still alive.
    pub fn surface(&self, id: SessionId) -> Option<Arc<dyn TerminalSurface>> {
        let guard = self.entries.lock();
        let entries = guard.borrow();
        entries.get(&id).and_then(|entry| entry.surface.upgrade())
    }

    /// Remove a session. Idempotent; returns whether it was present.
    pub fn unregister(&self, id: SessionId) -> bool {
        let guard = self.entries.lock();
        let removed = guard.borrow_mut().remove(&id).is_some();
        if removed {
            tracing::debug!(session_id = %id, "Unregistered session");
        }
        removed
    }

    /// Remove entries whose surface has been dropped.
    ///
    /// Returns the removed sessions.
    pub fn prune_dead(&self) -> Vec<SessionInfo> {
        let guard = self.entries.lock();
        let mut entries = guard.borrow_mut();

        let dead: Vec<SessionId> = entries
            .iter()
            .filter(|(_, entry)| entry.surface.strong_count() == 0)
            .map(|(id, _)| *id)
            .collect();

        let pruned: Vec<SessionInfo> = dead
            .iter()
            .filter_map(|id| entries.remove(id))
            .map(|entry| entry.info)
            .collect();

        if !pruned.is_empty() {
            tracing::debug!(count = pruned.len(), "Pruned dead sessions");
        }
        pruned
    }

    /// Ids of all sessions in creation order.
    pub fn ids(&self) -> Vec<SessionId> {
        let guard = self.entries.lock();
        let entries = guard.borrow();
        entries.keys().copied().collect()
    }

    /// Snapshots of all sessions in creation order.
    pub fn list(&self) -> Vec<SessionInfo> {
        let guard = self.entries.lock();
        let entries = guard.borrow();
        entries.values().map(|entry| entry.info.clone()).collect()
    }

    pub fn count(&self) -> usize {
        self.entries.lock().borrow().len()
    }

    /// Sessions whose status is not terminal.
    pub fn active_count(&self) -> usize {
        let guard = self.entries.lock();
        let entries = guard.borrow();
        entries
            .values()
            .filter(|entry| !entry.info.status.is_terminal())
            .count()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::surface::{SpawnCallback, SpawnRequest, SurfaceSink};
    use crate::session::RemoteSessionConfig;

    struct NullSurface;

    impl TerminalSurface for NullSurface {
        fn attach(&self, _sink: SurfaceSink) {}
        fn spawn_async(&self, _request: SpawnRequest, _on_complete: SpawnCallback) {}
        fn feed(&self, _data: &[u8]) {}
        fn close(&self) {}
    }

    fn surface() -> Arc<dyn TerminalSurface> {
        Arc::new(NullSurface)
    }

    #[test]
    fn test_register_and_get() {
        let registry = SessionRegistry::new();
        let surface = surface();
        let id = registry.register(&surface, SessionTarget::local("Terminal"));

        let info = registry.get(id).unwrap();
        assert_eq!(info.id, id);
        assert_eq!(info.kind, SessionKind::Local);
        assert_eq!(info.name, "Terminal");
        assert_eq!(info.status, SessionStatus::Initializing);
        assert_eq!(info.process_id, None);
        assert!(registry.surface(id).is_some());
    }

    #[test]
    fn test_ids_are_unique_and_ordered() {
        let registry = SessionRegistry::new();
        let surface = surface();
        let a = registry.register(&surface, SessionTarget::local("a"));
        let b = registry.register(&surface, SessionTarget::local("b"));

        assert_ne!(a, b);
        assert_eq!(registry.ids(), vec![a, b]);
        assert_eq!(registry.count(), 2);
    }

    #[test]
    fn test_update_process_sets_running() {
        let registry = SessionRegistry::new();
        let surface = surface();
        let id = registry.register(&surface, SessionTarget::local("t"));

        assert!(registry.update_process(id, 1234));
        let info = registry.get(id).unwrap();
        assert_eq!(info.process_id, Some(1234));
        assert_eq!(info.status, SessionStatus::Running);
    }

    #[test]
    fn test_unknown_session_updates() {
        let registry = SessionRegistry::new();
        let surface = surface();
        let id = registry.register(&surface, SessionTarget::local("t"));
        registry.unregister(id);

        assert!(!registry.update_process(id, 1));
        assert!(!registry.update_status(id, SessionStatus::Eof));
        assert!(registry.get(id).is_none());
        assert!(registry.surface(id).is_none());
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let registry = SessionRegistry::new();
        let surface = surface();
        let id = registry.register(&surface, SessionTarget::local("t"));

        assert!(registry.unregister(id));
        assert!(!registry.unregister(id));
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_prune_dead() {
        let registry = SessionRegistry::new();
        let kept = surface();
        let dropped = surface();
        let alive = registry.register(&kept, SessionTarget::local("alive"));
        let dead = registry.register(&dropped, SessionTarget::local("dead"));

        drop(dropped);
        let pruned = registry.prune_dead();

        assert_eq!(pruned.len(), 1);
        assert_eq!(pruned[0].id, dead);
        assert_eq!(registry.ids(), vec![alive]);
        assert!(registry.prune_dead().is_empty());
    }

    #[test]
    fn test_active_count_ignores_terminal() {
        let registry = SessionRegistry::new();
        let surface = surface();
        let a = registry.register(&surface, SessionTarget::local("a"));
        let b = registry.register(&surface, SessionTarget::local("b"));
        registry.update_status(b, SessionStatus::Exited(0));

        assert_eq!(registry.count(), 2);
        assert_eq!(registry.active_count(), 1);
        assert_eq!(registry.status(a), Some(SessionStatus::Initializing));
    }

    #[test]
    fn test_active_remote() {
        let registry = SessionRegistry::new();
        let surface = surface();
        let cfg = RemoteSessionConfig::new("prod", "db.example.com").with_user("ops");
        let id = registry.register(&surface, SessionTarget::Remote(cfg));

        assert!(!registry.get(id).unwrap().is_active_remote());
        registry.update_process(id, 99);
        assert!(registry.get(id).unwrap().is_active_remote());
        registry.update_status(id, SessionStatus::Exited(255));
        assert!(!registry.get(id).unwrap().is_active_remote());
    }

    #[test]
    fn test_info_serializes_status_string() {
        let registry = SessionRegistry::new();
        let surface = surface();
        let id = registry.register(&surface, SessionTarget::local("t"));
        registry.update_status(id, SessionStatus::SpawnFailed);

        let json = serde_json::to_value(registry.get(id).unwrap()).unwrap();
        assert_eq!(json["status"], "spawn_failed");
        assert_eq!(json["kind"], "local");
        assert_eq!(json["name"], "t");
    }
}
