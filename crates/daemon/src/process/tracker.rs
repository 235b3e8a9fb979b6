//! Registry of live child processes.
//!
//! Every pid spawned for a session is registered here so that it can be
//! reaped at shutdown even if its session was never cleaned up.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, SystemTime};

use parking_lot::ReentrantMutex;
use tempfile::TempDir;

use super::signal::{is_alive, send_signal, TerminationSignal};
use crate::session::{SessionId, SessionKind};

/// Time between the graceful and the forceful pass of [`ProcessTracker::terminate_all`].
pub const TERMINATE_ALL_GRACE: Duration = Duration::from_millis(200);

/// Metadata kept for a tracked pid.
#[derive(Debug)]
pub struct TrackedProcess {
    pub kind: SessionKind,
    pub session_id: SessionId,
    /// Display name of the owning session.
    pub label: String,
    pub registered_at: SystemTime,
    // Removed from disk when the record is dropped.
    integration_dir: Option<TempDir>,
}

impl TrackedProcess {
    pub fn new(kind: SessionKind, session_id: SessionId, label: impl Into<String>) -> Self {
        Self {
            kind,
            session_id,
            label: label.into(),
            registered_at: SystemTime::now(),
            integration_dir: None,
        }
    }

    /// Attach a shell integration directory owned by this process.
    pub fn with_integration_dir(mut self, dir: Option<TempDir>) -> Self {
        self.integration_dir = dir;
        self
    }

    pub fn integration_dir(&self) -> Option<&Path> {
        self.integration_dir.as_ref().map(TempDir::path)
    }
}

/// Tracks child pids and terminates them on demand.
pub struct ProcessTracker {
    processes: ReentrantMutex<RefCell<HashMap<u32, TrackedProcess>>>,
}

impl ProcessTracker {
    pub fn new() -> Self {
        Self {
            processes: ReentrantMutex::new(RefCell::new(HashMap::new())),
        }
    }

    /// Track `pid`, replacing any previous record for it.
    pub fn register(&self, pid: u32, process: TrackedProcess) {
        tracing::debug!(
            pid,
            session_id = %process.session_id,
            kind = %process.kind,
            label = %process.label,
            "Tracking process"
        );

        let guard = self.processes.lock();
        let previous = guard.borrow_mut().insert(pid, process);
        if let Some(previous) = previous {
            tracing::warn!(pid, session_id = %previous.session_id, "Replaced stale process record");
        }
    }

    /// Stop tracking `pid`. Returns false if it was not tracked.
    pub fn unregister(&self, pid: u32) -> bool {
        let guard = self.processes.lock();
        let removed = guard.borrow_mut().remove(&pid);
        match removed {
            Some(process) => {
                tracing::debug!(pid, session_id = %process.session_id, "Untracked process");
                true
            }
            None => false,
        }
    }

    /// Send a graceful termination signal to `pid` and stop tracking it.
    ///
    /// Returns whether the signal was delivered.
    pub fn terminate_process(&self, pid: u32) -> bool {
        let delivered = match send_signal(pid, TerminationSignal::Terminate) {
            Ok(()) => {
                tracing::debug!(pid, "Sent SIGTERM");
                true
            }
            Err(e) => {
                tracing::debug!(pid, error = %e, "Failed to signal process");
                false
            }
        };
        self.unregister(pid);
        delivered
    }

    /// Terminate every tracked process and clear the registry.
    ///
    /// Blocks for [`TERMINATE_ALL_GRACE`] between the graceful and forceful
    /// passes. Never fails.
    pub fn terminate_all(&self) {
        let pids = self.pids();
        if pids.is_empty() {
            return;
        }

        tracing::info!(count = pids.len(), "Terminating all tracked processes");

        #[cfg(unix)]
        {
            let mut signaled = 0usize;
            for &pid in &pids {
                match send_signal(pid, TerminationSignal::Terminate) {
                    Ok(()) => signaled += 1,
                    Err(e) => {
                        tracing::debug!(pid, error = %e, "Process already gone");
                        self.unregister(pid);
                    }
                }
            }

            if signaled > 0 {
                std::thread::sleep(TERMINATE_ALL_GRACE);
            }

            for pid in self.pids() {
                if !pids.contains(&pid) || !is_alive(pid) {
                    continue;
                }
                tracing::warn!(pid, "Process ignored SIGTERM, sending SIGKILL");
                if let Err(e) = send_signal(pid, TerminationSignal::Kill) {
                    tracing::debug!(pid, error = %e, "Failed to kill process");
                }
            }
        }

        #[cfg(not(unix))]
        for &pid in &pids {
            if let Err(e) = send_signal(pid, TerminationSignal::Kill) {
                tracing::debug!(pid, error = %e, "Failed to kill process");
            }
        }

        for pid in pids {
            self.unregister(pid);
        }
    }

    pub fn is_tracked(&self, pid: u32) -> bool {
        self.processes.lock().borrow().contains_key(&pid)
    }

    /// The session that owns `pid`, if tracked.
    pub fn session_of(&self, pid: u32) -> Option<SessionId> {
        self.processes
            .lock()
            .borrow()
            .get(&pid)
            .map(|process| process.session_id)
    }

    pub fn count(&self) -> usize {
        self.processes.lock().borrow().len()
    }

    /// Snapshot of tracked pids in ascending order.
    pub fn pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.processes.lock().borrow().keys().copied().collect();
        pids.sort_unstable();
        pids
    }
}

impl Default for ProcessTracker {
    fn default() -> Self {
        Self::new()
    }
}
