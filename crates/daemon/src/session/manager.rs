//! Session manager.
//!
//! The manager owns the session registry, the process tracker and the
//! directory tracker. Surfaces report back through a bounded core channel
//! which [`SessionManager::run`] drains on a single task; observers follow
//! along through [`SessionManager::subscribe`].

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::registry::{SessionInfo, SessionRegistry};
use super::status::SessionStatus;
use super::surface::{CoreEvent, SurfaceEvent, SurfaceSink, TerminalSurface, CORE_CHANNEL_CAPACITY};
use super::types::{RemoteSessionConfig, SessionId, SessionKind, SessionTarget};
use crate::config::{Config, SessionConfig};
use crate::error::{SessionError, SpawnError};
use crate::process::{is_alive, ProcessTerminator, ProcessTracker, TerminationSignal};
use crate::spawn::diagnostics::exit_notice;
use crate::spawn::ssh::control_path;
use crate::spawn::{
    control, CompletionCallback, LocalSpawnOptions, ProcessSpawner, RemoteSpawnOptions,
    SpawnerSettings,
};
use crate::tracking::DirectoryTracker;
use crate::validation::validate_remote_config;

/// Capacity of the session event broadcast.
const EVENT_CAPACITY: usize = 256;

/// How often a terminated process is checked during its grace period.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Notifications published to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A session was registered and its spawn started.
    Created {
        session_id: SessionId,
        kind: SessionKind,
    },
    /// The session process is running.
    Spawned { session_id: SessionId, pid: u32 },
    /// The session process could not be started.
    SpawnFailed {
        session_id: SessionId,
        message: String,
    },
    /// The working directory, and with it the title, changed.
    TitleChanged {
        session_id: SessionId,
        title: String,
        path: String,
        hostname: String,
    },
    /// The session ended cleanly and its view can be closed.
    CloseRequested {
        session_id: SessionId,
        exit_code: i32,
    },
    /// The process exited with a non-zero code. The session stays open so
    /// the user can read the output.
    AbnormalExit {
        session_id: SessionId,
        exit_code: i32,
    },
    /// The terminal stream ended.
    Eof { session_id: SessionId },
    /// The session was removed.
    Removed { session_id: SessionId },
}

/// Lifetime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub created: u64,
    pub closed: u64,
    pub failed: u64,
    pub active: usize,
}

#[derive(Default)]
struct Counters {
    created: AtomicU64,
    closed: AtomicU64,
    failed: AtomicU64,
}

/// Creates, tracks and tears down terminal sessions.
pub struct SessionManager {
    config: SessionConfig,
    registry: SessionRegistry,
    tracker: Arc<ProcessTracker>,
    spawner: ProcessSpawner,
    directories: DirectoryTracker,
    terminator: Arc<dyn ProcessTerminator>,
    core_tx: mpsc::Sender<CoreEvent>,
    core_rx: tokio::sync::Mutex<mpsc::Receiver<CoreEvent>>,
    events: broadcast::Sender<SessionEvent>,
    /// Held for the whole of a creation; stores the last successful one.
    creation: parking_lot::Mutex<Option<Instant>>,
    cleanup: parking_lot::Mutex<()>,
    counters: Counters,
}

impl SessionManager {
    /// Create a manager using this machine's home directory and hostname for
    /// titles.
    pub fn new(config: &Config, terminator: Arc<dyn ProcessTerminator>) -> Arc<Self> {
        Self::with_directory_tracker(config, terminator, DirectoryTracker::from_environment())
    }

    pub fn with_directory_tracker(
        config: &Config,
        terminator: Arc<dyn ProcessTerminator>,
        directories: DirectoryTracker,
    ) -> Arc<Self> {
        let (core_tx, core_rx) = mpsc::channel(CORE_CHANNEL_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let tracker = Arc::new(ProcessTracker::new());

        tracing::debug!(terminator = terminator.name(), "Session manager created");

        Arc::new(Self {
            config: config.session.clone(),
            registry: SessionRegistry::new(),
            spawner: ProcessSpawner::new(Arc::clone(&tracker), SpawnerSettings::from_config(config)),
            tracker,
            directories,
            terminator,
            core_tx,
            core_rx: tokio::sync::Mutex::new(core_rx),
            events,
            creation: parking_lot::Mutex::new(None),
            cleanup: parking_lot::Mutex::new(()),
            counters: Counters::default(),
        })
    }

    /// Start a local shell on `surface`.
    pub fn create_local(
        &self,
        surface: &Arc<dyn TerminalSurface>,
        name: &str,
        cwd: Option<PathBuf>,
    ) -> Result<SessionId, SessionError> {
        let mut last = self.creation.lock();
        self.check_cooldown(*last)?;

        let id = self.register(surface, SessionTarget::local(name), None);
        let mut options = LocalSpawnOptions::new(id, name).with_cwd(cwd);
        options.on_complete = Some(self.completion_forwarder(id));

        if let Err(e) = self.spawner.spawn_local(surface, options) {
            self.abandon(id);
            return Err(e.into());
        }

        *last = Some(Instant::now());
        self.finish_creation(id, SessionKind::Local);
        Ok(id)
    }

    /// Start an SSH session on `surface`.
    ///
    /// The configuration is validated before anything is registered.
    pub fn create_remote(
        &self,
        surface: &Arc<dyn TerminalSurface>,
        cfg: RemoteSessionConfig,
    ) -> Result<SessionId, SessionError> {
        let mut last = self.creation.lock();
        self.check_cooldown(*last)?;

        if let Err(e) = validate_remote_config(&cfg) {
            tracing::error!(session = %cfg.name, error = %e, "Remote session rejected");
            return Err(e.into());
        }

        let managed_name = Some(cfg.name.clone());
        let id = self.register(surface, SessionTarget::Remote(cfg.clone()), managed_name);
        let options = RemoteSpawnOptions {
            session_id: id,
            on_complete: Some(self.completion_forwarder(id)),
        };

        if let Err(e) = self.spawner.launch_remote(surface, &cfg, options) {
            self.abandon(id);
            return Err(e.into());
        }

        *last = Some(Instant::now());
        self.finish_creation(id, SessionKind::Remote);
        Ok(id)
    }

    /// Drain core events until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut rx = self.core_rx.lock().await;
        tracing::debug!("Session core loop started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                },
            }
        }

        tracing::debug!("Session core loop stopped");
    }

    /// Handle every queued core event without waiting for more.
    ///
    /// Returns the number of events handled. Does nothing while
    /// [`SessionManager::run`] owns the channel.
    pub fn process_pending(&self) -> usize {
        let Ok(mut rx) = self.core_rx.try_lock() else {
            return 0;
        };

        let mut handled = 0;
        while let Ok(event) = rx.try_recv() {
            self.handle(event);
            handled += 1;
        }
        handled
    }

    /// Close a session: stop its process, close its terminal and forget it.
    ///
    /// Returns false if the session is unknown.
    pub fn remove_session(&self, id: SessionId) -> bool {
        let _cleanup = self.cleanup.lock();
        let Some(info) = self.registry.get(id) else {
            return false;
        };

        tracing::info!(session_id = %id, name = %info.name, status = %info.status, "Removing session");

        if let Some((pid, signal)) = self.detach_process(&info) {
            self.schedule_termination(info.id, pid, signal);
        }
        self.close_and_forget(&info);
        true
    }

    /// Remove sessions whose surface has been dropped.
    pub fn prune_dead(&self) -> Vec<SessionId> {
        let _cleanup = self.cleanup.lock();
        self.registry
            .prune_dead()
            .into_iter()
            .map(|info| {
                tracing::info!(session_id = %info.id, name = %info.name, "Pruning session with dropped terminal");
                if let Some((pid, signal)) = self.detach_process(&info) {
                    self.schedule_termination(info.id, pid, signal);
                }
                self.finish_removal(&info);
                info.id
            })
            .collect()
    }

    /// Remove every session, then make sure no tracked process survives.
    pub async fn shutdown(&self) {
        let ids = self.registry.ids();
        tracing::info!(sessions = ids.len(), "Shutting down sessions");

        let mut running = Vec::new();
        {
            let _cleanup = self.cleanup.lock();
            for id in ids {
                let Some(info) = self.registry.get(id) else {
                    continue;
                };
                running.extend(self.detach_process(&info));
                self.close_and_forget(&info);
            }
        }

        // Session processes are still tracked here, so `terminate_all`
        // force-kills whichever of them ignore the graceful signal.
        let tracker = Arc::clone(&self.tracker);
        let terminator = Arc::clone(&self.terminator);
        let cleanup = tokio::task::spawn_blocking(move || {
            for (pid, signal) in running {
                let signaled = terminator.terminate_tree(pid, signal);
                tracing::debug!(pid, ?signal, signaled, "Signaled session process tree");
            }
            tracker.terminate_all();
        });
        if let Err(e) = cleanup.await {
            tracing::error!(error = %e, "Process cleanup task failed");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn session_count(&self) -> usize {
        self.registry.count()
    }

    /// Whether any remote session still has a live connection.
    pub fn has_active_remote(&self) -> bool {
        self.registry.list().iter().any(SessionInfo::is_active_remote)
    }

    /// `name (user@host)` for every live remote session, for quit warnings.
    pub fn active_remote_descriptions(&self) -> Vec<String> {
        self.registry
            .list()
            .iter()
            .filter(|info| info.is_active_remote())
            .map(|info| info.target.description())
            .collect()
    }

    pub fn session_info(&self, id: SessionId) -> Option<SessionInfo> {
        self.registry.get(id)
    }

    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        self.registry.list()
    }

    /// Directory-derived title of a session.
    pub fn title(&self, id: SessionId) -> Option<String> {
        self.directories.title(id)
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            created: self.counters.created.load(Ordering::Relaxed),
            closed: self.counters.closed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            active: self.registry.active_count(),
        }
    }

    pub fn process_tracker(&self) -> &Arc<ProcessTracker> {
        &self.tracker
    }

    fn check_cooldown(&self, last: Option<Instant>) -> Result<(), SessionError> {
        let cooldown = self.config.creation_cooldown();
        let Some(last) = last else {
            return Ok(());
        };

        let elapsed = last.elapsed();
        if elapsed < cooldown {
            let remaining_ms = u64::try_from((cooldown - elapsed).as_millis()).unwrap_or(u64::MAX);
            tracing::warn!(remaining_ms, "Session creation rate limited");
            return Err(SessionError::RateLimited { remaining_ms });
        }
        Ok(())
    }

    fn register(
        &self,
        surface: &Arc<dyn TerminalSurface>,
        target: SessionTarget,
        managed_name: Option<String>,
    ) -> SessionId {
        let id = self.registry.register(surface, target);
        surface.attach(SurfaceSink::new(id, self.core_tx.clone()));
        if self.config.osc7_tracking {
            self.directories.track(id, managed_name);
        }
        id
    }

    /// Undo a registration whose spawn failed synchronously.
    fn abandon(&self, id: SessionId) {
        self.directories.untrack(id);
        self.registry.unregister(id);
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
    }

    fn finish_creation(&self, id: SessionId, kind: SessionKind) {
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        tracing::info!(session_id = %id, %kind, "Session created");
        self.publish(SessionEvent::Created {
            session_id: id,
            kind,
        });
    }

    /// Forward the spawn outcome into the core channel.
    ///
    /// Runs on the surface's spawn thread before any output is read, so the
    /// outcome is always queued ahead of the session's surface events.
    fn completion_forwarder(&self, id: SessionId) -> CompletionCallback {
        let tx = self.core_tx.clone();
        Box::new(move |result: &Result<u32, SpawnError>| {
            let event = CoreEvent::SpawnCompleted {
                session_id: id,
                result: result.clone(),
            };

            // Never dropped, or the process would go untracked.
            let runtime = match tokio::runtime::Handle::try_current() {
                Ok(runtime) => runtime,
                Err(_) => {
                    if tx.blocking_send(event).is_err() {
                        tracing::debug!(session_id = %id, "Manager gone, spawn result discarded");
                    }
                    return;
                }
            };

            match tx.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(event)) => {
                    tracing::debug!(session_id = %id, "Core channel full, queueing spawn result");
                    runtime.spawn(async move {
                        let _ = tx.send(event).await;
                    });
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(session_id = %id, "Manager gone, spawn result discarded");
                }
            }
        })
    }

    fn handle(&self, event: CoreEvent) {
        match event {
            CoreEvent::SpawnCompleted { session_id, result } => {
                self.on_spawn_completed(session_id, result)
            }
            CoreEvent::Surface { session_id, event } => self.on_surface_event(session_id, event),
        }
    }

    fn on_spawn_completed(&self, id: SessionId, result: Result<u32, SpawnError>) {
        match result {
            Ok(pid) => {
                if !self.registry.update_process(id, pid) {
                    // Removed while the spawn was in flight.
                    tracing::info!(session_id = %id, pid, "Terminating process of removed session");
                    self.tracker.terminate_process(pid);
                    return;
                }
                self.publish(SessionEvent::Spawned {
                    session_id: id,
                    pid,
                });
            }
            Err(e) => {
                self.registry.update_status(id, SessionStatus::SpawnFailed);
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                self.publish(SessionEvent::SpawnFailed {
                    session_id: id,
                    message: e.to_string(),
                });

                self.directories.untrack(id);
                if self.registry.unregister(id) {
                    self.publish(SessionEvent::Removed { session_id: id });
                }
            }
        }
    }

    fn on_surface_event(&self, id: SessionId, event: SurfaceEvent) {
        match event {
            SurfaceEvent::Output(data) => self.on_output(id, &data),
            SurfaceEvent::ChildExited(code) => self.on_child_exited(id, code),
            SurfaceEvent::Eof => self.on_eof(id),
            SurfaceEvent::Focus(focused) => {
                if self.registry.status(id).is_some_and(|s| !s.is_terminal()) {
                    let status = if focused {
                        SessionStatus::Focused
                    } else {
                        SessionStatus::Unfocused
                    };
                    self.registry.update_status(id, status);
                }
            }
            SurfaceEvent::Destroyed => {
                tracing::debug!(session_id = %id, "Terminal destroyed");
                self.remove_session(id);
            }
        }
    }

    fn on_output(&self, id: SessionId, data: &[u8]) {
        if !self.config.osc7_tracking {
            return;
        }

        let uri = self
            .registry
            .surface(id)
            .and_then(|surface| surface.current_directory_uri());
        let change = match uri {
            Some(uri) => self.directories.observe_uri(id, &uri),
            None => self.directories.feed(id, data),
        };

        if let Some(change) = change {
            self.publish(SessionEvent::TitleChanged {
                session_id: id,
                title: change.title,
                path: change.announcement.path,
                hostname: change.announcement.hostname,
            });
        }
    }

    fn on_child_exited(&self, id: SessionId, code: i32) {
        let Some(info) = self.registry.get(id) else {
            return;
        };
        if info.status.is_terminal() {
            return;
        }

        tracing::info!(session_id = %id, code, "Session process exited");
        self.registry.update_status(id, SessionStatus::Exited(code));
        if let Some(pid) = info.process_id {
            self.tracker.unregister(pid);
        }

        if code == 0 {
            self.publish(SessionEvent::CloseRequested {
                session_id: id,
                exit_code: 0,
            });
        } else {
            if let Some(surface) = self.registry.surface(id) {
                surface.feed(exit_notice(code).as_bytes());
            }
            self.publish(SessionEvent::AbnormalExit {
                session_id: id,
                exit_code: code,
            });
        }
    }

    fn on_eof(&self, id: SessionId) {
        if self.registry.status(id).map_or(true, |s| s.is_terminal()) {
            return;
        }

        tracing::info!(session_id = %id, "Terminal stream ended");
        self.registry.update_status(id, SessionStatus::Eof);
        self.publish(SessionEvent::Eof { session_id: id });
        self.publish(SessionEvent::CloseRequested {
            session_id: id,
            exit_code: 0,
        });
    }

    /// Stop tracking a session's directory and decide what to signal.
    ///
    /// Returns the pid and graceful signal when the process may still be
    /// running; it stays in the process tracker until it is known dead.
    /// Otherwise the pid is untracked right away.
    fn detach_process(&self, info: &SessionInfo) -> Option<(u32, TerminationSignal)> {
        self.directories.untrack(info.id);

        let pid = info.process_id?;
        if info.status.is_terminal() {
            self.tracker.unregister(pid);
            return None;
        }

        let signal = match info.kind {
            SessionKind::Local => TerminationSignal::Hangup,
            SessionKind::Remote => TerminationSignal::Terminate,
        };
        Some((pid, signal))
    }

    /// Signal a process tree off the calling task, then kill it if it is
    /// still alive after the grace period.
    fn schedule_termination(&self, id: SessionId, pid: u32, signal: TerminationSignal) {
        let tracker = Arc::clone(&self.tracker);
        let terminator = Arc::clone(&self.terminator);

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!(pid, "No runtime, skipping forced kill fallback");
            terminator.terminate_tree(pid, signal);
            tracker.unregister(pid);
            return;
        };

        let grace = self.config.kill_grace();
        runtime.spawn(async move {
            let signaled = {
                let terminator = Arc::clone(&terminator);
                tokio::task::spawn_blocking(move || terminator.terminate_tree(pid, signal))
                    .await
                    .unwrap_or_default()
            };
            tracing::debug!(
                session_id = %id,
                pid,
                ?signal,
                signaled,
                terminator = terminator.name(),
                "Terminated session process tree"
            );

            let deadline = Instant::now() + grace;
            while is_alive(pid) && Instant::now() < deadline {
                tokio::time::sleep(EXIT_POLL_INTERVAL).await;
            }

            // Shutdown may have killed and untracked it in the meantime.
            if is_alive(pid) && tracker.is_tracked(pid) {
                tracing::warn!(session_id = %id, pid, "Process survived termination, killing");
                let killer = Arc::clone(&terminator);
                if let Err(e) = tokio::task::spawn_blocking(move || killer.kill_tree(pid)).await {
                    tracing::error!(pid, error = %e, "Forced kill task failed");
                }
            }
            tracker.unregister(pid);
        });
    }

    fn close_and_forget(&self, info: &SessionInfo) {
        if let Some(surface) = self.registry.surface(info.id) {
            surface.close();
        }
        self.registry.unregister(info.id);
        self.finish_removal(info);
    }

    fn finish_removal(&self, info: &SessionInfo) {
        self.counters.closed.fetch_add(1, Ordering::Relaxed);
        self.publish(SessionEvent::Removed {
            session_id: info.id,
        });

        if let Some(cfg) = info.target.remote() {
            self.release_control_master(cfg);
        }
    }

    /// Stop the shared master connection once its last session is gone.
    fn release_control_master(&self, cfg: &RemoteSessionConfig) {
        if !cfg.uses_multiplexing() {
            return;
        }

        let opts = self.spawner.ssh_options().clone();
        let path = control_path(cfg, &opts.control_dir);
        let shared = self.registry.list().iter().any(|other| {
            !other.status.is_terminal()
                && other
                    .target
                    .remote()
                    .is_some_and(|o| o.uses_multiplexing() && control_path(o, &opts.control_dir) == path)
        });
        if shared {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let cfg = cfg.clone();
        runtime.spawn(async move {
            control::terminate_master(&opts, &cfg).await;
        });
    }

    fn publish(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
