//! Terminal surface abstraction.
//!
//! A surface owns the pseudo-terminal and the child process. The manager
//! drives it through [`TerminalSurface`] and hears back through a
//! [`SurfaceSink`], which forwards events into the core channel from
//! whatever thread the surface runs on.

use std::path::PathBuf;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::SessionId;
use crate::error::SpawnError;

/// Capacity of the core event channel.
pub const CORE_CHANNEL_CAPACITY: usize = 1024;

/// A process launch request handed to a surface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpawnRequest {
    /// Program followed by its arguments.
    pub argv: Vec<String>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// Working directory, inherited when `None`.
    pub cwd: Option<PathBuf>,
}

/// Completion callback for [`TerminalSurface::spawn_async`].
///
/// Called exactly once, from any thread, with the child pid or the reason
/// the OS refused to start it.
pub type SpawnCallback = Box<dyn FnOnce(anyhow::Result<u32>) + Send + 'static>;

/// Events a surface reports about its session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurfaceEvent {
    /// Bytes written by the child to the terminal.
    Output(Vec<u8>),
    /// The child process exited with this code.
    ChildExited(i32),
    /// The terminal stream ended.
    Eof,
    /// The surface gained or lost focus.
    Focus(bool),
    /// The surface was dropped by its owner.
    Destroyed,
}

/// Messages drained by the manager's core loop.
#[derive(Debug)]
pub(crate) enum CoreEvent {
    Surface {
        session_id: SessionId,
        event: SurfaceEvent,
    },
    SpawnCompleted {
        session_id: SessionId,
        result: Result<u32, SpawnError>,
    },
}

/// Sender half given to a surface on attach.
#[derive(Debug, Clone)]
pub struct SurfaceSink {
    session_id: SessionId,
    tx: mpsc::Sender<CoreEvent>,
}

impl SurfaceSink {
    pub(crate) fn new(session_id: SessionId, tx: mpsc::Sender<CoreEvent>) -> Self {
        Self { session_id, tx }
    }

    /// The session this sink reports for.
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Emit without blocking. Returns false if the event was dropped.
    ///
    /// Safe to call from async code and from drop handlers.
    pub fn emit(&self, event: SurfaceEvent) -> bool {
        match self.tx.try_send(self.wrap(event)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(session_id = %self.session_id, "Core channel full, dropping surface event");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Emit, waiting for channel capacity.
    ///
    /// Must only be called from threads outside the tokio runtime, such as
    /// a PTY reader thread.
    pub fn emit_blocking(&self, event: SurfaceEvent) -> bool {
        self.tx.blocking_send(self.wrap(event)).is_ok()
    }

    /// Whether the manager side has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn wrap(&self, event: SurfaceEvent) -> CoreEvent {
        CoreEvent::Surface {
            session_id: self.session_id,
            event,
        }
    }
}

/// A terminal widget or headless PTY that can host one session.
pub trait TerminalSurface: Send + Sync {
    /// Whether the surface can allocate a pseudo-terminal.
    fn supports_pty(&self) -> bool {
        true
    }

    /// Connect the surface to the manager. Replaces any previous sink.
    fn attach(&self, sink: SurfaceSink);

    /// Start the process without blocking the caller.
    fn spawn_async(&self, request: SpawnRequest, on_complete: SpawnCallback);

    /// Write bytes to the display as if the child had printed them.
    fn feed(&self, data: &[u8]);

    /// The current-directory URI the surface tracks itself, if any.
    fn current_directory_uri(&self) -> Option<String> {
        None
    }

    /// Tear down the pseudo-terminal.
    fn close(&self);
}
