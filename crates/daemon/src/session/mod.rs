//! Session management module.
//!
//! Sessions pair a terminal surface with a local shell or SSH client. The
//! [`SessionManager`] creates them, follows their lifecycle through surface
//! events and tears them down.

pub mod manager;
pub mod pty;
pub mod registry;
pub mod status;
pub mod surface;
pub mod types;

pub use manager::{SessionEvent, SessionManager, SessionStats};
pub use pty::PtySurface;
pub use registry::{SessionInfo, SessionRegistry};
pub use status::SessionStatus;
pub use surface::{
    SpawnCallback, SpawnRequest, SurfaceEvent, SurfaceSink, TerminalSurface, CORE_CHANNEL_CAPACITY,
};
pub use types::{
    PortForward, RemoteAuth, RemoteSessionConfig, SessionId, SessionKind, SessionTarget,
    DEFAULT_SSH_PORT,
};
