//! # Shellward Library
//!
//! Terminal session orchestration for local shells and SSH connections.
//!
//! ## Overview
//!
//! Shellward sits between a terminal surface (a widget or a headless PTY)
//! and the processes running in it. It provides:
//!
//! - **Session Management**: Create, track and tear down terminal sessions
//! - **Process Spawning**: Local shells and SSH clients with multiplexing
//! - **Validation**: Hostname and private key checks before anything runs
//! - **Process Tracking**: Graceful then forceful termination of process trees
//! - **Directory Tracking**: Titles derived from OSC 7 announcements
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Session Manager                          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────┐  │
//! │  │   Session    │  │   Process    │  │      Directory       │  │
//! │  │   Registry   │  │   Spawner    │  │       Tracker        │  │
//! │  └──────────────┘  └──────────────┘  └──────────────────────┘  │
//! │                                                                  │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │              Process Tracker / Terminator                  │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! │                                                                  │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │          Terminal Surface (PtySurface, widgets)            │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use shellward::{select_terminator, Config, PtySurface, SessionManager, TerminalSurface};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let manager = SessionManager::new(&config, select_terminator());
//!
//!     let shutdown = CancellationToken::new();
//!     let core = tokio::spawn({
//!         let manager = Arc::clone(&manager);
//!         let shutdown = shutdown.clone();
//!         async move { manager.run(shutdown).await }
//!     });
//!
//!     let surface: Arc<dyn TerminalSurface> = Arc::new(PtySurface::new());
//!     let id = manager.create_local(&surface, "Terminal", None)?;
//!
//!     // ... drive the surface, then:
//!     manager.remove_session(id);
//!     manager.shutdown().await;
//!     shutdown.cancel();
//!     core.await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: Session manager, registry and terminal surfaces
//! - [`spawn`]: Local shell and SSH command construction
//! - [`process`]: Process tracking and tree termination
//! - [`validation`]: Hostname and key file checks
//! - [`tracking`]: Working directory titles

pub mod config;
pub mod error;
pub mod process;
pub mod session;
pub mod spawn;
pub mod tracking;
pub mod validation;

// Re-export protocol for convenience
pub use shellward_protocol as protocol;

// Re-export config types for convenience
pub use config::{Config, ConfigError};

// Re-export error types for convenience
pub use error::{KeyError, SessionError, SpawnError, ValidationError};

// Re-export process types for convenience
pub use process::{select_terminator, ProcessTerminator, ProcessTracker, TerminationSignal};

// Re-export session types for convenience
pub use session::{
    PtySurface, RemoteAuth, RemoteSessionConfig, SessionEvent, SessionId, SessionInfo,
    SessionKind, SessionManager, SessionStats, SessionStatus, SessionTarget, SurfaceEvent,
    TerminalSurface,
};

// Re-export spawn types for convenience
pub use spawn::{ProcessSpawner, SpawnHandle, SshCommand, SshOptions};

// Re-export tracking types for convenience
pub use tracking::{DirectoryTracker, TitleChange};
