//! Process spawning for local shells and SSH sessions.
//!
//! Spawning is asynchronous: the surface starts the process on its own
//! thread and reports back through a callback. [`ProcessSpawner`] turns that
//! callback into a [`SpawnHandle`] future, registers successful pids with the
//! [`ProcessTracker`], and writes a diagnostic banner to the surface when the
//! launch fails.

pub mod control;
pub mod diagnostics;
pub mod shell;
pub mod ssh;

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::config::Config;
use crate::error::SpawnError;
use crate::process::{ProcessTracker, TrackedProcess};
use crate::session::surface::{SpawnCallback, SpawnRequest, TerminalSurface};
use crate::session::{RemoteAuth, RemoteSessionConfig, SessionId, SessionKind};
use crate::validation::validate_remote_config;

pub use diagnostics::ssh_error_hint;
pub use ssh::{SshCommand, SshOptions};

/// Observer called once with the spawn outcome, in addition to the handle.
pub type CompletionCallback = Box<dyn FnOnce(&Result<u32, SpawnError>) + Send + 'static>;

/// Resolves to the child pid once the surface has started the process.
///
/// Resolves to [`SpawnError::Cancelled`] if the surface drops the request
/// without answering.
#[derive(Debug)]
pub struct SpawnHandle {
    rx: oneshot::Receiver<Result<u32, SpawnError>>,
}

impl SpawnHandle {
    /// The outcome, if it has already arrived.
    pub fn try_result(&mut self) -> Option<Result<u32, SpawnError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(SpawnError::Cancelled)),
        }
    }
}

impl Future for SpawnHandle {
    type Output = Result<u32, SpawnError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(SpawnError::Cancelled)))
    }
}

/// Options for a local shell.
pub struct LocalSpawnOptions {
    pub session_id: SessionId,
    /// Display name used in logs and diagnostics.
    pub name: String,
    pub cwd: Option<PathBuf>,
    /// Overrides the configured shell.
    pub shell: Option<String>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    pub on_complete: Option<CompletionCallback>,
}

impl LocalSpawnOptions {
    pub fn new(session_id: SessionId, name: impl Into<String>) -> Self {
        Self {
            session_id,
            name: name.into(),
            cwd: None,
            shell: None,
            env: Vec::new(),
            on_complete: None,
        }
    }

    pub fn with_cwd(mut self, cwd: Option<PathBuf>) -> Self {
        self.cwd = cwd;
        self
    }
}

/// Options for an SSH session.
pub struct RemoteSpawnOptions {
    pub session_id: SessionId,
    pub on_complete: Option<CompletionCallback>,
}

impl RemoteSpawnOptions {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            on_complete: None,
        }
    }
}

/// Spawner settings taken from [`Config`].
#[derive(Debug, Clone)]
pub struct SpawnerSettings {
    pub default_shell: Option<String>,
    pub login_shell: bool,
    pub zsh_integration: bool,
    pub password_helper: String,
    pub ssh: SshOptions,
}

impl SpawnerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            default_shell: config.session.default_shell.clone(),
            login_shell: config.session.login_shell,
            zsh_integration: config.session.zsh_integration,
            password_helper: config.ssh.password_helper.clone(),
            ssh: SshOptions::from_config(config),
        }
    }
}

/// Starts session processes on terminal surfaces.
pub struct ProcessSpawner {
    tracker: Arc<ProcessTracker>,
    settings: SpawnerSettings,
}

/// How a failed launch is reported on the surface.
enum FailureBanner {
    Local { name: String },
    Remote { name: String, host: String },
}

impl ProcessSpawner {
    pub fn new(tracker: Arc<ProcessTracker>, settings: SpawnerSettings) -> Self {
        Self { tracker, settings }
    }

    pub fn tracker(&self) -> &Arc<ProcessTracker> {
        &self.tracker
    }

    pub fn ssh_options(&self) -> &SshOptions {
        &self.settings.ssh
    }

    /// Start a local shell.
    pub fn spawn_local(
        &self,
        surface: &Arc<dyn TerminalSurface>,
        options: LocalSpawnOptions,
    ) -> Result<SpawnHandle, SpawnError> {
        ensure_pty(surface.as_ref())?;

        let shell = shell::resolve_shell(
            options
                .shell
                .as_deref()
                .or(self.settings.default_shell.as_deref()),
        );
        let argv = shell::shell_argv(&shell, self.settings.login_shell);

        let mut env = shell::local_env();
        env.extend(options.env);

        let integration_dir = if self.settings.zsh_integration && shell::is_zsh(&shell) {
            match shell::prepare_zsh_integration() {
                Ok(dir) => {
                    tracing::info!(zdotdir = %dir.path().display(), "Using temporary ZDOTDIR for zsh directory tracking");
                    env.push(("ZDOTDIR".to_string(), dir.path().display().to_string()));
                    Some(dir)
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to set up zsh integration");
                    None
                }
            }
        } else {
            None
        };

        let cwd = shell::resolve_working_directory(options.cwd.as_deref());

        tracing::info!(
            session_id = %options.session_id,
            shell = %shell,
            cwd = %cwd.display(),
            "Spawning local shell"
        );

        let request = SpawnRequest {
            argv,
            env,
            cwd: Some(cwd),
        };
        let record = TrackedProcess::new(SessionKind::Local, options.session_id, &options.name)
            .with_integration_dir(integration_dir);

        Ok(self.launch(
            surface,
            request,
            record,
            FailureBanner::Local { name: options.name },
            options.on_complete,
        ))
    }

    /// Validate `cfg` and start an SSH session.
    pub fn spawn_remote(
        &self,
        surface: &Arc<dyn TerminalSurface>,
        cfg: &RemoteSessionConfig,
        options: RemoteSpawnOptions,
    ) -> Result<SpawnHandle, SpawnError> {
        validate_remote_config(cfg)?;
        self.launch_remote(surface, cfg, options)
    }

    /// Start an SSH session whose configuration was already validated.
    pub(crate) fn launch_remote(
        &self,
        surface: &Arc<dyn TerminalSurface>,
        cfg: &RemoteSessionConfig,
        options: RemoteSpawnOptions,
    ) -> Result<SpawnHandle, SpawnError> {
        ensure_pty(surface.as_ref())?;

        let ssh = &self.settings.ssh;
        if which::which(&ssh.program).is_err() {
            let err = SpawnError::CommandNotFound("SSH".to_string());
            tracing::error!(session = %cfg.name, program = %ssh.program, "SSH client not found");
            surface.feed(
                diagnostics::remote_failure(
                    &cfg.name,
                    &cfg.host,
                    &err.to_string(),
                    err.hint().unwrap_or_default(),
                )
                .as_bytes(),
            );
            return Err(err);
        }

        let mut command = SshCommand::build(cfg, ssh);

        if let Some(path) = &command.control_path {
            if let Some(dir) = path.parent() {
                if let Err(e) = std::fs::create_dir_all(dir) {
                    tracing::warn!(dir = %dir.display(), error = %e, "Failed to create control socket directory");
                }
            }
        }

        if let RemoteAuth::Password {
            secret: Some(secret),
        } = &cfg.auth
        {
            match which::which(&self.settings.password_helper) {
                Ok(helper) => {
                    command.wrap_with_password_helper(&helper.display().to_string(), secret)
                }
                Err(_) => {
                    tracing::warn!(
                        session = %cfg.name,
                        helper = %self.settings.password_helper,
                        "Password helper not available, password must be typed"
                    );
                    surface.feed(
                        diagnostics::password_prompt_notice(&self.settings.password_helper)
                            .as_bytes(),
                    );
                }
            }
        }

        tracing::info!(
            session_id = %options.session_id,
            session = %cfg.name,
            destination = %cfg.connection_string(),
            "Spawning SSH session"
        );
        tracing::debug!(command = %command.display_line(), "SSH command line");

        let request = SpawnRequest {
            argv: command.argv,
            env: command.env,
            cwd: Some(shell::home_dir()),
        };
        let record = TrackedProcess::new(SessionKind::Remote, options.session_id, &cfg.name);

        Ok(self.launch(
            surface,
            request,
            record,
            FailureBanner::Remote {
                name: cfg.name.clone(),
                host: cfg.host.clone(),
            },
            options.on_complete,
        ))
    }

    fn launch(
        &self,
        surface: &Arc<dyn TerminalSurface>,
        request: SpawnRequest,
        record: TrackedProcess,
        banner: FailureBanner,
        on_complete: Option<CompletionCallback>,
    ) -> SpawnHandle {
        let (tx, rx) = oneshot::channel();
        let tracker = Arc::clone(&self.tracker);
        let weak_surface = Arc::downgrade(surface);

        let callback: SpawnCallback = Box::new(move |outcome| {
            let session_id = record.session_id;
            let result = match outcome {
                Ok(pid) => {
                    tracing::info!(session_id = %session_id, pid, "Process spawned");
                    tracker.register(pid, record);
                    Ok(pid)
                }
                Err(e) => {
                    let message = e.to_string();
                    let (err, text) = match banner {
                        FailureBanner::Local { name } => (
                            SpawnError::Exec {
                                message: message.clone(),
                            },
                            diagnostics::local_failure(&name, &message),
                        ),
                        FailureBanner::Remote { name, host } => {
                            let hint = ssh_error_hint(&message);
                            (
                                SpawnError::remote(&host, message.clone()),
                                diagnostics::remote_failure(&name, &host, &message, hint),
                            )
                        }
                    };
                    tracing::error!(session_id = %session_id, error = %err, "Spawn failed");
                    if let Some(surface) = weak_surface.upgrade() {
                        surface.feed(text.as_bytes());
                    }
                    Err(err)
                }
            };

            if let Some(on_complete) = on_complete {
                on_complete(&result);
            }
            // The receiver may be gone if nobody awaits the handle.
            let _ = tx.send(result);
        });

        surface.spawn_async(request, callback);
        SpawnHandle { rx }
    }
}

fn ensure_pty(surface: &dyn TerminalSurface) -> Result<(), SpawnError> {
    if surface.supports_pty() {
        Ok(())
    } else {
        tracing::error!("Terminal surface has no pseudo-terminal support");
        Err(SpawnError::CapabilityUnavailable(
            "surface cannot allocate a pseudo-terminal".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::surface::SurfaceSink;
    use parking_lot::Mutex;

    /// Records requests and answers them with a fixed outcome.
    struct ScriptedSurface {
        pty: bool,
        outcome: Mutex<Option<anyhow::Result<u32>>>,
        requests: Mutex<Vec<SpawnRequest>>,
        fed: Mutex<Vec<u8>>,
    }

    impl ScriptedSurface {
        fn new(outcome: anyhow::Result<u32>) -> Arc<Self> {
            Arc::new(Self {
                pty: true,
                outcome: Mutex::new(Some(outcome)),
                requests: Mutex::new(Vec::new()),
                fed: Mutex::new(Vec::new()),
            })
        }

        fn fed_text(&self) -> String {
            String::from_utf8_lossy(&self.fed.lock()).into_owned()
        }
    }

    impl TerminalSurface for ScriptedSurface {
        fn supports_pty(&self) -> bool {
            self.pty
        }

        fn attach(&self, _sink: SurfaceSink) {}

        fn spawn_async(&self, request: SpawnRequest, on_complete: SpawnCallback) {
            self.requests.lock().push(request);
            if let Some(outcome) = self.outcome.lock().take() {
                on_complete(outcome);
            }
        }

        fn feed(&self, data: &[u8]) {
            self.fed.lock().extend_from_slice(data);
        }

        fn close(&self) {}
    }

    fn spawner(settings: SpawnerSettings) -> ProcessSpawner {
        ProcessSpawner::new(Arc::new(ProcessTracker::new()), settings)
    }

    fn settings() -> SpawnerSettings {
        let mut settings = SpawnerSettings::from_config(&Config::default());
        settings.default_shell = Some("/bin/sh".to_string());
        settings.zsh_integration = false;
        settings
    }

    #[tokio::test]
    async fn test_local_success_registers_pid() {
        let spawner = spawner(settings());
        let scripted = ScriptedSurface::new(Ok(4321));
        let surface: Arc<dyn TerminalSurface> = scripted.clone();
        let id = SessionId::next();

        let handle = spawner
            .spawn_local(&surface, LocalSpawnOptions::new(id, "Terminal"))
            .unwrap();
        assert_eq!(handle.await, Ok(4321));
        assert_eq!(spawner.tracker().session_of(4321), Some(id));

        let requests = scripted.requests.lock();
        assert_eq!(requests[0].argv, vec!["/bin/sh", "-l"]);
        assert!(requests[0]
            .env
            .contains(&("SHELLWARD_SHELL_INTEGRATION".to_string(), "1".to_string())));
        assert!(requests[0].cwd.is_some());
    }

    #[tokio::test]
    async fn test_local_failure_feeds_diagnostic() {
        let spawner = spawner(settings());
        let scripted = ScriptedSurface::new(Err(anyhow::anyhow!("No such file or directory")));
        let surface: Arc<dyn TerminalSurface> = scripted.clone();

        let handle = spawner
            .spawn_local(&surface, LocalSpawnOptions::new(SessionId::next(), "Broken"))
            .unwrap();
        assert!(matches!(handle.await, Err(SpawnError::Exec { .. })));
        assert_eq!(spawner.tracker().count(), 0);
        assert!(scripted.fed_text().starts_with("\r\nFailed to start Broken:"));
    }

    #[tokio::test]
    async fn test_capability_unavailable() {
        let spawner = spawner(settings());
        let surface: Arc<dyn TerminalSurface> = Arc::new(ScriptedSurface {
            pty: false,
            outcome: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
            fed: Mutex::new(Vec::new()),
        });

        let result = spawner.spawn_local(&surface, LocalSpawnOptions::new(SessionId::next(), "x"));
        assert!(matches!(result, Err(SpawnError::CapabilityUnavailable(_))));
    }

    #[tokio::test]
    async fn test_dropped_callback_cancels() {
        struct Forgetful;
        impl TerminalSurface for Forgetful {
            fn attach(&self, _sink: SurfaceSink) {}
            fn spawn_async(&self, _request: SpawnRequest, _on_complete: SpawnCallback) {}
            fn feed(&self, _data: &[u8]) {}
            fn close(&self) {}
        }

        let spawner = spawner(settings());
        let surface: Arc<dyn TerminalSurface> = Arc::new(Forgetful);
        let mut handle = spawner
            .spawn_local(&surface, LocalSpawnOptions::new(SessionId::next(), "x"))
            .unwrap();
        assert_eq!(handle.try_result(), Some(Err(SpawnError::Cancelled)));
    }

    #[tokio::test]
    async fn test_completion_callback_observes_result() {
        let spawner = spawner(settings());
        let surface: Arc<dyn TerminalSurface> = ScriptedSurface::new(Ok(77));
        let seen = Arc::new(Mutex::new(None));
        let seen_in_callback = Arc::clone(&seen);

        let mut options = LocalSpawnOptions::new(SessionId::next(), "cb");
        options.on_complete = Some(Box::new(move |result| {
            *seen_in_callback.lock() = Some(result.clone());
        }));

        let handle = spawner.spawn_local(&surface, options).unwrap();
        assert_eq!(handle.await, Ok(77));
        assert_eq!(*seen.lock(), Some(Ok(77)));
    }

    #[tokio::test]
    async fn test_remote_validation_error_spawns_nothing() {
        let spawner = spawner(settings());
        let scripted = ScriptedSurface::new(Ok(1));
        let surface: Arc<dyn TerminalSurface> = scripted.clone();
        let cfg = RemoteSessionConfig::new("bad", "not a host");

        let result = spawner.spawn_remote(&surface, &cfg, RemoteSpawnOptions::new(SessionId::next()));
        assert!(matches!(result, Err(SpawnError::Validation(_))));
        assert!(scripted.requests.lock().is_empty());
    }

    #[tokio::test]
    async fn test_remote_missing_client() {
        let mut settings = settings();
        settings.ssh.program = "shellward-test-no-such-ssh".to_string();
        let spawner = spawner(settings);
        let scripted = ScriptedSurface::new(Ok(1));
        let surface: Arc<dyn TerminalSurface> = scripted.clone();
        let cfg = RemoteSessionConfig::new("prod", "example.com");

        let result = spawner.spawn_remote(&surface, &cfg, RemoteSpawnOptions::new(SessionId::next()));
        assert_eq!(result.unwrap_err(), SpawnError::CommandNotFound("SSH".to_string()));
        assert!(scripted.fed_text().contains("SSH Connection Failed:"));
        assert!(scripted.fed_text().contains("Host: example.com"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_remote_failure_is_classified() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut settings = settings();
        settings.ssh.program = "sh".to_string();
        settings.ssh.control_dir = dir.path().join("control");
        let spawner = spawner(settings);
        let scripted =
            ScriptedSurface::new(Err(anyhow::anyhow!("connect to host: Connection refused")));
        let surface: Arc<dyn TerminalSurface> = scripted.clone();
        let cfg = RemoteSessionConfig::new("prod", "example.com").with_user("ops");

        let handle = spawner
            .spawn_remote(&surface, &cfg, RemoteSpawnOptions::new(SessionId::next()))
            .unwrap();
        assert!(matches!(
            handle.await,
            Err(SpawnError::RemoteConnection { .. })
        ));
        assert!(scripted
            .fed_text()
            .contains("Suggestion: Check if SSH service is running"));
        assert!(dir.path().join("control").is_dir());

        let requests = scripted.requests.lock();
        assert_eq!(requests[0].argv[0], "sh");
        assert_eq!(requests[0].argv[1], "-t");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_password_without_helper_notifies() {
        let mut settings = settings();
        settings.ssh.program = "sh".to_string();
        settings.password_helper = "shellward-test-no-such-sshpass".to_string();
        let spawner = spawner(settings);
        let scripted = ScriptedSurface::new(Ok(9));
        let surface: Arc<dyn TerminalSurface> = scripted.clone();
        let cfg = RemoteSessionConfig::new("pw", "example.com").with_auth(RemoteAuth::Password {
            secret: Some("hunter2".to_string()),
        });

        let handle = spawner
            .spawn_remote(&surface, &cfg, RemoteSpawnOptions::new(SessionId::next()))
            .unwrap();
        assert_eq!(handle.await, Ok(9));
        assert!(scripted.fed_text().contains("enter the password"));

        let requests = scripted.requests.lock();
        assert!(!requests[0].env.iter().any(|(key, _)| key == "SSHPASS"));
    }
}
