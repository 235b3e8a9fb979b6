//! Shellward
//!
//! Terminal session orchestration for local shells and SSH connections.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use crossterm::execute;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, SetTitle};
use shellward::config::{default_config_path, Config};
use shellward::session::{
    PortForward, PtySurface, RemoteAuth, RemoteSessionConfig, SessionEvent, SessionTarget,
    TerminalSurface, DEFAULT_SSH_PORT,
};
use shellward::spawn::{control, SshCommand, SshOptions};
use shellward::validation::{validate_hostname, validate_key_file};
use shellward::{select_terminator, SessionManager};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Shellward - terminal session orchestration for local shells and SSH.
#[derive(Parser, Debug)]
#[command(name = "shellward")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Open an interactive local shell
    Local {
        /// Working directory for the shell
        #[arg(long, value_name = "DIR")]
        cwd: Option<PathBuf>,

        /// Session name
        #[arg(long, default_value = "Terminal")]
        name: String,
    },

    /// Open an interactive SSH session
    Ssh(SshArgs),

    /// Validate a hostname or key file
    #[command(subcommand)]
    Check(CheckCommands),

    /// Print the SSH command line a session would use
    SshCommand(SshArgs),

    /// Manage shared SSH master connections
    #[command(subcommand)]
    Control(ControlCommands),

    /// Inspect or create the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Connection options for SSH sessions.
#[derive(Args, Debug, Clone)]
pub struct SshArgs {
    /// Destination as [user@]host[:port]
    pub destination: String,

    /// Port, overriding the destination
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Private key file
    #[arg(short = 'i', long, value_name = "KEY")]
    pub identity: Option<PathBuf>,

    /// Environment variable holding the password
    #[arg(long, value_name = "VAR", conflicts_with = "identity")]
    pub password_env: Option<String>,

    /// Session name, defaults to the destination
    #[arg(long)]
    pub name: Option<String>,

    /// Command run on the remote host before the shell
    #[arg(long, value_name = "CMD")]
    pub command: Option<String>,

    /// Enable trusted X11 forwarding
    #[arg(short = 'X', long)]
    pub x11: bool,

    /// Local port forward, [bind:]port:host:hostport
    #[arg(short = 'L', long = "forward", value_name = "SPEC")]
    pub forwards: Vec<PortForward>,
}

impl SshArgs {
    /// Build the session configuration these arguments describe.
    pub fn to_remote_config(&self) -> anyhow::Result<RemoteSessionConfig> {
        let (user, host, port) = RemoteSessionConfig::parse_destination(&self.destination)
            .with_context(|| format!("Invalid destination: {}", self.destination))?;

        let auth = match (&self.identity, &self.password_env) {
            (Some(path), _) => RemoteAuth::Key { path: path.clone() },
            (None, Some(var)) => RemoteAuth::Password {
                secret: Some(
                    std::env::var(var)
                        .with_context(|| format!("Password variable {} is not set", var))?,
                ),
            },
            (None, None) => RemoteAuth::Password { secret: None },
        };

        let name = self.name.clone().unwrap_or_else(|| self.destination.clone());
        let mut cfg = RemoteSessionConfig::new(name, host)
            .with_user(user)
            .with_port(self.port.or(port).unwrap_or(DEFAULT_SSH_PORT))
            .with_auth(auth);
        cfg.initial_command = self.command.clone();
        cfg.x11_forwarding = self.x11;
        cfg.port_forwards = self.forwards.clone();
        Ok(cfg)
    }
}

/// Subcommands for validation.
#[derive(Subcommand, Debug, Clone)]
pub enum CheckCommands {
    /// Check hostname syntax
    Host {
        /// Hostname or IP address
        host: String,
    },

    /// Check a private key file
    Key {
        /// Path to the key file
        path: PathBuf,
    },
}

/// Subcommands for ControlMaster management.
#[derive(Subcommand, Debug, Clone)]
pub enum ControlCommands {
    /// Check whether a master connection is alive
    Check {
        /// Destination as [user@]host[:port]
        destination: String,
    },

    /// Stop a master connection
    Exit {
        /// Destination as [user@]host[:port]
        destination: String,
    },

    /// Remove sockets of dead master connections
    Cleanup,
}

/// Subcommands for configuration management.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Print the configuration file path
    Path,

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;

    // Apply environment variable overrides
    config.apply_env_overrides();

    // Validate configuration
    config.validate()?;

    let interactive = matches!(cli.command, Commands::Local { .. } | Commands::Ssh(_));
    let _log_guard = init_logging(&config, cli.verbose, interactive)?;

    tracing::debug!(config = %config_path.display(), "Shellward starting");

    let code = match cli.command {
        Commands::Local { cwd, name } => {
            run_interactive(&config, SessionTarget::local(name), cwd).await?
        }
        Commands::Ssh(args) => {
            let cfg = args.to_remote_config()?;
            run_interactive(&config, SessionTarget::Remote(cfg), None).await?
        }
        Commands::Check(check) => run_check(check),
        Commands::SshCommand(args) => {
            let cfg = args.to_remote_config()?;
            let command = SshCommand::build(&cfg, &SshOptions::from_config(&config));
            println!("{}", command.display_line());
            0
        }
        Commands::Control(command) => run_control(&config, command).await?,
        Commands::Config(command) => run_config(&config, &config_path, command)?,
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

/// Initialize tracing.
///
/// Interactive sessions own the terminal, so they log to a daily file
/// instead of stderr. `RUST_LOG` takes precedence over the configured level.
fn init_logging(
    config: &Config,
    verbose: bool,
    interactive: bool,
) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose {
        "debug"
    } else {
        config.daemon.log_level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if !interactive {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        return Ok(None);
    }

    let log_dir = config.log_dir();
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory: {}", log_dir.display()))?;
    let appender = tracing_appender::rolling::daily(&log_dir, "shellward.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Ok(Some(guard))
}

/// Leaves raw mode when dropped.
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> anyhow::Result<Self> {
        enable_raw_mode().context("Failed to enable raw mode")?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

/// Run one session on the current terminal until it closes.
///
/// Returns the exit code of the session process.
async fn run_interactive(
    config: &Config,
    target: SessionTarget,
    cwd: Option<PathBuf>,
) -> anyhow::Result<i32> {
    let manager = SessionManager::new(config, select_terminator());
    let shutdown = CancellationToken::new();
    let core = tokio::spawn({
        let manager = Arc::clone(&manager);
        let shutdown = shutdown.clone();
        async move { manager.run(shutdown).await }
    });

    let (cols, rows) = crossterm::terminal::size().unwrap_or((80, 24));
    let pty = Arc::new(PtySurface::with_size(cols, rows));
    let surface: Arc<dyn TerminalSurface> = pty.clone();
    let mut display = pty.subscribe();
    let mut events = manager.subscribe();

    let id = match target {
        SessionTarget::Local { name } => manager.create_local(&surface, &name, cwd)?,
        SessionTarget::Remote(cfg) => manager.create_remote(&surface, cfg)?,
    };

    let raw_mode = RawModeGuard::enable()?;
    spawn_input_forwarder(Arc::clone(&pty));
    let resize_watcher = spawn_resize_watcher(Arc::clone(&pty));

    let mut stdout = std::io::stdout();
    let exit_code = loop {
        tokio::select! {
            data = display.recv() => match data {
                Ok(bytes) => {
                    stdout.write_all(&bytes)?;
                    stdout.flush()?;
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Display output lagged");
                }
                Err(RecvError::Closed) => break 0,
            },
            event = events.recv() => match event {
                Ok(SessionEvent::TitleChanged { session_id, title, .. }) if session_id == id => {
                    execute!(stdout, SetTitle(&title))?;
                }
                Ok(SessionEvent::CloseRequested { session_id, exit_code })
                | Ok(SessionEvent::AbnormalExit { session_id, exit_code })
                    if session_id == id => break exit_code,
                Ok(SessionEvent::SpawnFailed { session_id, .. }) if session_id == id => break 1,
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Session events lagged");
                }
                Err(RecvError::Closed) => break 0,
            },
        }
    };

    // Diagnostics fed after the final event.
    while let Ok(bytes) = display.try_recv() {
        stdout.write_all(&bytes)?;
    }
    stdout.flush()?;
    drop(raw_mode);

    if let Some(watcher) = resize_watcher {
        watcher.abort();
    }
    manager.remove_session(id);
    manager.shutdown().await;
    shutdown.cancel();
    if let Err(e) = core.await {
        tracing::error!(error = %e, "Session core task failed");
    }

    tracing::info!(session_id = %id, exit_code, "Session finished");
    Ok(exit_code)
}

/// Copy stdin to the PTY on a plain thread; stdin reads block.
fn spawn_input_forwarder(pty: Arc<PtySurface>) {
    let spawned = std::thread::Builder::new()
        .name("shellward-stdin".to_string())
        .spawn(move || {
            let mut stdin = std::io::stdin();
            let mut buffer = [0u8; 1024];
            loop {
                match stdin.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Err(e) = pty.write(&buffer[..n]) {
                            tracing::debug!(error = %e, "Stopping input forwarding");
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        tracing::debug!(error = %e, "Failed to read stdin");
                        break;
                    }
                }
            }
        });

    if let Err(e) = spawned {
        tracing::error!(error = %e, "Failed to start input thread");
    }
}

#[cfg(unix)]
fn spawn_resize_watcher(pty: Arc<PtySurface>) -> Option<tokio::task::JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut winch = match signal(SignalKind::window_change()) {
        Ok(winch) => winch,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to watch terminal size");
            return None;
        }
    };

    Some(tokio::spawn(async move {
        while winch.recv().await.is_some() {
            if let Ok((cols, rows)) = crossterm::terminal::size() {
                if let Err(e) = pty.resize(cols, rows) {
                    tracing::debug!(error = %e, "Resize failed");
                }
            }
        }
    }))
}

#[cfg(not(unix))]
fn spawn_resize_watcher(_pty: Arc<PtySurface>) -> Option<tokio::task::JoinHandle<()>> {
    None
}

/// Run a validation command. Returns the process exit code.
fn run_check(command: CheckCommands) -> i32 {
    match command {
        CheckCommands::Host { host } => match validate_hostname(&host) {
            Ok(()) => {
                println!("{}: valid hostname", host);
                0
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                1
            }
        },
        CheckCommands::Key { path } => match validate_key_file(&path) {
            Ok(()) => {
                println!("{}: usable SSH key", path.display());
                0
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                eprintln!("Hint: {}", e.hint());
                1
            }
        },
    }
}

/// Run a ControlMaster command. Returns the process exit code.
async fn run_control(config: &Config, command: ControlCommands) -> anyhow::Result<i32> {
    let opts = SshOptions::from_config(config);

    let code = match command {
        ControlCommands::Check { destination } => {
            let cfg = destination_config(&destination)?;
            if control::is_master_active(&opts, &cfg).await {
                println!("Master connection for {} is active", cfg.connection_string());
                0
            } else {
                println!("No master connection for {}", cfg.connection_string());
                1
            }
        }
        ControlCommands::Exit { destination } => {
            let cfg = destination_config(&destination)?;
            if control::terminate_master(&opts, &cfg).await {
                println!("Master connection for {} stopped", cfg.connection_string());
                0
            } else {
                eprintln!("Failed to stop master connection for {}", cfg.connection_string());
                1
            }
        }
        ControlCommands::Cleanup => {
            let cleaned = control::cleanup_stale_sockets(&opts).await;
            println!("Removed {} stale control socket(s)", cleaned);
            0
        }
    };
    Ok(code)
}

fn destination_config(destination: &str) -> anyhow::Result<RemoteSessionConfig> {
    let (user, host, port) = RemoteSessionConfig::parse_destination(destination)
        .with_context(|| format!("Invalid destination: {}", destination))?;
    Ok(RemoteSessionConfig::new(destination, host)
        .with_user(user)
        .with_port(port.unwrap_or(DEFAULT_SSH_PORT)))
}

/// Run a configuration command. Returns the process exit code.
fn run_config(config: &Config, path: &Path, command: ConfigCommands) -> anyhow::Result<i32> {
    match command {
        ConfigCommands::Show => print!("{}", config.to_toml()?),
        ConfigCommands::Path => println!("{}", path.display()),
        ConfigCommands::Init { force } => {
            if path.exists() && !force {
                anyhow::bail!(
                    "Config file already exists: {} (use --force to overwrite)",
                    path.display()
                );
            }
            Config::default().save(path)?;
            println!("Wrote default configuration to {}", path.display());
        }
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use serial_test::serial;

    #[test]
    fn test_cli_debug_assert() {
        // Verify the CLI structure is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_local_command() {
        let cli = Cli::try_parse_from(["shellward", "local"]).unwrap();
        match cli.command {
            Commands::Local { cwd, name } => {
                assert!(cwd.is_none());
                assert_eq!(name, "Terminal");
            }
            _ => panic!("Expected Local command"),
        }
    }

    #[test]
    fn test_local_with_options() {
        let cli =
            Cli::try_parse_from(["shellward", "local", "--cwd", "/tmp", "--name", "scratch"])
                .unwrap();
        match cli.command {
            Commands::Local { cwd, name } => {
                assert_eq!(cwd, Some(PathBuf::from("/tmp")));
                assert_eq!(name, "scratch");
            }
            _ => panic!("Expected Local command"),
        }
    }

    #[test]
    fn test_global_flags() {
        let cli =
            Cli::try_parse_from(["shellward", "check", "host", "example.com", "-v", "-c", "x.toml"])
                .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("x.toml")));
    }

    #[test]
    fn test_ssh_command_full() {
        let cli = Cli::try_parse_from([
            "shellward",
            "ssh",
            "ops@db.example.com:2200",
            "-i",
            "/home/ops/.ssh/id_ed25519",
            "--name",
            "prod",
            "--command",
            "cd /srv",
            "-X",
            "-L",
            "8080:localhost:80",
        ])
        .unwrap();

        let Commands::Ssh(args) = cli.command else {
            panic!("Expected Ssh command");
        };
        let cfg = args.to_remote_config().unwrap();
        assert_eq!(cfg.name, "prod");
        assert_eq!(cfg.user, "ops");
        assert_eq!(cfg.host, "db.example.com");
        assert_eq!(cfg.port, 2200);
        assert_eq!(
            cfg.auth,
            RemoteAuth::Key {
                path: PathBuf::from("/home/ops/.ssh/id_ed25519")
            }
        );
        assert_eq!(cfg.initial_command.as_deref(), Some("cd /srv"));
        assert!(cfg.x11_forwarding);
        assert_eq!(cfg.port_forwards.len(), 1);
        assert_eq!(cfg.port_forwards[0].remote_port, 80);
    }

    #[test]
    fn test_ssh_port_flag_overrides_destination() {
        let cli =
            Cli::try_parse_from(["shellward", "ssh-command", "h:2200", "-p", "2222"]).unwrap();
        let Commands::SshCommand(args) = cli.command else {
            panic!("Expected SshCommand command");
        };
        let cfg = args.to_remote_config().unwrap();
        assert_eq!(cfg.port, 2222);
        assert_eq!(cfg.name, "h:2200");
        assert_eq!(cfg.auth, RemoteAuth::Password { secret: None });
    }

    #[test]
    fn test_ssh_invalid_forward_rejected() {
        let result = Cli::try_parse_from(["shellward", "ssh", "h", "-L", "nonsense"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_identity_conflicts_with_password_env() {
        let result = Cli::try_parse_from([
            "shellward",
            "ssh",
            "h",
            "-i",
            "/k",
            "--password-env",
            "PW",
        ]);
        assert!(result.is_err());
    }

    #[test]
    #[serial]
    fn test_password_env() {
        std::env::set_var("SHELLWARD_TEST_PASSWORD", "s3cret");
        let cli = Cli::try_parse_from([
            "shellward",
            "ssh",
            "h",
            "--password-env",
            "SHELLWARD_TEST_PASSWORD",
        ])
        .unwrap();
        let Commands::Ssh(args) = cli.command else {
            panic!("Expected Ssh command");
        };
        let cfg = args.to_remote_config().unwrap();
        std::env::remove_var("SHELLWARD_TEST_PASSWORD");

        assert_eq!(
            cfg.auth,
            RemoteAuth::Password {
                secret: Some("s3cret".to_string())
            }
        );
    }

    #[test]
    #[serial]
    fn test_password_env_missing() {
        std::env::remove_var("SHELLWARD_TEST_MISSING");
        let cli = Cli::try_parse_from([
            "shellward",
            "ssh",
            "h",
            "--password-env",
            "SHELLWARD_TEST_MISSING",
        ])
        .unwrap();
        let Commands::Ssh(args) = cli.command else {
            panic!("Expected Ssh command");
        };
        let err = args.to_remote_config().unwrap_err();
        assert!(err.to_string().contains("SHELLWARD_TEST_MISSING"));
    }

    #[test]
    fn test_invalid_destination() {
        let cli = Cli::try_parse_from(["shellward", "ssh-command", "user@"]).unwrap();
        let Commands::SshCommand(args) = cli.command else {
            panic!("Expected SshCommand command");
        };
        assert!(args.to_remote_config().is_err());
    }

    #[test]
    fn test_check_commands() {
        let cli = Cli::try_parse_from(["shellward", "check", "key", "/tmp/id"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Check(CheckCommands::Key { ref path }) if path == Path::new("/tmp/id")
        ));

        assert_eq!(
            run_check(CheckCommands::Host {
                host: "example.com".to_string()
            }),
            0
        );
        assert_eq!(
            run_check(CheckCommands::Host {
                host: "bad_host!".to_string()
            }),
            1
        );
        assert_eq!(
            run_check(CheckCommands::Key {
                path: PathBuf::from("/definitely/not/a/key")
            }),
            1
        );
    }

    #[test]
    fn test_control_commands() {
        let cli = Cli::try_parse_from(["shellward", "control", "cleanup"]).unwrap();
        assert!(matches!(cli.command, Commands::Control(ControlCommands::Cleanup)));

        let cli = Cli::try_parse_from(["shellward", "control", "exit", "u@h:2022"]).unwrap();
        match cli.command {
            Commands::Control(ControlCommands::Exit { destination }) => {
                let cfg = destination_config(&destination).unwrap();
                assert_eq!(cfg.user, "u");
                assert_eq!(cfg.host, "h");
                assert_eq!(cfg.port, 2022);
            }
            _ => panic!("Expected Control Exit command"),
        }
    }

    #[tokio::test]
    async fn test_control_check_without_socket() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = Config::default();
        config.ssh.control_dir = dir.path().to_path_buf();

        let code = run_control(
            &config,
            ControlCommands::Check {
                destination: "u@h".to_string(),
            },
        )
        .await
        .unwrap();
        assert_eq!(code, 1);

        let code = run_control(&config, ControlCommands::Cleanup).await.unwrap();
        assert_eq!(code, 0);
    }

    #[test]
    fn test_config_init() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = Config::default();

        assert_eq!(
            run_config(&config, &path, ConfigCommands::Init { force: false }).unwrap(),
            0
        );
        assert!(path.exists());
        assert!(run_config(&config, &path, ConfigCommands::Init { force: false }).is_err());
        assert!(run_config(&config, &path, ConfigCommands::Init { force: true }).is_ok());

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, Config::default());
    }

    #[test]
    fn test_config_subcommands_parse() {
        for sub in ["show", "path"] {
            let cli = Cli::try_parse_from(["shellward", "config", sub]).unwrap();
            assert!(matches!(cli.command, Commands::Config(_)));
        }
    }
}
