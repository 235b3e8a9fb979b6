//! SSH command line construction.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;

use super::shell::terminal_env;
use crate::config::Config;
use crate::session::{RemoteAuth, RemoteSessionConfig, DEFAULT_SSH_PORT};
use crate::validation::sanitize_username;

/// Variable the remote prompt hook reads the announced hostname from.
pub const OSC7_HOST_VAR: &str = "SHELLWARD_OSC7_HOST";

/// Variable carrying the password for the password helper.
pub const PASSWORD_ENV_VAR: &str = "SSHPASS";

/// Shell snippet that fills [`OSC7_HOST_VAR`] on the remote side.
pub const OSC7_HOST_DETECTION_SNIPPET: &str = concat!(
    "if [ -z \"$SHELLWARD_OSC7_HOST\" ]; then ",
    "if command -v hostname >/dev/null 2>&1; then ",
    "SHELLWARD_OSC7_HOST=\"$(hostname)\"; ",
    "elif [ -n \"$HOSTNAME\" ]; then ",
    "SHELLWARD_OSC7_HOST=\"$HOSTNAME\"; ",
    "elif command -v uname >/dev/null 2>&1; then ",
    "SHELLWARD_OSC7_HOST=\"$(uname -n)\"; ",
    "else ",
    "SHELLWARD_OSC7_HOST=\"unknown\"; ",
    "fi; ",
    "fi;"
);

/// `printf` command emitting an OSC 7 announcement for `$PWD`.
pub const OSC7_PRINTF: &str =
    r#"printf "\033]7;file://%s%s\007" "$SHELLWARD_OSC7_HOST" "$PWD""#;

/// SSH client settings shared by every remote session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshOptions {
    pub program: String,
    pub connect_timeout: u64,
    pub server_alive_interval: u64,
    pub server_alive_count_max: u32,
    /// `ControlPersist` seconds; 0 omits the option.
    pub control_persist: u64,
    pub control_dir: PathBuf,
    pub known_hosts_file: PathBuf,
}

impl SshOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            program: config.ssh.program.clone(),
            connect_timeout: config.ssh.connect_timeout,
            server_alive_interval: config.ssh.server_alive_interval,
            server_alive_count_max: config.ssh.server_alive_count_max,
            control_persist: config.ssh.control_persist,
            control_dir: config.ssh.control_dir.clone(),
            known_hosts_file: config.known_hosts_path(),
        }
    }
}

impl Default for SshOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// A ready-to-exec SSH invocation.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct SshCommand {
    pub argv: Vec<String>,
    #[serde(skip)]
    pub env: Vec<(String, String)>,
    /// Multiplexing socket, when the session shares a master connection.
    pub control_path: Option<PathBuf>,
}

impl SshCommand {
    /// Build the interactive SSH command for `cfg`.
    pub fn build(cfg: &RemoteSessionConfig, opts: &SshOptions) -> Self {
        let mut options: Vec<(&str, String)> = vec![
            ("ConnectTimeout", opts.connect_timeout.to_string()),
            ("ServerAliveInterval", opts.server_alive_interval.to_string()),
            ("ServerAliveCountMax", opts.server_alive_count_max.to_string()),
            ("StrictHostKeyChecking", "accept-new".to_string()),
            ("UpdateHostKeys", "yes".to_string()),
            (
                "UserKnownHostsFile",
                opts.known_hosts_file.display().to_string(),
            ),
        ];

        let control_path = cfg.uses_multiplexing().then(|| {
            let path = control_path(cfg, &opts.control_dir);
            options.push(("ControlMaster", "auto".to_string()));
            options.push(("ControlPath", path.display().to_string()));
            if opts.control_persist > 0 {
                options.push(("ControlPersist", opts.control_persist.to_string()));
            }
            path
        });

        if !cfg.port_forwards.is_empty() {
            options.push(("ExitOnForwardFailure", "yes".to_string()));
        }
        if cfg.x11_forwarding {
            options.push(("ForwardX11", "yes".to_string()));
            options.push(("ForwardX11Trusted", "yes".to_string()));
        }

        let mut argv = vec![opts.program.clone(), "-t".to_string()];
        if cfg.x11_forwarding {
            argv.push("-Y".to_string());
        }

        for (key, value) in options {
            argv.push("-o".to_string());
            argv.push(format!("{}={}", key, value));
        }

        if let RemoteAuth::Key { path } = &cfg.auth {
            if !path.as_os_str().is_empty() {
                argv.push("-i".to_string());
                argv.push(path.display().to_string());
            }
        }

        if cfg.port != DEFAULT_SSH_PORT {
            argv.push("-p".to_string());
            argv.push(cfg.port.to_string());
        }

        for forward in &cfg.port_forwards {
            match forward.spec(&cfg.host) {
                Some(spec) => {
                    argv.push("-L".to_string());
                    argv.push(spec);
                }
                None => tracing::warn!(session = %cfg.name, ?forward, "Skipping invalid port forward"),
            }
        }

        argv.push(cfg.destination());
        argv.push(remote_shell_command(cfg.initial_command.as_deref()));

        Self {
            argv,
            env: terminal_env(),
            control_path,
        }
    }

    /// Prefix the command with a password helper reading [`PASSWORD_ENV_VAR`].
    pub fn wrap_with_password_helper(&mut self, helper: &str, secret: &str) {
        self.argv.splice(0..0, [helper.to_string(), "-e".to_string()]);
        self.env
            .push((PASSWORD_ENV_VAR.to_string(), secret.to_string()));
    }

    /// Names of the extra environment variables.
    pub fn env_names(&self) -> Vec<&str> {
        self.env.iter().map(|(key, _)| key.as_str()).collect()
    }

    /// Shell-quoted command line for display.
    pub fn display_line(&self) -> String {
        self.argv
            .iter()
            .map(|arg| shell_quote(arg))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Debug for SshCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let env: Vec<(&str, &str)> = self
            .env
            .iter()
            .map(|(key, value)| {
                if key == PASSWORD_ENV_VAR {
                    (key.as_str(), "<redacted>")
                } else {
                    (key.as_str(), value.as_str())
                }
            })
            .collect();
        f.debug_struct("SshCommand")
            .field("argv", &self.argv)
            .field("env", &env)
            .field("control_path", &self.control_path)
            .finish()
    }
}

/// The command run on the remote host: optional initial command, prompt
/// hook, then a login shell.
pub fn remote_shell_command(initial_command: Option<&str>) -> String {
    let mut parts = Vec::with_capacity(3);
    if let Some(cmd) = initial_command.map(str::trim).filter(|cmd| !cmd.is_empty()) {
        parts.push(cmd.to_string());
    }
    parts.push(format!(
        "{} export {}; export PROMPT_COMMAND='{}'",
        OSC7_HOST_DETECTION_SNIPPET, OSC7_HOST_VAR, OSC7_PRINTF
    ));
    parts.push(r#"exec "$SHELL" -l"#.to_string());
    parts.join("; ")
}

/// Multiplexing socket path for a session.
pub fn control_path(cfg: &RemoteSessionConfig, control_dir: &Path) -> PathBuf {
    control_dir.join(format!(
        "ssh_control_{}_{}_{}",
        cfg.host,
        cfg.port,
        effective_user(cfg)
    ))
}

/// `user@host` with the local login name filled in when no user is set.
pub fn control_destination(cfg: &RemoteSessionConfig) -> String {
    format!("{}@{}", effective_user(cfg), cfg.host)
}

fn effective_user(cfg: &RemoteSessionConfig) -> String {
    let user = sanitize_username(&cfg.user);
    if user.is_empty() {
        local_username()
    } else {
        user
    }
}

fn local_username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .ok()
        .map(|user| sanitize_username(&user))
        .filter(|user| !user.is_empty())
        .unwrap_or_else(|| "user".to_string())
}

fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@,+%".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::PortForward;

    fn options() -> SshOptions {
        SshOptions {
            program: "ssh".to_string(),
            connect_timeout: 30,
            server_alive_interval: 30,
            server_alive_count_max: 3,
            control_persist: 600,
            control_dir: PathBuf::from("/cache/shellward"),
            known_hosts_file: PathBuf::from("/data/known_hosts"),
        }
    }

    fn option_values(argv: &[String]) -> Vec<&str> {
        argv.windows(2)
            .filter(|pair| pair[0] == "-o")
            .map(|pair| pair[1].as_str())
            .collect()
    }

    #[test]
    fn test_basic_command_shape() {
        let cfg = RemoteSessionConfig::new("prod", "db.example.com").with_user("admin");
        let cmd = SshCommand::build(&cfg, &options());

        assert_eq!(&cmd.argv[..2], ["ssh", "-t"]);
        assert_eq!(
            option_values(&cmd.argv),
            vec![
                "ConnectTimeout=30",
                "ServerAliveInterval=30",
                "ServerAliveCountMax=3",
                "StrictHostKeyChecking=accept-new",
                "UpdateHostKeys=yes",
                "UserKnownHostsFile=/data/known_hosts",
                "ControlMaster=auto",
                "ControlPath=/cache/shellward/ssh_control_db.example.com_22_admin",
                "ControlPersist=600",
            ]
        );
        assert!(!cmd.argv.contains(&"-p".to_string()));
        assert_eq!(cmd.argv[cmd.argv.len() - 2], "admin@db.example.com");
        assert_eq!(
            cmd.control_path,
            Some(PathBuf::from("/cache/shellward/ssh_control_db.example.com_22_admin"))
        );
    }

    #[test]
    fn test_remote_command_is_last() {
        let mut cfg = RemoteSessionConfig::new("prod", "h").with_user("u");
        cfg.initial_command = Some("cd /srv".to_string());
        let cmd = SshCommand::build(&cfg, &options());

        let remote = cmd.argv.last().unwrap();
        assert!(remote.starts_with("cd /srv; if [ -z \"$SHELLWARD_OSC7_HOST\" ]"));
        assert!(remote.contains(
            r#"export PROMPT_COMMAND='printf "\033]7;file://%s%s\007" "$SHELLWARD_OSC7_HOST" "$PWD"'"#
        ));
        assert!(remote.ends_with(r#"; exec "$SHELL" -l"#));
    }

    #[test]
    fn test_osc7_host_is_exported_before_hook() {
        let remote = remote_shell_command(None);
        let export_host = remote
            .find("export SHELLWARD_OSC7_HOST;")
            .expect("host variable is exported");
        let export_hook = remote.find("export PROMPT_COMMAND=").unwrap();
        let exec = remote.find(r#"exec "$SHELL""#).unwrap();

        assert!(export_host < export_hook);
        assert!(export_hook < exec);
    }

    #[test]
    fn test_remote_command_without_initial() {
        let remote = remote_shell_command(Some("   "));
        assert!(remote.starts_with("if [ -z"));
        assert!(remote.ends_with(r#"; exec "$SHELL" -l"#));
    }

    #[test]
    fn test_port_and_key() {
        let cfg = RemoteSessionConfig::new("k", "h")
            .with_user("u")
            .with_port(2222)
            .with_auth(RemoteAuth::Key {
                path: PathBuf::from("/home/u/.ssh/id_ed25519"),
            });
        let cmd = SshCommand::build(&cfg, &options());

        let i = cmd.argv.iter().position(|a| a == "-i").unwrap();
        assert_eq!(cmd.argv[i + 1], "/home/u/.ssh/id_ed25519");
        let p = cmd.argv.iter().position(|a| a == "-p").unwrap();
        assert_eq!(cmd.argv[p + 1], "2222");
        assert!(i < p);
        assert!(cmd
            .argv
            .contains(&"ControlPath=/cache/shellward/ssh_control_h_2222_u".to_string()));
    }

    #[test]
    fn test_control_persist_zero_omitted() {
        let mut opts = options();
        opts.control_persist = 0;
        let cfg = RemoteSessionConfig::new("a", "h").with_user("u");
        let cmd = SshCommand::build(&cfg, &opts);
        assert!(!option_values(&cmd.argv)
            .iter()
            .any(|o| o.starts_with("ControlPersist")));
        assert!(option_values(&cmd.argv).contains(&"ControlMaster=auto"));
    }

    #[test]
    fn test_x11_disables_multiplexing() {
        let mut cfg = RemoteSessionConfig::new("x", "h").with_user("u");
        cfg.x11_forwarding = true;
        let cmd = SshCommand::build(&cfg, &options());

        assert_eq!(&cmd.argv[..3], ["ssh", "-t", "-Y"]);
        let values = option_values(&cmd.argv);
        assert!(values.contains(&"ForwardX11=yes"));
        assert!(values.contains(&"ForwardX11Trusted=yes"));
        assert!(!values.iter().any(|o| o.starts_with("Control")));
        assert_eq!(cmd.control_path, None);
    }

    #[test]
    fn test_port_forwards() {
        let mut cfg = RemoteSessionConfig::new("t", "gateway").with_user("u");
        cfg.port_forwards = vec![
            "8080:internal:80".parse().unwrap(),
            PortForward {
                local_host: String::new(),
                local_port: 9000,
                remote_host: String::new(),
                remote_port: 9000,
            },
        ];
        let cmd = SshCommand::build(&cfg, &options());

        let values = option_values(&cmd.argv);
        assert!(values.contains(&"ExitOnForwardFailure=yes"));
        assert!(!values.iter().any(|o| o.starts_with("Control")));

        let forwards: Vec<&str> = cmd
            .argv
            .windows(2)
            .filter(|pair| pair[0] == "-L")
            .map(|pair| pair[1].as_str())
            .collect();
        assert_eq!(
            forwards,
            vec!["localhost:8080:internal:80", "localhost:9000:gateway:9000"]
        );

        let dest = cmd.argv.iter().position(|a| a == "u@gateway").unwrap();
        let last_l = cmd.argv.iter().rposition(|a| a == "-L").unwrap();
        assert!(last_l < dest);
    }

    #[test]
    fn test_username_never_becomes_an_option() {
        let cfg = RemoteSessionConfig::new("n", "example.com")
            .with_user("-oProxyCommand=touch /tmp/pwned");
        let cmd = SshCommand::build(&cfg, &options());

        let destination = &cmd.argv[cmd.argv.len() - 2];
        assert!(!destination.starts_with('-'));
        assert_eq!(destination, "oProxyCommandtouchtmppwned@example.com");
        assert!(!cmd.argv.iter().any(|arg| arg.contains("ProxyCommand=")));
    }

    #[test]
    fn test_control_path_stays_in_control_dir() {
        let cfg = RemoteSessionConfig::new("n", "example.com").with_user("../../etc/evil");
        let path = control_path(&cfg, Path::new("/cache/shellward"));

        assert_eq!(path.parent(), Some(Path::new("/cache/shellward")));
        assert_eq!(
            path,
            PathBuf::from("/cache/shellward/ssh_control_example.com_22_....etcevil")
        );
    }

    #[test]
    fn test_destination_without_user() {
        let cfg = RemoteSessionConfig::new("n", "h");
        let cmd = SshCommand::build(&cfg, &options());
        assert_eq!(cmd.argv[cmd.argv.len() - 2], "h");
    }

    #[test]
    fn test_env_includes_protocol_version() {
        let cfg = RemoteSessionConfig::new("n", "h");
        let cmd = SshCommand::build(&cfg, &options());
        assert!(cmd.env_names().contains(&"VTE_VERSION"));
        assert!(cmd.env_names().contains(&"TERM"));
    }

    #[test]
    fn test_password_helper_wrap() {
        let cfg = RemoteSessionConfig::new("n", "h");
        let mut cmd = SshCommand::build(&cfg, &options());
        cmd.wrap_with_password_helper("/usr/bin/sshpass", "s3cret");

        assert_eq!(&cmd.argv[..3], ["/usr/bin/sshpass", "-e", "ssh"]);
        assert!(cmd
            .env
            .contains(&(PASSWORD_ENV_VAR.to_string(), "s3cret".to_string())));

        let debug = format!("{:?}", cmd);
        assert!(!debug.contains("s3cret"));
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(!json.contains("s3cret"));
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("ssh"), "ssh");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }
}
