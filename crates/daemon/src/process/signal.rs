//! Signal delivery and liveness checks for single pids.

use std::io;

/// Signal sent when terminating a session process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationSignal {
    /// SIGHUP, the terminal hung up. Used for local shells.
    Hangup,
    /// SIGTERM. Used for SSH clients.
    Terminate,
    /// SIGKILL.
    Kill,
}

impl TerminationSignal {
    pub fn is_forceful(self) -> bool {
        matches!(self, TerminationSignal::Kill)
    }

    #[cfg(unix)]
    fn as_nix(self) -> nix::sys::signal::Signal {
        use nix::sys::signal::Signal;

        match self {
            TerminationSignal::Hangup => Signal::SIGHUP,
            TerminationSignal::Terminate => Signal::SIGTERM,
            TerminationSignal::Kill => Signal::SIGKILL,
        }
    }
}

/// Send `signal` to a single process.
///
/// Pid 0 and values outside the positive `pid_t` range are rejected, since
/// `kill(2)` would interpret them as process groups.
#[cfg(unix)]
pub fn send_signal(pid: u32, signal: TerminationSignal) -> io::Result<()> {
    use nix::sys::signal::kill;

    kill(to_nix_pid(pid)?, signal.as_nix()).map_err(io::Error::from)
}

#[cfg(not(unix))]
pub fn send_signal(pid: u32, _signal: TerminationSignal) -> io::Result<()> {
    use sysinfo::{Pid, ProcessesToUpdate, System};

    if pid == 0 {
        return Err(invalid_pid(pid));
    }
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);

    match system.process(pid) {
        Some(process) if process.kill() => Ok(()),
        Some(_) => Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("failed to kill process {}", pid),
        )),
        None => Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no such process: {}", pid),
        )),
    }
}

/// Whether a process with this pid exists and has not exited.
///
/// Zombies count as exited on Linux.
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;

    let Ok(nix_pid) = to_nix_pid(pid) else {
        return false;
    };

    match kill(nix_pid, None) {
        Ok(()) | Err(Errno::EPERM) => !is_zombie(pid),
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn is_alive(pid: u32) -> bool {
    use sysinfo::{Pid, ProcessesToUpdate, System};

    if pid == 0 {
        return false;
    }
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).is_some()
}

#[cfg(unix)]
fn to_nix_pid(pid: u32) -> io::Result<nix::unistd::Pid> {
    i32::try_from(pid)
        .ok()
        .filter(|raw| *raw > 0)
        .map(nix::unistd::Pid::from_raw)
        .ok_or_else(|| invalid_pid(pid))
}

fn invalid_pid(pid: u32) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("refusing to signal pid {}", pid),
    )
}

/// Reads the state field of `/proc/<pid>/stat`.
#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) else {
        return false;
    };
    let state = stat
        .rfind(')')
        .and_then(|end| stat.get(end + 2..))
        .and_then(|rest| rest.chars().next());
    state == Some('Z')
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_zombie(_pid: u32) -> bool {
    false
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Command;
    use std::time::Duration;

    #[test]
    fn test_current_process_is_alive() {
        assert!(is_alive(std::process::id()));
    }

    #[test]
    fn test_pid_zero_rejected() {
        assert!(!is_alive(0));
        let err = send_signal(0, TerminationSignal::Terminate).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_pid_outside_range_rejected() {
        assert!(!is_alive(u32::MAX));
        assert!(send_signal(u32::MAX, TerminationSignal::Kill).is_err());
    }

    #[test]
    fn test_signal_terminates_child() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        assert!(is_alive(pid));

        send_signal(pid, TerminationSignal::Terminate).unwrap();
        let status = child.wait().unwrap();
        assert!(!status.success());
        assert!(!is_alive(pid));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_zombie_is_not_alive() {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();

        // Not yet reaped, so the pid is a zombie once it exits.
        let mut waited = 0;
        while is_alive(pid) && waited < 50 {
            std::thread::sleep(Duration::from_millis(20));
            waited += 1;
        }
        assert!(!is_alive(pid));
        child.wait().unwrap();
    }

    #[test]
    fn test_forceful_flag() {
        assert!(TerminationSignal::Kill.is_forceful());
        assert!(!TerminationSignal::Hangup.is_forceful());
    }
}
