//! Messages written to a terminal when a session fails.

use crate::error::COMMAND_NOT_FOUND_HINT;

/// Map an SSH error message to a remediation hint.
pub fn ssh_error_hint(message: &str) -> &'static str {
    let lower = message.to_lowercase();
    if lower.contains("connection refused") {
        "Check if SSH service is running on the target host and the port is correct"
    } else if lower.contains("permission denied") {
        "Check your username, password, or SSH key configuration"
    } else if lower.contains("host key verification failed") {
        "The host key has changed. Remove the old key from known_hosts if this is expected"
    } else if lower.contains("network is unreachable") {
        "Check your network connection and the hostname/IP address"
    } else if lower.contains("no route to host") {
        "The host is not reachable. Check network connectivity and firewall settings"
    } else if lower.contains("connection timed out") {
        "Connection timeout. The host may be down or firewalled"
    } else if lower.contains("command not found") || lower.contains("no such file") {
        COMMAND_NOT_FOUND_HINT
    } else {
        "Check your SSH configuration and network connectivity"
    }
}

/// Banner for a remote session that failed to start.
pub fn remote_failure(session: &str, host: &str, error: &str, hint: &str) -> String {
    format!(
        "\r\nSSH Connection Failed:\r\nSession: {}\r\nHost: {}\r\nError: {}\r\nSuggestion: {}\r\n\r\n",
        session, host, error, hint
    )
}

/// Banner for a local shell that failed to start.
pub fn local_failure(session: &str, error: &str) -> String {
    format!(
        "\r\nFailed to start {}:\r\nError: {}\r\nPlease check your system configuration.\r\n\r\n",
        session, error
    )
}

/// Notice written when a process exits with a non-zero code.
pub fn exit_notice(code: i32) -> String {
    format!("\r\n[Process exited with code {}]\r\n", code)
}

/// Notice written when a stored password cannot be supplied automatically.
pub fn password_prompt_notice(helper: &str) -> String {
    format!(
        "\r\n[{} is not installed; enter the password when prompted]\r\n",
        helper
    )
}
