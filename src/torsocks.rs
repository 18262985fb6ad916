//! Proxy-wrapper command construction
//!
//! Probe modules can run external commands whose traffic must go through the
//! local SOCKS proxy. This module generates a per-invocation `torsocks`
//! configuration, wraps the command, and recognizes the wrapper's connection
//! notices so the source port of each proxied connection can be reported for
//! stream attachment.

use std::net::SocketAddr;
use std::path::Path;
use std::process::Stdio;
use std::sync::OnceLock;

use regex::Regex;
use tempfile::NamedTempFile;
use tokio::process::Command;

use crate::error::WorkerError;

/// Write a wrapper configuration pointing at the given SOCKS endpoint
///
/// The file lives as long as the returned handle; keep it alive for the
/// duration of the wrapped command.
///
/// # Errors
///
/// Returns `WorkerError::WrapperError` if the temporary file cannot be
/// created or written.
pub fn write_config(socks_addr: SocketAddr) -> Result<NamedTempFile, WorkerError> {
    let file = NamedTempFile::new()
        .map_err(|e| WorkerError::WrapperError(format!("Cannot create config file: {e}")))?;

    let contents = format!(
        "TorAddress {}\nTorPort {}\n",
        socks_addr.ip(),
        socks_addr.port()
    );
    std::fs::write(file.path(), contents)
        .map_err(|e| WorkerError::WrapperError(format!("Cannot write config file: {e}")))?;

    Ok(file)
}

/// Build a command that runs `program` through the proxy wrapper
///
/// Standard output and diagnostics are piped so the caller can collect the
/// command's output and watch for connection notices.
#[must_use]
pub fn wrap_command(program: &str, args: &[String], config_path: &Path) -> Command {
    let mut cmd = Command::new("torsocks");
    cmd.arg(program)
        .args(args)
        .env("TORSOCKS_CONF_FILE", config_path)
        .env("TORSOCKS_LOG_LEVEL", "3")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    cmd
}

/// Extract the source port from a wrapper connection notice
///
/// The wrapper logs a line of the form
/// `... Connection on fd <n> originating from <addr>:<port>` for every
/// proxied connection the wrapped command opens.
#[must_use]
pub fn connection_source_port(line: &str) -> Option<u16> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"Connection on fd [0-9]+ originating from [^:]+:([0-9]{1,5})")
            .expect("connection-notice regex is valid")
    });

    re.captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_config_contents() {
        let file = write_config("127.0.0.1:9050".parse().unwrap()).unwrap();
        let contents = std::fs::read_to_string(file.path()).unwrap();
        assert!(contents.contains("TorAddress 127.0.0.1"));
        assert!(contents.contains("TorPort 9050"));
    }

    #[test]
    fn test_connection_source_port() {
        assert_eq!(
            connection_source_port(
                "[May 20 10:00:00] WARNING torsocks[123]: Connection on fd 4 \
                 originating from 127.0.0.1:43890"
            ),
            Some(43890)
        );

        // Vector from the reference implementation's unit tests
        assert_eq!(
            connection_source_port("Connection on fd 4 originating from 444:0000"),
            Some(0)
        );

        assert_eq!(connection_source_port("unrelated log line"), None);
    }

    #[test]
    fn test_wrap_command_shape() {
        let file = write_config("127.0.0.1:9050".parse().unwrap()).unwrap();
        let cmd = wrap_command("curl", &["-s".into(), "example.com".into()], file.path());

        let std_cmd = cmd.as_std();
        assert_eq!(std_cmd.get_program(), "torsocks");
        let args: Vec<_> = std_cmd.get_args().collect();
        assert_eq!(args, ["curl", "-s", "example.com"]);
    }
}
