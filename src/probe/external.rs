//! External-command probe
//!
//! Runs a configured command once per circuit, wrapped so its traffic goes
//! through the scan's proxy endpoint. The command's connections are matched
//! to the circuit via the wrapper's connection notices, so arbitrary
//! measurement tools work without any awareness of the scanner.

use async_trait::async_trait;
use tracing::{info, warn};

use super::ProbeModule;
use crate::error::WorkerError;
use crate::scan::ProbeContext;

/// Probe that shells out to a configured command
pub struct ExternalProbe {
    program: String,
    args: Vec<String>,
}

impl ExternalProbe {
    /// Create a probe from `command` (program followed by its arguments)
    #[must_use]
    pub fn new(mut command: Vec<String>) -> Self {
        let program = if command.is_empty() {
            String::new()
        } else {
            command.remove(0)
        };
        Self {
            program,
            args: command,
        }
    }
}

#[async_trait]
impl ProbeModule for ExternalProbe {
    async fn probe(
        &self,
        exit_fingerprint: &str,
        ctx: &ProbeContext,
    ) -> Result<(), WorkerError> {
        if self.program.is_empty() {
            return Err(WorkerError::command("", "no command configured"));
        }

        let output = ctx.run_command(&self.program, &self.args).await?;

        if output.status.success() {
            info!(
                "Command {:?} succeeded through exit {} ({} bytes of output)",
                self.program,
                exit_fingerprint,
                output.stdout.len()
            );
        } else {
            warn!(
                "Command {:?} exited with {} through exit {}",
                self.program, output.status, exit_fingerprint
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_splitting() {
        let probe = ExternalProbe::new(vec!["curl".into(), "-s".into(), "example.com".into()]);
        assert_eq!(probe.program, "curl");
        assert_eq!(probe.args, vec!["-s".to_string(), "example.com".to_string()]);

        let probe = ExternalProbe::new(Vec::new());
        assert!(probe.program.is_empty());
    }
}
