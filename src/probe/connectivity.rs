//! Connectivity probe
//!
//! Opens one proxied TCP connection to the configured target per circuit,
//! issues a minimal HTTP request, and records whether the exit delivered a
//! response. Good enough to tell reachable exits from dead or intercepting
//! ones.

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, warn};

use super::ProbeModule;
use crate::error::WorkerError;
use crate::scan::ProbeContext;

/// Reachability probe against a fixed `host:port` target
pub struct ConnectivityProbe {
    host: String,
    port: u16,
}

impl ConnectivityProbe {
    /// Create a probe for `target` ("host:port"; port defaults to 80)
    #[must_use]
    pub fn new(target: &str) -> Self {
        let (host, port) = match target.rsplit_once(':') {
            Some((host, port)) => (host.to_string(), port.parse().unwrap_or(80)),
            None => (target.to_string(), 80),
        };
        Self { host, port }
    }
}

#[async_trait]
impl ProbeModule for ConnectivityProbe {
    async fn probe(
        &self,
        exit_fingerprint: &str,
        ctx: &ProbeContext,
    ) -> Result<(), WorkerError> {
        let mut stream = ctx
            .connect_over_proxy(&self.host, self.port)
            .await
            .map_err(|e| {
                warn!("Exit {} unreachable: {}", exit_fingerprint, e);
                e
            })?;

        let request = format!(
            "HEAD / HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            self.host
        );
        stream.write_all(request.as_bytes()).await?;

        let mut response = vec![0u8; 1024];
        let n = stream.read(&mut response).await?;
        if n == 0 {
            return Err(WorkerError::probe_failed(
                format!("{}:{}", self.host, self.port),
                "empty response",
            ));
        }

        let status_line = String::from_utf8_lossy(&response[..n])
            .lines()
            .next()
            .unwrap_or_default()
            .to_string();
        info!(
            "Exit {} reached {}:{} ({})",
            exit_fingerprint, self.host, self.port, status_line
        );

        Ok(())
    }
}
