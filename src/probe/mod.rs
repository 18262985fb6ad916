//! Probe modules
//!
//! A probe module is the pluggable measurement workload run once per built
//! circuit. Modules receive the exit hop's fingerprint and a
//! [`ProbeContext`](crate::scan::ProbeContext) whose helpers route all
//! traffic through the scan's proxy endpoint, scoped to the worker's
//! circuit; they never touch the matcher or the statistics directly.
//!
//! # Builtin modules
//!
//! - `connectivity`: opens a proxied TCP connection to the configured
//!   target and issues a minimal HTTP request.
//! - `external`: runs a configured external command through the proxy
//!   wrapper.

mod connectivity;
mod external;

pub use connectivity::ConnectivityProbe;
pub use external::ExternalProbe;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ScanConfig;
use crate::error::WorkerError;
use crate::scan::ProbeContext;

/// The probe workload contract
#[async_trait]
pub trait ProbeModule: Send + Sync {
    /// Measure through one circuit ending at `exit_fingerprint`
    ///
    /// Errors fail this probe only; the scan continues.
    async fn probe(
        &self,
        exit_fingerprint: &str,
        ctx: &ProbeContext,
    ) -> Result<(), WorkerError>;

    /// Optional hook invoked exactly once at global completion
    async fn teardown(&self) {}
}

/// Look up a builtin probe module by its configured name
#[must_use]
pub fn module_by_name(name: &str, scan: &ScanConfig) -> Option<Arc<dyn ProbeModule>> {
    match name {
        "connectivity" => Some(Arc::new(ConnectivityProbe::new(&scan.target))),
        "external" => Some(Arc::new(ExternalProbe::new(scan.command.clone()))),
        _ => None,
    }
}
