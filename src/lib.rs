//! exitscan: concurrent exit-relay measurement scanner
//!
//! exitscan drives a measurement scan over the exit relays of a Tor-like
//! anonymity overlay. It builds one circuit per configured exit, runs a
//! pluggable probe workload through each, and binds every new stream to the
//! circuit that was opened to carry it, even though the overlay announces
//! streams and circuits on independent, arbitrarily ordered event paths.
//!
//! # Architecture
//!
//! ```text
//! control events → EventHandler → { worker per built circuit,
//!                                   rendezvous matcher }
//!                                          ↓
//! workers → completion channel → reader → { attach, statistics }
//!                                          ↓
//!                                 completion decider → shutdown
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use exitscan::config::load_config;
//! use exitscan::control::{ControlChannel, ControlClient};
//! use exitscan::probe::module_by_name;
//! use exitscan::scan::{completion_channel, EventHandler, ScanStats};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("/etc/exitscan/config.json")?;
//! let module = module_by_name(&config.scan.module, &config.scan).unwrap();
//!
//! let (client, mut events) = ControlClient::connect(&config.control).await?;
//! let client = Arc::new(client);
//!
//! let (completion_tx, _completion_rx) = completion_channel();
//! let handler = EventHandler::new(
//!     client as Arc<dyn ControlChannel>,
//!     module,
//!     Arc::new(ScanStats::new(config.scan.exits.len() as u64)),
//!     config.socks.address,
//!     completion_tx,
//! );
//!
//! while let Some(event) = events.recv().await {
//!     handler.handle_event(event).await;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration types and loading
//! - [`control`]: Control-channel client, events, and parsing
//! - [`error`]: Error types
//! - [`probe`]: Probe module contract and builtins
//! - [`scan`]: Matcher, workers, completion channel, decider
//! - [`torsocks`]: Proxy-wrapper command construction

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod control;
pub mod error;
pub mod probe;
pub mod scan;
pub mod torsocks;

// Re-export commonly used types at the crate root
pub use config::{Config, ControlConfig, ScanConfig, SocksConfig};
pub use control::{CircStatus, CircuitEvent, ControlChannel, ControlClient, ControlEvent,
    StreamEvent, StreamStatus};
pub use error::{ConfigError, ControlError, ExitScanError, WorkerError};
pub use probe::ProbeModule;
pub use scan::{EventHandler, ProbeContext, ScanStats, WorkerMessage};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
