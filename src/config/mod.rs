//! Configuration module
//!
//! Provides configuration types, loading, and validation for the scanner.

mod loader;
mod types;

pub use loader::{create_default_config, load_config, load_config_str, load_config_with_env};
pub use types::{Config, ControlConfig, LogConfig, ScanConfig, SocksConfig};
