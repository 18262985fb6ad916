//! Configuration types for exitscan
//!
//! This module defines all configuration structures used by the scanner.
//! Configuration is loaded from JSON files and validated at startup.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Control-port connection settings
    pub control: ControlConfig,

    /// Local SOCKS proxy endpoint that probe traffic goes through
    pub socks: SocksConfig,

    /// Scan parameters: probe module and exit relays to measure
    pub scan: ScanConfig,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scan.validate()?;

        if self.control.address.port() == self.socks.address.port()
            && self.control.address.ip() == self.socks.address.ip()
        {
            return Err(ConfigError::ValidationError(
                "Control and SOCKS endpoints must be distinct".into(),
            ));
        }

        Ok(())
    }

    /// Create a minimal default configuration
    #[must_use]
    pub fn default_config() -> Self {
        Self {
            control: ControlConfig::default(),
            socks: SocksConfig::default(),
            scan: ScanConfig::default(),
            log: LogConfig::default(),
        }
    }
}

/// Control-port connection settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControlConfig {
    /// Control-port address (e.g., "127.0.0.1:9051")
    pub address: SocketAddr,

    /// Control-port password, if the controller requires one
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:9051".parse().unwrap(),
            password: None,
        }
    }
}

/// Local SOCKS proxy endpoint
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SocksConfig {
    /// SOCKS listener address (e.g., "127.0.0.1:9050")
    pub address: SocketAddr,
}

impl SocksConfig {
    /// Get the SOCKS listener port
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.address.port()
    }
}

impl Default for SocksConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:9050".parse().unwrap(),
        }
    }
}

/// Scan parameters
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScanConfig {
    /// Name of the probe module to run (e.g., "connectivity", "external")
    #[serde(default = "default_module")]
    pub module: String,

    /// Exit-relay fingerprints to build circuits through, one scan worker each
    pub exits: Vec<String>,

    /// Optional fixed first hop (fingerprint); the overlay picks one if unset
    #[serde(default)]
    pub first_hop: Option<String>,

    /// Probe target as "host:port" (used by the connectivity module)
    #[serde(default = "default_target")]
    pub target: String,

    /// External command and arguments (used by the external module)
    #[serde(default)]
    pub command: Vec<String>,

    /// Delay between circuit-build requests in milliseconds
    ///
    /// Pacing keeps the overlay from rate-limiting a burst of EXTENDCIRCUIT
    /// requests when scanning many exits.
    #[serde(default = "default_build_delay_ms")]
    pub build_delay_ms: u64,
}

impl ScanConfig {
    /// Validate scan parameters
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.exits.is_empty() {
            return Err(ConfigError::ValidationError(
                "At least one exit fingerprint must be configured".into(),
            ));
        }

        for fpr in &self.exits {
            if !is_valid_fingerprint(fpr) {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid exit fingerprint: {fpr}"
                )));
            }
        }

        if let Some(ref fpr) = self.first_hop {
            if !is_valid_fingerprint(fpr) {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid first-hop fingerprint: {fpr}"
                )));
            }
        }

        if self.module.is_empty() {
            return Err(ConfigError::ValidationError(
                "Probe module name cannot be empty".into(),
            ));
        }

        if self.target.is_empty() {
            return Err(ConfigError::ValidationError(
                "Probe target cannot be empty".into(),
            ));
        }

        if self.module == "external" && self.command.is_empty() {
            return Err(ConfigError::ValidationError(
                "The external module requires a command".into(),
            ));
        }

        Ok(())
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            module: default_module(),
            exits: Vec::new(),
            first_hop: None,
            target: default_target(),
            command: Vec::new(),
            build_delay_ms: default_build_delay_ms(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Include timestamps
    #[serde(default = "default_true")]
    pub timestamps: bool,

    /// Include target (module path)
    #[serde(default = "default_true")]
    pub target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
            timestamps: true,
            target: true,
        }
    }
}

/// Check if a string is a well-formed relay fingerprint (40 hex chars)
fn is_valid_fingerprint(fpr: &str) -> bool {
    fpr.len() == 40 && fpr.chars().all(|c| c.is_ascii_hexdigit())
}

// Default value functions for serde
const fn default_true() -> bool {
    true
}

const fn default_build_delay_ms() -> u64 {
    100
}

fn default_module() -> String {
    "connectivity".into()
}

fn default_target() -> String {
    "check.torproject.org:80".into()
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    const FPR: &str = "A1B2C3D4E5F60718293A4B5C6D7E8F9001122334";

    fn config_with_exits(exits: Vec<String>) -> Config {
        let mut config = Config::default_config();
        config.scan.exits = exits;
        config
    }

    #[test]
    fn test_default_config_needs_exits() {
        // The default config has no exits and must fail validation
        let config = Config::default_config();
        assert!(config.validate().is_err());

        let config = config_with_exits(vec![FPR.into()]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_fingerprint_validation() {
        assert!(is_valid_fingerprint(FPR));
        assert!(!is_valid_fingerprint("short"));
        assert!(!is_valid_fingerprint(
            "Z1B2C3D4E5F60718293A4B5C6D7E8F9001122334"
        ));

        let config = config_with_exits(vec!["not-a-fingerprint".into()]);
        assert!(config.validate().is_err());

        let mut config = config_with_exits(vec![FPR.into()]);
        config.scan.first_hop = Some("bogus".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_distinct_endpoints() {
        let mut config = config_with_exits(vec![FPR.into()]);
        config.control.address = "127.0.0.1:9050".parse().unwrap();
        config.socks.address = "127.0.0.1:9050".parse().unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_module_rejected() {
        let mut config = config_with_exits(vec![FPR.into()]);
        config.scan.module = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_serialization() {
        let config = config_with_exits(vec![FPR.into()]);
        let json = serde_json::to_string_pretty(&config).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(config.scan.module, parsed.scan.module);
        assert_eq!(config.scan.exits, parsed.scan.exits);
        assert_eq!(config.control.address, parsed.control.address);
    }
}
