//! Configuration loading and management
//!
//! This module handles loading configuration from files and environment variables.

use std::path::Path;

use tracing::{debug, info};

use super::types::Config;
use crate::error::ConfigError;

/// Load configuration from a JSON file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read or parsed.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;

    let config: Config = serde_json::from_str(&contents)
        .map_err(|e| ConfigError::ParseError(format!("Failed to parse JSON: {e} at {path:?}")))?;

    config.validate()?;

    info!(
        "Configuration loaded: {} exits, module={}",
        config.scan.exits.len(),
        config.scan.module
    );

    Ok(config)
}

/// Load configuration from a JSON string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<Config, ConfigError> {
    let config: Config =
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    config.validate()?;

    Ok(config)
}

/// Load configuration with environment variable overrides
///
/// Environment variables:
/// - `EXITSCAN_CONTROL_ADDR`: Override control-port address
/// - `EXITSCAN_SOCKS_ADDR`: Override SOCKS endpoint address
/// - `EXITSCAN_LOG_LEVEL`: Override log level
/// - `EXITSCAN_MODULE`: Override probe module name
///
/// # Errors
///
/// Returns `ConfigError` if loading or parsing fails.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let mut config = load_config(path)?;

    if let Ok(addr) = std::env::var("EXITSCAN_CONTROL_ADDR") {
        config.control.address = addr.parse().map_err(|_| ConfigError::EnvError {
            name: "EXITSCAN_CONTROL_ADDR".into(),
            reason: format!("Invalid socket address: {addr}"),
        })?;
        debug!("Control address overridden to {}", config.control.address);
    }

    if let Ok(addr) = std::env::var("EXITSCAN_SOCKS_ADDR") {
        config.socks.address = addr.parse().map_err(|_| ConfigError::EnvError {
            name: "EXITSCAN_SOCKS_ADDR".into(),
            reason: format!("Invalid socket address: {addr}"),
        })?;
        debug!("SOCKS address overridden to {}", config.socks.address);
    }

    if let Ok(level) = std::env::var("EXITSCAN_LOG_LEVEL") {
        config.log.level = level;
        debug!("Log level overridden to {}", config.log.level);
    }

    if let Ok(module) = std::env::var("EXITSCAN_MODULE") {
        config.scan.module = module;
        debug!("Probe module overridden to {}", config.scan.module);
    }

    // Re-validate after overrides
    config.validate()?;

    Ok(config)
}

/// Write a default configuration file
///
/// The generated file fails validation on purpose (it has no exits); it is a
/// template for the operator to fill in.
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be written.
pub fn create_default_config(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let path = path.as_ref();

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let config = Config::default_config();
    let json = serde_json::to_string_pretty(&config)
        .map_err(|e| ConfigError::ParseError(e.to_string()))?;

    std::fs::write(path, json)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"{
        "control": { "address": "127.0.0.1:9051" },
        "socks": { "address": "127.0.0.1:9050" },
        "scan": {
            "module": "connectivity",
            "exits": ["A1B2C3D4E5F60718293A4B5C6D7E8F9001122334"]
        }
    }"#;

    #[test]
    fn test_load_config_str() {
        let config = load_config_str(VALID).unwrap();
        assert_eq!(config.scan.exits.len(), 1);
        assert_eq!(config.scan.module, "connectivity");
        assert_eq!(config.control.address.port(), 9051);
        // Defaults fill in
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_load_config_str_invalid_json() {
        let result = load_config_str("{not json");
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_load_config_str_fails_validation() {
        let json = r#"{
            "control": { "address": "127.0.0.1:9051" },
            "socks": { "address": "127.0.0.1:9050" },
            "scan": { "exits": [] }
        }"#;
        let result = load_config_str(json);
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_load_config_missing_file() {
        let result = load_config("/nonexistent/exitscan.json");
        assert!(matches!(result, Err(ConfigError::FileNotFound { .. })));
    }

    #[test]
    fn test_create_and_read_default_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        create_default_config(&path).unwrap();
        assert!(path.exists());

        // The template has no exits, so loading it must fail validation
        let result = load_config(&path);
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }
}
