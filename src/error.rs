//! Error types for exitscan
//!
//! This module defines the error hierarchy for the scanner. Errors are
//! categorized by subsystem; the scan engine itself absorbs every recoverable
//! condition locally (logged, never propagated), so most of these surface
//! only during startup and control-port plumbing.

use std::io;

use thiserror::Error;

/// Top-level error type for exitscan
#[derive(Debug, Error)]
pub enum ExitScanError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Control-port communication errors
    #[error("Control error: {0}")]
    Control(#[from] ControlError),

    /// Worker and probe errors
    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ExitScanError {
    /// Check if this error is recoverable (the scan can continue)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) => false,
            Self::Control(e) => e.is_recoverable(),
            Self::Worker(e) => e.is_recoverable(),
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are not recoverable without user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

/// Control-port communication errors
#[derive(Debug, Error)]
pub enum ControlError {
    /// Failed to connect to the control port
    #[error("Failed to connect to control port {addr}: {reason}")]
    ConnectError { addr: String, reason: String },

    /// Authentication rejected
    #[error("Control-port authentication failed: {0}")]
    AuthError(String),

    /// The controller replied with a non-OK status line
    #[error("Control command failed: {command}: {reply}")]
    CommandFailed { command: String, reply: String },

    /// Malformed reply or event line
    #[error("Control protocol error: {0}")]
    ProtocolError(String),

    /// The control connection was closed by the peer
    #[error("Control connection closed")]
    ConnectionClosed,

    /// I/O error on the control connection
    #[error("Control I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl ControlError {
    /// Check if this error is recoverable
    ///
    /// Rejected commands are recoverable from the scan's perspective: a
    /// failed attach or close never aborts the scan.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::ConnectError { .. } => false,
            Self::AuthError(_) => false,
            Self::CommandFailed { .. } => true,
            Self::ProtocolError(_) => true,
            Self::ConnectionClosed => false,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
            ),
        }
    }

    /// Create a command-failed error
    pub fn command_failed(command: impl Into<String>, reply: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: command.into(),
            reply: reply.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::ProtocolError(msg.into())
    }
}

/// Worker and probe errors
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The SOCKS handshake with the local proxy failed
    #[error("SOCKS handshake failed: {0}")]
    SocksError(String),

    /// The probed target misbehaved
    #[error("Probe failed against {target}: {reason}")]
    ProbeFailed { target: String, reason: String },

    /// An external command could not be run
    #[error("Command {command:?} failed: {reason}")]
    CommandError { command: String, reason: String },

    /// Failed to generate the proxy-wrapper configuration
    #[error("Proxy wrapper setup failed: {0}")]
    WrapperError(String),

    /// I/O error inside the worker
    #[error("Worker I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl WorkerError {
    /// Worker errors never abort the scan; they only fail one probe
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        true
    }

    /// Create a probe-failed error
    pub fn probe_failed(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ProbeFailed {
            target: target.into(),
            reason: reason.into(),
        }
    }

    /// Create a command error
    pub fn command(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CommandError {
            command: command.into(),
            reason: reason.into(),
        }
    }
}

/// Type alias for Result with ExitScanError
pub type Result<T> = std::result::Result<T, ExitScanError>;
