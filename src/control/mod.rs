//! Control-channel types and event parsing
//!
//! This module defines the seam between the scan engine and the overlay's
//! control channel: the [`ControlChannel`] trait used to attach streams and
//! close circuits, the typed circuit/stream events delivered by the
//! controller, and the parsing of asynchronous event lines.
//!
//! The scan engine only ever sees [`ControlEvent`] values and a
//! `Arc<dyn ControlChannel>`; the actual control-port client lives in
//! [`client`] and can be replaced by a mock in tests.

mod client;

pub use client::ControlClient;

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;

use crate::error::ControlError;

/// Opaque circuit identifier assigned by the overlay
pub type CircuitId = String;

/// Opaque stream identifier assigned by the overlay
pub type StreamId = String;

/// Circuit lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircStatus {
    /// Circuit construction has started
    Launched,
    /// All hops are in place; the circuit is usable
    Built,
    /// One more hop was added
    Extended,
    /// Construction failed
    Failed,
    /// The circuit was torn down
    Closed,
    /// Any status this scanner does not act on
    Other,
}

impl CircStatus {
    fn parse(s: &str) -> Self {
        match s {
            "LAUNCHED" => Self::Launched,
            "BUILT" => Self::Built,
            "EXTENDED" => Self::Extended,
            "FAILED" => Self::Failed,
            "CLOSED" => Self::Closed,
            _ => Self::Other,
        }
    }
}

/// Stream lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    /// New connection request awaiting attachment
    New,
    /// New resolve request awaiting attachment
    NewResolve,
    /// The stream was attached and connected
    Succeeded,
    /// The stream failed
    Failed,
    /// The stream was closed
    Closed,
    /// The stream was detached from its circuit
    Detached,
    /// Any status this scanner does not act on
    Other,
}

impl StreamStatus {
    fn parse(s: &str) -> Self {
        match s {
            "NEW" => Self::New,
            "NEWRESOLVE" => Self::NewResolve,
            "SUCCEEDED" => Self::Succeeded,
            "FAILED" => Self::Failed,
            "CLOSED" => Self::Closed,
            "DETACHED" => Self::Detached,
            _ => Self::Other,
        }
    }

    /// Whether this stream still needs to be attached to a circuit
    #[must_use]
    pub const fn is_pending_attach(&self) -> bool {
        matches!(self, Self::New | Self::NewResolve)
    }
}

/// A circuit lifecycle event delivered by the controller
#[derive(Debug, Clone)]
pub struct CircuitEvent {
    /// Circuit identifier
    pub id: CircuitId,
    /// Reported status
    pub status: CircStatus,
    /// Relay path as (fingerprint, nickname) pairs, first hop first
    pub path: Vec<(String, String)>,
    /// The raw event line as received
    pub raw: String,
}

impl CircuitEvent {
    /// Fingerprint of the last hop (the exit), if the path is non-empty
    #[must_use]
    pub fn exit_fingerprint(&self) -> Option<&str> {
        self.path.last().map(|(fpr, _)| fpr.as_str())
    }
}

/// A stream lifecycle event delivered by the controller
#[derive(Debug, Clone)]
pub struct StreamEvent {
    /// Stream identifier
    pub id: StreamId,
    /// Reported status
    pub status: StreamStatus,
    /// Target the stream wants to reach ("host:port")
    pub target: String,
    /// The raw event line; carries `SOURCE_ADDR=<addr>:<port>` for new streams
    pub raw: String,
}

impl StreamEvent {
    /// Extract the local source port from the event's textual description
    #[must_use]
    pub fn source_port(&self) -> Option<u16> {
        source_port(&self.raw)
    }
}

/// A classified asynchronous event from the control channel
#[derive(Debug, Clone)]
pub enum ControlEvent {
    /// Circuit lifecycle event
    Circuit(CircuitEvent),
    /// Stream lifecycle event
    Stream(StreamEvent),
    /// Any other event kind, carried verbatim
    Unknown(String),
}

/// Operations the scan engine needs from the overlay's control channel
///
/// Both operations are best-effort from the scan's perspective: a rejection
/// is logged by the caller and never aborts the scan.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    /// Ask the overlay to bind a pending stream to a circuit
    async fn attach_stream(
        &self,
        stream_id: &str,
        circuit_id: &str,
    ) -> Result<(), ControlError>;

    /// Ask the overlay to tear down a circuit
    async fn close_circuit(&self, circuit_id: &str) -> Result<(), ControlError>;
}

/// Extract the local source port from text containing `SOURCE_ADDR=<addr>:<port>`
#[must_use]
pub fn source_port(text: &str) -> Option<u16> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"SOURCE_ADDR=\S+:([0-9]{1,5})").expect("source-port regex is valid")
    });

    re.captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Classify and parse one asynchronous event line
///
/// `line` is the event content without the leading `650 ` status code. Event
/// kinds other than CIRC and STREAM come back as [`ControlEvent::Unknown`].
#[must_use]
pub fn parse_event_line(line: &str) -> ControlEvent {
    let mut parts = line.splitn(2, ' ');
    let kind = parts.next().unwrap_or_default();
    let rest = parts.next().unwrap_or_default();

    match kind {
        "CIRC" => parse_circuit_event(rest)
            .map_or_else(|| ControlEvent::Unknown(line.to_string()), ControlEvent::Circuit),
        "STREAM" => parse_stream_event(rest)
            .map_or_else(|| ControlEvent::Unknown(line.to_string()), ControlEvent::Stream),
        _ => ControlEvent::Unknown(line.to_string()),
    }
}

/// Parse a CIRC event body: `<id> <status> [<path>] [<keyword args>]`
fn parse_circuit_event(body: &str) -> Option<CircuitEvent> {
    let mut tokens = body.split_whitespace();
    let id = tokens.next()?.to_string();
    let status = CircStatus::parse(tokens.next()?);

    // The path token, when present, is a comma-separated list of
    // `$FINGERPRINT=nickname` entries and directly follows the status.
    let path = match tokens.next() {
        Some(token) if token.starts_with('$') => parse_path(token),
        _ => Vec::new(),
    };

    Some(CircuitEvent {
        id,
        status,
        path,
        raw: body.to_string(),
    })
}

/// Parse a circuit path token into (fingerprint, nickname) pairs
fn parse_path(token: &str) -> Vec<(String, String)> {
    token
        .split(',')
        .filter_map(|hop| {
            let hop = hop.strip_prefix('$')?;
            // Nickname separator is '=' (Named) or '~' (unnamed)
            let (fpr, nick) = match hop.find(['=', '~']) {
                Some(idx) => (&hop[..idx], &hop[idx + 1..]),
                None => (hop, ""),
            };
            Some((fpr.to_string(), nick.to_string()))
        })
        .collect()
}

/// Parse a STREAM event body: `<id> <status> <circ-id> <target> [<keyword args>]`
fn parse_stream_event(body: &str) -> Option<StreamEvent> {
    let mut tokens = body.split_whitespace();
    let id = tokens.next()?.to_string();
    let status = StreamStatus::parse(tokens.next()?);
    let _circ_id = tokens.next()?;
    let target = tokens.next().unwrap_or_default().to_string();

    Some(StreamEvent {
        id,
        status,
        target,
        raw: body.to_string(),
    })
}
