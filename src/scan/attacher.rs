//! Stream-to-circuit rendezvous matcher
//!
//! New streams and the circuits meant to carry them are announced on two
//! independent event paths that can fire in either order. The matcher keys
//! both halves by the stream's local source port: whichever identity arrives
//! first is parked as a [`PendingHalf`]; when the counterpart shows up, the
//! pair is completed with one attach request to the control channel.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::control::{CircuitId, ControlChannel, StreamId};

/// One half of a stream/circuit rendezvous, parked until its counterpart arrives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingHalf {
    /// The circuit identity arrived first
    Circuit(CircuitId),
    /// The stream identity arrived first
    Stream(StreamId),
}

impl PendingHalf {
    const fn kind(&self) -> &'static str {
        match self {
            Self::Circuit(_) => "circuit",
            Self::Stream(_) => "stream",
        }
    }
}

/// Outcome of one `prepare` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareOutcome {
    /// No counterpart yet; the half was parked
    Stored,
    /// The counterpart was waiting; the attach was executed
    Attached,
    /// A half of the same kind was already parked for this port; the new
    /// half was dropped and the existing entry kept
    Collision,
}

/// Attaches streams to circuits
pub struct Attacher {
    control: Arc<dyn ControlChannel>,
    pending: Mutex<HashMap<u16, PendingHalf>>,
}

impl Attacher {
    /// Create a new attacher issuing attach requests through `control`
    pub fn new(control: Arc<dyn ControlChannel>) -> Self {
        Self {
            control,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Offer one half of a rendezvous for `port`
    ///
    /// If the complementary half is already parked for this port, the entry
    /// is removed and the attach executes now; otherwise the half is parked.
    /// Two halves of the same kind on one live port violate the at-most-one
    /// invariant and are surfaced as [`PrepareOutcome::Collision`] rather
    /// than silently overwriting the parked entry.
    pub async fn prepare(&self, port: u16, half: PendingHalf) -> PrepareOutcome {
        let matched = {
            let mut pending = self.pending.lock();

            match pending.remove(&port) {
                None => {
                    pending.insert(port, half);
                    debug!("Pending attachers: {}", pending.len());
                    return PrepareOutcome::Stored;
                }
                Some(parked) if parked.kind() == half.kind() => {
                    error!(
                        "Duplicate {} half for port {} (existing entry kept)",
                        half.kind(),
                        port
                    );
                    pending.insert(port, parked);
                    return PrepareOutcome::Collision;
                }
                Some(parked) => parked,
            }
        };

        let (stream_id, circuit_id) = match (matched, half) {
            (PendingHalf::Circuit(c), PendingHalf::Stream(s))
            | (PendingHalf::Stream(s), PendingHalf::Circuit(c)) => (s, c),
            _ => unreachable!("complementary kinds checked under lock"),
        };

        self.attach(&stream_id, &circuit_id).await;
        PrepareOutcome::Attached
    }

    /// Number of halves still waiting for their counterpart
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Execute a completed rendezvous: bind the stream to the circuit
    ///
    /// A rejection is logged and absorbed; the stream is simply lost to the
    /// measurement and the scan continues.
    async fn attach(&self, stream_id: &str, circuit_id: &str) {
        debug!(
            "Attempting to attach stream {} to circuit {}",
            stream_id, circuit_id
        );

        if let Err(e) = self.control.attach_stream(stream_id, circuit_id).await {
            warn!("Failed to attach stream: {}", e);
        }
    }
}
