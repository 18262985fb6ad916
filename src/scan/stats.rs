//! Scan statistics tracking
//!
//! Shared monotonic counters mutated by the event dispatcher and the
//! completion channel reader. All counters are atomics so both contexts can
//! update them without further locking; none of them ever decreases.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

use crate::control::CircStatus;

/// Atomic scan statistics
#[derive(Debug)]
pub struct ScanStats {
    /// Total circuits requested for this scan (set once at startup)
    total_circuits: AtomicU64,
    /// Circuits that reached Built
    successful_circuits: AtomicU64,
    /// Circuits that reported Failed
    failed_circuits: AtomicU64,
    /// Workers that reported finished on the completion channel
    finished_workers: AtomicU64,
    /// Scan start time, for the final summary
    started: Instant,
}

impl Default for ScanStats {
    fn default() -> Self {
        Self::new(0)
    }
}

impl ScanStats {
    /// Create statistics for a scan of `total_circuits` circuits
    #[must_use]
    pub fn new(total_circuits: u64) -> Self {
        Self {
            total_circuits: AtomicU64::new(total_circuits),
            successful_circuits: AtomicU64::new(0),
            failed_circuits: AtomicU64::new(0),
            finished_workers: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    /// Update circuit counters from a reported status transition
    ///
    /// Built counts the circuit as successful, Failed as failed; every other
    /// status leaves the counters untouched.
    pub fn record_circuit_status(&self, status: CircStatus) {
        match status {
            CircStatus::Built => {
                self.successful_circuits.fetch_add(1, Ordering::Relaxed);
            }
            CircStatus::Failed => {
                self.failed_circuits.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    /// Record that one worker reported finished
    pub fn record_worker_finished(&self) {
        self.finished_workers.fetch_add(1, Ordering::Relaxed);
    }

    /// Get total circuits requested
    #[must_use]
    pub fn total_circuits(&self) -> u64 {
        self.total_circuits.load(Ordering::Relaxed)
    }

    /// Get circuits that reached Built
    #[must_use]
    pub fn successful_circuits(&self) -> u64 {
        self.successful_circuits.load(Ordering::Relaxed)
    }

    /// Get circuits that reported Failed
    #[must_use]
    pub fn failed_circuits(&self) -> u64 {
        self.failed_circuits.load(Ordering::Relaxed)
    }

    /// Get workers that reported finished
    #[must_use]
    pub fn finished_workers(&self) -> u64 {
        self.finished_workers.load(Ordering::Relaxed)
    }

    /// Did every requested circuit either build or fail?
    #[must_use]
    pub fn circuits_done(&self) -> bool {
        self.failed_circuits() + self.successful_circuits() == self.total_circuits()
    }

    /// Has every launched worker reported finished?
    ///
    /// The documented criterion compares finished workers against the
    /// difference of successful and failed circuits; with unsigned
    /// saturation the predicate is trivially true whenever failed >=
    /// successful, exactly as a signed comparison would be.
    #[must_use]
    pub fn workers_done(&self) -> bool {
        self.finished_workers()
            >= self
                .successful_circuits()
                .saturating_sub(self.failed_circuits())
    }

    /// Get a snapshot of all counters
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_circuits: self.total_circuits(),
            successful_circuits: self.successful_circuits(),
            failed_circuits: self.failed_circuits(),
            finished_workers: self.finished_workers(),
            elapsed_secs: self.started.elapsed().as_secs_f64(),
        }
    }
}

impl std::fmt::Display for ScanStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();
        write!(
            f,
            "{}/{} circuits built, {} failed, {} workers finished in {:.1}s",
            snapshot.successful_circuits,
            snapshot.total_circuits,
            snapshot.failed_circuits,
            snapshot.finished_workers,
            snapshot.elapsed_secs
        )
    }
}

/// Snapshot of scan statistics at a point in time
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    /// Total circuits requested
    pub total_circuits: u64,
    /// Circuits that reached Built
    pub successful_circuits: u64,
    /// Circuits that reported Failed
    pub failed_circuits: u64,
    /// Workers that reported finished
    pub finished_workers: u64,
    /// Seconds since the scan started
    pub elapsed_secs: f64,
}

impl StatsSnapshot {
    /// Fraction of requested circuits accounted for, as a percentage
    ///
    /// A scan that requested nothing reports zero progress.
    #[must_use]
    pub fn progress_percent(&self) -> f64 {
        if self.total_circuits == 0 {
            0.0
        } else {
            let done = self.successful_circuits + self.failed_circuits;
            (done as f64 / self.total_circuits as f64) * 100.0
        }
    }
}
