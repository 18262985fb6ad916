//! Control-event dispatch and the global-completion decision
//!
//! The [`EventHandler`] is the entry point for every event the control
//! channel delivers. Circuit events update the statistics and launch one
//! worker per built circuit; stream events feed the rendezvous matcher. The
//! completion decider re-evaluates after every state change and, once the
//! whole scan is accounted for, tears everything down exactly once.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::attacher::{Attacher, PendingHalf};
use super::stats::ScanStats;
use super::worker::{CompletionSender, ProbeContext, WorkerSet};
use crate::control::{CircStatus, CircuitEvent, ControlChannel, ControlEvent, StreamEvent};
use crate::probe::ProbeModule;

/// Handles asynchronous control-channel events
///
/// Only circuit and stream events are acted on. New streams are attached to
/// their corresponding circuits because the overlay is configured to leave
/// them unattached.
pub struct EventHandler {
    control: Arc<dyn ControlChannel>,
    module: Arc<dyn ProbeModule>,
    attacher: Attacher,
    stats: Arc<ScanStats>,
    workers: WorkerSet,
    completion_tx: CompletionSender,
    socks_addr: SocketAddr,
    finished: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl EventHandler {
    /// Create the handler for one scan
    pub fn new(
        control: Arc<dyn ControlChannel>,
        module: Arc<dyn ProbeModule>,
        stats: Arc<ScanStats>,
        socks_addr: SocketAddr,
        completion_tx: CompletionSender,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            attacher: Attacher::new(Arc::clone(&control)),
            control,
            module,
            stats,
            workers: WorkerSet::new(),
            completion_tx,
            socks_addr,
            finished: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    /// Subscribe to the global-shutdown signal
    ///
    /// The value flips to `true` exactly once, when the completion decider
    /// fires.
    #[must_use]
    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Dispatch one control event to the appropriate handler
    pub async fn handle_event(&self, event: ControlEvent) {
        match event {
            ControlEvent::Circuit(circ) => self.handle_circuit(circ).await,
            ControlEvent::Stream(stream) => self.handle_stream(stream).await,
            ControlEvent::Unknown(raw) => {
                warn!("Received unexpected event: {}", raw);
            }
        }
    }

    /// Handle a circuit lifecycle event
    ///
    /// Built and Failed transitions feed the statistics; a Built circuit
    /// additionally gets a probe worker launched against its exit hop.
    pub async fn handle_circuit(&self, event: CircuitEvent) {
        self.stats.record_circuit_status(event.status);
        self.check_finished().await;

        if event.status != CircStatus::Built {
            return;
        }

        // The decider can latch shutdown at this very event (the completion
        // criterion compares finished workers against built-minus-failed
        // circuits, which balances out when failures keep pace with builds).
        // Once latched, the scan is over; no further workers are launched.
        if self.finished.load(Ordering::SeqCst) {
            debug!("Scan already finished, not launching worker for {}", event.id);
            return;
        }

        let Some(exit_fingerprint) = event.exit_fingerprint() else {
            warn!("Built circuit {} has an empty path", event.id);
            return;
        };

        debug!(
            "Circuit for exit relay \"{}\" is built. Now invoking probe module",
            exit_fingerprint
        );

        let ctx = ProbeContext::new(
            event.id.clone(),
            self.socks_addr,
            self.completion_tx.clone(),
        );
        self.workers
            .spawn(Arc::clone(&self.module), exit_fingerprint.to_string(), ctx);
    }

    /// Handle a stream lifecycle event
    ///
    /// Only streams awaiting attachment matter; their source port keys the
    /// rendezvous with the circuit that was opened to carry them.
    pub async fn handle_stream(&self, event: StreamEvent) {
        if !event.status.is_pending_attach() {
            return;
        }

        let Some(port) = event.source_port() else {
            warn!(
                "Couldn't extract source port from stream event: {}",
                event.raw
            );
            return;
        };

        debug!("Adding attacher for new stream {}", event.id);
        self.attacher
            .prepare(port, PendingHalf::Stream(event.id))
            .await;
        self.check_finished().await;
    }

    /// The completion decider: shut the scan down once everything is accounted for
    ///
    /// Both predicates must hold: every requested circuit either built or
    /// failed, and every owed worker reported finished. The shutdown runs
    /// exactly once; later invocations are no-ops.
    pub async fn check_finished(&self) {
        debug!(
            "failedCircs={}, builtCircs={}, totalCircs={}, finishedWorkers={}",
            self.stats.failed_circuits(),
            self.stats.successful_circuits(),
            self.stats.total_circuits(),
            self.stats.finished_workers()
        );

        if !(self.stats.circuits_done() && self.stats.workers_done()) {
            return;
        }

        if self
            .finished
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        self.workers.terminate_all();

        debug!("Calling probe module's teardown");
        self.module.teardown().await;

        info!("Scan finished: {}", self.stats);

        let _ = self.shutdown_tx.send(true);
    }

    /// The rendezvous matcher
    #[must_use]
    pub fn attacher(&self) -> &Attacher {
        &self.attacher
    }

    /// The live worker set
    #[must_use]
    pub fn workers(&self) -> &WorkerSet {
        &self.workers
    }

    /// The control channel
    #[must_use]
    pub fn control(&self) -> &Arc<dyn ControlChannel> {
        &self.control
    }

    /// The scan statistics
    #[must_use]
    pub fn stats(&self) -> &ScanStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::sync::Notify;

    use crate::control::{ControlChannel, StreamStatus};
    use crate::error::{ControlError, WorkerError};
    use crate::scan::worker::completion_channel;

    const EXIT_FPR: &str = "FFEEDDCCBBAA99887766554433221100FFEEDDCC";

    #[derive(Default)]
    struct MockControl {
        attaches: Mutex<Vec<(String, String)>>,
        closes: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ControlChannel for MockControl {
        async fn attach_stream(
            &self,
            stream_id: &str,
            circuit_id: &str,
        ) -> Result<(), ControlError> {
            self.attaches
                .lock()
                .push((stream_id.to_string(), circuit_id.to_string()));
            Ok(())
        }

        async fn close_circuit(&self, circuit_id: &str) -> Result<(), ControlError> {
            self.closes.lock().push(circuit_id.to_string());
            Ok(())
        }
    }

    /// Probe that announces attach-readiness and then waits for the gate
    struct GatedProbe {
        announce_port: u16,
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl ProbeModule for GatedProbe {
        async fn probe(
            &self,
            _exit_fingerprint: &str,
            ctx: &ProbeContext,
        ) -> Result<(), WorkerError> {
            ctx.signal_attach_ready(SocketAddr::from(([127, 0, 0, 1], self.announce_port)));
            self.gate.notified().await;
            Ok(())
        }
    }

    /// Probe counting teardown invocations
    #[derive(Default)]
    struct CountingProbe {
        teardowns: AtomicUsize,
    }

    #[async_trait]
    impl ProbeModule for CountingProbe {
        async fn probe(
            &self,
            _exit_fingerprint: &str,
            _ctx: &ProbeContext,
        ) -> Result<(), WorkerError> {
            Ok(())
        }

        async fn teardown(&self) {
            self.teardowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn circuit_event(id: &str, status: CircStatus, with_path: bool) -> CircuitEvent {
        CircuitEvent {
            id: id.into(),
            status,
            path: if with_path {
                vec![
                    ("A1B2C3D4E5F60718293A4B5C6D7E8F9001122334".into(), "entry".into()),
                    (EXIT_FPR.into(), "exit".into()),
                ]
            } else {
                Vec::new()
            },
            raw: String::new(),
        }
    }

    fn stream_event(id: &str, status: StreamStatus, source_port: Option<u16>) -> StreamEvent {
        let raw = match source_port {
            Some(port) => format!("{id} NEW 0 example.com:80 SOURCE_ADDR=127.0.0.1:{port}"),
            None => format!("{id} NEW 0 example.com:80"),
        };
        StreamEvent {
            id: id.into(),
            status,
            target: "example.com:80".into(),
            raw,
        }
    }

    fn handler_with(
        control: Arc<MockControl>,
        module: Arc<dyn ProbeModule>,
        total: u64,
        tx: CompletionSender,
    ) -> Arc<EventHandler> {
        Arc::new(EventHandler::new(
            control as Arc<dyn ControlChannel>,
            module,
            Arc::new(ScanStats::new(total)),
            "127.0.0.1:9050".parse().unwrap(),
            tx,
        ))
    }

    #[tokio::test]
    async fn test_scan_completes_after_attach_and_finish() {
        let control = Arc::new(MockControl::default());
        let gate = Arc::new(Notify::new());
        let module = Arc::new(GatedProbe {
            announce_port: 5000,
            gate: Arc::clone(&gate),
        });
        let (tx, mut rx) = completion_channel();
        let handler = handler_with(Arc::clone(&control), module, 2, tx);
        let mut shutdown = handler.subscribe_shutdown();

        // The first circuit builds and spawns a worker
        handler
            .handle_circuit(circuit_event("C1", CircStatus::Built, true))
            .await;
        assert_eq!(handler.stats().successful_circuits(), 1);
        assert_eq!(handler.workers().live_count(), 1);
        assert!(!*shutdown.borrow());

        // The worker announces attach-readiness on port 5000
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.payload.unwrap().port(), 5000);
        handler
            .attacher()
            .prepare(5000, PendingHalf::Circuit(msg.circuit_id))
            .await;

        // The matching stream event completes the attach
        handler
            .handle_stream(stream_event("S1", StreamStatus::New, Some(5000)))
            .await;
        assert_eq!(
            control.attaches.lock().clone(),
            vec![("S1".to_string(), "C1".to_string())]
        );

        // Release the probe; its finish guard reports completion
        gate.notify_one();
        let msg = rx.recv().await.unwrap();
        assert!(msg.payload.is_none());
        assert_eq!(msg.circuit_id, "C1");

        handler.workers().remove(&msg.circuit_id);
        handler.stats().record_worker_finished();
        handler.check_finished().await;
        assert!(!*shutdown.borrow());

        // The second circuit fails; now everything is accounted for
        handler
            .handle_circuit(circuit_event("C0", CircStatus::Failed, false))
            .await;

        assert_eq!(handler.stats().failed_circuits(), 1);
        assert_eq!(handler.stats().finished_workers(), 1);
        assert!(handler.stats().circuits_done());
        assert!(handler.stats().workers_done());
        assert!(*shutdown.borrow());
    }

    #[tokio::test]
    async fn test_completion_fires_before_worker_when_failures_balance_builds() {
        // Failed arrives before Built: at the Built event the completion
        // criterion (finished >= built - failed) is already satisfied, so
        // the scan latches shutdown before a worker is ever launched. This
        // is the documented criterion's behavior, preserved deliberately.
        let control = Arc::new(MockControl::default());
        let module = Arc::new(CountingProbe::default());
        let (tx, _rx) = completion_channel();
        let handler = handler_with(
            control,
            Arc::clone(&module) as Arc<dyn ProbeModule>,
            2,
            tx,
        );
        let shutdown = handler.subscribe_shutdown();

        handler
            .handle_circuit(circuit_event("C0", CircStatus::Failed, false))
            .await;
        assert!(!*shutdown.borrow());

        handler
            .handle_circuit(circuit_event("C1", CircStatus::Built, true))
            .await;

        assert!(*shutdown.borrow());
        assert_eq!(handler.workers().live_count(), 0);
        assert_eq!(module.teardowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_completion_is_idempotent() {
        let control = Arc::new(MockControl::default());
        let module = Arc::new(CountingProbe::default());
        let (tx, _rx) = completion_channel();
        let handler = handler_with(
            Arc::clone(&control),
            Arc::clone(&module) as Arc<dyn ProbeModule>,
            1,
            tx,
        );

        handler
            .handle_circuit(circuit_event("C0", CircStatus::Failed, false))
            .await;
        assert_eq!(module.teardowns.load(Ordering::SeqCst), 1);

        // Re-running the decider must not tear down again
        handler.check_finished().await;
        handler.check_finished().await;
        assert_eq!(module.teardowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unparseable_stream_event_is_dropped() {
        let control = Arc::new(MockControl::default());
        let module = Arc::new(CountingProbe::default());
        let (tx, _rx) = completion_channel();
        let handler = handler_with(control, module, 5, tx);

        handler
            .handle_stream(stream_event("S1", StreamStatus::New, None))
            .await;

        // No pending half, no attach, statistics untouched
        assert_eq!(handler.attacher().pending_count(), 0);
        assert_eq!(handler.stats().successful_circuits(), 0);
        assert_eq!(handler.stats().failed_circuits(), 0);
    }

    #[tokio::test]
    async fn test_non_pending_stream_statuses_ignored() {
        let control = Arc::new(MockControl::default());
        let module = Arc::new(CountingProbe::default());
        let (tx, _rx) = completion_channel();
        let handler = handler_with(control, module, 5, tx);

        handler
            .handle_stream(stream_event("S1", StreamStatus::Succeeded, Some(5000)))
            .await;
        handler
            .handle_stream(stream_event("S2", StreamStatus::Closed, Some(5001)))
            .await;

        assert_eq!(handler.attacher().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_built_circuit_with_empty_path_spawns_nothing() {
        let control = Arc::new(MockControl::default());
        let module = Arc::new(CountingProbe::default());
        let (tx, _rx) = completion_channel();
        let handler = handler_with(control, module, 5, tx);

        handler
            .handle_circuit(circuit_event("C1", CircStatus::Built, false))
            .await;

        // Counted as built, but no worker can be launched without an exit
        assert_eq!(handler.stats().successful_circuits(), 1);
        assert_eq!(handler.workers().live_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_event_is_dropped() {
        let control = Arc::new(MockControl::default());
        let module = Arc::new(CountingProbe::default());
        let (tx, _rx) = completion_channel();
        let handler = handler_with(control, module, 5, tx);

        handler
            .handle_event(ControlEvent::Unknown("BW 1024 2048".into()))
            .await;

        assert_eq!(handler.stats().successful_circuits(), 0);
        assert_eq!(handler.attacher().pending_count(), 0);
    }
}
