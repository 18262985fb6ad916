//! Completion channel reader
//!
//! A single dedicated consumer drains the channel all workers report on.
//! Attach-readiness messages feed the rendezvous matcher with the circuit
//! half of a pairing; finished messages close the worker's circuit and
//! update the completion accounting. Either kind re-runs the completion
//! decider.

use std::sync::Arc;

use tracing::debug;

use super::attacher::PendingHalf;
use super::dispatcher::EventHandler;
use super::worker::CompletionReceiver;

/// Drain worker messages until every sender is gone
///
/// Runs for the lifetime of the scan. The loop ending because the channel
/// closed is the normal end of the producer population, not an error.
pub async fn run_completion_reader(mut rx: CompletionReceiver, handler: Arc<EventHandler>) {
    debug!("Starting completion channel reader");

    while let Some(msg) = rx.recv().await {
        match msg.payload {
            Some(endpoint) => {
                debug!(
                    "Read from completion channel: {}, {}",
                    msg.circuit_id, endpoint
                );
                handler
                    .attacher()
                    .prepare(endpoint.port(), PendingHalf::Circuit(msg.circuit_id))
                    .await;
                handler.check_finished().await;
            }
            None => {
                debug!("Closing finished circuit {}", msg.circuit_id);
                if let Err(e) = handler.control().close_circuit(&msg.circuit_id).await {
                    // Best-effort: the circuit may already be gone
                    debug!("Could not close circuit: {}", e);
                }

                handler.workers().remove(&msg.circuit_id);
                handler.stats().record_worker_finished();
                handler.check_finished().await;
            }
        }
    }

    debug!("Completion channel closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use crate::control::{CircuitId, ControlChannel, StreamId};
    use crate::error::{ControlError, WorkerError};
    use crate::probe::ProbeModule;
    use crate::scan::stats::ScanStats;
    use crate::scan::worker::{completion_channel, ProbeContext, WorkerMessage};

    #[derive(Default)]
    struct MockControl {
        attaches: Mutex<Vec<(StreamId, CircuitId)>>,
        closes: Mutex<Vec<CircuitId>>,
        reject_close: bool,
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
            if self.reject_close {
                Err(ControlError::command_failed(
                    "CLOSECIRCUIT",
                    "552 Unknown circuit",
                ))
            } else {
                Ok(())
            }
        }
    }

    struct NoopProbe;

    #[async_trait]
    impl ProbeModule for NoopProbe {
        async fn probe(
            &self,
            _exit_fingerprint: &str,
            _ctx: &ProbeContext,
        ) -> Result<(), WorkerError> {
            Ok(())
        }
    }

    fn handler_with(control: Arc<MockControl>, total: u64) -> (Arc<EventHandler>, CompletionReceiver) {
        let (tx, rx) = completion_channel();
        let handler = Arc::new(EventHandler::new(
            control as Arc<dyn ControlChannel>,
            Arc::new(NoopProbe),
            Arc::new(ScanStats::new(total)),
            "127.0.0.1:9050".parse().unwrap(),
            tx,
        ));
        (handler, rx)
    }

    #[tokio::test]
    async fn test_finished_message_closes_circuit_and_counts() {
        let control = Arc::new(MockControl::default());
        let (handler, rx) = handler_with(Arc::clone(&control), 5);

        let (tx, probe_rx) = completion_channel();
        drop(rx);
        let reader = tokio::spawn(run_completion_reader(probe_rx, Arc::clone(&handler)));

        tx.send(WorkerMessage::finished("C7".into())).unwrap();
        drop(tx);
        reader.await.unwrap();

        assert_eq!(control.closes.lock().clone(), vec!["C7".to_string()]);
        assert_eq!(handler.stats().finished_workers(), 1);
    }

    #[tokio::test]
    async fn test_attach_ready_message_feeds_matcher() {
        let control = Arc::new(MockControl::default());
        let (handler, rx) = handler_with(Arc::clone(&control), 5);

        let (tx, probe_rx) = completion_channel();
        drop(rx);
        let reader = tokio::spawn(run_completion_reader(probe_rx, Arc::clone(&handler)));

        tx.send(WorkerMessage::attach_ready(
            "C1".into(),
            "127.0.0.1:5000".parse().unwrap(),
        ))
        .unwrap();
        drop(tx);
        reader.await.unwrap();

        // The circuit half is parked, waiting for the stream event
        assert_eq!(handler.attacher().pending_count(), 1);
        assert!(control.attaches.lock().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_close_is_ignored() {
        let control = Arc::new(MockControl {
            reject_close: true,
            ..MockControl::default()
        });
        let (handler, rx) = handler_with(Arc::clone(&control), 5);

        let (tx, probe_rx) = completion_channel();
        drop(rx);
        let reader = tokio::spawn(run_completion_reader(probe_rx, Arc::clone(&handler)));

        tx.send(WorkerMessage::finished("C9".into())).unwrap();
        drop(tx);
        reader.await.unwrap();

        // The rejection is absorbed; the worker still counts as finished
        assert_eq!(handler.stats().finished_workers(), 1);
    }

    #[tokio::test]
    async fn test_reader_exits_when_channel_closes() {
        let control = Arc::new(MockControl::default());
        let (handler, rx) = handler_with(control, 5);

        let (tx, probe_rx) = completion_channel();
        drop(rx);
        let reader = tokio::spawn(run_completion_reader(probe_rx, handler));

        drop(tx);
        // All senders gone: the loop ends normally
        reader.await.unwrap();
    }
}
