//! Worker launch and teardown
//!
//! One worker runs per built circuit, executing the configured probe module.
//! Workers are never awaited by the dispatcher: each one carries a
//! [`FinishGuard`] that pushes a finished message onto the completion channel
//! when the worker ends, whether the probe returned, panicked, or was
//! aborted at global shutdown. External commands launched by a probe run as
//! separate OS processes that die with their handle.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::process::Output;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::control::CircuitId;
use crate::error::WorkerError;
use crate::probe::ProbeModule;
use crate::torsocks;

/// A message from a worker on the completion channel
///
/// `payload` carries the worker's local connection endpoint when it is ready
/// to have a stream attached, or nothing to report that the worker finished.
#[derive(Debug, Clone)]
pub struct WorkerMessage {
    /// The circuit this worker measures through
    pub circuit_id: CircuitId,
    /// Local endpoint for attach-readiness; `None` means finished
    pub payload: Option<SocketAddr>,
}

impl WorkerMessage {
    /// "Ready to attach": the worker's connection originates from `endpoint`
    #[must_use]
    pub fn attach_ready(circuit_id: CircuitId, endpoint: SocketAddr) -> Self {
        Self {
            circuit_id,
            payload: Some(endpoint),
        }
    }

    /// "Finished": the worker is done with its circuit
    #[must_use]
    pub const fn finished(circuit_id: CircuitId) -> Self {
        Self {
            circuit_id,
            payload: None,
        }
    }
}

/// Sending side of the completion channel, held by every worker
pub type CompletionSender = mpsc::UnboundedSender<WorkerMessage>;

/// Receiving side of the completion channel, drained by the reader loop
pub type CompletionReceiver = mpsc::UnboundedReceiver<WorkerMessage>;

/// Create the completion channel
#[must_use]
pub fn completion_channel() -> (CompletionSender, CompletionReceiver) {
    mpsc::unbounded_channel()
}

/// Scoped finalizer guaranteeing exactly one finished message per worker
///
/// Sending from `Drop` covers normal return, panic unwinding, and task
/// abort alike, so a crashed or cancelled probe can never stall the
/// completion accounting. A send failure means the reader is already gone
/// at shutdown and is ignored.
struct FinishGuard {
    circuit_id: CircuitId,
    tx: CompletionSender,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        debug!("Informing completion reader that worker finished");
        let _ = self
            .tx
            .send(WorkerMessage::finished(self.circuit_id.clone()));
    }
}

/// Per-worker handle to the probe helpers
///
/// Scoped to one circuit and the shared completion channel, so a probe
/// module can signal attach-readiness or run proxied commands without
/// knowing about the matcher or statistics.
#[derive(Clone)]
pub struct ProbeContext {
    circuit_id: CircuitId,
    socks_addr: SocketAddr,
    tx: CompletionSender,
}

impl ProbeContext {
    /// Create a context scoped to one circuit
    #[must_use]
    pub fn new(circuit_id: CircuitId, socks_addr: SocketAddr, tx: CompletionSender) -> Self {
        Self {
            circuit_id,
            socks_addr,
            tx,
        }
    }

    /// The circuit this context is scoped to
    #[must_use]
    pub fn circuit_id(&self) -> &str {
        &self.circuit_id
    }

    /// Open a TCP connection to `host:port` through the local SOCKS proxy
    ///
    /// The connection's local endpoint is announced on the completion
    /// channel before the SOCKS request goes out: the request is what makes
    /// the overlay surface a new stream, and that stream stays unattached
    /// until the matcher binds it to this worker's circuit. Only then does
    /// the proxy reply and the handshake complete.
    ///
    /// # Errors
    ///
    /// Returns `WorkerError` if the proxy is unreachable or refuses the
    /// connection.
    pub async fn connect_over_proxy(
        &self,
        host: &str,
        port: u16,
    ) -> Result<TcpStream, WorkerError> {
        let mut stream = TcpStream::connect(self.socks_addr).await?;
        let local = stream.local_addr()?;

        self.signal_attach_ready(local);

        socks5_connect(&mut stream, host, port).await?;
        Ok(stream)
    }

    /// Run an external command wrapped to route through the SOCKS proxy
    ///
    /// The child's diagnostic output is scanned for the wrapper's
    /// connection notices; each one announces that connection's source port
    /// on the completion channel so the matcher can attach the resulting
    /// stream. The child is killed if this worker is terminated first.
    ///
    /// # Errors
    ///
    /// Returns `WorkerError` if the wrapper configuration cannot be written
    /// or the command cannot be spawned.
    pub async fn run_command(
        &self,
        program: &str,
        args: &[String],
    ) -> Result<Output, WorkerError> {
        let conf = torsocks::write_config(self.socks_addr)?;
        let mut cmd = torsocks::wrap_command(program, args, conf.path());
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| WorkerError::command(program, e.to_string()))?;

        let stderr = child.stderr.take();
        let stderr_task = stderr.map(|stderr| {
            let ctx = self.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                let mut collected = String::new();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(port) = torsocks::connection_source_port(&line) {
                        ctx.signal_attach_ready(SocketAddr::from(([127, 0, 0, 1], port)));
                    }
                    collected.push_str(&line);
                    collected.push('\n');
                }
                collected
            })
        });

        let mut stdout_buf = Vec::new();
        if let Some(mut stdout) = child.stdout.take() {
            stdout.read_to_end(&mut stdout_buf).await?;
        }

        let status = child
            .wait()
            .await
            .map_err(|e| WorkerError::command(program, e.to_string()))?;

        let stderr_buf = match stderr_task {
            Some(task) => task.await.unwrap_or_default().into_bytes(),
            None => Vec::new(),
        };

        Ok(Output {
            status,
            stdout: stdout_buf,
            stderr: stderr_buf,
        })
    }

    /// Announce on the completion channel that a connection from `endpoint`
    /// is ready to have its stream attached to this worker's circuit
    pub fn signal_attach_ready(&self, endpoint: SocketAddr) {
        let _ = self
            .tx
            .send(WorkerMessage::attach_ready(self.circuit_id.clone(), endpoint));
    }
}

/// The set of live workers, keyed by circuit id
///
/// Entries leave the set on self-reported finish (removed by the completion
/// reader) or when the decider force-terminates everything at shutdown.
#[derive(Default)]
pub struct WorkerSet {
    inner: Mutex<HashMap<CircuitId, JoinHandle<()>>>,
}

impl WorkerSet {
    /// Create an empty worker set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Launch one worker for `circuit_id` running the probe module
    ///
    /// The worker is not awaited; its completion is observed only through
    /// the completion channel or forced termination.
    pub fn spawn(
        &self,
        module: Arc<dyn ProbeModule>,
        exit_fingerprint: String,
        ctx: ProbeContext,
    ) {
        let circuit_id = ctx.circuit_id.clone();

        let mut inner = self.inner.lock();
        if inner.contains_key(&circuit_id) {
            warn!("Worker for circuit {} already running", circuit_id);
            return;
        }

        let tx = ctx.tx.clone();
        let task_circuit = circuit_id.clone();
        let task = tokio::spawn(async move {
            let _finish = FinishGuard {
                circuit_id: task_circuit.clone(),
                tx,
            };

            if let Err(e) = module.probe(&exit_fingerprint, &ctx).await {
                warn!("Probe for circuit {} failed: {}", task_circuit, e);
            }
        });

        inner.insert(circuit_id, task);
    }

    /// Drop the handle for a worker that reported finished
    pub fn remove(&self, circuit_id: &str) {
        self.inner.lock().remove(circuit_id);
    }

    /// Number of workers still live
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.inner.lock().len()
    }

    /// Force-terminate every still-live worker
    ///
    /// No grace period: tasks are aborted where they stand and any proxied
    /// child processes die with their dropped handles.
    pub fn terminate_all(&self) {
        let mut inner = self.inner.lock();
        for (circuit_id, task) in inner.drain() {
            debug!("Terminating remaining worker for circuit {}", circuit_id);
            task.abort();
        }
    }
}

/// Minimal SOCKS5 CONNECT handshake (no authentication, domain addressing)
async fn socks5_connect(
    stream: &mut TcpStream,
    host: &str,
    port: u16,
) -> Result<(), WorkerError> {
    if host.len() > 255 {
        return Err(WorkerError::SocksError(format!(
            "Hostname too long: {} bytes",
            host.len()
        )));
    }

    // Greeting: version 5, one method, no authentication
    stream.write_all(&[0x05, 0x01, 0x00]).await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice != [0x05, 0x00] {
        return Err(WorkerError::SocksError(format!(
            "Proxy rejected method negotiation: {choice:02x?}"
        )));
    }

    // CONNECT request with domain-name addressing
    let mut request = Vec::with_capacity(7 + host.len());
    request.extend_from_slice(&[0x05, 0x01, 0x00, 0x03, host.len() as u8]);
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    if reply[1] != 0x00 {
        return Err(WorkerError::SocksError(format!(
            "CONNECT failed with reply code {:#04x}",
            reply[1]
        )));
    }

    // Drain the bound address trailing the reply
    let addr_len = match reply[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            usize::from(len[0])
        }
        other => {
            return Err(WorkerError::SocksError(format!(
                "Unknown address type in reply: {other:#04x}"
            )));
        }
    };
    let mut addr = vec![0u8; addr_len + 2];
    stream.read_exact(&mut addr).await?;

    Ok(())
}
