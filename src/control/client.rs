//! Control-port client
//!
//! A thin client for the overlay's text control protocol: it authenticates,
//! subscribes to circuit and stream events, requests circuits, and issues the
//! attach/close commands the scan engine needs. Asynchronous `650` event
//! lines are demultiplexed from synchronous command replies on a single
//! reader task; replies are matched to commands in FIFO order.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::{parse_event_line, ControlChannel, ControlEvent};
use crate::config::ControlConfig;
use crate::error::ControlError;

/// A complete reply to one control command
#[derive(Debug)]
struct Reply {
    /// Status code from the final reply line
    code: u16,
    /// All reply lines, final line last
    lines: Vec<String>,
}

impl Reply {
    fn is_ok(&self) -> bool {
        self.code == 250 || self.code == 251
    }

    fn text(&self) -> String {
        self.lines.join(" / ")
    }
}

/// Reply slots for outstanding commands, closed for good when the reader exits
#[derive(Default)]
struct ReplyQueue {
    closed: bool,
    slots: VecDeque<oneshot::Sender<Reply>>,
}

type PendingReplies = Arc<Mutex<ReplyQueue>>;

/// Control-port client
///
/// Cloneable via `Arc`; all commands are serialized through an internal
/// writer lock so replies match requests.
pub struct ControlClient {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: PendingReplies,
}

impl ControlClient {
    /// Connect, authenticate, and subscribe to CIRC/STREAM events
    ///
    /// Returns the client and the receiver for asynchronous control events.
    /// The controller is told to leave new streams unattached so the scan
    /// engine can bind each stream to its measurement circuit itself.
    ///
    /// # Errors
    ///
    /// Returns `ControlError` if the connection, authentication, or event
    /// subscription fails.
    pub async fn connect(
        config: &ControlConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ControlEvent>), ControlError> {
        let stream = TcpStream::connect(config.address).await.map_err(|e| {
            ControlError::ConnectError {
                addr: config.address.to_string(),
                reason: e.to_string(),
            }
        })?;

        let (read_half, write_half) = stream.into_split();

        let pending: PendingReplies = Arc::new(Mutex::new(ReplyQueue::default()));
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        tokio::spawn(read_loop(read_half, Arc::clone(&pending), event_tx));

        let client = Self {
            writer: tokio::sync::Mutex::new(write_half),
            pending,
        };

        client.authenticate(config.password.as_deref()).await?;

        client.command("SETEVENTS CIRC STREAM").await?;
        client.command("SETCONF __LeaveStreamsUnattached=1").await?;

        debug!("Control client connected to {}", config.address);

        Ok((client, event_rx))
    }

    /// Request a new circuit ending at the given exit relay
    ///
    /// The overlay picks the first hop unless `first_hop` pins one.
    ///
    /// # Errors
    ///
    /// Returns `ControlError` if the controller rejects the request.
    pub async fn build_circuit(
        &self,
        exit_fingerprint: &str,
        first_hop: Option<&str>,
    ) -> Result<String, ControlError> {
        let path = match first_hop {
            Some(hop) => format!("{hop},{exit_fingerprint}"),
            None => exit_fingerprint.to_string(),
        };
        let cmd = format!("EXTENDCIRCUIT 0 {path}");

        let reply = self.command(&cmd).await?;

        // Reply shape: "250 EXTENDED <circuit-id>"
        let line = reply.lines.last().map(String::as_str).unwrap_or_default();
        line.split_whitespace()
            .nth(1)
            .map(ToString::to_string)
            .ok_or_else(|| {
                ControlError::protocol(format!("Unparseable EXTENDCIRCUIT reply: {line}"))
            })
    }

    async fn authenticate(&self, password: Option<&str>) -> Result<(), ControlError> {
        let cmd = match password {
            Some(pw) => format!("AUTHENTICATE \"{}\"", pw.replace('\\', "\\\\").replace('"', "\\\"")),
            None => "AUTHENTICATE".to_string(),
        };

        match self.command(&cmd).await {
            Ok(_) => Ok(()),
            Err(ControlError::CommandFailed { reply, .. }) => Err(ControlError::AuthError(reply)),
            Err(e) => Err(e),
        }
    }

    /// Send one command and wait for its reply
    async fn command(&self, cmd: &str) -> Result<Reply, ControlError> {
        let (reply_tx, reply_rx) = oneshot::channel();

        // Register the reply slot and write the command under the same lock
        // so the FIFO pairing of commands and replies cannot be reordered.
        // A failed write takes the slot back out; leaving it queued would
        // pair every later reply one slot off. A queue already closed by the
        // reader means no reply can ever arrive.
        {
            let mut writer = self.writer.lock().await;

            {
                let mut pending = self.pending.lock();
                if pending.closed {
                    return Err(ControlError::ConnectionClosed);
                }
                pending.slots.push_back(reply_tx);
            }

            let written = async {
                writer.write_all(cmd.as_bytes()).await?;
                writer.write_all(b"\r\n").await?;
                writer.flush().await
            }
            .await;

            if let Err(e) = written {
                self.pending.lock().slots.pop_back();
                return Err(e.into());
            }
        }

        let reply = reply_rx
            .await
            .map_err(|_| ControlError::ConnectionClosed)?;

        if reply.is_ok() {
            Ok(reply)
        } else {
            // Only the verb is worth logging; arguments can be long
            let verb = cmd.split_whitespace().next().unwrap_or(cmd);
            Err(ControlError::command_failed(verb, reply.text()))
        }
    }
}

#[async_trait]
impl ControlChannel for ControlClient {
    async fn attach_stream(
        &self,
        stream_id: &str,
        circuit_id: &str,
    ) -> Result<(), ControlError> {
        self.command(&format!("ATTACHSTREAM {stream_id} {circuit_id}"))
            .await
            .map(|_| ())
    }

    async fn close_circuit(&self, circuit_id: &str) -> Result<(), ControlError> {
        self.command(&format!("CLOSECIRCUIT {circuit_id}"))
            .await
            .map(|_| ())
    }
}

/// Reader task: demultiplex event lines from command replies
///
/// Lines are classified by their status code and separator: `650 ` lines are
/// asynchronous events, everything else belongs to the reply of the oldest
/// outstanding command. A reply is complete at its `<code><space>` line;
/// `<code>-` and `<code>+` lines are continuations.
async fn read_loop(
    read_half: OwnedReadHalf,
    pending: PendingReplies,
    event_tx: mpsc::UnboundedSender<ControlEvent>,
) {
    let mut lines = BufReader::new(read_half).lines();
    let mut reply_lines: Vec<String> = Vec::new();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("Control connection closed by peer");
                break;
            }
            Err(e) => {
                warn!("Control connection read error: {}", e);
                break;
            }
        };

        if let Some(event_body) = line.strip_prefix("650 ") {
            if event_tx.send(parse_event_line(event_body)).is_err() {
                // The dispatcher is gone; keep draining so commands still work
                debug!("Event receiver dropped, discarding event");
            }
            continue;
        }

        // Multiline asynchronous events ("650-"/"650+") carry detail lines
        // this scanner does not use.
        if line.starts_with("650") {
            continue;
        }

        let is_final = line.len() >= 4
            && line.as_bytes()[..3].iter().all(u8::is_ascii_digit)
            && line.as_bytes()[3] == b' ';

        reply_lines.push(line);

        if is_final {
            let code = reply_lines
                .last()
                .and_then(|l| l[..3].parse().ok())
                .unwrap_or(0);
            let reply = Reply {
                code,
                lines: std::mem::take(&mut reply_lines),
            };

            match pending.lock().slots.pop_front() {
                Some(tx) => {
                    let _ = tx.send(reply);
                }
                None => warn!("Unsolicited control reply: {}", reply.text()),
            }
        }
    }

    // Fail any commands still waiting and refuse new ones: the senders are
    // dropped, which the command path maps to ConnectionClosed, and the
    // closed flag stops later commands from queueing slots nobody can serve.
    let mut pending = pending.lock();
    pending.closed = true;
    pending.slots.clear();
}
