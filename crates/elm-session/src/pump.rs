//! I/O pump
//!
//! A dedicated worker thread owns the open adapter and runs one
//! write-then-read exchange per command. Replies end with the adapter's `>`
//! prompt; a reply that does not complete within the total budget, or any
//! unrecoverable transport error, declares the connection lost.

use crate::error::{LossReason, SessionError, TransportError};
use crate::framing::{COMMAND_TERMINATOR, PROMPT, PROMPT_TRAILER_LEN};
use crate::settings::PumpTimeouts;
use crate::state::ConnectionStateMachine;
use crate::transport::{LineParams, Transport};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Shortest timeout handed to a single read
const MIN_READ_TIMEOUT: Duration = Duration::from_millis(1);

/// Normalize one received chunk and detect the end of a reply.
///
/// Carriage returns become newlines. A chunk ending in the prompt completes
/// the reply: the prompt and the two characters in front of it are dropped.
/// Returns the text to append and whether the reply is complete.
pub fn frame_chunk(raw: &[u8]) -> (String, bool) {
    let mut text = String::from_utf8_lossy(raw).replace(COMMAND_TERMINATOR, "\n");
    if !text.ends_with(PROMPT) {
        return (text, false);
    }

    text.pop();
    let keep = text.chars().count().saturating_sub(PROMPT_TRAILER_LEN);
    (text.chars().take(keep).collect(), true)
}

/// Length of the prefix of `bytes` that does not stop inside a UTF-8 sequence.
///
/// Bytes past that point belong to a character the next read completes.
fn complete_prefix_len(bytes: &[u8]) -> usize {
    let tail_start = bytes.len().saturating_sub(3);
    for i in (tail_start..bytes.len()).rev() {
        let byte = bytes[i];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let width = match byte {
            0xF0..=0xFF => 4,
            0xE0..=0xEF => 3,
            0xC0..=0xDF => 2,
            _ => 1,
        };
        return if bytes.len() - i < width { i } else { bytes.len() };
    }
    bytes.len()
}

/// The open adapter handed to the pump after a successful connect
pub struct ActiveConnection {
    pub transport: Box<dyn Transport>,
    /// Serial number the adapter was matched with
    pub serial: String,
    pub params: LineParams,
}

struct Request {
    text: String,
    reply: oneshot::Sender<Result<String, SessionError>>,
}

/// Handle to the worker thread that owns an active connection
pub struct IoPump {
    requests: Option<mpsc::Sender<Request>>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    serial: String,
}

impl IoPump {
    /// Start the worker for `connection`.
    ///
    /// Connection loss is reported through `state`.
    pub fn spawn(
        connection: ActiveConnection,
        timeouts: PumpTimeouts,
        state: ConnectionStateMachine,
    ) -> Result<Self, SessionError> {
        let (tx, rx) = mpsc::channel::<Request>(1);
        let running = Arc::new(AtomicBool::new(true));
        let serial = connection.serial.clone();

        let worker = Worker {
            transport: connection.transport,
            timeouts,
            state,
            running: running.clone(),
            closed: false,
        };
        let handle = thread::Builder::new()
            .name("elm-io-pump".to_string())
            .spawn(move || worker.run(rx))
            .map_err(SessionError::Spawn)?;

        info!(
            "I/O pump started for adapter '{}' at {} baud",
            serial, connection.params.baud_rate
        );

        Ok(Self {
            requests: Some(tx),
            running,
            worker: Some(handle),
            serial,
        })
    }

    /// Send `text` to the adapter and wait for its reply.
    ///
    /// Blocks the calling thread. Called from a thread that drives a tokio
    /// runtime it fails with `SessionError::InsideRuntime` instead; async
    /// callers go through `tokio::task::spawn_blocking`.
    pub fn send_command(&self, text: &str) -> Result<String, SessionError> {
        if Handle::try_current().is_ok() {
            return Err(SessionError::InsideRuntime);
        }
        let requests = self.requests.as_ref().ok_or(SessionError::NotConnected)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        requests
            .blocking_send(Request {
                text: text.to_string(),
                reply: reply_tx,
            })
            .map_err(|_| SessionError::NotConnected)?;
        reply_rx
            .blocking_recv()
            .map_err(|_| SessionError::NotConnected)?
    }

    /// Whether the worker still serves requests
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop the worker, close the adapter and wait for the thread to exit
    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::Release);
        // Dropping the sender wakes a worker idling on the request channel
        self.requests.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("I/O pump worker panicked");
            }
            debug!("I/O pump for adapter '{}' joined", self.serial);
        }
    }
}

impl Drop for IoPump {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// State owned by the worker thread
struct Worker {
    transport: Box<dyn Transport>,
    timeouts: PumpTimeouts,
    state: ConnectionStateMachine,
    running: Arc<AtomicBool>,
    closed: bool,
}

impl Worker {
    fn run(mut self, mut requests: mpsc::Receiver<Request>) {
        while self.running.load(Ordering::Acquire) {
            let Some(request) = requests.blocking_recv() else {
                break;
            };

            let exchanged = panic::catch_unwind(AssertUnwindSafe(|| self.exchange(&request.text)));
            let result = match exchanged {
                Ok(result) => result,
                Err(_) => {
                    let reason = LossReason::Read("transport panicked".to_string());
                    Err(self.lose(reason, String::new()))
                }
            };
            let lost = matches!(result, Err(SessionError::ConnectionLost { .. }));
            if request.reply.send(result).is_err() {
                debug!("Caller went away before the reply was delivered");
            }
            if lost {
                break;
            }
        }

        self.close();
        debug!("I/O pump stopped");
    }

    fn exchange(&mut self, text: &str) -> Result<String, SessionError> {
        let mut bytes = Vec::with_capacity(text.len() + 1);
        bytes.extend_from_slice(text.as_bytes());
        bytes.push(COMMAND_TERMINATOR as u8);

        debug!("USB write {:?}", text);
        if let Err(e) = self.transport.write(&bytes, self.timeouts.write()) {
            return Err(self.lose(LossReason::Write(e.to_string()), String::new()));
        }

        self.read_reply()
    }

    fn read_reply(&mut self) -> Result<String, SessionError> {
        let mut reply = String::new();
        let mut buf = vec![0u8; self.timeouts.read_buffer_size];
        // Received bytes not yet decoded
        let mut carry = Vec::new();
        let start = Instant::now();

        loop {
            if !self.running.load(Ordering::Acquire) {
                return Err(SessionError::ConnectionLost {
                    reason: LossReason::Closed,
                    partial: reply,
                });
            }

            let remaining = self.timeouts.total().saturating_sub(start.elapsed());
            let timeout = self.timeouts.read().min(remaining).max(MIN_READ_TIMEOUT);
            match self.transport.read(&mut buf, timeout) {
                Ok(0) => thread::sleep(self.timeouts.idle_sleep()),
                Ok(n) => {
                    carry.extend_from_slice(&buf[..n]);
                    let cut = complete_prefix_len(&carry);
                    let (fragment, complete) = frame_chunk(&carry[..cut]);
                    carry.drain(..cut);
                    reply.push_str(&fragment);
                    if complete {
                        debug!("USB read {:?}", reply);
                        return Ok(reply);
                    }
                }
                Err(e) if e.is_transient() => {
                    warn!("USB read error: {}", e);
                    thread::sleep(self.timeouts.idle_sleep());
                }
                Err(TransportError::Closed) => {
                    return Err(self.lose(LossReason::Closed, reply));
                }
                Err(e) => {
                    return Err(self.lose(LossReason::Read(e.to_string()), reply));
                }
            }

            let elapsed = start.elapsed();
            if elapsed > self.timeouts.total() {
                let elapsed_ms = elapsed.as_millis() as u64;
                return Err(self.lose(LossReason::Timeout { elapsed_ms }, reply));
            }
        }
    }

    /// Declare the connection lost and release the adapter
    fn lose(&mut self, reason: LossReason, partial: String) -> SessionError {
        self.running.store(false, Ordering::Release);
        self.state.connection_lost(&reason.to_string());
        self.close();
        SessionError::ConnectionLost { reason, partial }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.transport.close() {
            debug!("Ignoring close error: {}", e);
        }
    }
}
