//! Session Error Types

use std::fmt;
use std::io;
use thiserror::Error;

/// Errors reported by a transport handle
#[derive(Debug, Error)]
pub enum TransportError {
    /// I/O error from the underlying byte channel
    #[error("Transport I/O error: {0}")]
    Io(#[from] io::Error),

    /// The handle was closed or never opened
    #[error("Transport handle is closed")]
    Closed,

    /// Error reported by the serial driver
    #[error("Serial port error: {0}")]
    Serial(String),
}

impl TransportError {
    /// Whether a read that failed with this error may simply be retried.
    ///
    /// Slow adapters surface as timed-out or interrupted reads; those are
    /// treated like a read that returned no bytes.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }
}

impl From<tokio_serial::Error> for TransportError {
    fn from(err: tokio_serial::Error) -> Self {
        match err.kind() {
            tokio_serial::ErrorKind::Io(kind) => {
                TransportError::Io(io::Error::new(kind, err.description))
            }
            tokio_serial::ErrorKind::NoDevice => TransportError::Closed,
            _ => TransportError::Serial(err.description),
        }
    }
}

/// Why an active connection was declared lost
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LossReason {
    /// The reply did not complete within the total read budget
    Timeout { elapsed_ms: u64 },
    /// Writing the command failed
    Write(String),
    /// Reading the reply failed with an unrecoverable error
    Read(String),
    /// The handle was closed underneath the pump
    Closed,
}

impl fmt::Display for LossReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LossReason::Timeout { elapsed_ms } => write!(f, "read timeout after {}ms", elapsed_ms),
            LossReason::Write(msg) => write!(f, "write failed: {}", msg),
            LossReason::Read(msg) => write!(f, "read failed: {}", msg),
            LossReason::Closed => f.write_str("handle closed"),
        }
    }
}

/// Errors surfaced by the session facade
#[derive(Debug, Error)]
pub enum SessionError {
    /// No candidate matched and no permission is pending
    #[error("No USB adapter found (wanted serial '{target}')")]
    NotFound { target: String },

    /// A candidate is waiting for the host to grant access
    #[error("Waiting for permission to access {port}")]
    PermissionPending { port: String },

    /// Line parameters could not be applied to the matched adapter
    #[error("Failed to configure serial line: {0}")]
    Configuration(#[source] TransportError),

    /// The worker could not be started
    #[error("Failed to start I/O pump: {0}")]
    Spawn(#[source] io::Error),

    /// The connection died while a command was in flight
    #[error("Connection lost: {reason}")]
    ConnectionLost {
        reason: LossReason,
        /// Reply text received before the connection was lost
        partial: String,
    },

    /// A command was sent while no connection is active
    #[error("Not connected to an adapter")]
    NotConnected,

    /// A blocking call was made from a thread driving an async runtime
    #[error("Blocking session call from inside an async runtime; use spawn_blocking")]
    InsideRuntime,
}

impl SessionError {
    /// Whether the caller should retry `connect` once the host grants access
    pub fn is_permission_pending(&self) -> bool {
        matches!(self, SessionError::PermissionPending { .. })
    }

    /// Whether the error terminated an active session
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, SessionError::ConnectionLost { .. })
    }
}
