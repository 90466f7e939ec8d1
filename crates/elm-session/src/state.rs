//! Connection lifecycle state machine

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionState {
    /// Idle: freshly created or explicitly disconnected
    None,
    /// A connect attempt is running, failed, or the connection was lost
    Disconnected,
    /// An I/O pump owns an open adapter
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::None => "none",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Shared connection state, observable through a watch channel.
///
/// Cloning yields another handle to the same state; the session keeps one
/// and the I/O pump keeps one to report a lost connection.
#[derive(Debug, Clone)]
pub struct ConnectionStateMachine {
    tx: Arc<watch::Sender<ConnectionState>>,
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::None);
        Self {
            tx: Arc::new(tx),
        }
    }

    /// Current state
    pub fn current(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    /// Receiver that observes every subsequent transition
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// A connect attempt starts
    pub fn begin_connect(&self) {
        self.set(ConnectionState::Disconnected);
    }

    /// The pump is running and owns the adapter
    pub fn connected(&self) {
        self.set(ConnectionState::Connected);
    }

    /// Explicit disconnect
    pub fn reset(&self) {
        self.set(ConnectionState::None);
    }

    /// The pump gave up on the connection.
    ///
    /// Only a `Connected` session can be lost; returns whether the state changed.
    pub fn connection_lost(&self, reason: &str) -> bool {
        let changed = self.tx.send_if_modified(|state| {
            if *state == ConnectionState::Connected {
                *state = ConnectionState::Disconnected;
                true
            } else {
                false
            }
        });
        if changed {
            info!("USB device connection was lost: {}", reason);
        } else {
            debug!("Ignoring connection loss outside of a session: {}", reason);
        }
        changed
    }

    fn set(&self, next: ConnectionState) {
        let previous = self.tx.send_replace(next);
        if previous != next {
            debug!("Connection state {} -> {}", previous, next);
        }
    }
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
