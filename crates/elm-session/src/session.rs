//! Session facade
//!
//! Ties discovery, the connection state machine and the I/O pump together
//! behind a blocking connect / send / disconnect interface.

use crate::error::SessionError;
use crate::matcher::{DeviceMatcher, MatchOutcome, PermissionListener};
use crate::pump::{ActiveConnection, IoPump};
use crate::settings::{PumpTimeouts, SessionConfig};
use crate::state::{ConnectionState, ConnectionStateMachine};
use crate::transport::{DeviceCandidate, DeviceHost, LineParams};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// A request/response session with one ELM327 adapter
pub struct Session {
    matcher: DeviceMatcher,
    state: ConnectionStateMachine,
    pump: Option<IoPump>,
    /// Serial number used to select the adapter; pinned by the first match
    target_serial: String,
    timeouts: PumpTimeouts,
}

impl Session {
    /// Create an idle session on `host` with default settings
    pub fn new(host: Arc<dyn DeviceHost>) -> Self {
        Self::with_config(host, SessionConfig::default())
    }

    /// Create an idle session; `config.target_serial` is used by `reconnect`
    pub fn with_config(host: Arc<dyn DeviceHost>, config: SessionConfig) -> Self {
        Self {
            matcher: DeviceMatcher::new(host),
            state: ConnectionStateMachine::new(),
            pump: None,
            target_serial: config.target_serial,
            timeouts: config.timeouts,
        }
    }

    /// Find the adapter reporting `serial`, configure it and start the I/O pump.
    ///
    /// An empty `serial` accepts the only attached adapter and remembers
    /// its serial number for later reconnects.
    pub fn connect(&mut self, serial: &str) -> Result<(), SessionError> {
        self.stop_pump();
        self.state.begin_connect();
        self.target_serial = serial.to_string();

        let (mut transport, candidate, resolved) = match self.matcher.scan(serial) {
            MatchOutcome::Matched {
                transport,
                candidate,
                serial,
            } => (transport, candidate, serial),
            MatchOutcome::PendingPermission(candidate) => {
                return Err(SessionError::PermissionPending {
                    port: candidate.port,
                });
            }
            MatchOutcome::NotFound => {
                return Err(SessionError::NotFound {
                    target: serial.to_string(),
                });
            }
        };
        self.target_serial = resolved;

        let params = LineParams::ELM327;
        if let Err(e) = transport.configure(&params) {
            error!("Error setting port parameters on {}: {}", candidate, e);
            if let Err(close_err) = transport.close() {
                debug!("Ignoring close error: {}", close_err);
            }
            return Err(SessionError::Configuration(e));
        }

        let connection = ActiveConnection {
            transport,
            serial: self.target_serial.clone(),
            params,
        };
        let pump = IoPump::spawn(connection, self.timeouts, self.state.clone())?;
        self.pump = Some(pump);
        self.state.connected();
        info!("Interface successfully connected to {}", candidate);
        Ok(())
    }

    /// Disconnect, then connect again to the last resolved adapter
    pub fn reconnect(&mut self) -> Result<(), SessionError> {
        self.disconnect();
        let serial = self.target_serial.clone();
        self.connect(&serial)
    }

    /// Stop the I/O pump and release the adapter. Safe to call repeatedly.
    ///
    /// Permission requests still outstanding are detached: a later grant
    /// does not reach the permission listener.
    pub fn disconnect(&mut self) {
        if self.stop_pump() {
            info!("Disconnected from adapter '{}'", self.target_serial);
        }
        self.matcher.reset();
        self.state.reset();
    }

    /// Send one command and wait for the adapter's reply.
    ///
    /// The terminating carriage return is appended here. Fails without
    /// touching the adapter if the session is not connected.
    ///
    /// This blocks for up to the total reply timeout. From async code, run
    /// it on a blocking thread (`tokio::task::spawn_blocking`); called on a
    /// runtime thread it returns `SessionError::InsideRuntime`.
    pub fn send_command(&self, text: &str) -> Result<String, SessionError> {
        if self.state.current() != ConnectionState::Connected {
            return Err(SessionError::NotConnected);
        }
        let pump = self.pump.as_ref().ok_or(SessionError::NotConnected)?;
        pump.send_command(text)
    }

    /// Whether access to the matched or pending adapter is granted
    pub fn has_permission(&self) -> bool {
        self.matcher.has_permission()
    }

    /// Ask the host again for access to the pending or matched adapter
    pub fn request_permission(&self) {
        self.matcher.request_permission();
    }

    /// Run `listener` whenever the host grants access to a candidate
    pub fn set_permission_listener<F>(&self, listener: F)
    where
        F: Fn(&DeviceCandidate) + Send + Sync + 'static,
    {
        let listener: PermissionListener = Arc::new(listener);
        self.matcher.set_listener(listener);
    }

    pub fn state(&self) -> ConnectionState {
        self.state.current()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Observe state transitions
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Serial number used to select the adapter
    pub fn target_serial(&self) -> &str {
        &self.target_serial
    }

    /// Shut down the pump, if any; returns whether one was running
    fn stop_pump(&mut self) -> bool {
        match self.pump.take() {
            Some(mut pump) => {
                pump.shutdown();
                true
            }
            None => false,
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop_pump();
    }
}
