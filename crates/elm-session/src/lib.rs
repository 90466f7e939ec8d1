//! ELM327 USB Session Management
//!
//! This crate finds an ELM327-compatible adapter among the USB serial ports
//! of the host, opens it with the adapter's fixed line parameters and runs a
//! background I/O pump that exchanges `>`-terminated command/reply pairs.
//!
//! Command encoding and reply decoding are left to the caller: the session
//! moves opaque strings. Replies are decoded as UTF-8, lossily.
//!
//! `Session` calls block the calling thread. Async code runs them through
//! `tokio::task::spawn_blocking`; a call made on a runtime thread fails with
//! `SessionError::InsideRuntime`.

mod error;
mod matcher;
mod pump;
mod serial;
mod session;
mod settings;
mod state;
mod transport;

#[cfg(test)]
mod mock;

pub use error::{LossReason, SessionError, TransportError};
pub use matcher::{DeviceMatcher, MatchOutcome, PermissionListener};
pub use pump::{frame_chunk, ActiveConnection, IoPump};
pub use serial::{SerialPortHost, SerialTransport};
pub use session::Session;
pub use settings::{PumpTimeouts, SessionConfig};
pub use state::{ConnectionState, ConnectionStateMachine};
pub use transport::{DeviceCandidate, DeviceHost, LineParams, Parity, PermissionCallback, Transport};

/// ELM327 framing constants
pub mod framing {
    /// Appended to every outgoing command
    pub const COMMAND_TERMINATOR: char = '\r';
    /// Prompt character the adapter emits once a reply is complete
    pub const PROMPT: char = '>';
    /// Characters dropped in front of the prompt (the adapter's trailing line break)
    pub const PROMPT_TRAILER_LEN: usize = 2;
}
