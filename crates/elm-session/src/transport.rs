//! Host and Transport Abstractions
//!
//! The host enumerates candidate ports and gates access to them; a transport
//! is one opened port with bounded-time reads and writes.

use crate::error::TransportError;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// A discoverable serial port that may be an ELM327 adapter
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct DeviceCandidate {
    /// USB vendor ID
    pub vendor_id: u16,
    /// USB product ID
    pub product_id: u16,
    /// Host handle reference (e.g., "/dev/ttyUSB0" or "COM3")
    pub port: String,
    /// Serial number of the device, once known (enumeration or opening)
    pub serial: Option<String>,
    /// Manufacturer string, if the host exposes one
    pub manufacturer: Option<String>,
    /// Product string, if the host exposes one
    pub product: Option<String>,
}

impl DeviceCandidate {
    /// Create a candidate from its USB IDs and port name
    pub fn new(vendor_id: u16, product_id: u16, port: impl Into<String>) -> Self {
        Self {
            vendor_id,
            product_id,
            port: port.into(),
            serial: None,
            manufacturer: None,
            product: None,
        }
    }

    /// Whether two candidates refer to the same physical port
    pub fn same_port(&self, other: &DeviceCandidate) -> bool {
        self.port == other.port
            && self.vendor_id == other.vendor_id
            && self.product_id == other.product_id
    }
}

impl fmt::Display for DeviceCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (VID 0x{:04x}, PID 0x{:04x})",
            self.port, self.vendor_id, self.product_id
        )
    }
}

/// Parity setting of a serial line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Parity {
    None,
    Odd,
    Even,
}

/// Serial line parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LineParams {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
}

impl LineParams {
    /// The only line setting ELM327 USB adapters are driven with: 38400-8-N-1
    pub const ELM327: LineParams = LineParams {
        baud_rate: 38400,
        data_bits: 8,
        stop_bits: 1,
        parity: Parity::None,
    };
}

impl Default for LineParams {
    fn default() -> Self {
        Self::ELM327
    }
}

/// An open byte channel to one adapter
///
/// Reads and writes block for at most the given timeout. A read that times
/// out without data returns `Ok(0)`.
pub trait Transport: Send {
    /// Serial identifier reported by the opened device (empty if it has none)
    fn serial_number(&mut self) -> Result<String, TransportError>;

    /// Apply line parameters
    fn configure(&mut self, params: &LineParams) -> Result<(), TransportError>;

    /// Write all bytes within `timeout`
    fn write(&mut self, bytes: &[u8], timeout: Duration) -> Result<(), TransportError>;

    /// Read up to `buf.len()` bytes, waiting at most `timeout`
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Release the handle. Closing twice is allowed.
    fn close(&mut self) -> Result<(), TransportError>;
}

/// Callback invoked by the host once access to a candidate is granted
pub type PermissionCallback = Box<dyn FnOnce() + Send + 'static>;

/// Host device enumeration and permission subsystem
pub trait DeviceHost: Send + Sync {
    /// All candidate ports currently attached, in enumeration order
    fn list_candidates(&self) -> Vec<DeviceCandidate>;

    /// Whether the process may open this candidate
    fn has_permission(&self, candidate: &DeviceCandidate) -> bool;

    /// Ask for access; `on_granted` fires asynchronously if access is granted
    fn request_permission(&self, candidate: &DeviceCandidate, on_granted: PermissionCallback);

    /// Open the candidate's port
    fn open(&self, candidate: &DeviceCandidate) -> Result<Box<dyn Transport>, TransportError>;
}
