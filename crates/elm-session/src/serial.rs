//! Desktop serial port host
//!
//! Enumerates USB serial ports through `tokio-serial`'s blocking
//! `serialport` API. Desktop systems have no permission dialog: access is
//! checked against the device node, and a permission request starts a
//! watcher thread that reports when access appears.

use crate::error::TransportError;
use crate::transport::{DeviceCandidate, DeviceHost, LineParams, Parity, PermissionCallback, Transport};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio_serial::{DataBits, SerialPort, SerialPortType, StopBits};
use tracing::{debug, error, info, warn};

/// Default poll interval of the permission watcher
const WATCH_INTERVAL_MS: u64 = 500;
/// How long a permission watcher waits before giving up
const WATCH_TIMEOUT_MS: u64 = 60_000;
/// Timeout used while opening a port
const OPEN_TIMEOUT_MS: u64 = 500;

/// `DeviceHost` backed by the operating system's serial ports
pub struct SerialPortHost {
    /// Ports with a running permission watcher
    watchers: Arc<Mutex<HashSet<String>>>,
    watch_interval: Duration,
    watch_timeout: Duration,
}

impl SerialPortHost {
    pub fn new() -> Self {
        Self {
            watchers: Arc::new(Mutex::new(HashSet::new())),
            watch_interval: Duration::from_millis(WATCH_INTERVAL_MS),
            watch_timeout: Duration::from_millis(WATCH_TIMEOUT_MS),
        }
    }

    /// Override how permission watchers poll for access
    pub fn with_watch_timing(mut self, interval: Duration, timeout: Duration) -> Self {
        self.watch_interval = interval;
        self.watch_timeout = timeout;
        self
    }
}

impl Default for SerialPortHost {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceHost for SerialPortHost {
    fn list_candidates(&self) -> Vec<DeviceCandidate> {
        let ports = match tokio_serial::available_ports() {
            Ok(ports) => ports,
            Err(e) => {
                warn!("Failed to enumerate serial ports: {}", e);
                return Vec::new();
            }
        };

        ports
            .into_iter()
            .filter_map(|port| match port.port_type {
                SerialPortType::UsbPort(usb) => Some(DeviceCandidate {
                    vendor_id: usb.vid,
                    product_id: usb.pid,
                    port: port.port_name,
                    serial: usb.serial_number,
                    manufacturer: usb.manufacturer,
                    product: usb.product,
                }),
                _ => {
                    debug!("Skipping non-USB port {}", port.port_name);
                    None
                }
            })
            .collect()
    }

    fn has_permission(&self, candidate: &DeviceCandidate) -> bool {
        has_access(&candidate.port)
    }

    fn request_permission(&self, candidate: &DeviceCandidate, on_granted: PermissionCallback) {
        if !self.watchers.lock().insert(candidate.port.clone()) {
            debug!("Already waiting for access to {}", candidate.port);
            return;
        }
        warn!(
            "No read/write access to {}; grant it (e.g. add the user to the port's group)",
            candidate.port
        );

        let watchers = Arc::clone(&self.watchers);
        let port = candidate.port.clone();
        let interval = self.watch_interval;
        let timeout = self.watch_timeout;
        let spawned = thread::Builder::new()
            .name("elm-permission-watch".to_string())
            .spawn(move || {
                let granted = wait_for_access(&port, interval, timeout);
                watchers.lock().remove(&port);
                if granted {
                    info!("Access to {} granted", port);
                    on_granted();
                } else {
                    warn!("Gave up waiting for access to {}", port);
                }
            });

        if let Err(e) = spawned {
            error!("Failed to start permission watcher: {}", e);
            self.watchers.lock().remove(&candidate.port);
        }
    }

    fn open(&self, candidate: &DeviceCandidate) -> Result<Box<dyn Transport>, TransportError> {
        let port = tokio_serial::new(candidate.port.as_str(), LineParams::ELM327.baud_rate)
            .timeout(Duration::from_millis(OPEN_TIMEOUT_MS))
            .open()?;
        debug!("Opened serial port {}", candidate.port);
        Ok(Box::new(SerialTransport::new(
            port,
            candidate.serial.clone().unwrap_or_default(),
        )))
    }
}

/// An open serial port
pub struct SerialTransport {
    port: Option<Box<dyn SerialPort>>,
    serial: String,
}

impl SerialTransport {
    pub fn new(port: Box<dyn SerialPort>, serial: String) -> Self {
        Self {
            port: Some(port),
            serial,
        }
    }

    fn port(&mut self) -> Result<&mut Box<dyn SerialPort>, TransportError> {
        self.port.as_mut().ok_or(TransportError::Closed)
    }
}

impl Transport for SerialTransport {
    fn serial_number(&mut self) -> Result<String, TransportError> {
        self.port()?;
        Ok(self.serial.clone())
    }

    fn configure(&mut self, params: &LineParams) -> Result<(), TransportError> {
        let port = self.port()?;
        port.set_baud_rate(params.baud_rate)?;
        port.set_data_bits(data_bits(params.data_bits))?;
        port.set_stop_bits(if params.stop_bits == 2 {
            StopBits::Two
        } else {
            StopBits::One
        })?;
        port.set_parity(match params.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        })?;
        Ok(())
    }

    fn write(&mut self, bytes: &[u8], timeout: Duration) -> Result<(), TransportError> {
        let port = self.port()?;
        port.set_timeout(timeout)?;
        port.write_all(bytes)?;
        port.flush()?;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        let port = self.port()?;
        port.set_timeout(timeout)?;
        match port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if self.port.take().is_some() {
            debug!("Closed serial port");
        }
        Ok(())
    }
}

fn data_bits(bits: u8) -> DataBits {
    match bits {
        5 => DataBits::Five,
        6 => DataBits::Six,
        7 => DataBits::Seven,
        _ => DataBits::Eight,
    }
}

fn wait_for_access(port: &str, interval: Duration, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if has_access(port) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(interval);
    }
}

/// Whether the process may read and write the device node
#[cfg(unix)]
fn has_access(port: &str) -> bool {
    let Ok(path) = std::ffi::CString::new(port) else {
        return false;
    };
    // SAFETY: `path` is a valid NUL-terminated string for the duration of the call
    unsafe { libc::access(path.as_ptr(), libc::R_OK | libc::W_OK) == 0 }
}

#[cfg(not(unix))]
fn has_access(_port: &str) -> bool {
    true
}
