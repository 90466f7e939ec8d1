//! Scripted host and transport for tests

use crate::error::TransportError;
use crate::transport::{DeviceCandidate, DeviceHost, LineParams, PermissionCallback, Transport};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// One scripted result of a transport read
#[derive(Debug, Clone)]
pub enum ReadStep {
    Data(Vec<u8>),
    Empty,
    Error(io::ErrorKind),
    Closed,
}

impl ReadStep {
    pub fn text(text: &str) -> Self {
        ReadStep::Data(text.as_bytes().to_vec())
    }
}

/// Handle lifecycle events, in the order they happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    Open,
    Close,
}

/// A simulated USB adapter
pub struct MockDevice {
    pub candidate: DeviceCandidate,
    /// `None` makes the serial query fail
    serial: Option<String>,
    permitted: AtomicBool,
    fail_open: bool,
    fail_configure: bool,
    fail_write: bool,
    opens: AtomicUsize,
    closes: AtomicUsize,
    configures: AtomicUsize,
    permission_requests: AtomicUsize,
    reads: Mutex<VecDeque<ReadStep>>,
    responses: Mutex<HashMap<String, Vec<ReadStep>>>,
    written: Mutex<Vec<u8>>,
    events: Mutex<Vec<DeviceEvent>>,
    read_timeouts: Mutex<Vec<Duration>>,
    grants: Mutex<Vec<PermissionCallback>>,
}

impl MockDevice {
    pub fn new(port: &str, serial: &str) -> Self {
        Self {
            candidate: DeviceCandidate::new(0x0403, 0x6001, port),
            serial: Some(serial.to_string()),
            permitted: AtomicBool::new(true),
            fail_open: false,
            fail_configure: false,
            fail_write: false,
            opens: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            configures: AtomicUsize::new(0),
            permission_requests: AtomicUsize::new(0),
            reads: Mutex::new(VecDeque::new()),
            responses: Mutex::new(HashMap::new()),
            written: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
            read_timeouts: Mutex::new(Vec::new()),
            grants: Mutex::new(Vec::new()),
        }
    }

    pub fn without_permission(self) -> Self {
        self.permitted.store(false, Ordering::SeqCst);
        self
    }

    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    pub fn failing_serial(mut self) -> Self {
        self.serial = None;
        self
    }

    pub fn failing_configure(mut self) -> Self {
        self.fail_configure = true;
        self
    }

    pub fn failing_write(mut self) -> Self {
        self.fail_write = true;
        self
    }

    /// Reply with `steps` whenever `command` is written
    pub fn respond(self, command: &str, steps: Vec<ReadStep>) -> Self {
        self.responses.lock().insert(command.to_string(), steps);
        self
    }

    /// Queue read results independent of what is written
    pub fn push_reads(&self, steps: impl IntoIterator<Item = ReadStep>) {
        self.reads.lock().extend(steps);
    }

    pub fn written(&self) -> Vec<u8> {
        self.written.lock().clone()
    }

    pub fn events(&self) -> Vec<DeviceEvent> {
        self.events.lock().clone()
    }

    /// Timeout passed to every read so far
    pub fn read_timeouts(&self) -> Vec<Duration> {
        self.read_timeouts.lock().clone()
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn configures(&self) -> usize {
        self.configures.load(Ordering::SeqCst)
    }

    pub fn permission_requests(&self) -> usize {
        self.permission_requests.load(Ordering::SeqCst)
    }

    /// Grant access and fire every outstanding permission callback
    pub fn grant(&self) {
        self.permitted.store(true, Ordering::SeqCst);
        let callbacks: Vec<_> = self.grants.lock().drain(..).collect();
        for callback in callbacks {
            callback();
        }
    }
}

/// Host exposing a fixed list of simulated adapters
pub struct MockHost {
    devices: Vec<Arc<MockDevice>>,
}

impl MockHost {
    pub fn new(devices: Vec<MockDevice>) -> Arc<Self> {
        Arc::new(Self {
            devices: devices.into_iter().map(Arc::new).collect(),
        })
    }

    pub fn device(&self, index: usize) -> &Arc<MockDevice> {
        &self.devices[index]
    }

    fn find(&self, candidate: &DeviceCandidate) -> Option<&Arc<MockDevice>> {
        self.devices
            .iter()
            .find(|device| device.candidate.same_port(candidate))
    }
}

impl DeviceHost for MockHost {
    fn list_candidates(&self) -> Vec<DeviceCandidate> {
        self.devices
            .iter()
            .map(|device| device.candidate.clone())
            .collect()
    }

    fn has_permission(&self, candidate: &DeviceCandidate) -> bool {
        self.find(candidate)
            .map(|device| device.permitted.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    fn request_permission(&self, candidate: &DeviceCandidate, on_granted: PermissionCallback) {
        if let Some(device) = self.find(candidate) {
            device.permission_requests.fetch_add(1, Ordering::SeqCst);
            device.grants.lock().push(on_granted);
        }
    }

    fn open(&self, candidate: &DeviceCandidate) -> Result<Box<dyn Transport>, TransportError> {
        let device = self.find(candidate).ok_or(TransportError::Closed)?;
        if device.fail_open {
            return Err(TransportError::Io(io::ErrorKind::PermissionDenied.into()));
        }
        device.opens.fetch_add(1, Ordering::SeqCst);
        device.events.lock().push(DeviceEvent::Open);
        Ok(Box::new(MockTransport {
            device: Arc::clone(device),
            closed: false,
        }))
    }
}

/// Transport over a `MockDevice`
pub struct MockTransport {
    device: Arc<MockDevice>,
    closed: bool,
}

impl Transport for MockTransport {
    fn serial_number(&mut self) -> Result<String, TransportError> {
        self.device
            .serial
            .clone()
            .ok_or_else(|| TransportError::Io(io::ErrorKind::BrokenPipe.into()))
    }

    fn configure(&mut self, _params: &LineParams) -> Result<(), TransportError> {
        self.device.configures.fetch_add(1, Ordering::SeqCst);
        if self.device.fail_configure {
            return Err(TransportError::Serial("unsupported baud rate".to_string()));
        }
        Ok(())
    }

    fn write(&mut self, bytes: &[u8], _timeout: Duration) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        if self.device.fail_write {
            return Err(TransportError::Io(io::ErrorKind::BrokenPipe.into()));
        }
        self.device.written.lock().extend_from_slice(bytes);

        let command = String::from_utf8_lossy(bytes);
        let command = command.trim_end_matches('\r');
        if let Some(steps) = self.device.responses.lock().get(command) {
            self.device.reads.lock().extend(steps.iter().cloned());
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.device.read_timeouts.lock().push(timeout);
        let step = self.device.reads.lock().pop_front();
        match step {
            Some(ReadStep::Data(mut bytes)) => {
                if bytes.len() > buf.len() {
                    let rest = bytes.split_off(buf.len());
                    self.device.reads.lock().push_front(ReadStep::Data(rest));
                }
                buf[..bytes.len()].copy_from_slice(&bytes);
                Ok(bytes.len())
            }
            Some(ReadStep::Empty) => Ok(0),
            Some(ReadStep::Error(kind)) => Err(TransportError::Io(kind.into())),
            Some(ReadStep::Closed) => Err(TransportError::Closed),
            None => {
                // Silent line: behave like a read that timed out
                thread::sleep(timeout.min(Duration::from_millis(2)));
                Ok(0)
            }
        }
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if !self.closed {
            self.closed = true;
            self.device.closes.fetch_add(1, Ordering::SeqCst);
            self.device.events.lock().push(DeviceEvent::Close);
        }
        Ok(())
    }
}
