//! Device discovery and matching
//!
//! Scans the host's candidate ports for the adapter with the wanted serial
//! number. Candidates without access permission are remembered so the
//! caller can retry once the host grants access.

use crate::transport::{DeviceCandidate, DeviceHost, Transport};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Hook invoked after the host granted access to a candidate
pub type PermissionListener = Arc<dyn Fn(&DeviceCandidate) + Send + Sync>;

/// Result of one discovery scan
pub enum MatchOutcome {
    /// An adapter was opened and identified
    Matched {
        transport: Box<dyn Transport>,
        candidate: DeviceCandidate,
        /// Serial to use for future scans
        serial: String,
    },
    /// Nothing matched, but this candidate is waiting for access
    PendingPermission(DeviceCandidate),
    /// Nothing matched
    NotFound,
}

impl fmt::Debug for MatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchOutcome::Matched {
                candidate, serial, ..
            } => f
                .debug_struct("Matched")
                .field("candidate", candidate)
                .field("serial", serial)
                .finish_non_exhaustive(),
            MatchOutcome::PendingPermission(candidate) => {
                f.debug_tuple("PendingPermission").field(candidate).finish()
            }
            MatchOutcome::NotFound => f.write_str("NotFound"),
        }
    }
}

/// State shared between the scan path and permission callbacks
#[derive(Default)]
struct MatcherState {
    /// Most recent candidate waiting for access
    pending: Option<DeviceCandidate>,
    /// Candidate selected by the last successful scan
    matched: Option<DeviceCandidate>,
    listener: Option<PermissionListener>,
    /// Bumped by `reset`; grants requested under an older value are ignored
    generation: u64,
}

/// Selects the adapter to talk to among the host's candidates
pub struct DeviceMatcher {
    host: Arc<dyn DeviceHost>,
    state: Arc<Mutex<MatcherState>>,
}

impl DeviceMatcher {
    pub fn new(host: Arc<dyn DeviceHost>) -> Self {
        Self {
            host,
            state: Arc::new(Mutex::new(MatcherState::default())),
        }
    }

    /// Scan all candidates for the adapter reporting `target_serial`.
    ///
    /// With an empty target and exactly one candidate, that candidate is
    /// accepted whatever serial it reports. Every opened candidate that is
    /// not selected is closed before the scan moves on.
    pub fn scan(&self, target_serial: &str) -> MatchOutcome {
        {
            let mut state = self.state.lock();
            state.pending = None;
            state.matched = None;
        }

        let candidates = self.host.list_candidates();
        if candidates.is_empty() {
            info!("No USB serial devices found");
            return MatchOutcome::NotFound;
        }

        info!(
            "Found {} USB serial device(s), looking for serial '{}'",
            candidates.len(),
            target_serial
        );
        for (index, candidate) in candidates.iter().enumerate() {
            info!("Device {}: {}", index + 1, candidate);
        }

        let use_first_available = target_serial.is_empty() && candidates.len() == 1;
        if use_first_available {
            info!("No serial requested and only one device present, will use it");
        }

        let mut last_pending = None;
        for mut candidate in candidates {
            if !self.host.has_permission(&candidate) {
                info!("{} has no access permission, requesting it", candidate);
                self.state.lock().pending = Some(candidate.clone());
                self.request_access(&candidate);
                last_pending = Some(candidate);
                continue;
            }

            let mut transport = match self.host.open(&candidate) {
                Ok(transport) => transport,
                Err(e) => {
                    warn!("Error opening {}: {}", candidate, e);
                    continue;
                }
            };

            let reported = match transport.serial_number() {
                Ok(serial) => serial,
                Err(e) => {
                    warn!("Error reading serial number of {}: {}", candidate, e);
                    close_quietly(transport.as_mut());
                    continue;
                }
            };
            info!("Opened {} with serial '{}'", candidate, reported);
            candidate.serial = Some(reported.clone());

            let is_match = reported == target_serial
                || (use_first_available && (reported.is_empty() || target_serial.is_empty()));
            if !is_match {
                info!(
                    "Not the device we're looking for (wanted '{}'), closing",
                    target_serial
                );
                close_quietly(transport.as_mut());
                continue;
            }

            let serial = if target_serial.is_empty() && !reported.is_empty() {
                reported
            } else {
                target_serial.to_string()
            };
            info!("Found matching device {}", candidate);
            {
                let mut state = self.state.lock();
                state.pending = None;
                state.matched = Some(candidate.clone());
            }
            return MatchOutcome::Matched {
                transport,
                candidate,
                serial,
            };
        }

        match last_pending {
            Some(candidate) => {
                info!("Waiting for user to grant permission for {}", candidate);
                MatchOutcome::PendingPermission(candidate)
            }
            None => {
                info!("Could not find or open USB device with serial '{}'", target_serial);
                MatchOutcome::NotFound
            }
        }
    }

    /// Candidate currently waiting for access, if any
    pub fn pending(&self) -> Option<DeviceCandidate> {
        self.state.lock().pending.clone()
    }

    /// Candidate selected by the last scan, if any
    pub fn matched(&self) -> Option<DeviceCandidate> {
        self.state.lock().matched.clone()
    }

    /// Permission status of the matched or pending candidate.
    ///
    /// Returns true when there is no candidate to gate on.
    pub fn has_permission(&self) -> bool {
        let candidate = {
            let state = self.state.lock();
            state.matched.clone().or_else(|| state.pending.clone())
        };
        match candidate {
            Some(candidate) => self.host.has_permission(&candidate),
            None => true,
        }
    }

    /// Ask the host again for access to the pending (or else matched) candidate
    pub fn request_permission(&self) {
        let (pending, matched) = {
            let state = self.state.lock();
            (state.pending.clone(), state.matched.clone())
        };
        if let Some(candidate) = pending {
            info!("Requesting permission for {}", candidate);
            self.request_access(&candidate);
        } else if let Some(candidate) = matched {
            info!("Requesting permission for connected device {}", candidate);
            self.request_access(&candidate);
        } else {
            info!("No device to request permission for");
        }
    }

    /// Register the hook run after a permission grant
    pub fn set_listener(&self, listener: PermissionListener) {
        self.state.lock().listener = Some(listener);
    }

    /// Forget the pending candidate and detach outstanding permission requests.
    ///
    /// Grants for requests made before the reset change nothing and do not
    /// reach the listener. The matched candidate is kept.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.pending = None;
        state.generation += 1;
    }

    fn request_access(&self, candidate: &DeviceCandidate) {
        let generation = self.state.lock().generation;
        let state = Arc::downgrade(&self.state);
        let granted = candidate.clone();
        self.host.request_permission(
            candidate,
            Box::new(move || on_granted(&state, &granted, generation)),
        );
    }
}

/// Permission callback: clears the pending candidate if the grant is for it
fn on_granted(state: &Weak<Mutex<MatcherState>>, granted: &DeviceCandidate, generation: u64) {
    let Some(state) = state.upgrade() else {
        debug!("Permission granted for {} after matcher was dropped", granted);
        return;
    };

    let listener = {
        let mut state = state.lock();
        if state.generation != generation {
            debug!("Ignoring permission grant for {} requested before reset", granted);
            return;
        }
        if state
            .pending
            .as_ref()
            .is_some_and(|pending| pending.same_port(granted))
        {
            info!("Permission granted for {}", granted);
            state.pending = None;
        } else {
            debug!("Ignoring stale permission grant for {}", granted);
        }
        state.listener.clone()
    };

    if let Some(listener) = listener {
        listener(granted);
    }
}

fn close_quietly(transport: &mut dyn Transport) {
    if let Err(e) = transport.close() {
        debug!("Ignoring close error: {}", e);
    }
}
