//! Host-collaborator interfaces.
//!
//! Process/service control, window capture, and keystroke monitoring are
//! OS-capture concerns outside the protocol core. The core only fixes the
//! interface each collaborator must expose; concrete backends are injected
//! at startup, and hosts without a backend answer with a typed
//! `Unsupported` failure instead of lying about capability.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("{0} is not supported on this host")]
    Unsupported(&'static str),
    #[error("capture session is already running")]
    AlreadyActive,
    #[error("capture session is not running")]
    NotActive,
    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub username: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceInfo {
    pub name: String,
    pub status: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct WindowInfo {
    pub title: String,
    pub id: u64,
}

/// Where a completed window capture landed on disk.
#[derive(Debug, Clone, Serialize)]
pub struct CaptureArtifact {
    pub file_path: String,
    pub filename: String,
}

pub trait ProcessControl: Send + Sync {
    fn list(&self) -> Result<Vec<ProcessInfo>, CapabilityError>;
    fn kill(&self, pid: u32) -> Result<(), CapabilityError>;
}

pub trait ServiceControl: Send + Sync {
    fn list(&self) -> Result<Vec<ServiceInfo>, CapabilityError>;
    fn stop(&self, name: &str) -> Result<(), CapabilityError>;
}

pub trait ScreenCapture: Send + Sync {
    fn list_windows(&self) -> Result<Vec<WindowInfo>, CapabilityError>;
    fn capture_window(&self, id: u64) -> Result<CaptureArtifact, CapabilityError>;
}

pub trait KeystrokeMonitor: Send + Sync {
    fn start(&self) -> Result<(), CapabilityError>;
    /// Stops the session and clears the buffered log.
    fn stop(&self) -> Result<(), CapabilityError>;
    fn logs(&self) -> Result<String, CapabilityError>;
}

/// The collaborator set handed to the command registry.
#[derive(Clone)]
pub struct Capabilities {
    pub processes: Arc<dyn ProcessControl>,
    pub services: Arc<dyn ServiceControl>,
    pub capture: Arc<dyn ScreenCapture>,
    pub keylog: Arc<dyn KeystrokeMonitor>,
}

impl Capabilities {
    /// Wiring for hosts without any capture backend.
    pub fn unsupported() -> Self {
        let host = Arc::new(UnsupportedHost);
        Self {
            processes: host.clone(),
            services: host.clone(),
            capture: host.clone(),
            keylog: host,
        }
    }
}

/// Backend used when the build carries no platform integration.
pub struct UnsupportedHost;

impl ProcessControl for UnsupportedHost {
    fn list(&self) -> Result<Vec<ProcessInfo>, CapabilityError> {
        Err(CapabilityError::Unsupported("process enumeration"))
    }

    fn kill(&self, _pid: u32) -> Result<(), CapabilityError> {
        Err(CapabilityError::Unsupported("process termination"))
    }
}

impl ServiceControl for UnsupportedHost {
    fn list(&self) -> Result<Vec<ServiceInfo>, CapabilityError> {
        Err(CapabilityError::Unsupported("service enumeration"))
    }

    fn stop(&self, _name: &str) -> Result<(), CapabilityError> {
        Err(CapabilityError::Unsupported("service control"))
    }
}

impl ScreenCapture for UnsupportedHost {
    fn list_windows(&self) -> Result<Vec<WindowInfo>, CapabilityError> {
        Err(CapabilityError::Unsupported("window enumeration"))
    }

    fn capture_window(&self, _id: u64) -> Result<CaptureArtifact, CapabilityError> {
        Err(CapabilityError::Unsupported("window capture"))
    }
}

impl KeystrokeMonitor for UnsupportedHost {
    fn start(&self) -> Result<(), CapabilityError> {
        Err(CapabilityError::Unsupported("keystroke capture"))
    }

    fn stop(&self) -> Result<(), CapabilityError> {
        Err(CapabilityError::Unsupported("keystroke capture"))
    }

    fn logs(&self) -> Result<String, CapabilityError> {
        Err(CapabilityError::Unsupported("keystroke capture"))
    }
}

/// Buffered keystroke session state, independent of any capture source. A
/// platform backend feeds `record`; while inactive, recorded keys are
/// dropped.
#[derive(Default)]
pub struct KeylogBuffer {
    inner: Mutex<KeylogState>,
}

#[derive(Default)]
struct KeylogState {
    active: bool,
    keys: String,
}

impl KeylogBuffer {
    pub fn record(&self, key: &str) {
        let mut state = self.inner.lock();
        if state.active {
            state.keys.push_str(key);
        }
    }
}

impl KeystrokeMonitor for KeylogBuffer {
    fn start(&self) -> Result<(), CapabilityError> {
        let mut state = self.inner.lock();
        if state.active {
            return Err(CapabilityError::AlreadyActive);
        }
        state.active = true;
        Ok(())
    }

    fn stop(&self) -> Result<(), CapabilityError> {
        let mut state = self.inner.lock();
        if !state.active {
            return Err(CapabilityError::NotActive);
        }
        state.active = false;
        state.keys.clear();
        Ok(())
    }

    fn logs(&self) -> Result<String, CapabilityError> {
        Ok(self.inner.lock().keys.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keylog_buffer_drops_keys_while_inactive() {
        let buffer = KeylogBuffer::default();
        buffer.record("x");
        buffer.start().unwrap();
        buffer.record("a");
        buffer.record("b");
        assert_eq!(buffer.logs().unwrap(), "ab");
    }

    #[test]
    fn keylog_double_start_and_stop_are_typed_failures() {
        let buffer = KeylogBuffer::default();
        assert!(matches!(buffer.stop(), Err(CapabilityError::NotActive)));
        buffer.start().unwrap();
        assert!(matches!(buffer.start(), Err(CapabilityError::AlreadyActive)));
    }

    #[test]
    fn keylog_stop_clears_buffer() {
        let buffer = KeylogBuffer::default();
        buffer.start().unwrap();
        buffer.record("secret");
        buffer.stop().unwrap();
        buffer.start().unwrap();
        assert_eq!(buffer.logs().unwrap(), "");
    }
}
