use std::fmt;
use std::path::PathBuf;

use crate::types::SessionState;

/// Errors returned by the depthsync API.
///
/// Transient device conditions (no new frame, an init attempt failing) are
/// absorbed by the session and surfaced as state or events instead.
#[derive(Debug, thiserror::Error)]
pub enum DepthSyncError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration in {origin}: {message}")]
    Config { origin: String, message: String },

    #[error("Operation requires session state {expected:?}, session is {actual:?}")]
    InvalidState {
        expected: SessionState,
        actual: SessionState,
    },

    #[error("Session already started")]
    AlreadyStarted,

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Failed to spawn {name} thread: {source}")]
    ThreadSpawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Status reported by the depth camera for a single native call.
///
/// `Success` is the `Ok` side of [`DeviceResult`]; everything else lands here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    /// The camera has not produced a new frame since the last grab.
    #[error("not a new frame")]
    NotANewFrame,

    /// The camera was unplugged or never enumerated.
    #[error("camera not detected")]
    CameraNotDetected,

    /// Any other native status code.
    #[error("native status {0}")]
    Failed(i32),
}

impl DeviceError {
    /// C status code used across the FFI boundary. Zero means success.
    pub fn code(&self) -> i32 {
        match self {
            DeviceError::NotANewFrame => 1,
            DeviceError::CameraNotDetected => 2,
            DeviceError::Failed(code) => *code,
        }
    }

    /// Map a C status code back into a device result.
    pub fn from_code(code: i32) -> DeviceResult<()> {
        match code {
            0 => Ok(()),
            1 => Err(DeviceError::NotANewFrame),
            2 => Err(DeviceError::CameraNotDetected),
            other => Err(DeviceError::Failed(other)),
        }
    }
}

/// Result of a native device call.
pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Thread-safe last-error storage for the C FFI layer.
pub(crate) struct LastError {
    message: std::sync::Mutex<String>,
}

impl LastError {
    pub const fn new() -> Self {
        Self {
            message: std::sync::Mutex::new(String::new()),
        }
    }

    pub fn set(&self, err: &DepthSyncError) {
        if let Ok(mut msg) = self.message.lock() {
            *msg = fmt::format(format_args!("{}\0", err));
        }
    }

    pub fn clear(&self) {
        if let Ok(mut msg) = self.message.lock() {
            msg.clear();
        }
    }

    pub fn as_ptr(&self) -> *const std::ffi::c_char {
        match self.message.lock() {
            Ok(msg) if !msg.is_empty() => msg.as_ptr() as *const std::ffi::c_char,
            _ => std::ptr::null(),
        }
    }
}
