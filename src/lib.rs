//! # depthsync - stereo depth camera + HMD pose fusion
//!
//! Runs a stereo depth camera alongside a head-mounted display and produces
//! one latency-compensated camera transform per engine frame. Provides:
//! - Device session lifecycle with background, retrying camera init
//! - Single-slot frame handoff from a grab thread to the engine tick
//! - HMD pose history with timestamp lookup for latency correction
//! - Fusion of device tracking, head pose and a calibration offset
//! - C FFI for integration with C/C++/Unity engines
//!
//! ## Quick Start
//! ```no_run
//! use depthsync::sim::{SimulatedCamera, SimulatedHmd};
//! use depthsync::{Pose, Session, SessionConfig, SessionState};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let camera = Arc::new(SimulatedCamera::new());
//! let hmd = Arc::new(SimulatedHmd::present(Pose::from_translation(0.0, 1.6, 0.0)));
//! let session = Session::new(camera, hmd, SessionConfig::default());
//! session.start().unwrap();
//! session.wait_for_state(SessionState::Ready, Duration::from_secs(5));
//!
//! for _ in 0..100 {
//!     session.tick();
//!     let t = session.fused_transform();
//!     println!("{:?} {:?}", t.tracking_state, t.translation);
//!     std::thread::sleep(Duration::from_millis(11));
//! }
//! ```

pub mod error;
pub mod types;
pub mod device;
pub mod config;
pub mod calibration;
pub mod history;
pub mod drift;
pub mod frame;
pub mod pipeline;
pub mod events;
pub mod session;
pub mod sim;
pub mod ffi;

pub use calibration::{CalibrationOffset, CalibrationStore};
pub use config::{SessionConfig, TrackingFailurePolicy};
pub use device::{DepthCamera, Hmd, NoHmd};
pub use drift::DriftCorrector;
pub use error::{DepthSyncError, DeviceError, DeviceResult};
pub use events::{EventMask, SessionEvent, Subscription};
pub use history::{LatencyCorrector, PoseHistory};
pub use pipeline::{FrameAcquisitionPipeline, PipelineStats};
pub use session::{Session, SessionStatus};
pub use types::*;

/// Result type alias for depthsync operations.
pub type Result<T> = std::result::Result<T, DepthSyncError>;
