//! Collaborator interfaces: the stereo depth camera SDK and the HMD runtime.
//!
//! Both are called from several threads (opening worker, tracking-init worker,
//! acquisition thread, consumer tick), so methods take `&self` and
//! implementations provide their own interior synchronization.

use std::path::Path;

use crate::error::DeviceResult;
use crate::types::{FrameImages, InitParameters, Pose, TrackingOptions, TrackingState};

/// Native calls into the stereo depth camera SDK.
pub trait DepthCamera: Send + Sync {
    /// Open the camera. Blocking; may take seconds on a cold USB bus.
    fn init(&self, params: &InitParameters) -> DeviceResult<()>;

    /// Capture and prepare the next frame. Blocking for at most one frame period.
    fn grab(&self) -> DeviceResult<()>;

    /// Capture time of the last successfully grabbed frame, nanoseconds.
    fn capture_timestamp(&self) -> u64;

    /// Current time on the camera clock, or `None` while the camera is not open.
    fn current_timestamp(&self) -> Option<u64>;

    /// Image handles of the last grabbed frame.
    fn images(&self) -> FrameImages;

    /// Start the camera's own positional tracking from `initial`.
    fn enable_tracking(
        &self,
        initial: &Pose,
        options: TrackingOptions,
        area_file: Option<&Path>,
    ) -> DeviceResult<()>;

    /// Tracking pose for the last grabbed frame.
    fn tracking_pose(&self) -> (Pose, TrackingState);

    /// Last known tracked position, valid even after the device disappears.
    fn position(&self) -> Pose;

    /// Release the camera. Safe to call when not open.
    fn close(&self);
}

/// Head tracking queries on the XR runtime.
pub trait Hmd: Send + Sync {
    fn is_present(&self) -> bool;

    /// Head pose relative to the tracking origin.
    fn head_local_pose(&self) -> Pose;
}

/// Stand-in used when no headset is attached.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHmd;

impl Hmd for NoHmd {
    fn is_present(&self) -> bool {
        false
    }

    fn head_local_pose(&self) -> Pose {
        Pose::identity()
    }
}
