//! C FFI layer for depthsync.
//!
//! The host engine supplies its camera SDK and XR runtime as vtables of
//! function pointers, and reads the fused transform back through an opaque
//! session handle. The generated C header is written to
//! `include/depthsync.h` by cbindgen.
//!
//! Vtable callbacks are invoked from depthsync's own threads (opening,
//! tracking init, acquisition) as well as from `ds_session_tick`; the host
//! must make them thread-safe.

use std::collections::HashMap;
use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use nalgebra::{Quaternion, UnitQuaternion, Vector3};

use crate::calibration::CalibrationOffset;
use crate::config::SessionConfig;
use crate::device::{DepthCamera, Hmd, NoHmd};
use crate::error::{DeviceError, DeviceResult, LastError};
use crate::events::{EventMask, SessionEvent, Subscription};
use crate::session::Session;
use crate::types::{
    FrameImages, FusedTransform, ImageHandle, InitParameters, Pose, PoseSource, SessionState,
    TrackingOptions, TrackingState,
};

/// Last error message for C consumers.
static LAST_ERROR: LastError = LastError::new();

/// Rigid transform in C-compatible layout.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct DsPose {
    /// Translation [x, y, z] in meters.
    pub translation: [f64; 3],
    /// Quaternion [qx, qy, qz, qw].
    pub rotation: [f64; 4],
}

impl From<Pose> for DsPose {
    fn from(pose: Pose) -> Self {
        DsPose {
            translation: [pose.translation.x, pose.translation.y, pose.translation.z],
            rotation: pose.quaternion_xyzw(),
        }
    }
}

impl From<DsPose> for Pose {
    fn from(p: DsPose) -> Self {
        let [x, y, z, w] = p.rotation;
        let q = Quaternion::new(w, x, y, z);
        // A zeroed struct from C means "no rotation".
        let rotation = if q.norm() > 1e-9 {
            UnitQuaternion::from_quaternion(q)
        } else {
            UnitQuaternion::identity()
        };
        Pose::new(Vector3::from(p.translation), rotation)
    }
}

/// Fused camera transform for renderers.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DsFusedTransform {
    pub translation: [f64; 3],
    /// Quaternion [qx, qy, qz, qw].
    pub rotation: [f64; 4],
    pub tracking_state: TrackingState,
    pub source: PoseSource,
}

impl From<FusedTransform> for DsFusedTransform {
    fn from(f: FusedTransform) -> Self {
        let pose = DsPose::from(f.pose());
        DsFusedTransform {
            translation: pose.translation,
            rotation: pose.rotation,
            tracking_state: f.tracking_state,
            source: f.source,
        }
    }
}

/// Frame consumed by `ds_session_tick`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DsFrame {
    pub capture_timestamp_ns: u64,
    pub left_image: u64,
    pub right_image: u64,
    pub tracking_pose: DsPose,
    pub tracking_state: TrackingState,
}

/// Camera init parameters as handed to the host's `init` callback.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DsInitParameters {
    /// 0 = HD2K, 1 = HD1080, 2 = HD720, 3 = VGA.
    pub resolution: u32,
    pub fps: u32,
    /// 0 = none, 1 = performance, 2 = quality, 3 = ultra.
    pub depth_mode: u32,
    pub depth_minimum_distance: f32,
    pub enable_right_side_measure: bool,
    pub depth_stabilization: bool,
}

impl From<&InitParameters> for DsInitParameters {
    fn from(p: &InitParameters) -> Self {
        use crate::types::{DepthMode, Resolution};
        DsInitParameters {
            resolution: match p.resolution {
                Resolution::Hd2k => 0,
                Resolution::Hd1080 => 1,
                Resolution::Hd720 => 2,
                Resolution::Vga => 3,
            },
            fps: p.fps,
            depth_mode: match p.depth_mode {
                DepthMode::None => 0,
                DepthMode::Performance => 1,
                DepthMode::Quality => 2,
                DepthMode::Ultra => 3,
            },
            depth_minimum_distance: p.depth_minimum_distance,
            enable_right_side_measure: p.enable_right_side_measure,
            depth_stabilization: p.depth_stabilization,
        }
    }
}

/// Depth camera callbacks. Status codes: 0 success, 1 not a new frame,
/// 2 camera not detected, anything else a native error.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct DsCameraVTable {
    pub user_data: *mut c_void,
    pub init: Option<unsafe extern "C" fn(*mut c_void, *const DsInitParameters) -> c_int>,
    pub grab: Option<unsafe extern "C" fn(*mut c_void) -> c_int>,
    pub capture_timestamp: Option<unsafe extern "C" fn(*mut c_void) -> u64>,
    /// Current camera clock; 0 while not available.
    pub current_timestamp: Option<unsafe extern "C" fn(*mut c_void) -> u64>,
    pub images: Option<unsafe extern "C" fn(*mut c_void, *mut u64, *mut u64)>,
    /// `area_file` is NULL when no area file is used.
    pub enable_tracking: Option<
        unsafe extern "C" fn(*mut c_void, *const DsPose, u32, *const c_char) -> c_int,
    >,
    /// Returns the tracking state: 0 off, 1 tracking, 2 searching.
    pub tracking_pose: Option<unsafe extern "C" fn(*mut c_void, *mut DsPose) -> c_int>,
    pub position: Option<unsafe extern "C" fn(*mut c_void, *mut DsPose)>,
    pub close: Option<unsafe extern "C" fn(*mut c_void)>,
}

/// Headset callbacks.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct DsHmdVTable {
    pub user_data: *mut c_void,
    pub is_present: Option<unsafe extern "C" fn(*mut c_void) -> bool>,
    pub head_local_pose: Option<unsafe extern "C" fn(*mut c_void, *mut DsPose)>,
}

/// Event delivered by `ds_session_poll_event`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct DsEvent {
    /// One `EventMask` bit.
    pub kind: u32,
    /// Init attempts, for OPENING_ABANDONED.
    pub attempts: u32,
    /// New offset, for CALIBRATION_CHANGED.
    pub calibration: DsPose,
}

impl From<&SessionEvent> for DsEvent {
    fn from(event: &SessionEvent) -> Self {
        let mut out = DsEvent {
            kind: event.kind().bits(),
            ..DsEvent::default()
        };
        match event {
            SessionEvent::OpeningAbandoned { attempts } => out.attempts = *attempts,
            SessionEvent::CalibrationChanged(offset) => out.calibration = offset.as_pose().into(),
            _ => {}
        }
        out
    }
}

struct FfiCamera(DsCameraVTable);

// The host guarantees its callbacks and user data may be used from any thread.
unsafe impl Send for FfiCamera {}
unsafe impl Sync for FfiCamera {}

impl DepthCamera for FfiCamera {
    fn init(&self, params: &InitParameters) -> DeviceResult<()> {
        let params = DsInitParameters::from(params);
        match self.0.init {
            Some(f) => DeviceError::from_code(unsafe { f(self.0.user_data, &params) }),
            None => Ok(()),
        }
    }

    fn grab(&self) -> DeviceResult<()> {
        match self.0.grab {
            Some(f) => DeviceError::from_code(unsafe { f(self.0.user_data) }),
            None => Err(DeviceError::CameraNotDetected),
        }
    }

    fn capture_timestamp(&self) -> u64 {
        self.0
            .capture_timestamp
            .map_or(0, |f| unsafe { f(self.0.user_data) })
    }

    fn current_timestamp(&self) -> Option<u64> {
        let ts = self
            .0
            .current_timestamp
            .map_or(0, |f| unsafe { f(self.0.user_data) });
        (ts != 0).then_some(ts)
    }

    fn images(&self) -> FrameImages {
        let (mut left, mut right) = (0u64, 0u64);
        if let Some(f) = self.0.images {
            unsafe { f(self.0.user_data, &mut left, &mut right) };
        }
        FrameImages {
            left: ImageHandle(left),
            right: ImageHandle(right),
        }
    }

    fn enable_tracking(
        &self,
        initial: &Pose,
        options: TrackingOptions,
        area_file: Option<&Path>,
    ) -> DeviceResult<()> {
        let Some(f) = self.0.enable_tracking else {
            return Ok(());
        };
        let area = area_file.and_then(|p| CString::new(p.to_string_lossy().as_bytes()).ok());
        let initial = DsPose::from(*initial);
        let area_ptr = area.as_ref().map_or(std::ptr::null(), |c| c.as_ptr());
        DeviceError::from_code(unsafe { f(self.0.user_data, &initial, options.bits(), area_ptr) })
    }

    fn tracking_pose(&self) -> (Pose, TrackingState) {
        let Some(f) = self.0.tracking_pose else {
            return (Pose::identity(), TrackingState::Off);
        };
        let mut out = DsPose::default();
        let state = unsafe { f(self.0.user_data, &mut out) };
        (Pose::from(out), tracking_state_from_c(state))
    }

    fn position(&self) -> Pose {
        let mut out = DsPose::default();
        if let Some(f) = self.0.position {
            unsafe { f(self.0.user_data, &mut out) };
        }
        Pose::from(out)
    }

    fn close(&self) {
        if let Some(f) = self.0.close {
            unsafe { f(self.0.user_data) };
        }
    }
}

struct FfiHmd(DsHmdVTable);

unsafe impl Send for FfiHmd {}
unsafe impl Sync for FfiHmd {}

impl Hmd for FfiHmd {
    fn is_present(&self) -> bool {
        self.0
            .is_present
            .is_some_and(|f| unsafe { f(self.0.user_data) })
    }

    fn head_local_pose(&self) -> Pose {
        let mut out = DsPose::default();
        if let Some(f) = self.0.head_local_pose {
            unsafe { f(self.0.user_data, &mut out) };
        }
        Pose::from(out)
    }
}

fn tracking_state_from_c(state: c_int) -> TrackingState {
    match state {
        1 => TrackingState::Tracking,
        2 => TrackingState::Searching,
        _ => TrackingState::Off,
    }
}

/// Opaque session handle for C consumers.
pub struct DsSession {
    session: Session,
    subscriptions: Mutex<HashMap<u64, Subscription>>,
}

/// Create a session.
///
/// `hmd` may be NULL when no headset is used. `config_path` may be NULL to
/// use defaults plus `DEPTHSYNC_*` environment overrides.
/// Returns NULL on error (check ds_last_error()).
///
/// # Safety
/// `camera` must point to a valid `DsCameraVTable`; `hmd` and `config_path`
/// must be valid or null. The vtables are copied.
#[no_mangle]
pub unsafe extern "C" fn ds_session_new(
    camera: *const DsCameraVTable,
    hmd: *const DsHmdVTable,
    config_path: *const c_char,
) -> *mut DsSession {
    if camera.is_null() {
        return std::ptr::null_mut();
    }
    let config = if config_path.is_null() {
        SessionConfig::from_env()
    } else {
        let path = PathBuf::from(CStr::from_ptr(config_path).to_string_lossy().into_owned());
        SessionConfig::load(&path)
    };
    let config = match config {
        Ok(c) => c,
        Err(e) => {
            LAST_ERROR.set(&e);
            return std::ptr::null_mut();
        }
    };

    let camera: Arc<dyn DepthCamera> = Arc::new(FfiCamera(*camera));
    let hmd: Arc<dyn Hmd> = if hmd.is_null() {
        Arc::new(NoHmd)
    } else {
        Arc::new(FfiHmd(*hmd))
    };
    LAST_ERROR.clear();
    Box::into_raw(Box::new(DsSession {
        session: Session::new(camera, hmd, config),
        subscriptions: Mutex::new(HashMap::new()),
    }))
}

/// Stop the session and free it.
///
/// # Safety
/// `session` must be a pointer returned by `ds_session_new`, or null.
#[no_mangle]
pub unsafe extern "C" fn ds_session_free(session: *mut DsSession) {
    if !session.is_null() {
        drop(Box::from_raw(session));
    }
}

fn status_from(result: crate::Result<()>) -> c_int {
    match result {
        Ok(()) => 0,
        Err(e) => {
            LAST_ERROR.set(&e);
            -1
        }
    }
}

/// Start opening the camera in the background. Returns 0 on success, -1 on error.
///
/// # Safety
/// `session` must be a valid session pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn ds_session_start(session: *const DsSession) -> c_int {
    match session.as_ref() {
        Some(s) => status_from(s.session.start()),
        None => -1,
    }
}

/// Stop all session threads. Blocks until they have exited.
///
/// # Safety
/// `session` must be a valid session pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn ds_session_stop(session: *const DsSession) {
    if let Some(s) = session.as_ref() {
        s.session.stop();
    }
}

/// Restart the session, resuming tracking from the last known position.
/// Returns 0 on success, -1 on error.
///
/// # Safety
/// `session` must be a valid session pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn ds_session_reset(session: *const DsSession) -> c_int {
    match session.as_ref() {
        Some(s) => status_from(s.session.reset()),
        None => -1,
    }
}

/// Per-frame update. Returns 1 and fills `frame` (if non-null) when a new
/// frame was consumed, 0 otherwise, -1 on a null session.
///
/// # Safety
/// `session` must be a valid session pointer, or null; `frame` valid or null.
#[no_mangle]
pub unsafe extern "C" fn ds_session_tick(session: *const DsSession, frame: *mut DsFrame) -> c_int {
    let Some(s) = session.as_ref() else {
        return -1;
    };
    match s.session.tick() {
        Some(f) => {
            if !frame.is_null() {
                frame.write(DsFrame {
                    capture_timestamp_ns: f.capture_timestamp_ns,
                    left_image: f.images.left.0,
                    right_image: f.images.right.0,
                    tracking_pose: f.tracking_pose.into(),
                    tracking_state: f.tracking_state,
                });
            }
            1
        }
        None => 0,
    }
}

/// # Safety
/// `session` must be a valid session pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn ds_session_is_ready(session: *const DsSession) -> bool {
    session.as_ref().is_some_and(|s| s.session.is_ready())
}

/// # Safety
/// `session` must be a valid session pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn ds_session_state(session: *const DsSession) -> SessionState {
    session
        .as_ref()
        .map_or(SessionState::Uninitialized, |s| s.session.state())
}

/// Failed init attempts since the last start.
///
/// # Safety
/// `session` must be a valid session pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn ds_session_retry_count(session: *const DsSession) -> u32 {
    session.as_ref().map_or(0, |s| s.session.retry_count())
}

/// Most recent camera status code, 0 if the last call succeeded.
///
/// # Safety
/// `session` must be a valid session pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn ds_session_last_status(session: *const DsSession) -> c_int {
    session
        .as_ref()
        .and_then(|s| s.session.last_status())
        .map_or(0, |e| e.code())
}

/// Write the current fused transform. Returns 0 on success, -1 on null arguments.
///
/// # Safety
/// `session` and `out` must be valid pointers, or null.
#[no_mangle]
pub unsafe extern "C" fn ds_session_fused_transform(
    session: *const DsSession,
    out: *mut DsFusedTransform,
) -> c_int {
    let Some(s) = session.as_ref() else {
        return -1;
    };
    if out.is_null() {
        return -1;
    }
    out.write(s.session.fused_transform().into());
    0
}

/// Capture timestamp of the frame used for fusion, 0 before the first frame.
///
/// # Safety
/// `session` must be a valid session pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn ds_session_image_timestamp(session: *const DsSession) -> u64 {
    session.as_ref().map_or(0, |s| s.session.image_timestamp_ns())
}

/// Replace the HMD-to-camera calibration offset.
///
/// # Safety
/// `session` and `offset` must be valid pointers, or null.
#[no_mangle]
pub unsafe extern "C" fn ds_session_set_calibration(
    session: *const DsSession,
    offset: *const DsPose,
) -> c_int {
    let (Some(s), Some(offset)) = (session.as_ref(), offset.as_ref()) else {
        return -1;
    };
    s.session
        .set_calibration_transform(CalibrationOffset::from(Pose::from(*offset)));
    0
}

/// Re-read the calibration file. Returns 1 if the offset changed, 0 if not,
/// -1 on error.
///
/// # Safety
/// `session` must be a valid session pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn ds_session_reload_calibration(session: *const DsSession) -> c_int {
    let Some(s) = session.as_ref() else {
        return -1;
    };
    match s.session.reload_calibration() {
        Ok(changed) => changed as c_int,
        Err(e) => {
            LAST_ERROR.set(&e);
            -1
        }
    }
}

/// Subscribe to the events in `mask`. Returns a subscription id.
///
/// # Safety
/// `session` must be a valid session pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn ds_session_subscribe(session: *const DsSession, mask: u32) -> u64 {
    let Some(s) = session.as_ref() else {
        return u64::MAX;
    };
    let sub = s.session.subscribe(EventMask::from_bits_truncate(mask));
    let id = sub.id().as_u64();
    s.subscriptions
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(id, sub);
    id
}

/// Take the next queued event for `subscription`. Returns 1 if `out` was
/// written, 0 if nothing is queued, -1 on an unknown subscription.
///
/// # Safety
/// `session` and `out` must be valid pointers, or null.
#[no_mangle]
pub unsafe extern "C" fn ds_session_poll_event(
    session: *const DsSession,
    subscription: u64,
    out: *mut DsEvent,
) -> c_int {
    let Some(s) = session.as_ref() else {
        return -1;
    };
    if out.is_null() {
        return -1;
    }
    let subs = s.subscriptions.lock().unwrap_or_else(PoisonError::into_inner);
    let Some(sub) = subs.get(&subscription) else {
        return -1;
    };
    match sub.try_recv() {
        Some(event) => {
            out.write(DsEvent::from(&event));
            1
        }
        None => 0,
    }
}

/// # Safety
/// `session` must be a valid session pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn ds_session_unsubscribe(session: *const DsSession, subscription: u64) {
    if let Some(s) = session.as_ref() {
        s.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&subscription);
        s.session
            .unsubscribe(crate::events::SubscriptionId::from_u64(subscription));
    }
}

/// Get the last error message. Returns NULL if no error.
/// The returned pointer is valid until the next depthsync API call.
#[no_mangle]
pub extern "C" fn ds_last_error() -> *const c_char {
    LAST_ERROR.as_ptr()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    static GRABS: AtomicU32 = AtomicU32::new(0);

    unsafe extern "C" fn grab(_: *mut c_void) -> c_int {
        GRABS.fetch_add(1, Ordering::SeqCst);
        1
    }

    unsafe extern "C" fn tracking_pose(_: *mut c_void, out: *mut DsPose) -> c_int {
        out.write(DsPose {
            translation: [0.0, 1.5, 0.0],
            rotation: [0.0, 0.0, 0.0, 1.0],
        });
        2
    }

    fn vtable() -> DsCameraVTable {
        DsCameraVTable {
            user_data: std::ptr::null_mut(),
            init: None,
            grab: Some(grab),
            capture_timestamp: None,
            current_timestamp: None,
            images: None,
            enable_tracking: None,
            tracking_pose: Some(tracking_pose),
            position: None,
            close: None,
        }
    }

    #[test]
    fn test_vtable_camera_maps_status_codes() {
        let cam = FfiCamera(vtable());
        assert_eq!(cam.grab(), Err(DeviceError::NotANewFrame));
        assert!(GRABS.load(Ordering::SeqCst) >= 1);
        assert_eq!(cam.init(&InitParameters::default()), Ok(()));
        assert_eq!(cam.current_timestamp(), None);

        let (pose, state) = cam.tracking_pose();
        assert_eq!(state, TrackingState::Searching);
        assert!((pose.translation.y - 1.5).abs() < 1e-12);
        // zeroed quaternion from C reads as identity
        assert_eq!(cam.position(), Pose::identity());
    }

    #[test]
    fn test_pose_conversion() {
        let pose = Pose::new(
            Vector3::new(0.1, 0.2, 0.3),
            UnitQuaternion::from_euler_angles(0.2, -0.1, 0.5),
        );
        let back = Pose::from(DsPose::from(pose));
        assert!((back.translation - pose.translation).norm() < 1e-12);
        assert!(back.rotation.angle_to(&pose.rotation) < 1e-12);
    }

    #[test]
    fn test_null_handles_are_rejected() {
        unsafe {
            assert!(ds_session_new(std::ptr::null(), std::ptr::null(), std::ptr::null()).is_null());
            assert_eq!(ds_session_start(std::ptr::null()), -1);
            assert!(!ds_session_is_ready(std::ptr::null()));
            assert_eq!(ds_session_state(std::ptr::null()), SessionState::Uninitialized);
            ds_session_free(std::ptr::null_mut());
        }
    }

    #[test]
    fn test_event_conversion() {
        let e = DsEvent::from(&SessionEvent::OpeningAbandoned { attempts: 50 });
        assert_eq!(e.kind, EventMask::OPENING_ABANDONED.bits());
        assert_eq!(e.attempts, 50);
    }
}
