//! In-process simulated camera and headset.
//!
//! Used by the test suite and the demo to drive a [`Session`](crate::Session)
//! without hardware: init failures, slow opens, tracking failures and
//! unplugging can all be scripted, and every call the session makes is
//! recorded for inspection.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use nalgebra::{UnitQuaternion, Vector3};

use crate::device::{DepthCamera, Hmd};
use crate::error::{DeviceError, DeviceResult};
use crate::types::{
    FrameImages, ImageHandle, InitParameters, Pose, TrackingOptions, TrackingState,
};

/// Status returned by `grab` while the simulated camera is closed.
pub const SIM_NOT_OPEN: i32 = -2;

/// Camera clock origin, so timestamps are never zero.
const CLOCK_BASE_NS: u64 = 1_000_000_000;

/// Device motion relative to the tracking seed, as a function of seconds
/// since tracking was enabled.
pub type Motion = Arc<dyn Fn(f64) -> Pose + Send + Sync>;

/// Slow sway: a few centimeters sideways and a few degrees of yaw.
pub fn default_motion() -> Motion {
    Arc::new(|t: f64| {
        Pose::new(
            Vector3::new(0.05 * t.sin(), 0.0, 0.02 * (1.0 - t.cos())),
            UnitQuaternion::from_axis_angle(&Vector3::y_axis(), 0.1 * t.sin()),
        )
    })
}

struct CameraState {
    // script
    connected: bool,
    init_failures: u32,
    init_error: DeviceError,
    always_fail: Option<DeviceError>,
    init_delay: Duration,
    tracking_failure: Option<DeviceError>,
    state_override: Option<TrackingState>,
    frame_period: Duration,
    capture_latency: Duration,
    motion: Motion,

    // device
    open: bool,
    tracking: Option<(Pose, Instant)>,
    last_pose: Pose,
    last_state: TrackingState,
    capture_ts: u64,
    frame_index: u64,

    // record
    init_times: Vec<Instant>,
    seeds: Vec<Pose>,
    tracking_options: Vec<TrackingOptions>,
    area_files: Vec<Option<PathBuf>>,
    grabs: u64,
    closes: u32,
}

/// Simulated stereo depth camera.
pub struct SimulatedCamera {
    epoch: Instant,
    state: Mutex<CameraState>,
    inits_in_flight: AtomicUsize,
    max_inits_in_flight: AtomicUsize,
}

impl SimulatedCamera {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            state: Mutex::new(CameraState {
                connected: true,
                init_failures: 0,
                init_error: DeviceError::Failed(-1),
                always_fail: None,
                init_delay: Duration::ZERO,
                tracking_failure: None,
                state_override: None,
                frame_period: Duration::from_millis(16),
                capture_latency: Duration::from_millis(20),
                motion: default_motion(),
                open: false,
                tracking: None,
                last_pose: Pose::identity(),
                last_state: TrackingState::Off,
                capture_ts: 0,
                frame_index: 0,
                init_times: Vec::new(),
                seeds: Vec::new(),
                tracking_options: Vec::new(),
                area_files: Vec::new(),
                grabs: 0,
                closes: 0,
            }),
            inits_in_flight: AtomicUsize::new(0),
            max_inits_in_flight: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CameraState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn now_ns(&self) -> u64 {
        CLOCK_BASE_NS + self.epoch.elapsed().as_nanos() as u64
    }

    /// The next `times` init calls fail with `error`.
    pub fn fail_init(&self, times: u32, error: DeviceError) {
        let mut s = self.lock();
        s.init_failures = times;
        s.init_error = error;
    }

    /// Every init call fails with `error` until cleared with `None`.
    pub fn fail_init_always(&self, error: Option<DeviceError>) {
        self.lock().always_fail = error;
    }

    pub fn set_init_delay(&self, delay: Duration) {
        self.lock().init_delay = delay;
    }

    pub fn fail_tracking(&self, error: Option<DeviceError>) {
        self.lock().tracking_failure = error;
    }

    /// Force the reported tracking state; `None` reports Tracking.
    pub fn set_tracking_state(&self, state: Option<TrackingState>) {
        self.lock().state_override = state;
    }

    /// Time one grab blocks for.
    pub fn set_frame_period(&self, period: Duration) {
        self.lock().frame_period = period;
    }

    /// How far capture timestamps lag the camera clock.
    pub fn set_capture_latency(&self, latency: Duration) {
        self.lock().capture_latency = latency;
    }

    pub fn set_motion(&self, motion: Motion) {
        self.lock().motion = motion;
    }

    /// Unplug: grabs and inits report the camera as not detected.
    pub fn disconnect(&self) {
        self.lock().connected = false;
    }

    pub fn reconnect(&self) {
        self.lock().connected = true;
    }

    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    pub fn init_calls(&self) -> usize {
        self.lock().init_times.len()
    }

    pub fn init_times(&self) -> Vec<Instant> {
        self.lock().init_times.clone()
    }

    /// Most init calls that were ever running at the same time.
    pub fn max_concurrent_inits(&self) -> usize {
        self.max_inits_in_flight.load(Ordering::SeqCst)
    }

    /// Initial poses passed to every `enable_tracking` call.
    pub fn tracking_seeds(&self) -> Vec<Pose> {
        self.lock().seeds.clone()
    }

    pub fn tracking_options(&self) -> Vec<TrackingOptions> {
        self.lock().tracking_options.clone()
    }

    pub fn area_files(&self) -> Vec<Option<PathBuf>> {
        self.lock().area_files.clone()
    }

    pub fn grab_count(&self) -> u64 {
        self.lock().grabs
    }

    pub fn close_count(&self) -> u32 {
        self.lock().closes
    }
}

impl Default for SimulatedCamera {
    fn default() -> Self {
        Self::new()
    }
}

impl DepthCamera for SimulatedCamera {
    fn init(&self, _params: &InitParameters) -> DeviceResult<()> {
        let in_flight = self.inits_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_inits_in_flight.fetch_max(in_flight, Ordering::SeqCst);

        let delay = {
            let mut s = self.lock();
            s.init_times.push(Instant::now());
            s.init_delay
        };
        std::thread::sleep(delay);

        let result = {
            let mut s = self.lock();
            if !s.connected {
                Err(DeviceError::CameraNotDetected)
            } else if s.init_failures > 0 {
                s.init_failures -= 1;
                Err(s.init_error)
            } else if let Some(e) = s.always_fail {
                Err(e)
            } else {
                s.open = true;
                Ok(())
            }
        };
        self.inits_in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn grab(&self) -> DeviceResult<()> {
        let period = {
            let mut s = self.lock();
            s.grabs += 1;
            if !s.connected {
                return Err(DeviceError::CameraNotDetected);
            }
            if !s.open {
                return Err(DeviceError::Failed(SIM_NOT_OPEN));
            }
            s.frame_period
        };
        std::thread::sleep(period);

        let now = self.now_ns();
        let mut s = self.lock();
        if !s.connected {
            return Err(DeviceError::CameraNotDetected);
        }
        s.frame_index += 1;
        s.capture_ts = now
            .saturating_sub(s.capture_latency.as_nanos() as u64)
            .max(1);
        if let Some((seed, enabled_at)) = s.tracking {
            let t = enabled_at.elapsed().as_secs_f64();
            s.last_pose = seed.compose(&(s.motion)(t));
            s.last_state = s.state_override.unwrap_or(TrackingState::Tracking);
        }
        Ok(())
    }

    fn capture_timestamp(&self) -> u64 {
        self.lock().capture_ts
    }

    fn current_timestamp(&self) -> Option<u64> {
        let open = self.lock().open;
        open.then(|| self.now_ns())
    }

    fn images(&self) -> FrameImages {
        let n = self.lock().frame_index;
        FrameImages {
            left: ImageHandle(2 * n),
            right: ImageHandle(2 * n + 1),
        }
    }

    fn enable_tracking(
        &self,
        initial: &Pose,
        options: TrackingOptions,
        area_file: Option<&Path>,
    ) -> DeviceResult<()> {
        let mut s = self.lock();
        s.seeds.push(*initial);
        s.tracking_options.push(options);
        s.area_files.push(area_file.map(Path::to_path_buf));
        if let Some(e) = s.tracking_failure {
            return Err(e);
        }
        s.tracking = Some((*initial, Instant::now()));
        s.last_pose = *initial;
        s.last_state = TrackingState::Tracking;
        Ok(())
    }

    fn tracking_pose(&self) -> (Pose, TrackingState) {
        let s = self.lock();
        match s.tracking {
            Some(_) => (s.last_pose, s.last_state),
            None => (Pose::identity(), TrackingState::Off),
        }
    }

    fn position(&self) -> Pose {
        self.lock().last_pose
    }

    fn close(&self) {
        let mut s = self.lock();
        s.closes += 1;
        s.open = false;
        s.tracking = None;
        s.last_state = TrackingState::Off;
    }
}

/// Simulated headset with a settable head pose.
#[derive(Default)]
pub struct SimulatedHmd {
    head: Mutex<Option<Pose>>,
}

impl SimulatedHmd {
    /// Headset that is present at `pose`.
    pub fn present(pose: Pose) -> Self {
        Self {
            head: Mutex::new(Some(pose)),
        }
    }

    /// Headset that is not attached.
    pub fn absent() -> Self {
        Self::default()
    }

    pub fn set_pose(&self, pose: Pose) {
        *self.head.lock().unwrap_or_else(PoisonError::into_inner) = Some(pose);
    }

    pub fn remove(&self) {
        *self.head.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl Hmd for SimulatedHmd {
    fn is_present(&self) -> bool {
        self.head
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn head_local_pose(&self) -> Pose {
        self.head
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .unwrap_or_else(Pose::identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_init_failures() {
        let cam = SimulatedCamera::new();
        cam.fail_init(2, DeviceError::Failed(7));
        let params = InitParameters::default();
        assert_eq!(cam.init(&params), Err(DeviceError::Failed(7)));
        assert_eq!(cam.init(&params), Err(DeviceError::Failed(7)));
        assert_eq!(cam.init(&params), Ok(()));
        assert_eq!(cam.init_calls(), 3);
        assert!(cam.is_open());
    }

    #[test]
    fn test_grab_and_tracking() {
        let cam = SimulatedCamera::new();
        cam.set_frame_period(Duration::from_millis(1));
        assert_eq!(cam.grab(), Err(DeviceError::Failed(SIM_NOT_OPEN)));

        cam.init(&InitParameters::default()).unwrap();
        let seed = Pose::from_translation(0.0, 1.6, 0.0);
        cam.enable_tracking(&seed, TrackingOptions::default(), None)
            .unwrap();
        cam.grab().unwrap();

        let (pose, state) = cam.tracking_pose();
        assert_eq!(state, TrackingState::Tracking);
        assert!((pose.translation - seed.translation).norm() < 0.1);
        assert!(cam.capture_timestamp() > 0);
        assert!(cam.capture_timestamp() < cam.current_timestamp().unwrap());
        assert_eq!(cam.tracking_seeds(), vec![seed]);

        cam.disconnect();
        assert_eq!(cam.grab(), Err(DeviceError::CameraNotDetected));
        assert_eq!(cam.position(), pose);
    }

    #[test]
    fn test_hmd_presence() {
        let hmd = SimulatedHmd::absent();
        assert!(!hmd.is_present());
        hmd.set_pose(Pose::from_translation(0.0, 1.7, 0.0));
        assert!(hmd.is_present());
        assert!((hmd.head_local_pose().translation.y - 1.7).abs() < 1e-12);
    }
}
