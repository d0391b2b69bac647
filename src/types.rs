use nalgebra::{Isometry3, Translation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

/// Rigid transform: rotation followed by translation, in meters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub translation: Vector3<f64>,
    pub rotation: UnitQuaternion<f64>,
}

impl Pose {
    pub fn new(translation: Vector3<f64>, rotation: UnitQuaternion<f64>) -> Self {
        Self {
            translation,
            rotation,
        }
    }

    pub fn identity() -> Self {
        Self::new(Vector3::zeros(), UnitQuaternion::identity())
    }

    pub fn from_translation(x: f64, y: f64, z: f64) -> Self {
        Self::new(Vector3::new(x, y, z), UnitQuaternion::identity())
    }

    pub fn to_isometry(&self) -> Isometry3<f64> {
        Isometry3::from_parts(Translation3::from(self.translation), self.rotation)
    }

    pub fn from_isometry(iso: &Isometry3<f64>) -> Self {
        Self::new(iso.translation.vector, iso.rotation)
    }

    /// `self ∘ other`: applies `other` in the frame of `self`.
    pub fn compose(&self, other: &Pose) -> Pose {
        Pose::from_isometry(&(self.to_isometry() * other.to_isometry()))
    }

    pub fn inverse(&self) -> Pose {
        Pose::from_isometry(&self.to_isometry().inverse())
    }

    /// Interpolate towards `other`: lerp on translation, slerp on rotation.
    pub fn interpolate(&self, other: &Pose, t: f64) -> Pose {
        let t = t.clamp(0.0, 1.0);
        // slerp is undefined for rotations 180° apart; snap to the nearer end.
        let rotation = self
            .rotation
            .try_slerp(&other.rotation, t, 1.0e-9)
            .unwrap_or(if t < 0.5 { self.rotation } else { other.rotation });
        Pose::new(self.translation.lerp(&other.translation, t), rotation)
    }

    /// Quaternion as [qx, qy, qz, qw].
    pub fn quaternion_xyzw(&self) -> [f64; 4] {
        let q = self.rotation.quaternion();
        [q.i, q.j, q.k, q.w]
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::identity()
    }
}

/// HMD pose stamped with the camera clock, in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyPose {
    pub pose: Pose,
    pub timestamp_ns: u64,
}

/// Confidence of a tracking subsystem.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackingState {
    #[default]
    Off = 0,
    /// Actively tracking.
    Tracking = 1,
    /// Lost position, trying to recover.
    Searching = 2,
}

impl TrackingState {
    pub fn is_tracking(&self) -> bool {
        *self == TrackingState::Tracking
    }
}

/// Where the fused transform came from this tick.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoseSource {
    #[default]
    None = 0,
    /// Device tracking, optionally latency-compensated by the HMD.
    Device = 1,
    /// HMD latency pose only.
    Hmd = 2,
}

/// Lifecycle state of a device session.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Uninitialized = 0,
    Opening = 1,
    TrackingInit = 2,
    Ready = 3,
    Disconnected = 4,
}

/// Opaque per-frame image handle owned by the camera SDK.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ImageHandle(pub u64);

/// Stereo image handles for one grabbed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameImages {
    pub left: ImageHandle,
    pub right: ImageHandle,
}

/// One grabbed frame: images and the device pose taken under the same lock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frame {
    pub capture_timestamp_ns: u64,
    pub images: FrameImages,
    pub tracking_pose: Pose,
    pub tracking_state: TrackingState,
}

/// Final world transform handed to renderers. Recomputed every tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusedTransform {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
    pub tracking_state: TrackingState,
    pub source: PoseSource,
}

impl FusedTransform {
    /// Untracked output: identity transform, tracking off.
    pub fn untracked() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
            tracking_state: TrackingState::Off,
            source: PoseSource::None,
        }
    }

    pub fn pose(&self) -> Pose {
        Pose::new(self.translation, self.rotation)
    }
}

impl Default for FusedTransform {
    fn default() -> Self {
        Self::untracked()
    }
}

bitflags::bitflags! {
    /// Options passed to the camera when enabling its tracking.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[repr(C)]
    pub struct TrackingOptions: u32 {
        /// Remember landmarks to correct drift when revisiting an area.
        const SPATIAL_MEMORY = 1 << 0;
        /// Smooth the pose jumps caused by spatial-memory corrections.
        const POSE_SMOOTHING = 1 << 1;
    }
}

impl Default for TrackingOptions {
    fn default() -> Self {
        TrackingOptions::SPATIAL_MEMORY | TrackingOptions::POSE_SMOOTHING
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    Hd2k,
    Hd1080,
    #[default]
    Hd720,
    Vga,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DepthMode {
    None,
    #[default]
    Performance,
    Quality,
    Ultra,
}

/// Parameters handed to the camera's `init`. Cannot change without a reset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitParameters {
    pub resolution: Resolution,
    pub fps: u32,
    pub depth_mode: DepthMode,
    /// Closest depth the camera will measure, meters.
    pub depth_minimum_distance: f32,
    /// Compute a depth map for the right eye too.
    pub enable_right_side_measure: bool,
    pub depth_stabilization: bool,
}

impl Default for InitParameters {
    fn default() -> Self {
        Self {
            resolution: Resolution::Hd720,
            fps: 60,
            depth_mode: DepthMode::Performance,
            depth_minimum_distance: 0.1,
            enable_right_side_measure: true,
            depth_stabilization: true,
        }
    }
}
