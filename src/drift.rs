//! Fusion of device tracking, the latency-corrected HMD pose and the
//! calibration offset into the single transform renderers consume.
//!
//! Frames: the camera's tracking is seeded at the head pose, so its path
//! pose `P` describes the HMD reference point in world space. The
//! calibration `C` maps that reference point onto the camera sensor. The
//! latency pose `L` is the head pose at the frame's capture time and `H` the
//! head pose now.
//!
//! | device tracking | HMD + latency pose | output                    | source |
//! |-----------------|--------------------|---------------------------|--------|
//! | Tracking        | valid              | `W · (H · L⁻¹) · P · C`   | Device |
//! | Tracking        | absent / miss      | `W · P · C`               | Device |
//! | Searching       | valid              | `W · L · C`               | Hmd    |
//! | Searching       | absent / miss      | `W · P · C`               | Device |
//! | off             | valid              | `W · L · C`               | Hmd    |
//! | off             | present, miss      | skipped (`None`)          |        |
//! | off             | absent             | identity, state `Off`     | None   |
//!
//! With the camera lost, [`DriftCorrector::fuse_head_only`] yields `W · H · C`
//! from the HMD, or the untracked identity.
//!
//! `W` is the constant world offset (identity unless set).

use crate::calibration::CalibrationOffset;
use crate::history::LatencySample;
use crate::types::{FusedTransform, Pose, PoseSource, TrackingState};

/// Inputs for one fusion step, gathered by the consumer tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct FusionInput {
    /// Device path pose and state for the current frame, `None` when the
    /// device's tracking is disabled or unavailable.
    pub device: Option<(Pose, TrackingState)>,
    /// Current head pose, `None` when no HMD is present.
    pub hmd: Option<Pose>,
    /// Head pose at the frame's capture time.
    pub latency: Option<LatencySample>,
}

#[derive(Debug, Clone)]
pub struct DriftCorrector {
    calibration: Pose,
    world_offset: Pose,
}

impl DriftCorrector {
    pub fn new(calibration: CalibrationOffset) -> Self {
        Self {
            calibration: calibration.as_pose(),
            world_offset: Pose::identity(),
        }
    }

    /// Takes effect on the next `fuse` call, no blending.
    pub fn set_calibration_transform(&mut self, offset: &CalibrationOffset) {
        self.calibration = offset.as_pose();
    }

    pub fn calibration_transform(&self) -> CalibrationOffset {
        CalibrationOffset::from(self.calibration)
    }

    /// Constant world-frame offset applied to every tracked output.
    pub fn set_world_offset(&mut self, offset: Pose) {
        self.world_offset = offset;
    }

    pub fn world_offset(&self) -> Pose {
        self.world_offset
    }

    /// Compute this tick's transform. `None` means skip fusion this tick:
    /// only the HMD could drive the output and its latency lookup missed.
    pub fn fuse(&self, input: &FusionInput) -> Option<FusedTransform> {
        let latency = input.hmd.and(input.latency);

        match input.device {
            Some((path, TrackingState::Tracking)) => {
                let head = match (input.hmd, latency) {
                    (Some(now), Some(at_capture)) => {
                        // Head motion since capture keeps the image locked to the head.
                        let since_capture = now.compose(&at_capture.pose.inverse());
                        since_capture.compose(&path)
                    }
                    _ => path,
                };
                Some(self.output(&head, TrackingState::Tracking, PoseSource::Device))
            }
            Some((path, TrackingState::Searching)) => Some(match latency {
                Some(at_capture) => {
                    self.output(&at_capture.pose, TrackingState::Searching, PoseSource::Hmd)
                }
                None => self.output(&path, TrackingState::Searching, PoseSource::Device),
            }),
            Some((_, TrackingState::Off)) | None => match (input.hmd, latency) {
                (Some(_), Some(at_capture)) => {
                    Some(self.output(&at_capture.pose, TrackingState::Tracking, PoseSource::Hmd))
                }
                (Some(_), None) => None,
                (None, _) => Some(FusedTransform::untracked()),
            },
        }
    }

    /// Transform while no camera frame can be trusted: the current head pose
    /// through the calibration, or the untracked identity without an HMD.
    pub fn fuse_head_only(&self, hmd: Option<Pose>) -> FusedTransform {
        match hmd {
            Some(head) => self.output(&head, TrackingState::Tracking, PoseSource::Hmd),
            None => FusedTransform::untracked(),
        }
    }

    fn output(&self, head: &Pose, state: TrackingState, source: PoseSource) -> FusedTransform {
        let camera = self.world_offset.compose(head).compose(&self.calibration);
        FusedTransform {
            rotation: camera.rotation,
            translation: camera.translation,
            tracking_state: state,
            source,
        }
    }
}

impl Default for DriftCorrector {
    fn default() -> Self {
        Self::new(CalibrationOffset::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{UnitQuaternion, Vector3};

    fn yawed(x: f64, y: f64, z: f64, yaw: f64) -> Pose {
        Pose::new(
            Vector3::new(x, y, z),
            UnitQuaternion::from_axis_angle(&Vector3::y_axis(), yaw),
        )
    }

    fn sample(pose: Pose, ts: u64) -> Option<LatencySample> {
        Some(LatencySample {
            pose,
            timestamp_ns: ts,
        })
    }

    #[test]
    fn test_nothing_tracked_is_identity_off() {
        let dc = DriftCorrector::new(CalibrationOffset::from_translation(0.03, 0.0, 0.1));
        let out = dc.fuse(&FusionInput::default()).unwrap();
        assert_eq!(out, FusedTransform::untracked());
    }

    #[test]
    fn test_device_tracking_applies_calibration_through_head() {
        let offset = CalibrationOffset::from_translation(0.03, 0.0, 0.1);
        let dc = DriftCorrector::new(offset);
        let head = yawed(1.0, 1.6, -0.5, 0.7);

        let out = dc
            .fuse(&FusionInput {
                device: Some((head, TrackingState::Tracking)),
                hmd: Some(head),
                latency: sample(head, 10),
            })
            .unwrap();

        assert_eq!(out.tracking_state, TrackingState::Tracking);
        assert_eq!(out.source, PoseSource::Device);
        let expected = head.rotation * offset.translation;
        assert!((out.translation - head.translation - expected).norm() < 1e-12);

        let recovered = head.inverse().compose(&out.pose());
        assert!((recovered.translation - offset.translation).norm() < 1e-12);
        assert!(recovered.rotation.angle_to(&offset.rotation) < 1e-12);
    }

    #[test]
    fn test_head_motion_since_capture_is_applied() {
        let dc = DriftCorrector::new(CalibrationOffset::identity());
        let path = Pose::from_translation(0.0, 1.6, 0.0);
        let at_capture = Pose::from_translation(0.0, 1.6, 0.0);
        let now = Pose::from_translation(0.05, 1.6, 0.0);

        let out = dc
            .fuse(&FusionInput {
                device: Some((path, TrackingState::Tracking)),
                hmd: Some(now),
                latency: sample(at_capture, 10),
            })
            .unwrap();
        assert!((out.translation - Vector3::new(0.05, 1.6, 0.0)).norm() < 1e-12);
    }

    #[test]
    fn test_latency_miss_uses_raw_path() {
        let dc = DriftCorrector::new(CalibrationOffset::identity());
        let path = Pose::from_translation(0.2, 1.5, 0.0);
        let out = dc
            .fuse(&FusionInput {
                device: Some((path, TrackingState::Tracking)),
                hmd: Some(Pose::from_translation(9.0, 9.0, 9.0)),
                latency: None,
            })
            .unwrap();
        assert_eq!(out.pose(), path);
    }

    #[test]
    fn test_hmd_fallback_and_skip_on_miss() {
        let dc = DriftCorrector::new(CalibrationOffset::identity());
        let head = Pose::from_translation(0.0, 1.7, 0.0);

        let out = dc
            .fuse(&FusionInput {
                device: None,
                hmd: Some(head),
                latency: sample(head, 5),
            })
            .unwrap();
        assert_eq!(out.source, PoseSource::Hmd);
        assert_eq!(out.pose(), head);

        let skipped = dc.fuse(&FusionInput {
            device: None,
            hmd: Some(head),
            latency: None,
        });
        assert!(skipped.is_none());
    }

    #[test]
    fn test_searching_state_is_propagated() {
        let dc = DriftCorrector::default();
        let path = Pose::from_translation(0.0, 1.0, 0.0);
        let tracking = dc
            .fuse(&FusionInput {
                device: Some((path, TrackingState::Tracking)),
                ..Default::default()
            })
            .unwrap();
        let searching = dc
            .fuse(&FusionInput {
                device: Some((path, TrackingState::Searching)),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(tracking.tracking_state, TrackingState::Tracking);
        assert_eq!(searching.tracking_state, TrackingState::Searching);
    }

    #[test]
    fn test_set_calibration_is_immediate_and_idempotent() {
        let mut dc = DriftCorrector::new(CalibrationOffset::identity());
        let input = FusionInput {
            device: Some((Pose::from_translation(1.0, 0.0, 0.0), TrackingState::Tracking)),
            ..Default::default()
        };
        let offset = CalibrationOffset::from_translation(0.0, 0.0, 0.1);

        dc.set_calibration_transform(&offset);
        let first = dc.fuse(&input).unwrap();
        dc.set_calibration_transform(&offset);
        let second = dc.fuse(&input).unwrap();

        assert_eq!(first, second);
        assert!((first.translation - Vector3::new(1.0, 0.0, 0.1)).norm() < 1e-12);
    }

    #[test]
    fn test_world_offset_is_applied_last() {
        let mut dc = DriftCorrector::new(CalibrationOffset::identity());
        dc.set_world_offset(Pose::from_translation(0.0, -1.0, 0.0));
        let out = dc
            .fuse(&FusionInput {
                device: Some((Pose::from_translation(0.0, 1.0, 0.0), TrackingState::Tracking)),
                ..Default::default()
            })
            .unwrap();
        assert!(out.translation.norm() < 1e-12);
    }

    #[test]
    fn test_head_only_ignores_device_state() {
        let offset = CalibrationOffset::from_translation(0.0, 0.0, 0.1);
        let dc = DriftCorrector::new(offset);
        let head = Pose::from_translation(0.2, 1.6, 0.0);

        let out = dc.fuse_head_only(Some(head));
        assert_eq!(out.source, PoseSource::Hmd);
        assert!((out.translation - Vector3::new(0.2, 1.6, 0.1)).norm() < 1e-12);

        assert_eq!(dc.fuse_head_only(None), FusedTransform::untracked());
    }
}
