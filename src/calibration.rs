//! HMD-to-camera calibration offset and its on-disk file.
//!
//! File format (TOML):
//!
//! ```toml
//! [hmd_to_camera]
//! translation = [0.0, 0.0, 0.115]   # meters, head center -> left sensor
//! rotation = [0.0, 0.0, 0.0, 1.0]   # quaternion [x, y, z, w]
//! ```
//!
//! A missing file is not an error: the hard-coded default is used.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use nalgebra::{Quaternion, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::DepthSyncError;
use crate::types::Pose;
use crate::Result;

pub const CALIBRATION_FILE_NAME: &str = "calibration.toml";

/// Default head-center to camera offset: camera 11.5 cm in front of the head center.
pub const DEFAULT_TRANSLATION: [f64; 3] = [0.0, 0.0, 0.115];

/// Static transform from the HMD reference point to the camera reference point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationOffset {
    pub translation: Vector3<f64>,
    pub rotation: UnitQuaternion<f64>,
}

impl CalibrationOffset {
    pub fn new(translation: Vector3<f64>, rotation: UnitQuaternion<f64>) -> Self {
        Self {
            translation,
            rotation,
        }
    }

    pub fn from_translation(x: f64, y: f64, z: f64) -> Self {
        Self::new(Vector3::new(x, y, z), UnitQuaternion::identity())
    }

    pub fn identity() -> Self {
        Self::new(Vector3::zeros(), UnitQuaternion::identity())
    }

    pub fn as_pose(&self) -> Pose {
        Pose::new(self.translation, self.rotation)
    }
}

impl Default for CalibrationOffset {
    fn default() -> Self {
        let [x, y, z] = DEFAULT_TRANSLATION;
        Self::from_translation(x, y, z)
    }
}

impl From<Pose> for CalibrationOffset {
    fn from(pose: Pose) -> Self {
        Self::new(pose.translation, pose.rotation)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CalibrationFile {
    hmd_to_camera: OffsetSection,
}

#[derive(Debug, Serialize, Deserialize)]
struct OffsetSection {
    translation: [f64; 3],
    #[serde(default = "identity_xyzw")]
    rotation: [f64; 4],
}

fn identity_xyzw() -> [f64; 4] {
    [0.0, 0.0, 0.0, 1.0]
}

/// Parse a calibration file body.
pub fn parse_calibration(contents: &str, origin: &str) -> Result<CalibrationOffset> {
    let file: CalibrationFile = toml::from_str(contents).map_err(|e| DepthSyncError::Config {
        origin: origin.to_string(),
        message: e.to_string(),
    })?;

    let [x, y, z, w] = file.hmd_to_camera.rotation;
    let q = Quaternion::new(w, x, y, z);
    if !q.norm().is_finite() || q.norm() < 1e-6 {
        return Err(DepthSyncError::Config {
            origin: origin.to_string(),
            message: format!("rotation {:?} is not a valid quaternion", [x, y, z, w]),
        });
    }
    let [tx, ty, tz] = file.hmd_to_camera.translation;
    if ![tx, ty, tz].iter().all(|v| v.is_finite()) {
        return Err(DepthSyncError::Config {
            origin: origin.to_string(),
            message: "translation must be finite".into(),
        });
    }

    Ok(CalibrationOffset::new(
        Vector3::new(tx, ty, tz),
        UnitQuaternion::from_quaternion(q),
    ))
}

/// Serialize an offset in the calibration file format.
pub fn format_calibration(offset: &CalibrationOffset) -> String {
    let q = offset.rotation.quaternion();
    let file = CalibrationFile {
        hmd_to_camera: OffsetSection {
            translation: [offset.translation.x, offset.translation.y, offset.translation.z],
            rotation: [q.i, q.j, q.k, q.w],
        },
    };
    // Plain arrays of floats always serialize.
    toml::to_string_pretty(&file).unwrap_or_default()
}

/// `<user config dir>/depthsync/calibration.toml`, if a home directory exists.
pub fn default_calibration_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "depthsync")
        .map(|dirs| dirs.config_dir().join(CALIBRATION_FILE_NAME))
}

/// Outcome of [`CalibrationStore::reload`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reload {
    /// The file's value differs from the current one.
    Changed(CalibrationOffset),
    Unchanged,
}

/// Calibration offset backed by an optional file.
#[derive(Debug, Clone)]
pub struct CalibrationStore {
    path: Option<PathBuf>,
    current: CalibrationOffset,
    modified: Option<SystemTime>,
}

impl CalibrationStore {
    /// Store without a file; always holds `offset`.
    pub fn in_memory(offset: CalibrationOffset) -> Self {
        Self {
            path: None,
            current: offset,
            modified: None,
        }
    }

    /// Load from `path` at startup. Missing or unreadable files fall back to
    /// the defaults with a log line instead of failing the session.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut store = Self {
            path: Some(path.clone()),
            current: CalibrationOffset::default(),
            modified: None,
        };
        match store.read_file() {
            Ok(Some((offset, modified))) => {
                log::info!(
                    "Loaded calibration from {}: t={:?}",
                    path.display(),
                    offset.translation.as_slice()
                );
                store.current = offset;
                store.modified = modified;
            }
            Ok(None) => {
                log::info!(
                    "No calibration file at {}, using defaults",
                    path.display()
                );
            }
            Err(e) => {
                log::warn!("Ignoring calibration file: {}", e);
            }
        }
        store
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn current(&self) -> CalibrationOffset {
        self.current
    }

    /// Replace the offset in memory.
    pub fn set(&mut self, offset: CalibrationOffset) -> Reload {
        if offset == self.current {
            Reload::Unchanged
        } else {
            self.current = offset;
            Reload::Changed(offset)
        }
    }

    /// Re-read the file. A deleted file reverts to the defaults.
    pub fn reload(&mut self) -> Result<Reload> {
        if self.path.is_none() {
            return Ok(Reload::Unchanged);
        }
        let (offset, modified) = self
            .read_file()?
            .unwrap_or((CalibrationOffset::default(), None));
        self.modified = modified;
        Ok(self.set(offset))
    }

    /// Reload only when the file's modification time moved.
    pub fn reload_if_modified(&mut self) -> Result<Reload> {
        let Some(path) = self.path.as_ref() else {
            return Ok(Reload::Unchanged);
        };
        let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok();
        if modified.is_some() && modified == self.modified {
            return Ok(Reload::Unchanged);
        }
        self.reload()
    }

    /// Write the current offset to the file, creating parent directories.
    pub fn save(&mut self) -> Result<()> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DepthSyncError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        std::fs::write(&path, format_calibration(&self.current)).map_err(|e| {
            DepthSyncError::Io {
                path: path.clone(),
                source: e,
            }
        })?;
        self.modified = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
        log::info!("Saved calibration offset to {}", path.display());
        Ok(())
    }

    fn read_file(&self) -> Result<Option<(CalibrationOffset, Option<SystemTime>)>> {
        let Some(path) = self.path.as_ref() else {
            return Ok(None);
        };
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(DepthSyncError::Io {
                    path: path.clone(),
                    source: e,
                })
            }
        };
        let offset = parse_calibration(&contents, &path.display().to_string())?;
        let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok();
        Ok(Some((offset, modified)))
    }
}
