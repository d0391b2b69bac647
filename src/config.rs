//! Session configuration.
//!
//! Values come from, in order: built-in defaults, an optional TOML file,
//! then `DEPTHSYNC_*` environment variables.
//!
//! ```toml
//! max_open_attempts = 50
//! retry_delay_ms = 300
//! enable_tracking = true
//! spatial_memory = true
//! tracking_failure = "degrade"   # or "fail_session"
//!
//! [init]
//! resolution = "hd720"
//! fps = 60
//! depth_mode = "performance"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::calibration;
use crate::error::DepthSyncError;
use crate::history::DEFAULT_CAPACITY;
use crate::pipeline::PipelineTiming;
use crate::types::{InitParameters, TrackingOptions};
use crate::Result;

/// What to do when enabling the camera's tracking fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingFailurePolicy {
    /// Mark tracking unavailable and keep serving frames.
    #[default]
    Degrade,
    /// Close the camera and leave the session in TrackingInit until reset.
    FailSession,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub init: InitParameters,

    /// Init attempts before giving up until the next reset.
    pub max_open_attempts: u32,
    pub retry_delay_ms: u64,

    pub enable_tracking: bool,
    /// Landmark memory for drift correction. Pose smoothing follows it.
    pub spatial_memory: bool,
    /// Saved area map handed to the camera when it exists.
    pub area_file: Option<PathBuf>,
    pub tracking_failure: TrackingFailurePolicy,

    /// Grabs tried before enabling tracking.
    pub warmup_grab_attempts: u32,
    pub warmup_grab_interval_ms: u64,

    pub transient_backoff_ms: u64,
    pub idle_wait_ms: u64,
    pub disconnect_backoff_ms: u64,

    pub history_capacity: usize,
    pub history_max_age_ms: Option<u64>,

    /// Look up the head pose at capture time rather than using the newest one.
    pub use_latency: bool,

    /// `None` uses the per-user default location.
    pub calibration_file: Option<PathBuf>,

    /// Run the reset sequence automatically after a disconnect.
    pub auto_reset: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            init: InitParameters::default(),
            max_open_attempts: 50,
            retry_delay_ms: 300,
            enable_tracking: true,
            spatial_memory: true,
            area_file: None,
            tracking_failure: TrackingFailurePolicy::Degrade,
            warmup_grab_attempts: 100,
            warmup_grab_interval_ms: 10,
            transient_backoff_ms: 1,
            idle_wait_ms: 1,
            disconnect_backoff_ms: 10,
            history_capacity: DEFAULT_CAPACITY,
            history_max_age_ms: None,
            use_latency: true,
            calibration_file: None,
            auto_reset: false,
        }
    }
}

impl SessionConfig {
    /// Load a TOML file, apply environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| DepthSyncError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let mut config = Self::parse(&contents, &path.display().to_string())?;
        config.apply_env();
        config.validate(&path.display().to_string())?;
        Ok(config)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env();
        config.validate("environment")?;
        Ok(config)
    }

    pub fn parse(contents: &str, origin: &str) -> Result<Self> {
        let config: SessionConfig =
            toml::from_str(contents).map_err(|e| DepthSyncError::Config {
                origin: origin.to_string(),
                message: e.to_string(),
            })?;
        config.validate(origin)?;
        Ok(config)
    }

    /// Override fields from `DEPTHSYNC_*` variables. Unparsable values are ignored.
    pub fn apply_env(&mut self) {
        self.max_open_attempts = read_env_u64("DEPTHSYNC_MAX_OPEN_ATTEMPTS", self.max_open_attempts as u64)
            .min(u32::MAX as u64) as u32;
        self.retry_delay_ms = read_env_u64("DEPTHSYNC_RETRY_DELAY_MS", self.retry_delay_ms);
        self.enable_tracking = read_env_bool("DEPTHSYNC_TRACKING", self.enable_tracking);
        self.spatial_memory = read_env_bool("DEPTHSYNC_SPATIAL_MEMORY", self.spatial_memory);
        self.use_latency = read_env_bool("DEPTHSYNC_USE_LATENCY", self.use_latency);
        self.auto_reset = read_env_bool("DEPTHSYNC_AUTO_RESET", self.auto_reset);

        let policy = read_env_string("DEPTHSYNC_TRACKING_FAILURE", "");
        match policy.as_str() {
            "" => {}
            "degrade" => self.tracking_failure = TrackingFailurePolicy::Degrade,
            "fail_session" | "fail" => self.tracking_failure = TrackingFailurePolicy::FailSession,
            other => log::warn!("Ignoring DEPTHSYNC_TRACKING_FAILURE={}", other),
        }

        if let Some(path) = read_env_path("DEPTHSYNC_CALIBRATION_FILE") {
            self.calibration_file = Some(path);
        }
        if let Some(path) = read_env_path("DEPTHSYNC_AREA_FILE") {
            self.area_file = Some(path);
        }
    }

    pub fn validate(&self, origin: &str) -> Result<()> {
        let invalid = |message: &str| DepthSyncError::Config {
            origin: origin.to_string(),
            message: message.to_string(),
        };
        if self.max_open_attempts == 0 {
            return Err(invalid("max_open_attempts must be at least 1"));
        }
        if self.history_capacity < 2 {
            return Err(invalid("history_capacity must be at least 2"));
        }
        if self.init.fps == 0 {
            return Err(invalid("init.fps must be positive"));
        }
        if !(self.init.depth_minimum_distance.is_finite() && self.init.depth_minimum_distance >= 0.0) {
            return Err(invalid("init.depth_minimum_distance must be >= 0"));
        }
        if self.idle_wait_ms == 0 {
            return Err(invalid("idle_wait_ms must be at least 1"));
        }
        Ok(())
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn warmup_grab_interval(&self) -> Duration {
        Duration::from_millis(self.warmup_grab_interval_ms)
    }

    pub fn pipeline_timing(&self) -> PipelineTiming {
        PipelineTiming {
            transient_backoff: Duration::from_millis(self.transient_backoff_ms),
            disconnect_backoff: Duration::from_millis(self.disconnect_backoff_ms),
            idle_wait: Duration::from_millis(self.idle_wait_ms),
        }
    }

    pub fn history_max_age_ns(&self) -> Option<u64> {
        self.history_max_age_ms.map(|ms| ms.saturating_mul(1_000_000))
    }

    pub fn tracking_options(&self) -> TrackingOptions {
        if self.spatial_memory {
            TrackingOptions::SPATIAL_MEMORY | TrackingOptions::POSE_SMOOTHING
        } else {
            TrackingOptions::empty()
        }
    }

    /// Configured calibration file, else the per-user default.
    pub fn calibration_path(&self) -> Option<PathBuf> {
        self.calibration_file
            .clone()
            .or_else(calibration::default_calibration_path)
    }
}

fn read_env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .and_then(|v| {
            let v = v.trim().to_ascii_lowercase();
            match v.as_str() {
                "1" | "true" | "yes" | "on" => Some(true),
                "0" | "false" | "no" | "off" => Some(false),
                _ => None,
            }
        })
        .unwrap_or(default)
}

fn read_env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn read_env_string(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn read_env_path(name: &str) -> Option<PathBuf> {
    std::env::var_os(name)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}
