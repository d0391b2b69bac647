//! HMD pose history and timewarp lookup.
//!
//! The consumer tick records the head pose against the camera clock. When a
//! frame arrives its capture timestamp lies in the past, so the head pose at
//! capture time is looked up here and used to align the stale image with
//! where the head actually was.

use std::collections::VecDeque;

use crate::types::{KeyPose, Pose};

/// Default number of samples kept. About two seconds at 90 Hz.
pub const DEFAULT_CAPACITY: usize = 180;

/// Result of a successful lookup. `timestamp_ns` is never later than the query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencySample {
    pub pose: Pose,
    pub timestamp_ns: u64,
}

/// Bounded, timestamp-ordered store of HMD poses.
#[derive(Debug, Clone)]
pub struct PoseHistory {
    samples: VecDeque<KeyPose>,
    capacity: usize,
    /// Samples older than newest − max_age are evicted. `None` keeps by count only.
    max_age_ns: Option<u64>,
    rejected: u64,
}

impl PoseHistory {
    pub fn new(capacity: usize, max_age_ns: Option<u64>) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            max_age_ns,
            rejected: 0,
        }
    }

    /// Append a pose.
    ///
    /// Samples older than the newest stored one are dropped and counted; a
    /// sample with the same timestamp as the newest replaces it.
    pub fn record(&mut self, pose: Pose, timestamp_ns: u64) {
        if let Some(last) = self.samples.back_mut() {
            if timestamp_ns < last.timestamp_ns {
                self.rejected += 1;
                log::trace!(
                    "Dropping out-of-order HMD pose ts={} (newest {})",
                    timestamp_ns,
                    last.timestamp_ns
                );
                return;
            }
            if timestamp_ns == last.timestamp_ns {
                last.pose = pose;
                return;
            }
        }

        self.samples.push_back(KeyPose { pose, timestamp_ns });

        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
        if let Some(max_age) = self.max_age_ns {
            let horizon = timestamp_ns.saturating_sub(max_age);
            // Keep at least the newest sample.
            while self.samples.len() > 1
                && self.samples.front().is_some_and(|k| k.timestamp_ns < horizon)
            {
                self.samples.pop_front();
            }
        }
    }

    /// Head pose at `timestamp_ns`.
    ///
    /// Returns `None` for a zero timestamp (camera has not produced one yet)
    /// or when every stored sample is newer than the query. Between two
    /// samples the pose is interpolated; past the newest sample the newest
    /// pose is returned as-is, never extrapolated.
    pub fn lookup(&self, timestamp_ns: u64) -> Option<LatencySample> {
        if timestamp_ns == 0 {
            return None;
        }

        // Index of the first sample strictly newer than the query.
        let after = self
            .samples
            .partition_point(|k| k.timestamp_ns <= timestamp_ns);
        if after == 0 {
            return None;
        }

        let before = self.samples[after - 1];
        let Some(next) = self.samples.get(after) else {
            return Some(LatencySample {
                pose: before.pose,
                timestamp_ns: before.timestamp_ns,
            });
        };

        let span = (next.timestamp_ns - before.timestamp_ns) as f64;
        let t = (timestamp_ns - before.timestamp_ns) as f64 / span;
        Some(LatencySample {
            pose: before.pose.interpolate(&next.pose, t),
            timestamp_ns,
        })
    }

    /// Newest stored sample.
    pub fn latest(&self) -> Option<KeyPose> {
        self.samples.back().copied()
    }

    pub fn oldest_timestamp(&self) -> Option<u64> {
        self.samples.front().map(|k| k.timestamp_ns)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Number of out-of-order samples dropped so far.
    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

impl Default for PoseHistory {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, None)
    }
}

/// Latency corrector: collects head poses and holds the pose extracted for
/// the current frame.
#[derive(Debug, Clone, Default)]
pub struct LatencyCorrector {
    history: PoseHistory,
    latency_pose: Option<LatencySample>,
}

impl LatencyCorrector {
    pub fn new(history: PoseHistory) -> Self {
        Self {
            history,
            latency_pose: None,
        }
    }

    /// Store the head pose stamped with the current camera time.
    pub fn collect(&mut self, pose: Pose, now_ns: u64) {
        self.history.record(pose, now_ns);
    }

    /// Look up the head pose for `capture_timestamp_ns`. With `use_latency`
    /// off, the newest sample is used instead. Returns whether a pose was
    /// found; on a miss the previous latency pose is invalidated.
    pub fn extract(&mut self, capture_timestamp_ns: u64, use_latency: bool) -> bool {
        self.latency_pose = if use_latency {
            self.history.lookup(capture_timestamp_ns)
        } else {
            self.history.latest().map(|k| LatencySample {
                pose: k.pose,
                timestamp_ns: k.timestamp_ns,
            })
        };
        self.latency_pose.is_some()
    }

    /// Pose found by the last `extract`, if it succeeded.
    pub fn latency_pose(&self) -> Option<LatencySample> {
        self.latency_pose
    }

    pub fn history(&self) -> &PoseHistory {
        &self.history
    }

    pub fn reset(&mut self) {
        self.history.clear();
        self.latency_pose = None;
    }
}
