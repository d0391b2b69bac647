use crate::device::DepthCamera;
use crate::error::DeviceError;
use crate::frame::{FrameSlot, SlotFlags};
use crate::types::{Frame, Pose, TrackingState};
use crate::{DepthSyncError, Result};
use crossbeam_channel::Sender;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Sleep intervals of the acquisition loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineTiming {
    /// After a transient grab error such as "not a new frame".
    pub transient_backoff: Duration,
    /// After the camera reported it is gone.
    pub disconnect_backoff: Duration,
    /// Longest wait for the consumer's next request before re-checking the stop flag.
    pub idle_wait: Duration,
}

impl Default for PipelineTiming {
    fn default() -> Self {
        Self {
            transient_backoff: Duration::from_millis(1),
            disconnect_backoff: Duration::from_millis(10),
            idle_wait: Duration::from_millis(1),
        }
    }
}

/// Counters since the pipeline started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub grabs: u64,
    pub frames: u64,
    pub transient_errors: u64,
    pub consumed: u64,
}

#[derive(Default)]
struct Counters {
    grabs: AtomicU64,
    frames: AtomicU64,
    transient_errors: AtomicU64,
    consumed: AtomicU64,
}

struct Shared {
    stop_flag: AtomicBool,
    disconnected: AtomicBool,
    counters: Counters,
}

/// Handle to the acquisition thread.
///
/// The thread grabs from the camera only while the consumer has asked for a
/// frame, and publishes each frame through a single [`FrameSlot`].
pub struct FrameAcquisitionPipeline {
    slot: Arc<FrameSlot>,
    shared: Arc<Shared>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl FrameAcquisitionPipeline {
    /// Start the acquisition thread.
    ///
    /// With `tracking` on, every frame carries the camera's tracking pose read
    /// under the slot lock. `lost` is signalled once if the camera disappears.
    pub(crate) fn start(
        camera: Arc<dyn DepthCamera>,
        tracking: bool,
        timing: PipelineTiming,
        lost: Option<Sender<()>>,
    ) -> Result<FrameAcquisitionPipeline> {
        let slot = Arc::new(FrameSlot::new());
        let shared = Arc::new(Shared {
            stop_flag: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
            counters: Counters::default(),
        });

        // First frame is requested up front.
        slot.request();

        let thread_slot = slot.clone();
        let thread_shared = shared.clone();
        let thread = std::thread::Builder::new()
            .name("depthsync-grab".into())
            .spawn(move || {
                grab_loop(camera, thread_slot, thread_shared, tracking, timing, lost);
            })
            .map_err(|e| DepthSyncError::ThreadSpawn {
                name: "depthsync-grab",
                source: e,
            })?;

        Ok(FrameAcquisitionPipeline {
            slot,
            shared,
            thread: Some(thread),
        })
    }

    /// Take the latest frame if one is waiting. Never blocks.
    pub fn poll_frame(&self) -> Option<Frame> {
        let frame = self.slot.try_take()?;
        self.shared.counters.consumed.fetch_add(1, Ordering::Relaxed);
        Some(frame)
    }

    /// Wait up to `timeout` for the next frame.
    pub fn wait_frame(&self, timeout: Duration) -> Option<Frame> {
        let frame = self.slot.take_timeout(timeout)?;
        self.shared.counters.consumed.fetch_add(1, Ordering::Relaxed);
        Some(frame)
    }

    /// The camera reported it is no longer detected.
    pub fn is_disconnected(&self) -> bool {
        self.shared.disconnected.load(Ordering::Acquire)
    }

    pub fn is_active(&self) -> bool {
        !self.shared.stop_flag.load(Ordering::Relaxed)
    }

    pub fn slot_flags(&self) -> SlotFlags {
        self.slot.flags()
    }

    pub fn stats(&self) -> PipelineStats {
        let c = &self.shared.counters;
        PipelineStats {
            grabs: c.grabs.load(Ordering::Relaxed),
            frames: c.frames.load(Ordering::Relaxed),
            transient_errors: c.transient_errors.load(Ordering::Relaxed),
            consumed: c.consumed.load(Ordering::Relaxed),
        }
    }

    /// Stop the thread and wait for it. Returns after at most one in-flight grab.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.shared.stop_flag.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Acquisition thread panicked");
            }
        }
    }
}

impl Drop for FrameAcquisitionPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Acquisition loop, runs in the `depthsync-grab` thread.
///
/// The grab itself happens outside the slot lock; reading the timestamp,
/// image handles and tracking pose and publishing the frame happen under it.
fn grab_loop(
    camera: Arc<dyn DepthCamera>,
    slot: Arc<FrameSlot>,
    shared: Arc<Shared>,
    tracking: bool,
    timing: PipelineTiming,
    lost: Option<Sender<()>>,
) {
    log::info!("Acquisition thread started (tracking={})", tracking);

    loop {
        if shared.stop_flag.load(Ordering::Relaxed) {
            log::info!("Acquisition thread stopping (stop flag set)");
            break;
        }

        // Previous frame not consumed yet: wait instead of grabbing over it.
        if !slot.wait_for_request(timing.idle_wait) {
            continue;
        }

        shared.counters.grabs.fetch_add(1, Ordering::Relaxed);
        match camera.grab() {
            Ok(()) => {
                let published = slot.fill_with(|| {
                    let (tracking_pose, tracking_state) = if tracking {
                        camera.tracking_pose()
                    } else {
                        (Pose::identity(), TrackingState::Off)
                    };
                    Frame {
                        capture_timestamp_ns: camera.capture_timestamp(),
                        images: camera.images(),
                        tracking_pose,
                        tracking_state,
                    }
                });
                if published {
                    shared.counters.frames.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(DeviceError::CameraNotDetected) => {
                if !shared.disconnected.swap(true, Ordering::AcqRel) {
                    log::warn!("Camera not detected or disconnected");
                    if let Some(lost) = lost.as_ref() {
                        let _ = lost.try_send(());
                    }
                }
                slot.cancel_request();
                std::thread::sleep(timing.disconnect_backoff);
            }
            Err(e) => {
                shared
                    .counters
                    .transient_errors
                    .fetch_add(1, Ordering::Relaxed);
                log::trace!("Grab returned {}, retrying", e);
                std::thread::sleep(timing.transient_backoff);
            }
        }
    }
}
