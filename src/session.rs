//! Device session: lifecycle supervision and the per-tick consumer.
//!
//! ```text
//!  Uninitialized ─start─▶ Opening ─init ok─▶ TrackingInit ─▶ Ready ─camera lost─▶ Disconnected
//!                            ▲                                                      │
//!                            └──────────────────────── reset ───────────────────────┘
//! ```
//!
//! Startup runs on a `depthsync-lifecycle` thread so [`Session::start`] and
//! [`Session::tick`] return immediately. That thread spawns one short-lived
//! `depthsync-open` worker per init attempt, joins it before deciding on the
//! next one, then runs the one-shot `depthsync-tracking-init` worker and
//! blocks on it before the acquisition pipeline is started.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::calibration::{CalibrationOffset, CalibrationStore, Reload};
use crate::config::{SessionConfig, TrackingFailurePolicy};
use crate::device::{DepthCamera, Hmd};
use crate::drift::{DriftCorrector, FusionInput};
use crate::error::{DeviceError, DeviceResult};
use crate::events::{EventHub, EventMask, SessionEvent, Subscription, SubscriptionId};
use crate::history::{LatencyCorrector, LatencySample, PoseHistory};
use crate::pipeline::{FrameAcquisitionPipeline, PipelineStats};
use crate::types::{Frame, FusedTransform, Pose, SessionState, TrackingState};
use crate::{DepthSyncError, Result};

/// Status code recorded when a worker thread could not be spawned or panicked.
const WORKER_FAILED: i32 = -1;

/// Snapshot of the session's lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionStatus {
    pub state: SessionState,
    /// Failed init attempts since the last start.
    pub retry_count: u32,
    /// Most recent non-success status from the camera.
    pub last_status: Option<DeviceError>,
    /// Device tracking was enabled for the current run.
    pub tracking_enabled: bool,
}

struct Inner {
    camera: Arc<dyn DepthCamera>,
    hmd: Arc<dyn Hmd>,
    config: SessionConfig,
    status: Mutex<SessionStatus>,
    status_changed: Condvar,
    pipeline: Mutex<Option<FrameAcquisitionPipeline>>,
    /// Pose the next tracking init starts from.
    seed: Mutex<Option<Pose>>,
    events: EventHub,
    ready_fired: AtomicBool,
    consumer: Mutex<Consumer>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    fn status(&self) -> SessionStatus {
        *lock(&self.status)
    }

    fn update_status<R>(&self, f: impl FnOnce(&mut SessionStatus) -> R) -> R {
        let mut status = lock(&self.status);
        let before = status.state;
        let out = f(&mut status);
        if status.state != before {
            log::info!("Session {:?} -> {:?}", before, status.state);
        }
        self.status_changed.notify_all();
        out
    }

    fn set_state(&self, state: SessionState) {
        self.update_status(|s| s.state = state);
    }

    /// Remember where tracking was so the next run resumes there.
    fn capture_seed(&self) {
        if !self.status().tracking_enabled {
            return;
        }
        let pose = self.camera.position();
        log::info!(
            "Caching tracked position {:?} for resume",
            pose.translation.as_slice()
        );
        *lock(&self.seed) = Some(pose);
    }

    fn take_pipeline(&self) -> Option<FrameAcquisitionPipeline> {
        lock(&self.pipeline).take()
    }

    /// Drop the frame that was fused last so nothing keeps reporting it.
    fn forget_frame(&self) {
        let mut consumer = lock(&self.consumer);
        consumer.last_frame = None;
        consumer.fused = FusedTransform::untracked();
    }

    /// Consumer half of a reset: the camera clock may restart after reopening.
    fn reset_consumer(&self) {
        let mut consumer = lock(&self.consumer);
        consumer.latency.reset();
        consumer.last_frame = None;
        consumer.fused = FusedTransform::untracked();
        consumer.camera_timestamp_ns = 0;
        consumer.drift.set_world_offset(Pose::identity());
    }
}

/// Consumer-side state, touched from the engine tick.
struct Consumer {
    latency: LatencyCorrector,
    drift: DriftCorrector,
    calibration: CalibrationStore,
    last_frame: Option<Frame>,
    fused: FusedTransform,
    camera_timestamp_ns: u64,
}

struct Lifecycle {
    shutdown: Sender<()>,
    thread: JoinHandle<()>,
}

/// One depth camera paired with one HMD.
///
/// Construct once and share by reference; every method takes `&self`.
pub struct Session {
    inner: Arc<Inner>,
    lifecycle: Mutex<Option<Lifecycle>>,
}

impl Session {
    /// Session with the calibration read from the configured file, or the
    /// per-user default location.
    pub fn new(camera: Arc<dyn DepthCamera>, hmd: Arc<dyn Hmd>, config: SessionConfig) -> Self {
        let calibration = match config.calibration_path() {
            Some(path) => CalibrationStore::open(path),
            None => CalibrationStore::in_memory(CalibrationOffset::default()),
        };
        Self::with_calibration(camera, hmd, config, calibration)
    }

    pub fn with_calibration(
        camera: Arc<dyn DepthCamera>,
        hmd: Arc<dyn Hmd>,
        config: SessionConfig,
        calibration: CalibrationStore,
    ) -> Self {
        let history = PoseHistory::new(config.history_capacity, config.history_max_age_ns());
        let consumer = Consumer {
            latency: LatencyCorrector::new(history),
            drift: DriftCorrector::new(calibration.current()),
            calibration,
            last_frame: None,
            fused: FusedTransform::untracked(),
            camera_timestamp_ns: 0,
        };
        Self {
            inner: Arc::new(Inner {
                camera,
                hmd,
                config,
                status: Mutex::new(SessionStatus::default()),
                status_changed: Condvar::new(),
                pipeline: Mutex::new(None),
                seed: Mutex::new(None),
                events: EventHub::new(),
                ready_fired: AtomicBool::new(false),
                consumer: Mutex::new(consumer),
            }),
            lifecycle: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Begin opening the camera in the background.
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = lock(&self.lifecycle);
        if lifecycle.is_some() {
            return Err(DepthSyncError::AlreadyStarted);
        }

        self.inner.update_status(|s| {
            *s = SessionStatus {
                state: SessionState::Opening,
                ..SessionStatus::default()
            }
        });

        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(0);
        let inner = self.inner.clone();
        let thread = std::thread::Builder::new()
            .name("depthsync-lifecycle".into())
            .spawn(move || run_lifecycle(inner, shutdown_rx))
            .map_err(|e| {
                self.inner.set_state(SessionState::Uninitialized);
                DepthSyncError::ThreadSpawn {
                    name: "depthsync-lifecycle",
                    source: e,
                }
            })?;

        *lifecycle = Some(Lifecycle {
            shutdown: shutdown_tx,
            thread,
        });
        Ok(())
    }

    /// Stop every owned thread and close the camera. Blocks until an
    /// in-flight init or grab call returns.
    pub fn stop(&self) {
        let lifecycle = lock(&self.lifecycle).take();
        let Some(lifecycle) = lifecycle else {
            return;
        };

        drop(lifecycle.shutdown);
        if lifecycle.thread.join().is_err() {
            log::error!("Lifecycle thread panicked");
        }
        if let Some(pipeline) = self.inner.take_pipeline() {
            pipeline.stop();
        }
        self.inner.camera.close();
        self.inner.update_status(|s| {
            s.state = SessionState::Uninitialized;
            s.tracking_enabled = false;
        });
        log::info!("Session stopped");
    }

    /// Tear down and start over, resuming device tracking from the last
    /// known position.
    pub fn reset(&self) -> Result<()> {
        log::info!("Resetting session");
        self.inner.capture_seed();
        self.stop();
        self.inner.reset_consumer();
        self.start()
    }

    /// Per-frame consumer step. Never waits on the acquisition thread.
    ///
    /// Takes the newest frame if one is waiting, records the head pose
    /// against the camera clock and recomputes the fused transform. Returns
    /// the frame consumed this tick, if any.
    ///
    /// Once the camera is lost the output falls back to the current head
    /// pose, or the untracked identity without an HMD.
    pub fn tick(&self) -> Option<Frame> {
        let mut consumer = lock(&self.inner.consumer);
        let consumer = &mut *consumer;

        let hmd_pose = self
            .inner
            .hmd
            .is_present()
            .then(|| self.inner.hmd.head_local_pose());

        let (frame, tracking_enabled) = {
            let pipeline = lock(&self.inner.pipeline);
            let status = self.inner.status();
            let lost = status.state == SessionState::Disconnected
                || pipeline.as_ref().is_some_and(|p| p.is_disconnected());
            if lost {
                consumer.last_frame = None;
                consumer.fused = consumer.drift.fuse_head_only(hmd_pose);
                return None;
            }
            let Some(pipeline) = pipeline.as_ref() else {
                return None;
            };
            (pipeline.poll_frame(), status.tracking_enabled)
        };
        if let Some(frame) = frame {
            consumer.last_frame = Some(frame);
        }
        if let Some(now) = self.inner.camera.current_timestamp() {
            consumer.camera_timestamp_ns = now;
            if let Some(pose) = hmd_pose {
                consumer.latency.collect(pose, now);
            }
        }

        let Some(current) = consumer.last_frame else {
            return frame;
        };

        let latency = match hmd_pose {
            Some(_) => {
                consumer
                    .latency
                    .extract(current.capture_timestamp_ns, self.inner.config.use_latency);
                consumer.latency.latency_pose()
            }
            None => None,
        };
        let input = FusionInput {
            device: tracking_enabled.then_some((current.tracking_pose, current.tracking_state)),
            hmd: hmd_pose,
            latency,
        };
        match consumer.drift.fuse(&input) {
            Some(fused) => consumer.fused = fused,
            None => log::trace!(
                "No head pose at capture time {}, keeping previous transform",
                current.capture_timestamp_ns
            ),
        }
        frame
    }

    pub fn state(&self) -> SessionState {
        self.inner.status().state
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.status()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    pub fn retry_count(&self) -> u32 {
        self.inner.status().retry_count
    }

    pub fn last_status(&self) -> Option<DeviceError> {
        self.inner.status().last_status
    }

    /// Block up to `timeout` until the session reaches `state`.
    pub fn wait_for_state(&self, state: SessionState, timeout: Duration) -> bool {
        let status = lock(&self.inner.status);
        let (status, _) = self
            .inner
            .status_changed
            .wait_timeout_while(status, timeout, |s| s.state != state)
            .unwrap_or_else(PoisonError::into_inner);
        status.state == state
    }

    pub fn fused_transform(&self) -> FusedTransform {
        lock(&self.inner.consumer).fused
    }

    pub fn tracking_state(&self) -> TrackingState {
        self.fused_transform().tracking_state
    }

    /// Capture time of the frame currently used for fusion, 0 before the first frame.
    pub fn image_timestamp_ns(&self) -> u64 {
        lock(&self.inner.consumer)
            .last_frame
            .map_or(0, |f| f.capture_timestamp_ns)
    }

    /// Camera clock as read on the last tick.
    pub fn camera_timestamp_ns(&self) -> u64 {
        lock(&self.inner.consumer).camera_timestamp_ns
    }

    /// Head pose at the current frame's capture time, if the lookup succeeded.
    pub fn latency_pose(&self) -> Option<LatencySample> {
        lock(&self.inner.consumer).latency.latency_pose()
    }

    pub fn calibration_transform(&self) -> CalibrationOffset {
        lock(&self.inner.consumer).calibration.current()
    }

    /// Replace the HMD-to-camera offset. Applies from the next tick.
    pub fn set_calibration_transform(&self, offset: CalibrationOffset) {
        let mut consumer = lock(&self.inner.consumer);
        if let Reload::Changed(offset) = consumer.calibration.set(offset) {
            self.apply_calibration(&mut consumer, offset);
        }
    }

    /// Re-read the calibration file. Returns whether the offset changed.
    pub fn reload_calibration(&self) -> Result<bool> {
        let mut consumer = lock(&self.inner.consumer);
        match consumer.calibration.reload()? {
            Reload::Changed(offset) => {
                self.apply_calibration(&mut consumer, offset);
                Ok(true)
            }
            Reload::Unchanged => Ok(false),
        }
    }

    /// Write the current offset to the calibration file, if there is one.
    pub fn save_calibration(&self) -> Result<()> {
        lock(&self.inner.consumer).calibration.save()
    }

    pub fn calibration_path(&self) -> Option<PathBuf> {
        lock(&self.inner.consumer)
            .calibration
            .path()
            .map(|p| p.to_path_buf())
    }

    fn apply_calibration(&self, consumer: &mut Consumer, offset: CalibrationOffset) {
        consumer.drift.set_calibration_transform(&offset);
        log::info!(
            "Calibration offset now t={:?} q={:?}",
            offset.translation.as_slice(),
            offset.as_pose().quaternion_xyzw()
        );
        self.inner
            .events
            .publish(SessionEvent::CalibrationChanged(offset));
    }

    /// Constant world-frame offset applied after fusion. Cleared by `reset`.
    pub fn set_world_offset(&self, offset: Pose) {
        lock(&self.inner.consumer).drift.set_world_offset(offset);
    }

    pub fn world_offset(&self) -> Pose {
        lock(&self.inner.consumer).drift.world_offset()
    }

    pub fn subscribe(&self, mask: EventMask) -> Subscription {
        self.inner.events.subscribe(mask)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.events.unsubscribe(id)
    }

    /// Acquisition counters. Only available while the pipeline runs.
    pub fn pipeline_stats(&self) -> Result<PipelineStats> {
        lock(&self.inner.pipeline)
            .as_ref()
            .map(|p| p.stats())
            .ok_or_else(|| DepthSyncError::InvalidState {
                expected: SessionState::Ready,
                actual: self.state(),
            })
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Outcome of one lifecycle phase.
enum Phase {
    Done,
    /// Nothing more to do until stop or reset.
    Parked,
    Shutdown,
}

/// Sleep up to `timeout`. Returns true once the session is shutting down.
fn interrupted(shutdown: &Receiver<()>, timeout: Duration) -> bool {
    !matches!(
        shutdown.recv_timeout(timeout),
        Err(RecvTimeoutError::Timeout)
    )
}

fn park(shutdown: &Receiver<()>) {
    let _ = shutdown.recv();
}

fn run_lifecycle(inner: Arc<Inner>, shutdown: Receiver<()>) {
    log::info!("Lifecycle thread started");
    let (lost_tx, lost_rx) = crossbeam_channel::bounded::<()>(1);

    loop {
        match open_camera(&inner, &shutdown) {
            Phase::Done => {}
            Phase::Parked => return park(&shutdown),
            Phase::Shutdown => return,
        }

        inner.set_state(SessionState::TrackingInit);
        let tracking = match init_tracking(&inner) {
            Ok(enabled) => enabled,
            Err(e) => match inner.config.tracking_failure {
                TrackingFailurePolicy::Degrade => {
                    log::warn!("Tracking unavailable ({}), continuing without device tracking", e);
                    inner.update_status(|s| s.last_status = Some(e));
                    inner.events.publish(SessionEvent::TrackingUnavailable);
                    false
                }
                TrackingFailurePolicy::FailSession => {
                    log::error!("Tracking could not be initialized ({}), session halted", e);
                    inner.update_status(|s| s.last_status = Some(e));
                    inner.events.publish(SessionEvent::TrackingUnavailable);
                    inner.camera.close();
                    return park(&shutdown);
                }
            },
        };
        inner.update_status(|s| s.tracking_enabled = tracking);

        let pipeline = match FrameAcquisitionPipeline::start(
            inner.camera.clone(),
            tracking,
            inner.config.pipeline_timing(),
            Some(lost_tx.clone()),
        ) {
            Ok(p) => p,
            Err(e) => {
                log::error!("{}", e);
                return park(&shutdown);
            }
        };
        *lock(&inner.pipeline) = Some(pipeline);

        inner.set_state(SessionState::Ready);
        if inner.ready_fired.swap(true, Ordering::AcqRel) {
            inner.events.publish(SessionEvent::Resumed);
        } else {
            inner.events.publish(SessionEvent::Ready);
        }

        crossbeam_channel::select! {
            recv(shutdown) -> _ => return,
            recv(lost_rx) -> _ => {}
        }

        inner.forget_frame();
        inner.update_status(|s| {
            s.state = SessionState::Disconnected;
            s.last_status = Some(DeviceError::CameraNotDetected);
        });
        inner.events.publish(SessionEvent::Disconnected);

        if !inner.config.auto_reset {
            return park(&shutdown);
        }

        log::info!("Camera lost, restarting automatically");
        inner.capture_seed();
        if let Some(pipeline) = inner.take_pipeline() {
            pipeline.stop();
        }
        inner.camera.close();
        inner.reset_consumer();
        inner.update_status(|s| {
            *s = SessionStatus {
                state: SessionState::Opening,
                ..SessionStatus::default()
            }
        });
        if interrupted(&shutdown, inner.config.retry_delay()) {
            return;
        }
    }
}

/// Retry `init` on a fresh worker until it succeeds or the attempt cap is hit.
fn open_camera(inner: &Arc<Inner>, shutdown: &Receiver<()>) -> Phase {
    let max_attempts = inner.config.max_open_attempts;
    let mut previous: Option<DeviceError> = None;
    let mut repeats = 0u32;

    loop {
        let result = match run_open_worker(inner, shutdown) {
            Some(result) => result,
            None => return Phase::Shutdown,
        };

        let e = match result {
            Ok(()) => {
                let attempts = inner.update_status(|s| {
                    s.last_status = None;
                    s.retry_count + 1
                });
                log::info!("Camera opened after {} attempt(s)", attempts);
                return Phase::Done;
            }
            Err(e) => e,
        };

        let failures = inner.update_status(|s| {
            s.retry_count += 1;
            s.last_status = Some(e);
            s.retry_count
        });

        if previous == Some(e) {
            repeats += 1;
            if repeats % 2 == 0 {
                log::warn!("Camera init still failing: {} ({} attempts)", e, failures);
            } else {
                log::debug!("Camera init failed: {} ({} attempts)", e, failures);
            }
        } else {
            repeats = 0;
            log::warn!("Camera init failed: {}", e);
        }
        previous = Some(e);

        if failures >= max_attempts {
            log::error!("Stopping camera initialization after {} attempts", failures);
            inner.events.publish(SessionEvent::OpeningAbandoned { attempts: failures });
            return Phase::Parked;
        }

        if interrupted(shutdown, inner.config.retry_delay()) {
            return Phase::Shutdown;
        }
    }
}

/// One `init` call on its own thread. `None` if shutdown was requested; the
/// worker is joined either way.
fn run_open_worker(inner: &Arc<Inner>, shutdown: &Receiver<()>) -> Option<DeviceResult<()>> {
    let (result_tx, result_rx) = crossbeam_channel::bounded(1);
    let camera = inner.camera.clone();
    let params = inner.config.init.clone();

    let worker = std::thread::Builder::new()
        .name("depthsync-open".into())
        .spawn(move || {
            let _ = result_tx.send(camera.init(&params));
        });
    let worker = match worker {
        Ok(w) => w,
        Err(e) => {
            log::error!("Failed to spawn opening worker: {}", e);
            return Some(Err(DeviceError::Failed(WORKER_FAILED)));
        }
    };

    let result = crossbeam_channel::select! {
        recv(result_rx) -> r => Some(r.unwrap_or(Err(DeviceError::Failed(WORKER_FAILED)))),
        recv(shutdown) -> _ => None,
    };
    if worker.join().is_err() {
        log::error!("Opening worker panicked");
    }
    result
}

/// Warm up the camera and enable its tracking on the one-shot worker.
/// `Ok(false)` when tracking is disabled by configuration.
fn init_tracking(inner: &Arc<Inner>) -> DeviceResult<bool> {
    let config = &inner.config;
    if !config.enable_tracking {
        log::info!("Device tracking disabled by configuration");
        return Ok(false);
    }

    let seed = lock(&inner.seed).take().unwrap_or_else(|| {
        if inner.hmd.is_present() {
            inner.hmd.head_local_pose()
        } else {
            Pose::identity()
        }
    });

    let options = config.tracking_options();
    let area_file = match config.area_file.as_ref() {
        Some(path) if config.spatial_memory && !path.exists() => {
            log::info!("Area file {} does not exist, ignoring", path.display());
            None
        }
        Some(path) if config.spatial_memory => Some(path.clone()),
        _ => None,
    };
    let warmup_attempts = config.warmup_grab_attempts;
    let warmup_interval = config.warmup_grab_interval();
    let camera = inner.camera.clone();

    let worker = std::thread::Builder::new()
        .name("depthsync-tracking-init".into())
        .spawn(move || {
            let mut grabbed = camera.grab();
            let mut tries = 0;
            while grabbed.is_err() && tries < warmup_attempts {
                std::thread::sleep(warmup_interval);
                grabbed = camera.grab();
                tries += 1;
            }
            if let Err(e) = grabbed {
                log::warn!("No frame after {} warm-up grabs ({}), enabling tracking anyway", tries, e);
            }
            camera.enable_tracking(&seed, options, area_file.as_deref())
        });

    let result = match worker {
        Ok(worker) => worker.join().unwrap_or_else(|_| {
            log::error!("Tracking init worker panicked");
            Err(DeviceError::Failed(WORKER_FAILED))
        }),
        Err(e) => {
            log::error!("Failed to spawn tracking init worker: {}", e);
            Err(DeviceError::Failed(WORKER_FAILED))
        }
    };
    result?;

    log::info!(
        "Device tracking enabled from {:?} ({:?})",
        seed.translation.as_slice(),
        options
    );
    Ok(true)
}
