//! Session scenarios driven by the simulated camera and headset.

use std::sync::Arc;
use std::time::{Duration, Instant};

use depthsync::sim::{SimulatedCamera, SimulatedHmd};
use depthsync::{
    CalibrationOffset, CalibrationStore, DepthCamera, DepthSyncError, DeviceError, EventMask, Frame,
    FusedTransform, Pose, PoseSource, Session, SessionConfig, SessionEvent, SessionState,
    TrackingFailurePolicy, TrackingState,
};
use nalgebra::{UnitQuaternion, Vector3};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn fast_camera() -> Arc<SimulatedCamera> {
    let camera = Arc::new(SimulatedCamera::new());
    camera.set_frame_period(Duration::from_millis(2));
    camera
}

fn session_with(
    camera: &Arc<SimulatedCamera>,
    hmd: &Arc<SimulatedHmd>,
    config: SessionConfig,
    offset: CalibrationOffset,
) -> Session {
    Session::with_calibration(
        camera.clone(),
        hmd.clone(),
        config,
        CalibrationStore::in_memory(offset),
    )
}

fn fast_config() -> SessionConfig {
    SessionConfig {
        retry_delay_ms: 20,
        warmup_grab_interval_ms: 1,
        ..SessionConfig::default()
    }
}

/// Tick until `done` holds, returning the last consumed frame.
fn tick_until(
    session: &Session,
    timeout: Duration,
    mut done: impl FnMut(&Session) -> bool,
) -> Option<Frame> {
    let deadline = Instant::now() + timeout;
    let mut last = None;
    while Instant::now() < deadline {
        if let Some(frame) = session.tick() {
            last = Some(frame);
        }
        if done(session) && last.is_some() {
            break;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    last
}

/// Keep ticking so the grab thread keeps asking the camera for frames.
fn tick_until_state(session: &Session, state: SessionState, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        session.tick();
        if session.wait_for_state(state, Duration::from_millis(2)) {
            return true;
        }
    }
    false
}

#[test]
fn test_ready_after_two_failed_inits() {
    init_logger();
    let camera = fast_camera();
    camera.fail_init(2, DeviceError::Failed(42));
    let hmd = Arc::new(SimulatedHmd::absent());
    let session = session_with(
        &camera,
        &hmd,
        SessionConfig::default(),
        CalibrationOffset::default(),
    );
    let events = session.subscribe(EventMask::READY | EventMask::RESUMED);

    let started = Instant::now();
    session.start().unwrap();
    assert!(session.wait_for_state(SessionState::Ready, Duration::from_secs(5)));
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_millis(550), "ready too early: {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(2), "ready too late: {:?}", elapsed);
    assert_eq!(session.retry_count(), 2);

    let times = camera.init_times();
    assert_eq!(times.len(), 3);
    for pair in times.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_millis(290));
    }

    assert_eq!(
        events.recv_timeout(Duration::from_secs(1)),
        Some(SessionEvent::Ready)
    );
    std::thread::sleep(Duration::from_millis(100));
    assert!(events.drain().is_empty());
    session.stop();
}

#[test]
fn test_init_attempts_are_capped() {
    init_logger();
    let camera = fast_camera();
    camera.fail_init_always(Some(DeviceError::Failed(3)));
    let hmd = Arc::new(SimulatedHmd::absent());
    let config = SessionConfig {
        retry_delay_ms: 2,
        ..SessionConfig::default()
    };
    let session = session_with(&camera, &hmd, config, CalibrationOffset::default());
    let events = session.subscribe(EventMask::OPENING_ABANDONED);

    session.start().unwrap();
    assert_eq!(
        events.recv_timeout(Duration::from_secs(10)),
        Some(SessionEvent::OpeningAbandoned { attempts: 50 })
    );

    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(camera.init_calls(), 50);
    assert_eq!(session.state(), SessionState::Opening);
    assert_eq!(session.retry_count(), 50);
    assert_eq!(session.last_status(), Some(DeviceError::Failed(3)));
    assert!(!session.is_ready());
    assert!(session.tick().is_none());

    session.stop();
    assert_eq!(session.state(), SessionState::Uninitialized);
}

#[test]
fn test_at_most_one_opening_worker() {
    init_logger();
    let camera = fast_camera();
    camera.set_init_delay(Duration::from_millis(30));
    camera.fail_init(4, DeviceError::CameraNotDetected);
    let hmd = Arc::new(SimulatedHmd::absent());
    let config = SessionConfig {
        retry_delay_ms: 1,
        ..fast_config()
    };
    let session = session_with(&camera, &hmd, config, CalibrationOffset::default());

    session.start().unwrap();
    assert!(session.wait_for_state(SessionState::Ready, Duration::from_secs(5)));
    assert_eq!(camera.init_calls(), 5);
    assert_eq!(camera.max_concurrent_inits(), 1);
}

#[test]
fn test_stop_during_slow_init_joins_worker() {
    init_logger();
    let camera = fast_camera();
    camera.set_init_delay(Duration::from_millis(200));
    let hmd = Arc::new(SimulatedHmd::absent());
    let session = session_with(&camera, &hmd, fast_config(), CalibrationOffset::default());

    session.start().unwrap();
    std::thread::sleep(Duration::from_millis(50));
    session.stop();

    // The in-flight init has returned; nothing is spawned afterwards.
    let calls = camera.init_calls();
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(camera.init_calls(), calls);
    assert!(!session.is_ready());
}

#[test]
fn test_disconnect_then_reset_resumes_from_last_pose() {
    init_logger();
    let camera = fast_camera();
    let hmd = Arc::new(SimulatedHmd::present(Pose::from_translation(0.0, 1.6, 0.0)));
    let session = session_with(&camera, &hmd, fast_config(), CalibrationOffset::default());
    let events = session.subscribe(EventMask::all());

    session.start().unwrap();
    assert!(session.wait_for_state(SessionState::Ready, Duration::from_secs(5)));
    tick_until(&session, Duration::from_millis(200), |_| false);

    camera.disconnect();
    assert!(tick_until_state(
        &session,
        SessionState::Disconnected,
        Duration::from_secs(2)
    ));
    std::thread::sleep(Duration::from_millis(100));

    let seen = events.drain();
    assert_eq!(seen.first(), Some(&SessionEvent::Ready));
    let disconnects = seen
        .iter()
        .filter(|e| **e == SessionEvent::Disconnected)
        .count();
    assert_eq!(disconnects, 1);

    let last_known = camera.tracking_pose().0;
    assert_ne!(last_known, Pose::identity());

    camera.reconnect();
    session.reset().unwrap();
    assert!(session.wait_for_state(SessionState::Ready, Duration::from_secs(5)));

    let seeds = camera.tracking_seeds();
    assert_eq!(seeds.len(), 2);
    assert_eq!(seeds[1], last_known);
    assert_eq!(
        events.recv_timeout(Duration::from_secs(1)),
        Some(SessionEvent::Resumed)
    );
}

#[test]
fn test_auto_reset_after_disconnect() {
    init_logger();
    let camera = fast_camera();
    let hmd = Arc::new(SimulatedHmd::absent());
    let config = SessionConfig {
        auto_reset: true,
        ..fast_config()
    };
    let session = session_with(&camera, &hmd, config, CalibrationOffset::default());
    let events = session.subscribe(EventMask::DISCONNECTED | EventMask::RESUMED);

    session.start().unwrap();
    assert!(session.wait_for_state(SessionState::Ready, Duration::from_secs(5)));
    tick_until(&session, Duration::from_millis(100), |_| false);
    session.set_world_offset(Pose::from_translation(1.0, 0.0, 0.0));

    camera.disconnect();
    let deadline = Instant::now() + Duration::from_secs(2);
    let mut first = None;
    while first.is_none() && Instant::now() < deadline {
        session.tick();
        first = events.recv_timeout(Duration::from_millis(2));
    }
    assert_eq!(first, Some(SessionEvent::Disconnected));
    camera.reconnect();
    assert_eq!(
        events.recv_timeout(Duration::from_secs(5)),
        Some(SessionEvent::Resumed)
    );
    assert!(session.is_ready());
    assert_eq!(camera.tracking_seeds().len(), 2);

    // The automatic restart clears consumer state like `reset` does.
    assert_eq!(session.world_offset(), Pose::identity());
    assert_eq!(session.fused_transform(), FusedTransform::untracked());
    assert_eq!(session.image_timestamp_ns(), 0);
    assert_eq!(session.camera_timestamp_ns(), 0);
}

#[test]
fn test_disconnected_session_stops_reporting_device_tracking() {
    init_logger();
    let camera = fast_camera();
    let hmd = Arc::new(SimulatedHmd::absent());
    let session = session_with(&camera, &hmd, fast_config(), CalibrationOffset::default());

    session.start().unwrap();
    assert!(session.wait_for_state(SessionState::Ready, Duration::from_secs(5)));
    tick_until(&session, Duration::from_millis(200), |s| {
        s.tracking_state() == TrackingState::Tracking
    });
    assert_eq!(session.tracking_state(), TrackingState::Tracking);
    assert_eq!(session.fused_transform().source, PoseSource::Device);

    camera.disconnect();
    assert!(tick_until_state(
        &session,
        SessionState::Disconnected,
        Duration::from_secs(2)
    ));
    for _ in 0..10 {
        assert!(session.tick().is_none());
        std::thread::sleep(Duration::from_millis(2));
    }

    assert_eq!(session.fused_transform(), FusedTransform::untracked());
    assert_eq!(session.tracking_state(), TrackingState::Off);
    assert_eq!(session.image_timestamp_ns(), 0);
}

#[test]
fn test_disconnected_session_falls_back_to_head_pose() {
    init_logger();
    let camera = fast_camera();
    let head = Pose::from_translation(0.0, 1.6, 0.0);
    let hmd = Arc::new(SimulatedHmd::present(head));
    let session = session_with(&camera, &hmd, fast_config(), CalibrationOffset::identity());

    session.start().unwrap();
    assert!(session.wait_for_state(SessionState::Ready, Duration::from_secs(5)));
    tick_until(&session, Duration::from_millis(100), |_| false);

    camera.disconnect();
    assert!(tick_until_state(
        &session,
        SessionState::Disconnected,
        Duration::from_secs(2)
    ));
    let moved = Pose::from_translation(0.3, 1.6, 0.0);
    hmd.set_pose(moved);
    session.tick();

    let fused = session.fused_transform();
    assert_eq!(fused.source, PoseSource::Hmd);
    assert!((fused.translation - moved.translation).norm() < 1e-9);
}

#[test]
fn test_tick_does_not_wait_for_slow_grab() {
    init_logger();
    let camera = fast_camera();
    let hmd = Arc::new(SimulatedHmd::present(Pose::from_translation(0.0, 1.6, 0.0)));
    let session = session_with(&camera, &hmd, fast_config(), CalibrationOffset::default());

    session.start().unwrap();
    assert!(session.wait_for_state(SessionState::Ready, Duration::from_secs(5)));
    tick_until(&session, Duration::from_millis(50), |_| false);

    camera.set_frame_period(Duration::from_millis(200));
    // Consume whatever is waiting so the next grab is the slow one.
    tick_until(&session, Duration::from_millis(30), |_| false);

    let grabs_before = camera.grab_count();
    let deadline = Instant::now() + Duration::from_millis(300);
    let mut slowest = Duration::ZERO;
    let mut frames = 0;
    while Instant::now() < deadline {
        let started = Instant::now();
        if session.tick().is_some() {
            frames += 1;
        }
        slowest = slowest.max(started.elapsed());
        std::thread::sleep(Duration::from_millis(5));
    }

    assert!(slowest < Duration::from_millis(20), "tick took {:?}", slowest);
    assert!(frames <= 2, "{} frames from a 200 ms camera", frames);
    assert!(camera.grab_count() - grabs_before <= 3);
    session.stop();
}

#[test]
fn test_nothing_tracked_outputs_identity_off() {
    init_logger();
    let camera = fast_camera();
    let hmd = Arc::new(SimulatedHmd::absent());
    let config = SessionConfig {
        enable_tracking: false,
        ..fast_config()
    };
    let session = session_with(&camera, &hmd, config, CalibrationOffset::default());

    session.start().unwrap();
    assert!(session.wait_for_state(SessionState::Ready, Duration::from_secs(5)));
    let frame = tick_until(&session, Duration::from_secs(2), |_| true);

    let frame = frame.expect("no frame consumed");
    assert_eq!(frame.tracking_state, TrackingState::Off);
    assert!(camera.tracking_seeds().is_empty());
    assert_eq!(session.fused_transform(), FusedTransform::untracked());
    assert_eq!(session.tracking_state(), TrackingState::Off);
}

#[test]
fn test_calibration_offset_round_trips_through_head_pose() {
    init_logger();
    let camera = fast_camera();
    camera.set_motion(Arc::new(|_| Pose::identity()));
    let head = Pose::new(
        Vector3::new(0.2, 1.6, -0.3),
        UnitQuaternion::from_axis_angle(&Vector3::y_axis(), 0.5),
    );
    let hmd = Arc::new(SimulatedHmd::present(head));
    let offset = CalibrationOffset::from_translation(0.03, 0.0, 0.1);
    let session = session_with(&camera, &hmd, fast_config(), offset);

    session.start().unwrap();
    assert!(session.wait_for_state(SessionState::Ready, Duration::from_secs(5)));
    let frame = tick_until(&session, Duration::from_secs(2), |s| {
        s.latency_pose().is_some()
    })
    .expect("no frame consumed");

    let fused = session.fused_transform();
    assert_eq!(fused.tracking_state, TrackingState::Tracking);
    assert_eq!(fused.source, PoseSource::Device);

    let path = frame.tracking_pose;
    let expected = path.rotation * offset.translation;
    assert!((fused.translation - path.translation - expected).norm() < 1e-9);

    let recovered = path.inverse().compose(&fused.pose());
    assert!((recovered.translation - offset.translation).norm() < 1e-9);
    assert!(recovered.rotation.angle_to(&offset.rotation) < 1e-9);
}

#[test]
fn test_setting_same_calibration_twice_is_idempotent() {
    init_logger();
    let camera = fast_camera();
    camera.set_motion(Arc::new(|_| Pose::identity()));
    let hmd = Arc::new(SimulatedHmd::present(Pose::from_translation(0.0, 1.6, 0.0)));
    let session = session_with(&camera, &hmd, fast_config(), CalibrationOffset::identity());
    let changes = session.subscribe(EventMask::CALIBRATION_CHANGED);

    session.start().unwrap();
    assert!(session.wait_for_state(SessionState::Ready, Duration::from_secs(5)));
    tick_until(&session, Duration::from_secs(2), |s| s.latency_pose().is_some());

    let offset = CalibrationOffset::from_translation(0.03, 0.0, 0.1);
    session.set_calibration_transform(offset);
    session.tick();
    let first = session.fused_transform();
    session.set_calibration_transform(offset);
    session.tick();
    let second = session.fused_transform();

    assert!((first.translation - second.translation).norm() < 1e-9);
    assert_eq!(
        changes.drain(),
        vec![SessionEvent::CalibrationChanged(offset)]
    );
    assert_eq!(session.calibration_transform(), offset);
}

#[test]
fn test_tracking_failure_degrades_to_hmd() {
    init_logger();
    let camera = fast_camera();
    camera.fail_tracking(Some(DeviceError::Failed(9)));
    let hmd = Arc::new(SimulatedHmd::present(Pose::from_translation(0.0, 1.6, 0.0)));
    let session = session_with(&camera, &hmd, fast_config(), CalibrationOffset::identity());
    let events = session.subscribe(EventMask::TRACKING_UNAVAILABLE | EventMask::READY);

    session.start().unwrap();
    assert!(session.wait_for_state(SessionState::Ready, Duration::from_secs(5)));
    assert_eq!(
        events.recv_timeout(Duration::from_secs(1)),
        Some(SessionEvent::TrackingUnavailable)
    );
    assert_eq!(
        events.recv_timeout(Duration::from_secs(1)),
        Some(SessionEvent::Ready)
    );
    assert!(!session.status().tracking_enabled);

    tick_until(&session, Duration::from_secs(2), |s| {
        s.fused_transform().source == PoseSource::Hmd
    });
    let fused = session.fused_transform();
    assert_eq!(fused.source, PoseSource::Hmd);
    assert!((fused.translation - Vector3::new(0.0, 1.6, 0.0)).norm() < 1e-9);
}

#[test]
fn test_tracking_failure_can_halt_session() {
    init_logger();
    let camera = fast_camera();
    camera.fail_tracking(Some(DeviceError::Failed(9)));
    let hmd = Arc::new(SimulatedHmd::absent());
    let config = SessionConfig {
        tracking_failure: TrackingFailurePolicy::FailSession,
        ..fast_config()
    };
    let session = session_with(&camera, &hmd, config, CalibrationOffset::default());
    let events = session.subscribe(EventMask::all());

    session.start().unwrap();
    assert_eq!(
        events.recv_timeout(Duration::from_secs(5)),
        Some(SessionEvent::TrackingUnavailable)
    );
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(session.state(), SessionState::TrackingInit);
    assert_eq!(session.last_status(), Some(DeviceError::Failed(9)));
    assert!(!camera.is_open());
    assert!(events.drain().is_empty());
}

#[test]
fn test_caller_contract_errors() {
    init_logger();
    let camera = fast_camera();
    let hmd = Arc::new(SimulatedHmd::absent());
    let session = session_with(&camera, &hmd, fast_config(), CalibrationOffset::default());

    assert!(session.tick().is_none());
    assert!(matches!(
        session.pipeline_stats(),
        Err(DepthSyncError::InvalidState {
            expected: SessionState::Ready,
            actual: SessionState::Uninitialized
        })
    ));

    session.start().unwrap();
    assert!(matches!(session.start(), Err(DepthSyncError::AlreadyStarted)));
    assert!(session.wait_for_state(SessionState::Ready, Duration::from_secs(5)));
    tick_until(&session, Duration::from_secs(2), |_| true);

    let stats = session.pipeline_stats().unwrap();
    assert!(stats.frames >= 1);
    assert!(stats.consumed >= 1);
    assert!(stats.grabs >= stats.frames);

    session.stop();
    session.stop();
    assert!(!camera.is_open());
}

#[test]
fn test_reload_calibration_from_file() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("calibration.toml");
    std::fs::write(&path, "[hmd_to_camera]\ntranslation = [0.0, 0.0, 0.1]\n").unwrap();

    let camera = fast_camera();
    let hmd: Arc<SimulatedHmd> = Arc::new(SimulatedHmd::absent());
    let session = Session::with_calibration(
        camera.clone(),
        hmd.clone(),
        fast_config(),
        CalibrationStore::open(&path),
    );
    let changes = session.subscribe(EventMask::CALIBRATION_CHANGED);
    assert!((session.calibration_transform().translation.z - 0.1).abs() < 1e-12);

    assert!(!session.reload_calibration().unwrap());

    std::fs::write(&path, "[hmd_to_camera]\ntranslation = [0.03, 0.0, 0.1]\n").unwrap();
    assert!(session.reload_calibration().unwrap());
    assert!((session.calibration_transform().translation.x - 0.03).abs() < 1e-12);
    assert_eq!(changes.drain().len(), 1);

    std::fs::write(&path, "not toml at all [").unwrap();
    assert!(matches!(
        session.reload_calibration(),
        Err(DepthSyncError::Config { .. })
    ));
}
