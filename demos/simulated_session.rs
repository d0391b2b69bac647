//! Run a session against the simulated camera and headset and print the
//! fused transform.
//!
//! Usage: RUST_LOG=info cargo run --example simulated_session

use std::sync::Arc;
use std::time::{Duration, Instant};

use depthsync::sim::{SimulatedCamera, SimulatedHmd};
use depthsync::{
    CalibrationOffset, CalibrationStore, DeviceError, EventMask, Pose, Session, SessionConfig,
    SessionState,
};

fn main() {
    env_logger::init();

    let camera = Arc::new(SimulatedCamera::new());
    camera.fail_init(2, DeviceError::CameraNotDetected);
    let hmd = Arc::new(SimulatedHmd::present(Pose::from_translation(0.0, 1.6, 0.0)));

    let config = match SessionConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };
    let session = Session::with_calibration(
        camera.clone(),
        hmd.clone(),
        config,
        CalibrationStore::in_memory(CalibrationOffset::default()),
    );
    let events = session.subscribe(EventMask::all());

    if let Err(e) = session.start() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
    if !session.wait_for_state(SessionState::Ready, Duration::from_secs(10)) {
        eprintln!("Camera did not become ready: {:?}", session.status());
        std::process::exit(1);
    }

    let started = Instant::now();
    let mut frames = 0u32;
    while started.elapsed() < Duration::from_secs(3) {
        let t = started.elapsed().as_secs_f64();
        hmd.set_pose(Pose::from_translation(0.1 * t.sin(), 1.6, 0.0));

        if session.tick().is_some() {
            frames += 1;
            if frames % 30 == 0 {
                let fused = session.fused_transform();
                println!(
                    "frame {:4}  {:?}/{:?}  t=[{:+.3} {:+.3} {:+.3}]",
                    frames,
                    fused.tracking_state,
                    fused.source,
                    fused.translation.x,
                    fused.translation.y,
                    fused.translation.z
                );
            }
        }
        for event in events.drain() {
            println!("event: {:?}", event);
        }
        std::thread::sleep(Duration::from_millis(11));
    }

    if let Ok(stats) = session.pipeline_stats() {
        println!("{:?}", stats);
    }
    session.stop();
}
