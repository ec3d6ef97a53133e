//! Shared rig construction for integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::time::Duration;
use ultrasonic_daq::config::MotionConfig;
use ultrasonic_daq::experiment::{SweepCoordinator, SweepPlan};
use ultrasonic_daq::hardware::acquisition::{AcquisitionTrigger, CaptureTiming};
use ultrasonic_daq::hardware::mock::{SimulatedEndpoint, SimulatedEngine};
use ultrasonic_daq::hardware::motion::MotionController;
use ultrasonic_daq::storage::archive::{MetadataValue, ScanMetadata};
use ultrasonic_daq::storage::channel_map::AcqMode;
use ultrasonic_daq::storage::writer::ArchiveHandle;

/// Motion configuration with every settle set to zero.
pub fn instant_motion() -> MotionConfig {
    MotionConfig {
        initial_settle: Duration::ZERO,
        coarse_settle: Duration::ZERO,
        fine_settle: Duration::ZERO,
        final_settle: Duration::ZERO,
        ..MotionConfig::default()
    }
}

/// Capture timing fast enough for tests, with a short timeout.
pub fn fast_timing() -> CaptureTiming {
    CaptureTiming {
        start_delay: Duration::ZERO,
        poll_interval: Duration::from_millis(2),
        max_wait: Duration::from_millis(100),
    }
}

pub fn plan(sources: u32, receivers: u32, channel_dir: &Path) -> SweepPlan {
    SweepPlan {
        source_count: sources,
        receiver_count: receivers,
        mode: AcqMode::Fmc,
        metadata: ScanMetadata::from_iter([
            ("Sample".to_string(), MetadataValue::from("test block")),
            ("Water Temp".to_string(), MetadataValue::from(21.5)),
        ]),
        channel_dir: channel_dir.to_path_buf(),
        archive_path: None,
    }
}

/// Simulated endpoints kept for inspecting the commands they received.
pub struct Stages {
    pub large: SimulatedEndpoint,
    pub small: SimulatedEndpoint,
}

pub fn coordinator(
    plan: SweepPlan,
    engine: SimulatedEngine,
    archive: ArchiveHandle,
) -> (SweepCoordinator, Stages) {
    let stages = Stages {
        large: SimulatedEndpoint::new(),
        small: SimulatedEndpoint::new(),
    };
    let motion = MotionController::new(
        instant_motion(),
        Box::new(stages.large.clone()),
        Box::new(stages.small.clone()),
    );
    let trigger = AcquisitionTrigger::new(Box::new(engine), fast_timing());
    (SweepCoordinator::new(plan, motion, trigger, archive), stages)
}
