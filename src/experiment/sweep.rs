//! Sweep coordinator.
//!
//! Drives the two stages through the transmitter/receiver position grid,
//! captures one matrix per pair and hands each to the archive writer without
//! waiting for it. Motion and capture run strictly in sequence on the calling
//! task; archive writes overlap with them and are joined before the archive
//! is closed.
//!
//! # Sweep
//!
//! ```text
//! initialize stages, small stage to its initial offset
//! for s in 1..=sources
//!     s > 1: large stage one step
//!     for r in 1..=receivers
//!         r > 1: small stage one step
//!         capture (s, r), dispatch archive write
//!     small stage back to its sub-home
//! small stage back by -offset, large stage back to its start
//! drain writes, close archive
//! ```
//!
//! An abort (operator signal, command failure, acquisition timeout) stops new
//! moves and captures at the next check point. The return moves, the drain
//! and the archive close still happen, so the archive always holds a
//! consistent subset of the grid.

use crate::config::{MotionConfig, ScanConfig};
use crate::error::{AppResult, ScanError};
use crate::experiment::state::{SweepPosition, SweepState};
use crate::experiment::summary::{FailedWrite, ScanSummary};
use crate::hardware::acquisition::AcquisitionTrigger;
use crate::hardware::motion::{self, Actuator, MotionController};
use crate::storage::archive::{EntryKey, ScanMetadata};
use crate::storage::channel_map::{AcqMode, ChannelFiles};
use crate::storage::writer::{ArchiveHandle, DrainReport, WriteGroup};
use chrono::{DateTime, Local};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Cloneable abort flag.
///
/// Once raised it stays raised. Every clone observes the same flag.
#[derive(Clone, Debug)]
pub struct AbortSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortSignal {
    /// Signal that has not been raised.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Ask the sweep to stop at its next check point.
    pub fn raise(&self) {
        if !self.tx.send_replace(true) {
            info!("Abort requested");
        }
    }

    /// Whether [`raise`](Self::raise) has been called.
    pub fn is_raised(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the signal is raised.
    pub async fn raised(&self) {
        let mut rx = self.tx.subscribe();
        if rx.wait_for(|raised| *raised).await.is_err() {
            // Unreachable while `self` holds the sender
            std::future::pending::<()>().await;
        }
    }
}

/// Geometry and bookkeeping for one sweep.
#[derive(Debug, Clone)]
pub struct SweepPlan {
    /// Transmitter positions
    pub source_count: u32,
    /// Receiver positions per transmitter position
    pub receiver_count: u32,
    /// Channel mapping written to the side files
    pub mode: AcqMode,
    /// Operator metadata for the archive root
    pub metadata: ScanMetadata,
    /// Directory receiving the channel-map files, where the acquisition routine reads them
    pub channel_dir: PathBuf,
    /// Archive file reported in the summary
    pub archive_path: Option<PathBuf>,
}

impl SweepPlan {
    /// Plan described by `config`.
    pub fn from_config(config: &ScanConfig) -> AppResult<Self> {
        let count = |name: &str, value: usize| {
            u32::try_from(value)
                .ok()
                .filter(|v| *v > 0)
                .ok_or_else(|| ScanError::Configuration(format!("invalid {name} {value}")))
        };
        Ok(Self {
            source_count: count("source_count", config.scan.source_count)?,
            receiver_count: count("receiver_count", config.scan.receiver_count)?,
            mode: config.scan.mode,
            metadata: config.scan.metadata.clone(),
            channel_dir: config.acquisition.working_dir.clone(),
            archive_path: Some(config.storage.archive_path()),
        })
    }

    /// Number of pairs a complete sweep captures.
    pub fn expected(&self) -> usize {
        self.source_count as usize * self.receiver_count as usize
    }

    /// Every pair in sweep order.
    pub fn keys(&self) -> impl Iterator<Item = EntryKey> {
        EntryKey::grid(self.source_count, self.receiver_count)
    }
}

/// Runs one sweep over injected motion, acquisition and archive components.
pub struct SweepCoordinator {
    motion: MotionController,
    trigger: AcquisitionTrigger,
    archive: ArchiveHandle,
    plan: SweepPlan,
    abort: AbortSignal,
    state: SweepState,
    position: SweepPosition,
}

impl SweepCoordinator {
    /// Coordinator for `plan`, with a fresh abort signal.
    ///
    /// The trigger's engine is opened by [`run`](Self::run), not here.
    pub fn new(
        plan: SweepPlan,
        motion: MotionController,
        trigger: AcquisitionTrigger,
        archive: ArchiveHandle,
    ) -> Self {
        Self {
            motion,
            trigger,
            archive,
            plan,
            abort: AbortSignal::new(),
            state: SweepState::Idle,
            position: SweepPosition::new(),
        }
    }

    /// Use an existing abort signal instead of a fresh one.
    pub fn with_abort_signal(mut self, abort: AbortSignal) -> Self {
        self.abort = abort;
        self
    }

    /// Handle for aborting the sweep from elsewhere.
    pub fn abort_signal(&self) -> AbortSignal {
        self.abort.clone()
    }

    /// Current sweep state.
    pub fn state(&self) -> SweepState {
        self.state
    }

    /// Plan this coordinator runs.
    pub fn plan(&self) -> &SweepPlan {
        &self.plan
    }

    /// Run the sweep to completion or abort.
    ///
    /// An aborted sweep is still `Ok`: the summary carries the reason, the
    /// pair in flight and the pairs missing from the archive. `Err` means the
    /// sweep never started (channel files, metadata or engine startup
    /// failed); the archive is closed in that case too.
    #[instrument(name = "scan", skip_all)]
    pub async fn run(mut self) -> AppResult<ScanSummary> {
        let started_at = Local::now();
        let started = Instant::now();
        info!(
            sources = self.plan.source_count,
            receivers = self.plan.receiver_count,
            mode = %self.plan.mode,
            "Starting scan"
        );

        let channels = match self.prepare(started_at).await {
            Ok(channels) => channels,
            Err(e) => {
                error!(error = %e, "Scan setup failed");
                if let Err(close) = self.archive.close().await {
                    warn!(error = %close, "Archive close failed");
                }
                return Err(e);
            }
        };

        let mut writes = WriteGroup::new(self.archive.clone());
        let mut abort_reason = match self.sweep(&mut writes).await {
            Ok(()) => None,
            Err(e) => {
                error!(error = %e, in_flight = ?self.position.in_flight(), "Sweep stopped early");
                Some(e.to_string())
            }
        };

        self.return_home(abort_reason.is_some()).await;
        if let Err(e) = self.trigger.close().await {
            warn!(error = %e, "Acquisition engine close failed");
        }

        self.transition(SweepState::Draining);
        let report = writes.drain().await;
        if let Err(e) = self.archive.close().await {
            error!(error = %e, "Archive close failed");
            abort_reason.get_or_insert_with(|| e.to_string());
        }

        let final_state = if abort_reason.is_some() {
            SweepState::Aborted
        } else {
            SweepState::Done
        };
        self.transition(final_state);

        let summary = self.summarize(started_at, started.elapsed(), report, abort_reason);
        if summary.is_complete() {
            if let Err(e) = channels.remove() {
                warn!(error = %e, "Could not remove channel map files");
            }
            info!(archived = summary.archived.len(), elapsed = ?summary.elapsed, "Scan complete");
        } else {
            channels.keep();
            warn!(
                archived = summary.archived.len(),
                expected = summary.expected,
                missing = summary.missing.len(),
                "Scan incomplete"
            );
        }
        Ok(summary)
    }

    async fn prepare(&mut self, started_at: DateTime<Local>) -> AppResult<ChannelFiles> {
        let channels = ChannelFiles::write(&self.plan.channel_dir, self.plan.mode)?;

        let setup = async {
            self.archive
                .write_metadata(self.scan_metadata(started_at))
                .await?;
            self.trigger.open().await
        };
        if let Err(e) = setup.await {
            if let Err(remove) = channels.remove() {
                warn!(error = %remove, "Could not remove channel map files");
            }
            return Err(e);
        }
        Ok(channels)
    }

    fn scan_metadata(&self, started_at: DateTime<Local>) -> ScanMetadata {
        let mut metadata = self.plan.metadata.clone();
        metadata.insert_default("Date", started_at.format("%Y-%m-%d").to_string());
        metadata.insert_default("Time", started_at.format("%H:%M:%S%.3f").to_string());
        metadata.insert("Mode", self.plan.mode.label());
        metadata.insert("NSrcPos", i64::from(self.plan.source_count));
        metadata.insert("NRecPos", i64::from(self.plan.receiver_count));
        metadata.insert("NSrc", self.plan.mode.source_channels().count() as i64);
        metadata.insert("NRec", self.plan.mode.receiver_channels().count() as i64);
        metadata
    }

    async fn sweep(&mut self, writes: &mut WriteGroup) -> AppResult<()> {
        self.transition(SweepState::Homing);
        self.checkpoint()?;
        self.motion.initialize().await?;
        let offset = self.motion.axis(Actuator::Small).initial_offset_counts;
        self.motion.move_by(Actuator::Small, offset).await?;
        self.settle(self.timing().initial_settle).await?;

        let fine_step = self.motion.axis(Actuator::Small).step_counts;
        let sub_home = -(i64::from(self.plan.receiver_count) - 1) * fine_step;
        let total = self.plan.expected();

        for s in 1..=self.plan.source_count {
            for r in 1..=self.plan.receiver_count {
                let key = EntryKey::new(s, r)?;
                self.position.begin(key);
                self.transition(SweepState::Positioning);

                if r == 1 && s > 1 {
                    self.checkpoint()?;
                    self.motion.step(Actuator::Large).await?;
                    self.settle(self.timing().coarse_settle).await?;
                } else if r > 1 {
                    self.checkpoint()?;
                    self.motion.step(Actuator::Small).await?;
                    self.settle(self.timing().fine_settle).await?;
                }

                self.checkpoint()?;
                self.transition(SweepState::Capturing);
                let matrix = self.trigger.capture(key).await?;

                self.transition(SweepState::Dispatching);
                writes.dispatch(matrix, key);
                self.position.complete(key);
                info!(
                    %key,
                    captured = self.position.captured().len(),
                    total,
                    source_deg = self.degrees(Actuator::Large),
                    receiver_deg = self.degrees(Actuator::Small),
                    "Captured"
                );
            }

            if sub_home != 0 {
                self.checkpoint()?;
                self.transition(SweepState::Positioning);
                self.motion.move_by(Actuator::Small, sub_home).await?;
            }
        }
        Ok(())
    }

    /// Bring both stages back to where the sweep found them.
    ///
    /// Failures are logged; the drain and close still have to happen.
    async fn return_home(&mut self, stopped_early: bool) {
        self.transition(SweepState::Returning);
        if stopped_early {
            self.motion.stop_all().await;
        }
        motion::settle(self.timing().final_settle).await;

        for actuator in [Actuator::Small, Actuator::Large] {
            let counts = -self.motion.expected_counts(actuator);
            if counts == 0 {
                continue;
            }
            match self.motion.move_by(actuator, counts).await {
                Ok(()) => debug!(%actuator, counts, "Returned to start"),
                Err(e) => warn!(%actuator, counts, error = %e, "Return move failed"),
            }
        }
    }

    fn summarize(
        &self,
        started_at: DateTime<Local>,
        elapsed: Duration,
        report: DrainReport,
        abort_reason: Option<String>,
    ) -> ScanSummary {
        let archived: BTreeSet<EntryKey> = report.archived.iter().copied().collect();
        let missing = self
            .plan
            .keys()
            .filter(|key| !archived.contains(key))
            .collect();
        let failed_writes = report
            .failed
            .into_iter()
            .map(|(key, e)| FailedWrite {
                key,
                reason: e.to_string(),
            })
            .collect();

        ScanSummary {
            started_at,
            elapsed,
            final_state: self.state,
            archive_path: self.plan.archive_path.clone(),
            expected: self.plan.expected(),
            archived: report.archived,
            missing,
            failed_writes,
            in_flight: self.position.in_flight(),
            abort_reason,
        }
    }

    fn transition(&mut self, next: SweepState) {
        if self.state == next {
            return;
        }
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal sweep transition {} -> {}",
            self.state,
            next
        );
        debug!(from = %self.state, to = %next, "Sweep state");
        self.state = next;
    }

    fn checkpoint(&self) -> AppResult<()> {
        if self.abort.is_raised() {
            return Err(ScanError::Aborted);
        }
        Ok(())
    }

    /// Settle, returning early with [`ScanError::Aborted`] if the signal is raised.
    async fn settle(&self, duration: Duration) -> AppResult<()> {
        tokio::select! {
            () = motion::settle(duration) => Ok(()),
            () = self.abort.raised() => Err(ScanError::Aborted),
        }
    }

    fn timing(&self) -> &MotionConfig {
        self.motion.config()
    }

    fn degrees(&self, actuator: Actuator) -> f64 {
        self.motion
            .axis(actuator)
            .degrees(self.motion.expected_counts(actuator))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::acquisition::CaptureTiming;
    use crate::hardware::mock::{SimulatedEndpoint, SimulatedEngine};
    use crate::storage::archive::{MemoryArchive, MetadataValue};
    use crate::storage::channel_map::{RECEIVER_FILE, SOURCE_FILE};
    use crate::storage::writer::ArchiveWriter;
    use tempfile::TempDir;

    struct Rig {
        coordinator: SweepCoordinator,
        large: SimulatedEndpoint,
        small: SimulatedEndpoint,
        archive: MemoryArchive,
        dir: TempDir,
    }

    fn instant_motion() -> MotionConfig {
        MotionConfig {
            initial_settle: Duration::ZERO,
            coarse_settle: Duration::ZERO,
            fine_settle: Duration::ZERO,
            final_settle: Duration::ZERO,
            ..MotionConfig::default()
        }
    }

    fn rig_with(
        sources: u32,
        receivers: u32,
        engine: SimulatedEngine,
        large: SimulatedEndpoint,
        archive: MemoryArchive,
    ) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let small = SimulatedEndpoint::new();
        let motion = MotionController::new(
            instant_motion(),
            Box::new(large.clone()),
            Box::new(small.clone()),
        );
        let trigger = AcquisitionTrigger::new(
            Box::new(engine),
            CaptureTiming {
                start_delay: Duration::ZERO,
                poll_interval: Duration::from_millis(2),
                max_wait: Duration::from_millis(50),
            },
        );
        let plan = SweepPlan {
            source_count: sources,
            receiver_count: receivers,
            mode: AcqMode::Fmc,
            metadata: ScanMetadata::from_iter([(
                "Operator".to_string(),
                MetadataValue::from("ls"),
            )]),
            channel_dir: dir.path().to_path_buf(),
            archive_path: None,
        };
        let handle = ArchiveWriter::spawn(archive.clone(), 4);
        Rig {
            coordinator: SweepCoordinator::new(plan, motion, trigger, handle),
            large,
            small,
            archive,
            dir,
        }
    }

    fn rig(sources: u32, receivers: u32, engine: SimulatedEngine) -> Rig {
        rig_with(
            sources,
            receivers,
            engine,
            SimulatedEndpoint::new(),
            MemoryArchive::new(),
        )
    }

    fn moves(commands: &[String]) -> Vec<String> {
        commands
            .iter()
            .skip(4)
            .filter(|c| c.starts_with("s r0xca"))
            .cloned()
            .collect()
    }

    #[tokio::test]
    async fn complete_sweep_moves_captures_and_returns() {
        let rig = rig(2, 3, SimulatedEngine::new(vec![16, 2]));
        let summary = rig.coordinator.run().await.unwrap();

        assert!(summary.is_complete(), "{summary}");
        assert_eq!(summary.final_state, SweepState::Done);
        assert_eq!(summary.archived, EntryKey::grid(2, 3).collect::<Vec<_>>());
        assert_eq!(rig.archive.entry_count(), 6);

        assert_eq!(
            moves(&rig.small.commands()),
            vec![
                "s r0xca -1500000",
                "s r0xca 750000",
                "s r0xca 750000",
                "s r0xca -1500000",
                "s r0xca 750000",
                "s r0xca 750000",
                "s r0xca -1500000",
                "s r0xca 1500000",
            ]
        );
        assert_eq!(
            moves(&rig.large.commands()),
            vec!["s r0xca -1800000", "s r0xca 1800000"]
        );
    }

    #[tokio::test]
    async fn metadata_carries_counts_and_operator_fields() {
        let rig = rig(2, 3, SimulatedEngine::new(vec![4]));
        rig.coordinator.run().await.unwrap();

        let metadata = rig.archive.metadata();
        assert_eq!(metadata.get("NSrcPos"), Some(&MetadataValue::Int(2)));
        assert_eq!(metadata.get("NRecPos"), Some(&MetadataValue::Int(3)));
        assert_eq!(metadata.get("NSrc"), Some(&MetadataValue::Int(32)));
        assert_eq!(metadata.get("NRec"), Some(&MetadataValue::Int(32)));
        assert_eq!(metadata.get("Mode"), Some(&MetadataValue::from("FMC")));
        assert_eq!(metadata.get("Operator"), Some(&MetadataValue::from("ls")));
        assert!(metadata.get("Date").is_some() && metadata.get("Time").is_some());
    }

    #[tokio::test]
    async fn channel_files_exist_only_while_sweeping() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join(SOURCE_FILE);
        let seen = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let engine = {
            let source = source.clone();
            let seen = Arc::clone(&seen);
            SimulatedEngine::new(vec![4]).on_capture(move |_| {
                if !source.exists() {
                    seen.store(false, std::sync::atomic::Ordering::SeqCst);
                }
            })
        };
        let mut rig = rig(1, 2, engine);
        rig.coordinator.plan.channel_dir = dir.path().to_path_buf();

        let summary = rig.coordinator.run().await.unwrap();
        assert!(summary.is_complete());
        assert!(seen.load(std::sync::atomic::Ordering::SeqCst));
        assert!(!source.exists());
        assert!(!dir.path().join(RECEIVER_FILE).exists());
    }

    #[tokio::test]
    async fn abort_reports_in_flight_pair_and_keeps_captured_entries() {
        let abort = AbortSignal::new();
        let engine = {
            let abort = abort.clone();
            SimulatedEngine::new(vec![4]).on_capture(move |n| {
                if n == 2 {
                    abort.raise();
                }
            })
        };
        let mut rig = rig(2, 3, engine);
        rig.coordinator = rig.coordinator.with_abort_signal(abort);

        let summary = rig.coordinator.run().await.unwrap();

        assert_eq!(summary.final_state, SweepState::Aborted);
        assert_eq!(summary.abort_reason.as_deref(), Some("scan aborted by operator"));
        assert_eq!(summary.in_flight, EntryKey::new(1, 3).ok());
        assert_eq!(summary.archived, EntryKey::grid(1, 2).collect::<Vec<_>>());
        assert_eq!(summary.missing.len(), 4);
        assert_eq!(rig.archive.keys(), summary.archived);

        // Stopped, then the small stage comes back from receiver 2
        let small = rig.small.commands();
        assert!(small.contains(&"t 0".to_string()));
        assert_eq!(moves(&small).last().map(String::as_str), Some("s r0xca 750000"));
        assert!(moves(&rig.large.commands()).is_empty());
        assert!(rig.dir.path().join(SOURCE_FILE).exists());
    }

    #[tokio::test]
    async fn acquisition_timeout_stops_sweep() {
        let rig = rig(1, 4, SimulatedEngine::new(vec![4]).stuck_from(3));
        let summary = rig.coordinator.run().await.unwrap();

        assert_eq!(summary.final_state, SweepState::Aborted);
        assert!(summary
            .abort_reason
            .as_deref()
            .is_some_and(|r| r.contains("did not complete")));
        assert_eq!(summary.in_flight, EntryKey::new(1, 3).ok());
        assert_eq!(summary.archived.len(), 2);
    }

    #[tokio::test]
    async fn command_failure_stops_before_next_source() {
        let large = SimulatedEndpoint::new().failing_on("t 1");
        let rig = rig_with(2, 2, SimulatedEngine::new(vec![4]), large, MemoryArchive::new());
        let summary = rig.coordinator.run().await.unwrap();

        assert_eq!(summary.final_state, SweepState::Aborted);
        assert_eq!(summary.in_flight, EntryKey::new(2, 1).ok());
        assert_eq!(summary.archived, EntryKey::grid(1, 2).collect::<Vec<_>>());
        assert!(summary.abort_reason.unwrap().contains("large actuator"));
    }

    #[tokio::test]
    async fn failed_write_is_reported_missing_without_aborting() {
        let bad = EntryKey::new(1, 2).unwrap();
        let rig = rig_with(
            1,
            3,
            SimulatedEngine::new(vec![4]),
            SimulatedEndpoint::new(),
            MemoryArchive::failing_on([bad]),
        );
        let summary = rig.coordinator.run().await.unwrap();

        assert_eq!(summary.final_state, SweepState::Done);
        assert!(!summary.is_complete());
        assert_eq!(summary.missing, vec![bad]);
        assert_eq!(summary.failed_writes.len(), 1);
        assert_eq!(summary.archived.len(), 2);
        assert!(rig.dir.path().join(SOURCE_FILE).exists());
    }

    #[test]
    fn channel_maps_go_to_engine_working_dir() {
        let mut config = ScanConfig::default();
        config.storage.output_dir = PathBuf::from("/data/scans");
        config.acquisition.working_dir = PathBuf::from("/opt/acquisition");

        let plan = SweepPlan::from_config(&config).unwrap();
        assert_eq!(plan.channel_dir, PathBuf::from("/opt/acquisition"));
        assert_eq!(plan.archive_path, Some(PathBuf::from("/data/scans/p_test.h5")));
    }

    #[tokio::test]
    async fn abort_signal_is_shared_between_clones() {
        let signal = AbortSignal::new();
        let clone = signal.clone();
        assert!(!signal.is_raised());

        let waiter = tokio::spawn(async move { clone.raised().await });
        signal.raise();
        waiter.await.unwrap();
        assert!(signal.is_raised());
    }
}
