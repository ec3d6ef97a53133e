//! Full-matrix acquisition trigger.
//!
//! The acquisition routine runs inside an external engine (a MATLAB session
//! driving the array controller). One capture is:
//!
//! 1. start the routine
//! 2. wait the start delay so the routine can raise its busy indicator
//! 3. poll the engine until it reports idle, bounded by `max_wait`
//! 4. fetch the captured matrix
//!
//! The engine is injected and has an explicit `open`/`close` lifecycle.
//! [`AcquisitionTrigger`] serializes captures, so at most one is in progress.

use crate::config::AcquisitionConfig;
use crate::error::{AppResult, ScanError};
use crate::storage::archive::{EntryKey, WaveformMatrix};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Engine hosting the acquisition routine.
#[async_trait]
pub trait AcquisitionEngine: Send {
    /// Start the engine session.
    async fn open(&mut self) -> AppResult<()>;

    /// Start one full-matrix capture. Returns once the routine is launched.
    async fn start_acquisition(&mut self) -> AppResult<()>;

    /// Whether the capture is still in progress.
    ///
    /// Stays true until the matrix of the current capture can be fetched.
    async fn is_busy(&mut self) -> AppResult<bool>;

    /// Most recently captured matrix.
    async fn fetch_matrix(&mut self) -> AppResult<WaveformMatrix>;

    /// End the engine session.
    async fn close(&mut self) -> AppResult<()>;
}

/// Timing of one capture.
#[derive(Debug, Clone, Copy)]
pub struct CaptureTiming {
    /// Wait after starting before the busy indicator is first checked
    pub start_delay: Duration,
    /// Busy indicator poll interval
    pub poll_interval: Duration,
    /// Upper bound on the busy wait
    pub max_wait: Duration,
}

impl From<&AcquisitionConfig> for CaptureTiming {
    fn from(config: &AcquisitionConfig) -> Self {
        Self {
            start_delay: config.start_delay,
            poll_interval: config.poll_interval,
            max_wait: config.max_wait,
        }
    }
}

/// Runs captures on an injected engine, one at a time.
pub struct AcquisitionTrigger {
    engine: Mutex<Box<dyn AcquisitionEngine>>,
    timing: CaptureTiming,
}

impl AcquisitionTrigger {
    /// Wrap `engine`; it is not opened until [`open`](Self::open).
    pub fn new(engine: Box<dyn AcquisitionEngine>, timing: CaptureTiming) -> Self {
        Self {
            engine: Mutex::new(engine),
            timing,
        }
    }

    /// Capture timing in use.
    pub fn timing(&self) -> CaptureTiming {
        self.timing
    }

    /// Open the engine session.
    pub async fn open(&self) -> AppResult<()> {
        self.engine.lock().await.open().await
    }

    /// Close the engine session.
    pub async fn close(&self) -> AppResult<()> {
        self.engine.lock().await.close().await
    }

    /// Capture the matrix for `key`.
    ///
    /// Fails with [`ScanError::AcquisitionTimeout`] if the busy indicator is
    /// still set `max_wait` after the start delay.
    #[instrument(skip_all, fields(key = %key), err)]
    pub async fn capture(&self, key: EntryKey) -> AppResult<WaveformMatrix> {
        let mut engine = self.engine.lock().await;

        engine.start_acquisition().await?;
        tokio::time::sleep(self.timing.start_delay).await;

        let started = Instant::now();
        loop {
            if !engine.is_busy().await? {
                break;
            }
            let waited = started.elapsed();
            if waited >= self.timing.max_wait {
                return Err(ScanError::AcquisitionTimeout { key, waited });
            }
            let remaining = self.timing.max_wait - waited;
            tokio::time::sleep(self.timing.poll_interval.min(remaining)).await;
        }

        let matrix = engine.fetch_matrix().await?;
        debug!(shape = ?matrix.shape(), waited = ?started.elapsed(), "Capture complete");
        Ok(matrix)
    }
}

/// File-based busy indicator: busy while the file exists.
#[derive(Debug, Clone)]
pub struct BusySentinel {
    path: PathBuf,
}

impl BusySentinel {
    /// Sentinel at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Sentinel location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the sentinel file exists.
    pub async fn is_busy(&self) -> AppResult<bool> {
        Ok(tokio::fs::try_exists(&self.path).await?)
    }

    /// Raise the indicator.
    pub async fn raise(&self) -> AppResult<()> {
        tokio::fs::write(&self.path, b"").await?;
        Ok(())
    }

    /// Clear the indicator. A missing file is not an error.
    pub async fn clear(&self) -> AppResult<()> {
        remove_if_exists(&self.path).await
    }
}

async fn remove_if_exists(path: &Path) -> AppResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Engine running the acquisition routine in an external interactive session.
///
/// The configured program is started once; commands are written to its
/// standard input one line at a time. The routine signals progress through
/// the [`BusySentinel`] and leaves each capture in an HDF5-based exchange
/// file (MAT v7.3).
///
/// A capture counts as finished only when the sentinel is absent and the
/// exchange file exists. The exchange file is deleted before every trigger,
/// and the trigger command must publish it in one step (save under a
/// temporary name, then rename), so an existing file is always complete.
pub struct ExternalEngine {
    config: AcquisitionConfig,
    sentinel: BusySentinel,
    exchange: PathBuf,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
}

impl ExternalEngine {
    /// Engine for `config`; nothing is started until `open`.
    pub fn new(config: AcquisitionConfig) -> Self {
        let sentinel = BusySentinel::new(config.working_dir.join(&config.sentinel));
        let exchange = config.working_dir.join(&config.exchange_file);
        Self {
            config,
            sentinel,
            exchange,
            child: None,
            stdin: None,
        }
    }

    /// The busy indicator this engine polls.
    pub fn sentinel(&self) -> &BusySentinel {
        &self.sentinel
    }

    async fn send_line(&mut self, line: &str) -> AppResult<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| ScanError::Engine("engine session is not open".to_string()))?;
        debug!(command = line, "Engine command");
        stdin
            .write_all(format!("{line}\n").as_bytes())
            .await
            .map_err(|e| ScanError::Engine(format!("writing to engine: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| ScanError::Engine(format!("writing to engine: {e}")))
    }

    fn ensure_running(&mut self) -> AppResult<()> {
        let child = self
            .child
            .as_mut()
            .ok_or_else(|| ScanError::Engine("engine session is not open".to_string()))?;
        match child.try_wait()? {
            None => Ok(()),
            Some(status) => Err(ScanError::Engine(format!(
                "engine process exited unexpectedly ({status})"
            ))),
        }
    }
}

#[async_trait]
impl AcquisitionEngine for ExternalEngine {
    async fn open(&mut self) -> AppResult<()> {
        if self.child.is_some() {
            return Ok(());
        }

        // A sentinel left by a crashed session would read as a capture in progress
        self.sentinel.clear().await?;

        let mut child = Command::new(&self.config.program)
            .args(&self.config.args)
            .current_dir(&self.config.working_dir)
            .stdin(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ScanError::Engine(format!("failed to start '{}': {e}", self.config.program))
            })?;
        self.stdin = child.stdin.take();
        self.child = Some(child);
        info!(program = %self.config.program, "Acquisition engine started");

        for command in self.config.startup_commands.clone() {
            self.send_line(&command).await?;
        }
        tokio::time::sleep(self.config.startup_delay).await;
        self.ensure_running()
    }

    async fn start_acquisition(&mut self) -> AppResult<()> {
        self.ensure_running()?;
        remove_if_exists(&self.exchange).await?;
        let trigger = self.config.trigger_command.clone();
        self.send_line(&trigger).await
    }

    async fn is_busy(&mut self) -> AppResult<bool> {
        self.ensure_running()?;
        if self.sentinel.is_busy().await? {
            return Ok(true);
        }
        // Sentinel not raised yet, or cleared before the matrix was published
        Ok(!tokio::fs::try_exists(&self.exchange).await?)
    }

    async fn fetch_matrix(&mut self) -> AppResult<WaveformMatrix> {
        read_exchange_file(self.exchange.clone(), self.config.matrix_variable.clone()).await
    }

    async fn close(&mut self) -> AppResult<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        let quit = self.config.quit_command.clone();
        if let Err(e) = self.send_line(&quit).await {
            warn!(error = %e, "Could not send quit command");
        }
        self.stdin = None;

        match tokio::time::timeout(Duration::from_secs(10), child.wait()).await {
            Ok(status) => {
                let status = status?;
                info!(%status, "Acquisition engine stopped");
            }
            Err(_) => {
                warn!("Acquisition engine did not exit; killing it");
                child.kill().await?;
            }
        }
        Ok(())
    }
}

#[cfg(feature = "storage_hdf5")]
async fn read_exchange_file(path: PathBuf, variable: String) -> AppResult<WaveformMatrix> {
    tokio::task::spawn_blocking(move || {
        crate::storage::hdf5_archive::read_exchange_matrix(&path, &variable)
    })
    .await
    .map_err(|e| ScanError::Engine(format!("exchange file reader failed: {e}")))?
}

#[cfg(not(feature = "storage_hdf5"))]
async fn read_exchange_file(_path: PathBuf, _variable: String) -> AppResult<WaveformMatrix> {
    Err(ScanError::FeatureNotEnabled("storage_hdf5".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::SimulatedEngine;
    use tempfile::tempdir;

    fn timing(max_wait_ms: u64) -> CaptureTiming {
        CaptureTiming {
            start_delay: Duration::ZERO,
            poll_interval: Duration::from_millis(5),
            max_wait: Duration::from_millis(max_wait_ms),
        }
    }

    #[tokio::test]
    async fn capture_returns_engine_matrix() {
        let engine = SimulatedEngine::new(vec![4, 8]).with_busy_for(Duration::from_millis(15));
        let trigger = AcquisitionTrigger::new(Box::new(engine), timing(1000));
        trigger.open().await.unwrap();

        let matrix = trigger.capture(EntryKey::new(1, 1).unwrap()).await.unwrap();
        assert_eq!(matrix.shape(), &[4, 8]);
        trigger.close().await.unwrap();
    }

    #[tokio::test]
    async fn stuck_busy_times_out_within_bound() {
        let engine = SimulatedEngine::new(vec![2, 2]).stuck_busy();
        let trigger = AcquisitionTrigger::new(Box::new(engine), timing(50));
        trigger.open().await.unwrap();

        let key = EntryKey::new(2, 3).unwrap();
        let started = std::time::Instant::now();
        let err = trigger.capture(key).await.unwrap_err();

        match err {
            ScanError::AcquisitionTimeout { key: k, waited } => {
                assert_eq!(k, key);
                assert!(waited >= Duration::from_millis(50));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn sentinel_tracks_file_presence() {
        let dir = tempdir().unwrap();
        let sentinel = BusySentinel::new(dir.path().join("Busy.txt"));

        assert!(!sentinel.is_busy().await.unwrap());
        sentinel.raise().await.unwrap();
        assert!(sentinel.is_busy().await.unwrap());
        sentinel.clear().await.unwrap();
        sentinel.clear().await.unwrap();
        assert!(!sentinel.is_busy().await.unwrap());
    }

    #[tokio::test]
    async fn external_engine_requires_open() {
        let mut engine = ExternalEngine::new(AcquisitionConfig::default());
        assert!(matches!(
            engine.start_acquisition().await,
            Err(ScanError::Engine(_))
        ));
        assert!(engine.close().await.is_ok());
    }

    #[tokio::test]
    async fn external_engine_missing_program_fails_to_open() {
        let dir = tempdir().unwrap();
        let config = AcquisitionConfig {
            program: "definitely-not-an-acquisition-engine".to_string(),
            working_dir: dir.path().to_path_buf(),
            ..AcquisitionConfig::default()
        };
        let mut engine = ExternalEngine::new(config);
        assert!(matches!(engine.open().await, Err(ScanError::Engine(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn external_engine_session_lifecycle() {
        let dir = tempdir().unwrap();
        // `cat` echoes commands to stdout and exits when stdin closes
        let config = AcquisitionConfig {
            program: "cat".to_string(),
            args: Vec::new(),
            working_dir: dir.path().to_path_buf(),
            startup_commands: Vec::new(),
            startup_delay: Duration::ZERO,
            ..AcquisitionConfig::default()
        };
        let mut engine = ExternalEngine::new(config);
        engine.open().await.unwrap();

        engine.start_acquisition().await.unwrap();
        // Nothing published yet
        assert!(engine.is_busy().await.unwrap());

        tokio::fs::write(dir.path().join("RcvData.mat"), b"x").await.unwrap();
        assert!(!engine.is_busy().await.unwrap());

        engine.sentinel().raise().await.unwrap();
        assert!(engine.is_busy().await.unwrap());
        engine.sentinel().clear().await.unwrap();

        // A new trigger discards the previous capture
        engine.start_acquisition().await.unwrap();
        assert!(engine.is_busy().await.unwrap());

        engine.close().await.unwrap();
    }

    /// Engine driven by `sh`, each trigger line being a shell script.
    #[cfg(unix)]
    fn shell_engine(dir: &Path, trigger: &str) -> ExternalEngine {
        ExternalEngine::new(AcquisitionConfig {
            program: "sh".to_string(),
            args: Vec::new(),
            working_dir: dir.to_path_buf(),
            startup_commands: Vec::new(),
            startup_delay: Duration::ZERO,
            trigger_command: trigger.to_string(),
            ..AcquisitionConfig::default()
        })
    }

    /// Poll until idle and report whether the exchange file was there at that moment.
    #[cfg(unix)]
    async fn exchange_present_when_idle(engine: &mut ExternalEngine, dir: &Path) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while engine.is_busy().await.unwrap() {
            assert!(Instant::now() < deadline, "engine never went idle");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        dir.join("RcvData.mat").exists()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn external_engine_waits_for_matrix_after_sentinel_clears() {
        let dir = tempdir().unwrap();
        let mut engine = shell_engine(
            dir.path(),
            "touch Busy.txt; sleep 0.2; rm Busy.txt; sleep 0.4; \
             echo x > RcvData.part; mv RcvData.part RcvData.mat",
        );
        engine.open().await.unwrap();
        engine.start_acquisition().await.unwrap();

        assert!(exchange_present_when_idle(&mut engine, dir.path()).await);
        engine.close().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn external_engine_busy_before_sentinel_is_raised() {
        let dir = tempdir().unwrap();
        let mut engine = shell_engine(
            dir.path(),
            "sleep 0.4; touch Busy.txt; sleep 0.1; \
             echo x > RcvData.part; mv RcvData.part RcvData.mat; rm Busy.txt",
        );
        engine.open().await.unwrap();
        engine.start_acquisition().await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(engine.is_busy().await.unwrap());
        assert!(exchange_present_when_idle(&mut engine, dir.path()).await);
        assert!(!dir.path().join("Busy.txt").exists());
        engine.close().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn external_engine_without_matrix_times_out() {
        let dir = tempdir().unwrap();
        let engine = shell_engine(dir.path(), "touch Busy.txt; sleep 0.05; rm Busy.txt");
        let trigger = AcquisitionTrigger::new(Box::new(engine), timing(300));
        trigger.open().await.unwrap();

        let key = EntryKey::new(1, 4).unwrap();
        let err = trigger.capture(key).await.unwrap_err();
        assert!(matches!(err, ScanError::AcquisitionTimeout { key: k, .. } if k == key));
        trigger.close().await.unwrap();
    }
}
