//! Mock Hardware Implementations
//!
//! Simulated devices for tests and `--simulate` dry runs. All waiting uses
//! `tokio::time::sleep`, never `std::thread::sleep`.
//!
//! # Available Mocks
//!
//! - `SimulatedEndpoint` - motor controller that acknowledges every command
//!   with `ok` and records what it was sent
//! - `SimulatedEngine` - acquisition engine producing deterministic synthetic
//!   matrices after a configurable busy period

use crate::error::{AppResult, ScanError};
use crate::hardware::acquisition::AcquisitionEngine;
use crate::hardware::motion::MotionEndpoint;
use crate::storage::archive::WaveformMatrix;
use async_trait::async_trait;
use ndarray::{ArrayD, Dimension, IxDyn};
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration, Instant};

// =============================================================================
// SimulatedEndpoint - Motor controller stand-in
// =============================================================================

/// Motor controller that acknowledges every command.
///
/// Clones share the command log, so a test can keep one clone while the
/// other is moved into a [`MotionController`](crate::hardware::motion::MotionController).
#[derive(Clone, Default)]
pub struct SimulatedEndpoint {
    log: Arc<Mutex<Vec<String>>>,
    fail_on: Option<String>,
    reply_delay: Duration,
}

impl SimulatedEndpoint {
    /// Endpoint answering `ok` immediately.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `command` with a controller error code instead of `ok`.
    pub fn failing_on(mut self, command: &str) -> Self {
        self.fail_on = Some(command.to_string());
        self
    }

    /// Delay every acknowledgment.
    pub fn with_reply_delay(mut self, delay: Duration) -> Self {
        self.reply_delay = delay;
        self
    }

    /// Commands received so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

#[async_trait]
impl MotionEndpoint for SimulatedEndpoint {
    async fn send(&self, command: &str) -> io::Result<Vec<u8>> {
        self.log.lock().push(command.to_string());
        if !self.reply_delay.is_zero() {
            sleep(self.reply_delay).await;
        }
        if self.fail_on.as_deref() == Some(command) {
            return Ok(b"e 33".to_vec());
        }
        Ok(b"ok".to_vec())
    }
}

// =============================================================================
// SimulatedEngine - Acquisition engine stand-in
// =============================================================================

/// Counters shared between a [`SimulatedEngine`] and the test observing it.
#[derive(Debug, Default)]
pub struct EngineProbe {
    opened: AtomicBool,
    closed: AtomicBool,
    captures: AtomicUsize,
}

impl EngineProbe {
    /// Whether `open` was called.
    pub fn opened(&self) -> bool {
        self.opened.load(Ordering::SeqCst)
    }

    /// Whether `close` was called.
    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Captures started so far.
    pub fn captures(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }
}

type CaptureHook = Box<dyn Fn(usize) + Send + Sync>;

/// Acquisition engine that synthesizes a decaying tone burst per capture.
pub struct SimulatedEngine {
    shape: Vec<usize>,
    busy_for: Duration,
    stuck_from: Option<usize>,
    busy_until: Option<Instant>,
    stuck: bool,
    probe: Arc<EngineProbe>,
    hook: Option<CaptureHook>,
}

impl SimulatedEngine {
    /// Engine producing matrices of `shape`, samples along the first axis.
    pub fn new(shape: Vec<usize>) -> Self {
        Self {
            shape,
            busy_for: Duration::ZERO,
            stuck_from: None,
            busy_until: None,
            stuck: false,
            probe: Arc::default(),
            hook: None,
        }
    }

    /// Stay busy for `duration` after each start.
    pub fn with_busy_for(mut self, duration: Duration) -> Self {
        self.busy_for = duration;
        self
    }

    /// Never clear the busy indicator.
    pub fn stuck_busy(self) -> Self {
        self.stuck_from(1)
    }

    /// Never clear the busy indicator from the `capture`-th capture (1-based) on.
    pub fn stuck_from(mut self, capture: usize) -> Self {
        self.stuck_from = Some(capture);
        self
    }

    /// Call `hook` with the capture number each time a capture starts.
    pub fn on_capture(mut self, hook: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    /// Shared counters for this engine.
    pub fn probe(&self) -> Arc<EngineProbe> {
        Arc::clone(&self.probe)
    }

    fn synthesize(&self, capture: usize) -> AppResult<WaveformMatrix> {
        let phase = capture as f64 * 0.37;
        let array = ArrayD::from_shape_fn(IxDyn(&self.shape), |index| {
            let sample = index[0] as f64;
            let channel = index.slice().iter().skip(1).sum::<usize>() as f64;
            let envelope = (-sample / 200.0).exp();
            let value = 2000.0 * envelope * (0.3 * sample + 0.1 * channel + phase).sin();
            value as i16
        });
        WaveformMatrix::new(array)
    }
}

#[async_trait]
impl AcquisitionEngine for SimulatedEngine {
    async fn open(&mut self) -> AppResult<()> {
        self.probe.opened.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn start_acquisition(&mut self) -> AppResult<()> {
        if !self.probe.opened() {
            return Err(ScanError::Engine("simulated engine is not open".to_string()));
        }
        let capture = self.probe.captures.fetch_add(1, Ordering::SeqCst) + 1;
        self.stuck = self.stuck_from.is_some_and(|from| capture >= from);
        self.busy_until = Some(Instant::now() + self.busy_for);
        if let Some(hook) = &self.hook {
            hook(capture);
        }
        Ok(())
    }

    async fn is_busy(&mut self) -> AppResult<bool> {
        if self.stuck {
            return Ok(true);
        }
        Ok(self.busy_until.is_some_and(|until| Instant::now() < until))
    }

    async fn fetch_matrix(&mut self) -> AppResult<WaveformMatrix> {
        if self.busy_until.take().is_none() {
            return Err(ScanError::Engine("no capture to fetch".to_string()));
        }
        self.synthesize(self.probe.captures())
    }

    async fn close(&mut self) -> AppResult<()> {
        self.probe.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn endpoint_records_and_fails_on_request() {
        let endpoint = SimulatedEndpoint::new().failing_on("t 0");
        assert_eq!(endpoint.send("t 1").await.unwrap(), b"ok");
        assert_eq!(endpoint.send("t 0").await.unwrap(), b"e 33");
        assert_eq!(endpoint.commands(), vec!["t 1", "t 0"]);
    }

    #[tokio::test]
    async fn delayed_endpoint_logs_before_answering() {
        let endpoint = SimulatedEndpoint::new().with_reply_delay(Duration::from_millis(30));
        let started = Instant::now();
        let reply = endpoint.send("t 1").await.unwrap();

        assert_eq!(reply, b"ok");
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(endpoint.commands(), vec!["t 1"]);
    }

    #[tokio::test]
    async fn engine_lifecycle_and_busy_period() {
        let mut engine = SimulatedEngine::new(vec![64, 4]).with_busy_for(Duration::from_millis(20));
        let probe = engine.probe();

        assert!(engine.start_acquisition().await.is_err());
        engine.open().await.unwrap();
        engine.start_acquisition().await.unwrap();
        assert!(engine.is_busy().await.unwrap());

        sleep(Duration::from_millis(30)).await;
        assert!(!engine.is_busy().await.unwrap());

        let matrix = engine.fetch_matrix().await.unwrap();
        assert_eq!(matrix.shape(), &[64, 4]);
        assert!(engine.fetch_matrix().await.is_err());

        engine.close().await.unwrap();
        assert!(probe.opened() && probe.closed());
        assert_eq!(probe.captures(), 1);
    }

    #[tokio::test]
    async fn captures_differ_between_positions() {
        let mut engine = SimulatedEngine::new(vec![32, 2]);
        engine.open().await.unwrap();

        engine.start_acquisition().await.unwrap();
        let first = engine.fetch_matrix().await.unwrap();
        engine.start_acquisition().await.unwrap();
        let second = engine.fetch_matrix().await.unwrap();

        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn stuck_from_later_capture() {
        let mut engine = SimulatedEngine::new(vec![8]).stuck_from(2);
        engine.open().await.unwrap();

        engine.start_acquisition().await.unwrap();
        assert!(!engine.is_busy().await.unwrap());
        engine.fetch_matrix().await.unwrap();

        engine.start_acquisition().await.unwrap();
        assert!(engine.is_busy().await.unwrap());
    }
}
