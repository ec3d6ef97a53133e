//! Rotary Stage Motion Control
//!
//! Two stepper-driven rotary stages share one ASCII command protocol:
//!
//! - Format: ASCII command lines over RS-232, terminated by `\r`
//! - Baud: 9600, 8N1, no flow control
//! - Every command is answered by one `\r`-terminated acknowledgment:
//!   `ok`, `v <value>` for reads, or `e <code>` for a rejected command
//!
//! | Command         | Meaning                                   |
//! |-----------------|-------------------------------------------|
//! | `s r0x24 31`    | desired state: trajectory-driven stepper  |
//! | `s r0xc8 256`   | profile type: relative trapezoidal move   |
//! | `s r0xca <n>`   | move distance in encoder counts           |
//! | `s r0xcb <n>`   | maximum velocity (0.1 counts/s)           |
//! | `t 1` / `t 0`   | start / stop the configured trajectory    |
//!
//! There is no motion-complete event. The controller tracks the commanded
//! position only and callers settle for a fixed duration after each start.

use crate::config::{AxisConfig, MotionConfig};
use crate::error::{AppResult, ScanError};
use crate::serial::SharedPort;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tracing::{debug, instrument, warn};

/// Command terminator on the wire.
pub const TERMINATOR: u8 = b'\r';

/// Which rotary stage a command addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Actuator {
    /// Coarse stage rotating the transmitter (source) transducer
    Large,
    /// Fine stage rotating the receiver transducer
    Small,
}

impl Actuator {
    /// Both actuators in initialization order.
    pub const ALL: [Actuator; 2] = [Actuator::Large, Actuator::Small];

    fn index(self) -> usize {
        match self {
            Actuator::Large => 0,
            Actuator::Small => 1,
        }
    }
}

impl fmt::Display for Actuator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actuator::Large => write!(f, "large"),
            Actuator::Small => write!(f, "small"),
        }
    }
}

/// One command/acknowledgment channel to a motor controller.
///
/// Implementations return the raw acknowledgment line without its terminator;
/// interpretation happens in [`MotionController`].
#[async_trait]
pub trait MotionEndpoint: Send + Sync {
    /// Send `command` and wait for the acknowledgment line.
    async fn send(&self, command: &str) -> io::Result<Vec<u8>>;
}

/// [`MotionEndpoint`] over any async byte stream.
pub struct AsciiEndpoint {
    port: SharedPort,
    timeout: Duration,
}

impl AsciiEndpoint {
    /// Wrap an already opened port.
    pub fn new(port: SharedPort, timeout: Duration) -> Self {
        Self { port, timeout }
    }

    /// Open the serial port configured for `actuator`.
    #[cfg(feature = "instrument_serial")]
    pub async fn open(actuator: Actuator, axis: &AxisConfig) -> AppResult<Self> {
        let mut port = crate::serial::open_controller_port(&axis.port, axis.baud_rate)
            .await
            .map_err(|e| ScanError::CommandFailed {
                actuator,
                command: format!("open {}", axis.port),
                reason: e.to_string(),
            })?;

        let discarded = crate::serial::discard_pending(&mut port, Duration::from_millis(50)).await;
        if discarded > 0 {
            debug!(%actuator, discarded, "Discarded stale bytes");
        }
        let shared = crate::serial::wrap_shared(Box::new(port));

        Ok(Self::new(shared, axis.response_timeout))
    }
}

#[async_trait]
impl MotionEndpoint for AsciiEndpoint {
    async fn send(&self, command: &str) -> io::Result<Vec<u8>> {
        let mut port = self.port.lock().await;

        let mut line = Vec::with_capacity(command.len() + 1);
        line.extend_from_slice(command.as_bytes());
        line.push(TERMINATOR);

        let writer = port.get_mut();
        writer.write_all(&line).await?;
        writer.flush().await?;

        let mut reply = Vec::new();
        match tokio::time::timeout(self.timeout, port.read_until(TERMINATOR, &mut reply)).await {
            Ok(read) => {
                read?;
            }
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no acknowledgment within {:?}", self.timeout),
                ))
            }
        }

        if reply.last() == Some(&TERMINATOR) {
            reply.pop();
        }
        Ok(reply)
    }
}

/// Check one acknowledgment line, returning its trimmed text.
pub fn parse_acknowledgment(reply: &[u8]) -> Result<String, String> {
    let text = std::str::from_utf8(reply)
        .map_err(|_| format!("non-UTF-8 acknowledgment {reply:02x?}"))?
        .trim();

    if text.is_empty() {
        return Err("empty acknowledgment".to_string());
    }
    if text.starts_with('e') {
        return Err(format!("controller error code '{text}'"));
    }
    if text == "ok" || text.starts_with("v ") {
        return Ok(text.to_string());
    }
    Err(format!("unexpected acknowledgment '{text}'"))
}

/// Sequences commands to both stages and tracks their commanded positions.
pub struct MotionController {
    large: Box<dyn MotionEndpoint>,
    small: Box<dyn MotionEndpoint>,
    config: MotionConfig,
    expected: [AtomicI64; 2],
}

impl MotionController {
    /// Build a controller over two endpoints.
    pub fn new(
        config: MotionConfig,
        large: Box<dyn MotionEndpoint>,
        small: Box<dyn MotionEndpoint>,
    ) -> Self {
        Self {
            large,
            small,
            config,
            expected: [AtomicI64::new(0), AtomicI64::new(0)],
        }
    }

    /// Open both configured serial ports.
    #[cfg(feature = "instrument_serial")]
    pub async fn connect(config: &MotionConfig) -> AppResult<Self> {
        let large = AsciiEndpoint::open(Actuator::Large, &config.large).await?;
        let small = AsciiEndpoint::open(Actuator::Small, &config.small).await?;
        Ok(Self::new(config.clone(), Box::new(large), Box::new(small)))
    }

    /// Motion configuration in use.
    pub fn config(&self) -> &MotionConfig {
        &self.config
    }

    /// Axis configuration for `actuator`.
    pub fn axis(&self, actuator: Actuator) -> &AxisConfig {
        match actuator {
            Actuator::Large => &self.config.large,
            Actuator::Small => &self.config.small,
        }
    }

    fn endpoint(&self, actuator: Actuator) -> &dyn MotionEndpoint {
        match actuator {
            Actuator::Large => self.large.as_ref(),
            Actuator::Small => self.small.as_ref(),
        }
    }

    /// Send one command and validate its acknowledgment.
    pub async fn command(&self, actuator: Actuator, command: &str) -> AppResult<String> {
        let failed = |reason: String| ScanError::CommandFailed {
            actuator,
            command: command.to_string(),
            reason,
        };

        let reply = self
            .endpoint(actuator)
            .send(command)
            .await
            .map_err(|e| failed(e.to_string()))?;
        let ack = parse_acknowledgment(&reply).map_err(failed)?;

        debug!(%actuator, command, ack = %ack, "Command acknowledged");
        Ok(ack)
    }

    /// Put both stages into relative trapezoidal stepper mode with their
    /// configured step distance and velocity limit.
    #[instrument(skip(self), err)]
    pub async fn initialize(&self) -> AppResult<()> {
        for actuator in Actuator::ALL {
            let axis = self.axis(actuator);
            self.command(actuator, "s r0x24 31").await?;
            self.command(actuator, "s r0xc8 256").await?;
            self.set_distance(actuator, axis.step_counts).await?;
            self.command(actuator, &format!("s r0xcb {}", axis.max_velocity))
                .await?;
        }
        Ok(())
    }

    /// Set the relative distance of the next trajectory.
    pub async fn set_distance(&self, actuator: Actuator, counts: i64) -> AppResult<()> {
        self.command(actuator, &format!("s r0xca {counts}"))
            .await
            .map(|_| ())
    }

    /// Start the configured trajectory.
    pub async fn start(&self, actuator: Actuator) -> AppResult<()> {
        self.command(actuator, "t 1").await.map(|_| ())
    }

    /// Stop any trajectory in progress.
    pub async fn stop(&self, actuator: Actuator) -> AppResult<()> {
        self.command(actuator, "t 0").await.map(|_| ())
    }

    /// Move `actuator` by `counts` relative to its current position.
    ///
    /// Returns once the start is acknowledged; callers settle afterwards.
    #[instrument(skip(self), err)]
    pub async fn move_by(&self, actuator: Actuator, counts: i64) -> AppResult<()> {
        self.set_distance(actuator, counts).await?;
        self.start(actuator).await?;
        self.expected[actuator.index()].fetch_add(counts, Ordering::SeqCst);
        Ok(())
    }

    /// Move `actuator` by one configured scan step.
    pub async fn step(&self, actuator: Actuator) -> AppResult<()> {
        self.move_by(actuator, self.axis(actuator).step_counts).await
    }

    /// Sum of all acknowledged moves of `actuator` since construction.
    pub fn expected_counts(&self, actuator: Actuator) -> i64 {
        self.expected[actuator.index()].load(Ordering::SeqCst)
    }

    /// Best-effort stop of both stages; failures are logged.
    pub async fn stop_all(&self) {
        for actuator in Actuator::ALL {
            if let Err(e) = self.stop(actuator).await {
                warn!(%actuator, error = %e, "Stop command failed");
            }
        }
    }
}

/// Wait a fixed duration for a stage to come to rest.
pub async fn settle(duration: Duration) {
    if !duration.is_zero() {
        debug!(?duration, "Settling");
        tokio::time::sleep(duration).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::SimulatedEndpoint;
    use crate::serial::wrap_shared;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn simulated_controller() -> (MotionController, SimulatedEndpoint, SimulatedEndpoint) {
        let large = SimulatedEndpoint::new();
        let small = SimulatedEndpoint::new();
        let controller = MotionController::new(
            MotionConfig::default(),
            Box::new(large.clone()),
            Box::new(small.clone()),
        );
        (controller, large, small)
    }

    #[test]
    fn acknowledgment_validation() {
        assert_eq!(parse_acknowledgment(b"ok").unwrap(), "ok");
        assert_eq!(parse_acknowledgment(b"v 31").unwrap(), "v 31");
        assert!(parse_acknowledgment(b"").is_err());
        assert!(parse_acknowledgment(b"  ").is_err());
        assert!(parse_acknowledgment(b"e 33").is_err());
        assert!(parse_acknowledgment(&[0xff, 0xfe]).is_err());
        assert!(parse_acknowledgment(b"garbage").is_err());
    }

    #[tokio::test]
    async fn command_is_cr_terminated_on_the_wire() {
        let (mut host, device) = tokio::io::duplex(64);
        let endpoint = AsciiEndpoint::new(wrap_shared(Box::new(device)), Duration::from_secs(1));

        let responder = tokio::spawn(async move {
            let mut buf = vec![0u8; 64];
            let n = host.read(&mut buf).await.unwrap();
            host.write_all(b"ok\r").await.unwrap();
            buf.truncate(n);
            buf
        });

        let reply = endpoint.send("s r0xca 750000").await.unwrap();
        assert_eq!(reply, b"ok");
        assert_eq!(responder.await.unwrap(), b"s r0xca 750000\r");
    }

    #[tokio::test]
    async fn missing_acknowledgment_times_out() {
        let (_host, device) = tokio::io::duplex(64);
        let endpoint =
            AsciiEndpoint::new(wrap_shared(Box::new(device)), Duration::from_millis(20));
        let controller = MotionController::new(
            MotionConfig::default(),
            Box::new(endpoint),
            Box::new(SimulatedEndpoint::new()),
        );

        let err = controller.start(Actuator::Large).await.unwrap_err();
        match err {
            ScanError::CommandFailed {
                actuator, command, ..
            } => {
                assert_eq!(actuator, Actuator::Large);
                assert_eq!(command, "t 1");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn error_code_fails_command() {
        let large = SimulatedEndpoint::new();
        let small = SimulatedEndpoint::new().failing_on("t 1");
        let controller =
            MotionController::new(MotionConfig::default(), Box::new(large), Box::new(small));

        let err = controller.move_by(Actuator::Small, 100).await.unwrap_err();
        assert!(matches!(err, ScanError::CommandFailed { actuator: Actuator::Small, .. }));
        assert_eq!(controller.expected_counts(Actuator::Small), 0);
    }

    #[tokio::test]
    async fn initialize_sends_profile_in_order() {
        let (controller, large, small) = simulated_controller();
        controller.initialize().await.unwrap();

        assert_eq!(
            large.commands(),
            vec!["s r0x24 31", "s r0xc8 256", "s r0xca -1800000", "s r0xcb 3400000"]
        );
        assert_eq!(
            small.commands(),
            vec!["s r0x24 31", "s r0xc8 256", "s r0xca 750000", "s r0xcb 5000000"]
        );
    }

    #[tokio::test]
    async fn expected_counts_track_commanded_moves() {
        let (controller, _large, small) = simulated_controller();

        controller.move_by(Actuator::Small, -1_500_000).await.unwrap();
        controller.step(Actuator::Small).await.unwrap();
        controller.step(Actuator::Small).await.unwrap();

        assert_eq!(controller.expected_counts(Actuator::Small), 0);
        assert_eq!(controller.expected_counts(Actuator::Large), 0);
        assert_eq!(
            small.commands(),
            vec!["s r0xca -1500000", "t 1", "s r0xca 750000", "t 1", "s r0xca 750000", "t 1"]
        );
    }
}
