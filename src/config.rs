//! Scan Configuration using Figment
//!
//! Configuration is layered, later layers overriding earlier ones:
//! 1. Built-in defaults (`ScanConfig::default()`, matching the rig's bench setup)
//! 2. A TOML file (default `config/scan.toml`)
//! 3. Environment variables prefixed with `ULTRASONIC_DAQ_`, nested with `__`
//!
//! # Example
//! ```no_run
//! use ultrasonic_daq::config::ScanConfig;
//!
//! let config = ScanConfig::load()?;
//! config.validate()?;
//! println!("Archive: {}", config.storage.archive_path().display());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Environment example: `ULTRASONIC_DAQ_STORAGE__COMPRESSION_LEVEL=6`.

use crate::error::{AppResult, ScanError};
use crate::logging::OutputFormat;
use crate::storage::archive::ScanMetadata;
use crate::storage::channel_map::AcqMode;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/scan.toml";

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "ULTRASONIC_DAQ_";

/// Top-level scan configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Sweep geometry and metadata
    pub scan: ScanPlanConfig,
    /// Motor controller endpoints and move primitives
    pub motion: MotionConfig,
    /// External acquisition engine
    pub acquisition: AcquisitionConfig,
    /// Archive output
    pub storage: StorageConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format
    pub log_format: OutputFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "Ultrasonic Immersion Scan".to_string(),
            log_level: "info".to_string(),
            log_format: OutputFormat::Pretty,
        }
    }
}

/// Sweep geometry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanPlanConfig {
    /// Number of transmitter (large stage) positions
    pub source_count: usize,
    /// Number of receiver (small stage) positions per transmitter position
    pub receiver_count: usize,
    /// Channel mapping written to the side files
    pub mode: AcqMode,
    /// Scan-wide metadata written as archive root attributes
    pub metadata: ScanMetadata,
}

impl Default for ScanPlanConfig {
    fn default() -> Self {
        Self {
            source_count: 4,
            receiver_count: 5,
            mode: AcqMode::Fmc,
            metadata: ScanMetadata::default(),
        }
    }
}

/// Both actuators plus settle timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotionConfig {
    /// Coarse rotation stage carrying the transmitter
    pub large: AxisConfig,
    /// Fine rotation stage carrying the receiver
    pub small: AxisConfig,
    /// Settle after the small stage moves to its first scan position
    #[serde(with = "humantime_serde")]
    pub initial_settle: Duration,
    /// Settle after each large stage step
    #[serde(with = "humantime_serde")]
    pub coarse_settle: Duration,
    /// Settle after each small stage step
    #[serde(with = "humantime_serde")]
    pub fine_settle: Duration,
    /// Wait before the final return-to-home moves
    #[serde(with = "humantime_serde")]
    pub final_settle: Duration,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            // 20,000 counts per degree; -1,800,000 is a 90 degree step
            large: AxisConfig {
                port: "COM3".to_string(),
                step_counts: -1_800_000,
                initial_offset_counts: 0,
                max_velocity: 3_400_000,
                counts_per_degree: 20_000.0,
                ..AxisConfig::default()
            },
            // 25,000 counts per degree; 750,000 is a 30 degree step
            small: AxisConfig {
                port: "COM4".to_string(),
                step_counts: 750_000,
                initial_offset_counts: -1_500_000,
                max_velocity: 5_000_000,
                counts_per_degree: 25_000.0,
                ..AxisConfig::default()
            },
            initial_settle: Duration::from_secs(2),
            coarse_settle: Duration::from_secs(4),
            fine_settle: Duration::from_secs(2),
            final_settle: Duration::from_secs(6),
        }
    }
}

/// One serial-attached stepper axis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AxisConfig {
    /// Serial port path (e.g. "/dev/ttyUSB0", "COM3")
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// How long to wait for each command acknowledgment
    #[serde(with = "humantime_serde")]
    pub response_timeout: Duration,
    /// Relative distance of one scan step, in encoder counts
    pub step_counts: i64,
    /// Move from the mechanical home to the first scan position, in counts
    pub initial_offset_counts: i64,
    /// Maximum velocity in 0.1 counts/second
    pub max_velocity: i64,
    /// Encoder counts per degree of stage rotation
    pub counts_per_degree: f64,
}

impl Default for AxisConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: 9600,
            response_timeout: Duration::from_secs(1),
            step_counts: 0,
            initial_offset_counts: 0,
            max_velocity: 0,
            counts_per_degree: 1.0,
        }
    }
}

/// External acquisition engine process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Engine executable
    pub program: String,
    /// Engine command-line arguments
    pub args: Vec<String>,
    /// Working directory of the engine
    ///
    /// Sentinel and exchange paths are relative to it, and the channel-map
    /// files the routine reads are written here.
    pub working_dir: PathBuf,
    /// Lines sent once after the engine starts
    pub startup_commands: Vec<String>,
    /// Wait after the startup commands before the engine is considered ready
    #[serde(with = "humantime_serde")]
    pub startup_delay: Duration,
    /// Line that runs one full-matrix acquisition and publishes the matrix
    ///
    /// The exchange file must appear in one step: save to a temporary name,
    /// then rename it to `exchange_file`.
    pub trigger_command: String,
    /// Line that ends the engine session
    pub quit_command: String,
    /// File that exists while an acquisition is in progress
    pub sentinel: PathBuf,
    /// HDF5-based (MAT v7.3) file the acquisition routine saves its matrix into
    pub exchange_file: PathBuf,
    /// Dataset name of the matrix inside the exchange file
    pub matrix_variable: String,
    /// Wait after triggering before the busy indicator is first checked
    #[serde(with = "humantime_serde")]
    pub start_delay: Duration,
    /// Busy indicator poll interval
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Upper bound on one acquisition
    #[serde(with = "humantime_serde")]
    pub max_wait: Duration,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            program: "matlab".to_string(),
            args: vec!["-nodesktop".to_string(), "-nosplash".to_string()],
            working_dir: PathBuf::from("."),
            startup_commands: vec!["activate".to_string()],
            startup_delay: Duration::from_secs(10),
            trigger_command: "FMC_Imasonics_MA_TM_FullAcquisition; \
                              save('RcvData.part.mat', 'RcvData', '-v7.3'); \
                              movefile('RcvData.part.mat', 'RcvData.mat')"
                .to_string(),
            quit_command: "exit".to_string(),
            sentinel: PathBuf::from("Busy.txt"),
            exchange_file: PathBuf::from("RcvData.mat"),
            matrix_variable: "RcvData".to_string(),
            start_delay: Duration::from_secs(1),
            poll_interval: Duration::from_secs(1),
            max_wait: Duration::from_secs(120),
        }
    }
}

/// Archive output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for the archive and the run summary
    pub output_dir: PathBuf,
    /// Archive file name
    pub filename: String,
    /// Deflate level (0-9)
    pub compression_level: u8,
    /// Pending write requests the archive writer queues before callers wait
    pub queue_capacity: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            filename: "p_test.h5".to_string(),
            compression_level: 4,
            queue_capacity: 16,
        }
    }
}

impl AxisConfig {
    /// Convert encoder counts to degrees of rotation.
    pub fn degrees(&self, counts: i64) -> f64 {
        counts as f64 / self.counts_per_degree
    }
}

impl StorageConfig {
    /// Full path of the archive file.
    pub fn archive_path(&self) -> PathBuf {
        self.output_dir.join(&self.filename)
    }
}

impl ScanConfig {
    /// Load configuration from config/scan.toml and environment variables
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(ScanConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let invalid = |msg: String| Err(ScanError::Configuration(msg));

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.scan.source_count == 0 || self.scan.receiver_count == 0 {
            return invalid(format!(
                "source_count and receiver_count must be at least 1 (got {} x {})",
                self.scan.source_count, self.scan.receiver_count
            ));
        }

        for (name, axis) in [("large", &self.motion.large), ("small", &self.motion.small)] {
            if axis.port.trim().is_empty() {
                return invalid(format!("motion.{name}.port must not be empty"));
            }
            if axis.step_counts == 0 {
                return invalid(format!("motion.{name}.step_counts must be non-zero"));
            }
            if axis.max_velocity <= 0 {
                return invalid(format!("motion.{name}.max_velocity must be positive"));
            }
            if !(axis.counts_per_degree > 0.0) {
                return invalid(format!("motion.{name}.counts_per_degree must be positive"));
            }
            if axis.response_timeout.is_zero() {
                return invalid(format!("motion.{name}.response_timeout must be non-zero"));
            }
        }

        let acq = &self.acquisition;
        if acq.poll_interval.is_zero() {
            return invalid("acquisition.poll_interval must be non-zero".to_string());
        }
        if acq.poll_interval > acq.max_wait {
            return invalid(format!(
                "acquisition.poll_interval ({:?}) exceeds max_wait ({:?})",
                acq.poll_interval, acq.max_wait
            ));
        }
        if acq.trigger_command.trim().is_empty() {
            return invalid("acquisition.trigger_command must not be empty".to_string());
        }

        if self.storage.compression_level > 9 {
            return invalid(format!(
                "Invalid compression_level {}. Must be 0-9",
                self.storage.compression_level
            ));
        }
        if self.storage.filename.trim().is_empty() {
            return invalid("storage.filename must not be empty".to_string());
        }
        if self.storage.queue_capacity == 0 {
            return invalid("storage.queue_capacity must be at least 1".to_string());
        }

        Ok(())
    }

    /// Total number of position pairs the sweep captures.
    pub fn expected_entries(&self) -> usize {
        self.scan.source_count * self.scan.receiver_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::archive::MetadataValue;
    use figment::Jail;

    #[test]
    fn defaults_match_bench_setup() {
        let config = ScanConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.expected_entries(), 20);
        assert_eq!(config.motion.small.initial_offset_counts, -1_500_000);
        assert_eq!(config.motion.large.step_counts, -1_800_000);
        assert_eq!(config.motion.large.degrees(-1_800_000), -90.0);
        assert_eq!(config.motion.small.degrees(750_000), 30.0);
        assert_eq!(config.storage.compression_level, 4);
        assert_eq!(config.storage.archive_path(), PathBuf::from("./p_test.h5"));
    }

    #[test]
    fn test_invalid_compression_level() {
        let mut config = ScanConfig::default();
        config.storage.compression_level = 12;
        assert!(matches!(
            config.validate(),
            Err(ScanError::Configuration(msg)) if msg.contains("compression_level")
        ));
    }

    #[test]
    fn test_zero_positions_rejected() {
        let mut config = ScanConfig::default();
        config.scan.receiver_count = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_poll_interval_bounded_by_max_wait() {
        let mut config = ScanConfig::default();
        config.acquisition.poll_interval = Duration::from_secs(10);
        config.acquisition.max_wait = Duration::from_secs(5);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = ScanConfig::default();
        config.application.log_level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_overrides_keep_unspecified_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "scan.toml",
                r#"
                [scan]
                source_count = 2
                mode = "reflective"

                [scan.metadata]
                Sample = "A"
                "Water Temp" = 18

                [motion]
                fine_settle = "250ms"

                [motion.small]
                port = "/dev/ttyUSB1"
                "#,
            )?;

            let config = ScanConfig::load_from("scan.toml")?;
            assert_eq!(config.scan.source_count, 2);
            assert_eq!(config.scan.receiver_count, 5);
            assert_eq!(config.scan.mode, AcqMode::Reflective);
            assert_eq!(config.motion.fine_settle, Duration::from_millis(250));
            assert_eq!(config.motion.small.port, "/dev/ttyUSB1");
            assert_eq!(config.motion.small.step_counts, 750_000);
            assert_eq!(
                config.scan.metadata.get("Water Temp"),
                Some(&MetadataValue::Int(18))
            );
            assert_eq!(
                config.scan.metadata.get("Sample"),
                Some(&MetadataValue::Text("A".to_string()))
            );
            Ok(())
        });
    }

    #[test]
    fn test_env_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file("scan.toml", "[storage]\ncompression_level = 2\n")?;
            jail.set_env("ULTRASONIC_DAQ_STORAGE__COMPRESSION_LEVEL", "7");
            jail.set_env("ULTRASONIC_DAQ_STORAGE__FILENAME", "sample_b.h5");

            let config = ScanConfig::load_from("scan.toml")?;
            assert_eq!(config.storage.compression_level, 7);
            assert_eq!(config.storage.filename, "sample_b.h5");
            Ok(())
        });
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        Jail::expect_with(|_jail| {
            let config = ScanConfig::load_from("does_not_exist.toml")?;
            assert_eq!(config.scan.source_count, 4);
            Ok(())
        });
    }
}
