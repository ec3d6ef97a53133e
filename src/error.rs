//! Custom error types for the scan controller.
//!
//! This module defines the primary error type, `ScanError`, for the entire crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the failure modes of a scan, from configuration problems to motor communication,
//! acquisition and archival errors.
//!
//! ## Error Hierarchy
//!
//! - **`CommandFailed`**: A motion endpoint did not acknowledge a command, timed out,
//!   or answered with a controller error code. Aborts the remaining sweep.
//! - **`AcquisitionTimeout`**: The acquisition engine's busy indicator never cleared
//!   within the configured bound. Aborts the remaining sweep.
//! - **`Engine`**: The acquisition engine could not be started or its matrix fetched.
//! - **`DuplicateEntry`**: An archive entry was submitted twice for the same pair.
//! - **`ArchivalWriteFailed`**: I/O or structural failure while writing one entry.
//!   Recorded as a missing entry; sibling writes continue.
//! - **`Archive`**: The archive container itself could not be created, annotated or closed.
//! - **`Config`** / **`Configuration`**: Configuration extraction and semantic validation.
//! - **`Aborted`**: The operator raised the abort signal.
//!
//! By using `#[from]`, `ScanError` can be created from underlying error types,
//! so the `?` operator works across I/O, CSV and configuration boundaries.

use crate::hardware::motion::Actuator;
use crate::storage::archive::EntryKey;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, ScanError>;

/// Every failure a scan can surface.
#[derive(Error, Debug)]
pub enum ScanError {
    /// Motion endpoint rejected or never acknowledged a command.
    #[error("{actuator} actuator command '{command}' failed: {reason}")]
    CommandFailed {
        /// Actuator the command was addressed to
        actuator: Actuator,
        /// Command text without terminator
        command: String,
        /// What was wrong with the acknowledgment
        reason: String,
    },

    /// Busy indicator did not clear within the configured bound.
    #[error("acquisition for {key} did not complete within {waited:?}")]
    AcquisitionTimeout {
        /// Pair being captured
        key: EntryKey,
        /// Time spent waiting for the busy indicator
        waited: Duration,
    },

    /// Acquisition engine failure other than a timeout.
    #[error("acquisition engine error: {0}")]
    Engine(String),

    /// Archive entry already exists for this pair.
    #[error("archive entry {key} already exists")]
    DuplicateEntry {
        /// Pair that was submitted twice
        key: EntryKey,
    },

    /// Writing one archive entry failed.
    #[error("failed to archive {key}: {reason}")]
    ArchivalWriteFailed {
        /// Pair whose entry is missing
        key: EntryKey,
        /// Underlying failure
        reason: String,
    },

    /// Archive container level failure (create, metadata, close).
    #[error("archive error: {0}")]
    Archive(String),

    /// Malformed entry key or matrix.
    #[error("invalid archive entry: {0}")]
    InvalidEntry(String),

    /// Configuration could not be extracted from its sources.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration loaded but is not usable.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Filesystem or process I/O.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel-map file encoding.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Operator requested an abort.
    #[error("scan aborted by operator")]
    Aborted,

    /// Operation needs a cargo feature this build lacks.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl From<figment::Error> for ScanError {
    fn from(value: figment::Error) -> Self {
        ScanError::Config(Box::new(value))
    }
}

#[cfg(feature = "storage_hdf5")]
impl From<hdf5::Error> for ScanError {
    fn from(value: hdf5::Error) -> Self {
        ScanError::Archive(value.to_string())
    }
}

impl ScanError {
    /// Wrap an arbitrary failure as a write failure for `key`.
    pub fn write_failed(key: EntryKey, reason: impl std::fmt::Display) -> Self {
        ScanError::ArchivalWriteFailed {
            key,
            reason: reason.to_string(),
        }
    }
}
