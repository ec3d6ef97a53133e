//! Scan summary reporting.
//!
//! A [`ScanSummary`] is produced by every sweep, complete or not, and can be
//! saved next to the archive as JSON.

use crate::error::AppResult;
use crate::experiment::state::SweepState;
use crate::storage::archive::EntryKey;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// One entry that was captured but not archived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedWrite {
    /// Pair whose entry is missing
    pub key: EntryKey,
    /// Why the write failed
    pub reason: String,
}

/// What a sweep achieved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSummary {
    /// Wall-clock start of the sweep
    pub started_at: DateTime<Local>,
    /// Time from start to archive close
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
    /// Final sweep state (`Done` or `Aborted`)
    pub final_state: SweepState,
    /// Archive location, if written to a file
    pub archive_path: Option<PathBuf>,
    /// Number of entries a complete sweep produces
    pub expected: usize,
    /// Entries archived, ascending
    pub archived: Vec<EntryKey>,
    /// Pairs of the grid absent from the archive, ascending
    pub missing: Vec<EntryKey>,
    /// Captured pairs whose archive write failed
    pub failed_writes: Vec<FailedWrite>,
    /// Pair being positioned or captured when the sweep stopped
    pub in_flight: Option<EntryKey>,
    /// Why the sweep stopped early
    pub abort_reason: Option<String>,
}

impl ScanSummary {
    /// Whether every pair of the grid was archived.
    pub fn is_complete(&self) -> bool {
        self.final_state == SweepState::Done && self.missing.is_empty()
    }

    /// Save the summary as pretty-printed JSON, creating parent directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> AppResult<()> {
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, json)?;
        Ok(())
    }

    /// Load a summary saved by [`save`](Self::save).
    pub fn load<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json).map_err(std::io::Error::other)?)
    }
}

impl fmt::Display for ScanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Scan {} in {:.2?}", self.final_state, self.elapsed)?;
        writeln!(f, "  archived: {}/{}", self.archived.len(), self.expected)?;
        if let Some(path) = &self.archive_path {
            writeln!(f, "  archive:  {}", path.display())?;
        }
        if let Some(reason) = &self.abort_reason {
            writeln!(f, "  stopped:  {reason}")?;
        }
        if let Some(key) = self.in_flight {
            writeln!(f, "  in flight: {key}")?;
        }
        for failed in &self.failed_writes {
            writeln!(f, "  write failed: {} ({})", failed.key, failed.reason)?;
        }
        if !self.missing.is_empty() {
            let missing: Vec<String> = self.missing.iter().map(ToString::to_string).collect();
            writeln!(f, "  missing:  {}", missing.join(", "))?;
        }
        Ok(())
    }
}
