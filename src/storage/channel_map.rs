//! Channel-map side files.
//!
//! The acquisition routine reads which array elements fire and which listen
//! from two single-row CSV files in its working directory. They exist only
//! for the duration of a scan.

use crate::error::AppResult;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Transmit channel list file name.
pub const SOURCE_FILE: &str = "sourceModes.csv";
/// Receive channel list file name.
pub const RECEIVER_FILE: &str = "receiverModes.csv";

/// Element pairing used by the acquisition routine.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum AcqMode {
    /// Full matrix capture: elements 1-32 transmit, 33-64 receive
    #[default]
    Fmc,
    /// Pulse-echo: elements 1-32 both transmit and receive
    Reflective,
}

impl AcqMode {
    /// Channels that transmit.
    pub fn source_channels(self) -> RangeInclusive<u32> {
        1..=32
    }

    /// Channels that receive.
    pub fn receiver_channels(self) -> RangeInclusive<u32> {
        match self {
            AcqMode::Fmc => 33..=64,
            AcqMode::Reflective => 1..=32,
        }
    }

    /// Name recorded in the archive's `Mode` attribute.
    pub fn label(self) -> &'static str {
        match self {
            AcqMode::Fmc => "FMC",
            AcqMode::Reflective => "Reflective",
        }
    }
}

impl fmt::Display for AcqMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// The pair of channel files written for one scan.
#[derive(Debug)]
pub struct ChannelFiles {
    source: PathBuf,
    receiver: PathBuf,
}

impl ChannelFiles {
    /// Write both files for `mode` into `dir`, replacing existing ones.
    pub fn write(dir: &Path, mode: AcqMode) -> AppResult<Self> {
        std::fs::create_dir_all(dir)?;
        let files = Self {
            source: dir.join(SOURCE_FILE),
            receiver: dir.join(RECEIVER_FILE),
        };
        write_row(&files.source, mode.source_channels())?;
        write_row(&files.receiver, mode.receiver_channels())?;
        debug!(%mode, dir = %dir.display(), "Wrote channel maps");
        Ok(files)
    }

    /// Path of the transmit channel file.
    pub fn source_path(&self) -> &Path {
        &self.source
    }

    /// Path of the receive channel file.
    pub fn receiver_path(&self) -> &Path {
        &self.receiver
    }

    /// Delete both files. Already missing files are not an error.
    pub fn remove(self) -> AppResult<()> {
        for path in [&self.source, &self.receiver] {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        debug!("Removed channel maps");
        Ok(())
    }

    /// Leave the files in place after an incomplete scan.
    pub fn keep(self) {
        warn!(
            source = %self.source.display(),
            receiver = %self.receiver.display(),
            "Scan did not complete; channel map files left in place"
        );
    }
}

fn write_row(path: &Path, channels: RangeInclusive<u32>) -> AppResult<()> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)?;
    writer.write_record(channels.map(|c| c.to_string()))?;
    writer.flush()?;
    Ok(())
}

/// Read a channel file back.
pub fn read_channels(path: &Path) -> AppResult<Vec<u32>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_path(path)?;
    let mut channels = Vec::new();
    for record in reader.deserialize::<Vec<u32>>() {
        channels.extend(record?);
    }
    Ok(channels)
}
