//! Read-side archive inspection.
//!
//! [`ArchiveReader`] is implemented for HDF5 files (`storage_hdf5`) and for the
//! in-memory archive; [`InspectReport`] collects the overview the `inspect`
//! subcommand prints.

use crate::error::{AppResult, ScanError};
use crate::storage::archive::{EntryKey, MemoryArchive, ScanMetadata, StoredEntry};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Read access to a finished archive.
pub trait ArchiveReader {
    /// Names of the top-level groups (one per transmitter position).
    fn group_names(&self) -> AppResult<Vec<String>>;

    /// Root attributes (scan metadata).
    fn root_attributes(&self) -> AppResult<ScanMetadata>;

    /// Every entry in the archive, ascending.
    fn entry_keys(&self) -> AppResult<Vec<EntryKey>>;

    /// Shape of one entry's dataset.
    fn entry_shape(&self, key: EntryKey) -> AppResult<Vec<usize>>;

    /// One entry's dataset and position attributes.
    fn read_entry(&self, key: EntryKey) -> AppResult<StoredEntry>;
}

impl ArchiveReader for MemoryArchive {
    fn group_names(&self) -> AppResult<Vec<String>> {
        let mut names: Vec<String> = self.keys().iter().map(EntryKey::source_group).collect();
        names.dedup();
        Ok(names)
    }

    fn root_attributes(&self) -> AppResult<ScanMetadata> {
        Ok(self.metadata())
    }

    fn entry_keys(&self) -> AppResult<Vec<EntryKey>> {
        Ok(self.keys())
    }

    fn entry_shape(&self, key: EntryKey) -> AppResult<Vec<usize>> {
        Ok(self.read_entry(key)?.matrix.shape().to_vec())
    }

    fn read_entry(&self, key: EntryKey) -> AppResult<StoredEntry> {
        self.entry(key)
            .ok_or_else(|| ScanError::InvalidEntry(format!("no entry {key} in archive")))
    }
}

/// Open an archive file for reading.
#[cfg(feature = "storage_hdf5")]
pub fn open_reader(path: &Path) -> AppResult<Box<dyn ArchiveReader>> {
    Ok(Box::new(crate::storage::hdf5_archive::Hdf5Reader::open(
        path,
    )?))
}

/// Open an archive file for reading.
#[cfg(not(feature = "storage_hdf5"))]
pub fn open_reader(_path: &Path) -> AppResult<Box<dyn ArchiveReader>> {
    Err(ScanError::FeatureNotEnabled("storage_hdf5".to_string()))
}

/// Overview of one entry.
#[derive(Debug, Clone, Serialize)]
pub struct EntrySummary {
    /// `transmitter{s}/receiver{r}`
    pub path: String,
    /// Dataset dimensions
    pub shape: Vec<usize>,
}

/// Overview of a whole archive.
#[derive(Debug, Clone, Serialize)]
pub struct InspectReport {
    /// Top-level group names
    pub groups: Vec<String>,
    /// Root attributes rendered as text
    pub attributes: BTreeMap<String, String>,
    /// Every entry with its shape
    pub entries: Vec<EntrySummary>,
}

impl InspectReport {
    /// Walk `reader` and collect groups, attributes and entry shapes.
    pub fn collect(reader: &dyn ArchiveReader) -> AppResult<Self> {
        let attributes = reader
            .root_attributes()?
            .iter()
            .map(|(name, value)| (name.clone(), value.to_string()))
            .collect();

        let entries = reader
            .entry_keys()?
            .into_iter()
            .map(|key| {
                Ok(EntrySummary {
                    path: key.to_string(),
                    shape: reader.entry_shape(key)?,
                })
            })
            .collect::<AppResult<Vec<_>>>()?;

        Ok(Self {
            groups: reader.group_names()?,
            attributes,
            entries,
        })
    }

    /// Pairs of the `sources` × `receivers` grid that are absent from the archive.
    pub fn missing(&self, sources: u32, receivers: u32) -> Vec<EntryKey> {
        EntryKey::grid(sources, receivers)
            .filter(|key| {
                let path = key.to_string();
                !self.entries.iter().any(|entry| entry.path == path)
            })
            .collect()
    }
}
