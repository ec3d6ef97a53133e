//! Archive data model and the backend seam.
//!
//! An archive holds scan-wide metadata as root attributes and one entry per
//! transmitter/receiver position pair:
//!
//! ```text
//! /                          (root attrs: Date, Time, Sample, ..., NSrc, NRec)
//! └── transmitter{s}/
//!     └── receiver{r}/       (attrs: SrcPos = s, RecPos = r)
//!         └── data           (i16 waveform matrix, deflate-compressed)
//! ```
//!
//! Backends are blocking and owned by a single task (see
//! [`ArchiveWriter`](crate::storage::writer::ArchiveWriter)); nothing here is
//! safe to mutate from several threads without that owner.

use crate::error::{AppResult, ScanError};
use ndarray::{ArrayD, IxDyn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// Name of the dataset inside every entry group.
pub const DATASET_NAME: &str = "data";
/// Entry attribute holding the 1-based source position.
pub const SOURCE_ATTR: &str = "SrcPos";
/// Entry attribute holding the 1-based receiver position.
pub const RECEIVER_ATTR: &str = "RecPos";

/// 1-based transmitter/receiver position pair identifying one archive entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryKey {
    source: u32,
    receiver: u32,
}

impl EntryKey {
    /// Build a key; both indices must be at least 1.
    pub fn new(source: u32, receiver: u32) -> AppResult<Self> {
        if source == 0 || receiver == 0 {
            return Err(ScanError::InvalidEntry(format!(
                "position indices are 1-based, got source {source}, receiver {receiver}"
            )));
        }
        Ok(Self { source, receiver })
    }

    /// Source (transmitter) position index.
    pub fn source(&self) -> u32 {
        self.source
    }

    /// Receiver position index.
    pub fn receiver(&self) -> u32 {
        self.receiver
    }

    /// Name of the top-level group holding this entry.
    pub fn source_group(&self) -> String {
        format!("transmitter{}", self.source)
    }

    /// Name of the entry group inside [`source_group`](Self::source_group).
    pub fn receiver_group(&self) -> String {
        format!("receiver{}", self.receiver)
    }

    /// Path of the entry's dataset, e.g. `transmitter2/receiver3/data`.
    pub fn dataset_path(&self) -> String {
        format!("{self}/{DATASET_NAME}")
    }

    /// Parse a `transmitter{s}/receiver{r}` path.
    pub fn parse(path: &str) -> AppResult<Self> {
        let invalid = || ScanError::InvalidEntry(format!("not an entry path: '{path}'"));
        let (source, receiver) = path.trim_matches('/').split_once('/').ok_or_else(invalid)?;
        let source = parse_index(source, "transmitter").ok_or_else(invalid)?;
        let receiver = parse_index(receiver, "receiver").ok_or_else(invalid)?;
        Self::new(source, receiver)
    }

    /// Every pair of a `sources` × `receivers` sweep in sweep order.
    pub fn grid(sources: u32, receivers: u32) -> impl Iterator<Item = EntryKey> {
        (1..=sources).flat_map(move |source| {
            (1..=receivers).map(move |receiver| EntryKey { source, receiver })
        })
    }
}

/// Parse the numeric suffix of a group name such as `transmitter12`.
pub(crate) fn parse_index(name: &str, prefix: &str) -> Option<u32> {
    name.strip_prefix(prefix)?.parse().ok()
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transmitter{}/receiver{}", self.source, self.receiver)
    }
}

/// Captured full-matrix waveform set.
///
/// Always non-empty and in standard (row-major) layout, so it can be handed
/// to storage as a flat slice plus shape.
#[derive(Debug, Clone, PartialEq)]
pub struct WaveformMatrix(ArrayD<i16>);

impl WaveformMatrix {
    /// Wrap an array, rejecting zero-dimensional or empty arrays.
    pub fn new(array: ArrayD<i16>) -> AppResult<Self> {
        if array.ndim() == 0 || array.is_empty() {
            return Err(ScanError::InvalidEntry(format!(
                "waveform matrix must be non-empty, got shape {:?}",
                array.shape()
            )));
        }
        let array = if array.is_standard_layout() {
            array
        } else {
            array.as_standard_layout().into_owned()
        };
        Ok(Self(array))
    }

    /// Build from a row-major sample buffer.
    pub fn from_shape_vec(shape: &[usize], samples: Vec<i16>) -> AppResult<Self> {
        let array = ArrayD::from_shape_vec(IxDyn(shape), samples)
            .map_err(|e| ScanError::InvalidEntry(format!("shape {shape:?}: {e}")))?;
        Self::new(array)
    }

    /// Dimensions, outermost first.
    pub fn shape(&self) -> &[usize] {
        self.0.shape()
    }

    /// Total sample count.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Never true for a constructed matrix.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Samples in row-major order.
    pub fn as_slice(&self) -> &[i16] {
        self.0.as_slice().unwrap_or(&[])
    }

    /// Borrow the underlying array.
    pub fn array(&self) -> &ArrayD<i16> {
        &self.0
    }

    /// Unwrap into the underlying array.
    pub fn into_array(self) -> ArrayD<i16> {
        self.0
    }
}

/// Scalar metadata value stored as a root attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    /// Integer attribute (i64)
    Int(i64),
    /// Floating point attribute (f64)
    Float(f64),
    /// String attribute (variable-length UTF-8)
    Text(String),
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataValue::Int(v) => write!(f, "{v}"),
            MetadataValue::Float(v) => write!(f, "{v}"),
            MetadataValue::Text(v) => write!(f, "{v}"),
        }
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        MetadataValue::Int(value)
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        MetadataValue::Float(value)
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::Text(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        MetadataValue::Text(value)
    }
}

/// Ordered scan-wide metadata, written once at archive creation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScanMetadata(BTreeMap<String, MetadataValue>);

impl ScanMetadata {
    /// Empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key`, replacing any previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<MetadataValue>) {
        self.0.insert(key.into(), value.into());
    }

    /// Set `key` only if it is not already present.
    pub fn insert_default(&mut self, key: impl Into<String>, value: impl Into<MetadataValue>) {
        self.0.entry(key.into()).or_insert_with(|| value.into());
    }

    /// Look up one value.
    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.0.get(key)
    }

    /// Iterate in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &MetadataValue)> {
        self.0.iter()
    }

    /// Number of attributes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no attributes are set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, MetadataValue)> for ScanMetadata {
    fn from_iter<T: IntoIterator<Item = (String, MetadataValue)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// One archived entry as read back from storage.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntry {
    /// Entry location
    pub key: EntryKey,
    /// `SrcPos` attribute
    pub source_position: i64,
    /// `RecPos` attribute
    pub receiver_position: i64,
    /// The archived matrix
    pub matrix: WaveformMatrix,
}

/// Blocking archive storage.
///
/// Implementations are owned by exactly one task and never shared; all
/// structural mutation goes through `&mut self`.
pub trait ArchiveBackend: Send + 'static {
    /// Write scan metadata as root attributes. Called once, before any entry.
    fn write_metadata(&mut self, metadata: &ScanMetadata) -> AppResult<()>;

    /// Whether an entry already exists for `key`.
    fn contains(&self, key: EntryKey) -> AppResult<bool>;

    /// Create the entry for `key`. Never called for an existing key.
    fn write_entry(&mut self, key: EntryKey, matrix: &WaveformMatrix) -> AppResult<()>;

    /// Push buffered data to durable storage.
    fn flush(&mut self) -> AppResult<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryStore {
    metadata: ScanMetadata,
    entries: BTreeMap<EntryKey, StoredEntry>,
}

/// In-process archive used for dry runs and tests.
///
/// Clones share one store, so a test can keep a clone for inspection while
/// the original is moved into the writer.
#[derive(Debug, Clone, Default)]
pub struct MemoryArchive {
    store: Arc<RwLock<MemoryStore>>,
    failing: Arc<BTreeSet<EntryKey>>,
}

impl MemoryArchive {
    /// Empty archive.
    pub fn new() -> Self {
        Self::default()
    }

    /// Archive whose writes for `keys` fail with an I/O error.
    pub fn failing_on(keys: impl IntoIterator<Item = EntryKey>) -> Self {
        Self {
            store: Arc::default(),
            failing: Arc::new(keys.into_iter().collect()),
        }
    }

    /// Number of stored entries.
    pub fn entry_count(&self) -> usize {
        self.store.read().entries.len()
    }

    /// Keys of all stored entries in ascending order.
    pub fn keys(&self) -> Vec<EntryKey> {
        self.store.read().entries.keys().copied().collect()
    }

    /// Root attributes written so far.
    pub fn metadata(&self) -> ScanMetadata {
        self.store.read().metadata.clone()
    }

    /// Stored entry for `key`, if any.
    pub fn entry(&self, key: EntryKey) -> Option<StoredEntry> {
        self.store.read().entries.get(&key).cloned()
    }
}

impl ArchiveBackend for MemoryArchive {
    fn write_metadata(&mut self, metadata: &ScanMetadata) -> AppResult<()> {
        self.store.write().metadata = metadata.clone();
        Ok(())
    }

    fn contains(&self, key: EntryKey) -> AppResult<bool> {
        Ok(self.store.read().entries.contains_key(&key))
    }

    fn write_entry(&mut self, key: EntryKey, matrix: &WaveformMatrix) -> AppResult<()> {
        if self.failing.contains(&key) {
            return Err(ScanError::Io(std::io::Error::other(format!(
                "simulated write failure for {key}"
            ))));
        }
        let mut store = self.store.write();
        if store.entries.contains_key(&key) {
            return Err(ScanError::DuplicateEntry { key });
        }
        store.entries.insert(
            key,
            StoredEntry {
                key,
                source_position: i64::from(key.source()),
                receiver_position: i64::from(key.receiver()),
                matrix: matrix.clone(),
            },
        );
        Ok(())
    }
}
