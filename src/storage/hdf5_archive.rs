//! HDF5 archive backend and reader (hdf5-metno).
//!
//! File layout matches the group/attribute scheme described in
//! [`archive`](crate::storage::archive). Every call here is blocking; the
//! writer owns the file from a dedicated blocking task.

use crate::error::{AppResult, ScanError};
use crate::storage::archive::{
    parse_index, ArchiveBackend, EntryKey, MetadataValue, ScanMetadata, StoredEntry,
    WaveformMatrix, DATASET_NAME, RECEIVER_ATTR, SOURCE_ATTR,
};
use crate::storage::inspect::ArchiveReader;
use hdf5::types::{TypeDescriptor, VarLenAscii, VarLenUnicode};
use hdf5::{File, Group, Location};
use ndarray::{ArrayD, IxDyn};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, warn};

/// Writable HDF5 archive.
pub struct Hdf5Archive {
    file: File,
    path: PathBuf,
    compression_level: u8,
}

impl Hdf5Archive {
    /// Create (truncating) an archive at `path`.
    pub fn create(path: impl AsRef<Path>, compression_level: u8) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        if compression_level > 9 {
            return Err(ScanError::Configuration(format!(
                "deflate level {compression_level} out of range 0-9"
            )));
        }
        let file = File::create(&path)
            .map_err(|e| ScanError::Archive(format!("create {}: {e}", path.display())))?;
        debug!(path = %path.display(), compression_level, "Created HDF5 archive");
        Ok(Self {
            file,
            path,
            compression_level,
        })
    }

    /// Location of the archive file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn source_group(&self, key: EntryKey) -> AppResult<Group> {
        let name = key.source_group();
        if self.file.link_exists(&name) {
            Ok(self.file.group(&name)?)
        } else {
            Ok(self.file.create_group(&name)?)
        }
    }

    /// Create the receiver group for `key` and let `fill` populate it.
    ///
    /// If `fill` fails the group is unlinked again, so a failed write never
    /// leaves an entry without its dataset.
    fn write_entry_with(
        &mut self,
        key: EntryKey,
        fill: impl FnOnce(&Group) -> AppResult<()>,
    ) -> AppResult<()> {
        let source = self.source_group(key)?;
        let name = key.receiver_group();
        let group = source.create_group(&name)?;

        let result = fill(&group);
        drop(group);
        if result.is_err() {
            if let Err(e) = source.unlink(&name) {
                warn!(%key, error = %e, "Could not remove partial entry");
            }
        }
        result
    }
}

fn fill_entry(
    group: &Group,
    key: EntryKey,
    matrix: &WaveformMatrix,
    compression_level: u8,
) -> AppResult<()> {
    group
        .new_attr::<i64>()
        .create(SOURCE_ATTR)?
        .write_scalar(&i64::from(key.source()))?;
    group
        .new_attr::<i64>()
        .create(RECEIVER_ATTR)?
        .write_scalar(&i64::from(key.receiver()))?;

    // Chunk shape is inferred once a filter is present
    let dataset = group
        .new_dataset::<i16>()
        .shape(matrix.shape().to_vec())
        .deflate(compression_level)
        .create(DATASET_NAME)?;
    dataset.write_raw(matrix.as_slice())?;
    Ok(())
}

impl ArchiveBackend for Hdf5Archive {
    fn write_metadata(&mut self, metadata: &ScanMetadata) -> AppResult<()> {
        for (name, value) in metadata.iter() {
            write_attr(&self.file, name, value)?;
        }
        Ok(())
    }

    fn contains(&self, key: EntryKey) -> AppResult<bool> {
        let source_name = key.source_group();
        if !self.file.link_exists(&source_name) {
            return Ok(false);
        }
        Ok(self
            .file
            .group(&source_name)?
            .link_exists(&key.receiver_group()))
    }

    fn write_entry(&mut self, key: EntryKey, matrix: &WaveformMatrix) -> AppResult<()> {
        let compression_level = self.compression_level;
        self.write_entry_with(key, |group| fill_entry(group, key, matrix, compression_level))
    }

    fn flush(&mut self) -> AppResult<()> {
        self.file.flush()?;
        Ok(())
    }
}

fn write_attr(location: &Location, name: &str, value: &MetadataValue) -> AppResult<()> {
    match value {
        MetadataValue::Int(v) => location.new_attr::<i64>().create(name)?.write_scalar(v)?,
        MetadataValue::Float(v) => location.new_attr::<f64>().create(name)?.write_scalar(v)?,
        MetadataValue::Text(v) => {
            let text = VarLenUnicode::from_str(v)
                .map_err(|e| ScanError::Archive(format!("attribute '{name}': {e}")))?;
            location
                .new_attr::<VarLenUnicode>()
                .create(name)?
                .write_scalar(&text)?
        }
    }
    Ok(())
}

fn read_attr(location: &Location, name: &str) -> AppResult<MetadataValue> {
    let attr = location.attr(name)?;
    let value = match attr.dtype()?.to_descriptor()? {
        TypeDescriptor::Integer(_) | TypeDescriptor::Unsigned(_) => {
            MetadataValue::Int(attr.read_scalar::<i64>()?)
        }
        TypeDescriptor::Float(_) => MetadataValue::Float(attr.read_scalar::<f64>()?),
        TypeDescriptor::VarLenUnicode => {
            MetadataValue::Text(attr.read_scalar::<VarLenUnicode>()?.to_string())
        }
        TypeDescriptor::VarLenAscii => {
            MetadataValue::Text(attr.read_scalar::<VarLenAscii>()?.to_string())
        }
        other => MetadataValue::Text(format!("<unsupported attribute type {other:?}>")),
    };
    Ok(value)
}

/// Read-only view of an archive file.
pub struct Hdf5Reader {
    file: File,
}

impl Hdf5Reader {
    /// Open an existing archive read-only.
    pub fn open(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| ScanError::Archive(format!("open {}: {e}", path.display())))?;
        Ok(Self { file })
    }

    fn entry_group(&self, key: EntryKey) -> AppResult<Group> {
        self.file
            .group(&key.to_string())
            .map_err(|_| ScanError::InvalidEntry(format!("no entry {key} in archive")))
    }
}

impl ArchiveReader for Hdf5Reader {
    fn group_names(&self) -> AppResult<Vec<String>> {
        Ok(self.file.member_names()?)
    }

    fn root_attributes(&self) -> AppResult<ScanMetadata> {
        self.file
            .attr_names()?
            .into_iter()
            .map(|name| {
                let value = read_attr(&self.file, &name)?;
                Ok((name, value))
            })
            .collect()
    }

    fn entry_keys(&self) -> AppResult<Vec<EntryKey>> {
        let mut keys = Vec::new();
        for source_name in self.file.member_names()? {
            let Some(source) = parse_index(&source_name, "transmitter") else {
                continue;
            };
            let group = self.file.group(&source_name)?;
            for receiver_name in group.member_names()? {
                let Some(receiver) = parse_index(&receiver_name, "receiver") else {
                    continue;
                };
                // Groups without a dataset are not entries
                if group.group(&receiver_name)?.link_exists(DATASET_NAME) {
                    keys.push(EntryKey::new(source, receiver)?);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn entry_shape(&self, key: EntryKey) -> AppResult<Vec<usize>> {
        Ok(self.entry_group(key)?.dataset(DATASET_NAME)?.shape())
    }

    fn read_entry(&self, key: EntryKey) -> AppResult<StoredEntry> {
        let group = self.entry_group(key)?;
        let dataset = group.dataset(DATASET_NAME)?;
        let matrix = WaveformMatrix::from_shape_vec(&dataset.shape(), dataset.read_raw::<i16>()?)?;
        Ok(StoredEntry {
            key,
            source_position: group.attr(SOURCE_ATTR)?.read_scalar::<i64>()?,
            receiver_position: group.attr(RECEIVER_ATTR)?.read_scalar::<i64>()?,
            matrix,
        })
    }
}

/// Read the capture matrix `variable` from a MAT v7.3 exchange file.
///
/// MAT v7.3 stores arrays column-major, so HDF5 reports the dimensions in
/// reverse; they are flipped back to MATLAB's axis order here.
pub fn read_exchange_matrix(path: &Path, variable: &str) -> AppResult<WaveformMatrix> {
    let engine_err = |e: hdf5::Error| {
        ScanError::Engine(format!("reading '{variable}' from {}: {e}", path.display()))
    };
    let file = File::open(path).map_err(engine_err)?;
    let dataset = file.dataset(variable).map_err(engine_err)?;
    let shape = dataset.shape();
    let samples = dataset.read_raw::<i16>().map_err(engine_err)?;
    let array = ArrayD::from_shape_vec(IxDyn(&shape), samples)
        .map_err(|e| ScanError::Engine(format!("exchange matrix shape {shape:?}: {e}")))?
        .reversed_axes();
    WaveformMatrix::new(array)
}
