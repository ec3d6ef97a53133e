//! Archive storage.
//!
//! - [`archive`]: entry keys, waveform matrices, metadata and the backend trait
//! - [`hdf5_archive`]: HDF5 backend and reader (`storage_hdf5` feature)
//! - [`writer`]: single-owner archive task and the write group
//! - [`channel_map`]: transient channel-map CSV files
//! - [`inspect`]: read-side API used by the `inspect` subcommand

pub mod archive;
pub mod channel_map;
#[cfg(feature = "storage_hdf5")]
pub mod hdf5_archive;
pub mod inspect;
pub mod writer;

use crate::config::StorageConfig;
use crate::error::AppResult;
use writer::ArchiveHandle;

/// Create the configured HDF5 archive file and start its owner task.
#[cfg(feature = "storage_hdf5")]
pub fn open_hdf5_archive(config: &StorageConfig) -> AppResult<ArchiveHandle> {
    std::fs::create_dir_all(&config.output_dir)?;
    let backend = hdf5_archive::Hdf5Archive::create(config.archive_path(), config.compression_level)?;
    Ok(writer::ArchiveWriter::spawn(backend, config.queue_capacity))
}

/// Create the configured HDF5 archive file and start its owner task.
#[cfg(not(feature = "storage_hdf5"))]
pub fn open_hdf5_archive(_config: &StorageConfig) -> AppResult<ArchiveHandle> {
    Err(crate::error::ScanError::FeatureNotEnabled(
        "storage_hdf5".to_string(),
    ))
}
