//! # Ultrasonic Immersion Scan Library
//!
//! This crate drives a two-axis ultrasonic immersion scanning rig. A transmitter
//! transducer is carried by a coarse ("large") rotary stage and a receiver by a fine
//! ("small") rotary stage. For every transmitter/receiver position pair the rig
//! captures a full-matrix waveform set through an external acquisition engine and
//! archives it into a hierarchical HDF5 file.
//!
//! ## Crate Structure
//!
//! - **`config`**: Figment-backed scan configuration (TOML file + environment overrides).
//! - **`error`**: The `ScanError` taxonomy shared by every component.
//! - **`logging`**: `tracing` subscriber initialization.
//! - **`serial`**: Async serial port plumbing shared by the motion endpoints.
//! - **`hardware`**: Motion controller interface, acquisition trigger and simulated devices.
//! - **`storage`**: Archive backends, the serializing archive writer, channel-map side
//!   files and the read-side inspection API.
//! - **`experiment`**: The sweep coordinator, its state machine and the run summary.

pub mod config;
pub mod error;
pub mod experiment;
pub mod hardware;
pub mod logging;
pub mod serial;
pub mod storage;

pub use error::{AppResult, ScanError};
