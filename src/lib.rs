//! # SPIM DAQ Core Library
//!
//! Acquisition sequencing for a selective-plane illumination microscope and
//! the output pipeline that keeps storage I/O off the capture path.
//!
//! ## Crate Structure
//!
//! - **`config`**: Figment-based configuration (TOML file plus `SPIM_DAQ_`
//!   environment overrides). See `config::SpimConfig`.
//! - **`data`**: The `OutputHandler` contract, an in-memory stack handler, a
//!   TIFF writer and the quota-bounded `AsyncOutputWrapper`.
//! - **`error`**: The `DaqError` enum shared by the engine and the pipeline.
//! - **`experiment`**: Rows and value sets, run parameters, drift
//!   compensation and the `AcquisitionEngine` itself.
//! - **`hardware`**: Capability traits the engine drives devices through,
//!   plus mock devices.
//! - **`logging`**: `tracing-subscriber` initialization.

pub mod config;
pub mod data;
pub mod error;
pub mod experiment;
pub mod hardware;
pub mod logging;

pub use error::{AppResult, DaqError};
