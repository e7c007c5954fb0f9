//! pdcal-io: Configuration and file I/O for pdcal.
//!
//! This crate reads the inputs of a calibration run (histogram datasets,
//! groupings, previous calibrations and masks), loads the JSON run
//! configuration and writes the resulting diffcal table as CSV, JSON or,
//! with the `hdf5` feature, HDF5.
//!

pub mod config;
mod driver;
mod error;
#[cfg(feature = "hdf5")]
pub mod hdf5;
pub mod reader;
pub mod writer;

pub use config::{CalibrationConfig, OutputFormat};
pub use driver::{run_from_config, RunReport};
pub use error::{Error, Result};
pub use reader::{read_calibration, read_dataset_json, read_grouping, read_mask};
pub use writer::{calibration_rows, write_calibration, CalibrationDocument, CalibrationRow};
