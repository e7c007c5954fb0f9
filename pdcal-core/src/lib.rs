//! pdcal-core: Core types for powder-diffraction detector calibration.
//!
//! This crate provides the data model shared by the calibration stages:
//! histogram spectra, detector grouping, calibration/offset/mask tables,
//! and the TOF <-> d-spacing conversion.
//!

pub mod binning;
pub mod calibration;
pub mod conversion;
pub mod error;
pub mod grouping;
pub mod histogram;

pub use binning::BinningParams;
pub use calibration::{CalibrationTable, DiffCalEntry, MaskTable, Offset};
pub use conversion::{d_to_tof, edges_d_to_tof, edges_tof_to_d, tof_to_d, DIFC_CONSTANT};
pub use error::{Error, Result};
pub use grouping::{GroupId, Grouping};
pub use histogram::{DetectorGeometry, HistogramDataset, Spectrum};
