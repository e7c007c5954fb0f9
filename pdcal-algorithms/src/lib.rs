//! pdcal-algorithms: Calibration stages for grouped diffraction detectors.
//!
//! This crate provides the pipeline stages and the capabilities they run on:
//! - **Alignment** - per-pixel offsets by iterative cross correlation
//! - **Conversion** - offsets applied to a calibration table
//! - **Peak calibration** - focusing and peak-position fits per group
//! - **Combination** - pixel and group calibrations merged, with a mask
//!
//! Rebinning, correlation and peak fitting sit behind the [`Rebinner`],
//! [`CrossCorrelator`] and [`PeakFitter`] traits.
#![warn(missing_docs)]

mod align;
mod calibrate;
mod combine;
pub mod correlate;
mod diffcal;
mod focus;
pub mod peak;
mod pipeline;
pub mod rebin;

pub use align::{align_group, median_abs_nonzero, AlignParams, GroupAlignment};
pub use calibrate::{
    calibrate_group_peaks, find_peaks, fit_conversion, CalibrationParameters, GroupCalibration,
    PeakCalibrationParams, PeakPosition, DEFAULT_PEAK_WINDOW, DIAMOND_PEAKS,
};
pub use combine::{combine_diffcal, combine_entry, CombinedCalibration};
pub use correlate::{peak_lag, CrossCorrelator, NormalizedCrossCorrelator};
pub use diffcal::convert_diffcal;
pub use focus::{focus_group, FocusedSpectrum};
pub use peak::{FittedPeak, LevenbergMarquardtFitter, PeakFitter, PeakGuess, PeakShape};
pub use pipeline::{
    calibrate_groups, calibrate_groups_with, CalibrationParams, CalibrationResult,
    CalibrationSummary, PerGroup, DEFAULT_TOF_BINNING,
};
pub use rebin::{LinearRebinner, Rebinned, Rebinner};

// Re-export the core data model
pub use pdcal_core::{CalibrationTable, DiffCalEntry, Grouping, HistogramDataset, MaskTable};
