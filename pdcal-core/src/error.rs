//! Error types for pdcal-core.

use thiserror::Error;

/// Result type alias for pdcal operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for calibration operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Spectrum arrays are inconsistent (edge/count/error lengths, ordering).
    #[error("invalid spectrum {spectrum}: {reason}")]
    InvalidSpectrum { spectrum: i32, reason: String },

    /// The same spectrum number appears twice.
    #[error("duplicate spectrum number: {0}")]
    DuplicateSpectrum(i32),

    /// Invalid binning parameters.
    #[error("invalid binning: {0}")]
    InvalidBinning(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// The TOF-to-d slope of a detector is zero, so no conversion is possible.
    #[error("zero slope (DIFC = 0) for detector {detector_id}")]
    ZeroSlope { detector_id: i32 },

    /// The quadratic TOF-to-d relation has no real root.
    #[error("no real d-spacing for TOF {tof} on detector {detector_id}")]
    NoRealRoot { detector_id: i32, tof: f64 },

    /// Not enough data to carry out an operation.
    #[error("insufficient data: {0}")]
    InsufficientData(String),

    /// A numerical fit failed.
    #[error("fit failed: {0}")]
    FitFailed(String),
}
