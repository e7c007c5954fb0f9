//! Group calibration from fitted peak positions.
//!
//! Reference peaks are fitted on the focused TOF spectrum of a group and the
//! fitted centres are regressed against the reference d-spacings, giving one
//! DIFC (and optionally TZERO and DIFA) per group. A failed regression or a
//! result too far from the group's arbitrary DIFC falls back to that DIFC.
#![allow(clippy::missing_errors_doc)]

use crate::focus::FocusedSpectrum;
use crate::peak::{PeakFitter, PeakGuess};
use log::{debug, warn};
use nalgebra::{DMatrix, DVector};
use pdcal_core::{DiffCalEntry, Error, GroupId, Result};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Diamond reflections in angstrom.
pub const DIAMOND_PEAKS: [f64; 13] = [
    0.4459, 0.4645, 0.4767, 0.5150, 0.5459, 0.6307, 0.6865, 0.7283, 0.8185, 0.8920, 1.0758,
    1.2615, 2.0599,
];

/// Half window in d used when neither a window nor a width is configured.
pub const DEFAULT_PEAK_WINDOW: f64 = 0.1;

/// Conversion constants refined by the group fit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum CalibrationParameters {
    /// DIFC only.
    #[default]
    Difc,
    /// DIFC and TZERO.
    DifcTzero,
    /// DIFC, TZERO and DIFA.
    DifcTzeroDifa,
}

impl CalibrationParameters {
    /// Number of fitted constants.
    #[must_use]
    pub fn count(self) -> usize {
        match self {
            Self::Difc => 1,
            Self::DifcTzero => 2,
            Self::DifcTzeroDifa => 3,
        }
    }
}

impl std::str::FromStr for CalibrationParameters {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized: String = s
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_ascii_uppercase();
        match normalized.as_str() {
            "DIFC" => Ok(Self::Difc),
            "DIFC+TZERO" => Ok(Self::DifcTzero),
            "DIFC+TZERO+DIFA" => Ok(Self::DifcTzeroDifa),
            _ => Err(Error::ConfigError(format!(
                "unknown calibration parameters '{s}'"
            ))),
        }
    }
}

/// Parameters of the peak-position stage.
#[derive(Clone, Debug, PartialEq)]
pub struct PeakCalibrationParams {
    /// Reference d-spacings.
    pub peak_positions: Vec<f64>,
    /// Absolute half window in d around each reference position.
    pub peak_window: Option<f64>,
    /// Expected FWHM as a percentage of d. Seeds the fit width and, without
    /// `peak_window`, sets the half window to three FWHM.
    pub peak_width_percent: Option<f64>,
    /// Relative DIFC change (percent) beyond which a fit is rejected.
    pub bad_calib_threshold: Option<f64>,
    /// Constants to refine.
    pub parameters: CalibrationParameters,
}

impl Default for PeakCalibrationParams {
    fn default() -> Self {
        Self {
            peak_positions: DIAMOND_PEAKS.to_vec(),
            peak_window: None,
            peak_width_percent: None,
            bad_calib_threshold: None,
            parameters: CalibrationParameters::Difc,
        }
    }
}

impl PeakCalibrationParams {
    /// Half window in d around reference position `d`.
    #[must_use]
    pub fn half_window(&self, d: f64) -> f64 {
        match (self.peak_window, self.peak_width_percent) {
            (Some(window), _) => window,
            (None, Some(percent)) => 3.0 * d * percent / 100.0,
            (None, None) => DEFAULT_PEAK_WINDOW,
        }
    }

    /// Fit window in d around reference position `d`: the half window on
    /// either side, clipped at the midpoints to the neighbouring reference
    /// lines so that each window holds a single line.
    #[must_use]
    pub fn window(&self, d: f64) -> (f64, f64) {
        let half = self.half_window(d);
        let (mut lo, mut hi) = (d - half, d + half);
        for &other in &self.peak_positions {
            let mid = 0.5 * (d + other);
            if other < d {
                lo = lo.max(mid);
            } else if other > d {
                hi = hi.min(mid);
            }
        }
        (lo, hi)
    }

    /// Checks the parameters for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.peak_positions.is_empty() {
            return Err(Error::ConfigError("PeakPositions is empty".into()));
        }
        if self.peak_positions.iter().any(|d| !(d.is_finite() && *d > 0.0)) {
            return Err(Error::ConfigError(
                "PeakPositions must be positive d-spacings".into(),
            ));
        }
        for (name, value) in [
            ("PeakWindow", self.peak_window),
            ("PeakWidthPercent", self.peak_width_percent),
        ] {
            if matches!(value, Some(v) if v.is_nan() || v <= 0.0) {
                return Err(Error::ConfigError(format!("{name} must be positive")));
            }
        }
        if matches!(self.bad_calib_threshold, Some(v) if v.is_nan() || v < 0.0) {
            return Err(Error::ConfigError(
                "BadCalibThreshold must not be negative".into(),
            ));
        }
        Ok(())
    }
}

/// One reference peak located in a focused spectrum.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PeakPosition {
    /// Reference d-spacing.
    pub d_reference: f64,
    /// Fitted TOF centre.
    pub tof: f64,
    /// Fitted height above background.
    pub height: f64,
    /// Fitted width parameter in TOF.
    pub width: f64,
}

/// Calibration of one group.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GroupCalibration {
    /// Group id.
    pub group: GroupId,
    /// Arbitrary DIFC the group was focused with, as `(DIFC, 0, 0)`.
    pub pre_fit: DiffCalEntry,
    /// Regression result, when the regression succeeded.
    pub fitted: Option<DiffCalEntry>,
    /// Constants to use: `fitted`, or `pre_fit` when rejected.
    pub result: DiffCalEntry,
    /// Peaks that entered the regression.
    pub peaks: Vec<PeakPosition>,
    /// The fit failed or moved DIFC beyond the threshold.
    pub rejected: bool,
}

/// Fits every reference peak inside the focused spectrum's range.
///
/// Each fit is seeded at the local maximum nearest `DIFC * d` within the
/// line's [`window`](PeakCalibrationParams::window). Peaks whose fit fails
/// or whose centre leaves the window, and so sits closer to another line,
/// are dropped.
pub fn find_peaks(
    focused: &FocusedSpectrum,
    params: &PeakCalibrationParams,
    fitter: &dyn PeakFitter,
) -> Vec<PeakPosition> {
    let x = focused.centres();
    let sigma = focused.errors();
    let difc = focused.reference_difc;

    params
        .peak_positions
        .iter()
        .filter_map(|&d| {
            let (d_lo, d_hi) = params.window(d);
            let (lo, hi) = (difc * d_lo, difc * d_hi);
            let start = x.partition_point(|&t| t < lo);
            let end = x.partition_point(|&t| t <= hi);
            if end <= start + 4 {
                return None;
            }
            let (xs, ys, ss) = (
                &x[start..end],
                &focused.counts[start..end],
                &sigma[start..end],
            );

            let fwhm = params.peak_width_percent.map(|p| difc * d * p / 100.0);
            let guess = PeakGuess::estimate_near(fitter.shape(), xs, ys, fwhm, difc * d)?;
            match fitter.fit(xs, ys, ss, guess) {
                Ok(peak)
                    if peak.height > 0.0
                        && peak.width > 0.0
                        && peak.centre > lo
                        && peak.centre < hi
                        && peak.centre.is_finite()
                        && peak.height.is_finite() =>
                {
                    Some(PeakPosition {
                        d_reference: d,
                        tof: peak.centre,
                        height: peak.height,
                        width: peak.width,
                    })
                }
                Ok(peak) => {
                    debug!(
                        "group {}: peak at d={d} rejected (centre {:.2}, height {:.3e})",
                        focused.group, peak.centre, peak.height
                    );
                    None
                }
                Err(e) => {
                    debug!("group {}: peak at d={d}: {e}", focused.group);
                    None
                }
            }
        })
        .collect()
}

/// Least-squares solution of `TOF = DIFC d + DIFA d^2 + TZERO` over `peaks`
/// for the constants selected by `parameters`.
///
/// Too few peaks or a singular system give [`Error::InsufficientData`] or
/// [`Error::FitFailed`]; a zero or non-finite DIFC is [`Error::ZeroSlope`].
pub fn fit_conversion(
    id: i32,
    peaks: &[PeakPosition],
    parameters: CalibrationParameters,
) -> Result<DiffCalEntry> {
    let k = parameters.count();
    if peaks.len() < k {
        return Err(Error::InsufficientData(format!(
            "{} peaks for {k} parameters",
            peaks.len()
        )));
    }
    let design = DMatrix::from_fn(peaks.len(), k, |i, j| {
        let d = peaks[i].d_reference;
        match j {
            0 => d,
            1 => 1.0,
            _ => d * d,
        }
    });
    let tof = DVector::from_iterator(peaks.len(), peaks.iter().map(|p| p.tof));
    let solution = design
        .svd(true, true)
        .solve(&tof, 1e-12)
        .map_err(|e| Error::FitFailed(e.to_string()))?;

    let difc = solution[0];
    if difc == 0.0 || !difc.is_finite() {
        return Err(Error::ZeroSlope { detector_id: id });
    }
    let tzero = if k > 1 { solution[1] } else { 0.0 };
    let difa = if k > 2 { solution[2] } else { 0.0 };
    Ok(DiffCalEntry::new(id, difc, difa, tzero))
}

/// Calibrates one focused group.
///
/// The result is keyed by group id. A failed regression or a DIFC that moved
/// by more than `bad_calib_threshold` percent is rejected and replaced by the
/// pre-fit constants. [`Error::ZeroSlope`] is fatal and propagates.
pub fn calibrate_group_peaks(
    focused: &FocusedSpectrum,
    params: &PeakCalibrationParams,
    fitter: &dyn PeakFitter,
) -> Result<GroupCalibration> {
    let group = focused.group;
    let pre_fit = DiffCalEntry::from_difc(group, focused.reference_difc);
    let peaks = find_peaks(focused, params, fitter);

    let fitted = match fit_conversion(group, &peaks, params.parameters) {
        Ok(entry) => Some(entry),
        Err(e @ Error::ZeroSlope { .. }) => return Err(e),
        Err(e) => {
            warn!("group {group}: calibration fit failed ({e}), keeping DIFC {:.3}", pre_fit.difc);
            None
        }
    };

    let (result, rejected) = match fitted {
        Some(entry) => {
            let change = 100.0 * (entry.difc - pre_fit.difc).abs() / pre_fit.difc.abs();
            match params.bad_calib_threshold {
                Some(threshold) if change > threshold => {
                    warn!(
                        "group {group}: DIFC {:.3} differs from {:.3} by {change:.2}% (> {threshold}%), rejected",
                        entry.difc, pre_fit.difc
                    );
                    (pre_fit, true)
                }
                _ => (entry, false),
            }
        }
        None => (pre_fit, true),
    };

    debug!(
        "group {group}: {} peaks, DIFC {:.3} -> {:.3}",
        peaks.len(),
        pre_fit.difc,
        result.difc
    );
    Ok(GroupCalibration {
        group,
        pre_fit,
        fitted,
        result,
        peaks,
        rejected,
    })
}
