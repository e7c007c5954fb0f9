//! Cross-correlation alignment of the pixels of one group.
//!
//! Each pass converts the raw spectra to d-spacing with the current per-pixel
//! calibration, rebins them onto a common grid and correlates them against
//! the brightest spectrum of the group. The resulting fractional offsets are
//! folded into the calibration and the pass repeats until the median
//! absolute offset drops below the threshold.
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    clippy::missing_errors_doc
)]

use crate::correlate::{peak_lag, CrossCorrelator};
use crate::rebin::{smooth, Rebinner};
use log::{debug, info, warn};
use pdcal_core::{
    edges_tof_to_d, BinningParams, CalibrationTable, DiffCalEntry, Error, GroupId, Offset,
    Result, Spectrum,
};

/// Parameters of the cross-correlation stage for one group.
#[derive(Clone, Debug, PartialEq)]
pub struct AlignParams {
    /// Rebin step in d-spacing.
    pub step: f64,
    /// d-spacing the offsets are expressed against.
    pub d_reference: f64,
    /// Lower edge of the correlation window.
    pub xmin: f64,
    /// Upper edge of the correlation window.
    pub xmax: f64,
    /// Largest accepted shift in d units. `None` allows the full window.
    pub max_dspace_shift: Option<f64>,
    /// Convergence threshold on the median absolute offset. Values `>= 1`
    /// run a single pass.
    pub offset_threshold: f64,
    /// Cap on the number of passes.
    pub max_cycles: usize,
    /// Moving-average width applied before correlating (0 disables).
    pub smooth_points: usize,
    /// Force every offset to zero without correlating.
    pub skip_cross_correlation: bool,
}

impl Default for AlignParams {
    fn default() -> Self {
        Self {
            step: 0.001,
            d_reference: 1.2615,
            xmin: 1.22,
            xmax: 1.30,
            max_dspace_shift: None,
            offset_threshold: 1e-4,
            max_cycles: 30,
            smooth_points: 0,
            skip_cross_correlation: false,
        }
    }
}

impl AlignParams {
    /// Checks the parameters for consistency.
    pub fn validate(&self) -> Result<()> {
        require_positive("Step", self.step)?;
        require_positive("DReference", self.d_reference)?;
        require_positive("Xmax - Xmin", self.xmax - self.xmin)?;
        if let Some(shift) = self.max_dspace_shift {
            require_positive("MaxDSpaceShift", shift)?;
        }
        if self.max_cycles == 0 {
            return Err(Error::ConfigError("MaxCycles must be at least 1".into()));
        }
        Ok(())
    }

    /// Whether the alignment repeats until the threshold is met.
    #[must_use]
    pub fn cycling_enabled(&self) -> bool {
        self.offset_threshold < 1.0
    }
}

fn require_positive(name: &str, value: f64) -> Result<()> {
    if value > 0.0 {
        Ok(())
    } else {
        Err(Error::ConfigError(format!("{name} must be positive, got {value}")))
    }
}

/// Outcome of aligning one group.
#[derive(Clone, Debug, PartialEq)]
pub struct GroupAlignment {
    /// Group id.
    pub group: GroupId,
    /// Cumulative offset per unmasked spectrum, in input order.
    pub offsets: Vec<Offset>,
    /// Detector id of the reference spectrum (`None` when skipped).
    pub reference_detector: Option<i32>,
    /// Number of passes run.
    pub cycles: usize,
    /// Whether the threshold was met (always true for skipped groups).
    pub converged: bool,
    /// Median absolute nonzero offset of each pass.
    pub median_history: Vec<f64>,
}

impl GroupAlignment {
    /// Number of pixels whose correlation peak was not found.
    #[must_use]
    pub fn failed_count(&self) -> usize {
        self.offsets.iter().filter(|o| o.masked).count()
    }
}

/// Median of the absolute values of the nonzero entries, 0 when all are
/// zero.
#[must_use]
pub fn median_abs_nonzero(values: &[f64]) -> f64 {
    let mut abs: Vec<f64> = values
        .iter()
        .filter(|v| **v != 0.0)
        .map(|v| v.abs())
        .collect();
    if abs.is_empty() {
        return 0.0;
    }
    abs.sort_by(f64::total_cmp);
    let mid = abs.len() / 2;
    if abs.len() % 2 == 0 {
        0.5 * (abs[mid - 1] + abs[mid])
    } else {
        abs[mid]
    }
}

/// Fractional offset for a correlation lag of `lag` bins.
fn lag_to_offset(lag: f64, params: &AlignParams) -> f64 {
    let shift = lag * params.step;
    -shift / (params.d_reference + shift)
}

/// Aligns the spectra of one group.
///
/// `spectra` are the group's members; masked ones are ignored. Per-pixel
/// starting calibrations come from `calibration` (see
/// [`CalibrationTable::entry_for`]). Returns `None` when fewer than two
/// unmasked spectra remain, unless the group skips correlation.
///
/// Conversion failures (zero DIFC, no real root) are fatal and propagate.
pub fn align_group(
    group: GroupId,
    spectra: &[&Spectrum],
    calibration: &CalibrationTable,
    params: &AlignParams,
    rebinner: &dyn Rebinner,
    correlator: &dyn CrossCorrelator,
) -> Result<Option<GroupAlignment>> {
    let pixels: Vec<&Spectrum> = spectra.iter().copied().filter(|s| !s.masked).collect();

    if params.skip_cross_correlation {
        info!("group {group}: cross correlation skipped, {} zero offsets", pixels.len());
        return Ok(Some(GroupAlignment {
            group,
            offsets: pixels
                .iter()
                .map(|s| Offset::new(s.detector_id, 0.0))
                .collect(),
            reference_detector: None,
            cycles: 0,
            converged: true,
            median_history: Vec::new(),
        }));
    }

    if pixels.len() < 2 {
        debug!(
            "group {group}: {} usable spectra, cannot cross correlate",
            pixels.len()
        );
        return Ok(None);
    }

    params.validate()?;
    let target = BinningParams::linear(params.xmin, params.step, params.xmax)?.edges()?;
    let n_bins = target.len() - 1;
    let max_lag = params
        .max_dspace_shift
        .map_or(n_bins - 1, |shift| (shift / params.step).ceil() as usize)
        .min(n_bins - 1);

    let mut calibrations: Vec<DiffCalEntry> =
        pixels.iter().map(|s| calibration.entry_for(s)).collect();
    let mut offsets: Vec<Offset> = pixels
        .iter()
        .map(|s| Offset::new(s.detector_id, 0.0))
        .collect();
    let mut reference: Option<usize> = None;
    let mut median_history = Vec::new();
    let mut converged = false;
    let mut cycles = 0;

    while cycles < params.max_cycles {
        cycles += 1;

        let rebinned = pixels
            .iter()
            .zip(&calibrations)
            .map(|(spectrum, cal)| {
                let d_edges = edges_tof_to_d(cal, &spectrum.edges)?;
                let rebinned =
                    rebinner.rebin(&d_edges, &spectrum.counts, &spectrum.errors, &target)?;
                Ok(smooth(&rebinned.counts, params.smooth_points))
            })
            .collect::<Result<Vec<_>>>()?;

        // The brightest spectrum on the first pass stays the reference.
        let reference_index = *reference.get_or_insert_with(|| {
            let mut best = 0;
            let mut best_total = f64::NEG_INFINITY;
            for (i, counts) in rebinned.iter().enumerate() {
                let total: f64 = counts.iter().sum();
                if total > best_total {
                    best = i;
                    best_total = total;
                }
            }
            best
        });
        let reference_counts = &rebinned[reference_index];

        let mut pass = vec![0.0; pixels.len()];
        for (i, counts) in rebinned.iter().enumerate() {
            if i == reference_index || offsets[i].masked {
                continue;
            }
            let correlation = correlator.correlate(reference_counts, counts, max_lag);
            let lag = peak_lag(&correlation).filter(|lag| {
                params
                    .max_dspace_shift
                    .map_or(true, |shift| (lag * params.step).abs() <= shift)
            });
            match lag {
                Some(lag) => pass[i] = lag_to_offset(lag, params),
                None => {
                    debug!(
                        "group {group}: no correlation peak for detector {}",
                        offsets[i].detector_id
                    );
                    offsets[i] = Offset::failed(offsets[i].detector_id);
                }
            }
        }

        for ((offset, cal), &value) in offsets.iter_mut().zip(&mut calibrations).zip(&pass) {
            if value != 0.0 {
                *offset = offset.compose(value);
                cal.difc /= 1.0 + value;
            }
        }

        let median = median_abs_nonzero(&pass);
        median_history.push(median);
        info!("group {group}: cycle {cycles}, median |offset| = {median:.3e}");

        if !params.cycling_enabled() || median < params.offset_threshold {
            converged = true;
            break;
        }
    }

    if !converged {
        warn!(
            "group {group}: no convergence after {} cycles, keeping last offsets",
            params.max_cycles
        );
    }

    Ok(Some(GroupAlignment {
        group,
        offsets,
        reference_detector: reference.map(|i| pixels[i].detector_id),
        cycles,
        converged,
        median_history,
    }))
}
