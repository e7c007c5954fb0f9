//! Full calibration pipeline over all groups.
//!
//! Alignment, focusing and peak fitting run per group in parallel; the
//! results are merged once the last group finishes.

use crate::align::{align_group, AlignParams, GroupAlignment};
use crate::calibrate::{calibrate_group_peaks, GroupCalibration, PeakCalibrationParams};
use crate::combine::combine_diffcal;
use crate::correlate::{CrossCorrelator, NormalizedCrossCorrelator};
use crate::diffcal::convert_diffcal;
use crate::focus::focus_group;
use crate::peak::{LevenbergMarquardtFitter, PeakFitter, PeakShape};
use crate::rebin::{LinearRebinner, Rebinner};
use log::{info, warn};
use pdcal_core::{
    BinningParams, CalibrationTable, Error, GroupId, Grouping, HistogramDataset, MaskTable,
    Offset, Result, Spectrum,
};
use rayon::prelude::*;
#[cfg(feature = "serde")]
use serde::Serialize;

/// A parameter given once for all groups or once per group.
#[derive(Clone, Debug, PartialEq)]
pub enum PerGroup<T> {
    /// Same value for every group.
    All(T),
    /// One value per group, in ascending group-id order.
    Each(Vec<T>),
}

impl<T: Clone> PerGroup<T> {
    /// Expands to one value per group.
    ///
    /// # Errors
    /// Returns [`Error::ConfigError`] when a per-group list does not have
    /// `n_groups` entries.
    pub fn expand(&self, name: &str, n_groups: usize) -> Result<Vec<T>> {
        match self {
            Self::All(value) => Ok(vec![value.clone(); n_groups]),
            Self::Each(values) if values.len() == n_groups => Ok(values.clone()),
            Self::Each(values) => Err(Error::ConfigError(format!(
                "{name} has {} values for {n_groups} groups",
                values.len()
            ))),
        }
    }
}

impl<T> From<T> for PerGroup<T> {
    fn from(value: T) -> Self {
        Self::All(value)
    }
}

/// Logarithmic focusing binning from 1500 to 16600 microseconds.
pub const DEFAULT_TOF_BINNING: [f64; 3] = [1500.0, -0.0003, 16600.0];

/// Parameters of a full calibration run.
#[derive(Clone, Debug, PartialEq)]
pub struct CalibrationParams {
    /// d rebin step for cross correlation.
    pub step: PerGroup<f64>,
    /// Reference d-spacing of the offsets.
    pub d_reference: PerGroup<f64>,
    /// Lower edge of the correlation window.
    pub xmin: PerGroup<f64>,
    /// Upper edge of the correlation window.
    pub xmax: PerGroup<f64>,
    /// Largest accepted shift in d units.
    pub max_dspace_shift: PerGroup<Option<f64>>,
    /// Convergence threshold on the median absolute offset.
    pub offset_threshold: f64,
    /// Cap on cross-correlation passes.
    pub max_cycles: usize,
    /// Smoothing width before correlating.
    pub smooth_points: usize,
    /// Groups whose offsets are forced to zero.
    pub skip_cross_correlation: Vec<GroupId>,
    /// TOF binning of the focused spectra, `[x0, dx, x1, ...]`.
    pub tof_binning: Vec<f64>,
    /// Peak profile.
    pub peak_function: PeakShape,
    /// Peak-position stage parameters.
    pub peaks: PeakCalibrationParams,
}

impl Default for CalibrationParams {
    fn default() -> Self {
        let align = AlignParams::default();
        Self {
            step: align.step.into(),
            d_reference: align.d_reference.into(),
            xmin: align.xmin.into(),
            xmax: align.xmax.into(),
            max_dspace_shift: PerGroup::All(None),
            offset_threshold: align.offset_threshold,
            max_cycles: align.max_cycles,
            smooth_points: align.smooth_points,
            skip_cross_correlation: Vec::new(),
            tof_binning: DEFAULT_TOF_BINNING.to_vec(),
            peak_function: PeakShape::Gaussian,
            peaks: PeakCalibrationParams::default(),
        }
    }
}

impl CalibrationParams {
    /// Per-group alignment parameters for `groups` (ascending ids).
    ///
    /// # Errors
    /// Returns [`Error::ConfigError`] for mis-sized per-group lists,
    /// skipped groups that are not in `groups`, or invalid values.
    pub fn align_params(&self, groups: &[GroupId]) -> Result<Vec<AlignParams>> {
        let unknown: Vec<GroupId> = self
            .skip_cross_correlation
            .iter()
            .copied()
            .filter(|g| !groups.contains(g))
            .collect();
        if !unknown.is_empty() {
            return Err(Error::ConfigError(format!(
                "SkipCrossCorrelation names groups {unknown:?} that are not in the grouping"
            )));
        }
        let n = groups.len();
        let step = self.step.expand("Step", n)?;
        let d_reference = self.d_reference.expand("DReference", n)?;
        let xmin = self.xmin.expand("Xmin", n)?;
        let xmax = self.xmax.expand("Xmax", n)?;
        let shift = self.max_dspace_shift.expand("MaxDSpaceShift", n)?;

        groups
            .iter()
            .enumerate()
            .map(|(i, group)| {
                let params = AlignParams {
                    step: step[i],
                    d_reference: d_reference[i],
                    xmin: xmin[i],
                    xmax: xmax[i],
                    max_dspace_shift: shift[i],
                    offset_threshold: self.offset_threshold,
                    max_cycles: self.max_cycles,
                    smooth_points: self.smooth_points,
                    skip_cross_correlation: self.skip_cross_correlation.contains(group),
                };
                params.validate()?;
                Ok(params)
            })
            .collect()
    }
}

/// Counts describing a finished run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct CalibrationSummary {
    /// Groups named by the grouping.
    pub groups: usize,
    /// Groups aligned by cross correlation (including skipped ones).
    pub aligned: usize,
    /// Groups with fewer than two usable spectra.
    pub too_few_spectra: usize,
    /// Groups naming spectra absent from the dataset.
    pub missing_from_data: usize,
    /// Groups that hit the cycle cap.
    pub not_converged: usize,
    /// Pixels whose correlation peak was not found.
    pub cc_failures: usize,
    /// Groups with a peak calibration.
    pub calibrated: usize,
    /// Group fits replaced by their pre-fit DIFC.
    pub rejected: usize,
    /// Pixels that kept their pre-combination row.
    pub fallbacks: usize,
    /// Detectors in the final mask.
    pub masked: usize,
}

/// Everything produced by a calibration run.
#[derive(Clone, Debug, PartialEq)]
pub struct CalibrationResult {
    /// Final per-detector calibration in dataset order.
    pub calibration: CalibrationTable,
    /// Final mask.
    pub mask: MaskTable,
    /// Grouping the run used.
    pub grouping: Grouping,
    /// Per-pixel calibration after cross correlation.
    pub cc_calibration: CalibrationTable,
    /// Cumulative offsets of all aligned pixels.
    pub offsets: Vec<Offset>,
    /// Per-group alignment outcomes.
    pub alignments: Vec<GroupAlignment>,
    /// Per-group peak calibrations.
    pub group_calibrations: Vec<GroupCalibration>,
    /// Run counts.
    pub summary: CalibrationSummary,
}

/// Runs the pipeline with the default rebinner, correlator and a
/// Levenberg-Marquardt fitter for `params.peak_function`.
///
/// # Errors
/// Configuration errors and fatal numerical errors (zero slope) abort the
/// run.
pub fn calibrate_groups(
    dataset: &HistogramDataset,
    grouping: &Grouping,
    previous: &CalibrationTable,
    params: &CalibrationParams,
) -> Result<CalibrationResult> {
    calibrate_groups_with(
        dataset,
        grouping,
        previous,
        params,
        &LinearRebinner,
        &NormalizedCrossCorrelator,
        &LevenbergMarquardtFitter::new(params.peak_function),
    )
}

struct GroupJob<'a> {
    group: GroupId,
    spectra: Vec<&'a Spectrum>,
    align: AlignParams,
}

/// Runs the pipeline with explicit capabilities.
///
/// # Errors
/// See [`calibrate_groups`].
pub fn calibrate_groups_with(
    dataset: &HistogramDataset,
    grouping: &Grouping,
    previous: &CalibrationTable,
    params: &CalibrationParams,
    rebinner: &dyn Rebinner,
    correlator: &dyn CrossCorrelator,
    fitter: &dyn PeakFitter,
) -> Result<CalibrationResult> {
    let group_ids = grouping.group_ids();
    let align_params = params.align_params(&group_ids)?;
    let tof_binning = BinningParams::parse(&params.tof_binning)?;
    params.peaks.validate()?;
    let mut summary = CalibrationSummary {
        groups: group_ids.len(),
        ..CalibrationSummary::default()
    };

    let mut jobs = Vec::with_capacity(group_ids.len());
    for (&group, align) in group_ids.iter().zip(align_params) {
        let members = grouping.members(group);
        let spectra: Vec<&Spectrum> = members
            .iter()
            .filter_map(|&n| dataset.spectrum_by_number(n))
            .collect();
        if spectra.len() < members.len() {
            warn!(
                "group {group}: {} of {} spectra missing from the data, group skipped",
                members.len() - spectra.len(),
                members.len()
            );
            summary.missing_from_data += 1;
            continue;
        }
        jobs.push(GroupJob {
            group,
            spectra,
            align,
        });
    }
    if summary.missing_from_data > 0 {
        warn!(
            "{} groups skipped: grouping does not match the data",
            summary.missing_from_data
        );
    }

    let alignments: Vec<GroupAlignment> = jobs
        .par_iter()
        .map(|job| {
            align_group(
                job.group,
                &job.spectra,
                previous,
                &job.align,
                rebinner,
                correlator,
            )
        })
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .flatten()
        .collect();
    summary.aligned = alignments.len();
    summary.too_few_spectra = jobs.len() - alignments.len();
    summary.not_converged = alignments.iter().filter(|a| !a.converged).count();

    let offsets: Vec<Offset> = alignments
        .iter()
        .flat_map(|a| a.offsets.iter().copied())
        .collect();
    let mut mask: MaskTable = dataset
        .spectra()
        .iter()
        .filter(|s| s.masked)
        .map(|s| s.detector_id)
        .collect();
    for offset in offsets.iter().filter(|o| o.masked) {
        summary.cc_failures += 1;
        mask.insert(offset.detector_id);
    }

    let cc_calibration = convert_diffcal(&offsets, previous, dataset);

    let group_calibrations: Vec<GroupCalibration> = jobs
        .par_iter()
        .map(|job| {
            let focused = focus_group(
                job.group,
                &job.spectra,
                &cc_calibration,
                &mask,
                &tof_binning,
                rebinner,
            )?;
            focused
                .map(|f| calibrate_group_peaks(&f, &params.peaks, fitter))
                .transpose()
        })
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .flatten()
        .collect();
    summary.calibrated = group_calibrations.len();
    summary.rejected = group_calibrations.iter().filter(|g| g.rejected).count();

    let combined = combine_diffcal(
        &cc_calibration,
        &group_calibrations,
        grouping,
        dataset,
        &mask,
        params.peaks.bad_calib_threshold,
    );
    summary.fallbacks = combined.fallbacks.len();
    summary.masked = combined.mask.len();

    info!(
        "calibrated {} of {} groups ({} rejected), {} detectors masked",
        summary.calibrated, summary.groups, summary.rejected, summary.masked
    );

    Ok(CalibrationResult {
        calibration: combined.table,
        mask: combined.mask,
        grouping: grouping.clone(),
        cc_calibration,
        offsets,
        alignments,
        group_calibrations,
        summary,
    })
}
