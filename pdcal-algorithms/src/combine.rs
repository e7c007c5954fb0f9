//! Merging per-pixel and per-group calibrations.
//!
//! A pixel calibrated to the group's arbitrary d scale by cross correlation
//! is carried onto the absolute scale fitted for the group:
//!
//! ```text
//! ratio = DIFC_group / DIFC_arbitrary
//! DIFC  = DIFC_pixel * ratio
//! DIFA  = DIFC_pixel * DIFA_group / DIFC_arbitrary + DIFA_pixel * ratio^2
//! TZERO = DIFC_pixel * TZERO_group / DIFC_arbitrary + TZERO_pixel
//! ```

use crate::calibrate::GroupCalibration;
use log::{debug, warn};
use pdcal_core::{CalibrationTable, DiffCalEntry, GroupId, Grouping, HistogramDataset, MaskTable};
use std::collections::HashMap;

/// Final calibration and its mask.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CombinedCalibration {
    /// One row per dataset detector, in dataset order.
    pub table: CalibrationTable,
    /// Detectors whose calibration should not be trusted.
    pub mask: MaskTable,
    /// Detectors that kept their pre-combination row because the combined
    /// DIFC moved too far.
    pub fallbacks: Vec<i32>,
}

/// Applies one group calibration to one pixel row.
#[must_use]
pub fn combine_entry(pixel: &DiffCalEntry, group: &GroupCalibration) -> DiffCalEntry {
    let arbitrary = group.pre_fit.difc;
    let ratio = group.result.difc / arbitrary;
    DiffCalEntry {
        detector_id: pixel.detector_id,
        difc: pixel.difc * ratio,
        difa: pixel.difc * group.result.difa / arbitrary + pixel.difa * ratio * ratio,
        tzero: pixel.difc * group.result.tzero / arbitrary + pixel.tzero,
    }
}

/// Combines the per-pixel calibration with the per-group calibrations.
///
/// `mask` holds detectors already known to be bad (masked upstream or failed
/// in cross correlation). The output mask adds the pixels of rejected group
/// fits and pixels without any group calibration, which keep their
/// per-pixel row. With `bad_calib_threshold` set, an unmasked pixel whose
/// DIFC would move by more than that many percent keeps its per-pixel row.
#[must_use]
pub fn combine_diffcal(
    pixel_calibration: &CalibrationTable,
    groups: &[GroupCalibration],
    grouping: &Grouping,
    dataset: &HistogramDataset,
    mask: &MaskTable,
    bad_calib_threshold: Option<f64>,
) -> CombinedCalibration {
    let by_group: HashMap<GroupId, &GroupCalibration> =
        groups.iter().map(|g| (g.group, g)).collect();
    let mut combined = CombinedCalibration {
        mask: mask.clone(),
        ..CombinedCalibration::default()
    };

    for spectrum in dataset.spectra() {
        let detector_id = spectrum.detector_id;
        if combined.table.contains(detector_id) {
            continue;
        }
        let pixel = pixel_calibration.entry_for(spectrum);
        if spectrum.masked {
            combined.mask.insert(detector_id);
        }

        let group = grouping
            .group_of(spectrum.spectrum_number)
            .and_then(|g| by_group.get(&g));
        let Some(group) = group else {
            combined.mask.insert(detector_id);
            combined.table.insert(pixel);
            continue;
        };
        if group.rejected {
            combined.mask.insert(detector_id);
        }

        let candidate = combine_entry(&pixel, group);
        let change = 100.0 * (candidate.difc - pixel.difc).abs() / pixel.difc.abs();
        let keep_pixel = matches!(bad_calib_threshold, Some(t) if change > t)
            && !combined.mask.contains(detector_id);

        if keep_pixel {
            debug!(
                "detector {detector_id}: combined DIFC {:.3} differs from {:.3} by {change:.2}%, keeping it",
                candidate.difc, pixel.difc
            );
            combined.fallbacks.push(detector_id);
            combined.table.insert(pixel);
        } else {
            combined.table.insert(candidate);
        }
    }

    if !combined.fallbacks.is_empty() {
        warn!(
            "{} detectors kept their pre-combination calibration",
            combined.fallbacks.len()
        );
    }
    combined
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp)]
    use super::*;
    use approx::assert_relative_eq;
    use pdcal_core::Spectrum;

    fn dataset(n: i32) -> HistogramDataset {
        HistogramDataset::new(
            (1..=n)
                .map(|i| {
                    Spectrum::with_poisson_errors(i, 100 + i, vec![1.0, 2.0], vec![1.0]).unwrap()
                })
                .collect(),
        )
        .unwrap()
    }

    fn group(id: GroupId, arbitrary: f64, fitted: DiffCalEntry, rejected: bool) -> GroupCalibration {
        let pre_fit = DiffCalEntry::from_difc(id, arbitrary);
        GroupCalibration {
            group: id,
            pre_fit,
            fitted: Some(fitted),
            result: if rejected { pre_fit } else { fitted },
            peaks: Vec::new(),
            rejected,
        }
    }

    #[test]
    fn test_threshold_scenario() {
        let data = dataset(1);
        let pixels: CalibrationTable = [DiffCalEntry::from_difc(101, 18_000.0)].into_iter().collect();
        let grouping = Grouping::from_pairs([(1, 1)]).unwrap();
        let groups = [group(
            1,
            18_000.0,
            DiffCalEntry::from_difc(1, 19_000.0),
            false,
        )];

        let strict = combine_diffcal(&pixels, &groups, &grouping, &data, &MaskTable::new(), Some(5.0));
        assert_eq!(strict.table.get(101).unwrap().difc, 18_000.0);
        assert_eq!(strict.fallbacks, vec![101]);
        assert!(strict.mask.is_empty());

        let loose =
            combine_diffcal(&pixels, &groups, &grouping, &data, &MaskTable::new(), Some(10.0));
        assert_relative_eq!(loose.table.get(101).unwrap().difc, 19_000.0);
        assert!(loose.fallbacks.is_empty());
    }

    #[test]
    fn test_combination_rule() {
        let pixel = DiffCalEntry::new(7, 10_100.0, 2.0, 3.0);
        let group = group(1, 10_000.0, DiffCalEntry::new(1, 10_200.0, 5.0, 40.0), false);
        let combined = combine_entry(&pixel, &group);

        assert_relative_eq!(combined.difc, 10_100.0 * 1.02);
        assert_relative_eq!(combined.difa, 1.01 * 5.0 + 2.0 * 1.02 * 1.02);
        assert_relative_eq!(combined.tzero, 1.01 * 40.0 + 3.0);
    }

    #[test]
    fn test_masks() {
        let data = dataset(4);
        let pixels: CalibrationTable = (101..=104)
            .map(|id| DiffCalEntry::from_difc(id, 10_000.0))
            .collect();
        // spectrum 4 is not grouped
        let grouping = Grouping::from_pairs([(1, 1), (2, 1), (3, 2)]).unwrap();
        let groups = [
            group(1, 10_000.0, DiffCalEntry::from_difc(1, 10_100.0), false),
            group(2, 10_000.0, DiffCalEntry::from_difc(2, 12_000.0), true),
        ];
        let upstream: MaskTable = [102].into_iter().collect();

        let combined = combine_diffcal(&pixels, &groups, &grouping, &data, &upstream, Some(0.5));

        let ids: Vec<i32> = combined.table.iter().map(|e| e.detector_id).collect();
        assert_eq!(ids, vec![101, 102, 103, 104]);
        // 1% move beyond a 0.5% threshold: kept
        assert_eq!(combined.table.get(101).unwrap().difc, 10_000.0);
        // masked pixels are combined regardless of the threshold
        assert_relative_eq!(combined.table.get(102).unwrap().difc, 10_100.0);
        assert_eq!(combined.table.get(103).unwrap().difc, 10_000.0);
        assert_eq!(combined.table.get(104).unwrap().difc, 10_000.0);
        assert_eq!(combined.mask.iter().collect::<Vec<_>>(), vec![102, 103, 104]);
        assert_eq!(combined.fallbacks, vec![101]);
    }
}
