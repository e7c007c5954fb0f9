//! Focusing: summing the aligned pixels of a group into one spectrum.
//!
//! Every pixel is converted to d-spacing with its own calibration and rebinned
//! onto a single d grid derived from the group's TOF binning through an
//! arbitrary group DIFC (the mean of the members' DIFC). The focused spectrum
//! keeps the TOF edges, so peak positions read off it are TOF values under
//! that arbitrary DIFC.
#![allow(clippy::missing_errors_doc)]

use crate::rebin::{Rebinned, Rebinner};
use log::debug;
use pdcal_core::{
    edges_tof_to_d, BinningParams, CalibrationTable, Error, GroupId, MaskTable, Result, Spectrum,
};

/// Summed spectrum of one group on TOF edges.
#[derive(Clone, Debug, PartialEq)]
pub struct FocusedSpectrum {
    /// Group id.
    pub group: GroupId,
    /// TOF bin edges.
    pub edges: Vec<f64>,
    /// Summed counts.
    pub counts: Vec<f64>,
    /// Summed variances.
    pub variances: Vec<f64>,
    /// Arbitrary DIFC mapping the TOF edges to the d grid the pixels were
    /// summed on.
    pub reference_difc: f64,
    /// Number of pixels summed.
    pub n_pixels: usize,
}

impl FocusedSpectrum {
    /// Creates an empty spectrum on `edges`.
    #[must_use]
    pub fn empty(group: GroupId, edges: Vec<f64>, reference_difc: f64) -> Self {
        let n = edges.len().saturating_sub(1);
        Self {
            group,
            edges,
            counts: vec![0.0; n],
            variances: vec![0.0; n],
            reference_difc,
            n_pixels: 0,
        }
    }

    /// Adds one rebinned pixel.
    pub fn add_pixel(&mut self, pixel: &Rebinned) -> Result<()> {
        if pixel.counts.len() != self.counts.len() {
            return Err(Error::InvalidBinning(format!(
                "pixel has {} bins, focused spectrum {}",
                pixel.counts.len(),
                self.counts.len()
            )));
        }
        for (sum, c) in self.counts.iter_mut().zip(&pixel.counts) {
            *sum += c;
        }
        for (sum, e) in self.variances.iter_mut().zip(&pixel.errors) {
            *sum += e * e;
        }
        self.n_pixels += 1;
        Ok(())
    }

    /// Adds another focused spectrum built on the same edges.
    pub fn accumulate(&mut self, other: &FocusedSpectrum) -> Result<()> {
        if other.edges != self.edges {
            return Err(Error::InvalidBinning(format!(
                "cannot accumulate group {} into group {}: binning differs",
                other.group, self.group
            )));
        }
        for (sum, c) in self.counts.iter_mut().zip(&other.counts) {
            *sum += c;
        }
        for (sum, v) in self.variances.iter_mut().zip(&other.variances) {
            *sum += v;
        }
        self.n_pixels += other.n_pixels;
        Ok(())
    }

    /// Uncertainty per bin.
    #[must_use]
    pub fn errors(&self) -> Vec<f64> {
        self.variances.iter().map(|v| v.sqrt()).collect()
    }

    /// Bin centres.
    #[must_use]
    pub fn centres(&self) -> Vec<f64> {
        self.edges.windows(2).map(|w| 0.5 * (w[0] + w[1])).collect()
    }
}

/// Focuses the usable pixels of one group.
///
/// Pixels masked upstream or listed in `mask` are left out. Returns `None`
/// when no pixel remains.
pub fn focus_group(
    group: GroupId,
    spectra: &[&Spectrum],
    calibration: &CalibrationTable,
    mask: &MaskTable,
    tof_binning: &BinningParams,
    rebinner: &dyn Rebinner,
) -> Result<Option<FocusedSpectrum>> {
    let pixels: Vec<&Spectrum> = spectra
        .iter()
        .copied()
        .filter(|s| !s.masked && !mask.contains(s.detector_id))
        .collect();
    if pixels.is_empty() {
        debug!("group {group}: no unmasked pixels to focus");
        return Ok(None);
    }

    let calibrations: Vec<_> = pixels.iter().map(|s| calibration.entry_for(s)).collect();
    #[allow(clippy::cast_precision_loss)]
    let reference_difc =
        calibrations.iter().map(|c| c.difc).sum::<f64>() / calibrations.len() as f64;
    if reference_difc == 0.0 || !reference_difc.is_finite() {
        return Err(Error::ZeroSlope {
            detector_id: pixels[0].detector_id,
        });
    }

    let tof_edges = tof_binning.edges()?;
    let d_target: Vec<f64> = tof_edges.iter().map(|t| t / reference_difc).collect();
    let mut focused = FocusedSpectrum::empty(group, tof_edges, reference_difc);

    for (spectrum, cal) in pixels.iter().zip(&calibrations) {
        let d_edges = edges_tof_to_d(cal, &spectrum.edges)?;
        let rebinned = rebinner.rebin(&d_edges, &spectrum.counts, &spectrum.errors, &d_target)?;
        focused.add_pixel(&rebinned)?;
    }

    debug!(
        "group {group}: focused {} pixels, arbitrary DIFC {reference_difc:.3}",
        focused.n_pixels
    );
    Ok(Some(focused))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp)]
    use super::*;
    use crate::rebin::LinearRebinner;
    use approx::assert_relative_eq;
    use pdcal_core::DiffCalEntry;

    fn flat(detector_id: i32, counts_per_bin: f64) -> Spectrum {
        let edges: Vec<f64> = (0..=100).map(|i| 10_000.0 + 10.0 * f64::from(i)).collect();
        Spectrum::with_poisson_errors(detector_id, detector_id, edges, vec![counts_per_bin; 100])
            .unwrap()
    }

    #[test]
    fn test_focus_sums_and_excludes_masked() {
        let spectra = [flat(1, 4.0), flat(2, 9.0), flat(3, 100.0)];
        let refs: Vec<&Spectrum> = spectra.iter().collect();
        let calibration: CalibrationTable = [
            DiffCalEntry::from_difc(1, 9_900.0),
            DiffCalEntry::from_difc(2, 10_100.0),
            DiffCalEntry::from_difc(3, 1.0),
        ]
        .into_iter()
        .collect();
        let mask: MaskTable = [3].into_iter().collect();
        let binning = BinningParams::linear(10_200.0, 100.0, 10_800.0).unwrap();

        let focused = focus_group(7, &refs, &calibration, &mask, &binning, &LinearRebinner)
            .unwrap()
            .unwrap();

        assert_eq!(focused.group, 7);
        assert_eq!(focused.n_pixels, 2);
        assert_relative_eq!(focused.reference_difc, 10_000.0);
        assert_eq!(focused.edges.len(), 7);
        // the target bins lie inside both pixels' coverage
        // counts * (target d width) / (pixel d width) = counts * DIFC / 1000
        let expected = 4.0 * 9.9 + 9.0 * 10.1;
        for &c in &focused.counts {
            assert_relative_eq!(c, expected, max_relative = 1e-9);
        }
    }

    #[test]
    fn test_focus_of_fully_masked_group() {
        let mut spectrum = flat(1, 1.0);
        spectrum.masked = true;
        let binning = BinningParams::linear(10_200.0, 100.0, 10_800.0).unwrap();
        let result = focus_group(
            1,
            &[&spectrum],
            &CalibrationTable::new(),
            &MaskTable::new(),
            &binning,
            &LinearRebinner,
        )
        .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_accumulate() {
        let mut a = FocusedSpectrum::empty(1, vec![0.0, 1.0, 2.0], 1.0);
        a.add_pixel(&Rebinned {
            counts: vec![1.0, 2.0],
            errors: vec![1.0, 2.0],
        })
        .unwrap();
        let b = a.clone();
        a.accumulate(&b).unwrap();
        assert_eq!(a.counts, vec![2.0, 4.0]);
        assert_eq!(a.variances, vec![2.0, 8.0]);
        assert_eq!(a.n_pixels, 2);

        let other = FocusedSpectrum::empty(2, vec![0.0, 2.0], 1.0);
        assert!(a.accumulate(&other).is_err());
    }
}
