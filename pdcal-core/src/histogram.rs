//! Histogram spectra and datasets.
//!
//! A [`Spectrum`] is one detector pixel's histogram: `n + 1` bin edges with
//! `n` counts and `n` uncertainties. A [`HistogramDataset`] owns all spectra
//! of a run and indexes them by spectrum number.

use crate::calibration::MaskTable;
use crate::conversion::DIFC_CONSTANT;
use crate::error::{Error, Result};
use std::collections::HashMap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Flight-path geometry of a detector pixel.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DetectorGeometry {
    /// Primary flight path (moderator to sample) in metres.
    pub l1: f64,
    /// Secondary flight path (sample to pixel) in metres.
    pub l2: f64,
    /// Scattering angle in radians.
    pub two_theta: f64,
}

impl DetectorGeometry {
    /// Creates a new geometry record.
    #[must_use]
    pub fn new(l1: f64, l2: f64, two_theta: f64) -> Self {
        Self { l1, l2, two_theta }
    }

    /// Geometric DIFC in microseconds per angstrom.
    #[must_use]
    pub fn difc(&self) -> f64 {
        DIFC_CONSTANT * 2.0 * (0.5 * self.two_theta).sin() * (self.l1 + self.l2)
    }
}

/// A single detector histogram.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Spectrum {
    /// Spectrum number, the key used by grouping files.
    pub spectrum_number: i32,
    /// Detector id, the key used by calibration tables.
    pub detector_id: i32,
    /// Bin edges, strictly increasing.
    pub edges: Vec<f64>,
    /// Counts per bin.
    pub counts: Vec<f64>,
    /// Uncertainty per bin.
    pub errors: Vec<f64>,
    /// Masked upstream.
    pub masked: bool,
    /// Optional pixel geometry.
    pub geometry: Option<DetectorGeometry>,
}

impl Spectrum {
    /// Creates a validated spectrum.
    ///
    /// # Errors
    /// Returns [`Error::InvalidSpectrum`] when the array lengths disagree or
    /// the edges are not strictly increasing.
    pub fn new(
        spectrum_number: i32,
        detector_id: i32,
        edges: Vec<f64>,
        counts: Vec<f64>,
        errors: Vec<f64>,
    ) -> Result<Self> {
        let spectrum = Self {
            spectrum_number,
            detector_id,
            edges,
            counts,
            errors,
            masked: false,
            geometry: None,
        };
        spectrum.validate()?;
        Ok(spectrum)
    }

    /// Creates a spectrum with Poisson uncertainties (`sqrt(counts)`).
    ///
    /// # Errors
    /// See [`Spectrum::new`].
    pub fn with_poisson_errors(
        spectrum_number: i32,
        detector_id: i32,
        edges: Vec<f64>,
        counts: Vec<f64>,
    ) -> Result<Self> {
        let errors = counts.iter().map(|c| c.max(0.0).sqrt()).collect();
        Self::new(spectrum_number, detector_id, edges, counts, errors)
    }

    /// Attaches detector geometry.
    #[must_use]
    pub fn with_geometry(mut self, geometry: DetectorGeometry) -> Self {
        self.geometry = Some(geometry);
        self
    }

    /// Checks array lengths and edge ordering.
    ///
    /// # Errors
    /// Returns [`Error::InvalidSpectrum`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Error::InvalidSpectrum {
            spectrum: self.spectrum_number,
            reason,
        };
        if self.edges.len() != self.counts.len() + 1 {
            return Err(invalid(format!(
                "{} edges for {} counts",
                self.edges.len(),
                self.counts.len()
            )));
        }
        if self.errors.len() != self.counts.len() {
            return Err(invalid(format!(
                "{} errors for {} counts",
                self.errors.len(),
                self.counts.len()
            )));
        }
        if self.edges.iter().any(|e| !e.is_finite())
            || self.edges.windows(2).any(|w| w[1] <= w[0])
        {
            return Err(invalid("bin edges must be finite and strictly increasing".into()));
        }
        Ok(())
    }

    /// Number of bins.
    #[must_use]
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    /// Returns true if the spectrum has no bins.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Sum of all counts.
    #[must_use]
    pub fn integrated_counts(&self) -> f64 {
        self.counts.iter().sum()
    }

    /// Bin centres.
    #[must_use]
    pub fn centres(&self) -> Vec<f64> {
        self.edges.windows(2).map(|w| 0.5 * (w[0] + w[1])).collect()
    }
}

/// All spectra of one run, indexed by spectrum number.
#[derive(Debug, Clone, Default)]
pub struct HistogramDataset {
    spectra: Vec<Spectrum>,
    index: HashMap<i32, usize>,
}

impl HistogramDataset {
    /// Builds a dataset, validating every spectrum.
    ///
    /// # Errors
    /// Returns an error for invalid spectra or duplicate spectrum numbers.
    pub fn new(spectra: Vec<Spectrum>) -> Result<Self> {
        let mut index = HashMap::with_capacity(spectra.len());
        for (i, spectrum) in spectra.iter().enumerate() {
            spectrum.validate()?;
            if index.insert(spectrum.spectrum_number, i).is_some() {
                return Err(Error::DuplicateSpectrum(spectrum.spectrum_number));
            }
        }
        Ok(Self { spectra, index })
    }

    /// Returns the number of spectra.
    #[must_use]
    pub fn len(&self) -> usize {
        self.spectra.len()
    }

    /// Returns true if the dataset holds no spectra.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.spectra.is_empty()
    }

    /// All spectra in input order.
    #[must_use]
    pub fn spectra(&self) -> &[Spectrum] {
        &self.spectra
    }

    /// Looks up a spectrum by its spectrum number.
    #[must_use]
    pub fn spectrum_by_number(&self, spectrum_number: i32) -> Option<&Spectrum> {
        self.index
            .get(&spectrum_number)
            .map(|&i| &self.spectra[i])
    }

    /// Detector ids in input order.
    pub fn detector_ids(&self) -> impl Iterator<Item = i32> + '_ {
        self.spectra.iter().map(|s| s.detector_id)
    }

    /// Flags every spectrum whose detector is in `mask`. Returns how many
    /// spectra became masked.
    pub fn apply_mask(&mut self, mask: &MaskTable) -> usize {
        let mut newly_masked = 0;
        for spectrum in &mut self.spectra {
            if !spectrum.masked && mask.contains(spectrum.detector_id) {
                spectrum.masked = true;
                newly_masked += 1;
            }
        }
        newly_masked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn spectrum(number: i32) -> Spectrum {
        Spectrum::with_poisson_errors(number, 100 + number, vec![0.0, 1.0, 2.0], vec![4.0, 9.0])
            .unwrap()
    }

    #[test]
    fn test_spectrum_validation() {
        let bad = Spectrum::new(1, 1, vec![0.0, 1.0], vec![1.0, 2.0], vec![1.0, 1.0]);
        assert!(bad.is_err());

        let unordered = Spectrum::new(1, 1, vec![0.0, 2.0, 1.0], vec![1.0, 2.0], vec![1.0, 1.0]);
        assert!(unordered.is_err());

        for last in [f64::NAN, f64::INFINITY] {
            let edges = vec![0.0, 1.0, last];
            assert!(Spectrum::new(1, 1, edges, vec![1.0, 2.0], vec![1.0, 1.0]).is_err());
        }

        let s = spectrum(1);
        assert_eq!(s.len(), 2);
        assert_relative_eq!(s.integrated_counts(), 13.0);
        assert_relative_eq!(s.errors[1], 3.0);
        assert_eq!(s.centres(), vec![0.5, 1.5]);
    }

    #[test]
    fn test_dataset_lookup_and_mask() {
        let mut dataset = HistogramDataset::new(vec![spectrum(1), spectrum(2)]).unwrap();
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.spectrum_by_number(2).unwrap().detector_id, 102);
        assert!(dataset.spectrum_by_number(3).is_none());

        let mask: MaskTable = [102].into_iter().collect();
        assert_eq!(dataset.apply_mask(&mask), 1);
        assert_eq!(dataset.apply_mask(&mask), 0);
        assert!(dataset.spectrum_by_number(2).unwrap().masked);
    }

    #[test]
    fn test_duplicate_spectrum_rejected() {
        let result = HistogramDataset::new(vec![spectrum(1), spectrum(1)]);
        assert!(matches!(result, Err(Error::DuplicateSpectrum(1))));
    }

    #[test]
    fn test_geometry_difc() {
        // 90 degree bank at 1.5 m total flight path (POWGEN-like)
        let geometry = DetectorGeometry::new(60.0, 1.5, std::f64::consts::FRAC_PI_2);
        let expected = 252.816 * 2.0 * std::f64::consts::FRAC_PI_4.sin() * 61.5;
        assert_relative_eq!(geometry.difc(), expected, max_relative = 1e-12);
    }
}
