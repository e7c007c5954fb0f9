//! Calibration, offset and mask records.

use crate::conversion;
use crate::error::Result;
use crate::histogram::Spectrum;
use std::collections::{BTreeSet, HashMap};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// TOF-to-d conversion constants for one detector (or one group).
///
/// `TOF = DIFC * d + DIFA * d^2 + TZERO`
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DiffCalEntry {
    /// Detector id (or group id for group-scoped rows).
    pub detector_id: i32,
    /// Linear term in microseconds per angstrom.
    pub difc: f64,
    /// Quadratic term.
    #[cfg_attr(feature = "serde", serde(default))]
    pub difa: f64,
    /// Constant term in microseconds.
    #[cfg_attr(feature = "serde", serde(default))]
    pub tzero: f64,
}

impl DiffCalEntry {
    /// Creates a calibration row.
    #[must_use]
    pub fn new(detector_id: i32, difc: f64, difa: f64, tzero: f64) -> Self {
        Self {
            detector_id,
            difc,
            difa,
            tzero,
        }
    }

    /// A row with only DIFC set.
    #[must_use]
    pub fn from_difc(detector_id: i32, difc: f64) -> Self {
        Self::new(detector_id, difc, 0.0, 0.0)
    }

    /// Identity calibration (`d == TOF`).
    #[must_use]
    pub fn identity(detector_id: i32) -> Self {
        Self::from_difc(detector_id, 1.0)
    }

    /// Converts a TOF value to d-spacing.
    ///
    /// # Errors
    /// See [`conversion::tof_to_d`].
    pub fn tof_to_d(&self, tof: f64) -> Result<f64> {
        conversion::tof_to_d(self, tof)
    }

    /// Converts a d-spacing value to TOF.
    #[must_use]
    pub fn d_to_tof(&self, d: f64) -> f64 {
        conversion::d_to_tof(self, d)
    }
}

/// Per-detector calibration table. Rows keep their insertion order, so a
/// table built by walking a dataset mirrors the dataset's detector order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalibrationTable {
    rows: Vec<DiffCalEntry>,
    index: HashMap<i32, usize>,
}

impl CalibrationTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a row, or replaces an existing one in place. Returns the
    /// replaced row if any.
    pub fn insert(&mut self, entry: DiffCalEntry) -> Option<DiffCalEntry> {
        if let Some(&i) = self.index.get(&entry.detector_id) {
            return Some(std::mem::replace(&mut self.rows[i], entry));
        }
        self.index.insert(entry.detector_id, self.rows.len());
        self.rows.push(entry);
        None
    }

    /// Looks up a row.
    #[must_use]
    pub fn get(&self, detector_id: i32) -> Option<&DiffCalEntry> {
        self.index.get(&detector_id).map(|&i| &self.rows[i])
    }

    /// Returns true if a row exists for the detector.
    #[must_use]
    pub fn contains(&self, detector_id: i32) -> bool {
        self.index.contains_key(&detector_id)
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &DiffCalEntry> {
        self.rows.iter()
    }

    /// Calibration to use for a spectrum: the table row when present, else
    /// the geometric DIFC, else identity.
    #[must_use]
    pub fn entry_for(&self, spectrum: &Spectrum) -> DiffCalEntry {
        if let Some(entry) = self.get(spectrum.detector_id) {
            return *entry;
        }
        match spectrum.geometry {
            Some(geometry) => DiffCalEntry::from_difc(spectrum.detector_id, geometry.difc()),
            None => DiffCalEntry::identity(spectrum.detector_id),
        }
    }
}

impl FromIterator<DiffCalEntry> for CalibrationTable {
    fn from_iter<I: IntoIterator<Item = DiffCalEntry>>(iter: I) -> Self {
        let mut table = Self::new();
        table.extend(iter);
        table
    }
}

impl Extend<DiffCalEntry> for CalibrationTable {
    fn extend<I: IntoIterator<Item = DiffCalEntry>>(&mut self, iter: I) {
        for entry in iter {
            self.insert(entry);
        }
    }
}

/// Relative d-spacing shift for one detector, from cross-correlation.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Offset {
    /// Detector id.
    pub detector_id: i32,
    /// Fractional shift; `DIFC_new = DIFC_old / (1 + value)`.
    pub value: f64,
    /// The correlation peak could not be located.
    pub masked: bool,
}

impl Offset {
    /// Creates an unmasked offset.
    #[must_use]
    pub fn new(detector_id: i32, value: f64) -> Self {
        Self {
            detector_id,
            value,
            masked: false,
        }
    }

    /// Creates a zero offset flagged as a failure.
    #[must_use]
    pub fn failed(detector_id: i32) -> Self {
        Self {
            detector_id,
            value: 0.0,
            masked: true,
        }
    }

    /// Composes two successive offsets into one.
    #[must_use]
    pub fn compose(self, next: f64) -> Self {
        Self {
            value: (1.0 + self.value) * (1.0 + next) - 1.0,
            ..self
        }
    }
}

/// Set of detector ids whose calibration is not trusted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaskTable {
    detectors: BTreeSet<i32>,
}

impl MaskTable {
    /// Creates an empty mask.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Masks a detector. Returns false if it was already masked.
    pub fn insert(&mut self, detector_id: i32) -> bool {
        self.detectors.insert(detector_id)
    }

    /// Returns true if the detector is masked.
    #[must_use]
    pub fn contains(&self, detector_id: i32) -> bool {
        self.detectors.contains(&detector_id)
    }

    /// Number of masked detectors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.detectors.len()
    }

    /// Returns true if nothing is masked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.detectors.is_empty()
    }

    /// Masked detector ids in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = i32> + '_ {
        self.detectors.iter().copied()
    }

    /// Adds every detector masked in `other`.
    pub fn merge(&mut self, other: &MaskTable) {
        self.detectors.extend(other.iter());
    }
}

impl FromIterator<i32> for MaskTable {
    fn from_iter<I: IntoIterator<Item = i32>>(iter: I) -> Self {
        Self {
            detectors: iter.into_iter().collect(),
        }
    }
}

impl Extend<i32> for MaskTable {
    fn extend<I: IntoIterator<Item = i32>>(&mut self, iter: I) {
        self.detectors.extend(iter);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp)]
    use super::*;
    use crate::histogram::DetectorGeometry;
    use approx::assert_relative_eq;

    #[test]
    fn test_table_keeps_insertion_order() {
        let mut table = CalibrationTable::new();
        table.insert(DiffCalEntry::from_difc(5, 100.0));
        table.insert(DiffCalEntry::from_difc(2, 200.0));
        let old = table.insert(DiffCalEntry::from_difc(5, 150.0));

        assert_eq!(old.map(|e| e.difc), Some(100.0));
        assert_eq!(table.len(), 2);
        let ids: Vec<i32> = table.iter().map(|e| e.detector_id).collect();
        assert_eq!(ids, vec![5, 2]);
        assert_eq!(table.get(5).map(|e| e.difc), Some(150.0));
    }

    #[test]
    fn test_entry_for_fallbacks() {
        let table: CalibrationTable = [DiffCalEntry::new(1, 5000.0, 1.0, 2.0)].into_iter().collect();

        let known = Spectrum::with_poisson_errors(1, 1, vec![0.0, 1.0], vec![1.0]).unwrap();
        assert_relative_eq!(table.entry_for(&known).difc, 5000.0);

        let geometry = DetectorGeometry::new(10.0, 2.0, 1.0);
        let with_geometry = Spectrum::with_poisson_errors(2, 2, vec![0.0, 1.0], vec![1.0])
            .unwrap()
            .with_geometry(geometry);
        assert_relative_eq!(table.entry_for(&with_geometry).difc, geometry.difc());

        let bare = Spectrum::with_poisson_errors(3, 3, vec![0.0, 1.0], vec![1.0]).unwrap();
        assert_eq!(table.entry_for(&bare), DiffCalEntry::identity(3));
    }

    #[test]
    fn test_offset_compose() {
        let offset = Offset::new(7, 0.01).compose(-0.005);
        assert_relative_eq!(offset.value, 1.01 * 0.995 - 1.0);
        assert!(!offset.masked);
        assert!(Offset::failed(7).masked);
    }

    #[test]
    fn test_mask_merge() {
        let mut mask: MaskTable = [3, 1].into_iter().collect();
        let other: MaskTable = [2, 3].into_iter().collect();
        mask.merge(&other);
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(!mask.insert(2));
    }
}
