//! Conversion of cross-correlation offsets into a calibration table.

use pdcal_core::{CalibrationTable, DiffCalEntry, HistogramDataset, Offset};
use std::collections::HashMap;

/// Applies `offsets` to `previous`, giving one row per detector.
///
/// Rows are emitted for every spectrum of `dataset` (in dataset order), then
/// for any remaining rows of `previous`, then for offsets naming detectors
/// found in neither. A detector's starting row is its `previous` row, else
/// its geometric DIFC, else identity; an offset `o` divides DIFC by `1 + o`
/// and leaves DIFA and TZERO untouched. The function is pure: the same inputs
/// always give the same table.
#[must_use]
pub fn convert_diffcal(
    offsets: &[Offset],
    previous: &CalibrationTable,
    dataset: &HistogramDataset,
) -> CalibrationTable {
    let by_detector: HashMap<i32, f64> = offsets
        .iter()
        .map(|offset| (offset.detector_id, offset.value))
        .collect();
    let apply = |entry: DiffCalEntry| match by_detector.get(&entry.detector_id) {
        Some(&value) => DiffCalEntry {
            difc: entry.difc / (1.0 + value),
            ..entry
        },
        None => entry,
    };

    let mut table = CalibrationTable::new();
    for spectrum in dataset.spectra() {
        if !table.contains(spectrum.detector_id) {
            table.insert(apply(previous.entry_for(spectrum)));
        }
    }
    for entry in previous.iter() {
        if !table.contains(entry.detector_id) {
            table.insert(apply(*entry));
        }
    }
    for offset in offsets {
        if !table.contains(offset.detector_id) {
            table.insert(apply(DiffCalEntry::identity(offset.detector_id)));
        }
    }
    table
}
