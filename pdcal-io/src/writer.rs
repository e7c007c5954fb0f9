//! Calibration writers.
//!
//! Every writer goes through a temporary file in the destination directory
//! that is renamed over the target once complete, so a failed run never
//! leaves a truncated calibration behind.

use crate::config::OutputFormat;
use crate::{Error, Result};
use log::info;
use pdcal_algorithms::{
    CalibrationResult, CalibrationSummary, CalibrationTable, GroupCalibration, Grouping,
    HistogramDataset, MaskTable,
};
use serde::Serialize;
use std::collections::HashMap;
use std::io::{BufWriter, Write};
use std::path::Path;
use tempfile::NamedTempFile;

/// One row of a written calibration.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct CalibrationRow {
    /// Detector id.
    pub detid: i32,
    /// Linear coefficient.
    pub difc: f64,
    /// Quadratic coefficient.
    pub difa: f64,
    /// Constant offset.
    pub tzero: f64,
    /// Group of the detector's spectrum, 0 when ungrouped.
    pub group: i32,
    /// 1 for usable detectors, 0 for masked ones.
    #[serde(rename = "use")]
    pub use_detector: u8,
}

/// Rows of `table` in table order, annotated with group and mask state.
#[must_use]
pub fn calibration_rows(
    table: &CalibrationTable,
    mask: &MaskTable,
    grouping: &Grouping,
    dataset: &HistogramDataset,
) -> Vec<CalibrationRow> {
    let spectrum_of: HashMap<i32, i32> = dataset
        .spectra()
        .iter()
        .map(|s| (s.detector_id, s.spectrum_number))
        .collect();
    table
        .iter()
        .map(|entry| CalibrationRow {
            detid: entry.detector_id,
            difc: entry.difc,
            difa: entry.difa,
            tzero: entry.tzero,
            group: spectrum_of
                .get(&entry.detector_id)
                .and_then(|&s| grouping.group_of(s))
                .unwrap_or(0),
            use_detector: u8::from(!mask.contains(entry.detector_id)),
        })
        .collect()
}

/// Complete output of a run as written to disk.
#[derive(Clone, Debug, Serialize)]
pub struct CalibrationDocument {
    /// Calibrant name.
    pub calibrant: String,
    /// Calibration rows.
    pub calibration: Vec<CalibrationRow>,
    /// Masked detector ids, ascending.
    pub mask: Vec<i32>,
    /// Per-group peak calibrations.
    pub groups: Vec<GroupCalibration>,
    /// Run counts.
    pub summary: CalibrationSummary,
}

impl CalibrationDocument {
    /// Collects the output of a finished run.
    #[must_use]
    pub fn new(calibrant: &str, result: &CalibrationResult, dataset: &HistogramDataset) -> Self {
        Self {
            calibrant: calibrant.to_string(),
            calibration: calibration_rows(
                &result.calibration,
                &result.mask,
                &result.grouping,
                dataset,
            ),
            mask: result.mask.iter().collect(),
            groups: result.group_calibrations.clone(),
            summary: result.summary.clone(),
        }
    }
}

/// Writes a calibration document in the requested format.
///
/// CSV output is the `detid,difc,difa,tzero,group,use` table; JSON holds the
/// whole document; HDF5 needs the `hdf5` feature.
///
/// # Errors
/// Returns an error if the destination cannot be written or the format is
/// not available in this build.
pub fn write_calibration<P: AsRef<Path>>(
    path: P,
    format: OutputFormat,
    document: &CalibrationDocument,
) -> Result<()> {
    let path = path.as_ref();
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut file = NamedTempFile::new_in(dir)?;

    match format {
        OutputFormat::Csv => {
            let mut writer = BufWriter::new(file.as_file_mut());
            write_csv(&mut writer, &document.calibration)?;
            writer.flush()?;
        }
        OutputFormat::Json => {
            let mut writer = BufWriter::new(file.as_file_mut());
            serde_json::to_writer_pretty(&mut writer, document)?;
            writeln!(writer)?;
            writer.flush()?;
        }
        #[cfg(feature = "hdf5")]
        OutputFormat::H5 => crate::hdf5::write_calibration_hdf5(file.path(), document)?,
        #[cfg(not(feature = "hdf5"))]
        OutputFormat::H5 => {
            return Err(Error::InvalidFormat(
                "HDF5 output requires the 'hdf5' feature".to_string(),
            ))
        }
    }

    file.persist(path).map_err(|e| Error::Io(e.error))?;
    info!(
        "wrote {} calibration rows ({} masked) to {}",
        document.calibration.len(),
        document.mask.len(),
        path.display()
    );
    Ok(())
}

fn write_csv<W: Write>(writer: &mut W, rows: &[CalibrationRow]) -> Result<()> {
    writeln!(writer, "detid,difc,difa,tzero,group,use")?;
    for row in rows {
        writeln!(
            writer,
            "{},{},{},{},{},{}",
            row.detid, row.difc, row.difa, row.tzero, row.group, row.use_detector
        )?;
    }
    Ok(())
}
