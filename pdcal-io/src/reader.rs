//! Readers for histogram datasets, groupings, calibrations and masks.
//!
//! Tabular text files are comma or whitespace separated; `#` starts a
//! comment, and a first line that does not parse as numbers is taken as a
//! header.

use crate::{Error, Result};
use log::debug;
use pdcal_core::{
    CalibrationTable, DetectorGeometry, DiffCalEntry, GroupId, Grouping, HistogramDataset,
    MaskTable, Spectrum,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::Path;

#[derive(Deserialize)]
struct JsonDataset {
    spectra: Vec<JsonSpectrum>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct JsonSpectrum {
    spectrum: i32,
    detector: Option<i32>,
    edges: Vec<f64>,
    counts: Vec<f64>,
    errors: Option<Vec<f64>>,
    #[serde(default)]
    masked: bool,
    l1: Option<f64>,
    l2: Option<f64>,
    two_theta: Option<f64>,
}

impl JsonSpectrum {
    fn into_spectrum(self) -> Result<Spectrum> {
        let detector_id = self.detector.unwrap_or(self.spectrum);
        let mut spectrum = match self.errors {
            Some(errors) => Spectrum::new(self.spectrum, detector_id, self.edges, self.counts, errors)?,
            None => Spectrum::with_poisson_errors(self.spectrum, detector_id, self.edges, self.counts)?,
        };
        spectrum.masked = self.masked;
        match (self.l1, self.l2, self.two_theta) {
            (Some(l1), Some(l2), Some(two_theta)) => {
                spectrum = spectrum.with_geometry(DetectorGeometry::new(l1, l2, two_theta));
            }
            (None, None, None) => {}
            _ => {
                return Err(Error::InvalidFormat(format!(
                    "spectrum {}: l1, l2 and two_theta must be given together",
                    spectrum.spectrum_number
                )))
            }
        }
        Ok(spectrum)
    }
}

/// Reads a histogram dataset from JSON.
///
/// ```json
/// { "spectra": [ { "spectrum": 1, "detector": 101, "edges": [..], "counts": [..],
///                  "errors": [..], "masked": false,
///                  "l1": 15.0, "l2": 2.0, "two_theta": 1.57 } ] }
/// ```
///
/// `detector` defaults to the spectrum number, `errors` to `sqrt(counts)`;
/// the geometry is optional.
///
/// # Errors
/// Returns an error for unreadable files, malformed JSON or inconsistent
/// spectra.
pub fn read_dataset_json<P: AsRef<Path>>(path: P) -> Result<HistogramDataset> {
    let file = File::open(path.as_ref())?;
    let dataset: JsonDataset = serde_json::from_reader(BufReader::new(file))?;
    let spectra = dataset
        .spectra
        .into_iter()
        .map(JsonSpectrum::into_spectrum)
        .collect::<Result<Vec<_>>>()?;
    debug!("read {} spectra from {}", spectra.len(), path.as_ref().display());
    Ok(HistogramDataset::new(spectra)?)
}

/// Reads a grouping.
///
/// JSON files map group ids to spectrum lists (`{"1": [1, 2], "2": [3]}`);
/// any other file is a `spectrum,group` table.
///
/// # Errors
/// Returns an error for unreadable or malformed files and for spectra
/// assigned to two groups.
pub fn read_grouping<P: AsRef<Path>>(path: P) -> Result<Grouping> {
    let path = path.as_ref();
    if is_json(path) {
        let file = File::open(path)?;
        let groups: BTreeMap<String, Vec<i32>> = serde_json::from_reader(BufReader::new(file))?;
        let mut grouping = Grouping::new();
        for (key, spectra) in groups {
            let group: GroupId = key.trim().parse().map_err(|_| {
                Error::InvalidFormat(format!("{}: group id '{key}' is not an integer", path.display()))
            })?;
            for spectrum in spectra {
                grouping.assign(spectrum, group)?;
            }
        }
        return Ok(grouping);
    }

    let mut grouping = Grouping::new();
    for (line, fields) in table_rows(path)? {
        let [spectrum, group] = parse_fields::<i32, 2>(path, line, &fields)?;
        grouping.assign(spectrum, group)?;
    }
    Ok(grouping)
}

#[derive(Deserialize)]
struct JsonCalibrationRow {
    detid: i32,
    difc: f64,
    #[serde(default)]
    difa: f64,
    #[serde(default)]
    tzero: f64,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum JsonCalibration {
    Rows(Vec<JsonCalibrationRow>),
    Document { calibration: Vec<JsonCalibrationRow> },
}

/// Reads a calibration table.
///
/// JSON files hold a list of `{detid, difc, difa, tzero}` rows, bare or under
/// a `calibration` key; HDF5 files (`.h5`, with the `hdf5` feature) use the
/// diffcal layout; anything else is a `detid,difc[,difa[,tzero]]` table
/// whose extra columns are ignored.
///
/// # Errors
/// Returns an error for unreadable or malformed files.
pub fn read_calibration<P: AsRef<Path>>(path: P) -> Result<CalibrationTable> {
    let path = path.as_ref();
    #[cfg(feature = "hdf5")]
    if path.extension().is_some_and(|e| e == "h5") {
        return crate::hdf5::read_calibration_hdf5(path);
    }
    if is_json(path) {
        let file = File::open(path)?;
        let rows = match serde_json::from_reader(BufReader::new(file))? {
            JsonCalibration::Rows(rows) | JsonCalibration::Document { calibration: rows } => rows,
        };
        return Ok(rows
            .into_iter()
            .map(|r| DiffCalEntry::new(r.detid, r.difc, r.difa, r.tzero))
            .collect());
    }

    let mut table = CalibrationTable::new();
    for (line, fields) in table_rows(path)? {
        if fields.len() < 2 {
            return Err(format_error(path, line, "expected at least detid and difc"));
        }
        let detid = parse_field::<i32>(path, line, &fields[0])?;
        let mut values = [0.0; 3];
        for (value, field) in values.iter_mut().zip(&fields[1..]) {
            *value = parse_field::<f64>(path, line, field)?;
        }
        table.insert(DiffCalEntry::new(detid, values[0], values[1], values[2]));
    }
    Ok(table)
}

/// Reads a mask: detector ids separated by commas or whitespace, with
/// inclusive ranges written `first-last`. HDF5 diffcal files (with the
/// `hdf5` feature) contribute their `mask` dataset.
///
/// # Errors
/// Returns an error for unreadable files, bad ids or reversed ranges.
pub fn read_mask<P: AsRef<Path>>(path: P) -> Result<MaskTable> {
    let path = path.as_ref();
    #[cfg(feature = "hdf5")]
    if path.extension().is_some_and(|e| e == "h5") {
        return crate::hdf5::read_mask_hdf5(path);
    }
    let text = fs::read_to_string(path)?;
    let mut mask = MaskTable::new();
    for (index, raw) in text.lines().enumerate() {
        let line = index + 1;
        for token in split_fields(strip_comment(raw)) {
            match token.split_once('-').filter(|(first, _)| !first.is_empty()) {
                Some((first, last)) => {
                    let first = parse_field::<i32>(path, line, first)?;
                    let last = parse_field::<i32>(path, line, last)?;
                    if last < first {
                        return Err(format_error(path, line, &format!("reversed range {token}")));
                    }
                    mask.extend(first..=last);
                }
                None => {
                    mask.insert(parse_field::<i32>(path, line, &token)?);
                }
            }
        }
    }
    Ok(mask)
}

fn is_json(path: &Path) -> bool {
    path.extension().is_some_and(|e| e.eq_ignore_ascii_case("json"))
}

fn strip_comment(line: &str) -> &str {
    line.split_once('#').map_or(line, |(content, _)| content)
}

fn split_fields(line: &str) -> Vec<String> {
    line.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|f| !f.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Non-empty rows of a table file with their 1-based line numbers, minus a
/// leading header.
fn table_rows(path: &Path) -> Result<Vec<(usize, Vec<String>)>> {
    let text = fs::read_to_string(path)?;
    let mut rows: Vec<(usize, Vec<String>)> = text
        .lines()
        .enumerate()
        .map(|(i, line)| (i + 1, split_fields(strip_comment(line))))
        .filter(|(_, fields)| !fields.is_empty())
        .collect();
    let has_header = rows
        .first()
        .is_some_and(|(_, fields)| fields[0].parse::<f64>().is_err());
    if has_header {
        rows.remove(0);
    }
    Ok(rows)
}

fn format_error(path: &Path, line: usize, message: &str) -> Error {
    Error::InvalidFormat(format!("{}:{line}: {message}", path.display()))
}

fn parse_field<T: std::str::FromStr>(path: &Path, line: usize, field: &str) -> Result<T> {
    field
        .trim()
        .parse()
        .map_err(|_| format_error(path, line, &format!("cannot parse '{field}'")))
}

fn parse_fields<T: std::str::FromStr + Copy + Default, const N: usize>(
    path: &Path,
    line: usize,
    fields: &[String],
) -> Result<[T; N]> {
    if fields.len() < N {
        return Err(format_error(
            path,
            line,
            &format!("expected {N} columns, found {}", fields.len()),
        ));
    }
    let mut values = [T::default(); N];
    for (value, field) in values.iter_mut().zip(fields) {
        *value = parse_field(path, line, field)?;
    }
    Ok(values)
}
