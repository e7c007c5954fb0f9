//! HDF5 diffcal tables.
//!
//! Layout: a `calibration` group holding one 1-D dataset per column
//! (`detid`, `difc`, `difa`, `tzero`, `group`, `use`) plus a `calibrant`
//! attribute, and a top-level `mask` dataset of masked detector ids.

use crate::writer::{CalibrationDocument, CalibrationRow};
use crate::{Error, Result};
use hdf5::types::{H5Type, VarLenUnicode};
use hdf5::{Dataset, File, Group};
use ndarray::ArrayView1;
use pdcal_core::{CalibrationTable, DiffCalEntry, MaskTable};
use std::path::Path;
use std::str::FromStr;

const FORMAT_VERSION: &str = "0.1";

/// Writes a calibration document as an HDF5 diffcal file.
///
/// # Errors
/// Returns an error if HDF5 I/O fails.
pub fn write_calibration_hdf5<P: AsRef<Path>>(
    path: P,
    document: &CalibrationDocument,
) -> Result<()> {
    let file = File::create(path)?;
    set_attr_str_file(&file, "pdcal_format_version", FORMAT_VERSION)?;

    let group = file.create_group("calibration")?;
    set_attr_str_group(&group, "calibrant", &document.calibrant)?;

    let rows = &document.calibration;
    write_column(&group, "detid", &column(rows, |r| r.detid), None)?;
    write_column(&group, "difc", &column(rows, |r| r.difc), Some("us/Angstrom"))?;
    write_column(&group, "difa", &column(rows, |r| r.difa), Some("us/Angstrom^2"))?;
    write_column(&group, "tzero", &column(rows, |r| r.tzero), Some("us"))?;
    write_column(&group, "group", &column(rows, |r| r.group), None)?;
    write_column(&group, "use", &column(rows, |r| r.use_detector), None)?;

    write_column(&file, "mask", &document.mask, None)?;
    Ok(())
}

/// Reads the calibration table of an HDF5 diffcal file.
///
/// # Errors
/// Returns an error if HDF5 I/O fails, a column is missing or the columns
/// differ in length.
pub fn read_calibration_hdf5<P: AsRef<Path>>(path: P) -> Result<CalibrationTable> {
    let file = File::open(path)?;
    let group = file.group("calibration")?;

    let detid = read_dataset_vec::<i32>(&group, "detid")?;
    let difc = read_dataset_vec::<f64>(&group, "difc")?;
    let difa = read_dataset_vec_opt::<f64>(&group, "difa")?.unwrap_or_else(|| vec![0.0; detid.len()]);
    let tzero =
        read_dataset_vec_opt::<f64>(&group, "tzero")?.unwrap_or_else(|| vec![0.0; detid.len()]);

    if [difc.len(), difa.len(), tzero.len()]
        .iter()
        .any(|&n| n != detid.len())
    {
        return Err(Error::InvalidFormat(
            "calibration columns differ in length".to_string(),
        ));
    }

    Ok(detid
        .iter()
        .zip(&difc)
        .zip(difa.iter().zip(&tzero))
        .map(|((&id, &c), (&a, &t))| DiffCalEntry::new(id, c, a, t))
        .collect())
}

/// Reads the mask of an HDF5 diffcal file.
///
/// # Errors
/// Returns an error if HDF5 I/O fails.
pub fn read_mask_hdf5<P: AsRef<Path>>(path: P) -> Result<MaskTable> {
    let file = File::open(path)?;
    Ok(read_dataset_vec_opt::<i32>(&file, "mask")?
        .unwrap_or_default()
        .into_iter()
        .collect())
}

/// Calibrant attribute of an HDF5 diffcal file, if present.
///
/// # Errors
/// Returns an error if HDF5 I/O fails.
pub fn read_calibrant_hdf5<P: AsRef<Path>>(path: P) -> Result<Option<String>> {
    let file = File::open(path)?;
    read_attr_opt_string(&file.group("calibration")?, "calibrant")
}

fn column<T>(rows: &[CalibrationRow], field: impl Fn(&CalibrationRow) -> T) -> Vec<T> {
    rows.iter().map(field).collect()
}

fn write_column<T: H5Type>(group: &Group, name: &str, values: &[T], units: Option<&str>) -> Result<()> {
    let dataset = group.new_dataset::<T>().shape((values.len(),)).create(name)?;
    if let Some(units) = units {
        set_dataset_units(&dataset, units)?;
    }
    dataset.write(ArrayView1::from(values))?;
    Ok(())
}

fn set_dataset_units(dataset: &Dataset, units: &str) -> Result<()> {
    let value = to_var_len_unicode(units)?;
    dataset
        .new_attr::<VarLenUnicode>()
        .create("units")?
        .write_scalar(&value)?;
    Ok(())
}

fn set_attr_str_file(file: &File, name: &str, value: &str) -> Result<()> {
    let value = to_var_len_unicode(value)?;
    file.new_attr::<VarLenUnicode>()
        .create(name)?
        .write_scalar(&value)?;
    Ok(())
}

fn set_attr_str_group(group: &Group, name: &str, value: &str) -> Result<()> {
    let value = to_var_len_unicode(value)?;
    group
        .new_attr::<VarLenUnicode>()
        .create(name)?
        .write_scalar(&value)?;
    Ok(())
}

fn read_dataset_vec<T: H5Type>(group: &Group, name: &str) -> Result<Vec<T>> {
    let dataset = group.dataset(name)?;
    Ok(dataset.read_raw::<T>()?)
}

fn read_dataset_vec_opt<T: H5Type>(group: &Group, name: &str) -> Result<Option<Vec<T>>> {
    match group.dataset(name) {
        Ok(dataset) => Ok(Some(dataset.read_raw::<T>()?)),
        Err(_) => Ok(None),
    }
}

fn read_attr_opt_string(group: &Group, name: &str) -> Result<Option<String>> {
    match group.attr(name) {
        Ok(attr) => {
            let value: VarLenUnicode = attr.read_scalar()?;
            Ok(Some(value.to_string()))
        }
        Err(_) => Ok(None),
    }
}

fn to_var_len_unicode(value: &str) -> Result<VarLenUnicode> {
    VarLenUnicode::from_str(value)
        .map_err(|e| Error::InvalidFormat(format!("invalid utf-8 attribute: {e}")))
}
