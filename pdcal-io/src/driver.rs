//! Batch driver: configuration in, calibration file out.

use crate::config::CalibrationConfig;
use crate::reader::{read_calibration, read_dataset_json, read_grouping, read_mask};
use crate::writer::{write_calibration, CalibrationDocument};
use crate::Result;
use log::info;
use pdcal_algorithms::{calibrate_groups, CalibrationResult, CalibrationTable};
use std::fs;
use std::path::PathBuf;
use std::time::Instant;

/// Outcome of a completed run.
#[derive(Clone, Debug)]
pub struct RunReport {
    /// Written calibration file.
    pub output: PathBuf,
    /// Full pipeline output.
    pub result: CalibrationResult,
}

/// Runs one calibration: reads the inputs named by `config`, calibrates
/// every group and writes the result to [`CalibrationConfig::output_path`].
///
/// # Errors
/// Returns an error if an input cannot be read, the pipeline aborts or the
/// output cannot be written. Nothing is written on error.
pub fn run_from_config(config: &CalibrationConfig) -> Result<RunReport> {
    let start = Instant::now();

    let mut dataset = read_dataset_json(&config.data_file)?;
    info!(
        "loaded {} spectra from {}",
        dataset.len(),
        config.data_file.display()
    );

    let grouping = read_grouping(&config.groups)?;
    info!(
        "loaded {} groups from {}",
        grouping.group_ids().len(),
        config.groups.display()
    );

    let previous = match &config.previous_calibration {
        Some(path) => {
            let table = read_calibration(path)?;
            info!("loaded {} calibration rows from {}", table.len(), path.display());
            table
        }
        None => CalibrationTable::new(),
    };

    if let Some(path) = &config.mask {
        let mask = read_mask(path)?;
        let masked = dataset.apply_mask(&mask);
        info!("masked {masked} spectra from {}", path.display());
    }

    let result = calibrate_groups(&dataset, &grouping, &previous, &config.params)?;

    fs::create_dir_all(&config.output_directory)?;
    let output = config.output_path();
    let document = CalibrationDocument::new(&config.calibrant, &result, &dataset);
    write_calibration(&output, config.output_format, &document)?;

    info!(
        "calibration of '{}' finished in {:.2?}",
        config.calibrant,
        start.elapsed()
    );
    Ok(RunReport { output, result })
}
