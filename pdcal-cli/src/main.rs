//! pdcal CLI - Command-line interface for group-wise diffraction calibration.
//!
//! Runs a calibration described by a JSON configuration file and writes the
//! resulting diffcal table.
#![allow(clippy::uninlined_format_args)]

use clap::Parser;
use log::LevelFilter;
use pdcal_algorithms::CalibrationSummary;
use pdcal_io::{run_from_config, CalibrationConfig};
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;

/// Result type for CLI operations.
type Result<T> = std::result::Result<T, CliError>;

/// CLI error types.
#[derive(Error, Debug)]
enum CliError {
    #[error("I/O error: {0}")]
    PdcalIo(#[from] pdcal_io::Error),
}

/// Group-wise DIFC/DIFA/TZERO calibration of powder diffraction detectors.
#[derive(Parser)]
#[command(name = "pdcal")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON configuration file
    config: PathBuf,

    /// Validate the configuration and print the resolved settings without
    /// running
    #[arg(long)]
    check: bool,

    /// Log debug output (RUST_LOG overrides)
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp_millis()
        .init();
}

fn print_summary(summary: &CalibrationSummary) {
    println!("Groups: {}", summary.groups);
    println!("  aligned: {}", summary.aligned);
    println!("  too few spectra: {}", summary.too_few_spectra);
    println!("  missing from data: {}", summary.missing_from_data);
    println!("  not converged: {}", summary.not_converged);
    println!("  calibrated: {}", summary.calibrated);
    println!("  rejected: {}", summary.rejected);
    println!("Detectors:");
    println!("  cross-correlation failures: {}", summary.cc_failures);
    println!("  fallbacks: {}", summary.fallbacks);
    println!("  masked: {}", summary.masked);
}

fn print_settings(path: &Path, config: &CalibrationConfig) {
    let params = &config.params;
    println!("Config: {}", path.display());
    println!("Calibrant: {}", config.calibrant);
    println!("Data: {}", config.data_file.display());
    println!("Groups: {}", config.groups.display());
    if let Some(previous) = &config.previous_calibration {
        println!("Previous calibration: {}", previous.display());
    }
    if let Some(mask) = &config.mask {
        println!("Mask: {}", mask.display());
    }
    println!("Output: {}", config.output_path().display());
    println!(
        "Cross correlation: step {:?}, reference {:?}, window {:?}..{:?}",
        params.step, params.d_reference, params.xmin, params.xmax
    );
    println!(
        "  threshold {}, max cycles {}, smoothing {}",
        params.offset_threshold, params.max_cycles, params.smooth_points
    );
    if !params.skip_cross_correlation.is_empty() {
        println!("  skipped groups: {:?}", params.skip_cross_correlation);
    }
    println!(
        "Peak calibration: {} peaks, {:?} {:?}, TOF binning {:?}",
        params.peaks.peak_positions.len(),
        params.peak_function,
        params.peaks.parameters,
        params.tof_binning
    );
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = CalibrationConfig::from_file(&cli.config)?;
    if cli.check {
        print_settings(&cli.config, &config);
        return Ok(());
    }

    let start = Instant::now();
    let report = run_from_config(&config)?;
    print_summary(&report.result.summary);
    println!("Output: {}", report.output.display());
    println!("Time: {:.2?}", start.elapsed());
    Ok(())
}
