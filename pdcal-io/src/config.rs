//! JSON configuration of a calibration run.

use crate::{Error, Result};
use pdcal_algorithms::{
    CalibrationParameters, CalibrationParams, PeakCalibrationParams, PeakShape, PerGroup,
    DIAMOND_PEAKS,
};
use pdcal_core::BinningParams;
use serde::Deserialize;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

/// Persisted format of the final calibration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// `detid,difc,difa,tzero,group,use` text table.
    #[default]
    Csv,
    /// JSON document with calibration rows and mask.
    Json,
    /// HDF5 diffcal layout (needs the `hdf5` feature).
    H5,
}

impl OutputFormat {
    /// File extension.
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Json => "json",
            Self::H5 => "h5",
        }
    }
}

/// A fully validated run configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct CalibrationConfig {
    /// Calibrant run identifier.
    pub calibrant: String,
    /// Histogram dataset.
    pub data_file: PathBuf,
    /// Grouping file.
    pub groups: PathBuf,
    /// Directory receiving the output.
    pub output_directory: PathBuf,
    /// Output format.
    pub output_format: OutputFormat,
    /// Seed calibration.
    pub previous_calibration: Option<PathBuf>,
    /// Detectors masked before calibration.
    pub mask: Option<PathBuf>,
    /// Numeric parameters of the stages.
    pub params: CalibrationParams,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ScalarOrList {
    Scalar(f64),
    List(Vec<f64>),
}

impl From<ScalarOrList> for PerGroup<f64> {
    fn from(value: ScalarOrList) -> Self {
        match value {
            ScalarOrList::Scalar(v) => Self::All(v),
            ScalarOrList::List(v) => Self::Each(v),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
struct JsonConfig {
    calibrant: Option<String>,
    data_file: Option<PathBuf>,
    groups: Option<PathBuf>,
    output_directory: Option<PathBuf>,
    #[serde(default)]
    output_format: OutputFormat,
    previous_calibration: Option<PathBuf>,
    mask: Option<PathBuf>,
    step: Option<ScalarOrList>,
    d_reference: Option<ScalarOrList>,
    xmin: Option<ScalarOrList>,
    xmax: Option<ScalarOrList>,
    #[serde(rename = "MaxDSpaceShift")]
    max_dspace_shift: Option<ScalarOrList>,
    offset_threshold: Option<f64>,
    max_cycles: Option<usize>,
    smooth_n_points: Option<usize>,
    #[serde(default)]
    skip_cross_correlation: Vec<i32>,
    peak_positions: Option<Vec<f64>>,
    tof_binning: Option<Vec<f64>>,
    peak_function: Option<String>,
    peak_window: Option<f64>,
    peak_width_percent: Option<f64>,
    calibration_parameters: Option<String>,
    bad_calib_threshold: Option<f64>,
}

impl CalibrationConfig {
    /// Loads a configuration file. Relative paths in it are taken relative
    /// to the file's directory.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, is not valid JSON, lacks
    /// a required key or holds invalid values.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let json_config: JsonConfig = serde_json::from_reader(reader)?;
        let mut config = Self::from_json_config(json_config)?;
        if let Some(base) = path.parent() {
            config.resolve_relative_to(base);
        }
        Ok(config)
    }

    /// Parses a configuration from a JSON string.
    ///
    /// # Errors
    /// See [`CalibrationConfig::from_file`].
    pub fn from_json(json: &str) -> Result<Self> {
        let json_config: JsonConfig = serde_json::from_str(json)?;
        Self::from_json_config(json_config)
    }

    /// Path of the output file.
    #[must_use]
    pub fn output_path(&self) -> PathBuf {
        self.output_directory.join(format!(
            "{}_cal.{}",
            self.calibrant,
            self.output_format.extension()
        ))
    }

    fn resolve_relative_to(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        resolve(&mut self.data_file);
        resolve(&mut self.groups);
        resolve(&mut self.output_directory);
        if let Some(p) = self.previous_calibration.as_mut() {
            resolve(p);
        }
        if let Some(p) = self.mask.as_mut() {
            resolve(p);
        }
    }

    fn from_json_config(config: JsonConfig) -> Result<Self> {
        let calibrant = config.calibrant.ok_or(Error::MissingKey("Calibrant"))?;
        let data_file = config.data_file.ok_or(Error::MissingKey("DataFile"))?;
        let groups = config.groups.ok_or(Error::MissingKey("Groups"))?;
        if calibrant.trim().is_empty() {
            return Err(Error::InvalidFormat("Calibrant must not be empty".into()));
        }

        let mut params = CalibrationParams::default();
        if let Some(v) = config.step {
            params.step = v.into();
        }
        if let Some(v) = config.d_reference {
            params.d_reference = v.into();
        }
        if let Some(v) = config.xmin {
            params.xmin = v.into();
        }
        if let Some(v) = config.xmax {
            params.xmax = v.into();
        }
        if let Some(v) = config.max_dspace_shift {
            params.max_dspace_shift = match v {
                ScalarOrList::Scalar(v) => PerGroup::All(Some(v)),
                ScalarOrList::List(v) => PerGroup::Each(v.into_iter().map(Some).collect()),
            };
        }
        if let Some(v) = config.offset_threshold {
            if v.is_nan() || v <= 0.0 {
                return Err(Error::InvalidFormat(format!(
                    "OffsetThreshold must be positive, got {v}"
                )));
            }
            params.offset_threshold = v;
        }
        if let Some(v) = config.max_cycles {
            if v == 0 {
                return Err(Error::InvalidFormat("MaxCycles must be at least 1".into()));
            }
            params.max_cycles = v;
        }
        params.smooth_points = config.smooth_n_points.unwrap_or(0);
        params.skip_cross_correlation = config.skip_cross_correlation;
        if let Some(binning) = config.tof_binning {
            BinningParams::parse(&binning)?;
            params.tof_binning = binning;
        }
        if let Some(name) = config.peak_function {
            params.peak_function = name.parse::<PeakShape>()?;
        }

        params.peaks = PeakCalibrationParams {
            peak_positions: config
                .peak_positions
                .unwrap_or_else(|| DIAMOND_PEAKS.to_vec()),
            peak_window: config.peak_window,
            peak_width_percent: config.peak_width_percent,
            bad_calib_threshold: config.bad_calib_threshold,
            parameters: match config.calibration_parameters {
                Some(name) => name.parse::<CalibrationParameters>()?,
                None => CalibrationParameters::default(),
            },
        };
        params.peaks.validate()?;

        Ok(Self {
            calibrant,
            data_file,
            groups,
            output_directory: config.output_directory.unwrap_or_else(|| PathBuf::from(".")),
            output_format: config.output_format,
            previous_calibration: config.previous_calibration,
            mask: config.mask,
            params,
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp)]
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let json = r#"{ "Calibrant": "58810", "DataFile": "data.json", "Groups": "groups.csv" }"#;
        let config = CalibrationConfig::from_json(json).unwrap();

        assert_eq!(config.calibrant, "58810");
        assert_eq!(config.output_format, OutputFormat::Csv);
        assert_eq!(config.output_directory, PathBuf::from("."));
        assert_eq!(config.params, CalibrationParams::default());
        assert_eq!(config.output_path(), PathBuf::from("./58810_cal.csv"));
    }

    #[test]
    fn test_full_config() {
        let json = r#"{
            "Calibrant": "SNAP_1",
            "DataFile": "/data/run.json",
            "Groups": "/data/groups.json",
            "OutputDirectory": "/tmp/out",
            "OutputFormat": "json",
            "PreviousCalibration": "/data/prev.csv",
            "Mask": "/data/mask.txt",
            "Step": [0.001, 0.002],
            "DReference": 1.2615,
            "Xmin": 1.2,
            "Xmax": [1.3, 1.32],
            "MaxDSpaceShift": 0.01,
            "OffsetThreshold": 0.5,
            "MaxCycles": 5,
            "SmoothNPoints": 3,
            "SkipCrossCorrelation": [2],
            "PeakPositions": [1.0758, 1.2615],
            "TofBinning": [1000, 2, 20000],
            "PeakFunction": "Lorentzian",
            "PeakWindow": 0.05,
            "PeakWidthPercent": 0.5,
            "CalibrationParameters": "DIFC+TZERO",
            "BadCalibThreshold": 5
        }"#;
        let config = CalibrationConfig::from_json(json).unwrap();
        let params = &config.params;

        assert_eq!(config.output_format, OutputFormat::Json);
        assert_eq!(config.mask, Some(PathBuf::from("/data/mask.txt")));
        assert_eq!(params.step, PerGroup::Each(vec![0.001, 0.002]));
        assert_eq!(params.xmin, PerGroup::All(1.2));
        assert_eq!(params.max_dspace_shift, PerGroup::All(Some(0.01)));
        assert_eq!(params.max_cycles, 5);
        assert_eq!(params.smooth_points, 3);
        assert_eq!(params.skip_cross_correlation, vec![2]);
        assert_eq!(params.tof_binning, vec![1000.0, 2.0, 20000.0]);
        assert_eq!(params.peak_function, PeakShape::Lorentzian);
        assert_eq!(params.peaks.peak_window, Some(0.05));
        assert_eq!(params.peaks.parameters, CalibrationParameters::DifcTzero);
        assert_eq!(params.peaks.bad_calib_threshold, Some(5.0));
        assert_eq!(config.output_path(), PathBuf::from("/tmp/out/SNAP_1_cal.json"));
    }

    #[test]
    fn test_missing_required_key() {
        let err = CalibrationConfig::from_json(r#"{ "Calibrant": "1", "DataFile": "d.json" }"#)
            .unwrap_err();
        assert!(matches!(err, Error::MissingKey("Groups")));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let json = r#"{ "Calibrant": "1", "DataFile": "d", "Groups": "g", "Stepp": 0.1 }"#;
        assert!(matches!(
            CalibrationConfig::from_json(json),
            Err(Error::Json(_))
        ));
    }

    #[test]
    fn test_invalid_values() {
        let base = r#""Calibrant": "1", "DataFile": "d", "Groups": "g""#;
        for extra in [
            r#""PeakFunction": "Voigt""#,
            r#""CalibrationParameters": "TZERO""#,
            r#""TofBinning": [100, 0, 200]"#,
            r#""PeakPositions": []"#,
            r#""OutputFormat": "xml""#,
            r#""MaxCycles": 0"#,
        ] {
            let json = format!("{{ {base}, {extra} }}");
            assert!(CalibrationConfig::from_json(&json).is_err(), "{extra}");
        }
    }

    #[test]
    fn test_from_file_resolves_relative_paths() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "Calibrant": "7", "DataFile": "data.json", "Groups": "/abs/groups.csv" }}"#
        )
        .unwrap();
        let config = CalibrationConfig::from_file(file.path()).unwrap();
        let dir = file.path().parent().unwrap();

        assert_eq!(config.data_file, dir.join("data.json"));
        assert_eq!(config.groups, PathBuf::from("/abs/groups.csv"));
        assert_eq!(config.output_directory, dir.join("."));
    }

    #[test]
    fn test_from_file_malformed_json() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(matches!(
            CalibrationConfig::from_file(file.path()),
            Err(Error::Json(_))
        ));
    }
}
