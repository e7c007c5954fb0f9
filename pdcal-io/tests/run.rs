#![allow(clippy::float_cmp, clippy::cast_precision_loss)]
use approx::assert_relative_eq;
use pdcal_io::{read_calibration, run_from_config, CalibrationConfig, Error};
use serde_json::json;
use std::fs;
use std::path::Path;

const DIFC: f64 = 10_000.0;
const PEAK_D: f64 = 1.2615;

fn spectrum_json(spectrum: i32, shift: f64, height: f64) -> serde_json::Value {
    let edges: Vec<f64> = (0..=600).map(|i| 11_000.0 + 5.0 * f64::from(i)).collect();
    let centre = DIFC * PEAK_D * (1.0 + shift);
    let sigma = DIFC * 0.0035;
    let counts: Vec<f64> = edges
        .windows(2)
        .map(|w| {
            let x = 0.5 * (w[0] + w[1]);
            0.5 + height * (-0.5 * ((x - centre) / sigma).powi(2)).exp() * (w[1] - w[0])
        })
        .collect();
    json!({ "spectrum": spectrum, "detector": 100 + spectrum, "edges": edges, "counts": counts })
}

/// Writes a four-pixel run: spectra 1-2 in group 1, 3-4 in group 2, with
/// group 1 shifted by 0.1 %.
fn write_inputs(dir: &Path, output_format: &str) {
    let spectra: Vec<_> = [(1, 0.001), (2, 0.001), (3, 0.0), (4, 0.0)]
        .iter()
        .map(|&(s, shift)| spectrum_json(s, shift, 100.0 + f64::from(s)))
        .collect();
    fs::write(dir.join("run.json"), json!({ "spectra": spectra }).to_string()).unwrap();
    fs::write(dir.join("groups.csv"), "spectrum,group\n1,1\n2,1\n3,2\n4,2\n").unwrap();
    fs::write(
        dir.join("previous.csv"),
        "detid,difc,difa,tzero\n101,10000,0,0\n102,10000,0,0\n103,10000,0,0\n104,10000,0,0\n",
    )
    .unwrap();
    fs::write(dir.join("mask.txt"), "# dead tube\n104\n").unwrap();

    let config = json!({
        "Calibrant": "diamond_1",
        "DataFile": "run.json",
        "Groups": "groups.csv",
        "PreviousCalibration": "previous.csv",
        "Mask": "mask.txt",
        "OutputDirectory": "out",
        "OutputFormat": output_format,
        "OffsetThreshold": 1e-4,
        "TofBinning": [11000.0, 5.0, 14000.0],
        "PeakPositions": [PEAK_D],
        "PeakWindow": 0.1
    });
    fs::write(dir.join("config.json"), config.to_string()).unwrap();
}

#[test]
fn test_run_writes_csv_calibration() {
    let dir = tempfile::tempdir().unwrap();
    write_inputs(dir.path(), "csv");
    let config = CalibrationConfig::from_file(dir.path().join("config.json")).unwrap();

    let report = run_from_config(&config).unwrap();
    assert_eq!(report.output, dir.path().join("out").join("diamond_1_cal.csv"));
    assert_eq!(report.result.summary.groups, 2);
    assert!(report.result.mask.contains(104));

    let text = fs::read_to_string(&report.output).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines[0], "detid,difc,difa,tzero,group,use");
    assert_eq!(lines.len(), 5);
    assert!(lines[4].starts_with("104,"));
    assert!(lines[4].ends_with(",2,0"));

    let table = read_calibration(&report.output).unwrap();
    let ratio = table.get(101).unwrap().difc / table.get(103).unwrap().difc;
    assert_relative_eq!(ratio, 1.001, max_relative = 1e-4);
}

#[test]
fn test_run_writes_json_document() {
    let dir = tempfile::tempdir().unwrap();
    write_inputs(dir.path(), "json");
    let config = CalibrationConfig::from_file(dir.path().join("config.json")).unwrap();

    let report = run_from_config(&config).unwrap();
    let value: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&report.output).unwrap()).unwrap();
    assert_eq!(value["calibrant"], "diamond_1");
    assert_eq!(value["calibration"].as_array().unwrap().len(), 4);
    assert_eq!(value["groups"].as_array().unwrap().len(), 2);
    assert!(value["mask"]
        .as_array()
        .unwrap()
        .contains(&serde_json::json!(104)));
}

#[test]
fn test_missing_input_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    write_inputs(dir.path(), "csv");
    fs::remove_file(dir.path().join("groups.csv")).unwrap();
    let config = CalibrationConfig::from_file(dir.path().join("config.json")).unwrap();

    let err = run_from_config(&config).unwrap_err();
    assert!(matches!(err, Error::Io(_)));
    assert!(!config.output_path().exists());
}
