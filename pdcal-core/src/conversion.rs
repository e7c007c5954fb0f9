//! Time-of-flight <-> d-spacing conversion.
//!
//! `TOF = DIFC * d + DIFA * d^2 + TZERO`. With `DIFA == 0` the inverse is
//! linear; otherwise the root continuous with the linear solution is taken,
//! written in the cancellation-free form
//! `d = 2 (TOF - TZERO) / (DIFC + sign(DIFC) * sqrt(DIFC^2 + 4 DIFA (TOF - TZERO)))`.

use crate::calibration::DiffCalEntry;
use crate::error::{Error, Result};

/// `2 m_n / h` expressed in microseconds per (metre * angstrom), halved:
/// DIFC = 252.816 * 2 sin(theta) * L.
pub const DIFC_CONSTANT: f64 = 252.816;

/// Converts one TOF value to d-spacing.
///
/// # Errors
/// [`Error::ZeroSlope`] when DIFC is zero, [`Error::NoRealRoot`] when the
/// quadratic relation has no real solution for this TOF.
pub fn tof_to_d(cal: &DiffCalEntry, tof: f64) -> Result<f64> {
    if cal.difc == 0.0 {
        return Err(Error::ZeroSlope {
            detector_id: cal.detector_id,
        });
    }
    let x = tof - cal.tzero;
    if cal.difa == 0.0 {
        return Ok(x / cal.difc);
    }
    let disc = cal.difc.mul_add(cal.difc, 4.0 * cal.difa * x);
    if disc < 0.0 {
        return Err(Error::NoRealRoot {
            detector_id: cal.detector_id,
            tof,
        });
    }
    let denom = cal.difc + disc.sqrt().copysign(cal.difc);
    Ok(2.0 * x / denom)
}

/// Converts one d-spacing value to TOF.
#[must_use]
pub fn d_to_tof(cal: &DiffCalEntry, d: f64) -> f64 {
    cal.difa.mul_add(d * d, cal.difc.mul_add(d, cal.tzero))
}

/// Converts a TOF bin-edge array to d-spacing.
///
/// # Errors
/// Propagates [`tof_to_d`] failures, and returns [`Error::InvalidBinning`]
/// if the converted edges are no longer strictly increasing.
pub fn edges_tof_to_d(cal: &DiffCalEntry, edges: &[f64]) -> Result<Vec<f64>> {
    let converted = edges
        .iter()
        .map(|&tof| tof_to_d(cal, tof))
        .collect::<Result<Vec<_>>>()?;
    if converted.windows(2).any(|w| w[1] <= w[0]) {
        return Err(Error::InvalidBinning(format!(
            "calibration of detector {} does not map TOF monotonically to d",
            cal.detector_id
        )));
    }
    Ok(converted)
}

/// Converts a d-spacing bin-edge array to TOF.
#[must_use]
pub fn edges_d_to_tof(cal: &DiffCalEntry, edges: &[f64]) -> Vec<f64> {
    edges.iter().map(|&d| d_to_tof(cal, d)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_linear_conversion() {
        let cal = DiffCalEntry::from_difc(1, 10_000.0);
        assert_relative_eq!(tof_to_d(&cal, 12_615.0).unwrap(), 1.2615);
        assert_relative_eq!(d_to_tof(&cal, 1.2615), 12_615.0);
    }

    #[test]
    fn test_quadratic_conversion_inverts() {
        for difa in [-5.0, 0.5, 12.0] {
            let cal = DiffCalEntry::new(1, 9_000.0, difa, 3.5);
            for d in [0.3, 1.0, 2.7] {
                let tof = d_to_tof(&cal, d);
                assert_relative_eq!(tof_to_d(&cal, tof).unwrap(), d, max_relative = 1e-12);
            }
        }
    }

    #[test]
    fn test_zero_slope_is_an_error() {
        let cal = DiffCalEntry::new(42, 0.0, 0.0, 0.0);
        let err = tof_to_d(&cal, 1000.0).unwrap_err();
        assert!(matches!(err, Error::ZeroSlope { detector_id: 42 }));
    }

    #[test]
    fn test_no_real_root() {
        let cal = DiffCalEntry::new(3, 100.0, -10.0, 0.0);
        // disc = 100^2 + 4 * (-10) * 1000 < 0
        assert!(matches!(
            tof_to_d(&cal, 1000.0),
            Err(Error::NoRealRoot { detector_id: 3, .. })
        ));
    }

    #[test]
    fn test_edges_round_trip() {
        let cal = DiffCalEntry::new(1, 12_000.0, 2.0, -4.0);
        let tof: Vec<f64> = (0..50).map(|i| 5_000.0 + 37.5 * f64::from(i)).collect();
        let d = edges_tof_to_d(&cal, &tof).unwrap();
        let back = edges_d_to_tof(&cal, &d);
        for (a, b) in tof.iter().zip(&back) {
            assert_relative_eq!(a, b, max_relative = 1e-12);
        }
    }
}
