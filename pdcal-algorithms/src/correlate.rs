//! Cross-correlation of spectra on a common grid and peak-lag extraction.
#![allow(
    clippy::cast_possible_wrap,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    clippy::cast_possible_truncation
)]

/// Computes a correlation function between two equally binned spectra.
pub trait CrossCorrelator: Send + Sync {
    /// Correlation of `signal` against `reference` for lags
    /// `-max_lag..=max_lag` (in bins). Element `k + max_lag` holds lag `k`;
    /// a positive lag means `signal` sits to the right of `reference`.
    fn correlate(&self, reference: &[f64], signal: &[f64], max_lag: usize) -> Vec<f64>;

    /// Returns the name of the correlator.
    fn name(&self) -> &'static str;
}

/// Mean-subtracted correlation normalised by the product of the two
/// spectra's norms, so a perfect match scores 1 at its lag.
#[derive(Debug, Clone, Copy, Default)]
pub struct NormalizedCrossCorrelator;

impl CrossCorrelator for NormalizedCrossCorrelator {
    fn correlate(&self, reference: &[f64], signal: &[f64], max_lag: usize) -> Vec<f64> {
        let n = reference.len().min(signal.len());
        if n == 0 {
            return vec![0.0; 2 * max_lag + 1];
        }
        let max_lag = max_lag.min(n - 1);

        let centred = |values: &[f64]| -> Vec<f64> {
            let mean = values[..n].iter().sum::<f64>() / n as f64;
            values[..n].iter().map(|v| v - mean).collect()
        };
        let r = centred(reference);
        let s = centred(signal);
        let norm = (r.iter().map(|v| v * v).sum::<f64>() * s.iter().map(|v| v * v).sum::<f64>())
            .sqrt();

        (-(max_lag as isize)..=max_lag as isize)
            .map(|lag| {
                if norm == 0.0 {
                    return 0.0;
                }
                let sum: f64 = (0..n as isize)
                    .filter_map(|i| {
                        let j = i + lag;
                        (j >= 0 && j < n as isize).then(|| r[i as usize] * s[j as usize])
                    })
                    .sum();
                sum / norm
            })
            .collect()
    }

    fn name(&self) -> &'static str {
        "NormalizedCrossCorrelation"
    }
}

/// Locates the correlation maximum with sub-bin precision.
///
/// Returns the lag in bins, or `None` when the correlation is flat or not
/// positive at its maximum, or the maximum sits on the edge of the lag range
/// (the true shift may lie beyond it).
#[must_use]
pub fn peak_lag(correlation: &[f64]) -> Option<f64> {
    if correlation.len() < 3 {
        return None;
    }
    let (best, &peak) = correlation
        .iter()
        .enumerate()
        .filter(|(_, v)| v.is_finite())
        .max_by(|a, b| a.1.total_cmp(b.1))?;
    if peak <= 0.0 || best == 0 || best == correlation.len() - 1 {
        return None;
    }

    let (y0, y1, y2) = (correlation[best - 1], peak, correlation[best + 1]);
    let curvature = y0 - 2.0 * y1 + y2;
    let delta = if curvature.abs() > 1e-12 {
        (0.5 * (y0 - y2) / curvature).clamp(-0.5, 0.5)
    } else {
        0.0
    };

    let max_lag = (correlation.len() / 2) as f64;
    Some(best as f64 - max_lag + delta)
}
