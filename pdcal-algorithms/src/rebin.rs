//! Histogram rebinning and smoothing.
#![allow(clippy::missing_errors_doc)]

use pdcal_core::{Error, Result};

/// Counts and uncertainties on a new set of bin edges.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Rebinned {
    /// Counts per output bin.
    pub counts: Vec<f64>,
    /// Uncertainty per output bin.
    pub errors: Vec<f64>,
}

impl Rebinned {
    /// Sum of counts.
    #[must_use]
    pub fn total(&self) -> f64 {
        self.counts.iter().sum()
    }
}

/// Moves histogram contents onto new bin edges.
pub trait Rebinner: Send + Sync {
    /// Rebins `counts`/`errors` defined on `edges` onto `target` edges.
    /// Both edge arrays must be strictly increasing.
    fn rebin(&self, edges: &[f64], counts: &[f64], errors: &[f64], target: &[f64])
        -> Result<Rebinned>;

    /// Returns the name of the rebinner.
    fn name(&self) -> &'static str;
}

/// Count-conserving rebinning that assumes counts are spread uniformly
/// within each input bin. Variances are shared in proportion to overlap.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearRebinner;

impl Rebinner for LinearRebinner {
    fn rebin(
        &self,
        edges: &[f64],
        counts: &[f64],
        errors: &[f64],
        target: &[f64],
    ) -> Result<Rebinned> {
        if edges.len() != counts.len() + 1 || errors.len() != counts.len() {
            return Err(Error::InvalidBinning(format!(
                "{} edges, {} counts, {} errors",
                edges.len(),
                counts.len(),
                errors.len()
            )));
        }
        if target.len() < 2 {
            return Err(Error::InvalidBinning(
                "target binning needs at least two edges".into(),
            ));
        }

        let n_out = target.len() - 1;
        let mut out = vec![0.0; n_out];
        let mut var = vec![0.0; n_out];

        let (mut i, mut j) = (0, 0);
        while i < counts.len() && j < n_out {
            let (lo_in, hi_in) = (edges[i], edges[i + 1]);
            let (lo_out, hi_out) = (target[j], target[j + 1]);
            let lo = lo_in.max(lo_out);
            let hi = hi_in.min(hi_out);
            if hi > lo {
                let frac = (hi - lo) / (hi_in - lo_in);
                out[j] += counts[i] * frac;
                var[j] += errors[i] * errors[i] * frac;
            }
            if hi_in <= hi_out {
                i += 1;
            } else {
                j += 1;
            }
        }

        Ok(Rebinned {
            counts: out,
            errors: var.into_iter().map(f64::sqrt).collect(),
        })
    }

    fn name(&self) -> &'static str {
        "Linear"
    }
}

/// Moving-average smoothing over `n_points` bins (an even count is bumped to
/// the next odd one). The window shrinks at the ends of the spectrum.
#[must_use]
pub fn smooth(values: &[f64], n_points: usize) -> Vec<f64> {
    if n_points < 2 || values.is_empty() {
        return values.to_vec();
    }
    let half = n_points / 2;
    (0..values.len())
        .map(|i| {
            let lo = i.saturating_sub(half);
            let hi = (i + half + 1).min(values.len());
            let window = &values[lo..hi];
            #[allow(clippy::cast_precision_loss)]
            let n = window.len() as f64;
            window.iter().sum::<f64>() / n
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_rebin_conserves_counts() {
        let edges = [0.0, 1.0, 2.0, 3.0, 4.0];
        let counts = [4.0, 8.0, 2.0, 6.0];
        let errors = [2.0, 2.0, 1.0, 1.0];
        let target = [0.5, 2.0, 3.5];

        let rebinned = LinearRebinner.rebin(&edges, &counts, &errors, &target).unwrap();
        assert_relative_eq!(rebinned.counts[0], 2.0 + 8.0);
        assert_relative_eq!(rebinned.counts[1], 2.0 + 3.0);
        // variance: 4*0.5 + 4*1 = 6
        assert_relative_eq!(rebinned.errors[0], 6.0_f64.sqrt());
    }

    #[test]
    fn test_rebin_partial_coverage() {
        let edges = [1.0, 2.0];
        let target = [0.0, 1.5, 3.0, 4.0];
        let rebinned = LinearRebinner
            .rebin(&edges, &[10.0], &[1.0], &target)
            .unwrap();
        assert_eq!(rebinned.counts, vec![5.0, 5.0, 0.0]);
        assert_relative_eq!(rebinned.total(), 10.0);
    }

    #[test]
    fn test_rebin_shape_errors() {
        assert!(LinearRebinner.rebin(&[0.0, 1.0], &[1.0, 2.0], &[1.0, 1.0], &[0.0, 1.0]).is_err());
        assert!(LinearRebinner.rebin(&[0.0, 1.0], &[1.0], &[1.0], &[0.0]).is_err());
    }

    #[test]
    fn test_smooth() {
        let values = [0.0, 3.0, 0.0, 3.0, 0.0];
        let smoothed = smooth(&values, 3);
        assert_relative_eq!(smoothed[0], 1.5);
        assert_relative_eq!(smoothed[2], 2.0);
        assert_eq!(smooth(&values, 1), values.to_vec());
        // even point counts behave like the next odd one
        assert_eq!(smooth(&values, 2), smooth(&values, 3));
    }
}
