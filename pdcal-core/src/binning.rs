//! Rebinning parameters in `x0, dx1, x1, dx2, x2, ...` form.
//!
//! A positive step is a constant bin width; a negative step is logarithmic,
//! each bin being `|dx|` times wider than the lower edge it starts at.

use crate::error::{Error, Result};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Upper bound on generated edges, guards against tiny steps.
const MAX_EDGES: usize = 50_000_000;

/// Bin boundaries and steps.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BinningParams {
    boundaries: Vec<f64>,
    steps: Vec<f64>,
}

impl BinningParams {
    /// Parses `[x0, dx1, x1, ...]`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidBinning`] for an even-length list, zero steps,
    /// decreasing boundaries, or a logarithmic range touching zero.
    pub fn parse(params: &[f64]) -> Result<Self> {
        if params.len() < 3 || params.len() % 2 == 0 {
            return Err(Error::InvalidBinning(format!(
                "expected x0, dx, x1[, dx, x2...], got {} values",
                params.len()
            )));
        }
        let boundaries: Vec<f64> = params.iter().step_by(2).copied().collect();
        let steps: Vec<f64> = params.iter().skip(1).step_by(2).copied().collect();

        for (i, &step) in steps.iter().enumerate() {
            let (lo, hi) = (boundaries[i], boundaries[i + 1]);
            if !(lo.is_finite() && hi.is_finite() && step.is_finite()) {
                return Err(Error::InvalidBinning("non-finite value".into()));
            }
            if hi <= lo {
                return Err(Error::InvalidBinning(format!(
                    "boundary {hi} is not above {lo}"
                )));
            }
            if step == 0.0 {
                return Err(Error::InvalidBinning("step must be non-zero".into()));
            }
            if step < 0.0 && lo <= 0.0 {
                return Err(Error::InvalidBinning(format!(
                    "logarithmic binning needs a positive start, got {lo}"
                )));
            }
        }
        Ok(Self { boundaries, steps })
    }

    /// Constant-width binning from `min` to `max`.
    ///
    /// # Errors
    /// See [`BinningParams::parse`].
    pub fn linear(min: f64, step: f64, max: f64) -> Result<Self> {
        Self::parse(&[min, step.abs(), max])
    }

    /// Lowest edge.
    #[must_use]
    pub fn min(&self) -> f64 {
        self.boundaries[0]
    }

    /// Highest edge.
    #[must_use]
    pub fn max(&self) -> f64 {
        self.boundaries[self.boundaries.len() - 1]
    }

    /// Generates the bin edges. A trailing partial bin narrower than a
    /// quarter step is merged into its neighbour.
    ///
    /// # Errors
    /// Returns [`Error::InvalidBinning`] if more than `MAX_EDGES` edges would
    /// be produced.
    pub fn edges(&self) -> Result<Vec<f64>> {
        let mut edges = vec![self.boundaries[0]];
        for (i, &step) in self.steps.iter().enumerate() {
            let hi = self.boundaries[i + 1];
            let mut x = self.boundaries[i];
            loop {
                let width = if step > 0.0 { step } else { x * -step };
                let next = x + width;
                if next >= hi || hi - next < 0.25 * width {
                    break;
                }
                edges.push(next);
                x = next;
                if edges.len() > MAX_EDGES {
                    return Err(Error::InvalidBinning(format!(
                        "more than {MAX_EDGES} bin edges requested"
                    )));
                }
            }
            edges.push(hi);
        }
        Ok(edges)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_linear_edges() {
        let edges = BinningParams::linear(1.22, 0.001, 1.30).unwrap().edges().unwrap();
        assert_eq!(edges.len(), 81);
        assert_relative_eq!(edges[0], 1.22);
        assert_relative_eq!(edges[80], 1.30);
        for w in edges.windows(2) {
            assert_relative_eq!(w[1] - w[0], 0.001, max_relative = 1e-6);
        }
    }

    #[test]
    fn test_log_edges() {
        let edges = BinningParams::parse(&[1000.0, -0.01, 2000.0])
            .unwrap()
            .edges()
            .unwrap();
        assert_relative_eq!(edges[1], 1010.0);
        assert_relative_eq!(edges[2], 1020.1);
        assert_relative_eq!(*edges.last().unwrap(), 2000.0);
        assert!(edges.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn test_partial_last_bin_merged() {
        let edges = BinningParams::parse(&[0.0, 1.0, 3.1]).unwrap().edges().unwrap();
        assert_eq!(edges, vec![0.0, 1.0, 2.0, 3.1]);
    }

    #[test]
    fn test_invalid_params() {
        assert!(BinningParams::parse(&[0.0, 1.0]).is_err());
        assert!(BinningParams::parse(&[1.0, 0.0, 2.0]).is_err());
        assert!(BinningParams::parse(&[2.0, 0.1, 1.0]).is_err());
        assert!(BinningParams::parse(&[0.0, -0.1, 1.0]).is_err());
    }
}
