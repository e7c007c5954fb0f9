//! Single-peak fitting on a flat background.
//!
//! Parameters are `[height, centre, width, background]`. For a Gaussian the
//! width is sigma, for a Lorentzian it is the half width at half maximum.
#![allow(
    clippy::many_single_char_names,
    clippy::missing_errors_doc,
    clippy::cast_precision_loss
)]

use nalgebra::{Matrix4, Vector4};
use pdcal_core::{Error, Result};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// FWHM of a unit-sigma Gaussian.
pub const GAUSSIAN_FWHM: f64 = 2.354_820_045_030_949_3;

/// Peak profile.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PeakShape {
    /// Gaussian; width is sigma.
    #[default]
    Gaussian,
    /// Lorentzian; width is the half width at half maximum.
    Lorentzian,
}

impl PeakShape {
    /// Converts a FWHM to this shape's width parameter.
    #[must_use]
    pub fn width_from_fwhm(self, fwhm: f64) -> f64 {
        match self {
            Self::Gaussian => fwhm / GAUSSIAN_FWHM,
            Self::Lorentzian => 0.5 * fwhm,
        }
    }

    /// Model value and its gradient with respect to the parameters.
    fn eval(self, x: f64, p: &Vector4<f64>) -> (f64, Vector4<f64>) {
        let (h, c, w, b) = (p[0], p[1], p[2], p[3]);
        let u = (x - c) / w;
        match self {
            Self::Gaussian => {
                let g = (-0.5 * u * u).exp();
                let value = h * g + b;
                (value, Vector4::new(g, h * g * u / w, h * g * u * u / w, 1.0))
            }
            Self::Lorentzian => {
                let q = 1.0 / (1.0 + u * u);
                let value = h * q + b;
                let dq = 2.0 * h * q * q;
                (value, Vector4::new(q, dq * u / w, dq * u * u / w, 1.0))
            }
        }
    }
}

impl std::str::FromStr for PeakShape {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "gaussian" => Ok(Self::Gaussian),
            "lorentzian" => Ok(Self::Lorentzian),
            other => Err(Error::ConfigError(format!("unknown peak function '{other}'"))),
        }
    }
}

/// Starting point for a fit.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PeakGuess {
    /// Height above background.
    pub height: f64,
    /// Peak position.
    pub centre: f64,
    /// Shape width parameter.
    pub width: f64,
    /// Flat background level.
    pub background: f64,
}

impl PeakGuess {
    /// Estimates a starting point from data: background from the lowest
    /// value, centre at the maximum, width from the second moment above
    /// background (or from `fwhm` when given).
    #[must_use]
    pub fn estimate(shape: PeakShape, x: &[f64], y: &[f64], fwhm: Option<f64>) -> Option<Self> {
        let (imax, _) = y.iter().enumerate().max_by(|a, b| a.1.total_cmp(b.1))?;
        Self::at_index(shape, x, y, fwhm, imax)
    }

    /// Like [`PeakGuess::estimate`], but centred on the interior local
    /// maximum nearest `seed`. Maxima lower than a fifth of the tallest
    /// one above background are ignored.
    #[must_use]
    pub fn estimate_near(
        shape: PeakShape,
        x: &[f64],
        y: &[f64],
        fwhm: Option<f64>,
        seed: f64,
    ) -> Option<Self> {
        let background = y.iter().copied().fold(f64::INFINITY, f64::min);
        let ymax = y.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let floor = background + 0.2 * (ymax - background);
        let imax = (1..y.len().saturating_sub(1))
            .filter(|&i| y[i] > floor && y[i] >= y[i - 1] && y[i] >= y[i + 1])
            .min_by(|&a, &b| (x[a] - seed).abs().total_cmp(&(x[b] - seed).abs()))?;
        Self::at_index(shape, x, y, fwhm, imax)
    }

    fn at_index(
        shape: PeakShape,
        x: &[f64],
        y: &[f64],
        fwhm: Option<f64>,
        imax: usize,
    ) -> Option<Self> {
        let background = y.iter().copied().fold(f64::INFINITY, f64::min);
        let height = y[imax] - background;
        if !height.is_finite() || height <= 0.0 {
            return None;
        }
        let centre = x[imax];

        let width = match fwhm {
            Some(fwhm) => shape.width_from_fwhm(fwhm),
            None => {
                let (mut sum, mut sum_sq) = (0.0, 0.0);
                for (&xi, &yi) in x.iter().zip(y) {
                    let weight = yi - background;
                    sum += weight;
                    sum_sq += weight * (xi - centre) * (xi - centre);
                }
                let sigma = (sum_sq / sum).sqrt();
                let span = x[x.len() - 1] - x[0];
                let sigma = sigma.clamp(span / x.len() as f64, 0.5 * span);
                shape.width_from_fwhm(sigma * GAUSSIAN_FWHM)
            }
        };

        Some(Self {
            height,
            centre,
            width,
            background,
        })
    }
}

/// Result of a peak fit.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FittedPeak {
    /// Height above background.
    pub height: f64,
    /// Peak position.
    pub centre: f64,
    /// Shape width parameter.
    pub width: f64,
    /// Flat background level.
    pub background: f64,
    /// Reduced chi-squared at the solution.
    pub chi2: f64,
    /// Iterations run.
    pub iterations: usize,
}

/// Fits one peak to `(x, y)` data with uncertainties `sigma`.
pub trait PeakFitter: Send + Sync {
    /// Fits the peak. A zero or non-finite uncertainty gives that point unit
    /// weight.
    fn fit(&self, x: &[f64], y: &[f64], sigma: &[f64], guess: PeakGuess) -> Result<FittedPeak>;

    /// Profile used by this fitter.
    fn shape(&self) -> PeakShape;

    /// Returns the name of the fitter.
    fn name(&self) -> &'static str;
}

/// Levenberg-Marquardt least squares with an analytic Jacobian.
#[derive(Clone, Debug)]
pub struct LevenbergMarquardtFitter {
    shape: PeakShape,
    max_iterations: usize,
    tolerance: f64,
}

impl Default for LevenbergMarquardtFitter {
    fn default() -> Self {
        Self::new(PeakShape::Gaussian)
    }
}

impl LevenbergMarquardtFitter {
    /// Creates a fitter for the given profile.
    #[must_use]
    pub fn new(shape: PeakShape) -> Self {
        Self {
            shape,
            max_iterations: 200,
            tolerance: 1e-10,
        }
    }

    /// Sets the iteration limit.
    #[must_use]
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    fn chi2(&self, x: &[f64], y: &[f64], w: &[f64], p: &Vector4<f64>) -> f64 {
        x.iter()
            .zip(y)
            .zip(w)
            .map(|((&xi, &yi), &wi)| {
                let r = yi - self.shape.eval(xi, p).0;
                wi * r * r
            })
            .sum()
    }
}

impl PeakFitter for LevenbergMarquardtFitter {
    fn fit(&self, x: &[f64], y: &[f64], sigma: &[f64], guess: PeakGuess) -> Result<FittedPeak> {
        if x.len() != y.len() || x.len() != sigma.len() {
            return Err(Error::FitFailed("x, y and sigma lengths differ".into()));
        }
        if x.len() <= 4 {
            return Err(Error::FitFailed(format!(
                "{} points cannot constrain 4 parameters",
                x.len()
            )));
        }
        let weights: Vec<f64> = sigma
            .iter()
            .map(|&s| if s.is_finite() && s > 0.0 { 1.0 / (s * s) } else { 1.0 })
            .collect();

        let mut p = Vector4::new(guess.height, guess.centre, guess.width, guess.background);
        let mut chi2 = self.chi2(x, y, &weights, &p);
        let mut lambda = 1e-3;

        for iteration in 1..=self.max_iterations {
            let mut jtj = Matrix4::<f64>::zeros();
            let mut jtr = Vector4::<f64>::zeros();
            for ((&xi, &yi), &wi) in x.iter().zip(y).zip(&weights) {
                let (value, grad) = self.shape.eval(xi, &p);
                jtj += grad * grad.transpose() * wi;
                jtr += grad * ((yi - value) * wi);
            }

            let mut damped = jtj;
            for k in 0..4 {
                damped[(k, k)] += lambda * jtj[(k, k)].max(1e-12);
            }
            let Some(step) = damped.lu().solve(&jtr) else {
                lambda *= 10.0;
                continue;
            };

            let trial = p + step;
            let trial_chi2 = if trial[2] > 0.0 {
                self.chi2(x, y, &weights, &trial)
            } else {
                f64::INFINITY
            };

            if trial_chi2.is_finite() && trial_chi2 <= chi2 {
                let improvement = chi2 - trial_chi2;
                p = trial;
                chi2 = trial_chi2;
                lambda = (lambda * 0.1).max(1e-12);
                if improvement <= self.tolerance * chi2.max(self.tolerance) {
                    return Ok(self.finish(&p, chi2, x.len(), iteration));
                }
            } else {
                lambda *= 10.0;
                if lambda > 1e12 {
                    // No downhill direction left: already at the minimum.
                    return Ok(self.finish(&p, chi2, x.len(), iteration));
                }
            }
        }

        Err(Error::FitFailed(format!(
            "no convergence after {} iterations",
            self.max_iterations
        )))
    }

    fn shape(&self) -> PeakShape {
        self.shape
    }

    fn name(&self) -> &'static str {
        "LevenbergMarquardt"
    }
}

impl LevenbergMarquardtFitter {
    #[allow(clippy::unused_self)]
    fn finish(&self, p: &Vector4<f64>, chi2: f64, n: usize, iterations: usize) -> FittedPeak {
        FittedPeak {
            height: p[0],
            centre: p[1],
            width: p[2],
            background: p[3],
            chi2: chi2 / (n - 4) as f64,
            iterations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample(shape: PeakShape, truth: &Vector4<f64>) -> (Vec<f64>, Vec<f64>) {
        let x: Vec<f64> = (0..121).map(|i| 12_000.0 + 5.0 * f64::from(i)).collect();
        let y = x.iter().map(|&xi| shape.eval(xi, truth).0).collect();
        (x, y)
    }

    #[test]
    fn test_gaussian_fit_recovers_parameters() {
        let truth = Vector4::new(250.0, 12_297.3, 21.0, 4.0);
        let (x, y) = sample(PeakShape::Gaussian, &truth);
        let sigma = vec![1.0; x.len()];

        let guess = PeakGuess::estimate(PeakShape::Gaussian, &x, &y, None).unwrap();
        let peak = LevenbergMarquardtFitter::new(PeakShape::Gaussian)
            .fit(&x, &y, &sigma, guess)
            .unwrap();

        assert_relative_eq!(peak.centre, truth[1], epsilon = 1e-4);
        assert_relative_eq!(peak.width, truth[2], max_relative = 1e-4);
        assert_relative_eq!(peak.height, truth[0], max_relative = 1e-4);
        assert_relative_eq!(peak.background, truth[3], epsilon = 1e-3);
    }

    #[test]
    fn test_lorentzian_fit_with_fwhm_guess() {
        let truth = Vector4::new(80.0, 12_310.0, 15.0, 1.0);
        let (x, y) = sample(PeakShape::Lorentzian, &truth);
        let sigma: Vec<f64> = y.iter().map(|v: &f64| v.sqrt()).collect();

        let guess = PeakGuess::estimate(PeakShape::Lorentzian, &x, &y, Some(40.0)).unwrap();
        assert_relative_eq!(guess.width, 20.0);
        let peak = LevenbergMarquardtFitter::new(PeakShape::Lorentzian)
            .fit(&x, &y, &sigma, guess)
            .unwrap();

        assert_relative_eq!(peak.centre, truth[1], epsilon = 1e-4);
        assert_relative_eq!(peak.width, truth[2], max_relative = 1e-4);
    }

    #[test]
    fn test_guess_near_seed_skips_taller_neighbour() {
        let tall = Vector4::new(400.0, 12_100.0, 10.0, 0.0);
        let small = Vector4::new(120.0, 12_450.0, 10.0, 2.0);
        let (x, _) = sample(PeakShape::Gaussian, &tall);
        let y: Vec<f64> = x
            .iter()
            .map(|&xi| PeakShape::Gaussian.eval(xi, &tall).0 + PeakShape::Gaussian.eval(xi, &small).0)
            .collect();

        let global = PeakGuess::estimate(PeakShape::Gaussian, &x, &y, None).unwrap();
        assert_relative_eq!(global.centre, 12_100.0);
        let near = PeakGuess::estimate_near(PeakShape::Gaussian, &x, &y, None, 12_440.0).unwrap();
        assert_relative_eq!(near.centre, 12_450.0);
        assert_relative_eq!(near.height, 120.0, max_relative = 1e-3);
    }

    #[test]
    fn test_flat_data_has_no_guess() {
        let x = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        assert!(PeakGuess::estimate(PeakShape::Gaussian, &x, &[2.0; 6], None).is_none());
    }

    #[test]
    fn test_too_few_points() {
        let guess = PeakGuess {
            height: 1.0,
            centre: 2.0,
            width: 1.0,
            background: 0.0,
        };
        let result = LevenbergMarquardtFitter::default().fit(
            &[1.0, 2.0, 3.0],
            &[0.0, 1.0, 0.0],
            &[1.0; 3],
            guess,
        );
        assert!(matches!(result, Err(Error::FitFailed(_))));
    }

    #[test]
    fn test_peak_shape_from_str() {
        assert_eq!("Gaussian".parse::<PeakShape>().unwrap(), PeakShape::Gaussian);
        assert_eq!("lorentzian".parse::<PeakShape>().unwrap(), PeakShape::Lorentzian);
        assert!("Voigt".parse::<PeakShape>().is_err());
    }
}
