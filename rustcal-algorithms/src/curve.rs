//! Calibration curve fitting: channel centroids to reference energies.
#![allow(clippy::cast_precision_loss)]

use crate::linalg::solve_linear_system;
use rustcal_core::{CalibrationModel, CalibrationSpectralPoint, Error, FitError, Result};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Configuration for the calibration curve fit.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CurveFitConfig {
    /// Highest polynomial degree to attempt (capped at `points - 1`).
    pub max_degree: usize,
    /// Minimum number of spectral points that must survive filtering.
    pub min_points: usize,
    /// Maximum accepted relative residual between fitted and reference
    /// energy.
    pub residual_tolerance: f64,
    /// Optional sigma-clipping threshold. `None` (the default) uses all
    /// points; `Some(k)` iteratively drops the worst point while its
    /// residual exceeds `k` times the RMS residual.
    pub outlier_sigma: Option<f64>,
}

impl Default for CurveFitConfig {
    fn default() -> Self {
        Self {
            max_degree: 2,
            min_points: 2,
            residual_tolerance: 0.02,
            outlier_sigma: None,
        }
    }
}

impl CurveFitConfig {
    /// Checks the configuration before any work starts.
    ///
    /// # Errors
    /// Returns [`Error::Config`] for a degree outside 1..=3, fewer than
    /// two required points, or a non-positive tolerance.
    pub fn validate(&self) -> Result<()> {
        if self.max_degree == 0 || self.max_degree > 3 {
            return Err(Error::Config(format!(
                "curve degree must be 1..=3, got {}",
                self.max_degree
            )));
        }
        if self.min_points < 2 {
            return Err(Error::Config(
                "a calibration needs at least 2 spectral points".to_string(),
            ));
        }
        if !self.residual_tolerance.is_finite() || self.residual_tolerance <= 0.0 {
            return Err(Error::Config(format!(
                "residual tolerance must be positive, got {}",
                self.residual_tolerance
            )));
        }
        Ok(())
    }
}

/// Fits a monotonic low-order polynomial through a group's spectral
/// points, minimizing energy residuals weighted by centroid uncertainty.
#[derive(Debug, Clone, Default)]
pub struct CalibrationCurveFitter {
    config: CurveFitConfig,
}

impl CalibrationCurveFitter {
    /// Creates a fitter with the given configuration.
    #[must_use]
    pub fn new(config: CurveFitConfig) -> Self {
        Self { config }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &CurveFitConfig {
        &self.config
    }

    /// Fits the channel→energy model for one group.
    ///
    /// # Errors
    /// Returns [`FitError::InsufficientPoints`] for fewer than the
    /// required points (a single-point calibration is a configuration
    /// error, never an identity fallback), [`FitError::DegenerateCurve`]
    /// when the points do not constrain the polynomial,
    /// [`FitError::NonMonotonic`] or [`FitError::ResidualTooLarge`] when
    /// the fitted curve fails its acceptance checks.
    pub fn fit(
        &self,
        points: &[CalibrationSpectralPoint],
    ) -> std::result::Result<CalibrationModel, FitError> {
        let required = self.config.min_points.max(2);
        if points.len() < required {
            return Err(FitError::InsufficientPoints {
                found: points.len(),
                required,
            });
        }

        let mut active: Vec<&CalibrationSpectralPoint> = points.iter().collect();
        let model = loop {
            let degree = self.config.max_degree.min(active.len() - 1).max(1);
            let coefficients =
                weighted_polyfit(&active, degree).ok_or(FitError::DegenerateCurve)?;
            let model = CalibrationModel::new(coefficients);

            let Some(sigma) = self.config.outlier_sigma else {
                break model;
            };
            let residuals: Vec<f64> = active
                .iter()
                .map(|p| model.energy(p.centroid) - p.energy_kev)
                .collect();
            let rms = (residuals.iter().map(|r| r * r).sum::<f64>() / residuals.len() as f64)
                .sqrt();
            let worst = residuals
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.abs().total_cmp(&b.1.abs()))
                .map(|(i, r)| (i, r.abs()));
            match worst {
                Some((index, magnitude))
                    if rms > 0.0 && magnitude > sigma * rms && active.len() > required =>
                {
                    active.remove(index);
                }
                _ => break model,
            }
        };

        let low = active
            .iter()
            .map(|p| p.centroid)
            .fold(f64::INFINITY, f64::min);
        let high = active
            .iter()
            .map(|p| p.centroid)
            .fold(f64::NEG_INFINITY, f64::max);
        if !model.is_monotonic_over(low, high) {
            return Err(FitError::NonMonotonic);
        }

        let worst_relative = active
            .iter()
            .map(|p| ((model.energy(p.centroid) - p.energy_kev) / p.energy_kev).abs())
            .fold(0.0, f64::max);
        if worst_relative > self.config.residual_tolerance {
            return Err(FitError::ResidualTooLarge {
                residual: worst_relative,
                tolerance: self.config.residual_tolerance,
            });
        }

        Ok(model)
    }
}

/// Weighted polynomial least squares via the normal equations.
fn weighted_polyfit(points: &[&CalibrationSpectralPoint], degree: usize) -> Option<Vec<f64>> {
    let n = degree + 1;
    let mut matrix = vec![vec![0.0_f64; n]; n];
    let mut rhs = vec![0.0_f64; n];

    for point in points {
        let weight = if point.centroid_uncertainty > 0.0 {
            1.0 / (point.centroid_uncertainty * point.centroid_uncertainty)
        } else {
            1.0
        };
        let mut powers = vec![1.0; 2 * n - 1];
        for k in 1..powers.len() {
            powers[k] = powers[k - 1] * point.centroid;
        }
        for j in 0..n {
            rhs[j] += weight * point.energy_kev * powers[j];
            for k in 0..n {
                matrix[j][k] += weight * powers[j + k];
            }
        }
    }

    solve_linear_system(&mut matrix, &mut rhs)
}
