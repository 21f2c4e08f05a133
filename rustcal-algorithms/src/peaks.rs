//! Peak location and shape fitting against expected emission lines.
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]

use crate::linalg::solve_linear_system;
use rustcal_core::{CalibrationSpectralPoint, FitError, Histogram, SpectralLine};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Full width at half maximum of a unit Gaussian, `2 sqrt(2 ln 2)`.
const FWHM_PER_SIGMA: f64 = 2.354_820_045_030_949;

/// Peak-shape model family.
///
/// Every member is fitted over a linear background and yields the same
/// contract: a centroid, a full width at half maximum, and a reduced
/// chi-square quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PeakParametrization {
    /// Pure Gaussian line shape.
    #[default]
    Gaussian,
    /// Pure Lorentzian line shape.
    Lorentzian,
    /// Equal-weight Gaussian/Lorentzian mixture.
    PseudoVoigt,
}

impl std::fmt::Display for PeakParametrization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PeakParametrization::Gaussian => "gaussian",
            PeakParametrization::Lorentzian => "lorentzian",
            PeakParametrization::PseudoVoigt => "pseudo-voigt",
        };
        f.write_str(name)
    }
}

impl PeakParametrization {
    /// Unit-amplitude shape value at `x` plus its partial derivatives
    /// with respect to centroid and FWHM.
    fn shape_and_partials(self, x: f64, centroid: f64, fwhm: f64) -> (f64, f64, f64) {
        match self {
            PeakParametrization::Gaussian => {
                let sigma = fwhm / FWHM_PER_SIGMA;
                let z = (x - centroid) / sigma;
                let g = (-0.5 * z * z).exp();
                let dg_dmu = g * z / sigma;
                let dg_dfwhm = g * z * z / fwhm;
                (g, dg_dmu, dg_dfwhm)
            }
            PeakParametrization::Lorentzian => {
                let gamma = 0.5 * fwhm;
                let dx = x - centroid;
                let denom = dx * dx + gamma * gamma;
                let l = gamma * gamma / denom;
                let dl_dmu = 2.0 * gamma * gamma * dx / (denom * denom);
                let dl_dgamma = 2.0 * gamma * dx * dx / (denom * denom);
                (l, dl_dmu, 0.5 * dl_dgamma)
            }
            PeakParametrization::PseudoVoigt => {
                let (g, dg_dmu, dg_dfwhm) =
                    PeakParametrization::Gaussian.shape_and_partials(x, centroid, fwhm);
                let (l, dl_dmu, dl_dfwhm) =
                    PeakParametrization::Lorentzian.shape_and_partials(x, centroid, fwhm);
                (
                    0.5 * (g + l),
                    0.5 * (dg_dmu + dl_dmu),
                    0.5 * (dg_dfwhm + dl_dfwhm),
                )
            }
        }
    }
}

/// The histogram re-expressed as count densities over bin centers.
///
/// Variable-width binning (fixed counts per bin, Bayesian blocks) puts
/// the spectral information into the bin widths; fitting works on the
/// density `count / width` with Poisson variance `count / width^2` so
/// all binning modes share one code path.
struct DensityView {
    x: Vec<f64>,
    density: Vec<f64>,
    variance: Vec<f64>,
    width: Vec<f64>,
}

impl DensityView {
    fn new(histogram: &Histogram) -> Self {
        let n = histogram.len();
        let mut x = Vec::with_capacity(n);
        let mut density = Vec::with_capacity(n);
        let mut variance = Vec::with_capacity(n);
        let mut width = Vec::with_capacity(n);
        for i in 0..n {
            let w = histogram.bin_width(i);
            let c = histogram.counts()[i];
            x.push(histogram.bin_center(i));
            density.push(c / w);
            variance.push(c.max(1.0) / (w * w));
            width.push(w);
        }
        Self {
            x,
            density,
            variance,
            width,
        }
    }

    fn len(&self) -> usize {
        self.x.len()
    }
}

/// A candidate peak located in the histogram before shape fitting.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    bin: usize,
    height: f64,
    prominence: f64,
    left: usize,
    right: usize,
}

/// Locates and fits expected emission-line peaks in a histogram.
///
/// Lines are assumed to appear in the same relative channel order as
/// their reference energies (monotonic channel-vs-energy); matching is
/// strictly in that order and a shortfall of resolvable peaks fails the
/// whole group rather than guessing an alignment.
#[derive(Debug, Clone)]
pub struct PeakFitter {
    parametrization: PeakParametrization,
    min_prominence_sigma: f64,
    max_iterations: usize,
}

impl Default for PeakFitter {
    fn default() -> Self {
        Self {
            parametrization: PeakParametrization::Gaussian,
            min_prominence_sigma: 3.0,
            max_iterations: 200,
        }
    }
}

impl PeakFitter {
    /// Creates a fitter for the given peak-shape model.
    #[must_use]
    pub fn new(parametrization: PeakParametrization) -> Self {
        Self {
            parametrization,
            ..Self::default()
        }
    }

    /// Sets the minimum peak prominence in units of the local Poisson
    /// fluctuation.
    #[must_use]
    pub fn with_min_prominence_sigma(mut self, sigma: f64) -> Self {
        self.min_prominence_sigma = sigma;
        self
    }

    /// Sets the iteration cap for the shape refinement.
    #[must_use]
    pub fn with_max_iterations(mut self, iterations: usize) -> Self {
        self.max_iterations = iterations;
        self
    }

    /// Returns the selected peak-shape model.
    #[must_use]
    pub fn parametrization(&self) -> PeakParametrization {
        self.parametrization
    }

    /// Fits all expected lines, ascending in energy, against the peaks of
    /// the histogram.
    ///
    /// # Errors
    /// Returns a [`FitError`] when the histogram is empty, when fewer
    /// resolvable peaks exist than expected lines, or when a shape fit
    /// does not converge. The group's calibration is then recorded as
    /// failed; nothing is retried.
    pub fn fit(
        &self,
        histogram: &Histogram,
        lines: &[SpectralLine],
    ) -> Result<Vec<CalibrationSpectralPoint>, FitError> {
        if lines.is_empty() {
            return Ok(Vec::new());
        }
        if histogram.is_empty() || histogram.total_count() <= 0.0 {
            return Err(FitError::EmptySpectrum);
        }

        let view = DensityView::new(histogram);
        let mut candidates = self.find_candidates(&view);
        if candidates.len() < lines.len() {
            return Err(FitError::TooFewPeaks {
                found: candidates.len(),
                expected: lines.len(),
            });
        }
        // Keep the most prominent candidates, then restore channel order
        // so the k-th line maps to the k-th peak.
        candidates.sort_by(|a, b| b.prominence.total_cmp(&a.prominence));
        candidates.truncate(lines.len());
        candidates.sort_by_key(|c| c.bin);

        // Cut each fit window at the midpoint to its neighbors so one
        // peak never leaks into another's background estimate.
        let bins: Vec<usize> = candidates.iter().map(|c| c.bin).collect();
        for (k, candidate) in candidates.iter_mut().enumerate() {
            if k > 0 {
                candidate.left = candidate.left.max((bins[k - 1] + bins[k]) / 2 + 1);
            }
            if k + 1 < bins.len() {
                candidate.right = candidate.right.min((bins[k] + bins[k + 1]) / 2);
            }
        }

        lines
            .iter()
            .zip(candidates.iter())
            .map(|(line, candidate)| self.fit_single(&view, *candidate, line))
            .collect()
    }

    /// Locates local density maxima with their prominences and valley
    /// bounds.
    fn find_candidates(&self, view: &DensityView) -> Vec<Candidate> {
        let n = view.len();
        if n < 3 {
            return Vec::new();
        }

        // Light smoothing so single-bin fluctuations do not register.
        let smoothed: Vec<f64> = (0..n)
            .map(|i| {
                let lo = i.saturating_sub(1);
                let hi = (i + 1).min(n - 1);
                view.density[lo..=hi].iter().sum::<f64>() / (hi - lo + 1) as f64
            })
            .collect();

        let mut candidates = Vec::new();
        for i in 1..n - 1 {
            if !(smoothed[i] > smoothed[i - 1] && smoothed[i] >= smoothed[i + 1]) {
                continue;
            }
            let height = smoothed[i];

            let mut left = i;
            let mut left_base = height;
            for j in (0..i).rev() {
                if smoothed[j] > height {
                    break;
                }
                if smoothed[j] < left_base {
                    left_base = smoothed[j];
                    left = j;
                }
            }

            let mut right = i;
            let mut right_base = height;
            for (j, &value) in smoothed.iter().enumerate().skip(i + 1) {
                if value > height {
                    break;
                }
                if value < right_base {
                    right_base = value;
                    right = j;
                }
            }

            let prominence = height - left_base.max(right_base);
            if prominence >= self.min_prominence_sigma * view.variance[i].sqrt() {
                candidates.push(Candidate {
                    bin: i,
                    height: view.density[i],
                    prominence,
                    left,
                    right,
                });
            }
        }
        candidates
    }

    /// Fits one peak plus linear background over the candidate's window.
    fn fit_single(
        &self,
        view: &DensityView,
        candidate: Candidate,
        line: &SpectralLine,
    ) -> Result<CalibrationSpectralPoint, FitError> {
        let not_converged = || FitError::NotConverged {
            energy_kev: line.energy_kev,
        };

        let (window_lo, window_hi) = (candidate.left, candidate.right);
        if window_hi < window_lo || window_hi - window_lo + 1 < 6 {
            return Err(not_converged());
        }

        let x = &view.x[window_lo..=window_hi];
        let y = &view.density[window_lo..=window_hi];
        let var = &view.variance[window_lo..=window_hi];
        let widths = &view.width[window_lo..=window_hi];
        let m = x.len();

        // Moment seeds: background through the window endpoints, centroid
        // at the apex, width from the half-maximum crossings.
        let slope0 = (y[m - 1] - y[0]) / (x[m - 1] - x[0]);
        let intercept0 = y[0] - slope0 * x[0];
        let apex = candidate.bin - window_lo;
        let background_at = |xv: f64| intercept0 + slope0 * xv;
        let amplitude0 = (candidate.height - background_at(x[apex])).max(1e-6);

        let half = background_at(x[apex]) + 0.5 * amplitude0;
        let mut lo_cross = x[0];
        for k in (0..apex).rev() {
            if y[k] < half {
                lo_cross = x[k];
                break;
            }
        }
        let mut hi_cross = x[m - 1];
        for k in apex + 1..m {
            if y[k] < half {
                hi_cross = x[k];
                break;
            }
        }
        let fwhm0 = (hi_cross - lo_cross).max(widths[apex]);
        let centroid0 = 0.5 * (hi_cross + lo_cross);

        let mut params = [centroid0, fwhm0, amplitude0, intercept0, slope0];
        let params = self
            .refine(x, y, var, &mut params)
            .ok_or_else(not_converged)?;

        let [centroid, fwhm, amplitude, intercept, slope] = params;
        let window_span = x[m - 1] - x[0];
        if !(centroid.is_finite()
            && centroid > x[0]
            && centroid < x[m - 1]
            && fwhm > 0.0
            && fwhm < window_span
            && amplitude > 0.0)
        {
            return Err(not_converged());
        }

        let chi2 = self.chi_square(x, y, var, &params);
        let quality = chi2 / (m - 5) as f64;

        // Net counts under the peak, for the centroid's statistical error.
        let net_counts: f64 = x
            .iter()
            .zip(y)
            .zip(widths)
            .map(|((&xv, &yv), &w)| (yv - (intercept + slope * xv)) * w)
            .sum::<f64>()
            .max(1.0);
        let centroid_uncertainty = fwhm / FWHM_PER_SIGMA / net_counts.sqrt();

        Ok(CalibrationSpectralPoint {
            isotope: line.isotope.clone(),
            energy_kev: line.energy_kev,
            centroid,
            centroid_uncertainty,
            fwhm,
            quality,
        })
    }

    fn chi_square(&self, x: &[f64], y: &[f64], var: &[f64], p: &[f64; 5]) -> f64 {
        let model = |xv: f64| {
            let (shape, _, _) = self.parametrization.shape_and_partials(xv, p[0], p[1]);
            p[2] * shape + p[3] + p[4] * xv
        };
        x.iter()
            .zip(y)
            .zip(var)
            .map(|((&xv, &yv), &v)| {
                let r = yv - model(xv);
                r * r / v
            })
            .sum()
    }

    /// Damped Gauss-Newton (Levenberg-Marquardt) refinement with Poisson
    /// weights. Returns the refined parameters or `None` on failure.
    fn refine(
        &self,
        x: &[f64],
        y: &[f64],
        var: &[f64],
        params: &mut [f64; 5],
    ) -> Option<[f64; 5]> {
        let mut chi2 = self.chi_square(x, y, var, params);
        if !chi2.is_finite() {
            return None;
        }
        let mut lambda = 1e-3;
        let mut converged = false;

        for _ in 0..self.max_iterations {
            let mut jtj = vec![vec![0.0_f64; 5]; 5];
            let mut jtr = vec![0.0_f64; 5];
            for ((&xv, &yv), &v) in x.iter().zip(y).zip(var) {
                let (shape, d_mu, d_fwhm) =
                    self.parametrization.shape_and_partials(xv, params[0], params[1]);
                let jac = [params[2] * d_mu, params[2] * d_fwhm, shape, 1.0, xv];
                let weight = 1.0 / v;
                let residual = yv - (params[2] * shape + params[3] + params[4] * xv);
                for j in 0..5 {
                    jtr[j] += weight * jac[j] * residual;
                    for k in 0..5 {
                        jtj[j][k] += weight * jac[j] * jac[k];
                    }
                }
            }

            let mut damped = jtj.clone();
            for (j, row) in damped.iter_mut().enumerate() {
                row[j] += lambda * jtj[j][j].max(1e-12);
            }
            let mut rhs = jtr.clone();
            let Some(delta) = solve_linear_system(&mut damped, &mut rhs) else {
                lambda *= 10.0;
                if lambda > 1e12 {
                    return None;
                }
                continue;
            };

            let trial = [
                params[0] + delta[0],
                params[1] + delta[1],
                params[2] + delta[2],
                params[3] + delta[3],
                params[4] + delta[4],
            ];
            let trial_chi2 = if trial[1] > 0.0 {
                self.chi_square(x, y, var, &trial)
            } else {
                f64::INFINITY
            };

            if trial_chi2.is_finite() && trial_chi2 <= chi2 {
                let step: f64 = delta
                    .iter()
                    .zip(params.iter())
                    .map(|(d, p)| (d / p.abs().max(1.0)).abs())
                    .fold(0.0, f64::max);
                let improvement = (chi2 - trial_chi2) / chi2.max(1e-12);
                *params = trial;
                chi2 = trial_chi2;
                lambda = (lambda * 0.3).max(1e-12);
                if step < 1e-8 || improvement < 1e-9 {
                    converged = true;
                    break;
                }
            } else {
                lambda *= 10.0;
                if lambda > 1e12 {
                    break;
                }
            }
        }

        converged.then_some(*params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rustcal_core::Histogram;

    fn synthetic_histogram(peaks: &[(f64, f64, f64)], bins: usize, max: f64) -> Histogram {
        let width = max / bins as f64;
        let edges: Vec<f64> = (0..=bins).map(|i| width * i as f64).collect();
        let counts: Vec<f64> = (0..bins)
            .map(|i| {
                let x = width * (i as f64 + 0.5);
                let mut y = 50.0; // flat background
                for &(centroid, sigma, amplitude) in peaks {
                    let z = (x - centroid) / sigma;
                    y += amplitude * (-0.5 * z * z).exp();
                }
                y
            })
            .collect();
        Histogram::new(edges, counts)
    }

    fn line(energy: f64) -> SpectralLine {
        SpectralLine {
            isotope: "test".to_string(),
            energy_kev: energy,
        }
    }

    #[test]
    fn test_single_gaussian_centroid_recovery() {
        let h = synthetic_histogram(&[(300.0, 8.0, 2000.0)], 512, 1024.0);
        let fitter = PeakFitter::new(PeakParametrization::Gaussian);
        let points = fitter.fit(&h, &[line(661.66)]).unwrap();
        assert_eq!(points.len(), 1);
        assert_relative_eq!(points[0].centroid, 300.0, epsilon = 0.5);
        assert_relative_eq!(points[0].fwhm, 8.0 * FWHM_PER_SIGMA, epsilon = 1.0);
        assert!(points[0].centroid_uncertainty > 0.0);
    }

    #[test]
    fn test_ordering_matches_energies_to_channels() {
        let h = synthetic_histogram(
            &[(200.0, 6.0, 1500.0), (600.0, 8.0, 900.0)],
            512,
            1024.0,
        );
        let fitter = PeakFitter::default();
        let points = fitter.fit(&h, &[line(661.66), line(1332.49)]).unwrap();
        assert_relative_eq!(points[0].centroid, 200.0, epsilon = 1.0);
        assert_relative_eq!(points[1].centroid, 600.0, epsilon = 1.0);
        assert_relative_eq!(points[0].energy_kev, 661.66);
        assert_relative_eq!(points[1].energy_kev, 1332.49);
    }

    #[test]
    fn test_too_few_peaks_fails() {
        let h = synthetic_histogram(&[(300.0, 8.0, 2000.0)], 512, 1024.0);
        let fitter = PeakFitter::default();
        let err = fitter.fit(&h, &[line(661.66), line(1332.49)]).unwrap_err();
        assert!(matches!(
            err,
            FitError::TooFewPeaks {
                found: 1,
                expected: 2
            }
        ));
    }

    #[test]
    fn test_empty_histogram_fails() {
        let fitter = PeakFitter::default();
        let err = fitter.fit(&Histogram::empty(), &[line(661.66)]).unwrap_err();
        assert!(matches!(err, FitError::EmptySpectrum));
    }

    #[test]
    fn test_no_lines_is_trivially_empty() {
        let h = synthetic_histogram(&[(300.0, 8.0, 2000.0)], 512, 1024.0);
        let fitter = PeakFitter::default();
        assert!(fitter.fit(&h, &[]).unwrap().is_empty());
    }
}
