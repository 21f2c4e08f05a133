//! rustcal-algorithms: Spectrum construction and fitting.
//!
//! This crate provides the per-group calibration algorithms:
//! - **`SpectrumBuilder`** - histogram construction under three binning
//!   policies (fixed bin count, fixed counts per bin, Bayesian blocks)
//! - **`PeakFitter`** - emission-line peak location and shape fitting
//! - **`CalibrationCurveFitter`** - channel→energy polynomial fit
//!
#![warn(missing_docs)]

mod binning;
mod curve;
mod linalg;
mod peaks;

pub use binning::{BinningMode, HistogramConfig, SpectrumBuilder};
pub use curve::{CalibrationCurveFitter, CurveFitConfig};
pub use peaks::{PeakFitter, PeakParametrization};

// Re-export the core types the fitters produce.
pub use rustcal_core::{CalibrationModel, CalibrationSpectralPoint, FitError, Histogram};
