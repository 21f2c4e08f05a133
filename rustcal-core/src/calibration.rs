//! Calibration results: spectral points, channel→energy models, and the
//! store holding per-collection outcomes.

use crate::error::{Error, Result};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// One fitted emission-line peak.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CalibrationSpectralPoint {
    /// Name of the isotope this line belongs to.
    pub isotope: String,
    /// Reference energy of the line in keV.
    pub energy_kev: f64,
    /// Fitted peak centroid in channel units.
    pub centroid: f64,
    /// One-sigma uncertainty of the centroid in channel units.
    pub centroid_uncertainty: f64,
    /// Fitted full width at half maximum in channel units.
    pub fwhm: f64,
    /// Fit quality: reduced chi-square of the peak fit.
    pub quality: f64,
}

/// A channel→energy mapping as a low-order polynomial.
///
/// Coefficients are stored in ascending powers; degree is 1 or 2.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CalibrationModel {
    coefficients: Vec<f64>,
}

impl CalibrationModel {
    /// Creates a model from coefficients in ascending powers.
    ///
    /// # Panics
    /// Panics if fewer than two coefficients are supplied; a constant
    /// mapping is never a valid calibration.
    #[must_use]
    pub fn new(coefficients: Vec<f64>) -> Self {
        assert!(coefficients.len() >= 2, "model needs degree >= 1");
        Self { coefficients }
    }

    /// Returns the polynomial coefficients in ascending powers.
    #[must_use]
    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }

    /// Returns the polynomial degree.
    #[must_use]
    pub fn degree(&self) -> usize {
        self.coefficients.len() - 1
    }

    /// Evaluates the model: energy in keV for a channel value.
    #[must_use]
    pub fn energy(&self, channel: f64) -> f64 {
        self.coefficients
            .iter()
            .rev()
            .fold(0.0, |acc, &c| acc * channel + c)
    }

    /// Returns true if the mapping is strictly increasing over
    /// `[low, high]`. Linear models are checked via the slope; quadratics
    /// via the derivative at both ends (the derivative is itself linear).
    #[must_use]
    pub fn is_monotonic_over(&self, low: f64, high: f64) -> bool {
        let derivative = |x: f64| -> f64 {
            self.coefficients
                .iter()
                .enumerate()
                .skip(1)
                .rev()
                .fold(0.0, |acc, (power, &c)| {
                    acc * x + c * power as f64
                })
        };
        derivative(low) > 0.0 && derivative(high) > 0.0
    }
}

/// Why the calibration of one group failed.
///
/// Recorded per group in the [`CalibrationStore`]; a failure never aborts
/// the surrounding dispatch round.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum FitError {
    /// The built histogram has zero total entries.
    #[error("spectrum has no entries")]
    EmptySpectrum,

    /// Fewer resolvable peaks than expected emission lines.
    #[error("found {found} resolvable peaks but expected {expected} lines")]
    TooFewPeaks {
        /// Peaks found in the histogram.
        found: usize,
        /// Expected emission lines.
        expected: usize,
    },

    /// The peak-shape fit for a line did not converge.
    #[error("peak fit for line at {energy_kev} keV did not converge")]
    NotConverged {
        /// Reference energy of the offending line.
        energy_kev: f64,
    },

    /// Too few spectral points for a calibration curve. A single-point
    /// calibration is a configuration error, not an identity fallback.
    #[error("{found} spectral points but at least {required} required")]
    InsufficientPoints {
        /// Surviving spectral points.
        found: usize,
        /// Configured minimum.
        required: usize,
    },

    /// The spectral points do not constrain the curve (e.g. coincident
    /// centroids making the normal equations singular).
    #[error("calibration curve fit is degenerate")]
    DegenerateCurve,

    /// The fitted curve is not strictly increasing over the data span.
    #[error("calibration curve is not monotonic over the fitted span")]
    NonMonotonic,

    /// A residual between fitted energy and reference energy exceeds the
    /// configured tolerance.
    #[error("relative residual {residual:.4} exceeds tolerance {tolerance:.4}")]
    ResidualTooLarge {
        /// Worst relative residual observed.
        residual: f64,
        /// Configured tolerance.
        tolerance: f64,
    },
}

/// Calibration outcome for one read-out data group.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum GroupCalibration {
    /// The group calibrated successfully.
    Calibrated {
        /// The fitted channel→energy model.
        model: CalibrationModel,
        /// The spectral points the model was fit through.
        points: Vec<CalibrationSpectralPoint>,
    },
    /// The group failed; any points fitted before the failure are kept
    /// for diagnostics.
    Failed {
        /// Why the calibration failed.
        reason: FitError,
        /// Points fitted before the failure, possibly empty.
        points: Vec<CalibrationSpectralPoint>,
    },
}

impl GroupCalibration {
    /// Returns the model if the group calibrated successfully.
    #[must_use]
    pub fn model(&self) -> Option<&CalibrationModel> {
        match self {
            GroupCalibration::Calibrated { model, .. } => Some(model),
            GroupCalibration::Failed { .. } => None,
        }
    }

    /// Returns the spectral points fitted for this group.
    #[must_use]
    pub fn points(&self) -> &[CalibrationSpectralPoint] {
        match self {
            GroupCalibration::Calibrated { points, .. }
            | GroupCalibration::Failed { points, .. } => points,
        }
    }

    /// Returns the failure reason, if any.
    #[must_use]
    pub fn failure(&self) -> Option<&FitError> {
        match self {
            GroupCalibration::Calibrated { .. } => None,
            GroupCalibration::Failed { reason, .. } => Some(reason),
        }
    }

    /// Returns true if a model is present.
    #[must_use]
    pub fn is_calibrated(&self) -> bool {
        self.model().is_some()
    }
}

/// Calibration outcome for one collection: one entry per group.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CollectionCalibration {
    channel_id: u32,
    groups: Vec<GroupCalibration>,
}

impl CollectionCalibration {
    /// Creates the outcome record for one collection.
    #[must_use]
    pub fn new(channel_id: u32, groups: Vec<GroupCalibration>) -> Self {
        Self { channel_id, groups }
    }

    /// Returns the detector channel id of the calibrated collection.
    #[must_use]
    pub fn channel_id(&self) -> u32 {
        self.channel_id
    }

    /// Returns the per-group outcomes in group order.
    #[must_use]
    pub fn groups(&self) -> &[GroupCalibration] {
        &self.groups
    }

    /// Returns the outcome for one group.
    ///
    /// # Errors
    /// Returns [`Error::IndexOutOfRange`] for an invalid group index.
    pub fn group(&self, index: usize) -> Result<&GroupCalibration> {
        self.groups
            .get(index)
            .ok_or_else(|| Error::out_of_range("group", index, self.groups.len()))
    }

    /// Returns true if every group carries a model.
    #[must_use]
    pub fn is_fully_calibrated(&self) -> bool {
        self.groups.iter().all(GroupCalibration::is_calibrated)
    }

    /// Spectral points of all groups flattened in group order.
    pub fn spectral_points(&self) -> impl Iterator<Item = &CalibrationSpectralPoint> {
        self.groups.iter().flat_map(|g| g.points().iter())
    }
}

/// Storage for derived calibrations, indexed like the read-out store.
///
/// Slots are `None` until the collection has been through a calibration
/// round; accessors distinguish an invalid index from a pending slot.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CalibrationStore {
    slots: Vec<Option<CollectionCalibration>>,
}

impl CalibrationStore {
    /// Creates a store with `count` empty slots.
    #[must_use]
    pub fn with_slots(count: usize) -> Self {
        Self {
            slots: vec![None; count],
        }
    }

    /// Returns the number of slots.
    #[must_use]
    pub fn number_of_collections(&self) -> usize {
        self.slots.len()
    }

    /// Writes the outcome for one collection.
    ///
    /// # Errors
    /// Returns [`Error::IndexOutOfRange`] for an invalid index.
    pub fn set(&mut self, index: usize, calibration: CollectionCalibration) -> Result<()> {
        let count = self.slots.len();
        let slot = self
            .slots
            .get_mut(index)
            .ok_or_else(|| Error::out_of_range("collection", index, count))?;
        *slot = Some(calibration);
        Ok(())
    }

    /// Returns the outcome for one collection.
    ///
    /// # Errors
    /// Returns [`Error::IndexOutOfRange`] for an invalid index and
    /// [`Error::NotYetCalibrated`] for a valid but pending slot.
    pub fn collection(&self, index: usize) -> Result<&CollectionCalibration> {
        self.slots
            .get(index)
            .ok_or_else(|| Error::out_of_range("collection", index, self.slots.len()))?
            .as_ref()
            .ok_or(Error::NotYetCalibrated { collection: index })
    }

    /// Returns the number of spectral points fitted for a collection,
    /// flattened over its groups. Zero for a pending slot.
    ///
    /// # Errors
    /// Returns [`Error::IndexOutOfRange`] for an invalid index.
    pub fn number_of_spectral_points(&self, index: usize) -> Result<usize> {
        match self.collection(index) {
            Ok(c) => Ok(c.spectral_points().count()),
            Err(Error::NotYetCalibrated { .. }) => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Returns spectral point `line` of a collection, flattened over its
    /// groups in group order.
    ///
    /// # Errors
    /// Returns [`Error::IndexOutOfRange`] if the collection or line index
    /// is invalid, [`Error::NotYetCalibrated`] for a pending slot.
    pub fn spectral_point(&self, index: usize, line: usize) -> Result<&CalibrationSpectralPoint> {
        let collection = self.collection(index)?;
        let count = collection.spectral_points().count();
        collection
            .spectral_points()
            .nth(line)
            .ok_or_else(|| Error::out_of_range("line", line, count))
    }

    /// Resets the store to `count` empty slots, discarding prior results.
    pub fn reset(&mut self, count: usize) {
        self.slots.clear();
        self.slots.resize(count, None);
    }

    /// Iterates `(collection index, outcome)` over calibrated slots.
    pub fn calibrated(&self) -> impl Iterator<Item = (usize, &CollectionCalibration)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|c| (i, c)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn point(energy: f64, centroid: f64) -> CalibrationSpectralPoint {
        CalibrationSpectralPoint {
            isotope: "Cs-137".to_string(),
            energy_kev: energy,
            centroid,
            centroid_uncertainty: 0.1,
            fwhm: 2.0,
            quality: 1.0,
        }
    }

    #[test]
    fn test_model_evaluation() {
        let model = CalibrationModel::new(vec![5.0, 2.0]);
        assert_relative_eq!(model.energy(0.0), 5.0);
        assert_relative_eq!(model.energy(10.0), 25.0);
        assert_eq!(model.degree(), 1);

        let quad = CalibrationModel::new(vec![0.0, 1.0, 0.01]);
        assert_relative_eq!(quad.energy(10.0), 11.0);
        assert!(quad.is_monotonic_over(0.0, 100.0));

        let bent = CalibrationModel::new(vec![0.0, 1.0, -0.1]);
        assert!(!bent.is_monotonic_over(0.0, 100.0));
    }

    #[test]
    fn test_store_distinguishes_pending_from_out_of_range() {
        let mut store = CalibrationStore::with_slots(2);
        assert!(matches!(
            store.collection(5),
            Err(Error::IndexOutOfRange { .. })
        ));
        assert!(matches!(
            store.collection(1),
            Err(Error::NotYetCalibrated { collection: 1 })
        ));

        let outcome = CollectionCalibration::new(
            9,
            vec![GroupCalibration::Calibrated {
                model: CalibrationModel::new(vec![0.0, 1.0]),
                points: vec![point(661.66, 330.0), point(1332.49, 666.0)],
            }],
        );
        store.set(1, outcome).unwrap();
        assert_eq!(store.number_of_spectral_points(1).unwrap(), 2);
        assert!(store.collection(1).unwrap().is_fully_calibrated());
    }

    #[test]
    fn test_spectral_point_line_index_out_of_range() {
        let mut store = CalibrationStore::with_slots(1);
        store
            .set(
                0,
                CollectionCalibration::new(
                    0,
                    vec![GroupCalibration::Failed {
                        reason: FitError::EmptySpectrum,
                        points: vec![point(661.66, 330.0)],
                    }],
                ),
            )
            .unwrap();

        assert_relative_eq!(store.spectral_point(0, 0).unwrap().centroid, 330.0);
        assert!(matches!(
            store.spectral_point(0, 1),
            Err(Error::IndexOutOfRange {
                what: "line",
                index: 1,
                count: 1
            })
        ));
    }
}
