//! rustcal-core: Core types for detector spectrum energy calibration.
//!
//! This crate provides the data model shared by the calibration engine:
//! read-out storage, histograms, isotope line expectations, and the
//! calibration result store.
//!

pub mod calibration;
pub mod error;
pub mod isotope;
pub mod readout;
pub mod spectrum;

pub use calibration::{
    CalibrationModel, CalibrationSpectralPoint, CalibrationStore, CollectionCalibration, FitError,
    GroupCalibration,
};
pub use error::{Error, Result};
pub use isotope::{expected_lines, Isotope, SpectralLine};
pub use readout::{ReadOutCollection, ReadOutDataGroup, ReadOutStore};
pub use spectrum::Histogram;
