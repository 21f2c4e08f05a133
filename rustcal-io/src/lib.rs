//! rustcal-io: Read-out file loading and calibration saving.
//!
//! Read-out files are memory-mapped and parsed in parallel; derived
//! calibrations are serialized into a versioned text format consumed by
//! downstream analysis.
//!

pub mod error;
pub mod reader;
pub mod writer;

pub use error::{Error, Result};
pub use reader::{MappedFileReader, ReadOutFileReader};
pub use writer::CalibrationFileWriter;
