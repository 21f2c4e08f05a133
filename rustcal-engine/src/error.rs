//! Engine error types.

use thiserror::Error;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Engine error types.
#[derive(Error, Debug)]
pub enum Error {
    /// Core library error (configuration, indexing).
    #[error("core error: {0}")]
    Core(#[from] rustcal_core::Error),

    /// I/O error from loading or saving.
    #[error("I/O error: {0}")]
    Io(#[from] rustcal_io::Error),
}
