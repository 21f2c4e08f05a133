//! I/O error types.

use thiserror::Error;

/// Result type for I/O operations.
pub type Result<T> = std::result::Result<T, Error>;

/// I/O error types.
#[derive(Error, Debug)]
pub enum Error {
    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A malformed line in a read-out file.
    #[error("parse error at line {line}: {reason}")]
    Parse {
        /// One-based line number of the offending line.
        line: usize,
        /// What was wrong with it.
        reason: String,
    },

    /// Core library error.
    #[error("core error: {0}")]
    Core(#[from] rustcal_core::Error),
}
