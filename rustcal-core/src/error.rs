//! Error types for rustcal-core.

use thiserror::Error;

/// Result type alias for rustcal operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for rustcal operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Invalid configuration supplied by the caller. Rejected before any
    /// work starts, never retried.
    #[error("configuration error: {0}")]
    Config(String),

    /// An accessor was given an index at or beyond the current count.
    #[error("{what} index {index} out of range (count: {count})")]
    IndexOutOfRange {
        /// What kind of index was out of range (collection, group, line).
        what: &'static str,
        /// The offending index.
        index: usize,
        /// The current count for that index kind.
        count: usize,
    },

    /// The index is valid but no calibration result exists for it yet.
    /// Distinct from [`Error::IndexOutOfRange`]: callers may retry after
    /// the next calibration round.
    #[error("collection {collection} has not been calibrated yet")]
    NotYetCalibrated {
        /// The collection index queried.
        collection: usize,
    },
}

impl Error {
    /// Builds an out-of-range error after a failed bounds check.
    #[must_use]
    pub fn out_of_range(what: &'static str, index: usize, count: usize) -> Self {
        Error::IndexOutOfRange { what, index, count }
    }
}
