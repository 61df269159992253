//! Identifiers and error taxonomy shared by every layer.

use std::fmt;
use std::io;

use thiserror::Error;

/// Stable identity of a column page, also the key of its durable image.
///
/// Assigned from a monotonically increasing sequence when a page is sealed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageId(pub u64);

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Zero-based index of a matrix column.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ColumnId(pub usize);

impl fmt::Display for ColumnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MatrixError>;

/// Errors raised by the column store.
#[derive(Debug, Error)]
pub enum MatrixError {
    /// Column or row index outside the matrix, or outside a page's range.
    #[error("index {index} out of bounds (limit {limit}): {context}")]
    OutOfBounds {
        /// Offending index.
        index: usize,
        /// Exclusive upper bound that was violated.
        limit: usize,
        /// What kind of index was checked.
        context: &'static str,
    },
    /// A page was pinned while its buffers were not in memory.
    #[error("page {0} is not loaded")]
    NotLoaded(PageId),
    /// Every resident page is pinned and the cache budget is exhausted.
    #[error("all {resident} resident pages are pinned (capacity {capacity})")]
    ResourceExhausted {
        /// Pages currently resident or loading.
        resident: usize,
        /// Configured resident-page capacity.
        capacity: usize,
    },
    /// Writing a page image to durable storage failed.
    #[error("failed to persist page {page}: {source}")]
    PersistFailure {
        /// Page that stayed resident.
        page: PageId,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// Reading a page image back from durable storage failed.
    #[error("failed to reload page {page}: {source}")]
    ReloadFailure {
        /// Page that stayed spilled.
        page: PageId,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// A column was unlocked more times than it was locked.
    #[error("protocol violation: column {0} is not pinned")]
    ProtocolViolation(ColumnId),
    /// A durable page image failed validation.
    #[error("corruption detected: {0}")]
    Corruption(&'static str),
    /// Caller supplied an argument the store cannot accept.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Configuration file could not be parsed.
    #[error("configuration error: {0}")]
    Config(String),
    /// Waiting for another thread's in-flight page transition timed out.
    #[error("timed out waiting for page {0}")]
    Timeout(PageId),
    /// Any other I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl MatrixError {
    pub(crate) fn column_out_of_bounds(index: usize, limit: usize) -> Self {
        MatrixError::OutOfBounds {
            index,
            limit,
            context: "column",
        }
    }

    /// Returns true when the caller can react (unlock columns) and retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MatrixError::ResourceExhausted { .. } | MatrixError::Timeout(_)
        )
    }
}
