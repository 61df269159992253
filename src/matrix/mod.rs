//! Dense matrix facade over the column pager.
//!
//! [`SpillMatrix`] accepts columns in order, records the leading diagonal as
//! they arrive, and serves element and column access through pinned pages.

use std::sync::Arc;

use tracing::debug;

use crate::primitives::io::SpillIo;
use crate::primitives::pager::{
    ColumnBuffer, ColumnGuard, ColumnPager, PageSummary, PagerOptions, PagerStats,
};
use crate::types::{ColumnId, MatrixError, Result};

/// Algorithm that consumes a [`SpillMatrix`] through acquire/unlock calls.
///
/// Implementations drive column access themselves; the matrix only hands
/// itself over.
pub trait Decomposer {
    /// Result of the decomposition.
    type Output;

    /// Runs the algorithm against `matrix`.
    fn decompose(self, matrix: &SpillMatrix) -> Result<Self::Output>;
}

/// Column-major `f64` matrix whose columns live in spillable pages.
pub struct SpillMatrix {
    rows: usize,
    cols: usize,
    diagonal: Vec<f64>,
    pager: ColumnPager,
}

impl SpillMatrix {
    /// Creates an empty matrix spilling into `options.spill_dir`.
    pub fn new(rows: usize, cols: usize, options: PagerOptions) -> Result<Self> {
        let pager = ColumnPager::create(rows, cols, options)?;
        Ok(Self::from_pager(pager))
    }

    /// Creates an empty matrix on a caller-supplied spill store.
    pub fn with_io(
        rows: usize,
        cols: usize,
        options: PagerOptions,
        io: Arc<dyn SpillIo>,
    ) -> Result<Self> {
        let pager = ColumnPager::with_io(rows, cols, options, io)?;
        Ok(Self::from_pager(pager))
    }

    fn from_pager(pager: ColumnPager) -> Self {
        let rows = pager.rows();
        let cols = pager.cols();
        Self {
            rows,
            cols,
            diagonal: vec![0.0; rows.min(cols)],
            pager,
        }
    }

    /// Number of rows.
    pub fn num_rows(&self) -> usize {
        self.rows
    }

    /// Number of columns.
    pub fn num_cols(&self) -> usize {
        self.cols
    }

    /// Leading diagonal captured during ingestion; zero for columns not yet
    /// ingested.
    pub fn diagonal(&self) -> &[f64] {
        &self.diagonal
    }

    /// Number of columns ingested so far.
    pub fn ingested(&self) -> usize {
        self.pager.ingested()
    }

    /// Whether every column has been ingested.
    pub fn is_complete(&self) -> bool {
        self.pager.is_complete()
    }

    /// Appends the next column.
    ///
    /// A [`MatrixError::PersistFailure`] still accepts the column: its page
    /// stays resident until a later eviction manages to write it.
    pub fn ingest_column(&mut self, values: Vec<f64>) -> Result<()> {
        let index = self.pager.ingested();
        let diag = if index < self.diagonal.len() {
            values.get(index).copied()
        } else {
            None
        };
        let result = self.pager.ingest(ColumnId(index), values);
        if self.pager.ingested() > index {
            if let Some(value) = diag {
                self.diagonal[index] = value;
            }
        }
        if result.is_ok() && self.is_complete() {
            debug!(rows = self.rows, cols = self.cols, "matrix.ingest.complete");
        }
        result
    }

    fn check_col(&self, col: usize) -> Result<ColumnId> {
        if col >= self.cols {
            return Err(MatrixError::column_out_of_bounds(col, self.cols));
        }
        Ok(ColumnId(col))
    }

    fn check_row(&self, row: usize) -> Result<()> {
        if row >= self.rows {
            return Err(MatrixError::OutOfBounds {
                index: row,
                limit: self.rows,
                context: "row",
            });
        }
        Ok(())
    }

    /// Pins column `col` until the returned guard drops.
    pub fn acquire_column(&self, col: usize) -> Result<ColumnGuard<'_>> {
        self.pager.acquire(self.check_col(col)?)
    }

    /// Pins column `col` without a guard. Pair with [`SpillMatrix::unlock_column`];
    /// the buffer must not be used after that call.
    pub fn lock_column(&self, col: usize) -> Result<ColumnBuffer> {
        self.pager.pin(self.check_col(col)?)
    }

    /// Releases one pin taken by [`SpillMatrix::lock_column`].
    pub fn unlock_column(&self, col: usize) -> Result<()> {
        self.pager.unpin(self.check_col(col)?)
    }

    /// Reads one element, holding the column pin only for the read.
    pub fn get_value(&self, row: usize, col: usize) -> Result<f64> {
        self.check_row(row)?;
        let column = self.acquire_column(col)?;
        let value = column.read()[row];
        column.release()?;
        Ok(value)
    }

    /// Writes one element, holding the column pin only for the write.
    pub fn set_value(&self, row: usize, col: usize, value: f64) -> Result<()> {
        self.check_row(row)?;
        let column = self.acquire_column(col)?;
        column.write()[row] = value;
        column.release()
    }

    /// Hands the matrix to an external decomposition routine.
    pub fn decompose<D: Decomposer>(&self, decomposer: D) -> Result<D::Output> {
        if !self.is_complete() {
            return Err(MatrixError::InvalidArgument(format!(
                "matrix has {} of {} columns",
                self.ingested(),
                self.cols
            )));
        }
        decomposer.decompose(self)
    }

    /// Pager statistics.
    pub fn stats(&self) -> PagerStats {
        self.pager.stats()
    }

    /// Page summaries in column order.
    pub fn pages(&self) -> Vec<PageSummary> {
        self.pager.pages()
    }

    /// Underlying pager.
    pub fn pager(&self) -> &ColumnPager {
        &self.pager
    }
}
