//! Out-of-core column storage for dense matrices.
//!
//! Columns are grouped into fixed-size pages that spill to disk as they fill
//! and reload on demand, with a bounded number of pages resident at once.

#![warn(missing_docs)]

pub mod matrix;
pub mod primitives;
pub mod types;

pub use matrix::{Decomposer, SpillMatrix};
pub use primitives::pager::{ColumnGuard, ColumnPager, PagerConfig, PagerOptions, PagerStats};
pub use types::{ColumnId, MatrixError, PageId, Result};
