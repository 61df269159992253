//! Low-level primitives for the out-of-core column store.
//!
//! Includes the durable spill storage and the paging subsystem that decides
//! which column pages stay in memory.

/// Durable storage for spilled pages.
///
/// Interfaces for writing, reading and removing page images.
pub mod io;

/// Paging subsystem for column pages.
///
/// Partitions columns into pages, spills and reloads them, and tracks pins
/// and access history for eviction.
pub mod pager;
