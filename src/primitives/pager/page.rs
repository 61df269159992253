use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::warn;

use super::image::{ImageHeader, ImageWriter};
use crate::types::{ColumnId, MatrixError, PageId, Result};

type ColumnCell = Arc<RwLock<Box<[f64]>>>;

/// State shared by the buffers of one load of a page. A new residency starts
/// on every load, so buffers kept past a spill cannot touch the next one.
#[derive(Debug, Default)]
struct Residency {
    dirty: AtomicBool,
    detached: AtomicBool,
}

impl Residency {
    fn unsaved() -> Arc<Self> {
        Arc::new(Self {
            dirty: AtomicBool::new(true),
            detached: AtomicBool::new(false),
        })
    }
}

/// Residency of a page.
///
/// `Loading` and `Spilling` are in-flight states held while the pager performs
/// I/O outside its lock; other threads wait for them to settle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PageState {
    /// Buffers are in memory and may be pinned.
    Resident,
    /// Buffers live only in durable storage.
    Spilled,
    /// Image is being read back.
    Loading,
    /// Image is being written out; buffers are still held.
    Spilling,
}

/// Handle to one pinned column buffer.
///
/// Valid for reading and writing until the matching unpin. Writing marks the
/// owning page dirty so the next eviction rewrites its image. Once the page
/// has been spilled the buffer is detached: writes no longer reach the page.
#[derive(Clone, Debug)]
pub struct ColumnBuffer {
    column: ColumnId,
    page: PageId,
    cell: ColumnCell,
    residency: Arc<Residency>,
}

impl ColumnBuffer {
    /// Column this buffer holds.
    pub fn column(&self) -> ColumnId {
        self.column
    }

    /// Number of rows in the column.
    pub fn len(&self) -> usize {
        self.cell.read().len()
    }

    /// Returns true if the column has no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shared access to the column values.
    pub fn read(&self) -> RwLockReadGuard<'_, Box<[f64]>> {
        self.cell.read()
    }

    /// Whether the buffer still belongs to the page's current residency.
    pub fn is_attached(&self) -> bool {
        !self.residency.detached.load(Ordering::Acquire)
    }

    /// Exclusive access to the column values.
    pub fn write(&self) -> RwLockWriteGuard<'_, Box<[f64]>> {
        if !self.is_attached() {
            warn!(page = self.page.0, column = self.column.0, "page.buffer.detached_write");
        }
        self.residency.dirty.store(true, Ordering::Release);
        self.cell.write()
    }

    /// Copies the column out.
    pub fn to_vec(&self) -> Vec<f64> {
        self.cell.read().to_vec()
    }
}

/// Snapshot of a page's buffers taken when it is chosen for spilling.
pub(crate) struct SpillTicket {
    pub(crate) index: usize,
    pub(crate) id: PageId,
    col_from: ColumnId,
    cells: Vec<ColumnCell>,
    pub(crate) dirty: bool,
}

impl SpillTicket {
    pub(crate) fn encode(&self, rows: usize) -> Result<Vec<u8>> {
        encode_cells(self.id, self.col_from, rows, &self.cells)
    }
}

fn encode_cells(
    id: PageId,
    col_from: ColumnId,
    rows: usize,
    cells: &[ColumnCell],
) -> Result<Vec<u8>> {
    let mut writer = ImageWriter::new(id, col_from, rows, cells.len())?;
    for cell in cells {
        writer.push_column(&cell.read())?;
    }
    writer.finish()
}

/// A contiguous run of columns loaded, spilled and pinned as a unit.
pub struct ColumnPage {
    id: PageId,
    col_from: usize,
    col_to: usize,
    state: PageState,
    columns: Option<Vec<ColumnCell>>,
    pins: Vec<u32>,
    accesses: VecDeque<Instant>,
    residency: Arc<Residency>,
}

impl ColumnPage {
    /// Seals freshly ingested columns into a resident page.
    ///
    /// The page starts dirty: no durable copy exists until the first spill.
    pub(crate) fn sealed(id: PageId, col_from: ColumnId, columns: Vec<Box<[f64]>>) -> Self {
        debug_assert!(!columns.is_empty());
        let len = columns.len();
        Self {
            id,
            col_from: col_from.0,
            col_to: col_from.0 + len - 1,
            state: PageState::Resident,
            columns: Some(
                columns
                    .into_iter()
                    .map(|column| Arc::new(RwLock::new(column)))
                    .collect(),
            ),
            pins: vec![0; len],
            accesses: VecDeque::new(),
            residency: Residency::unsaved(),
        }
    }

    /// Stable page identity.
    pub fn id(&self) -> PageId {
        self.id
    }

    /// First column held by the page.
    pub fn col_from(&self) -> ColumnId {
        ColumnId(self.col_from)
    }

    /// Last column held by the page (inclusive).
    pub fn col_to(&self) -> ColumnId {
        ColumnId(self.col_to)
    }

    /// Number of columns in the page.
    pub fn len(&self) -> usize {
        self.pins.len()
    }

    /// Pages always hold at least one column.
    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }

    /// Current residency.
    pub fn state(&self) -> PageState {
        self.state
    }

    /// True while the column buffers occupy memory.
    pub fn is_loaded(&self) -> bool {
        self.columns.is_some()
    }

    /// True when the buffers differ from the durable image.
    pub fn is_dirty(&self) -> bool {
        self.residency.dirty.load(Ordering::Acquire)
    }

    /// Whether `column` falls inside the page's range.
    pub fn contains(&self, column: ColumnId) -> bool {
        column.0 >= self.col_from && column.0 <= self.col_to
    }

    /// Pin count of one column; zero for columns outside the page.
    pub fn pin_count(&self, column: ColumnId) -> u32 {
        if !self.contains(column) {
            return 0;
        }
        self.pins[column.0 - self.col_from]
    }

    /// Sum of pins across every column of the page.
    pub fn total_pins(&self) -> u64 {
        self.pins.iter().map(|&pins| u64::from(pins)).sum()
    }

    /// True iff the page is loaded and no column is pinned.
    pub fn is_evictable(&self) -> bool {
        self.is_loaded() && self.pins.iter().all(|&pins| pins == 0)
    }

    fn slot(&self, column: ColumnId) -> Result<usize> {
        if !self.contains(column) {
            return Err(MatrixError::OutOfBounds {
                index: column.0,
                limit: self.col_to + 1,
                context: "page column",
            });
        }
        Ok(column.0 - self.col_from)
    }

    /// Records an access, pins `column` and returns its buffer.
    pub fn pin(&mut self, column: ColumnId, now: Instant) -> Result<ColumnBuffer> {
        let slot = self.slot(column)?;
        if self.state != PageState::Resident {
            return Err(MatrixError::NotLoaded(self.id));
        }
        let cell = match self.columns.as_ref() {
            Some(columns) => Arc::clone(&columns[slot]),
            None => return Err(MatrixError::NotLoaded(self.id)),
        };
        self.accesses.push_back(now);
        self.pins[slot] += 1;
        Ok(ColumnBuffer {
            column,
            page: self.id,
            cell,
            residency: Arc::clone(&self.residency),
        })
    }

    /// Releases one pin on `column`.
    pub fn unpin(&mut self, column: ColumnId) -> Result<()> {
        let slot = self.slot(column)?;
        match self.pins[slot].checked_sub(1) {
            Some(remaining) => {
                self.pins[slot] = remaining;
                Ok(())
            }
            None => Err(MatrixError::ProtocolViolation(column)),
        }
    }

    /// Counts accesses newer than `window`, dropping older ones.
    pub fn recent_accesses(&mut self, now: Instant, window: Duration) -> usize {
        while let Some(&oldest) = self.accesses.front() {
            if now.saturating_duration_since(oldest) > window {
                self.accesses.pop_front();
            } else {
                break;
            }
        }
        self.accesses.len()
    }

    /// Encodes the current buffers without changing state.
    pub(crate) fn image(&self, rows: usize) -> Result<Vec<u8>> {
        match self.columns.as_ref() {
            Some(cells) => encode_cells(self.id, self.col_from(), rows, cells),
            None => Err(MatrixError::NotLoaded(self.id)),
        }
    }

    pub(crate) fn begin_spill(&mut self, index: usize) -> Result<SpillTicket> {
        if self.state != PageState::Resident || !self.is_evictable() {
            return Err(MatrixError::InvalidArgument(format!(
                "page {} cannot be spilled in state {:?}",
                self.id, self.state
            )));
        }
        let cells = self.columns.clone().unwrap_or_default();
        self.state = PageState::Spilling;
        Ok(SpillTicket {
            index,
            id: self.id,
            col_from: self.col_from(),
            cells,
            dirty: self.is_dirty(),
        })
    }

    /// Settles a spill. On failure the buffers are kept and the page stays
    /// resident; on success they are released.
    pub(crate) fn finish_spill(&mut self, persisted: bool) {
        debug_assert_eq!(self.state, PageState::Spilling);
        if persisted {
            self.columns = None;
            self.residency.detached.store(true, Ordering::Release);
            self.residency = Arc::new(Residency::default());
            self.state = PageState::Spilled;
        } else {
            self.state = PageState::Resident;
        }
    }

    pub(crate) fn begin_load(&mut self) -> Result<()> {
        if self.state != PageState::Spilled {
            return Err(MatrixError::InvalidArgument(format!(
                "page {} cannot be loaded in state {:?}",
                self.id, self.state
            )));
        }
        self.state = PageState::Loading;
        Ok(())
    }

    /// Installs a decoded image, or returns the page to `Spilled` on failure.
    pub(crate) fn finish_load(
        &mut self,
        decoded: Result<(ImageHeader, Vec<Box<[f64]>>)>,
        rows: usize,
    ) -> Result<()> {
        debug_assert_eq!(self.state, PageState::Loading);
        let outcome = decoded.and_then(|(header, columns)| {
            self.check_header(&header, rows)?;
            Ok(columns)
        });
        match outcome {
            Ok(columns) => {
                self.columns = Some(
                    columns
                        .into_iter()
                        .map(|column| Arc::new(RwLock::new(column)))
                        .collect(),
                );
                self.residency = Arc::new(Residency::default());
                self.state = PageState::Resident;
                Ok(())
            }
            Err(err) => {
                self.state = PageState::Spilled;
                Err(err)
            }
        }
    }

    pub(crate) fn abort_load(&mut self) {
        debug_assert_eq!(self.state, PageState::Loading);
        self.state = PageState::Spilled;
    }

    /// Marks an ingested page as durably written and frees its buffers.
    pub(crate) fn mark_spilled(&mut self) {
        self.state = PageState::Spilling;
        self.finish_spill(true);
    }

    fn check_header(&self, header: &ImageHeader, rows: usize) -> Result<()> {
        if header.page_id != self.id {
            return Err(MatrixError::Corruption("page image id mismatch"));
        }
        if header.col_from != self.col_from() {
            return Err(MatrixError::Corruption("page image column range mismatch"));
        }
        if header.cols as usize != self.len() {
            return Err(MatrixError::Corruption("page image column count mismatch"));
        }
        if header.rows as usize != rows {
            return Err(MatrixError::Corruption("page image row count mismatch"));
        }
        Ok(())
    }
}
