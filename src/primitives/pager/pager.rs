use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard, RwLockReadGuard, RwLockWriteGuard};
use tempfile::TempDir;
use tracing::{debug, info, warn};

use super::image::{decode_image, ImageHeader};
use super::page::{ColumnBuffer, ColumnPage, PageState, SpillTicket};
use crate::primitives::io::{DirSpill, SpillIo};
use crate::types::{ColumnId, MatrixError, PageId, Result};

/// Configuration options for the column pager.
///
/// These control page granularity, the resident-page budget, the eviction
/// scoring window and where spilled pages are written.
#[derive(Clone, Debug)]
pub struct PagerOptions {
    /// Number of columns grouped into one page.
    pub columns_per_page: usize,
    /// Maximum number of pages kept in memory.
    pub cache_pages: usize,
    /// Accesses older than this no longer count toward a page's eviction score.
    pub recency_window: Duration,
    /// Parent directory for spilled page images. Each pager writes into its
    /// own uniquely named subdirectory, so several pagers may share it.
    pub spill_dir: PathBuf,
    /// Whether every spilled image is fsynced before it is considered durable.
    pub sync_on_spill: bool,
    /// Whether page images and the pager's subdirectory are deleted when the
    /// pager is dropped.
    pub remove_on_drop: bool,
    /// Upper bound on waiting for another thread's in-flight load or spill.
    pub io_wait_timeout: Option<Duration>,
}

impl Default for PagerOptions {
    fn default() -> Self {
        Self {
            columns_per_page: 10,
            cache_pages: 5,
            recency_window: Duration::from_secs(60 * 60),
            spill_dir: std::env::temp_dir().join("spill-matrix"),
            sync_on_spill: true,
            remove_on_drop: true,
            io_wait_timeout: None,
        }
    }
}

impl PagerOptions {
    /// Options spilling into `dir`, other fields defaulted.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            spill_dir: dir.into(),
            ..Self::default()
        }
    }

    /// Rejects settings the pager cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.columns_per_page == 0 {
            return Err(MatrixError::InvalidArgument(
                "columns_per_page must be at least 1".into(),
            ));
        }
        if self.cache_pages == 0 {
            return Err(MatrixError::InvalidArgument(
                "cache_pages must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Statistics tracking pager operations.
#[derive(Default, Clone, Debug, PartialEq, Eq)]
pub struct PagerStats {
    /// Pins served from a resident page.
    pub hits: u64,
    /// Pins that required a reload.
    pub misses: u64,
    /// Pages chosen as eviction victims.
    pub evictions: u64,
    /// Page images written (ingestion and eviction).
    pub spills: u64,
    /// Evictions of clean pages that skipped the rewrite.
    pub clean_evictions: u64,
    /// Page images read back.
    pub reloads: u64,
    /// Image writes that failed.
    pub spill_failures: u64,
    /// Image reads or validations that failed.
    pub reload_failures: u64,
}

impl fmt::Display for PagerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hits={} misses={} evictions={} spills={} clean_evictions={} reloads={}",
            self.hits, self.misses, self.evictions, self.spills, self.clean_evictions, self.reloads
        )
    }
}

/// Point-in-time view of one page, for inspection and tests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageSummary {
    /// Page identity.
    pub id: PageId,
    /// First column.
    pub col_from: ColumnId,
    /// Last column (inclusive).
    pub col_to: ColumnId,
    /// Residency.
    pub state: PageState,
    /// Sum of column pins.
    pub pins: u64,
    /// Whether buffers are in memory.
    pub loaded: bool,
    /// Whether the page may be chosen as a victim.
    pub evictable: bool,
}

#[derive(Default)]
struct IngestBuffer {
    pending: Vec<Box<[f64]>>,
    next_column: usize,
    next_page_id: u64,
}

struct PagerInner {
    pages: Vec<ColumnPage>,
    stats: PagerStats,
}

impl PagerInner {
    fn locate(&self, column: ColumnId) -> Result<usize> {
        let idx = self.pages.partition_point(|page| page.col_to() < column);
        match self.pages.get(idx) {
            Some(page) if page.contains(column) => Ok(idx),
            _ => Err(MatrixError::column_out_of_bounds(
                column.0,
                self.pages.last().map_or(0, |page| page.col_to().0 + 1),
            )),
        }
    }

    /// Pages holding, or about to hold, buffers that count against the budget.
    fn resident_count(&self) -> usize {
        self.pages
            .iter()
            .filter(|page| matches!(page.state(), PageState::Resident | PageState::Loading))
            .count()
    }

    /// Lowest recent-access score among unpinned resident pages; the first
    /// page in column order wins ties.
    fn select_victim(&mut self, now: Instant, window: Duration) -> Option<usize> {
        let mut best: Option<(usize, usize)> = None;
        for (idx, page) in self.pages.iter_mut().enumerate() {
            if page.state() != PageState::Resident || !page.is_evictable() {
                continue;
            }
            let score = page.recent_accesses(now, window);
            match best {
                Some((_, best_score)) if best_score <= score => {}
                _ => best = Some((idx, score)),
            }
        }
        best.map(|(idx, _)| idx)
    }
}

struct LoadPlan {
    target: usize,
    target_id: PageId,
    victim: Option<SpillTicket>,
}

struct LoadOutcome {
    spilled: Option<Result<bool>>,
    loaded: Option<Result<(ImageHeader, Vec<Box<[f64]>>)>>,
}

/// Out-of-core page manager for the columns of one matrix.
///
/// Columns are ingested sequentially and sealed into fixed-size pages that
/// are spilled immediately. Pinning a column reloads its page on demand,
/// evicting the least recently-frequently used unpinned page when the
/// resident budget is full. Metadata decisions happen under one mutex; image
/// reads and writes run with the mutex released.
pub struct ColumnPager {
    io: Arc<dyn SpillIo>,
    rows: usize,
    cols: usize,
    options: PagerOptions,
    ingest: IngestBuffer,
    inner: Mutex<PagerInner>,
    transitions: Condvar,
    namespace: Option<TempDir>,
}

impl ColumnPager {
    /// Creates a pager spilling into a fresh subdirectory of
    /// `options.spill_dir`.
    pub fn create(rows: usize, cols: usize, options: PagerOptions) -> Result<Self> {
        options.validate()?;
        fs::create_dir_all(&options.spill_dir)?;
        let namespace = tempfile::Builder::new()
            .prefix("matrix-")
            .keep(!options.remove_on_drop)
            .tempdir_in(&options.spill_dir)?;
        let io = DirSpill::open(namespace.path(), options.sync_on_spill)?;
        let mut pager = Self::with_io(rows, cols, options, Arc::new(io))?;
        debug!(dir = %namespace.path().display(), "pager.namespace");
        pager.namespace = Some(namespace);
        Ok(pager)
    }

    /// Creates a pager on top of a caller-supplied spill store.
    ///
    /// Page ids restart at zero for every pager, so the store must not be
    /// shared with another live pager.
    pub fn with_io(
        rows: usize,
        cols: usize,
        options: PagerOptions,
        io: Arc<dyn SpillIo>,
    ) -> Result<Self> {
        options.validate()?;
        debug!(
            rows,
            cols,
            columns_per_page = options.columns_per_page,
            cache_pages = options.cache_pages,
            "pager.create"
        );
        Ok(Self {
            io,
            rows,
            cols,
            options,
            ingest: IngestBuffer::default(),
            inner: Mutex::new(PagerInner {
                pages: Vec::new(),
                stats: PagerStats::default(),
            }),
            transitions: Condvar::new(),
            namespace: None,
        })
    }

    /// Directory holding this pager's images, when it was created by
    /// [`ColumnPager::create`].
    pub fn spill_path(&self) -> Option<&Path> {
        self.namespace.as_ref().map(TempDir::path)
    }

    /// Elements per column.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Total number of columns.
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Options the pager was created with.
    pub fn options(&self) -> &PagerOptions {
        &self.options
    }

    /// Number of columns accepted so far.
    pub fn ingested(&self) -> usize {
        self.ingest.next_column
    }

    /// Whether every column has been ingested and sealed into a page.
    pub fn is_complete(&self) -> bool {
        self.ingest.next_column == self.cols
    }

    /// Appends the next column.
    ///
    /// `column` must equal the number of columns ingested so far. When the
    /// column fills a page, or is the last column of the matrix, the page is
    /// sealed and spilled. If that spill fails the page is kept resident and
    /// dirty, the column counts as accepted, and the error is returned.
    pub fn ingest(&mut self, column: ColumnId, values: Vec<f64>) -> Result<()> {
        if column.0 >= self.cols {
            return Err(MatrixError::column_out_of_bounds(column.0, self.cols));
        }
        if column.0 != self.ingest.next_column {
            return Err(MatrixError::InvalidArgument(format!(
                "columns must be ingested in order: expected {}, got {}",
                self.ingest.next_column, column
            )));
        }
        if values.len() != self.rows {
            return Err(MatrixError::InvalidArgument(format!(
                "column {} has {} rows, matrix has {}",
                column,
                values.len(),
                self.rows
            )));
        }
        self.ingest.pending.push(values.into_boxed_slice());
        self.ingest.next_column += 1;
        let full = self.ingest.pending.len() == self.options.columns_per_page;
        let last = self.ingest.next_column == self.cols;
        if !(full || last) {
            return Ok(());
        }
        self.seal_pending()
    }

    fn seal_pending(&mut self) -> Result<()> {
        let columns = std::mem::take(&mut self.ingest.pending);
        let col_from = ColumnId(self.ingest.next_column - columns.len());
        let id = PageId(self.ingest.next_page_id);
        self.ingest.next_page_id += 1;
        let mut page = ColumnPage::sealed(id, col_from, columns);
        debug!(
            page = id.0,
            col_from = page.col_from().0,
            col_to = page.col_to().0,
            "pager.seal"
        );
        let written = page
            .image(self.rows)
            .and_then(|image| self.write_image(id, &image));
        let last = self.is_complete();
        let inner = self.inner.get_mut();
        let result = match written {
            Ok(()) => {
                page.mark_spilled();
                inner.stats.spills += 1;
                Ok(())
            }
            Err(err) => {
                inner.stats.spill_failures += 1;
                warn!(page = id.0, error = %err, "pager.seal.spill_failed");
                Err(err)
            }
        };
        inner.pages.push(page);
        if last {
            info!(
                pages = inner.pages.len(),
                cols = self.cols,
                "pager.ingest.complete"
            );
        }
        result
    }

    fn write_image(&self, id: PageId, image: &[u8]) -> Result<()> {
        self.io
            .write_page(id, image)
            .map_err(|source| MatrixError::PersistFailure { page: id, source })
    }

    fn read_image(&self, id: PageId) -> Result<(ImageHeader, Vec<Box<[f64]>>)> {
        let image = self
            .io
            .read_page(id)
            .map_err(|source| MatrixError::ReloadFailure { page: id, source })?;
        decode_image(&image)
    }

    /// Pins `column`, reloading its page if needed, and returns its buffer.
    ///
    /// Every successful call must be matched by one [`ColumnPager::unpin`].
    /// Prefer [`ColumnPager::acquire`], which unpins on drop.
    pub fn pin(&self, column: ColumnId) -> Result<ColumnBuffer> {
        if column.0 >= self.cols {
            return Err(MatrixError::column_out_of_bounds(column.0, self.cols));
        }
        let deadline = self.options.io_wait_timeout.map(|t| Instant::now() + t);
        let mut inner = self.inner.lock();
        loop {
            let idx = inner.locate(column)?;
            let (state, id) = {
                let page = &inner.pages[idx];
                (page.state(), page.id())
            };
            match state {
                PageState::Resident => {
                    inner.stats.hits += 1;
                    return inner.pages[idx].pin(column, Instant::now());
                }
                PageState::Loading | PageState::Spilling => {
                    self.wait_for_transition(&mut inner, id, deadline)?;
                }
                PageState::Spilled => {
                    inner.stats.misses += 1;
                    let plan = self.plan_load(&mut inner, idx)?;
                    let outcome = MutexGuard::unlocked(&mut inner, || self.run_load(&plan));
                    self.commit_load(&mut inner, plan, outcome)?;
                    return inner.pages[idx].pin(column, Instant::now());
                }
            }
        }
    }

    /// Releases one pin on `column`.
    pub fn unpin(&self, column: ColumnId) -> Result<()> {
        let mut inner = self.inner.lock();
        let idx = inner.locate(column)?;
        inner.pages[idx].unpin(column)
    }

    /// Pins `column` for the lifetime of the returned guard.
    pub fn acquire(&self, column: ColumnId) -> Result<ColumnGuard<'_>> {
        let buffer = self.pin(column)?;
        Ok(ColumnGuard {
            pager: self,
            buffer,
            released: false,
        })
    }

    fn wait_for_transition(
        &self,
        inner: &mut MutexGuard<'_, PagerInner>,
        page: PageId,
        deadline: Option<Instant>,
    ) -> Result<()> {
        debug!(page = page.0, "pager.pin.wait_in_flight");
        match deadline {
            Some(deadline) => {
                if self.transitions.wait_until(inner, deadline).timed_out() {
                    return Err(MatrixError::Timeout(page));
                }
            }
            None => self.transitions.wait(inner),
        }
        Ok(())
    }

    fn plan_load(&self, inner: &mut PagerInner, target: usize) -> Result<LoadPlan> {
        let resident = inner.resident_count();
        let capacity = self.options.cache_pages;
        let victim = if resident + 1 > capacity {
            let now = Instant::now();
            let Some(victim) = inner.select_victim(now, self.options.recency_window) else {
                warn!(resident, capacity, "pager.evict.exhausted");
                return Err(MatrixError::ResourceExhausted { resident, capacity });
            };
            let ticket = inner.pages[victim].begin_spill(victim)?;
            inner.stats.evictions += 1;
            debug!(
                victim = ticket.id.0,
                dirty = ticket.dirty,
                resident,
                capacity,
                "pager.evict.victim"
            );
            Some(ticket)
        } else {
            None
        };
        let target_id = inner.pages[target].id();
        if let Err(err) = inner.pages[target].begin_load() {
            if let Some(ticket) = victim.as_ref() {
                inner.pages[ticket.index].finish_spill(false);
            }
            return Err(err);
        }
        Ok(LoadPlan {
            target,
            target_id,
            victim,
        })
    }

    fn run_load(&self, plan: &LoadPlan) -> LoadOutcome {
        let spilled = plan.victim.as_ref().map(|ticket| {
            if !ticket.dirty {
                return Ok(false);
            }
            debug!(page = ticket.id.0, "pager.spill.start");
            ticket
                .encode(self.rows)
                .and_then(|image| self.write_image(ticket.id, &image))
                .map(|()| true)
        });
        if let Some(Err(_)) = spilled {
            return LoadOutcome {
                spilled,
                loaded: None,
            };
        }
        debug!(page = plan.target_id.0, "pager.reload.start");
        LoadOutcome {
            spilled,
            loaded: Some(self.read_image(plan.target_id)),
        }
    }

    fn commit_load(
        &self,
        inner: &mut PagerInner,
        plan: LoadPlan,
        outcome: LoadOutcome,
    ) -> Result<()> {
        let mut first_err = None;
        if let (Some(ticket), Some(spilled)) = (plan.victim.as_ref(), outcome.spilled) {
            match spilled {
                Ok(wrote) => {
                    inner.pages[ticket.index].finish_spill(true);
                    if wrote {
                        inner.stats.spills += 1;
                    } else {
                        inner.stats.clean_evictions += 1;
                    }
                }
                Err(err) => {
                    inner.pages[ticket.index].finish_spill(false);
                    inner.stats.spill_failures += 1;
                    warn!(page = ticket.id.0, error = %err, "pager.spill.error");
                    first_err = Some(err);
                }
            }
        }
        let target = &mut inner.pages[plan.target];
        match outcome.loaded {
            Some(decoded) => match target.finish_load(decoded, self.rows) {
                Ok(()) => {
                    inner.stats.reloads += 1;
                    debug!(page = plan.target_id.0, "pager.reload.complete");
                }
                Err(err) => {
                    inner.stats.reload_failures += 1;
                    warn!(page = plan.target_id.0, error = %err, "pager.reload.error");
                    first_err.get_or_insert(err);
                }
            },
            None => target.abort_load(),
        }
        self.transitions.notify_all();
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Snapshot of pager statistics.
    pub fn stats(&self) -> PagerStats {
        self.inner.lock().stats.clone()
    }

    /// Number of sealed pages.
    pub fn page_count(&self) -> usize {
        self.inner.lock().pages.len()
    }

    /// Number of pages whose buffers are currently in memory.
    pub fn resident_pages(&self) -> usize {
        self.inner
            .lock()
            .pages
            .iter()
            .filter(|page| page.is_loaded())
            .count()
    }

    /// Summaries of every page in column order.
    pub fn pages(&self) -> Vec<PageSummary> {
        self.inner
            .lock()
            .pages
            .iter()
            .map(|page| PageSummary {
                id: page.id(),
                col_from: page.col_from(),
                col_to: page.col_to(),
                state: page.state(),
                pins: page.total_pins(),
                loaded: page.is_loaded(),
                evictable: page.is_evictable(),
            })
            .collect()
    }

    /// Summary of the page holding `column`.
    pub fn page_of(&self, column: ColumnId) -> Result<PageSummary> {
        let idx = self.inner.lock().locate(column)?;
        Ok(self.pages().swap_remove(idx))
    }
}

impl Drop for ColumnPager {
    fn drop(&mut self) {
        if !self.options.remove_on_drop {
            return;
        }
        for page in &self.inner.get_mut().pages {
            if let Err(err) = self.io.remove_page(page.id()) {
                warn!(page = page.id().0, error = %err, "pager.drop.remove_failed");
            }
        }
    }
}

/// Scoped pin on one column; the pin is released when the guard drops.
pub struct ColumnGuard<'a> {
    pager: &'a ColumnPager,
    buffer: ColumnBuffer,
    released: bool,
}

impl<'a> ColumnGuard<'a> {
    /// Pinned column.
    pub fn column(&self) -> ColumnId {
        self.buffer.column()
    }

    /// Shared access to the column values.
    pub fn read(&self) -> RwLockReadGuard<'_, Box<[f64]>> {
        self.buffer.read()
    }

    /// Exclusive access to the column values; marks the page dirty.
    pub fn write(&self) -> RwLockWriteGuard<'_, Box<[f64]>> {
        self.buffer.write()
    }

    /// Copies the column out.
    pub fn to_vec(&self) -> Vec<f64> {
        self.buffer.to_vec()
    }

    /// Releases the pin now, reporting protocol errors instead of logging them.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.pager.unpin(self.buffer.column())
    }
}

impl<'a> Drop for ColumnGuard<'a> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.pager.unpin(self.buffer.column()) {
            warn!(column = self.buffer.column().0, error = %err, "pager.guard.unpin_failed");
        }
    }
}
