#![allow(missing_docs)]

use std::io::{self, ErrorKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use spill_matrix::primitives::io::{DirSpill, SpillIo};
use spill_matrix::primitives::pager::PageState;
use spill_matrix::{ColumnId, MatrixError, PageId, PagerOptions, Result, SpillMatrix};
use tempfile::{tempdir, TempDir};

/// Spill store that can be told to fail or corrupt I/O.
struct FaultySpill {
    inner: DirSpill,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
    corrupt_reads: AtomicBool,
}

impl FaultySpill {
    fn new(inner: DirSpill) -> Self {
        Self {
            inner,
            fail_writes: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
            corrupt_reads: AtomicBool::new(false),
        }
    }
}

impl SpillIo for FaultySpill {
    fn write_page(&self, id: PageId, image: &[u8]) -> io::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::new(ErrorKind::Other, "injected write failure"));
        }
        self.inner.write_page(id, image)
    }

    fn read_page(&self, id: PageId) -> io::Result<Vec<u8>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(io::Error::new(ErrorKind::Other, "injected read failure"));
        }
        let mut image = self.inner.read_page(id)?;
        if self.corrupt_reads.load(Ordering::SeqCst) {
            if let Some(last) = image.last_mut() {
                *last ^= 0xff;
            }
        }
        Ok(image)
    }

    fn remove_page(&self, id: PageId) -> io::Result<()> {
        self.inner.remove_page(id)
    }
}

fn page_state(matrix: &SpillMatrix, col: usize) -> Result<PageState> {
    Ok(matrix.pager().page_of(ColumnId(col))?.state)
}

struct Harness {
    _dir: TempDir,
    spill: Arc<FaultySpill>,
    matrix: SpillMatrix,
}

impl Harness {
    fn new(rows: usize, cols: usize) -> Result<Self> {
        let dir = tempdir()?;
        let spill = Arc::new(FaultySpill::new(DirSpill::open(dir.path(), false)?));
        let options = PagerOptions {
            columns_per_page: 2,
            cache_pages: 1,
            ..PagerOptions::in_dir(dir.path())
        };
        let matrix = SpillMatrix::with_io(rows, cols, options, spill.clone())?;
        Ok(Self {
            _dir: dir,
            spill,
            matrix,
        })
    }

    fn fill(&mut self) -> Result<()> {
        let rows = self.matrix.num_rows();
        for col in 0..self.matrix.num_cols() {
            self.matrix
                .ingest_column((0..rows).map(|row| (col * 10 + row) as f64).collect())?;
        }
        Ok(())
    }

    fn state(&self, col: usize) -> Result<PageState> {
        page_state(&self.matrix, col)
    }
}

#[test]
fn failed_ingestion_spill_keeps_page_resident() -> Result<()> {
    let mut h = Harness::new(2, 4)?;
    h.spill.fail_writes.store(true, Ordering::SeqCst);
    h.matrix.ingest_column(vec![0.0, 1.0])?;
    let err = h.matrix.ingest_column(vec![10.0, 11.0]).unwrap_err();
    assert!(matches!(err, MatrixError::PersistFailure { page: PageId(0), .. }));
    assert_eq!(h.matrix.ingested(), 2);
    assert_eq!(h.matrix.diagonal(), &[0.0, 11.0]);
    assert_eq!(h.state(0)?, PageState::Resident);
    assert_eq!(h.matrix.get_value(1, 1)?, 11.0);

    h.spill.fail_writes.store(false, Ordering::SeqCst);
    h.matrix.ingest_column(vec![20.0, 21.0])?;
    h.matrix.ingest_column(vec![30.0, 31.0])?;

    assert_eq!(h.matrix.get_value(0, 3)?, 30.0);
    assert_eq!(h.state(0)?, PageState::Spilled);
    assert_eq!(h.matrix.get_value(1, 0)?, 1.0);
    Ok(())
}

#[test]
fn failed_eviction_spill_keeps_victim_and_target_consistent() -> Result<()> {
    let mut h = Harness::new(2, 4)?;
    h.fill()?;
    h.matrix.set_value(0, 0, 42.0)?;

    h.spill.fail_writes.store(true, Ordering::SeqCst);
    let err = h.matrix.get_value(0, 2).unwrap_err();
    assert!(matches!(err, MatrixError::PersistFailure { page: PageId(0), .. }));
    assert_eq!(h.state(0)?, PageState::Resident);
    assert_eq!(h.state(2)?, PageState::Spilled);
    assert_eq!(h.matrix.get_value(0, 0)?, 42.0);

    h.spill.fail_writes.store(false, Ordering::SeqCst);
    assert_eq!(h.matrix.get_value(0, 2)?, 20.0);
    assert_eq!(h.state(0)?, PageState::Spilled);
    assert_eq!(h.matrix.get_value(0, 0)?, 42.0);

    let stats = h.matrix.stats();
    assert_eq!(stats.spill_failures, 1);
    Ok(())
}

#[test]
fn failed_reload_leaves_page_spilled() -> Result<()> {
    let mut h = Harness::new(2, 4)?;
    h.fill()?;
    h.spill.fail_reads.store(true, Ordering::SeqCst);
    let err = h.matrix.acquire_column(1).err().expect("reload should fail");
    match err {
        MatrixError::ReloadFailure { page, source } => {
            assert_eq!(page, PageId(0));
            assert_eq!(source.kind(), ErrorKind::Other);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(h.state(1)?, PageState::Spilled);
    assert!(h.matrix.pages().iter().all(|page| page.pins == 0));

    h.spill.fail_reads.store(false, Ordering::SeqCst);
    assert_eq!(h.matrix.get_value(1, 1)?, 11.0);
    assert_eq!(h.matrix.stats().reload_failures, 1);
    Ok(())
}

#[test]
fn corrupt_image_is_reported() -> Result<()> {
    let mut h = Harness::new(3, 2)?;
    h.fill()?;
    h.spill.corrupt_reads.store(true, Ordering::SeqCst);
    assert!(matches!(
        h.matrix.get_value(0, 0),
        Err(MatrixError::Corruption("page image crc mismatch"))
    ));
    assert_eq!(h.state(0)?, PageState::Spilled);
    Ok(())
}

#[test]
fn missing_image_is_a_reload_failure() -> Result<()> {
    let mut h = Harness::new(2, 2)?;
    h.fill()?;
    h.spill.remove_page(PageId(0))?;
    match h.matrix.get_value(0, 0) {
        Err(MatrixError::ReloadFailure { source, .. }) => {
            assert_eq!(source.kind(), ErrorKind::NotFound)
        }
        other => panic!("unexpected result: {other:?}"),
    }
    Ok(())
}

/// Spill store whose next read parks inside `read_page` until released.
struct GatedSpill {
    inner: DirSpill,
    armed: AtomicBool,
    entered: Barrier,
    release: Barrier,
}

impl GatedSpill {
    fn new(inner: DirSpill) -> Self {
        Self {
            inner,
            armed: AtomicBool::new(false),
            entered: Barrier::new(2),
            release: Barrier::new(2),
        }
    }
}

impl SpillIo for GatedSpill {
    fn write_page(&self, id: PageId, image: &[u8]) -> io::Result<()> {
        self.inner.write_page(id, image)
    }

    fn read_page(&self, id: PageId) -> io::Result<Vec<u8>> {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.entered.wait();
            self.release.wait();
        }
        self.inner.read_page(id)
    }

    fn remove_page(&self, id: PageId) -> io::Result<()> {
        self.inner.remove_page(id)
    }
}

fn gated_matrix(
    dir: &TempDir,
    io_wait_timeout: Option<Duration>,
) -> Result<(Arc<GatedSpill>, SpillMatrix)> {
    let spill = Arc::new(GatedSpill::new(DirSpill::open(dir.path(), false)?));
    let options = PagerOptions {
        columns_per_page: 2,
        cache_pages: 1,
        io_wait_timeout,
        ..PagerOptions::in_dir(dir.path())
    };
    let mut matrix = SpillMatrix::with_io(2, 2, options, spill.clone())?;
    matrix.ingest_column(vec![1.0, 2.0])?;
    matrix.ingest_column(vec![3.0, 4.0])?;
    spill.armed.store(true, Ordering::SeqCst);
    Ok((spill, matrix))
}

#[test]
fn second_pinner_waits_for_in_flight_load() -> Result<()> {
    let dir = tempdir()?;
    let (spill, matrix) = gated_matrix(&dir, None)?;
    thread::scope(|scope| -> Result<()> {
        let loader = scope.spawn(|| matrix.get_value(0, 0));
        spill.entered.wait();
        assert_eq!(page_state(&matrix, 1)?, PageState::Loading);

        let waiter = scope.spawn(|| matrix.get_value(1, 1));
        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        spill.release.wait();
        assert_eq!(loader.join().expect("loader panicked")?, 1.0);
        assert_eq!(waiter.join().expect("waiter panicked")?, 4.0);
        Ok(())
    })?;

    let stats = matrix.stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.reloads, 1);
    assert_eq!(stats.hits, 1);
    assert_eq!(page_state(&matrix, 0)?, PageState::Resident);
    Ok(())
}

#[test]
fn in_flight_wait_times_out() -> Result<()> {
    let dir = tempdir()?;
    let (spill, matrix) = gated_matrix(&dir, Some(Duration::from_millis(10)))?;
    thread::scope(|scope| -> Result<()> {
        let loader = scope.spawn(|| matrix.get_value(0, 1));
        spill.entered.wait();

        let err = matrix.get_value(1, 0).unwrap_err();
        assert!(matches!(err, MatrixError::Timeout(PageId(0))));
        assert!(err.is_retryable());
        assert_eq!(page_state(&matrix, 0)?, PageState::Loading);
        assert_eq!(matrix.pages()[0].pins, 0);

        spill.release.wait();
        assert_eq!(loader.join().expect("loader panicked")?, 3.0);
        Ok(())
    })?;

    assert_eq!(page_state(&matrix, 0)?, PageState::Resident);
    assert_eq!(matrix.get_value(1, 0)?, 2.0);
    Ok(())
}
