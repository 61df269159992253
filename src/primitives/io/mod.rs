#![forbid(unsafe_code)]

use std::{
    fs::{self, File, OpenOptions},
    io::{self, ErrorKind, Read, Write},
    path::{Path, PathBuf},
};

use crate::types::PageId;

#[cfg(test)]
macro_rules! io_test_log {
    ($($arg:tt)*) => {
        eprintln!($($arg)*);
    };
}

#[cfg(not(test))]
macro_rules! io_test_log {
    ($($arg:tt)*) => {
        if false {
            let _ = format_args!($($arg)*);
        }
    };
}

/// Durable storage for spilled page images, keyed by page id.
///
/// Methods return raw `io::Result` so the pager can attach the page identity
/// and classify the failure as a persist or reload error.
pub trait SpillIo: Send + Sync + 'static {
    /// Writes the full image of a page, replacing any previous version.
    fn write_page(&self, id: PageId, image: &[u8]) -> io::Result<()>;
    /// Reads the full image of a page.
    fn read_page(&self, id: PageId) -> io::Result<Vec<u8>>;
    /// Removes a page image. Missing images are not an error.
    fn remove_page(&self, id: PageId) -> io::Result<()>;
}

/// Directory-backed spill storage: one file per page.
#[derive(Clone, Debug)]
pub struct DirSpill {
    dir: PathBuf,
    sync: bool,
}

impl DirSpill {
    /// Opens (creating if needed) a spill directory.
    pub fn open(dir: impl AsRef<Path>, sync: bool) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, sync })
    }

    /// Directory holding the page images.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the image for `id`.
    pub fn page_path(&self, id: PageId) -> PathBuf {
        self.dir.join(format!("page-{:016x}.spill", id.0))
    }
}

impl SpillIo for DirSpill {
    fn write_page(&self, id: PageId, image: &[u8]) -> io::Result<()> {
        let path = self.page_path(id);
        let mut tmp = path.clone();
        tmp.set_extension("tmp");
        io_test_log!("[io.write_page] start id={} len={}", id.0, image.len());
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(image)?;
            if self.sync {
                file.sync_all()?;
            }
        }
        fs::rename(&tmp, &path)?;
        io_test_log!("[io.write_page] complete id={}", id.0);
        Ok(())
    }

    fn read_page(&self, id: PageId) -> io::Result<Vec<u8>> {
        let mut file = File::open(self.page_path(id))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        io_test_log!("[io.read_page] id={} len={}", id.0, buf.len());
        Ok(buf)
    }

    fn remove_page(&self, id: PageId) -> io::Result<()> {
        match fs::remove_file(self.page_path(id)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }
}
