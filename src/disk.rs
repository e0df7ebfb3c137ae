//! Synchronous I/O over the page file and the append-only log file.

use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};

use parking_lot::Mutex;

use crate::{PageId, Result, HEADER_PAGE_ID, PAGE_SIZE};

/// Owns the database file and the log file. Page reads and writes are
/// synchronous and whole-page; the log file is append-only.
pub struct DiskManager {
    db_file: Mutex<File>,
    log_file: Mutex<File>,
    next_page_id: AtomicI32,
}

fn open_rw(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    Ok(file)
}

impl DiskManager {
    pub fn open<P: AsRef<Path>>(db_path: P, log_path: P) -> Result<Self> {
        let db_file = open_rw(db_path.as_ref())?;
        let log_file = open_rw(log_path.as_ref())?;

        // Page 0 is always the header page, so allocation starts at 1 even
        // for a brand new file.
        let file_pages = (db_file.metadata()?.len() / PAGE_SIZE as u64) as PageId;
        let next_page_id = file_pages.max(HEADER_PAGE_ID + 1);

        Ok(Self {
            db_file: Mutex::new(db_file),
            log_file: Mutex::new(log_file),
            next_page_id: AtomicI32::new(next_page_id),
        })
    }

    /// Reads one page. A page beyond the end of the file reads as zeroes.
    pub fn read_page(&self, page_id: PageId, buf: &mut [u8; PAGE_SIZE]) -> Result<()> {
        let mut file = self.db_file.lock();
        let offset = page_id as u64 * PAGE_SIZE as u64;
        if offset >= file.metadata()?.len() {
            buf.fill(0);
            return Ok(());
        }
        file.seek(SeekFrom::Start(offset))?;
        let mut read = 0;
        while read < PAGE_SIZE {
            let n = file.read(&mut buf[read..])?;
            if n == 0 {
                buf[read..].fill(0);
                break;
            }
            read += n;
        }
        Ok(())
    }

    pub fn write_page(&self, page_id: PageId, buf: &[u8; PAGE_SIZE]) -> Result<()> {
        let mut file = self.db_file.lock();
        file.seek(SeekFrom::Start(page_id as u64 * PAGE_SIZE as u64))?;
        file.write_all(buf)?;
        file.sync_data()?;
        Ok(())
    }

    pub fn allocate_page(&self) -> PageId {
        self.next_page_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn deallocate_page(&self, _page_id: PageId) {
        // The page file is never shrunk; freed pages are simply forgotten.
    }

    pub fn num_pages(&self) -> PageId {
        self.next_page_id.load(Ordering::SeqCst)
    }

    /// Appends a batch of serialized log records to the log file.
    pub fn write_log(&self, data: &[u8]) -> Result<()> {
        let mut file = self.log_file.lock();
        file.seek(SeekFrom::End(0))?;
        file.write_all(data)?;
        file.sync_data()?;
        Ok(())
    }

    /// Reads up to `buf.len()` bytes of the log file starting at `offset`.
    /// Returns the number of bytes actually read.
    pub fn read_log(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let mut file = self.log_file.lock();
        let len = file.metadata()?.len();
        if offset >= len {
            return Ok(0);
        }
        file.seek(SeekFrom::Start(offset))?;
        let mut read = 0;
        while read < buf.len() {
            let n = file.read(&mut buf[read..])?;
            if n == 0 {
                break;
            }
            read += n;
        }
        Ok(read)
    }
}
