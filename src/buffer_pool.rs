//! Manages the buffer pool: a fixed array of frames caching disk pages.
//!
//! The page table mapping page ids to frames is the extendible hash
//! directory; eviction picks the least recently unpinned frame. Dirty
//! victims are written back under the WAL rule: a page whose LSN is past
//! the log's persistent LSN forces a log flush before it may reach disk.

use std::collections::VecDeque;
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::disk::DiskManager;
use crate::extendible_hash::ExtendibleHashTable;
use crate::lru_replacer::LruReplacer;
use crate::page::Page;
use crate::wal::LogManager;
use crate::{Error, PageId, Result, INVALID_PAGE_ID};

const PAGE_TABLE_BUCKET_CAPACITY: usize = 8;

struct PoolInner {
    page_table: ExtendibleHashTable<PageId, usize>,
    free_list: VecDeque<usize>,
    replacer: LruReplacer<usize>,
}

pub struct BufferPoolManager {
    disk: Arc<DiskManager>,
    log: Option<Arc<LogManager>>,
    frames: Vec<Arc<Page>>,
    inner: Mutex<PoolInner>,
}

impl BufferPoolManager {
    pub fn new(pool_size: usize, disk: Arc<DiskManager>, log: Option<Arc<LogManager>>) -> Self {
        let frames = (0..pool_size).map(|_| Arc::new(Page::new())).collect();
        Self {
            disk,
            log,
            frames,
            inner: Mutex::new(PoolInner {
                page_table: ExtendibleHashTable::new(PAGE_TABLE_BUCKET_CAPACITY),
                free_list: (0..pool_size).collect(),
                replacer: LruReplacer::new(),
            }),
        }
    }

    pub fn disk(&self) -> &Arc<DiskManager> {
        &self.disk
    }

    pub fn pool_size(&self) -> usize {
        self.frames.len()
    }

    /// Pins and returns the page, reading it from disk on a miss.
    pub fn fetch_page(&self, page_id: PageId) -> Result<Arc<Page>> {
        let mut inner = self.inner.lock();
        if let Some(idx) = inner.page_table.find(&page_id) {
            let frame = Arc::clone(&self.frames[idx]);
            frame.pin();
            inner.replacer.erase(&idx);
            return Ok(frame);
        }

        let idx = self.acquire_frame(&mut inner)?;
        let frame = Arc::clone(&self.frames[idx]);
        {
            let mut data = frame.write();
            let read = self.disk.read_page(page_id, data.bytes_mut());
            drop(data);
            if let Err(e) = read {
                inner.free_list.push_back(idx);
                return Err(e);
            }
        }
        frame.set_id(page_id);
        frame.set_dirty(false);
        frame.set_pin_count(1);
        inner.page_table.insert(page_id, idx);
        Ok(frame)
    }

    /// Allocates a fresh zeroed page on disk and pins it.
    pub fn new_page(&self) -> Result<Arc<Page>> {
        let mut inner = self.inner.lock();
        let idx = self.acquire_frame(&mut inner)?;
        let page_id = self.disk.allocate_page();
        let frame = Arc::clone(&self.frames[idx]);
        frame.write().bytes_mut().fill(0);
        frame.set_id(page_id);
        frame.set_dirty(false);
        frame.set_pin_count(1);
        inner.page_table.insert(page_id, idx);
        debug!("allocated page {page_id} in frame {idx}");
        Ok(frame)
    }

    /// Drops one pin. When the count reaches zero the frame becomes an
    /// eviction candidate. Returns false if the page is not resident or was
    /// not pinned.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let inner = self.inner.lock();
        let Some(idx) = inner.page_table.find(&page_id) else {
            return false;
        };
        let frame = &self.frames[idx];
        if is_dirty {
            frame.set_dirty(true);
        }
        if frame.pin_count() <= 0 {
            return false;
        }
        if frame.unpin() == 0 {
            inner.replacer.insert(idx);
        }
        true
    }

    /// Writes the page to disk now if it is resident and dirty.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        let inner = self.inner.lock();
        let Some(idx) = inner.page_table.find(&page_id) else {
            return Ok(false);
        };
        let frame = &self.frames[idx];
        if frame.is_dirty() {
            self.write_back(frame)?;
        }
        Ok(true)
    }

    pub fn flush_all_pages(&self) -> Result<()> {
        let _inner = self.inner.lock();
        for frame in &self.frames {
            if frame.id() != INVALID_PAGE_ID && frame.is_dirty() {
                self.write_back(frame)?;
            }
        }
        Ok(())
    }

    /// Removes the page from the pool and deallocates it on disk. Refuses
    /// while the page is pinned.
    pub fn delete_page(&self, page_id: PageId) -> Result<bool> {
        let mut inner = self.inner.lock();
        if let Some(idx) = inner.page_table.find(&page_id) {
            let frame = &self.frames[idx];
            if frame.pin_count() > 0 {
                return Ok(false);
            }
            inner.page_table.remove(&page_id);
            inner.replacer.erase(&idx);
            frame.set_dirty(false);
            frame.set_id(INVALID_PAGE_ID);
            inner.free_list.push_back(idx);
        }
        self.disk.deallocate_page(page_id);
        Ok(true)
    }

    fn acquire_frame(&self, inner: &mut PoolInner) -> Result<usize> {
        if let Some(idx) = inner.free_list.pop_front() {
            return Ok(idx);
        }
        let idx = inner.replacer.victim().ok_or(Error::OutOfFrames)?;
        let frame = &self.frames[idx];
        if frame.is_dirty() {
            if let Err(e) = self.write_back(frame) {
                inner.replacer.insert(idx);
                return Err(e);
            }
        }
        debug!("evicting page {} from frame {idx}", frame.id());
        inner.page_table.remove(&frame.id());
        Ok(idx)
    }

    /// Write-ahead rule: the log must be durable up to the page's LSN
    /// before the page itself goes to disk.
    fn write_back(&self, frame: &Arc<Page>) -> Result<()> {
        if let Some(log) = &self.log {
            if log.is_enabled() && frame.lsn() > log.persistent_lsn() {
                log.flush(true);
            }
        }
        let data = frame.read();
        self.disk.write_page(frame.id(), data.bytes())?;
        frame.set_dirty(false);
        Ok(())
    }
}
