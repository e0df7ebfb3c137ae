//! Page frames and latch guards.
//!
//! A [`Page`] is a buffer pool frame: a fixed-size byte buffer behind a
//! reader/writer latch, plus the pin count and dirty flag the pool needs.
//! Latches come in two flavours: short-lived borrows ([`Page::read`] /
//! [`Page::write`]) for single-page work, and owned arc-guards
//! ([`Page::read_latch`] / [`Page::write_latch`]) that can be stored in a
//! transaction's page set while a tree operation crosses call frames.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{Lsn, PageId, INVALID_PAGE_ID, PAGE_SIZE};

pub type PageReadGuard = ArcRwLockReadGuard<RawRwLock, PageData>;
pub type PageWriteGuard = ArcRwLockWriteGuard<RawRwLock, PageData>;

/// Byte offset of the page LSN. Every formatted page kind reserves this
/// field in its header so the buffer pool can enforce the WAL rule without
/// knowing what the page contains.
const LSN_OFFSET: usize = 4;

/// The raw content of a page, with little-endian field accessors.
pub struct PageData {
    bytes: [u8; PAGE_SIZE],
}

impl PageData {
    fn zeroed() -> Self {
        Self {
            bytes: [0; PAGE_SIZE],
        }
    }

    pub fn bytes(&self) -> &[u8; PAGE_SIZE] {
        &self.bytes
    }

    pub fn bytes_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        &mut self.bytes
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        let mut b = [0u8; 4];
        b.copy_from_slice(&self.bytes[offset..offset + 4]);
        u32::from_le_bytes(b)
    }

    pub fn write_u32(&mut self, offset: usize, value: u32) {
        self.bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn read_i32(&self, offset: usize) -> i32 {
        self.read_u32(offset) as i32
    }

    pub fn write_i32(&mut self, offset: usize, value: i32) {
        self.write_u32(offset, value as u32);
    }

    pub fn lsn(&self) -> Lsn {
        self.read_i32(LSN_OFFSET)
    }

    pub fn set_lsn(&mut self, lsn: Lsn) {
        self.write_i32(LSN_OFFSET, lsn);
    }
}

/// A buffer pool frame.
pub struct Page {
    id: AtomicI32,
    pin_count: AtomicI32,
    is_dirty: AtomicBool,
    data: Arc<RwLock<PageData>>,
}

impl Page {
    pub(crate) fn new() -> Self {
        Self {
            id: AtomicI32::new(INVALID_PAGE_ID),
            pin_count: AtomicI32::new(0),
            is_dirty: AtomicBool::new(false),
            data: Arc::new(RwLock::new(PageData::zeroed())),
        }
    }

    pub fn id(&self) -> PageId {
        self.id.load(Ordering::SeqCst)
    }

    pub(crate) fn set_id(&self, id: PageId) {
        self.id.store(id, Ordering::SeqCst);
    }

    pub fn pin_count(&self) -> i32 {
        self.pin_count.load(Ordering::SeqCst)
    }

    pub(crate) fn pin(&self) {
        self.pin_count.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn unpin(&self) -> i32 {
        self.pin_count.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub(crate) fn set_pin_count(&self, n: i32) {
        self.pin_count.store(n, Ordering::SeqCst);
    }

    pub fn is_dirty(&self) -> bool {
        self.is_dirty.load(Ordering::SeqCst)
    }

    pub(crate) fn set_dirty(&self, dirty: bool) {
        self.is_dirty.store(dirty, Ordering::SeqCst);
    }

    /// Short read latch, released at the end of the borrow.
    pub fn read(&self) -> RwLockReadGuard<'_, PageData> {
        self.data.read()
    }

    /// Short write latch, released at the end of the borrow.
    pub fn write(&self) -> RwLockWriteGuard<'_, PageData> {
        self.data.write()
    }

    /// Owned read latch for hand-over-hand traversal.
    pub fn read_latch(&self) -> PageReadGuard {
        self.data.read_arc()
    }

    /// Owned write latch for hand-over-hand traversal.
    pub fn write_latch(&self) -> PageWriteGuard {
        self.data.write_arc()
    }

    /// The page LSN, read under a short latch.
    pub fn lsn(&self) -> Lsn {
        self.data.read().lsn()
    }
}

/// An owned page latch of either flavour.
pub enum PageGuard {
    Read(PageReadGuard),
    Write(PageWriteGuard),
}

impl PageGuard {
    pub fn data(&self) -> &PageData {
        match self {
            PageGuard::Read(g) => g,
            PageGuard::Write(g) => g,
        }
    }

    pub fn data_mut(&mut self) -> &mut PageData {
        match self {
            PageGuard::Read(_) => unreachable!("write access through a read latch"),
            PageGuard::Write(g) => g,
        }
    }
}

/// A pinned page together with the latch held on it. Stored in the
/// transaction page set during index operations; the latch is dropped and
/// the pin returned when the set is released.
pub struct LatchedPage {
    pub page: Arc<Page>,
    pub guard: PageGuard,
}

impl LatchedPage {
    pub fn id(&self) -> PageId {
        self.page.id()
    }

    pub fn data(&self) -> &PageData {
        self.guard.data()
    }

    pub fn data_mut(&mut self) -> &mut PageData {
        self.guard.data_mut()
    }
}
