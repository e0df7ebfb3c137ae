//! The slotted table page and the table heap built over it.
//!
//! A table page keeps a slot array growing down from the header and tuple
//! bytes growing up from the end. Deletes are two-phase: `mark_delete`
//! tombstones the slot and `apply_delete` vacates it at commit;
//! `rollback_delete` clears the tombstone on abort. Pages chain through
//! prev/next page ids, and every mutation made on behalf of a transaction
//! is logged, tags the page LSN, and (while the transaction is still
//! growing) records an undo entry in its write set.

use std::sync::Arc;

use log::debug;

use crate::buffer_pool::BufferPoolManager;
use crate::page::PageData;
use crate::transaction::{Transaction, TransactionState, WriteRecord, WriteType};
use crate::wal::{LogManager, LogRecord, LogRecordBody};
use crate::{PageId, Result, Rid, INVALID_PAGE_ID, PAGE_SIZE};

/// An uninterpreted tuple: the engine stores and recovers bytes; schema is
/// someone else's problem.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Tuple {
    data: Vec<u8>,
}

impl Tuple {
    pub fn from_bytes(data: &[u8]) -> Self {
        Self {
            data: data.to_vec(),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Wire form: u32 length prefix, then the bytes.
    pub fn serialized_size(&self) -> usize {
        4 + self.data.len()
    }

    pub fn serialize_into(&self, buf: &mut [u8]) {
        buf[..4].copy_from_slice(&(self.data.len() as u32).to_le_bytes());
        buf[4..4 + self.data.len()].copy_from_slice(&self.data);
    }

    /// Returns the tuple and the number of bytes consumed.
    pub fn deserialize(buf: &[u8]) -> Option<(Tuple, usize)> {
        if buf.len() < 4 {
            return None;
        }
        let mut b = [0u8; 4];
        b.copy_from_slice(&buf[..4]);
        let len = u32::from_le_bytes(b) as usize;
        if buf.len() < 4 + len {
            return None;
        }
        Some((Tuple::from_bytes(&buf[4..4 + len]), 4 + len))
    }
}

const OFF_PAGE_ID: usize = 0;
const OFF_PREV: usize = 8;
const OFF_NEXT: usize = 12;
const OFF_FREE_PTR: usize = 16;
const OFF_COUNT: usize = 20;
const SLOTS_START: usize = 24;
const SLOT_SIZE: usize = 8;
/// High bit of a slot's length marks a tombstone; length zero is a vacated
/// slot.
const DELETE_MASK: u32 = 0x8000_0000;

/// Read-only view over table page bytes.
pub struct TablePageRef<'a> {
    data: &'a PageData,
}

/// Mutable view over table page bytes.
pub struct TablePageMut<'a> {
    data: &'a mut PageData,
}

impl<'a> TablePageRef<'a> {
    pub fn new(data: &'a PageData) -> Self {
        Self { data }
    }

    pub fn page_id(&self) -> PageId {
        self.data.read_i32(OFF_PAGE_ID)
    }

    pub fn prev_page_id(&self) -> PageId {
        self.data.read_i32(OFF_PREV)
    }

    pub fn next_page_id(&self) -> PageId {
        self.data.read_i32(OFF_NEXT)
    }

    pub fn tuple_count(&self) -> u32 {
        self.data.read_u32(OFF_COUNT)
    }

    fn free_ptr(&self) -> usize {
        self.data.read_u32(OFF_FREE_PTR) as usize
    }

    fn slot(&self, slot: u32) -> (usize, u32) {
        let base = SLOTS_START + slot as usize * SLOT_SIZE;
        (
            self.data.read_u32(base) as usize,
            self.data.read_u32(base + 4),
        )
    }

    pub fn is_marked(&self, slot: u32) -> bool {
        if slot >= self.tuple_count() {
            return false;
        }
        self.slot(slot).1 & DELETE_MASK != 0
    }

    /// The live tuple at `slot`; tombstoned and vacated slots read as
    /// absent.
    pub fn get_tuple(&self, slot: u32) -> Option<Tuple> {
        if slot >= self.tuple_count() {
            return None;
        }
        let (offset, raw_len) = self.slot(slot);
        if raw_len == 0 || raw_len & DELETE_MASK != 0 {
            return None;
        }
        Some(Tuple::from_bytes(
            &self.data.bytes()[offset..offset + raw_len as usize],
        ))
    }

    /// The stored bytes at `slot` regardless of a tombstone. Used when a
    /// delete is logged or rolled back.
    pub fn raw_tuple(&self, slot: u32) -> Option<Tuple> {
        if slot >= self.tuple_count() {
            return None;
        }
        let (offset, raw_len) = self.slot(slot);
        if raw_len == 0 {
            return None;
        }
        let len = (raw_len & !DELETE_MASK) as usize;
        Some(Tuple::from_bytes(&self.data.bytes()[offset..offset + len]))
    }
}

impl<'a> TablePageMut<'a> {
    pub fn new(data: &'a mut PageData) -> Self {
        Self { data }
    }

    pub fn as_ref(&self) -> TablePageRef<'_> {
        TablePageRef { data: self.data }
    }

    pub fn init(&mut self, page_id: PageId, prev_page_id: PageId) {
        self.data.bytes_mut().fill(0);
        self.data.write_i32(OFF_PAGE_ID, page_id);
        self.data.write_i32(OFF_PREV, prev_page_id);
        self.data.write_i32(OFF_NEXT, INVALID_PAGE_ID);
        self.data.write_u32(OFF_FREE_PTR, PAGE_SIZE as u32);
        self.data.write_u32(OFF_COUNT, 0);
    }

    pub fn set_next_page_id(&mut self, next: PageId) {
        self.data.write_i32(OFF_NEXT, next);
    }

    fn set_slot(&mut self, slot: u32, offset: u32, raw_len: u32) {
        let base = SLOTS_START + slot as usize * SLOT_SIZE;
        self.data.write_u32(base, offset);
        self.data.write_u32(base + 4, raw_len);
    }

    /// Places the tuple in the first vacated slot, or a fresh one. None
    /// when the page is out of space.
    pub fn insert_tuple(&mut self, tuple: &Tuple) -> Option<u32> {
        debug_assert!(!tuple.is_empty());
        let count = self.as_ref().tuple_count();
        let reused = (0..count).find(|&i| self.as_ref().slot(i).1 == 0);
        let slot_space = if reused.is_some() { 0 } else { SLOT_SIZE };
        let slots_end = SLOTS_START + count as usize * SLOT_SIZE + slot_space;
        let free_ptr = self.as_ref().free_ptr();
        if free_ptr < slots_end + tuple.len() {
            return None;
        }

        let offset = free_ptr - tuple.len();
        self.data.bytes_mut()[offset..offset + tuple.len()].copy_from_slice(tuple.data());
        let slot = match reused {
            Some(s) => s,
            None => {
                self.data.write_u32(OFF_COUNT, count + 1);
                count
            }
        };
        self.set_slot(slot, offset as u32, tuple.len() as u32);
        self.data.write_u32(OFF_FREE_PTR, offset as u32);
        Some(slot)
    }

    /// Re-inserts a tuple at a known slot. Recovery uses this to redo an
    /// insert and to undo an applied delete at the tuple's original RID.
    pub fn insert_tuple_at(&mut self, slot: u32, tuple: &Tuple) -> bool {
        let mut count = self.as_ref().tuple_count();
        while count <= slot {
            if self.as_ref().free_ptr() < SLOTS_START + (count as usize + 1) * SLOT_SIZE {
                return false;
            }
            self.set_slot(count, 0, 0);
            count += 1;
            self.data.write_u32(OFF_COUNT, count);
        }
        if self.as_ref().slot(slot).1 != 0 {
            return false;
        }
        let slots_end = SLOTS_START + count as usize * SLOT_SIZE;
        let free_ptr = self.as_ref().free_ptr();
        if free_ptr < slots_end + tuple.len() {
            return false;
        }
        let offset = free_ptr - tuple.len();
        self.data.bytes_mut()[offset..offset + tuple.len()].copy_from_slice(tuple.data());
        self.set_slot(slot, offset as u32, tuple.len() as u32);
        self.data.write_u32(OFF_FREE_PTR, offset as u32);
        true
    }

    pub fn mark_delete(&mut self, slot: u32) -> bool {
        if slot >= self.as_ref().tuple_count() {
            return false;
        }
        let (offset, raw_len) = self.as_ref().slot(slot);
        if raw_len == 0 {
            return false;
        }
        self.set_slot(slot, offset as u32, raw_len | DELETE_MASK);
        true
    }

    pub fn rollback_delete(&mut self, slot: u32) -> bool {
        if slot >= self.as_ref().tuple_count() {
            return false;
        }
        let (offset, raw_len) = self.as_ref().slot(slot);
        if raw_len == 0 {
            return false;
        }
        self.set_slot(slot, offset as u32, raw_len & !DELETE_MASK);
        true
    }

    /// Vacates the slot. The bytes stay behind unreferenced; space is not
    /// compacted.
    pub fn apply_delete(&mut self, slot: u32) -> bool {
        if slot >= self.as_ref().tuple_count() {
            return false;
        }
        if self.as_ref().slot(slot).1 == 0 {
            return false;
        }
        self.set_slot(slot, 0, 0);
        true
    }

    /// Overwrites in place when the new tuple fits, otherwise relocates it
    /// within the page. False when neither works or the slot is vacant.
    pub fn update_tuple(&mut self, slot: u32, tuple: &Tuple) -> bool {
        if slot >= self.as_ref().tuple_count() {
            return false;
        }
        let (offset, raw_len) = self.as_ref().slot(slot);
        if raw_len == 0 {
            return false;
        }
        let mark = raw_len & DELETE_MASK;
        let capacity = (raw_len & !DELETE_MASK) as usize;

        if tuple.len() <= capacity {
            self.data.bytes_mut()[offset..offset + tuple.len()].copy_from_slice(tuple.data());
            self.set_slot(slot, offset as u32, tuple.len() as u32 | mark);
            return true;
        }

        let count = self.as_ref().tuple_count();
        let slots_end = SLOTS_START + count as usize * SLOT_SIZE;
        let free_ptr = self.as_ref().free_ptr();
        if free_ptr < slots_end + tuple.len() {
            return false;
        }
        let new_offset = free_ptr - tuple.len();
        self.data.bytes_mut()[new_offset..new_offset + tuple.len()].copy_from_slice(tuple.data());
        self.set_slot(slot, new_offset as u32, tuple.len() as u32 | mark);
        self.data.write_u32(OFF_FREE_PTR, new_offset as u32);
        true
    }
}

/// A heap of tuples spread over a chain of table pages.
pub struct TableHeap {
    bpm: Arc<BufferPoolManager>,
    log: Option<Arc<LogManager>>,
    first_page_id: PageId,
}

impl TableHeap {
    /// Creates the heap with one empty page, logged as a NEWPAGE with no
    /// predecessor.
    pub fn new(
        bpm: Arc<BufferPoolManager>,
        log: Option<Arc<LogManager>>,
        txn: &Transaction,
    ) -> Result<Arc<Self>> {
        let page = bpm.new_page()?;
        let page_id = page.id();
        let heap = Arc::new(Self {
            bpm: Arc::clone(&bpm),
            log,
            first_page_id: page_id,
        });
        {
            let mut data = page.write();
            TablePageMut::new(&mut data).init(page_id, INVALID_PAGE_ID);
            heap.log_and_tag(
                &mut data,
                txn,
                LogRecordBody::NewPage {
                    prev_page_id: INVALID_PAGE_ID,
                    page_id,
                },
            );
        }
        bpm.unpin_page(page_id, true);
        debug!("table heap created, first page {page_id}");
        Ok(heap)
    }

    /// Opens an existing heap rooted at `first_page_id`, e.g. after
    /// recovery.
    pub fn open(
        bpm: Arc<BufferPoolManager>,
        log: Option<Arc<LogManager>>,
        first_page_id: PageId,
    ) -> Arc<Self> {
        Arc::new(Self {
            bpm,
            log,
            first_page_id,
        })
    }

    pub fn first_page_id(&self) -> PageId {
        self.first_page_id
    }

    /// Appends the WAL record for a page mutation, links it into the
    /// transaction's chain, and tags the page with the new LSN.
    fn log_and_tag(&self, data: &mut PageData, txn: &Transaction, body: LogRecordBody) {
        if let Some(log) = &self.log {
            if log.is_enabled() {
                let mut record = LogRecord::new(txn.id(), txn.prev_lsn(), body);
                let lsn = log.append_log_record(&mut record);
                txn.set_prev_lsn(lsn);
                data.set_lsn(lsn);
            }
        }
    }

    fn record_write(self: &Arc<Self>, txn: &Transaction, rid: Rid, wtype: WriteType, tuple: Tuple) {
        // Rollback and commit paths reuse the mutation methods; only a
        // still-growing transaction accumulates undo entries.
        if txn.state() == TransactionState::Growing {
            txn.push_write_record(WriteRecord {
                table: Arc::clone(self),
                rid,
                wtype,
                tuple,
            });
        }
    }

    /// Inserts at the first page with room, growing the chain when every
    /// page is full.
    pub fn insert_tuple(self: &Arc<Self>, tuple: &Tuple, txn: &Transaction) -> Result<Rid> {
        let mut page_id = self.first_page_id;
        loop {
            let page = self.bpm.fetch_page(page_id)?;
            let mut data = page.write();

            let inserted = TablePageMut::new(&mut data).insert_tuple(tuple);
            if let Some(slot) = inserted {
                let rid = Rid::new(page_id, slot);
                self.log_and_tag(
                    &mut data,
                    txn,
                    LogRecordBody::Insert {
                        rid,
                        tuple: tuple.clone(),
                    },
                );
                drop(data);
                self.bpm.unpin_page(page_id, true);
                self.record_write(txn, rid, WriteType::Insert, tuple.clone());
                return Ok(rid);
            }

            let next = TablePageRef::new(&data).next_page_id();
            if next != INVALID_PAGE_ID {
                drop(data);
                self.bpm.unpin_page(page_id, false);
                page_id = next;
                continue;
            }

            // End of the chain: grow it by one page.
            let new_page = match self.bpm.new_page() {
                Ok(p) => p,
                Err(e) => {
                    drop(data);
                    self.bpm.unpin_page(page_id, false);
                    return Err(e);
                }
            };
            let new_page_id = new_page.id();
            {
                let mut new_data = new_page.write();
                TablePageMut::new(&mut new_data).init(new_page_id, page_id);
                self.log_and_tag(
                    &mut new_data,
                    txn,
                    LogRecordBody::NewPage {
                        prev_page_id: page_id,
                        page_id: new_page_id,
                    },
                );
            }
            TablePageMut::new(&mut data).set_next_page_id(new_page_id);
            drop(data);
            self.bpm.unpin_page(page_id, true);
            self.bpm.unpin_page(new_page_id, true);
            page_id = new_page_id;
        }
    }

    /// Tombstones the tuple; the physical removal happens at commit.
    pub fn mark_delete(self: &Arc<Self>, rid: Rid, txn: &Transaction) -> Result<bool> {
        let page = self.bpm.fetch_page(rid.page_id)?;
        let mut data = page.write();
        let Some(old) = TablePageRef::new(&data).get_tuple(rid.slot) else {
            drop(data);
            self.bpm.unpin_page(rid.page_id, false);
            return Ok(false);
        };
        TablePageMut::new(&mut data).mark_delete(rid.slot);
        self.log_and_tag(
            &mut data,
            txn,
            LogRecordBody::MarkDelete {
                rid,
                tuple: old.clone(),
            },
        );
        drop(data);
        self.bpm.unpin_page(rid.page_id, true);
        self.record_write(txn, rid, WriteType::Delete, old);
        Ok(true)
    }

    /// Clears a tombstone during abort.
    pub fn rollback_delete(self: &Arc<Self>, rid: Rid, txn: &Transaction) -> Result<()> {
        let page = self.bpm.fetch_page(rid.page_id)?;
        let mut data = page.write();
        let tuple = TablePageRef::new(&data)
            .raw_tuple(rid.slot)
            .unwrap_or_default();
        TablePageMut::new(&mut data).rollback_delete(rid.slot);
        self.log_and_tag(&mut data, txn, LogRecordBody::RollbackDelete { rid, tuple });
        drop(data);
        self.bpm.unpin_page(rid.page_id, true);
        Ok(())
    }

    /// Physically removes the tuple. Called at commit for tombstoned
    /// tuples, and at abort to revoke the transaction's own inserts.
    pub fn apply_delete(self: &Arc<Self>, rid: Rid, txn: &Transaction) -> Result<()> {
        let page = self.bpm.fetch_page(rid.page_id)?;
        let mut data = page.write();
        let tuple = TablePageRef::new(&data)
            .raw_tuple(rid.slot)
            .unwrap_or_default();
        TablePageMut::new(&mut data).apply_delete(rid.slot);
        self.log_and_tag(&mut data, txn, LogRecordBody::ApplyDelete { rid, tuple });
        drop(data);
        self.bpm.unpin_page(rid.page_id, true);
        Ok(())
    }

    pub fn update_tuple(self: &Arc<Self>, tuple: &Tuple, rid: Rid, txn: &Transaction) -> Result<bool> {
        let page = self.bpm.fetch_page(rid.page_id)?;
        let mut data = page.write();
        let Some(old) = TablePageRef::new(&data).get_tuple(rid.slot) else {
            drop(data);
            self.bpm.unpin_page(rid.page_id, false);
            return Ok(false);
        };
        if !TablePageMut::new(&mut data).update_tuple(rid.slot, tuple) {
            drop(data);
            self.bpm.unpin_page(rid.page_id, false);
            return Ok(false);
        }
        self.log_and_tag(
            &mut data,
            txn,
            LogRecordBody::Update {
                rid,
                old_tuple: old.clone(),
                new_tuple: tuple.clone(),
            },
        );
        drop(data);
        self.bpm.unpin_page(rid.page_id, true);
        self.record_write(txn, rid, WriteType::Update, old);
        Ok(true)
    }

    pub fn get_tuple(&self, rid: Rid) -> Result<Option<Tuple>> {
        let page = self.bpm.fetch_page(rid.page_id)?;
        let tuple = TablePageRef::new(&page.read()).get_tuple(rid.slot);
        self.bpm.unpin_page(rid.page_id, false);
        Ok(tuple)
    }
}
