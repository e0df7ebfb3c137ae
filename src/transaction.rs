//! Transactions and the transaction manager.
//!
//! A transaction tracks its two-phase-locking state, the RIDs it holds
//! locks on, a write set of undo records, the page latches it holds during
//! an index operation, and the tail of its WAL record chain.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::lock_manager::LockManager;
use crate::page::LatchedPage;
use crate::table::{TableHeap, Tuple};
use crate::wal::{LogManager, LogRecord, LogRecordBody};
use crate::{Lsn, PageId, Result, Rid, TxnId, INVALID_LSN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteType {
    Insert,
    Delete,
    Update,
}

/// One undo entry. `tuple` is the pre-image for updates and the deleted
/// image for deletes.
pub struct WriteRecord {
    pub table: Arc<TableHeap>,
    pub rid: Rid,
    pub wtype: WriteType,
    pub tuple: Tuple,
}

pub struct Transaction {
    id: TxnId,
    state: Mutex<TransactionState>,
    prev_lsn: AtomicI32,
    shared_lock_set: Mutex<HashSet<Rid>>,
    exclusive_lock_set: Mutex<HashSet<Rid>>,
    write_set: Mutex<Vec<WriteRecord>>,
    /// Pages latched by the index operation in flight, in acquisition
    /// order.
    pub(crate) page_set: Mutex<Vec<LatchedPage>>,
    /// Index pages emptied by the operation, deleted when the page set is
    /// released.
    pub(crate) deleted_pages: Mutex<HashSet<PageId>>,
}

impl Transaction {
    pub fn new(id: TxnId) -> Self {
        Self {
            id,
            state: Mutex::new(TransactionState::Growing),
            prev_lsn: AtomicI32::new(INVALID_LSN),
            shared_lock_set: Mutex::new(HashSet::new()),
            exclusive_lock_set: Mutex::new(HashSet::new()),
            write_set: Mutex::new(Vec::new()),
            page_set: Mutex::new(Vec::new()),
            deleted_pages: Mutex::new(HashSet::new()),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: TransactionState) {
        *self.state.lock() = state;
    }

    pub fn prev_lsn(&self) -> Lsn {
        self.prev_lsn.load(Ordering::SeqCst)
    }

    pub fn set_prev_lsn(&self, lsn: Lsn) {
        self.prev_lsn.store(lsn, Ordering::SeqCst);
    }

    pub fn holds_shared(&self, rid: Rid) -> bool {
        self.shared_lock_set.lock().contains(&rid)
    }

    pub fn holds_exclusive(&self, rid: Rid) -> bool {
        self.exclusive_lock_set.lock().contains(&rid)
    }

    pub(crate) fn add_shared(&self, rid: Rid) {
        self.shared_lock_set.lock().insert(rid);
    }

    pub(crate) fn add_exclusive(&self, rid: Rid) {
        self.exclusive_lock_set.lock().insert(rid);
    }

    pub(crate) fn remove_shared(&self, rid: Rid) {
        self.shared_lock_set.lock().remove(&rid);
    }

    pub(crate) fn remove_exclusive(&self, rid: Rid) {
        self.exclusive_lock_set.lock().remove(&rid);
    }

    /// Every RID this transaction currently holds a lock on.
    pub fn locked_rids(&self) -> HashSet<Rid> {
        let mut rids: HashSet<Rid> = self.shared_lock_set.lock().iter().copied().collect();
        rids.extend(self.exclusive_lock_set.lock().iter().copied());
        rids
    }

    pub(crate) fn push_write_record(&self, record: WriteRecord) {
        self.write_set.lock().push(record);
    }

    pub(crate) fn pop_write_record(&self) -> Option<WriteRecord> {
        self.write_set.lock().pop()
    }

    pub fn write_set_len(&self) -> usize {
        self.write_set.lock().len()
    }
}

/// Hands out transaction ids and drives commit and abort.
pub struct TransactionManager {
    next_txn_id: AtomicI32,
    lock_manager: Arc<LockManager>,
    log_manager: Option<Arc<LogManager>>,
}

impl TransactionManager {
    pub fn new(lock_manager: Arc<LockManager>, log_manager: Option<Arc<LogManager>>) -> Self {
        Self {
            next_txn_id: AtomicI32::new(0),
            lock_manager,
            log_manager,
        }
    }

    pub fn with_first_txn_id(mut self, first: TxnId) -> Self {
        self.next_txn_id = AtomicI32::new(first);
        self
    }

    pub fn begin(&self) -> Arc<Transaction> {
        let txn = Arc::new(Transaction::new(self.next_txn_id.fetch_add(1, Ordering::SeqCst)));
        if let Some(log) = self.active_log() {
            let mut record = LogRecord::new(txn.id(), txn.prev_lsn(), LogRecordBody::Begin);
            let lsn = log.append_log_record(&mut record);
            txn.set_prev_lsn(lsn);
        }
        debug!("txn {} begun", txn.id());
        txn
    }

    /// Commits: deferred deletes are applied, the COMMIT record is made
    /// durable through the group-commit path, and only then are the locks
    /// released.
    pub fn commit(&self, txn: &Transaction) -> Result<()> {
        txn.set_state(TransactionState::Committed);

        while let Some(record) = txn.pop_write_record() {
            if record.wtype == WriteType::Delete {
                record.table.apply_delete(record.rid, txn)?;
            }
        }

        if let Some(log) = self.active_log() {
            let mut record = LogRecord::new(txn.id(), txn.prev_lsn(), LogRecordBody::Commit);
            let lsn = log.append_log_record(&mut record);
            txn.set_prev_lsn(lsn);
            log.flush(false);
        }

        self.release_locks(txn);
        debug!("txn {} committed", txn.id());
        Ok(())
    }

    /// Aborts: the write set is reversed back-to-front against the heap,
    /// the ABORT record is flushed, and the locks are released.
    pub fn abort(&self, txn: &Transaction) -> Result<()> {
        txn.set_state(TransactionState::Aborted);

        while let Some(record) = txn.pop_write_record() {
            match record.wtype {
                WriteType::Insert => record.table.apply_delete(record.rid, txn)?,
                WriteType::Delete => record.table.rollback_delete(record.rid, txn)?,
                WriteType::Update => {
                    record.table.update_tuple(&record.tuple, record.rid, txn)?;
                }
            }
        }

        if let Some(log) = self.active_log() {
            let mut record = LogRecord::new(txn.id(), txn.prev_lsn(), LogRecordBody::Abort);
            let lsn = log.append_log_record(&mut record);
            txn.set_prev_lsn(lsn);
            log.flush(false);
        }

        self.release_locks(txn);
        debug!("txn {} aborted", txn.id());
        Ok(())
    }

    fn release_locks(&self, txn: &Transaction) {
        for rid in txn.locked_rids() {
            self.lock_manager.unlock(txn, rid);
        }
    }

    fn active_log(&self) -> Option<&Arc<LogManager>> {
        self.log_manager.as_ref().filter(|log| log.is_enabled())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_pool::BufferPoolManager;
    use crate::disk::DiskManager;
    use tempfile::tempdir;

    fn setup(dir: &tempfile::TempDir) -> (TransactionManager, Arc<BufferPoolManager>) {
        let disk = Arc::new(
            DiskManager::open(dir.path().join("test.db"), dir.path().join("test.log")).unwrap(),
        );
        let bpm = Arc::new(BufferPoolManager::new(16, disk, None));
        let tm = TransactionManager::new(Arc::new(LockManager::new(false)), None);
        (tm, bpm)
    }

    #[test]
    fn commit_applies_deferred_deletes() {
        let dir = tempdir().unwrap();
        let (tm, bpm) = setup(&dir);

        let txn = tm.begin();
        let heap = TableHeap::new(bpm, None, &txn).unwrap();
        let rid = heap.insert_tuple(&Tuple::from_bytes(b"gone"), &txn).unwrap();
        heap.mark_delete(rid, &txn).unwrap();
        tm.commit(&txn).unwrap();

        assert_eq!(txn.state(), TransactionState::Committed);
        assert!(heap.get_tuple(rid).unwrap().is_none());
        // Physically removed, not just tombstoned: the slot takes new data.
        let txn2 = tm.begin();
        let rid2 = heap.insert_tuple(&Tuple::from_bytes(b"next"), &txn2).unwrap();
        assert_eq!(rid2, rid);
    }

    #[test]
    fn abort_reverses_the_write_set() {
        let dir = tempdir().unwrap();
        let (tm, bpm) = setup(&dir);

        let setup_txn = tm.begin();
        let heap = TableHeap::new(bpm, None, &setup_txn).unwrap();
        let kept = heap
            .insert_tuple(&Tuple::from_bytes(b"original"), &setup_txn)
            .unwrap();
        tm.commit(&setup_txn).unwrap();

        let txn = tm.begin();
        let inserted = heap.insert_tuple(&Tuple::from_bytes(b"mine"), &txn).unwrap();
        heap.update_tuple(&Tuple::from_bytes(b"changed!"), kept, &txn)
            .unwrap();
        heap.mark_delete(kept, &txn).unwrap();
        tm.abort(&txn).unwrap();

        assert_eq!(txn.state(), TransactionState::Aborted);
        assert!(heap.get_tuple(inserted).unwrap().is_none());
        assert_eq!(heap.get_tuple(kept).unwrap().unwrap().data(), b"original");
        assert_eq!(txn.write_set_len(), 0);
    }
}
