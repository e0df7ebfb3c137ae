mod common;

use std::sync::Arc;

use granite::buffer_pool::BufferPoolManager;
use granite::disk::DiskManager;
use granite::lock_manager::LockManager;
use granite::recovery::LogRecovery;
use granite::table::{TableHeap, TablePageRef, Tuple};
use granite::transaction::TransactionManager;
use granite::wal::LogManager;
use granite::{PageId, Rid, INVALID_PAGE_ID};
use serial_test::serial;
use tempfile::TempDir;

struct Engine {
    log: Arc<LogManager>,
    bpm: Arc<BufferPoolManager>,
    tm: TransactionManager,
}

fn start_engine(dir: &TempDir) -> Engine {
    let (_disk, log, bpm) = common::logged_stack(dir, 16);
    log.run_flush_thread();
    let tm = TransactionManager::new(Arc::new(LockManager::new(true)), Some(Arc::clone(&log)));
    Engine { log, bpm, tm }
}

/// Reopens the database files and runs both recovery phases, as a restart
/// after a crash would.
fn restart_and_recover(dir: &TempDir) -> (Arc<DiskManager>, Arc<BufferPoolManager>) {
    let disk =
        Arc::new(DiskManager::open(dir.path().join("test.db"), dir.path().join("test.log")).unwrap());
    let bpm = Arc::new(BufferPoolManager::new(16, Arc::clone(&disk), None));
    let mut recovery = LogRecovery::new(Arc::clone(&disk), Arc::clone(&bpm));
    recovery.recover().unwrap();
    (disk, bpm)
}

fn next_page_of(bpm: &Arc<BufferPoolManager>, page_id: PageId) -> PageId {
    let page = bpm.fetch_page(page_id).unwrap();
    let next = TablePageRef::new(&page.read()).next_page_id();
    bpm.unpin_page(page_id, false);
    next
}

#[test]
#[serial]
fn committed_insert_survives_a_crash_with_flushed_pages() {
    common::init_logging();
    let dir = tempfile::tempdir().unwrap();

    let (first_page, rid) = {
        let engine = start_engine(&dir);
        let txn = engine.tm.begin();
        let heap =
            TableHeap::new(Arc::clone(&engine.bpm), Some(Arc::clone(&engine.log)), &txn).unwrap();
        let rid = heap.insert_tuple(&Tuple::from_bytes(b"durable"), &txn).unwrap();
        engine.tm.commit(&txn).unwrap();

        // The data page reaches disk carrying its LSN, so redo will see the
        // insert as already applied.
        engine.bpm.flush_all_pages().unwrap();
        engine.log.stop_flush_thread();
        (heap.first_page_id(), rid)
    };

    let (_disk, bpm) = restart_and_recover(&dir);
    let heap = TableHeap::open(Arc::clone(&bpm), None, first_page);
    assert_eq!(heap.get_tuple(rid).unwrap().unwrap().data(), b"durable");
    // Replay did not duplicate the tuple into another slot.
    assert!(heap
        .get_tuple(Rid::new(rid.page_id, rid.slot + 1))
        .unwrap()
        .is_none());
}

#[test]
#[serial]
fn committed_insert_survives_a_crash_with_lost_pages() {
    common::init_logging();
    let dir = tempfile::tempdir().unwrap();

    let (first_page, rid) = {
        let engine = start_engine(&dir);
        let txn = engine.tm.begin();
        let heap =
            TableHeap::new(Arc::clone(&engine.bpm), Some(Arc::clone(&engine.log)), &txn).unwrap();
        let rid = heap
            .insert_tuple(&Tuple::from_bytes(b"log only"), &txn)
            .unwrap();
        engine.tm.commit(&txn).unwrap();

        // No page flush: the only durable copy of the insert is the log.
        engine.log.stop_flush_thread();
        (heap.first_page_id(), rid)
    };

    let (_disk, bpm) = restart_and_recover(&dir);
    let heap = TableHeap::open(Arc::clone(&bpm), None, first_page);
    assert_eq!(heap.get_tuple(rid).unwrap().unwrap().data(), b"log only");
}

#[test]
#[serial]
fn uncommitted_update_is_rolled_back_on_restart() {
    common::init_logging();
    let dir = tempfile::tempdir().unwrap();

    let (first_page, rid) = {
        let engine = start_engine(&dir);
        let setup = engine.tm.begin();
        let heap =
            TableHeap::new(Arc::clone(&engine.bpm), Some(Arc::clone(&engine.log)), &setup).unwrap();
        let rid = heap
            .insert_tuple(&Tuple::from_bytes(b"original"), &setup)
            .unwrap();
        engine.tm.commit(&setup).unwrap();

        // A second transaction updates the tuple and crashes before its
        // commit record exists. The dirty page even makes it to disk.
        let loser = engine.tm.begin();
        assert!(heap
            .update_tuple(&Tuple::from_bytes(b"uncommitted"), rid, &loser)
            .unwrap());
        engine.log.flush(true);
        engine.bpm.flush_all_pages().unwrap();
        engine.log.stop_flush_thread();
        (heap.first_page_id(), rid)
    };

    let (_disk, bpm) = restart_and_recover(&dir);
    let heap = TableHeap::open(Arc::clone(&bpm), None, first_page);
    assert_eq!(heap.get_tuple(rid).unwrap().unwrap().data(), b"original");
}

#[test]
#[serial]
fn uncommitted_insert_and_delete_are_rolled_back_on_restart() {
    common::init_logging();
    let dir = tempfile::tempdir().unwrap();

    let (first_page, kept_rid, lost_rid) = {
        let engine = start_engine(&dir);
        let setup = engine.tm.begin();
        let heap =
            TableHeap::new(Arc::clone(&engine.bpm), Some(Arc::clone(&engine.log)), &setup).unwrap();
        let kept = heap
            .insert_tuple(&Tuple::from_bytes(b"survivor"), &setup)
            .unwrap();
        engine.tm.commit(&setup).unwrap();

        let loser = engine.tm.begin();
        let lost = heap
            .insert_tuple(&Tuple::from_bytes(b"phantom"), &loser)
            .unwrap();
        assert!(heap.mark_delete(kept, &loser).unwrap());
        engine.log.flush(true);
        engine.log.stop_flush_thread();
        (heap.first_page_id(), kept, lost)
    };

    let (_disk, bpm) = restart_and_recover(&dir);
    let heap = TableHeap::open(Arc::clone(&bpm), None, first_page);
    assert_eq!(heap.get_tuple(kept_rid).unwrap().unwrap().data(), b"survivor");
    assert!(heap.get_tuple(lost_rid).unwrap().is_none());
}

#[test]
#[serial]
fn uncommitted_page_allocation_is_unlinked_on_restart() {
    common::init_logging();
    let dir = tempfile::tempdir().unwrap();

    let first_page = {
        let engine = start_engine(&dir);
        let setup = engine.tm.begin();
        let heap =
            TableHeap::new(Arc::clone(&engine.bpm), Some(Arc::clone(&engine.log)), &setup).unwrap();
        heap.insert_tuple(&Tuple::from_bytes(b"page one"), &setup)
            .unwrap();
        engine.tm.commit(&setup).unwrap();

        // The loser fills page one until the heap grows a second page.
        let loser = engine.tm.begin();
        let filler = vec![0x42_u8; 900];
        let mut last = Rid::new(INVALID_PAGE_ID, 0);
        while last.page_id == INVALID_PAGE_ID || last.page_id == heap.first_page_id() {
            last = heap.insert_tuple(&Tuple::from_bytes(&filler), &loser).unwrap();
        }
        engine.log.flush(true);
        engine.log.stop_flush_thread();
        heap.first_page_id()
    };

    let (_disk, bpm) = restart_and_recover(&dir);
    assert_eq!(
        next_page_of(&bpm, first_page),
        INVALID_PAGE_ID,
        "the loser's page allocation must be unlinked"
    );
}

#[test]
#[serial]
fn aborted_transactions_are_not_losers() {
    common::init_logging();
    let dir = tempfile::tempdir().unwrap();

    let (first_page, rid) = {
        let engine = start_engine(&dir);
        let setup = engine.tm.begin();
        let heap =
            TableHeap::new(Arc::clone(&engine.bpm), Some(Arc::clone(&engine.log)), &setup).unwrap();
        let rid = heap
            .insert_tuple(&Tuple::from_bytes(b"steady"), &setup)
            .unwrap();
        engine.tm.commit(&setup).unwrap();

        let aborted = engine.tm.begin();
        heap.update_tuple(&Tuple::from_bytes(b"discarded"), rid, &aborted)
            .unwrap();
        engine.tm.abort(&aborted).unwrap();
        engine.log.stop_flush_thread();
        (heap.first_page_id(), rid)
    };

    let (_disk, bpm) = restart_and_recover(&dir);
    let heap = TableHeap::open(Arc::clone(&bpm), None, first_page);
    assert_eq!(heap.get_tuple(rid).unwrap().unwrap().data(), b"steady");
}
