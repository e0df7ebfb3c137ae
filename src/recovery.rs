//! Crash recovery over the persisted log: a forward redo pass that
//! reconstructs page state and the set of loser transactions, then a
//! backward undo pass that walks each loser's record chain and reverses
//! its effects.
//!
//! Runs once at startup, before the engine is opened to transactions.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, warn};

use crate::buffer_pool::BufferPoolManager;
use crate::disk::DiskManager;
use crate::page::PageData;
use crate::table::TablePageMut;
use crate::wal::{LogRecord, LogRecordBody};
use crate::{Lsn, Result, Rid, TxnId, INVALID_LSN, INVALID_PAGE_ID, LOG_BUFFER_SIZE};

fn rid_of(body: &LogRecordBody) -> Option<Rid> {
    match body {
        LogRecordBody::Insert { rid, .. }
        | LogRecordBody::MarkDelete { rid, .. }
        | LogRecordBody::ApplyDelete { rid, .. }
        | LogRecordBody::RollbackDelete { rid, .. }
        | LogRecordBody::Update { rid, .. } => Some(*rid),
        _ => None,
    }
}

pub struct LogRecovery {
    disk: Arc<DiskManager>,
    bpm: Arc<BufferPoolManager>,
    log_buffer: Box<[u8]>,
    buffer_len: usize,
    offset: usize,
    /// Latest LSN seen per transaction; survivors after redo are losers.
    active_txn: HashMap<TxnId, Lsn>,
    /// LSN -> offset of the record in `log_buffer`, for the undo walk.
    lsn_mapping: HashMap<Lsn, usize>,
}

impl LogRecovery {
    pub fn new(disk: Arc<DiskManager>, bpm: Arc<BufferPoolManager>) -> Self {
        Self {
            disk,
            bpm,
            log_buffer: vec![0; LOG_BUFFER_SIZE].into_boxed_slice(),
            buffer_len: 0,
            offset: 0,
            active_txn: HashMap::new(),
            lsn_mapping: HashMap::new(),
        }
    }

    /// Both phases in order.
    pub fn recover(&mut self) -> Result<()> {
        self.redo()?;
        self.undo()
    }

    /// Replays the log forward. Tuple records are applied only when their
    /// LSN is ahead of the page's, which makes replay idempotent; a
    /// truncated trailing record ends the scan.
    pub fn redo(&mut self) -> Result<()> {
        self.buffer_len = self.disk.read_log(&mut self.log_buffer, 0)?;
        self.offset = 0;

        while let Some(record) =
            LogRecord::deserialize(&self.log_buffer[self.offset..self.buffer_len])
        {
            self.lsn_mapping.insert(record.lsn, self.offset);
            self.active_txn.insert(record.txn_id, record.lsn);
            self.offset += record.size();

            match &record.body {
                LogRecordBody::Begin => {}
                LogRecordBody::Commit | LogRecordBody::Abort => {
                    self.active_txn.remove(&record.txn_id);
                }
                LogRecordBody::NewPage {
                    prev_page_id,
                    page_id,
                } => {
                    let page = self.bpm.fetch_page(*page_id)?;
                    {
                        let mut data = page.write();
                        TablePageMut::new(&mut data).init(*page_id, *prev_page_id);
                        data.set_lsn(record.lsn);
                    }
                    self.bpm.unpin_page(*page_id, true);

                    if *prev_page_id != INVALID_PAGE_ID {
                        let prev = self.bpm.fetch_page(*prev_page_id)?;
                        TablePageMut::new(&mut prev.write()).set_next_page_id(*page_id);
                        self.bpm.unpin_page(*prev_page_id, true);
                    }
                }
                _ => {
                    let rid = rid_of(&record.body).expect("tuple record carries a RID");
                    let page = self.bpm.fetch_page(rid.page_id)?;
                    let mut data = page.write();
                    let needs_redo = record.lsn > data.lsn();
                    if needs_redo {
                        apply_forward(&mut data, &record);
                        data.set_lsn(record.lsn);
                    }
                    drop(data);
                    self.bpm.unpin_page(rid.page_id, needs_redo);
                }
            }
        }

        debug!(
            "redo complete: {} bytes scanned, {} loser transaction(s)",
            self.offset,
            self.active_txn.len()
        );
        Ok(())
    }

    /// Rolls back every loser transaction by walking its record chain
    /// backwards through `prev_lsn`.
    pub fn undo(&mut self) -> Result<()> {
        let losers: Vec<(TxnId, Lsn)> = self.active_txn.iter().map(|(t, l)| (*t, *l)).collect();
        for (txn_id, last_lsn) in losers {
            debug!("undoing txn {txn_id} from lsn {last_lsn}");
            let mut lsn = last_lsn;
            while lsn != INVALID_LSN {
                let Some(&offset) = self.lsn_mapping.get(&lsn) else {
                    warn!("lsn {lsn} of txn {txn_id} not in the recovery buffer");
                    break;
                };
                let record = LogRecord::deserialize(&self.log_buffer[offset..self.buffer_len])
                    .expect("mapped record parses");
                lsn = record.prev_lsn;
                self.undo_record(&record)?;
            }
        }
        self.active_txn.clear();
        self.lsn_mapping.clear();
        Ok(())
    }

    fn undo_record(&mut self, record: &LogRecord) -> Result<()> {
        match &record.body {
            LogRecordBody::Begin | LogRecordBody::Commit | LogRecordBody::Abort => Ok(()),
            LogRecordBody::NewPage {
                prev_page_id,
                page_id,
            } => {
                if !self.bpm.delete_page(*page_id)? {
                    warn!("undo could not drop page {page_id}");
                }
                self.disk.deallocate_page(*page_id);
                if *prev_page_id != INVALID_PAGE_ID {
                    let prev = self.bpm.fetch_page(*prev_page_id)?;
                    TablePageMut::new(&mut prev.write()).set_next_page_id(INVALID_PAGE_ID);
                    self.bpm.unpin_page(*prev_page_id, true);
                }
                Ok(())
            }
            _ => {
                let rid = rid_of(&record.body).expect("tuple record carries a RID");
                let page = self.bpm.fetch_page(rid.page_id)?;
                {
                    let mut data = page.write();
                    let mut view = TablePageMut::new(&mut data);
                    match &record.body {
                        LogRecordBody::Insert { .. } => {
                            view.apply_delete(rid.slot);
                        }
                        LogRecordBody::Update { old_tuple, .. } => {
                            view.update_tuple(rid.slot, old_tuple);
                        }
                        LogRecordBody::MarkDelete { .. } => {
                            view.rollback_delete(rid.slot);
                        }
                        LogRecordBody::ApplyDelete { tuple, .. } => {
                            view.insert_tuple_at(rid.slot, tuple);
                        }
                        LogRecordBody::RollbackDelete { .. } => {
                            view.mark_delete(rid.slot);
                        }
                        _ => unreachable!("handled above"),
                    }
                }
                self.bpm.unpin_page(rid.page_id, true);
                Ok(())
            }
        }
    }
}

fn apply_forward(data: &mut PageData, record: &LogRecord) {
    let mut view = TablePageMut::new(data);
    match &record.body {
        LogRecordBody::Insert { rid, tuple } => {
            if !view.insert_tuple_at(rid.slot, tuple) {
                warn!("redo insert at {rid} found the slot occupied");
            }
        }
        LogRecordBody::Update { rid, new_tuple, .. } => {
            view.update_tuple(rid.slot, new_tuple);
        }
        LogRecordBody::MarkDelete { rid, .. } => {
            view.mark_delete(rid.slot);
        }
        LogRecordBody::ApplyDelete { rid, .. } => {
            view.apply_delete(rid.slot);
        }
        LogRecordBody::RollbackDelete { rid, .. } => {
            view.rollback_delete(rid.slot);
        }
        _ => unreachable!("only tuple records reach the page apply"),
    }
}
