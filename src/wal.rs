//! The write-ahead log manager.
//!
//! Records are appended into an in-memory buffer under a single latch and
//! made durable by a background flusher thread that wakes on a timeout, on
//! buffer pressure, or on an explicit force. Appenders and the flusher swap
//! a pair of fixed buffers so the disk write happens off the append path.
//!
//! The wire format is explicit little-endian: a 20-byte header
//! `{size, lsn, txn_id, prev_lsn, type}` followed by a type-specific
//! payload. Nothing here depends on in-memory struct layout.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::disk::DiskManager;
use crate::table::Tuple;
use crate::{Lsn, PageId, Rid, TxnId, INVALID_LSN, LOG_BUFFER_SIZE, LOG_TIMEOUT};

pub const LOG_HEADER_SIZE: usize = 20;
const RID_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum LogRecordType {
    Insert = 1,
    MarkDelete = 2,
    ApplyDelete = 3,
    RollbackDelete = 4,
    Update = 5,
    Begin = 6,
    Commit = 7,
    Abort = 8,
    NewPage = 9,
}

impl LogRecordType {
    fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            1 => Self::Insert,
            2 => Self::MarkDelete,
            3 => Self::ApplyDelete,
            4 => Self::RollbackDelete,
            5 => Self::Update,
            6 => Self::Begin,
            7 => Self::Commit,
            8 => Self::Abort,
            9 => Self::NewPage,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone)]
pub enum LogRecordBody {
    Begin,
    Commit,
    Abort,
    Insert {
        rid: Rid,
        tuple: Tuple,
    },
    MarkDelete {
        rid: Rid,
        tuple: Tuple,
    },
    ApplyDelete {
        rid: Rid,
        tuple: Tuple,
    },
    RollbackDelete {
        rid: Rid,
        tuple: Tuple,
    },
    Update {
        rid: Rid,
        old_tuple: Tuple,
        new_tuple: Tuple,
    },
    NewPage {
        prev_page_id: PageId,
        page_id: PageId,
    },
}

impl LogRecordBody {
    pub fn record_type(&self) -> LogRecordType {
        match self {
            Self::Begin => LogRecordType::Begin,
            Self::Commit => LogRecordType::Commit,
            Self::Abort => LogRecordType::Abort,
            Self::Insert { .. } => LogRecordType::Insert,
            Self::MarkDelete { .. } => LogRecordType::MarkDelete,
            Self::ApplyDelete { .. } => LogRecordType::ApplyDelete,
            Self::RollbackDelete { .. } => LogRecordType::RollbackDelete,
            Self::Update { .. } => LogRecordType::Update,
            Self::NewPage { .. } => LogRecordType::NewPage,
        }
    }

    fn payload_size(&self) -> usize {
        match self {
            Self::Begin | Self::Commit | Self::Abort => 0,
            Self::Insert { tuple, .. }
            | Self::MarkDelete { tuple, .. }
            | Self::ApplyDelete { tuple, .. }
            | Self::RollbackDelete { tuple, .. } => RID_SIZE + tuple.serialized_size(),
            Self::Update {
                old_tuple,
                new_tuple,
                ..
            } => RID_SIZE + old_tuple.serialized_size() + new_tuple.serialized_size(),
            Self::NewPage { .. } => 8,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogRecord {
    pub lsn: Lsn,
    pub txn_id: TxnId,
    pub prev_lsn: Lsn,
    pub body: LogRecordBody,
}

fn put_u32(buf: &mut [u8], pos: usize, v: u32) {
    buf[pos..pos + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_i32(buf: &mut [u8], pos: usize, v: i32) {
    put_u32(buf, pos, v as u32);
}

fn get_u32(buf: &[u8], pos: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[pos..pos + 4]);
    u32::from_le_bytes(b)
}

fn get_i32(buf: &[u8], pos: usize) -> i32 {
    get_u32(buf, pos) as i32
}

fn put_rid(buf: &mut [u8], pos: usize, rid: Rid) -> usize {
    put_i32(buf, pos, rid.page_id);
    put_u32(buf, pos + 4, rid.slot);
    pos + RID_SIZE
}

fn get_rid(buf: &[u8], pos: usize) -> Rid {
    Rid::new(get_i32(buf, pos), get_u32(buf, pos + 4))
}

impl LogRecord {
    pub fn new(txn_id: TxnId, prev_lsn: Lsn, body: LogRecordBody) -> Self {
        Self {
            lsn: INVALID_LSN,
            txn_id,
            prev_lsn,
            body,
        }
    }

    pub fn record_type(&self) -> LogRecordType {
        self.body.record_type()
    }

    /// Total serialized length, header included.
    pub fn size(&self) -> usize {
        LOG_HEADER_SIZE + self.body.payload_size()
    }

    /// Serializes into `buf`, which must be exactly `self.size()` long.
    pub fn serialize_into(&self, buf: &mut [u8]) {
        debug_assert_eq!(buf.len(), self.size());
        put_u32(buf, 0, self.size() as u32);
        put_i32(buf, 4, self.lsn);
        put_i32(buf, 8, self.txn_id);
        put_i32(buf, 12, self.prev_lsn);
        put_u32(buf, 16, self.record_type() as u32);

        let pos = LOG_HEADER_SIZE;
        match &self.body {
            LogRecordBody::Begin | LogRecordBody::Commit | LogRecordBody::Abort => {}
            LogRecordBody::Insert { rid, tuple }
            | LogRecordBody::MarkDelete { rid, tuple }
            | LogRecordBody::ApplyDelete { rid, tuple }
            | LogRecordBody::RollbackDelete { rid, tuple } => {
                let pos = put_rid(buf, pos, *rid);
                tuple.serialize_into(&mut buf[pos..]);
            }
            LogRecordBody::Update {
                rid,
                old_tuple,
                new_tuple,
            } => {
                let pos = put_rid(buf, pos, *rid);
                old_tuple.serialize_into(&mut buf[pos..pos + old_tuple.serialized_size()]);
                new_tuple.serialize_into(&mut buf[pos + old_tuple.serialized_size()..]);
            }
            LogRecordBody::NewPage {
                prev_page_id,
                page_id,
            } => {
                put_i32(buf, pos, *prev_page_id);
                put_i32(buf, pos + 4, *page_id);
            }
        }
    }

    /// Parses one record from the front of `data`. Returns None when the
    /// header or the payload would run past the end, which on the recovery
    /// path means a truncated tail to be discarded.
    pub fn deserialize(data: &[u8]) -> Option<LogRecord> {
        if data.len() < LOG_HEADER_SIZE {
            return None;
        }
        let size = get_u32(data, 0) as usize;
        if size < LOG_HEADER_SIZE || size > data.len() {
            return None;
        }
        let lsn = get_i32(data, 4);
        let txn_id = get_i32(data, 8);
        let prev_lsn = get_i32(data, 12);
        let record_type = LogRecordType::from_u32(get_u32(data, 16))?;
        let payload = &data[LOG_HEADER_SIZE..size];

        let body = match record_type {
            LogRecordType::Begin => LogRecordBody::Begin,
            LogRecordType::Commit => LogRecordBody::Commit,
            LogRecordType::Abort => LogRecordBody::Abort,
            LogRecordType::Insert
            | LogRecordType::MarkDelete
            | LogRecordType::ApplyDelete
            | LogRecordType::RollbackDelete => {
                if payload.len() < RID_SIZE {
                    return None;
                }
                let rid = get_rid(payload, 0);
                let (tuple, _) = Tuple::deserialize(&payload[RID_SIZE..])?;
                match record_type {
                    LogRecordType::Insert => LogRecordBody::Insert { rid, tuple },
                    LogRecordType::MarkDelete => LogRecordBody::MarkDelete { rid, tuple },
                    LogRecordType::ApplyDelete => LogRecordBody::ApplyDelete { rid, tuple },
                    _ => LogRecordBody::RollbackDelete { rid, tuple },
                }
            }
            LogRecordType::Update => {
                if payload.len() < RID_SIZE {
                    return None;
                }
                let rid = get_rid(payload, 0);
                let (old_tuple, consumed) = Tuple::deserialize(&payload[RID_SIZE..])?;
                let (new_tuple, _) = Tuple::deserialize(&payload[RID_SIZE + consumed..])?;
                LogRecordBody::Update {
                    rid,
                    old_tuple,
                    new_tuple,
                }
            }
            LogRecordType::NewPage => {
                if payload.len() < 8 {
                    return None;
                }
                LogRecordBody::NewPage {
                    prev_page_id: get_i32(payload, 0),
                    page_id: get_i32(payload, 4),
                }
            }
        };

        Some(LogRecord {
            lsn,
            txn_id,
            prev_lsn,
            body,
        })
    }
}

struct LogState {
    log_buffer: Box<[u8]>,
    flush_buffer: Box<[u8]>,
    write_pos: usize,
    last_lsn: Lsn,
}

/// Appends records, assigns LSNs, and drives the background flusher.
pub struct LogManager {
    disk: Arc<DiskManager>,
    state: Mutex<LogState>,
    /// Wakes the flusher ahead of its timeout.
    flush_wakeup: Condvar,
    /// Wakes appenders blocked on a full buffer and force-flush waiters.
    not_full: Condvar,
    need_flush: AtomicBool,
    next_lsn: AtomicI32,
    persistent_lsn: AtomicI32,
    enabled: AtomicBool,
    flush_thread: Mutex<Option<JoinHandle<()>>>,
}

impl LogManager {
    pub fn new(disk: Arc<DiskManager>) -> Self {
        Self {
            disk,
            state: Mutex::new(LogState {
                log_buffer: vec![0; LOG_BUFFER_SIZE].into_boxed_slice(),
                flush_buffer: vec![0; LOG_BUFFER_SIZE].into_boxed_slice(),
                write_pos: 0,
                last_lsn: INVALID_LSN,
            }),
            flush_wakeup: Condvar::new(),
            not_full: Condvar::new(),
            need_flush: AtomicBool::new(false),
            next_lsn: AtomicI32::new(INVALID_LSN + 1),
            persistent_lsn: AtomicI32::new(INVALID_LSN),
            enabled: AtomicBool::new(false),
            flush_thread: Mutex::new(None),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn persistent_lsn(&self) -> Lsn {
        self.persistent_lsn.load(Ordering::SeqCst)
    }

    /// Starts the flusher thread and enables logging.
    pub fn run_flush_thread(self: &Arc<Self>) {
        if self.enabled.swap(true, Ordering::SeqCst) {
            return;
        }
        let manager = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("wal-flusher".into())
            .spawn(move || manager.flush_loop())
            .expect("spawning the wal flusher");
        *self.flush_thread.lock() = Some(handle);
    }

    /// Drains the buffer, stops the flusher, and disables logging.
    pub fn stop_flush_thread(&self) {
        if !self.is_enabled() {
            return;
        }
        self.flush(true);
        self.enabled.store(false, Ordering::SeqCst);
        self.flush_wakeup.notify_one();
        if let Some(handle) = self.flush_thread.lock().take() {
            let _ = handle.join();
        }
        assert_eq!(self.state.lock().write_pos, 0, "records left unflushed");
    }

    fn flush_loop(&self) {
        debug!("wal flusher started");
        loop {
            let mut state = self.state.lock();
            if !self.need_flush.load(Ordering::SeqCst) {
                let _ = self.flush_wakeup.wait_for(&mut state, LOG_TIMEOUT);
            }

            if state.write_pos > 0 {
                let state_ref = &mut *state;
                std::mem::swap(&mut state_ref.log_buffer, &mut state_ref.flush_buffer);
                let flush_size = state.write_pos;
                let batch_last_lsn = state.last_lsn;
                state.write_pos = 0;
                let buf = std::mem::take(&mut state.flush_buffer);
                drop(state);

                if let Err(e) = self.disk.write_log(&buf[..flush_size]) {
                    warn!("log flush failed: {e}");
                }

                state = self.state.lock();
                state.flush_buffer = buf;
                self.persistent_lsn.store(batch_last_lsn, Ordering::SeqCst);
                debug!("flushed {flush_size} log bytes, persistent lsn {batch_last_lsn}");
            }

            self.need_flush.store(false, Ordering::SeqCst);
            self.not_full.notify_all();
            drop(state);

            if !self.is_enabled() {
                break;
            }
        }
        debug!("wal flusher stopped");
    }

    /// Appends a record, assigning its LSN. Blocks while the buffer is too
    /// full to take it.
    pub fn append_log_record(&self, record: &mut LogRecord) -> Lsn {
        let size = record.size();
        assert!(size < LOG_BUFFER_SIZE, "log record larger than the buffer");

        let mut state = self.state.lock();
        while state.write_pos + size >= LOG_BUFFER_SIZE {
            self.need_flush.store(true, Ordering::SeqCst);
            self.flush_wakeup.notify_one();
            self.not_full.wait(&mut state);
        }

        record.lsn = self.next_lsn.fetch_add(1, Ordering::SeqCst);
        let pos = state.write_pos;
        record.serialize_into(&mut state.log_buffer[pos..pos + size]);
        state.last_lsn = record.lsn;
        state.write_pos = pos + size;
        record.lsn
    }

    /// `force` wakes the flusher immediately and waits until the pending
    /// batch is durable. The non-forced form is the group-commit path: it
    /// waits for flusher cycles until everything appended so far has become
    /// persistent, without triggering an extra write of its own.
    pub fn flush(&self, force: bool) {
        let mut state = self.state.lock();
        if force {
            let target = state.last_lsn;
            self.need_flush.store(true, Ordering::SeqCst);
            self.flush_wakeup.notify_one();
            if self.is_enabled() {
                while self.need_flush.load(Ordering::SeqCst) || self.persistent_lsn() < target {
                    self.not_full.wait(&mut state);
                }
            }
        } else {
            let target = state.last_lsn;
            while self.is_enabled() && self.persistent_lsn() < target {
                self.not_full.wait(&mut state);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn manager(dir: &tempfile::TempDir) -> Arc<LogManager> {
        let disk = Arc::new(
            DiskManager::open(dir.path().join("test.db"), dir.path().join("test.log")).unwrap(),
        );
        Arc::new(LogManager::new(disk))
    }

    #[test]
    fn record_roundtrip_all_types() {
        let rid = Rid::new(3, 7);
        let tuple = Tuple::from_bytes(b"payload");
        let bodies = vec![
            LogRecordBody::Begin,
            LogRecordBody::Commit,
            LogRecordBody::Abort,
            LogRecordBody::Insert {
                rid,
                tuple: tuple.clone(),
            },
            LogRecordBody::MarkDelete {
                rid,
                tuple: tuple.clone(),
            },
            LogRecordBody::Update {
                rid,
                old_tuple: tuple.clone(),
                new_tuple: Tuple::from_bytes(b"longer payload"),
            },
            LogRecordBody::NewPage {
                prev_page_id: 5,
                page_id: 6,
            },
        ];

        for body in bodies {
            let mut rec = LogRecord::new(11, 4, body);
            rec.lsn = 9;
            let mut buf = vec![0u8; rec.size()];
            rec.serialize_into(&mut buf);

            let parsed = LogRecord::deserialize(&buf).expect("parses back");
            assert_eq!(parsed.lsn, 9);
            assert_eq!(parsed.txn_id, 11);
            assert_eq!(parsed.prev_lsn, 4);
            assert_eq!(parsed.record_type(), rec.record_type());
            if let (LogRecordBody::Update { new_tuple, .. }, LogRecordBody::Update { .. }) =
                (&parsed.body, &rec.body)
            {
                assert_eq!(new_tuple.data(), b"longer payload");
            }
        }
    }

    #[test]
    fn truncated_records_are_rejected() {
        let mut rec = LogRecord::new(
            1,
            INVALID_LSN,
            LogRecordBody::Insert {
                rid: Rid::new(1, 0),
                tuple: Tuple::from_bytes(b"abcdef"),
            },
        );
        rec.lsn = 1;
        let mut buf = vec![0u8; rec.size()];
        rec.serialize_into(&mut buf);

        assert!(LogRecord::deserialize(&buf[..10]).is_none());
        assert!(LogRecord::deserialize(&buf[..buf.len() - 1]).is_none());
        assert!(LogRecord::deserialize(&buf).is_some());
    }

    #[test]
    fn force_flush_publishes_persistent_lsn() {
        let dir = tempdir().unwrap();
        let lm = manager(&dir);
        lm.run_flush_thread();

        let mut rec = LogRecord::new(1, INVALID_LSN, LogRecordBody::Begin);
        let lsn = lm.append_log_record(&mut rec);
        assert!(lm.persistent_lsn() < lsn);

        lm.flush(true);
        assert!(lm.persistent_lsn() >= lsn);

        lm.stop_flush_thread();

        let mut buf = vec![0u8; 64];
        let n = lm.disk.read_log(&mut buf, 0).unwrap();
        let parsed = LogRecord::deserialize(&buf[..n]).unwrap();
        assert_eq!(parsed.lsn, lsn);
        assert_eq!(parsed.record_type(), LogRecordType::Begin);
    }

    #[test]
    fn group_flush_waits_for_the_timer() {
        let dir = tempdir().unwrap();
        let lm = manager(&dir);
        lm.run_flush_thread();

        let mut rec = LogRecord::new(2, INVALID_LSN, LogRecordBody::Commit);
        let lsn = lm.append_log_record(&mut rec);
        lm.flush(false);
        assert!(lm.persistent_lsn() >= lsn);

        lm.stop_flush_thread();
    }

    #[test]
    fn stop_drains_everything() {
        let dir = tempdir().unwrap();
        let lm = manager(&dir);
        lm.run_flush_thread();

        let mut last = INVALID_LSN;
        for i in 0..32 {
            let mut rec = LogRecord::new(i, last, LogRecordBody::Begin);
            last = lm.append_log_record(&mut rec);
        }
        lm.stop_flush_thread();
        assert!(lm.persistent_lsn() >= last);
        assert!(!lm.is_enabled());
    }
}
