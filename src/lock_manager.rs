//! Tuple-level lock manager: shared/exclusive locks with upgrade, FIFO
//! queues per RID, and wait-die deadlock prevention.
//!
//! Two-phase locking is enforced at the door: only a GROWING transaction
//! may acquire, and the first unlock moves it to SHRINKING. A transaction
//! denied for any reason is marked ABORTED and the call returns false; the
//! caller drives the actual abort. Under strict 2PL an exclusive lock can
//! only be released once the transaction has reached COMMITTED or ABORTED.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use log::debug;
use parking_lot::{Condvar, Mutex};

use crate::transaction::{Transaction, TransactionState};
use crate::Rid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Upgrading,
    Exclusive,
}

/// Parking spot for one waiting request.
struct WaitHandle {
    granted: Mutex<bool>,
    cv: Condvar,
}

impl WaitHandle {
    fn new(granted: bool) -> Arc<Self> {
        Arc::new(Self {
            granted: Mutex::new(granted),
            cv: Condvar::new(),
        })
    }

    fn wait(&self) {
        let mut granted = self.granted.lock();
        while !*granted {
            self.cv.wait(&mut granted);
        }
    }

    fn grant(&self) {
        *self.granted.lock() = true;
        self.cv.notify_one();
    }
}

struct Request {
    txn_id: crate::TxnId,
    mode: LockMode,
    granted: bool,
    handle: Arc<WaitHandle>,
}

#[derive(Default)]
struct RequestQueue {
    queue: VecDeque<Request>,
    has_upgrading: bool,
}

impl RequestQueue {
    /// A new request is granted immediately only when the queue is empty,
    /// or when it is shared and the tail is a granted shared request. A
    /// waiting request at the tail therefore blocks everything behind it,
    /// shared arrivals included: no barging past a pending exclusive.
    fn can_grant(&self, mode: LockMode) -> bool {
        match self.queue.back() {
            None => true,
            Some(tail) => {
                tail.granted && tail.mode == LockMode::Shared && mode == LockMode::Shared
            }
        }
    }
}

pub struct LockManager {
    strict_2pl: bool,
    lock_table: Mutex<HashMap<Rid, Arc<Mutex<RequestQueue>>>>,
}

impl LockManager {
    pub fn new(strict_2pl: bool) -> Self {
        Self {
            strict_2pl,
            lock_table: Mutex::new(HashMap::new()),
        }
    }

    pub fn lock_shared(&self, txn: &Transaction, rid: Rid) -> bool {
        self.lock_request(txn, rid, LockMode::Shared)
    }

    pub fn lock_exclusive(&self, txn: &Transaction, rid: Rid) -> bool {
        self.lock_request(txn, rid, LockMode::Exclusive)
    }

    /// Upgrades this transaction's granted shared lock to exclusive. At
    /// most one upgrade may be pending per RID; a second one aborts.
    pub fn lock_upgrade(&self, txn: &Transaction, rid: Rid) -> bool {
        self.lock_request(txn, rid, LockMode::Upgrading)
    }

    fn lock_request(&self, txn: &Transaction, rid: Rid, mode: LockMode) -> bool {
        // Wait-die, reduced: a transaction past its growing phase never
        // acquires again.
        if txn.state() != TransactionState::Growing {
            txn.set_state(TransactionState::Aborted);
            return false;
        }

        // The queue latch is taken while the table latch is still held, so
        // a concurrent releaser cannot detach the queue in between.
        let mut table = self.lock_table.lock();
        let slot = Arc::clone(table.entry(rid).or_default());
        let mut queue = slot.lock();
        drop(table);

        if mode == LockMode::Upgrading {
            if queue.has_upgrading {
                txn.set_state(TransactionState::Aborted);
                return false;
            }
            let position = queue
                .queue
                .iter()
                .position(|r| r.txn_id == txn.id());
            match position {
                Some(i) if queue.queue[i].mode == LockMode::Shared && queue.queue[i].granted => {
                    let _ = queue.queue.remove(i);
                    txn.remove_shared(rid);
                }
                _ => {
                    txn.set_state(TransactionState::Aborted);
                    return false;
                }
            }
        }

        let can_grant = queue.can_grant(mode);
        // An upgrade that can proceed at once is granted directly as
        // exclusive; otherwise it parks as UPGRADING and is promoted by the
        // releaser.
        let queued_mode = match mode {
            LockMode::Upgrading if can_grant => LockMode::Exclusive,
            m => m,
        };
        if queued_mode == LockMode::Upgrading {
            queue.has_upgrading = true;
        }

        let handle = WaitHandle::new(can_grant);
        queue.queue.push_back(Request {
            txn_id: txn.id(),
            mode: queued_mode,
            granted: can_grant,
            handle: Arc::clone(&handle),
        });
        if mode == LockMode::Shared {
            txn.add_shared(rid);
        } else {
            txn.add_exclusive(rid);
        }
        drop(queue);

        if !can_grant {
            debug!("txn {} waiting for {mode:?} on {rid}", txn.id());
            handle.wait();
        }
        true
    }

    /// Releases this transaction's lock on `rid` and grants what the FIFO
    /// order now allows.
    pub fn unlock(&self, txn: &Transaction, rid: Rid) -> bool {
        if self.strict_2pl
            && txn.holds_exclusive(rid)
            && !matches!(
                txn.state(),
                TransactionState::Committed | TransactionState::Aborted
            )
        {
            return false;
        }

        if txn.state() == TransactionState::Growing {
            txn.set_state(TransactionState::Shrinking);
        }

        let mut table = self.lock_table.lock();
        let slot = Arc::clone(
            table
                .get(&rid)
                .expect("unlock on a RID with no request queue"),
        );
        let mut queue = slot.lock();

        let position = queue
            .queue
            .iter()
            .position(|r| r.txn_id == txn.id())
            .expect("unlock by a transaction absent from the queue");
        let request = queue.queue.remove(position).unwrap();
        if request.mode == LockMode::Shared {
            txn.remove_shared(rid);
        } else {
            txn.remove_exclusive(rid);
        }
        if request.mode == LockMode::Upgrading {
            queue.has_upgrading = false;
        }

        if queue.queue.is_empty() {
            table.remove(&rid);
            return true;
        }
        drop(table);

        self.grant_from_head(&mut queue);
        true
    }

    /// FIFO grant pass. A granted head means a shared chain is still live
    /// and nothing changes. A waiting exclusive head (including a promoted
    /// upgrade) is granted alone; a waiting shared head is granted together
    /// with the shared requests contiguously behind it.
    fn grant_from_head(&self, queue: &mut RequestQueue) {
        let Some(head) = queue.queue.front() else {
            return;
        };
        if head.granted {
            return;
        }

        match head.mode {
            LockMode::Exclusive => {
                let head = queue.queue.front_mut().unwrap();
                head.granted = true;
                head.handle.grant();
            }
            LockMode::Upgrading => {
                queue.has_upgrading = false;
                let head = queue.queue.front_mut().unwrap();
                head.mode = LockMode::Exclusive;
                head.granted = true;
                head.handle.grant();
            }
            LockMode::Shared => {
                for request in queue.queue.iter_mut() {
                    if request.mode != LockMode::Shared {
                        break;
                    }
                    if !request.granted {
                        request.granted = true;
                        request.handle.grant();
                    }
                }
            }
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_locks_coexist() {
        let lm = LockManager::new(false);
        let t0 = Transaction::new(0);
        let t1 = Transaction::new(1);
        let rid = Rid::new(0, 0);

        assert!(lm.lock_shared(&t0, rid));
        assert!(lm.lock_shared(&t1, rid));
        assert!(t0.holds_shared(rid));
        assert!(t1.holds_shared(rid));

        assert!(lm.unlock(&t0, rid));
        assert!(lm.unlock(&t1, rid));
        assert_eq!(t0.state(), TransactionState::Shrinking);
    }

    #[test]
    fn acquiring_after_shrinking_aborts() {
        let lm = LockManager::new(false);
        let txn = Transaction::new(0);
        let rid0 = Rid::new(0, 0);
        let rid1 = Rid::new(0, 1);

        assert!(lm.lock_shared(&txn, rid0));
        assert!(lm.unlock(&txn, rid0));
        assert_eq!(txn.state(), TransactionState::Shrinking);

        assert!(!lm.lock_shared(&txn, rid1));
        assert_eq!(txn.state(), TransactionState::Aborted);
    }

    #[test]
    fn strict_2pl_refuses_early_exclusive_unlock() {
        let lm = LockManager::new(true);
        let txn = Transaction::new(0);
        let rid = Rid::new(1, 1);

        assert!(lm.lock_exclusive(&txn, rid));
        assert!(!lm.unlock(&txn, rid));
        assert!(txn.holds_exclusive(rid));

        txn.set_state(TransactionState::Committed);
        assert!(lm.unlock(&txn, rid));
        assert!(!txn.holds_exclusive(rid));
    }

    #[test]
    fn upgrade_without_a_shared_lock_aborts() {
        let lm = LockManager::new(false);
        let txn = Transaction::new(0);
        let rid = Rid::new(2, 0);

        assert!(!lm.lock_upgrade(&txn, rid));
        assert_eq!(txn.state(), TransactionState::Aborted);
    }

    #[test]
    fn sole_holder_upgrades_in_place() {
        let lm = LockManager::new(false);
        let txn = Transaction::new(0);
        let rid = Rid::new(2, 1);

        assert!(lm.lock_shared(&txn, rid));
        assert!(lm.lock_upgrade(&txn, rid));
        assert!(txn.holds_exclusive(rid));
        assert!(!txn.holds_shared(rid));
    }
}
