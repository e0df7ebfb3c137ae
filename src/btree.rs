//! Concurrent B+ tree index over buffer-pooled pages.
//!
//! Traversal uses latch crabbing: a reader releases the parent as soon as
//! the child is latched, a writer only once the child is safe (cannot
//! split for inserts, cannot underflow for deletes). Latches taken on the
//! write path accumulate in the transaction's page set and are released
//! together when the operation finishes. The logical root id lives outside
//! any page and is guarded by a dedicated latch taken before the first
//! page latch; it is persisted in the header page under the index name.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::btree_page::{self as bp, IndexKey, Internal, InternalMut, Leaf, LeafMut};
use crate::buffer_pool::BufferPoolManager;
use crate::header_page::{HeaderPageMut, HeaderPageRef};
use crate::page::{LatchedPage, Page, PageGuard};
use crate::transaction::Transaction;
use crate::{PageId, Result, Rid, HEADER_PAGE_ID, INVALID_PAGE_ID, INVALID_TXN_ID};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TreeOp {
    Search,
    Insert,
    Delete,
}

/// Exclusive latch over the logical root id. Unlocking is release-or-noop:
/// only the owning thread's unlock does anything, so the page-set release
/// path may call it unconditionally and repeatedly.
struct RootLatch {
    owner: Mutex<Option<ThreadId>>,
    cv: Condvar,
}

impl RootLatch {
    fn new() -> Self {
        Self {
            owner: Mutex::new(None),
            cv: Condvar::new(),
        }
    }

    fn lock(&self) {
        let mut owner = self.owner.lock();
        while owner.is_some() {
            self.cv.wait(&mut owner);
        }
        *owner = Some(thread::current().id());
    }

    fn try_unlock(&self) {
        let mut owner = self.owner.lock();
        if *owner == Some(thread::current().id()) {
            *owner = None;
            self.cv.notify_one();
        }
    }
}

/// B+ tree keyed by `K` with `Rid` values. Keys are unique.
pub struct BPlusTree<K: IndexKey> {
    index_name: String,
    bpm: Arc<BufferPoolManager>,
    root_page_id: AtomicI32,
    root_latch: RootLatch,
    leaf_max_size: i32,
    internal_max_size: i32,
    _marker: PhantomData<K>,
}

impl<K: IndexKey> BPlusTree<K> {
    /// Opens (or registers) the index named `name` in the header page.
    pub fn new(name: &str, bpm: Arc<BufferPoolManager>) -> Result<Self> {
        let header = bpm.fetch_page(HEADER_PAGE_ID)?;
        let root_page_id = {
            let mut data = header.write();
            match HeaderPageRef::new(&data).get_record_value(name) {
                Some(root) => root,
                None => {
                    HeaderPageMut::new(&mut data).insert_record(name, INVALID_PAGE_ID);
                    INVALID_PAGE_ID
                }
            }
        };
        bpm.unpin_page(HEADER_PAGE_ID, true);

        Ok(Self {
            index_name: name.to_string(),
            bpm,
            root_page_id: AtomicI32::new(root_page_id),
            root_latch: RootLatch::new(),
            leaf_max_size: bp::default_leaf_max_size::<K>(),
            internal_max_size: bp::default_internal_max_size::<K>(),
            _marker: PhantomData,
        })
    }

    /// Overrides the page fan-outs. Small values force deep trees, which
    /// tests use to exercise splits and merges cheaply.
    pub fn with_max_sizes(mut self, leaf_max_size: i32, internal_max_size: i32) -> Self {
        assert!(leaf_max_size >= 2 && internal_max_size >= 3);
        self.leaf_max_size = leaf_max_size;
        self.internal_max_size = internal_max_size;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.root_page_id.load(Ordering::SeqCst) == INVALID_PAGE_ID
    }

    pub fn root_page_id(&self) -> PageId {
        self.root_page_id.load(Ordering::SeqCst)
    }

    /// Point lookup. The scratch transaction parameter only carries the
    /// page set; pass None outside any transaction.
    pub fn get_value(&self, key: &K, txn: Option<&Transaction>) -> Result<Vec<Rid>> {
        let scratch;
        let txn = match txn {
            Some(t) => t,
            None => {
                scratch = Transaction::new(INVALID_TXN_ID);
                &scratch
            }
        };

        if !self.find_leaf_page(Some(key), TreeOp::Search, txn)? {
            return Ok(Vec::new());
        }
        let found = {
            let set = txn.page_set.lock();
            let leaf = set.last().expect("descent leaves the leaf latched");
            Leaf::<K>::new(leaf.data()).lookup(key)
        };
        self.release_pages(txn);
        Ok(found.into_iter().collect())
    }

    /// Inserts a unique key. Returns false when the key already exists.
    pub fn insert(&self, key: K, value: Rid, txn: &Transaction) -> Result<bool> {
        loop {
            self.root_latch.lock();
            if self.is_empty() {
                let started = self.start_new_tree(&key, value);
                self.root_latch.try_unlock();
                return started.map(|_| true);
            }
            self.root_latch.try_unlock();

            // The tree can empty out between the check and the descent; in
            // that rare case try again from the top.
            if let Some(inserted) = self.insert_into_leaf(&key, value, txn)? {
                return Ok(inserted);
            }
        }
    }

    /// Removes the key if present. Underflow triggers redistribution with
    /// a sibling, or a merge that can cascade to the root.
    pub fn remove(&self, key: &K, txn: &Transaction) -> Result<()> {
        if !self.find_leaf_page(Some(key), TreeOp::Delete, txn)? {
            return Ok(());
        }
        let mut leaf = self.pop_latched(txn);
        LeafMut::<K>::new(leaf.data_mut()).remove(key);

        let result = if bp::size(leaf.data()) < bp::min_size(leaf.data()) {
            self.coalesce_or_redistribute(leaf, txn)
        } else {
            self.push_latched(txn, leaf);
            Ok(())
        };
        self.release_pages(txn);
        result
    }

    /// Forward iterator over the whole tree in key order.
    pub fn iter(&self) -> Result<BPlusTreeIter<K>> {
        self.make_iter(None)
    }

    /// Forward iterator starting at the first key >= `key`.
    pub fn iter_from(&self, key: &K) -> Result<BPlusTreeIter<K>> {
        self.make_iter(Some(key))
    }

    fn make_iter(&self, key: Option<&K>) -> Result<BPlusTreeIter<K>> {
        let scratch = Transaction::new(INVALID_TXN_ID);
        if !self.find_leaf_page(key, TreeOp::Search, &scratch)? {
            return Ok(BPlusTreeIter {
                bpm: Arc::clone(&self.bpm),
                leaf: None,
                index: 0,
                _marker: PhantomData,
            });
        }
        let latched = self.pop_latched(&scratch);
        let index = match key {
            Some(k) => Leaf::<K>::new(latched.data()).key_index(k),
            None => 0,
        };
        // Keep the pin, drop the latch: the iterator re-latches briefly on
        // every access.
        let LatchedPage { page, guard } = latched;
        drop(guard);
        self.release_pages(&scratch);
        Ok(BPlusTreeIter {
            bpm: Arc::clone(&self.bpm),
            leaf: Some(page),
            index,
            _marker: PhantomData,
        })
    }

    // ---- descent ----------------------------------------------------

    /// Descends to the leaf responsible for `key` (the leftmost leaf when
    /// `key` is None), latching per `op`. On success the leaf is the last
    /// entry of the transaction's page set, still latched and pinned.
    /// Returns false when the tree is empty.
    fn find_leaf_page(&self, key: Option<&K>, op: TreeOp, txn: &Transaction) -> Result<bool> {
        self.root_latch.lock();
        let root = self.root_page_id.load(Ordering::SeqCst);
        if root == INVALID_PAGE_ID {
            self.root_latch.try_unlock();
            return Ok(false);
        }

        let mut page_id = root;
        let mut release_ancestors = false;
        loop {
            if let Err(e) = self.latch_child(page_id, op, release_ancestors, txn) {
                self.release_pages(txn);
                return Err(e);
            }
            release_ancestors = true;

            let (is_leaf, child) = {
                let set = txn.page_set.lock();
                let node = set.last().expect("just latched");
                let data = node.data();
                if bp::is_leaf(data) {
                    (true, INVALID_PAGE_ID)
                } else {
                    let internal = Internal::<K>::new(data);
                    let child = match key {
                        Some(k) => internal.lookup(k),
                        None => internal.value_at(0),
                    };
                    (false, child)
                }
            };
            if is_leaf {
                return Ok(true);
            }
            page_id = child;
        }
    }

    /// Fetches and latches one page. When `release_ancestors` holds and
    /// the page is safe for `op` (always, for reads), every latch taken so
    /// far, the virtual root latch included, is released first.
    fn latch_child(
        &self,
        page_id: PageId,
        op: TreeOp,
        release_ancestors: bool,
        txn: &Transaction,
    ) -> Result<()> {
        let page = self.bpm.fetch_page(page_id)?;
        let guard = match op {
            TreeOp::Search => PageGuard::Read(page.read_latch()),
            TreeOp::Insert | TreeOp::Delete => PageGuard::Write(page.write_latch()),
        };
        let safe = match op {
            TreeOp::Search => true,
            TreeOp::Insert => bp::size(guard.data()) < bp::max_size(guard.data()),
            TreeOp::Delete => bp::size(guard.data()) > bp::min_size(guard.data()),
        };
        if release_ancestors && safe {
            self.release_pages(txn);
        }
        txn.page_set.lock().push(LatchedPage { page, guard });
        Ok(())
    }

    /// Releases everything the operation holds: the root latch if owned,
    /// then each page-set entry in acquisition order (unlatch, unpin, and
    /// buffer-pool delete for pages in the deleted set).
    fn release_pages(&self, txn: &Transaction) {
        self.root_latch.try_unlock();
        let pages: Vec<LatchedPage> = txn.page_set.lock().drain(..).collect();
        for latched in pages {
            let LatchedPage { page, guard } = latched;
            let page_id = page.id();
            drop(guard);
            self.bpm.unpin_page(page_id, true);
            if txn.deleted_pages.lock().remove(&page_id) {
                match self.bpm.delete_page(page_id) {
                    Ok(true) => {}
                    Ok(false) => warn!("page {page_id} still pinned, deferring delete"),
                    Err(e) => warn!("deleting page {page_id} failed: {e}"),
                }
            }
        }
    }

    fn push_latched(&self, txn: &Transaction, latched: LatchedPage) {
        txn.page_set.lock().push(latched);
    }

    fn pop_latched(&self, txn: &Transaction) -> LatchedPage {
        txn.page_set
            .lock()
            .pop()
            .expect("operation holds at least one latched page")
    }

    /// Removes the page-set entry for `page_id`, wherever it sits.
    fn take_latched(&self, txn: &Transaction, page_id: PageId) -> Option<LatchedPage> {
        let mut set = txn.page_set.lock();
        let position = set.iter().rposition(|lp| lp.id() == page_id)?;
        Some(set.remove(position))
    }

    /// Updates a page's parent pointer through the latch we already hold
    /// on it, or through a short-lived one otherwise.
    fn set_parent_of(&self, txn: &Transaction, page_id: PageId, parent_id: PageId) -> Result<()> {
        {
            let mut set = txn.page_set.lock();
            if let Some(latched) = set.iter_mut().find(|lp| lp.id() == page_id) {
                bp::set_parent_page_id(latched.data_mut(), parent_id);
                return Ok(());
            }
        }
        let page = self.bpm.fetch_page(page_id)?;
        bp::set_parent_page_id(&mut page.write(), parent_id);
        self.bpm.unpin_page(page_id, true);
        Ok(())
    }

    /// Persists the current root id in the header page record.
    fn update_root_page_id(&self) -> Result<()> {
        let header = self.bpm.fetch_page(HEADER_PAGE_ID)?;
        {
            let mut data = header.write();
            let mut view = HeaderPageMut::new(&mut data);
            if !view.update_record(&self.index_name, self.root_page_id())
                && !view.insert_record(&self.index_name, self.root_page_id())
            {
                warn!("header page full, root id for {} not persisted", self.index_name);
            }
        }
        self.bpm.unpin_page(HEADER_PAGE_ID, true);
        Ok(())
    }

    // ---- insertion --------------------------------------------------

    /// First key of a fresh tree: one leaf page that is also the root.
    /// Caller holds the root latch.
    fn start_new_tree(&self, key: &K, value: Rid) -> Result<()> {
        let page = self.bpm.new_page()?;
        let page_id = page.id();
        {
            let mut data = page.write();
            LeafMut::<K>::init(&mut data, page_id, INVALID_PAGE_ID, self.leaf_max_size);
            LeafMut::<K>::new(&mut data).insert(key, value);
        }
        self.bpm.unpin_page(page_id, true);
        self.root_page_id.store(page_id, Ordering::SeqCst);
        self.update_root_page_id()?;
        debug!("{}: new tree rooted at {page_id}", self.index_name);
        Ok(())
    }

    /// Returns None when the descent found an empty tree (caller retries),
    /// Some(false) on a duplicate key.
    fn insert_into_leaf(&self, key: &K, value: Rid, txn: &Transaction) -> Result<Option<bool>> {
        if !self.find_leaf_page(Some(key), TreeOp::Insert, txn)? {
            return Ok(None);
        }
        let mut leaf = self.pop_latched(txn);

        if Leaf::<K>::new(leaf.data()).lookup(key).is_some() {
            self.push_latched(txn, leaf);
            self.release_pages(txn);
            return Ok(Some(false));
        }

        LeafMut::<K>::new(leaf.data_mut()).insert(key, value);

        let result = if bp::size(leaf.data()) > bp::max_size(leaf.data()) {
            match self.split_leaf(&mut leaf) {
                Ok((mut sibling, separator)) => {
                    let propagated =
                        self.insert_into_parent(&mut leaf, separator, &mut sibling, txn);
                    self.push_latched(txn, sibling);
                    propagated
                }
                Err(e) => Err(e),
            }
        } else {
            Ok(())
        };

        self.push_latched(txn, leaf);
        self.release_pages(txn);
        result.map(|_| Some(true))
    }

    /// Splits an overfull leaf, returning the write-latched sibling and
    /// the separator key to push up.
    fn split_leaf(&self, leaf: &mut LatchedPage) -> Result<(LatchedPage, K)> {
        let page = self.bpm.new_page()?;
        let guard = PageGuard::Write(page.write_latch());
        let mut sibling = LatchedPage { page, guard };
        let sibling_id = sibling.id();

        LeafMut::<K>::init(
            sibling.data_mut(),
            sibling_id,
            bp::parent_page_id(leaf.data()),
            bp::max_size(leaf.data()),
        );
        {
            let mut old = LeafMut::<K>::new(leaf.data_mut());
            let mut new = LeafMut::<K>::new(sibling.data_mut());
            old.move_half_to(&mut new);
        }
        let separator = Leaf::<K>::new(sibling.data()).key_at(0);
        debug!(
            "{}: split leaf {} -> {sibling_id}",
            self.index_name,
            leaf.id()
        );
        Ok((sibling, separator))
    }

    /// Splits an overfull internal page and reparents the moved children.
    /// The level below's freshly split pair is still held as locals by the
    /// caller, so their parent pointers are fixed through those latches
    /// rather than by re-latching.
    fn split_internal(
        &self,
        node: &mut LatchedPage,
        below_old: &mut LatchedPage,
        below_new: &mut LatchedPage,
        txn: &Transaction,
    ) -> Result<(LatchedPage, K)> {
        let page = self.bpm.new_page()?;
        let guard = PageGuard::Write(page.write_latch());
        let mut sibling = LatchedPage { page, guard };
        let sibling_id = sibling.id();

        InternalMut::<K>::init(
            sibling.data_mut(),
            sibling_id,
            bp::parent_page_id(node.data()),
            bp::max_size(node.data()),
        );
        {
            let mut old = InternalMut::<K>::new(node.data_mut());
            let mut new = InternalMut::<K>::new(sibling.data_mut());
            old.move_half_to(&mut new);
        }
        let separator = Internal::<K>::new(sibling.data()).key_at(0);

        let moved: Vec<PageId> = {
            let view = Internal::<K>::new(sibling.data());
            (0..view.size()).map(|i| view.value_at(i)).collect()
        };
        for child in moved {
            if child == below_old.id() {
                bp::set_parent_page_id(below_old.data_mut(), sibling_id);
            } else if child == below_new.id() {
                bp::set_parent_page_id(below_new.data_mut(), sibling_id);
            } else if let Err(e) = self.set_parent_of(txn, child, sibling_id) {
                self.push_latched(txn, sibling);
                return Err(e);
            }
        }
        Ok((sibling, separator))
    }

    /// Hooks a freshly split-off sibling into the parent, growing a new
    /// root or splitting the parent recursively as needed.
    fn insert_into_parent(
        &self,
        old: &mut LatchedPage,
        key: K,
        new: &mut LatchedPage,
        txn: &Transaction,
    ) -> Result<()> {
        let parent_id = bp::parent_page_id(old.data());
        if parent_id == INVALID_PAGE_ID {
            // The root split. The virtual root latch is still held because
            // nothing on the path was safe.
            let root_page = self.bpm.new_page()?;
            let root_id = root_page.id();
            {
                let mut data = root_page.write();
                InternalMut::<K>::init(&mut data, root_id, INVALID_PAGE_ID, self.internal_max_size);
                InternalMut::<K>::new(&mut data).populate_new_root(old.id(), &key, new.id());
            }
            self.bpm.unpin_page(root_id, true);
            bp::set_parent_page_id(old.data_mut(), root_id);
            bp::set_parent_page_id(new.data_mut(), root_id);
            self.root_page_id.store(root_id, Ordering::SeqCst);
            self.update_root_page_id()?;
            debug!("{}: new root {root_id}", self.index_name);
            return Ok(());
        }

        let mut parent = self
            .take_latched(txn, parent_id)
            .expect("parent still latched by the descent");
        InternalMut::<K>::new(parent.data_mut()).insert_node_after(old.id(), &key, new.id());
        bp::set_parent_page_id(new.data_mut(), parent_id);

        let result = if bp::size(parent.data()) > bp::max_size(parent.data()) {
            match self.split_internal(&mut parent, old, new, txn) {
                Ok((mut parent_sibling, up_key)) => {
                    let propagated =
                        self.insert_into_parent(&mut parent, up_key, &mut parent_sibling, txn);
                    self.push_latched(txn, parent_sibling);
                    propagated
                }
                Err(e) => Err(e),
            }
        } else {
            Ok(())
        };

        self.push_latched(txn, parent);
        result
    }

    // ---- deletion ---------------------------------------------------

    /// Restores the invariant for an underfull `node`: merges it with a
    /// sibling when both fit in one page, redistributes one entry
    /// otherwise. Merges can cascade into the parent.
    fn coalesce_or_redistribute(&self, node: LatchedPage, txn: &Transaction) -> Result<()> {
        if bp::is_root(node.data()) {
            let delete_root = self.adjust_root(&node, txn);
            if let Ok(true) = delete_root {
                txn.deleted_pages.lock().insert(node.id());
            }
            self.push_latched(txn, node);
            return delete_root.map(|_| ());
        }

        let parent_id = bp::parent_page_id(node.data());
        let parent = self
            .take_latched(txn, parent_id)
            .expect("parent still latched by the descent");

        let index = Internal::<K>::new(parent.data())
            .value_index(node.id())
            .expect("underfull page must appear in its parent");
        let sibling_index = if index == 0 { 1 } else { index - 1 };
        let sibling_id = Internal::<K>::new(parent.data()).value_at(sibling_index);

        // The sibling is latched in addition to the ancestors already
        // held; the parent stays latched throughout.
        if let Err(e) = self.latch_child(sibling_id, TreeOp::Delete, false, txn) {
            self.push_latched(txn, parent);
            self.push_latched(txn, node);
            return Err(e);
        }
        let sibling = self.pop_latched(txn);

        let merged_size = bp::size(node.data()) + bp::size(sibling.data());
        if merged_size <= bp::max_size(node.data()) {
            self.coalesce(node, sibling, parent, index, txn)
        } else {
            self.redistribute(node, sibling, parent, index, txn)
        }
    }

    /// Merges the right page of the pair into the left and drops the right
    /// page's entry from the parent.
    fn coalesce(
        &self,
        node: LatchedPage,
        sibling: LatchedPage,
        mut parent: LatchedPage,
        index: usize,
        txn: &Transaction,
    ) -> Result<()> {
        let (mut left, mut right, right_index) = if index == 0 {
            (node, sibling, 1)
        } else {
            (sibling, node, index)
        };

        if bp::is_leaf(left.data()) {
            let mut left_view = LeafMut::<K>::new(left.data_mut());
            let mut right_view = LeafMut::<K>::new(right.data_mut());
            right_view.move_all_to(&mut left_view);
        } else {
            let separator = Internal::<K>::new(parent.data()).key_at(right_index);
            let moved: Vec<PageId> = {
                let view = Internal::<K>::new(right.data());
                (0..view.size()).map(|i| view.value_at(i)).collect()
            };
            {
                let mut left_view = InternalMut::<K>::new(left.data_mut());
                let mut right_view = InternalMut::<K>::new(right.data_mut());
                right_view.move_all_to(&mut left_view, &separator);
            }
            let left_id = left.id();
            for child in moved {
                if let Err(e) = self.set_parent_of(txn, child, left_id) {
                    self.push_latched(txn, parent);
                    self.push_latched(txn, left);
                    self.push_latched(txn, right);
                    return Err(e);
                }
            }
        }

        debug!(
            "{}: merged page {} into {}",
            self.index_name,
            right.id(),
            left.id()
        );
        txn.deleted_pages.lock().insert(right.id());
        InternalMut::<K>::new(parent.data_mut()).remove(right_index);
        self.push_latched(txn, left);
        self.push_latched(txn, right);

        if bp::size(parent.data()) < bp::min_size(parent.data()) {
            return self.coalesce_or_redistribute(parent, txn);
        }
        self.push_latched(txn, parent);
        Ok(())
    }

    /// Moves one entry from the sibling into the underfull node and
    /// rotates the separator key through the parent.
    fn redistribute(
        &self,
        mut node: LatchedPage,
        mut sibling: LatchedPage,
        mut parent: LatchedPage,
        index: usize,
        txn: &Transaction,
    ) -> Result<()> {
        let result = if index == 0 {
            // Node is the leftmost child; the sibling on its right feeds
            // the node's tail. Only slot 1 of the parent can separate this
            // pair.
            assert_eq!(
                Internal::<K>::new(parent.data()).value_index(node.id()),
                Some(0),
                "right-sibling redistribution applies only to the leftmost child"
            );
            if bp::is_leaf(node.data()) {
                let (key, rid) = LeafMut::<K>::new(sibling.data_mut()).remove_at(0);
                let node_len = bp::size(node.data()) as usize;
                LeafMut::<K>::new(node.data_mut()).insert_at(node_len, &key, rid);
                let new_separator = Leaf::<K>::new(sibling.data()).key_at(0);
                InternalMut::<K>::new(parent.data_mut()).set_key_at(1, &new_separator);
                Ok(())
            } else {
                let old_separator = Internal::<K>::new(parent.data()).key_at(1);
                let (next_separator, moved_child) =
                    InternalMut::<K>::new(sibling.data_mut()).pop_front();
                InternalMut::<K>::new(node.data_mut()).push_back(&old_separator, moved_child);
                InternalMut::<K>::new(parent.data_mut()).set_key_at(1, &next_separator);
                self.set_parent_of(txn, moved_child, node.id())
            }
        } else {
            // The sibling on the left feeds the node's front.
            if bp::is_leaf(node.data()) {
                let last = bp::size(sibling.data()) as usize - 1;
                let (key, rid) = LeafMut::<K>::new(sibling.data_mut()).remove_at(last);
                LeafMut::<K>::new(node.data_mut()).insert_at(0, &key, rid);
                InternalMut::<K>::new(parent.data_mut()).set_key_at(index, &key);
                Ok(())
            } else {
                let old_separator = Internal::<K>::new(parent.data()).key_at(index);
                let last = bp::size(sibling.data()) as usize - 1;
                let moved_key = Internal::<K>::new(sibling.data()).key_at(last);
                let moved_child = Internal::<K>::new(sibling.data()).value_at(last);
                InternalMut::<K>::new(sibling.data_mut()).remove(last);
                InternalMut::<K>::new(parent.data_mut()).set_key_at(index, &moved_key);
                InternalMut::<K>::new(node.data_mut()).push_front(&old_separator, moved_child);
                self.set_parent_of(txn, moved_child, node.id())
            }
        };

        self.push_latched(txn, node);
        self.push_latched(txn, sibling);
        self.push_latched(txn, parent);
        result
    }

    /// Shrinks the root: an internal root left with a single child hands
    /// the root role to that child; an empty leaf root empties the tree.
    /// True means the old root page should be deleted.
    fn adjust_root(&self, root: &LatchedPage, txn: &Transaction) -> Result<bool> {
        if bp::is_leaf(root.data()) {
            if bp::size(root.data()) == 0 {
                self.root_page_id.store(INVALID_PAGE_ID, Ordering::SeqCst);
                self.update_root_page_id()?;
                debug!("{}: tree is now empty", self.index_name);
                return Ok(true);
            }
            return Ok(false);
        }

        if bp::size(root.data()) == 1 {
            let child = Internal::<K>::new(root.data()).value_at(0);
            self.root_page_id.store(child, Ordering::SeqCst);
            self.set_parent_of(txn, child, INVALID_PAGE_ID)?;
            self.update_root_page_id()?;
            debug!("{}: root collapsed into {child}", self.index_name);
            return Ok(true);
        }
        Ok(false)
    }
}

/// Forward iterator over leaf entries. Holds a pin (never a latch) on the
/// current leaf and follows the next-page chain.
pub struct BPlusTreeIter<K: IndexKey> {
    bpm: Arc<BufferPoolManager>,
    leaf: Option<Arc<Page>>,
    index: usize,
    _marker: PhantomData<K>,
}

impl<K: IndexKey> Iterator for BPlusTreeIter<K> {
    type Item = (K, Rid);

    fn next(&mut self) -> Option<(K, Rid)> {
        loop {
            let leaf = self.leaf.as_ref()?;
            let (next_page_id, item) = {
                let data = leaf.read();
                let view = Leaf::<K>::new(&data);
                if self.index < view.size() {
                    (INVALID_PAGE_ID, Some(view.item(self.index)))
                } else {
                    (view.next_page_id(), None)
                }
            };
            if let Some(item) = item {
                self.index += 1;
                return Some(item);
            }

            let finished_id = leaf.id();
            self.bpm.unpin_page(finished_id, false);
            self.leaf = None;
            if next_page_id == INVALID_PAGE_ID {
                return None;
            }
            match self.bpm.fetch_page(next_page_id) {
                Ok(page) => {
                    self.leaf = Some(page);
                    self.index = 0;
                }
                Err(e) => {
                    warn!("iterator lost leaf {next_page_id}: {e}");
                    return None;
                }
            }
        }
    }
}

impl<K: IndexKey> Drop for BPlusTreeIter<K> {
    fn drop(&mut self) {
        if let Some(leaf) = self.leaf.take() {
            self.bpm.unpin_page(leaf.id(), false);
        }
    }
}
