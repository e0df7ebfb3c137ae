//! Least-recently-used victim selection over unpinned frames.

use std::collections::VecDeque;

use parking_lot::Mutex;

/// Tracks candidate values in recency order. The buffer pool inserts a
/// frame when its pin count drops to zero and erases it on re-pin; a victim
/// is the least recently inserted survivor.
pub struct LruReplacer<T> {
    // Front is most recent.
    entries: Mutex<VecDeque<T>>,
}

impl<T: Eq + Clone> LruReplacer<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn insert(&self, value: T) {
        let mut entries = self.entries.lock();
        if let Some(pos) = entries.iter().position(|v| *v == value) {
            entries.remove(pos);
        }
        entries.push_front(value);
    }

    pub fn victim(&self) -> Option<T> {
        self.entries.lock().pop_back()
    }

    pub fn erase(&self, value: &T) -> bool {
        let mut entries = self.entries.lock();
        match entries.iter().position(|v| v == value) {
            Some(pos) => {
                entries.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn size(&self) -> usize {
        self.entries.lock().len()
    }
}

impl<T: Eq + Clone> Default for LruReplacer<T> {
    fn default() -> Self {
        Self::new()
    }
}
