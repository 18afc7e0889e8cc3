//! In-memory recency index.
//!
//! Entries live in a slab of nodes linked into a doubly linked list (MRU at
//! the head, LRU at the tail) with a key → slot map on the side, so insert,
//! touch, and removal are all O(1). A second map from backing file name to
//! key lets open streams find their entry again after a rename. The index tracks the total size of every
//! entry it holds, complete or not, and never lets it exceed the capacity.

use crate::entry::Entry;
use crate::error::{CacheError, Result};
use crate::util::now_millis;
use std::collections::HashMap;

struct Node {
    entry: Entry,
    prev: Option<usize>,
    next: Option<usize>,
}

pub(crate) struct RecencyIndex {
    slots: Vec<Option<Node>>,
    free_slots: Vec<usize>,
    by_key: HashMap<String, usize>,
    by_file: HashMap<String, String>,
    head: Option<usize>,
    tail: Option<usize>,
    used: u64,
    capacity: u64,
}

impl RecencyIndex {
    pub(crate) fn new(capacity: u64) -> Self {
        Self {
            slots: Vec::new(),
            free_slots: Vec::new(),
            by_key: HashMap::new(),
            by_file: HashMap::new(),
            head: None,
            tail: None,
            used: 0,
            capacity,
        }
    }

    pub(crate) fn capacity(&self) -> u64 {
        self.capacity
    }

    pub(crate) fn used(&self) -> u64 {
        self.used
    }

    pub(crate) fn len(&self) -> usize {
        self.by_key.len()
    }

    /// Inserts `entry` at the MRU position.
    ///
    /// Any previous entry under the same key is handed to `on_evict`, followed
    /// by as many LRU entries as needed to make room.
    pub(crate) fn add(&mut self, entry: Entry, on_evict: &mut dyn FnMut(Entry)) -> Result<()> {
        if entry.size > self.capacity {
            return Err(CacheError::CapacityExceeded {
                size: entry.size,
                capacity: self.capacity,
            });
        }

        if let Some(previous) = self.remove(&entry.key) {
            on_evict(previous);
        }
        while self.capacity.saturating_sub(self.used) < entry.size {
            match self.pop_lru() {
                Some(evicted) => on_evict(evicted),
                None => break,
            }
        }

        let idx = self.alloc_slot(entry);
        self.link_front(idx);
        Ok(())
    }

    /// Looks up `key` and moves it to the MRU position.
    ///
    /// Incomplete entries are touched too; callers filter on `complete`.
    pub(crate) fn get(&mut self, key: &str) -> Option<&Entry> {
        let idx = *self.by_key.get(key)?;
        self.unlink(idx);
        self.link_front(idx);
        let node = self.node_mut(idx);
        node.entry.last_access_millis = now_millis();
        Some(&node.entry)
    }

    /// Looks up `key` without affecting recency.
    pub(crate) fn peek(&self, key: &str) -> Option<&Entry> {
        let idx = *self.by_key.get(key)?;
        Some(&self.node(idx).entry)
    }

    /// Whether some entry, under whatever key, is backed by `file_name`.
    pub(crate) fn references_file(&self, file_name: &str) -> bool {
        self.by_file.contains_key(file_name)
    }

    /// Flags the entry backed by `file_name` complete, whatever key it has
    /// been renamed to. Returns `false` if no entry uses the file any more.
    pub(crate) fn mark_complete(&mut self, file_name: &str) -> bool {
        let Some(&idx) = self
            .by_file
            .get(file_name)
            .and_then(|key| self.by_key.get(key))
        else {
            return false;
        };
        self.node_mut(idx).entry.complete = true;
        true
    }

    /// Removes the entry backed by `file_name`, whatever its key.
    pub(crate) fn remove_file(&mut self, file_name: &str) -> Option<Entry> {
        let key = self.by_file.get(file_name)?.clone();
        self.remove(&key)
    }

    pub(crate) fn remove(&mut self, key: &str) -> Option<Entry> {
        let idx = self.by_key.remove(key)?;
        self.unlink(idx);
        Some(self.free_slot(idx))
    }

    /// Moves the entry under `old_key` to `new_key` and makes it MRU.
    ///
    /// An entry already stored under `new_key` is handed to `on_evict`.
    /// Returns `false` without changes if `old_key` is absent.
    pub(crate) fn rename(
        &mut self,
        old_key: &str,
        new_key: &str,
        on_evict: &mut dyn FnMut(Entry),
    ) -> bool {
        if !self.by_key.contains_key(old_key) {
            return false;
        }
        if old_key == new_key {
            let _ = self.get(old_key);
            return true;
        }
        let Some(mut entry) = self.remove(old_key) else {
            return false;
        };
        if let Some(displaced) = self.remove(new_key) {
            on_evict(displaced);
        }
        entry.key = new_key.to_string();
        let idx = self.alloc_slot(entry);
        self.link_front(idx);
        true
    }

    /// Changes the budget, evicting LRU entries until usage fits.
    pub(crate) fn set_capacity(&mut self, capacity: u64, on_evict: &mut dyn FnMut(Entry)) {
        self.capacity = capacity;
        while self.used > self.capacity {
            match self.pop_lru() {
                Some(evicted) => on_evict(evicted),
                None => break,
            }
        }
    }

    /// Evicts every entry, LRU first.
    pub(crate) fn clear(&mut self, on_evict: &mut dyn FnMut(Entry)) {
        while let Some(evicted) = self.pop_lru() {
            on_evict(evicted);
        }
        self.slots.clear();
        self.free_slots.clear();
        self.by_file.clear();
    }

    /// Removes and returns every entry whose writer has not committed.
    pub(crate) fn drain_incomplete(&mut self) -> Vec<Entry> {
        let keys: Vec<String> = self
            .iter()
            .filter(|entry| !entry.complete)
            .map(|entry| entry.key.clone())
            .collect();
        keys.iter().filter_map(|key| self.remove(key)).collect()
    }

    /// Iterates entries from MRU to LRU.
    pub(crate) fn iter(&self) -> Iter<'_> {
        Iter {
            index: self,
            current: self.head,
        }
    }

    fn pop_lru(&mut self) -> Option<Entry> {
        let idx = self.tail?;
        let key = self.node(idx).entry.key.clone();
        self.by_key.remove(&key);
        self.unlink(idx);
        Some(self.free_slot(idx))
    }

    fn alloc_slot(&mut self, entry: Entry) -> usize {
        self.used += entry.size;
        let key = entry.key.clone();
        self.by_file.insert(entry.file_name.clone(), key.clone());
        let node = Node {
            entry,
            prev: None,
            next: None,
        };
        let idx = match self.free_slots.pop() {
            Some(idx) => {
                self.slots[idx] = Some(node);
                idx
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };
        self.by_key.insert(key, idx);
        idx
    }

    /// Releases an already unlinked slot.
    fn free_slot(&mut self, idx: usize) -> Entry {
        let node = self.slots[idx].take().expect("freeing vacant index slot");
        self.free_slots.push(idx);
        self.used -= node.entry.size;
        self.by_file.remove(&node.entry.file_name);
        node.entry
    }

    fn link_front(&mut self, idx: usize) {
        let old_head = self.head;
        {
            let node = self.node_mut(idx);
            node.prev = None;
            node.next = old_head;
        }
        match old_head {
            Some(head) => self.node_mut(head).prev = Some(idx),
            None => self.tail = Some(idx),
        }
        self.head = Some(idx);
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let node = self.node(idx);
            (node.prev, node.next)
        };
        match prev {
            Some(p) => self.node_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.node_mut(n).prev = prev,
            None => self.tail = prev,
        }
        let node = self.node_mut(idx);
        node.prev = None;
        node.next = None;
    }

    fn node(&self, idx: usize) -> &Node {
        self.slots[idx].as_ref().expect("dangling index slot")
    }

    fn node_mut(&mut self, idx: usize) -> &mut Node {
        self.slots[idx].as_mut().expect("dangling index slot")
    }
}

pub(crate) struct Iter<'a> {
    index: &'a RecencyIndex,
    current: Option<usize>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a Entry;

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.current?;
        let node = self.index.slots[idx].as_ref()?;
        self.current = node.next;
        Some(&node.entry)
    }
}
