//! A bounded cache of committed page images.
//!
//! Entries are immutable `Arc<Page>` snapshots of pages that are already in the
//! WAL or the database file, so eviction never has to write anything back.
//! Victims are picked with a clock sweep: each hit sets a reference bit and the
//! hand clears bits until it finds an entry that was not used since its last pass.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::page::Page;
use crate::PageId;

struct Slot {
    page: Arc<Page>,
    referenced: bool,
}

struct CacheState {
    slots: Vec<Slot>,
    table: HashMap<PageId, usize>,
    hand: usize,
}

pub struct PageCache {
    state: Mutex<CacheState>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl PageCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(CacheState {
                slots: Vec::with_capacity(capacity),
                table: HashMap::with_capacity(capacity),
                hand: 0,
            }),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, page_id: PageId) -> Option<Arc<Page>> {
        let mut state = self.state.lock();
        match state.table.get(&page_id).copied() {
            Some(index) => {
                let slot = &mut state.slots[index];
                slot.referenced = true;
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(Arc::clone(&slot.page))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Inserts or replaces the image for `page.id`.
    pub fn insert(&self, page: Arc<Page>) {
        let mut state = self.state.lock();
        if let Some(index) = state.table.get(&page.id).copied() {
            state.slots[index] = Slot {
                page,
                referenced: true,
            };
            return;
        }
        if state.slots.len() < self.capacity {
            let index = state.slots.len();
            state.table.insert(page.id, index);
            state.slots.push(Slot {
                page,
                referenced: false,
            });
            return;
        }
        let victim = Self::find_victim(&mut state);
        let old_id = state.slots[victim].page.id;
        state.table.remove(&old_id);
        state.table.insert(page.id, victim);
        state.slots[victim] = Slot {
            page,
            referenced: false,
        };
    }

    fn find_victim(state: &mut CacheState) -> usize {
        let slot_count = state.slots.len();
        // Two full passes: the first can clear every reference bit, the second picks a victim.
        for _ in 0..(slot_count * 2) {
            let index = state.hand;
            state.hand = (state.hand + 1) % slot_count;
            let slot = &mut state.slots[index];
            if slot.referenced {
                slot.referenced = false;
            } else {
                return index;
            }
        }
        state.hand
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(id: PageId) -> Arc<Page> {
        let mut page = Page::new(id, 64);
        page.data[10] = id as u8;
        Arc::new(page)
    }

    #[test]
    fn hit_and_miss_counters() {
        let cache = PageCache::new(4);
        assert!(cache.get(1).is_none());
        cache.insert(page(1));
        assert_eq!(cache.get(1).unwrap().data[10], 1);
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 1);
    }

    #[test]
    fn clock_evicts_unreferenced_entries_first() {
        let cache = PageCache::new(3);
        cache.insert(page(1));
        cache.insert(page(2));
        cache.insert(page(3));
        // Give pages 1 and 3 a second chance.
        cache.get(1);
        cache.get(3);
        cache.insert(page(4));
        assert_eq!(cache.len(), 3);
        assert!(cache.get(2).is_none());
        assert!(cache.get(1).is_some());
        assert!(cache.get(3).is_some());
        assert!(cache.get(4).is_some());
    }

    #[test]
    fn insert_replaces_existing_image() {
        let cache = PageCache::new(2);
        cache.insert(page(7));
        let mut newer = Page::new(7, 64);
        newer.data[10] = 99;
        cache.insert(Arc::new(newer));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(7).unwrap().data[10], 99);
    }
}
