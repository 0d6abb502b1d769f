//! Generic clock-sweep cache over `Arc<Page>` frames.
//!
//! `getAndGuard` is the only race-free way to pin a page: it looks up
//! the current entry and increments its guard count atomically with
//! respect to a concurrent evicting sweep, by refusing to hand back a
//! page whose `closed` flag raced ahead of us (see [`Page::acquire_guard`]).

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::page::Page;

struct Frame<K> {
    key: K,
    page: Arc<Page>,
    referenced: AtomicBool,
}

/// A fixed-capacity clock-sweep cache. Frames are stored densely in a
/// `Vec`; the clock hand sweeps that vec, clearing the reference bit
/// on its first pass over a frame and evicting it on the second pass
/// if it is still unreferenced and unguarded.
pub struct Cache<K: Hash + Eq + Copy> {
    capacity: usize,
    frames: Vec<Option<Frame<K>>>,
    index: HashMap<K, usize>,
    hand: usize,
}

impl<K: Hash + Eq + Copy> Cache<K> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            capacity,
            frames: (0..capacity).map(|_| None).collect(),
            index: HashMap::with_capacity(capacity),
            hand: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Returns the current entry, if any, without touching guards or
    /// the reference bit.
    pub fn get(&self, key: &K) -> Option<Arc<Page>> {
        self.index
            .get(key)
            .and_then(|&idx| self.frames[idx].as_ref())
            .map(|f| Arc::clone(&f.page))
    }

    /// Atomically returns the current entry AND increments its guard
    /// count. Returns `None` if the cached page is closed or absent.
    pub fn get_and_guard(&self, key: &K) -> Option<Arc<Page>> {
        let idx = *self.index.get(key)?;
        let frame = self.frames[idx].as_ref()?;
        if !frame.page.acquire_guard() {
            return None;
        }
        frame.referenced.store(true, Ordering::Release);
        Some(Arc::clone(&frame.page))
    }

    pub fn put(&mut self, key: K, page: Arc<Page>) {
        if let Some(&idx) = self.index.get(&key) {
            self.frames[idx] = Some(Frame {
                key,
                page,
                referenced: AtomicBool::new(true),
            });
            return;
        }

        let idx = self.find_frame_for_insert();
        if let Some(old) = self.frames[idx].take() {
            self.index.remove(&old.key);
            self.close_if_unguarded(&old.page);
        }
        self.index.insert(key, idx);
        self.frames[idx] = Some(Frame {
            key,
            page,
            referenced: AtomicBool::new(true),
        });
    }

    pub fn put_if_absent(&mut self, key: K, page: Arc<Page>) -> Arc<Page> {
        if let Some(existing) = self.get(&key) {
            return existing;
        }
        self.put(key, Arc::clone(&page));
        page
    }

    pub fn remove(&mut self, key: &K) -> Option<Arc<Page>> {
        let idx = self.index.remove(key)?;
        let frame = self.frames[idx].take()?;
        self.close_if_unguarded(&frame.page);
        Some(frame.page)
    }

    pub fn compute(&mut self, key: K, f: impl FnOnce(Option<Arc<Page>>) -> Option<Arc<Page>>) {
        let current = self.get(&key);
        match f(current) {
            Some(page) => self.put(key, page),
            None => {
                self.remove(&key);
            }
        }
    }

    /// Proactively evicts every unguarded frame matching `predicate`,
    /// ahead of clock-sweep pressure. Used by the buffer manager to
    /// prefer reclaiming pages the epoch tracker reports as
    /// unreachable by any live reader.
    pub fn evict_if(&mut self, predicate: impl Fn(&Page) -> bool) -> usize {
        let mut evicted = 0;
        for slot in &mut self.frames {
            let should_evict = match slot {
                Some(frame) => frame.page.guard_count() == 0 && predicate(&frame.page),
                None => false,
            };
            if should_evict {
                let frame = slot.take().unwrap();
                self.index.remove(&frame.key);
                frame.page.close();
                evicted += 1;
            }
        }
        evicted
    }

    fn close_if_unguarded(&self, page: &Arc<Page>) {
        if page.guard_count() == 0 {
            page.close();
        }
    }

    /// Clock-sweep: scan for a free frame first, otherwise sweep
    /// twice -- clearing reference bits on the first pass, evicting
    /// the first unreferenced, unguarded frame found.
    fn find_frame_for_insert(&mut self) -> usize {
        if self.index.len() < self.capacity {
            for (idx, slot) in self.frames.iter().enumerate() {
                if slot.is_none() {
                    return idx;
                }
            }
        }

        for _ in 0..(2 * self.capacity) {
            let idx = self.hand;
            self.hand = (self.hand + 1) % self.capacity;

            let Some(frame) = &self.frames[idx] else {
                return idx;
            };

            if frame.page.guard_count() > 0 {
                continue;
            }

            if frame.referenced.swap(false, Ordering::AcqRel) {
                continue;
            }

            return idx;
        }

        // Every frame is pinned: growing the cache is the only safe
        // option, since evicting a guarded page would violate guard
        // safety.
        log::warn!(
            "buffer cache exhausted with every frame guarded, growing from {} frames",
            self.frames.len()
        );
        self.frames.push(None);
        self.capacity += 1;
        self.frames.len() - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{LeafPage, PageBody, PageId, Revision};

    fn leaf_page(id: u64) -> Arc<Page> {
        Arc::new(Page::new(
            PageId(id),
            Revision(0),
            PageBody::KeyValueLeaf(LeafPage::new(false)),
        ))
    }

    #[test]
    fn put_get_roundtrip() {
        let mut cache: Cache<u64> = Cache::new(2);
        cache.put(1, leaf_page(1));
        assert!(cache.get(&1).is_some());
        assert!(cache.get(&2).is_none());
    }

    #[test]
    fn eviction_skips_guarded_frames() {
        let mut cache: Cache<u64> = Cache::new(2);
        cache.put(1, leaf_page(1));
        cache.put(2, leaf_page(2));

        let pinned = cache.get_and_guard(&1).unwrap();

        cache.put(3, leaf_page(3));

        // page 1 was guarded, so it must still be resolvable.
        assert!(cache.get(&1).is_some());
        pinned.release_guard();
    }

    #[test]
    fn get_and_guard_returns_none_for_closed_page() {
        let mut cache: Cache<u64> = Cache::new(2);
        let page = leaf_page(1);
        cache.put(1, Arc::clone(&page));
        page.close();
        assert!(cache.get_and_guard(&1).is_none());
    }
}
