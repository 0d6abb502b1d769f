//! Transaction intent log.
//!
//! A single-writer, append-only array of page containers indexed by
//! log key, plus an identity-keyed map from reference to container so
//! a reference already staged in this generation is found in O(1).

use std::collections::HashMap;
use std::sync::Arc;

use crate::page::{Generation, LogKey, Page, PageReference};

/// `(complete, modified)` pair, or a single shared instance when a
/// page was newly created and has no prior version to diverge from.
#[derive(Clone)]
pub enum PageContainer {
    SameInstance(Arc<Page>),
    Pair {
        complete: Arc<Page>,
        modified: Arc<Page>,
    },
}

impl PageContainer {
    pub fn new_same(page: Arc<Page>) -> Self {
        PageContainer::SameInstance(page)
    }

    pub fn new_pair(complete: Arc<Page>, modified: Arc<Page>) -> Self {
        PageContainer::Pair { complete, modified }
    }

    pub fn complete(&self) -> &Arc<Page> {
        match self {
            PageContainer::SameInstance(p) => p,
            PageContainer::Pair { complete, .. } => complete,
        }
    }

    pub fn modified(&self) -> &Arc<Page> {
        match self {
            PageContainer::SameInstance(p) => p,
            PageContainer::Pair { modified, .. } => modified,
        }
    }

    pub fn close(&self) {
        self.complete().close();
        self.modified().close();
    }
}

/// The result of [`TransactionIntentLog::rotate`]: the frozen arrays
/// handed exclusively to a commit snapshot.
pub struct RotationResult {
    pub entries: Vec<PageContainer>,
    pub size: usize,
    pub ref_to_container: HashMap<u64, PageContainer>,
    pub generation: Generation,
    /// Every reference's log key as of rotation, frozen for the
    /// commit snapshot.
    pub frozen_log_keys: HashMap<u64, LogKey>,
}

#[derive(Default)]
pub struct TransactionIntentLog {
    generation: Generation,
    entries: Vec<PageContainer>,
    by_ref: HashMap<u64, PageContainer>,
    ref_log_keys: HashMap<u64, LogKey>,
}

impl TransactionIntentLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_generation(&self) -> Generation {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Assigns a dense log key to `reference` if it has none, appends
    /// `container` to the entries array, and records the identity
    /// mapping. Stamps `reference.generation` with the current
    /// generation (`put`).
    pub fn put(&mut self, reference: &mut PageReference, container: PageContainer) {
        let has_current_slot =
            reference.log_key.is_some() && reference.generation == self.generation;

        if has_current_slot {
            let log_key = reference.log_key.unwrap();
            self.entries[log_key.0 as usize] = container.clone();
        } else {
            let log_key = LogKey(self.entries.len() as u32);
            self.entries.push(container.clone());
            reference.log_key = Some(log_key);
            reference.generation = self.generation;
        }

        self.by_ref.insert(reference.ref_id(), container);
        self.ref_log_keys
            .insert(reference.ref_id(), reference.log_key.unwrap());
    }

    /// Identity-map lookup; valid regardless of whether the reference
    /// has a log key assigned yet (`get`).
    pub fn get(&self, reference: &PageReference) -> Option<&PageContainer> {
        self.by_ref.get(&reference.ref_id())
    }

    /// Direct array index. Caller guarantees the generation matches
    /// (`getUnchecked`).
    pub fn get_unchecked(&self, log_key: LogKey) -> &PageContainer {
        &self.entries[log_key.0 as usize]
    }

    pub fn try_get_by_log_key(&self, reference: &PageReference) -> Option<&PageContainer> {
        let log_key = reference.log_key?;
        if reference.generation != self.generation {
            return None;
        }
        self.entries.get(log_key.0 as usize)
    }

    /// Increments the generation, returns the frozen pre-rotation
    /// state, and resets the log to empty (`rotate`).
    pub fn rotate(&mut self) -> RotationResult {
        let generation = self.generation;
        let entries = std::mem::take(&mut self.entries);
        let by_ref = std::mem::take(&mut self.by_ref);
        let frozen_log_keys = std::mem::take(&mut self.ref_log_keys);
        let size = entries.len();

        self.generation = Generation(self.generation.0 + 1);

        RotationResult {
            entries,
            size,
            ref_to_container: by_ref,
            generation,
            frozen_log_keys,
        }
    }

    /// Closes every page in every container and drops all entries
    /// (`clear`, used by rollback).
    pub fn clear(&mut self) {
        for container in self.entries.drain(..) {
            container.close();
        }
        self.by_ref.clear();
        self.ref_log_keys.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{DatabaseId, LeafPage, PageBody, PageId, ResourceId, Revision};

    fn leaf(id: u64) -> Arc<Page> {
        Arc::new(Page::new(
            PageId(id),
            Revision(0),
            PageBody::KeyValueLeaf(LeafPage::new(false)),
        ))
    }

    #[test]
    fn put_then_get_roundtrips() {
        let mut log = TransactionIntentLog::new();
        let mut reference = PageReference::new(PageId(1), DatabaseId(0), ResourceId(0));

        let container = PageContainer::new_same(leaf(1));
        log.put(&mut reference, container);

        assert!(log.get(&reference).is_some());
        assert_eq!(reference.log_key, Some(LogKey(0)));
        assert_eq!(reference.generation, Generation(0));
    }

    #[test]
    fn rotate_advances_generation_and_empties_log() {
        let mut log = TransactionIntentLog::new();
        let mut reference = PageReference::new(PageId(1), DatabaseId(0), ResourceId(0));
        log.put(&mut reference, PageContainer::new_same(leaf(1)));

        let rotation = log.rotate();
        assert_eq!(rotation.size, 1);
        assert_eq!(log.current_generation(), Generation(1));
        assert!(log.is_empty());

        // A reference stamped with the pre-rotation generation is no
        // longer resolvable via the now-active (empty) log.
        assert!(log.try_get_by_log_key(&reference).is_none());
    }

    #[test]
    fn clear_closes_all_pages() {
        let mut log = TransactionIntentLog::new();
        let mut reference = PageReference::new(PageId(1), DatabaseId(0), ResourceId(0));
        let page = leaf(1);
        log.put(&mut reference, PageContainer::new_same(Arc::clone(&page)));

        log.clear();
        assert!(page.is_closed());
    }
}
