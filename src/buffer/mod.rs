//! Buffer manager : three segregated caches with
//! clock-sweep eviction and guard-counted pinning.

pub mod cache;
pub mod epoch;

use std::sync::Arc;

use crate::page::{DiskKey, LogKey, Page, PageReference};

pub use cache::Cache;
pub use epoch::{EpochTicket, EpochTracker};

/// Identity used by the page cache and the record-page cache: the
/// `(key, logKey)` pair of a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub disk_key: Option<DiskKey>,
    pub log_key: Option<LogKey>,
}

impl From<&PageReference> for CacheKey {
    fn from(r: &PageReference) -> Self {
        CacheKey {
            disk_key: r.key,
            log_key: r.log_key,
        }
    }
}

/// Identity used by the record-page-fragment cache: the disk key
/// only, since fragments are single-revision and never carry a log
/// key once written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentCacheKey(pub DiskKey);

pub struct BufferManager {
    /// Non-leaf and revision-root pages.
    pub page_cache: Cache<CacheKey>,
    /// Combined key-value leaf pages.
    pub record_page_cache: Cache<CacheKey>,
    /// Single-revision leaf fragments, keyed by disk key only.
    pub fragment_cache: Cache<FragmentCacheKey>,
    pub epochs: EpochTracker,
}

impl BufferManager {
    pub fn new(capacity_per_cache: usize) -> Self {
        Self {
            page_cache: Cache::new(capacity_per_cache),
            record_page_cache: Cache::new(capacity_per_cache),
            fragment_cache: Cache::new(capacity_per_cache),
            epochs: EpochTracker::new(),
        }
    }

    /// Proactively reclaim pages in all three caches that predate
    /// every live reader's epoch.
    pub fn evict_unreachable_revisions(&mut self) -> usize {
        let epochs = self.epochs.clone();
        let pred = move |p: &Page| epochs.is_evictable(p.revision);
        self.page_cache.evict_if(pred.clone())
            + self.record_page_cache.evict_if(pred.clone())
            + self.fragment_cache.evict_if(pred)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{LeafPage, PageBody, PageId, Revision};

    #[test]
    fn manager_keeps_live_epoch_pages() {
        let mut mgr = BufferManager::new(4);
        let ticket = mgr.epochs.register(Revision(5));

        let page = Arc::new(Page::new(
            PageId(1),
            Revision(5),
            PageBody::KeyValueLeaf(LeafPage::new(false)),
        ));
        let key = CacheKey {
            disk_key: Some(DiskKey(10)),
            log_key: None,
        };
        mgr.page_cache.put(key, page);

        assert_eq!(mgr.evict_unreachable_revisions(), 0);
        assert!(mgr.page_cache.get(&key).is_some());

        drop(ticket);
        assert_eq!(mgr.evict_unreachable_revisions(), 1);
        assert!(mgr.page_cache.get(&key).is_none());
    }
}
