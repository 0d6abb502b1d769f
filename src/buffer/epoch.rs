//! Epoch tracker for MVCC-aware eviction.
//!
//! Readers register a ticket for the revision they are bound to on
//! construction; the buffer manager prefers evicting pages whose
//! revision predates every currently live ticket, since such pages
//! cannot be observed by any active reader.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::page::Revision;

#[derive(Default)]
struct Inner {
    /// revision -> count of outstanding tickets for that revision.
    live: BTreeMap<Revision, usize>,
}

#[derive(Clone, Default)]
pub struct EpochTracker {
    inner: Arc<Mutex<Inner>>,
}

/// RAII ticket pinning a revision as "observable"; dropping it
/// unregisters the epoch.
pub struct EpochTicket {
    tracker: EpochTracker,
    revision: Revision,
}

impl EpochTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, revision: Revision) -> EpochTicket {
        let mut inner = self.inner.lock().unwrap();
        *inner.live.entry(revision).or_insert(0) += 1;
        EpochTicket {
            tracker: self.clone(),
            revision,
        }
    }

    /// The oldest revision with a live reader, or `None` if there are
    /// no active readers (every buffered page is then eviction
    /// eligible purely on clock-sweep grounds).
    pub fn oldest_live_revision(&self) -> Option<Revision> {
        self.inner.lock().unwrap().live.keys().next().copied()
    }

    /// Whether a page written in `revision` is unreachable by any
    /// live reader and therefore preferred for eviction.
    pub fn is_evictable(&self, revision: Revision) -> bool {
        match self.oldest_live_revision() {
            Some(oldest) => revision < oldest,
            None => true,
        }
    }
}

impl Drop for EpochTicket {
    fn drop(&mut self) {
        let mut inner = self.tracker.inner.lock().unwrap();
        if let Some(count) = inner.live.get_mut(&self.revision) {
            *count -= 1;
            if *count == 0 {
                inner.live.remove(&self.revision);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oldest_tracks_live_tickets() {
        let tracker = EpochTracker::new();
        assert_eq!(tracker.oldest_live_revision(), None);

        let t1 = tracker.register(Revision(3));
        assert_eq!(tracker.oldest_live_revision(), Some(Revision(3)));

        let t2 = tracker.register(Revision(1));
        assert_eq!(tracker.oldest_live_revision(), Some(Revision(1)));

        drop(t2);
        assert_eq!(tracker.oldest_live_revision(), Some(Revision(3)));

        drop(t1);
        assert_eq!(tracker.oldest_live_revision(), None);
    }

    #[test]
    fn evictable_without_readers() {
        let tracker = EpochTracker::new();
        assert!(tracker.is_evictable(Revision(0)));
    }
}
