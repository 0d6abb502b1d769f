//! The page reference: the universal edge in the page graph, carrying
//! identity, swizzle slot, log/disk key, and generation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use super::{DatabaseId, DiskKey, FragmentKey, Generation, LogKey, Page, PageId, ResourceId};

/// Assigns a stable identity to each `PageReference` at construction
/// time, per the DESIGN NOTES re-architecture of "identity hashing of
/// mutable references": `{id -> container}` maps replace pointer
/// identity, with the same semantics but no reliance on object
/// address stability.
static NEXT_REF_ID: AtomicU64 = AtomicU64::new(1);

/// A mutable descriptor updated in place by the single writer.
/// Readers only ever observe a disk key progress from `None` to
/// `Some`, never the reverse.
///
/// The swizzled page is modeled as an `RwLock<Option<Arc<Page>>>`
/// rather than raw thread-local state, per the DESIGN NOTES
/// re-architecture of "swizzling a page onto its reference": a plain
/// value carried through the tree, with acquire/release semantics on
/// the slot instead of hidden per-thread overrides.
pub struct PageReference {
    pub key: Option<DiskKey>,
    pub log_key: Option<LogKey>,
    pub page_fragments: Vec<FragmentKey>,
    pub hash: u64,
    pub generation: Generation,
    pub database_id: DatabaseId,
    pub resource_id: ResourceId,
    swizzled: Arc<RwLock<Option<Arc<Page>>>>,
    page_id: PageId,
    ref_id: u64,
}

/// Cloning a reference produces a structurally independent edge with
/// a fresh identity: it copies the durable, read-only fields (disk
/// key, fragments, hash, ids) but starts with no log key, default
/// generation, and an empty swizzle slot. This matches how the COW
/// trie walk copies an unmodified child into a new
/// `modified` indirect page -- the copy has not yet been re-added to
/// the active TIL and must not alias the original's mutable state.
impl Clone for PageReference {
    fn clone(&self) -> Self {
        let mut copy = PageReference::new(self.page_id, self.database_id, self.resource_id);
        copy.key = self.key;
        copy.page_fragments = self.page_fragments.clone();
        copy.hash = self.hash;
        copy
    }
}

impl std::fmt::Debug for PageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageReference")
            .field("page_id", &self.page_id)
            .field("key", &self.key)
            .field("log_key", &self.log_key)
            .field("generation", &self.generation)
            .field("fragments", &self.page_fragments.len())
            .finish()
    }
}

impl PageReference {
    pub fn new(page_id: PageId, database_id: DatabaseId, resource_id: ResourceId) -> Self {
        Self {
            key: None,
            log_key: None,
            page_fragments: Vec::new(),
            hash: 0,
            generation: Generation::default(),
            database_id,
            resource_id,
            swizzled: Arc::new(RwLock::new(None)),
            page_id,
            ref_id: NEXT_REF_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Stable identity for this reference, independent of its
    /// in-memory address; used as the key of the TIL's identity map.
    pub fn ref_id(&self) -> u64 {
        self.ref_id
    }

    /// Fetch the swizzled page, if the slot is populated and the page
    /// has not since been closed by an evicting sweep.
    pub fn swizzled(&self) -> Option<Arc<Page>> {
        let guard = self.swizzled.read().unwrap();
        guard.as_ref().filter(|p| !p.is_closed()).map(Arc::clone)
    }

    pub fn set_swizzled(&self, page: Arc<Page>) {
        *self.swizzled.write().unwrap() = Some(page);
    }

    pub fn clear_swizzled(&self) {
        *self.swizzled.write().unwrap() = None;
    }

    /// Stamp a newly assigned disk offset. Never reverts a prior
    /// `Some` (invariant).
    pub fn set_disk_key(&mut self, key: DiskKey) {
        debug_assert!(self.key.is_none() || self.key == Some(key));
        self.key = Some(key);
    }

    /// Push the current disk key onto the fragment list before it is
    /// superseded by a new revision's write, keeping the list sorted
    /// by revision descending as fragments are always pushed in
    /// commit order.
    pub fn push_fragment(&mut self) {
        if let Some(key) = self.key {
            self.page_fragments.insert(0, FragmentKey(key));
        }
    }

    /// A faithful frozen replica preserving identity, log key, and
    /// generation -- unlike [`Clone`], which deliberately mints a new
    /// identity for a COW trie edge. Used when a commit snapshot
    /// deep-copies the revision root so the background worker's
    /// identity-keyed lookups still match the frozen `refToContainer`
    /// map.
    pub(crate) fn snapshot_copy(&self) -> Self {
        Self {
            key: self.key,
            log_key: self.log_key,
            page_fragments: self.page_fragments.clone(),
            hash: self.hash,
            generation: self.generation,
            database_id: self.database_id,
            resource_id: self.resource_id,
            swizzled: Arc::new(RwLock::new(None)),
            page_id: self.page_id,
            ref_id: self.ref_id,
        }
    }
}

/// On-disk shadow of a [`PageReference`]: only the durable fields.
/// The swizzled slot, log key, and generation are runtime-only and
/// are reset to `None`/default on load: the swizzled page is a
/// cache, never a source of truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PageReferenceRecord {
    page_id: u64,
    key: Option<u64>,
    fragments: Vec<u64>,
    hash: u64,
    database_id: u32,
    resource_id: u32,
}

impl Serialize for PageReference {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        PageReferenceRecord {
            page_id: self.page_id.0,
            key: self.key.map(|k| k.0),
            fragments: self.page_fragments.iter().map(|f| f.0 .0).collect(),
            hash: self.hash,
            database_id: self.database_id.0,
            resource_id: self.resource_id.0,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PageReference {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let rec = PageReferenceRecord::deserialize(deserializer)?;
        let mut reference = PageReference::new(
            PageId(rec.page_id),
            DatabaseId(rec.database_id),
            ResourceId(rec.resource_id),
        );
        reference.key = rec.key.map(DiskKey);
        reference.hash = rec.hash;
        reference.page_fragments = rec
            .fragments
            .into_iter()
            .map(|k| FragmentKey(DiskKey(k)))
            .collect();
        Ok(reference)
    }
}
