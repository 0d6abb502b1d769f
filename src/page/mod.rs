//! Page model & references (§4.A).
//!
//! A [`Page`] is a tagged variant; every kind carries a [`PageId`], the
//! [`Revision`] it was written in, a closed flag, and a guard count.
//! The universal edge between pages is [`PageReference`], which may
//! resolve through the swizzled in-memory page, the active TIL, a
//! pending commit snapshot, the buffer cache, or finally disk -- see
//! [`crate::read_txn`] for the layered lookup that walks those in
//! order.

mod leaf;
mod reference;
mod revision_root;

pub use leaf::LeafPage;
pub use reference::PageReference;
pub use revision_root::{RevisionRootPage, UberPage};

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::record::IndexType;

/// Logical identity of a page within its tree: for a document leaf
/// this is `record_key >> RECORDS_PER_PAGE_SHIFT`; for trie nodes it
/// is assigned by the writer at allocation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PageId(pub u64);

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Absolute byte offset of a serialized page. Authoritative once set;
/// a reference's disk key never reverts from `Some` to `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DiskKey(pub u64);

/// Dense index into the active TIL's entries array. Only meaningful
/// while the reference's `generation` matches the TIL's current
/// generation (§4.C invariant).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogKey(pub u32);

/// The TIL's rotation counter.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Generation(pub u64);

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Revision(pub u64);

impl Revision {
    pub fn next(self) -> Revision {
        Revision(self.0 + 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatabaseId(pub u32);

/// Tag identifying the payload carried by a [`Page`]. Named
/// identically to the kinds enumerated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageKind {
    Uber,
    RevisionRoot,
    Indirect,
    KeyValueLeaf,
    Overflow,
    Name,
    Path,
    PathSummary,
    Cas,
    DeweyId,
    HotIndirect,
    HotLeaf,
    BitmapChunk,
}

impl PageKind {
    pub fn for_index(ty: IndexType) -> PageKind {
        match ty {
            IndexType::Document => PageKind::KeyValueLeaf,
            IndexType::Name => PageKind::Name,
            IndexType::Path => PageKind::Path,
            IndexType::PathSummary => PageKind::PathSummary,
            IndexType::Cas => PageKind::Cas,
            IndexType::DeweyId => PageKind::DeweyId,
            IndexType::ChangedNodes | IndexType::RecordToRevisions => PageKind::KeyValueLeaf,
        }
    }
}

/// A page reference that carries only a disk key: the identity used
/// by the record-page-fragment cache, which houses
/// single-revision fragments rather than combined pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentKey(pub DiskKey);

/// An indirect page's children are page references only, no payload
/// (policy).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndirectPage {
    pub children: Vec<Option<PageReference>>,
}

impl IndirectPage {
    pub fn new(fanout: usize) -> Self {
        Self {
            children: vec![None; fanout],
        }
    }
}

/// Generic contents of the thinner secondary-index page kinds. These
/// back PATH/NAME/CAS/DeweyId sub-trees' leaves when they are not
/// using the HOT variant (covers the HOT variant
/// specifically; these are the plain key/value carriers referenced
/// from the revision root for non-HOT configurations).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexLeafPage {
    pub entries: Vec<(Vec<u8>, Vec<u8>)>,
}

/// An off-page overflow chunk for oversized record payloads.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OverflowPage {
    pub bytes: Vec<u8>,
}

/// A fixed-size chunk of a free/used page bitmap, used by the storage
/// writer to track reclaimable disk offsets across GC (not otherwise
/// covered by this core, but a stable page kind is needed so the
/// revision root can reference it uniformly).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BitmapChunkPage {
    pub bits: Vec<u8>,
}

/// The in-memory body of a page, tagged by [`PageKind`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PageBody {
    Uber(UberPage),
    RevisionRoot(RevisionRootPage),
    Indirect(IndirectPage),
    KeyValueLeaf(LeafPage),
    Overflow(OverflowPage),
    IndexLeaf(IndexLeafPage),
    Hot(crate::hot::HotNode),
    BitmapChunk(BitmapChunkPage),
}

impl PageBody {
    pub fn kind(&self) -> PageKind {
        match self {
            PageBody::Uber(_) => PageKind::Uber,
            PageBody::RevisionRoot(_) => PageKind::RevisionRoot,
            PageBody::Indirect(_) => PageKind::Indirect,
            PageBody::KeyValueLeaf(_) => PageKind::KeyValueLeaf,
            PageBody::Overflow(_) => PageKind::Overflow,
            PageBody::IndexLeaf(_) => PageKind::Name,
            PageBody::Hot(node) => node.page_kind(),
            PageBody::BitmapChunk(_) => PageKind::BitmapChunk,
        }
    }
}

/// A page: its tagged body plus the identity/lifecycle bookkeeping
/// every kind shares.
#[derive(Debug)]
pub struct Page {
    pub id: PageId,
    pub revision: Revision,
    body: Mutex<PageBody>,
    closed: std::sync::atomic::AtomicBool,
    /// Guard count, modeled as a plain atomic on the page per the
    /// DESIGN NOTES re-architecture of guard-counted pinning.
    /// `close()` only finalizes once this reaches zero.
    guard: AtomicU32,
}

impl Page {
    pub fn new(id: PageId, revision: Revision, body: PageBody) -> Self {
        Self {
            id,
            revision,
            body: Mutex::new(body),
            closed: std::sync::atomic::AtomicBool::new(false),
            guard: AtomicU32::new(0),
        }
    }

    pub fn page_kind(&self) -> PageKind {
        self.body.lock().unwrap().kind()
    }

    pub fn body(&self) -> MutexGuard<'_, PageBody> {
        self.body.lock().unwrap()
    }

    pub fn with_body_mut<R>(&self, f: impl FnOnce(&mut PageBody) -> R) -> R {
        f(&mut self.body.lock().unwrap())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn guard_count(&self) -> u32 {
        self.guard.load(Ordering::Acquire)
    }

    pub fn acquire_guard(&self) -> bool {
        // Refuse to pin a page that has already been closed; the
        // caller must treat this the same as a `FrameReused` miss.
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        self.guard.fetch_add(1, Ordering::AcqRel);
        if self.closed.load(Ordering::Acquire) {
            self.release_guard();
            return false;
        }
        true
    }

    pub fn release_guard(&self) {
        let prev = self.guard.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "guard count underflow");
    }

    /// Idempotent. Off-heap memory owned by leaf pages is released
    /// here; returns `false` without closing if a guard is still
    /// held -- the last `release_guard` call must retry the close.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return true;
        }
        if self.guard.load(Ordering::Acquire) > 0 {
            // Defer: a reader still holds a guard. Un-mark closed so
            // the guard owner observes a live page and the buffer
            // manager retries close on last-guard-release.
            self.closed.store(false, Ordering::Release);
            return false;
        }
        if let PageBody::KeyValueLeaf(leaf) = &mut *self.body.lock().unwrap() {
            leaf.release_segment();
        }
        true
    }
}
