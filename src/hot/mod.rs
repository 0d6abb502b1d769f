//! Keyed (HOT) trie writer for secondary PATH/CAS/NAME indexes: a
//! height-optimal trie keyed by variable-length byte strings, with
//! three indirect node kinds distinguished only by child-count
//! capacity, and bit-extraction child dispatch.
//!
//! The COW-via-TIL mechanics mirror [`crate::trie`]'s indirection
//! trie writer (same `(complete, modified)` container discipline,
//! same [`crate::trie::IndirectPageSource`] collaborator); what
//! differs is the node shape and the split logic in [`split`].

pub mod bits;
pub mod split;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::page::{
    DatabaseId, Page, PageBody, PageId, PageKind, PageReference, ResourceId, Revision,
};
use crate::til::{PageContainer, TransactionIntentLog};
use crate::trie::IndirectPageSource;
use crate::{Error, Result};

const BI_CAPACITY: usize = 2;
const SPAN_CAPACITY: usize = 16;
const MULTI_CAPACITY: usize = 32;

/// Fixed upper bound on the parent-path stack depth. 2^64 key space
/// makes this generous; exceeding it is a programming error, not a
/// recoverable condition.
pub const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HotNodeKind {
    Bi,
    Span,
    Multi,
}

impl HotNodeKind {
    fn for_child_count(count: usize) -> Self {
        if count <= BI_CAPACITY {
            HotNodeKind::Bi
        } else if count <= SPAN_CAPACITY {
            HotNodeKind::Span
        } else {
            HotNodeKind::Multi
        }
    }

    pub fn capacity(self) -> usize {
        match self {
            HotNodeKind::Bi => BI_CAPACITY,
            HotNodeKind::Span => SPAN_CAPACITY,
            HotNodeKind::Multi => MULTI_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HotChild {
    pub partial_key: u8,
    pub min_key: Vec<u8>,
    pub reference: PageReference,
}

/// An indirect HOT node: an initial byte position, a discriminative
/// bit mask, and per-child compressed partial keys for O(1) dispatch
///.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HotIndirectNode {
    pub kind: HotNodeKind,
    pub initial_byte: usize,
    pub mask: u16,
    pub children: Vec<HotChild>,
}

impl HotIndirectNode {
    pub fn capacity(&self) -> usize {
        self.kind.capacity()
    }

    pub fn is_full(&self) -> bool {
        self.children.len() >= self.capacity()
    }

    pub fn find_child_index(&self, key: &[u8]) -> Option<usize> {
        let partial = bits::extract_partial_key(key, self.initial_byte, self.mask);
        self.children.iter().position(|c| c.partial_key == partial)
    }

    pub fn min_key(&self) -> Option<&[u8]> {
        self.children.iter().map(|c| c.min_key.as_slice()).min()
    }

    /// Recomputes `mask` and every child's `partial_key` after the
    /// child set changes.
    pub fn recompute(&mut self) {
        let keys: Vec<&[u8]> = self.children.iter().map(|c| c.min_key.as_slice()).collect();
        self.mask = bits::discriminative_mask(&keys, self.initial_byte);
        self.kind = HotNodeKind::for_child_count(self.children.len());
        for child in &mut self.children {
            child.partial_key =
                bits::extract_partial_key(&child.min_key, self.initial_byte, self.mask);
        }
    }
}

/// A HOT leaf: a bounded map of full keys to opaque values. Capacity
/// is set per index at tree-creation time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HotLeaf {
    pub entries: BTreeMap<Vec<u8>, Vec<u8>>,
    pub capacity: usize,
}

impl HotLeaf {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            capacity,
        }
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn min_key(&self) -> Option<&[u8]> {
        self.entries.keys().next().map(|k| k.as_slice())
    }

    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.entries.get(key).map(|v| v.as_slice())
    }

    /// Inserts or overwrites `key`. Returns `false` if the leaf is
    /// full and `key` is not already present, signaling the caller to
    /// split.
    pub fn insert(&mut self, key: Vec<u8>, value: Vec<u8>) -> bool {
        if !self.entries.contains_key(&key) && self.is_full() {
            return false;
        }
        self.entries.insert(key, value);
        true
    }
}

/// The in-memory body of a HOT page, tagged by whether it is a leaf
/// or an indirect dispatch node (`HOTLeaf`/`HOTIndirect`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum HotNode {
    Leaf(HotLeaf),
    Indirect(HotIndirectNode),
}

impl HotNode {
    pub fn page_kind(&self) -> PageKind {
        match self {
            HotNode::Leaf(_) => PageKind::HotLeaf,
            HotNode::Indirect(_) => PageKind::HotIndirect,
        }
    }
}

fn hot_page(page_id: PageId, revision: Revision, node: HotNode) -> Arc<Page> {
    Arc::new(Page::new(page_id, revision, PageBody::Hot(node)))
}

/// Re-derives a navigable copy of a reference stored by value inside
/// a HOT node's children, preserving TIL identity when this
/// generation already staged it (same hazard, same fix, as
/// [`crate::trie`]'s indirection writer).
fn reusable_copy(
    stored: &PageReference,
    current_generation: crate::page::Generation,
) -> PageReference {
    if stored.log_key.is_some() && stored.generation == current_generation {
        stored.snapshot_copy()
    } else {
        stored.clone()
    }
}

pub struct HotTrieWriter;

impl HotTrieWriter {
    /// Inserts `(key, value)`, COW-propagating along the parent path
    /// and splitting the leaf (and cascading into ancestors) if it is
    /// full.
    #[allow(clippy::too_many_arguments)]
    pub fn insert(
        til: &mut TransactionIntentLog,
        source: &mut impl IndirectPageSource,
        id_gen: &mut impl FnMut() -> PageId,
        root: &mut PageReference,
        database_id: DatabaseId,
        resource_id: ResourceId,
        new_revision: Revision,
        leaf_capacity: usize,
        key: &[u8],
        value: Vec<u8>,
    ) -> Result<()> {
        if root.key.is_none() && til.get(root).is_none() {
            // Empty tree: the root reassigns directly to a fresh leaf
            // rather than propagating a COW through a nonexistent
            // parent path (Open Question, see DESIGN.md).
            let leaf = hot_page(
                root.page_id(),
                new_revision,
                HotNode::Leaf(HotLeaf::new(leaf_capacity)),
            );
            til.put(root, PageContainer::new_same(leaf));
        }

        // Each stack entry is a visited ancestor: its own reference
        // (so a cascading split can COW it again), its modified page,
        // and which child slot led to the next entry.
        let mut stack: Vec<(PageReference, Arc<Page>, usize)> = Vec::with_capacity(MAX_DEPTH);
        let mut current_ref = reusable_copy(root, til.current_generation());
        let mut current = Self::cow(til, source, &mut current_ref, new_revision)?;
        *root = current_ref.snapshot_copy();

        let (leaf_ref, leaf_page) = loop {
            let is_leaf = matches!(&*current.body(), PageBody::Hot(HotNode::Leaf(_)));
            if is_leaf {
                break (current_ref, current);
            }
            if stack.len() >= MAX_DEPTH {
                return Err(Error::TreeHeightExceeded(MAX_DEPTH));
            }

            let child_idx = {
                let body = current.body();
                let PageBody::Hot(HotNode::Indirect(indirect)) = &*body else {
                    return Err(Error::UnsplittablePage);
                };
                indirect
                    .find_child_index(key)
                    .ok_or(Error::PageNotFound(current.id))?
            };

            let mut child_ref = {
                let body = current.body();
                let PageBody::Hot(HotNode::Indirect(indirect)) = &*body else {
                    return Err(Error::UnsplittablePage);
                };
                reusable_copy(
                    &indirect.children[child_idx].reference,
                    til.current_generation(),
                )
            };

            let child_page = Self::cow(til, source, &mut child_ref, new_revision)?;
            let next_ref = child_ref.snapshot_copy();

            {
                let mut body = current.body();
                if let PageBody::Hot(HotNode::Indirect(indirect)) = &mut *body {
                    indirect.children[child_idx].reference = child_ref;
                }
            }

            stack.push((current_ref, current, child_idx));
            current_ref = next_ref;
            current = child_page;
        };

        let leaf_key_owned = key.to_vec();
        let inserted = {
            let mut body = leaf_page.body();
            let PageBody::Hot(HotNode::Leaf(leaf)) = &mut *body else {
                return Err(Error::UnsplittablePage);
            };
            leaf.insert(leaf_key_owned.clone(), value.clone())
        };

        if inserted {
            return Ok(());
        }

        // Leaf is full: split and integrate into the parent path.
        split::split_and_integrate(
            til,
            source,
            id_gen,
            database_id,
            resource_id,
            new_revision,
            root,
            &mut stack,
            leaf_ref,
            leaf_page,
            leaf_key_owned,
            value,
            leaf_capacity,
        )
    }

    /// Point lookup; does not mutate the TIL (traversal,
    /// read side).
    pub fn lookup(
        source: &mut impl IndirectPageSource,
        root: &PageReference,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        let mut reference = root.snapshot_copy();
        let mut page = source.load(&mut reference)?;
        loop {
            let body = page.body();
            match &*body {
                PageBody::Hot(HotNode::Leaf(leaf)) => return Ok(leaf.get(key).map(|v| v.to_vec())),
                PageBody::Hot(HotNode::Indirect(indirect)) => {
                    let Some(idx) = indirect.find_child_index(key) else {
                        return Ok(None);
                    };
                    let mut child_ref = indirect.children[idx].reference.snapshot_copy();
                    drop(body);
                    page = source.load(&mut child_ref)?;
                }
                _ => return Err(Error::UnsplittablePage),
            }
        }
    }

    /// Returns the `modified` page for `reference`, COW-propagating a
    /// fresh copy into the TIL if this is the first visit this
    /// generation.
    fn cow(
        til: &mut TransactionIntentLog,
        source: &mut impl IndirectPageSource,
        reference: &mut PageReference,
        new_revision: Revision,
    ) -> Result<Arc<Page>> {
        if let Some(container) = til.get(reference) {
            return Ok(Arc::clone(container.modified()));
        }

        let complete = source.load(reference)?;
        let modified = match &*complete.body() {
            PageBody::Hot(node) => hot_page(complete.id, new_revision, node.clone()),
            _ => return Err(Error::UnsplittablePage),
        };
        til.put(
            reference,
            PageContainer::new_pair(Arc::clone(&complete), Arc::clone(&modified)),
        );
        Ok(modified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoSource;
    impl IndirectPageSource for NoSource {
        fn load(&mut self, reference: &mut PageReference) -> Result<Arc<Page>> {
            Err(Error::PageNotFound(reference.page_id()))
        }
    }

    fn ids() -> impl FnMut() -> PageId {
        let mut next = 1u64;
        move || {
            let id = PageId(next);
            next += 1;
            id
        }
    }

    #[test]
    fn insert_into_empty_tree_reassigns_root_leaf() {
        let mut til = TransactionIntentLog::new();
        let mut source = NoSource;
        let mut id_gen = ids();
        let mut root = PageReference::new(PageId(0), DatabaseId(0), ResourceId(0));

        HotTrieWriter::insert(
            &mut til,
            &mut source,
            &mut id_gen,
            &mut root,
            DatabaseId(0),
            ResourceId(0),
            Revision(1),
            32,
            b"abc",
            b"1".to_vec(),
        )
        .unwrap();

        let container = til.get(&root).unwrap();
        let body = container.modified().body();
        let PageBody::Hot(HotNode::Leaf(leaf)) = &*body else {
            panic!("expected a leaf");
        };
        assert_eq!(leaf.get(b"abc"), Some(b"1".as_slice()));
    }

    #[test]
    fn repeated_inserts_within_one_transaction_accumulate() {
        let mut til = TransactionIntentLog::new();
        let mut source = NoSource;
        let mut id_gen = ids();
        let mut root = PageReference::new(PageId(0), DatabaseId(0), ResourceId(0));

        for i in 0..5u8 {
            HotTrieWriter::insert(
                &mut til,
                &mut source,
                &mut id_gen,
                &mut root,
                DatabaseId(0),
                ResourceId(0),
                Revision(1),
                32,
                &[i],
                vec![i],
            )
            .unwrap();
        }

        let container = til.get(&root).unwrap();
        let body = container.modified().body();
        let PageBody::Hot(HotNode::Leaf(leaf)) = &*body else {
            panic!("expected a leaf");
        };
        assert_eq!(leaf.entries.len(), 5, "earlier inserts must not be lost");
    }
}
