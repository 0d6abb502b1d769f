//! Indirection trie writer.
//!
//! A page key is decomposed into fixed-width levels; each level is an
//! [`IndirectPage`] whose children are references only. Navigation
//! COW-propagates along the visited path: every indirect page touched
//! during a write gets its own `(complete, modified)` container in the
//! active TIL, and the walk always continues into the `modified` copy
//! so later levels see the in-progress version.

use std::sync::Arc;

use crate::page::{
    DatabaseId, IndirectPage, Page, PageBody, PageId, PageReference, ResourceId, Revision,
};
use crate::til::{PageContainer, TransactionIntentLog};
use crate::{Error, Result};

/// Re-derives a navigable copy of a reference stored by value inside
/// an indirect page's children vector. [`PageReference::clone`]
/// deliberately mints a fresh identity, which is correct the first
/// time a generation visits an unmodified child -- but if this exact
/// reference was already COW'd earlier in the same transaction (it
/// carries the current generation's log key), cloning would lose that
/// bookkeeping and cause the next `cow_indirect` to re-derive the page
/// from scratch, silently discarding the earlier modification. In
/// that case reuse the stored identity via `snapshot_copy` instead.
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

/// Children per indirect page level: 1024-way fanout, 10 bits/level.
pub const BITS_PER_LEVEL: u32 = 10;
pub const FANOUT: usize = 1 << BITS_PER_LEVEL;
const MASK: u64 = (FANOUT as u64) - 1;

/// Resolves an indirect page not already present in the TIL, through
/// whatever layered lookup the caller's read transaction implements
/// (swizzle → TIL → snapshot → buffer cache → disk). Kept as a trait
/// so `trie` has no dependency on `read_txn`; `write_txn` supplies the
/// real implementation by composition over its embedded reader.
pub trait IndirectPageSource {
    fn load(&mut self, reference: &mut PageReference) -> Result<Arc<Page>>;
}

/// The outcome of a trie walk: the leaf-page reference, plus enough to
/// write a mutated copy of it back into its parent's child slot once
/// the caller stamps it with a log key.
pub struct LeafSlot {
    pub reference: PageReference,
    parent: Arc<Page>,
    offset: usize,
}

impl LeafSlot {
    pub fn reference_mut(&mut self) -> &mut PageReference {
        &mut self.reference
    }

    /// Publishes the (possibly just-stamped) leaf reference into its
    /// parent indirect page. Call this after `til.put` has assigned a
    /// log key, so subsequent lookups through the parent see it.
    pub fn write_back(&self) {
        let mut body = self.parent.body();
        if let PageBody::Indirect(indirect) = &mut *body {
            indirect.children[self.offset] = Some(self.reference.snapshot_copy());
        }
    }
}

pub struct TrieWriter;

impl TrieWriter {
    /// Walks from `root` to the leaf-page reference addressing `key`,
    /// growing the tree's height first if `key` overflows what the
    /// current height can address.
    #[allow(clippy::too_many_arguments)]
    pub fn prepare_leaf_reference(
        til: &mut TransactionIntentLog,
        source: &mut impl IndirectPageSource,
        id_gen: &mut impl FnMut() -> PageId,
        root: &mut PageReference,
        height: &mut u32,
        database_id: DatabaseId,
        resource_id: ResourceId,
        new_revision: Revision,
        key: u64,
    ) -> Result<LeafSlot> {
        Self::ensure_height(
            til,
            root,
            height,
            id_gen,
            database_id,
            resource_id,
            new_revision,
            key,
        );

        let mut modified_page = Self::cow_indirect(til, source, root, new_revision)?;

        for level in (0..*height).rev() {
            let offset = ((key >> (level as u64 * BITS_PER_LEVEL as u64)) & MASK) as usize;

            if level == 0 {
                let leaf_ref = {
                    let mut body = modified_page.body();
                    let PageBody::Indirect(indirect) = &mut *body else {
                        return Err(Error::UnsplittablePage);
                    };
                    match indirect.children[offset].as_ref() {
                        Some(r) => reusable_copy(r, til.current_generation()),
                        None => {
                            let r = PageReference::new(id_gen(), database_id, resource_id);
                            indirect.children[offset] = Some(r.clone());
                            r
                        }
                    }
                };
                return Ok(LeafSlot {
                    reference: leaf_ref,
                    parent: modified_page,
                    offset,
                });
            }

            let mut child_ref = {
                let mut body = modified_page.body();
                let PageBody::Indirect(indirect) = &mut *body else {
                    return Err(Error::UnsplittablePage);
                };
                match indirect.children[offset].as_ref() {
                    Some(r) => reusable_copy(r, til.current_generation()),
                    None => {
                        let r = PageReference::new(id_gen(), database_id, resource_id);
                        indirect.children[offset] = Some(r.clone());
                        r
                    }
                }
            };

            let child_modified = Self::cow_indirect(til, source, &mut child_ref, new_revision)?;

            {
                let mut body = modified_page.body();
                if let PageBody::Indirect(indirect) = &mut *body {
                    indirect.children[offset] = Some(child_ref);
                }
            }

            modified_page = child_modified;
        }

        unreachable!("height is always >= 1")
    }

    /// Grows the tree by inserting new top-level indirect pages at
    /// offset 0 (pointing to the prior root) until `key` fits in the
    /// addressable range of `height` levels.
    #[allow(clippy::too_many_arguments)]
    fn ensure_height(
        til: &mut TransactionIntentLog,
        root: &mut PageReference,
        height: &mut u32,
        id_gen: &mut impl FnMut() -> PageId,
        database_id: DatabaseId,
        resource_id: ResourceId,
        new_revision: Revision,
        key: u64,
    ) {
        while *height == 0 || (key >> (*height as u64 * BITS_PER_LEVEL as u64)) != 0 {
            let old_root = reusable_copy(root, til.current_generation());
            let mut new_root = PageReference::new(id_gen(), database_id, resource_id);
            let mut indirect = IndirectPage::new(FANOUT);
            indirect.children[0] = Some(old_root);
            let page = Arc::new(Page::new(
                new_root.page_id(),
                new_revision,
                PageBody::Indirect(indirect),
            ));
            til.put(&mut new_root, PageContainer::new_same(Arc::clone(&page)));
            *root = new_root;
            *height += 1;
        }
    }

    /// Returns the `modified` page for `reference`, COW-propagating a
    /// fresh copy into the TIL if this is the first visit this
    /// generation; a later visit in the same generation just reuses
    /// the copy already installed via `put`.
    fn cow_indirect(
        til: &mut TransactionIntentLog,
        source: &mut impl IndirectPageSource,
        reference: &mut PageReference,
        new_revision: Revision,
    ) -> Result<Arc<Page>> {
        if let Some(container) = til.get(reference) {
            return Ok(Arc::clone(container.modified()));
        }

        if reference.key.is_none() {
            let page = Arc::new(Page::new(
                reference.page_id(),
                new_revision,
                PageBody::Indirect(IndirectPage::new(FANOUT)),
            ));
            til.put(reference, PageContainer::new_same(Arc::clone(&page)));
            return Ok(page);
        }

        let complete = source.load(reference)?;
        let children = match &*complete.body() {
            PageBody::Indirect(indirect) => indirect.children.clone(),
            _ => return Err(Error::UnsplittablePage),
        };
        let modified = Arc::new(Page::new(
            complete.id,
            new_revision,
            PageBody::Indirect(IndirectPage { children }),
        ));
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
    fn prepare_leaf_reference_allocates_nested_path() {
        let mut til = TransactionIntentLog::new();
        let mut source = NoSource;
        let mut id_gen = ids();
        let mut root = PageReference::new(PageId(0), DatabaseId(0), ResourceId(0));
        let mut height = 1u32;

        let slot = TrieWriter::prepare_leaf_reference(
            &mut til,
            &mut source,
            &mut id_gen,
            &mut root,
            &mut height,
            DatabaseId(0),
            ResourceId(0),
            Revision(1),
            42,
        )
        .unwrap();

        assert_eq!(height, 1);
        assert!(slot.reference.key.is_none());
        assert!(til.get(&root).is_some());
    }

    #[test]
    fn ensure_height_grows_root_for_large_keys() {
        let mut til = TransactionIntentLog::new();
        let mut source = NoSource;
        let mut id_gen = ids();
        let mut root = PageReference::new(PageId(0), DatabaseId(0), ResourceId(0));
        let mut height = 1u32;

        let big_key = 1u64 << 15; // exceeds one 10-bit level

        TrieWriter::prepare_leaf_reference(
            &mut til,
            &mut source,
            &mut id_gen,
            &mut root,
            &mut height,
            DatabaseId(0),
            ResourceId(0),
            Revision(1),
            big_key,
        )
        .unwrap();

        assert!(height >= 2);
    }

    #[test]
    fn write_back_publishes_stamped_reference_into_parent() {
        let mut til = TransactionIntentLog::new();
        let mut source = NoSource;
        let mut id_gen = ids();
        let mut root = PageReference::new(PageId(0), DatabaseId(0), ResourceId(0));
        let mut height = 1u32;

        let mut slot = TrieWriter::prepare_leaf_reference(
            &mut til,
            &mut source,
            &mut id_gen,
            &mut root,
            &mut height,
            DatabaseId(0),
            ResourceId(0),
            Revision(1),
            7,
        )
        .unwrap();

        let leaf_page = Arc::new(Page::new(
            slot.reference.page_id(),
            Revision(1),
            PageBody::KeyValueLeaf(crate::page::LeafPage::new(false)),
        ));
        til.put(slot.reference_mut(), PageContainer::new_same(leaf_page));
        slot.write_back();

        let root_container = til.get(&root).unwrap();
        let body_guard = root_container.modified().body();
        let PageBody::Indirect(indirect) = &*body_guard else {
            panic!("root must be indirect");
        };
        let offset = (7u64 & MASK) as usize;
        assert_eq!(
            indirect.children[offset].as_ref().unwrap().log_key,
            slot.reference.log_key
        );
    }
}
