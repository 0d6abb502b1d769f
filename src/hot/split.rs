//! Leaf split and cascading parent integration: a full leaf divides
//! at its median key into two leaves;
//! the parent absorbs the extra child if it has room (Case A/B), or
//! itself splits on its most significant discriminative bit and the
//! split propagates upward (Case C), exactly like a B-tree node
//! split except the branch factor is capacity-bounded by
//! [`super::HotNodeKind`] rather than fixed.

use std::sync::Arc;

use crate::page::{DatabaseId, Page, PageBody, PageId, PageReference, ResourceId, Revision};
use crate::til::{PageContainer, TransactionIntentLog};
use crate::trie::IndirectPageSource;
use crate::{Error, Result};

use super::{hot_page, HotChild, HotIndirectNode, HotLeaf, HotNode, HotNodeKind};

fn common_prefix_len(keys: &[&[u8]]) -> usize {
    let Some(first) = keys.first() else {
        return 0;
    };
    let mut len = first.len();
    for key in &keys[1..] {
        len = len.min(key.len());
        len = first
            .iter()
            .zip(key.iter())
            .take(len)
            .take_while(|(a, b)| a == b)
            .count()
            .min(len);
    }
    len
}

fn page_min_key(page: &Page) -> Vec<u8> {
    let body = page.body();
    match &*body {
        PageBody::Hot(HotNode::Leaf(leaf)) => leaf.min_key().unwrap_or(&[]).to_vec(),
        PageBody::Hot(HotNode::Indirect(indirect)) => indirect.min_key().unwrap_or(&[]).to_vec(),
        _ => Vec::new(),
    }
}

fn build_indirect(children: Vec<HotChild>) -> HotIndirectNode {
    let min_keys: Vec<&[u8]> = children.iter().map(|c| c.min_key.as_slice()).collect();
    let initial_byte = common_prefix_len(&min_keys);
    let mut indirect = HotIndirectNode {
        kind: HotNodeKind::for_child_count(children.len()),
        initial_byte,
        mask: 0,
        children,
    };
    indirect.recompute();
    indirect
}

fn alloc_page(
    til: &mut TransactionIntentLog,
    id_gen: &mut impl FnMut() -> PageId,
    database_id: DatabaseId,
    resource_id: ResourceId,
    new_revision: Revision,
    node: HotNode,
) -> (PageReference, Arc<Page>) {
    let mut reference = PageReference::new(id_gen(), database_id, resource_id);
    let page = hot_page(reference.page_id(), new_revision, node);
    til.put(&mut reference, PageContainer::new_same(Arc::clone(&page)));
    (reference, page)
}

/// Splits `leaf_page` (which failed to accept `key`/`value` because
/// it was full), then cascades the resulting extra child up through
/// `stack` -- the visited ancestor chain, nearest parent last --
/// growing the tree's height if even the root overflows.
#[allow(clippy::too_many_arguments)]
pub fn split_and_integrate(
    til: &mut TransactionIntentLog,
    _source: &mut impl IndirectPageSource,
    id_gen: &mut impl FnMut() -> PageId,
    database_id: DatabaseId,
    resource_id: ResourceId,
    new_revision: Revision,
    root: &mut PageReference,
    stack: &mut Vec<(PageReference, Arc<Page>, usize)>,
    leaf_ref: PageReference,
    leaf_page: Arc<Page>,
    key: Vec<u8>,
    value: Vec<u8>,
    leaf_capacity: usize,
) -> Result<()> {
    let mut entries: Vec<(Vec<u8>, Vec<u8>)> = {
        let body = leaf_page.body();
        let PageBody::Hot(HotNode::Leaf(leaf)) = &*body else {
            return Err(Error::UnsplittablePage);
        };
        leaf.entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    };
    entries.push((key, value));
    entries.sort();
    let mid = entries.len() / 2;
    let (left_entries, right_entries) = entries.split_at(mid);

    let mut left = HotLeaf::new(leaf_capacity);
    for (k, v) in left_entries {
        left.entries.insert(k.clone(), v.clone());
    }
    let mut right = HotLeaf::new(leaf_capacity);
    for (k, v) in right_entries {
        right.entries.insert(k.clone(), v.clone());
    }

    // The left half keeps the original leaf's identity so references
    // held elsewhere this generation stay valid; the right half is a
    // freshly allocated page.
    let mut left_ref = leaf_ref;
    let left_page = hot_page(left_ref.page_id(), new_revision, HotNode::Leaf(left));
    let existing = til.get(&left_ref).cloned();
    let container = match existing {
        Some(PageContainer::Pair { complete, .. }) => {
            PageContainer::new_pair(complete, Arc::clone(&left_page))
        }
        _ => PageContainer::new_same(Arc::clone(&left_page)),
    };
    til.put(&mut left_ref, container);

    let (right_ref, right_page) = alloc_page(
        til,
        id_gen,
        database_id,
        resource_id,
        new_revision,
        HotNode::Leaf(right),
    );

    let mut new_children = vec![
        HotChild {
            partial_key: 0,
            min_key: page_min_key(&left_page),
            reference: left_ref,
        },
        HotChild {
            partial_key: 0,
            min_key: page_min_key(&right_page),
            reference: right_ref,
        },
    ];

    loop {
        match stack.pop() {
            None => {
                // The root itself split: grow height by one with a
                // fresh BiNode root (Case A, root variant).
                let node = HotNode::Indirect(build_indirect(new_children));
                let (new_root, _page) =
                    alloc_page(til, id_gen, database_id, resource_id, new_revision, node);
                *root = new_root;
                return Ok(());
            }
            Some((parent_ref, parent_page, child_idx)) => {
                let capacity = {
                    let body = parent_page.body();
                    let PageBody::Hot(HotNode::Indirect(indirect)) = &*body else {
                        return Err(Error::UnsplittablePage);
                    };
                    indirect.capacity()
                };

                let mut updated: Vec<HotChild> = {
                    let body = parent_page.body();
                    let PageBody::Hot(HotNode::Indirect(indirect)) = &*body else {
                        return Err(Error::UnsplittablePage);
                    };
                    indirect.children.clone()
                };
                updated.splice(child_idx..child_idx + 1, new_children.into_iter());

                if updated.len() <= capacity {
                    // Case B: the parent absorbs the extra child in
                    // place.
                    let mut body = parent_page.body();
                    if let PageBody::Hot(HotNode::Indirect(indirect)) = &mut *body {
                        indirect.children = updated;
                        indirect.recompute();
                    }
                    drop(body);
                    // `parent_page`'s Arc is the same instance already
                    // tracked by the TIL container for `parent_ref`
                    // (it was fetched from there), so no further
                    // `til.put` is needed; but the parent's own slot
                    // in its grandparent must still carry the stamped
                    // identity.
                    let _ = parent_ref;
                    return Ok(());
                }

                // Case C: the parent itself is full. Partition its
                // children by the most significant discriminative bit
                // of the updated set and push two fresh nodes up as
                // this level's replacement, cascading the split.
                let min_keys: Vec<&[u8]> = updated.iter().map(|c| c.min_key.as_slice()).collect();
                let initial_byte = common_prefix_len(&min_keys);
                let mask = super::bits::discriminative_mask(&min_keys, initial_byte);
                let msb = super::bits::most_significant_bit(mask).unwrap_or(1);

                let (left_half, right_half): (Vec<HotChild>, Vec<HotChild>) =
                    updated.into_iter().partition(|c| {
                        let partial =
                            super::bits::extract_partial_key(&c.min_key, initial_byte, mask);
                        (partial as u16) & msb == 0
                    });

                let left_node = HotNode::Indirect(build_indirect(left_half));
                let right_node = HotNode::Indirect(build_indirect(right_half));
                let (left_ref, left_page) = alloc_page(
                    til,
                    id_gen,
                    database_id,
                    resource_id,
                    new_revision,
                    left_node,
                );
                let (right_ref, right_page) = alloc_page(
                    til,
                    id_gen,
                    database_id,
                    resource_id,
                    new_revision,
                    right_node,
                );

                new_children = vec![
                    HotChild {
                        partial_key: 0,
                        min_key: page_min_key(&left_page),
                        reference: left_ref,
                    },
                    HotChild {
                        partial_key: 0,
                        min_key: page_min_key(&right_page),
                        reference: right_ref,
                    },
                ];
                // The old parent page is superseded; nothing else
                // references it once the grandparent absorbs the
                // replacement pair.
                parent_page.close();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hot::HotTrieWriter;
    use crate::page::ResourceId;

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
    fn leaf_split_promotes_two_children_to_a_new_root() {
        let mut til = TransactionIntentLog::new();
        let mut source = NoSource;
        let mut id_gen = ids();
        let mut root = PageReference::new(PageId(0), DatabaseId(0), ResourceId(0));

        for i in 0u8..40 {
            HotTrieWriter::insert(
                &mut til,
                &mut source,
                &mut id_gen,
                &mut root,
                DatabaseId(0),
                ResourceId(0),
                Revision(1),
                8,
                &[i],
                vec![i],
            )
            .unwrap();
        }

        let container = til.get(&root).unwrap();
        let body = container.modified().body();
        assert!(
            matches!(&*body, PageBody::Hot(HotNode::Indirect(_))),
            "root must have split into an indirect node once capacity overflowed"
        );
    }
}
