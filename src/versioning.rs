//! Fragment-combine strategies.
//!
//! A logical leaf page may be scattered across N on-disk fragments
//! written in different revisions; `combine` folds them, newest first,
//! into one [`LeafPage`]. The strategy in effect only changes how many
//! fragments are consulted before the result is considered complete --
//! the overlay itself is always "newer slot wins" (`LeafPage::overlay_from`).

use crate::config::VersioningType;
use crate::page::LeafPage;

/// Combines `fragments` (newest first, as read off `ref.key` followed
/// by `ref.pageFragments`) into a single logical page.
pub fn combine(strategy: VersioningType, fragments: &[LeafPage], max_revisions: usize) -> LeafPage {
    match strategy {
        VersioningType::Full => fragments.first().cloned().unwrap_or_default(),
        VersioningType::Differential => combine_bounded(fragments, 2),
        VersioningType::Incremental => combine_until_full(fragments, max_revisions),
        VersioningType::Sliding => combine_bounded(fragments, max_revisions),
    }
}

/// Overlays fragments newest-to-oldest until either the page is full
/// (every slot accounted for) or `max_revisions.min(fragments.len())`
/// fragments have been consulted, whichever comes first (incremental
/// and sliding share this loop; they differ only in what bound the
/// caller passes).
fn combine_until_full(fragments: &[LeafPage], max_revisions: usize) -> LeafPage {
    let mut result = LeafPage::new(false);
    for fragment in fragments.iter().take(max_revisions.max(1)) {
        result.overlay_from(fragment);
        if result.is_full() {
            break;
        }
    }
    result
}

fn combine_bounded(fragments: &[LeafPage], bound: usize) -> LeafPage {
    let mut result = LeafPage::new(false);
    for fragment in fragments.iter().take(bound.max(1)) {
        result.overlay_from(fragment);
    }
    result
}
