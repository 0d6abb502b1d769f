//! Page read transaction.
//!
//! Bound to one revision. `get_record` walks the indirection trie
//! read-only, then either takes the TIL/snapshot-resolved page
//! directly (already authoritative, no combining needed) or combines
//! on-disk fragments per the configured versioning strategy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::buffer::{BufferManager, Cache, CacheKey, EpochTicket, FragmentCacheKey};
use crate::config::ResourceConfig;
use crate::page::{
    DatabaseId, DiskKey, Page, PageBody, PageId, PageReference, ResourceId, Revision,
    RevisionRootPage,
};
use crate::record::{IndexType, Record, RecordKey};
use crate::snapshot::CommitSnapshot;
use crate::storage::{BlockFile, StorageEngine};
use crate::til::TransactionIntentLog;
use crate::{versioning, Error, Result};

fn trie_mask() -> u64 {
    (1u64 << crate::trie::BITS_PER_LEVEL) - 1
}

/// Tags whether a resolved page is already the authoritative combined
/// page (came from the swizzle slot, the active TIL, or a still-open
/// snapshot) or a single physical fragment read from cache/disk that
/// may need combining with older fragments before it is returned.
enum Resolved {
    Authoritative(Arc<Page>),
    Physical(Arc<Page>),
}

impl Resolved {
    fn into_page(self) -> Arc<Page> {
        match self {
            Resolved::Authoritative(p) | Resolved::Physical(p) => p,
        }
    }
}

fn swap_guard(guard: &mut Option<Arc<Page>>, page: Arc<Page>) {
    if let Some(prev) = guard.take() {
        prev.release_guard();
    }
    *guard = Some(page);
}

/// Which of [`BufferManager`]'s two full-page caches a physical
/// (cache/disk) read falls back to: non-leaf and revision-root pages
/// go in `page_cache`, combined key-value leaf pages go in their own
/// `record_page_cache` so a hot leaf working set never evicts the
/// indirection trie's internal nodes (or vice versa).
#[derive(Clone, Copy)]
enum CacheKind {
    Page,
    Record,
}

fn select_cache(kind: CacheKind) -> fn(&mut BufferManager) -> &mut Cache<CacheKey> {
    match kind {
        CacheKind::Page => |b: &mut BufferManager| &mut b.page_cache,
        CacheKind::Record => |b: &mut BufferManager| &mut b.record_page_cache,
    }
}

/// The five-step layered lookup. Mutates `reference` only
/// via its interior-mutable swizzle slot and, in the snapshot-complete
/// case, its disk key -- both legal on a shared/live reference.
#[allow(clippy::too_many_arguments)]
fn resolve<F: BlockFile>(
    storage: &StorageEngine<F>,
    buffer: &RwLock<BufferManager>,
    til: Option<&Mutex<TransactionIntentLog>>,
    snapshot: Option<&CommitSnapshot>,
    revision: Revision,
    guard: &mut Option<Arc<Page>>,
    reference: &mut PageReference,
    cache_kind: CacheKind,
) -> Result<Resolved> {
    if let Some(page) = reference.swizzled() {
        if page.acquire_guard() {
            swap_guard(guard, Arc::clone(&page));
            return Ok(Resolved::Authoritative(page));
        }
        reference.clear_swizzled();
    }

    if let Some(til) = til {
        let log = til.lock().unwrap();
        if reference.generation == log.current_generation() {
            if let Some(container) = log.get(reference) {
                let page = Arc::clone(container.modified());
                drop(log);
                if page.acquire_guard() {
                    swap_guard(guard, Arc::clone(&page));
                    return Ok(Resolved::Authoritative(page));
                }
            }
        }
    }

    if let Some(snapshot) = snapshot {
        if let Some(container) = snapshot.lookup(reference) {
            if snapshot.is_commit_complete() {
                snapshot.propagate_into(reference);
            } else {
                let page = Arc::clone(container.modified());
                if page.acquire_guard() {
                    swap_guard(guard, Arc::clone(&page));
                    return Ok(Resolved::Authoritative(page));
                }
            }
        }
    }

    let key = CacheKey::from(&*reference);
    let page = load_guarded(
        storage,
        buffer,
        select_cache(cache_kind),
        key,
        reference,
        revision,
    )?;
    reference.set_swizzled(Arc::clone(&page));
    swap_guard(guard, Arc::clone(&page));
    Ok(Resolved::Physical(page))
}

/// Buffer-cache hit, or physical read through the storage reader
/// installed via `putIfAbsent` then re-acquired via `getAndGuard`
/// (step 5, "resolving the race where another thread
/// installed a different instance").
fn load_guarded<F: BlockFile, K: Copy + Eq + std::hash::Hash>(
    storage: &StorageEngine<F>,
    buffer: &RwLock<BufferManager>,
    cache: impl Fn(&mut BufferManager) -> &mut crate::buffer::Cache<K>,
    key: K,
    reference: &PageReference,
    revision: Revision,
) -> Result<Arc<Page>> {
    {
        let mut guard = buffer.write().unwrap();
        if let Some(page) = cache(&mut guard).get_and_guard(&key) {
            return Ok(page);
        }
    }
    let page = storage.read(reference, revision)?;
    let mut guard = buffer.write().unwrap();
    let installed = cache(&mut guard).put_if_absent(key, page);
    Ok(cache(&mut guard).get_and_guard(&key).unwrap_or(installed))
}

fn resolve_fragment<F: BlockFile>(
    storage: &StorageEngine<F>,
    buffer: &RwLock<BufferManager>,
    revision: Revision,
    database_id: DatabaseId,
    resource_id: ResourceId,
    disk_key: DiskKey,
) -> Result<Arc<Page>> {
    let key = FragmentCacheKey(disk_key);
    let mut reference = PageReference::new(PageId(0), database_id, resource_id);
    reference.key = Some(disk_key);
    load_guarded(
        storage,
        buffer,
        |b| &mut b.fragment_cache,
        key,
        &reference,
        revision,
    )
}

/// Read-only descent to the leaf reference addressing `page_key`,
/// returning a snapshot copy (stable identity, decoupled from the
/// live indirect page so it can be cached across calls).
#[allow(clippy::too_many_arguments)]
fn walk<F: BlockFile>(
    storage: &StorageEngine<F>,
    buffer: &RwLock<BufferManager>,
    til: Option<&Mutex<TransactionIntentLog>>,
    snapshot: Option<&CommitSnapshot>,
    revision: Revision,
    guard: &mut Option<Arc<Page>>,
    reference: &mut PageReference,
    height: u32,
    page_key: u64,
) -> Result<Option<PageReference>> {
    if height == 0 {
        // The index root reference is itself the leaf; there is no
        // indirect parent to read a children array out of.
        return Ok(Some(reference.snapshot_copy()));
    }

    let mut page = resolve(
        storage,
        buffer,
        til,
        snapshot,
        revision,
        guard,
        reference,
        CacheKind::Page,
    )?
    .into_page();

    for level in (0..height).rev() {
        let offset = ((page_key >> (level as u64 * crate::trie::BITS_PER_LEVEL as u64))
            & trie_mask()) as usize;
        let next_page;
        {
            let mut body = page.body();
            let PageBody::Indirect(indirect) = &mut *body else {
                return Err(Error::UnsplittablePage);
            };
            let Some(child) = indirect.children[offset].as_mut() else {
                return Ok(None);
            };
            if level == 0 {
                return Ok(Some(child.snapshot_copy()));
            }
            next_page = resolve(
                storage,
                buffer,
                til,
                snapshot,
                revision,
                guard,
                child,
                CacheKind::Page,
            )?
            .into_page();
        }
        page = next_page;
    }

    unreachable!("level 0 always returns")
}

pub struct PageReadTrx<F: BlockFile> {
    revision: Revision,
    database_id: DatabaseId,
    resource_id: ResourceId,
    storage: Arc<StorageEngine<F>>,
    buffer: Arc<RwLock<BufferManager>>,
    til: Option<Arc<Mutex<TransactionIntentLog>>>,
    snapshot: Option<Arc<CommitSnapshot>>,
    config: ResourceConfig,
    revision_root: RevisionRootPage,
    /// Most-recently-read leaf slot per index, amortizing repeated
    /// lookups against the same leaf page.
    recent: HashMap<(IndexType, u8), (u64, PageReference)>,
    guard: Option<Arc<Page>>,
    /// Pins `revision` as observable for the lifetime of this reader;
    /// dropping it lets the buffer manager's epoch-aware eviction
    /// reclaim pages from this revision once no other reader needs
    /// them.
    _epoch_ticket: EpochTicket,
}

impl<F: BlockFile> PageReadTrx<F> {
    pub fn new(
        revision: Revision,
        database_id: DatabaseId,
        resource_id: ResourceId,
        storage: Arc<StorageEngine<F>>,
        buffer: Arc<RwLock<BufferManager>>,
        config: ResourceConfig,
        revision_root: RevisionRootPage,
    ) -> Self {
        let epoch_ticket = buffer.read().unwrap().epochs.register(revision);
        Self {
            revision,
            database_id,
            resource_id,
            storage,
            buffer,
            til: None,
            snapshot: None,
            config,
            revision_root,
            recent: HashMap::new(),
            guard: None,
            _epoch_ticket: epoch_ticket,
        }
    }

    /// Attaches the active TIL, turning this into the writer's own
    /// embedded reader.
    pub fn with_til(mut self, til: Arc<Mutex<TransactionIntentLog>>) -> Self {
        self.til = Some(til);
        self
    }

    pub fn with_snapshot(mut self, snapshot: Arc<CommitSnapshot>) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    pub fn clear_snapshot(&mut self) {
        self.snapshot = None;
    }

    pub fn revision(&self) -> Revision {
        self.revision
    }

    pub fn revision_root(&self) -> &RevisionRootPage {
        &self.revision_root
    }

    pub fn revision_root_mut(&mut self) -> &mut RevisionRootPage {
        &mut self.revision_root
    }

    pub fn config(&self) -> &ResourceConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<StorageEngine<F>> {
        &self.storage
    }

    pub fn buffer(&self) -> &Arc<RwLock<BufferManager>> {
        &self.buffer
    }

    pub fn til(&self) -> Option<&Arc<Mutex<TransactionIntentLog>>> {
        self.til.as_ref()
    }

    /// Resolves an arbitrary page reference through the layered
    /// lookup, releasing any previously held cursor guard first: the
    /// transaction holds at most one such guard at a time.
    pub fn resolve_page(&mut self, reference: &mut PageReference) -> Result<Arc<Page>> {
        let resolution = resolve(
            &self.storage,
            &self.buffer,
            self.til.as_deref(),
            self.snapshot.as_deref(),
            self.revision,
            &mut self.guard,
            reference,
            CacheKind::Page,
        )?;
        Ok(resolution.into_page())
    }

    /// `getValue`/`getRecord` : resolves the leaf reference
    /// for `key`'s page key, then returns the slot's record, combining
    /// on-disk fragments if the lookup came from disk rather than the
    /// swizzle/TIL/snapshot layers.
    pub fn get_record(
        &mut self,
        key: RecordKey,
        index_type: IndexType,
        index_number: u8,
    ) -> Result<Option<Record>> {
        let page_key = key.page_key();
        let cache_key = (index_type, index_number);

        let mut leaf_ref = match self.recent.get(&cache_key) {
            Some((cached_page_key, cached_ref)) if *cached_page_key == page_key => {
                Some(cached_ref.snapshot_copy())
            }
            _ => None,
        };

        if leaf_ref.is_none() {
            let Some(height) = self
                .revision_root
                .index_tree_heights
                .get(&cache_key)
                .copied()
            else {
                return Ok(None);
            };
            let Some(root_ref) = self.revision_root.index_roots.get_mut(&cache_key) else {
                return Ok(None);
            };
            leaf_ref = walk(
                &self.storage,
                &self.buffer,
                self.til.as_deref(),
                self.snapshot.as_deref(),
                self.revision,
                &mut self.guard,
                root_ref,
                height,
                page_key,
            )?;
        }

        let Some(mut leaf_ref) = leaf_ref else {
            return Ok(None);
        };

        let fragments = leaf_ref.page_fragments.clone();
        let resolution = resolve(
            &self.storage,
            &self.buffer,
            self.til.as_deref(),
            self.snapshot.as_deref(),
            self.revision,
            &mut self.guard,
            &mut leaf_ref,
            CacheKind::Record,
        )?;

        self.recent
            .insert(cache_key, (page_key, leaf_ref.snapshot_copy()));

        let record = match resolution {
            Resolved::Authoritative(page) => match &*page.body() {
                PageBody::KeyValueLeaf(leaf) => leaf.get_slot(key).cloned(),
                _ => None,
            },
            Resolved::Physical(first) => {
                let first_leaf = match &*first.body() {
                    PageBody::KeyValueLeaf(leaf) => leaf.clone(),
                    _ => return Err(Error::UnsplittablePage),
                };

                let mut pages = vec![first_leaf];
                if !pages[0].is_full() {
                    let max = self.config.max_number_of_revisions_to_restore;
                    for fragment_key in fragments.iter().take(max.saturating_sub(1)) {
                        let page = resolve_fragment(
                            &self.storage,
                            &self.buffer,
                            self.revision,
                            self.database_id,
                            self.resource_id,
                            fragment_key.0,
                        )?;
                        let leaf = match &*page.body() {
                            PageBody::KeyValueLeaf(leaf) => leaf.clone(),
                            _ => {
                                page.release_guard();
                                return Err(Error::UnsplittablePage);
                            }
                        };
                        page.release_guard();
                        pages.push(leaf);
                    }
                }

                let combined = versioning::combine(
                    self.config.versioning_type,
                    &pages,
                    self.config.max_number_of_revisions_to_restore,
                );
                combined.get_slot(key).cloned()
            }
        };

        Ok(record)
    }

    /// Combines `leaf_ref`'s on-disk fragment chain into one logical
    /// [`crate::page::LeafPage`], the same way [`Self::get_record`]'s
    /// `Resolved::Physical` branch does -- exposed so a write
    /// transaction can materialize the full current content of a leaf
    /// it is about to copy-on-write: the writer's first touch of a
    /// leaf combines exactly as a reader would.
    pub fn combine_leaf_for_write(
        &mut self,
        leaf_ref: &mut PageReference,
    ) -> Result<crate::page::LeafPage> {
        let fragments = leaf_ref.page_fragments.clone();
        let resolution = resolve(
            &self.storage,
            &self.buffer,
            self.til.as_deref(),
            self.snapshot.as_deref(),
            self.revision,
            &mut self.guard,
            leaf_ref,
            CacheKind::Record,
        )?;

        match resolution {
            Resolved::Authoritative(page) => match &*page.body() {
                PageBody::KeyValueLeaf(leaf) => Ok(leaf.clone()),
                _ => Err(Error::UnsplittablePage),
            },
            Resolved::Physical(first) => {
                let first_leaf = match &*first.body() {
                    PageBody::KeyValueLeaf(leaf) => leaf.clone(),
                    _ => return Err(Error::UnsplittablePage),
                };

                let mut pages = vec![first_leaf];
                if !pages[0].is_full() {
                    let max = self.config.max_number_of_revisions_to_restore;
                    for fragment_key in fragments.iter().take(max.saturating_sub(1)) {
                        let page = resolve_fragment(
                            &self.storage,
                            &self.buffer,
                            self.revision,
                            self.database_id,
                            self.resource_id,
                            fragment_key.0,
                        )?;
                        let leaf = match &*page.body() {
                            PageBody::KeyValueLeaf(leaf) => leaf.clone(),
                            _ => {
                                page.release_guard();
                                return Err(Error::UnsplittablePage);
                            }
                        };
                        page.release_guard();
                        pages.push(leaf);
                    }
                }

                Ok(versioning::combine(
                    self.config.versioning_type,
                    &pages,
                    self.config.max_number_of_revisions_to_restore,
                ))
            }
        }
    }

    /// Releases the current cursor guard, if any.
    pub fn close(&mut self) {
        if let Some(page) = self.guard.take() {
            page.release_guard();
        }
    }
}

impl<F: BlockFile> Drop for PageReadTrx<F> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::LeafPage;
    use crate::record::Node;
    use crate::storage::MemoryFile;

    fn fresh_trx() -> PageReadTrx<MemoryFile> {
        let storage = Arc::new(StorageEngine::open(MemoryFile::new()).unwrap());
        let buffer = Arc::new(RwLock::new(BufferManager::new(8)));
        PageReadTrx::new(
            Revision(1),
            DatabaseId(0),
            ResourceId(0),
            storage,
            buffer,
            ResourceConfig::default(),
            RevisionRootPage::bootstrap(Revision(1)),
        )
    }

    #[test]
    fn get_record_returns_none_when_index_has_no_root() {
        let mut trx = fresh_trx();
        let record = trx
            .get_record(RecordKey(1), IndexType::Document, 0)
            .unwrap();
        assert!(record.is_none());
    }

    #[test]
    fn get_record_resolves_through_til_for_read_your_own_writes() {
        use crate::til::{PageContainer, TransactionIntentLog};

        let mut trx = fresh_trx();
        let mut leaf = LeafPage::new(false);
        leaf.set_record(Record::Present(Node::new(3, b"hello".to_vec())));
        let page = Arc::new(Page::new(
            PageId(5),
            Revision(1),
            PageBody::KeyValueLeaf(leaf),
        ));

        let mut leaf_ref = PageReference::new(PageId(5), DatabaseId(0), ResourceId(0));
        let mut til = TransactionIntentLog::new();
        til.put(&mut leaf_ref, PageContainer::new_same(page));

        trx.revision_root_mut()
            .index_roots
            .insert((IndexType::Document, 0), leaf_ref);
        trx.revision_root_mut()
            .index_tree_heights
            .insert((IndexType::Document, 0), 0);

        let til = Arc::new(Mutex::new(til));
        let mut trx = trx;
        trx.til = Some(til);

        let record = trx
            .get_record(RecordKey(3), IndexType::Document, 0)
            .unwrap();
        assert_eq!(
            record,
            Some(Record::Present(Node::new(3, b"hello".to_vec())))
        );
    }
}
