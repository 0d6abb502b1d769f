//! Page write transaction.
//!
//! A single-writer handle bound to the next revision. It embeds a
//! [`PageReadTrx`] constructed over its own [`TransactionIntentLog`],
//! so every write is visible to the writer's own reads immediately,
//! before the transaction ever commits. [`ReaderSource`] bridges that embedded reader into
//! [`trie::IndirectPageSource`] / the HOT trie's page source, letting
//! both tries COW through exactly the same layered lookup a plain
//! reader uses.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::buffer::BufferManager;
use crate::config::ResourceConfig;
use crate::hot::HotTrieWriter;
use crate::page::{
    DatabaseId, LeafPage, Page, PageBody, PageId, PageReference, ResourceId, Revision,
    RevisionRootPage, UberPage,
};
use crate::read_txn::PageReadTrx;
use crate::record::{IndexType, Node, Record, RecordKey};
use crate::snapshot::{commit_sync, CommitSnapshot, CommitWorker};
use crate::storage::{BlockFile, StorageEngine};
use crate::til::{PageContainer, TransactionIntentLog};
use crate::trie::{IndirectPageSource, TrieWriter};
use crate::{Error, Result};

/// Leaf capacity used by [`PageWriteTrx::put_indexed_entry`] callers
/// that have no reason to pick their own.
pub const DEFAULT_HOT_LEAF_CAPACITY: usize = 32;

/// Adapts the writer's embedded reader to the tries' page-source
/// collaborator trait, so `trie`/`hot` need not know about
/// `read_txn` at all.
struct ReaderSource<'a, F: BlockFile> {
    reader: &'a mut PageReadTrx<F>,
}

impl<F: BlockFile> IndirectPageSource for ReaderSource<'_, F> {
    fn load(&mut self, reference: &mut PageReference) -> Result<Arc<Page>> {
        self.reader.resolve_page(reference)
    }
}

pub struct PageWriteTrx<F: BlockFile> {
    reader: PageReadTrx<F>,
    til: Arc<Mutex<TransactionIntentLog>>,
    worker: Option<Arc<CommitWorker<F>>>,
    commit_lock: Arc<Mutex<()>>,
    database_id: DatabaseId,
    resource_id: ResourceId,
    new_revision: Revision,
    next_page_id: Arc<AtomicU64>,
    uber_page: UberPage,
    closed: bool,
}

impl<F: BlockFile + 'static> PageWriteTrx<F> {
    /// Opens a writer branching off `base_revision_root` (the most
    /// recently committed revision's root), targeting
    /// `base_revision_root.revision.next()`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Arc<StorageEngine<F>>,
        buffer: Arc<RwLock<BufferManager>>,
        database_id: DatabaseId,
        resource_id: ResourceId,
        config: ResourceConfig,
        base_revision_root: RevisionRootPage,
        uber_page: UberPage,
        next_page_id: Arc<AtomicU64>,
        commit_lock: Arc<Mutex<()>>,
        worker: Option<Arc<CommitWorker<F>>>,
    ) -> Self {
        let new_revision = base_revision_root.revision.next();
        let mut revision_root = base_revision_root;
        revision_root.revision = new_revision;

        let til = Arc::new(Mutex::new(TransactionIntentLog::new()));
        let reader = PageReadTrx::new(
            new_revision,
            database_id,
            resource_id,
            storage,
            buffer,
            config,
            revision_root,
        )
        .with_til(Arc::clone(&til));

        Self {
            reader,
            til,
            worker,
            commit_lock,
            database_id,
            resource_id,
            new_revision,
            next_page_id,
            uber_page,
            closed: false,
        }
    }

    pub fn revision(&self) -> Revision {
        self.new_revision
    }

    pub fn revision_root(&self) -> &RevisionRootPage {
        self.reader.revision_root()
    }

    fn id_gen(&self) -> impl FnMut() -> PageId {
        let next = Arc::clone(&self.next_page_id);
        move || PageId(next.fetch_add(1, Ordering::Relaxed))
    }

    /// Assigns the next record key for a (index_type, index_number)
    /// tree, backed by `RevisionRootPage`'s per-(index_type, index_number) counter.
    pub fn next_record_key(&mut self, index_type: IndexType, index_number: u8) -> RecordKey {
        RecordKey(
            self.reader
                .revision_root_mut()
                .next_node_key(index_type, index_number),
        )
    }

    /// Returns the `modified` leaf page for `leaf_ref`, COW-propagating
    /// a combined copy of its on-disk fragment chain into the TIL on
    /// first touch this generation.
    fn cow_leaf(&mut self, leaf_ref: &mut PageReference) -> Result<Arc<Page>> {
        if let Some(container) = self.til.lock().unwrap().get(leaf_ref) {
            return Ok(Arc::clone(container.modified()));
        }

        let container = if leaf_ref.key.is_none() {
            let leaf = LeafPage::new(self.reader.config().are_dewey_ids_stored);
            let page = Arc::new(Page::new(
                leaf_ref.page_id(),
                self.new_revision,
                PageBody::KeyValueLeaf(leaf),
            ));
            PageContainer::new_same(page)
        } else {
            let combined = self.reader.combine_leaf_for_write(leaf_ref)?;
            let complete = Arc::new(Page::new(
                leaf_ref.page_id(),
                self.new_revision,
                PageBody::KeyValueLeaf(combined.clone()),
            ));
            let modified = Arc::new(Page::new(
                leaf_ref.page_id(),
                self.new_revision,
                PageBody::KeyValueLeaf(combined),
            ));
            PageContainer::new_pair(complete, modified)
        };

        leaf_ref.push_fragment();
        let modified = Arc::clone(container.modified());
        self.til.lock().unwrap().put(leaf_ref, container);
        Ok(modified)
    }

    /// Walks (COW-propagating) the document trie to the leaf holding
    /// `page_key`, returning that leaf's `modified` page ready for the
    /// caller to mutate directly. Shared by [`Self::create_record`],
    /// [`Self::remove_record`], and [`Self::prepare_record_page`]
    /// (`prepareRecordPage`).
    fn stage_leaf(
        &mut self,
        page_key: u64,
        index_type: IndexType,
        index_number: u8,
    ) -> Result<Arc<Page>> {
        if self.closed {
            return Err(Error::AlreadyClosed);
        }
        let key_pair = (index_type, index_number);
        let database_id = self.database_id;
        let resource_id = self.resource_id;
        let new_revision = self.new_revision;
        let mut id_gen = self.id_gen();

        let mut root_ref = self
            .reader
            .revision_root()
            .index_roots
            .get(&key_pair)
            .map(|r| r.snapshot_copy())
            .unwrap_or_else(|| PageReference::new(id_gen(), database_id, resource_id));
        let mut height = self
            .reader
            .revision_root()
            .index_tree_heights
            .get(&key_pair)
            .copied()
            .unwrap_or(0);

        let til = Arc::clone(&self.til);
        let mut slot = {
            let mut til_guard = til.lock().unwrap();
            let mut source = ReaderSource {
                reader: &mut self.reader,
            };
            TrieWriter::prepare_leaf_reference(
                &mut *til_guard,
                &mut source,
                &mut id_gen,
                &mut root_ref,
                &mut height,
                database_id,
                resource_id,
                new_revision,
                page_key,
            )?
        };

        let leaf_page = self.cow_leaf(&mut slot.reference)?;
        slot.write_back();

        let root = self.reader.revision_root_mut();
        root.index_roots.insert(key_pair, root_ref);
        root.index_tree_heights.insert(key_pair, height);

        Ok(leaf_page)
    }

    /// `createRecord` : stages the owning leaf, then writes
    /// `node` into its slot.
    pub fn create_record(
        &mut self,
        node: Node,
        index_type: IndexType,
        index_number: u8,
    ) -> Result<()> {
        let page_key = node.key.page_key();
        let leaf_page = self.stage_leaf(page_key, index_type, index_number)?;
        let mut body = leaf_page.body();
        if let PageBody::KeyValueLeaf(leaf) = &mut *body {
            leaf.set_record(Record::Present(node));
        }
        Ok(())
    }

    /// `removeRecord` : stages the owning leaf, then marks
    /// the slot a tombstone rather than deleting it outright, so older
    /// fragment overlays still see the deletion (edge case).
    pub fn remove_record(
        &mut self,
        key: RecordKey,
        index_type: IndexType,
        index_number: u8,
    ) -> Result<()> {
        let page_key = key.page_key();
        let leaf_page = self.stage_leaf(page_key, index_type, index_number)?;
        let mut body = leaf_page.body();
        if let PageBody::KeyValueLeaf(leaf) = &mut *body {
            leaf.remove_slot(key);
        }
        Ok(())
    }

    /// `prepareRecordPage` : exposes the staged leaf
    /// directly for callers that need to apply more than one slot
    /// mutation without re-walking the trie per slot.
    pub fn prepare_record_page(
        &mut self,
        page_key: u64,
        index_type: IndexType,
        index_number: u8,
    ) -> Result<Arc<Page>> {
        self.stage_leaf(page_key, index_type, index_number)
    }

    /// `prepareRecordForModification` : returns the
    /// record's current (read-your-own-write) value while also staging
    /// its leaf for an upcoming `create_record`/`remove_record`,
    /// defaulting to an empty placeholder when the key is new.
    pub fn prepare_record_for_modification(
        &mut self,
        key: RecordKey,
        index_type: IndexType,
        index_number: u8,
    ) -> Result<Record> {
        let existing = self.reader.get_record(key, index_type, index_number)?;
        self.stage_leaf(key.page_key(), index_type, index_number)?;
        Ok(existing.unwrap_or_else(|| Record::Present(Node::new(key.0, Vec::new()))))
    }

    /// Inserts `(key, value)` into a secondary HOT-keyed index tree
    /// (PATH/NAME/CAS), COW-propagating and splitting exactly as
    /// [`HotTrieWriter::insert`] does.
    pub fn put_indexed_entry(
        &mut self,
        index_type: IndexType,
        index_number: u8,
        leaf_capacity: usize,
        key: &[u8],
        value: Vec<u8>,
    ) -> Result<()> {
        if self.closed {
            return Err(Error::AlreadyClosed);
        }
        let key_pair = (index_type, index_number);
        let database_id = self.database_id;
        let resource_id = self.resource_id;
        let new_revision = self.new_revision;
        let mut id_gen = self.id_gen();

        let mut root_ref = self
            .reader
            .revision_root()
            .index_roots
            .get(&key_pair)
            .map(|r| r.snapshot_copy())
            .unwrap_or_else(|| PageReference::new(id_gen(), database_id, resource_id));

        let til = Arc::clone(&self.til);
        {
            let mut til_guard = til.lock().unwrap();
            let mut source = ReaderSource {
                reader: &mut self.reader,
            };
            HotTrieWriter::insert(
                &mut *til_guard,
                &mut source,
                &mut id_gen,
                &mut root_ref,
                database_id,
                resource_id,
                new_revision,
                leaf_capacity,
                key,
                value,
            )?;
        }

        self.reader
            .revision_root_mut()
            .index_roots
            .insert(key_pair, root_ref);
        Ok(())
    }

    /// Point lookup into a secondary HOT-keyed index tree, seeing this
    /// transaction's own not-yet-committed writes.
    pub fn get_indexed_entry(
        &mut self,
        index_type: IndexType,
        index_number: u8,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        let key_pair = (index_type, index_number);
        let Some(root_ref) = self
            .reader
            .revision_root()
            .index_roots
            .get(&key_pair)
            .map(|r| r.snapshot_copy())
        else {
            return Ok(None);
        };
        let mut source = ReaderSource {
            reader: &mut self.reader,
        };
        HotTrieWriter::lookup(&mut source, &root_ref, key)
    }

    /// Rotates the TIL, deep-copies the revision root and uber page
    /// into a frozen [`CommitSnapshot`], and either hands it to the
    /// background [`CommitWorker`] (if one was configured) or writes
    /// it out on the calling thread.
    /// Returns the revision just committed; a no-op commit (nothing
    /// was ever staged) still succeeds and returns the current
    /// revision without writing anything.
    pub fn commit(&mut self, message: Option<String>) -> Result<Revision> {
        if self.closed {
            return Err(Error::AlreadyClosed);
        }
        let _commit_guard = self.commit_lock.lock().unwrap();

        if self.til.lock().unwrap().is_empty() {
            self.closed = true;
            return Ok(self.new_revision);
        }

        self.reader.storage().touch_sentinel()?;

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let mut revision_root = self.reader.revision_root().deep_copy();
        revision_root.message = message.clone();
        revision_root.timestamp = timestamp;

        let mut revision_root_ref = PageReference::new(
            PageId(self.new_revision.0),
            self.database_id,
            self.resource_id,
        );
        let revision_root_page = Arc::new(Page::new(
            revision_root_ref.page_id(),
            self.new_revision,
            PageBody::RevisionRoot(revision_root.clone()),
        ));

        let rotation = {
            let mut til = self.til.lock().unwrap();
            til.put(
                &mut revision_root_ref,
                PageContainer::new_same(revision_root_page),
            );
            til.rotate()
        };

        let mut uber_page = self.uber_page.deep_copy();
        uber_page.latest_revision = self.new_revision;

        let snapshot = Arc::new(CommitSnapshot::new(
            rotation,
            revision_root,
            uber_page,
            message,
            timestamp,
            self.reader.config().clone(),
        ));

        match &self.worker {
            Some(worker) => worker.submit(Arc::clone(&snapshot), revision_root_ref.snapshot_copy()),
            None => commit_sync(
                self.reader.storage(),
                &snapshot,
                revision_root_ref.snapshot_copy(),
            ),
        }

        self.reader.buffer().write().unwrap().evict_unreachable_revisions();

        self.closed = true;
        Ok(self.new_revision)
    }

    /// Discards every staged page without writing anything.
    pub fn rollback(&mut self) {
        if self.closed {
            return;
        }
        self.til.lock().unwrap().clear();
        self.closed = true;
    }

    /// Rewrites the uber page to stop advertising revisions beyond
    /// `revision`.
    pub fn truncate_to(&mut self, revision: Revision) -> Result<()> {
        let uber = self
            .reader
            .storage()
            .truncate_to(self.reader.config(), revision)?;
        self.uber_page = uber;
        Ok(())
    }
}

impl<F: BlockFile> Drop for PageWriteTrx<F> {
    fn drop(&mut self) {
        if !self.closed {
            self.til.lock().unwrap().clear();
        }
    }
}
