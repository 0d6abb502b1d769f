//! Crash/recovery: a commit that touches the sentinel and writes
//! pages but never reaches the uber-page rewrite leaves the sentinel
//! present on reopen and the uber page still pointing at the prior
//! revision.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, Once, RwLock};

use tempfile::tempdir;

use treedb::buffer::BufferManager;
use treedb::config::ResourceConfig;
use treedb::page::{
    DatabaseId, LeafPage, Page, PageBody, PageId, PageReference, ResourceId, Revision,
    RevisionRootPage, UberPage,
};
use treedb::read_txn::PageReadTrx;
use treedb::record::{IndexType, Node, Record, RecordKey};
use treedb::storage::{StdFile, StorageEngine};
use treedb::write_txn::PageWriteTrx;

static LOG_INIT: Once = Once::new();

/// Initializes `env_logger` once per test binary so `RUST_LOG=debug
/// cargo test -- --nocapture` surfaces this crate's `log` output
/// while recovering from a simulated crash.
fn init_log() {
    LOG_INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

fn open_std_storage(db_path: &Path, sentinel_path: &Path) -> StorageEngine<StdFile> {
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(db_path)
        .unwrap();
    StorageEngine::open(StdFile::new(file, sentinel_path.to_path_buf())).unwrap()
}

#[test]
fn crash_before_uber_write_leaves_sentinel_present_and_prior_revision_intact() {
    init_log();
    let dir = tempdir().unwrap();
    let db_path: PathBuf = dir.path().join("resource.db");
    let sentinel_path: PathBuf = dir.path().join("resource.db.commit");

    let storage = Arc::new(open_std_storage(&db_path, &sentinel_path));
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
        Arc::clone(&next_id),
        Arc::clone(&commit_lock),
        None,
    );
    writer
        .create_record(Node::new(1, b"before-crash".to_vec()), IndexType::Document, 0)
        .unwrap();
    writer.commit(None).unwrap();
    drop(writer);

    assert!(!storage.has_sentinel().unwrap());
    let uber_after_first = storage.read_uber_page_reference().unwrap().unwrap();
    assert_eq!(uber_after_first.latest_revision, Revision(1));

    // Simulate a crash between the page writes and the uber-page
    // rewrite: touch the sentinel and write a page directly, but
    // never reach write_uber_page_reference/clear_sentinel.
    storage.touch_sentinel().unwrap();
    let mut crashed_ref = PageReference::new(PageId(999), DatabaseId(0), ResourceId(0));
    let crashed_page = Page::new(
        PageId(999),
        Revision(2),
        PageBody::KeyValueLeaf(LeafPage::new(false)),
    );
    storage.write(&mut crashed_ref, &crashed_page).unwrap();
    drop(storage);

    // Reopen against the same on-disk files, simulating a fresh
    // process picking the resource back up.
    let reopened = Arc::new(open_std_storage(&db_path, &sentinel_path));

    assert!(
        reopened.has_sentinel().unwrap(),
        "sentinel must survive the crash"
    );
    let uber = reopened.read_uber_page_reference().unwrap().unwrap();
    assert_eq!(
        uber.latest_revision,
        Revision(1),
        "uber page still references the last fully-written commit"
    );

    let root_ref = uber.revision_root_ref.as_ref().unwrap();
    let root_page = reopened.read(root_ref, uber.latest_revision).unwrap();
    let PageBody::RevisionRoot(revision_root) = &*root_page.body() else {
        panic!("uber page must point at a revision root");
    };
    let revision_root = revision_root.clone();

    let mut reader = PageReadTrx::new(
        Revision(1),
        DatabaseId(0),
        ResourceId(0),
        reopened,
        buffer,
        ResourceConfig::default(),
        revision_root,
    );
    let record = reader
        .get_record(RecordKey(1), IndexType::Document, 0)
        .unwrap();
    assert_eq!(
        record,
        Some(Record::Present(Node::new(1, b"before-crash".to_vec())))
    );
}

#[test]
fn ordinary_commit_clears_the_sentinel() {
    init_log();
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("resource.db");
    let sentinel_path = dir.path().join("resource.db.commit");

    let storage = Arc::new(open_std_storage(&db_path, &sentinel_path));
    let buffer = Arc::new(RwLock::new(BufferManager::new(8)));

    let mut writer = PageWriteTrx::new(
        Arc::clone(&storage),
        buffer,
        DatabaseId(0),
        ResourceId(0),
        ResourceConfig::default(),
        RevisionRootPage::bootstrap(Revision(0)),
        UberPage::bootstrap(),
        Arc::new(AtomicU64::new(1)),
        Arc::new(Mutex::new(())),
        None,
    );
    writer
        .create_record(Node::new(1, b"a".to_vec()), IndexType::Document, 0)
        .unwrap();
    writer.commit(None).unwrap();

    assert!(!storage.has_sentinel().unwrap());
}
