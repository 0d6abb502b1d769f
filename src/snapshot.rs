//! Commit snapshot & background commit worker.
//!
//! The worker is a plain OS thread handed off snapshots through a
//! `Mutex`/`Condvar` rather than an async runtime: this core has
//! exactly one background task, so a condvar-guarded mailbox is the
//! idiomatic match (see DESIGN.md).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::config::ResourceConfig;
use crate::page::{Generation, LogKey, PageBody, PageReference, RevisionRootPage, UberPage};
use crate::storage::{BlockFile, StorageEngine};
use crate::til::{PageContainer, RotationResult};

/// A frozen view of one generation's TIL, owned exclusively by the
/// background worker until `commit_complete` is published.
pub struct CommitSnapshot {
    entries: Vec<PageContainer>,
    ref_to_container: HashMap<u64, PageContainer>,
    pub revision_root: RevisionRootPage,
    pub uber_page: UberPage,
    pub message: Option<String>,
    pub timestamp: u64,
    pub config: ResourceConfig,
    log_key_to_disk_offset: Vec<AtomicI64>,
    commit_complete: AtomicBool,
    pub generation: Generation,
    frozen_log_keys: HashMap<u64, LogKey>,
    completion: Mutex<()>,
    completion_cvar: Condvar,
}

impl CommitSnapshot {
    pub fn new(
        rotation: RotationResult,
        revision_root: RevisionRootPage,
        uber_page: UberPage,
        message: Option<String>,
        timestamp: u64,
        config: ResourceConfig,
    ) -> Self {
        let log_key_to_disk_offset = (0..rotation.size).map(|_| AtomicI64::new(-1)).collect();
        Self {
            entries: rotation.entries,
            ref_to_container: rotation.ref_to_container,
            revision_root,
            uber_page,
            message,
            timestamp,
            config,
            log_key_to_disk_offset,
            commit_complete: AtomicBool::new(false),
            generation: rotation.generation,
            frozen_log_keys: rotation.frozen_log_keys,
            completion: Mutex::new(()),
            completion_cvar: Condvar::new(),
        }
    }

    /// Writer-side lookup during an in-flight async commit: identity
    /// first, then the frozen entries array guarded by a generation check so a promoted
    /// reference (re-added to the new TIL, now with a higher
    /// generation) never resolves here.
    pub fn lookup(&self, reference: &PageReference) -> Option<&PageContainer> {
        if let Some(container) = self.ref_to_container.get(&reference.ref_id()) {
            return Some(container);
        }
        let log_key = reference.log_key?;
        if reference.generation.0 > self.generation.0 {
            return None;
        }
        self.entries.get(log_key.0 as usize)
    }

    fn record_disk_offset(&self, log_key: LogKey, offset: u64) {
        self.log_key_to_disk_offset[log_key.0 as usize].store(offset as i64, Ordering::Relaxed);
    }

    pub fn is_commit_complete(&self) -> bool {
        self.commit_complete.load(Ordering::Acquire)
    }

    fn mark_commit_complete(&self) {
        let _guard = self.completion.lock().unwrap();
        self.commit_complete.store(true, Ordering::Release);
        self.completion_cvar.notify_all();
    }

    /// Blocks the calling thread until this snapshot's worker has
    /// finished, enforcing the bounded-interleaving rule: a second
    /// commit may not be handed to the worker while this one is still
    /// in flight.
    fn wait_until_complete(&self) {
        let mut guard = self.completion.lock().unwrap();
        while !self.is_commit_complete() {
            guard = self.completion_cvar.wait(guard).unwrap();
        }
    }

    /// Backfills `reference.key` from the recorded disk offset if the
    /// worker has finished and the reference was never promoted.
    pub fn propagate_into(&self, reference: &mut PageReference) {
        if !self.is_commit_complete() || reference.key.is_some() {
            return;
        }
        let Some(&frozen) = self.frozen_log_keys.get(&reference.ref_id()) else {
            return;
        };
        if reference.generation.0 > self.generation.0 {
            return; // promoted: the active TIL now owns this reference
        }
        let offset = self.log_key_to_disk_offset[frozen.0 as usize].load(Ordering::Relaxed);
        if offset >= 0 {
            reference.set_disk_key(crate::page::DiskKey(offset as u64));
        }
    }
}

enum Job {
    Commit(Arc<CommitSnapshot>, PageReference),
    Shutdown,
}

/// A single dedicated background worker handling one pending snapshot
/// at a time; a second commit queues behind it rather than running
/// concurrently.
pub struct CommitWorker<F: BlockFile> {
    mailbox: Arc<(Mutex<Option<Job>>, Condvar)>,
    handle: Option<JoinHandle<()>>,
    storage: Arc<StorageEngine<F>>,
    /// The most recently submitted snapshot, kept around only so the
    /// next `submit` can wait on it before replacing the mailbox's
    /// single job slot.
    pending: Mutex<Option<Arc<CommitSnapshot>>>,
}

impl<F: BlockFile + Send + Sync + 'static> CommitWorker<F> {
    pub fn spawn(storage: Arc<StorageEngine<F>>) -> Self {
        let mailbox = Arc::new((Mutex::new(None::<Job>), Condvar::new()));
        let worker_mailbox = Arc::clone(&mailbox);
        let worker_storage = Arc::clone(&storage);

        let handle = std::thread::spawn(move || {
            let (lock, cvar) = &*worker_mailbox;
            loop {
                let job = {
                    let mut guard = lock.lock().unwrap();
                    while guard.is_none() {
                        guard = cvar.wait(guard).unwrap();
                    }
                    guard.take().unwrap()
                };
                match job {
                    Job::Shutdown => break,
                    Job::Commit(snapshot, uber_ref) => {
                        run_commit(&worker_storage, &snapshot, uber_ref);
                    }
                }
            }
        });

        Self {
            mailbox,
            handle: Some(handle),
            storage,
            pending: Mutex::new(None),
        }
    }

    /// Hands a snapshot to the worker, along with the frozen uber
    /// reference to start traversal from (callers pass
    /// `uber_ref.snapshot_copy()`, a faithful replica sharing the
    /// original's identity, not the COW-style [`Clone`]). The caller
    /// must already hold the per-resource commit lock. Bounded
    /// interleaving: if a prior snapshot is still in flight, this
    /// blocks until it finishes before occupying the mailbox's single
    /// job slot, so a second submit can never silently overwrite a
    /// job the worker has not yet dequeued.
    pub fn submit(&self, snapshot: Arc<CommitSnapshot>, uber_ref: PageReference) {
        let prior = self.pending.lock().unwrap().replace(Arc::clone(&snapshot));
        if let Some(prior) = prior {
            prior.wait_until_complete();
        }

        let (lock, cvar) = &*self.mailbox;
        *lock.lock().unwrap() = Some(Job::Commit(snapshot, uber_ref));
        cvar.notify_one();
    }

    pub fn storage(&self) -> &Arc<StorageEngine<F>> {
        &self.storage
    }
}

impl<F: BlockFile> Drop for CommitWorker<F> {
    fn drop(&mut self) {
        let (lock, cvar) = &*self.mailbox;
        *lock.lock().unwrap() = Some(Job::Shutdown);
        cvar.notify_one();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Runs the same depth-first write [`CommitWorker`] performs, on the
/// calling thread. A write transaction without a background worker
/// (or one that wants a synchronous commit for a final `force_all`
/// guarantee before returning) calls this directly instead of
/// `CommitWorker::submit`.
pub fn commit_sync<F: BlockFile>(
    storage: &StorageEngine<F>,
    snapshot: &CommitSnapshot,
    uber_ref: PageReference,
) {
    run_commit(storage, snapshot, uber_ref);
}

/// Depth-first write of the snapshot's page graph, followed by the
/// atomic uber-page rewrite that publishes the new revision.
fn run_commit<F: BlockFile>(
    storage: &StorageEngine<F>,
    snapshot: &CommitSnapshot,
    mut uber_ref: PageReference,
) {
    fn visit<F: BlockFile>(
        storage: &StorageEngine<F>,
        snapshot: &CommitSnapshot,
        reference: &mut PageReference,
    ) {
        let Some(container) = snapshot.lookup(reference) else {
            return; // already on disk, or never modified.
        };
        let page = Arc::clone(container.modified());

        match &mut *page.body() {
            PageBody::Indirect(indirect) => {
                for child in indirect.children.iter_mut().flatten() {
                    visit(storage, snapshot, child);
                }
            }
            PageBody::RevisionRoot(root) => {
                for child in root.index_roots.values_mut() {
                    visit(storage, snapshot, child);
                }
            }
            PageBody::Hot(crate::hot::HotNode::Indirect(indirect)) => {
                for child in indirect.children.iter_mut() {
                    visit(storage, snapshot, &mut child.reference);
                }
            }
            _ => {}
        }

        if let Ok(offset) = storage.write(reference, page.as_ref()) {
            if let Some(log_key) = reference.log_key {
                snapshot.record_disk_offset(log_key, offset.0);
            }
        }
        page.close();
    }

    visit(storage, snapshot, &mut uber_ref);
    let _ = storage.force_all();

    let mut uber_page = snapshot.uber_page.clone();
    uber_page.revision_root_ref = Some(uber_ref.snapshot_copy());
    let _ = storage.write_uber_page_reference(&uber_page);
    let _ = storage.force_all();
    let _ = storage.clear_sentinel();

    snapshot.mark_commit_complete();
}
