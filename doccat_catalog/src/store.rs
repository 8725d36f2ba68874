//! Ownership of the latest published catalog and the serialized writer that replaces it.
use std::{
    any::Any,
    collections::VecDeque,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use arc_swap::ArcSwap;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::debug;

use crate::{
    Result,
    catalog::{CatalogArgs, CollectionCatalog},
    lock::Locker,
    txn::OperationContext,
};

/// A mutation of a writable catalog instance
pub type CatalogWriteFn = Box<dyn FnOnce(&mut CollectionCatalog) -> Result<()> + Send>;

enum JobOutcome {
    Done(Result<()>),
    Panicked(Box<dyn Any + Send>),
}

impl JobOutcome {
    fn run(job: CatalogWriteFn, catalog: &mut CollectionCatalog) -> Self {
        match panic::catch_unwind(AssertUnwindSafe(|| job(catalog))) {
            Ok(res) => Self::Done(res),
            Err(payload) => Self::Panicked(payload),
        }
    }

    /// Return the job's result, re-raising its panic on the calling thread
    fn into_result(self) -> Result<()> {
        match self {
            Self::Done(res) => res,
            Self::Panicked(payload) => panic::resume_unwind(payload),
        }
    }
}

/// Lets a submitter wait for a job run by another thread.
#[derive(Default)]
struct Completion {
    outcome: Mutex<Option<JobOutcome>>,
    cv: Condvar,
}

impl Completion {
    fn complete(&self, outcome: JobOutcome) {
        *self.outcome.lock() = Some(outcome);
        self.cv.notify_one();
    }

    fn wait(&self) -> JobOutcome {
        let mut outcome = self.outcome.lock();
        loop {
            if let Some(outcome) = outcome.take() {
                return outcome;
            }
            self.cv.wait(&mut outcome);
        }
    }
}

struct JobEntry {
    job: CatalogWriteFn,
    /// `None` for the job of the thread acting as worker
    completion: Option<Arc<Completion>>,
}

#[derive(Default)]
struct WriteQueue {
    jobs: VecDeque<JobEntry>,
    worker_exists: bool,
}

/// Holds the latest published [`CollectionCatalog`] and serializes all writes to it.
///
/// Readers load the latest snapshot without blocking. Writers submit jobs; one of them becomes
/// the worker, clones the latest snapshot once, applies every job queued until the queue runs
/// dry and then publishes the clone, so concurrent writers share a single clone.
///
/// When both are taken, `batched` is locked before `queue`.
pub struct CatalogStore {
    latest: ArcSwap<CollectionCatalog>,
    queue: Mutex<WriteQueue>,
    /// Signalled when the worker role is released
    worker_idle: Condvar,
    batched: Mutex<Option<Arc<CollectionCatalog>>>,
    clones: AtomicU64,
}

impl std::fmt::Debug for CatalogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogStore")
            .field("queued_jobs", &self.queued_jobs())
            .field("batched_write_active", &self.batched.lock().is_some())
            .field("clones_performed", &self.clones_performed())
            .finish_non_exhaustive()
    }
}

impl Default for CatalogStore {
    fn default() -> Self {
        Self::new(CatalogArgs::default())
    }
}

impl CatalogStore {
    /// Create a store holding an empty catalog
    pub fn new(args: CatalogArgs) -> Self {
        Self {
            latest: ArcSwap::from_pointee(CollectionCatalog::new(args)),
            queue: Default::default(),
            worker_idle: Condvar::new(),
            batched: Default::default(),
            clones: AtomicU64::new(0),
        }
    }

    /// The most recently published catalog
    pub fn latest(&self) -> Arc<CollectionCatalog> {
        self.latest.load_full()
    }

    /// The instance of the active batched write session, if there is one
    pub fn batched_instance(&self) -> Option<Arc<CollectionCatalog>> {
        self.batched.lock().as_ref().map(Arc::clone)
    }

    /// Number of whole-catalog clones made by writers so far
    pub fn clones_performed(&self) -> u64 {
        self.clones.load(Ordering::Relaxed)
    }

    /// Number of jobs waiting for a worker to pick them up
    pub fn queued_jobs(&self) -> usize {
        self.queue.lock().jobs.len()
    }

    fn clone_latest(&self) -> (Arc<CollectionCatalog>, CollectionCatalog) {
        let base = self.latest.load_full();
        let clone = CollectionCatalog::clone(&base);
        self.clones.fetch_add(1, Ordering::Relaxed);
        (base, clone)
    }

    /// Apply `job` to a fresh copy of the latest catalog and publish the result.
    ///
    /// Blocks until the job has been applied and published, either by this thread or by a
    /// concurrent writer that picked it up. The job's error, or its panic, is returned on this
    /// thread.
    ///
    /// # Panics
    ///
    /// If a batched write session is active; its holder must go through [`Self::write_for`].
    pub fn write(&self, job: CatalogWriteFn) -> Result<()> {
        self.write_queued(self.batched.lock(), job)
    }

    /// Queue `job`, given the `batched` guard under which no session was found.
    fn write_queued(
        &self,
        batched: MutexGuard<'_, Option<Arc<CollectionCatalog>>>,
        job: CatalogWriteFn,
    ) -> Result<()> {
        assert!(
            batched.is_none(),
            "catalog written outside of the active batched write session"
        );

        let mut pending = {
            let mut queue = self.queue.lock();
            // a session can only start once the job below has been published
            drop(batched);
            if queue.worker_exists {
                let completion = Arc::new(Completion::default());
                queue.jobs.push_back(JobEntry {
                    job,
                    completion: Some(Arc::clone(&completion)),
                });
                drop(queue);
                return completion.wait().into_result();
            }
            queue.worker_exists = true;
            queue.jobs.push_back(JobEntry {
                job,
                completion: None,
            });
            std::mem::take(&mut queue.jobs)
        };

        let (_base, mut clone) = self.clone_latest();
        let mut completed = vec![];
        let mut my_outcome = None;
        loop {
            for entry in pending.drain(..) {
                let outcome = JobOutcome::run(entry.job, &mut clone);
                match entry.completion {
                    Some(completion) => completed.push((completion, outcome)),
                    None => my_outcome = Some(outcome),
                }
            }

            let mut queue = self.queue.lock();
            if queue.jobs.is_empty() {
                self.latest.store(Arc::new(clone));
                queue.worker_exists = false;
                self.worker_idle.notify_all();
                break;
            }
            std::mem::swap(&mut pending, &mut queue.jobs);
        }

        debug!(
            jobs = completed.len() + 1,
            "finished writing to the collection catalog"
        );
        for (completion, outcome) in completed {
            completion.complete(outcome);
        }
        match my_outcome {
            Some(outcome) => outcome.into_result(),
            None => Ok(()),
        }
    }

    /// Like [`Self::write`], but applies the job directly to the batched instance when `locker`
    /// holds the active batched write session.
    ///
    /// The instance is modified in place unless a snapshot handed out by
    /// [`OperationContext::catalog`] is still alive, in which case it is copied first so the
    /// snapshot stays unchanged. Such copies count towards [`Self::clones_performed`].
    pub fn write_for(&self, locker: &dyn Locker, job: CatalogWriteFn) -> Result<()> {
        let mut batched = self.batched.lock();
        let Some(instance) = batched.as_mut() else {
            return self.write_queued(batched, job);
        };
        assert!(
            locker.is_w(),
            "only the holder of the global exclusive lock may write during a batched write"
        );
        if Arc::get_mut(instance).is_none() {
            self.clones.fetch_add(1, Ordering::Relaxed);
            debug!("copying the batched catalog instance, a snapshot of it is still in use");
        }
        JobOutcome::run(job, Arc::make_mut(instance)).into_result()
    }
}

/// A batched write session.
///
/// While it is alive every write of the exclusive lock holder is applied to one cloned catalog
/// without going through the write queue; dropping it publishes that clone. Writes from anyone
/// else are refused for the duration.
#[derive(Debug)]
pub struct BatchedCatalogWriter {
    store: Arc<CatalogStore>,
    base: Arc<CollectionCatalog>,
}

impl BatchedCatalogWriter {
    pub fn new(op_ctx: &OperationContext) -> Self {
        assert!(
            op_ctx.locker().is_w(),
            "a batched catalog write requires the global exclusive lock"
        );
        let store = Arc::clone(op_ctx.store());
        let mut batched = store.batched.lock();
        assert!(batched.is_none(), "a batched catalog write is already active");
        // jobs already queued must be published before the session takes its base
        let mut queue = store.queue.lock();
        while queue.worker_exists {
            store.worker_idle.wait(&mut queue);
        }
        drop(queue);
        let (base, clone) = store.clone_latest();
        *batched = Some(Arc::new(clone));
        drop(batched);
        debug!("started batched catalog write");

        Self { store, base }
    }
}

impl Drop for BatchedCatalogWriter {
    fn drop(&mut self) {
        let Some(instance) = self.store.batched.lock().take() else {
            return;
        };
        let previous = self.store.latest.compare_and_swap(&self.base, instance);
        if !std::thread::panicking() {
            assert!(
                Arc::ptr_eq(&previous, &self.base),
                "catalog was published by another writer during a batched write"
            );
        }
        debug!("published batched catalog write");
    }
}
