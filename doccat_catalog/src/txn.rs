//! Per-operation state: the transaction's staging areas and its commit hooks.
use std::sync::Arc;

use doccat_id::Timestamp;
use parking_lot::Mutex;
use tracing::debug;

use crate::{
    Result,
    catalog::CollectionCatalog,
    lock::Locker,
    store::CatalogStore,
    uncommitted::{UncommittedCatalogUpdates, UncommittedCollections},
};

/// A change that becomes visible when its unit of work commits.
pub trait Change: std::fmt::Debug + Send {
    fn commit(
        self: Box<Self>,
        op_ctx: &mut OperationContext,
        commit_time: Option<Timestamp>,
    ) -> Result<()>;

    fn rollback(self: Box<Self>, op_ctx: &mut OperationContext);
}

type PreCommitHook = Box<dyn FnOnce(&mut OperationContext) -> Result<()> + Send>;
type RollbackHook = Box<dyn FnOnce(&mut OperationContext) + Send>;
type CommitHook = Box<dyn FnOnce(&mut OperationContext, Option<Timestamp>) + Send>;

/// Returns a staging log lent to a catalog writer job to its operation, also when the job
/// panics.
struct StagingLoan<'a> {
    lent: Arc<Mutex<UncommittedCatalogUpdates>>,
    slot: &'a mut UncommittedCatalogUpdates,
}

impl Drop for StagingLoan<'_> {
    fn drop(&mut self) {
        *self.slot = std::mem::take(&mut *self.lent.lock());
    }
}

/// Hooks registered by the current unit of work.
#[derive(Default)]
pub struct RecoveryUnit {
    pre_commit_hooks: Vec<PreCommitHook>,
    change_for_catalog_visibility: Option<Box<dyn Change>>,
    commit_hooks: Vec<CommitHook>,
    rollback_hooks: Vec<RollbackHook>,
}

impl std::fmt::Debug for RecoveryUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryUnit")
            .field("pre_commit_hooks", &self.pre_commit_hooks.len())
            .field(
                "change_for_catalog_visibility",
                &self.change_for_catalog_visibility,
            )
            .field("commit_hooks", &self.commit_hooks.len())
            .field("rollback_hooks", &self.rollback_hooks.len())
            .finish()
    }
}

impl RecoveryUnit {
    /// Runs before anything is made visible; an error aborts the unit of work
    pub fn register_pre_commit_hook(
        &mut self,
        hook: impl FnOnce(&mut OperationContext) -> Result<()> + Send + 'static,
    ) {
        self.pre_commit_hooks.push(Box::new(hook));
    }

    pub fn on_commit(
        &mut self,
        hook: impl FnOnce(&mut OperationContext, Option<Timestamp>) + Send + 'static,
    ) {
        self.commit_hooks.push(Box::new(hook));
    }

    /// Rollback hooks run in reverse registration order
    pub fn on_rollback(&mut self, hook: impl FnOnce(&mut OperationContext) + Send + 'static) {
        self.rollback_hooks.push(Box::new(hook));
    }

    /// Register the single change that publishes this unit of work's catalog updates. It commits
    /// after the pre-commit hooks and before any other commit hook.
    pub fn register_change_for_catalog_visibility(&mut self, change: Box<dyn Change>) {
        assert!(
            self.change_for_catalog_visibility.is_none(),
            "a change for catalog visibility is already registered"
        );
        self.change_for_catalog_visibility = Some(change);
    }

    pub fn has_registered_change_for_catalog_visibility(&self) -> bool {
        self.change_for_catalog_visibility.is_some()
    }

    fn is_empty(&self) -> bool {
        self.pre_commit_hooks.is_empty()
            && self.change_for_catalog_visibility.is_none()
            && self.commit_hooks.is_empty()
            && self.rollback_hooks.is_empty()
    }
}

/// Everything a catalog operation needs to know about the operation calling it.
///
/// The staging log and the uncommitted collections belong to the current unit of work and are
/// only ever touched by the thread running this operation.
#[derive(Debug)]
pub struct OperationContext {
    store: Arc<CatalogStore>,
    locker: Arc<dyn Locker>,
    uncommitted_catalog_updates: UncommittedCatalogUpdates,
    uncommitted_collections: UncommittedCollections,
    recovery_unit: RecoveryUnit,
    stashed_catalog: Option<Arc<CollectionCatalog>>,
}

impl OperationContext {
    pub fn new(store: Arc<CatalogStore>, locker: Arc<dyn Locker>) -> Self {
        Self {
            store,
            locker,
            uncommitted_catalog_updates: Default::default(),
            uncommitted_collections: Default::default(),
            recovery_unit: Default::default(),
            stashed_catalog: None,
        }
    }

    pub fn store(&self) -> &Arc<CatalogStore> {
        &self.store
    }

    pub fn locker(&self) -> &Arc<dyn Locker> {
        &self.locker
    }

    pub fn uncommitted_catalog_updates(&self) -> &UncommittedCatalogUpdates {
        &self.uncommitted_catalog_updates
    }

    pub fn uncommitted_catalog_updates_mut(&mut self) -> &mut UncommittedCatalogUpdates {
        &mut self.uncommitted_catalog_updates
    }

    pub fn uncommitted_collections(&self) -> &UncommittedCollections {
        &self.uncommitted_collections
    }

    pub fn uncommitted_collections_mut(&mut self) -> &mut UncommittedCollections {
        &mut self.uncommitted_collections
    }

    pub fn recovery_unit(&self) -> &RecoveryUnit {
        &self.recovery_unit
    }

    pub fn recovery_unit_mut(&mut self) -> &mut RecoveryUnit {
        &mut self.recovery_unit
    }

    /// The catalog this operation should read from.
    ///
    /// The holder of an active batched write session sees the batched instance so it can read
    /// its own writes. Otherwise a stashed catalog takes precedence over the latest one.
    pub fn catalog(&self) -> Arc<CollectionCatalog> {
        if self.locker.is_w() {
            if let Some(batched) = self.store.batched_instance() {
                return batched;
            }
        }
        if let Some(stashed) = &self.stashed_catalog {
            return Arc::clone(stashed);
        }
        self.store.latest()
    }

    /// Pin `catalog` for every following read of this operation, or unpin with `None`
    pub fn stash_catalog(&mut self, catalog: Option<Arc<CollectionCatalog>>) {
        self.stashed_catalog = catalog;
    }

    /// Apply `job` through the catalog writer
    pub fn write_catalog(
        &self,
        job: impl FnOnce(&mut CollectionCatalog) -> Result<()> + Send + 'static,
    ) -> Result<()> {
        self.store.write_for(self.locker.as_ref(), Box::new(job))
    }

    /// Apply `job` through the catalog writer with access to this operation's staging log.
    ///
    /// The log is lent to the job for the duration of the write and handed back afterwards.
    pub fn write_catalog_with_staging(
        &mut self,
        job: impl FnOnce(&mut CollectionCatalog, &mut UncommittedCatalogUpdates) -> Result<()>
        + Send
        + 'static,
    ) -> Result<()> {
        let loan = StagingLoan {
            lent: Arc::new(Mutex::new(std::mem::take(
                &mut self.uncommitted_catalog_updates,
            ))),
            slot: &mut self.uncommitted_catalog_updates,
        };
        let in_job = Arc::clone(&loan.lent);
        self.store.write_for(
            self.locker.as_ref(),
            Box::new(move |catalog| job(catalog, &mut in_job.lock())),
        )
    }

    /// Commit the current unit of work.
    ///
    /// Pre-commit hooks run first, then the change for catalog visibility, then the commit hooks.
    /// If a pre-commit hook or the visibility change fails, the unit of work is rolled back and
    /// the error returned.
    pub fn commit_unit_of_work(&mut self, commit_time: Option<Timestamp>) -> Result<()> {
        for hook in std::mem::take(&mut self.recovery_unit.pre_commit_hooks) {
            if let Err(error) = hook(self) {
                debug!(%error, "pre-commit hook failed, rolling back");
                self.abort_unit_of_work();
                return Err(error);
            }
        }

        if let Some(change) = self.recovery_unit.change_for_catalog_visibility.take() {
            if let Err(error) = change.commit(self, commit_time) {
                debug!(%error, "publishing catalog changes failed, rolling back");
                self.abort_unit_of_work();
                return Err(error);
            }
        }

        self.recovery_unit.rollback_hooks.clear();
        for hook in std::mem::take(&mut self.recovery_unit.commit_hooks) {
            hook(self, commit_time);
        }
        debug_assert!(self.recovery_unit.is_empty());
        self.uncommitted_collections.clear();
        Ok(())
    }

    /// Roll back the current unit of work, discarding everything it staged
    pub fn abort_unit_of_work(&mut self) {
        self.recovery_unit.pre_commit_hooks.clear();
        self.recovery_unit.commit_hooks.clear();

        if let Some(change) = self.recovery_unit.change_for_catalog_visibility.take() {
            change.rollback(self);
        }
        while let Some(hook) = self.recovery_unit.rollback_hooks.pop() {
            hook(self);
        }
        self.uncommitted_catalog_updates.release_entries();
        self.uncommitted_collections.clear();
    }
}
