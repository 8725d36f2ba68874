use crate::{
    CatalogStore, Collection, LockMode, LockState, OperationContext, UncommittedCatalogUpdates,
    ViewsForDatabase, views::InMemoryDurableViewCatalog,
};
use doccat_id::{CollectionUuid, DatabaseName, NamespaceString};
use std::sync::Arc;

pub(crate) fn db() -> DatabaseName {
    DatabaseName::new("db")
}

pub(crate) fn ns(coll: &str) -> NamespaceString {
    NamespaceString::new(db(), coll)
}

pub(crate) fn collection(coll: &str) -> Arc<Collection> {
    Arc::new(Collection::new(
        CollectionUuid::new(),
        ns(coll),
        Default::default(),
    ))
}

pub(crate) fn store_and_locks() -> (Arc<CatalogStore>, Arc<LockState>) {
    (Arc::new(CatalogStore::default()), Arc::new(LockState::new()))
}

/// A store with the database `db` opened on top of an in-memory durable view catalog
#[derive(Debug)]
pub(crate) struct TestEnv {
    pub(crate) store: Arc<CatalogStore>,
    /// Intent locks on `db`, as held while opening it
    pub(crate) locks: Arc<LockState>,
    pub(crate) durable: Arc<InMemoryDurableViewCatalog>,
}

impl TestEnv {
    pub(crate) fn with_db() -> Self {
        let (store, locks) = store_and_locks();
        locks.lock_db(&db(), LockMode::IntentExclusive);
        let durable = Arc::new(InMemoryDurableViewCatalog::new(db()));

        let views = ViewsForDatabase::load(Arc::clone(&durable) as _).unwrap();
        let locker = Arc::clone(&locks);
        store
            .write(Box::new(move |catalog| {
                catalog.on_open_database(locker.as_ref(), &db(), views)
            }))
            .unwrap();

        Self {
            store,
            locks,
            durable,
        }
    }

    /// An operation holding `db` exclusively
    pub(crate) fn writer(&self) -> OperationContext {
        let locks = LockState::new();
        locks.lock_db(&db(), LockMode::Exclusive);
        OperationContext::new(Arc::clone(&self.store), Arc::new(locks))
    }

    /// An operation holding no locks
    pub(crate) fn reader(&self) -> OperationContext {
        OperationContext::new(Arc::clone(&self.store), Arc::new(LockState::new()))
    }

    /// Register a committed collection named `coll` outside of any transaction
    pub(crate) fn create_collection(&self, coll: &str) -> Arc<Collection> {
        let collection = collection(coll);
        let registered = Arc::clone(&collection);
        self.store
            .write(Box::new(move |catalog| {
                catalog.register_collection(
                    &mut UncommittedCatalogUpdates::default(),
                    registered.uuid(),
                    registered,
                )
            }))
            .unwrap();
        collection
    }
}
