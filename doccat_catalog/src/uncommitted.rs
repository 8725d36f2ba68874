//! Catalog changes a transaction has made but not yet published.
use std::sync::Arc;

use doccat_id::{CollectionUuid, DatabaseName, NamespaceString};
use hashbrown::{HashMap, HashSet};
use tracing::warn;

use crate::{
    collection::Collection, lock::LockMode, txn::OperationContext, views::ViewsForDatabase,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Writable clone of a collection
    WritableCollection,
    /// Marker that a namespace has been renamed
    RenamedCollection,
    /// Dropped collection
    DroppedCollection,
    /// Collection created under the name of a collection dropped in the same transaction
    RecreatedCollection,
    /// New set of views for a database
    ReplacedViewsForDatabase,
    AddViewResource,
    RemoveViewResource,
}

impl Action {
    pub fn is_collection_action(&self) -> bool {
        matches!(
            self,
            Self::WritableCollection
                | Self::RenamedCollection
                | Self::DroppedCollection
                | Self::RecreatedCollection
        )
    }
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub action: Action,
    /// Set for writable and recreated collections
    pub collection: Option<Arc<Collection>>,
    /// Set for every action. For renames this is the source namespace.
    pub nss: NamespaceString,
    /// Set for dropped and recreated collections
    pub external_uuid: Option<CollectionUuid>,
    /// Set for renames
    pub rename_to: Option<NamespaceString>,
    /// Set for replaced views
    pub views_for_db: Option<ViewsForDatabase>,
}

impl Entry {
    fn new(action: Action, collection: Option<Arc<Collection>>, nss: NamespaceString) -> Self {
        Self {
            action,
            collection,
            nss,
            external_uuid: None,
            rename_to: None,
            views_for_db: None,
        }
    }

    pub fn uuid(&self) -> Option<CollectionUuid> {
        match self.action {
            Action::WritableCollection | Action::RenamedCollection => {
                self.collection.as_ref().map(|c| c.uuid())
            }
            _ => self.external_uuid,
        }
    }
}

/// The staging log of one transaction.
///
/// Entries are kept in the order they were staged. Lookups scan backwards so the most recent
/// entry for a key wins. A transaction only touches a handful of collections, so the log is
/// never large enough for the linear scans to matter.
#[derive(Debug, Default)]
pub struct UncommittedCatalogUpdates {
    entries: Vec<Entry>,
    ignore_external_view_changes: HashSet<DatabaseName>,
}

impl UncommittedCatalogUpdates {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// `(false, None)` when nothing is staged for `uuid`, `(true, None)` when it has been dropped
    pub fn lookup_collection_by_uuid(
        &self,
        uuid: CollectionUuid,
    ) -> (bool, Option<Arc<Collection>>) {
        self.entries
            .iter()
            .rev()
            // renames are keyed by their writable entry, not the marker
            .filter(|entry| entry.action != Action::RenamedCollection)
            .find(|entry| entry.uuid() == Some(uuid))
            .map_or((false, None), |entry| (true, entry.collection.clone()))
    }

    /// `(true, None)` when the namespace was dropped or renamed away in this transaction
    pub fn lookup_collection_by_namespace(
        &self,
        nss: &NamespaceString,
    ) -> (bool, Option<Arc<Collection>>) {
        self.entries
            .iter()
            .rev()
            .find(|entry| entry.action.is_collection_action() && &entry.nss == nss)
            .map_or((false, None), |entry| (true, entry.collection.clone()))
    }

    pub fn views_for_database(&self, db: &DatabaseName) -> Option<&ViewsForDatabase> {
        self.entries
            .iter()
            .rev()
            .filter(|entry| entry.nss.db() == db)
            .find_map(|entry| entry.views_for_db.as_ref())
    }

    pub fn writable_collection(&mut self, collection: Arc<Collection>) {
        let ns = collection.ns();
        self.entries
            .push(Entry::new(Action::WritableCollection, Some(collection), ns));
    }

    /// Stage a rename of `collection`, which must already have been staged as writable and
    /// already carry its new namespace.
    pub fn rename_collection(&mut self, collection: &Collection, from: &NamespaceString) {
        let entry = self
            .entries
            .iter_mut()
            .rev()
            .find(|entry| {
                entry
                    .collection
                    .as_deref()
                    .is_some_and(|c| std::ptr::eq(c, collection))
            })
            .unwrap_or_else(|| {
                panic!(
                    "renamed collection {} was never made writable in this transaction",
                    collection.uuid()
                )
            });
        entry.nss = collection.ns();
        let to = entry.nss.clone();

        let mut marker = Entry::new(Action::RenamedCollection, None, from.clone());
        marker.rename_to = Some(to);
        self.entries.push(marker);
    }

    pub fn drop_collection(&mut self, collection: &Collection) {
        let uuid = collection.uuid();
        let Some(pos) = self
            .entries
            .iter()
            .rposition(|entry| entry.uuid() == Some(uuid))
        else {
            let mut entry = Entry::new(Action::DroppedCollection, None, collection.ns());
            entry.external_uuid = Some(uuid);
            self.entries.push(entry);
            return;
        };

        let entry = &mut self.entries[pos];
        // Removing the recreate lets lookups find the earlier drop again
        if entry.action == Action::RecreatedCollection {
            self.entries.remove(pos);
            return;
        }

        let Some(staged) = entry.collection.take() else {
            return;
        };
        assert!(
            std::ptr::eq(staged.as_ref(), collection),
            "dropped collection {uuid} is not the instance staged in this transaction"
        );
        entry.action = Action::DroppedCollection;
        entry.external_uuid = Some(uuid);
    }

    pub fn create_collection_after_drop(
        &mut self,
        uuid: CollectionUuid,
        collection: Arc<Collection>,
    ) {
        let ns = collection.ns();
        let mut entry = Entry::new(Action::RecreatedCollection, Some(collection), ns);
        entry.external_uuid = Some(uuid);
        self.entries.push(entry);
    }

    /// Stage `views` as the complete new set of views of `db`
    pub fn replace_views_for_database(&mut self, db: &DatabaseName, views: ViewsForDatabase) {
        let mut entry = Entry::new(
            Action::ReplacedViewsForDatabase,
            None,
            NamespaceString::new(db.clone(), ""),
        );
        entry.views_for_db = Some(views);
        self.entries.push(entry);
    }

    /// Stage the lock resource of a new view.
    ///
    /// Before the transaction commits the view name is also reserved in the shared catalog, so
    /// that a concurrent collection creation under the same name conflicts. The reservation is
    /// released again if the transaction rolls back.
    pub fn add_view(op_ctx: &mut OperationContext, nss: &NamespaceString) {
        let reserved = nss.clone();
        op_ctx
            .recovery_unit_mut()
            .register_pre_commit_hook(move |op_ctx| {
                let system_views = NamespaceString::system_views(reserved.db());
                assert!(
                    op_ctx
                        .locker()
                        .is_collection_locked_for_mode(&system_views, LockMode::Exclusive),
                    "registering view {reserved} requires an exclusive lock on {system_views}"
                );
                op_ctx.write_catalog_with_staging(move |catalog, staged| {
                    catalog.register_uncommitted_view(staged, &reserved)
                })
            });

        let released = nss.clone();
        op_ctx.recovery_unit_mut().on_rollback(move |op_ctx| {
            let ns = released.clone();
            let res = op_ctx.write_catalog(move |catalog| {
                catalog.deregister_uncommitted_view(&ns);
                Ok(())
            });
            if let Err(error) = res {
                warn!(nss = %released, %error, "failed to release uncommitted view");
            }
        });

        op_ctx
            .uncommitted_catalog_updates_mut()
            .entries
            .push(Entry::new(Action::AddViewResource, None, nss.clone()));
    }

    pub fn remove_view(&mut self, nss: &NamespaceString) {
        self.entries
            .push(Entry::new(Action::RemoveViewResource, None, nss.clone()));
    }

    /// Empty the log, handing back everything staged so far
    pub fn release_entries(&mut self) -> Vec<Entry> {
        std::mem::take(&mut self.entries)
    }

    pub fn set_ignore_external_view_changes(&mut self, db: &DatabaseName, value: bool) {
        if value {
            self.ignore_external_view_changes.insert(db.clone());
        } else {
            self.ignore_external_view_changes.remove(db);
        }
    }

    /// Whether a change to `<db>.system.views` was made by this transaction's own view DDL and
    /// must not trigger a reload
    pub fn should_ignore_external_view_changes(&self, db: &DatabaseName) -> bool {
        self.ignore_external_view_changes.contains(db)
    }
}

/// Collections created earlier in a multi-statement transaction, visible only to it.
#[derive(Debug, Default)]
pub struct UncommittedCollections {
    by_uuid: HashMap<CollectionUuid, Arc<Collection>>,
    by_namespace: HashMap<NamespaceString, Arc<Collection>>,
}

impl UncommittedCollections {
    /// Make `collection`, created by the current transaction, visible to that transaction.
    ///
    /// Before the transaction commits the collection is registered in the shared catalog, where
    /// other readers skip it until the commit marks it committed. A rollback deregisters it.
    pub fn add_to_txn(op_ctx: &mut OperationContext, collection: Arc<Collection>) {
        collection.set_committed(false);
        op_ctx
            .uncommitted_collections_mut()
            .add(Arc::clone(&collection));

        let registered = Arc::clone(&collection);
        op_ctx
            .recovery_unit_mut()
            .register_pre_commit_hook(move |op_ctx| {
                op_ctx.write_catalog_with_staging(move |catalog, staged| {
                    catalog.register_collection(staged, registered.uuid(), registered)
                })
            });

        let committed = Arc::clone(&collection);
        op_ctx
            .recovery_unit_mut()
            .on_commit(move |_, _| committed.set_committed(true));

        op_ctx.recovery_unit_mut().on_rollback(move |op_ctx| {
            let uuid = collection.uuid();
            let res = op_ctx.write_catalog(move |catalog| {
                let ours = catalog.check_if_collection_satisfiable(uuid, |registered| {
                    std::ptr::eq(registered, collection.as_ref())
                });
                if ours {
                    catalog.deregister_collection(uuid);
                }
                Ok(())
            });
            if let Err(error) = res {
                warn!(%uuid, %error, "failed to deregister uncommitted collection");
            }
        });
    }

    pub fn add(&mut self, collection: Arc<Collection>) {
        self.by_namespace
            .insert(collection.ns(), Arc::clone(&collection));
        self.by_uuid.insert(collection.uuid(), collection);
    }

    pub fn get_by_uuid(&self, uuid: CollectionUuid) -> Option<Arc<Collection>> {
        self.by_uuid.get(&uuid).map(Arc::clone)
    }

    pub fn get_by_namespace(&self, nss: &NamespaceString) -> Option<Arc<Collection>> {
        self.by_namespace.get(nss).map(Arc::clone)
    }

    pub fn remove(&mut self, uuid: CollectionUuid) -> Option<Arc<Collection>> {
        let collection = self.by_uuid.remove(&uuid)?;
        self.by_namespace.remove(&collection.ns());
        Some(collection)
    }

    pub fn clear(&mut self) {
        self.by_uuid.clear();
        self.by_namespace.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.by_uuid.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use collection_strategy::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn ns(coll: &str) -> NamespaceString {
        NamespaceString::new(DatabaseName::new("db"), coll)
    }

    fn collection(coll: &str) -> Arc<Collection> {
        Arc::new(Collection::new(
            CollectionUuid::new(),
            ns(coll),
            Default::default(),
        ))
    }

    #[test]
    fn empty_log_reports_not_found() {
        let updates = UncommittedCatalogUpdates::default();
        assert!(!updates.lookup_collection_by_namespace(&ns("a")).0);
        assert!(!updates.lookup_collection_by_uuid(CollectionUuid::new()).0);
    }

    #[test]
    fn drop_converts_writable_entry_in_place() {
        let coll = collection("a");
        let mut updates = UncommittedCatalogUpdates::default();
        updates.writable_collection(Arc::clone(&coll));
        updates.drop_collection(&coll);

        assert_eq!(updates.entries().len(), 1);
        assert_eq!(updates.entries()[0].action, Action::DroppedCollection);
        let (found, staged) = updates.lookup_collection_by_uuid(coll.uuid());
        assert!(found);
        assert!(staged.is_none());

        // dropping again is a no-op
        updates.drop_collection(&coll);
        assert_eq!(updates.entries().len(), 1);
    }

    #[test]
    fn drop_of_unstaged_collection_appends() {
        let coll = collection("a");
        let mut updates = UncommittedCatalogUpdates::default();
        updates.drop_collection(&coll);
        let entries = updates.release_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, Action::DroppedCollection);
        assert_eq!(entries[0].external_uuid, Some(coll.uuid()));
        assert!(updates.is_empty());
    }

    #[test]
    fn dropping_a_recreate_erases_it() {
        let old = collection("a");
        let new = collection("a");
        let mut updates = UncommittedCatalogUpdates::default();

        updates.drop_collection(&old);
        updates.create_collection_after_drop(new.uuid(), Arc::clone(&new));
        let (found, staged) = updates.lookup_collection_by_namespace(&ns("a"));
        assert!(found);
        assert!(Arc::ptr_eq(&staged.unwrap(), &new));

        updates.drop_collection(&new);
        let (found, staged) = updates.lookup_collection_by_namespace(&ns("a"));
        assert!(found);
        assert!(staged.is_none());
        assert!(!updates.lookup_collection_by_uuid(new.uuid()).0);

        let entries = updates.release_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, Action::DroppedCollection);
        assert_eq!(entries[0].uuid(), Some(old.uuid()));
    }

    #[test]
    fn drop_recreate_drop_leaves_no_entry_for_the_recreated_uuid() {
        let old = collection("a");
        let new = collection("a");
        let mut updates = UncommittedCatalogUpdates::default();
        updates.drop_collection(&old);
        updates.create_collection_after_drop(new.uuid(), Arc::clone(&new));
        updates.drop_collection(&new);

        let entries = updates.release_entries();
        assert!(entries.iter().all(|e| e.uuid() != Some(new.uuid())));
    }

    #[test]
    fn rename_updates_the_writable_entry() {
        let coll = collection("a");
        let mut updates = UncommittedCatalogUpdates::default();
        updates.writable_collection(Arc::clone(&coll));
        coll.set_ns(ns("b"));
        updates.rename_collection(&coll, &ns("a"));

        let (found, staged) = updates.lookup_collection_by_namespace(&ns("a"));
        assert!(found);
        assert!(staged.is_none());
        let (found, staged) = updates.lookup_collection_by_namespace(&ns("b"));
        assert!(found);
        assert!(Arc::ptr_eq(&staged.unwrap(), &coll));
        let (_, staged) = updates.lookup_collection_by_uuid(coll.uuid());
        assert_eq!(staged.unwrap().ns(), ns("b"));

        let marker = &updates.entries()[1];
        assert_eq!(marker.action, Action::RenamedCollection);
        assert_eq!(marker.rename_to, Some(ns("b")));
    }

    #[test]
    #[should_panic(expected = "was never made writable")]
    fn rename_without_writable_entry_panics() {
        let coll = collection("a");
        let mut updates = UncommittedCatalogUpdates::default();
        updates.rename_collection(&coll, &ns("z"));
    }

    #[test]
    fn ignore_external_view_changes() {
        let db = DatabaseName::new("db");
        let mut updates = UncommittedCatalogUpdates::default();
        assert!(!updates.should_ignore_external_view_changes(&db));
        updates.set_ignore_external_view_changes(&db, true);
        assert!(updates.should_ignore_external_view_changes(&db));
        updates.set_ignore_external_view_changes(&db, false);
        assert!(!updates.should_ignore_external_view_changes(&db));
    }

    #[test]
    fn uncommitted_collections() {
        let coll = collection("a");
        let mut uncommitted = UncommittedCollections::default();
        uncommitted.add(Arc::clone(&coll));
        assert!(uncommitted.get_by_namespace(&ns("a")).is_some());
        assert!(uncommitted.remove(coll.uuid()).is_some());
        assert!(uncommitted.get_by_namespace(&ns("a")).is_none());
        assert!(uncommitted.is_empty());
    }

    mod collection_strategy {
        use super::*;

        /// One staging step against a fixed pool of collections
        #[derive(Debug, Clone, Copy)]
        pub(super) enum Step {
            Writable(usize),
            Drop(usize),
            Recreate(usize),
        }

        pub(super) fn step(pool: usize) -> impl Strategy<Value = Step> {
            prop_oneof![
                (0..pool).prop_map(Step::Writable),
                (0..pool).prop_map(Step::Drop),
                (0..pool).prop_map(Step::Recreate),
            ]
        }
    }

    proptest! {
        /// Whatever the sequence of staged actions, a lookup answers with the last entry
        /// touching the key.
        #[test]
        fn last_staged_entry_wins(steps in prop::collection::vec(step(3), 0..24)) {
            let pool: Vec<_> = (0..3).map(|i| collection(&format!("c{i}"))).collect();
            let mut updates = UncommittedCatalogUpdates::default();

            for s in steps {
                match s {
                    Step::Writable(i) => {
                        updates.writable_collection(Arc::new(pool[i].clone_for_write()))
                    }
                    Step::Drop(i) => {
                        let (_, staged) = updates.lookup_collection_by_uuid(pool[i].uuid());
                        match staged {
                            Some(staged) => updates.drop_collection(&staged),
                            None => updates.drop_collection(&pool[i]),
                        }
                    }
                    Step::Recreate(i) => updates.create_collection_after_drop(
                        pool[i].uuid(),
                        Arc::new(pool[i].clone_for_write()),
                    ),
                }
            }

            for coll in &pool {
                let last_by_uuid = updates
                    .entries()
                    .iter()
                    .rev()
                    .find(|e| {
                        e.action != Action::RenamedCollection && e.uuid() == Some(coll.uuid())
                    });
                let (found, staged) = updates.lookup_collection_by_uuid(coll.uuid());
                prop_assert_eq!(found, last_by_uuid.is_some());
                prop_assert_eq!(
                    staged.map(|c| Arc::as_ptr(&c)),
                    last_by_uuid.and_then(|e| e.collection.as_ref().map(Arc::as_ptr))
                );

                let last_by_ns = updates
                    .entries()
                    .iter()
                    .rev()
                    .find(|e| e.action.is_collection_action() && e.nss == coll.ns());
                let (found, staged) = updates.lookup_collection_by_namespace(&coll.ns());
                prop_assert_eq!(found, last_by_ns.is_some());
                prop_assert_eq!(
                    staged.map(|c| Arc::as_ptr(&c)),
                    last_by_ns.and_then(|e| e.collection.as_ref().map(Arc::as_ptr))
                );
            }
        }
    }
}
