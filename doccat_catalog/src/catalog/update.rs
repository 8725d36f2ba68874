use std::sync::Arc;

use doccat_id::{CollectionUuid, DatabaseName, NamespaceString, ResourceId, ResourceType};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{CollectionCatalog, NamespaceType, NonExistenceType, PublishCatalogUpdates};
use crate::{
    CatalogError, Result,
    collection::Collection,
    lock::{LockMode, Locker},
    txn::OperationContext,
    uncommitted::UncommittedCatalogUpdates,
    views::{Collation, PipelineValidatorFn, ViewDefinition, ViewDocument, ViewsForDatabase},
};

impl CollectionCatalog {
    /// Add `collection` to the catalog under `uuid`.
    ///
    /// If the namespace is still taken by a collection that the transaction owning `staged` has
    /// dropped, the registration is staged instead and lands in the same publish as the drop.
    ///
    /// # Panics
    ///
    /// If `uuid` is already registered.
    pub fn register_collection(
        &mut self,
        staged: &mut UncommittedCatalogUpdates,
        uuid: CollectionUuid,
        collection: Arc<Collection>,
    ) -> Result<()> {
        let ns = collection.ns();
        if self.ensure_namespace_does_not_exist(staged, &ns, NamespaceType::All)?
            == NonExistenceType::DropPending
        {
            staged.create_collection_after_drop(uuid, collection);
            return Ok(());
        }

        debug!(%uuid, %ns, "registering collection");
        let db = ns.db().clone();
        let key = (db.clone(), uuid);
        assert!(
            !self.catalog.contains_key(&uuid),
            "collection {uuid} is already registered"
        );
        assert!(
            !self.ordered_collections.contains_key(&key),
            "collection {uuid} is already registered in database {db}"
        );

        self.catalog.insert(uuid, Arc::clone(&collection));
        self.collections.insert(ns.clone(), Arc::clone(&collection));
        self.ordered_collections.insert(key, Arc::clone(&collection));

        self.stats.add(&collection);
        self.assert_stats_consistent();

        let db_name = db.to_string();
        self.add_resource(ResourceId::new(ResourceType::Database, &db_name), db_name);
        let coll_name = ns.ns();
        self.add_resource(
            ResourceId::new(ResourceType::Collection, &coll_name),
            coll_name,
        );
        Ok(())
    }

    /// Remove the collection registered under `uuid` and hand it back.
    ///
    /// # Panics
    ///
    /// If no collection is registered under `uuid`.
    pub fn deregister_collection(&mut self, uuid: CollectionUuid) -> Arc<Collection> {
        let collection = self
            .catalog
            .remove(&uuid)
            .unwrap_or_else(|| panic!("deregistering unknown collection {uuid}"));
        let ns = collection.ns();
        debug!(%uuid, %ns, "deregistering collection");

        assert!(
            self.collections.remove(&ns).is_some(),
            "collection {uuid} is not registered under {ns}"
        );
        assert!(
            self.ordered_collections
                .remove(&(ns.db().clone(), uuid))
                .is_some(),
            "collection {uuid} is not registered in database {}",
            ns.db()
        );

        self.stats.remove(&collection);
        self.assert_stats_consistent();

        let coll_name = ns.ns();
        self.remove_resource(
            ResourceId::new(ResourceType::Collection, &coll_name),
            &coll_name,
        );
        collection
    }

    /// Publish a writable copy of a registered collection in place of the instance it was
    /// cloned from. The copy may carry new options or, after a rename, a new namespace.
    pub(crate) fn publish_writable_collection(&mut self, collection: Arc<Collection>) {
        let uuid = collection.uuid();
        let ns = collection.ns();
        if let Some(old) = self.catalog.get(&uuid).cloned() {
            let old_ns = old.ns();
            self.ordered_collections.remove(&(old_ns.db().clone(), uuid));
            if self
                .collections
                .get(&old_ns)
                .is_some_and(|registered| registered.uuid() == uuid)
            {
                self.collections.remove(&old_ns);
            }
            self.stats.remove(&old);
        }
        debug!(%uuid, %ns, "publishing writable collection");

        self.ordered_collections
            .insert((ns.db().clone(), uuid), Arc::clone(&collection));
        self.collections.insert(ns, Arc::clone(&collection));
        self.stats.add(&collection);
        self.catalog.insert(uuid, collection);
        self.assert_stats_consistent();
    }

    fn assert_stats_consistent(&self) {
        assert_eq!(
            self.stats.internal + self.stats.user_collections,
            self.collections.len(),
            "collection stats out of sync with the registered collections"
        );
    }

    /// Reserve `ns` for a view whose creating transaction is about to commit.
    ///
    /// Only collections are checked: creating a view requires an exclusive lock on
    /// `system.views`, so two view creations never race.
    pub fn register_uncommitted_view(
        &mut self,
        staged: &UncommittedCatalogUpdates,
        ns: &NamespaceString,
    ) -> Result<()> {
        if self.ensure_namespace_does_not_exist(staged, ns, NamespaceType::Collection)?
            == NonExistenceType::DropPending
        {
            return Err(CatalogError::write_conflict(format!(
                "view {ns} conflicts with a collection dropped in the same transaction"
            )));
        }
        self.uncommitted_views.insert(ns.clone());
        Ok(())
    }

    pub fn deregister_uncommitted_view(&mut self, ns: &NamespaceString) {
        self.uncommitted_views.remove(ns);
    }

    fn ensure_namespace_does_not_exist(
        &self,
        staged: &UncommittedCatalogUpdates,
        ns: &NamespaceString,
        ty: NamespaceType,
    ) -> Result<NonExistenceType> {
        if self.collections.contains_key(ns) {
            let (found, collection) = staged.lookup_collection_by_namespace(ns);
            if found && collection.is_none() {
                return Ok(NonExistenceType::DropPending);
            }
            info!(%ns, "conflicted registering namespace, a collection already has it");
            return Err(CatalogError::write_conflict(format!(
                "collection {ns} already exists"
            )));
        }

        if ty == NamespaceType::All {
            let existing_view = self.uncommitted_views.contains(ns)
                || staged
                    .views_for_database(ns.db())
                    .or_else(|| self.views_for_database.get(ns.db()))
                    .is_some_and(|views| views.lookup(ns).is_some());
            if existing_view {
                info!(%ns, "conflicted registering namespace, a view already has it");
                return Err(CatalogError::write_conflict(format!(
                    "view {ns} already exists"
                )));
            }
        }

        Ok(NonExistenceType::Normal)
    }

    /// Forget every collection and view, as when the storage engine is being shut down
    pub fn deregister_all_collections_and_views(&mut self) {
        info!("deregistering all the collections");
        for (uuid, collection) in &self.catalog {
            debug!(%uuid, ns = %collection.ns(), "deregistering collection");
        }
        self.catalog.clear();
        self.collections.clear();
        self.ordered_collections.clear();
        self.views_for_database.clear();
        self.stats = Default::default();
        self.resource_information.clear();
    }

    /// Install the views of a newly opened database.
    pub fn on_open_database(
        &mut self,
        locker: &dyn Locker,
        db: &DatabaseName,
        views: ViewsForDatabase,
    ) -> Result<()> {
        assert!(
            locker.is_db_locked_for_mode(db, LockMode::IntentShared),
            "opening database {db} requires a database lock"
        );
        if self.views_for_database.contains_key(db) {
            return Err(CatalogError::AlreadyInitialized(db.clone()));
        }
        self.views_for_database.insert(db.clone(), views);
        Ok(())
    }

    pub fn on_close_database(&mut self, locker: &dyn Locker, db: &DatabaseName) {
        assert!(
            locker.is_db_locked_for_mode(db, LockMode::Exclusive),
            "closing database {db} requires an exclusive database lock"
        );
        let name = db.to_string();
        self.remove_resource(ResourceId::new(ResourceType::Database, &name), &name);
        self.views_for_database.remove(db);
    }

    /// Remember where every collection lives so UUIDs still resolve while the catalog is closed
    pub fn on_close_catalog(&mut self, locker: &dyn Locker) {
        assert!(locker.is_w(), "closing the catalog requires the global exclusive lock");
        assert!(self.shadow_catalog.is_none(), "catalog is already closed");
        info!(collections = self.catalog.len(), "closing the collection catalog");
        self.shadow_catalog = Some(
            self.catalog
                .iter()
                .map(|(uuid, collection)| (*uuid, collection.ns()))
                .collect(),
        );
    }

    pub fn on_open_catalog(&mut self, locker: &dyn Locker) {
        assert!(locker.is_w(), "opening the catalog requires the global exclusive lock");
        assert!(self.shadow_catalog.is_some(), "catalog is not closed");
        self.shadow_catalog = None;
        self.epoch += 1;
        info!(epoch = self.epoch, "reopened the collection catalog");
    }

    /// Stage the rename of `collection`, a writable clone that already carries its new name.
    pub fn on_collection_rename(
        op_ctx: &mut OperationContext,
        collection: &Collection,
        from: &NamespaceString,
    ) {
        op_ctx
            .uncommitted_catalog_updates_mut()
            .rename_collection(collection, from);
    }

    /// Stage the drop of `collection`
    pub fn drop_collection(op_ctx: &mut OperationContext, collection: &Collection) {
        op_ctx
            .uncommitted_catalog_updates_mut()
            .drop_collection(collection);
        // collections looked up in place never registered the publisher
        PublishCatalogUpdates::ensure_registered_with_recovery_unit(op_ctx);
    }

    pub(crate) fn replace_views_for_database(
        &mut self,
        db: &DatabaseName,
        views: ViewsForDatabase,
    ) {
        self.views_for_database.insert(db.clone(), views);
    }

    /// The views of `db` as seen by `op_ctx`, copied for modification
    fn views_to_modify(&self, op_ctx: &OperationContext, db: &DatabaseName) -> ViewsForDatabase {
        let shared = self
            .views_for_database
            .get(db)
            .unwrap_or_else(|| panic!("database {db} has not been opened"));
        op_ctx
            .uncommitted_catalog_updates()
            .views_for_database(db)
            .unwrap_or(shared)
            .clone()
    }

    pub fn create_view(
        &self,
        op_ctx: &mut OperationContext,
        view_name: &NamespaceString,
        view_on: &NamespaceString,
        pipeline: Vec<Value>,
        collation: Option<&Value>,
        validator: &PipelineValidatorFn,
    ) -> Result<()> {
        assert_view_locks(op_ctx, view_name, LockMode::IntentExclusive);
        let views = self.views_to_modify(op_ctx, view_name.db());

        if view_name.db() != view_on.db() {
            return Err(CatalogError::BadValue(
                "View must be created on a view or collection in the same database".to_string(),
            ));
        }
        if views.lookup(view_name).is_some() || self.collections.contains_key(view_name) {
            return Err(CatalogError::NamespaceExists(view_name.clone()));
        }
        if !NamespaceString::valid_collection_name(view_on.coll()) {
            return Err(CatalogError::InvalidNamespace(format!(
                "invalid name for 'viewOn': {}",
                view_on.coll()
            )));
        }
        let collation = Collation::parse(collation)?;

        Self::with_ignored_external_view_changes(op_ctx, view_name.db(), |op_ctx| {
            self.create_or_update_view(
                op_ctx, view_name, view_on, pipeline, validator, collation, views,
            )
        })
    }

    /// Replace the definition of an existing view, keeping its collation
    pub fn modify_view(
        &self,
        op_ctx: &mut OperationContext,
        view_name: &NamespaceString,
        view_on: &NamespaceString,
        pipeline: Vec<Value>,
        validator: &PipelineValidatorFn,
    ) -> Result<()> {
        assert_view_locks(op_ctx, view_name, LockMode::Exclusive);
        let views = self.views_to_modify(op_ctx, view_name.db());

        if view_name.db() != view_on.db() {
            return Err(CatalogError::BadValue(
                "View must be created on a view or collection in the same database".to_string(),
            ));
        }
        let Some(existing) = views.lookup(view_name) else {
            return Err(CatalogError::NamespaceNotFound(format!(
                "cannot modify missing view {}",
                view_name.ns()
            )));
        };
        if !NamespaceString::valid_collection_name(view_on.coll()) {
            return Err(CatalogError::InvalidNamespace(format!(
                "invalid name for 'viewOn': {}",
                view_on.coll()
            )));
        }
        let collation = existing.collation().cloned();

        Self::with_ignored_external_view_changes(op_ctx, view_name.db(), |op_ctx| {
            self.create_or_update_view(
                op_ctx, view_name, view_on, pipeline, validator, collation, views,
            )
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn create_or_update_view(
        &self,
        op_ctx: &mut OperationContext,
        view_name: &NamespaceString,
        view_on: &NamespaceString,
        pipeline: Vec<Value>,
        validator: &PipelineValidatorFn,
        collation: Option<Collation>,
        mut views: ViewsForDatabase,
    ) -> Result<()> {
        assert_view_locks(op_ctx, view_name, LockMode::IntentExclusive);
        views.require_valid_catalog()?;

        let view = ViewDefinition::new(view_name.clone(), view_on.clone(), pipeline, collation);
        views.upsert_into_graph(&view, validator, self.args.view_limits)?;

        let previous = views.lookup(view_name);
        views.durable().upsert(view_name, &ViewDocument::new(&view))?;
        restore_durable_view_on_rollback(op_ctx, &views, view_name, previous);

        views.reload()?;
        debug!(view = %view_name, view_on = %view_on, "staged view definition");

        UncommittedCatalogUpdates::add_view(op_ctx, view_name);
        op_ctx
            .uncommitted_catalog_updates_mut()
            .replace_views_for_database(view_name.db(), views);
        PublishCatalogUpdates::ensure_registered_with_recovery_unit(op_ctx);
        Ok(())
    }

    pub fn drop_view(
        &self,
        op_ctx: &mut OperationContext,
        view_name: &NamespaceString,
    ) -> Result<()> {
        assert_view_locks(op_ctx, view_name, LockMode::IntentExclusive);
        let mut views = self.views_to_modify(op_ctx, view_name.db());
        views.require_valid_catalog()?;

        let Some(existing) = views.lookup(view_name) else {
            return Err(CatalogError::NamespaceNotFound(format!(
                "cannot drop missing view: {}",
                view_name.ns()
            )));
        };

        Self::with_ignored_external_view_changes(op_ctx, view_name.db(), |op_ctx| {
            views.durable().remove(view_name)?;
            restore_durable_view_on_rollback(op_ctx, &views, view_name, Some(existing));
            views.remove_view(view_name);

            views.reload()?;
            debug!(view = %view_name, "staged view drop");

            let staged = op_ctx.uncommitted_catalog_updates_mut();
            staged.remove_view(view_name);
            staged.replace_views_for_database(view_name.db(), views);
            PublishCatalogUpdates::ensure_registered_with_recovery_unit(op_ctx);
            Ok(())
        })
    }

    /// Reload the views of `db` from their durable definitions and publish the result.
    ///
    /// Does nothing while the transaction is itself changing the views of `db`. The reloaded
    /// directory is published even if reloading failed, leaving it marked invalid.
    pub fn reload_views(&self, op_ctx: &OperationContext, db: &DatabaseName) -> Result<()> {
        let system_views = NamespaceString::system_views(db);
        assert!(
            op_ctx
                .locker()
                .is_collection_locked_for_mode(&system_views, LockMode::IntentShared),
            "reloading views requires a lock on {system_views}"
        );
        if op_ctx
            .uncommitted_catalog_updates()
            .should_ignore_external_view_changes(db)
        {
            return Ok(());
        }

        debug!(%db, "reloading view catalog for database");
        let durable = self
            .views_for_database
            .get(db)
            .map(|views| Arc::clone(views.durable()))
            .unwrap_or_else(|| panic!("database {db} has not been opened"));
        let mut views = ViewsForDatabase::new(durable);
        let status = views.reload();

        let db_name = db.clone();
        op_ctx.write_catalog(move |catalog| {
            catalog.replace_views_for_database(&db_name, views);
            Ok(())
        })?;
        status
    }

    /// Publish an empty, valid view directory for `db`
    pub fn clear_views(&self, op_ctx: &OperationContext, db: &DatabaseName) -> Result<()> {
        let system_views = NamespaceString::system_views(db);
        assert!(
            op_ctx
                .locker()
                .is_collection_locked_for_mode(&system_views, LockMode::Exclusive),
            "clearing views requires an exclusive lock on {system_views}"
        );
        let mut views = self
            .views_for_database
            .get(db)
            .cloned()
            .unwrap_or_else(|| panic!("database {db} has not been opened"));
        views.clear();

        let db_name = db.clone();
        op_ctx.write_catalog(move |catalog| {
            catalog.replace_views_for_database(&db_name, views);
            Ok(())
        })
    }
}

fn assert_view_locks(op_ctx: &OperationContext, view_name: &NamespaceString, mode: LockMode) {
    let locker = op_ctx.locker();
    assert!(
        locker.is_collection_locked_for_mode(view_name, mode),
        "view {view_name} must be locked in mode {mode:?}"
    );
    let system_views = NamespaceString::system_views(view_name.db());
    assert!(
        locker.is_collection_locked_for_mode(&system_views, LockMode::Exclusive),
        "changing view {view_name} requires an exclusive lock on {system_views}"
    );
}

/// Durable view writes take part in the unit of work: put back what was there before if it
/// rolls back.
fn restore_durable_view_on_rollback(
    op_ctx: &mut OperationContext,
    views: &ViewsForDatabase,
    view_name: &NamespaceString,
    previous: Option<Arc<ViewDefinition>>,
) {
    let durable = Arc::clone(views.durable());
    let view_name = view_name.clone();
    op_ctx.recovery_unit_mut().on_rollback(move |_| {
        let res = match previous {
            Some(previous) => durable.upsert(&view_name, &ViewDocument::new(&previous)),
            None => durable.remove(&view_name),
        };
        if let Err(error) = res {
            warn!(view = %view_name, %error, "failed to restore durable view definition");
        }
    });
}
