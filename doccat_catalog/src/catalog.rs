//! Implementation of the collection catalog snapshot and the lookups served from it
use std::{collections::BTreeMap, sync::Arc};

use doccat_clap_blocks::catalog::CatalogConfig;
use doccat_id::{CollectionUuid, DatabaseName, NamespaceString, ResourceId};
use hashbrown::{HashMap, HashSet};
use serde_json::Value;

use crate::{
    CatalogError, Result,
    collection::Collection,
    lock::LockMode,
    resource::ResourceIndex,
    txn::OperationContext,
    views::{ViewDefinition, ViewLimits, ViewStats, ViewsForDatabase},
};

pub mod publish;
mod update;

pub use publish::PublishCatalogUpdates;

/// Settings applied to every catalog created by a [`crate::CatalogStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogArgs {
    pub view_limits: ViewLimits,
    /// Profiling level of databases without explicit [`ProfileSettings`]
    pub default_profile_level: u8,
}

impl Default for CatalogArgs {
    fn default() -> Self {
        Self {
            view_limits: ViewLimits::default(),
            default_profile_level: 0,
        }
    }
}

impl From<&CatalogConfig> for CatalogArgs {
    fn from(config: &CatalogConfig) -> Self {
        Self {
            view_limits: ViewLimits {
                max_depth: config.max_view_depth,
                max_pipeline_bytes: config.max_view_pipeline_bytes,
            },
            default_profile_level: config.default_profile_level,
        }
    }
}

/// Counts of the registered collections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Collections not on an internal database and not `system.*`
    pub user_collections: usize,
    pub user_capped: usize,
    pub user_clustered: usize,
    pub internal: usize,
}

impl Stats {
    pub(crate) fn add(&mut self, collection: &Collection) {
        self.apply(collection, |count| *count += 1);
    }

    /// Undo [`Self::add`] for the same instance
    pub(crate) fn remove(&mut self, collection: &Collection) {
        self.apply(collection, |count| {
            *count = count
                .checked_sub(1)
                .expect("collection stats decremented below zero")
        });
    }

    fn apply(&mut self, collection: &Collection, f: impl Fn(&mut usize)) {
        let ns = collection.ns();
        if ns.is_on_internal_db() || ns.is_system() {
            f(&mut self.internal);
            return;
        }
        f(&mut self.user_collections);
        if collection.is_capped() {
            f(&mut self.user_capped);
        }
        if collection.is_clustered() {
            f(&mut self.user_clustered);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileSettings {
    pub level: u8,
    pub filter: Option<Value>,
}

/// How long a collection handed out for a metadata write stays valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifetimeMode {
    /// A writable clone is staged in the transaction and published when it commits
    Managed,
    /// The shared instance is returned and changed in place
    Inplace,
}

/// Whether an invalid view directory is an error when enumerating views.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewCatalogLookupBehavior {
    AllowInvalidViews,
    ValidateDurableViews,
}

/// A collection named either by namespace or by UUID within a database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamespaceStringOrUuid {
    Namespace(NamespaceString),
    Uuid {
        db: DatabaseName,
        uuid: CollectionUuid,
    },
}

impl std::fmt::Display for NamespaceStringOrUuid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Namespace(ns) => write!(f, "{ns}"),
            Self::Uuid { db, uuid } => write!(f, "{db}:{uuid}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NamespaceType {
    All,
    Collection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NonExistenceType {
    Normal,
    /// Registered in the snapshot but dropped by the current transaction
    DropPending,
}

/// An immutable snapshot of every collection and view known to the server.
///
/// Published snapshots are never changed. Writers clone the latest snapshot, mutate the clone
/// and publish it through [`crate::CatalogStore`]; the maps hold `Arc`s so a clone only copies
/// pointers.
#[derive(Debug, Clone)]
pub struct CollectionCatalog {
    catalog: HashMap<CollectionUuid, Arc<Collection>>,
    collections: HashMap<NamespaceString, Arc<Collection>>,
    ordered_collections: BTreeMap<(DatabaseName, CollectionUuid), Arc<Collection>>,
    views_for_database: HashMap<DatabaseName, ViewsForDatabase>,
    resource_information: ResourceIndex,
    stats: Stats,
    /// UUID to namespace mapping from before the catalog was closed, kept until it reopens
    shadow_catalog: Option<HashMap<CollectionUuid, NamespaceString>>,
    epoch: u64,
    /// Views created by transactions that are about to commit
    uncommitted_views: HashSet<NamespaceString>,
    database_profile_settings: HashMap<DatabaseName, ProfileSettings>,
    args: CatalogArgs,
}

impl Default for CollectionCatalog {
    fn default() -> Self {
        Self::new(CatalogArgs::default())
    }
}

impl CollectionCatalog {
    pub fn new(args: CatalogArgs) -> Self {
        Self {
            catalog: Default::default(),
            collections: Default::default(),
            ordered_collections: Default::default(),
            views_for_database: Default::default(),
            resource_information: Default::default(),
            stats: Default::default(),
            shadow_catalog: None,
            epoch: 0,
            uncommitted_views: Default::default(),
            database_profile_settings: Default::default(),
            args,
        }
    }

    pub fn args(&self) -> CatalogArgs {
        self.args
    }

    /// Incremented every time the catalog is reopened
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    pub fn lookup_collection_by_uuid_for_read(
        &self,
        op_ctx: &OperationContext,
        uuid: CollectionUuid,
    ) -> Option<Arc<Collection>> {
        let (found, staged) = op_ctx
            .uncommitted_catalog_updates()
            .lookup_collection_by_uuid(uuid);
        // a drop staged by this transaction hides the collection
        if found {
            return staged;
        }

        if let Some(collection) = op_ctx.uncommitted_collections().get_by_uuid(uuid) {
            return Some(collection);
        }

        self.lookup_committed_by_uuid(uuid)
    }

    /// Resolve `uuid` the same way as [`Self::lookup_collection_by_uuid_for_read`]
    pub fn lookup_collection_by_uuid(
        &self,
        op_ctx: &OperationContext,
        uuid: CollectionUuid,
    ) -> Option<Arc<Collection>> {
        self.lookup_collection_by_uuid_for_read(op_ctx, uuid)
    }

    /// Look up a collection that the caller is about to change.
    ///
    /// In [`LifetimeMode::Managed`] a committed collection is cloned into the transaction's
    /// staging log, which requires an exclusive lock on it, and the clone is returned. Every
    /// later lookup in the same transaction resolves to that clone.
    pub fn lookup_collection_by_uuid_for_metadata_write(
        &self,
        op_ctx: &mut OperationContext,
        mode: LifetimeMode,
        uuid: CollectionUuid,
    ) -> Option<Arc<Collection>> {
        if mode == LifetimeMode::Inplace {
            return self.lookup_collection_by_uuid(op_ctx, uuid);
        }

        let (found, staged) = op_ctx
            .uncommitted_catalog_updates()
            .lookup_collection_by_uuid(uuid);
        if found {
            return staged;
        }

        if let Some(collection) = op_ctx.uncommitted_collections().get_by_uuid(uuid) {
            let ns = collection.ns();
            assert!(
                op_ctx
                    .locker()
                    .is_collection_locked_for_mode(&ns, LockMode::IntentExclusive),
                "writing to uncommitted collection {ns} requires an intent exclusive lock"
            );
            return Some(collection);
        }

        let collection = self.lookup_committed_by_uuid(uuid)?;
        if collection.ns().is_oplog() {
            return Some(collection);
        }
        Some(Self::stage_writable_clone(op_ctx, &collection))
    }

    pub fn lookup_collection_by_namespace_for_read(
        &self,
        op_ctx: &OperationContext,
        ns: &NamespaceString,
    ) -> Option<Arc<Collection>> {
        let (found, staged) = op_ctx
            .uncommitted_catalog_updates()
            .lookup_collection_by_namespace(ns);
        if staged.is_some() {
            return staged;
        }

        // a staged drop or rename may have been followed by a create in this transaction
        if let Some(collection) = op_ctx.uncommitted_collections().get_by_namespace(ns) {
            return Some(collection);
        }

        if found {
            return None;
        }

        self.lookup_committed_by_namespace(ns)
    }

    /// Resolve `ns` the same way as [`Self::lookup_collection_by_namespace_for_read`]
    pub fn lookup_collection_by_namespace(
        &self,
        op_ctx: &OperationContext,
        ns: &NamespaceString,
    ) -> Option<Arc<Collection>> {
        self.lookup_collection_by_namespace_for_read(op_ctx, ns)
    }

    /// Namespace counterpart of [`Self::lookup_collection_by_uuid_for_metadata_write`]
    pub fn lookup_collection_by_namespace_for_metadata_write(
        &self,
        op_ctx: &mut OperationContext,
        mode: LifetimeMode,
        ns: &NamespaceString,
    ) -> Option<Arc<Collection>> {
        if mode == LifetimeMode::Inplace || ns.is_oplog() {
            return self.lookup_collection_by_namespace(op_ctx, ns);
        }

        let (found, staged) = op_ctx
            .uncommitted_catalog_updates()
            .lookup_collection_by_namespace(ns);
        if staged.is_some() {
            return staged;
        }

        if let Some(collection) = op_ctx.uncommitted_collections().get_by_namespace(ns) {
            assert!(
                op_ctx
                    .locker()
                    .is_collection_locked_for_mode(ns, LockMode::IntentExclusive),
                "writing to uncommitted collection {ns} requires an intent exclusive lock"
            );
            return Some(collection);
        }

        if found {
            return None;
        }

        let collection = self.lookup_committed_by_namespace(ns)?;
        Some(Self::stage_writable_clone(op_ctx, &collection))
    }

    fn stage_writable_clone(
        op_ctx: &mut OperationContext,
        collection: &Collection,
    ) -> Arc<Collection> {
        let ns = collection.ns();
        assert!(
            op_ctx
                .locker()
                .is_collection_locked_for_mode(&ns, LockMode::Exclusive),
            "writable collection {ns} requires an exclusive lock"
        );
        let cloned = Arc::new(collection.clone_for_write());
        op_ctx
            .uncommitted_catalog_updates_mut()
            .writable_collection(Arc::clone(&cloned));
        PublishCatalogUpdates::ensure_registered_with_recovery_unit(op_ctx);
        cloned
    }

    pub fn lookup_nss_by_uuid(
        &self,
        op_ctx: &OperationContext,
        uuid: CollectionUuid,
    ) -> Option<NamespaceString> {
        let (found, staged) = op_ctx
            .uncommitted_catalog_updates()
            .lookup_collection_by_uuid(uuid);
        if found {
            return staged.map(|c| c.ns());
        }

        if let Some(collection) = op_ctx.uncommitted_collections().get_by_uuid(uuid) {
            return Some(collection.ns());
        }

        if let Some(collection) = self.catalog.get(&uuid) {
            return collection.is_committed().then(|| collection.ns());
        }

        // while the catalog is closed, unknown UUIDs resolve through the pre-close state
        self.shadow_catalog
            .as_ref()
            .and_then(|shadow| shadow.get(&uuid).cloned())
    }

    pub fn lookup_uuid_by_nss(
        &self,
        op_ctx: &OperationContext,
        ns: &NamespaceString,
    ) -> Option<CollectionUuid> {
        let (found, staged) = op_ctx
            .uncommitted_catalog_updates()
            .lookup_collection_by_namespace(ns);
        if let Some(staged) = staged {
            return Some(staged.uuid());
        }

        if let Some(collection) = op_ctx.uncommitted_collections().get_by_namespace(ns) {
            return Some(collection.uuid());
        }

        if found {
            return None;
        }

        self.lookup_committed_by_namespace(ns).map(|c| c.uuid())
    }

    /// Registered, but its creating transaction has not committed yet
    pub fn is_collection_awaiting_visibility(&self, uuid: CollectionUuid) -> bool {
        self.catalog
            .get(&uuid)
            .is_some_and(|collection| !collection.is_committed())
    }

    fn lookup_committed_by_uuid(&self, uuid: CollectionUuid) -> Option<Arc<Collection>> {
        self.catalog
            .get(&uuid)
            .filter(|collection| collection.is_committed())
            .map(Arc::clone)
    }

    fn lookup_committed_by_namespace(&self, ns: &NamespaceString) -> Option<Arc<Collection>> {
        self.collections
            .get(ns)
            .filter(|collection| collection.is_committed())
            .map(Arc::clone)
    }

    /// Committed collections of `db` in UUID order
    pub fn collections_in_db<'a>(
        &'a self,
        db: &DatabaseName,
    ) -> impl Iterator<Item = &'a Arc<Collection>> + 'a {
        self.ordered_collections
            .range((db.clone(), CollectionUuid::MIN)..=(db.clone(), CollectionUuid::MAX))
            .map(|(_, collection)| collection)
            .filter(|collection| collection.is_committed())
    }

    pub fn get_all_collection_uuids_from_db(&self, db: &DatabaseName) -> Vec<CollectionUuid> {
        self.collections_in_db(db).map(|c| c.uuid()).collect()
    }

    pub fn get_all_collection_names_from_db(
        &self,
        op_ctx: &OperationContext,
        db: &DatabaseName,
    ) -> Vec<NamespaceString> {
        assert!(
            op_ctx.locker().is_db_locked_for_mode(db, LockMode::Shared),
            "listing collections of {db} requires a shared database lock"
        );
        self.collections_in_db(db).map(|c| c.ns()).collect()
    }

    /// Databases with at least one committed collection, in order
    pub fn get_all_db_names(&self) -> Vec<DatabaseName> {
        let mut names: Vec<DatabaseName> = self
            .ordered_collections
            .iter()
            .filter(|(_, collection)| collection.is_committed())
            .map(|((db, _), _)| db.clone())
            .collect();
        names.dedup();
        names
    }

    /// Views of `db` as seen by `op_ctx`: its staged replacement if there is one
    fn get_views_for_database<'a>(
        &'a self,
        op_ctx: &'a OperationContext,
        db: &DatabaseName,
    ) -> Option<&'a ViewsForDatabase> {
        op_ctx
            .uncommitted_catalog_updates()
            .views_for_database(db)
            .or_else(|| self.views_for_database.get(db))
    }

    /// Call `callback` for every view of `db` until it returns `false`
    pub fn iterate_views(
        &self,
        op_ctx: &OperationContext,
        db: &DatabaseName,
        mut callback: impl FnMut(&ViewDefinition) -> bool,
        behavior: ViewCatalogLookupBehavior,
    ) -> Result<()> {
        let Some(views) = self.get_views_for_database(op_ctx, db) else {
            return Ok(());
        };
        if behavior != ViewCatalogLookupBehavior::AllowInvalidViews {
            views.require_valid_catalog()?;
        }
        for view in views.views() {
            if !callback(view) {
                break;
            }
        }
        Ok(())
    }

    /// Fails if the view directory of the database is invalid and `ns` is a valid name
    pub fn lookup_view(
        &self,
        op_ctx: &OperationContext,
        ns: &NamespaceString,
    ) -> Result<Option<Arc<ViewDefinition>>> {
        let Some(views) = self.get_views_for_database(op_ctx, ns.db()) else {
            return Ok(None);
        };
        if !views.valid() {
            if !NamespaceString::valid_collection_name(ns.coll()) {
                return Ok(None);
            }
            views.require_valid_catalog()?;
        }
        Ok(views.lookup(ns))
    }

    pub fn lookup_view_without_validating_durable(
        &self,
        op_ctx: &OperationContext,
        ns: &NamespaceString,
    ) -> Option<Arc<ViewDefinition>> {
        self.get_views_for_database(op_ctx, ns.db())?.lookup(ns)
    }

    pub fn resolve_namespace_string_or_uuid(
        &self,
        op_ctx: &OperationContext,
        ns_or_uuid: NamespaceStringOrUuid,
    ) -> Result<NamespaceString> {
        let (db, uuid) = match ns_or_uuid {
            NamespaceStringOrUuid::Namespace(ns) => {
                if !ns.is_valid() {
                    return Err(CatalogError::InvalidNamespace(format!(
                        "Namespace {ns} is not a valid collection name"
                    )));
                }
                return Ok(ns);
            }
            NamespaceStringOrUuid::Uuid { db, uuid } => (db, uuid),
        };

        let display = NamespaceStringOrUuid::Uuid {
            db: db.clone(),
            uuid,
        };
        let resolved = self
            .lookup_nss_by_uuid(op_ctx, uuid)
            .filter(|ns| ns.is_valid())
            .ok_or_else(|| {
                CatalogError::NamespaceNotFound(format!("Unable to resolve {display}"))
            })?;

        if resolved.db() != &db {
            return Err(CatalogError::NamespaceNotFound(format!(
                "UUID {display} specified in {db} resolved to a collection in a different \
                 database: {resolved}"
            )));
        }
        Ok(resolved)
    }

    /// Apply `predicate` to the registered collection, committed or not
    pub fn check_if_collection_satisfiable(
        &self,
        uuid: CollectionUuid,
        predicate: impl FnOnce(&Collection) -> bool,
    ) -> bool {
        self.catalog
            .get(&uuid)
            .is_some_and(|collection| predicate(collection))
    }

    pub fn view_stats_for_database(
        &self,
        op_ctx: &OperationContext,
        db: &DatabaseName,
    ) -> Option<ViewStats> {
        self.get_views_for_database(op_ctx, db)
            .map(|views| views.stats())
    }

    /// Databases that have been opened, whether or not they contain views
    pub fn view_catalog_db_names(&self) -> Vec<DatabaseName> {
        let mut names: Vec<_> = self.views_for_database.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn set_database_profile_settings(&mut self, db: &DatabaseName, settings: ProfileSettings) {
        self.database_profile_settings.insert(db.clone(), settings);
    }

    pub fn get_database_profile_settings(&self, db: &DatabaseName) -> ProfileSettings {
        self.database_profile_settings
            .get(db)
            .cloned()
            .unwrap_or_else(|| ProfileSettings {
                level: self.args.default_profile_level,
                filter: None,
            })
    }

    pub fn clear_database_profile_settings(&mut self, db: &DatabaseName) {
        self.database_profile_settings.remove(db);
    }

    /// The single name registered under `rid`, or `None` if it is unknown or ambiguous
    pub fn lookup_resource_name(&self, rid: ResourceId) -> Option<&str> {
        self.resource_information.lookup_resource_name(rid)
    }

    pub fn add_resource(&mut self, rid: ResourceId, name: impl Into<String>) {
        self.resource_information.add_resource(rid, name);
    }

    pub fn remove_resource(&mut self, rid: ResourceId, name: &str) {
        self.resource_information.remove_resource(rid, name);
    }

    /// Run `f` with reloads of the views of `db` suppressed for the current transaction
    pub fn with_ignored_external_view_changes<T>(
        op_ctx: &mut OperationContext,
        db: &DatabaseName,
        f: impl FnOnce(&mut OperationContext) -> T,
    ) -> T {
        op_ctx
            .uncommitted_catalog_updates_mut()
            .set_ignore_external_view_changes(db, true);
        let res = f(op_ctx);
        op_ctx
            .uncommitted_catalog_updates_mut()
            .set_ignore_external_view_changes(db, false);
        res
    }
}
