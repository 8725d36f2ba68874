//! Publishing a transaction's staged catalog changes when it commits.
use doccat_id::{ResourceId, ResourceType, Timestamp};
use tracing::debug;

use super::CollectionCatalog;
use crate::{
    Result,
    txn::{Change, OperationContext},
    uncommitted::{Action, Entry, UncommittedCatalogUpdates},
};

type EntryJob = Box<dyn FnOnce(&mut CollectionCatalog) -> Result<()> + Send>;

/// Applies every entry of the staging log to the catalog in a single write, so no reader can
/// observe part of a transaction. Empties the log on commit and on rollback.
#[derive(Debug, Default, Clone, Copy)]
pub struct PublishCatalogUpdates;

impl PublishCatalogUpdates {
    /// Register with the recovery unit of `op_ctx` unless already registered
    pub fn ensure_registered_with_recovery_unit(op_ctx: &mut OperationContext) {
        let recovery_unit = op_ctx.recovery_unit_mut();
        if recovery_unit.has_registered_change_for_catalog_visibility() {
            return;
        }
        recovery_unit.register_change_for_catalog_visibility(Box::new(Self));
    }

    fn job_for(entry: Entry) -> EntryJob {
        match entry.action {
            Action::WritableCollection => {
                let collection = entry.collection.unwrap_or_else(|| {
                    panic!("writable entry for {} without collection", entry.nss)
                });
                Box::new(move |catalog| {
                    catalog.publish_writable_collection(collection);
                    Ok(())
                })
            }
            Action::RenamedCollection => {
                let from = entry.nss;
                let to = entry
                    .rename_to
                    .unwrap_or_else(|| panic!("rename entry for {from} without target"));
                // the writable entry of the renamed collection has already moved it
                Box::new(move |catalog| {
                    let from = from.ns();
                    let to = to.ns();
                    catalog
                        .remove_resource(ResourceId::new(ResourceType::Collection, &from), &from);
                    catalog.add_resource(ResourceId::new(ResourceType::Collection, &to), to);
                    Ok(())
                })
            }
            Action::DroppedCollection => {
                let uuid = entry
                    .uuid()
                    .unwrap_or_else(|| panic!("drop entry for {} without uuid", entry.nss));
                Box::new(move |catalog| {
                    catalog.deregister_collection(uuid);
                    Ok(())
                })
            }
            Action::RecreatedCollection => {
                let uuid = entry
                    .external_uuid
                    .unwrap_or_else(|| panic!("recreate entry for {} without uuid", entry.nss));
                let collection = entry.collection.unwrap_or_else(|| {
                    panic!("recreate entry for {} without collection", entry.nss)
                });
                Box::new(move |catalog| {
                    // the staging log has been released, so this can never be deferred again
                    catalog.register_collection(
                        &mut UncommittedCatalogUpdates::default(),
                        uuid,
                        collection,
                    )
                })
            }
            Action::ReplacedViewsForDatabase => {
                let db = entry.nss.db().clone();
                let views = entry
                    .views_for_db
                    .unwrap_or_else(|| panic!("replaced views entry for {db} without views"));
                Box::new(move |catalog| {
                    catalog.replace_views_for_database(&db, views);
                    Ok(())
                })
            }
            Action::AddViewResource => {
                let view = entry.nss;
                Box::new(move |catalog| {
                    let name = view.ns();
                    catalog.add_resource(ResourceId::new(ResourceType::Collection, &name), name);
                    catalog.deregister_uncommitted_view(&view);
                    Ok(())
                })
            }
            Action::RemoveViewResource => {
                let view = entry.nss;
                Box::new(move |catalog| {
                    let name = view.ns();
                    catalog
                        .remove_resource(ResourceId::new(ResourceType::Collection, &name), &name);
                    Ok(())
                })
            }
        }
    }
}

impl Change for PublishCatalogUpdates {
    fn commit(
        self: Box<Self>,
        op_ctx: &mut OperationContext,
        commit_time: Option<Timestamp>,
    ) -> Result<()> {
        let entries = op_ctx.uncommitted_catalog_updates_mut().release_entries();
        if entries.is_empty() {
            return Ok(());
        }
        debug!(
            entries = entries.len(),
            commit_time = commit_time.map(|t| t.as_u64()),
            "publishing catalog updates"
        );

        let jobs: Vec<EntryJob> = entries.into_iter().map(Self::job_for).collect();
        op_ctx.write_catalog(move |catalog| jobs.into_iter().try_for_each(|job| job(catalog)))
    }

    fn rollback(self: Box<Self>, op_ctx: &mut OperationContext) {
        op_ctx.uncommitted_catalog_updates_mut().release_entries();
    }
}
