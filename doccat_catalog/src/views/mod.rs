//! Per-database view directory.
use crate::{CatalogError, Result};
use doccat_clap_blocks::catalog::{DEFAULT_MAX_VIEW_DEPTH, DEFAULT_MAX_VIEW_PIPELINE_BYTES};
use doccat_id::{DatabaseName, NamespaceString};
use hashbrown::HashMap;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

mod definition;
mod durable;
mod graph;

pub use definition::{Collation, ViewDefinition, ViewDocument};
pub use durable::{DurableViewCatalog, InMemoryDurableViewCatalog};
pub use graph::ViewGraph;

/// Validates a view's pipeline and returns every namespace it reads from besides `viewOn`.
pub type PipelineValidatorFn = dyn Fn(&ViewDefinition) -> Result<BTreeSet<NamespaceString>>;

/// Limits on chains of views defined on other views.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewLimits {
    pub max_depth: usize,
    pub max_pipeline_bytes: usize,
}

impl Default for ViewLimits {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_VIEW_DEPTH,
            max_pipeline_bytes: DEFAULT_MAX_VIEW_PIPELINE_BYTES,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ViewStats {
    pub user_views: usize,
    pub user_timeseries: usize,
    pub internal: usize,
}

/// A [`PipelineValidatorFn`] that accepts any pipeline and collects the collections named by
/// `$lookup`, `$graphLookup` and `$unionWith` stages.
pub fn collect_involved_namespaces(view: &ViewDefinition) -> Result<BTreeSet<NamespaceString>> {
    let db = view.name().db();
    let mut involved = BTreeSet::new();
    for stage in view.pipeline() {
        let Value::Object(stage) = stage else {
            return Err(CatalogError::InvalidViewPipeline {
                view: view.name().clone(),
                reason: format!("pipeline stage must be an object, got {stage}"),
            });
        };
        for (name, spec) in stage {
            let from = match (name.as_str(), spec) {
                ("$lookup" | "$graphLookup", Value::Object(spec)) => spec.get("from"),
                ("$unionWith", Value::String(_)) => Some(spec),
                ("$unionWith", Value::Object(spec)) => spec.get("coll"),
                _ => None,
            };
            if let Some(Value::String(coll)) = from {
                involved.insert(NamespaceString::new(db.clone(), coll.as_str()));
            }
        }
    }
    Ok(involved)
}

/// The views of one database: parsed definitions, their dependency graph and the handle to the
/// durable definitions they were loaded from.
///
/// Values stored in a published catalog are never modified; changes are made to a clone which is
/// staged and published as a whole.
#[derive(Debug, Clone)]
pub struct ViewsForDatabase {
    durable: Arc<dyn DurableViewCatalog>,
    view_map: HashMap<NamespaceString, Arc<ViewDefinition>>,
    view_graph: ViewGraph,
    valid: bool,
    view_graph_needs_refresh: bool,
    stats: ViewStats,
}

impl ViewsForDatabase {
    pub fn new(durable: Arc<dyn DurableViewCatalog>) -> Self {
        Self {
            durable,
            view_map: Default::default(),
            view_graph: Default::default(),
            valid: false,
            view_graph_needs_refresh: true,
            stats: Default::default(),
        }
    }

    /// Create and load the views of `db` from `durable`
    pub fn load(durable: Arc<dyn DurableViewCatalog>) -> Result<Self> {
        let mut views = Self::new(durable);
        views.reload()?;
        Ok(views)
    }

    pub fn db(&self) -> DatabaseName {
        self.durable.name().db().clone()
    }

    pub fn durable(&self) -> &Arc<dyn DurableViewCatalog> {
        &self.durable
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    pub fn view_graph_needs_refresh(&self) -> bool {
        self.view_graph_needs_refresh
    }

    pub fn stats(&self) -> ViewStats {
        self.stats
    }

    pub fn view_graph(&self) -> &ViewGraph {
        &self.view_graph
    }

    pub fn len(&self) -> usize {
        self.view_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.view_map.is_empty()
    }

    pub fn views(&self) -> impl Iterator<Item = &Arc<ViewDefinition>> {
        self.view_map.values()
    }

    pub fn lookup(&self, ns: &NamespaceString) -> Option<Arc<ViewDefinition>> {
        self.view_map.get(ns).map(Arc::clone)
    }

    pub fn require_valid_catalog(&self) -> Result<()> {
        if self.valid {
            return Ok(());
        }
        Err(CatalogError::InvalidViewDefinition {
            db: self.db(),
            reason: "the view catalog contains invalid definitions; remove them from \
                     system.views to continue"
                .to_string(),
        })
    }

    /// Forget every loaded definition. The next reload or graph update rebuilds from scratch.
    pub fn invalidate(&mut self) {
        self.view_map.clear();
        self.valid = false;
        self.view_graph_needs_refresh = true;
        self.stats = ViewStats::default();
    }

    /// Drop every definition and mark the (now empty) directory as valid
    pub fn clear(&mut self) {
        self.view_map.clear();
        self.view_graph.clear();
        self.valid = true;
        self.view_graph_needs_refresh = false;
        self.stats = ViewStats::default();
    }

    /// Rebuild the view map from the durable definitions.
    ///
    /// Leaves the directory invalid if any stored definition cannot be parsed.
    pub fn reload(&mut self) -> Result<()> {
        self.invalidate();
        let db = self.db();
        let durable = Arc::clone(&self.durable);
        let res = durable.iterate(&mut |document| self.insert(&db, document));
        if let Err(error) = res {
            warn!(%db, %error, "could not load view catalog for database");
            return Err(error);
        }
        debug!(%db, views = self.view_map.len(), "loaded view catalog");
        self.valid = true;
        Ok(())
    }

    fn insert(&mut self, db: &DatabaseName, document: &Value) -> Result<()> {
        let document: ViewDocument =
            serde_json::from_value(document.clone()).map_err(|e| {
                CatalogError::InvalidViewDefinition {
                    db: db.clone(),
                    reason: e.to_string(),
                }
            })?;
        let view = document.into_definition(db)?;

        if view.name().is_system() {
            self.stats.internal += 1;
        } else if view.is_timeseries() {
            self.stats.user_timeseries += 1;
        } else {
            self.stats.user_views += 1;
        }
        self.view_map.insert(view.name().clone(), Arc::new(view));
        Ok(())
    }

    /// Insert or replace `view` in the dependency graph, validating the resulting graph.
    ///
    /// If the graph is stale it is first rebuilt, without validation, from the loaded views.
    pub fn upsert_into_graph(
        &mut self,
        view: &ViewDefinition,
        validator: &PipelineValidatorFn,
        limits: ViewLimits,
    ) -> Result<()> {
        if self.view_graph_needs_refresh {
            self.view_graph.clear();
            let loaded: Vec<_> = self.view_map.values().map(Arc::clone).collect();
            for existing in loaded {
                self.insert_into_graph(&existing, validator, limits, false)?;
            }
            self.view_graph_needs_refresh = false;
        }

        self.view_graph.remove(view.name());
        self.insert_into_graph(view, validator, limits, true)
    }

    fn insert_into_graph(
        &mut self,
        view: &ViewDefinition,
        validator: &PipelineValidatorFn,
        limits: ViewLimits,
        needs_validation: bool,
    ) -> Result<()> {
        let mut refs = match validator(view) {
            Ok(refs) => refs,
            Err(error) if needs_validation => return Err(error),
            Err(error) => {
                // stored definitions that no longer validate are left out of the graph
                debug!(view = %view.name(), %error, "skipping view with invalid pipeline");
                return Ok(());
            }
        };
        refs.insert(view.view_on().clone());
        let pipeline_size = view.pipeline_size();

        if needs_validation {
            self.validate_collation(view, &refs)?;
            self.view_graph
                .insert_and_validate(view, &refs, pipeline_size, limits)
        } else {
            self.view_graph
                .insert_without_validating(view, &refs, pipeline_size);
            Ok(())
        }
    }

    /// Every view `view` reads from must use the same collation
    fn validate_collation(
        &self,
        view: &ViewDefinition,
        refs: &BTreeSet<NamespaceString>,
    ) -> Result<()> {
        for r in refs {
            let Some(other) = self.view_map.get(r) else {
                continue;
            };
            if other.collation() != view.collation() {
                return Err(CatalogError::OptionNotSupportedOnView(format!(
                    "View {} has conflicting collation with view {}",
                    view.name(),
                    other.name()
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn remove_view(&mut self, ns: &NamespaceString) {
        self.view_graph.remove(ns);
        self.view_map.remove(ns);
        self.stats = ViewStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn durable() -> Arc<InMemoryDurableViewCatalog> {
        Arc::new(InMemoryDurableViewCatalog::new(DatabaseName::new("db")))
    }

    #[test_log::test]
    fn reload_counts_views() {
        let durable = durable();
        durable.insert_raw(
            "db.v",
            json!({"_id": "db.v", "viewOn": "coll", "pipeline": []}),
        );
        durable.insert_raw(
            "db.weather",
            json!({"_id": "db.weather", "viewOn": "system.buckets.weather", "pipeline": []}),
        );
        durable.insert_raw(
            "db.system.profile_view",
            json!({"_id": "db.system.profile_view", "viewOn": "coll", "pipeline": []}),
        );

        let views = ViewsForDatabase::load(Arc::<InMemoryDurableViewCatalog>::clone(&durable)).unwrap();
        assert!(views.valid());
        assert_eq!(
            views.stats(),
            ViewStats {
                user_views: 1,
                user_timeseries: 1,
                internal: 1
            }
        );
        let ns = NamespaceString::new(DatabaseName::new("db"), "v");
        assert_eq!(views.lookup(&ns).unwrap().view_on().coll(), "coll");
    }

    #[test_log::test]
    fn invalid_document_leaves_catalog_invalid() {
        let durable = durable();
        durable.insert_raw("db.bad", json!({"_id": "db.bad", "pipeline": "nope"}));

        let mut views = ViewsForDatabase::new(Arc::<InMemoryDurableViewCatalog>::clone(&durable));
        let err = views.reload().unwrap_err();
        assert!(matches!(err, CatalogError::InvalidViewDefinition { .. }));
        assert!(!views.valid());
        assert!(views.require_valid_catalog().is_err());
    }

    #[test]
    fn stale_graph_is_rebuilt_before_validation() {
        let durable = durable();
        durable.insert_raw(
            "db.a",
            json!({"_id": "db.a", "viewOn": "b", "pipeline": []}),
        );
        let mut views = ViewsForDatabase::load(Arc::<InMemoryDurableViewCatalog>::clone(&durable)).unwrap();
        assert!(views.view_graph_needs_refresh());

        let db = DatabaseName::new("db");
        let b = ViewDefinition::new(
            NamespaceString::new(db.clone(), "b"),
            NamespaceString::new(db, "a"),
            vec![],
            None,
        );
        let err = views
            .upsert_into_graph(&b, &collect_involved_namespaces, ViewLimits::default())
            .unwrap_err();
        assert!(matches!(err, CatalogError::GraphContainsCycle(_)), "{err}");
        assert!(!views.view_graph_needs_refresh());
    }

    #[test]
    fn involved_namespaces() {
        let db = DatabaseName::new("db");
        let view = ViewDefinition::new(
            NamespaceString::new(db.clone(), "v"),
            NamespaceString::new(db.clone(), "coll"),
            vec![
                json!({"$lookup": {"from": "other", "as": "o"}}),
                json!({"$unionWith": "third"}),
                json!({"$match": {}}),
            ],
            None,
        );
        let involved = collect_involved_namespaces(&view).unwrap();
        assert_eq!(
            involved.into_iter().map(|ns| ns.coll().to_string()).collect::<Vec<_>>(),
            vec!["other".to_string(), "third".to_string()]
        );
    }
}
