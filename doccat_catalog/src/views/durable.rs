use super::ViewDocument;
use crate::{CatalogError, Result};
use doccat_id::{DatabaseName, NamespaceString};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Persistent storage of the view definitions of one database.
pub trait DurableViewCatalog: std::fmt::Debug + Send + Sync {
    /// The `<db>.system.views` namespace backing this catalog
    fn name(&self) -> NamespaceString;

    fn upsert(&self, view: &NamespaceString, document: &ViewDocument) -> Result<()>;

    fn remove(&self, view: &NamespaceString) -> Result<()>;

    /// Call `callback` for every stored definition, stopping at the first error
    fn iterate(&self, callback: &mut dyn FnMut(&Value) -> Result<()>) -> Result<()>;
}

/// A [`DurableViewCatalog`] that keeps its documents in memory.
#[derive(Debug)]
pub struct InMemoryDurableViewCatalog {
    db: DatabaseName,
    documents: RwLock<BTreeMap<String, Value>>,
    writes: AtomicUsize,
}

impl InMemoryDurableViewCatalog {
    pub fn new(db: DatabaseName) -> Self {
        Self {
            db,
            documents: Default::default(),
            writes: AtomicUsize::new(0),
        }
    }

    /// Store a raw document, bypassing all validation, as an external writer to the views
    /// collection would
    pub fn insert_raw(&self, id: impl Into<String>, document: Value) {
        self.documents.write().insert(id.into(), document);
    }

    pub fn get(&self, view: &NamespaceString) -> Option<Value> {
        self.documents.read().get(&view.ns()).cloned()
    }

    pub fn len(&self) -> usize {
        self.documents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.read().is_empty()
    }

    /// Number of upserts and removes performed through the trait
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }
}

impl DurableViewCatalog for InMemoryDurableViewCatalog {
    fn name(&self) -> NamespaceString {
        NamespaceString::system_views(&self.db)
    }

    fn upsert(&self, view: &NamespaceString, document: &ViewDocument) -> Result<()> {
        let value = serde_json::to_value(document)
            .map_err(|e| CatalogError::DurableViewCatalog(e.to_string()))?;
        self.documents.write().insert(view.ns(), value);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn remove(&self, view: &NamespaceString) -> Result<()> {
        self.documents.write().remove(&view.ns());
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn iterate(&self, callback: &mut dyn FnMut(&Value) -> Result<()>) -> Result<()> {
        let documents = self.documents.read().clone();
        documents.values().try_for_each(callback)
    }
}
