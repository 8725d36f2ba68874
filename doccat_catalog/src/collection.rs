//! The catalog's view of a single collection.
use doccat_id::{CollectionUuid, NamespaceString};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionOptions {
    pub capped: bool,
    pub max_size_bytes: Option<u64>,
    pub clustered: bool,
    pub temp: bool,
}

/// A collection registered in, or staged for, the catalog.
///
/// Instances reachable from a published snapshot are shared by every reader of that snapshot. A
/// transaction that needs to change one first asks for a writable clone via
/// [`Collection::clone_for_write`], which keeps the UUID but is otherwise independent, and mutates
/// that clone through the interior locks until it is published.
#[derive(Debug)]
pub struct Collection {
    uuid: CollectionUuid,
    ns: RwLock<NamespaceString>,
    committed: AtomicBool,
    options: RwLock<CollectionOptions>,
}

impl Collection {
    pub fn new(uuid: CollectionUuid, ns: NamespaceString, options: CollectionOptions) -> Self {
        Self {
            uuid,
            ns: RwLock::new(ns),
            committed: AtomicBool::new(true),
            options: RwLock::new(options),
        }
    }

    pub fn uuid(&self) -> CollectionUuid {
        self.uuid
    }

    pub fn ns(&self) -> NamespaceString {
        self.ns.read().clone()
    }

    pub fn set_ns(&self, ns: NamespaceString) {
        *self.ns.write() = ns;
    }

    /// Whether the collection is visible outside of the transaction that created it
    pub fn is_committed(&self) -> bool {
        self.committed.load(Ordering::Acquire)
    }

    pub fn set_committed(&self, committed: bool) {
        self.committed.store(committed, Ordering::Release);
    }

    pub fn is_capped(&self) -> bool {
        self.options.read().capped
    }

    pub fn is_clustered(&self) -> bool {
        self.options.read().clustered
    }

    pub fn options(&self) -> CollectionOptions {
        *self.options.read()
    }

    pub fn update_options(&self, f: impl FnOnce(&mut CollectionOptions)) {
        f(&mut self.options.write())
    }

    pub fn clone_for_write(&self) -> Self {
        Self {
            uuid: self.uuid,
            ns: RwLock::new(self.ns()),
            committed: AtomicBool::new(self.is_committed()),
            options: RwLock::new(self.options()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writable_clone_is_independent() {
        let ns = NamespaceString::parse(None, "db.coll").unwrap();
        let original = Collection::new(CollectionUuid::new(), ns.clone(), Default::default());
        let clone = original.clone_for_write();
        clone.set_ns(NamespaceString::parse(None, "db.other").unwrap());
        clone.update_options(|o| o.capped = true);

        assert_eq!(clone.uuid(), original.uuid());
        assert_eq!(original.ns(), ns);
        assert!(!original.is_capped());
        assert!(clone.is_capped());
    }
}
