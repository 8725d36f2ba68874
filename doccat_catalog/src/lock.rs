//! The lock service as seen by the catalog.
//!
//! The catalog never acquires locks itself. It only checks that callers hold the locks its
//! operations require, and treats a missing lock as a programming error.
use doccat_id::{DatabaseName, NamespaceString};
use hashbrown::HashMap;
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    IntentShared,
    IntentExclusive,
    Shared,
    Exclusive,
}

impl LockMode {
    /// Whether holding `self` satisfies a requirement for `required`
    pub fn covers(self, required: Self) -> bool {
        use LockMode::*;
        match self {
            Exclusive => true,
            Shared => matches!(required, IntentShared | Shared),
            IntentExclusive => matches!(required, IntentShared | IntentExclusive),
            IntentShared => required == IntentShared,
        }
    }
}

pub trait Locker: std::fmt::Debug + Send + Sync {
    fn global_mode(&self) -> Option<LockMode>;

    fn db_mode(&self, db: &DatabaseName) -> Option<LockMode>;

    fn collection_mode(&self, ns: &NamespaceString) -> Option<LockMode>;

    /// Holding the global lock exclusively
    fn is_w(&self) -> bool {
        self.global_mode() == Some(LockMode::Exclusive)
    }

    fn is_db_locked_for_mode(&self, db: &DatabaseName, mode: LockMode) -> bool {
        if self.is_w() {
            return true;
        }
        self.db_mode(db).is_some_and(|held| held.covers(mode))
    }

    /// A collection counts as locked when its database is locked strongly enough to cover it
    fn is_collection_locked_for_mode(&self, ns: &NamespaceString, mode: LockMode) -> bool {
        if self.is_w() {
            return true;
        }
        match self.db_mode(ns.db()) {
            Some(LockMode::Exclusive) => return true,
            Some(LockMode::Shared) if LockMode::Shared.covers(mode) => return true,
            _ => (),
        }
        self.collection_mode(ns).is_some_and(|held| held.covers(mode))
    }
}

/// Records the lock modes an operation has been granted.
#[derive(Debug, Default)]
pub struct LockState {
    global: Mutex<Option<LockMode>>,
    dbs: Mutex<HashMap<DatabaseName, LockMode>>,
    collections: Mutex<HashMap<NamespaceString, LockMode>>,
}

impl LockState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_global(&self, mode: LockMode) {
        *self.global.lock() = Some(mode);
    }

    pub fn unlock_global(&self) {
        *self.global.lock() = None;
    }

    pub fn lock_db(&self, db: &DatabaseName, mode: LockMode) {
        self.dbs.lock().insert(db.clone(), mode);
    }

    pub fn unlock_db(&self, db: &DatabaseName) {
        self.dbs.lock().remove(db);
    }

    pub fn lock_collection(&self, ns: &NamespaceString, mode: LockMode) {
        self.collections.lock().insert(ns.clone(), mode);
    }

    pub fn unlock_collection(&self, ns: &NamespaceString) {
        self.collections.lock().remove(ns);
    }
}

impl Locker for LockState {
    fn global_mode(&self) -> Option<LockMode> {
        *self.global.lock()
    }

    fn db_mode(&self, db: &DatabaseName) -> Option<LockMode> {
        self.dbs.lock().get(db).copied()
    }

    fn collection_mode(&self, ns: &NamespaceString) -> Option<LockMode> {
        self.collections.lock().get(ns).copied()
    }
}
