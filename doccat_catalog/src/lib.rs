//! A transactional catalog of collections and views.
//!
//! Readers pin an immutable [`CollectionCatalog`] snapshot and are never blocked. Writers stage
//! their changes in the per-transaction [`UncommittedCatalogUpdates`] log of an
//! [`OperationContext`]; on commit the staged entries are applied to a fresh clone of the latest
//! snapshot by the serialized, batching writer in [`CatalogStore`] and published atomically.
use doccat_id::{DatabaseName, NamespaceString};

pub mod catalog;
pub mod collection;
pub mod lock;
pub mod resource;
pub mod store;
pub mod txn;
pub mod uncommitted;
pub mod views;

pub use catalog::{
    CatalogArgs, CollectionCatalog, LifetimeMode, NamespaceStringOrUuid, ProfileSettings,
    PublishCatalogUpdates, Stats, ViewCatalogLookupBehavior,
};
pub use collection::{Collection, CollectionOptions};
pub use lock::{LockMode, LockState, Locker};
pub use store::{BatchedCatalogWriter, CatalogStore, CatalogWriteFn};
pub use txn::{Change, OperationContext, RecoveryUnit};
pub use uncommitted::{UncommittedCatalogUpdates, UncommittedCollections};
pub use views::{ViewDefinition, ViewLimits, ViewsForDatabase};

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum CatalogError {
    #[error("write conflict: {0}")]
    WriteConflict(String),

    #[error("namespace already exists: {0}")]
    NamespaceExists(NamespaceString),

    #[error("{0}")]
    NamespaceNotFound(String),

    #[error("{0}")]
    BadValue(String),

    #[error("{0}")]
    InvalidNamespace(String),

    #[error("failed to parse collation: {0}")]
    FailedToParseCollation(String),

    #[error("view cycle detected: {0}")]
    GraphContainsCycle(String),

    #[error("view depth too deep for view {view}; maximum depth is {max_depth}")]
    ViewDepthLimitExceeded {
        view: NamespaceString,
        max_depth: usize,
    },

    #[error(
        "view pipeline for {view} is too large ({size} bytes); the maximum combined pipeline size is {max_bytes} bytes"
    )]
    ViewPipelineMaxSizeExceeded {
        view: NamespaceString,
        size: usize,
        max_bytes: usize,
    },

    #[error("{0}")]
    OptionNotSupportedOnView(String),

    #[error("invalid view definition in database {db}: {reason}")]
    InvalidViewDefinition { db: DatabaseName, reason: String },

    #[error("invalid pipeline for view {view}: {reason}")]
    InvalidViewPipeline { view: NamespaceString, reason: String },

    #[error("database {0} is already initialized")]
    AlreadyInitialized(DatabaseName),

    #[error("durable view catalog error: {0}")]
    DurableViewCatalog(String),
}

impl CatalogError {
    pub fn write_conflict(reason: impl Into<String>) -> Self {
        Self::WriteConflict(reason.into())
    }

    /// Only write conflicts mean "retry the transaction from the beginning"
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::WriteConflict(_))
    }
}

pub type Result<T, E = CatalogError> = std::result::Result<T, E>;

#[cfg(test)]
pub(crate) mod test_util;
