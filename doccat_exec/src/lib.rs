//! Query execution stages that write through the catalog.
//!
//! Currently this is the [`BatchedDeleteStage`], which groups the deletions produced by a child
//! stage into batches and retries a batch after a write conflict.
use doccat_catalog::CatalogError;

pub mod batched_delete;
pub mod metrics;
pub mod params;

pub use batched_delete::BatchedDeleteStage;
pub use params::BatchedDeleteParams;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ExecError {
    #[error("write conflict: {0}")]
    WriteConflict(String),

    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("invalid batch parameters: {0}")]
    InvalidBatchParams(String),
}

impl ExecError {
    pub fn write_conflict(reason: impl Into<String>) -> Self {
        Self::WriteConflict(reason.into())
    }

    /// The operation should yield and retry the work that failed
    pub fn is_write_conflict(&self) -> bool {
        match self {
            Self::WriteConflict(_) => true,
            Self::Catalog(e) => e.is_retryable(),
            Self::InvalidBatchParams(_) => false,
        }
    }
}

pub type Result<T, E = ExecError> = std::result::Result<T, E>;

/// Identifies a stored document
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordId(i64);

impl RecordId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> i64 {
        self.0
    }
}

/// Identifies the storage snapshot a document was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotId(u64);

impl SnapshotId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

/// A document produced by a stage, with the snapshot it was read in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkingSetMember {
    pub record_id: RecordId,
    pub snapshot_id: SnapshotId,
}

/// The outcome of one unit of work of a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    /// A document was produced
    Advanced(WorkingSetMember),
    /// Progress was made without producing anything; call again
    NeedTime,
    /// The caller should yield its snapshot before calling again
    NeedYield,
    /// Nothing more will be produced
    IsEof,
}

/// A stage feeding documents to another stage.
pub trait PlanStage: std::fmt::Debug + Send {
    fn work(&mut self) -> Result<StageState>;

    /// Prepare for the storage snapshot to change underneath the stage.
    fn save_state(&mut self) -> Result<()>;

    /// Reposition after [`Self::save_state`]; a write conflict means the caller should yield
    /// and try again.
    fn restore_state(&mut self) -> Result<()>;
}

/// The collection documents are deleted from.
///
/// Deletions happen inside a unit of work opened by [`Self::begin_batch`] and are only
/// durable once [`Self::commit_batch`] succeeds.
pub trait DeleteTarget: std::fmt::Debug + Send {
    /// Snapshot the target is currently reading in
    fn snapshot_id(&self) -> SnapshotId;

    /// Whether the document still exists and still matches the delete's predicate when
    /// re-read in the current snapshot
    fn still_matches(&mut self, record_id: RecordId) -> Result<bool>;

    fn begin_batch(&mut self) -> Result<()>;

    fn delete(&mut self, record_id: RecordId) -> Result<()>;

    fn commit_batch(&mut self) -> Result<()>;

    /// Discard every deletion since [`Self::begin_batch`]
    fn abort_batch(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_catalog_errors_are_write_conflicts() {
        assert!(ExecError::write_conflict("x").is_write_conflict());
        assert!(ExecError::from(CatalogError::write_conflict("x")).is_write_conflict());
        assert!(!ExecError::from(CatalogError::BadValue("x".into())).is_write_conflict());
        assert!(!ExecError::InvalidBatchParams("x".into()).is_write_conflict());
    }
}
