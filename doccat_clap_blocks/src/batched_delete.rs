//! Config for batched document deletion.
use std::time::Duration;

/// CLI config for the batched delete stage.
///
/// A batch is flushed once any non-zero target is reached. Setting a target to zero disables
/// it, but at least one target must stay enabled.
#[derive(Debug, Clone, Copy, clap::Parser)]
pub struct BatchedDeleteConfig {
    /// Number of staged documents that triggers a delete batch.
    #[clap(
        long = "batched-delete-target-docs",
        env = "DOCCAT_BATCHED_DELETE_TARGET_DOCS",
        default_value_t = 100,
        action
    )]
    pub target_batch_docs: usize,

    /// Time budget of a single delete batch; the batch stops early once it is spent.
    #[clap(
        long = "batched-delete-target-time",
        env = "DOCCAT_BATCHED_DELETE_TARGET_TIME",
        default_value = "5ms",
        value_parser = humantime::parse_duration,
        action
    )]
    pub target_batch_time: Duration,

    /// Approximate number of staged bytes per delete batch.
    #[clap(
        long = "batched-delete-target-bytes",
        env = "DOCCAT_BATCHED_DELETE_TARGET_BYTES",
        default_value_t = 5 * 1024 * 1024,
        action
    )]
    pub target_staged_doc_bytes: usize,
}
