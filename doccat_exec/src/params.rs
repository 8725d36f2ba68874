use std::time::Duration;

use doccat_clap_blocks::batched_delete::BatchedDeleteConfig;

use crate::ExecError;

/// Targets that end a delete batch. A zero target is disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchedDeleteParams {
    pub target_batch_docs: usize,
    pub target_batch_time: Duration,
    pub target_staged_doc_bytes: usize,
}

impl BatchedDeleteParams {
    pub fn new(
        target_batch_docs: usize,
        target_batch_time: Duration,
        target_staged_doc_bytes: usize,
    ) -> Result<Self, ExecError> {
        if target_batch_docs == 0 && target_batch_time.is_zero() && target_staged_doc_bytes == 0 {
            return Err(ExecError::InvalidBatchParams(
                "batch size cannot be unbounded; at least one of the target docs, target time \
                 or target bytes must be set"
                    .to_string(),
            ));
        }
        Ok(Self {
            target_batch_docs,
            target_batch_time,
            target_staged_doc_bytes,
        })
    }
}

impl TryFrom<&BatchedDeleteConfig> for BatchedDeleteParams {
    type Error = ExecError;

    fn try_from(config: &BatchedDeleteConfig) -> Result<Self, Self::Error> {
        Self::new(
            config.target_batch_docs,
            config.target_batch_time,
            config.target_staged_doc_bytes,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use pretty_assertions::assert_eq;

    #[test]
    fn from_default_config() {
        let config = BatchedDeleteConfig::parse_from(["doccat"]);
        let params = BatchedDeleteParams::try_from(&config).unwrap();
        assert_eq!(
            params,
            BatchedDeleteParams {
                target_batch_docs: 100,
                target_batch_time: Duration::from_millis(5),
                target_staged_doc_bytes: 5 * 1024 * 1024,
            }
        );
    }

    #[test]
    fn unbounded_batches_are_rejected() {
        let config = BatchedDeleteConfig::parse_from([
            "doccat",
            "--batched-delete-target-docs",
            "0",
            "--batched-delete-target-time",
            "0s",
            "--batched-delete-target-bytes",
            "0",
        ]);
        let err = BatchedDeleteParams::try_from(&config).unwrap_err();
        assert!(matches!(err, ExecError::InvalidBatchParams(_)), "{err}");

        // any single target is enough
        BatchedDeleteParams::new(0, Duration::from_millis(1), 0).unwrap();
        BatchedDeleteParams::new(0, Duration::ZERO, 1).unwrap();
    }
}
