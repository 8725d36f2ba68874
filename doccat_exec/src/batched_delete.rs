//! A delete stage that stages the documents produced by its child and deletes them in batches.
//!
//! Every batch runs in one unit of work of the [`DeleteTarget`]. A batch ends when the staging
//! buffer has been drained or when the batch has used up its time target, in which case the
//! rest of the buffer is drained by the following calls to [`BatchedDeleteStage::work`].
//!
//! When a batch hits a write conflict its unit of work is aborted, documents that were found to
//! no longer match are dropped from the buffer, and the stage asks to yield. The next call
//! retries the drain without pulling new documents from the child.
use std::{collections::BTreeSet, sync::Arc, time::Duration};

use iox_time::{Time, TimeProvider};
use metric::Registry;
use tracing::debug;

use crate::{
    BatchedDeleteParams, DeleteTarget, ExecError, PlanStage, RecordId, Result, SnapshotId,
    StageState, metrics::BatchedDeleteMetrics,
};

#[derive(Debug, Clone, Copy)]
struct StagedDocument {
    record_id: RecordId,
    snapshot_id: SnapshotId,
}

/// What a single batch got through before it ended
#[derive(Debug, Default)]
struct BatchProgress {
    /// Index of the last staged document that was evaluated
    last_evaluated: usize,
    deleted: u64,
    no_longer_match: BTreeSet<RecordId>,
}

#[derive(Debug)]
pub struct BatchedDeleteStage<C, T> {
    params: BatchedDeleteParams,
    child: C,
    target: T,
    metrics: BatchedDeleteMetrics,
    time_provider: Arc<dyn TimeProvider>,
    staged: Vec<StagedDocument>,
    /// Set while staged documents are left over from an interrupted batch
    drain_remaining_buffer: bool,
    docs_deleted: u64,
}

impl<C: PlanStage, T: DeleteTarget> BatchedDeleteStage<C, T> {
    pub fn new(
        params: BatchedDeleteParams,
        child: C,
        target: T,
        metric_registry: &Registry,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            params,
            child,
            target,
            metrics: BatchedDeleteMetrics::new(metric_registry),
            time_provider,
            staged: vec![],
            drain_remaining_buffer: false,
            docs_deleted: 0,
        }
    }

    pub fn child(&self) -> &C {
        &self.child
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    /// Documents deleted by committed batches of this stage
    pub fn docs_deleted(&self) -> u64 {
        self.docs_deleted
    }

    /// Documents waiting to be deleted
    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    pub fn work(&mut self) -> Result<StageState> {
        if !self.drain_remaining_buffer {
            match self.child.work()? {
                StageState::Advanced(member) => self.staged.push(StagedDocument {
                    record_id: member.record_id,
                    snapshot_id: member.snapshot_id,
                }),
                state @ (StageState::NeedTime | StageState::NeedYield) => return Ok(state),
                StageState::IsEof => {
                    if !self.staged.is_empty() {
                        let state = self.delete_batch()?;
                        // NeedTime with nothing left to drain means everything was deleted
                        if state != StageState::NeedTime || self.drain_remaining_buffer {
                            return Ok(state);
                        }
                    }
                    return Ok(StageState::IsEof);
                }
            }
        }

        let target_docs = self.params.target_batch_docs;
        if self.drain_remaining_buffer || (target_docs != 0 && self.staged.len() >= target_docs) {
            return self.delete_batch();
        }
        Ok(StageState::NeedTime)
    }

    fn delete_batch(&mut self) -> Result<StageState> {
        assert!(!self.staged.is_empty(), "expected staged documents for a batched deletion");
        match self.child.save_state() {
            Err(e) if e.is_write_conflict() => {
                panic!("saving the state of a delete's child must not conflict: {e}")
            }
            res => res?,
        }

        let started = self.time_provider.now();
        let mut progress = BatchProgress::default();
        match self.apply_batch(started, &mut progress) {
            Ok(()) => {}
            Err(e) if e.is_write_conflict() => {
                return Ok(self.prepare_to_retry_drain(&progress.no_longer_match, &e));
            }
            Err(e) => return Err(e),
        }

        let elapsed = self.elapsed_since(started);
        self.metrics.record_batch(progress.deleted, elapsed.as_millis() as u64);
        self.docs_deleted += progress.deleted;
        debug!(
            deleted = progress.deleted,
            skipped = progress.no_longer_match.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "committed delete batch"
        );

        if progress.last_evaluated + 1 < self.staged.len() {
            // the time target ended the batch early
            self.staged.drain(..=progress.last_evaluated);
            self.drain_remaining_buffer = true;
        } else {
            self.staged.clear();
            self.drain_remaining_buffer = false;
        }
        self.try_restore_state()
    }

    fn elapsed_since(&self, started: Time) -> Duration {
        self.time_provider
            .now()
            .checked_duration_since(started)
            .unwrap_or_default()
    }

    fn apply_batch(&mut self, started: Time, progress: &mut BatchProgress) -> Result<()> {
        self.target.begin_batch()?;
        let res = self
            .delete_staged(started, progress)
            .and_then(|()| self.target.commit_batch());
        if res.is_err() {
            self.target.abort_batch();
        }
        res
    }

    fn delete_staged(&mut self, started: Time, progress: &mut BatchProgress) -> Result<()> {
        let current_snapshot = self.target.snapshot_id();
        let time_target = self.params.target_batch_time;

        for (idx, staged) in self.staged.iter().enumerate() {
            progress.last_evaluated = idx;

            // documents staged in an older snapshot are re-checked before deletion
            let still_matches = staged.snapshot_id == current_snapshot
                || self.target.still_matches(staged.record_id)?;
            if still_matches {
                self.target.delete(staged.record_id)?;
                progress.deleted += 1;
            } else {
                progress.no_longer_match.insert(staged.record_id);
            }

            if !time_target.is_zero() && self.elapsed_since(started) >= time_target {
                break;
            }
        }
        Ok(())
    }

    fn try_restore_state(&mut self) -> Result<StageState> {
        match self.child.restore_state() {
            Ok(()) => Ok(StageState::NeedTime),
            Err(e) if e.is_write_conflict() => Ok(StageState::NeedYield),
            Err(e) => Err(e),
        }
    }

    fn prepare_to_retry_drain(
        &mut self,
        no_longer_match: &BTreeSet<RecordId>,
        conflict: &ExecError,
    ) -> StageState {
        self.staged.retain(|staged| !no_longer_match.contains(&staged.record_id));
        self.drain_remaining_buffer = true;
        debug!(
            remaining = self.staged.len(),
            %conflict,
            "write conflict in delete batch, retrying after yield"
        );
        StageState::NeedYield
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        WorkingSetMember,
        metrics::{
            BATCHED_DELETE_BATCHES_METRIC_NAME, BATCHED_DELETE_DOCS_METRIC_NAME,
            BATCHED_DELETE_TIME_MILLIS_METRIC_NAME, fetch,
        },
    };
    use doccat_catalog::CatalogError;
    use iox_time::MockProvider;
    use pretty_assertions::assert_eq;
    use std::collections::{BTreeMap, VecDeque};

    fn member(id: i64, snapshot: u64) -> WorkingSetMember {
        WorkingSetMember {
            record_id: RecordId::new(id),
            snapshot_id: SnapshotId::new(snapshot),
        }
    }

    /// Replays a scripted sequence of states, then reports EOF forever
    #[derive(Debug, Default)]
    struct ScriptedChild {
        script: VecDeque<StageState>,
        saves: usize,
        restores: usize,
        restore_conflicts: usize,
    }

    impl ScriptedChild {
        fn advancing(ids: impl IntoIterator<Item = i64>) -> Self {
            Self {
                script: ids
                    .into_iter()
                    .map(|id| StageState::Advanced(member(id, 1)))
                    .collect(),
                ..Default::default()
            }
        }
    }

    impl PlanStage for ScriptedChild {
        fn work(&mut self) -> Result<StageState> {
            Ok(self.script.pop_front().unwrap_or(StageState::IsEof))
        }

        fn save_state(&mut self) -> Result<()> {
            self.saves += 1;
            Ok(())
        }

        fn restore_state(&mut self) -> Result<()> {
            self.restores += 1;
            if self.restore_conflicts > 0 {
                self.restore_conflicts -= 1;
                return Err(ExecError::write_conflict("restore"));
            }
            Ok(())
        }
    }

    /// An in-memory collection with a transactional delete batch
    #[derive(Debug)]
    struct MemTarget {
        docs: BTreeMap<RecordId, bool>,
        snapshot: SnapshotId,
        pending: Vec<RecordId>,
        /// Fail the delete call with this (1-based) number with a write conflict
        conflict_on_delete: Option<usize>,
        delete_calls: usize,
        /// Advanced by every delete
        time_provider: Option<Arc<MockProvider>>,
        commits: usize,
        aborts: usize,
    }

    impl MemTarget {
        fn with_docs(ids: impl IntoIterator<Item = i64>) -> Self {
            Self {
                docs: ids.into_iter().map(|id| (RecordId::new(id), true)).collect(),
                snapshot: SnapshotId::new(1),
                pending: vec![],
                conflict_on_delete: None,
                delete_calls: 0,
                time_provider: None,
                commits: 0,
                aborts: 0,
            }
        }

        fn remaining(&self) -> Vec<i64> {
            self.docs.keys().map(|id| id.get()).collect()
        }
    }

    impl DeleteTarget for MemTarget {
        fn snapshot_id(&self) -> SnapshotId {
            self.snapshot
        }

        fn still_matches(&mut self, record_id: RecordId) -> Result<bool> {
            Ok(self.docs.get(&record_id).copied().unwrap_or(false))
        }

        fn begin_batch(&mut self) -> Result<()> {
            assert!(self.pending.is_empty());
            Ok(())
        }

        fn delete(&mut self, record_id: RecordId) -> Result<()> {
            self.delete_calls += 1;
            if self.conflict_on_delete == Some(self.delete_calls) {
                return Err(CatalogError::write_conflict("delete").into());
            }
            if let Some(time_provider) = &self.time_provider {
                time_provider.inc(Duration::from_millis(1));
            }
            self.pending.push(record_id);
            Ok(())
        }

        fn commit_batch(&mut self) -> Result<()> {
            for id in self.pending.drain(..) {
                self.docs.remove(&id);
            }
            self.commits += 1;
            Ok(())
        }

        fn abort_batch(&mut self) {
            self.pending.clear();
            self.aborts += 1;
        }
    }

    fn stage(
        target_docs: usize,
        target_time: Duration,
        child: ScriptedChild,
        target: MemTarget,
    ) -> (BatchedDeleteStage<ScriptedChild, MemTarget>, Registry) {
        let metric_registry = Registry::new();
        let time_provider: Arc<dyn TimeProvider> = match &target.time_provider {
            Some(time_provider) => Arc::clone(time_provider) as _,
            None => Arc::new(MockProvider::new(Time::from_timestamp_nanos(0))),
        };
        let params = BatchedDeleteParams::new(target_docs, target_time, 0).unwrap();
        let stage = BatchedDeleteStage::new(params, child, target, &metric_registry, time_provider);
        (stage, metric_registry)
    }

    fn batches(metric_registry: &Registry) -> u64 {
        fetch(metric_registry, BATCHED_DELETE_BATCHES_METRIC_NAME)
    }

    fn docs(metric_registry: &Registry) -> u64 {
        fetch(metric_registry, BATCHED_DELETE_DOCS_METRIC_NAME)
    }

    fn run_to_eof(stage: &mut BatchedDeleteStage<ScriptedChild, MemTarget>) -> Vec<StageState> {
        let mut states = vec![];
        loop {
            let state = stage.work().unwrap();
            states.push(state);
            if state == StageState::IsEof {
                return states;
            }
        }
    }

    #[test_log::test]
    fn flushes_at_target_docs_and_at_eof() {
        let (mut stage, metrics) = stage(
            2,
            Duration::ZERO,
            ScriptedChild::advancing(1..=5),
            MemTarget::with_docs(1..=6),
        );

        let states = run_to_eof(&mut stage);
        assert_eq!(states.len(), 6);
        assert!(states[..5].iter().all(|s| *s == StageState::NeedTime));

        assert_eq!(stage.target().remaining(), vec![6]);
        assert_eq!(stage.target().commits, 3);
        assert_eq!(stage.docs_deleted(), 5);
        assert_eq!(batches(&metrics), 3);
        assert_eq!(docs(&metrics), 5);
        assert_eq!(stage.child().saves, 3);
        assert_eq!(stage.child().restores, 3);
    }

    #[test]
    fn child_yields_are_passed_through() {
        let mut child = ScriptedChild::advancing([1]);
        child.script.push_front(StageState::NeedYield);
        let (mut stage, _) = stage(10, Duration::ZERO, child, MemTarget::with_docs([1]));

        assert_eq!(stage.work().unwrap(), StageState::NeedYield);
        assert_eq!(stage.work().unwrap(), StageState::NeedTime);
        assert_eq!(stage.staged_len(), 1);
        assert_eq!(stage.work().unwrap(), StageState::IsEof);
        assert!(stage.target().remaining().is_empty());
    }

    #[test_log::test]
    fn time_target_ends_a_batch_early() {
        let mut target = MemTarget::with_docs(1..=5);
        target.time_provider = Some(Arc::new(MockProvider::new(Time::from_timestamp_nanos(0))));
        let (mut stage, metrics) = stage(
            5,
            Duration::from_millis(2),
            ScriptedChild::advancing(1..=5),
            target,
        );

        for _ in 0..4 {
            assert_eq!(stage.work().unwrap(), StageState::NeedTime);
        }
        // the fifth document triggers a batch that runs out of time after two deletes
        assert_eq!(stage.work().unwrap(), StageState::NeedTime);
        assert_eq!(stage.target().remaining(), vec![3, 4, 5]);
        assert_eq!(stage.staged_len(), 3);

        // the remainder is drained without asking the child for more
        assert_eq!(stage.work().unwrap(), StageState::NeedTime);
        assert_eq!(stage.target().remaining(), vec![5]);
        assert_eq!(stage.work().unwrap(), StageState::NeedTime);
        assert_eq!(stage.staged_len(), 0);
        assert_eq!(stage.work().unwrap(), StageState::IsEof);

        assert!(stage.target().remaining().is_empty());
        assert_eq!(batches(&metrics), 3);
        assert_eq!(docs(&metrics), 5);
        assert_eq!(fetch(&metrics, BATCHED_DELETE_TIME_MILLIS_METRIC_NAME), 5);
    }

    #[test_log::test]
    fn write_conflict_retries_only_matching_documents() {
        let mut target = MemTarget::with_docs([1, 3, 4]);
        // the documents were staged in snapshot 1, the target has moved on and 2 is gone
        target.snapshot = SnapshotId::new(2);
        target.conflict_on_delete = Some(2);
        let (mut stage, metrics) = stage(
            4,
            Duration::ZERO,
            ScriptedChild::advancing(1..=4),
            target,
        );

        for _ in 0..3 {
            assert_eq!(stage.work().unwrap(), StageState::NeedTime);
        }
        assert_eq!(stage.work().unwrap(), StageState::NeedYield);
        assert_eq!(stage.target().aborts, 1);
        assert_eq!(stage.target().remaining(), vec![1, 3, 4]);
        assert_eq!(stage.staged_len(), 3);
        assert_eq!(batches(&metrics), 0);

        // the retry drains the buffer without pulling from the child
        assert_eq!(stage.work().unwrap(), StageState::NeedTime);
        assert!(stage.target().remaining().is_empty());
        assert_eq!(stage.docs_deleted(), 3);
        assert_eq!(docs(&metrics), 3);
        assert_eq!(stage.work().unwrap(), StageState::IsEof);
    }

    #[test]
    fn conflict_while_restoring_asks_for_a_yield() {
        let mut child = ScriptedChild::advancing([1]);
        child.restore_conflicts = 1;
        let (mut stage, _) = stage(1, Duration::ZERO, child, MemTarget::with_docs([1]));

        assert_eq!(stage.work().unwrap(), StageState::NeedYield);
        assert!(stage.target().remaining().is_empty());
        assert_eq!(stage.work().unwrap(), StageState::IsEof);
    }

    #[test]
    fn conflict_at_eof_is_retried() {
        let mut target = MemTarget::with_docs([1, 2]);
        target.conflict_on_delete = Some(1);
        let (mut stage, _) = stage(
            0,
            Duration::from_secs(1),
            ScriptedChild::advancing([1, 2]),
            target,
        );

        assert_eq!(
            run_to_eof(&mut stage),
            vec![
                StageState::NeedTime,
                StageState::NeedTime,
                StageState::NeedYield,
                StageState::NeedTime,
                StageState::IsEof,
            ]
        );
        assert!(stage.target().remaining().is_empty());
    }

    #[test]
    fn other_errors_are_returned() {
        #[derive(Debug)]
        struct Broken;

        impl PlanStage for Broken {
            fn work(&mut self) -> Result<StageState> {
                Err(CatalogError::BadValue("broken".into()).into())
            }

            fn save_state(&mut self) -> Result<()> {
                Ok(())
            }

            fn restore_state(&mut self) -> Result<()> {
                Ok(())
            }
        }

        let params = BatchedDeleteParams::new(1, Duration::ZERO, 0).unwrap();
        let mut stage = BatchedDeleteStage::new(
            params,
            Broken,
            MemTarget::with_docs(Vec::<i64>::new()),
            &Registry::new(),
            Arc::new(MockProvider::new(Time::from_timestamp_nanos(0))),
        );
        let err = stage.work().unwrap_err();
        assert_eq!(err, ExecError::Catalog(CatalogError::BadValue("broken".into())));
    }
}
