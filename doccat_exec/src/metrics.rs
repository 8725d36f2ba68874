//! Counters shared by every batched delete reporting to the same registry.
use metric::{Metric, Registry, U64Counter};

pub const BATCHED_DELETE_BATCHES_METRIC_NAME: &str = "doccat_batched_delete_batches";
const BATCHED_DELETE_BATCHES_METRIC_DESCRIPTION: &str = "delete batches committed";

pub const BATCHED_DELETE_DOCS_METRIC_NAME: &str = "doccat_batched_delete_docs";
const BATCHED_DELETE_DOCS_METRIC_DESCRIPTION: &str =
    "documents deleted by committed delete batches";

pub const BATCHED_DELETE_TIME_MILLIS_METRIC_NAME: &str = "doccat_batched_delete_time_millis";
const BATCHED_DELETE_TIME_MILLIS_METRIC_DESCRIPTION: &str =
    "milliseconds spent in committed delete batches";

#[derive(Debug, Clone)]
pub(crate) struct BatchedDeleteMetrics {
    batches: U64Counter,
    docs: U64Counter,
    time_millis: U64Counter,
}

impl BatchedDeleteMetrics {
    pub(crate) fn new(metric_registry: &Registry) -> Self {
        let counter = |name: &'static str, description: &'static str| {
            let metric: Metric<U64Counter> = metric_registry.register_metric(name, description);
            metric.recorder([])
        };
        Self {
            batches: counter(
                BATCHED_DELETE_BATCHES_METRIC_NAME,
                BATCHED_DELETE_BATCHES_METRIC_DESCRIPTION,
            ),
            docs: counter(BATCHED_DELETE_DOCS_METRIC_NAME, BATCHED_DELETE_DOCS_METRIC_DESCRIPTION),
            time_millis: counter(
                BATCHED_DELETE_TIME_MILLIS_METRIC_NAME,
                BATCHED_DELETE_TIME_MILLIS_METRIC_DESCRIPTION,
            ),
        }
    }

    pub(crate) fn record_batch(&self, docs: u64, time_millis: u64) {
        self.docs.inc(docs);
        self.batches.inc(1);
        self.time_millis.inc(time_millis);
    }
}

#[cfg(test)]
pub(crate) fn fetch(metric_registry: &Registry, name: &'static str) -> u64 {
    use metric::Attributes;

    metric_registry
        .get_instrument::<Metric<U64Counter>>(name)
        .unwrap()
        .get_observer(&Attributes::from([]))
        .unwrap()
        .fetch()
}
