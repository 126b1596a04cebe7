//! Split planning.
//!
//! A split is a contiguous `[start, end)` offset range of one partition.
//! Splits are computed from a single watermark snapshot taken at planning
//! time, so a scan never sees records appended after it was planned.

use std::fmt;
use std::sync::Arc;

use igloo_connector::TableName;
use tracing::{debug, info};
use uuid::Uuid;

use crate::context::QueryContext;
use crate::error::{KafkaError, Result};
use crate::log::{LogError, LogService};
use crate::retry::{retry, RetryError, RetryPolicy, Sleeper};

/// One unit of scan work.
#[derive(Debug, Clone)]
pub struct KafkaSplit {
    pub context: Arc<QueryContext>,
    /// Position in the plan.
    pub index: usize,
    pub topic: String,
    pub partition: i32,
    /// First offset, inclusive.
    pub start: i64,
    /// Last offset, exclusive.
    pub end: i64,
}

impl KafkaSplit {
    pub fn query_id(&self) -> Uuid {
        self.context.query_id
    }

    pub fn table(&self) -> &TableName {
        &self.context.binding.table
    }

    pub fn len(&self) -> u64 {
        (self.end - self.start).max(0) as u64
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

impl fmt::Display for KafkaSplit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}/{}[{}..{})",
            self.context.binding.table, self.topic, self.partition, self.start, self.end
        )
    }
}

/// Cuts `[low, high)` into ranges of at most `target` offsets whose lengths
/// differ by at most one. A `target` of zero never subdivides; an empty
/// range gives one empty split.
pub fn subdivide(low: i64, high: i64, target: u64) -> Vec<(i64, i64)> {
    let len = (high - low).max(0) as u64;
    if len == 0 {
        return vec![(low, low)];
    }
    if target == 0 || len <= target {
        return vec![(low, high)];
    }
    let n = len.div_ceil(target);
    let (base, extra) = (len / n, len % n);
    let mut ranges = Vec::with_capacity(n as usize);
    let mut start = low;
    for i in 0..n {
        let size = base + u64::from(i < extra);
        let end = start + size as i64;
        ranges.push((start, end));
        start = end;
    }
    ranges
}

pub struct SplitPlanner {
    log: Arc<dyn LogService>,
    messages_per_split: u64,
    retry: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl SplitPlanner {
    pub fn new(
        log: Arc<dyn LogService>,
        messages_per_split: u64,
        retry: RetryPolicy,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self { log, messages_per_split, retry, sleeper }
    }

    /// Plans the splits of `ctx`'s table, ordered by partition then start
    /// offset.
    pub async fn plan_splits(&self, ctx: &Arc<QueryContext>) -> Result<Vec<KafkaSplit>> {
        let binding = &ctx.binding;
        let topic = binding.topic.as_str();

        let mut partitions = self
            .with_retry(ctx, topic, || self.log.partitions(topic))
            .await?;
        partitions.sort_unstable();

        let mut splits = Vec::new();
        for partition in partitions {
            let marks = self
                .with_retry(ctx, topic, || self.log.watermarks(topic, partition))
                .await?;
            debug!(topic, partition, low = marks.low, high = marks.high, "read watermarks");
            for (start, end) in subdivide(marks.low, marks.high, self.messages_per_split) {
                splits.push(KafkaSplit {
                    context: Arc::clone(ctx),
                    index: splits.len(),
                    topic: binding.topic.clone(),
                    partition,
                    start,
                    end,
                });
            }
        }

        info!(
            query_id = %ctx.query_id,
            table = %binding.table,
            topic,
            splits = splits.len(),
            "planned splits"
        );
        Ok(splits)
    }

    async fn with_retry<T, F, Fut>(&self, ctx: &QueryContext, topic: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, LogError>>,
    {
        match retry(self.retry, self.sleeper.as_ref(), &ctx.cancel, LogError::is_retryable, op).await {
            Ok(value) => Ok(value),
            Err(RetryError::Cancelled) => Err(KafkaError::Cancelled(ctx.binding.table.to_string())),
            Err(RetryError::Failed { source: LogError::UnknownTopic(_), .. }) => {
                Err(KafkaError::TopicNotFound { table: ctx.binding.table.clone(), topic: topic.to_string() })
            }
            Err(RetryError::Failed { attempts, source }) => {
                Err(KafkaError::Metadata { topic: topic.to_string(), attempts, source })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{DecodeErrorPolicy, DecoderSpec};
    use crate::log::MemoryLog;
    use crate::retry::TokioSleeper;
    use crate::schema::SchemaBinding;
    use std::time::Duration;

    fn context(topic: &str) -> Arc<QueryContext> {
        let binding = SchemaBinding::new(
            TableName::new("default", "events"),
            topic,
            DecoderSpec::Dummy,
            DecoderSpec::Dummy,
            Vec::new(),
            DecodeErrorPolicy::Fail,
        );
        Arc::new(QueryContext::new(Arc::new(binding)))
    }

    fn planner(log: &MemoryLog, messages_per_split: u64) -> SplitPlanner {
        let retry = RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        };
        SplitPlanner::new(Arc::new(log.clone()), messages_per_split, retry, Arc::new(TokioSleeper))
    }

    fn log_with(counts: &[usize]) -> MemoryLog {
        let log = MemoryLog::new();
        log.create_topic("events", counts.len());
        for (partition, count) in counts.iter().enumerate() {
            for i in 0..*count {
                log.append("events", partition as i32, None, format!("{}", i).as_bytes()).unwrap();
            }
        }
        log
    }

    #[test]
    fn test_subdivide_sizes_differ_by_at_most_one() {
        assert_eq!(subdivide(0, 10, 4), vec![(0, 4), (4, 7), (7, 10)]);
        assert_eq!(subdivide(5, 9, 2), vec![(5, 7), (7, 9)]);
        assert_eq!(subdivide(0, 10, 0), vec![(0, 10)]);
        assert_eq!(subdivide(0, 10, 100), vec![(0, 10)]);
        assert_eq!(subdivide(3, 3, 4), vec![(3, 3)]);
    }

    #[test]
    fn test_subdivide_covers_range_exactly() {
        for (low, high, target) in [(0, 1001, 7), (17, 100, 10), (0, 64, 8)] {
            let ranges = subdivide(low, high, target);
            assert_eq!(ranges.first().map(|r| r.0), Some(low));
            assert_eq!(ranges.last().map(|r| r.1), Some(high));
            assert!(ranges.windows(2).all(|w| w[0].1 == w[1].0));
            let sizes: Vec<i64> = ranges.iter().map(|(s, e)| e - s).collect();
            let (min, max) = (sizes.iter().min().unwrap(), sizes.iter().max().unwrap());
            assert!(max - min <= 1 && *max as u64 <= target);
        }
    }

    #[tokio::test]
    async fn test_plan_one_split_per_partition() {
        let log = log_with(&[3, 0, 5]);
        let ctx = context("events");
        let splits = planner(&log, 0).plan_splits(&ctx).await.unwrap();

        let ranges: Vec<(i32, i64, i64)> = splits.iter().map(|s| (s.partition, s.start, s.end)).collect();
        assert_eq!(ranges, vec![(0, 0, 3), (1, 0, 0), (2, 0, 5)]);
        assert!(splits[1].is_empty());
        assert!(splits.iter().enumerate().all(|(i, s)| s.index == i && s.query_id() == ctx.query_id));
        assert_eq!(splits[2].to_string(), "default.events events/2[0..5)");
    }

    #[tokio::test]
    async fn test_plan_subdivides_large_partitions() {
        let log = log_with(&[10]);
        let splits = planner(&log, 4).plan_splits(&context("events")).await.unwrap();
        let ranges: Vec<(i64, i64)> = splits.iter().map(|s| (s.start, s.end)).collect();
        assert_eq!(ranges, vec![(0, 4), (4, 7), (7, 10)]);
    }

    #[tokio::test]
    async fn test_planning_is_repeatable() {
        let log = log_with(&[10, 0, 7]);
        let planner = planner(&log, 3);
        let ranges = |splits: Vec<KafkaSplit>| -> Vec<(i32, i64, i64)> {
            splits.iter().map(|s| (s.partition, s.start, s.end)).collect()
        };
        let first = ranges(planner.plan_splits(&context("events")).await.unwrap());
        let second = ranges(planner.plan_splits(&context("events")).await.unwrap());
        assert_eq!(first, second);
        assert_eq!(first.len(), 4 + 1 + 3);
    }

    #[tokio::test]
    async fn test_plan_starts_at_low_watermark() {
        let log = log_with(&[10]);
        log.truncate_before("events", 0, 6).unwrap();
        let splits = planner(&log, 0).plan_splits(&context("events")).await.unwrap();
        assert_eq!((splits[0].start, splits[0].end), (6, 10));
    }

    #[tokio::test]
    async fn test_unknown_topic() {
        let log = log_with(&[1]);
        let err = planner(&log, 0).plan_splits(&context("missing")).await.unwrap_err();
        assert!(matches!(err, KafkaError::TopicNotFound { topic, .. } if topic == "missing"));
    }

    #[tokio::test]
    async fn test_metadata_retries_transient_failures() {
        let log = log_with(&[2]);
        log.fail_next_metadata(2, LogError::Transient("leader moved".to_string()));
        let splits = planner(&log, 0).plan_splits(&context("events")).await.unwrap();
        assert_eq!(splits.len(), 1);

        log.fail_next_metadata(3, LogError::Transient("leader moved".to_string()));
        let err = planner(&log, 0).plan_splits(&context("events")).await.unwrap_err();
        assert!(matches!(err, KafkaError::Metadata { attempts: 3, .. }));
    }
}
