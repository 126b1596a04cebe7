use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use super::{LogCursor, LogError, LogRecord, LogService, Watermarks};

/// An in-process partitioned log.
///
/// Supports retention (`truncate_before`), compaction (`compact`) and fault
/// injection so reader behaviour can be exercised without a broker. Cloning
/// shares the underlying log.
#[derive(Debug, Clone, Default)]
pub struct MemoryLog {
    state: Arc<Mutex<State>>,
}

#[derive(Debug, Default)]
struct State {
    topics: HashMap<String, Vec<PartitionLog>>,
    fetch_faults: VecDeque<LogError>,
    metadata_faults: VecDeque<LogError>,
    open_cursors: usize,
    cursors_opened: usize,
    records_fetched: usize,
}

#[derive(Debug, Default)]
struct PartitionLog {
    low: i64,
    high: i64,
    records: BTreeMap<i64, LogRecord>,
}

impl State {
    fn partition(&self, topic: &str, partition: i32) -> Result<&PartitionLog, LogError> {
        let partitions =
            self.topics.get(topic).ok_or_else(|| LogError::UnknownTopic(topic.to_string()))?;
        usize::try_from(partition)
            .ok()
            .and_then(|p| partitions.get(p))
            .ok_or_else(|| LogError::UnknownPartition { topic: topic.to_string(), partition })
    }

    fn partition_mut(&mut self, topic: &str, partition: i32) -> Result<&mut PartitionLog, LogError> {
        let partitions =
            self.topics.get_mut(topic).ok_or_else(|| LogError::UnknownTopic(topic.to_string()))?;
        usize::try_from(partition)
            .ok()
            .and_then(|p| partitions.get_mut(p))
            .ok_or_else(|| LogError::UnknownPartition { topic: topic.to_string(), partition })
    }
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates `topic` with `partitions` empty partitions. An existing topic
    /// is left untouched.
    pub fn create_topic(&self, topic: &str, partitions: usize) {
        let mut state = self.state.lock();
        state
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| (0..partitions).map(|_| PartitionLog::default()).collect());
    }

    /// Appends a record and returns its offset.
    pub fn append(
        &self,
        topic: &str,
        partition: i32,
        key: Option<&[u8]>,
        value: &[u8],
    ) -> Result<i64, LogError> {
        self.append_with_timestamp(topic, partition, key, value, None)
    }

    pub fn append_with_timestamp(
        &self,
        topic: &str,
        partition: i32,
        key: Option<&[u8]>,
        value: &[u8],
        timestamp: Option<i64>,
    ) -> Result<i64, LogError> {
        let mut state = self.state.lock();
        let log = state.partition_mut(topic, partition)?;
        let offset = log.high;
        let mut record = LogRecord::new(partition, offset, Bytes::copy_from_slice(value));
        record.key = key.map(Bytes::copy_from_slice);
        record.timestamp = timestamp;
        log.records.insert(offset, record);
        log.high += 1;
        Ok(offset)
    }

    /// Retention: drops everything below `offset` and advances the low
    /// watermark.
    pub fn truncate_before(&self, topic: &str, partition: i32, offset: i64) -> Result<(), LogError> {
        let mut state = self.state.lock();
        let log = state.partition_mut(topic, partition)?;
        let new_low = offset.clamp(log.low, log.high);
        log.records = log.records.split_off(&new_low);
        log.low = new_low;
        Ok(())
    }

    /// Compaction: removes individual offsets while the watermarks stay put.
    pub fn compact(&self, topic: &str, partition: i32, offsets: &[i64]) -> Result<(), LogError> {
        let mut state = self.state.lock();
        let log = state.partition_mut(topic, partition)?;
        for offset in offsets {
            log.records.remove(offset);
        }
        Ok(())
    }

    /// The next `count` cursor fetches fail with `error`.
    pub fn fail_next_fetches(&self, count: usize, error: LogError) {
        let mut state = self.state.lock();
        state.fetch_faults.extend(std::iter::repeat(error).take(count));
    }

    /// The next `count` metadata calls fail with `error`.
    pub fn fail_next_metadata(&self, count: usize, error: LogError) {
        let mut state = self.state.lock();
        state.metadata_faults.extend(std::iter::repeat(error).take(count));
    }

    /// Cursors opened and not yet closed.
    pub fn open_cursors(&self) -> usize {
        self.state.lock().open_cursors
    }

    /// Cursors opened since the log was created.
    pub fn cursors_opened(&self) -> usize {
        self.state.lock().cursors_opened
    }

    /// Records handed out by cursor fetches since the log was created.
    pub fn records_fetched(&self) -> usize {
        self.state.lock().records_fetched
    }
}

#[async_trait]
impl LogService for MemoryLog {
    async fn partitions(&self, topic: &str) -> Result<Vec<i32>, LogError> {
        let mut state = self.state.lock();
        if let Some(err) = state.metadata_faults.pop_front() {
            return Err(err);
        }
        let partitions =
            state.topics.get(topic).ok_or_else(|| LogError::UnknownTopic(topic.to_string()))?;
        let count = i32::try_from(partitions.len())
            .map_err(|_| LogError::Fatal(format!("too many partitions in {}", topic)))?;
        Ok((0..count).collect())
    }

    async fn watermarks(&self, topic: &str, partition: i32) -> Result<Watermarks, LogError> {
        let mut state = self.state.lock();
        if let Some(err) = state.metadata_faults.pop_front() {
            return Err(err);
        }
        let log = state.partition(topic, partition)?;
        Ok(Watermarks::new(log.low, log.high))
    }

    async fn open_cursor(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
    ) -> Result<Box<dyn LogCursor>, LogError> {
        let mut state = self.state.lock();
        state.partition(topic, partition)?;
        state.open_cursors += 1;
        state.cursors_opened += 1;
        Ok(Box::new(MemoryCursor {
            state: Arc::clone(&self.state),
            topic: topic.to_string(),
            partition,
            position: offset,
            closed: false,
        }))
    }
}

struct MemoryCursor {
    state: Arc<Mutex<State>>,
    topic: String,
    partition: i32,
    position: i64,
    closed: bool,
}

#[async_trait]
impl LogCursor for MemoryCursor {
    async fn fetch(&mut self, max_records: usize) -> Result<Vec<LogRecord>, LogError> {
        if self.closed {
            return Err(LogError::Fatal("cursor is closed".to_string()));
        }
        let mut state = self.state.lock();
        if let Some(err) = state.fetch_faults.pop_front() {
            return Err(err);
        }
        let log = state.partition(&self.topic, self.partition)?;
        let start = self.position.max(log.low);
        let records: Vec<LogRecord> =
            log.records.range(start..).take(max_records).map(|(_, r)| r.clone()).collect();
        state.records_fetched += records.len();
        if let Some(last) = records.last() {
            self.position = last.offset + 1;
        }
        Ok(records)
    }

    fn position(&self) -> i64 {
        self.position
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let mut state = self.state.lock();
            state.open_cursors = state.open_cursors.saturating_sub(1);
        }
    }
}

impl Drop for MemoryCursor {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_with(records: usize) -> MemoryLog {
        let log = MemoryLog::new();
        log.create_topic("events", 2);
        for i in 0..records {
            log.append("events", 0, None, format!("v{}", i).as_bytes()).unwrap();
        }
        log
    }

    #[tokio::test]
    async fn test_append_assigns_consecutive_offsets() {
        let log = log_with(3);
        assert_eq!(log.append("events", 0, Some(b"k"), b"v3").unwrap(), 3);
        assert_eq!(log.watermarks("events", 0).await.unwrap(), Watermarks::new(0, 4));
        assert_eq!(log.watermarks("events", 1).await.unwrap(), Watermarks::new(0, 0));
        assert_eq!(log.partitions("events").await.unwrap(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_unknown_topic_and_partition() {
        let log = log_with(0);
        assert_eq!(
            log.partitions("missing").await,
            Err(LogError::UnknownTopic("missing".to_string()))
        );
        assert!(matches!(
            log.watermarks("events", 7).await,
            Err(LogError::UnknownPartition { partition: 7, .. })
        ));
    }

    #[tokio::test]
    async fn test_cursor_fetches_in_order_and_skips_removed_offsets() {
        let log = log_with(6);
        log.compact("events", 0, &[2, 3]).unwrap();
        let mut cursor = log.open_cursor("events", 0, 1).await.unwrap();

        let offsets: Vec<i64> = cursor.fetch(3).await.unwrap().iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![1, 4, 5]);
        assert_eq!(cursor.position(), 6);
        assert!(cursor.fetch(3).await.unwrap().is_empty());
        assert_eq!(log.records_fetched(), 3);
    }

    #[tokio::test]
    async fn test_truncate_advances_low_watermark() {
        let log = log_with(5);
        log.truncate_before("events", 0, 3).unwrap();
        assert_eq!(log.watermarks("events", 0).await.unwrap(), Watermarks::new(3, 5));

        let mut cursor = log.open_cursor("events", 0, 0).await.unwrap();
        let first = cursor.fetch(1).await.unwrap();
        assert_eq!(first[0].offset, 3);
    }

    #[tokio::test]
    async fn test_injected_fault_leaves_position_unchanged() {
        let log = log_with(2);
        let mut cursor = log.open_cursor("events", 0, 0).await.unwrap();
        log.fail_next_fetches(1, LogError::Transient("broker down".to_string()));

        assert!(cursor.fetch(10).await.is_err());
        assert_eq!(cursor.position(), 0);
        assert_eq!(cursor.fetch(10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_cursor_accounting() {
        let log = log_with(1);
        let mut first = log.open_cursor("events", 0, 0).await.unwrap();
        let second = log.open_cursor("events", 0, 0).await.unwrap();
        assert_eq!(log.open_cursors(), 2);

        first.close();
        first.close();
        assert_eq!(log.open_cursors(), 1);
        assert!(first.fetch(1).await.is_err());

        drop(second);
        assert_eq!(log.open_cursors(), 0);
        assert_eq!(log.cursors_opened(), 2);
    }
}
