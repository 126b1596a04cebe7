use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::error::{KafkaError as ClientError, RDKafkaErrorCode};
use rdkafka::message::BorrowedMessage;
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use rdkafka::Message;
use tracing::{debug, warn};

use super::{LogCursor, LogError, LogRecord, LogService, Watermarks};
use crate::config::KafkaConfig;

/// Log service backed by a Kafka cluster.
///
/// Metadata calls share one consumer; every cursor gets its own consumer
/// with a manual partition assignment. Blocking client calls run on the
/// blocking thread pool.
pub struct KafkaLog {
    client_config: ClientConfig,
    metadata: Arc<BaseConsumer>,
    timeout: Duration,
}

impl std::fmt::Debug for KafkaLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaLog").field("timeout", &self.timeout).finish()
    }
}

impl KafkaLog {
    pub fn new(config: &KafkaConfig) -> Result<Self, LogError> {
        if config.nodes.is_empty() {
            return Err(LogError::Fatal("no broker nodes configured".to_string()));
        }
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", config.nodes.join(","))
            .set("group.id", "igloo-kafka-connector")
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "true")
            // Offsets removed by retention resolve to the oldest record.
            .set("auto.offset.reset", "earliest");
        let metadata: BaseConsumer = client_config.create().map_err(map_error)?;
        Ok(Self { client_config, metadata: Arc::new(metadata), timeout: config.poll_timeout() })
    }
}

fn map_error(err: ClientError) -> LogError {
    match err.rdkafka_error_code() {
        Some(RDKafkaErrorCode::UnknownTopicOrPartition | RDKafkaErrorCode::UnknownTopic) => {
            LogError::UnknownTopic(err.to_string())
        }
        Some(
            RDKafkaErrorCode::OperationTimedOut
            | RDKafkaErrorCode::RequestTimedOut
            | RDKafkaErrorCode::BrokerTransportFailure
            | RDKafkaErrorCode::AllBrokersDown
            | RDKafkaErrorCode::LeaderNotAvailable
            | RDKafkaErrorCode::NotLeaderForPartition
            | RDKafkaErrorCode::NetworkException,
        ) => LogError::Transient(err.to_string()),
        _ => LogError::Fatal(err.to_string()),
    }
}

async fn blocking<T, F>(f: F) -> Result<T, LogError>
where
    F: FnOnce() -> Result<T, LogError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| LogError::Fatal(format!("blocking task failed: {}", e)))?
}

#[async_trait]
impl LogService for KafkaLog {
    async fn partitions(&self, topic: &str) -> Result<Vec<i32>, LogError> {
        let consumer = Arc::clone(&self.metadata);
        let (topic, timeout) = (topic.to_string(), self.timeout);
        blocking(move || {
            let metadata = consumer.fetch_metadata(Some(&topic), timeout).map_err(map_error)?;
            let Some(entry) = metadata.topics().iter().find(|t| t.name() == topic) else {
                return Err(LogError::UnknownTopic(topic));
            };
            if entry.error().is_some() || entry.partitions().is_empty() {
                return Err(LogError::UnknownTopic(topic));
            }
            Ok(entry.partitions().iter().map(|p| p.id()).collect())
        })
        .await
    }

    async fn watermarks(&self, topic: &str, partition: i32) -> Result<Watermarks, LogError> {
        let consumer = Arc::clone(&self.metadata);
        let (topic, timeout) = (topic.to_string(), self.timeout);
        blocking(move || {
            let (low, high) =
                consumer.fetch_watermarks(&topic, partition, timeout).map_err(map_error)?;
            Ok(Watermarks::new(low, high))
        })
        .await
    }

    async fn open_cursor(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
    ) -> Result<Box<dyn LogCursor>, LogError> {
        let consumer: BaseConsumer = self.client_config.create().map_err(map_error)?;
        let mut assignment = TopicPartitionList::new();
        assignment
            .add_partition_offset(topic, partition, Offset::Offset(offset))
            .map_err(map_error)?;
        consumer.assign(&assignment).map_err(map_error)?;
        debug!(topic, partition, offset, "assigned kafka consumer");
        Ok(Box::new(KafkaCursor {
            consumer: Some(Arc::new(consumer)),
            position: offset,
            timeout: self.timeout,
            deferred: None,
        }))
    }
}

struct KafkaCursor {
    consumer: Option<Arc<BaseConsumer>>,
    position: i64,
    timeout: Duration,
    /// Error polled after a partial batch was already consumed.
    deferred: Option<LogError>,
}

fn to_record(message: &BorrowedMessage<'_>) -> LogRecord {
    LogRecord {
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(Bytes::copy_from_slice),
        value: message.payload().map(Bytes::copy_from_slice),
        timestamp: message.timestamp().to_millis(),
    }
}

/// Polls until `max_records` records, end of partition, or `timeout`.
///
/// An error polled once some records are in hand is returned alongside
/// them rather than in place of them.
fn poll_records<P>(
    mut poll: P,
    max_records: usize,
    timeout: Duration,
) -> Result<(Vec<LogRecord>, Option<LogError>), LogError>
where
    P: FnMut(Duration) -> Option<Result<LogRecord, ClientError>>,
{
    let mut records = Vec::new();
    let deadline = Instant::now() + timeout;
    while records.len() < max_records {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match poll(remaining) {
            Some(Ok(record)) => records.push(record),
            Some(Err(ClientError::PartitionEOF(_))) => return Ok((records, None)),
            Some(Err(err)) if !records.is_empty() => return Ok((records, Some(map_error(err)))),
            Some(Err(err)) => return Err(map_error(err)),
            None => break,
        }
    }
    if records.is_empty() {
        return Err(LogError::Transient("poll timed out".to_string()));
    }
    Ok((records, None))
}

#[async_trait]
impl LogCursor for KafkaCursor {
    async fn fetch(&mut self, max_records: usize) -> Result<Vec<LogRecord>, LogError> {
        if let Some(err) = self.deferred.take() {
            return Err(err);
        }
        let Some(consumer) = self.consumer.clone() else {
            return Err(LogError::Fatal("cursor is closed".to_string()));
        };
        let timeout = self.timeout;
        let (records, deferred) = blocking(move || {
            poll_records(|wait| consumer.poll(wait).map(|r| r.map(|m| to_record(&m))), max_records, timeout)
        })
        .await?;

        if let Some(last) = records.last() {
            self.position = last.offset + 1;
        }
        if let Some(err) = deferred {
            warn!(position = self.position, error = %err, "poll failed after a partial fetch");
            self.deferred = Some(err);
        }
        Ok(records)
    }

    fn position(&self) -> i64 {
        self.position
    }

    fn close(&mut self) {
        if let Some(consumer) = self.consumer.take() {
            // Dropping the last handle closes the client.
            if let Err(e) = consumer.unassign() {
                debug!(error = %e, "failed to unassign kafka consumer");
            }
        }
    }
}

impl Drop for KafkaCursor {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    fn scripted(
        events: Vec<Option<Result<LogRecord, ClientError>>>,
    ) -> impl FnMut(Duration) -> Option<Result<LogRecord, ClientError>> {
        let mut events: VecDeque<_> = events.into();
        move |_| events.pop_front().flatten()
    }

    fn record(offset: i64) -> Option<Result<LogRecord, ClientError>> {
        Some(Ok(LogRecord::new(0, offset, "v")))
    }

    fn broker_down() -> Option<Result<LogRecord, ClientError>> {
        Some(Err(ClientError::MessageConsumption(RDKafkaErrorCode::AllBrokersDown)))
    }

    #[test]
    fn test_poll_stops_at_partition_eof() {
        let poll = scripted(vec![record(0), record(1), Some(Err(ClientError::PartitionEOF(0))), record(2)]);
        let (records, deferred) = poll_records(poll, 10, Duration::from_secs(1)).unwrap();
        assert_eq!(records.len(), 2);
        assert!(deferred.is_none());
    }

    #[test]
    fn test_error_after_records_is_kept() {
        let poll = scripted(vec![record(4), broker_down()]);
        let (records, deferred) = poll_records(poll, 10, Duration::from_secs(1)).unwrap();
        assert_eq!(records[0].offset, 4);
        assert!(matches!(deferred, Some(LogError::Transient(_))));
    }

    #[test]
    fn test_error_before_records_fails_the_fetch() {
        let poll = scripted(vec![broker_down(), record(0)]);
        assert!(matches!(poll_records(poll, 10, Duration::from_secs(1)), Err(LogError::Transient(_))));
    }
}
