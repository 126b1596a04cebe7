//! The log service the connector reads from.
//!
//! [`LogService`] is the only thing the connector needs from a broker:
//! partition metadata, watermarks, and sequential cursors. [`MemoryLog`] is
//! an in-process implementation; `KafkaLog` (feature `rdkafka`) talks to a
//! real cluster.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

#[cfg(feature = "rdkafka")]
mod kafka;
mod memory;

#[cfg(feature = "rdkafka")]
pub use kafka::KafkaLog;
pub use memory::MemoryLog;

/// Errors reported by a log service.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LogError {
    /// Broker unavailable, request timed out, leader moving. Worth retrying.
    #[error("transient log failure: {0}")]
    Transient(String),

    #[error("unknown topic: {0}")]
    UnknownTopic(String),

    #[error("unknown partition {partition} of topic {topic}")]
    UnknownPartition { topic: String, partition: i32 },

    #[error("log failure: {0}")]
    Fatal(String),
}

impl LogError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, LogError::Transient(_))
    }
}

/// Oldest available and first unwritten offset of a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    pub low: i64,
    pub high: i64,
}

impl Watermarks {
    pub fn new(low: i64, high: i64) -> Self {
        Self { low, high: high.max(low) }
    }

    pub fn is_empty(&self) -> bool {
        self.low == self.high
    }
}

/// A record as stored in the log. Never mutated by the connector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: Option<i64>,
}

impl LogRecord {
    pub fn new(partition: i32, offset: i64, value: impl Into<Bytes>) -> Self {
        Self {
            partition,
            offset,
            key: None,
            value: Some(value.into()),
            timestamp: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

#[async_trait]
pub trait LogService: Send + Sync + fmt::Debug {
    /// Partition ids of `topic`. Fixed for the lifetime of a query.
    async fn partitions(&self, topic: &str) -> Result<Vec<i32>, LogError>;

    /// Current watermarks of one partition.
    async fn watermarks(&self, topic: &str, partition: i32) -> Result<Watermarks, LogError>;

    /// Opens a cursor positioned at `offset`.
    async fn open_cursor(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
    ) -> Result<Box<dyn LogCursor>, LogError>;
}

/// A sequential reader over one partition.
#[async_trait]
pub trait LogCursor: Send {
    /// Returns up to `max_records` records with offsets at or after the
    /// cursor position, in offset order, and moves the position past them.
    ///
    /// Offsets removed by retention or compaction are simply not returned.
    /// An empty result means no record exists at or after the position. A
    /// failed fetch leaves the position unchanged.
    async fn fetch(&mut self, max_records: usize) -> Result<Vec<LogRecord>, LogError>;

    /// Offset the next fetch starts from.
    fn position(&self) -> i64;

    /// Releases the broker-side resources. Safe to call more than once.
    fn close(&mut self);
}
