//! Kafka connector for Igloo.
//!
//! Exposes the topics of a partitioned, offset-addressed log as tables. Each
//! partition is planned into one or more [`KafkaSplit`]s that the engine reads
//! in parallel; records are decoded into typed rows by the decoders declared
//! in the table descriptions.
//!
//! ```no_run
//! use std::sync::Arc;
//! use igloo_connector::TableName;
//! use igloo_connector_kafka::{KafkaConfig, KafkaConnector, MemoryLog};
//!
//! # async fn run() -> igloo_connector_kafka::Result<()> {
//! let log = MemoryLog::new();
//! let connector = KafkaConnector::new(KafkaConfig::new()?, Arc::new(log))?;
//! let plan = connector.plan_splits(&TableName::new("tpch", "region")).await?;
//! for split in &plan.splits {
//!     let mut reader = connector.open_reader(split);
//!     while let Some(row) = reader.next().await? {
//!         println!("{:?}", row);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod config;
pub mod connector;
pub mod context;
pub mod decoder;
pub mod description;
pub mod error;
pub mod log;
pub mod reader;
pub mod retry;
pub mod schema;
pub mod split;
pub mod types;

pub use config::{KafkaConfig, RetrySettings};
pub use connector::{KafkaConnector, ScanPlan};
pub use context::{MetricsSnapshot, QueryContext, ScanMetrics};
pub use decoder::{DecodeError, DecodeErrorPolicy, DecoderSpec};
pub use description::TableDescription;
pub use error::{KafkaError, Result};
#[cfg(feature = "rdkafka")]
pub use log::KafkaLog;
pub use log::{LogCursor, LogError, LogRecord, LogService, MemoryLog, Watermarks};
pub use reader::{CursorGuard, ReaderOptions, ReaderState, SplitReader};
pub use retry::{RetryPolicy, Sleeper, TokioSleeper};
pub use schema::{Column, ColumnSource, InternalColumn, SchemaBinding, SchemaResolver};
pub use split::{KafkaSplit, SplitPlanner};
pub use types::{ColumnType, Row, Value};
