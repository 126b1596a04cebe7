use std::path::PathBuf;

use arrow::error::ArrowError;
use igloo_connector::TableName;
use thiserror::Error;

use crate::decoder::DecodeError;
use crate::log::LogError;

#[derive(Error, Debug)]
pub enum KafkaError {
    #[error("Table not found: {0}")]
    TableNotFound(TableName),

    #[error("Topic {topic} of table {table} does not exist")]
    TopicNotFound { table: TableName, topic: String },

    #[error("Invalid schema for table {table}: {message}")]
    InvalidSchema { table: String, message: String },

    #[error("Failed to read table description {path}")]
    DescriptionIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse table description {path}")]
    DescriptionParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to load configuration")]
    Config(#[from] config::ConfigError),

    #[error("Split {split}: record at offset {offset} failed to decode: {source}")]
    Decode {
        split: String,
        offset: i64,
        #[source]
        source: DecodeError,
    },

    #[error("Metadata for topic {topic} unavailable after {attempts} attempts: {source}")]
    Metadata {
        topic: String,
        attempts: u32,
        #[source]
        source: LogError,
    },

    #[error("Log service error: {0}")]
    Log(#[from] LogError),

    #[error("Split {split} failed after {attempts} attempts: {source}")]
    FatalSplitFailure {
        split: String,
        attempts: u32,
        #[source]
        source: LogError,
    },

    #[error("Split {split} was read after it failed")]
    ReaderFailed { split: String },

    #[error("Scan of {0} was cancelled")]
    Cancelled(String),

    #[error("Arrow error: {0}")]
    Arrow(#[from] ArrowError),
}

pub type Result<T> = std::result::Result<T, KafkaError>;

impl KafkaError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, KafkaError::Cancelled(_))
    }

    /// The split named by a scan error.
    pub fn split(&self) -> Option<&str> {
        match self {
            KafkaError::Decode { split, .. }
            | KafkaError::FatalSplitFailure { split, .. }
            | KafkaError::ReaderFailed { split } => Some(split),
            _ => None,
        }
    }
}

impl From<KafkaError> for igloo_common::Error {
    fn from(err: KafkaError) -> Self {
        match err {
            KafkaError::TableNotFound(table) => igloo_common::Error::TableNotFound(table.to_string()),
            KafkaError::InvalidSchema { table, message } => {
                igloo_common::Error::InvalidSchema { table, message }
            }
            KafkaError::Cancelled(_) => igloo_common::Error::Cancelled,
            KafkaError::Arrow(e) => igloo_common::Error::Arrow(e),
            other => match other.split() {
                Some(split) => igloo_common::Error::SplitFailed {
                    split: split.to_string(),
                    message: other.to_string(),
                },
                None => igloo_common::Error::Connector(other.to_string()),
            },
        }
    }
}
