use arrow::error::ArrowError;
use datafusion::error::DataFusionError;
use thiserror::Error;

/// Unified error type for Igloo crates.
#[derive(Debug, Error)]
pub enum Error {
    #[error("An unknown error occurred: {0}")]
    Unknown(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Execution error: {0}")]
    Execution(String),
    #[error("Operation not supported: {0}")]
    NotSupported(String),
    #[error("Table not found: {0}")]
    TableNotFound(String),
    #[error("Invalid schema for table {table}: {message}")]
    InvalidSchema { table: String, message: String },
    #[error("Connector error: {0}")]
    Connector(String),
    #[error("Split {split} failed: {message}")]
    SplitFailed { split: String, message: String },
    #[error("Query cancelled")]
    Cancelled,
    #[error("Arrow error: {0}")]
    Arrow(#[from] ArrowError),
    #[error("DataFusion error: {0}")]
    DataFusion(#[from] DataFusionError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn new(msg: &str) -> Self {
        Error::Unknown(msg.to_string())
    }

    /// Wraps the error so it can cross the DataFusion execution boundary.
    pub fn into_datafusion(self) -> DataFusionError {
        match self {
            Error::DataFusion(e) => e,
            other => DataFusionError::External(Box::new(other)),
        }
    }
}
