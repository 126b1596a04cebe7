//! Connector interface.
//!
//! A connector exposes a set of tables and breaks each table scan into
//! independent splits that the engine reads in parallel.

use std::fmt;
use std::pin::Pin;

use arrow::datatypes::{Field, SchemaRef};
use arrow::record_batch::RecordBatch;
use futures::Stream;
use igloo_common::{Error, Result};

/// Stream of record batches produced by reading one split.
pub type RecordBatchStream = Pin<Box<dyn Stream<Item = Result<RecordBatch>> + Send>>;

/// Field metadata key marking a column that is left out of `SELECT *`.
pub const HIDDEN_FIELD_METADATA: &str = "hidden";

/// Whether `field` carries `hidden = true` metadata.
pub fn is_hidden(field: &Field) -> bool {
    field.metadata().get(HIDDEN_FIELD_METADATA).is_some_and(|v| v == "true")
}

/// A schema-qualified table name, e.g. `tpch.orders`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableName {
    pub schema: String,
    pub table: String,
}

impl TableName {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self { schema: schema.into(), table: table.into() }
    }

    /// Parses `schema.table`, or a bare `table` placed in `default_schema`.
    pub fn parse(name: &str, default_schema: &str) -> Result<Self> {
        match name.split_once('.') {
            Some((schema, table)) if !schema.is_empty() && !table.is_empty() && !table.contains('.') => {
                Ok(Self::new(schema, table))
            }
            None if !name.is_empty() => Ok(Self::new(default_schema, name)),
            _ => Err(Error::TableNotFound(name.to_string())),
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

/// The core trait for any Igloo data source connector.
///
/// Splits returned by [`Connector::get_splits`] are planned up front, before
/// any of them is read, so the engine may hand them to workers in any order.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    /// A unit of scan work. Displays as something a user can recognise in an
    /// error message.
    type Split: fmt::Display + Send + Sync + 'static;

    /// Name the connector is registered under.
    fn name(&self) -> &str;

    /// All tables this connector can serve.
    fn list_tables(&self) -> Vec<TableName>;

    /// Arrow schema of the batches produced for `table`.
    fn table_schema(&self, table: &TableName) -> Result<SchemaRef>;

    /// Given a table identifier, return a list of splits.
    async fn get_splits(&self, table: &TableName) -> Result<Vec<Self::Split>>;

    /// Given a split, return a stream of Arrow RecordBatches.
    async fn read_split(&self, split: &Self::Split) -> Result<RecordBatchStream>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_qualified_name() {
        let name = TableName::parse("tpch.orders", "default").unwrap();
        assert_eq!(name, TableName::new("tpch", "orders"));
        assert_eq!(name.to_string(), "tpch.orders");
    }

    #[test]
    fn test_parse_bare_name_uses_default_schema() {
        let name = TableName::parse("orders", "default").unwrap();
        assert_eq!(name, TableName::new("default", "orders"));
    }

    #[test]
    fn test_parse_rejects_malformed_names() {
        assert!(TableName::parse("", "default").is_err());
        assert!(TableName::parse(".orders", "default").is_err());
        assert!(TableName::parse("a.b.c", "default").is_err());
    }

    #[test]
    fn test_hidden_field_metadata() {
        use std::collections::HashMap;
        let plain = Field::new("id", arrow::datatypes::DataType::Int64, true);
        assert!(!is_hidden(&plain));
        let hidden = plain
            .clone()
            .with_metadata(HashMap::from([(HIDDEN_FIELD_METADATA.to_string(), "true".to_string())]));
        assert!(is_hidden(&hidden));
    }
}
