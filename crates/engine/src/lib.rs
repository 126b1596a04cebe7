//! Engine crate
//!
//! Runs SQL over connector tables with DataFusion. Each table of a registered
//! [`Connector`] is exposed as `schema.table`; tables with hidden columns
//! also get a `schema."table$internal"` view that includes them.
//!
//! # Example
//! ```rust
//! # #[tokio::main]
//! # async fn main() -> igloo_common::Result<()> {
//! let engine = igloo_engine::QueryEngine::new();
//! let batches = engine.execute("SELECT 42 AS answer").await?;
//! assert_eq!(batches[0].num_rows(), 1);
//! # Ok(())
//! # }
//! ```

pub mod connector_table;

use std::sync::Arc;

use datafusion::arrow::record_batch::RecordBatch;
use datafusion::catalog::{CatalogProvider, MemorySchemaProvider};
use datafusion::datasource::TableProvider;
use datafusion::execution::context::SessionContext;
use datafusion::sql::TableReference;
use igloo_common::{Error, Result};
use igloo_connector::Connector;
use tracing::info;

pub use connector_table::{ConnectorTable, SplitScanExec, HIDDEN_COLUMNS_SUFFIX};

const DEFAULT_MAX_CONCURRENT_SPLITS: usize = 8;

#[derive(Clone)]
pub struct QueryEngine {
    ctx: SessionContext,
    max_concurrent_splits: usize,
}

impl Default for QueryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryEngine {
    pub fn new() -> Self {
        QueryEngine { ctx: SessionContext::new(), max_concurrent_splits: DEFAULT_MAX_CONCURRENT_SPLITS }
    }

    /// Caps the number of splits read at once by a single table scan.
    pub fn with_max_concurrent_splits(mut self, max_concurrent_splits: usize) -> Self {
        self.max_concurrent_splits = max_concurrent_splits.max(1);
        self
    }

    pub fn register_table(
        &self,
        name: &str,
        table: Arc<dyn TableProvider>,
    ) -> Result<Option<Arc<dyn TableProvider>>> {
        Ok(self.ctx.register_table(name, table)?)
    }

    /// Registers every table of `connector` under its schema-qualified name.
    ///
    /// Columns the connector marks hidden are left out of `schema.table`.
    /// When a table has any, `schema."table$internal"` exposes all columns.
    pub fn register_connector<C: Connector + 'static>(&self, connector: Arc<C>) -> Result<()> {
        for table in connector.list_tables() {
            self.ensure_schema(&table.schema)?;
            let provider =
                ConnectorTable::try_new(Arc::clone(&connector), table.clone(), self.max_concurrent_splits)?;
            let reference = TableReference::partial(table.schema.as_str(), table.table.as_str());
            self.ctx.register_table(reference, Arc::new(provider))?;

            let full = ConnectorTable::try_new_with_hidden(
                Arc::clone(&connector),
                table.clone(),
                self.max_concurrent_splits,
            )?;
            if full.has_hidden_columns() {
                let name = format!("{}{}", table.table, HIDDEN_COLUMNS_SUFFIX);
                let reference = TableReference::partial(table.schema.as_str(), name.as_str());
                self.ctx.register_table(reference, Arc::new(full))?;
            }
            info!(connector = connector.name(), table = %table, "registered table");
        }
        Ok(())
    }

    pub async fn execute(&self, sql: &str) -> Result<Vec<RecordBatch>> {
        let df = self.ctx.sql(sql).await?;
        Ok(df.collect().await?)
    }

    fn ensure_schema(&self, schema: &str) -> Result<()> {
        let catalog_name = self.ctx.copied_config().options().catalog.default_catalog.clone();
        let catalog = self
            .ctx
            .catalog(&catalog_name)
            .ok_or_else(|| Error::Execution(format!("catalog {} is not registered", catalog_name)))?;
        if catalog.schema(schema).is_none() {
            catalog.register_schema(schema, Arc::new(MemorySchemaProvider::new()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datafusion::arrow::array::Int64Array;
    use datafusion::arrow::datatypes::{DataType, Field, Schema};
    use datafusion::datasource::MemTable;

    #[tokio::test]
    async fn can_execute_simple_query() {
        // Arrange
        let engine = QueryEngine::new();
        let sql = "SELECT 42 as answer;";

        // Act
        let results = engine.execute(sql).await.unwrap();

        // Assert
        assert_eq!(results.len(), 1, "Expected one RecordBatch");

        let batch = &results[0];

        // Check schema
        let expected_schema = Schema::new(vec![Field::new("answer", DataType::Int64, false)]);
        assert_eq!(batch.schema(), Arc::new(expected_schema), "Schema mismatch");

        // Check data
        assert_eq!(batch.num_rows(), 1, "Expected one row");
        let answer_column = batch
            .column_by_name("answer")
            .expect("answer column not found")
            .as_any()
            .downcast_ref::<Int64Array>()
            .expect("Failed to downcast to Int64Array");

        assert_eq!(answer_column.value(0), 42, "Incorrect value in answer column");
    }

    #[tokio::test]
    async fn invalid_sql_is_an_error() {
        let engine = QueryEngine::new();
        assert!(engine.execute("SELEC 1").await.is_err());
        assert!(engine.execute("SELECT * FROM missing").await.is_err());
    }

    #[tokio::test]
    async fn registered_tables_are_queryable() {
        let engine = QueryEngine::new();
        let schema = Arc::new(Schema::new(vec![Field::new("n", DataType::Int64, false)]));
        let batch = RecordBatch::try_new(
            Arc::clone(&schema),
            vec![Arc::new(Int64Array::from(vec![1, 2, 3]))],
        )
        .unwrap();
        let table = MemTable::try_new(schema, vec![vec![batch]]).unwrap();
        engine.register_table("numbers", Arc::new(table)).unwrap();

        let results = engine.execute("SELECT sum(n) AS total FROM numbers").await.unwrap();
        let total = results[0].column(0).as_any().downcast_ref::<Int64Array>().unwrap();
        assert_eq!(total.value(0), 6);
    }
}
