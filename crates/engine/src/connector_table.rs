//! DataFusion table backed by a [`Connector`].
//!
//! A scan plans the table's splits and returns a [`SplitScanExec`] with one
//! output partition per split. Each partition opens its split only when
//! executed and streams batches as the connector produces them, so a
//! satisfied LIMIT or a dropped query stops the reader.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use datafusion::catalog::Session;
use datafusion::datasource::{TableProvider, TableType};
use datafusion::error::{DataFusionError, Result};
use datafusion::execution::context::TaskContext;
use datafusion::logical_expr::Expr;
use datafusion::physical_expr::EquivalenceProperties;
use datafusion::physical_plan::execution_plan::{Boundedness, EmissionType};
use datafusion::physical_plan::stream::RecordBatchStreamAdapter;
use datafusion::physical_plan::{
    DisplayAs, DisplayFormatType, ExecutionPlan, Partitioning, PlanProperties, SendableRecordBatchStream,
};
use futures::{stream, Stream, StreamExt, TryStreamExt};
use igloo_connector::{is_hidden, Connector, TableName};
use tokio::sync::Semaphore;
use tracing::debug;

/// Suffix of the table name under which hidden columns are exposed too.
pub const HIDDEN_COLUMNS_SUFFIX: &str = "$internal";

pub struct ConnectorTable<C: Connector> {
    connector: Arc<C>,
    table: TableName,
    /// Exposed columns, as indices into the connector's schema.
    columns: Vec<usize>,
    schema: SchemaRef,
    max_concurrent_splits: usize,
}

impl<C: Connector> fmt::Debug for ConnectorTable<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorTable")
            .field("connector", &self.connector.name())
            .field("table", &self.table)
            .field("columns", &self.columns)
            .field("max_concurrent_splits", &self.max_concurrent_splits)
            .finish()
    }
}

impl<C: Connector + 'static> ConnectorTable<C> {
    /// Exposes the visible columns of `table`. Fields marked hidden by the
    /// connector are left out.
    pub fn try_new(
        connector: Arc<C>,
        table: TableName,
        max_concurrent_splits: usize,
    ) -> igloo_common::Result<Self> {
        Self::build(connector, table, max_concurrent_splits, false)
    }

    /// Exposes every column of `table`, hidden ones included.
    pub fn try_new_with_hidden(
        connector: Arc<C>,
        table: TableName,
        max_concurrent_splits: usize,
    ) -> igloo_common::Result<Self> {
        Self::build(connector, table, max_concurrent_splits, true)
    }

    fn build(
        connector: Arc<C>,
        table: TableName,
        max_concurrent_splits: usize,
        include_hidden: bool,
    ) -> igloo_common::Result<Self> {
        let source = connector.table_schema(&table)?;
        let columns: Vec<usize> = source
            .fields()
            .iter()
            .enumerate()
            .filter(|(_, field)| include_hidden || !is_hidden(field))
            .map(|(i, _)| i)
            .collect();
        let schema = Arc::new(source.project(&columns)?);
        Ok(Self { connector, table, columns, schema, max_concurrent_splits: max_concurrent_splits.max(1) })
    }

    pub fn table(&self) -> &TableName {
        &self.table
    }

    /// Whether the table exposes columns the connector marks hidden.
    pub fn has_hidden_columns(&self) -> bool {
        self.schema.fields().iter().any(|field| is_hidden(field))
    }
}

#[async_trait]
impl<C: Connector + 'static> TableProvider for ConnectorTable<C> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn table_type(&self) -> TableType {
        TableType::Base
    }

    async fn scan(
        &self,
        _state: &dyn Session,
        projection: Option<&Vec<usize>>,
        _filters: &[Expr],
        limit: Option<usize>,
    ) -> Result<Arc<dyn ExecutionPlan>> {
        // Filters are never pushed down, so `limit` bounds every partition.
        let columns = match projection {
            Some(indices) => indices
                .iter()
                .map(|&i| {
                    self.columns.get(i).copied().ok_or_else(|| {
                        DataFusionError::Internal(format!("{} has no column {}", self.table, i))
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            None => self.columns.clone(),
        };
        let splits = self.connector.get_splits(&self.table).await.map_err(igloo_common::Error::into_datafusion)?;
        debug!(table = %self.table, splits = splits.len(), ?limit, "planned connector scan");

        let schema = match projection {
            Some(indices) => Arc::new(self.schema.project(indices)?),
            None => Arc::clone(&self.schema),
        };
        Ok(Arc::new(SplitScanExec::new(
            Arc::clone(&self.connector),
            self.table.clone(),
            splits,
            columns,
            schema,
            limit,
            self.max_concurrent_splits,
        )))
    }
}

/// Leaf plan reading one split per output partition.
pub struct SplitScanExec<C: Connector> {
    connector: Arc<C>,
    table: TableName,
    splits: Arc<Vec<C::Split>>,
    /// Output columns, as indices into the connector's batches.
    columns: Vec<usize>,
    schema: SchemaRef,
    limit: Option<usize>,
    /// Shared by every partition of this scan.
    permits: Arc<Semaphore>,
    properties: PlanProperties,
}

impl<C: Connector> fmt::Debug for SplitScanExec<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SplitScanExec")
            .field("table", &self.table)
            .field("splits", &self.splits.len())
            .field("columns", &self.columns)
            .field("limit", &self.limit)
            .finish()
    }
}

impl<C: Connector + 'static> SplitScanExec<C> {
    pub fn new(
        connector: Arc<C>,
        table: TableName,
        splits: Vec<C::Split>,
        columns: Vec<usize>,
        schema: SchemaRef,
        limit: Option<usize>,
        max_concurrent_splits: usize,
    ) -> Self {
        // A table without splits still needs one (empty) partition.
        let partitions = splits.len().max(1);
        let properties = PlanProperties::new(
            EquivalenceProperties::new(Arc::clone(&schema)),
            Partitioning::UnknownPartitioning(partitions),
            EmissionType::Incremental,
            Boundedness::Bounded,
        );
        Self {
            connector,
            table,
            splits: Arc::new(splits),
            columns,
            schema,
            limit,
            permits: Arc::new(Semaphore::new(max_concurrent_splits.max(1))),
            properties,
        }
    }

    pub fn split_count(&self) -> usize {
        self.splits.len()
    }
}

impl<C: Connector + 'static> DisplayAs for SplitScanExec<C> {
    fn fmt_as(&self, _t: DisplayFormatType, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SplitScanExec: table={}, splits={}", self.table, self.splits.len())?;
        if let Some(limit) = self.limit {
            write!(f, ", limit={}", limit)?;
        }
        Ok(())
    }
}

impl<C: Connector + 'static> ExecutionPlan for SplitScanExec<C> {
    fn name(&self) -> &str {
        "SplitScanExec"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn properties(&self) -> &PlanProperties {
        &self.properties
    }

    fn children(&self) -> Vec<&Arc<dyn ExecutionPlan>> {
        vec![]
    }

    fn with_new_children(self: Arc<Self>, _children: Vec<Arc<dyn ExecutionPlan>>) -> Result<Arc<dyn ExecutionPlan>> {
        Ok(self)
    }

    fn execute(&self, partition: usize, _context: Arc<TaskContext>) -> Result<SendableRecordBatchStream> {
        let schema = Arc::clone(&self.schema);
        if self.splits.is_empty() {
            return Ok(Box::pin(RecordBatchStreamAdapter::new(schema, stream::empty())));
        }
        if partition >= self.splits.len() {
            return Err(DataFusionError::Internal(format!(
                "{} has {} splits, partition {} requested",
                self.table,
                self.splits.len(),
                partition
            )));
        }

        let connector = Arc::clone(&self.connector);
        let splits = Arc::clone(&self.splits);
        let permits = Arc::clone(&self.permits);
        let columns = self.columns.clone();
        let opened = async move {
            // Held until the partition's stream is dropped.
            let permit = permits.acquire_owned().await.map_err(|e| DataFusionError::External(Box::new(e)))?;
            let split = &splits[partition];
            debug!(split = %split, "opening split");
            let batches = connector.read_split(split).await.map_err(igloo_common::Error::into_datafusion)?;
            Ok::<_, DataFusionError>(batches.map(move |batch| {
                let _permit = &permit;
                let batch = batch.map_err(igloo_common::Error::into_datafusion)?;
                Ok(batch.project(&columns)?)
            }))
        };
        let batches = limit_rows(stream::once(opened).try_flatten(), self.limit);
        Ok(Box::pin(RecordBatchStreamAdapter::new(schema, batches)))
    }
}

/// Ends `batches` once `limit` rows have been produced. The inner stream is
/// dropped at that point, without being polled again.
fn limit_rows<S>(batches: S, limit: Option<usize>) -> impl Stream<Item = Result<RecordBatch>> + Send
where
    S: Stream<Item = Result<RecordBatch>> + Send,
{
    let remaining = limit.unwrap_or(usize::MAX);
    stream::try_unfold((Box::pin(batches), remaining), |(mut batches, remaining)| async move {
        if remaining == 0 {
            return Ok(None);
        }
        match batches.try_next().await? {
            Some(batch) => {
                let batch = if batch.num_rows() > remaining { batch.slice(0, remaining) } else { batch };
                let remaining = remaining - batch.num_rows();
                Ok(Some((batch, (batches, remaining))))
            }
            None => Ok(None),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema};

    fn batch(values: Vec<i64>) -> Result<RecordBatch> {
        let schema = Arc::new(Schema::new(vec![Field::new("n", DataType::Int64, false)]));
        Ok(RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values))])?)
    }

    #[tokio::test]
    async fn test_limit_slices_and_stops_pulling() {
        let mut pulled = 0;
        let source = stream::iter((0..10).map(move |i| {
            pulled += 1;
            assert!(pulled <= 2, "pulled past the limit");
            batch(vec![i * 3, i * 3 + 1, i * 3 + 2])
        }));
        let batches: Vec<RecordBatch> = limit_rows(source, Some(5)).try_collect().await.unwrap();
        let rows: Vec<usize> = batches.iter().map(RecordBatch::num_rows).collect();
        assert_eq!(rows, vec![3, 2]);
    }

    #[tokio::test]
    async fn test_no_limit_passes_everything() {
        let source = stream::iter((0..4).map(|i| batch(vec![i])));
        let batches: Vec<RecordBatch> = limit_rows(source, None).try_collect().await.unwrap();
        assert_eq!(batches.len(), 4);
    }
}
