use std::sync::Arc;

use arrow::datatypes::SchemaRef;
use futures::{stream, TryStreamExt};
use igloo_connector::{Connector, RecordBatchStream, TableName};
use tracing::debug;

use crate::config::KafkaConfig;
use crate::context::QueryContext;
use crate::error::{KafkaError, Result};
use crate::log::LogService;
use crate::reader::{ReaderOptions, SplitReader};
use crate::retry::{Sleeper, TokioSleeper};
use crate::schema::{Column, SchemaResolver};
use crate::split::{KafkaSplit, SplitPlanner};

/// The splits of one scan, together with the context they share.
#[derive(Debug)]
pub struct ScanPlan {
    pub context: Arc<QueryContext>,
    pub splits: Vec<KafkaSplit>,
}

impl ScanPlan {
    /// Cancels every reader opened for this plan.
    pub fn cancel(&self) {
        self.context.cancel();
    }
}

/// Exposes the topics of a log service as tables.
#[derive(Debug)]
pub struct KafkaConnector {
    config: KafkaConfig,
    resolver: SchemaResolver,
    log: Arc<dyn LogService>,
    sleeper: Arc<dyn Sleeper>,
}

impl KafkaConnector {
    /// Loads table descriptions from `config.table_description_dir`.
    pub fn new(config: KafkaConfig, log: Arc<dyn LogService>) -> Result<Self> {
        let resolver = SchemaResolver::load(&config)?;
        Ok(Self::with_resolver(config, resolver, log))
    }

    pub fn with_resolver(config: KafkaConfig, resolver: SchemaResolver, log: Arc<dyn LogService>) -> Self {
        Self { config, resolver, log, sleeper: Arc::new(TokioSleeper) }
    }

    /// Connects to the brokers in `config.nodes`.
    #[cfg(feature = "rdkafka")]
    pub fn from_config(config: KafkaConfig) -> Result<Self> {
        let log = crate::log::KafkaLog::new(&config)?;
        Self::new(config, Arc::new(log))
    }

    /// Replaces the sleeper used for retry backoff.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn config(&self) -> &KafkaConfig {
        &self.config
    }

    pub fn list_tables(&self) -> Vec<TableName> {
        self.resolver.list_tables()
    }

    pub fn describe_table(&self, table: &TableName) -> Result<Vec<Column>> {
        self.resolver.describe_table(table)
    }

    /// Resolves `table` and plans its splits under a fresh query context.
    pub async fn plan_splits(&self, table: &TableName) -> Result<ScanPlan> {
        let binding = self.resolver.resolve(table)?;
        let context = Arc::new(QueryContext::new(binding));
        let planner = SplitPlanner::new(
            Arc::clone(&self.log),
            self.config.messages_per_split,
            self.config.retry_policy(),
            Arc::clone(&self.sleeper),
        );
        let splits = planner.plan_splits(&context).await?;
        Ok(ScanPlan { context, splits })
    }

    pub fn open_reader(&self, split: &KafkaSplit) -> SplitReader {
        let options = ReaderOptions::from_config(&self.config).with_sleeper(Arc::clone(&self.sleeper));
        SplitReader::open(split.clone(), Arc::clone(&self.log), options)
    }
}

#[async_trait::async_trait]
impl Connector for KafkaConnector {
    type Split = KafkaSplit;

    fn name(&self) -> &str {
        "kafka"
    }

    fn list_tables(&self) -> Vec<TableName> {
        KafkaConnector::list_tables(self)
    }

    fn table_schema(&self, table: &TableName) -> igloo_common::Result<SchemaRef> {
        Ok(self.resolver.resolve(table)?.arrow_schema())
    }

    async fn get_splits(&self, table: &TableName) -> igloo_common::Result<Vec<KafkaSplit>> {
        Ok(self.plan_splits(table).await?.splits)
    }

    async fn read_split(&self, split: &KafkaSplit) -> igloo_common::Result<RecordBatchStream> {
        let reader = self.open_reader(split);
        let builder = reader.batch_builder(None, self.config.batch_size)?;
        let batch_size = self.config.batch_size;
        debug!(split = %split, "reading split");

        let batches = stream::try_unfold((reader, builder), move |(mut reader, mut builder)| async move {
            let batch = reader.next_batch(&mut builder, batch_size).await?;
            Ok::<_, KafkaError>(batch.map(|batch| (batch, (reader, builder))))
        });
        Ok(Box::pin(batches.map_err(igloo_common::Error::from)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::description::TableDescription;
    use crate::log::MemoryLog;
    use arrow::array::Int64Array;
    use futures::StreamExt;

    fn connector(log: &MemoryLog) -> KafkaConnector {
        let config = KafkaConfig { messages_per_split: 2, batch_size: 2, ..KafkaConfig::default() };
        let description: TableDescription = serde_json::from_value(serde_json::json!({
            "tableName": "numbers",
            "topicName": "numbers",
            "message": { "dataFormat": "csv", "fields": [{ "name": "n", "type": "BIGINT", "mapping": "0" }] }
        }))
        .unwrap();
        let resolver = SchemaResolver::from_descriptions(&config, [description]).unwrap();
        KafkaConnector::with_resolver(config, resolver, Arc::new(log.clone()))
    }

    fn numbers(count: usize) -> MemoryLog {
        let log = MemoryLog::new();
        log.create_topic("numbers", 1);
        for i in 0..count {
            log.append("numbers", 0, None, i.to_string().as_bytes()).unwrap();
        }
        log
    }

    #[tokio::test]
    async fn test_plan_and_read_every_split() {
        let log = numbers(5);
        let connector = connector(&log);
        let table = TableName::new("default", "numbers");
        let plan = connector.plan_splits(&table).await.unwrap();
        assert_eq!(plan.splits.len(), 3);

        let mut values = Vec::new();
        for split in &plan.splits {
            let mut reader = connector.open_reader(split);
            while let Some(row) = reader.next().await.unwrap() {
                values.push(row[0].as_i64().unwrap());
            }
        }
        assert_eq!(values, vec![0, 1, 2, 3, 4]);
        assert_eq!(plan.context.metrics.snapshot().splits_completed, 3);
    }

    #[tokio::test]
    async fn test_unknown_table() {
        let connector = connector(&numbers(0));
        let err = connector.plan_splits(&TableName::new("default", "missing")).await.unwrap_err();
        assert!(matches!(err, KafkaError::TableNotFound(_)));
        assert!(Connector::table_schema(&connector, &TableName::new("default", "missing")).is_err());
    }

    #[tokio::test]
    async fn test_read_split_streams_batches() {
        let log = numbers(4);
        let connector = connector(&log);
        let table = TableName::new("default", "numbers");
        let schema = Connector::table_schema(&connector, &table).unwrap();
        let splits = connector.get_splits(&table).await.unwrap();
        assert_eq!(splits.len(), 2);

        let mut stream = connector.read_split(&splits[1]).await.unwrap();
        let batch = stream.next().await.unwrap().unwrap();
        assert_eq!(batch.schema(), schema);
        let column = batch.column(0).as_any().downcast_ref::<Int64Array>().unwrap();
        assert_eq!(column.values().to_vec(), vec![2, 3]);
        assert!(stream.next().await.is_none());
        assert_eq!(log.open_cursors(), 0);
    }

    #[tokio::test]
    async fn test_read_split_failure_names_the_split() {
        let log = numbers(2);
        log.append("numbers", 0, None, b"not a number").unwrap();
        let connector = connector(&log);
        let plan = connector.plan_splits(&TableName::new("default", "numbers")).await.unwrap();

        let mut stream = connector.read_split(&plan.splits[1]).await.unwrap();
        match stream.next().await {
            Some(Err(igloo_common::Error::SplitFailed { split, .. })) => {
                assert_eq!(split, "default.numbers numbers/0[2..3)");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
