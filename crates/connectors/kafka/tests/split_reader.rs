use std::sync::Arc;
use std::time::Duration;

use igloo_connector::TableName;
use igloo_connector_kafka::{
    DecodeErrorPolicy, KafkaConfig, KafkaConnector, KafkaError, LogError, MemoryLog, ReaderState, SchemaResolver,
    Sleeper, TableDescription, Value,
};
use parking_lot::Mutex;

#[derive(Debug, Default)]
struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

#[async_trait::async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.delays.lock().push(duration);
    }
}

fn events_table() -> TableName {
    TableName::new("default", "events")
}

fn connector(log: &MemoryLog, config: KafkaConfig) -> KafkaConnector {
    let description: TableDescription = serde_json::from_value(serde_json::json!({
        "tableName": "events",
        "topicName": "events",
        "key": { "dataFormat": "raw", "fields": [
            { "name": "event_key", "type": "INTEGER", "dataFormat": "INT", "mapping": "0" }
        ]},
        "message": { "dataFormat": "json", "fields": [
            { "name": "value", "type": "BIGINT", "mapping": "value" },
            { "name": "kind", "type": "VARCHAR", "mapping": "kind", "default": "unknown" }
        ]}
    }))
    .unwrap();
    let resolver = SchemaResolver::from_descriptions(&config, [description]).unwrap();
    KafkaConnector::with_resolver(config, resolver, Arc::new(log.clone()))
}

fn fill(log: &MemoryLog, partitions: usize, per_partition: i64) {
    log.create_topic("events", partitions);
    for partition in 0..partitions as i32 {
        for value in 0..per_partition {
            let key = (value as i32).to_be_bytes();
            let payload = format!(r#"{{"value": {}}}"#, value);
            log.append("events", partition, Some(&key[..]), payload.as_bytes()).unwrap();
        }
    }
}

fn value_column(connector: &KafkaConnector) -> usize {
    connector
        .describe_table(&events_table())
        .unwrap()
        .iter()
        .position(|c| c.name == "value")
        .unwrap()
}

fn readings_connector(log: &MemoryLog) -> KafkaConnector {
    let config = KafkaConfig::default();
    let description: TableDescription = serde_json::from_value(serde_json::json!({
        "tableName": "readings",
        "message": { "dataFormat": "raw", "fields": [
            { "name": "value", "type": "BIGINT", "dataFormat": "LONG", "mapping": "0" }
        ]}
    }))
    .unwrap();
    let resolver = SchemaResolver::from_descriptions(&config, [description]).unwrap();
    KafkaConnector::with_resolver(config, resolver, Arc::new(log.clone()))
}

fn readings(partitions: usize, per_partition: i64) -> MemoryLog {
    let log = MemoryLog::new();
    log.create_topic("default.readings", partitions);
    for partition in 0..partitions as i32 {
        for i in 0..per_partition {
            let value = i64::from(partition) * 1000 + i;
            log.append("default.readings", partition, None, &value.to_be_bytes()).unwrap();
        }
    }
    log
}

#[tokio::test]
async fn test_parallel_readers_cover_every_record_once() {
    let log = readings(3, 100);
    let connector = Arc::new(readings_connector(&log));
    let table = TableName::new("default", "readings");

    let plan = connector.plan_splits(&table).await.unwrap();
    let ranges: Vec<_> = plan.splits.iter().map(|s| (s.partition, s.start, s.end)).collect();
    assert_eq!(ranges, vec![(0, 0, 100), (1, 0, 100), (2, 0, 100)]);

    let mut tasks = Vec::new();
    for split in plan.splits.clone() {
        let connector = Arc::clone(&connector);
        tasks.push(tokio::spawn(async move {
            let mut reader = connector.open_reader(&split);
            let mut offsets = Vec::new();
            let mut sum = 0;
            while let Some(row) = reader.next().await.unwrap() {
                sum += row[0].as_i64().unwrap();
                offsets.push(row[2].as_i64().unwrap());
            }
            (split.start, split.end, offsets, sum)
        }));
    }

    let mut total = 0;
    for task in tasks {
        let (start, end, offsets, sum) = task.await.unwrap();
        assert_eq!(offsets, (start..end).collect::<Vec<_>>());
        total += sum;
    }
    let expected: i64 = (0..3).map(|p| (0..100).map(|i| p * 1000 + i).sum::<i64>()).sum();
    assert_eq!(total, expected);
    assert_eq!(log.open_cursors(), 0);
    assert_eq!(plan.context.metrics.snapshot().rows_produced, 300);
}

#[tokio::test]
async fn test_closing_one_reader_leaves_the_others_running() {
    let log = readings(3, 100);
    let connector = readings_connector(&log);
    let plan = connector.plan_splits(&TableName::new("default", "readings")).await.unwrap();

    let mut readers: Vec<_> = plan.splits.iter().map(|s| connector.open_reader(s)).collect();
    for _ in 0..50 {
        assert!(readers[0].next().await.unwrap().is_some());
    }
    assert_eq!(log.open_cursors(), 1);
    readers[0].close();
    assert_eq!(readers[0].state(), ReaderState::Closed);
    assert_eq!(log.open_cursors(), 0);
    assert!(readers[0].next().await.unwrap().is_none());

    let mut rows = 0;
    for reader in &mut readers[1..] {
        while reader.next().await.unwrap().is_some() {
            rows += 1;
        }
        assert_eq!(reader.state(), ReaderState::Exhausted);
    }
    assert_eq!(rows, 200);
    assert_eq!(log.open_cursors(), 0);
}

#[tokio::test]
async fn test_cancelling_the_query_stops_every_reader() {
    let log = MemoryLog::new();
    fill(&log, 2, 10);
    let connector = connector(&log, KafkaConfig::default());
    let plan = connector.plan_splits(&events_table()).await.unwrap();

    let mut first = connector.open_reader(&plan.splits[0]);
    let mut second = connector.open_reader(&plan.splits[1]);
    first.next().await.unwrap();
    second.next().await.unwrap();
    assert_eq!(log.open_cursors(), 2);

    plan.cancel();
    assert!(first.next().await.unwrap_err().is_cancelled());
    assert!(second.next().await.unwrap_err().is_cancelled());
    assert_eq!(log.open_cursors(), 0);
    assert_eq!(plan.context.metrics.snapshot().splits_failed, 0);
}

#[tokio::test]
async fn test_empty_partition_yields_an_empty_split() {
    let log = MemoryLog::new();
    fill(&log, 2, 0);
    let connector = connector(&log, KafkaConfig::default());
    let plan = connector.plan_splits(&events_table()).await.unwrap();
    assert_eq!(plan.splits.len(), 2);

    for split in &plan.splits {
        assert!(split.is_empty());
        let mut reader = connector.open_reader(split);
        assert!(reader.next().await.unwrap().is_none());
    }
    assert_eq!(log.cursors_opened(), 0);
}

#[tokio::test]
async fn test_missing_payload_fields_and_internal_columns() {
    let log = MemoryLog::new();
    log.create_topic("events", 1);
    log.append_with_timestamp("events", 0, None, br#"{"value": 7, "kind": "click"}"#, Some(1_700_000_000_000))
        .unwrap();
    log.append("events", 0, Some(&3i32.to_be_bytes()[..]), br#"{"value": 8}"#).unwrap();
    let connector = connector(&log, KafkaConfig::default());
    let plan = connector.plan_splits(&events_table()).await.unwrap();
    let mut reader = connector.open_reader(&plan.splits[0]);

    let first = reader.next().await.unwrap().unwrap();
    // event_key, value, kind, then the internal columns.
    assert_eq!(&first[..3], &[Value::Null, Value::BigInt(7), Value::Varchar("click".to_string())]);
    assert_eq!(first[3], Value::BigInt(0));
    assert_eq!(first[5], Value::Timestamp(1_700_000_000_000));
    assert_eq!(first[6], Value::Null);

    let second = reader.next().await.unwrap().unwrap();
    assert_eq!(&second[..3], &[Value::Integer(3), Value::BigInt(8), Value::Varchar("unknown".to_string())]);
    assert_eq!(second[4], Value::BigInt(1));
}

#[tokio::test]
async fn test_skip_and_fail_policies() {
    let log = MemoryLog::new();
    log.create_topic("events", 1);
    for payload in [r#"{"value": 1}"#, r#"{"value": "one"}"#, "{", r#"{"value": 4}"#] {
        log.append("events", 0, None, payload.as_bytes()).unwrap();
    }

    let skipping = connector(&log, KafkaConfig { on_decode_error: DecodeErrorPolicy::Skip, ..KafkaConfig::default() });
    let plan = skipping.plan_splits(&events_table()).await.unwrap();
    let mut reader = skipping.open_reader(&plan.splits[0]);
    let mut values = Vec::new();
    while let Some(row) = reader.next().await.unwrap() {
        values.push(row[1].clone());
    }
    assert_eq!(values, vec![Value::BigInt(1), Value::BigInt(4)]);
    assert_eq!(plan.context.metrics.skipped_records(), 2);

    let failing = connector(&log, KafkaConfig::default());
    let plan = failing.plan_splits(&events_table()).await.unwrap();
    let mut reader = failing.open_reader(&plan.splits[0]);
    reader.next().await.unwrap();
    match reader.next().await {
        Err(KafkaError::Decode { offset, source, .. }) => {
            assert_eq!(offset, 1);
            assert!(source.is_type_mismatch());
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(log.open_cursors(), 0);
}

#[tokio::test]
async fn test_skipping_the_only_record_yields_an_empty_split() {
    let log = MemoryLog::new();
    log.create_topic("events", 1);
    log.append("events", 0, None, br#"{"value": "seven"}"#).unwrap();

    let connector = connector(&log, KafkaConfig { on_decode_error: DecodeErrorPolicy::Skip, ..KafkaConfig::default() });
    let plan = connector.plan_splits(&events_table()).await.unwrap();
    assert_eq!(plan.splits.len(), 1);
    let mut reader = connector.open_reader(&plan.splits[0]);
    assert!(reader.next().await.unwrap().is_none());
    assert_eq!(reader.state(), ReaderState::Exhausted);
    assert_eq!(plan.context.metrics.skipped_records(), 1);
    assert_eq!(plan.context.metrics.snapshot().rows_produced, 0);
    assert_eq!(log.open_cursors(), 0);
}

#[tokio::test]
async fn test_retention_after_planning_shrinks_the_split() {
    let log = MemoryLog::new();
    fill(&log, 1, 10);
    let connector = connector(&log, KafkaConfig::default());
    let column = value_column(&connector);
    let plan = connector.plan_splits(&events_table()).await.unwrap();

    log.truncate_before("events", 0, 6).unwrap();
    log.compact("events", 0, &[8]).unwrap();
    // Appended after planning, outside the split.
    log.append("events", 0, None, br#"{"value": 10}"#).unwrap();

    let mut reader = connector.open_reader(&plan.splits[0]);
    let mut values = Vec::new();
    while let Some(row) = reader.next().await.unwrap() {
        values.push(row[column].as_i64().unwrap());
    }
    assert_eq!(values, vec![6, 7, 9]);
}

#[tokio::test]
async fn test_transient_failures_back_off_exponentially() {
    let log = MemoryLog::new();
    fill(&log, 1, 3);
    let sleeper = Arc::new(RecordingSleeper::default());
    let config = KafkaConfig::default();
    let connector = connector(&log, config).with_sleeper(sleeper.clone());
    let plan = connector.plan_splits(&events_table()).await.unwrap();

    log.fail_next_fetches(3, LogError::Transient("request timed out".to_string()));
    let mut reader = connector.open_reader(&plan.splits[0]);
    let mut rows = 0;
    while reader.next().await.unwrap().is_some() {
        rows += 1;
    }
    assert_eq!(rows, 3);
    assert_eq!(
        *sleeper.delays.lock(),
        vec![Duration::from_millis(50), Duration::from_millis(100), Duration::from_millis(200)]
    );
}

#[tokio::test]
async fn test_retry_budget_exhaustion_is_fatal() {
    let log = MemoryLog::new();
    fill(&log, 1, 3);
    let sleeper = Arc::new(RecordingSleeper::default());
    let mut config = KafkaConfig::default();
    config.retry.max_attempts = 2;
    let connector = connector(&log, config).with_sleeper(sleeper.clone());
    let plan = connector.plan_splits(&events_table()).await.unwrap();

    log.fail_next_fetches(2, LogError::Transient("broker unavailable".to_string()));
    let mut reader = connector.open_reader(&plan.splits[0]);
    match reader.next().await {
        Err(KafkaError::FatalSplitFailure { split, attempts, .. }) => {
            assert_eq!(split, "default.events events/0[0..3)");
            assert_eq!(attempts, 2);
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(sleeper.delays.lock().len(), 1);
    assert_eq!(reader.state(), ReaderState::Failed);
    assert_eq!(log.open_cursors(), 0);
}
