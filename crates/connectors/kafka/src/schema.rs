//! Table schemas and their resolution.
//!
//! A [`SchemaBinding`] ties a table to its topic and to the decoders for the
//! key and message sides. Descriptions are validated when they are loaded;
//! a binding that exists is always usable by a scan.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use arrow::datatypes::SchemaRef;
use igloo_connector::TableName;
use tracing::info;

use crate::batch::arrow_schema;
use crate::config::KafkaConfig;
use crate::decoder::{
    self, Charset, CsvField, CsvSpec, DecodeError, DecodeErrorPolicy, DecoderSpec, Endianness,
    JsonField, JsonSpec, RawField, RawKind, RawSpec,
};
use crate::description::{self, FieldDescription, FieldGroup, TableDescription};
use crate::error::{KafkaError, Result};
use crate::log::LogRecord;
use crate::types::{ColumnType, Row, Value};

/// Columns derived from record metadata rather than the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InternalColumn {
    PartitionId,
    PartitionOffset,
    Timestamp,
    Key,
    KeyLength,
    Message,
    MessageLength,
    SegmentStart,
    SegmentEnd,
}

impl InternalColumn {
    pub const ALL: [InternalColumn; 9] = [
        InternalColumn::PartitionId,
        InternalColumn::PartitionOffset,
        InternalColumn::Timestamp,
        InternalColumn::Key,
        InternalColumn::KeyLength,
        InternalColumn::Message,
        InternalColumn::MessageLength,
        InternalColumn::SegmentStart,
        InternalColumn::SegmentEnd,
    ];

    pub fn name(self) -> &'static str {
        match self {
            InternalColumn::PartitionId => "_partition_id",
            InternalColumn::PartitionOffset => "_partition_offset",
            InternalColumn::Timestamp => "_timestamp",
            InternalColumn::Key => "_key",
            InternalColumn::KeyLength => "_key_length",
            InternalColumn::Message => "_message",
            InternalColumn::MessageLength => "_message_length",
            InternalColumn::SegmentStart => "_segment_start",
            InternalColumn::SegmentEnd => "_segment_end",
        }
    }

    pub fn data_type(self) -> ColumnType {
        match self {
            InternalColumn::Timestamp => ColumnType::Timestamp,
            InternalColumn::Key | InternalColumn::Message => ColumnType::Varchar,
            _ => ColumnType::BigInt,
        }
    }

    /// Value for `record` read from the split `[start, end)`.
    pub fn value(self, record: &LogRecord, start: i64, end: i64) -> Value {
        let text = |bytes: &Option<bytes::Bytes>| match bytes {
            Some(b) => Value::Varchar(String::from_utf8_lossy(b).into_owned()),
            None => Value::Null,
        };
        let length = |bytes: &Option<bytes::Bytes>| {
            Value::BigInt(bytes.as_ref().map_or(0, |b| b.len() as i64))
        };
        match self {
            InternalColumn::PartitionId => Value::BigInt(i64::from(record.partition)),
            InternalColumn::PartitionOffset => Value::BigInt(record.offset),
            InternalColumn::Timestamp => record.timestamp.map_or(Value::Null, Value::Timestamp),
            InternalColumn::Key => text(&record.key),
            InternalColumn::KeyLength => length(&record.key),
            InternalColumn::Message => text(&record.value),
            InternalColumn::MessageLength => length(&record.value),
            InternalColumn::SegmentStart => Value::BigInt(start),
            InternalColumn::SegmentEnd => Value::BigInt(end),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnSource {
    /// Index into the key decoder's fields.
    Key(usize),
    /// Index into the message decoder's fields.
    Message(usize),
    Internal(InternalColumn),
}

impl fmt::Display for ColumnSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnSource::Key(_) => f.write_str("key"),
            ColumnSource::Message(_) => f.write_str("message"),
            ColumnSource::Internal(_) => f.write_str("internal"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub data_type: ColumnType,
    pub source: ColumnSource,
    /// Left out of table listings; still readable by name.
    pub hidden: bool,
}

/// Everything a scan needs to know about one table.
#[derive(Debug, Clone)]
pub struct SchemaBinding {
    pub table: TableName,
    pub topic: String,
    pub key: DecoderSpec,
    pub message: DecoderSpec,
    pub columns: Vec<Column>,
    pub on_decode_error: DecodeErrorPolicy,
    schema: SchemaRef,
}

impl SchemaBinding {
    pub fn new(
        table: TableName,
        topic: impl Into<String>,
        key: DecoderSpec,
        message: DecoderSpec,
        columns: Vec<Column>,
        on_decode_error: DecodeErrorPolicy,
    ) -> Self {
        let schema = arrow_schema(&columns);
        Self { table, topic: topic.into(), key, message, columns, on_decode_error, schema }
    }

    /// Arrow schema with one field per column. Hidden columns are included
    /// and carry `hidden = true` metadata, which keeps them out of `SELECT *`.
    pub fn arrow_schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    pub fn visible_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| !c.hidden)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Decodes `record` into a full row. Both sides are always decoded, so
    /// whether a record fails does not depend on which columns are read.
    pub fn decode_row(&self, record: &LogRecord, start: i64, end: i64) -> std::result::Result<Row, DecodeError> {
        let mut key = decoder::decode(&self.key, record.key.as_deref())?;
        let mut message = decoder::decode(&self.message, record.value.as_deref())?;
        Ok(self
            .columns
            .iter()
            .map(|column| match column.source {
                ColumnSource::Key(i) => key.get_mut(i).map(std::mem::take).unwrap_or_default(),
                ColumnSource::Message(i) => message.get_mut(i).map(std::mem::take).unwrap_or_default(),
                ColumnSource::Internal(internal) => internal.value(record, start, end),
            })
            .collect())
    }
}

/// Resolves table names to schema bindings.
#[derive(Debug, Clone, Default)]
pub struct SchemaResolver {
    tables: BTreeMap<TableName, Arc<SchemaBinding>>,
}

impl SchemaResolver {
    /// Reads the description directory and adds the configured
    /// `table_names`.
    pub fn load(config: &KafkaConfig) -> Result<Self> {
        let descriptions = description::load_dir(&config.table_description_dir)?;
        let resolver = Self::build(config, descriptions)?;
        info!(
            dir = %config.table_description_dir.display(),
            tables = resolver.tables.len(),
            "loaded table descriptions"
        );
        Ok(resolver)
    }

    /// Builds a resolver from descriptions registered in code.
    pub fn from_descriptions(
        config: &KafkaConfig,
        descriptions: impl IntoIterator<Item = TableDescription>,
    ) -> Result<Self> {
        Self::build(
            config,
            descriptions.into_iter().map(|d| (PathBuf::from("<inline>"), d)),
        )
    }

    fn build(
        config: &KafkaConfig,
        descriptions: impl IntoIterator<Item = (PathBuf, TableDescription)>,
    ) -> Result<Self> {
        let mut tables = BTreeMap::new();
        for (path, description) in descriptions {
            let binding = compile(config, &description)?;
            let name = binding.table.clone();
            if tables.insert(name.clone(), Arc::new(binding)).is_some() {
                return Err(KafkaError::InvalidSchema {
                    table: name.to_string(),
                    message: format!("defined more than once (again in {})", path.display()),
                });
            }
        }

        // Listed tables without a description expose internal columns only.
        for entry in &config.table_names {
            let name = TableName::parse(entry, &config.default_schema).map_err(|_| {
                KafkaError::InvalidSchema {
                    table: entry.clone(),
                    message: "invalid table name".to_string(),
                }
            })?;
            tables.entry(name.clone()).or_insert_with(|| {
                Arc::new(SchemaBinding::new(
                    name,
                    entry.clone(),
                    DecoderSpec::Dummy,
                    DecoderSpec::Dummy,
                    internal_columns(config.hide_internal_columns),
                    config.on_decode_error,
                ))
            });
        }
        Ok(Self { tables })
    }

    pub fn resolve(&self, table: &TableName) -> Result<Arc<SchemaBinding>> {
        self.tables
            .get(table)
            .cloned()
            .ok_or_else(|| KafkaError::TableNotFound(table.clone()))
    }

    pub fn list_tables(&self) -> Vec<TableName> {
        self.tables.keys().cloned().collect()
    }

    /// Visible columns of `table`.
    pub fn describe_table(&self, table: &TableName) -> Result<Vec<Column>> {
        Ok(self.resolve(table)?.visible_columns().cloned().collect())
    }
}

fn internal_columns(hidden: bool) -> Vec<Column> {
    InternalColumn::ALL
        .iter()
        .map(|&internal| Column {
            name: internal.name().to_string(),
            data_type: internal.data_type(),
            source: ColumnSource::Internal(internal),
            hidden,
        })
        .collect()
}

/// Validates a description and turns it into a binding.
fn compile(config: &KafkaConfig, description: &TableDescription) -> Result<SchemaBinding> {
    let schema = description.schema_name.as_deref().unwrap_or(&config.default_schema);
    let table = TableName::new(schema, description.table_name.as_str());
    let invalid = |message: String| KafkaError::InvalidSchema { table: table.to_string(), message };

    if description.table_name.is_empty() || description.table_name.contains('.') || schema.is_empty() {
        return Err(invalid("table and schema names must be non-empty and contain no '.'".to_string()));
    }
    let topic = description.topic_name.clone().unwrap_or_else(|| table.to_string());
    if topic.is_empty() {
        return Err(invalid("topicName must not be empty".to_string()));
    }

    let key = compile_group(description.key.as_ref()).map_err(&invalid)?;
    let message = compile_group(description.message.as_ref()).map_err(&invalid)?;

    let mut columns = Vec::new();
    let sides = [
        (description.key.as_ref(), ColumnSource::Key as fn(usize) -> ColumnSource, &key),
        (description.message.as_ref(), ColumnSource::Message, &message),
    ];
    for (group, source, spec) in sides {
        let hidden: Vec<bool> = group.map(|g| g.fields.iter().map(|f| f.hidden).collect()).unwrap_or_default();
        for (i, (name, data_type)) in spec.fields().into_iter().enumerate() {
            columns.push(Column {
                name: name.to_string(),
                data_type,
                source: source(i),
                hidden: hidden.get(i).copied().unwrap_or(false),
            });
        }
    }
    columns.extend(internal_columns(config.hide_internal_columns));

    let mut seen = HashSet::new();
    for column in &columns {
        if column.name.is_empty() {
            return Err(invalid("column names must not be empty".to_string()));
        }
        if !seen.insert(column.name.to_ascii_lowercase()) {
            return Err(invalid(format!("duplicate column '{}'", column.name)));
        }
    }

    Ok(SchemaBinding::new(
        table,
        topic,
        key,
        message,
        columns,
        description.on_decode_error.unwrap_or(config.on_decode_error),
    ))
}

fn compile_group(group: Option<&FieldGroup>) -> std::result::Result<DecoderSpec, String> {
    let Some(group) = group else {
        return Ok(DecoderSpec::Dummy);
    };
    let typed = group
        .fields
        .iter()
        .map(|f| {
            f.data_type
                .parse::<ColumnType>()
                .map(|t| (f, t))
                .map_err(|e| format!("field '{}': {}", f.name, e))
        })
        .collect::<std::result::Result<Vec<_>, String>>()?;

    match group.data_format.to_ascii_lowercase().as_str() {
        "dummy" => {
            if !group.fields.is_empty() {
                return Err("the dummy format cannot declare fields".to_string());
            }
            Ok(DecoderSpec::Dummy)
        }
        "raw" => typed
            .into_iter()
            .map(|(f, t)| raw_field(f, t))
            .collect::<std::result::Result<Vec<RawField>, String>>()
            .map(|fields| DecoderSpec::Raw(RawSpec { fields })),
        "csv" => {
            let delimiter = match group.delimiter.as_deref() {
                None => b',',
                Some(d) if d.len() == 1 => d.as_bytes()[0],
                Some(d) => return Err(format!("delimiter '{}' must be a single byte", d)),
            };
            let charset = match group.charset.as_deref() {
                None => Charset::Utf8,
                Some(name) => Charset::parse(name).ok_or_else(|| format!("unsupported charset '{}'", name))?,
            };
            let fields = typed
                .into_iter()
                .map(|(f, t)| -> std::result::Result<CsvField, String> {
                    let mapping = required_mapping(f)?;
                    let index = mapping
                        .trim()
                        .parse::<usize>()
                        .map_err(|_| format!("field '{}': csv mapping '{}' is not a field index", f.name, mapping))?;
                    Ok(CsvField { name: f.name.clone(), data_type: t, index })
                })
                .collect::<std::result::Result<Vec<_>, String>>()?;
            Ok(DecoderSpec::Csv(CsvSpec { delimiter, charset, fields }))
        }
        "json" => {
            let fields = typed
                .into_iter()
                .map(|(f, t)| -> std::result::Result<JsonField, String> {
                    let mapping = required_mapping(f)?;
                    let pointer = JsonField::pointer_from_mapping(mapping)
                        .ok_or_else(|| format!("field '{}': invalid json path '{}'", f.name, mapping))?;
                    let default = match &f.default {
                        None | Some(serde_json::Value::Null) => None,
                        Some(value) => Some(decoder::json_to_value(value, t).ok_or_else(|| {
                            format!("field '{}': default {} is not a valid {}", f.name, value, t)
                        })?),
                    };
                    Ok(JsonField { name: f.name.clone(), data_type: t, pointer, default })
                })
                .collect::<std::result::Result<Vec<_>, String>>()?;
            Ok(DecoderSpec::Json(JsonSpec { missing: group.on_missing_field.unwrap_or_default(), fields }))
        }
        other => Err(format!("unknown dataFormat '{}'", other)),
    }
}

fn required_mapping(field: &FieldDescription) -> std::result::Result<&str, String> {
    match field.mapping.as_deref() {
        Some(mapping) if !mapping.trim().is_empty() => Ok(mapping),
        _ => Err(format!("field '{}' has no mapping", field.name)),
    }
}

fn raw_field(field: &FieldDescription, data_type: ColumnType) -> std::result::Result<RawField, String> {
    let kind = match field.data_format.as_deref() {
        Some(name) => RawKind::parse(name)
            .ok_or_else(|| format!("field '{}': unknown raw format '{}'", field.name, name))?,
        None => RawKind::default_for(data_type)
            .ok_or_else(|| format!("field '{}': no raw format for {}", field.name, data_type))?,
    };
    let (start, end) = RawField::parse_mapping(required_mapping(field)?)
        .map_err(|e| format!("field '{}': {}", field.name, e))?;
    let endianness = match field.endianness.as_deref() {
        None => Endianness::Big,
        Some(name) => Endianness::parse(name)
            .ok_or_else(|| format!("field '{}': unknown endianness '{}'", field.name, name))?,
    };
    let raw = RawField { name: field.name.clone(), data_type, kind, start, end, endianness };
    raw.validate()?;
    Ok(raw)
}
