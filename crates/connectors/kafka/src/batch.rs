//! Row to Arrow conversion.

use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::{
    ArrayBuilder, ArrayRef, BinaryBuilder, BooleanBuilder, Date32Builder, Float32Builder,
    Float64Builder, Int16Builder, Int32Builder, Int64Builder, Int8Builder, StringBuilder,
    TimestampMillisecondBuilder,
};
use arrow::datatypes::{Field, Schema, SchemaRef};
use arrow::error::ArrowError;
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use igloo_connector::HIDDEN_FIELD_METADATA;

use crate::schema::Column;
use crate::types::{ColumnType, Row, Value};

/// Arrow schema for `columns`. Hidden columns carry `hidden = true` field
/// metadata.
pub fn arrow_schema(columns: &[Column]) -> SchemaRef {
    let fields: Vec<Field> = columns
        .iter()
        .map(|column| {
            let field = Field::new(&column.name, column.data_type.arrow_type(), true);
            if column.hidden {
                field.with_metadata(HashMap::from([(HIDDEN_FIELD_METADATA.to_string(), "true".to_string())]))
            } else {
                field
            }
        })
        .collect();
    Arc::new(Schema::new(fields))
}

enum ColumnBuilder {
    Boolean(BooleanBuilder),
    TinyInt(Int8Builder),
    SmallInt(Int16Builder),
    Integer(Int32Builder),
    BigInt(Int64Builder),
    Real(Float32Builder),
    Double(Float64Builder),
    Varchar(StringBuilder),
    Varbinary(BinaryBuilder),
    Date(Date32Builder),
    Timestamp(TimestampMillisecondBuilder),
}

impl ColumnBuilder {
    fn new(data_type: ColumnType, capacity: usize) -> Self {
        match data_type {
            ColumnType::Boolean => ColumnBuilder::Boolean(BooleanBuilder::with_capacity(capacity)),
            ColumnType::TinyInt => ColumnBuilder::TinyInt(Int8Builder::with_capacity(capacity)),
            ColumnType::SmallInt => ColumnBuilder::SmallInt(Int16Builder::with_capacity(capacity)),
            ColumnType::Integer => ColumnBuilder::Integer(Int32Builder::with_capacity(capacity)),
            ColumnType::BigInt => ColumnBuilder::BigInt(Int64Builder::with_capacity(capacity)),
            ColumnType::Real => ColumnBuilder::Real(Float32Builder::with_capacity(capacity)),
            ColumnType::Double => ColumnBuilder::Double(Float64Builder::with_capacity(capacity)),
            ColumnType::Varchar => ColumnBuilder::Varchar(StringBuilder::new()),
            ColumnType::Varbinary => ColumnBuilder::Varbinary(BinaryBuilder::new()),
            ColumnType::Date => ColumnBuilder::Date(Date32Builder::with_capacity(capacity)),
            ColumnType::Timestamp => {
                ColumnBuilder::Timestamp(TimestampMillisecondBuilder::with_capacity(capacity))
            }
        }
    }

    fn append(&mut self, value: Value) -> Result<(), ArrowError> {
        match (self, value) {
            (ColumnBuilder::Boolean(b), Value::Boolean(v)) => b.append_value(v),
            (ColumnBuilder::TinyInt(b), Value::TinyInt(v)) => b.append_value(v),
            (ColumnBuilder::SmallInt(b), Value::SmallInt(v)) => b.append_value(v),
            (ColumnBuilder::Integer(b), Value::Integer(v)) => b.append_value(v),
            (ColumnBuilder::BigInt(b), Value::BigInt(v)) => b.append_value(v),
            (ColumnBuilder::Real(b), Value::Real(v)) => b.append_value(v),
            (ColumnBuilder::Double(b), Value::Double(v)) => b.append_value(v),
            (ColumnBuilder::Varchar(b), Value::Varchar(v)) => b.append_value(v),
            (ColumnBuilder::Varbinary(b), Value::Varbinary(v)) => b.append_value(v),
            (ColumnBuilder::Date(b), Value::Date(v)) => b.append_value(v),
            (ColumnBuilder::Timestamp(b), Value::Timestamp(v)) => b.append_value(v),
            (builder, Value::Null) => builder.append_null(),
            (_, other) => {
                return Err(ArrowError::InvalidArgumentError(format!(
                    "value {:?} does not match the column type",
                    other
                )))
            }
        }
        Ok(())
    }

    fn append_null(&mut self) {
        match self {
            ColumnBuilder::Boolean(b) => b.append_null(),
            ColumnBuilder::TinyInt(b) => b.append_null(),
            ColumnBuilder::SmallInt(b) => b.append_null(),
            ColumnBuilder::Integer(b) => b.append_null(),
            ColumnBuilder::BigInt(b) => b.append_null(),
            ColumnBuilder::Real(b) => b.append_null(),
            ColumnBuilder::Double(b) => b.append_null(),
            ColumnBuilder::Varchar(b) => b.append_null(),
            ColumnBuilder::Varbinary(b) => b.append_null(),
            ColumnBuilder::Date(b) => b.append_null(),
            ColumnBuilder::Timestamp(b) => b.append_null(),
        }
    }

    fn finish(&mut self) -> ArrayRef {
        match self {
            ColumnBuilder::Boolean(b) => ArrayBuilder::finish(b),
            ColumnBuilder::TinyInt(b) => ArrayBuilder::finish(b),
            ColumnBuilder::SmallInt(b) => ArrayBuilder::finish(b),
            ColumnBuilder::Integer(b) => ArrayBuilder::finish(b),
            ColumnBuilder::BigInt(b) => ArrayBuilder::finish(b),
            ColumnBuilder::Real(b) => ArrayBuilder::finish(b),
            ColumnBuilder::Double(b) => ArrayBuilder::finish(b),
            ColumnBuilder::Varchar(b) => ArrayBuilder::finish(b),
            ColumnBuilder::Varbinary(b) => ArrayBuilder::finish(b),
            ColumnBuilder::Date(b) => ArrayBuilder::finish(b),
            ColumnBuilder::Timestamp(b) => ArrayBuilder::finish(b),
        }
    }
}

/// Accumulates rows into Arrow record batches, keeping only the projected
/// columns.
pub struct RowBatchBuilder {
    schema: SchemaRef,
    projection: Vec<usize>,
    builders: Vec<ColumnBuilder>,
    rows: usize,
}

impl RowBatchBuilder {
    /// `projection` holds column indices of `columns`; `None` keeps them all.
    pub fn new(
        columns: &[Column],
        projection: Option<&[usize]>,
        capacity: usize,
    ) -> Result<Self, ArrowError> {
        let projection: Vec<usize> = match projection {
            Some(indices) => indices.to_vec(),
            None => (0..columns.len()).collect(),
        };
        let schema = arrow_schema(columns).project(&projection)?;
        // Values are moved out of each row, so a column can only be taken once.
        let mut sorted = projection.clone();
        sorted.sort_unstable();
        if sorted.windows(2).any(|w| w[0] == w[1]) {
            return Err(ArrowError::InvalidArgumentError("projection repeats a column".to_string()));
        }
        let builders = projection
            .iter()
            .map(|&i| ColumnBuilder::new(columns[i].data_type, capacity))
            .collect();
        Ok(Self { schema: Arc::new(schema), projection, builders, rows: 0 })
    }

    pub fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    pub fn len(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn append(&mut self, mut row: Row) -> Result<(), ArrowError> {
        for (builder, &i) in self.builders.iter_mut().zip(&self.projection) {
            let value = row.get_mut(i).map(std::mem::take).ok_or_else(|| {
                ArrowError::InvalidArgumentError(format!("row has no column {}", i))
            })?;
            builder.append(value)?;
        }
        self.rows += 1;
        Ok(())
    }

    /// Emits the buffered rows and starts a new batch.
    pub fn finish(&mut self) -> Result<RecordBatch, ArrowError> {
        let arrays: Vec<ArrayRef> = self.builders.iter_mut().map(ColumnBuilder::finish).collect();
        let options = RecordBatchOptions::new().with_row_count(Some(self.rows));
        self.rows = 0;
        RecordBatch::try_new_with_options(Arc::clone(&self.schema), arrays, &options)
    }
}
