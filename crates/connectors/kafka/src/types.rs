//! Column types and the typed values rows are made of.

use std::fmt;
use std::str::FromStr;

use arrow::datatypes::{DataType, TimeUnit};
use chrono::{DateTime, NaiveDate, NaiveDateTime};

/// Declared type of a table column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Boolean,
    TinyInt,
    SmallInt,
    Integer,
    BigInt,
    Real,
    Double,
    Varchar,
    Varbinary,
    /// Days since the Unix epoch.
    Date,
    /// Milliseconds since the Unix epoch.
    Timestamp,
}

impl ColumnType {
    pub fn arrow_type(self) -> DataType {
        match self {
            ColumnType::Boolean => DataType::Boolean,
            ColumnType::TinyInt => DataType::Int8,
            ColumnType::SmallInt => DataType::Int16,
            ColumnType::Integer => DataType::Int32,
            ColumnType::BigInt => DataType::Int64,
            ColumnType::Real => DataType::Float32,
            ColumnType::Double => DataType::Float64,
            ColumnType::Varchar => DataType::Utf8,
            ColumnType::Varbinary => DataType::Binary,
            ColumnType::Date => DataType::Date32,
            ColumnType::Timestamp => DataType::Timestamp(TimeUnit::Millisecond, None),
        }
    }

    pub fn is_integral(self) -> bool {
        matches!(
            self,
            ColumnType::TinyInt | ColumnType::SmallInt | ColumnType::Integer | ColumnType::BigInt
        )
    }

    /// Converts an integer into this type, `None` if it does not fit.
    pub fn coerce_i64(self, v: i64) -> Option<Value> {
        match self {
            ColumnType::Boolean => Some(Value::Boolean(v != 0)),
            ColumnType::TinyInt => i8::try_from(v).ok().map(Value::TinyInt),
            ColumnType::SmallInt => i16::try_from(v).ok().map(Value::SmallInt),
            ColumnType::Integer => i32::try_from(v).ok().map(Value::Integer),
            ColumnType::BigInt => Some(Value::BigInt(v)),
            ColumnType::Real => Some(Value::Real(v as f32)),
            ColumnType::Double => Some(Value::Double(v as f64)),
            ColumnType::Date => i32::try_from(v).ok().map(Value::Date),
            ColumnType::Timestamp => Some(Value::Timestamp(v)),
            ColumnType::Varchar | ColumnType::Varbinary => None,
        }
    }

    /// Converts a floating point number into this type.
    pub fn coerce_f64(self, v: f64) -> Option<Value> {
        match self {
            ColumnType::Real => Some(Value::Real(v as f32)),
            ColumnType::Double => Some(Value::Double(v)),
            _ => None,
        }
    }

    /// Parses text into this type. Surrounding whitespace is ignored for
    /// everything but strings.
    pub fn parse_text(self, text: &str) -> Option<Value> {
        let trimmed = text.trim();
        match self {
            ColumnType::Varchar => Some(Value::Varchar(text.to_string())),
            ColumnType::Varbinary => Some(Value::Varbinary(text.as_bytes().to_vec())),
            ColumnType::Boolean => match trimmed.to_ascii_lowercase().as_str() {
                "true" => Some(Value::Boolean(true)),
                "false" => Some(Value::Boolean(false)),
                _ => None,
            },
            ColumnType::TinyInt | ColumnType::SmallInt | ColumnType::Integer | ColumnType::BigInt => {
                trimmed.parse::<i64>().ok().and_then(|v| self.coerce_i64(v))
            }
            ColumnType::Real => trimmed.parse::<f32>().ok().map(Value::Real),
            ColumnType::Double => trimmed.parse::<f64>().ok().map(Value::Double),
            ColumnType::Date => parse_date(trimmed).map(Value::Date),
            ColumnType::Timestamp => parse_timestamp(trimmed).map(Value::Timestamp),
        }
    }
}

fn parse_date(text: &str) -> Option<i32> {
    let date = NaiveDate::parse_from_str(text, "%Y-%m-%d").ok()?;
    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1)?;
    i32::try_from(date.signed_duration_since(epoch).num_days()).ok()
}

fn parse_timestamp(text: &str) -> Option<i64> {
    if let Ok(millis) = text.parse::<i64>() {
        return Some(millis);
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.timestamp_millis());
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|ts| ts.and_utc().timestamp_millis())
}

impl FromStr for ColumnType {
    type Err = String;

    /// Accepts SQL type names; a length such as `VARCHAR(25)` is ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let base = s.split('(').next().unwrap_or(s).trim().to_ascii_uppercase();
        match base.as_str() {
            "BOOLEAN" => Ok(ColumnType::Boolean),
            "TINYINT" => Ok(ColumnType::TinyInt),
            "SMALLINT" => Ok(ColumnType::SmallInt),
            "INTEGER" | "INT" => Ok(ColumnType::Integer),
            "BIGINT" => Ok(ColumnType::BigInt),
            "REAL" => Ok(ColumnType::Real),
            "DOUBLE" => Ok(ColumnType::Double),
            "VARCHAR" => Ok(ColumnType::Varchar),
            "VARBINARY" => Ok(ColumnType::Varbinary),
            "DATE" => Ok(ColumnType::Date),
            "TIMESTAMP" => Ok(ColumnType::Timestamp),
            _ => Err(format!("unsupported column type '{}'", s)),
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::TinyInt => "TINYINT",
            ColumnType::SmallInt => "SMALLINT",
            ColumnType::Integer => "INTEGER",
            ColumnType::BigInt => "BIGINT",
            ColumnType::Real => "REAL",
            ColumnType::Double => "DOUBLE",
            ColumnType::Varchar => "VARCHAR",
            ColumnType::Varbinary => "VARBINARY",
            ColumnType::Date => "DATE",
            ColumnType::Timestamp => "TIMESTAMP",
        };
        f.write_str(name)
    }
}

/// A single typed column value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Boolean(bool),
    TinyInt(i8),
    SmallInt(i16),
    Integer(i32),
    BigInt(i64),
    Real(f32),
    Double(f64),
    Varchar(String),
    Varbinary(Vec<u8>),
    Date(i32),
    Timestamp(i64),
}

impl Value {
    /// The type of a non-null value.
    pub fn column_type(&self) -> Option<ColumnType> {
        match self {
            Value::Null => None,
            Value::Boolean(_) => Some(ColumnType::Boolean),
            Value::TinyInt(_) => Some(ColumnType::TinyInt),
            Value::SmallInt(_) => Some(ColumnType::SmallInt),
            Value::Integer(_) => Some(ColumnType::Integer),
            Value::BigInt(_) => Some(ColumnType::BigInt),
            Value::Real(_) => Some(ColumnType::Real),
            Value::Double(_) => Some(ColumnType::Double),
            Value::Varchar(_) => Some(ColumnType::Varchar),
            Value::Varbinary(_) => Some(ColumnType::Varbinary),
            Value::Date(_) => Some(ColumnType::Date),
            Value::Timestamp(_) => Some(ColumnType::Timestamp),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Integer view of integral values.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::TinyInt(v) => Some(i64::from(*v)),
            Value::SmallInt(v) => Some(i64::from(*v)),
            Value::Integer(v) => Some(i64::from(*v)),
            Value::BigInt(v) => Some(*v),
            _ => None,
        }
    }
}

/// One decoded record, in the table's column order.
pub type Row = Vec<Value>;
