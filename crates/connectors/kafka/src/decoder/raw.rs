//! Fixed-layout binary decoding.

use super::{describe, DecodeError};
use crate::types::{ColumnType, Value};

/// Physical layout of a raw field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawKind {
    Byte,
    Short,
    Int,
    Long,
    Float,
    Double,
    /// Uninterpreted bytes.
    Bytes,
    /// UTF-8 text.
    Utf8,
}

impl RawKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "BYTE" => Some(RawKind::Byte),
            "SHORT" => Some(RawKind::Short),
            "INT" => Some(RawKind::Int),
            "LONG" => Some(RawKind::Long),
            "FLOAT" => Some(RawKind::Float),
            "DOUBLE" => Some(RawKind::Double),
            "BYTES" => Some(RawKind::Bytes),
            "UTF8" | "UTF-8" => Some(RawKind::Utf8),
            _ => None,
        }
    }

    /// Byte width of fixed-width kinds.
    pub fn width(self) -> Option<usize> {
        match self {
            RawKind::Byte => Some(1),
            RawKind::Short => Some(2),
            RawKind::Int | RawKind::Float => Some(4),
            RawKind::Long | RawKind::Double => Some(8),
            RawKind::Bytes | RawKind::Utf8 => None,
        }
    }

    /// Column types this kind can be decoded into.
    pub fn accepts(self, data_type: ColumnType) -> bool {
        match self {
            RawKind::Byte | RawKind::Short | RawKind::Int | RawKind::Long => {
                data_type.is_integral()
                    || matches!(data_type, ColumnType::Boolean | ColumnType::Date | ColumnType::Timestamp)
            }
            RawKind::Float | RawKind::Double => {
                matches!(data_type, ColumnType::Real | ColumnType::Double)
            }
            RawKind::Bytes => data_type == ColumnType::Varbinary,
            RawKind::Utf8 => data_type == ColumnType::Varchar,
        }
    }

    /// Default kind for a column declared without an explicit `dataFormat`.
    pub fn default_for(data_type: ColumnType) -> Option<Self> {
        match data_type {
            ColumnType::TinyInt | ColumnType::Boolean => Some(RawKind::Byte),
            ColumnType::SmallInt => Some(RawKind::Short),
            ColumnType::Integer | ColumnType::Date => Some(RawKind::Int),
            ColumnType::BigInt | ColumnType::Timestamp => Some(RawKind::Long),
            ColumnType::Real => Some(RawKind::Float),
            ColumnType::Double => Some(RawKind::Double),
            ColumnType::Varchar => Some(RawKind::Utf8),
            ColumnType::Varbinary => Some(RawKind::Bytes),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endianness {
    #[default]
    Big,
    Little,
}

impl Endianness {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "big" | "big-endian" => Some(Endianness::Big),
            "little" | "little-endian" => Some(Endianness::Little),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawField {
    pub name: String,
    pub data_type: ColumnType,
    pub kind: RawKind,
    pub start: usize,
    /// Exclusive end. Defaults to `start + width` for fixed-width kinds and to
    /// the end of the payload otherwise.
    pub end: Option<usize>,
    pub endianness: Endianness,
}

impl RawField {
    /// Parses a `start[:end]` mapping.
    pub fn parse_mapping(mapping: &str) -> Result<(usize, Option<usize>), String> {
        let parse = |s: &str| {
            s.trim().parse::<usize>().map_err(|_| format!("invalid raw mapping '{}'", mapping))
        };
        match mapping.split_once(':') {
            Some((start, end)) => {
                let (start, end) = (parse(start)?, parse(end)?);
                if end <= start {
                    return Err(format!("raw mapping '{}' ends before it starts", mapping));
                }
                Ok((start, Some(end)))
            }
            None => Ok((parse(mapping)?, None)),
        }
    }

    /// Load-time consistency checks.
    pub fn validate(&self) -> Result<(), String> {
        if !self.kind.accepts(self.data_type) {
            return Err(format!(
                "field '{}': raw format {:?} cannot produce {}",
                self.name, self.kind, self.data_type
            ));
        }
        if let (Some(width), None) = (self.kind.width(), self.end) {
            if self.start.checked_add(width).is_none() {
                return Err(format!("field '{}': mapping start {} is out of range", self.name, self.start));
            }
        }
        if let (Some(width), Some(end)) = (self.kind.width(), self.end) {
            if end - self.start != width {
                return Err(format!(
                    "field '{}': {:?} is {} bytes wide but the mapping covers {}",
                    self.name,
                    self.kind,
                    width,
                    end - self.start
                ));
            }
        }
        Ok(())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, DecodeError> {
        let end = match (self.end, self.kind.width()) {
            (Some(end), _) => end,
            (None, Some(width)) => self.start.saturating_add(width),
            (None, None) => bytes.len().max(self.start),
        };
        let slice = bytes.get(self.start..end).ok_or_else(|| DecodeError::Truncated {
            field: self.name.clone(),
            start: self.start,
            end,
            len: bytes.len(),
        })?;

        match self.kind {
            RawKind::Byte | RawKind::Short | RawKind::Int | RawKind::Long => {
                let v = self.read_integer(slice)?;
                self.data_type.coerce_i64(v).ok_or_else(|| self.mismatch(&v.to_string()))
            }
            RawKind::Float => {
                let v = f32::from_bits(self.read_integer(slice)? as u32);
                self.data_type.coerce_f64(f64::from(v)).ok_or_else(|| self.mismatch(&v.to_string()))
            }
            RawKind::Double => {
                let v = f64::from_bits(self.read_integer(slice)? as u64);
                self.data_type.coerce_f64(v).ok_or_else(|| self.mismatch(&v.to_string()))
            }
            RawKind::Bytes => Ok(Value::Varbinary(slice.to_vec())),
            RawKind::Utf8 => std::str::from_utf8(slice)
                .map(|s| Value::Varchar(s.to_string()))
                .map_err(|_| DecodeError::InvalidText {
                    field: self.name.clone(),
                    charset: super::Charset::Utf8,
                }),
        }
    }

    /// Reads a sign-extended integer of the slice's width.
    fn read_integer(&self, slice: &[u8]) -> Result<i64, DecodeError> {
        let mut buf = [0u8; 8];
        let width = slice.len();
        if width == 0 || width > 8 {
            return Err(DecodeError::Malformed {
                format: "raw",
                message: format!("field '{}' has unsupported width {}", self.name, width),
            });
        }
        match self.endianness {
            Endianness::Big => buf[8 - width..].copy_from_slice(slice),
            Endianness::Little => {
                for (i, b) in slice.iter().enumerate() {
                    buf[7 - i] = *b;
                }
            }
        }
        let shift = 64 - 8 * width as u32;
        // Floats keep their bit pattern; only integers are sign-extended.
        if matches!(self.kind, RawKind::Float | RawKind::Double) {
            return Ok(i64::from_be_bytes(buf));
        }
        Ok((i64::from_be_bytes(buf) << shift) >> shift)
    }

    fn mismatch(&self, found: &str) -> DecodeError {
        DecodeError::TypeMismatch {
            field: self.name.clone(),
            expected: self.data_type,
            found: describe(found),
        }
    }
}

/// Fields at fixed byte offsets of the payload.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawSpec {
    pub fields: Vec<RawField>,
}

impl RawSpec {
    pub(super) fn decode(&self, bytes: &[u8]) -> Result<Vec<Value>, DecodeError> {
        self.fields.iter().map(|field| field.decode(bytes)).collect()
    }
}
