//! Delimited text decoding.

use csv::{ByteRecord, ReaderBuilder};

use super::{describe, Charset, DecodeError};
use crate::types::{ColumnType, Value};

#[derive(Debug, Clone, PartialEq)]
pub struct CsvField {
    pub name: String,
    pub data_type: ColumnType,
    /// Zero-based position in the record.
    pub index: usize,
}

/// One delimited record per payload.
#[derive(Debug, Clone, PartialEq)]
pub struct CsvSpec {
    pub delimiter: u8,
    pub charset: Charset,
    pub fields: Vec<CsvField>,
}

impl Default for CsvSpec {
    fn default() -> Self {
        Self { delimiter: b',', charset: Charset::Utf8, fields: Vec::new() }
    }
}

impl CsvSpec {
    pub(super) fn decode(&self, bytes: &[u8]) -> Result<Vec<Value>, DecodeError> {
        let mut reader = ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .delimiter(self.delimiter)
            .from_reader(bytes);
        let mut record = ByteRecord::new();
        reader.read_byte_record(&mut record).map_err(|e| DecodeError::Malformed {
            format: "csv",
            message: e.to_string(),
        })?;

        self.fields
            .iter()
            .map(|field| {
                // Columns past the end of a short record read as null.
                let Some(raw) = record.get(field.index) else {
                    return Ok(Value::Null);
                };
                let text = self.charset.decode(raw).ok_or_else(|| DecodeError::InvalidText {
                    field: field.name.clone(),
                    charset: self.charset,
                })?;
                if text.is_empty() {
                    return Ok(Value::Null);
                }
                field.data_type.parse_text(&text).ok_or_else(|| DecodeError::TypeMismatch {
                    field: field.name.clone(),
                    expected: field.data_type,
                    found: describe(&text),
                })
            })
            .collect()
    }
}
