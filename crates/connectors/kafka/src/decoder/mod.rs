//! Record decoders.
//!
//! A [`DecoderSpec`] describes how one side of a record (key or message)
//! turns into typed values. Decoding is pure: the same spec and bytes always
//! give the same values.

use std::borrow::Cow;
use std::fmt;

use serde::Deserialize;
use thiserror::Error;

use crate::types::{ColumnType, Value};

mod delimited;
mod json;
mod raw;

pub use self::delimited::{CsvField, CsvSpec};
pub use self::json::{json_to_value, JsonField, JsonSpec, MissingField};
pub use self::raw::{Endianness, RawField, RawKind, RawSpec};

/// How to decode one side of a record.
#[derive(Debug, Clone, PartialEq)]
pub enum DecoderSpec {
    /// Produces no fields; the payload is only reachable through internal
    /// columns.
    Dummy,
    Raw(RawSpec),
    Csv(CsvSpec),
    Json(JsonSpec),
}

impl DecoderSpec {
    pub fn data_format(&self) -> &'static str {
        match self {
            DecoderSpec::Dummy => "dummy",
            DecoderSpec::Raw(_) => "raw",
            DecoderSpec::Csv(_) => "csv",
            DecoderSpec::Json(_) => "json",
        }
    }

    /// `(name, declared type)` of every field, in decode order.
    pub fn fields(&self) -> Vec<(&str, ColumnType)> {
        match self {
            DecoderSpec::Dummy => Vec::new(),
            DecoderSpec::Raw(spec) => {
                spec.fields.iter().map(|f| (f.name.as_str(), f.data_type)).collect()
            }
            DecoderSpec::Csv(spec) => {
                spec.fields.iter().map(|f| (f.name.as_str(), f.data_type)).collect()
            }
            DecoderSpec::Json(spec) => {
                spec.fields.iter().map(|f| (f.name.as_str(), f.data_type)).collect()
            }
        }
    }

    pub fn field_count(&self) -> usize {
        match self {
            DecoderSpec::Dummy => 0,
            DecoderSpec::Raw(spec) => spec.fields.len(),
            DecoderSpec::Csv(spec) => spec.fields.len(),
            DecoderSpec::Json(spec) => spec.fields.len(),
        }
    }
}

/// Decodes `payload` into one value per field of `spec`.
///
/// A missing payload (a record without a key, a tombstone) decodes to all
/// nulls.
pub fn decode(spec: &DecoderSpec, payload: Option<&[u8]>) -> Result<Vec<Value>, DecodeError> {
    let Some(bytes) = payload else {
        return Ok(vec![Value::Null; spec.field_count()]);
    };
    match spec {
        DecoderSpec::Dummy => Ok(Vec::new()),
        DecoderSpec::Raw(raw) => raw.decode(bytes),
        DecoderSpec::Csv(csv) => csv.decode(bytes),
        DecoderSpec::Json(json) => json.decode(bytes),
    }
}

/// Per-record decode failures.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DecodeError {
    #[error("field '{field}' needs bytes {start}..{end} but the payload has {len}")]
    Truncated { field: String, start: usize, end: usize, len: usize },

    #[error("field '{field}' is not valid {charset} text")]
    InvalidText { field: String, charset: Charset },

    #[error("malformed {format} payload: {message}")]
    Malformed { format: &'static str, message: String },

    #[error("field '{field}' is missing at path '{path}'")]
    MissingField { field: String, path: String },

    #[error("field '{field}' expected {expected}, found {found}")]
    TypeMismatch { field: String, expected: ColumnType, found: String },
}

impl DecodeError {
    pub fn is_type_mismatch(&self) -> bool {
        matches!(self, DecodeError::TypeMismatch { .. })
    }
}

/// What a scan does with a record that fails to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecodeErrorPolicy {
    /// Abort the split on the first bad record.
    #[default]
    Fail,
    /// Drop the record, count it, carry on.
    Skip,
}

/// Text encodings accepted by the delimited decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Charset {
    #[default]
    Utf8,
    Latin1,
    Ascii,
}

impl Charset {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().replace('_', "-").as_str() {
            "UTF-8" | "UTF8" => Some(Charset::Utf8),
            "ISO-8859-1" | "LATIN1" | "LATIN-1" => Some(Charset::Latin1),
            "US-ASCII" | "ASCII" => Some(Charset::Ascii),
            _ => None,
        }
    }

    /// Decodes `bytes`, `None` if they are not valid in this charset.
    pub fn decode<'a>(self, bytes: &'a [u8]) -> Option<Cow<'a, str>> {
        match self {
            Charset::Utf8 => std::str::from_utf8(bytes).ok().map(Cow::Borrowed),
            Charset::Ascii if bytes.is_ascii() => std::str::from_utf8(bytes).ok().map(Cow::Borrowed),
            Charset::Ascii => None,
            Charset::Latin1 => Some(Cow::Owned(bytes.iter().map(|&b| char::from(b)).collect())),
        }
    }
}

impl fmt::Display for Charset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Charset::Utf8 => "UTF-8",
            Charset::Latin1 => "ISO-8859-1",
            Charset::Ascii => "US-ASCII",
        })
    }
}

/// Short description of an offending value for mismatch errors.
fn describe(found: &str) -> String {
    const MAX: usize = 32;
    match found.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &found[..idx]),
        None => found.to_string(),
    }
}
