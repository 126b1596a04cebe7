//! JSON decoding by field path.

use serde::Deserialize;
use serde_json::Value as Json;

use super::{describe, DecodeError};
use crate::types::{ColumnType, Value};

/// What to do when a field's path is absent from a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingField {
    /// Use the field's declared default, or null.
    #[default]
    Default,
    /// Fail the record.
    Fail,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JsonField {
    pub name: String,
    pub data_type: ColumnType,
    /// RFC 6901 pointer, e.g. `/customer/id`.
    pub pointer: String,
    pub default: Option<Value>,
}

impl JsonField {
    /// Converts a `/`-separated mapping such as `customer/id` into a pointer.
    pub fn pointer_from_mapping(mapping: &str) -> Option<String> {
        let segments: Vec<&str> = mapping.trim_matches('/').split('/').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return None;
        }
        Some(segments.iter().map(|s| format!("/{}", s.replace('~', "~0"))).collect())
    }

    /// The mapping as written in a table description.
    pub fn path(&self) -> String {
        self.pointer.trim_start_matches('/').replace("~0", "~")
    }

    fn decode(&self, doc: &Json, missing: MissingField) -> Result<Value, DecodeError> {
        match doc.pointer(&self.pointer) {
            None => match missing {
                MissingField::Default => Ok(self.default.clone().unwrap_or(Value::Null)),
                MissingField::Fail => Err(DecodeError::MissingField {
                    field: self.name.clone(),
                    path: self.path(),
                }),
            },
            Some(json) => json_to_value(json, self.data_type).ok_or_else(|| DecodeError::TypeMismatch {
                field: self.name.clone(),
                expected: self.data_type,
                found: describe(&json.to_string()),
            }),
        }
    }
}

/// Converts a JSON value into `data_type`, `None` if it does not fit.
pub fn json_to_value(json: &Json, data_type: ColumnType) -> Option<Value> {
    match json {
        Json::Null => Some(Value::Null),
        Json::String(s) => data_type.parse_text(s),
        Json::Bool(b) => match data_type {
            ColumnType::Boolean => Some(Value::Boolean(*b)),
            ColumnType::Varchar => Some(Value::Varchar(b.to_string())),
            _ => None,
        },
        Json::Number(n) => {
            if data_type == ColumnType::Varchar {
                return Some(Value::Varchar(n.to_string()));
            }
            match n.as_i64() {
                Some(v) if data_type != ColumnType::Boolean => data_type.coerce_i64(v),
                Some(_) => None,
                None => n.as_f64().and_then(|v| data_type.coerce_f64(v)),
            }
        }
        // Nested documents are only representable as text.
        Json::Array(_) | Json::Object(_) => match data_type {
            ColumnType::Varchar => Some(Value::Varchar(json.to_string())),
            _ => None,
        },
    }
}

/// Fields picked out of one JSON document.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct JsonSpec {
    pub missing: MissingField,
    pub fields: Vec<JsonField>,
}

impl JsonSpec {
    pub(super) fn decode(&self, bytes: &[u8]) -> Result<Vec<Value>, DecodeError> {
        let doc: Json = serde_json::from_slice(bytes).map_err(|e| DecodeError::Malformed {
            format: "json",
            message: e.to_string(),
        })?;
        self.fields.iter().map(|field| field.decode(&doc, self.missing)).collect()
    }
}
