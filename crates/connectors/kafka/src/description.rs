//! Table description files.
//!
//! Each `*.json` file in the description directory maps one topic onto one
//! table:
//!
//! ```json
//! {
//!   "tableName": "orders",
//!   "schemaName": "tpch",
//!   "topicName": "tpch.orders",
//!   "key": { "dataFormat": "raw", "fields": [
//!     { "name": "kafka_key", "type": "BIGINT", "dataFormat": "LONG", "mapping": "0", "hidden": true }
//!   ] },
//!   "message": { "dataFormat": "json", "fields": [
//!     { "name": "orderkey", "type": "BIGINT", "mapping": "orderkey" }
//!   ] }
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use crate::decoder::{DecodeErrorPolicy, MissingField};
use crate::error::{KafkaError, Result};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableDescription {
    pub table_name: String,
    #[serde(default)]
    pub schema_name: Option<String>,
    #[serde(default)]
    pub topic_name: Option<String>,
    #[serde(default)]
    pub on_decode_error: Option<DecodeErrorPolicy>,
    #[serde(default)]
    pub key: Option<FieldGroup>,
    #[serde(default)]
    pub message: Option<FieldGroup>,
}

/// Decoder settings and fields for one side of a record.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldGroup {
    pub data_format: String,
    #[serde(default)]
    pub fields: Vec<FieldDescription>,
    /// Delimited formats only.
    #[serde(default)]
    pub delimiter: Option<String>,
    #[serde(default)]
    pub charset: Option<String>,
    /// JSON only.
    #[serde(default)]
    pub on_missing_field: Option<MissingField>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDescription {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    #[serde(default)]
    pub mapping: Option<String>,
    /// Raw field kind, e.g. `LONG`.
    #[serde(default)]
    pub data_format: Option<String>,
    #[serde(default)]
    pub endianness: Option<String>,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
    #[serde(default)]
    pub hidden: bool,
}

impl TableDescription {
    pub fn from_json(path: &Path, text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|source| KafkaError::DescriptionParse { path: path.to_path_buf(), source })
    }
}

/// Reads every `*.json` description in `dir`, in file name order.
///
/// A missing directory holds no descriptions.
pub fn load_dir(dir: &Path) -> Result<Vec<(PathBuf, TableDescription)>> {
    let io_err = |source| KafkaError::DescriptionIo { path: dir.to_path_buf(), source };
    if !dir.exists() {
        debug!(dir = %dir.display(), "table description directory does not exist");
        return Ok(Vec::new());
    }

    let mut paths = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
            paths.push(path);
        }
    }
    paths.sort();

    paths
        .into_iter()
        .map(|path| {
            let text = fs::read_to_string(&path)
                .map_err(|source| KafkaError::DescriptionIo { path: path.clone(), source })?;
            let description = TableDescription::from_json(&path, &text)?;
            debug!(path = %path.display(), table = %description.table_name, "loaded table description");
            Ok((path, description))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORDERS: &str = r#"{
        "tableName": "orders",
        "schemaName": "tpch",
        "topicName": "tpch.orders",
        "onDecodeError": "skip",
        "key": {
            "dataFormat": "raw",
            "fields": [{ "name": "kafka_key", "type": "BIGINT", "dataFormat": "LONG", "mapping": "0", "hidden": true }]
        },
        "message": {
            "dataFormat": "json",
            "onMissingField": "fail",
            "fields": [
                { "name": "orderkey", "type": "BIGINT", "mapping": "orderkey" },
                { "name": "comment", "type": "VARCHAR(79)", "mapping": "comment", "default": "" }
            ]
        }
    }"#;

    #[test]
    fn test_parse_full_description() {
        let description = TableDescription::from_json(Path::new("orders.json"), ORDERS).unwrap();
        assert_eq!(description.table_name, "orders");
        assert_eq!(description.schema_name.as_deref(), Some("tpch"));
        assert_eq!(description.on_decode_error, Some(DecodeErrorPolicy::Skip));

        let key = description.key.unwrap();
        assert_eq!(key.data_format, "raw");
        assert!(key.fields[0].hidden);
        assert_eq!(key.fields[0].data_format.as_deref(), Some("LONG"));

        let message = description.message.unwrap();
        assert_eq!(message.on_missing_field, Some(MissingField::Fail));
        assert_eq!(message.fields[1].data_type, "VARCHAR(79)");
        assert_eq!(message.fields[1].default, Some(serde_json::json!("")));
    }

    #[test]
    fn test_minimal_description() {
        let description =
            TableDescription::from_json(Path::new("t.json"), r#"{"tableName": "events"}"#).unwrap();
        assert_eq!(description.schema_name, None);
        assert_eq!(description.key, None);
        assert_eq!(description.message, None);
    }

    #[test]
    fn test_parse_error_names_file() {
        let err = TableDescription::from_json(Path::new("broken.json"), "{").unwrap_err();
        assert!(err.to_string().contains("broken.json"));
    }

    #[test]
    fn test_load_dir_reads_json_files_in_order() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.json"), r#"{"tableName": "nation"}"#).unwrap();
        fs::write(dir.path().join("a.json"), r#"{"tableName": "region"}"#).unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let loaded = load_dir(dir.path()).unwrap();
        let names: Vec<&str> = loaded.iter().map(|(_, d)| d.table_name.as_str()).collect();
        assert_eq!(names, vec!["region", "nation"]);
    }

    #[test]
    fn test_missing_dir_is_empty() {
        assert!(load_dir(Path::new("/nonexistent/igloo/kafka")).unwrap().is_empty());
    }
}
