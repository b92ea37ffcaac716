//! Row (de)serialization boundary
//!
//! Writers never look inside a row's encoding: they hand a [`Row`] to a
//! [`RowSerializer`] and buffer the bytes it returns. Sources do the reverse
//! through a [`RowDeserializer`].

use crate::error::{ConnectorError, ConnectorResult};
use crate::types::{FieldValue, Row, RowType};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// Default separator between fields of a delimited text row (`\u{1}`, Hive style)
pub const DEFAULT_FIELD_DELIMITER: &str = "\u{1}";
/// Default separator between rows in text files
pub const DEFAULT_ROW_DELIMITER: &str = "\n";

/// Encodes one row into bytes for an external system
pub trait RowSerializer: Send + Sync + fmt::Debug {
    fn serialize(&self, row: &Row) -> ConnectorResult<Vec<u8>>;
}

/// Decodes one record into a row
pub trait RowDeserializer: Send + Sync + fmt::Debug {
    fn deserialize(&self, bytes: &[u8]) -> ConnectorResult<Row>;
}

/// Encoding formats understood by the built-in connectors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    #[default]
    Json,
    Text,
    Csv,
    Parquet,
    Orc,
}

impl Format {
    /// Columnar formats carry their own schema
    pub fn is_self_describing(&self) -> bool {
        matches!(self, Format::Parquet | Format::Orc)
    }

    /// Formats this crate can encode row by row
    pub fn is_row_oriented(&self) -> bool {
        matches!(self, Format::Json | Format::Text | Format::Csv)
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Format::Json => "json",
            Format::Text => "text",
            Format::Csv => "csv",
            Format::Parquet => "parquet",
            Format::Orc => "orc",
        };
        write!(f, "{}", s)
    }
}

/// One JSON document per row.
///
/// With a row type the document is an object keyed by field name, otherwise
/// an array of values.
#[derive(Debug, Clone, Default)]
pub struct JsonRowSerializer {
    row_type: Option<RowType>,
}

impl JsonRowSerializer {
    pub fn new(row_type: Option<RowType>) -> Self {
        Self { row_type }
    }
}

impl RowSerializer for JsonRowSerializer {
    fn serialize(&self, row: &Row) -> ConnectorResult<Vec<u8>> {
        let value = match &self.row_type {
            Some(rt) => {
                if rt.len() != row.arity() {
                    return Err(ConnectorError::Serialization(format!(
                        "row has {} fields, row type has {}",
                        row.arity(),
                        rt.len()
                    )));
                }
                let obj: Map<String, Value> = rt
                    .names()
                    .zip(row.fields.iter())
                    .map(|(name, v)| (name.to_string(), v.to_json()))
                    .collect();
                Value::Object(obj)
            }
            None => Value::Array(row.fields.iter().map(FieldValue::to_json).collect()),
        };
        Ok(serde_json::to_vec(&value)?)
    }
}

impl RowDeserializer for JsonRowSerializer {
    fn deserialize(&self, bytes: &[u8]) -> ConnectorResult<Row> {
        let value: Value = serde_json::from_slice(bytes)?;
        let fields = match (value, &self.row_type) {
            (Value::Array(items), _) => items.into_iter().map(json_to_field).collect(),
            (Value::Object(mut obj), Some(rt)) => rt
                .names()
                .map(|name| obj.remove(name).map(json_to_field).unwrap_or(FieldValue::Null))
                .collect(),
            (Value::Object(obj), None) => obj.into_iter().map(|(_, v)| json_to_field(v)).collect(),
            (other, _) => vec![json_to_field(other)],
        };
        Ok(Row::new(fields))
    }
}

fn json_to_field(value: Value) -> FieldValue {
    match value {
        Value::Null => FieldValue::Null,
        Value::Bool(b) => FieldValue::Bool(b),
        Value::Number(n) => n
            .as_i64()
            .map(FieldValue::Int)
            .or_else(|| n.as_f64().map(FieldValue::Float))
            .unwrap_or(FieldValue::Null),
        Value::String(s) => FieldValue::String(s),
        other => FieldValue::String(other.to_string()),
    }
}

/// Fields joined by a delimiter; nulls render as empty
#[derive(Debug, Clone)]
pub struct DelimitedRowSerializer {
    field_delimiter: String,
}

impl Default for DelimitedRowSerializer {
    fn default() -> Self {
        Self::new(DEFAULT_FIELD_DELIMITER)
    }
}

impl DelimitedRowSerializer {
    pub fn new(field_delimiter: impl Into<String>) -> Self {
        Self {
            field_delimiter: field_delimiter.into(),
        }
    }

    pub fn csv() -> Self {
        Self::new(",")
    }
}

impl RowSerializer for DelimitedRowSerializer {
    fn serialize(&self, row: &Row) -> ConnectorResult<Vec<u8>> {
        let mut out = String::new();
        for (i, field) in row.fields.iter().enumerate() {
            if i > 0 {
                out.push_str(&self.field_delimiter);
            }
            let text = field.to_string();
            if text.contains(&self.field_delimiter) {
                return Err(ConnectorError::Serialization(format!(
                    "field {} contains the field delimiter",
                    i
                )));
            }
            out.push_str(&text);
        }
        Ok(out.into_bytes())
    }
}

impl RowDeserializer for DelimitedRowSerializer {
    fn deserialize(&self, bytes: &[u8]) -> ConnectorResult<Row> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| ConnectorError::Serialization(e.to_string()))?;
        let fields = text
            .split(self.field_delimiter.as_str())
            .map(|s| {
                if s.is_empty() {
                    FieldValue::Null
                } else {
                    FieldValue::String(s.to_string())
                }
            })
            .collect();
        Ok(Row::new(fields))
    }
}

/// Serializer for a row-oriented format
pub fn serializer_for(
    format: Format,
    field_delimiter: Option<&str>,
    row_type: Option<RowType>,
) -> ConnectorResult<Arc<dyn RowSerializer>> {
    match format {
        Format::Json => Ok(Arc::new(JsonRowSerializer::new(row_type))),
        Format::Text => Ok(Arc::new(DelimitedRowSerializer::new(
            field_delimiter.unwrap_or(DEFAULT_FIELD_DELIMITER),
        ))),
        Format::Csv => Ok(Arc::new(DelimitedRowSerializer::new(
            field_delimiter.unwrap_or(","),
        ))),
        other => Err(ConnectorError::Unsupported(format!(
            "writing {} files is not supported",
            other
        ))),
    }
}

/// Deserializer for a row-oriented format
pub fn deserializer_for(
    format: Format,
    field_delimiter: Option<&str>,
    row_type: Option<RowType>,
) -> ConnectorResult<Arc<dyn RowDeserializer>> {
    match format {
        Format::Json => Ok(Arc::new(JsonRowSerializer::new(row_type))),
        Format::Text => Ok(Arc::new(DelimitedRowSerializer::new(
            field_delimiter.unwrap_or(DEFAULT_FIELD_DELIMITER),
        ))),
        Format::Csv => Ok(Arc::new(DelimitedRowSerializer::new(
            field_delimiter.unwrap_or(","),
        ))),
        other => Err(ConnectorError::Unsupported(format!(
            "reading {} files is not supported",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row;
    use crate::types::FieldType;

    #[test]
    fn test_json_with_row_type() {
        let rt = RowType::new()
            .field("id", FieldType::Int)
            .field("name", FieldType::String);
        let ser = JsonRowSerializer::new(Some(rt));
        let bytes = ser.serialize(&row![1i64, "a"]).unwrap();
        let v: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v, serde_json::json!({"id": 1, "name": "a"}));

        let back = ser.deserialize(&bytes).unwrap();
        assert_eq!(back.fields, vec![FieldValue::Int(1), FieldValue::from("a")]);
    }

    #[test]
    fn test_json_arity_mismatch() {
        let rt = RowType::new().field("id", FieldType::Int);
        let ser = JsonRowSerializer::new(Some(rt));
        assert!(matches!(
            ser.serialize(&row![1i64, 2i64]),
            Err(ConnectorError::Serialization(_))
        ));
    }

    #[test]
    fn test_delimited_default_delimiter() {
        let ser = DelimitedRowSerializer::default();
        let row = Row::new(vec![FieldValue::Int(1), FieldValue::Null, "x".into()]);
        assert_eq!(ser.serialize(&row).unwrap(), b"1\x01\x01x".to_vec());

        let back = ser.deserialize(b"1\x01\x01x").unwrap();
        assert_eq!(
            back.fields,
            vec![FieldValue::from("1"), FieldValue::Null, FieldValue::from("x")]
        );
    }

    #[test]
    fn test_delimiter_inside_field_rejected() {
        let ser = DelimitedRowSerializer::csv();
        assert!(ser.serialize(&row!["a,b"]).is_err());
    }

    #[test]
    fn test_columnar_formats_unsupported() {
        assert!(Format::Parquet.is_self_describing());
        assert!(!Format::Csv.is_self_describing());
        assert!(matches!(
            serializer_for(Format::Orc, None, None),
            Err(ConnectorError::Unsupported(_))
        ));
    }
}
