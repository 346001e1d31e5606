//! Typed rows: raw source cells, validated staging rows and row documents

use crate::config::{ColumnSpec, ColumnType, EntitySchema};
use crate::error::{Result, TabledgerError};
use crate::hash::RowFingerprinter;
use chrono::{DateTime, NaiveDate, Utc};
use indexmap::IndexMap;
use serde::{Serialize, Serializer};
use std::fmt;

/// Key under which row documents carry the source line number
pub const SOURCE_ROW_KEY: &str = "source_row_num";
/// Key under which row documents carry the fingerprint
pub const ROW_HASH_KEY: &str = "row_hash";

/// A single typed cell
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Stable textual form used for fingerprinting
    pub fn canonical(&self) -> String {
        match self {
            Self::Null => "\u{0}".to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Text(s) => s.clone(),
            Self::Date(d) => d.format("%Y-%m-%d").to_string(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as J;

        match self {
            Self::Null => J::Null,
            Self::Bool(b) => J::Bool(*b),
            Self::Int(i) => J::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map(J::Number)
                .unwrap_or(J::Null),
            Self::Text(s) => J::String(s.clone()),
            Self::Date(d) => J::String(d.format("%Y-%m-%d").to_string()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            other => write!(f, "{}", other.canonical()),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

/// One untyped source row as it came out of a file
#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
    /// 1-based line number in the source, counting the header
    pub source_row_num: u64,
    pub cells: IndexMap<String, Option<String>>,
}

impl RawRow {
    pub fn new(source_row_num: u64) -> Self {
        Self {
            source_row_num,
            cells: IndexMap::new(),
        }
    }

    pub fn with(mut self, column: &str, value: &str) -> Self {
        self.cells.insert(column.to_string(), Some(value.to_string()));
        self
    }

    pub fn with_null(mut self, column: &str) -> Self {
        self.cells.insert(column.to_string(), None);
        self
    }

    /// Cell for a column, matched by name or alias
    pub fn get(&self, spec: &ColumnSpec) -> Option<&str> {
        self.cells
            .iter()
            .find(|(header, _)| spec.matches_header(header))
            .and_then(|(_, value)| value.as_deref())
    }

    /// Raw cells as a document, kept on rejected row changes
    pub fn to_document(&self) -> serde_json::Value {
        let mut doc = serde_json::Map::new();
        for (header, value) in &self.cells {
            let value = match value {
                Some(v) => serde_json::Value::String(v.clone()),
                None => serde_json::Value::Null,
            };
            doc.insert(header.clone(), value);
        }
        doc.insert(SOURCE_ROW_KEY.to_string(), serde_json::Value::from(self.source_row_num));
        serde_json::Value::Object(doc)
    }
}

/// Normalize a primary key cell into its string encoding
pub fn normalize_pk(spec: &ColumnSpec, raw: Option<&str>) -> std::result::Result<String, String> {
    let value = raw.map(str::trim).unwrap_or("");
    if value.is_empty() || value.eq_ignore_ascii_case("nan") || value.eq_ignore_ascii_case("none") {
        return Err(format!("missing primary key '{}'", spec.name));
    }

    match spec.column_type {
        ColumnType::Integer => match spec.column_type.coerce(value) {
            Ok(Value::Int(i)) => Ok(i.to_string()),
            _ => Err(format!("primary key '{}' is not an integer: '{}'", spec.name, value)),
        },
        _ => Ok(value.to_string()),
    }
}

/// A validated, fingerprinted row in the shape staging stores it
#[derive(Debug, Clone, PartialEq)]
pub struct StagingRow {
    pub pk: String,
    pub source_row_num: Option<u64>,
    pub attrs: IndexMap<String, Value>,
    pub fingerprint: String,
    pub last_change_event_id: Option<String>,
    pub last_updated_at: Option<DateTime<Utc>>,
}

impl StagingRow {
    /// Build a fingerprinted row from typed attributes
    pub fn new(schema: &EntitySchema, pk: String, source_row_num: Option<u64>, attrs: IndexMap<String, Value>) -> Self {
        let fingerprint = RowFingerprinter::fingerprint(schema, &attrs);
        Self {
            pk,
            source_row_num,
            attrs,
            fingerprint,
            last_change_event_id: None,
            last_updated_at: None,
        }
    }

    /// Validate a raw row against the entity schema
    pub fn validate(schema: &EntitySchema, raw: &RawRow) -> Result<Self> {
        let row = raw.source_row_num;
        let pk = normalize_pk(&schema.primary_key, raw.get(&schema.primary_key))
            .map_err(|msg| TabledgerError::validation(row, msg))?;

        let mut attrs = IndexMap::with_capacity(schema.columns.len());
        for column in &schema.columns {
            let value = match raw.get(column) {
                Some(cell) => column
                    .column_type
                    .coerce(cell)
                    .map_err(|msg| TabledgerError::validation(row, format!("{}: {}", column.name, msg)))?,
                None => Value::Null,
            };
            if column.required && value.is_null() {
                return Err(TabledgerError::validation(
                    row,
                    format!("{}: required value is missing", column.name),
                ));
            }
            attrs.insert(column.name.clone(), value);
        }

        Ok(Self::new(schema, pk, Some(row), attrs))
    }

    pub fn get(&self, column: &str) -> &Value {
        self.attrs.get(column).unwrap_or(&Value::Null)
    }

    /// Columns whose values differ, in schema order
    pub fn changed_columns(&self, other: &StagingRow, schema: &EntitySchema) -> Vec<String> {
        schema
            .column_names()
            .filter(|name| self.get(name) != other.get(name))
            .map(str::to_string)
            .collect()
    }

    /// Domain attributes as a JSON object
    pub fn attrs_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .attrs
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        serde_json::Value::Object(map)
    }

    /// Decode attributes stored by `attrs_json`
    pub fn attrs_from_json(schema: &EntitySchema, json: &serde_json::Value) -> Result<IndexMap<String, Value>> {
        let mut attrs = IndexMap::with_capacity(schema.columns.len());
        for column in &schema.columns {
            let raw = json.get(&column.name).unwrap_or(&serde_json::Value::Null);
            let value = column.column_type.from_json(raw).map_err(|msg| {
                TabledgerError::integrity(format!("{}.{}: {}", schema.name, column.name, msg))
            })?;
            attrs.insert(column.name.clone(), value);
        }
        Ok(attrs)
    }

    /// Full row state as recorded in row change before/after snapshots
    pub fn to_document(&self, schema: &EntitySchema) -> serde_json::Value {
        let mut doc = serde_json::Map::new();
        let pk = match schema.primary_key.column_type {
            ColumnType::Integer => self
                .pk
                .parse::<i64>()
                .map(serde_json::Value::from)
                .unwrap_or_else(|_| serde_json::Value::String(self.pk.clone())),
            _ => serde_json::Value::String(self.pk.clone()),
        };
        doc.insert(schema.primary_key.name.clone(), pk);
        doc.insert(
            SOURCE_ROW_KEY.to_string(),
            self.source_row_num
                .map(serde_json::Value::from)
                .unwrap_or(serde_json::Value::Null),
        );
        for (name, value) in &self.attrs {
            doc.insert(name.clone(), value.to_json());
        }
        doc.insert(ROW_HASH_KEY.to_string(), serde_json::Value::String(self.fingerprint.clone()));
        serde_json::Value::Object(doc)
    }

    /// Rebuild a row from a snapshot document. The fingerprint is recomputed
    /// and must agree with the one the document carries.
    pub fn from_document(schema: &EntitySchema, doc: &serde_json::Value) -> Result<Self> {
        let pk = match doc.get(&schema.primary_key.name) {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => {
                return Err(TabledgerError::integrity(format!(
                    "row document for '{}' has no primary key",
                    schema.name
                )))
            }
        };
        let source_row_num = doc.get(SOURCE_ROW_KEY).and_then(|v| v.as_u64());
        let attrs = Self::attrs_from_json(schema, doc)?;
        let row = Self::new(schema, pk, source_row_num, attrs);

        if let Some(recorded) = doc.get(ROW_HASH_KEY).and_then(|v| v.as_str()) {
            if recorded != row.fingerprint {
                return Err(TabledgerError::integrity(format!(
                    "row document {}/{} carries fingerprint {} but its attributes hash to {}",
                    schema.name, row.pk, recorded, row.fingerprint
                )));
            }
        }

        Ok(row)
    }
}

/// Fingerprint recorded in a row document, if any
pub fn document_fingerprint(doc: &serde_json::Value) -> Option<&str> {
    doc.get(ROW_HASH_KEY).and_then(|v| v.as_str())
}
