//! Ledger configuration: entity schemas, protected fields and defaults

use crate::error::{Result, TabledgerError};
use crate::row::Value;
use anyhow::Context;
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Column names the ledger keeps for itself in every staging row.
pub const RESERVED_COLUMNS: &[&str] = &["source_row_num", "row_hash"];

/// Type a column's cells are coerced to during validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Integer,
    Decimal,
    Text,
    Date,
    Boolean,
}

impl ColumnType {
    /// Coerce a raw cell. Blank cells become `Value::Null`.
    pub fn coerce(&self, raw: &str) -> std::result::Result<Value, String> {
        let s = raw.trim();
        if s.is_empty() {
            return Ok(Value::Null);
        }

        match self {
            Self::Text => Ok(Value::Text(s.to_string())),
            Self::Integer => parse_integer(s).map(Value::Int),
            Self::Decimal => parse_decimal(s).map(Value::Float),
            Self::Date => parse_date(s).map(Value::Date),
            Self::Boolean => match s.to_lowercase().as_str() {
                "true" | "t" | "yes" | "y" | "1" => Ok(Value::Bool(true)),
                "false" | "f" | "no" | "n" | "0" => Ok(Value::Bool(false)),
                _ => Err(format!("'{}' is not a boolean", s)),
            },
        }
    }

    /// Decode a value previously written into a row document
    pub fn from_json(&self, value: &serde_json::Value) -> std::result::Result<Value, String> {
        use serde_json::Value as J;

        match (self, value) {
            (_, J::Null) => Ok(Value::Null),
            (Self::Integer, J::Number(n)) => n
                .as_i64()
                .map(Value::Int)
                .ok_or_else(|| format!("{} is not an integer", n)),
            (Self::Decimal, J::Number(n)) => n
                .as_f64()
                .map(Value::Float)
                .ok_or_else(|| format!("{} is not a decimal", n)),
            (Self::Boolean, J::Bool(b)) => Ok(Value::Bool(*b)),
            (Self::Text, J::String(s)) => Ok(Value::Text(s.clone())),
            (_, J::String(s)) => self.coerce(s),
            (_, other) => Err(format!("unexpected {} for {:?} column", other, self)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Integer => "integer",
            Self::Decimal => "decimal",
            Self::Text => "text",
            Self::Date => "date",
            Self::Boolean => "boolean",
        }
    }
}

fn parse_integer(s: &str) -> std::result::Result<i64, String> {
    let cleaned = s.replace(',', "");
    if let Ok(n) = cleaned.parse::<i64>() {
        return Ok(n);
    }
    // Spreadsheet exports often carry integer keys as "7.0"
    match cleaned.parse::<f64>() {
        Ok(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < 9.0e15 => Ok(f as i64),
        _ => Err(format!("'{}' is not an integer", s)),
    }
}

fn parse_decimal(s: &str) -> std::result::Result<f64, String> {
    let mut cleaned = s.replace(['$', ','], "");
    if cleaned.starts_with('(') && cleaned.ends_with(')') && cleaned.len() > 2 {
        cleaned = format!("-{}", &cleaned[1..cleaned.len() - 1]);
    }
    match cleaned.trim().parse::<f64>() {
        Ok(f) if f.is_finite() => Ok(if f == 0.0 { 0.0 } else { f }),
        _ => Err(format!("'{}' is not a number", s)),
    }
}

fn parse_date(s: &str) -> std::result::Result<NaiveDate, String> {
    const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%d-%b-%Y", "%d %b %Y"];
    const DATETIME_FORMATS: &[&str] = &[
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%m/%d/%Y %H:%M",
        "%m/%d/%Y %H:%M:%S",
    ];

    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(s, format) {
            return Ok(date);
        }
    }
    for format in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(dt.date());
        }
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Ok(dt.date_naive());
    }

    Err(format!("'{}' is not a recognised date", s))
}

/// A typed column of an entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default)]
    pub required: bool,
    /// Alternative source headers that map onto this column
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
}

impl ColumnSpec {
    pub fn new(name: &str, column_type: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            column_type,
            required: false,
            aliases: Vec::new(),
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn alias(mut self, alias: &str) -> Self {
        self.aliases.push(alias.to_string());
        self
    }

    /// Whether a (trimmed) source header refers to this column
    pub fn matches_header(&self, header: &str) -> bool {
        let header = header.trim();
        header.eq_ignore_ascii_case(&self.name)
            || self.aliases.iter().any(|a| header.eq_ignore_ascii_case(a))
    }
}

/// Schema of one staged entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySchema {
    pub name: String,
    pub primary_key: ColumnSpec,
    pub columns: Vec<ColumnSpec>,
    /// Columns whose change is recorded as a conflict instead of applied
    #[serde(default)]
    pub protected: Vec<String>,
}

impl EntitySchema {
    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn is_protected(&self, column: &str) -> bool {
        self.protected.iter().any(|p| p == column)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    /// Name of the staging table backing this entity
    pub fn staging_table(&self) -> String {
        format!("stg_{}", self.name)
    }

    /// Headers a source file must carry: the key plus every required column
    pub fn missing_headers(&self, headers: &[&str]) -> Vec<String> {
        std::iter::once(&self.primary_key)
            .chain(self.columns.iter().filter(|c| c.required))
            .filter(|spec| !headers.iter().any(|h| spec.matches_header(h)))
            .map(|spec| spec.name.clone())
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        if !is_identifier(&self.name) {
            return Err(TabledgerError::config(format!(
                "Entity name '{}' must be lowercase letters, digits and underscores",
                self.name
            )));
        }
        if !is_identifier(&self.primary_key.name) {
            return Err(TabledgerError::config(format!(
                "Primary key '{}' of '{}' is not a valid identifier",
                self.primary_key.name, self.name
            )));
        }
        if !matches!(self.primary_key.column_type, ColumnType::Integer | ColumnType::Text) {
            return Err(TabledgerError::config(format!(
                "Primary key of '{}' must be integer or text",
                self.name
            )));
        }

        let mut seen = HashSet::new();
        seen.insert(self.primary_key.name.as_str());
        for column in &self.columns {
            if !is_identifier(&column.name) {
                return Err(TabledgerError::config(format!(
                    "Column '{}' of '{}' is not a valid identifier",
                    column.name, self.name
                )));
            }
            if RESERVED_COLUMNS.contains(&column.name.as_str()) {
                return Err(TabledgerError::config(format!(
                    "Column name '{}' is reserved",
                    column.name
                )));
            }
            if !seen.insert(column.name.as_str()) {
                return Err(TabledgerError::config(format!(
                    "Duplicate column '{}' in '{}'",
                    column.name, self.name
                )));
            }
        }

        for protected in &self.protected {
            if self.column(protected).is_none() {
                return Err(TabledgerError::config(format!(
                    "Protected field '{}' is not a column of '{}'",
                    protected, self.name
                )));
            }
        }

        Ok(())
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Workspace configuration stored in `.tabledger/config.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerConfig {
    pub version: String,
    #[serde(default = "default_actor")]
    pub default_actor: String,
    /// Create a state image after every successful run
    #[serde(default = "default_true")]
    pub create_images: bool,
    /// Also write a compressed archive of staging for every image
    #[serde(default)]
    pub materialize_images: bool,
    #[serde(default = "default_page_size")]
    pub diff_page_size: usize,
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,
    pub entities: Vec<EntitySchema>,
}

fn default_actor() -> String {
    crate::DEFAULT_ACTOR.to_string()
}

fn default_true() -> bool {
    true
}

fn default_page_size() -> usize {
    crate::DEFAULT_PAGE_SIZE
}

fn default_sample_size() -> usize {
    crate::DEFAULT_SAMPLE_SIZE
}

impl Default for LedgerConfig {
    fn default() -> Self {
        let sales_orders = EntitySchema {
            name: "sales_orders".to_string(),
            primary_key: ColumnSpec::new("order_id", ColumnType::Integer).required(),
            columns: vec![
                ColumnSpec::new("order_date", ColumnType::Date).required(),
                ColumnSpec::new("region", ColumnType::Text),
                ColumnSpec::new("payment_method", ColumnType::Text),
                ColumnSpec::new("revenue", ColumnType::Decimal).required(),
            ],
            protected: vec!["order_date".to_string()],
        };

        let budget_transactions = EntitySchema {
            name: "budget_transactions".to_string(),
            primary_key: ColumnSpec::new("transaction_id", ColumnType::Text)
                .required()
                .alias("Transaction ID"),
            columns: vec![
                ColumnSpec::new("date", ColumnType::Date).required().alias("Date"),
                ColumnSpec::new("department", ColumnType::Text).alias("Department"),
                ColumnSpec::new("category", ColumnType::Text).alias("Category"),
                ColumnSpec::new("region", ColumnType::Text).alias("Region"),
                ColumnSpec::new("budget_amount", ColumnType::Decimal)
                    .required()
                    .alias("Budget Amount"),
                ColumnSpec::new("actual_amount", ColumnType::Decimal)
                    .required()
                    .alias("Actual Amount"),
                ColumnSpec::new("payment_method", ColumnType::Text).alias("Payment Method"),
            ],
            protected: Vec::new(),
        };

        Self {
            version: crate::FORMAT_VERSION.to_string(),
            default_actor: default_actor(),
            create_images: true,
            materialize_images: false,
            diff_page_size: crate::DEFAULT_PAGE_SIZE,
            sample_size: crate::DEFAULT_SAMPLE_SIZE,
            entities: vec![sales_orders, budget_transactions],
        }
    }
}

impl LedgerConfig {
    /// Configuration over an explicit entity list
    pub fn with_entities(entities: Vec<EntitySchema>) -> Self {
        Self {
            entities,
            ..Self::default()
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn entity(&self, name: &str) -> Result<&EntitySchema> {
        self.entities
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| {
                TabledgerError::config(format!(
                    "Unknown entity '{}'. Configured: {}",
                    name,
                    self.entity_names().join(", ")
                ))
            })
    }

    pub fn entity_names(&self) -> Vec<&str> {
        self.entities.iter().map(|e| e.name.as_str()).collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.entities.is_empty() {
            return Err(TabledgerError::config("At least one entity must be configured"));
        }
        if self.diff_page_size == 0 {
            return Err(TabledgerError::config("diff_page_size must be greater than 0"));
        }

        let mut names = HashSet::new();
        for entity in &self.entities {
            entity.validate()?;
            if !names.insert(entity.name.as_str()) {
                return Err(TabledgerError::config(format!(
                    "Entity '{}' is configured twice",
                    entity.name
                )));
            }
        }
        Ok(())
    }
}
