//! Source file loading using DuckDB
//!
//! Files are read into an in-memory DuckDB view and every cell is pulled
//! out as text. Typing happens later, against the entity schema, so the
//! loader never guesses column types on the ledger's behalf.

use crate::error::{Result, TabledgerError};
use crate::row::RawRow;
use duckdb::Connection;
use indexmap::IndexMap;
use std::path::{Path, PathBuf};

/// Loads tabular files into raw rows
pub struct DataProcessor {
    connection: Connection,
}

impl DataProcessor {
    pub fn new() -> Result<Self> {
        let connection = Connection::open_in_memory()?;

        connection.execute("SET enable_progress_bar=false", [])?;
        // Source order defines line numbers and duplicate-key precedence
        connection.execute("SET preserve_insertion_order=true", [])?;

        Ok(Self { connection })
    }

    /// Check if file format is supported
    pub fn is_supported_format(file_path: &Path) -> bool {
        matches!(Self::format_of(file_path).as_deref(), Some("csv" | "tsv" | "parquet" | "json" | "jsonl"))
    }

    fn format_of(file_path: &Path) -> Option<String> {
        file_path
            .extension()
            .and_then(|s| s.to_str())
            .map(|s| s.to_lowercase())
    }

    /// Read every row of a file as text cells
    pub fn load_file(&self, file_path: &Path) -> Result<LoadedFile> {
        if !file_path.exists() {
            return Err(TabledgerError::invalid_input(format!(
                "File not found: {}",
                file_path.display()
            )));
        }
        if !file_path.is_file() {
            return Err(TabledgerError::invalid_input(format!(
                "Not a file: {}",
                file_path.display()
            )));
        }

        let format = Self::format_of(file_path).unwrap_or_default();
        let path = file_path.to_string_lossy().replace('\'', "''");
        let (source, first_line) = match format.as_str() {
            "csv" => (format!("read_csv('{}', header=true, all_varchar=true)", path), 2),
            "tsv" => (format!("read_csv('{}', header=true, delim='\\t', all_varchar=true)", path), 2),
            "json" | "jsonl" => (format!("read_json_auto('{}')", path), 1),
            "parquet" => (format!("read_parquet('{}')", path), 1),
            other => {
                return Err(TabledgerError::invalid_input(format!(
                    "Unsupported file format '{}': {}",
                    other,
                    file_path.display()
                )))
            }
        };

        self.connection
            .execute(&format!("CREATE OR REPLACE VIEW data_view AS SELECT * FROM {}", source), [])
            .map_err(|e| self.convert_duckdb_error(e, file_path))?;

        let headers = self.column_names()?;
        let rows = self.extract_rows(&headers, first_line)?;
        log::debug!(
            "Loaded {} rows with {} columns from {}",
            rows.len(),
            headers.len(),
            file_path.display()
        );

        Ok(LoadedFile {
            source: file_path.to_path_buf(),
            headers,
            rows,
        })
    }

    /// Convert DuckDB errors to appropriate TabledgerError types
    fn convert_duckdb_error(&self, error: duckdb::Error, file_path: &Path) -> TabledgerError {
        let error_msg = error.to_string();

        if error_msg.contains("CSV Error")
            || error_msg.contains("Invalid CSV")
            || error_msg.contains("Unterminated quoted field")
        {
            TabledgerError::invalid_input(format!("Malformed CSV file '{}': {}", file_path.display(), error_msg))
        } else if error_msg.contains("JSON") {
            TabledgerError::invalid_input(format!("Malformed JSON file '{}': {}", file_path.display(), error_msg))
        } else if error_msg.contains("No files found") || error_msg.contains("does not exist") {
            TabledgerError::invalid_input(format!("File not found: {}", file_path.display()))
        } else if error_msg.contains("Permission denied") {
            TabledgerError::invalid_input(format!("Permission denied accessing file: {}", file_path.display()))
        } else if error_msg.contains("UTF-8") || error_msg.contains("encoding") {
            TabledgerError::invalid_input(format!("File encoding error '{}': {}", file_path.display(), error_msg))
        } else {
            TabledgerError::DuckDb(error)
        }
    }

    fn column_names(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .connection
            .prepare("DESCRIBE data_view")
            .map_err(|e| TabledgerError::data_processing(format!("Failed to describe source: {}", e)))?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut names = Vec::new();
        for name in rows {
            names.push(name?);
        }
        Ok(names)
    }

    fn extract_rows(&self, headers: &[String], first_line: u64) -> Result<Vec<RawRow>> {
        if headers.is_empty() {
            return Ok(Vec::new());
        }

        let projection = headers
            .iter()
            .map(|h| format!("CAST(\"{}\" AS VARCHAR)", h.replace('"', "\"\"")))
            .collect::<Vec<_>>()
            .join(", ");
        let mut stmt = self
            .connection
            .prepare(&format!("SELECT {} FROM data_view", projection))
            .map_err(|e| TabledgerError::data_processing(format!("Failed to prepare extraction: {}", e)))?;

        let trimmed: Vec<String> = headers.iter().map(|h| h.trim().to_string()).collect();
        let rows = stmt.query_map([], |row| {
            let mut cells = Vec::with_capacity(trimmed.len());
            for i in 0..trimmed.len() {
                cells.push(row.get::<_, Option<String>>(i)?);
            }
            Ok(cells)
        })?;

        let mut out = Vec::new();
        for (index, cells) in rows.enumerate() {
            let cells = cells.map_err(|e| TabledgerError::data_processing(format!("Failed to read row: {}", e)))?;
            let mut map = IndexMap::with_capacity(trimmed.len());
            for (header, cell) in trimmed.iter().zip(cells) {
                map.insert(header.clone(), cell);
            }
            out.push(RawRow {
                source_row_num: first_line + index as u64,
                cells: map,
            });
        }
        Ok(out)
    }
}

/// Rows read from one file
#[derive(Debug, Clone)]
pub struct LoadedFile {
    pub source: PathBuf,
    /// Trimmed header names in file order
    pub headers: Vec<String>,
    pub rows: Vec<RawRow>,
}

impl LoadedFile {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn file_name(&self) -> String {
        self.source
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.source.display().to_string())
    }
}
