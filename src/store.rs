//! DuckDB-backed store: schema bootstrap, timestamps and staging tables
//!
//! Ledger tables are append-only apart from the finalize step of a change
//! event, the resolution columns of a conflict and the single HEAD row.
//! Staging tables are the only place live rows are mutated. Structured
//! documents are stored as JSON text so they stay queryable with DuckDB's
//! JSON functions.

use crate::config::{EntitySchema, LedgerConfig};
use crate::error::{Result, TabledgerError};
use crate::hash::RowFingerprinter;
use crate::row::StagingRow;
use chrono::{DateTime, SecondsFormat, Utc};
use duckdb::{params, params_from_iter, Connection};
use std::collections::HashMap;
use std::path::Path;

/// Keys fetched per `IN (...)` lookup against a staging table
const FETCH_CHUNK: usize = 2000;

const LEDGER_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS change_events (
    change_event_id VARCHAR PRIMARY KEY,
    started_at      VARCHAR NOT NULL,
    finished_at     VARCHAR,
    status          VARCHAR NOT NULL,
    actor           VARCHAR NOT NULL,
    source_name     VARCHAR NOT NULL,
    file_name       VARCHAR,
    entities        VARCHAR NOT NULL,
    inserted        BIGINT NOT NULL DEFAULT 0,
    updated         BIGINT NOT NULL DEFAULT 0,
    deleted         BIGINT NOT NULL DEFAULT 0,
    unchanged       BIGINT NOT NULL DEFAULT 0,
    conflicted      BIGINT NOT NULL DEFAULT 0,
    rejected        BIGINT NOT NULL DEFAULT 0,
    notes           VARCHAR,
    rollback_of     VARCHAR
);

CREATE TABLE IF NOT EXISTS row_changes (
    row_change_id   VARCHAR PRIMARY KEY,
    change_event_id VARCHAR NOT NULL,
    seq             BIGINT NOT NULL,
    entity          VARCHAR NOT NULL,
    pk              VARCHAR,
    op              VARCHAR NOT NULL,
    applied         BOOLEAN NOT NULL,
    conflict        BOOLEAN NOT NULL,
    reason          VARCHAR,
    changed_columns VARCHAR NOT NULL,
    db_before       VARCHAR,
    db_after        VARCHAR,
    source_row_num  BIGINT,
    created_at      VARCHAR NOT NULL
);

CREATE TABLE IF NOT EXISTS conflicts (
    conflict_id     VARCHAR PRIMARY KEY,
    change_event_id VARCHAR NOT NULL,
    entity          VARCHAR NOT NULL,
    pk              VARCHAR NOT NULL,
    reason          VARCHAR NOT NULL,
    columns         VARCHAR NOT NULL,
    resolved        BOOLEAN NOT NULL DEFAULT FALSE,
    resolution      VARCHAR,
    resolved_at     VARCHAR,
    created_at      VARCHAR NOT NULL
);

CREATE TABLE IF NOT EXISTS state_images (
    state_image_id        VARCHAR PRIMARY KEY,
    parent_state_image_id VARCHAR,
    change_event_id       VARCHAR NOT NULL,
    created_at            VARCHAR NOT NULL,
    state_digest          VARCHAR NOT NULL,
    notes                 VARCHAR,
    archive_path          VARCHAR
);

CREATE TABLE IF NOT EXISTS state_head (
    id             INTEGER PRIMARY KEY,
    state_image_id VARCHAR,
    updated_at     VARCHAR
);

CREATE INDEX IF NOT EXISTS idx_row_changes_event ON row_changes (change_event_id);
CREATE INDEX IF NOT EXISTS idx_conflicts_event ON conflicts (change_event_id);
"#;

/// Current time truncated to the microsecond precision stored on disk
pub fn now() -> DateTime<Utc> {
    let ts = Utc::now();
    parse_ts(&format_ts(&ts)).unwrap_or(ts)
}

/// RFC 3339 with fixed microseconds, so string order is time order
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| TabledgerError::integrity(format!("bad timestamp '{}': {}", s, e)))
}

pub fn parse_ts_opt(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

/// Owns the DuckDB connection of a ledger
pub struct LedgerStore {
    conn: Connection,
}

impl LedgerStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        log::debug!("Opened ledger database at {}", path.display());
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            conn: Connection::open_in_memory()?,
        })
    }

    /// Create ledger and staging tables if they do not exist yet
    pub fn bootstrap(&self, config: &LedgerConfig) -> Result<()> {
        self.conn.execute_batch(LEDGER_DDL)?;
        self.conn.execute(
            "INSERT INTO state_head (id, state_image_id, updated_at)
             SELECT 1, NULL, NULL WHERE NOT EXISTS (SELECT 1 FROM state_head WHERE id = 1)",
            [],
        )?;

        for entity in &config.entities {
            self.conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS \"{}\" (
                    pk                   VARCHAR PRIMARY KEY,
                    source_row_num       BIGINT,
                    attrs                VARCHAR NOT NULL,
                    row_hash             VARCHAR NOT NULL,
                    last_change_event_id VARCHAR,
                    last_updated_at      VARCHAR
                );",
                entity.staging_table()
            ))?;
        }

        log::debug!("Ledger schema ready for {} entities", config.entities.len());
        Ok(())
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

struct StoredRow {
    pk: String,
    source_row_num: Option<i64>,
    attrs: String,
    row_hash: String,
    last_change_event_id: Option<String>,
    last_updated_at: Option<String>,
}

const ROW_COLUMNS: &str = "pk, source_row_num, attrs, row_hash, last_change_event_id, last_updated_at";

fn read_stored(row: &duckdb::Row<'_>) -> duckdb::Result<StoredRow> {
    Ok(StoredRow {
        pk: row.get(0)?,
        source_row_num: row.get(1)?,
        attrs: row.get(2)?,
        row_hash: row.get(3)?,
        last_change_event_id: row.get(4)?,
        last_updated_at: row.get(5)?,
    })
}

fn into_staging_row(schema: &EntitySchema, stored: StoredRow) -> Result<StagingRow> {
    let json: serde_json::Value = serde_json::from_str(&stored.attrs)?;
    let attrs = StagingRow::attrs_from_json(schema, &json)?;
    Ok(StagingRow {
        pk: stored.pk,
        source_row_num: stored.source_row_num.map(|n| n as u64),
        attrs,
        fingerprint: stored.row_hash,
        last_change_event_id: stored.last_change_event_id,
        last_updated_at: parse_ts_opt(stored.last_updated_at)?,
    })
}

/// Current staging rows for the given keys
pub fn fetch_rows(conn: &Connection, schema: &EntitySchema, keys: &[String]) -> Result<HashMap<String, StagingRow>> {
    let mut found = HashMap::with_capacity(keys.len());

    for chunk in keys.chunks(FETCH_CHUNK) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let sql = format!(
            "SELECT {} FROM \"{}\" WHERE pk IN ({})",
            ROW_COLUMNS,
            schema.staging_table(),
            placeholders
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(chunk.iter()), read_stored)?;
        for stored in rows {
            let row = into_staging_row(schema, stored?)?;
            found.insert(row.pk.clone(), row);
        }
    }

    Ok(found)
}

pub fn fetch_row(conn: &Connection, schema: &EntitySchema, pk: &str) -> Result<Option<StagingRow>> {
    let mut rows = fetch_rows(conn, schema, &[pk.to_string()])?;
    Ok(rows.remove(pk))
}

/// Every staging row of an entity, ordered by key
pub fn all_rows(conn: &Connection, schema: &EntitySchema) -> Result<Vec<StagingRow>> {
    let sql = format!("SELECT {} FROM \"{}\" ORDER BY pk", ROW_COLUMNS, schema.staging_table());
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], read_stored)?;

    let mut out = Vec::new();
    for stored in rows {
        out.push(into_staging_row(schema, stored?)?);
    }
    Ok(out)
}

pub fn row_count(conn: &Connection, schema: &EntitySchema) -> Result<u64> {
    let sql = format!("SELECT COUNT(*) FROM \"{}\"", schema.staging_table());
    let count: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
    Ok(count as u64)
}

pub fn insert_row(conn: &Connection, schema: &EntitySchema, row: &StagingRow, event_id: &str, at: &DateTime<Utc>) -> Result<()> {
    let sql = format!(
        "INSERT INTO \"{}\" ({}) VALUES (?, ?, ?, ?, ?, ?)",
        schema.staging_table(),
        ROW_COLUMNS
    );
    conn.execute(
        &sql,
        params![
            row.pk,
            row.source_row_num.map(|n| n as i64),
            row.attrs_json().to_string(),
            row.fingerprint,
            event_id,
            format_ts(at),
        ],
    )
    .map_err(|e| {
        TabledgerError::integrity(format!("insert of {}/{} failed: {}", schema.name, row.pk, e))
    })?;
    Ok(())
}

pub fn update_row(conn: &Connection, schema: &EntitySchema, row: &StagingRow, event_id: &str, at: &DateTime<Utc>) -> Result<()> {
    let sql = format!(
        "UPDATE \"{}\" SET source_row_num = ?, attrs = ?, row_hash = ?,
             last_change_event_id = ?, last_updated_at = ?
         WHERE pk = ?",
        schema.staging_table()
    );
    let affected = conn
        .execute(
            &sql,
            params![
                row.source_row_num.map(|n| n as i64),
                row.attrs_json().to_string(),
                row.fingerprint,
                event_id,
                format_ts(at),
                row.pk,
            ],
        )
        .map_err(|e| {
            TabledgerError::integrity(format!("update of {}/{} failed: {}", schema.name, row.pk, e))
        })?;

    if affected != 1 {
        return Err(TabledgerError::integrity(format!(
            "update of {}/{} touched {} rows",
            schema.name, row.pk, affected
        )));
    }
    Ok(())
}

pub fn delete_row(conn: &Connection, schema: &EntitySchema, pk: &str) -> Result<()> {
    let sql = format!("DELETE FROM \"{}\" WHERE pk = ?", schema.staging_table());
    let affected = conn.execute(&sql, params![pk]).map_err(|e| {
        TabledgerError::integrity(format!("delete of {}/{} failed: {}", schema.name, pk, e))
    })?;

    if affected != 1 {
        return Err(TabledgerError::integrity(format!(
            "delete of {}/{} touched {} rows",
            schema.name, pk, affected
        )));
    }
    Ok(())
}

/// Digest over the fingerprints of every configured entity's staging rows
pub fn state_digest(conn: &Connection, config: &LedgerConfig) -> Result<String> {
    let mut entries: Vec<(String, String, String)> = Vec::new();

    for schema in &config.entities {
        let sql = format!("SELECT pk, row_hash FROM \"{}\"", schema.staging_table());
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
        for pair in rows {
            let (pk, hash) = pair?;
            entries.push((schema.name.clone(), pk, hash));
        }
    }

    Ok(RowFingerprinter::state_digest(
        entries.iter().map(|(e, p, h)| (e.as_str(), p.as_str(), h.as_str())),
    ))
}
