//! Audit ledger: change events, row changes and conflicts
//!
//! A change event is inserted as `running` in its own committed
//! transaction, so a run that later fails still leaves a trace. Row
//! changes, conflicts and the final counters are written by an
//! [`AuditWriter`] inside the run's transaction; the counters are derived
//! from the records the writer actually persisted.

use crate::error::{Result, TabledgerError};
use crate::store::{format_ts, now, parse_ts, parse_ts_opt};
use chrono::{DateTime, Duration, Utc};
use duckdb::{params, Connection};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a change event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Running,
    Success,
    NoChanges,
    Failed,
    RolledBack,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::NoChanges => "no_changes",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "no_changes" => Ok(Self::NoChanges),
            "failed" => Ok(Self::Failed),
            "rolled_back" => Ok(Self::RolledBack),
            other => Err(TabledgerError::integrity(format!("unknown event status '{}'", other))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Terminal statuses after which staging may have changed
    pub fn can_snapshot(&self) -> bool {
        matches!(self, Self::Success | Self::RolledBack)
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Row-level operation recorded in the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowOp {
    Insert,
    Update,
    Delete,
}

impl RowOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "insert" => Ok(Self::Insert),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(TabledgerError::integrity(format!("unknown row operation '{}'", other))),
        }
    }
}

impl std::fmt::Display for RowOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-outcome counters of a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
    pub unchanged: u64,
    pub conflicted: u64,
    pub rejected: u64,
}

impl RunCounts {
    pub fn add(&mut self, other: &RunCounts) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.unchanged += other.unchanged;
        self.conflicted += other.conflicted;
        self.rejected += other.rejected;
    }

    /// Rows that mutated staging
    pub fn applied(&self) -> u64 {
        self.inserted + self.updated + self.deleted
    }

    /// Whether the run recorded anything at all
    pub fn has_records(&self) -> bool {
        self.applied() + self.conflicted + self.rejected > 0
    }
}

/// One audited run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeEvent {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: EventStatus,
    pub actor: String,
    pub source_name: String,
    pub file_name: Option<String>,
    pub entities: Vec<String>,
    pub counts: RunCounts,
    pub notes: Option<String>,
    /// Event this run reverses (single-event rollback) or returns to
    /// (point-in-time rollback)
    pub rollback_of: Option<String>,
}

/// One row-level before/after record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowChange {
    pub id: String,
    pub change_event_id: String,
    pub seq: i64,
    pub entity: String,
    pub pk: Option<String>,
    pub op: RowOp,
    pub applied: bool,
    pub conflict: bool,
    pub reason: Option<String>,
    pub changed_columns: Vec<String>,
    pub db_before: Option<serde_json::Value>,
    pub db_after: Option<serde_json::Value>,
    pub source_row_num: Option<u64>,
    pub created_at: DateTime<Utc>,
}

/// A protected-field violation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Conflict {
    pub id: String,
    pub change_event_id: String,
    pub entity: String,
    pub pk: String,
    pub reason: String,
    pub columns: Vec<String>,
    pub resolved: bool,
    pub resolution: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Who and what started a run
#[derive(Debug, Clone, Default)]
pub struct EventContext {
    pub actor: String,
    pub source_name: String,
    pub file_name: Option<String>,
    pub entities: Vec<String>,
    pub notes: Option<String>,
    pub rollback_of: Option<String>,
}

/// A row change about to be written
#[derive(Debug, Clone)]
pub struct NewRowChange {
    pub entity: String,
    pub pk: Option<String>,
    pub op: RowOp,
    pub applied: bool,
    pub conflict: bool,
    pub reason: Option<String>,
    pub changed_columns: Vec<String>,
    pub db_before: Option<serde_json::Value>,
    pub db_after: Option<serde_json::Value>,
    pub source_row_num: Option<u64>,
}

/// Insert a `running` event. Start timestamps are kept strictly
/// increasing so start order is a total order.
pub fn start_event(conn: &Connection, ctx: &EventContext) -> Result<ChangeEvent> {
    let mut started_at = now();
    if let Some(last) = latest_started_at(conn)? {
        if started_at <= last {
            started_at = last + Duration::microseconds(1);
        }
    }

    let event = ChangeEvent {
        id: Uuid::new_v4().to_string(),
        started_at,
        finished_at: None,
        status: EventStatus::Running,
        actor: ctx.actor.clone(),
        source_name: ctx.source_name.clone(),
        file_name: ctx.file_name.clone(),
        entities: ctx.entities.clone(),
        counts: RunCounts::default(),
        notes: ctx.notes.clone(),
        rollback_of: ctx.rollback_of.clone(),
    };

    conn.execute(
        "INSERT INTO change_events
            (change_event_id, started_at, status, actor, source_name, file_name, entities, notes, rollback_of)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            event.id,
            format_ts(&event.started_at),
            event.status.as_str(),
            event.actor,
            event.source_name,
            event.file_name,
            serde_json::to_string(&event.entities)?,
            event.notes,
            event.rollback_of,
        ],
    )?;

    log::info!("Started change event {} ({})", event.id, event.source_name);
    Ok(event)
}

/// Writes the records of one run inside the run's transaction
pub struct AuditWriter<'c> {
    conn: &'c Connection,
    event_id: String,
    next_seq: i64,
    counts: RunCounts,
}

impl<'c> AuditWriter<'c> {
    pub fn new(conn: &'c Connection, event_id: &str) -> Self {
        Self {
            conn,
            event_id: event_id.to_string(),
            next_seq: 1,
            counts: RunCounts::default(),
        }
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn counts(&self) -> RunCounts {
        self.counts
    }

    pub fn add_unchanged(&mut self, rows: u64) {
        self.counts.unchanged += rows;
    }

    /// Persist a row change and count it under its outcome
    pub fn record(&mut self, change: NewRowChange) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let seq = self.next_seq;

        let to_text = |doc: &Option<serde_json::Value>| doc.as_ref().map(|d| d.to_string());
        self.conn
            .execute(
                "INSERT INTO row_changes
                    (row_change_id, change_event_id, seq, entity, pk, op, applied, conflict, reason,
                     changed_columns, db_before, db_after, source_row_num, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    id,
                    self.event_id,
                    seq,
                    change.entity,
                    change.pk,
                    change.op.as_str(),
                    change.applied,
                    change.conflict,
                    change.reason,
                    serde_json::to_string(&change.changed_columns)?,
                    to_text(&change.db_before),
                    to_text(&change.db_after),
                    change.source_row_num.map(|n| n as i64),
                    format_ts(&now()),
                ],
            )
            .map_err(|e| TabledgerError::integrity(format!("failed to write row change: {}", e)))?;

        self.next_seq += 1;
        match (change.applied, change.conflict, change.op) {
            (_, true, _) => self.counts.conflicted += 1,
            (false, false, _) => self.counts.rejected += 1,
            (true, false, RowOp::Insert) => self.counts.inserted += 1,
            (true, false, RowOp::Update) => self.counts.updated += 1,
            (true, false, RowOp::Delete) => self.counts.deleted += 1,
        }
        Ok(id)
    }

    /// Persist a conflict record; the matching row change carries the count
    pub fn record_conflict(&mut self, entity: &str, pk: &str, reason: &str, columns: &[String]) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        self.conn
            .execute(
                "INSERT INTO conflicts
                    (conflict_id, change_event_id, entity, pk, reason, columns, resolved, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, FALSE, ?)",
                params![
                    id,
                    self.event_id,
                    entity,
                    pk,
                    reason,
                    serde_json::to_string(columns)?,
                    format_ts(&now()),
                ],
            )
            .map_err(|e| TabledgerError::integrity(format!("failed to write conflict: {}", e)))?;
        Ok(id)
    }

    /// Close the event with its terminal status and the counted records
    pub fn finalize(self, status: EventStatus, notes: Option<&str>) -> Result<ChangeEvent> {
        if !status.is_terminal() {
            return Err(TabledgerError::invalid_state("cannot finalize an event as running"));
        }
        finish(self.conn, &self.event_id, status, &self.counts, notes)?;
        require_event(self.conn, &self.event_id)
    }
}

fn finish(conn: &Connection, event_id: &str, status: EventStatus, counts: &RunCounts, notes: Option<&str>) -> Result<()> {
    let affected = conn
        .execute(
            "UPDATE change_events SET
                finished_at = ?, status = ?, inserted = ?, updated = ?, deleted = ?,
                unchanged = ?, conflicted = ?, rejected = ?, notes = COALESCE(CAST(? AS VARCHAR), notes)
             WHERE change_event_id = ? AND status = 'running'",
            params![
                format_ts(&now()),
                status.as_str(),
                counts.inserted as i64,
                counts.updated as i64,
                counts.deleted as i64,
                counts.unchanged as i64,
                counts.conflicted as i64,
                counts.rejected as i64,
                notes,
                event_id,
            ],
        )
        .map_err(|e| TabledgerError::integrity(format!("failed to finalize event {}: {}", event_id, e)))?;

    if affected != 1 {
        return Err(TabledgerError::integrity(format!(
            "event {} is not running and cannot be finalized",
            event_id
        )));
    }
    log::info!("Finalized change event {} as {}", event_id, status);
    Ok(())
}

/// Mark a run failed with zero counts, after its transaction was discarded
pub fn fail_event(conn: &Connection, event_id: &str, notes: &str) -> Result<()> {
    finish(conn, event_id, EventStatus::Failed, &RunCounts::default(), Some(notes))
}

const EVENT_COLUMNS: &str = "change_event_id, started_at, finished_at, status, actor, source_name, file_name, \
     entities, inserted, updated, deleted, unchanged, conflicted, rejected, notes, rollback_of";

struct StoredEvent {
    id: String,
    started_at: String,
    finished_at: Option<String>,
    status: String,
    actor: String,
    source_name: String,
    file_name: Option<String>,
    entities: String,
    counts: [i64; 6],
    notes: Option<String>,
    rollback_of: Option<String>,
}

fn read_event(row: &duckdb::Row<'_>) -> duckdb::Result<StoredEvent> {
    Ok(StoredEvent {
        id: row.get(0)?,
        started_at: row.get(1)?,
        finished_at: row.get(2)?,
        status: row.get(3)?,
        actor: row.get(4)?,
        source_name: row.get(5)?,
        file_name: row.get(6)?,
        entities: row.get(7)?,
        counts: [row.get(8)?, row.get(9)?, row.get(10)?, row.get(11)?, row.get(12)?, row.get(13)?],
        notes: row.get(14)?,
        rollback_of: row.get(15)?,
    })
}

impl TryFrom<StoredEvent> for ChangeEvent {
    type Error = TabledgerError;

    fn try_from(stored: StoredEvent) -> Result<Self> {
        let [inserted, updated, deleted, unchanged, conflicted, rejected] = stored.counts.map(|n| n as u64);
        Ok(ChangeEvent {
            id: stored.id,
            started_at: parse_ts(&stored.started_at)?,
            finished_at: parse_ts_opt(stored.finished_at)?,
            status: EventStatus::parse(&stored.status)?,
            actor: stored.actor,
            source_name: stored.source_name,
            file_name: stored.file_name,
            entities: serde_json::from_str(&stored.entities)?,
            counts: RunCounts {
                inserted,
                updated,
                deleted,
                unchanged,
                conflicted,
                rejected,
            },
            notes: stored.notes,
            rollback_of: stored.rollback_of,
        })
    }
}

fn query_events(conn: &Connection, filter: &str, params: &[&dyn duckdb::ToSql]) -> Result<Vec<ChangeEvent>> {
    let sql = format!("SELECT {} FROM change_events {}", EVENT_COLUMNS, filter);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params, read_event)?;

    let mut events = Vec::new();
    for stored in rows {
        events.push(ChangeEvent::try_from(stored?)?);
    }
    Ok(events)
}

pub fn get_event(conn: &Connection, id: &str) -> Result<Option<ChangeEvent>> {
    Ok(query_events(conn, "WHERE change_event_id = ?", &[&id])?.into_iter().next())
}

pub fn require_event(conn: &Connection, id: &str) -> Result<ChangeEvent> {
    get_event(conn, id)?.ok_or_else(|| TabledgerError::EventNotFound { id: id.to_string() })
}

/// Most recent events first
pub fn list_events(conn: &Connection, limit: Option<usize>) -> Result<Vec<ChangeEvent>> {
    match limit {
        Some(limit) => query_events(
            conn,
            "ORDER BY started_at DESC, change_event_id DESC LIMIT ?",
            &[&(limit as i64)],
        ),
        None => query_events(conn, "ORDER BY started_at DESC, change_event_id DESC", &[]),
    }
}

/// Events started strictly after `event`, oldest first
pub fn events_after(conn: &Connection, event: &ChangeEvent) -> Result<Vec<ChangeEvent>> {
    let started = format_ts(&event.started_at);
    query_events(
        conn,
        "WHERE started_at > ? OR (started_at = ? AND change_event_id > ?)
         ORDER BY started_at ASC, change_event_id ASC",
        &[&started, &started, &event.id],
    )
}

pub fn events_with_prefix(conn: &Connection, prefix: &str) -> Result<Vec<ChangeEvent>> {
    query_events(
        conn,
        "WHERE starts_with(change_event_id, ?) ORDER BY started_at ASC",
        &[&prefix],
    )
}

/// Latest event started at or before `ts`
pub fn latest_event_at(conn: &Connection, ts: &DateTime<Utc>) -> Result<Option<ChangeEvent>> {
    let ts = format_ts(ts);
    Ok(query_events(
        conn,
        "WHERE started_at <= ? ORDER BY started_at DESC, change_event_id DESC LIMIT 1",
        &[&ts],
    )?
    .into_iter()
    .next())
}

pub fn latest_started_at(conn: &Connection) -> Result<Option<DateTime<Utc>>> {
    let latest: Option<String> = conn.query_row("SELECT MAX(started_at) FROM change_events", [], |row| row.get(0))?;
    parse_ts_opt(latest)
}

const ROW_CHANGE_COLUMNS: &str = "row_change_id, change_event_id, seq, entity, pk, op, applied, conflict, reason, \
     changed_columns, db_before, db_after, source_row_num, created_at";

struct StoredRowChange {
    id: String,
    change_event_id: String,
    seq: i64,
    entity: String,
    pk: Option<String>,
    op: String,
    applied: bool,
    conflict: bool,
    reason: Option<String>,
    changed_columns: String,
    db_before: Option<String>,
    db_after: Option<String>,
    source_row_num: Option<i64>,
    created_at: String,
}

fn read_row_change(row: &duckdb::Row<'_>) -> duckdb::Result<StoredRowChange> {
    Ok(StoredRowChange {
        id: row.get(0)?,
        change_event_id: row.get(1)?,
        seq: row.get(2)?,
        entity: row.get(3)?,
        pk: row.get(4)?,
        op: row.get(5)?,
        applied: row.get(6)?,
        conflict: row.get(7)?,
        reason: row.get(8)?,
        changed_columns: row.get(9)?,
        db_before: row.get(10)?,
        db_after: row.get(11)?,
        source_row_num: row.get(12)?,
        created_at: row.get(13)?,
    })
}

impl TryFrom<StoredRowChange> for RowChange {
    type Error = TabledgerError;

    fn try_from(stored: StoredRowChange) -> Result<Self> {
        let parse_doc = |text: Option<String>| -> Result<Option<serde_json::Value>> {
            Ok(match text {
                Some(text) => Some(serde_json::from_str(&text)?),
                None => None,
            })
        };
        Ok(RowChange {
            id: stored.id,
            change_event_id: stored.change_event_id,
            seq: stored.seq,
            entity: stored.entity,
            pk: stored.pk,
            op: RowOp::parse(&stored.op)?,
            applied: stored.applied,
            conflict: stored.conflict,
            reason: stored.reason,
            changed_columns: serde_json::from_str(&stored.changed_columns)?,
            db_before: parse_doc(stored.db_before)?,
            db_after: parse_doc(stored.db_after)?,
            source_row_num: stored.source_row_num.map(|n| n as u64),
            created_at: parse_ts(&stored.created_at)?,
        })
    }
}

fn query_row_changes(conn: &Connection, filter: &str, params: &[&dyn duckdb::ToSql]) -> Result<Vec<RowChange>> {
    let sql = format!("SELECT {} FROM row_changes {}", ROW_CHANGE_COLUMNS, filter);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params, read_row_change)?;

    let mut changes = Vec::new();
    for stored in rows {
        changes.push(RowChange::try_from(stored?)?);
    }
    Ok(changes)
}

/// One page of an event's row changes after the `after_seq` cursor
pub fn row_changes_page(conn: &Connection, event_id: &str, after_seq: i64, limit: usize) -> Result<Vec<RowChange>> {
    query_row_changes(
        conn,
        "WHERE change_event_id = ? AND seq > ? ORDER BY seq LIMIT ?",
        &[&event_id, &after_seq, &(limit as i64)],
    )
}

/// One page of an event's row changes touching `column` of `entity`
pub fn column_changes_page(
    conn: &Connection,
    event_id: &str,
    entity: &str,
    column: &str,
    after_seq: i64,
    limit: usize,
) -> Result<Vec<RowChange>> {
    // The quoted name matches one whole array element; `_` and `%` are literal
    let pattern = format!("%{}%", escape_like(&serde_json::to_string(column)?));
    query_row_changes(
        conn,
        "WHERE change_event_id = ? AND entity = ? AND changed_columns LIKE ? ESCAPE '\\' AND seq > ?
         ORDER BY seq LIMIT ?",
        &[&event_id, &entity, &pattern, &after_seq, &(limit as i64)],
    )
}

fn escape_like(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Every applied row change of an event, in the order they were applied
pub fn applied_row_changes(conn: &Connection, event_id: &str) -> Result<Vec<RowChange>> {
    query_row_changes(conn, "WHERE change_event_id = ? AND applied ORDER BY seq", &[&event_id])
}

pub fn all_row_changes(conn: &Connection, event_id: &str) -> Result<Vec<RowChange>> {
    query_row_changes(conn, "WHERE change_event_id = ? ORDER BY seq", &[&event_id])
}

/// Counters recomputed from an event's stored records
pub fn recount(conn: &Connection, event_id: &str) -> Result<RunCounts> {
    let mut stmt = conn.prepare(
        "SELECT op, applied, conflict, COUNT(*) FROM row_changes
         WHERE change_event_id = ? GROUP BY op, applied, conflict",
    )?;
    let rows = stmt.query_map(params![event_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, bool>(1)?,
            row.get::<_, bool>(2)?,
            row.get::<_, i64>(3)?,
        ))
    })?;

    let mut counts = RunCounts::default();
    for entry in rows {
        let (op, applied, conflict, n) = entry?;
        let n = n as u64;
        match (applied, conflict, RowOp::parse(&op)?) {
            (_, true, _) => counts.conflicted += n,
            (false, false, _) => counts.rejected += n,
            (true, false, RowOp::Insert) => counts.inserted += n,
            (true, false, RowOp::Update) => counts.updated += n,
            (true, false, RowOp::Delete) => counts.deleted += n,
        }
    }
    Ok(counts)
}

/// Per entity and column, how many applied row changes touched it
pub fn column_change_counts(conn: &Connection, event_id: &str) -> Result<Vec<(String, String, u64)>> {
    let mut stmt = conn.prepare(
        "SELECT entity, changed_columns FROM row_changes
         WHERE change_event_id = ? AND applied ORDER BY seq",
    )?;
    let rows = stmt.query_map(params![event_id], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut counts: indexmap::IndexMap<(String, String), u64> = indexmap::IndexMap::new();
    for entry in rows {
        let (entity, columns) = entry?;
        let columns: Vec<String> = serde_json::from_str(&columns)?;
        for column in columns {
            *counts.entry((entity.clone(), column)).or_insert(0) += 1;
        }
    }
    Ok(counts.into_iter().map(|((e, c), n)| (e, c, n)).collect())
}

/// For every key ever touched, the op and post-state of the latest applied change
pub fn latest_applied_per_key(conn: &Connection) -> Result<Vec<(String, String, RowOp, Option<serde_json::Value>)>> {
    let mut stmt = conn.prepare(
        "SELECT entity, pk, op, db_after FROM (
             SELECT rc.entity, rc.pk, rc.op, rc.db_after,
                    row_number() OVER (
                        PARTITION BY rc.entity, rc.pk
                        ORDER BY e.started_at DESC, rc.seq DESC
                    ) AS rn
             FROM row_changes rc
             JOIN change_events e ON e.change_event_id = rc.change_event_id
             WHERE rc.applied AND rc.pk IS NOT NULL
         ) latest
         WHERE rn = 1",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, Option<String>>(3)?,
        ))
    })?;

    let mut out = Vec::new();
    for entry in rows {
        let (entity, pk, op, after) = entry?;
        let after = match after {
            Some(text) => Some(serde_json::from_str(&text)?),
            None => None,
        };
        out.push((entity, pk, RowOp::parse(&op)?, after));
    }
    Ok(out)
}

/// Records whose event id is unknown to the ledger
pub fn orphaned_records(conn: &Connection) -> Result<u64> {
    let orphans: i64 = conn.query_row(
        "SELECT
            (SELECT COUNT(*) FROM row_changes rc
             WHERE NOT EXISTS (SELECT 1 FROM change_events e WHERE e.change_event_id = rc.change_event_id))
          + (SELECT COUNT(*) FROM conflicts c
             WHERE NOT EXISTS (SELECT 1 FROM change_events e WHERE e.change_event_id = c.change_event_id))",
        [],
        |row| row.get(0),
    )?;
    Ok(orphans as u64)
}

const CONFLICT_COLUMNS: &str =
    "conflict_id, change_event_id, entity, pk, reason, columns, resolved, resolution, resolved_at, created_at";

struct StoredConflict {
    id: String,
    change_event_id: String,
    entity: String,
    pk: String,
    reason: String,
    columns: String,
    resolved: bool,
    resolution: Option<String>,
    resolved_at: Option<String>,
    created_at: String,
}

fn read_conflict(row: &duckdb::Row<'_>) -> duckdb::Result<StoredConflict> {
    Ok(StoredConflict {
        id: row.get(0)?,
        change_event_id: row.get(1)?,
        entity: row.get(2)?,
        pk: row.get(3)?,
        reason: row.get(4)?,
        columns: row.get(5)?,
        resolved: row.get(6)?,
        resolution: row.get(7)?,
        resolved_at: row.get(8)?,
        created_at: row.get(9)?,
    })
}

fn query_conflicts(conn: &Connection, filter: &str, params: &[&dyn duckdb::ToSql]) -> Result<Vec<Conflict>> {
    let sql = format!("SELECT {} FROM conflicts {}", CONFLICT_COLUMNS, filter);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params, read_conflict)?;

    let mut conflicts = Vec::new();
    for stored in rows {
        let stored = stored?;
        conflicts.push(Conflict {
            id: stored.id,
            change_event_id: stored.change_event_id,
            entity: stored.entity,
            pk: stored.pk,
            reason: stored.reason,
            columns: serde_json::from_str(&stored.columns)?,
            resolved: stored.resolved,
            resolution: stored.resolution,
            resolved_at: parse_ts_opt(stored.resolved_at)?,
            created_at: parse_ts(&stored.created_at)?,
        });
    }
    Ok(conflicts)
}

pub fn conflicts_for_event(conn: &Connection, event_id: &str) -> Result<Vec<Conflict>> {
    query_conflicts(conn, "WHERE change_event_id = ? ORDER BY created_at, conflict_id", &[&event_id])
}

pub fn open_conflicts(conn: &Connection) -> Result<Vec<Conflict>> {
    query_conflicts(conn, "WHERE NOT resolved ORDER BY created_at, conflict_id", &[])
}

pub fn conflict_count(conn: &Connection, event_id: &str) -> Result<u64> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM conflicts WHERE change_event_id = ?",
        params![event_id],
        |row| row.get(0),
    )?;
    Ok(n as u64)
}

/// Record a resolution. This is an administrative action outside any run.
pub fn resolve_conflict(conn: &Connection, conflict_id: &str, resolution: &str) -> Result<Conflict> {
    let existing = query_conflicts(conn, "WHERE conflict_id = ?", &[&conflict_id])?
        .into_iter()
        .next()
        .ok_or_else(|| TabledgerError::ConflictNotFound {
            id: conflict_id.to_string(),
        })?;
    if existing.resolved {
        return Err(TabledgerError::invalid_state(format!(
            "conflict {} is already resolved",
            conflict_id
        )));
    }

    conn.execute(
        "UPDATE conflicts SET resolved = TRUE, resolution = ?, resolved_at = ?
         WHERE conflict_id = ? AND NOT resolved",
        params![resolution, format_ts(&now()), conflict_id],
    )?;

    query_conflicts(conn, "WHERE conflict_id = ?", &[&conflict_id])?
        .into_iter()
        .next()
        .ok_or_else(|| TabledgerError::ConflictNotFound {
            id: conflict_id.to_string(),
        })
}
