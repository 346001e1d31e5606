//! Rollback engine
//!
//! Reversal walks recorded row changes backwards: events newest first and,
//! inside an event, highest sequence first. Each step is checked against the
//! state the forward change left behind before it is undone, using an
//! in-memory overlay over staging so a span of events can be reversed before
//! anything is written. The overlay is then collapsed into one net change per
//! row, so a rollback applies at most one mutation per key.

use crate::audit::{self, AuditWriter, ChangeEvent, NewRowChange, RowOp, RowChange};
use crate::config::{EntitySchema, LedgerConfig};
use crate::error::{Result, TabledgerError};
use crate::row::{document_fingerprint, StagingRow};
use crate::state::{self, StateImage};
use crate::store;
use chrono::{DateTime, Utc};
use duckdb::Connection;
use indexmap::IndexMap;
use serde::Serialize;
use std::collections::HashMap;

const ABSENT: &str = "<absent>";

type RowKey = (String, String);

/// The net effect of a rollback on one row
#[derive(Debug, Clone, PartialEq)]
pub struct NetChange {
    pub entity: String,
    pub pk: String,
    /// Live state when the rollback started
    pub current: Option<StagingRow>,
    /// State the rollback restores
    pub restored: Option<StagingRow>,
}

impl NetChange {
    pub fn op(&self) -> Option<RowOp> {
        match (&self.current, &self.restored) {
            (None, Some(_)) => Some(RowOp::Insert),
            (Some(_), None) => Some(RowOp::Delete),
            (Some(current), Some(restored)) if current.fingerprint != restored.fingerprint => Some(RowOp::Update),
            _ => None,
        }
    }
}

/// Walks row changes backwards over a staging overlay
pub struct Reverser<'a> {
    conn: &'a Connection,
    config: &'a LedgerConfig,
    overlay: HashMap<RowKey, Option<StagingRow>>,
    touched: IndexMap<RowKey, Option<StagingRow>>,
    reversed_events: Vec<String>,
}

impl<'a> Reverser<'a> {
    pub fn new(conn: &'a Connection, config: &'a LedgerConfig) -> Self {
        Self {
            conn,
            config,
            overlay: HashMap::new(),
            touched: IndexMap::new(),
            reversed_events: Vec::new(),
        }
    }

    fn schema(&self, entity: &str) -> Result<&'a EntitySchema> {
        self.config
            .entity(entity)
            .map_err(|_| TabledgerError::integrity(format!("row change refers to unknown entity '{}'", entity)))
    }

    fn current(&mut self, schema: &EntitySchema, key: &RowKey) -> Result<Option<StagingRow>> {
        if let Some(state) = self.overlay.get(key) {
            return Ok(state.clone());
        }
        let live = store::fetch_row(self.conn, schema, &key.1)?;
        self.overlay.insert(key.clone(), live.clone());
        Ok(live)
    }

    /// Undo every applied row change of `event` in the overlay
    pub fn reverse_event(&mut self, event: &ChangeEvent) -> Result<usize> {
        let changes = audit::applied_row_changes(self.conn, &event.id)?;
        for change in changes.iter().rev() {
            self.reverse_change(event, change)?;
        }
        self.reversed_events.push(event.id.clone());
        log::debug!("Reversed {} row change(s) of event {}", changes.len(), event.id);
        Ok(changes.len())
    }

    fn reverse_change(&mut self, event: &ChangeEvent, change: &RowChange) -> Result<()> {
        let schema = self.schema(&change.entity)?;
        let pk = change.pk.clone().ok_or_else(|| {
            TabledgerError::integrity(format!("applied row change {} has no primary key", change.id))
        })?;
        let key = (change.entity.clone(), pk);
        let current = self.current(schema, &key)?;

        let expected = match change.op {
            RowOp::Insert | RowOp::Update => {
                let after = change.db_after.as_ref().ok_or_else(|| {
                    TabledgerError::integrity(format!("row change {} has no post-state", change.id))
                })?;
                Some(document_fingerprint(after).ok_or_else(|| {
                    TabledgerError::integrity(format!("row change {} post-state has no fingerprint", change.id))
                })?)
            }
            RowOp::Delete => None,
        };
        let found = current.as_ref().map(|row| row.fingerprint.as_str());
        if expected != found {
            return Err(TabledgerError::FingerprintMismatch {
                event: event.id.clone(),
                entity: key.0,
                pk: key.1,
                expected: expected.unwrap_or(ABSENT).to_string(),
                found: found.unwrap_or(ABSENT).to_string(),
            });
        }

        let restored = match change.op {
            RowOp::Insert => None,
            RowOp::Update | RowOp::Delete => {
                let before = change.db_before.as_ref().ok_or_else(|| {
                    TabledgerError::integrity(format!("row change {} has no prior state", change.id))
                })?;
                Some(StagingRow::from_document(schema, before)?)
            }
        };

        self.touched.entry(key.clone()).or_insert(current);
        self.overlay.insert(key, restored);
        Ok(())
    }

    /// Ids of the events reversed so far, in reversal order
    pub fn reversed_events(&self) -> &[String] {
        &self.reversed_events
    }

    /// Net changes in the order rows were first touched, no-ops dropped
    pub fn into_net_changes(mut self) -> Vec<NetChange> {
        let mut net = Vec::with_capacity(self.touched.len());
        for (key, current) in self.touched {
            let restored = self.overlay.remove(&key).flatten();
            let change = NetChange {
                entity: key.0,
                pk: key.1,
                current,
                restored,
            };
            if change.op().is_some() {
                net.push(change);
            }
        }
        net
    }
}

/// Write net changes to staging and record them on the rollback event
pub fn apply_net_changes(
    conn: &Connection,
    config: &LedgerConfig,
    changes: &[NetChange],
    writer: &mut AuditWriter<'_>,
    at: &DateTime<Utc>,
) -> Result<()> {
    for change in changes {
        let schema = config.entity(&change.entity)?;
        let Some(op) = change.op() else { continue };
        let event_id = writer.event_id().to_string();

        let changed_columns = match (&change.current, &change.restored) {
            (Some(current), Some(restored)) => current.changed_columns(restored, schema),
            _ => schema.column_names().map(str::to_string).collect(),
        };

        match (op, &change.restored) {
            (RowOp::Insert, Some(row)) => store::insert_row(conn, schema, row, &event_id, at)?,
            (RowOp::Update, Some(row)) => store::update_row(conn, schema, row, &event_id, at)?,
            (RowOp::Delete, _) => store::delete_row(conn, schema, &change.pk)?,
            _ => return Err(TabledgerError::integrity("inconsistent rollback change")),
        }

        writer.record(NewRowChange {
            entity: change.entity.clone(),
            pk: Some(change.pk.clone()),
            op,
            applied: true,
            conflict: false,
            reason: None,
            changed_columns,
            db_before: change.current.as_ref().map(|row| row.to_document(schema)),
            db_after: change.restored.as_ref().map(|row| row.to_document(schema)),
            source_row_num: change
                .restored
                .as_ref()
                .or(change.current.as_ref())
                .and_then(|row| row.source_row_num),
        })?;
    }
    Ok(())
}

/// What a point-in-time rollback would do, computed without writing
#[derive(Debug, Clone, Serialize)]
pub struct RollbackPlan {
    pub target: String,
    /// Events to reverse, newest first
    pub events: Vec<String>,
    pub inserts: u64,
    pub updates: u64,
    pub deletes: u64,
    /// Image HEAD moves to, and whether it belongs to the target itself
    pub restore_image: Option<String>,
    pub exact_image: bool,
    #[serde(skip)]
    pub changes: Vec<NetChange>,
    #[serde(skip)]
    pub restore_point: Option<StateImage>,
}

/// Reverse a single event
pub fn plan_event_rollback(conn: &Connection, config: &LedgerConfig, target: &ChangeEvent) -> Result<Vec<NetChange>> {
    let mut reverser = Reverser::new(conn, config);
    reverser.reverse_event(target)?;
    Ok(reverser.into_net_changes())
}

/// Reverse everything newer than `target`, newest first. `exclude` skips
/// the rollback's own running event.
pub fn plan_rollback_to(
    conn: &Connection,
    config: &LedgerConfig,
    target: &ChangeEvent,
    exclude: Option<&str>,
) -> Result<RollbackPlan> {
    let newer: Vec<ChangeEvent> = audit::events_after(conn, target)?
        .into_iter()
        .filter(|event| Some(event.id.as_str()) != exclude)
        .collect();

    if let Some(running) = newer.iter().find(|event| !event.status.is_terminal()) {
        return Err(TabledgerError::invalid_state(format!(
            "event {} is still running",
            running.id
        )));
    }

    let mut reverser = Reverser::new(conn, config);
    for event in newer.iter().rev() {
        reverser.reverse_event(event)?;
    }
    let events = reverser.reversed_events().to_vec();
    let changes = reverser.into_net_changes();

    let mut plan = RollbackPlan {
        target: target.id.clone(),
        events,
        inserts: 0,
        updates: 0,
        deletes: 0,
        restore_image: None,
        exact_image: false,
        changes,
        restore_point: None,
    };
    for change in &plan.changes {
        match change.op() {
            Some(RowOp::Insert) => plan.inserts += 1,
            Some(RowOp::Update) => plan.updates += 1,
            Some(RowOp::Delete) => plan.deletes += 1,
            None => {}
        }
    }

    if let Some((image, exact)) = state::restore_point(conn, target)? {
        plan.restore_image = Some(image.id.clone());
        plan.exact_image = exact;
        plan.restore_point = Some(image);
    }
    Ok(plan)
}
