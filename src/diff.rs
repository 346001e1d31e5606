//! Paged access to the row changes of an event
//!
//! Pagers are finite and restartable: they hold a sequence-number cursor
//! and a page size, and hand out one page per call until the event's
//! records are exhausted.

use crate::audit::{self, ChangeEvent, RowChange, RunCounts};
use crate::error::Result;
use duckdb::Connection;
use serde::Serialize;

/// Pages through every row change of one event in sequence order
pub struct DiffPager<'c> {
    conn: &'c Connection,
    event_id: String,
    column: Option<(String, String)>,
    page_size: usize,
    cursor: i64,
    exhausted: bool,
}

impl<'c> DiffPager<'c> {
    pub fn new(conn: &'c Connection, event_id: &str, page_size: usize) -> Self {
        Self {
            conn,
            event_id: event_id.to_string(),
            column: None,
            page_size: page_size.max(1),
            cursor: 0,
            exhausted: false,
        }
    }

    /// Restrict the pager to changes touching one column of one entity
    pub fn for_column(mut self, entity: &str, column: &str) -> Self {
        self.column = Some((entity.to_string(), column.to_string()));
        self
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Sequence number of the last record handed out
    pub fn cursor(&self) -> i64 {
        self.cursor
    }

    pub fn restart(&mut self) {
        self.cursor = 0;
        self.exhausted = false;
    }

    /// Jump to the given 1-based page
    pub fn seek_page(&mut self, page: usize) -> Result<Option<Vec<RowChange>>> {
        self.restart();
        for _ in 1..page.max(1) {
            if self.next_page()?.is_none() {
                return Ok(None);
            }
        }
        self.next_page()
    }

    pub fn next_page(&mut self) -> Result<Option<Vec<RowChange>>> {
        if self.exhausted {
            return Ok(None);
        }

        let page = match &self.column {
            Some((entity, column)) => audit::column_changes_page(
                self.conn,
                &self.event_id,
                entity,
                column,
                self.cursor,
                self.page_size,
            )?,
            None => audit::row_changes_page(self.conn, &self.event_id, self.cursor, self.page_size)?,
        };

        if page.len() < self.page_size {
            self.exhausted = true;
        }
        match page.last() {
            Some(last) => {
                self.cursor = last.seq;
                Ok(Some(page))
            }
            None => Ok(None),
        }
    }
}

impl Iterator for DiffPager<'_> {
    type Item = Result<Vec<RowChange>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_page().transpose()
    }
}

/// One column's before and after value on one row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnDiff {
    pub entity: String,
    pub pk: Option<String>,
    pub source_row_num: Option<u64>,
    pub before: serde_json::Value,
    pub after: serde_json::Value,
}

impl ColumnDiff {
    pub fn from_change(change: &RowChange, column: &str) -> Self {
        let pick = |doc: &Option<serde_json::Value>| {
            doc.as_ref()
                .and_then(|d| d.get(column))
                .cloned()
                .unwrap_or(serde_json::Value::Null)
        };
        Self {
            entity: change.entity.clone(),
            pk: change.pk.clone(),
            source_row_num: change.source_row_num,
            before: pick(&change.db_before),
            after: pick(&change.db_after),
        }
    }
}

/// Pages of before/after values for one column
pub struct ColumnDiffPager<'c> {
    inner: DiffPager<'c>,
    column: String,
}

impl<'c> ColumnDiffPager<'c> {
    pub fn new(conn: &'c Connection, event_id: &str, entity: &str, column: &str, page_size: usize) -> Self {
        Self {
            inner: DiffPager::new(conn, event_id, page_size).for_column(entity, column),
            column: column.to_string(),
        }
    }

    pub fn restart(&mut self) {
        self.inner.restart();
    }
}

impl Iterator for ColumnDiffPager<'_> {
    type Item = Result<Vec<ColumnDiff>>;

    fn next(&mut self) -> Option<Self::Item> {
        let column = &self.column;
        self.inner.next().map(|page| {
            page.map(|changes| {
                changes
                    .iter()
                    .map(|change| ColumnDiff::from_change(change, column))
                    .collect()
            })
        })
    }
}

/// Per-column change count
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnChangeCount {
    pub entity: String,
    pub column: String,
    pub changes: u64,
}

/// Summary of an event rebuilt from its stored records
#[derive(Debug, Clone, Serialize)]
pub struct DiffSummary {
    pub event: ChangeEvent,
    /// Counters recomputed from the row change records
    pub recorded: RunCounts,
    pub conflicts: u64,
    pub columns: Vec<ColumnChangeCount>,
}

pub fn diff_summary(conn: &Connection, event: ChangeEvent) -> Result<DiffSummary> {
    let mut recorded = audit::recount(conn, &event.id)?;
    recorded.unchanged = event.counts.unchanged;
    let conflicts = audit::conflict_count(conn, &event.id)?;
    let columns = audit::column_change_counts(conn, &event.id)?
        .into_iter()
        .map(|(entity, column, changes)| ColumnChangeCount { entity, column, changes })
        .collect();

    Ok(DiffSummary {
        event,
        recorded,
        conflicts,
        columns,
    })
}
