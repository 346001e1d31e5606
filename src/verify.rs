//! Whole-store consistency checks

use crate::audit::{self, RowOp};
use crate::config::LedgerConfig;
use crate::error::Result;
use crate::hash::RowFingerprinter;
use crate::row::document_fingerprint;
use crate::state;
use crate::store;
use duckdb::Connection;
use serde::Serialize;
use std::collections::HashMap;

/// Outcome of a verification pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct VerifyReport {
    pub events_checked: u64,
    pub rows_checked: u64,
    pub images_checked: u64,
    pub issues: Vec<String>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.issues.is_empty()
    }
}

pub fn verify(conn: &Connection, config: &LedgerConfig) -> Result<VerifyReport> {
    let mut report = VerifyReport::default();

    check_events(conn, &mut report)?;
    check_staging(conn, config, &mut report)?;

    report.images_checked = state::all_images(conn)?.len() as u64;
    report.issues.extend(state::validate_chain(conn)?);

    if report.is_ok() {
        log::info!(
            "Verified {} events, {} rows and {} images",
            report.events_checked,
            report.rows_checked,
            report.images_checked
        );
    } else {
        log::warn!("Verification found {} issue(s)", report.issues.len());
    }
    Ok(report)
}

fn check_events(conn: &Connection, report: &mut VerifyReport) -> Result<()> {
    for event in audit::list_events(conn, None)? {
        report.events_checked += 1;
        if !event.status.is_terminal() {
            continue;
        }

        let mut recorded = audit::recount(conn, &event.id)?;
        recorded.unchanged = event.counts.unchanged;
        if recorded != event.counts {
            report.issues.push(format!(
                "Event {} counters {:?} disagree with its records {:?}",
                event.id, event.counts, recorded
            ));
        }

        let conflicts = audit::conflict_count(conn, &event.id)?;
        if conflicts != event.counts.conflicted {
            report.issues.push(format!(
                "Event {} reports {} conflicts but has {} conflict records",
                event.id, event.counts.conflicted, conflicts
            ));
        }
    }

    let orphans = audit::orphaned_records(conn)?;
    if orphans > 0 {
        report
            .issues
            .push(format!("{} ledger record(s) reference unknown events", orphans));
    }
    Ok(())
}

fn check_staging(conn: &Connection, config: &LedgerConfig, report: &mut VerifyReport) -> Result<()> {
    let mut live: HashMap<(String, String), String> = HashMap::new();

    for schema in &config.entities {
        for row in store::all_rows(conn, schema)? {
            report.rows_checked += 1;
            let recomputed = RowFingerprinter::fingerprint(schema, &row.attrs);
            if recomputed != row.fingerprint {
                report.issues.push(format!(
                    "{}/{} stores fingerprint {} but its attributes hash to {}",
                    schema.name, row.pk, row.fingerprint, recomputed
                ));
            }
            live.insert((schema.name.clone(), row.pk), row.fingerprint);
        }
    }

    for (entity, pk, op, after) in audit::latest_applied_per_key(conn)? {
        let key = (entity, pk);
        let staged = live.remove(&key);
        let expected = match op {
            RowOp::Delete => None,
            RowOp::Insert | RowOp::Update => after.as_ref().and_then(document_fingerprint).map(str::to_string),
        };
        if staged != expected {
            report.issues.push(format!(
                "{}/{} does not match its latest recorded change (staged {:?}, recorded {:?})",
                key.0, key.1, staged, expected
            ));
        }
    }

    for (entity, pk) in live.into_keys() {
        report
            .issues
            .push(format!("{}/{} is staged without any recorded change", entity, pk));
    }
    Ok(())
}
