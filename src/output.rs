//! Output formatting utilities

use crate::archive::{ArchiveStats, ImageArchive};
use crate::audit::{ChangeEvent, Conflict, EventStatus, RowChange, RunCounts};
use crate::diff::{ColumnDiff, DiffSummary};
use crate::error::Result;
use crate::ledger::{Preview, RunResult};
use crate::merge::EntitySummary;
use crate::rollback::RollbackPlan;
use crate::row::StagingRow;
use crate::state::{Head, StateImage};
use crate::verify::VerifyReport;
use crate::workspace::WorkspaceStats;

/// Pretty printer for ledger output
pub struct PrettyPrinter;

impl PrettyPrinter {
    /// Print workspace statistics
    pub fn print_workspace_stats(stats: &WorkspaceStats, events: usize, images: usize) {
        println!("📊 Ledger Workspace Statistics");
        println!("├─ Change events: {}", events);
        println!("├─ State images: {}", images);
        println!("├─ Database size: {}", format_bytes(stats.database_size));
        println!("├─ Archives: {}", stats.archive_count);
        println!("└─ Archive size: {}", format_bytes(stats.total_archive_size));
    }

    pub fn print_run_result(result: &RunResult) {
        println!("{} Run {}: {}", status_icon(result.status), short_id(&result.change_event_id), result.status);
        Self::print_counts(&result.counts, "├─");
        for summary in &result.summary {
            Self::print_entity_summary(summary);
        }
        match &result.state_image_id {
            Some(image) => println!("├─ State image: {}", short_id(image)),
            None => println!("├─ State image: none"),
        }
        println!("└─ {}", result.message);
    }

    pub fn print_preview(preview: &Preview) {
        println!("🔎 Dry run (nothing written)");
        Self::print_counts(&preview.counts, "├─");
        for summary in &preview.summary {
            Self::print_entity_summary(summary);
        }
        println!("└─ Re-run without --dry-run to apply");
    }

    fn print_counts(counts: &RunCounts, prefix: &str) {
        println!(
            "{} Inserted: {}, updated: {}, deleted: {}, unchanged: {}, conflicted: {}, rejected: {}",
            prefix,
            counts.inserted,
            counts.updated,
            counts.deleted,
            counts.unchanged,
            counts.conflicted,
            counts.rejected
        );
    }

    fn print_entity_summary(summary: &EntitySummary) {
        println!("├─ {}", summary.entity);
        if summary.deduplicated > 0 {
            println!("│  ├─ Duplicate keys collapsed: {}", summary.deduplicated);
        }
        if !summary.column_updates.is_empty() {
            let columns: Vec<String> = summary
                .column_updates
                .iter()
                .map(|(column, n)| format!("{} ({})", column, n))
                .collect();
            println!("│  ├─ Columns updated: {}", columns.join(", "));
        }
        let samples = [
            ("Inserted", &summary.sample_inserted),
            ("Updated", &summary.sample_updated),
            ("Conflicted", &summary.sample_conflicted),
            ("Rejected", &summary.sample_rejected),
        ];
        let shown: Vec<_> = samples.iter().filter(|(_, keys)| !keys.is_empty()).collect();
        for (i, (label, keys)) in shown.iter().enumerate() {
            let marker = if i == shown.len() - 1 { "└─" } else { "├─" };
            println!("│  {} {} (sample): {}", marker, label, keys.join(", "));
        }
    }

    pub fn print_events(events: &[ChangeEvent]) {
        if events.is_empty() {
            println!("No change events recorded.");
            return;
        }

        println!("📜 Change Events:");
        for (i, event) in events.iter().enumerate() {
            let prefix = if i == events.len() - 1 { "└─" } else { "├─" };
            println!(
                "{} {} {} {} {} [{}] +{} ~{} -{} !{} x{}",
                prefix,
                status_icon(event.status),
                short_id(&event.id),
                event.started_at.format("%Y-%m-%d %H:%M:%S"),
                event.source_name,
                event.status,
                event.counts.inserted,
                event.counts.updated,
                event.counts.deleted,
                event.counts.conflicted,
                event.counts.rejected
            );
        }
    }

    pub fn print_event(event: &ChangeEvent, image: Option<&StateImage>) {
        println!("{} Change event: {}", status_icon(event.status), event.id);
        println!("├─ Status: {}", event.status);
        println!("├─ Started: {}", event.started_at.format("%Y-%m-%d %H:%M:%S%.6f UTC"));
        if let Some(finished) = event.finished_at {
            println!("├─ Finished: {}", finished.format("%Y-%m-%d %H:%M:%S%.6f UTC"));
        }
        println!("├─ Actor: {}", event.actor);
        println!("├─ Source: {}", event.source_name);
        if let Some(file) = &event.file_name {
            println!("├─ File: {}", file);
        }
        println!("├─ Entities: {}", event.entities.join(", "));
        if let Some(target) = &event.rollback_of {
            println!("├─ Rollback of: {}", target);
        }
        if let Some(notes) = &event.notes {
            println!("├─ Notes: {}", notes);
        }
        if let Some(image) = image {
            println!("├─ State image: {}", image.id);
        }
        Self::print_counts(&event.counts, "└─");
    }

    pub fn print_diff_page(page: usize, changes: &[RowChange]) {
        println!("🔍 Page {} ({} record(s))", page, changes.len());
        for (i, change) in changes.iter().enumerate() {
            let last = i == changes.len() - 1;
            let prefix = if last { "└─" } else { "├─" };
            let indent = if last { "   " } else { "│  " };
            let state = match (change.applied, change.conflict) {
                (true, _) => "applied",
                (false, true) => "conflict",
                (false, false) => "rejected",
            };
            println!(
                "{} #{} {} {}/{} ({})",
                prefix,
                change.seq,
                change.op,
                change.entity,
                change.pk.as_deref().unwrap_or("<no key>"),
                state
            );
            if let Some(reason) = &change.reason {
                println!("{}├─ Reason: {}", indent, reason);
            }
            for column in &change.changed_columns {
                let before = field(change.db_before.as_ref(), column);
                let after = field(change.db_after.as_ref(), column);
                println!("{}├─ {}: {} → {}", indent, column, before, after);
            }
            if let Some(row) = change.source_row_num {
                println!("{}└─ Source row: {}", indent, row);
            }
        }
    }

    pub fn print_column_diffs(column: &str, page: usize, diffs: &[ColumnDiff]) {
        println!("🔍 Column '{}', page {}", column, page);
        for (i, diff) in diffs.iter().enumerate() {
            let prefix = if i == diffs.len() - 1 { "└─" } else { "├─" };
            println!(
                "{} {}/{}: {} → {}",
                prefix,
                diff.entity,
                diff.pk.as_deref().unwrap_or("<no key>"),
                diff.before,
                diff.after
            );
        }
    }

    pub fn print_diff_summary(summary: &DiffSummary) {
        println!("🔍 Event {} ({})", short_id(&summary.event.id), summary.event.status);
        Self::print_counts(&summary.recorded, "├─");
        println!("├─ Conflict records: {}", summary.conflicts);
        if summary.columns.is_empty() {
            println!("└─ No column changes");
            return;
        }
        println!("└─ Changes by column:");
        for (i, column) in summary.columns.iter().enumerate() {
            let prefix = if i == summary.columns.len() - 1 { "   └─" } else { "   ├─" };
            println!("{} {}.{}: {}", prefix, column.entity, column.column, column.changes);
        }
    }

    pub fn print_conflicts(conflicts: &[Conflict]) {
        if conflicts.is_empty() {
            println!("No conflicts.");
            return;
        }

        println!("⚠️  Conflicts:");
        for (i, conflict) in conflicts.iter().enumerate() {
            let last = i == conflicts.len() - 1;
            let prefix = if last { "└─" } else { "├─" };
            let indent = if last { "   " } else { "│  " };
            println!("{} {} {}/{}", prefix, short_id(&conflict.id), conflict.entity, conflict.pk);
            println!("{}├─ Event: {}", indent, short_id(&conflict.change_event_id));
            println!("{}├─ Columns: {}", indent, conflict.columns.join(", "));
            match &conflict.resolution {
                Some(resolution) => println!("{}└─ ✅ Resolved: {}", indent, resolution),
                None => println!("{}└─ ❌ Open", indent),
            }
        }
    }

    pub fn print_rollback_plan(plan: &RollbackPlan) {
        println!("⏪ Rollback to {} (dry run)", short_id(&plan.target));
        println!("├─ Events to reverse: {}", plan.events.len());
        for event in &plan.events {
            println!("│  └─ {}", short_id(event));
        }
        println!("├─ Rows to insert: {}", plan.inserts);
        println!("├─ Rows to update: {}", plan.updates);
        println!("├─ Rows to delete: {}", plan.deletes);
        match (&plan.restore_image, plan.exact_image) {
            (Some(image), true) => println!("└─ HEAD moves to image {}", short_id(image)),
            (Some(image), false) => println!("└─ HEAD moves to nearest ancestor image {}", short_id(image)),
            (None, _) => println!("└─ HEAD is cleared (no earlier image)"),
        }
    }

    pub fn print_history(head: &Head, images: &[StateImage]) {
        if images.is_empty() {
            println!("No state images.");
            return;
        }

        println!("🧬 History (HEAD → root):");
        for (i, image) in images.iter().enumerate() {
            let prefix = if i == images.len() - 1 { "└─" } else { "├─" };
            let marker = if head.state_image_id.as_deref() == Some(image.id.as_str()) {
                " (HEAD)"
            } else {
                ""
            };
            println!(
                "{} {}{} event {} at {}",
                prefix,
                short_id(&image.id),
                marker,
                short_id(&image.change_event_id),
                image.created_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
    }

    pub fn print_image(image: &StateImage) {
        println!("📸 State image: {}", image.id);
        println!("├─ Event: {}", image.change_event_id);
        println!("├─ Parent: {}", image.parent_id.as_deref().unwrap_or("<root>"));
        println!("├─ Created: {}", image.created_at.format("%Y-%m-%d %H:%M:%S"));
        if let Some(archive) = &image.archive_path {
            println!("├─ Archive: {}", archive);
        }
        println!("└─ State digest: {}", image.state_digest);
    }

    /// Print the size and contents of a materialized image
    pub fn print_archive(stats: &ArchiveStats, archive: &ImageArchive) {
        println!(
            "🗜️  Archive: {} compressed, {} raw ({:.1}% saved)",
            format_bytes(stats.compressed_size),
            format_bytes(stats.uncompressed_size),
            stats.compression_percentage()
        );
        let entities: Vec<_> = archive.staging.iter().collect();
        for (i, (entity, rows)) in entities.iter().enumerate() {
            let prefix = if i == entities.len() - 1 { "└─" } else { "├─" };
            println!("{} {}: {} row(s)", prefix, entity, rows.len());
        }
    }

    pub fn print_staging(entity: &str, rows: &[StagingRow]) {
        if rows.is_empty() {
            println!("{} has no staged rows.", entity);
            return;
        }

        println!("📋 {} ({} row(s))", entity, rows.len());
        for (i, row) in rows.iter().enumerate() {
            let prefix = if i == rows.len() - 1 { "└─" } else { "├─" };
            let attrs: Vec<String> = row.attrs.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
            println!("{} {}: {}", prefix, row.pk, attrs.join(", "));
        }
    }

    pub fn print_verify_report(report: &VerifyReport) {
        let icon = if report.is_ok() { "✅" } else { "❌" };
        println!("{} Ledger verification", icon);
        println!("├─ Events checked: {}", report.events_checked);
        println!("├─ Rows checked: {}", report.rows_checked);
        println!("├─ Images checked: {}", report.images_checked);
        if report.is_ok() {
            println!("└─ No issues found");
            return;
        }
        println!("└─ Issues: {}", report.issues.len());
        for (i, issue) in report.issues.iter().enumerate() {
            let prefix = if i == report.issues.len() - 1 { "   └─" } else { "   ├─" };
            println!("{} {}", prefix, issue);
        }
    }
}

/// JSON formatter for machine-readable output
pub struct JsonFormatter;

impl JsonFormatter {
    /// Format any serializable data as JSON
    pub fn format<T: serde::Serialize + ?Sized>(data: &T) -> Result<String> {
        Ok(serde_json::to_string_pretty(data)?)
    }

    pub fn format_workspace_stats(stats: &WorkspaceStats, events: usize, images: usize) -> Result<String> {
        let json = serde_json::json!({
            "change_events": events,
            "state_images": images,
            "database_size": stats.database_size,
            "archive_count": stats.archive_count,
            "total_archive_size": stats.total_archive_size
        });
        Ok(serde_json::to_string_pretty(&json)?)
    }
}

fn status_icon(status: EventStatus) -> &'static str {
    match status {
        EventStatus::Success => "✅",
        EventStatus::NoChanges => "➖",
        EventStatus::RolledBack => "⏪",
        EventStatus::Failed => "❌",
        EventStatus::Running => "⏳",
    }
}

/// First eight characters of an id
pub fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

fn field(doc: Option<&serde_json::Value>, column: &str) -> String {
    match doc.and_then(|d| d.get(column)) {
        Some(serde_json::Value::String(s)) => format!("'{}'", s),
        Some(value) => value.to_string(),
        None => "∅".to_string(),
    }
}

/// Format bytes in human-readable format
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}
