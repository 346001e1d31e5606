//! Functional tests for forward runs: classification, conflicts, rejections and diffs

use crate::common::{assertions, memory_ledger, raw_rows, sample_data};
use tabledger::audit::{EventStatus, RowOp};
use tabledger::row::{RawRow, Value};
use tabledger::{RunOptions, TabledgerError};

#[test]
fn test_rerunning_identical_input_is_a_no_op() {
    let mut ledger = memory_ledger();
    let opts = RunOptions::default();

    let first = ledger.run("sales_orders", raw_rows(&sample_data::orders_v1()), &opts).unwrap();
    let digest = ledger.state_digest().unwrap();

    let second = ledger.run("sales_orders", raw_rows(&sample_data::orders_v1()), &opts).unwrap();
    assert_eq!(first.status, EventStatus::Success);
    assert_eq!(second.status, EventStatus::NoChanges);
    assert_eq!(second.counts.unchanged, 3);
    assert_eq!(second.counts.applied(), 0);
    assert_eq!(ledger.state_digest().unwrap(), digest);

    // Nothing is recorded for unchanged rows
    assert!(ledger.diff(&second.change_event_id, None).unwrap().next().is_none());
}

#[test]
fn test_source_order_does_not_change_fingerprints() {
    let mut ledger = memory_ledger();
    let opts = RunOptions::default();
    ledger.run("sales_orders", raw_rows(&sample_data::orders_v1()), &opts).unwrap();

    let mut reordered = sample_data::orders_v1();
    reordered[1..].reverse();
    let result = ledger.run("sales_orders", raw_rows(&reordered), &opts).unwrap();
    assert_eq!(result.status, EventStatus::NoChanges);
    assert_eq!(result.counts.unchanged, 3);
}

#[test]
fn test_equivalent_spellings_are_unchanged() {
    let mut ledger = memory_ledger();
    let opts = RunOptions::default();
    ledger
        .run("sales_orders", vec![sample_data::order(2, "1001", "2024-01-05", "EAST", "120.50")], &opts)
        .unwrap();

    // Same values, different source formatting
    let respelled = sample_data::order(2, " 1001 ", "2024-01-05", "EAST", "120.5");
    let result = ledger.run("sales_orders", vec![respelled], &opts).unwrap();
    assert_eq!(result.status, EventStatus::NoChanges);
}

#[test]
fn test_updates_record_changed_columns_only() {
    let mut ledger = memory_ledger();
    let opts = RunOptions::default();
    ledger.run("sales_orders", raw_rows(&sample_data::orders_v1()), &opts).unwrap();
    let result = ledger.run("sales_orders", raw_rows(&sample_data::orders_v2()), &opts).unwrap();

    assert_eq!(result.status, EventStatus::Success);
    assert_eq!(result.counts.inserted, 1);
    assert_eq!(result.counts.updated, 1);
    assert_eq!(result.counts.unchanged, 2);

    let changes: Vec<_> = ledger
        .diff(&result.change_event_id, None)
        .unwrap()
        .flat_map(|page| page.unwrap())
        .collect();
    assert_eq!(changes.len(), 2);

    let update = changes.iter().find(|c| c.op == RowOp::Update).unwrap();
    assert_eq!(update.pk.as_deref(), Some("1001"));
    assert_eq!(update.changed_columns, vec!["revenue"]);
    assert_eq!(update.db_before.as_ref().unwrap()["revenue"], serde_json::json!(120.5));
    assert_eq!(update.db_after.as_ref().unwrap()["revenue"], serde_json::json!(130.0));
    assert!(update.applied);

    let insert = changes.iter().find(|c| c.op == RowOp::Insert).unwrap();
    assert_eq!(insert.pk.as_deref(), Some("1004"));
    assert!(insert.db_before.is_none());
    assert_eq!(insert.source_row_num, Some(5));

    let staged = ledger.staging_rows("sales_orders").unwrap();
    let row = staged.iter().find(|r| r.pk == "1001").unwrap();
    assert_eq!(row.get("revenue"), &Value::Float(130.0));
    assert_eq!(row.last_change_event_id.as_deref(), Some(result.change_event_id.as_str()));

    assertions::assert_ledger_consistent(&ledger);
}

#[test]
fn test_protected_field_change_is_held_as_conflict() {
    let mut ledger = memory_ledger();
    let opts = RunOptions::default();
    ledger.run("sales_orders", raw_rows(&sample_data::orders_v1()), &opts).unwrap();
    let before = ledger.staging_rows("sales_orders").unwrap();

    let result = ledger
        .run("sales_orders", raw_rows(&sample_data::orders_with_conflict()), &opts)
        .unwrap();
    assert_eq!(result.status, EventStatus::Success);
    assert_eq!(result.counts.conflicted, 1);
    assert_eq!(result.counts.updated, 1);

    // The conflicted row keeps its old values, including the unprotected ones
    let after = ledger.staging_rows("sales_orders").unwrap();
    let held = after.iter().find(|r| r.pk == "1002").unwrap();
    assert_eq!(held, before.iter().find(|r| r.pk == "1002").unwrap());
    assert_eq!(after.iter().find(|r| r.pk == "1003").unwrap().get("region"), &Value::Text("SOUTH".to_string()));

    let conflicts = ledger.conflicts(Some(&result.change_event_id)).unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].pk, "1002");
    assert_eq!(conflicts[0].columns, vec!["order_date"]);
    assert!(!conflicts[0].resolved);

    let recorded: Vec<_> = ledger
        .diff(&result.change_event_id, None)
        .unwrap()
        .flat_map(|page| page.unwrap())
        .filter(|c| c.conflict)
        .collect();
    assert_eq!(recorded.len(), 1);
    assert!(!recorded[0].applied);
    assert_eq!(recorded[0].db_after.as_ref().unwrap()["order_date"], serde_json::json!("2024-02-01"));
    assert!(recorded[0].reason.as_deref().unwrap().contains("order_date"));

    assertions::assert_ledger_consistent(&ledger);
}

#[test]
fn test_conflict_resolution() {
    let mut ledger = memory_ledger();
    let opts = RunOptions::default();
    ledger.run("sales_orders", raw_rows(&sample_data::orders_v1()), &opts).unwrap();
    ledger
        .run("sales_orders", raw_rows(&sample_data::orders_with_conflict()), &opts)
        .unwrap();

    let open = ledger.conflicts(None).unwrap();
    assert_eq!(open.len(), 1);

    let resolved = ledger.resolve_conflict(&open[0].id, "confirmed with sales ops").unwrap();
    assert!(resolved.resolved);
    assert_eq!(resolved.resolution.as_deref(), Some("confirmed with sales ops"));
    assert!(resolved.resolved_at.is_some());
    assert!(ledger.conflicts(None).unwrap().is_empty());

    assert!(matches!(
        ledger.resolve_conflict(&open[0].id, "again"),
        Err(TabledgerError::InvalidState { .. })
    ));
    assert!(matches!(
        ledger.resolve_conflict("no-such-conflict", "x"),
        Err(TabledgerError::ConflictNotFound { .. })
    ));
    assert!(matches!(
        ledger.resolve_conflict(&open[0].id, "  "),
        Err(TabledgerError::InvalidInput { .. })
    ));
}

#[test]
fn test_invalid_rows_are_rejected_individually() {
    let mut ledger = memory_ledger();
    let rows = vec![
        sample_data::order(2, "1", "2024-01-05", "EAST", "10"),
        sample_data::order(3, "2", "2024-01-05", "EAST", "not-a-number"),
        sample_data::order(4, "", "2024-01-05", "EAST", "10"),
        sample_data::order(5, "3", "2024-01-05", "EAST", ""),
        sample_data::order(6, "4", "2024-13-45", "EAST", "10"),
    ];

    let result = ledger.run("sales_orders", rows, &RunOptions::default()).unwrap();
    assert_eq!(result.status, EventStatus::Success);
    assert_eq!(result.counts.inserted, 1);
    assert_eq!(result.counts.rejected, 4);
    assert_eq!(ledger.staging_count("sales_orders").unwrap(), 1);

    let rejected: Vec<_> = ledger
        .diff(&result.change_event_id, None)
        .unwrap()
        .flat_map(|page| page.unwrap())
        .filter(|c| !c.applied)
        .collect();
    assert_eq!(rejected.len(), 4);
    assert_eq!(
        rejected.iter().map(|c| c.source_row_num.unwrap()).collect::<Vec<_>>(),
        vec![3, 4, 5, 6]
    );
    assert!(rejected.iter().all(|c| c.reason.is_some() && !c.conflict));
    assert!(rejected[0].reason.as_deref().unwrap().contains("revenue"));
    // Raw cells are kept for review
    assert_eq!(rejected[0].db_after.as_ref().unwrap()["revenue"], serde_json::json!("not-a-number"));
    assert!(rejected[1].pk.is_none());

    assertions::assert_ledger_consistent(&ledger);
}

#[test]
fn test_only_rejections_still_succeeds_without_changes() {
    let mut ledger = memory_ledger();
    let rows = vec![sample_data::order(2, "1", "2024-01-05", "EAST", "oops")];
    let result = ledger.run("sales_orders", rows, &RunOptions::default()).unwrap();
    assert_eq!(result.status, EventStatus::Success);
    assert_eq!(result.counts.rejected, 1);
    assert_eq!(ledger.staging_count("sales_orders").unwrap(), 0);
}

#[test]
fn test_duplicate_keys_keep_the_last_row() {
    let mut ledger = memory_ledger();
    let rows = vec![
        sample_data::order(2, "7", "2024-01-05", "EAST", "1"),
        sample_data::order(3, "8", "2024-01-05", "EAST", "2"),
        sample_data::order(4, "7", "2024-01-05", "WEST", "3"),
    ];

    let result = ledger.run("sales_orders", rows, &RunOptions::default()).unwrap();
    assert_eq!(result.counts.inserted, 2);
    assert_eq!(result.summary[0].deduplicated, 1);

    let staged = ledger.staging_rows("sales_orders").unwrap();
    let seven = staged.iter().find(|r| r.pk == "7").unwrap();
    assert_eq!(seven.get("region"), &Value::Text("WEST".to_string()));
    assert_eq!(seven.source_row_num, Some(4));
}

#[test]
fn test_multi_entity_run_is_one_event() {
    let mut ledger = memory_ledger();
    let budget = RawRow::new(2)
        .with("Transaction ID", "T-1")
        .with("Date", "2024-01-31")
        .with("Department", "Ops")
        .with("Budget Amount", "1000")
        .with("Actual Amount", "950.25");

    let result = ledger
        .run_batches(
            vec![
                ("sales_orders".to_string(), raw_rows(&sample_data::orders_v1())),
                ("budget_transactions".to_string(), vec![budget]),
            ],
            &RunOptions::default().actor("loader").source("nightly"),
        )
        .unwrap();

    assert_eq!(result.counts.inserted, 4);
    assert_eq!(result.summary.len(), 2);

    let event = ledger.event(&result.change_event_id).unwrap();
    assert_eq!(event.entities, vec!["sales_orders", "budget_transactions"]);
    assert_eq!(event.actor, "loader");
    assert_eq!(event.source_name, "nightly");

    let budget_rows = ledger.staging_rows("budget_transactions").unwrap();
    assert_eq!(budget_rows[0].pk, "T-1");
    assert_eq!(budget_rows[0].get("actual_amount"), &Value::Float(950.25));
}

#[test]
fn test_run_summary_samples() {
    let mut ledger = memory_ledger();
    let opts = RunOptions::default();
    ledger.run("sales_orders", raw_rows(&sample_data::orders_v1()), &opts).unwrap();
    let result = ledger.run("sales_orders", raw_rows(&sample_data::orders_v2()), &opts).unwrap();

    let summary = &result.summary[0];
    assert_eq!(summary.entity, "sales_orders");
    assert_eq!(summary.sample_inserted, vec!["1004"]);
    assert_eq!(summary.sample_updated, vec!["1001"]);
    assert_eq!(summary.column_updates.get("revenue"), Some(&1));
}

#[test]
fn test_paged_diff_over_large_event() {
    let mut ledger = memory_ledger();
    let result = ledger
        .run("sales_orders", sample_data::many_orders(250), &RunOptions::default())
        .unwrap();
    assert_eq!(result.counts.inserted, 250);

    let pager = ledger.diff(&result.change_event_id, Some(100)).unwrap();
    let sizes: Vec<usize> = pager.map(|page| page.unwrap().len()).collect();
    assert_eq!(sizes, vec![100, 100, 50]);

    let mut pager = ledger.diff(&result.change_event_id, Some(100)).unwrap();
    let third = pager.seek_page(3).unwrap().unwrap();
    assert_eq!(third.first().unwrap().seq, 201);
    assert!(pager.next().is_none());

    // Restart yields the same first page again
    pager.restart();
    assert_eq!(pager.next().unwrap().unwrap()[0].seq, 1);

    let summary = ledger.diff_summary(&result.change_event_id).unwrap();
    assert_eq!(summary.recorded.inserted, 250);
}

#[test]
fn test_column_diff_pages() {
    let mut ledger = memory_ledger();
    let opts = RunOptions::default();
    ledger.run("sales_orders", raw_rows(&sample_data::orders_v1()), &opts).unwrap();
    let result = ledger.run("sales_orders", raw_rows(&sample_data::orders_v2()), &opts).unwrap();

    let diffs: Vec<_> = ledger
        .diff_column(&result.change_event_id, "sales_orders", "revenue", Some(1))
        .unwrap()
        .flat_map(|page| page.unwrap())
        .collect();

    // The insert touches every column, the update only revenue
    assert_eq!(diffs.len(), 2);
    let update = diffs.iter().find(|d| d.pk.as_deref() == Some("1001")).unwrap();
    assert_eq!(update.before, serde_json::json!(120.5));
    assert_eq!(update.after, serde_json::json!(130.0));

    let region: Vec<_> = ledger
        .diff_column(&result.change_event_id, "sales_orders", "region", None)
        .unwrap()
        .flat_map(|page| page.unwrap())
        .collect();
    assert_eq!(region.len(), 1);
    assert_eq!(region[0].before, serde_json::Value::Null);
}

#[test]
fn test_values_containing_separators_are_still_updates() {
    let mut ledger = memory_ledger();
    let opts = RunOptions::default();
    let order = |region: &str, payment: &str| {
        vec![RawRow::new(2)
            .with("order_id", "1")
            .with("order_date", "2024-01-01")
            .with("region", region)
            .with("payment_method", payment)
            .with("revenue", "10")]
    };

    ledger.run("sales_orders", order("A|payment_method=B", "C"), &opts).unwrap();
    let second = ledger.run("sales_orders", order("A", "B|payment_method=C"), &opts).unwrap();

    assert_eq!(second.status, EventStatus::Success);
    assert_eq!(second.counts.updated, 1);
    let staged = &ledger.staging_rows("sales_orders").unwrap()[0];
    assert_eq!(staged.get("region"), &Value::Text("A".to_string()));
    assert_eq!(staged.get("payment_method"), &Value::Text("B|payment_method=C".to_string()));
}

