//! Integration tests for file runs and the read commands built on them

use crate::common::{assertions, sample_data, CliTestRunner};
use tabledger::audit::EventStatus;
use tabledger::TabledgerError;

fn runner_with_orders() -> CliTestRunner {
    let runner = CliTestRunner::new().unwrap();
    runner.fixture().create_csv("orders_v1.csv", &sample_data::orders_v1()).unwrap();
    runner.fixture().create_csv("orders_v2.csv", &sample_data::orders_v2()).unwrap();
    runner
}

#[test]
fn test_run_csv_file() {
    let runner = runner_with_orders();
    runner.expect_success(&["run", "sales_orders=orders_v1.csv", "--actor", "alice"]);

    let ledger = runner.fixture().ledger().unwrap();
    let events = ledger.events(None).unwrap();
    assert_eq!(events.len(), 1);

    let event = &events[0];
    assert_eq!(event.status, EventStatus::Success);
    assert_eq!(event.actor, "alice");
    assert_eq!(event.source_name, "file");
    assert_eq!(event.file_name.as_deref(), Some("orders_v1.csv"));
    assert_eq!(event.entities, vec!["sales_orders"]);
    assert_eq!(event.counts.inserted, 3);

    let rows = ledger.staging_rows("sales_orders").unwrap();
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|row| row.last_change_event_id.as_deref() == Some(event.id.as_str())));
    // Line numbers count the header
    assert_eq!(rows.iter().map(|row| row.source_row_num).min().flatten(), Some(2));

    assert!(ledger.head().unwrap().state_image_id.is_some());
    assertions::assert_ledger_consistent(&ledger);
}

#[test]
fn test_dry_run_writes_nothing() {
    let runner = runner_with_orders();
    runner.expect_success(&["run", "sales_orders=orders_v1.csv", "--dry-run", "--format", "json"]);

    let ledger = runner.fixture().ledger().unwrap();
    assert!(ledger.events(None).unwrap().is_empty());
    assert_eq!(ledger.staging_count("sales_orders").unwrap(), 0);
}

#[test]
fn test_rerun_and_update_via_cli() {
    let runner = runner_with_orders();
    runner.expect_success(&["run", "sales_orders=orders_v1.csv"]);
    runner.expect_success(&["run", "sales_orders=orders_v1.csv"]);
    runner.expect_success(&["run", "sales_orders=orders_v2.csv", "--no-image"]);

    let ledger = runner.fixture().ledger().unwrap();
    let events = ledger.events(None).unwrap();
    assert_eq!(events.len(), 3);

    // Newest first
    assert_eq!(events[1].status, EventStatus::NoChanges);
    assert_eq!(events[1].counts.unchanged, 3);
    assert_eq!(events[0].counts.inserted, 1);
    assert_eq!(events[0].counts.updated, 1);
    assert_eq!(events[0].counts.unchanged, 2);

    // --no-image leaves HEAD on the first run's image
    let head = ledger.image("HEAD").unwrap();
    assert_eq!(head.change_event_id, events[2].id);
}

#[test]
fn test_json_file_run() {
    let runner = CliTestRunner::new().unwrap();
    let data = serde_json::json!([
        {"order_id": 1, "order_date": "2024-01-05", "region": "EAST", "payment_method": "card", "revenue": 10.5},
        {"order_id": 2, "order_date": "2024-01-06", "region": "WEST", "payment_method": "cash", "revenue": 20}
    ]);
    runner.fixture().create_json("orders.json", &data).unwrap();

    runner.expect_success(&["run", "sales_orders=orders.json"]);

    let ledger = runner.fixture().ledger().unwrap();
    let rows = ledger.staging_rows("sales_orders").unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows.iter().find(|r| r.pk == "2").unwrap().get("revenue").to_json(), serde_json::json!(20.0));
}

#[test]
fn test_missing_file_starts_no_event() {
    let runner = CliTestRunner::new().unwrap();
    let err = runner.expect_failure(&["run", "sales_orders=missing.csv"]);
    assert!(matches!(err, TabledgerError::InvalidInput { .. }));
    assert!(runner.fixture().ledger().unwrap().events(None).unwrap().is_empty());
}

#[test]
fn test_read_commands_succeed() {
    let runner = runner_with_orders();
    runner.expect_success(&["run", "sales_orders=orders_v1.csv", "--materialize"]);
    runner.expect_success(&["run", "sales_orders=orders_v2.csv"]);

    for format in ["pretty", "json"] {
        runner.expect_success(&["events", "--format", format]);
        runner.expect_success(&["show", "HEAD", "--format", format]);
        runner.expect_success(&["diff", "HEAD", "--format", format]);
        runner.expect_success(&["diff", "HEAD", "--all", "--format", format]);
        runner.expect_success(&["diff", "HEAD", "--summary", "--format", format]);
        runner.expect_success(&[
            "diff", "HEAD", "--entity", "sales_orders", "--column", "revenue", "--format", format,
        ]);
        runner.expect_success(&["conflicts", "--format", format]);
        runner.expect_success(&["history", "--format", format]);
        runner.expect_success(&["image", "HEAD~1", "--show", "--format", format]);
        runner.expect_success(&["staging", "sales_orders", "--limit", "2", "--format", format]);
        runner.expect_success(&["verify", "--format", format]);
        runner.expect_success(&["stats", "--format", format]);
    }
}

#[test]
fn test_materialized_image_archive() {
    let runner = runner_with_orders();
    runner.expect_success(&["run", "sales_orders=orders_v1.csv", "--materialize"]);

    let fixture = runner.fixture();
    let ledger = fixture.ledger().unwrap();
    let image = ledger.image("HEAD").unwrap();
    let archive_name = image.archive_path.clone().expect("image should be materialized");
    assertions::assert_file_exists_and_not_empty(&fixture.workspace.image_path(&archive_name));

    let archive = ledger.image_archive(&image).unwrap();
    assert_eq!(archive.image.id, image.id);
    assert_eq!(archive.staging["sales_orders"].len(), 3);
    assert!(archive.staging["budget_transactions"].is_empty());
}

#[test]
fn test_diff_unknown_column_fails() {
    let runner = runner_with_orders();
    runner.expect_success(&["run", "sales_orders=orders_v1.csv"]);
    let err = runner.expect_failure(&["diff", "HEAD", "--entity", "sales_orders", "--column", "nope"]);
    assert!(matches!(err, TabledgerError::InvalidInput { .. }));
}

#[test]
fn test_rollback_commands() {
    let runner = runner_with_orders();
    runner.expect_success(&["run", "sales_orders=orders_v1.csv"]);
    runner.expect_success(&["run", "sales_orders=orders_v2.csv"]);

    let first = runner.fixture().ledger().unwrap().events(None).unwrap()[1].id.clone();
    runner.expect_success(&["rollback-to", &first, "--dry-run"]);
    runner.expect_success(&["rollback-to", &first, "--force", "--actor", "ops"]);

    let ledger = runner.fixture().ledger().unwrap();
    assert_eq!(ledger.staging_count("sales_orders").unwrap(), 3);
    let latest = &ledger.events(Some(1)).unwrap()[0];
    assert_eq!(latest.status, EventStatus::RolledBack);
    assert_eq!(latest.actor, "ops");
    assert_eq!(latest.rollback_of.as_deref(), Some(first.as_str()));
    assertions::assert_ledger_consistent(&ledger);
}
