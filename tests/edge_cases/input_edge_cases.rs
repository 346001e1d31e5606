//! Edge cases around source input: headers, aliases, odd cells and files

use crate::common::{memory_ledger, raw_rows, sample_data, TestFixture};
use std::path::PathBuf;
use tabledger::audit::EventStatus;
use tabledger::row::{RawRow, Value};
use tabledger::{RunOptions, TabledgerError};

#[test]
fn test_missing_required_header_fails_the_run() {
    let mut ledger = memory_ledger();
    let rows = vec![RawRow::new(2)
        .with("order_id", "1")
        .with("order_date", "2024-01-01")
        .with("region", "EAST")];

    let err = ledger.run("sales_orders", rows, &RunOptions::default()).unwrap_err();
    let TabledgerError::RunFailed { change_event_id, source } = err else {
        panic!("missing headers should fail the recorded run");
    };
    assert!(source.to_string().contains("revenue"));

    let event = ledger.event(&change_event_id).unwrap();
    assert_eq!(event.status, EventStatus::Failed);
    assert!(event.notes.as_deref().unwrap_or("").contains("revenue"));
    assert_eq!(ledger.staging_count("sales_orders").unwrap(), 0);
}

#[test]
fn test_missing_optional_header_stages_nulls() {
    let mut ledger = memory_ledger();
    let rows = vec![RawRow::new(2)
        .with("order_id", "1")
        .with("order_date", "2024-01-01")
        .with("revenue", "5")];

    let result = ledger.run("sales_orders", rows, &RunOptions::default()).unwrap();
    assert_eq!(result.counts.inserted, 1);
    let staged = ledger.staging_rows("sales_orders").unwrap();
    assert_eq!(staged[0].get("region"), &Value::Null);
    assert_eq!(staged[0].get("payment_method"), &Value::Null);
}

#[test]
fn test_headers_match_case_and_aliases() {
    let mut ledger = memory_ledger();
    let orders = vec![RawRow::new(2)
        .with(" Order_ID ", "12")
        .with("ORDER_DATE", "2024-01-01")
        .with("Revenue", "7.5")];
    let budget = vec![RawRow::new(2)
        .with("Transaction ID", "T-1")
        .with("Date", "2024-01-31")
        .with("Budget Amount", "100")
        .with("Actual Amount", "90")];

    let result = ledger
        .run_batches(
            vec![
                ("sales_orders".to_string(), orders),
                ("budget_transactions".to_string(), budget),
            ],
            &RunOptions::default(),
        )
        .unwrap();
    assert_eq!(result.counts.inserted, 2);
    assert_eq!(ledger.staging_rows("sales_orders").unwrap()[0].pk, "12");
    assert_eq!(
        ledger.staging_rows("budget_transactions").unwrap()[0].get("budget_amount"),
        &Value::Float(100.0)
    );
}

#[test]
fn test_unknown_entity_records_nothing() {
    let mut ledger = memory_ledger();
    let err = ledger
        .run("invoices", raw_rows(&sample_data::orders_v1()), &RunOptions::default())
        .unwrap_err();
    assert!(matches!(err, TabledgerError::Config { .. }));
    assert!(ledger.events(None).unwrap().is_empty());
}

#[test]
fn test_empty_batch_is_a_recorded_no_op() {
    let mut ledger = memory_ledger();
    let result = ledger.run("sales_orders", Vec::new(), &RunOptions::default()).unwrap();
    assert_eq!(result.status, EventStatus::NoChanges);
    assert_eq!(ledger.events(None).unwrap().len(), 1);
    assert!(result.state_image_id.is_none());
}

#[test]
fn test_placeholder_keys_are_rejected() {
    let mut ledger = memory_ledger();
    let rows = vec![
        sample_data::order(2, "   ", "2024-01-01", "EAST", "1"),
        sample_data::order(3, "NaN", "2024-01-01", "EAST", "1"),
        sample_data::order(4, "None", "2024-01-01", "EAST", "1"),
        sample_data::order(5, "abc", "2024-01-01", "EAST", "1"),
    ];
    let result = ledger.run("sales_orders", rows, &RunOptions::default()).unwrap();
    assert_eq!(result.counts.rejected, 4);
    assert_eq!(result.summary[0].sample_rejected.len(), 4);
    assert_eq!(ledger.staging_count("sales_orders").unwrap(), 0);
}

#[test]
fn test_blank_optional_cell_clears_value() {
    let mut ledger = memory_ledger();
    let opts = RunOptions::default();
    ledger
        .run("sales_orders", vec![sample_data::order(2, "1", "2024-01-01", "EAST", "1")], &opts)
        .unwrap();
    let result = ledger
        .run("sales_orders", vec![sample_data::order(2, "1", "2024-01-01", "", "1")], &opts)
        .unwrap();

    assert_eq!(result.counts.updated, 1);
    assert_eq!(result.summary[0].column_updates.get("region"), Some(&1));
    assert_eq!(ledger.staging_rows("sales_orders").unwrap()[0].get("region"), &Value::Null);
}

#[test]
fn test_csv_with_quoted_delimiters() {
    let fixture = TestFixture::new().unwrap();
    let path = fixture
        .create_csv_raw(
            "orders.csv",
            "order_id,order_date,region,payment_method,revenue\n\
             1,2024-01-01,\"EAST, upper\",card,10.00\n\
             2,2024-01-02,WEST,,20.00\n",
        )
        .unwrap();

    let mut ledger = fixture.ledger().unwrap();
    let result = ledger
        .run_files(&[("sales_orders".to_string(), path)], &RunOptions::default())
        .unwrap();
    assert_eq!(result.counts.inserted, 2);

    let staged = ledger.staging_rows("sales_orders").unwrap();
    let first = staged.iter().find(|r| r.pk == "1").unwrap();
    assert_eq!(first.get("region"), &Value::Text("EAST, upper".to_string()));
    assert_eq!(first.source_row_num, Some(2));
    let second = staged.iter().find(|r| r.pk == "2").unwrap();
    assert_eq!(second.get("payment_method"), &Value::Null);

    let event = ledger.event(&result.change_event_id).unwrap();
    assert_eq!(event.file_name.as_deref(), Some("orders.csv"));
    assert_eq!(event.source_name, "file");
}

#[test]
fn test_unsupported_file_is_rejected_before_any_event() {
    let fixture = TestFixture::new().unwrap();
    let path = fixture.create_csv_raw("orders.xlsx", "not a spreadsheet").unwrap();

    let mut ledger = fixture.ledger().unwrap();
    let err = ledger
        .run_files(&[("sales_orders".to_string(), path)], &RunOptions::default())
        .unwrap_err();
    assert!(matches!(err, TabledgerError::InvalidInput { .. }));
    assert!(ledger.events(None).unwrap().is_empty());
}

#[test]
fn test_missing_file_is_rejected_before_any_event() {
    let fixture = TestFixture::new().unwrap();
    let mut ledger = fixture.ledger().unwrap();
    let err = ledger
        .run_files(
            &[("sales_orders".to_string(), PathBuf::from("/nonexistent/orders.csv"))],
            &RunOptions::default(),
        )
        .unwrap_err();
    assert!(matches!(err, TabledgerError::InvalidInput { .. }));
    assert!(ledger.events(None).unwrap().is_empty());
}

#[test]
fn test_preview_files_writes_nothing() {
    let fixture = TestFixture::new().unwrap();
    let path = fixture
        .create_csv_raw(
            "orders.csv",
            "order_id,order_date,region,payment_method,revenue\n\
             1,2024-01-01,EAST,card,10.00\n\
             x,2024-01-02,WEST,,20.00\n",
        )
        .unwrap();

    let ledger = fixture.ledger().unwrap();
    let preview = ledger.preview_files(&[("sales_orders".to_string(), path)]).unwrap();
    assert_eq!(preview.counts.inserted, 1);
    assert_eq!(preview.counts.rejected, 1);
    assert!(ledger.events(None).unwrap().is_empty());
    assert_eq!(ledger.staging_count("sales_orders").unwrap(), 0);
}
