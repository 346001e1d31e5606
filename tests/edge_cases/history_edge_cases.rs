//! Edge cases around event references and state images

use crate::common::{memory_ledger, raw_rows, sample_data, TestFixture};
use tabledger::{RunOptions, TabledgerError};

#[test]
fn test_event_id_prefixes() {
    let mut ledger = memory_ledger();
    let run = ledger
        .run("sales_orders", raw_rows(&sample_data::orders_v1()), &RunOptions::default())
        .unwrap();
    let id = &run.change_event_id;

    assert_eq!(ledger.resolve_event(id).unwrap().id, *id);
    assert_eq!(ledger.resolve_event(&id[..8]).unwrap().id, *id);

    assert!(matches!(
        ledger.resolve_event(&id[..3]),
        Err(TabledgerError::InvalidInput { .. })
    ));
    assert!(matches!(
        ledger.resolve_event("zzzzzzzz"),
        Err(TabledgerError::EventNotFound { .. })
    ));
    assert!(matches!(
        ledger.resolve_event("HEAD~two"),
        Err(TabledgerError::InvalidInput { .. })
    ));
    assert!(matches!(
        ledger.resolve_event("@last tuesday"),
        Err(TabledgerError::InvalidInput { .. })
    ));
}

#[test]
fn test_head_on_an_empty_ledger() {
    let ledger = memory_ledger();
    assert!(matches!(
        ledger.resolve_event("HEAD"),
        Err(TabledgerError::ImageNotFound { .. })
    ));
    assert!(ledger.history().unwrap().next().is_none());
}

#[test]
fn test_no_change_event_cannot_be_imaged() {
    let mut ledger = memory_ledger();
    let opts = RunOptions::default();
    ledger.run("sales_orders", raw_rows(&sample_data::orders_v1()), &opts).unwrap();
    let noop = ledger.run("sales_orders", raw_rows(&sample_data::orders_v1()), &opts).unwrap();

    assert!(matches!(
        ledger.create_state_image(&noop.change_event_id, None),
        Err(TabledgerError::InvalidState { .. })
    ));
}

#[test]
fn test_failed_event_cannot_be_imaged() {
    let mut ledger = memory_ledger();
    let rows = vec![tabledger::row::RawRow::new(2).with("order_id", "1")];
    let err = ledger.run("sales_orders", rows, &RunOptions::default()).unwrap_err();
    let TabledgerError::RunFailed { change_event_id, .. } = err else {
        panic!("expected a failed run");
    };

    assert!(matches!(
        ledger.create_state_image(&change_event_id, None),
        Err(TabledgerError::InvalidState { .. })
    ));
}

#[test]
fn test_superseded_event_cannot_be_imaged() {
    let mut ledger = memory_ledger();
    let opts = RunOptions::default().without_image();
    let v1 = ledger.run("sales_orders", raw_rows(&sample_data::orders_v1()), &opts).unwrap();
    ledger.run("sales_orders", raw_rows(&sample_data::orders_v2()), &opts).unwrap();

    let err = ledger.create_state_image(&v1.change_event_id, None).unwrap_err();
    assert!(matches!(err, TabledgerError::InvalidState { .. }));
    assert!(err.to_string().contains("superseded"));
}

#[test]
fn test_later_no_change_runs_do_not_supersede() {
    let mut ledger = memory_ledger();
    let opts = RunOptions::default().without_image();
    let v1 = ledger.run("sales_orders", raw_rows(&sample_data::orders_v1()), &opts).unwrap();
    ledger.run("sales_orders", raw_rows(&sample_data::orders_v1()), &opts).unwrap();

    let image = ledger.create_state_image(&v1.change_event_id, None).unwrap();
    assert_eq!(image.change_event_id, v1.change_event_id);
}

#[test]
fn test_unknown_image_reference() {
    let ledger = memory_ledger();
    assert!(matches!(
        ledger.image("HEAD~3"),
        Err(TabledgerError::ImageNotFound { .. })
    ));
    assert!(matches!(
        ledger.image("deadbeef-0000"),
        Err(TabledgerError::EventNotFound { .. })
    ));
}

#[test]
fn test_unmaterialized_image_has_no_archive() {
    let mut ledger = memory_ledger();
    let run = ledger
        .run("sales_orders", raw_rows(&sample_data::orders_v1()), &RunOptions::default())
        .unwrap();
    let image = ledger.image(run.state_image_id.as_deref().unwrap()).unwrap();

    assert!(matches!(
        ledger.image_archive(&image),
        Err(TabledgerError::Archive(_))
    ));
}

#[test]
fn test_materialized_image_round_trips_staging() {
    let fixture = TestFixture::new().unwrap();
    let mut ledger = fixture.ledger().unwrap();
    let run = ledger
        .run(
            "sales_orders",
            raw_rows(&sample_data::orders_v1()),
            &RunOptions::default().materialize(true),
        )
        .unwrap();

    let image = ledger.image(run.state_image_id.as_deref().unwrap()).unwrap();
    assert!(image.archive_path.is_some());

    let archive = ledger.image_archive(&image).unwrap();
    assert_eq!(archive.image.id, image.id);
    assert_eq!(archive.staging["sales_orders"].len(), 3);
    assert!(archive.staging["budget_transactions"].is_empty());
    assert_eq!(archive.event["id"], serde_json::json!(run.change_event_id));
}
