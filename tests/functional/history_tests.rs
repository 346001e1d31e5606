//! State image chain and event reference tests

use crate::common::{memory_ledger, raw_rows, sample_data};
use tabledger::audit::EventStatus;
use tabledger::state::StateImage;
use tabledger::{Ledger, RunOptions, TabledgerError};

fn chain(ledger: &Ledger) -> Vec<StateImage> {
    ledger.history().unwrap().map(|image| image.unwrap()).collect()
}

#[test]
fn test_each_run_extends_the_chain() {
    let mut ledger = memory_ledger();
    let opts = RunOptions::default();
    assert!(ledger.head().unwrap().state_image_id.is_none());
    assert!(chain(&ledger).is_empty());

    let v1 = ledger.run("sales_orders", raw_rows(&sample_data::orders_v1()), &opts).unwrap();
    let v2 = ledger.run("sales_orders", raw_rows(&sample_data::orders_v2()), &opts).unwrap();

    let images = chain(&ledger);
    assert_eq!(images.len(), 2);
    assert_eq!(images[0].change_event_id, v2.change_event_id);
    assert_eq!(images[1].change_event_id, v1.change_event_id);
    assert_eq!(images[0].parent_id.as_deref(), Some(images[1].id.as_str()));
    assert!(images[1].parent_id.is_none());
    assert_eq!(ledger.head().unwrap().state_image_id.as_deref(), Some(images[0].id.as_str()));

    // The image digest is the digest of the state it captured
    assert_eq!(images[0].state_digest, ledger.state_digest().unwrap());
}

#[test]
fn test_no_change_runs_do_not_add_images() {
    let mut ledger = memory_ledger();
    let opts = RunOptions::default();
    ledger.run("sales_orders", raw_rows(&sample_data::orders_v1()), &opts).unwrap();
    let noop = ledger.run("sales_orders", raw_rows(&sample_data::orders_v1()), &opts).unwrap();

    assert_eq!(noop.status, EventStatus::NoChanges);
    assert!(noop.state_image_id.is_none());
    assert_eq!(chain(&ledger).len(), 1);
}

#[test]
fn test_head_offsets_resolve_along_the_chain() {
    let mut ledger = memory_ledger();
    let opts = RunOptions::default();
    let v1 = ledger.run("sales_orders", raw_rows(&sample_data::orders_v1()), &opts).unwrap();
    let v2 = ledger.run("sales_orders", raw_rows(&sample_data::orders_v2()), &opts).unwrap();

    assert_eq!(ledger.resolve_event("HEAD").unwrap().id, v2.change_event_id);
    assert_eq!(ledger.resolve_event("HEAD~1").unwrap().id, v1.change_event_id);
    assert!(matches!(
        ledger.resolve_event("HEAD~2"),
        Err(TabledgerError::ImageNotFound { .. })
    ));

    let image = ledger.image("HEAD~1").unwrap();
    assert_eq!(image.change_event_id, v1.change_event_id);
    assert_eq!(ledger.image(&image.id).unwrap(), image);
}

#[test]
fn test_unimaged_events_are_skipped_by_head_offsets() {
    let mut ledger = memory_ledger();
    let opts = RunOptions::default();
    let v1 = ledger.run("sales_orders", raw_rows(&sample_data::orders_v1()), &opts).unwrap();
    ledger
        .run("sales_orders", raw_rows(&sample_data::orders_v2()), &opts.clone().without_image())
        .unwrap();

    assert_eq!(ledger.resolve_event("HEAD").unwrap().id, v1.change_event_id);
    assert_eq!(chain(&ledger).len(), 1);
}

#[test]
fn test_date_references() {
    let mut ledger = memory_ledger();
    let opts = RunOptions::default();
    ledger.run("sales_orders", raw_rows(&sample_data::orders_v1()), &opts).unwrap();
    let v2 = ledger.run("sales_orders", raw_rows(&sample_data::orders_v2()), &opts).unwrap();

    assert_eq!(ledger.resolve_event("@2999-01-01").unwrap().id, v2.change_event_id);
    assert!(matches!(
        ledger.resolve_event("@2000-01-01"),
        Err(TabledgerError::EventNotFound { .. })
    ));
}

#[test]
fn test_rollback_event_is_imaged_on_top() {
    let mut ledger = memory_ledger();
    let opts = RunOptions::default();
    let v1 = ledger.run("sales_orders", raw_rows(&sample_data::orders_v1()), &opts).unwrap();
    let v2 = ledger.run("sales_orders", raw_rows(&sample_data::orders_v2()), &opts).unwrap();
    let undo = ledger.rollback_event(&v2.change_event_id, &opts).unwrap();

    let images = chain(&ledger);
    assert_eq!(images.len(), 3);
    assert_eq!(images[0].change_event_id, undo.change_event_id);

    // Same rows as after v1, so the digests agree
    let v1_image = ledger.image(&v1.change_event_id).unwrap();
    assert_eq!(images[0].state_digest, v1_image.state_digest);
}

#[test]
fn test_rollback_to_moves_head_back() {
    let mut ledger = memory_ledger();
    let opts = RunOptions::default();
    let v1 = ledger.run("sales_orders", raw_rows(&sample_data::orders_v1()), &opts).unwrap();
    ledger.run("sales_orders", raw_rows(&sample_data::orders_v2()), &opts).unwrap();

    ledger.rollback_to(&v1.change_event_id, &opts).unwrap();
    let images = chain(&ledger);
    assert_eq!(images.len(), 1);
    assert_eq!(images[0].change_event_id, v1.change_event_id);

    // The abandoned image is still addressable
    assert_eq!(ledger.events(None).unwrap().len(), 3);
    assert_eq!(tabledger::state::all_images(ledger.connection()).unwrap().len(), 2);
}

#[test]
fn test_history_can_be_restarted() {
    let mut ledger = memory_ledger();
    let opts = RunOptions::default();
    ledger.run("sales_orders", raw_rows(&sample_data::orders_v1()), &opts).unwrap();
    ledger.run("sales_orders", raw_rows(&sample_data::orders_v2()), &opts).unwrap();

    let mut walk = ledger.history().unwrap();
    let first: Vec<String> = walk.by_ref().map(|image| image.unwrap().id).collect();
    assert!(walk.next().is_none());

    walk.restart();
    let second: Vec<String> = walk.map(|image| image.unwrap().id).collect();
    assert_eq!(first, second);
}

#[test]
fn test_manual_image_of_latest_event() {
    let mut ledger = memory_ledger();
    let opts = RunOptions::default().without_image();
    let v1 = ledger.run("sales_orders", raw_rows(&sample_data::orders_v1()), &opts).unwrap();
    assert!(ledger.head().unwrap().state_image_id.is_none());

    let image = ledger.create_state_image(&v1.change_event_id, None).unwrap();
    assert_eq!(image.change_event_id, v1.change_event_id);
    assert!(image.parent_id.is_none());
    assert!(image.archive_path.is_none());
    assert_eq!(ledger.head().unwrap().state_image_id, Some(image.id.clone()));

    // Imaging again hands back the same image
    let again = ledger.create_state_image(&v1.change_event_id, None).unwrap();
    assert_eq!(again.id, image.id);
}
