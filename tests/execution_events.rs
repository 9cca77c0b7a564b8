mod common;

use std::sync::Arc;

use chrono::Duration;
use common::{ts, Harness};
use rust_decimal_macros::dec;
use tally::domain::OrderStatus;
use tally::ledger::LedgerStore;
use tally::services::{ExecutionEvent, FillProcessor, ProcessOutcome};

fn processor(h: &Harness) -> FillProcessor {
    FillProcessor::new(h.store(), Arc::clone(&h.metrics))
}

#[tokio::test]
async fn redelivered_fill_is_applied_once() {
    let h = Harness::new();
    h.seed_order("A", OrderStatus::Submitted, Duration::minutes(1)).await;
    let p = processor(&h);

    let event = ExecutionEvent::status("A", OrderStatus::PartiallyFilled, ts(1))
        .with_fill("exec-1", 4, dec!(100));
    assert!(matches!(p.process(&event).await.unwrap(), ProcessOutcome::Processed { .. }));
    assert_eq!(p.process(&event).await.unwrap(), ProcessOutcome::DuplicateFill);

    let position = h.ledger.get_position("AAPL").await.unwrap().unwrap();
    assert_eq!(position.qty, 4);
    let order = h.order("A").await;
    assert_eq!(order.filled_qty, 4);
    assert_eq!(order.metadata.fills.len(), 1);
}

#[tokio::test]
async fn fills_accumulate_and_close_with_realized_pl() {
    let h = Harness::new();
    h.seed_order("A", OrderStatus::Submitted, Duration::minutes(1)).await;
    let p = processor(&h);

    p.process(
        &ExecutionEvent::status("A", OrderStatus::PartiallyFilled, ts(1)).with_fill("e1", 4, dec!(100)),
    )
    .await
    .unwrap();
    p.process(&ExecutionEvent::status("A", OrderStatus::Filled, ts(2)).with_fill("e2", 6, dec!(105)))
        .await
        .unwrap();

    let order = h.order("A").await;
    assert_eq!(order.status, OrderStatus::Filled);
    assert_eq!(order.filled_qty, 10);
    assert_eq!(order.filled_avg_price, Some(dec!(103)));
    assert_eq!(order.filled_at, Some(ts(2)));
    let position = h.ledger.get_position("AAPL").await.unwrap().unwrap();
    assert_eq!(position.qty, 10);
    assert_eq!(position.avg_entry_price, dec!(103));
}

#[tokio::test]
async fn store_failure_mid_event_writes_nothing() {
    let h = Harness::new();
    h.seed_order("A", OrderStatus::Submitted, Duration::minutes(1)).await;
    let p = processor(&h);
    h.ledger.fail_operation("commit", 1);

    let event = ExecutionEvent::status("A", OrderStatus::PartiallyFilled, ts(1))
        .with_fill("exec-9", 3, dec!(50));
    assert!(p.process(&event).await.is_err());
    assert!(h.ledger.get_position("AAPL").await.unwrap().is_none());
    assert_eq!(h.order("A").await.filled_qty, 0);

    // Redelivery after the outage is applied normally
    assert!(matches!(p.process(&event).await.unwrap(), ProcessOutcome::Processed { .. }));
    assert_eq!(h.order("A").await.filled_qty, 3);
}

#[tokio::test]
async fn event_for_unknown_order_is_reported() {
    let h = Harness::new();
    let p = processor(&h);
    let event = ExecutionEvent::status("nope", OrderStatus::Filled, ts(1)).with_fill("x", 1, dec!(1));
    assert_eq!(p.process(&event).await.unwrap(), ProcessOutcome::UnknownOrder);
}
