mod common;

use chrono::Duration;
use common::{ts, Harness};
use rust_decimal_macros::dec;
use tally::domain::OrderStatus;
use tally::ledger::{LedgerStore, SourcePriority, StatusUpdate};

fn update(id: &str, status: OrderStatus, secs: i64, source: SourcePriority) -> StatusUpdate {
    StatusUpdate::new(id, status, ts(secs), source)
}

#[tokio::test]
async fn stale_event_never_overwrites_newer_state() {
    let h = Harness::new();
    h.seed_order("A", OrderStatus::Submitted, Duration::minutes(5)).await;

    let filled = update("A", OrderStatus::Filled, 20, SourcePriority::Webhook).with_fill(10, Some(dec!(101)));
    assert!(h.ledger.update_order_status_cas(&filled).await.unwrap().is_some());

    // Delayed earlier event arrives last
    let accepted = update("A", OrderStatus::Accepted, 10, SourcePriority::Webhook);
    assert!(h.ledger.update_order_status_cas(&accepted).await.unwrap().is_none());

    let order = h.order("A").await;
    assert_eq!(order.status, OrderStatus::Filled);
    assert_eq!(order.filled_qty, 10);
    assert_eq!(order.last_updated_at, Some(ts(20)));
}

#[tokio::test]
async fn terminal_rows_reject_everything_except_filled() {
    let h = Harness::new();
    h.seed_order("C", OrderStatus::Submitted, Duration::minutes(5)).await;
    let canceled = update("C", OrderStatus::Canceled, 10, SourcePriority::Webhook);
    assert!(h.ledger.update_order_status_cas(&canceled).await.unwrap().is_some());

    // Even a later, higher-ranked event cannot reopen a canceled row
    let late_fill = update("C", OrderStatus::Filled, 30, SourcePriority::Manual).with_fill(10, None);
    assert!(h.ledger.update_order_status_cas(&late_fill).await.unwrap().is_none());
    assert_eq!(h.status("C").await, OrderStatus::Canceled);

    // A filled row still takes a newer correction
    h.seed_order("F", OrderStatus::Submitted, Duration::minutes(5)).await;
    let fill = update("F", OrderStatus::Filled, 10, SourcePriority::Webhook).with_fill(8, Some(dec!(100)));
    h.ledger.update_order_status_cas(&fill).await.unwrap().unwrap();
    let corrected = update("F", OrderStatus::Filled, 11, SourcePriority::Reconciliation)
        .with_fill(10, Some(dec!(100.5)));
    let order = h.ledger.update_order_status_cas(&corrected).await.unwrap().unwrap();
    assert_eq!(order.filled_qty, 10);
    assert_eq!(order.filled_avg_price, Some(dec!(100.5)));
}

#[tokio::test]
async fn equal_timestamps_break_ties_by_rank_then_fill_then_source() {
    let h = Harness::new();
    h.seed_order("T", OrderStatus::Submitted, Duration::minutes(5)).await;

    let partial = update("T", OrderStatus::PartiallyFilled, 10, SourcePriority::Webhook).with_fill(4, None);
    h.ledger.update_order_status_cas(&partial).await.unwrap().unwrap();

    // Same ts, lower rank loses
    let accepted = update("T", OrderStatus::Accepted, 10, SourcePriority::Manual);
    assert!(h.ledger.update_order_status_cas(&accepted).await.unwrap().is_none());

    // Same ts and rank, more filled wins
    let more = update("T", OrderStatus::PartiallyFilled, 10, SourcePriority::Webhook).with_fill(6, None);
    assert!(h.ledger.update_order_status_cas(&more).await.unwrap().is_some());

    // Same ts, rank and fill: only a more authoritative source wins
    let same_webhook = update("T", OrderStatus::PartiallyFilled, 10, SourcePriority::Webhook).with_fill(6, None);
    assert!(h.ledger.update_order_status_cas(&same_webhook).await.unwrap().is_none());
    let recon = update("T", OrderStatus::PartiallyFilled, 10, SourcePriority::Reconciliation).with_fill(6, None);
    let order = h.ledger.update_order_status_cas(&recon).await.unwrap().unwrap();
    assert_eq!(order.source_priority, Some(SourcePriority::Reconciliation.value()));

    // Same ts, higher rank wins regardless of source
    let filled = update("T", OrderStatus::Filled, 10, SourcePriority::Webhook).with_fill(10, None);
    assert!(h.ledger.update_order_status_cas(&filled).await.unwrap().is_some());
    assert_eq!(h.status("T").await, OrderStatus::Filled);
}

#[tokio::test]
async fn sub_microsecond_differences_compare_as_equal() {
    let h = Harness::new();
    h.seed_order("U", OrderStatus::Submitted, Duration::minutes(5)).await;
    let base = ts(10);
    let first = StatusUpdate::new("U", OrderStatus::Accepted, base, SourcePriority::Webhook);
    h.ledger.update_order_status_cas(&first).await.unwrap().unwrap();

    // 500ns later truncates to the stored microsecond: a tie, same source loses
    let nanos_later = StatusUpdate::new(
        "U",
        OrderStatus::Accepted,
        base + Duration::nanoseconds(500),
        SourcePriority::Webhook,
    );
    assert!(h.ledger.update_order_status_cas(&nanos_later).await.unwrap().is_none());
}

#[tokio::test]
async fn concurrent_writers_converge_on_the_causally_newest() {
    let h = Harness::new();
    h.seed_order("R", OrderStatus::Submitted, Duration::minutes(5)).await;

    let mut tasks = Vec::new();
    for secs in [3_i64, 9, 1, 7, 5] {
        let ledger = h.ledger.clone();
        tasks.push(tokio::spawn(async move {
            let u = StatusUpdate::new("R", OrderStatus::Accepted, ts(secs), SourcePriority::Webhook);
            ledger.update_order_status_cas(&u).await.unwrap();
        }));
    }
    for t in tasks {
        t.await.unwrap();
    }
    assert_eq!(h.order("R").await.last_updated_at, Some(ts(9)));
}

#[tokio::test]
async fn missing_row_is_a_skip_not_an_error() {
    let h = Harness::new();
    let u = update("ghost", OrderStatus::Filled, 1, SourcePriority::Webhook);
    assert!(h.ledger.update_order_status_cas(&u).await.unwrap().is_none());
}
