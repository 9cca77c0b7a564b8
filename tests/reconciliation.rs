mod common;

use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use common::{broker_order, Harness};
use rust_decimal_macros::dec;
use tally::adapters::{BrokerPosition, RawBrokerOrder, RawBrokerPosition};
use tally::config::ReconciliationConfig;
use tally::coordination::{GracefulShutdown, ShutdownSignal, SymbolQuarantine};
use tally::domain::{OrderStatus, Position};
use tally::ledger::{LedgerStore, SourcePriority, StatusUpdate, ORDER_RECONCILIATION_STREAM};
use tally::services::RunMode;

#[tokio::test]
async fn second_run_over_unchanged_broker_state_finds_nothing_to_fix() {
    let h = Harness::new();
    h.seed_order("open-1", OrderStatus::Submitted, Duration::minutes(10)).await;
    h.seed_order("done-1", OrderStatus::Submitted, Duration::minutes(10)).await;

    let now = Utc::now();
    h.broker
        .upsert_order(broker_order("b-1", Some("open-1"), "AAPL", OrderStatus::Accepted, now - Duration::minutes(9)))
        .await;
    let mut filled = broker_order("b-2", Some("done-1"), "AAPL", OrderStatus::Filled, now - Duration::minutes(8));
    filled.filled_qty = 10;
    filled.filled_avg_price = Some(dec!(187.25));
    filled.filled_at = Some(now - Duration::minutes(8));
    h.broker.upsert_order(filled).await;

    let recon = h.reconciler();
    let first = recon.run(RunMode::Manual).await.unwrap();
    assert_eq!(first.orders_updated, 2);
    assert_eq!(h.status("open-1").await, OrderStatus::Accepted);
    let done = h.order("done-1").await;
    assert_eq!(done.status, OrderStatus::Filled);
    assert_eq!(done.filled_qty, 10);
    assert_eq!(done.broker_order_id.as_deref(), Some("b-2"));

    let second = recon.run(RunMode::Manual).await.unwrap();
    assert_eq!(second.mismatches(), 0);
    assert_eq!(second.orders_in_sync, 1);
}

#[tokio::test]
async fn stale_broker_snapshot_loses_to_newer_webhook_state() {
    let h = Harness::new();
    h.seed_order("w-1", OrderStatus::Submitted, Duration::minutes(10)).await;
    let now = Utc::now();
    let webhook = StatusUpdate::new("w-1", OrderStatus::PartiallyFilled, now, SourcePriority::Webhook)
        .with_fill(4, Some(dec!(10)));
    h.ledger.update_order_status_cas(&webhook).await.unwrap().unwrap();

    h.broker
        .upsert_order(broker_order("b-w", Some("w-1"), "AAPL", OrderStatus::Accepted, now - Duration::seconds(5)))
        .await;

    let report = h.reconciler().run(RunMode::Manual).await.unwrap();
    assert_eq!(report.orders_skipped, 1);
    let order = h.order("w-1").await;
    assert_eq!(order.status, OrderStatus::PartiallyFilled);
    assert_eq!(order.filled_qty, 4);
}

#[tokio::test]
async fn orphan_is_recorded_once_and_its_symbol_quarantined() {
    let h = Harness::new();
    let now = Utc::now();
    let mut foreign = broker_order("ext-1", None, "TSLA", OrderStatus::Accepted, now);
    foreign.limit_price = Some(dec!(250));
    h.broker.upsert_order(foreign).await;

    let recon = h.reconciler();
    let first = recon.run(RunMode::Manual).await.unwrap();
    assert_eq!(first.orphans_detected, 1);
    assert!(h.quarantine.is_quarantined("any-strategy", "TSLA").await.unwrap());
    assert!(!h.quarantine.is_quarantined("any-strategy", "AAPL").await.unwrap());

    let second = recon.run(RunMode::Manual).await.unwrap();
    assert_eq!(second.orphans_detected, 0);

    let orphans = h.ledger.list_orphans(false).await.unwrap();
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].estimated_notional, dec!(2500));
    assert_eq!(orphans[0].strategy_id, "external");
}

#[tokio::test]
async fn terminal_orphan_is_resolved() {
    let h = Harness::new();
    let now = Utc::now();
    h.broker
        .upsert_order(broker_order("ext-2", Some("someone-else"), "NVDA", OrderStatus::Accepted, now))
        .await;
    let recon = h.reconciler();
    recon.run(RunMode::Manual).await.unwrap();

    h.broker
        .set_order_status("ext-2", OrderStatus::Canceled, 0, None, Utc::now())
        .await;
    let report = recon.run(RunMode::Manual).await.unwrap();
    assert_eq!(report.orphans_resolved, 1);
    assert!(h.ledger.list_orphans(false).await.unwrap().is_empty());
    assert_eq!(h.ledger.list_orphans(true).await.unwrap().len(), 1);
}

#[tokio::test]
async fn failed_run_leaves_high_water_mark_untouched() {
    let h = Harness::new();
    let recon = h.reconciler();

    let first = recon.run(RunMode::Manual).await.unwrap();
    let mark = h
        .ledger
        .get_high_water_mark(ORDER_RECONCILIATION_STREAM)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.high_water_mark, Some(mark));
    assert_eq!(mark, first.started_at);

    h.broker.set_reads_unavailable(true);
    assert!(recon.run(RunMode::Manual).await.is_err());
    assert_eq!(
        h.ledger.get_high_water_mark(ORDER_RECONCILIATION_STREAM).await.unwrap(),
        Some(mark)
    );

    // A lagging writer cannot move it backwards
    let stored = h
        .ledger
        .set_high_water_mark(ORDER_RECONCILIATION_STREAM, mark - Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(stored, mark);

    h.broker.set_reads_unavailable(false);
    let third = recon.run(RunMode::Manual).await.unwrap();
    assert_eq!(third.lookback_after, Some(mark - Duration::seconds(60)));
    assert!(third.high_water_mark.unwrap() > mark);
}

#[tokio::test]
async fn unconfirmed_submission_inside_grace_is_deferred() {
    let h = Harness::new();
    h.seed_order("young", OrderStatus::SubmittedUnconfirmed, Duration::minutes(1)).await;
    h.seed_order("old", OrderStatus::SubmittedUnconfirmed, Duration::minutes(30)).await;

    let report = h.reconciler().run(RunMode::Manual).await.unwrap();
    assert_eq!(report.orders_deferred, 1);
    assert_eq!(report.orders_failed, 1);
    assert_eq!(h.status("young").await, OrderStatus::SubmittedUnconfirmed);
    assert_eq!(h.status("old").await, OrderStatus::Failed);
    assert_eq!(h.broker.lookup_count(), 1);
}

#[tokio::test]
async fn lookup_found_at_broker_heals_instead_of_failing() {
    let h = Harness::new();
    h.seed_order("lost", OrderStatus::Submitted, Duration::hours(2)).await;
    let mut old = broker_order("b-lost", Some("lost"), "AAPL", OrderStatus::Filled, Utc::now() - Duration::hours(1));
    old.filled_qty = 10;
    h.broker.upsert_order(old).await;

    // Outside the bounded window on a later run: an earlier mark pushes it out
    h.ledger
        .set_high_water_mark(ORDER_RECONCILIATION_STREAM, Utc::now() - Duration::minutes(5))
        .await
        .unwrap();

    let report = h.reconciler().run(RunMode::Manual).await.unwrap();
    assert_eq!(report.lookups_performed, 1);
    assert_eq!(report.orders_updated, 1);
    assert_eq!(h.status("lost").await, OrderStatus::Filled);
}

#[tokio::test]
async fn individual_lookups_stop_at_the_cap() {
    let h = Harness::new();
    for n in 0..5 {
        h.seed_order(&format!("gone-{n}"), OrderStatus::Submitted, Duration::hours(1)).await;
    }
    let config = ReconciliationConfig {
        max_individual_lookups: 2,
        ..ReconciliationConfig::default()
    };

    let report = h.reconciler_with(config).run(RunMode::Manual).await.unwrap();
    assert_eq!(report.lookups_performed, 2);
    assert_eq!(report.orders_failed, 2);
    assert_eq!(report.orders_deferred, 3);
    assert!(report.lookup_cap_reached);
    assert_eq!(h.broker.lookup_count(), 2);
}

#[tokio::test]
async fn positions_follow_the_broker_and_absent_symbols_go_flat() {
    let h = Harness::new();
    let now = Utc::now();
    let mut stale = Position::flat("GE", now);
    stale.qty = 5;
    stale.avg_entry_price = dec!(150);
    stale.realized_pl = dec!(12.5);
    h.ledger.put_position(stale).await;

    h.broker
        .set_positions(vec![BrokerPosition {
            symbol: "AAPL".into(),
            qty: 10,
            avg_entry_price: dec!(190),
            current_price: Some(dec!(195)),
        }])
        .await;

    let report = h.reconciler().run(RunMode::Manual).await.unwrap();
    assert_eq!(report.positions_synced, 1);
    assert_eq!(report.positions_flattened, 1);

    let ge = h.ledger.get_position("GE").await.unwrap().unwrap();
    assert!(ge.is_flat());
    assert_eq!(ge.realized_pl, dec!(12.5));
    let aapl = h.ledger.get_position("AAPL").await.unwrap().unwrap();
    assert_eq!(aapl.qty, 10);
    assert_eq!(aapl.unrealized_pl(), Some(dec!(50)));
}

#[tokio::test]
async fn startup_gate_opens_only_after_a_successful_run() {
    let h = Harness::new();
    let recon = h.reconciler();

    h.broker.set_reads_unavailable(true);
    assert!(!recon.run_startup().await);
    assert!(!h.gate.is_ready());

    h.broker.set_reads_unavailable(false);
    recon.run(RunMode::Periodic).await.unwrap();
    assert!(h.gate.is_ready());
}

#[tokio::test(start_paused = true)]
async fn periodic_loop_runs_until_shutdown() {
    let h = Harness::new();
    let config = ReconciliationConfig {
        interval_secs: 60,
        ..ReconciliationConfig::default()
    };
    let recon = h.reconciler_with(config);
    let shutdown = GracefulShutdown::with_defaults();
    let handle = tokio::spawn(recon.run_periodic(shutdown.subscribe()));

    assert!(!h.gate.is_ready());
    tokio::time::sleep(StdDuration::from_secs(61)).await;
    assert!(h.gate.is_ready());

    shutdown.request_shutdown(ShutdownSignal::Internal);
    tokio::time::timeout(StdDuration::from_secs(5), handle)
        .await
        .expect("loop did not stop")
        .unwrap();
}

fn raw_position(symbol: Option<&str>, qty: rust_decimal::Decimal) -> RawBrokerPosition {
    RawBrokerPosition {
        symbol: symbol.map(str::to_string),
        qty: Some(qty),
        side: Some("long".into()),
        avg_entry_price: Some(dec!(100)),
        current_price: None,
    }
}

async fn seed_position(h: &Harness, symbol: &str, qty: i64) {
    let mut position = Position::flat(symbol, Utc::now());
    position.qty = qty;
    position.avg_entry_price = dec!(100);
    h.ledger.put_position(position).await;
}

#[tokio::test]
async fn unreadable_broker_position_keeps_the_local_one() {
    let h = Harness::new();
    seed_position(&h, "AMD", 10).await;
    seed_position(&h, "GE", 5).await;
    h.broker
        .push_raw_position(raw_position(Some("AMD"), dec!(10.5)))
        .await;

    let report = h.reconciler().run(RunMode::Manual).await.unwrap();
    assert_eq!(report.positions_unreadable, 1);
    assert_eq!(report.positions_flattened, 1);
    assert!(!report.flatten_skipped);

    assert_eq!(h.ledger.get_position("AMD").await.unwrap().unwrap().qty, 10);
    assert!(h.ledger.get_position("GE").await.unwrap().unwrap().is_flat());
}

#[tokio::test]
async fn position_without_a_symbol_skips_flattening() {
    let h = Harness::new();
    seed_position(&h, "AMD", 10).await;
    seed_position(&h, "GE", 5).await;
    h.broker.push_raw_position(raw_position(None, dec!(3))).await;

    let report = h.reconciler().run(RunMode::Manual).await.unwrap();
    assert!(report.flatten_skipped);
    assert_eq!(report.positions_flattened, 0);
    assert_eq!(h.ledger.get_position("AMD").await.unwrap().unwrap().qty, 10);
    assert_eq!(h.ledger.get_position("GE").await.unwrap().unwrap().qty, 5);
}

fn raw_order(client_order_id: &str, status: &str, qty: rust_decimal::Decimal) -> RawBrokerOrder {
    let at = Utc::now() - Duration::minutes(5);
    RawBrokerOrder {
        id: Some(format!("b-{client_order_id}")),
        client_order_id: Some(client_order_id.to_string()),
        symbol: Some("AAPL".into()),
        side: Some("buy".into()),
        qty: Some(qty),
        filled_qty: Some(dec!(0)),
        status: Some(status.to_string()),
        created_at: Some(at),
        updated_at: Some(at),
        ..RawBrokerOrder::default()
    }
}

#[tokio::test]
async fn unrecognized_broker_status_leaves_the_order_alone() {
    let h = Harness::new();
    h.seed_order("held-1", OrderStatus::Submitted, Duration::minutes(10)).await;
    h.broker.push_raw_order(raw_order("held-1", "held", dec!(10))).await;

    let report = h.reconciler().run(RunMode::Manual).await.unwrap();
    assert_eq!(report.orders_unreconcilable, 1);
    assert_eq!(report.orders_failed, 0);
    assert_eq!(h.status("held-1").await, OrderStatus::Submitted);
}

#[tokio::test]
async fn unreadable_lookup_is_not_taken_as_missing() {
    let h = Harness::new();
    h.seed_order("frac-1", OrderStatus::Submitted, Duration::minutes(10)).await;
    h.broker
        .push_raw_order(raw_order("frac-1", "accepted", dec!(10.5)))
        .await;

    let report = h.reconciler().run(RunMode::Manual).await.unwrap();
    assert_eq!(report.lookups_performed, 1);
    assert_eq!(report.orders_unreconcilable, 1);
    assert_eq!(report.orders_failed, 0);
    let order = h.order("frac-1").await;
    assert_eq!(order.status, OrderStatus::Submitted);
    assert!(order.error_message.is_none());
}

#[tokio::test]
async fn quarantine_survives_in_the_ledger_for_other_processes() {
    let h = Harness::new();
    h.broker
        .upsert_order(broker_order("ext-9", None, "COIN", OrderStatus::Accepted, Utc::now()))
        .await;
    h.reconciler().run(RunMode::Manual).await.unwrap();

    // A fresh view over the same ledger sees the entry
    let entries = h.ledger.list_quarantine().await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].symbol, "COIN");
    assert!(h
        .ledger
        .is_symbol_quarantined("momentum", "COIN")
        .await
        .unwrap());
}
