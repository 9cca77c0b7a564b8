mod common;

use std::sync::atomic::Ordering;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use common::Harness;
use tally::coordination::SymbolQuarantine;
use tally::domain::{OrderSide, OrderStatus, QUARANTINE_ALL_STRATEGIES};
use tally::ledger::LedgerStore;
use tally::services::{RunMode, SliceOutcome, TwapRequest, TwapService};

fn request(qty: i64, slices: i32, interval_secs: i64, start_in: Duration) -> TwapRequest {
    let mut req = TwapRequest::market("MSFT", OrderSide::Buy, qty, slices);
    req.parent_order_id = Some("parent-1".to_string());
    req.interval_secs = interval_secs;
    req.start_at = Some(Utc::now() + start_in);
    req
}

#[tokio::test(start_paused = true)]
async fn kill_switch_engaged_before_fire_blocks_the_slice() {
    let h = Harness::new();
    let scheduler = h.ready_scheduler().await;
    let twap = TwapService::new(h.store(), scheduler.clone());

    let submission = twap
        .submit(request(10, 1, 60, Duration::seconds(1)))
        .await
        .unwrap();
    let slice_id = submission.slices[0].client_order_id.clone();

    tokio::time::sleep(StdDuration::from_millis(500)).await;
    assert_eq!(h.status(&slice_id).await, OrderStatus::PendingNew);
    h.kill_switch.engage("halt before open").await;

    tokio::time::sleep(StdDuration::from_secs(2)).await;
    assert_eq!(h.status(&slice_id).await, OrderStatus::BlockedKillSwitch);
    assert!(h.broker.submissions().await.is_empty());
    assert!(scheduler.jobs().is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancel_stops_every_slice_that_has_not_fired() {
    let h = Harness::new();
    let scheduler = h.ready_scheduler().await;
    let twap = TwapService::new(h.store(), scheduler.clone());

    let submission = twap
        .submit(request(30, 3, 60, Duration::seconds(1)))
        .await
        .unwrap();
    assert_eq!(submission.job_ids.len(), 3);

    // First slice fires, the other two are still pending
    tokio::time::sleep(StdDuration::from_secs(30)).await;
    assert_eq!(h.broker.accepted_count().await, 1);

    let (jobs_removed, rows_canceled) = twap.cancel("parent-1").await.unwrap();
    assert_eq!(jobs_removed, 2);
    assert_eq!(rows_canceled, 2);

    tokio::time::sleep(StdDuration::from_secs(600)).await;
    assert_eq!(h.broker.accepted_count().await, 1);
    assert!(scheduler.jobs().is_empty());

    let slices = h.ledger.get_slices_by_parent("parent-1").await.unwrap();
    let statuses: Vec<OrderStatus> = slices.iter().map(|s| s.status).collect();
    assert_eq!(
        statuses,
        vec![OrderStatus::Submitted, OrderStatus::Canceled, OrderStatus::Canceled]
    );
    assert_eq!(h.status("parent-1").await, OrderStatus::Canceled);
}

#[tokio::test(start_paused = true)]
async fn slice_already_fired_when_cancel_lands_is_not_resubmitted() {
    let h = Harness::new();
    let scheduler = h.ready_scheduler().await;
    let twap = TwapService::new(h.store(), scheduler.clone());
    let submission = twap
        .submit(request(20, 2, 60, Duration::seconds(1)))
        .await
        .unwrap();
    let second = submission.slices[1].client_order_id.clone();

    // The job for the second slice has been claimed, but its row is
    // canceled before the guard reads it
    scheduler.cancel_remaining_slices("parent-1").await.unwrap();
    let outcome = scheduler.run_slice(&second).await;
    assert_eq!(outcome, SliceOutcome::AbortedCanceled);
    assert!(h.broker.submissions().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn twap_runs_to_completion_with_remainder_on_early_slices() {
    let h = Harness::new();
    let scheduler = h.ready_scheduler().await;
    let twap = TwapService::new(h.store(), scheduler.clone());

    let submission = twap
        .submit(request(42, 4, 30, Duration::zero()))
        .await
        .unwrap();
    let qtys: Vec<i64> = submission.slices.iter().map(|s| s.qty).collect();
    assert_eq!(qtys, vec![11, 11, 10, 10]);

    tokio::time::sleep(StdDuration::from_secs(300)).await;

    let submitted = h.broker.submissions().await;
    assert_eq!(submitted.len(), 4);
    assert_eq!(submitted.iter().map(|s| s.order.qty).sum::<i64>(), 42);
    for slice in h.ledger.get_slices_by_parent("parent-1").await.unwrap() {
        assert_eq!(slice.status, OrderStatus::Submitted);
        assert!(slice.broker_order_id.is_some());
    }
    assert_eq!(h.metrics.slices_submitted.load(Ordering::Relaxed), 4);
}

#[tokio::test(start_paused = true)]
async fn rescheduling_the_same_parent_does_not_double_submit() {
    let h = Harness::new();
    let scheduler = h.ready_scheduler().await;
    let twap = TwapService::new(h.store(), scheduler.clone());
    let submission = twap
        .submit(request(10, 2, 60, Duration::seconds(5)))
        .await
        .unwrap();

    let planned = tally::services::TwapSlicer::plan(
        "parent-1",
        10,
        2,
        Duration::seconds(60),
        submission.slices[0].scheduled_time.unwrap(),
    )
    .unwrap();
    let again = scheduler.schedule_slices("parent-1", &planned);
    assert_eq!(again, submission.job_ids);
    assert_eq!(scheduler.jobs().len(), 2);

    tokio::time::sleep(StdDuration::from_secs(300)).await;
    assert_eq!(h.broker.submissions().await.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn quarantined_symbol_blocks_its_slices() {
    let h = Harness::new();
    let scheduler = h.ready_scheduler().await;
    let twap = TwapService::new(h.store(), scheduler.clone());
    h.quarantine
        .set(QUARANTINE_ALL_STRATEGIES, "MSFT")
        .await
        .unwrap();

    twap.submit(request(20, 2, 60, Duration::seconds(1)))
        .await
        .unwrap();
    tokio::time::sleep(StdDuration::from_secs(300)).await;

    assert!(h.broker.submissions().await.is_empty());
    for slice in h.ledger.get_slices_by_parent("parent-1").await.unwrap() {
        assert_eq!(slice.status, OrderStatus::Rejected);
        assert!(slice.error_message.unwrap().contains("quarantined"));
    }
}

#[tokio::test(start_paused = true)]
async fn due_slices_wait_for_the_first_successful_reconciliation() {
    let h = Harness::new();
    let scheduler = h.scheduler();
    let twap = TwapService::new(h.store(), scheduler.clone());
    let submission = twap
        .submit(request(10, 1, 60, Duration::seconds(1)))
        .await
        .unwrap();
    let slice_id = submission.slices[0].client_order_id.clone();

    tokio::time::sleep(StdDuration::from_secs(5)).await;
    assert!(h.broker.submissions().await.is_empty());
    assert_eq!(h.status(&slice_id).await, OrderStatus::PendingNew);

    h.reconciler().run(RunMode::Startup).await.unwrap();
    tokio::time::sleep(StdDuration::from_secs(1)).await;
    assert_eq!(h.broker.accepted_count().await, 1);
    assert_eq!(h.status(&slice_id).await, OrderStatus::Submitted);
}

#[tokio::test(start_paused = true)]
async fn slices_fail_when_reconciliation_never_succeeds() {
    let h = Harness::new();
    h.broker.set_reads_unavailable(true);
    assert!(h.reconciler().run(RunMode::Startup).await.is_err());

    let scheduler = h.scheduler();
    let twap = TwapService::new(h.store(), scheduler.clone());
    twap.submit(request(20, 2, 60, Duration::seconds(1)))
        .await
        .unwrap();
    tokio::time::sleep(StdDuration::from_secs(600)).await;

    assert!(h.broker.submissions().await.is_empty());
    for slice in h.ledger.get_slices_by_parent("parent-1").await.unwrap() {
        assert_eq!(slice.status, OrderStatus::Failed);
        assert!(slice.error_message.unwrap().contains("not ready"));
    }
}

#[tokio::test(start_paused = true)]
async fn twap_rows_are_all_or_nothing() {
    let h = Harness::new();
    let scheduler = h.ready_scheduler().await;
    let twap = TwapService::new(h.store(), scheduler.clone());

    h.ledger.fail_operation("create_child_slice", 1);
    assert!(twap
        .submit(request(30, 3, 60, Duration::seconds(1)))
        .await
        .is_err());
    assert!(h.ledger.get_order("parent-1").await.unwrap().is_none());
    assert!(h
        .ledger
        .get_slices_by_parent("parent-1")
        .await
        .unwrap()
        .is_empty());
    assert!(scheduler.jobs().is_empty());

    // Nothing left behind to conflict with a retry
    let submission = twap
        .submit(request(30, 3, 60, Duration::seconds(1)))
        .await
        .unwrap();
    assert_eq!(submission.slices.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn concurrent_cancel_and_fire_agree_on_the_slice() {
    let h = Harness::new();
    let scheduler = h.ready_scheduler().await;
    let twap = TwapService::new(h.store(), scheduler.clone());
    let submission = twap
        .submit(request(10, 1, 60, Duration::seconds(3600)))
        .await
        .unwrap();
    let slice_id = submission.slices[0].client_order_id.clone();

    let (outcome, canceled) = tokio::join!(
        scheduler.run_slice(&slice_id),
        scheduler.cancel_remaining_slices("parent-1"),
    );
    let (_, rows_canceled) = canceled.unwrap();
    let status = h.status(&slice_id).await;

    if rows_canceled == 1 {
        // Cancel won the row; the slice either never reached the broker or
        // was flagged for manual intervention
        assert_eq!(status, OrderStatus::Canceled);
        match outcome {
            SliceOutcome::AbortedCanceled => {
                assert!(h.broker.submissions().await.is_empty())
            }
            SliceOutcome::AcceptedUnrecorded { .. } => {
                assert_eq!(h.broker.accepted_count().await, 1)
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    } else {
        assert!(matches!(outcome, SliceOutcome::Submitted { .. }));
        assert_eq!(status, OrderStatus::Submitted);
        assert_eq!(h.broker.accepted_count().await, 1);
    }
}
