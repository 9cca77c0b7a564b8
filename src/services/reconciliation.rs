//! Reconciliation Service.
//!
//! Heals the ledger from the broker's authoritative view:
//!
//! 1. lookback starts at the stored high-water mark minus the overlap
//! 2. open broker orders (unbounded) merged with recent ones (bounded),
//!    later `updated_at` wins per client order id
//! 3. every local non-terminal order is matched and CAS-written with
//!    reconciliation priority, or handled as missing at the broker
//! 4. broker orders unknown to the ledger become orphans and their symbol
//!    is quarantined for every strategy
//! 5. positions are overwritten from the broker snapshot; local symbols the
//!    broker no longer holds are forced flat
//!
//! Broker records we cannot read (unparseable payloads, unranked statuses)
//! are never taken as evidence of absence: the order is left as stored and
//! the position is kept out of the flatten pass.
//! 6. on success the high-water mark advances to the run's start time
//!
//! A failed run leaves the high-water mark alone so the same window is
//! retried next cycle.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use serde::Serialize;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::{BrokerClient, BrokerOrder, OrderLookup, OrderStatusFilter};
use crate::config::ReconciliationConfig;
use crate::coordination::{ShutdownListener, SymbolQuarantine};
use crate::domain::{estimate_notional, Order, OrderStatus, OrphanOrder, QUARANTINE_ALL_STRATEGIES};
use crate::error::Result;
use crate::ledger::{LedgerStore, SourcePriority, StatusUpdate, ORDER_RECONCILIATION_STREAM};
use crate::services::reconciliation_gate::{ReconciliationGate, RunMode};
use crate::services::Metrics;

/// Telemetry for one run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconciliationReport {
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Lower bound of the bounded lookback (`None` on a first run)
    pub lookback_after: Option<DateTime<Utc>>,
    pub high_water_mark: Option<DateTime<Utc>>,
    pub orders_checked: u64,
    /// Local state already matched the broker
    pub orders_in_sync: u64,
    pub orders_updated: u64,
    /// CAS rejected: a newer write already won
    pub orders_skipped: u64,
    /// Failed as missing at the broker
    pub orders_failed: u64,
    /// Missing at the broker but left for a later run
    pub orders_deferred: u64,
    /// Present at the broker but unreadable or in an unranked status
    pub orders_unreconcilable: u64,
    pub lookups_performed: u64,
    pub lookup_cap_reached: bool,
    pub orphans_detected: u64,
    pub orphans_resolved: u64,
    pub positions_synced: u64,
    pub positions_flattened: u64,
    pub positions_unreadable: u64,
    /// Flatten pass skipped because an unreadable position had no symbol
    pub flatten_skipped: bool,
}

impl ReconciliationReport {
    pub fn new(mode: RunMode, started_at: DateTime<Utc>) -> Self {
        Self {
            mode,
            started_at,
            finished_at: None,
            lookback_after: None,
            high_water_mark: None,
            orders_checked: 0,
            orders_in_sync: 0,
            orders_updated: 0,
            orders_skipped: 0,
            orders_failed: 0,
            orders_deferred: 0,
            orders_unreconcilable: 0,
            lookups_performed: 0,
            lookup_cap_reached: false,
            orphans_detected: 0,
            orphans_resolved: 0,
            positions_synced: 0,
            positions_flattened: 0,
            positions_unreadable: 0,
            flatten_skipped: false,
        }
    }

    /// Writes that changed or tried to change order state
    pub fn mismatches(&self) -> u64 {
        self.orders_updated + self.orders_skipped + self.orders_failed
    }
}

/// Why a local order without a broker match is left alone this run
enum MissingDisposition {
    /// Never sent to the broker (parent, dry run, not yet due)
    NotSent,
    /// Unconfirmed submission still inside its grace window
    Grace,
    /// Created inside the lookback window; absence may be an artifact
    Recent,
    /// Confirm with a lookup, then fail
    Candidate,
}

pub struct ReconciliationService {
    ledger: Arc<dyn LedgerStore>,
    broker: Arc<dyn BrokerClient>,
    quarantine: Arc<dyn SymbolQuarantine>,
    gate: Arc<ReconciliationGate>,
    config: ReconciliationConfig,
    metrics: Arc<Metrics>,
}

impl ReconciliationService {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        broker: Arc<dyn BrokerClient>,
        quarantine: Arc<dyn SymbolQuarantine>,
        gate: Arc<ReconciliationGate>,
        config: ReconciliationConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            ledger,
            broker,
            quarantine,
            gate,
            config,
            metrics,
        }
    }

    pub fn gate(&self) -> Arc<ReconciliationGate> {
        Arc::clone(&self.gate)
    }

    /// Run once, waiting for any in-flight run first
    pub async fn run(&self, mode: RunMode) -> Result<ReconciliationReport> {
        let permit = self.gate.begin_run(mode).await;
        let started_at = Utc::now();
        info!(mode = %mode, "reconciliation run started");

        let result = self.run_inner(mode, started_at).await;
        match &result {
            Ok(report) => {
                self.metrics.record_reconciliation(report);
                info!(
                    mode = %mode,
                    checked = report.orders_checked,
                    updated = report.orders_updated,
                    skipped = report.orders_skipped,
                    failed = report.orders_failed,
                    deferred = report.orders_deferred,
                    unreconcilable = report.orders_unreconcilable,
                    orphans = report.orphans_detected,
                    flattened = report.positions_flattened,
                    "reconciliation run succeeded"
                );
            }
            Err(e) => {
                self.metrics.inc_reconciliation_failures();
                error!(mode = %mode, error = %e, "reconciliation run failed; high-water mark not advanced");
            }
        }

        self.gate.end_run(permit, &result).await;
        result
    }

    /// Startup run under a deadline. On timeout the run keeps going in the
    /// background and the gate stays closed until some run succeeds.
    pub async fn run_startup(self: &Arc<Self>) -> bool {
        let this = Arc::clone(self);
        let mut handle = tokio::spawn(async move { this.run(RunMode::Startup).await });

        match tokio::time::timeout(self.config.startup_timeout(), &mut handle).await {
            Ok(Ok(Ok(_))) => true,
            Ok(Ok(Err(_))) => false,
            Ok(Err(join_err)) => {
                error!(error = %join_err, "startup reconciliation task panicked");
                false
            }
            Err(_) => {
                self.gate.mark_startup_timed_out().await;
                false
            }
        }
    }

    /// Periodic loop until shutdown. Failures are logged and the loop goes on.
    pub async fn run_periodic(self: Arc<Self>, mut shutdown: ShutdownListener) {
        let period = self.config.interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("reconciliation loop stopping");
                    break;
                }
                _ = ticker.tick() => {
                    // Errors are already logged and counted by `run`
                    let _ = self.run(RunMode::Periodic).await;
                }
            }
        }
    }

    #[instrument(skip(self), fields(mode = %mode))]
    async fn run_inner(&self, mode: RunMode, started_at: DateTime<Utc>) -> Result<ReconciliationReport> {
        let mut report = ReconciliationReport::new(mode, started_at);

        let previous = self
            .ledger
            .get_high_water_mark(ORDER_RECONCILIATION_STREAM)
            .await?;
        let after = previous.map(|t| t - self.config.overlap());
        report.lookback_after = after;

        let limit = self.config.order_fetch_limit;
        let open = self
            .broker
            .get_orders(OrderStatusFilter::Open, limit, None)
            .await?;
        let recent = self
            .broker
            .get_orders(OrderStatusFilter::All, limit, after)
            .await?;
        if open.len() >= limit || recent.len() >= limit {
            warn!(limit, "broker order listing hit the fetch limit; coverage may be partial");
        }
        let merged = merge_by_client_order_id(&open, &recent);

        self.reconcile_orders(&merged, after, &mut report).await?;
        self.detect_orphans(&open, false, &mut report).await?;
        self.detect_orphans(&recent, true, &mut report).await?;
        self.reconcile_positions(&mut report).await?;

        let stored = self
            .ledger
            .set_high_water_mark(ORDER_RECONCILIATION_STREAM, started_at)
            .await?;
        report.high_water_mark = Some(stored);
        report.finished_at = Some(Utc::now());
        Ok(report)
    }

    async fn reconcile_orders(
        &self,
        merged: &HashMap<String, BrokerOrder>,
        after: Option<DateTime<Utc>>,
        report: &mut ReconciliationReport,
    ) -> Result<()> {
        let local = self.ledger.get_non_terminal_orders(None).await?;
        let now = Utc::now();

        for order in &local {
            report.orders_checked += 1;

            if let Some(broker_order) = merged.get(&order.client_order_id) {
                self.apply_broker_state(order, broker_order, report).await?;
                continue;
            }

            match self.missing_disposition(order, after, now) {
                MissingDisposition::NotSent => {}
                MissingDisposition::Recent => {}
                MissingDisposition::Grace => {
                    debug!(client_order_id = %order.client_order_id, "unconfirmed submission inside grace window");
                    report.orders_deferred += 1;
                }
                MissingDisposition::Candidate => {
                    if report.lookups_performed >= self.config.max_individual_lookups as u64 {
                        if !report.lookup_cap_reached {
                            warn!(
                                cap = self.config.max_individual_lookups,
                                "individual lookup cap reached; remaining orders deferred to next run"
                            );
                            report.lookup_cap_reached = true;
                        }
                        report.orders_deferred += 1;
                        continue;
                    }

                    report.lookups_performed += 1;
                    match self
                        .broker
                        .get_order_by_client_id(&order.client_order_id)
                        .await?
                    {
                        OrderLookup::Found(found) => {
                            self.apply_broker_state(order, &found, report).await?
                        }
                        OrderLookup::Unreadable(reason) => {
                            warn!(
                                client_order_id = %order.client_order_id,
                                reason = %reason,
                                "order present at broker but unreadable; left as stored"
                            );
                            report.orders_unreconcilable += 1;
                        }
                        OrderLookup::NotFound => self.fail_missing(order, report).await?,
                    }
                }
            }
        }
        Ok(())
    }

    fn missing_disposition(
        &self,
        order: &Order,
        after: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> MissingDisposition {
        if order.is_parent() || order.status == OrderStatus::DryRun {
            return MissingDisposition::NotSent;
        }
        if order.scheduled_time.is_some_and(|t| t > now) {
            return MissingDisposition::NotSent;
        }

        // A slice created long ago may only have been sent just now
        let reference = match order.scheduled_time {
            Some(scheduled) => scheduled.max(order.created_at),
            None => order.created_at,
        };

        if order.status == OrderStatus::SubmittedUnconfirmed {
            return if now - reference < self.config.grace() {
                MissingDisposition::Grace
            } else {
                MissingDisposition::Candidate
            };
        }

        match after {
            Some(after) if reference >= after => MissingDisposition::Recent,
            _ => MissingDisposition::Candidate,
        }
    }

    async fn apply_broker_state(
        &self,
        order: &Order,
        broker_order: &BrokerOrder,
        report: &mut ReconciliationReport,
    ) -> Result<()> {
        if broker_order.status == OrderStatus::Unknown {
            warn!(
                client_order_id = %order.client_order_id,
                broker_order_id = %broker_order.id,
                "broker reports an unranked status; order left as stored"
            );
            report.orders_unreconcilable += 1;
            return Ok(());
        }

        if is_in_sync(order, broker_order) {
            report.orders_in_sync += 1;
            return Ok(());
        }

        let mut update = StatusUpdate::new(
            order.client_order_id.clone(),
            broker_order.status,
            broker_order.updated_at,
            SourcePriority::Reconciliation,
        )
        .with_fill(broker_order.filled_qty, broker_order.filled_avg_price)
        .with_filled_at(broker_order.filled_at)
        .with_broker_order_id(broker_order.id.clone());
        if broker_order.status == OrderStatus::Rejected {
            update = update.with_error("rejected at broker");
        }

        match self.ledger.update_order_status_cas(&update).await? {
            Some(_) => {
                info!(
                    client_order_id = %order.client_order_id,
                    from = %order.status,
                    to = %broker_order.status,
                    filled_qty = broker_order.filled_qty,
                    "order healed from broker state"
                );
                report.orders_updated += 1;
            }
            None => {
                debug!(
                    client_order_id = %order.client_order_id,
                    "reconciliation write skipped: newer state already stored"
                );
                report.orders_skipped += 1;
            }
        }
        Ok(())
    }

    /// Uses the order's own creation time so a genuinely later broker
    /// confirmation can still overwrite this
    async fn fail_missing(&self, order: &Order, report: &mut ReconciliationReport) -> Result<()> {
        let update = StatusUpdate::new(
            order.client_order_id.clone(),
            OrderStatus::Failed,
            order.created_at,
            SourcePriority::Reconciliation,
        )
        .with_error("not found at broker during reconciliation");

        match self.ledger.update_order_status_cas(&update).await? {
            Some(_) => {
                warn!(
                    client_order_id = %order.client_order_id,
                    previous_status = %order.status,
                    "order missing at broker marked failed"
                );
                report.orders_failed += 1;
            }
            None => report.orders_skipped += 1,
        }
        Ok(())
    }

    async fn detect_orphans(
        &self,
        broker_orders: &[BrokerOrder],
        resolve_terminal: bool,
        report: &mut ReconciliationReport,
    ) -> Result<()> {
        let ids: Vec<String> = broker_orders
            .iter()
            .filter_map(|o| o.client_order_id.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let known = self.ledger.existing_client_order_ids(&ids).await?;
        let now = Utc::now();

        for broker_order in broker_orders {
            let is_known = broker_order
                .client_order_id
                .as_ref()
                .is_some_and(|id| known.contains(id));
            if is_known {
                continue;
            }

            let orphan = OrphanOrder {
                broker_order_id: broker_order.id.clone(),
                client_order_id: broker_order.client_order_id.clone(),
                symbol: broker_order.symbol.clone(),
                strategy_id: self.config.orphan_strategy_id.clone(),
                side: broker_order.side,
                qty: broker_order.qty,
                estimated_notional: estimate_notional(
                    broker_order.notional,
                    broker_order.qty,
                    broker_order.limit_price,
                    broker_order.filled_avg_price,
                ),
                status: broker_order.status.as_str().to_string(),
                detected_at: now,
                resolved_at: None,
            };

            if self.ledger.upsert_orphan(&orphan).await? {
                warn!(
                    broker_order_id = %orphan.broker_order_id,
                    symbol = %orphan.symbol,
                    notional = %orphan.estimated_notional,
                    "orphan order detected"
                );
                report.orphans_detected += 1;
            }

            if let Err(e) = self
                .quarantine
                .set(QUARANTINE_ALL_STRATEGIES, &orphan.symbol)
                .await
            {
                warn!(symbol = %orphan.symbol, error = %e, "could not quarantine orphan symbol");
            }

            if resolve_terminal
                && broker_order.status.is_terminal()
                && self
                    .ledger
                    .resolve_orphan(&orphan.broker_order_id, &orphan.status, now)
                    .await?
            {
                info!(broker_order_id = %orphan.broker_order_id, status = %orphan.status, "orphan resolved");
                report.orphans_resolved += 1;
            }
        }
        Ok(())
    }

    async fn reconcile_positions(&self, report: &mut ReconciliationReport) -> Result<()> {
        let listing = self.broker.get_all_positions().await?;
        let mut keep = Vec::with_capacity(listing.positions.len() + listing.unreadable_symbols.len());

        for position in &listing.positions {
            self.ledger
                .upsert_position_snapshot(&position.to_snapshot())
                .await?;
            keep.push(position.symbol.clone());
            report.positions_synced += 1;
        }

        // Held at the broker in some form; the local row stays as it is
        for symbol in &listing.unreadable_symbols {
            warn!(symbol = %symbol, "broker position unreadable; local position left unchanged");
            keep.push(symbol.clone());
        }
        report.positions_unreadable = listing.unreadable_count() as u64;

        if listing.unreadable_unnamed > 0 {
            warn!(
                unnamed = listing.unreadable_unnamed,
                "broker returned positions without a symbol; flatten pass skipped"
            );
            report.flatten_skipped = true;
            return Ok(());
        }

        let flattened = self.ledger.flatten_positions_not_in(&keep).await?;
        for symbol in &flattened {
            warn!(symbol = %symbol, "local position absent at broker forced flat");
        }
        report.positions_flattened = flattened.len() as u64;
        Ok(())
    }
}

/// One entry per client order id, preferring the later broker `updated_at`.
/// Orders without a client id cannot match a ledger row and are left to
/// orphan detection.
pub fn merge_by_client_order_id(
    open: &[BrokerOrder],
    recent: &[BrokerOrder],
) -> HashMap<String, BrokerOrder> {
    let mut merged: HashMap<String, BrokerOrder> = HashMap::new();
    for order in open.iter().chain(recent) {
        let Some(id) = order.client_order_id.clone() else {
            continue;
        };
        match merged.get(&id) {
            Some(existing) if existing.updated_at >= order.updated_at => {}
            _ => {
                merged.insert(id, order.clone());
            }
        }
    }
    merged
}

/// Local row already reflects this broker state
fn is_in_sync(order: &Order, broker_order: &BrokerOrder) -> bool {
    order.status == broker_order.status
        && order.filled_qty == broker_order.filled_qty
        && order
            .last_updated_at
            .is_some_and(|ts| ts >= broker_order.updated_at.trunc_subsecs(6))
}
