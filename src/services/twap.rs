//! TWAP planning and the parent/child submission facade.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::{NewOrder, Order, OrderSide, OrderStatus, OrderType, TimeInForce};
use crate::error::{Result, TallyError};
use crate::ledger::{LedgerStore, LedgerTx};
use crate::services::SliceScheduler;

/// One planned child slice
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedSlice {
    pub slice_num: i32,
    pub client_order_id: String,
    pub qty: i64,
    pub scheduled_time: DateTime<Utc>,
}

/// Pure TWAP slicing
pub struct TwapSlicer;

impl TwapSlicer {
    /// First 24 hex chars of SHA-256("{parent}:{slice_num}")
    pub fn slice_client_order_id(parent_order_id: &str, slice_num: i32) -> String {
        let digest = Sha256::digest(format!("{}:{}", parent_order_id, slice_num).as_bytes());
        digest
            .iter()
            .take(12)
            .map(|b| format!("{:02x}", b))
            .collect()
    }

    /// Split `total_qty` into `num_slices` whole-share slices spaced
    /// `interval` apart from `start`. The remainder goes one share each to
    /// the earliest slices.
    pub fn plan(
        parent_order_id: &str,
        total_qty: i64,
        num_slices: i32,
        interval: Duration,
        start: DateTime<Utc>,
    ) -> Result<Vec<PlannedSlice>> {
        if num_slices <= 0 {
            return Err(TallyError::Validation(
                "num_slices must be at least 1".to_string(),
            ));
        }
        if total_qty < i64::from(num_slices) {
            return Err(TallyError::Validation(format!(
                "total_qty {} cannot fill {} slices of at least one share",
                total_qty, num_slices
            )));
        }
        if interval < Duration::zero() {
            return Err(TallyError::Validation(
                "slice interval must not be negative".to_string(),
            ));
        }

        let base = total_qty / i64::from(num_slices);
        let remainder = total_qty % i64::from(num_slices);

        Ok((0..num_slices)
            .map(|n| PlannedSlice {
                slice_num: n,
                client_order_id: Self::slice_client_order_id(parent_order_id, n),
                qty: base + if i64::from(n) < remainder { 1 } else { 0 },
                scheduled_time: start + interval * n,
            })
            .collect())
    }
}

/// A TWAP parent order request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwapRequest {
    /// Generated when absent
    pub parent_order_id: Option<String>,
    pub strategy_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub total_qty: i64,
    pub num_slices: i32,
    pub interval_secs: i64,
    /// Defaults to now
    pub start_at: Option<DateTime<Utc>>,
    pub order_type: OrderType,
    pub limit_price: Option<Decimal>,
    pub time_in_force: TimeInForce,
}

impl TwapRequest {
    pub fn market(symbol: impl Into<String>, side: OrderSide, total_qty: i64, num_slices: i32) -> Self {
        Self {
            parent_order_id: None,
            strategy_id: "manual".to_string(),
            symbol: symbol.into(),
            side,
            total_qty,
            num_slices,
            interval_secs: 60,
            start_at: None,
            order_type: OrderType::Market,
            limit_price: None,
            time_in_force: TimeInForce::Day,
        }
    }

    fn order_template(&self, client_order_id: String, qty: i64) -> NewOrder {
        NewOrder {
            client_order_id,
            strategy_id: self.strategy_id.clone(),
            symbol: self.symbol.clone(),
            side: self.side,
            qty,
            order_type: self.order_type,
            limit_price: self.limit_price,
            stop_price: None,
            time_in_force: self.time_in_force,
            status: OrderStatus::PendingNew,
        }
    }
}

/// Result of a TWAP submission
#[derive(Debug, Clone)]
pub struct TwapSubmission {
    pub parent: Order,
    pub slices: Vec<Order>,
    pub job_ids: Vec<String>,
}

/// Creates the parent and its slices in the ledger, then schedules them
pub struct TwapService {
    ledger: Arc<dyn LedgerStore>,
    scheduler: SliceScheduler,
}

impl TwapService {
    pub fn new(ledger: Arc<dyn LedgerStore>, scheduler: SliceScheduler) -> Self {
        Self { ledger, scheduler }
    }

    pub async fn submit(&self, request: TwapRequest) -> Result<TwapSubmission> {
        let parent_id = request
            .parent_order_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let start = request.start_at.unwrap_or_else(Utc::now);
        let plan = TwapSlicer::plan(
            &parent_id,
            request.total_qty,
            request.num_slices,
            Duration::seconds(request.interval_secs),
            start,
        )?;

        let parent_new = request.order_template(parent_id.clone(), request.total_qty);
        parent_new.validate().map_err(TallyError::Validation)?;

        // Parent and children land together or not at all; nothing is
        // scheduled until they are committed
        let mut tx = self.ledger.begin().await?;
        let (parent, slices) =
            match Self::create_rows(tx.as_mut(), &request, &parent_new, &plan).await {
                Ok(rows) => rows,
                Err(e) => {
                    if let Err(rb) = tx.rollback().await {
                        warn!(parent_order_id = %parent_id, error = %rb, "TWAP rollback failed");
                    }
                    return Err(e);
                }
            };
        tx.commit().await?;

        let job_ids = self.scheduler.schedule_slices(&parent_id, &plan);
        info!(
            parent_order_id = %parent_id,
            symbol = %request.symbol,
            total_qty = request.total_qty,
            num_slices = request.num_slices,
            "TWAP parent created and scheduled"
        );

        Ok(TwapSubmission {
            parent,
            slices,
            job_ids,
        })
    }

    async fn create_rows(
        tx: &mut dyn LedgerTx,
        request: &TwapRequest,
        parent_new: &NewOrder,
        plan: &[PlannedSlice],
    ) -> Result<(Order, Vec<Order>)> {
        let parent = tx.create_parent_order(parent_new, request.num_slices).await?;
        let mut slices = Vec::with_capacity(plan.len());
        for planned in plan {
            let child = request.order_template(planned.client_order_id.clone(), planned.qty);
            let order = tx
                .create_child_slice(
                    &child,
                    &parent.client_order_id,
                    planned.slice_num,
                    Some(planned.scheduled_time),
                )
                .await?;
            slices.push(order);
        }
        Ok((parent, slices))
    }

    /// Cancel remaining slices, then the parent itself.
    /// Returns (scheduler removals, ledger updates).
    pub async fn cancel(&self, parent_order_id: &str) -> Result<(usize, u64)> {
        let counts = self.scheduler.cancel_remaining_slices(parent_order_id).await?;
        if self
            .ledger
            .update_order_status(
                parent_order_id,
                OrderStatus::Canceled,
                Some("canceled by request"),
            )
            .await?
            .is_none()
        {
            warn!(parent_order_id, "parent order missing or already terminal");
        }
        Ok(counts)
    }
}
