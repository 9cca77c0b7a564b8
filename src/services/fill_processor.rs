//! Broker execution events (trade updates) applied through the locked
//! transactional path.
//!
//! One event is one transaction: row lock on the order, fill dedupe, symbol
//! lock and position update, fill append, then the CAS status write. Any
//! error drops the transaction and nothing is written.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::domain::{FillRecord, Order, OrderStatus};
use crate::error::Result;
use crate::ledger::{CasOutcome, LedgerStore, SourcePriority, StatusUpdate};
use crate::services::Metrics;

/// One execution of a fill event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionFill {
    /// Broker execution id, unique per fill
    pub fill_id: String,
    pub qty: i64,
    pub price: Decimal,
}

/// A webhook-sourced order event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub client_order_id: String,
    pub broker_order_id: Option<String>,
    pub event_id: Option<String>,
    pub status: OrderStatus,
    /// Broker-attributed event time
    pub timestamp: DateTime<Utc>,
    pub fill: Option<ExecutionFill>,
    /// Cumulative filled quantity reported with the event
    pub filled_qty: Option<i64>,
    pub filled_avg_price: Option<Decimal>,
}

impl ExecutionEvent {
    pub fn status(client_order_id: impl Into<String>, status: OrderStatus, timestamp: DateTime<Utc>) -> Self {
        Self {
            client_order_id: client_order_id.into(),
            broker_order_id: None,
            event_id: None,
            status,
            timestamp,
            fill: None,
            filled_qty: None,
            filled_avg_price: None,
        }
    }

    pub fn with_fill(mut self, fill_id: impl Into<String>, qty: i64, price: Decimal) -> Self {
        self.fill = Some(ExecutionFill {
            fill_id: fill_id.into(),
            qty,
            price,
        });
        self
    }

    pub fn with_cumulative(mut self, filled_qty: i64, filled_avg_price: Option<Decimal>) -> Self {
        self.filled_qty = Some(filled_qty);
        self.filled_avg_price = filled_avg_price;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    Processed {
        status: CasOutcome,
        /// P&L realized by this event's fill, when it carried one
        fill_realized_pl: Option<Decimal>,
    },
    /// Fill id already recorded on the order; nothing written
    DuplicateFill,
    UnknownOrder,
}

pub struct FillProcessor {
    ledger: Arc<dyn LedgerStore>,
    metrics: Arc<Metrics>,
}

impl FillProcessor {
    pub fn new(ledger: Arc<dyn LedgerStore>, metrics: Arc<Metrics>) -> Self {
        Self { ledger, metrics }
    }

    #[instrument(skip(self, event), fields(client_order_id = %event.client_order_id, status = %event.status))]
    pub async fn process(&self, event: &ExecutionEvent) -> Result<ProcessOutcome> {
        let mut tx = self.ledger.begin().await?;

        let Some(order) = tx.get_order_for_update(&event.client_order_id).await? else {
            tx.rollback().await?;
            warn!("execution event for unknown order");
            return Ok(ProcessOutcome::UnknownOrder);
        };

        let mut fill_realized_pl = None;
        if let Some(fill) = &event.fill {
            if order.metadata.has_fill(&fill.fill_id) {
                tx.rollback().await?;
                debug!(fill_id = %fill.fill_id, "fill already recorded");
                self.metrics.inc_fills_duplicate();
                return Ok(ProcessOutcome::DuplicateFill);
            }

            // Symbol lock first, even when no position row exists yet
            let before = tx.get_position_for_update(&order.symbol).await?;
            let realized_before = before.map(|p| p.realized_pl).unwrap_or(Decimal::ZERO);
            let after = tx
                .update_position_on_fill(&order.symbol, fill.qty, fill.price, order.side)
                .await?;
            let realized = after.realized_pl - realized_before;

            tx.append_fill(
                &order.client_order_id,
                &FillRecord {
                    fill_id: fill.fill_id.clone(),
                    qty: fill.qty,
                    price: fill.price,
                    realized_pl: realized,
                    timestamp: event.timestamp,
                },
            )
            .await?;
            fill_realized_pl = Some(realized);
        }

        let update = self.status_update(&order, event);
        let applied = tx.update_order_status_cas(&update).await?;
        tx.commit().await?;

        if fill_realized_pl.is_some() {
            self.metrics.inc_fills_processed();
        }
        let status = CasOutcome::from_store(applied);
        if status.is_applied() {
            info!(realized_pl = ?fill_realized_pl, "execution event applied");
        } else {
            debug!("status update superseded by a newer write");
        }

        Ok(ProcessOutcome::Processed {
            status,
            fill_realized_pl,
        })
    }

    /// Cumulative quantity and average come from the event when present,
    /// otherwise they are derived from the stored order plus this fill
    fn status_update(&self, order: &Order, event: &ExecutionEvent) -> StatusUpdate {
        let mut update = StatusUpdate::new(
            event.client_order_id.clone(),
            event.status,
            event.timestamp,
            SourcePriority::Webhook,
        );

        let cumulative = match (event.filled_qty, &event.fill) {
            (Some(qty), _) => Some((qty, event.filled_avg_price)),
            (None, Some(fill)) => {
                let qty = order.filled_qty + fill.qty;
                let prior_cost = order.filled_avg_price.unwrap_or(Decimal::ZERO)
                    * Decimal::from(order.filled_qty);
                let avg = (qty > 0)
                    .then(|| (prior_cost + fill.price * Decimal::from(fill.qty)) / Decimal::from(qty));
                Some((qty, avg))
            }
            (None, None) => None,
        };
        if let Some((qty, avg)) = cumulative {
            update = update.with_fill(qty, avg);
        }
        if event.status == OrderStatus::Filled {
            update = update.with_filled_at(Some(event.timestamp));
        }
        if let Some(id) = &event.broker_order_id {
            update = update.with_broker_order_id(id.clone());
        }
        if let Some(id) = &event.event_id {
            update = update.with_broker_event_id(id.clone());
        }
        update
    }
}
