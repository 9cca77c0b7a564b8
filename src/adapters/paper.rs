//! In-memory broker for simulation and tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use super::broker::{
    parse_orders, parse_positions, BrokerAck, BrokerClient, BrokerOrder, BrokerPosition,
    BrokerResult, OrderLookup, OrderStatusFilter, PositionListing, RawBrokerOrder,
    RawBrokerPosition, SubmitOrder,
};
use crate::domain::OrderStatus;
use crate::error::BrokerError;

/// One accepted or attempted submission, in call order
#[derive(Debug, Clone, PartialEq)]
pub struct PaperSubmission {
    pub client_order_id: String,
    pub order: SubmitOrder,
    pub accepted: bool,
}

#[derive(Default)]
pub struct PaperBroker {
    orders: Mutex<Vec<BrokerOrder>>,
    positions: Mutex<Vec<BrokerPosition>>,
    /// Wire records served through the real parser
    raw_orders: Mutex<Vec<RawBrokerOrder>>,
    raw_positions: Mutex<Vec<RawBrokerPosition>>,
    submit_failures: Mutex<VecDeque<BrokerError>>,
    submissions: Mutex<Vec<PaperSubmission>>,
    reads_unavailable: AtomicBool,
    lookups: AtomicUsize,
}

impl PaperBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an order by broker id
    pub async fn upsert_order(&self, order: BrokerOrder) {
        let mut orders = self.orders.lock().await;
        match orders.iter_mut().find(|o| o.id == order.id) {
            Some(existing) => *existing = order,
            None => orders.push(order),
        }
    }

    /// Move an order to a new status, as if the exchange reported progress
    pub async fn set_order_status(
        &self,
        broker_order_id: &str,
        status: OrderStatus,
        filled_qty: i64,
        filled_avg_price: Option<rust_decimal::Decimal>,
        at: DateTime<Utc>,
    ) -> bool {
        let mut orders = self.orders.lock().await;
        let Some(order) = orders.iter_mut().find(|o| o.id == broker_order_id) else {
            return false;
        };
        order.status = status;
        order.filled_qty = filled_qty;
        order.filled_avg_price = filled_avg_price;
        order.updated_at = at;
        if status == OrderStatus::Filled {
            order.filled_at.get_or_insert(at);
        }
        true
    }

    pub async fn set_positions(&self, positions: Vec<BrokerPosition>) {
        *self.positions.lock().await = positions;
    }

    /// Serve a wire-level order record as-is, parsed on every read
    pub async fn push_raw_order(&self, raw: RawBrokerOrder) {
        self.raw_orders.lock().await.push(raw);
    }

    /// Serve a wire-level position record as-is, parsed on every read
    pub async fn push_raw_position(&self, raw: RawBrokerPosition) {
        self.raw_positions.lock().await.push(raw);
    }

    /// Queue a failure for the next `submit_order` call
    pub async fn fail_next_submit(&self, error: BrokerError) {
        self.submit_failures.lock().await.push_back(error);
    }

    /// Make every read fail with a connection error until cleared
    pub fn set_reads_unavailable(&self, unavailable: bool) {
        self.reads_unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn submissions(&self) -> Vec<PaperSubmission> {
        self.submissions.lock().await.clone()
    }

    pub async fn accepted_count(&self) -> usize {
        self.submissions
            .lock()
            .await
            .iter()
            .filter(|s| s.accepted)
            .count()
    }

    pub async fn order_by_client_id(&self, client_order_id: &str) -> Option<BrokerOrder> {
        self.orders
            .lock()
            .await
            .iter()
            .find(|o| o.client_order_id.as_deref() == Some(client_order_id))
            .cloned()
    }

    /// Individual by-client-id lookups served so far
    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    fn check_reads(&self) -> BrokerResult<()> {
        if self.reads_unavailable.load(Ordering::SeqCst) {
            return Err(BrokerError::Connection("paper broker unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerClient for PaperBroker {
    async fn get_orders(
        &self,
        status: OrderStatusFilter,
        limit: usize,
        after: Option<DateTime<Utc>>,
    ) -> BrokerResult<Vec<BrokerOrder>> {
        self.check_reads()?;
        let mut orders = self.orders.lock().await.clone();
        orders.extend(parse_orders(self.raw_orders.lock().await.clone()));
        let mut matched: Vec<BrokerOrder> = orders
            .into_iter()
            .filter(|o| match status {
                OrderStatusFilter::Open => !o.status.is_terminal(),
                OrderStatusFilter::All => true,
            })
            .filter(|o| match after {
                Some(after) => o.created_at.unwrap_or(o.updated_at) > after,
                None => true,
            })
            .collect();
        matched.sort_by_key(|o| o.created_at.unwrap_or(o.updated_at));
        matched.truncate(limit);
        Ok(matched)
    }

    async fn get_order_by_client_id(
        &self,
        client_order_id: &str,
    ) -> BrokerResult<OrderLookup> {
        self.check_reads()?;
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if let Some(order) = self.order_by_client_id(client_order_id).await {
            return Ok(OrderLookup::Found(order));
        }
        let raw = self
            .raw_orders
            .lock()
            .await
            .iter()
            .find(|r| r.client_order_id.as_deref() == Some(client_order_id))
            .cloned();
        Ok(raw.map_or(OrderLookup::NotFound, OrderLookup::from_raw))
    }

    async fn get_all_positions(&self) -> BrokerResult<PositionListing> {
        self.check_reads()?;
        let mut listing = parse_positions(self.raw_positions.lock().await.clone());
        listing
            .positions
            .extend(self.positions.lock().await.iter().cloned());
        Ok(listing)
    }

    async fn submit_order(
        &self,
        order: &SubmitOrder,
        client_order_id: &str,
    ) -> BrokerResult<BrokerAck> {
        let queued = self.submit_failures.lock().await.pop_front();
        let outcome = match queued {
            Some(err) => Err(err),
            None if self.order_by_client_id(client_order_id).await.is_some() => Err(
                BrokerError::Validation(format!("client_order_id {client_order_id} must be unique")),
            ),
            None => {
                let now = Utc::now();
                let accepted = BrokerOrder {
                    id: Uuid::new_v4().to_string(),
                    client_order_id: Some(client_order_id.to_string()),
                    symbol: order.symbol.clone(),
                    side: order.side,
                    qty: order.qty,
                    filled_qty: 0,
                    filled_avg_price: None,
                    limit_price: order.limit_price,
                    notional: None,
                    status: OrderStatus::Accepted,
                    created_at: Some(now),
                    updated_at: now,
                    filled_at: None,
                };
                let ack = BrokerAck {
                    broker_order_id: accepted.id.clone(),
                    status: Some(accepted.status),
                };
                self.orders.lock().await.push(accepted);
                info!(client_order_id, broker_order_id = %ack.broker_order_id, "paper order accepted");
                Ok(ack)
            }
        };

        self.submissions.lock().await.push(PaperSubmission {
            client_order_id: client_order_id.to_string(),
            order: order.clone(),
            accepted: outcome.is_ok(),
        });
        outcome
    }
}
