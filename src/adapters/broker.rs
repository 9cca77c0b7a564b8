//! Broker boundary.
//!
//! Wire payloads are parsed strictly into [`BrokerOrder`] and
//! [`BrokerPosition`]. A record missing a required field cannot be
//! reconciled and is never filled in with defaults. A status we cannot rank
//! parses as [`OrderStatus::Unknown`] so the order stays visible.
//!
//! Listings keep track of what they could not read: an order lookup that
//! found an unreadable record is [`OrderLookup::Unreadable`], not absent,
//! and a position listing names the symbols it had to skip.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::{Order, OrderSide, OrderStatus, OrderType, PositionSnapshot, TimeInForce};
use crate::error::{BrokerError, Result, TallyError};

pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

/// Status filter for order listing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatusFilter {
    Open,
    All,
}

impl OrderStatusFilter {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatusFilter::Open => "open",
            OrderStatusFilter::All => "all",
        }
    }
}

/// Broker-side view of one order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerOrder {
    pub id: String,
    /// Absent for orders placed outside this system
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    pub qty: i64,
    pub filled_qty: i64,
    pub filled_avg_price: Option<Decimal>,
    pub limit_price: Option<Decimal>,
    pub notional: Option<Decimal>,
    pub status: OrderStatus,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub filled_at: Option<DateTime<Utc>>,
}

/// Loosely-typed wire shape; every field optional until validated
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawBrokerOrder {
    pub id: Option<String>,
    pub client_order_id: Option<String>,
    pub symbol: Option<String>,
    pub side: Option<String>,
    pub qty: Option<Decimal>,
    pub filled_qty: Option<Decimal>,
    pub filled_avg_price: Option<Decimal>,
    pub limit_price: Option<Decimal>,
    pub notional: Option<Decimal>,
    pub status: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub filled_at: Option<DateTime<Utc>>,
}

fn required<T>(value: Option<T>, field: &str, id: &str) -> Result<T> {
    value.ok_or_else(|| {
        TallyError::InvalidBrokerPayload(format!("order {id}: missing required field `{field}`"))
    })
}

fn whole_shares(value: Decimal, field: &str, id: &str) -> Result<i64> {
    if !value.fract().is_zero() {
        return Err(TallyError::InvalidBrokerPayload(format!(
            "order {id}: fractional `{field}` {value} is not supported"
        )));
    }
    value.to_i64().ok_or_else(|| {
        TallyError::InvalidBrokerPayload(format!("order {id}: `{field}` {value} out of range"))
    })
}

impl TryFrom<RawBrokerOrder> for BrokerOrder {
    type Error = TallyError;

    fn try_from(raw: RawBrokerOrder) -> Result<Self> {
        let id = raw.id.ok_or_else(|| {
            TallyError::InvalidBrokerPayload("order without broker id".to_string())
        })?;
        let symbol = required(raw.symbol, "symbol", &id)?;
        let side = required(raw.side, "side", &id)?;
        let side = OrderSide::try_from(side.as_str())
            .map_err(|e| TallyError::InvalidBrokerPayload(format!("order {id}: {e}")))?;
        let qty = whole_shares(required(raw.qty, "qty", &id)?, "qty", &id)?;
        let filled_qty = whole_shares(
            required(raw.filled_qty, "filled_qty", &id)?,
            "filled_qty",
            &id,
        )?;
        let raw_status = required(raw.status, "status", &id)?;
        let status = OrderStatus::parse(&raw_status);
        if status == OrderStatus::Unknown {
            debug!(broker_order_id = %id, status = %raw_status, "unrecognized broker status");
        }
        let updated_at = required(raw.updated_at, "updated_at", &id)?;

        Ok(BrokerOrder {
            client_order_id: raw.client_order_id.filter(|c| !c.trim().is_empty()),
            symbol,
            side,
            qty,
            filled_qty,
            filled_avg_price: raw.filled_avg_price,
            limit_price: raw.limit_price,
            notional: raw.notional,
            status,
            created_at: raw.created_at,
            updated_at,
            filled_at: raw.filled_at,
            id,
        })
    }
}

/// Parse a list of wire orders, logging and dropping the unreconcilable ones
pub fn parse_orders(raw: Vec<RawBrokerOrder>) -> Vec<BrokerOrder> {
    raw.into_iter()
        .filter_map(|r| match BrokerOrder::try_from(r) {
            Ok(order) => Some(order),
            Err(e) => {
                warn!(error = %e, "skipping unreconcilable broker order");
                None
            }
        })
        .collect()
}

/// Outcome of a by-client-id lookup
#[derive(Debug, Clone, PartialEq)]
pub enum OrderLookup {
    Found(BrokerOrder),
    /// The broker holds the order but its payload failed to parse
    Unreadable(String),
    NotFound,
}

impl OrderLookup {
    pub fn from_raw(raw: RawBrokerOrder) -> Self {
        match BrokerOrder::try_from(raw) {
            Ok(order) => OrderLookup::Found(order),
            Err(e) => {
                warn!(error = %e, "broker order present but unreadable");
                OrderLookup::Unreadable(e.to_string())
            }
        }
    }
}

/// Broker-side view of one position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: String,
    /// Signed: negative is short
    pub qty: i64,
    pub avg_entry_price: Decimal,
    pub current_price: Option<Decimal>,
}

impl BrokerPosition {
    pub fn to_snapshot(&self) -> PositionSnapshot {
        PositionSnapshot {
            symbol: self.symbol.clone(),
            qty: self.qty,
            avg_entry_price: self.avg_entry_price,
            current_price: self.current_price,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawBrokerPosition {
    pub symbol: Option<String>,
    pub qty: Option<Decimal>,
    pub side: Option<String>,
    pub avg_entry_price: Option<Decimal>,
    pub current_price: Option<Decimal>,
}

impl TryFrom<RawBrokerPosition> for BrokerPosition {
    type Error = TallyError;

    fn try_from(raw: RawBrokerPosition) -> Result<Self> {
        let symbol = raw.symbol.ok_or_else(|| {
            TallyError::InvalidBrokerPayload("position without symbol".to_string())
        })?;
        let qty = raw.qty.ok_or_else(|| {
            TallyError::InvalidBrokerPayload(format!("position {symbol}: missing `qty`"))
        })?;
        let mut qty = whole_shares(qty, "qty", &symbol)?;
        if raw.side.as_deref() == Some("short") && qty > 0 {
            qty = -qty;
        }
        let avg_entry_price = raw.avg_entry_price.ok_or_else(|| {
            TallyError::InvalidBrokerPayload(format!("position {symbol}: missing `avg_entry_price`"))
        })?;

        Ok(BrokerPosition {
            symbol,
            qty,
            avg_entry_price,
            current_price: raw.current_price,
        })
    }
}

/// Broker position listing, including what could not be parsed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PositionListing {
    pub positions: Vec<BrokerPosition>,
    /// Symbols the broker reported with an unusable payload
    pub unreadable_symbols: Vec<String>,
    /// Unusable records that did not even carry a symbol
    pub unreadable_unnamed: usize,
}

impl PositionListing {
    pub fn complete(positions: Vec<BrokerPosition>) -> Self {
        Self {
            positions,
            ..Self::default()
        }
    }

    pub fn unreadable_count(&self) -> usize {
        self.unreadable_symbols.len() + self.unreadable_unnamed
    }
}

pub fn parse_positions(raw: Vec<RawBrokerPosition>) -> PositionListing {
    let mut listing = PositionListing::default();
    for record in raw {
        let symbol = record.symbol.clone().filter(|s| !s.trim().is_empty());
        match BrokerPosition::try_from(record) {
            Ok(position) => listing.positions.push(position),
            Err(e) => {
                warn!(error = %e, "unreadable broker position");
                match symbol {
                    Some(symbol) => listing.unreadable_symbols.push(symbol),
                    None => listing.unreadable_unnamed += 1,
                }
            }
        }
    }
    listing
}

/// Order parameters sent to the broker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmitOrder {
    pub symbol: String,
    pub side: OrderSide,
    pub qty: i64,
    pub order_type: OrderType,
    pub limit_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub time_in_force: TimeInForce,
}

impl From<&Order> for SubmitOrder {
    fn from(order: &Order) -> Self {
        Self {
            symbol: order.symbol.clone(),
            side: order.side,
            qty: order.qty,
            order_type: order.order_type,
            limit_price: order.limit_price,
            stop_price: order.stop_price,
            time_in_force: order.time_in_force,
        }
    }
}

/// Broker acknowledgement of an accepted submission
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerAck {
    pub broker_order_id: String,
    pub status: Option<OrderStatus>,
}

/// Remote broker client
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn get_orders(
        &self,
        status: OrderStatusFilter,
        limit: usize,
        after: Option<DateTime<Utc>>,
    ) -> BrokerResult<Vec<BrokerOrder>>;

    async fn get_order_by_client_id(&self, client_order_id: &str) -> BrokerResult<OrderLookup>;

    async fn get_all_positions(&self) -> BrokerResult<PositionListing>;

    async fn submit_order(
        &self,
        order: &SubmitOrder,
        client_order_id: &str,
    ) -> BrokerResult<BrokerAck>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn raw() -> RawBrokerOrder {
        serde_json::from_value(serde_json::json!({
            "id": "b-1",
            "client_order_id": "c-1",
            "symbol": "AAPL",
            "side": "buy",
            "qty": "10",
            "filled_qty": "4",
            "filled_avg_price": "189.5",
            "status": "partially_filled",
            "created_at": "2026-01-05T14:30:00Z",
            "updated_at": "2026-01-05T14:30:02.123456Z"
        }))
        .unwrap()
    }

    #[test]
    fn test_parses_complete_order() {
        let order = BrokerOrder::try_from(raw()).unwrap();
        assert_eq!(order.qty, 10);
        assert_eq!(order.filled_qty, 4);
        assert_eq!(order.filled_avg_price, Some(dec!(189.5)));
        assert_eq!(order.status, OrderStatus::PartiallyFilled);
        assert_eq!(order.client_order_id.as_deref(), Some("c-1"));
    }

    #[test]
    fn test_missing_required_fields_fail_closed() {
        let mut r = raw();
        r.updated_at = None;
        assert!(matches!(
            BrokerOrder::try_from(r),
            Err(TallyError::InvalidBrokerPayload(_))
        ));

        let mut r = raw();
        r.filled_qty = None;
        assert!(BrokerOrder::try_from(r).is_err());

    }

    #[test]
    fn test_unrecognized_status_parses_as_unknown() {
        let mut r = raw();
        r.status = Some("held".into());
        let order = BrokerOrder::try_from(r).unwrap();
        assert_eq!(order.status, OrderStatus::Unknown);
        assert_eq!(order.status.rank(), 0);
        assert!(!order.status.is_terminal());
    }

    #[test]
    fn test_lookup_distinguishes_unreadable_from_missing() {
        let mut r = raw();
        r.qty = Some(dec!(10.5));
        assert!(matches!(OrderLookup::from_raw(r), OrderLookup::Unreadable(_)));
        assert!(matches!(OrderLookup::from_raw(raw()), OrderLookup::Found(_)));
    }

    #[test]
    fn test_position_listing_names_unreadable_symbols() {
        let raw: Vec<RawBrokerPosition> = serde_json::from_value(serde_json::json!([
            { "symbol": "AAPL", "qty": "10", "side": "long", "avg_entry_price": "190" },
            { "symbol": "MSFT", "qty": "10.5", "side": "long", "avg_entry_price": "410" },
            { "qty": "3", "avg_entry_price": "1" }
        ]))
        .unwrap();
        let listing = parse_positions(raw);
        assert_eq!(listing.positions.len(), 1);
        assert_eq!(listing.unreadable_symbols, vec!["MSFT".to_string()]);
        assert_eq!(listing.unreadable_unnamed, 1);
        assert_eq!(listing.unreadable_count(), 2);
    }

    #[test]
    fn test_missing_client_order_id_is_kept_for_orphan_handling() {
        let mut r = raw();
        r.client_order_id = Some("".into());
        let order = BrokerOrder::try_from(r).unwrap();
        assert!(order.client_order_id.is_none());
    }

    #[test]
    fn test_parse_orders_drops_bad_records() {
        let mut bad = raw();
        bad.symbol = None;
        let parsed = parse_orders(vec![raw(), bad]);
        assert_eq!(parsed.len(), 1);
    }

    #[test]
    fn test_short_position_is_signed() {
        let raw: RawBrokerPosition = serde_json::from_value(serde_json::json!({
            "symbol": "TSLA",
            "qty": "25",
            "side": "short",
            "avg_entry_price": "201.10",
            "current_price": "199"
        }))
        .unwrap();
        let position = BrokerPosition::try_from(raw).unwrap();
        assert_eq!(position.qty, -25);
        assert_eq!(position.to_snapshot().avg_entry_price, dec!(201.10));
    }
}
