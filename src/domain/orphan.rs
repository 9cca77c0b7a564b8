use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::OrderSide;

/// Wildcard strategy key used when quarantining a symbol for an orphan
pub const QUARANTINE_ALL_STRATEGIES: &str = "*";

/// One quarantined (strategy, symbol) pair; `strategy_id` may be the wildcard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantineEntry {
    pub strategy_id: String,
    pub symbol: String,
    pub quarantined_at: DateTime<Utc>,
}

/// A broker-side order with no matching ledger row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrphanOrder {
    pub broker_order_id: String,
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub strategy_id: String,
    pub side: OrderSide,
    pub qty: i64,
    pub estimated_notional: Decimal,
    pub status: String,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl OrphanOrder {
    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }
}

/// Best-effort notional for an orphan: broker-reported notional, then
/// qty × limit price, then qty × average fill price, then zero.
pub fn estimate_notional(
    reported_notional: Option<Decimal>,
    qty: i64,
    limit_price: Option<Decimal>,
    filled_avg_price: Option<Decimal>,
) -> Decimal {
    if let Some(notional) = reported_notional {
        return notional;
    }
    let qty = Decimal::from(qty);
    limit_price
        .or(filled_avg_price)
        .map(|price| qty * price)
        .unwrap_or(Decimal::ZERO)
}
