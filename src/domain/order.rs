use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }

    /// +1 for buys, -1 for sells
    pub fn sign(&self) -> i64 {
        match self {
            OrderSide::Buy => 1,
            OrderSide::Sell => -1,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for OrderSide {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_ascii_lowercase().as_str() {
            "buy" => Ok(OrderSide::Buy),
            "sell" => Ok(OrderSide::Sell),
            other => Err(format!("unknown order side: {other}")),
        }
    }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "market",
            OrderType::Limit => "limit",
            OrderType::Stop => "stop",
            OrderType::StopLimit => "stop_limit",
        }
    }
}

impl TryFrom<&str> for OrderType {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_ascii_lowercase().as_str() {
            "market" => Ok(OrderType::Market),
            "limit" => Ok(OrderType::Limit),
            "stop" => Ok(OrderType::Stop),
            "stop_limit" => Ok(OrderType::StopLimit),
            other => Err(format!("unknown order type: {other}")),
        }
    }
}

/// Time in force
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeInForce {
    Day,
    /// Good Till Cancelled
    Gtc,
    /// Immediate Or Cancel
    Ioc,
    /// Fill Or Kill
    Fok,
}

impl TimeInForce {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeInForce::Day => "day",
            TimeInForce::Gtc => "gtc",
            TimeInForce::Ioc => "ioc",
            TimeInForce::Fok => "fok",
        }
    }
}

impl TryFrom<&str> for TimeInForce {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_ascii_lowercase().as_str() {
            "day" => Ok(TimeInForce::Day),
            "gtc" => Ok(TimeInForce::Gtc),
            "ioc" => Ok(TimeInForce::Ioc),
            "fok" => Ok(TimeInForce::Fok),
            other => Err(format!("unknown time in force: {other}")),
        }
    }
}

/// Order lifecycle status.
///
/// Ranks order statuses causally so that out-of-order deliveries can be
/// resolved without a global lock:
///
/// | Rank | Statuses |
/// |---|---|
/// | 1 | pending_new, dry_run |
/// | 2 | submitted, submitted_unconfirmed, new, accepted |
/// | 3 | pending_cancel, pending_replace, calculated, stopped, suspended, partially_filled |
/// | 4 | canceled, expired, failed, rejected, replaced, done_for_day, blocked_* |
/// | 5 | filled |
///
/// Anything unrecognised parses as `Unknown` and ranks 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    PendingNew,
    DryRun,
    Submitted,
    SubmittedUnconfirmed,
    New,
    Accepted,
    PendingCancel,
    PendingReplace,
    Calculated,
    Stopped,
    Suspended,
    PartiallyFilled,
    Canceled,
    Expired,
    Failed,
    Rejected,
    Replaced,
    DoneForDay,
    BlockedKillSwitch,
    BlockedCircuitBreaker,
    Filled,
    Unknown,
}

impl OrderStatus {
    pub const ALL_KNOWN: [OrderStatus; 21] = [
        OrderStatus::PendingNew,
        OrderStatus::DryRun,
        OrderStatus::Submitted,
        OrderStatus::SubmittedUnconfirmed,
        OrderStatus::New,
        OrderStatus::Accepted,
        OrderStatus::PendingCancel,
        OrderStatus::PendingReplace,
        OrderStatus::Calculated,
        OrderStatus::Stopped,
        OrderStatus::Suspended,
        OrderStatus::PartiallyFilled,
        OrderStatus::Canceled,
        OrderStatus::Expired,
        OrderStatus::Failed,
        OrderStatus::Rejected,
        OrderStatus::Replaced,
        OrderStatus::DoneForDay,
        OrderStatus::BlockedKillSwitch,
        OrderStatus::BlockedCircuitBreaker,
        OrderStatus::Filled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::PendingNew => "pending_new",
            OrderStatus::DryRun => "dry_run",
            OrderStatus::Submitted => "submitted",
            OrderStatus::SubmittedUnconfirmed => "submitted_unconfirmed",
            OrderStatus::New => "new",
            OrderStatus::Accepted => "accepted",
            OrderStatus::PendingCancel => "pending_cancel",
            OrderStatus::PendingReplace => "pending_replace",
            OrderStatus::Calculated => "calculated",
            OrderStatus::Stopped => "stopped",
            OrderStatus::Suspended => "suspended",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Canceled => "canceled",
            OrderStatus::Expired => "expired",
            OrderStatus::Failed => "failed",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Replaced => "replaced",
            OrderStatus::DoneForDay => "done_for_day",
            OrderStatus::BlockedKillSwitch => "blocked_kill_switch",
            OrderStatus::BlockedCircuitBreaker => "blocked_circuit_breaker",
            OrderStatus::Filled => "filled",
            OrderStatus::Unknown => "unknown",
        }
    }

    /// Parse a stored or broker-supplied status string. Never fails; use
    /// `parse_known` at boundaries that must reject unknown values.
    pub fn parse(s: &str) -> Self {
        Self::parse_known(s).unwrap_or(OrderStatus::Unknown)
    }

    /// Parse a status string, returning `None` for anything not in the rank table
    pub fn parse_known(s: &str) -> Option<Self> {
        let normalized = s.trim().to_ascii_lowercase();
        // Brokers spell it both ways
        let normalized = if normalized == "cancelled" {
            "canceled".to_string()
        } else {
            normalized
        };
        Self::ALL_KNOWN
            .iter()
            .copied()
            .find(|status| status.as_str() == normalized)
    }

    /// Causal rank used by the CAS tie-break chain
    pub fn rank(&self) -> i32 {
        use OrderStatus::*;
        match self {
            PendingNew | DryRun => 1,
            Submitted | SubmittedUnconfirmed | New | Accepted => 2,
            PendingCancel | PendingReplace | Calculated | Stopped | Suspended
            | PartiallyFilled => 3,
            Canceled | Expired | Failed | Rejected | Replaced | DoneForDay
            | BlockedKillSwitch | BlockedCircuitBreaker => 4,
            Filled => 5,
            Unknown => 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() >= 4
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rank lookup for raw status strings; unknown statuses rank 0
pub fn status_rank(status: &str) -> i32 {
    OrderStatus::parse(status).rank()
}

/// One execution appended to an order's fill history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillRecord {
    pub fill_id: String,
    pub qty: i64,
    pub price: Decimal,
    pub realized_pl: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Free-form order metadata; `fills` is append-only
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderMetadata {
    #[serde(default)]
    pub fills: Vec<FillRecord>,
    #[serde(default)]
    pub total_realized_pl: Decimal,
}

impl OrderMetadata {
    pub fn has_fill(&self, fill_id: &str) -> bool {
        self.fills.iter().any(|f| f.fill_id == fill_id)
    }
}

/// Parameters for creating an order row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewOrder {
    pub client_order_id: String,
    pub strategy_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub qty: i64,
    pub order_type: OrderType,
    pub limit_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub time_in_force: TimeInForce,
    pub status: OrderStatus,
}

impl NewOrder {
    pub fn market(symbol: impl Into<String>, side: OrderSide, qty: i64) -> Self {
        Self {
            client_order_id: Uuid::new_v4().simple().to_string(),
            strategy_id: "manual".to_string(),
            symbol: symbol.into(),
            side,
            qty,
            order_type: OrderType::Market,
            limit_price: None,
            stop_price: None,
            time_in_force: TimeInForce::Day,
            status: OrderStatus::PendingNew,
        }
    }

    pub fn limit(symbol: impl Into<String>, side: OrderSide, qty: i64, price: Decimal) -> Self {
        Self {
            order_type: OrderType::Limit,
            limit_price: Some(price),
            ..Self::market(symbol, side, qty)
        }
    }

    pub fn with_client_order_id(mut self, id: impl Into<String>) -> Self {
        self.client_order_id = id.into();
        self
    }

    pub fn with_strategy(mut self, strategy_id: impl Into<String>) -> Self {
        self.strategy_id = strategy_id.into();
        self
    }

    pub fn with_status(mut self, status: OrderStatus) -> Self {
        self.status = status;
        self
    }

    /// Reject shapes the ledger must never hold
    pub fn validate(&self) -> Result<(), String> {
        if self.client_order_id.trim().is_empty() {
            return Err("client_order_id must not be empty".to_string());
        }
        if self.symbol.trim().is_empty() {
            return Err("symbol must not be empty".to_string());
        }
        if self.qty <= 0 {
            return Err(format!("qty must be positive, got {}", self.qty));
        }
        if matches!(self.order_type, OrderType::Limit | OrderType::StopLimit)
            && self.limit_price.is_none()
        {
            return Err("limit orders require limit_price".to_string());
        }
        if matches!(self.order_type, OrderType::Stop | OrderType::StopLimit)
            && self.stop_price.is_none()
        {
            return Err("stop orders require stop_price".to_string());
        }
        Ok(())
    }
}

/// Order (tracked in the ledger)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub client_order_id: String,
    pub strategy_id: String,
    pub parent_order_id: Option<String>,
    pub slice_num: Option<i32>,
    pub total_slices: Option<i32>,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub symbol: String,
    pub side: OrderSide,
    pub qty: i64,
    pub order_type: OrderType,
    pub limit_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub time_in_force: TimeInForce,
    pub status: OrderStatus,
    pub status_rank: i32,
    pub is_terminal: bool,
    pub broker_order_id: Option<String>,
    pub broker_event_id: Option<String>,
    pub filled_qty: i64,
    pub filled_avg_price: Option<Decimal>,
    pub filled_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub retry_count: i32,
    /// Broker-attributed time of the last applied event
    pub last_updated_at: Option<DateTime<Utc>>,
    pub source_priority: Option<i32>,
    pub metadata: OrderMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
}

impl Order {
    /// Build a fresh ledger row from creation parameters
    pub fn from_new(new: NewOrder, now: DateTime<Utc>) -> Self {
        Self {
            client_order_id: new.client_order_id,
            strategy_id: new.strategy_id,
            parent_order_id: None,
            slice_num: None,
            total_slices: None,
            scheduled_time: None,
            symbol: new.symbol,
            side: new.side,
            qty: new.qty,
            order_type: new.order_type,
            limit_price: new.limit_price,
            stop_price: new.stop_price,
            time_in_force: new.time_in_force,
            status: new.status,
            status_rank: new.status.rank(),
            is_terminal: new.status.is_terminal(),
            broker_order_id: None,
            broker_event_id: None,
            filled_qty: 0,
            filled_avg_price: None,
            filled_at: None,
            error_message: None,
            retry_count: 0,
            last_updated_at: None,
            source_priority: None,
            metadata: OrderMetadata::default(),
            created_at: now,
            updated_at: now,
            submitted_at: None,
        }
    }

    pub fn is_slice(&self) -> bool {
        self.parent_order_id.is_some() && self.slice_num.is_some()
    }

    pub fn is_parent(&self) -> bool {
        self.total_slices.is_some()
    }

    /// Dollar value at the limit price, if any
    pub fn limit_notional(&self) -> Option<Decimal> {
        self.limit_price.map(|p| p * Decimal::from(self.qty))
    }

    pub fn remaining_qty(&self) -> i64 {
        (self.qty - self.filled_qty).max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_rank_table() {
        assert_eq!(OrderStatus::PendingNew.rank(), 1);
        assert_eq!(OrderStatus::DryRun.rank(), 1);
        assert_eq!(OrderStatus::SubmittedUnconfirmed.rank(), 2);
        assert_eq!(OrderStatus::Accepted.rank(), 2);
        assert_eq!(OrderStatus::PartiallyFilled.rank(), 3);
        assert_eq!(OrderStatus::Suspended.rank(), 3);
        assert_eq!(OrderStatus::DoneForDay.rank(), 4);
        assert_eq!(OrderStatus::BlockedCircuitBreaker.rank(), 4);
        assert_eq!(OrderStatus::Filled.rank(), 5);
        assert_eq!(status_rank("held"), 0);
    }

    #[test]
    fn test_terminal_set_matches_rank() {
        for status in OrderStatus::ALL_KNOWN {
            assert_eq!(status.is_terminal(), status.rank() >= 4, "{status}");
        }
        assert!(!OrderStatus::Unknown.is_terminal());
    }

    #[test]
    fn test_parse_round_trips_every_known_status() {
        for status in OrderStatus::ALL_KNOWN {
            assert_eq!(OrderStatus::parse_known(status.as_str()), Some(status));
        }
        assert_eq!(OrderStatus::parse("CANCELLED"), OrderStatus::Canceled);
        assert_eq!(OrderStatus::parse_known("held"), None);
        assert_eq!(OrderStatus::parse("held"), OrderStatus::Unknown);
    }

    #[test]
    fn test_new_order_validation() {
        assert!(NewOrder::market("AAPL", OrderSide::Buy, 10).validate().is_ok());
        assert!(NewOrder::market("AAPL", OrderSide::Buy, 0).validate().is_err());
        assert!(NewOrder::market("", OrderSide::Buy, 1).validate().is_err());

        let mut limit = NewOrder::limit("AAPL", OrderSide::Sell, 5, dec!(190));
        assert!(limit.validate().is_ok());
        limit.limit_price = None;
        assert!(limit.validate().is_err());
    }

    #[test]
    fn test_metadata_deserializes_without_fields() {
        let meta: OrderMetadata = serde_json::from_str("{}").unwrap();
        assert!(meta.fills.is_empty());
        assert_eq!(meta.total_realized_pl, Decimal::ZERO);
    }
}
