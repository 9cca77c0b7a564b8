//! Conflict resolution for order status writes.
//!
//! Every party that writes order status (webhook handlers, reconciliation,
//! manual corrections) proposes a [`StatusUpdate`]. The update is applied
//! only when the terminal lock admits it and it is causally newer than the
//! stored state under a strict tie-break chain:
//!
//! 1. later broker event timestamp (or nothing stored yet)
//! 2. equal timestamp, higher status rank
//! 3. equal timestamp and rank, larger filled quantity
//! 4. equal on all of the above, higher source authority (lower number)
//!
//! A rejected proposal is not an error: it means a newer or equally
//! authoritative update already won. The PostgreSQL store evaluates the same
//! predicate inside a single `UPDATE ... WHERE`; the in-memory store calls
//! [`is_write_allowed`] and [`merge`] directly.

use chrono::{DateTime, SubsecRound, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::{Order, OrderStatus};

/// Authority on exact-timestamp ties; lower value wins
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourcePriority {
    Manual,
    Reconciliation,
    Webhook,
}

impl SourcePriority {
    pub fn value(&self) -> i32 {
        match self {
            SourcePriority::Manual => 1,
            SourcePriority::Reconciliation => 2,
            SourcePriority::Webhook => 3,
        }
    }

    pub fn from_value(value: i32) -> Option<Self> {
        match value {
            1 => Some(SourcePriority::Manual),
            2 => Some(SourcePriority::Reconciliation),
            3 => Some(SourcePriority::Webhook),
            _ => None,
        }
    }
}

impl std::fmt::Display for SourcePriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourcePriority::Manual => write!(f, "manual"),
            SourcePriority::Reconciliation => write!(f, "reconciliation"),
            SourcePriority::Webhook => write!(f, "webhook"),
        }
    }
}

/// Stored rows with no recorded source lose every priority tie
pub const UNSET_SOURCE_PRIORITY: i32 = i32::MAX;

/// A proposed status write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub client_order_id: String,
    pub status: OrderStatus,
    /// Broker-attributed event time, not local receipt time
    pub event_timestamp: DateTime<Utc>,
    pub status_rank: i32,
    pub source_priority: SourcePriority,
    pub filled_qty: Option<i64>,
    pub filled_avg_price: Option<Decimal>,
    pub filled_at: Option<DateTime<Utc>>,
    pub broker_order_id: Option<String>,
    pub broker_event_id: Option<String>,
    pub error_message: Option<String>,
}

impl StatusUpdate {
    pub fn new(
        client_order_id: impl Into<String>,
        status: OrderStatus,
        event_timestamp: DateTime<Utc>,
        source_priority: SourcePriority,
    ) -> Self {
        Self {
            client_order_id: client_order_id.into(),
            status,
            // Stored at microsecond precision; equal-timestamp ties must
            // compare the same in memory and in the database
            event_timestamp: event_timestamp.trunc_subsecs(6),
            status_rank: status.rank(),
            source_priority,
            filled_qty: None,
            filled_avg_price: None,
            filled_at: None,
            broker_order_id: None,
            broker_event_id: None,
            error_message: None,
        }
    }

    pub fn with_fill(mut self, filled_qty: i64, filled_avg_price: Option<Decimal>) -> Self {
        self.filled_qty = Some(filled_qty);
        self.filled_avg_price = filled_avg_price;
        self
    }

    pub fn with_filled_at(mut self, filled_at: Option<DateTime<Utc>>) -> Self {
        self.filled_at = filled_at;
        self
    }

    pub fn with_broker_order_id(mut self, id: impl Into<String>) -> Self {
        self.broker_order_id = Some(id.into());
        self
    }

    pub fn with_broker_event_id(mut self, id: impl Into<String>) -> Self {
        self.broker_event_id = Some(id.into());
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}

/// Service-level result of a CAS write
#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome {
    Applied(Order),
    /// A causally newer or equally authoritative update already won
    Skipped,
}

impl CasOutcome {
    pub fn from_store(result: Option<Order>) -> Self {
        match result {
            Some(order) => CasOutcome::Applied(order),
            None => CasOutcome::Skipped,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, CasOutcome::Applied(_))
    }
}

/// Terminal lock: only non-terminal rows and `filled` rows accept writes
pub fn passes_terminal_lock(current: &Order) -> bool {
    !current.is_terminal || current.status == OrderStatus::Filled
}

/// The lexicographic tie-break chain
pub fn is_causally_newer(current: &Order, update: &StatusUpdate) -> bool {
    let stored_ts = match current.last_updated_at {
        None => return true,
        Some(ts) => ts,
    };

    if update.event_timestamp != stored_ts {
        return update.event_timestamp > stored_ts;
    }
    if update.status_rank != current.status_rank {
        return update.status_rank > current.status_rank;
    }

    let proposed_filled = update.filled_qty.unwrap_or(current.filled_qty);
    if proposed_filled != current.filled_qty {
        return proposed_filled > current.filled_qty;
    }

    let stored_priority = current.source_priority.unwrap_or(UNSET_SOURCE_PRIORITY);
    update.source_priority.value() < stored_priority
}

/// Full write-allowed predicate
pub fn is_write_allowed(current: &Order, update: &StatusUpdate) -> bool {
    passes_terminal_lock(current) && is_causally_newer(current, update)
}

/// Field merge for an admitted update
pub fn merge(current: &Order, update: &StatusUpdate, now: DateTime<Utc>) -> Order {
    let mut next = current.clone();

    next.status = update.status;
    next.status_rank = update.status_rank;
    next.is_terminal = update.status.is_terminal();
    next.last_updated_at = Some(update.event_timestamp);
    next.source_priority = Some(update.source_priority.value());

    if let Some(proposed) = update.filled_qty {
        if proposed >= current.filled_qty && update.filled_avg_price.is_some() {
            next.filled_avg_price = update.filled_avg_price;
        }
        next.filled_qty = current.filled_qty.max(proposed);
    }

    if next.filled_at.is_none()
        && update.status == OrderStatus::Filled
        && update.filled_qty.is_some()
    {
        next.filled_at = Some(update.filled_at.unwrap_or(update.event_timestamp));
    }

    if next.broker_order_id.is_none() {
        next.broker_order_id = update.broker_order_id.clone();
    }
    if next.broker_event_id.is_none() {
        next.broker_event_id = update.broker_event_id.clone();
    }
    if update.error_message.is_some() {
        next.error_message = update.error_message.clone();
    }

    next.updated_at = now;
    next
}

/// Evaluate and, if admitted, merge. Returns `None` when rejected.
pub fn try_apply(current: &Order, update: &StatusUpdate, now: DateTime<Utc>) -> Option<Order> {
    if is_write_allowed(current, update) {
        Some(merge(current, update, now))
    } else {
        None
    }
}
