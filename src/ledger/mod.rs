//! Order Ledger Store.
//!
//! Durable orders, positions, orphan orders, symbol quarantine and
//! reconciliation high-water marks. Two write paths must stay correct under concurrency:
//!
//! - row-locked order mutation (`LedgerTx::get_order_for_update`)
//! - symbol-locked position mutation (`LedgerTx::get_position_for_update`),
//!   which holds even when the position row does not exist yet
//!
//! Every other status write goes through the single-statement CAS in
//! [`cas`]. "Not found" is `Ok(None)`, and so is a CAS rejection.

pub mod cas;
pub mod memory;
pub mod postgres;

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::domain::{
    FillRecord, NewOrder, Order, OrderSide, OrderStatus, OrphanOrder, Position, PositionSnapshot,
    QuarantineEntry,
};
use crate::error::Result;

pub use cas::{CasOutcome, SourcePriority, StatusUpdate};
pub use memory::InMemoryLedger;
pub use postgres::PostgresLedger;

/// Name of the high-water mark stream used by the reconciliation service
pub const ORDER_RECONCILIATION_STREAM: &str = "orders";

/// Ledger store contract
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Fails with `Conflict` if `client_order_id` already exists
    async fn create_order(&self, order: &NewOrder) -> Result<Order>;

    async fn create_parent_order(&self, order: &NewOrder, total_slices: i32) -> Result<Order>;

    /// Fails with `Conflict` on a duplicate `(parent_order_id, slice_num)`
    /// and with `Validation` when the parent does not exist
    async fn create_child_slice(
        &self,
        order: &NewOrder,
        parent_order_id: &str,
        slice_num: i32,
        scheduled_time: Option<DateTime<Utc>>,
    ) -> Result<Order>;

    async fn get_order(&self, client_order_id: &str) -> Result<Option<Order>>;

    /// Batched existence check
    async fn existing_client_order_ids(&self, client_order_ids: &[String])
        -> Result<HashSet<String>>;

    /// Non-terminal orders, optionally only those created before a cutoff
    async fn get_non_terminal_orders(
        &self,
        created_before: Option<DateTime<Utc>>,
    ) -> Result<Vec<Order>>;

    async fn get_slices_by_parent(&self, parent_order_id: &str) -> Result<Vec<Order>>;

    /// The sanctioned path for every external status update.
    /// Returns `None` when the row is missing or the proposal lost.
    async fn update_order_status_cas(&self, update: &StatusUpdate) -> Result<Option<Order>>;

    /// Scheduler-internal status write. Never touches a terminal row and
    /// never lowers the status rank.
    async fn update_order_status(
        &self,
        client_order_id: &str,
        status: OrderStatus,
        error_message: Option<&str>,
    ) -> Result<Option<Order>>;

    /// Record broker acceptance: `submitted`, broker id attached, error
    /// cleared. Leaves a row that already moved further untouched apart
    /// from coalescing the broker id. `None` if the row is missing or
    /// terminal in a non-filled status.
    async fn mark_submitted(
        &self,
        client_order_id: &str,
        broker_order_id: &str,
    ) -> Result<Option<Order>>;

    async fn increment_retry_count(&self, client_order_id: &str) -> Result<()>;

    /// Bulk-transition `pending_new` slices of a parent to `canceled`
    async fn cancel_pending_slices(&self, parent_order_id: &str) -> Result<u64>;

    /// Append one fill and add its realized P&L in a single statement
    async fn append_fill(&self, client_order_id: &str, fill: &FillRecord)
        -> Result<Option<Order>>;

    /// Standalone variant: takes the symbol lock in its own transaction
    async fn update_position_on_fill(
        &self,
        symbol: &str,
        fill_qty: i64,
        fill_price: Decimal,
        side: OrderSide,
    ) -> Result<Position>;

    async fn get_position(&self, symbol: &str) -> Result<Option<Position>>;

    async fn get_all_positions(&self) -> Result<Vec<Position>>;

    /// Authoritative overwrite of qty, average price and mark; keeps
    /// cumulative realized P&L
    async fn upsert_position_snapshot(&self, snapshot: &PositionSnapshot) -> Result<Position>;

    /// Force every non-flat symbol outside `keep` to zero; returns the
    /// symbols flattened
    async fn flatten_positions_not_in(&self, keep: &[String]) -> Result<Vec<String>>;

    /// Idempotent on `broker_order_id`; true when the row is new
    async fn upsert_orphan(&self, orphan: &OrphanOrder) -> Result<bool>;

    /// Soft-resolve; true when an unresolved row was updated
    async fn resolve_orphan(
        &self,
        broker_order_id: &str,
        status: &str,
        resolved_at: DateTime<Utc>,
    ) -> Result<bool>;

    async fn list_orphans(&self, include_resolved: bool) -> Result<Vec<OrphanOrder>>;

    async fn get_high_water_mark(&self, name: &str) -> Result<Option<DateTime<Utc>>>;

    /// Upsert; never moves the stored mark backward. Returns the stored value.
    async fn set_high_water_mark(&self, name: &str, at: DateTime<Utc>) -> Result<DateTime<Utc>>;

    /// Idempotent; true when the entry is new
    async fn quarantine_symbol(
        &self,
        strategy_id: &str,
        symbol: &str,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Blocked for this strategy, directly or through the wildcard key
    async fn is_symbol_quarantined(&self, strategy_id: &str, symbol: &str) -> Result<bool>;

    /// Manual clear of one exact key; true when an entry was removed
    async fn clear_quarantine(&self, strategy_id: &str, symbol: &str) -> Result<bool>;

    async fn list_quarantine(&self) -> Result<Vec<QuarantineEntry>>;

    async fn begin(&self) -> Result<Box<dyn LedgerTx>>;
}

/// An open ledger transaction. Locks taken through it are released on
/// commit or rollback; dropping it without either rolls back.
#[async_trait]
pub trait LedgerTx: Send {
    async fn create_parent_order(&mut self, order: &NewOrder, total_slices: i32) -> Result<Order>;

    /// The parent may have been created earlier in the same transaction
    async fn create_child_slice(
        &mut self,
        order: &NewOrder,
        parent_order_id: &str,
        slice_num: i32,
        scheduled_time: Option<DateTime<Utc>>,
    ) -> Result<Order>;

    /// Exclusive row lock for the transaction's lifetime
    async fn get_order_for_update(&mut self, client_order_id: &str) -> Result<Option<Order>>;

    /// Symbol-scoped exclusive lock, taken whether or not a row exists
    async fn get_position_for_update(&mut self, symbol: &str) -> Result<Option<Position>>;

    /// Transactional variant; the symbol lock must already be held
    async fn update_position_on_fill(
        &mut self,
        symbol: &str,
        fill_qty: i64,
        fill_price: Decimal,
        side: OrderSide,
    ) -> Result<Position>;

    async fn append_fill(&mut self, client_order_id: &str, fill: &FillRecord)
        -> Result<Option<Order>>;

    async fn update_order_status_cas(&mut self, update: &StatusUpdate) -> Result<Option<Order>>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

pub(crate) fn symbol_lock_missing(symbol: &str) -> crate::error::TallyError {
    crate::error::TallyError::Internal(format!(
        "position update for {symbol} without holding its symbol lock"
    ))
}
