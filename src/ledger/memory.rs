//! In-process ledger with the same locking and CAS semantics as the
//! PostgreSQL store.
//!
//! Row and symbol locks are per-key async mutexes held by a transaction
//! until commit or rollback. Transactional writes are staged and become
//! visible on commit. Used for dry runs and tests; operations can be made
//! to fail on demand to exercise store-error paths.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::debug;

use super::cas::{self, StatusUpdate};
use super::{symbol_lock_missing, LedgerStore, LedgerTx};
use crate::domain::{
    FillRecord, NewOrder, Order, OrderSide, OrderStatus, OrphanOrder, Position, PositionSnapshot,
    QuarantineEntry, QUARANTINE_ALL_STRATEGIES,
};
use crate::error::{Result, TallyError};

#[derive(Default)]
struct State {
    orders: HashMap<String, Order>,
    positions: HashMap<String, Position>,
    orphans: HashMap<String, OrphanOrder>,
    high_water_marks: HashMap<String, DateTime<Utc>>,
    quarantine: HashMap<(String, String), DateTime<Utc>>,
}

type KeyLocks = DashMap<String, Arc<Mutex<()>>>;

async fn acquire(locks: &KeyLocks, key: &str) -> OwnedMutexGuard<()> {
    let lock = locks
        .entry(key.to_string())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone();
    lock.lock_owned().await
}

/// Locks for several keys, taken in sorted order
async fn acquire_all(locks: &KeyLocks, keys: &mut Vec<String>) -> Vec<OwnedMutexGuard<()>> {
    keys.sort();
    keys.dedup();
    let mut guards = Vec::with_capacity(keys.len());
    for key in keys.iter() {
        guards.push(acquire(locks, key).await);
    }
    guards
}

/// Uniqueness and parent checks for a new row against committed rows and
/// rows staged ahead of it in the same transaction
fn check_new_order(
    committed: &HashMap<String, Order>,
    staged: &[Order],
    order: &Order,
) -> Result<()> {
    let exists =
        |id: &str| committed.contains_key(id) || staged.iter().any(|o| o.client_order_id == id);
    if exists(&order.client_order_id) {
        return Err(TallyError::Conflict(format!(
            "order {} already exists",
            order.client_order_id
        )));
    }
    if let (Some(parent), Some(slice_num)) = (&order.parent_order_id, order.slice_num) {
        if !exists(parent) {
            return Err(TallyError::Validation(format!(
                "slice {}: referenced parent does not exist",
                order.client_order_id
            )));
        }
        let duplicate = committed.values().chain(staged).any(|o| {
            o.parent_order_id.as_deref() == Some(parent.as_str()) && o.slice_num == Some(slice_num)
        });
        if duplicate {
            return Err(TallyError::Conflict(format!(
                "slice {slice_num} of parent {parent} already exists"
            )));
        }
    }
    Ok(())
}

fn parent_row(order: &NewOrder, total_slices: i32) -> Order {
    let mut row = Order::from_new(order.clone(), Utc::now());
    row.total_slices = Some(total_slices);
    row
}

fn child_row(
    order: &NewOrder,
    parent_order_id: &str,
    slice_num: i32,
    scheduled_time: Option<DateTime<Utc>>,
) -> Order {
    let mut row = Order::from_new(order.clone(), Utc::now());
    row.parent_order_id = Some(parent_order_id.to_string());
    row.slice_num = Some(slice_num);
    row.scheduled_time = scheduled_time;
    row
}

/// In-memory ledger store
#[derive(Clone, Default)]
pub struct InMemoryLedger {
    state: Arc<RwLock<State>>,
    order_locks: Arc<KeyLocks>,
    symbol_locks: Arc<KeyLocks>,
    unavailable: Arc<AtomicBool>,
    faults: Arc<DashMap<&'static str, u32>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with a store error until cleared
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail the next `times` calls of the named operation
    /// (e.g. `"mark_submitted"`) with a store error
    pub fn fail_operation(&self, operation: &'static str, times: u32) {
        self.faults.insert(operation, times);
    }

    /// Write a row directly, bypassing every guard. For seeding state.
    pub async fn put_order(&self, order: Order) {
        let mut state = self.state.write().await;
        state.orders.insert(order.client_order_id.clone(), order);
    }

    pub async fn put_position(&self, position: Position) {
        let mut state = self.state.write().await;
        state.positions.insert(position.symbol.clone(), position);
    }

    fn check(&self, operation: &'static str) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(TallyError::Database(sqlx::Error::PoolTimedOut));
        }
        if let Some(mut remaining) = self.faults.get_mut(operation) {
            if *remaining > 0 {
                *remaining -= 1;
                debug!(operation, "injected ledger fault");
                return Err(TallyError::Database(sqlx::Error::PoolTimedOut));
            }
        }
        Ok(())
    }

    async fn insert_new(&self, order: Order) -> Result<Order> {
        let mut state = self.state.write().await;
        check_new_order(&state.orders, &[], &order)?;
        state
            .orders
            .insert(order.client_order_id.clone(), order.clone());
        Ok(order)
    }
}

fn append_fill_to(order: &Order, fill: &FillRecord, now: DateTime<Utc>) -> Order {
    let mut next = order.clone();
    next.metadata.fills.push(fill.clone());
    next.metadata.total_realized_pl += fill.realized_pl;
    next.updated_at = now;
    next
}

fn position_after_fill(
    current: Option<Position>,
    symbol: &str,
    fill_qty: i64,
    fill_price: Decimal,
    side: OrderSide,
    now: DateTime<Utc>,
) -> Position {
    current
        .unwrap_or_else(|| Position::flat(symbol, now))
        .apply_fill(fill_qty, fill_price, side, now)
        .0
}

#[async_trait]
impl LedgerStore for InMemoryLedger {
    async fn create_order(&self, order: &NewOrder) -> Result<Order> {
        self.check("create_order")?;
        order.validate().map_err(TallyError::Validation)?;
        self.insert_new(Order::from_new(order.clone(), Utc::now())).await
    }

    async fn create_parent_order(&self, order: &NewOrder, total_slices: i32) -> Result<Order> {
        self.check("create_parent_order")?;
        order.validate().map_err(TallyError::Validation)?;
        self.insert_new(parent_row(order, total_slices)).await
    }

    async fn create_child_slice(
        &self,
        order: &NewOrder,
        parent_order_id: &str,
        slice_num: i32,
        scheduled_time: Option<DateTime<Utc>>,
    ) -> Result<Order> {
        self.check("create_child_slice")?;
        order.validate().map_err(TallyError::Validation)?;
        self.insert_new(child_row(order, parent_order_id, slice_num, scheduled_time))
            .await
    }

    async fn get_order(&self, client_order_id: &str) -> Result<Option<Order>> {
        self.check("get_order")?;
        let state = self.state.read().await;
        Ok(state.orders.get(client_order_id).cloned())
    }

    async fn existing_client_order_ids(
        &self,
        client_order_ids: &[String],
    ) -> Result<HashSet<String>> {
        self.check("existing_client_order_ids")?;
        let state = self.state.read().await;
        Ok(client_order_ids
            .iter()
            .filter(|id| state.orders.contains_key(id.as_str()))
            .cloned()
            .collect())
    }

    async fn get_non_terminal_orders(
        &self,
        created_before: Option<DateTime<Utc>>,
    ) -> Result<Vec<Order>> {
        self.check("get_non_terminal_orders")?;
        let state = self.state.read().await;
        let mut orders: Vec<Order> = state
            .orders
            .values()
            .filter(|o| !o.is_terminal)
            .filter(|o| created_before.map_or(true, |cutoff| o.created_at < cutoff))
            .cloned()
            .collect();
        orders.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(orders)
    }

    async fn get_slices_by_parent(&self, parent_order_id: &str) -> Result<Vec<Order>> {
        self.check("get_slices_by_parent")?;
        let state = self.state.read().await;
        let mut slices: Vec<Order> = state
            .orders
            .values()
            .filter(|o| o.parent_order_id.as_deref() == Some(parent_order_id))
            .cloned()
            .collect();
        slices.sort_by_key(|o| o.slice_num);
        Ok(slices)
    }

    async fn update_order_status_cas(&self, update: &StatusUpdate) -> Result<Option<Order>> {
        self.check("update_order_status_cas")?;
        let _row = acquire(&self.order_locks, &update.client_order_id).await;
        let mut state = self.state.write().await;
        let Some(current) = state.orders.get(&update.client_order_id) else {
            return Ok(None);
        };
        let Some(next) = cas::try_apply(current, update, Utc::now()) else {
            return Ok(None);
        };
        state
            .orders
            .insert(next.client_order_id.clone(), next.clone());
        Ok(Some(next))
    }

    async fn update_order_status(
        &self,
        client_order_id: &str,
        status: OrderStatus,
        error_message: Option<&str>,
    ) -> Result<Option<Order>> {
        self.check("update_order_status")?;
        let _row = acquire(&self.order_locks, client_order_id).await;
        let mut state = self.state.write().await;
        let Some(order) = state.orders.get_mut(client_order_id) else {
            return Ok(None);
        };
        if order.is_terminal || order.status_rank > status.rank() {
            return Ok(None);
        }
        order.status = status;
        order.status_rank = status.rank();
        order.is_terminal = status.is_terminal();
        order.error_message = error_message.map(str::to_string);
        order.updated_at = Utc::now();
        Ok(Some(order.clone()))
    }

    async fn mark_submitted(
        &self,
        client_order_id: &str,
        broker_order_id: &str,
    ) -> Result<Option<Order>> {
        self.check("mark_submitted")?;
        let _row = acquire(&self.order_locks, client_order_id).await;
        let mut state = self.state.write().await;
        let Some(order) = state.orders.get_mut(client_order_id) else {
            return Ok(None);
        };
        if order.is_terminal && order.status != OrderStatus::Filled {
            return Ok(None);
        }
        let now = Utc::now();
        if order.status_rank < OrderStatus::Submitted.rank() {
            order.status = OrderStatus::Submitted;
            order.status_rank = OrderStatus::Submitted.rank();
            order.error_message = None;
        }
        if order.broker_order_id.is_none() {
            order.broker_order_id = Some(broker_order_id.to_string());
        }
        order.submitted_at.get_or_insert(now);
        order.updated_at = now;
        Ok(Some(order.clone()))
    }

    async fn increment_retry_count(&self, client_order_id: &str) -> Result<()> {
        self.check("increment_retry_count")?;
        let _row = acquire(&self.order_locks, client_order_id).await;
        let mut state = self.state.write().await;
        if let Some(order) = state.orders.get_mut(client_order_id) {
            order.retry_count += 1;
            order.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn cancel_pending_slices(&self, parent_order_id: &str) -> Result<u64> {
        self.check("cancel_pending_slices")?;
        let is_pending_slice = |order: &Order| {
            order.parent_order_id.as_deref() == Some(parent_order_id)
                && order.status == OrderStatus::PendingNew
        };
        let mut candidates: Vec<String> = {
            let state = self.state.read().await;
            state
                .orders
                .values()
                .filter(|o| is_pending_slice(*o))
                .map(|o| o.client_order_id.clone())
                .collect()
        };
        // Rows locked by an open transaction are written after it commits
        let _rows = acquire_all(&self.order_locks, &mut candidates).await;

        let mut state = self.state.write().await;
        let now = Utc::now();
        let mut count = 0;
        for id in &candidates {
            let Some(order) = state.orders.get_mut(id) else {
                continue;
            };
            if is_pending_slice(order) {
                order.status = OrderStatus::Canceled;
                order.status_rank = OrderStatus::Canceled.rank();
                order.is_terminal = true;
                order.updated_at = now;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn append_fill(
        &self,
        client_order_id: &str,
        fill: &FillRecord,
    ) -> Result<Option<Order>> {
        self.check("append_fill")?;
        let _row = acquire(&self.order_locks, client_order_id).await;
        let mut state = self.state.write().await;
        let Some(current) = state.orders.get(client_order_id) else {
            return Ok(None);
        };
        let next = append_fill_to(current, fill, Utc::now());
        state
            .orders
            .insert(client_order_id.to_string(), next.clone());
        Ok(Some(next))
    }

    async fn update_position_on_fill(
        &self,
        symbol: &str,
        fill_qty: i64,
        fill_price: Decimal,
        side: OrderSide,
    ) -> Result<Position> {
        self.check("update_position_on_fill")?;
        let _symbol = acquire(&self.symbol_locks, symbol).await;
        let mut state = self.state.write().await;
        let next = position_after_fill(
            state.positions.get(symbol).cloned(),
            symbol,
            fill_qty,
            fill_price,
            side,
            Utc::now(),
        );
        state.positions.insert(symbol.to_string(), next.clone());
        Ok(next)
    }

    async fn get_position(&self, symbol: &str) -> Result<Option<Position>> {
        self.check("get_position")?;
        let state = self.state.read().await;
        Ok(state.positions.get(symbol).cloned())
    }

    async fn get_all_positions(&self) -> Result<Vec<Position>> {
        self.check("get_all_positions")?;
        let state = self.state.read().await;
        let mut positions: Vec<Position> = state.positions.values().cloned().collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(positions)
    }

    async fn upsert_position_snapshot(&self, snapshot: &PositionSnapshot) -> Result<Position> {
        self.check("upsert_position_snapshot")?;
        let _symbol = acquire(&self.symbol_locks, &snapshot.symbol).await;
        let mut state = self.state.write().await;
        let now = Utc::now();
        let position = state
            .positions
            .entry(snapshot.symbol.clone())
            .or_insert_with(|| Position::flat(snapshot.symbol.clone(), now));
        position.qty = snapshot.qty;
        position.avg_entry_price = if snapshot.qty == 0 {
            Decimal::ZERO
        } else {
            snapshot.avg_entry_price
        };
        position.current_price = snapshot.current_price;
        position.updated_at = now;
        Ok(position.clone())
    }

    async fn flatten_positions_not_in(&self, keep: &[String]) -> Result<Vec<String>> {
        self.check("flatten_positions_not_in")?;
        let mut candidates: Vec<String> = {
            let state = self.state.read().await;
            state
                .positions
                .values()
                .filter(|p| p.qty != 0 && !keep.contains(&p.symbol))
                .map(|p| p.symbol.clone())
                .collect()
        };
        let _symbols = acquire_all(&self.symbol_locks, &mut candidates).await;

        let mut state = self.state.write().await;
        let now = Utc::now();
        let mut flattened = Vec::new();
        for symbol in &candidates {
            let Some(position) = state.positions.get_mut(symbol) else {
                continue;
            };
            if position.qty != 0 {
                position.qty = 0;
                position.avg_entry_price = Decimal::ZERO;
                position.updated_at = now;
                flattened.push(position.symbol.clone());
            }
        }
        flattened.sort();
        Ok(flattened)
    }

    async fn upsert_orphan(&self, orphan: &OrphanOrder) -> Result<bool> {
        self.check("upsert_orphan")?;
        let mut state = self.state.write().await;
        match state.orphans.get_mut(&orphan.broker_order_id) {
            Some(existing) => {
                existing.status = orphan.status.clone();
                Ok(false)
            }
            None => {
                state
                    .orphans
                    .insert(orphan.broker_order_id.clone(), orphan.clone());
                Ok(true)
            }
        }
    }

    async fn resolve_orphan(
        &self,
        broker_order_id: &str,
        status: &str,
        resolved_at: DateTime<Utc>,
    ) -> Result<bool> {
        self.check("resolve_orphan")?;
        let mut state = self.state.write().await;
        match state.orphans.get_mut(broker_order_id) {
            Some(orphan) if orphan.resolved_at.is_none() => {
                orphan.status = status.to_string();
                orphan.resolved_at = Some(resolved_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_orphans(&self, include_resolved: bool) -> Result<Vec<OrphanOrder>> {
        self.check("list_orphans")?;
        let state = self.state.read().await;
        let mut orphans: Vec<OrphanOrder> = state
            .orphans
            .values()
            .filter(|o| include_resolved || !o.is_resolved())
            .cloned()
            .collect();
        orphans.sort_by(|a, b| a.detected_at.cmp(&b.detected_at));
        Ok(orphans)
    }

    async fn get_high_water_mark(&self, name: &str) -> Result<Option<DateTime<Utc>>> {
        self.check("get_high_water_mark")?;
        let state = self.state.read().await;
        Ok(state.high_water_marks.get(name).copied())
    }

    async fn set_high_water_mark(&self, name: &str, at: DateTime<Utc>) -> Result<DateTime<Utc>> {
        self.check("set_high_water_mark")?;
        let mut state = self.state.write().await;
        let stored = state
            .high_water_marks
            .entry(name.to_string())
            .and_modify(|current| *current = (*current).max(at))
            .or_insert(at);
        Ok(*stored)
    }

    async fn quarantine_symbol(
        &self,
        strategy_id: &str,
        symbol: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        self.check("quarantine_symbol")?;
        let mut state = self.state.write().await;
        let key = (strategy_id.to_string(), symbol.to_string());
        if state.quarantine.contains_key(&key) {
            return Ok(false);
        }
        state.quarantine.insert(key, at);
        Ok(true)
    }

    async fn is_symbol_quarantined(&self, strategy_id: &str, symbol: &str) -> Result<bool> {
        self.check("is_symbol_quarantined")?;
        let state = self.state.read().await;
        Ok([strategy_id, QUARANTINE_ALL_STRATEGIES]
            .iter()
            .any(|s| state.quarantine.contains_key(&(s.to_string(), symbol.to_string()))))
    }

    async fn clear_quarantine(&self, strategy_id: &str, symbol: &str) -> Result<bool> {
        self.check("clear_quarantine")?;
        let mut state = self.state.write().await;
        Ok(state
            .quarantine
            .remove(&(strategy_id.to_string(), symbol.to_string()))
            .is_some())
    }

    async fn list_quarantine(&self) -> Result<Vec<QuarantineEntry>> {
        self.check("list_quarantine")?;
        let state = self.state.read().await;
        let mut entries: Vec<QuarantineEntry> = state
            .quarantine
            .iter()
            .map(|((strategy_id, symbol), at)| QuarantineEntry {
                strategy_id: strategy_id.clone(),
                symbol: symbol.clone(),
                quarantined_at: *at,
            })
            .collect();
        entries.sort_by(|a, b| (&a.symbol, &a.strategy_id).cmp(&(&b.symbol, &b.strategy_id)));
        Ok(entries)
    }

    async fn begin(&self) -> Result<Box<dyn LedgerTx>> {
        self.check("begin")?;
        Ok(Box::new(InMemoryTx {
            ledger: self.clone(),
            order_guards: HashMap::new(),
            symbol_guards: HashMap::new(),
            staged_orders: HashMap::new(),
            staged_positions: HashMap::new(),
            staged_inserts: Vec::new(),
        }))
    }
}

/// Transaction over [`InMemoryLedger`]
pub struct InMemoryTx {
    ledger: InMemoryLedger,
    order_guards: HashMap<String, OwnedMutexGuard<()>>,
    symbol_guards: HashMap<String, OwnedMutexGuard<()>>,
    staged_orders: HashMap<String, Order>,
    staged_positions: HashMap<String, Position>,
    /// New rows, in creation order
    staged_inserts: Vec<Order>,
}

impl InMemoryTx {
    async fn lock_order(&mut self, client_order_id: &str) {
        if !self.order_guards.contains_key(client_order_id) {
            let guard = acquire(&self.ledger.order_locks, client_order_id).await;
            self.order_guards.insert(client_order_id.to_string(), guard);
        }
    }

    async fn stage_insert(&mut self, order: Order) -> Result<Order> {
        {
            let state = self.ledger.state.read().await;
            check_new_order(&state.orders, &self.staged_inserts, &order)?;
        }
        self.staged_inserts.push(order.clone());
        Ok(order)
    }

    async fn current_order(&self, client_order_id: &str) -> Option<Order> {
        if let Some(staged) = self.staged_orders.get(client_order_id) {
            return Some(staged.clone());
        }
        if let Some(inserted) = self
            .staged_inserts
            .iter()
            .find(|o| o.client_order_id == client_order_id)
        {
            return Some(inserted.clone());
        }
        let state = self.ledger.state.read().await;
        state.orders.get(client_order_id).cloned()
    }

    async fn current_position(&self, symbol: &str) -> Option<Position> {
        if let Some(staged) = self.staged_positions.get(symbol) {
            return Some(staged.clone());
        }
        let state = self.ledger.state.read().await;
        state.positions.get(symbol).cloned()
    }
}

#[async_trait]
impl LedgerTx for InMemoryTx {
    async fn create_parent_order(&mut self, order: &NewOrder, total_slices: i32) -> Result<Order> {
        self.ledger.check("create_parent_order")?;
        order.validate().map_err(TallyError::Validation)?;
        self.stage_insert(parent_row(order, total_slices)).await
    }

    async fn create_child_slice(
        &mut self,
        order: &NewOrder,
        parent_order_id: &str,
        slice_num: i32,
        scheduled_time: Option<DateTime<Utc>>,
    ) -> Result<Order> {
        self.ledger.check("create_child_slice")?;
        order.validate().map_err(TallyError::Validation)?;
        self.stage_insert(child_row(order, parent_order_id, slice_num, scheduled_time))
            .await
    }

    async fn get_order_for_update(&mut self, client_order_id: &str) -> Result<Option<Order>> {
        self.ledger.check("get_order_for_update")?;
        self.lock_order(client_order_id).await;
        Ok(self.current_order(client_order_id).await)
    }

    async fn get_position_for_update(&mut self, symbol: &str) -> Result<Option<Position>> {
        self.ledger.check("get_position_for_update")?;
        if !self.symbol_guards.contains_key(symbol) {
            let guard = acquire(&self.ledger.symbol_locks, symbol).await;
            self.symbol_guards.insert(symbol.to_string(), guard);
        }
        Ok(self.current_position(symbol).await)
    }

    async fn update_position_on_fill(
        &mut self,
        symbol: &str,
        fill_qty: i64,
        fill_price: Decimal,
        side: OrderSide,
    ) -> Result<Position> {
        self.ledger.check("update_position_on_fill")?;
        if !self.symbol_guards.contains_key(symbol) {
            return Err(symbol_lock_missing(symbol));
        }
        let next = position_after_fill(
            self.current_position(symbol).await,
            symbol,
            fill_qty,
            fill_price,
            side,
            Utc::now(),
        );
        self.staged_positions
            .insert(symbol.to_string(), next.clone());
        Ok(next)
    }

    async fn append_fill(
        &mut self,
        client_order_id: &str,
        fill: &FillRecord,
    ) -> Result<Option<Order>> {
        self.ledger.check("append_fill")?;
        self.lock_order(client_order_id).await;
        let Some(current) = self.current_order(client_order_id).await else {
            return Ok(None);
        };
        let next = append_fill_to(&current, fill, Utc::now());
        self.staged_orders
            .insert(client_order_id.to_string(), next.clone());
        Ok(Some(next))
    }

    async fn update_order_status_cas(&mut self, update: &StatusUpdate) -> Result<Option<Order>> {
        self.ledger.check("update_order_status_cas")?;
        self.lock_order(&update.client_order_id).await;
        let Some(current) = self.current_order(&update.client_order_id).await else {
            return Ok(None);
        };
        let Some(next) = cas::try_apply(&current, update, Utc::now()) else {
            return Ok(None);
        };
        self.staged_orders
            .insert(update.client_order_id.clone(), next.clone());
        Ok(Some(next))
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.ledger.check("commit")?;
        let this = *self;
        {
            let mut state = this.ledger.state.write().await;
            // Re-check inserts against rows committed since they were staged
            for (i, order) in this.staged_inserts.iter().enumerate() {
                check_new_order(&state.orders, &this.staged_inserts[..i], order)?;
            }
            for order in this.staged_inserts {
                state.orders.insert(order.client_order_id.clone(), order);
            }
            // Staged rows are under this transaction's locks
            state.orders.extend(this.staged_orders);
            state.positions.extend(this.staged_positions);
        }
        drop(this.order_guards);
        drop(this.symbol_guards);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
