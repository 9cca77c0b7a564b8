use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgConnection, PgExecutor, Postgres, Row, Transaction};
use tracing::{debug, info, instrument};

use super::cas::{StatusUpdate, UNSET_SOURCE_PRIORITY};
use super::{symbol_lock_missing, LedgerStore, LedgerTx};
use crate::domain::{
    FillRecord, NewOrder, Order, OrderMetadata, OrderSide, OrderStatus, OrderType, OrphanOrder,
    Position, PositionSnapshot, QuarantineEntry, TimeInForce, QUARANTINE_ALL_STRATEGIES,
};
use crate::error::{Result, TallyError};

/// First key of the two-key advisory lock, so symbol locks never collide
/// with advisory locks taken by other applications on the same database
const SYMBOL_LOCK_NAMESPACE: i32 = 0x5359_4d42;

const ORDER_COLUMNS: &str = r#"
    client_order_id, strategy_id, parent_order_id, slice_num, total_slices, scheduled_time,
    symbol, side, qty, order_type, limit_price, stop_price, time_in_force,
    status, status_rank, is_terminal, broker_order_id, broker_event_id,
    filled_qty, filled_avg_price, filled_at, error_message, retry_count,
    last_updated_at, source_priority, metadata, created_at, updated_at, submitted_at
"#;

const POSITION_COLUMNS: &str =
    "symbol, qty, avg_entry_price, realized_pl, current_price, updated_at, last_trade_at";

const ORPHAN_COLUMNS: &str = r#"
    broker_order_id, client_order_id, symbol, strategy_id, side, qty,
    estimated_notional, status, detected_at, resolved_at
"#;

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

fn order_from_row(row: &PgRow) -> Result<Order> {
    let side: String = row.try_get("side")?;
    let order_type: String = row.try_get("order_type")?;
    let time_in_force: String = row.try_get("time_in_force")?;
    let status: String = row.try_get("status")?;
    let metadata: Json<OrderMetadata> = row.try_get("metadata")?;

    Ok(Order {
        client_order_id: row.try_get("client_order_id")?,
        strategy_id: row.try_get("strategy_id")?,
        parent_order_id: row.try_get("parent_order_id")?,
        slice_num: row.try_get("slice_num")?,
        total_slices: row.try_get("total_slices")?,
        scheduled_time: row.try_get("scheduled_time")?,
        symbol: row.try_get("symbol")?,
        side: OrderSide::try_from(side.as_str()).map_err(TallyError::Internal)?,
        qty: row.try_get("qty")?,
        order_type: OrderType::try_from(order_type.as_str()).map_err(TallyError::Internal)?,
        limit_price: row.try_get("limit_price")?,
        stop_price: row.try_get("stop_price")?,
        time_in_force: TimeInForce::try_from(time_in_force.as_str())
            .map_err(TallyError::Internal)?,
        status: OrderStatus::parse(&status),
        status_rank: row.try_get("status_rank")?,
        is_terminal: row.try_get("is_terminal")?,
        broker_order_id: row.try_get("broker_order_id")?,
        broker_event_id: row.try_get("broker_event_id")?,
        filled_qty: row.try_get("filled_qty")?,
        filled_avg_price: row.try_get("filled_avg_price")?,
        filled_at: row.try_get("filled_at")?,
        error_message: row.try_get("error_message")?,
        retry_count: row.try_get("retry_count")?,
        last_updated_at: row.try_get("last_updated_at")?,
        source_priority: row.try_get("source_priority")?,
        metadata: metadata.0,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        submitted_at: row.try_get("submitted_at")?,
    })
}

fn position_from_row(row: &PgRow) -> Result<Position> {
    Ok(Position {
        symbol: row.try_get("symbol")?,
        qty: row.try_get("qty")?,
        avg_entry_price: row.try_get("avg_entry_price")?,
        realized_pl: row.try_get("realized_pl")?,
        current_price: row.try_get("current_price")?,
        updated_at: row.try_get("updated_at")?,
        last_trade_at: row.try_get("last_trade_at")?,
    })
}

fn orphan_from_row(row: &PgRow) -> Result<OrphanOrder> {
    let side: String = row.try_get("side")?;
    Ok(OrphanOrder {
        broker_order_id: row.try_get("broker_order_id")?,
        client_order_id: row.try_get("client_order_id")?,
        symbol: row.try_get("symbol")?,
        strategy_id: row.try_get("strategy_id")?,
        side: OrderSide::try_from(side.as_str()).map_err(TallyError::Internal)?,
        qty: row.try_get("qty")?,
        estimated_notional: row.try_get("estimated_notional")?,
        status: row.try_get("status")?,
        detected_at: row.try_get("detected_at")?,
        resolved_at: row.try_get("resolved_at")?,
    })
}

async fn insert_order<'e, E: PgExecutor<'e>>(executor: E, order: &Order) -> Result<Order> {
    let sql = format!(
        r#"
        INSERT INTO orders (
            client_order_id, strategy_id, parent_order_id, slice_num, total_slices,
            scheduled_time, symbol, side, qty, order_type, limit_price, stop_price,
            time_in_force, status, status_rank, is_terminal, metadata, created_at, updated_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, NOW(), NOW())
        RETURNING {ORDER_COLUMNS}
        "#
    );
    let row = sqlx::query(&sql)
        .bind(&order.client_order_id)
        .bind(&order.strategy_id)
        .bind(&order.parent_order_id)
        .bind(order.slice_num)
        .bind(order.total_slices)
        .bind(order.scheduled_time)
        .bind(&order.symbol)
        .bind(order.side.as_str())
        .bind(order.qty)
        .bind(order.order_type.as_str())
        .bind(order.limit_price)
        .bind(order.stop_price)
        .bind(order.time_in_force.as_str())
        .bind(order.status.as_str())
        .bind(order.status_rank)
        .bind(order.is_terminal)
        .bind(Json(&order.metadata))
        .fetch_one(executor)
        .await
        .map_err(|e| TallyError::from_insert(e, format!("order {}", order.client_order_id)))?;

    order_from_row(&row)
}

/// Single-statement compare-and-swap. The WHERE clause is the terminal lock
/// plus the tie-break chain of `ledger::cas`; the SET list is its merge.
async fn cas_update<'e, E: PgExecutor<'e>>(
    executor: E,
    update: &StatusUpdate,
) -> Result<Option<Order>> {
    let sql = format!(
        r#"
        UPDATE orders SET
            status = $2,
            status_rank = $3,
            is_terminal = $4,
            last_updated_at = $5,
            source_priority = $6,
            filled_avg_price = CASE
                WHEN $7::BIGINT IS NOT NULL AND $8::NUMERIC IS NOT NULL AND $7 >= filled_qty THEN $8
                ELSE filled_avg_price
            END,
            filled_qty = GREATEST(filled_qty, COALESCE($7, filled_qty)),
            filled_at = COALESCE(
                filled_at,
                CASE WHEN $2 = 'filled' AND $7::BIGINT IS NOT NULL THEN COALESCE($9, $5) END
            ),
            broker_order_id = COALESCE(broker_order_id, $10),
            broker_event_id = COALESCE(broker_event_id, $11),
            error_message = COALESCE($12, error_message),
            updated_at = NOW()
        WHERE client_order_id = $1
          AND (is_terminal = FALSE OR status = 'filled')
          AND (
                last_updated_at IS NULL
             OR $5 > last_updated_at
             OR ($5 = last_updated_at AND $3 > status_rank)
             OR ($5 = last_updated_at AND $3 = status_rank
                 AND COALESCE($7, filled_qty) > filled_qty)
             OR ($5 = last_updated_at AND $3 = status_rank
                 AND COALESCE($7, filled_qty) = filled_qty
                 AND $6 < COALESCE(source_priority, $13))
          )
        RETURNING {ORDER_COLUMNS}
        "#
    );
    let row = sqlx::query(&sql)
        .bind(&update.client_order_id)
        .bind(update.status.as_str())
        .bind(update.status_rank)
        .bind(update.status.is_terminal())
        .bind(update.event_timestamp)
        .bind(update.source_priority.value())
        .bind(update.filled_qty)
        .bind(update.filled_avg_price)
        .bind(update.filled_at)
        .bind(&update.broker_order_id)
        .bind(&update.broker_event_id)
        .bind(&update.error_message)
        .bind(UNSET_SOURCE_PRIORITY)
        .fetch_optional(executor)
        .await?;

    row.as_ref().map(order_from_row).transpose()
}

async fn append_fill_update<'e, E: PgExecutor<'e>>(
    executor: E,
    client_order_id: &str,
    fill: &FillRecord,
) -> Result<Option<Order>> {
    let sql = format!(
        r#"
        UPDATE orders SET
            metadata = jsonb_set(
                jsonb_set(
                    metadata,
                    '{{fills}}',
                    COALESCE(metadata->'fills', '[]'::jsonb) || jsonb_build_array($2::jsonb)
                ),
                '{{total_realized_pl}}',
                to_jsonb((COALESCE((metadata->>'total_realized_pl')::NUMERIC, 0) + $3)::TEXT)
            ),
            updated_at = NOW()
        WHERE client_order_id = $1
        RETURNING {ORDER_COLUMNS}
        "#
    );
    let row = sqlx::query(&sql)
        .bind(client_order_id)
        .bind(Json(fill))
        .bind(fill.realized_pl)
        .fetch_optional(executor)
        .await?;

    row.as_ref().map(order_from_row).transpose()
}

async fn lock_symbol(conn: &mut PgConnection, symbol: &str) -> Result<()> {
    sqlx::query("SELECT pg_advisory_xact_lock($1, hashtext($2))")
        .bind(SYMBOL_LOCK_NAMESPACE)
        .bind(symbol)
        .execute(conn)
        .await?;
    Ok(())
}

async fn select_position_for_update(
    conn: &mut PgConnection,
    symbol: &str,
) -> Result<Option<Position>> {
    let sql = format!("SELECT {POSITION_COLUMNS} FROM positions WHERE symbol = $1 FOR UPDATE");
    let row = sqlx::query(&sql)
        .bind(symbol)
        .fetch_optional(conn)
        .await?;
    row.as_ref().map(position_from_row).transpose()
}

async fn write_position(conn: &mut PgConnection, position: &Position) -> Result<Position> {
    let sql = format!(
        r#"
        INSERT INTO positions (symbol, qty, avg_entry_price, realized_pl, current_price, updated_at, last_trade_at)
        VALUES ($1, $2, $3, $4, $5, NOW(), $6)
        ON CONFLICT (symbol) DO UPDATE SET
            qty = EXCLUDED.qty,
            avg_entry_price = EXCLUDED.avg_entry_price,
            realized_pl = EXCLUDED.realized_pl,
            current_price = EXCLUDED.current_price,
            updated_at = NOW(),
            last_trade_at = EXCLUDED.last_trade_at
        RETURNING {POSITION_COLUMNS}
        "#
    );
    let row = sqlx::query(&sql)
        .bind(&position.symbol)
        .bind(position.qty)
        .bind(position.avg_entry_price)
        .bind(position.realized_pl)
        .bind(position.current_price)
        .bind(position.last_trade_at)
        .fetch_one(conn)
        .await?;
    position_from_row(&row)
}

/// Read-modify-write of one position; caller holds the symbol lock
async fn apply_fill_locked(
    conn: &mut PgConnection,
    symbol: &str,
    fill_qty: i64,
    fill_price: Decimal,
    side: OrderSide,
) -> Result<Position> {
    let now = Utc::now();
    let current = select_position_for_update(&mut *conn, symbol)
        .await?
        .unwrap_or_else(|| Position::flat(symbol, now));
    let (next, realized) = current.apply_fill(fill_qty, fill_price, side, now);
    debug!(symbol, qty = next.qty, %realized, "position updated from fill");
    write_position(conn, &next).await
}

/// PostgreSQL ledger store
#[derive(Clone)]
pub struct PostgresLedger {
    pool: PgPool,
}

impl PostgresLedger {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn begin_tx(&self) -> Result<PostgresTx> {
        let tx = self.pool.begin().await?;
        Ok(PostgresTx {
            tx,
            locked_symbols: HashSet::new(),
        })
    }
}

#[async_trait]
impl LedgerStore for PostgresLedger {
    #[instrument(skip(self, order), fields(client_order_id = %order.client_order_id))]
    async fn create_order(&self, order: &NewOrder) -> Result<Order> {
        order.validate().map_err(TallyError::Validation)?;
        insert_order(&self.pool, &Order::from_new(order.clone(), Utc::now())).await
    }

    #[instrument(skip(self, order), fields(client_order_id = %order.client_order_id))]
    async fn create_parent_order(&self, order: &NewOrder, total_slices: i32) -> Result<Order> {
        order.validate().map_err(TallyError::Validation)?;
        insert_order(&self.pool, &parent_row(order, total_slices)).await
    }

    #[instrument(skip(self, order, scheduled_time), fields(client_order_id = %order.client_order_id))]
    async fn create_child_slice(
        &self,
        order: &NewOrder,
        parent_order_id: &str,
        slice_num: i32,
        scheduled_time: Option<DateTime<Utc>>,
    ) -> Result<Order> {
        order.validate().map_err(TallyError::Validation)?;
        insert_order(
            &self.pool,
            &child_row(order, parent_order_id, slice_num, scheduled_time),
        )
        .await
    }

    async fn get_order(&self, client_order_id: &str) -> Result<Option<Order>> {
        let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE client_order_id = $1");
        let row = sqlx::query(&sql)
            .bind(client_order_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(order_from_row).transpose()
    }

    async fn existing_client_order_ids(
        &self,
        client_order_ids: &[String],
    ) -> Result<HashSet<String>> {
        if client_order_ids.is_empty() {
            return Ok(HashSet::new());
        }
        let rows = sqlx::query("SELECT client_order_id FROM orders WHERE client_order_id = ANY($1)")
            .bind(client_order_ids)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("client_order_id").map_err(Into::into))
            .collect()
    }

    async fn get_non_terminal_orders(
        &self,
        created_before: Option<DateTime<Utc>>,
    ) -> Result<Vec<Order>> {
        let sql = format!(
            r#"
            SELECT {ORDER_COLUMNS} FROM orders
            WHERE is_terminal = FALSE
              AND ($1::TIMESTAMPTZ IS NULL OR created_at < $1)
            ORDER BY created_at
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(created_before)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(order_from_row).collect()
    }

    async fn get_slices_by_parent(&self, parent_order_id: &str) -> Result<Vec<Order>> {
        let sql = format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE parent_order_id = $1 ORDER BY slice_num"
        );
        let rows = sqlx::query(&sql)
            .bind(parent_order_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(order_from_row).collect()
    }

    #[instrument(skip(self, update), fields(client_order_id = %update.client_order_id, status = %update.status))]
    async fn update_order_status_cas(&self, update: &StatusUpdate) -> Result<Option<Order>> {
        cas_update(&self.pool, update).await
    }

    #[instrument(skip(self, error_message))]
    async fn update_order_status(
        &self,
        client_order_id: &str,
        status: OrderStatus,
        error_message: Option<&str>,
    ) -> Result<Option<Order>> {
        let sql = format!(
            r#"
            UPDATE orders SET
                status = $2,
                status_rank = $3,
                is_terminal = $4,
                error_message = $5,
                updated_at = NOW()
            WHERE client_order_id = $1
              AND is_terminal = FALSE
              AND status_rank <= $3
            RETURNING {ORDER_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(client_order_id)
            .bind(status.as_str())
            .bind(status.rank())
            .bind(status.is_terminal())
            .bind(error_message)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(order_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn mark_submitted(
        &self,
        client_order_id: &str,
        broker_order_id: &str,
    ) -> Result<Option<Order>> {
        // Right-hand sides see pre-update values
        let sql = format!(
            r#"
            UPDATE orders SET
                status = CASE WHEN status_rank < 2 THEN 'submitted' ELSE status END,
                error_message = CASE WHEN status_rank < 2 THEN NULL ELSE error_message END,
                status_rank = GREATEST(status_rank, 2),
                broker_order_id = COALESCE(broker_order_id, $2),
                submitted_at = COALESCE(submitted_at, NOW()),
                updated_at = NOW()
            WHERE client_order_id = $1
              AND (is_terminal = FALSE OR status = 'filled')
            RETURNING {ORDER_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(client_order_id)
            .bind(broker_order_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(order_from_row).transpose()
    }

    async fn increment_retry_count(&self, client_order_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE orders SET retry_count = retry_count + 1, updated_at = NOW() WHERE client_order_id = $1",
        )
        .bind(client_order_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn cancel_pending_slices(&self, parent_order_id: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE orders SET
                status = 'canceled',
                status_rank = 4,
                is_terminal = TRUE,
                updated_at = NOW()
            WHERE parent_order_id = $1
              AND status = 'pending_new'
            "#,
        )
        .bind(parent_order_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self, fill), fields(fill_id = %fill.fill_id))]
    async fn append_fill(
        &self,
        client_order_id: &str,
        fill: &FillRecord,
    ) -> Result<Option<Order>> {
        append_fill_update(&self.pool, client_order_id, fill).await
    }

    #[instrument(skip(self))]
    async fn update_position_on_fill(
        &self,
        symbol: &str,
        fill_qty: i64,
        fill_price: Decimal,
        side: OrderSide,
    ) -> Result<Position> {
        let mut tx = self.pool.begin().await?;
        lock_symbol(&mut tx, symbol).await?;
        let position = apply_fill_locked(&mut tx, symbol, fill_qty, fill_price, side).await?;
        tx.commit().await?;
        Ok(position)
    }

    async fn get_position(&self, symbol: &str) -> Result<Option<Position>> {
        let sql = format!("SELECT {POSITION_COLUMNS} FROM positions WHERE symbol = $1");
        let row = sqlx::query(&sql)
            .bind(symbol)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(position_from_row).transpose()
    }

    async fn get_all_positions(&self) -> Result<Vec<Position>> {
        let sql = format!("SELECT {POSITION_COLUMNS} FROM positions ORDER BY symbol");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(position_from_row).collect()
    }

    #[instrument(skip(self, snapshot), fields(symbol = %snapshot.symbol, qty = snapshot.qty))]
    async fn upsert_position_snapshot(&self, snapshot: &PositionSnapshot) -> Result<Position> {
        let mut tx = self.pool.begin().await?;
        lock_symbol(&mut tx, &snapshot.symbol).await?;
        let sql = format!(
            r#"
            INSERT INTO positions (symbol, qty, avg_entry_price, current_price, updated_at)
            VALUES ($1, $2, CASE WHEN $2 = 0 THEN 0 ELSE $3 END, $4, NOW())
            ON CONFLICT (symbol) DO UPDATE SET
                qty = EXCLUDED.qty,
                avg_entry_price = EXCLUDED.avg_entry_price,
                current_price = EXCLUDED.current_price,
                updated_at = NOW()
            RETURNING {POSITION_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(&snapshot.symbol)
            .bind(snapshot.qty)
            .bind(snapshot.avg_entry_price)
            .bind(snapshot.current_price)
            .fetch_one(&mut *tx)
            .await?;
        let position = position_from_row(&row)?;
        tx.commit().await?;
        Ok(position)
    }

    #[instrument(skip(self, keep), fields(keep = keep.len()))]
    async fn flatten_positions_not_in(&self, keep: &[String]) -> Result<Vec<String>> {
        let mut tx = self.pool.begin().await?;
        let candidates = sqlx::query(
            "SELECT symbol FROM positions WHERE qty <> 0 AND NOT (symbol = ANY($1)) ORDER BY symbol",
        )
        .bind(keep)
        .fetch_all(&mut *tx)
        .await?;
        // Same symbol locks as the fill path, in a fixed order
        for row in &candidates {
            let symbol: String = row.try_get("symbol")?;
            lock_symbol(&mut tx, &symbol).await?;
        }
        let rows = sqlx::query(
            r#"
            UPDATE positions SET
                qty = 0,
                avg_entry_price = 0,
                updated_at = NOW()
            WHERE qty <> 0
              AND NOT (symbol = ANY($1))
            RETURNING symbol
            "#,
        )
        .bind(keep)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;
        let mut symbols = rows
            .iter()
            .map(|r| r.try_get::<String, _>("symbol"))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        symbols.sort();
        Ok(symbols)
    }

    #[instrument(skip(self, orphan), fields(broker_order_id = %orphan.broker_order_id))]
    async fn upsert_orphan(&self, orphan: &OrphanOrder) -> Result<bool> {
        let row = sqlx::query(
            r#"
            INSERT INTO orphan_orders (
                broker_order_id, client_order_id, symbol, strategy_id, side, qty,
                estimated_notional, status, detected_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (broker_order_id) DO UPDATE SET
                status = EXCLUDED.status
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(&orphan.broker_order_id)
        .bind(&orphan.client_order_id)
        .bind(&orphan.symbol)
        .bind(&orphan.strategy_id)
        .bind(orphan.side.as_str())
        .bind(orphan.qty)
        .bind(orphan.estimated_notional)
        .bind(&orphan.status)
        .bind(orphan.detected_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("inserted")?)
    }

    async fn resolve_orphan(
        &self,
        broker_order_id: &str,
        status: &str,
        resolved_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE orphan_orders SET status = $2, resolved_at = $3
            WHERE broker_order_id = $1 AND resolved_at IS NULL
            "#,
        )
        .bind(broker_order_id)
        .bind(status)
        .bind(resolved_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_orphans(&self, include_resolved: bool) -> Result<Vec<OrphanOrder>> {
        let sql = format!(
            r#"
            SELECT {ORPHAN_COLUMNS} FROM orphan_orders
            WHERE $1 OR resolved_at IS NULL
            ORDER BY detected_at
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(include_resolved)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(orphan_from_row).collect()
    }

    async fn get_high_water_mark(&self, name: &str) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            "SELECT last_check_time FROM reconciliation_high_water_marks WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row
            .map(|r| r.try_get::<DateTime<Utc>, _>("last_check_time"))
            .transpose()?)
    }

    #[instrument(skip(self))]
    async fn set_high_water_mark(&self, name: &str, at: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let row = sqlx::query(
            r#"
            INSERT INTO reconciliation_high_water_marks (name, last_check_time, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (name) DO UPDATE SET
                last_check_time = GREATEST(
                    reconciliation_high_water_marks.last_check_time,
                    EXCLUDED.last_check_time
                ),
                updated_at = NOW()
            RETURNING last_check_time
            "#,
        )
        .bind(name)
        .bind(at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("last_check_time")?)
    }

    #[instrument(skip(self, at))]
    async fn quarantine_symbol(
        &self,
        strategy_id: &str,
        symbol: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO symbol_quarantine (strategy_id, symbol, quarantined_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (strategy_id, symbol) DO NOTHING
            "#,
        )
        .bind(strategy_id)
        .bind(symbol)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn is_symbol_quarantined(&self, strategy_id: &str, symbol: &str) -> Result<bool> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM symbol_quarantine
                WHERE symbol = $2 AND strategy_id IN ($1, $3)
            ) AS quarantined
            "#,
        )
        .bind(strategy_id)
        .bind(symbol)
        .bind(QUARANTINE_ALL_STRATEGIES)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("quarantined")?)
    }

    #[instrument(skip(self))]
    async fn clear_quarantine(&self, strategy_id: &str, symbol: &str) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM symbol_quarantine WHERE strategy_id = $1 AND symbol = $2")
                .bind(strategy_id)
                .bind(symbol)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_quarantine(&self) -> Result<Vec<QuarantineEntry>> {
        let rows = sqlx::query(
            "SELECT strategy_id, symbol, quarantined_at FROM symbol_quarantine ORDER BY symbol, strategy_id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| {
                Ok(QuarantineEntry {
                    strategy_id: r.try_get("strategy_id")?,
                    symbol: r.try_get("symbol")?,
                    quarantined_at: r.try_get("quarantined_at")?,
                })
            })
            .collect()
    }

    async fn begin(&self) -> Result<Box<dyn LedgerTx>> {
        Ok(Box::new(self.begin_tx().await?))
    }
}

/// Open PostgreSQL transaction. Row locks and advisory locks are released
/// by commit or rollback; sqlx rolls back on drop.
pub struct PostgresTx {
    tx: Transaction<'static, Postgres>,
    locked_symbols: HashSet<String>,
}

#[async_trait]
impl LedgerTx for PostgresTx {
    async fn create_parent_order(&mut self, order: &NewOrder, total_slices: i32) -> Result<Order> {
        order.validate().map_err(TallyError::Validation)?;
        insert_order(&mut *self.tx, &parent_row(order, total_slices)).await
    }

    async fn create_child_slice(
        &mut self,
        order: &NewOrder,
        parent_order_id: &str,
        slice_num: i32,
        scheduled_time: Option<DateTime<Utc>>,
    ) -> Result<Order> {
        order.validate().map_err(TallyError::Validation)?;
        insert_order(
            &mut *self.tx,
            &child_row(order, parent_order_id, slice_num, scheduled_time),
        )
        .await
    }

    async fn get_order_for_update(&mut self, client_order_id: &str) -> Result<Option<Order>> {
        let sql = format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE client_order_id = $1 FOR UPDATE"
        );
        let row = sqlx::query(&sql)
            .bind(client_order_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(order_from_row).transpose()
    }

    async fn get_position_for_update(&mut self, symbol: &str) -> Result<Option<Position>> {
        if !self.locked_symbols.contains(symbol) {
            lock_symbol(&mut self.tx, symbol).await?;
            self.locked_symbols.insert(symbol.to_string());
        }
        select_position_for_update(&mut self.tx, symbol).await
    }

    async fn update_position_on_fill(
        &mut self,
        symbol: &str,
        fill_qty: i64,
        fill_price: Decimal,
        side: OrderSide,
    ) -> Result<Position> {
        if !self.locked_symbols.contains(symbol) {
            return Err(symbol_lock_missing(symbol));
        }
        apply_fill_locked(&mut self.tx, symbol, fill_qty, fill_price, side).await
    }

    async fn append_fill(
        &mut self,
        client_order_id: &str,
        fill: &FillRecord,
    ) -> Result<Option<Order>> {
        append_fill_update(&mut *self.tx, client_order_id, fill).await
    }

    async fn update_order_status_cas(&mut self, update: &StatusUpdate) -> Result<Option<Order>> {
        cas_update(&mut *self.tx, update).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
