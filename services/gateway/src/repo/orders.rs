//! Order rows and their guarded state transitions.
//!
//! Every transition is a compare-and-set: `WHERE status = ANY(legal_prev)`.
//! Zero rows affected is the normal answer when a concurrent writer got
//! there first, never an error.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use crate::orders::OrderStatus;

const COLUMNS: &str = "id, order_no, business_no, device_internal_id, port_no, charge_mode, \
                       amount_cent, duration_min, power_w, status, end_reason, start_time, \
                       end_time, kwh_0p01, test_session_id, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct OrderRow {
    pub id: i64,
    pub order_no: String,
    pub business_no: i32,
    pub device_internal_id: i64,
    pub port_no: i32,
    pub charge_mode: i16,
    pub amount_cent: Option<i64>,
    pub duration_min: Option<i32>,
    pub power_w: Option<i32>,
    pub status: OrderStatus,
    pub end_reason: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub kwh_0p01: Option<i64>,
    pub test_session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
#[error("order row carries unknown status {0}")]
struct UnknownStatus(i16);

fn from_row(row: &PgRow) -> Result<OrderRow, sqlx::Error> {
    let raw_status: i16 = row.get("status");
    let status = OrderStatus::from_i16(raw_status)
        .ok_or_else(|| sqlx::Error::Decode(Box::new(UnknownStatus(raw_status))))?;
    Ok(OrderRow {
        id: row.get("id"),
        order_no: row.get("order_no"),
        business_no: row.get("business_no"),
        device_internal_id: row.get("device_internal_id"),
        port_no: row.get("port_no"),
        charge_mode: row.get("charge_mode"),
        amount_cent: row.get("amount_cent"),
        duration_min: row.get("duration_min"),
        power_w: row.get("power_w"),
        status,
        end_reason: row.get("end_reason"),
        start_time: row.get("start_time"),
        end_time: row.get("end_time"),
        kwh_0p01: row.get("kwh_0p01"),
        test_session_id: row.get("test_session_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn rows_to_orders(rows: Vec<PgRow>) -> Result<Vec<OrderRow>, sqlx::Error> {
    rows.iter().map(from_row).collect()
}

fn statuses(set: &[OrderStatus]) -> Vec<i16> {
    set.iter().map(|s| s.as_i16()).collect()
}

// ---------------------------------------------------------------------------
// Creation and lookup
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NewOrder {
    pub order_no: String,
    pub business_no: u16,
    pub device_internal_id: i64,
    pub port_no: i32,
    pub charge_mode: i16,
    pub amount_cent: Option<i64>,
    pub duration_min: Option<i32>,
    pub power_w: Option<i32>,
    pub test_session_id: Option<String>,
}

pub async fn insert(pool: &PgPool, order: &NewOrder) -> Result<OrderRow, sqlx::Error> {
    let row = sqlx::query(&format!(
        "INSERT INTO orders (order_no, business_no, device_internal_id, port_no, charge_mode, \
                             amount_cent, duration_min, power_w, test_session_id)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
         RETURNING {COLUMNS}"
    ))
    .bind(&order.order_no)
    .bind(i32::from(order.business_no))
    .bind(order.device_internal_id)
    .bind(order.port_no)
    .bind(order.charge_mode)
    .bind(order.amount_cent)
    .bind(order.duration_min)
    .bind(order.power_w)
    .bind(&order.test_session_id)
    .fetch_one(pool)
    .await?;
    from_row(&row)
}

pub async fn get_by_order_no(
    pool: &PgPool,
    order_no: &str,
) -> Result<Option<OrderRow>, sqlx::Error> {
    let row = sqlx::query(&format!("SELECT {COLUMNS} FROM orders WHERE order_no = $1"))
        .bind(order_no)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(from_row).transpose()
}

/// The current holder of the (device, port) reservation, if any.
pub async fn find_active_for_port(
    pool: &PgPool,
    device_internal_id: i64,
    port_no: i32,
) -> Result<Option<OrderRow>, sqlx::Error> {
    let row = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM orders
         WHERE device_internal_id = $1 AND port_no = $2 AND status = ANY($3)
         ORDER BY created_at DESC LIMIT 1"
    ))
    .bind(device_internal_id)
    .bind(port_no)
    .bind(statuses(&OrderStatus::ACTIVE))
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(from_row).transpose()
}

/// Business-number collisions resolve to the latest-created active order.
pub async fn find_active_by_business(
    pool: &PgPool,
    device_internal_id: i64,
    business_no: i32,
) -> Result<Option<OrderRow>, sqlx::Error> {
    let row = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM orders
         WHERE device_internal_id = $1 AND business_no = $2 AND status = ANY($3)
         ORDER BY created_at DESC LIMIT 1"
    ))
    .bind(device_internal_id)
    .bind(business_no)
    .bind(statuses(&OrderStatus::ACTIVE))
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(from_row).transpose()
}

#[derive(Debug, Clone, Default)]
pub struct OrderFilter {
    pub device_internal_id: Option<i64>,
    pub status: Option<OrderStatus>,
    pub limit: i64,
    pub offset: i64,
}

pub async fn list(pool: &PgPool, filter: &OrderFilter) -> Result<(Vec<OrderRow>, i64), sqlx::Error> {
    let rows = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM orders
         WHERE ($1::bigint IS NULL OR device_internal_id = $1)
           AND ($2::smallint IS NULL OR status = $2)
         ORDER BY created_at DESC, id DESC
         LIMIT $3 OFFSET $4"
    ))
    .bind(filter.device_internal_id)
    .bind(filter.status.map(OrderStatus::as_i16))
    .bind(filter.limit)
    .bind(filter.offset)
    .fetch_all(pool)
    .await?;

    let total = sqlx::query_scalar::<_, i64>(
        "SELECT count(*) FROM orders
         WHERE ($1::bigint IS NULL OR device_internal_id = $1)
           AND ($2::smallint IS NULL OR status = $2)",
    )
    .bind(filter.device_internal_id)
    .bind(filter.status.map(OrderStatus::as_i16))
    .fetch_one(pool)
    .await?;

    Ok((rows_to_orders(rows)?, total))
}

// ---------------------------------------------------------------------------
// Guarded transitions
// ---------------------------------------------------------------------------

/// pending → confirmed, on a timely success ACK.
pub async fn mark_confirmed(pool: &PgPool, id: i64) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE orders SET status = 1, updated_at = now() WHERE id = $1 AND status = 0",
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// pending → failed, on a rejection ACK.
pub async fn mark_failed_ack(pool: &PgPool, id: i64, reason: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE orders SET status = 6, end_reason = $2, end_time = now(), updated_at = now()
         WHERE id = $1 AND status = 0",
    )
    .bind(id)
    .bind(reason)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// confirmed → charging, on the first status frame showing the port live.
pub async fn mark_charging(pool: &PgPool, id: i64) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE orders
         SET status = 2, start_time = COALESCE(start_time, now()), updated_at = now()
         WHERE id = $1 AND status = 1",
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// interrupted → charging, only inside the recovery window.
pub async fn recover_interrupted(
    pool: &PgPool,
    id: i64,
    window: Duration,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE orders SET status = 2, updated_at = now()
         WHERE id = $1 AND status = 10
           AND updated_at >= now() - make_interval(secs => $2)",
    )
    .bind(id)
    .bind(window.as_secs_f64())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// charging → stopping (API stop).
pub async fn mark_stopping(pool: &PgPool, id: i64) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE orders SET status = 9, updated_at = now() WHERE id = $1 AND status = 2",
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// pending → cancelling (API cancel before the ACK).
pub async fn mark_cancelling(pool: &PgPool, id: i64) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE orders SET status = 8, updated_at = now() WHERE id = $1 AND status = 0",
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Drive an order into a terminal state with settlement data.
pub async fn settle(
    pool: &PgPool,
    id: i64,
    to: OrderStatus,
    from: &[OrderStatus],
    kwh_0p01: Option<i64>,
    end_reason: &str,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE orders
         SET status = $2, kwh_0p01 = COALESCE($3, kwh_0p01), end_reason = $4,
             end_time = now(), updated_at = now()
         WHERE id = $1 AND status = ANY($5)",
    )
    .bind(id)
    .bind(to.as_i16())
    .bind(kwh_0p01)
    .bind(end_reason)
    .bind(statuses(from))
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

fn interrupted_from_row(row: &PgRow) -> Result<(OrderStatus, OrderRow), sqlx::Error> {
    let prev: i16 = row.get("prev_status");
    let prev = OrderStatus::from_i16(prev)
        .ok_or_else(|| sqlx::Error::Decode(Box::new(UnknownStatus(prev))))?;
    Ok((prev, from_row(row)?))
}

/// Bulk {confirmed, charging} → interrupted for one device (connection
/// lost). Returns each row with the state it was interrupted from.
pub async fn interrupt_for_device(
    pool: &PgPool,
    device_internal_id: i64,
) -> Result<Vec<(OrderStatus, OrderRow)>, sqlx::Error> {
    let rows = sqlx::query(
        "WITH prev AS (
             SELECT id, status FROM orders
             WHERE device_internal_id = $1 AND status IN (1, 2)
         )
         UPDATE orders SET status = 10, updated_at = now()
         FROM prev
         WHERE orders.id = prev.id AND orders.status IN (1, 2)
         RETURNING orders.*, prev.status AS prev_status",
    )
    .bind(device_internal_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(interrupted_from_row).collect()
}

// ---------------------------------------------------------------------------
// Reconciler sweeps
// ---------------------------------------------------------------------------

/// pending older than the window → timeout.
pub async fn sweep_pending_timeout(
    pool: &PgPool,
    older_than: Duration,
) -> Result<Vec<OrderRow>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        "UPDATE orders SET status = 4, end_reason = 'pending_timeout', end_time = now(),
                           updated_at = now()
         WHERE status = 0 AND created_at < now() - make_interval(secs => $1)
         RETURNING {COLUMNS}"
    ))
    .bind(older_than.as_secs_f64())
    .fetch_all(pool)
    .await?;
    rows_to_orders(rows)
}

/// The pre-reservation sweep, scoped to one device.
pub async fn sweep_stale_pending_for_device(
    pool: &PgPool,
    device_internal_id: i64,
    older_than: Duration,
) -> Result<Vec<OrderRow>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        "UPDATE orders SET status = 4, end_reason = 'pending_timeout', end_time = now(),
                           updated_at = now()
         WHERE device_internal_id = $1 AND status = 0
           AND created_at < now() - make_interval(secs => $2)
         RETURNING {COLUMNS}"
    ))
    .bind(device_internal_id)
    .bind(older_than.as_secs_f64())
    .fetch_all(pool)
    .await?;
    rows_to_orders(rows)
}

/// {confirmed, charging} on silent devices → interrupted.
pub async fn sweep_interrupt_stale_devices(
    pool: &PgPool,
    stale_after: Duration,
) -> Result<Vec<(OrderStatus, OrderRow)>, sqlx::Error> {
    let rows = sqlx::query(
        "WITH prev AS (
             SELECT id, status FROM orders
             WHERE status IN (1, 2)
               AND device_internal_id IN (
                   SELECT internal_id FROM devices
                   WHERE last_seen_at IS NULL
                      OR last_seen_at < now() - make_interval(secs => $1)
               )
         )
         UPDATE orders SET status = 10, updated_at = now()
         FROM prev
         WHERE orders.id = prev.id AND orders.status IN (1, 2)
         RETURNING orders.*, prev.status AS prev_status",
    )
    .bind(stale_after.as_secs_f64())
    .fetch_all(pool)
    .await?;
    rows.iter().map(interrupted_from_row).collect()
}

/// interrupted beyond the recovery window → failed.
pub async fn sweep_recovery_timeout(
    pool: &PgPool,
    window: Duration,
) -> Result<Vec<OrderRow>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        "UPDATE orders SET status = 6, end_reason = 'recovery_timeout', end_time = now(),
                           updated_at = now()
         WHERE status = 10 AND updated_at < now() - make_interval(secs => $1)
         RETURNING {COLUMNS}"
    ))
    .bind(window.as_secs_f64())
    .fetch_all(pool)
    .await?;
    rows_to_orders(rows)
}

/// cancelling stuck past the window → cancelled, ACK or not.
pub async fn sweep_cancelling_timeout(
    pool: &PgPool,
    older_than: Duration,
) -> Result<Vec<OrderRow>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        "UPDATE orders SET status = 5, end_reason = 'cancel_timeout', end_time = now(),
                           updated_at = now()
         WHERE status = 8 AND updated_at < now() - make_interval(secs => $1)
         RETURNING {COLUMNS}"
    ))
    .bind(older_than.as_secs_f64())
    .fetch_all(pool)
    .await?;
    rows_to_orders(rows)
}

/// stopping stuck past the window → stopped.
pub async fn sweep_stopping_timeout(
    pool: &PgPool,
    older_than: Duration,
) -> Result<Vec<OrderRow>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        "UPDATE orders SET status = 7, end_reason = 'stop_timeout', end_time = now(),
                           updated_at = now()
         WHERE status = 9 AND updated_at < now() - make_interval(secs => $1)
         RETURNING {COLUMNS}"
    ))
    .bind(older_than.as_secs_f64())
    .fetch_all(pool)
    .await?;
    rows_to_orders(rows)
}

/// confirmed that never began charging → timeout.
pub async fn sweep_confirmed_timeout(
    pool: &PgPool,
    older_than: Duration,
) -> Result<Vec<OrderRow>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        "UPDATE orders SET status = 4, end_reason = 'confirm_timeout', end_time = now(),
                           updated_at = now()
         WHERE status = 1 AND updated_at < now() - make_interval(secs => $1)
         RETURNING {COLUMNS}"
    ))
    .bind(older_than.as_secs_f64())
    .fetch_all(pool)
    .await?;
    rows_to_orders(rows)
}
