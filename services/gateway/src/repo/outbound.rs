//! The durable outbound queue.
//!
//! Rows are owned by the queue alone. The dispatcher reads, marks sent, and
//! finishes with done or failed; a failure below `max_retry` re-queues the
//! row with an exponential backoff on `not_before`.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

pub const STATUS_PENDING: i16 = 0;
pub const STATUS_SENT: i16 = 1;
pub const STATUS_DONE: i16 = 2;
pub const STATUS_FAILED: i16 = 3;

pub const DEFAULT_MAX_RETRY: i32 = 3;
pub const DEFAULT_TIMEOUT_MS: i32 = 5_000;

const COLUMNS: &str = "id, device_internal_id, phy_id, correlation_id, command_bytes, priority, \
                       status, retry_count, max_retry, not_before, timeout_ms, last_error, \
                       created_at, updated_at";

#[derive(Debug, Clone)]
pub struct OutboundRow {
    pub id: i64,
    pub device_internal_id: i64,
    pub phy_id: String,
    pub correlation_id: Option<String>,
    pub command_bytes: Vec<u8>,
    pub priority: i32,
    pub status: i16,
    pub retry_count: i32,
    pub max_retry: i32,
    pub not_before: DateTime<Utc>,
    pub timeout_ms: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn from_row(row: &PgRow) -> OutboundRow {
    OutboundRow {
        id: row.get("id"),
        device_internal_id: row.get("device_internal_id"),
        phy_id: row.get("phy_id"),
        correlation_id: row.get("correlation_id"),
        command_bytes: row.get("command_bytes"),
        priority: row.get("priority"),
        status: row.get("status"),
        retry_count: row.get("retry_count"),
        max_retry: row.get("max_retry"),
        not_before: row.get("not_before"),
        timeout_ms: row.get("timeout_ms"),
        last_error: row.get("last_error"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

#[derive(Debug, Clone)]
pub struct NewOutbound {
    pub device_internal_id: i64,
    pub phy_id: String,
    pub command_bytes: Vec<u8>,
    pub priority: i32,
    pub max_retry: i32,
    pub not_before: Option<DateTime<Utc>>,
    pub timeout_ms: i32,
}

impl NewOutbound {
    pub fn new(device_internal_id: i64, phy_id: &str, command_bytes: Vec<u8>) -> NewOutbound {
        NewOutbound {
            device_internal_id,
            phy_id: phy_id.to_owned(),
            command_bytes,
            priority: 100,
            max_retry: DEFAULT_MAX_RETRY,
            not_before: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    pub fn priority(mut self, priority: i32) -> NewOutbound {
        self.priority = priority;
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: i32) -> NewOutbound {
        self.timeout_ms = timeout_ms;
        self
    }
}

pub async fn enqueue(pool: &PgPool, msg: &NewOutbound) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        "INSERT INTO outbound_queue
             (device_internal_id, phy_id, command_bytes, priority, max_retry, not_before,
              timeout_ms)
         VALUES ($1, $2, $3, $4, $5, COALESCE($6, now()), $7)
         RETURNING id",
    )
    .bind(msg.device_internal_id)
    .bind(&msg.phy_id)
    .bind(&msg.command_bytes)
    .bind(msg.priority)
    .bind(msg.max_retry)
    .bind(msg.not_before)
    .bind(msg.timeout_ms)
    .fetch_one(pool)
    .await
}

/// Insert guarded by the unique `correlation_id`. Returns `(id, created)`;
/// a second call with the same correlation id returns the original row's id.
pub async fn enqueue_idempotent(
    pool: &PgPool,
    correlation_id: &str,
    msg: &NewOutbound,
) -> Result<(i64, bool), sqlx::Error> {
    let inserted = sqlx::query_scalar::<_, i64>(
        "INSERT INTO outbound_queue
             (device_internal_id, phy_id, correlation_id, command_bytes, priority, max_retry,
              not_before, timeout_ms)
         VALUES ($1, $2, $3, $4, $5, $6, COALESCE($7, now()), $8)
         ON CONFLICT (correlation_id) DO NOTHING
         RETURNING id",
    )
    .bind(msg.device_internal_id)
    .bind(&msg.phy_id)
    .bind(correlation_id)
    .bind(&msg.command_bytes)
    .bind(msg.priority)
    .bind(msg.max_retry)
    .bind(msg.not_before)
    .bind(msg.timeout_ms)
    .fetch_optional(pool)
    .await?;

    match inserted {
        Some(id) => Ok((id, true)),
        None => {
            let id = sqlx::query_scalar::<_, i64>(
                "SELECT id FROM outbound_queue WHERE correlation_id = $1",
            )
            .bind(correlation_id)
            .fetch_one(pool)
            .await?;
            Ok((id, false))
        }
    }
}

/// Ripe pending messages for one device, most urgent first.
pub async fn dequeue_for_device(
    pool: &PgPool,
    device_internal_id: i64,
    max: i64,
) -> Result<Vec<OutboundRow>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM outbound_queue
         WHERE device_internal_id = $1 AND status = 0 AND not_before <= now()
         ORDER BY priority ASC, created_at ASC
         LIMIT $2"
    ))
    .bind(device_internal_id)
    .bind(max)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(from_row).collect())
}

pub async fn mark_sent(pool: &PgPool, id: i64) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE outbound_queue SET status = 1, updated_at = now()
         WHERE id = $1 AND status = 0",
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn mark_done(pool: &PgPool, id: i64) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE outbound_queue SET status = 2, updated_at = now()
         WHERE id = $1 AND status IN (0, 1)",
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Record a delivery failure. Below `max_retry` the row goes back to pending
/// with `not_before = now + backoff`; otherwise it fails permanently.
/// Returns the resulting status, or `None` when the row was not in a
/// failable state (already done or failed).
pub async fn mark_failed(pool: &PgPool, id: i64, error: &str) -> Result<Option<i16>, sqlx::Error> {
    sqlx::query_scalar::<_, i16>(
        "UPDATE outbound_queue
         SET retry_count = retry_count + 1,
             last_error = $2,
             status = CASE WHEN retry_count + 1 < max_retry THEN 0 ELSE 3 END,
             not_before = now() + make_interval(secs => LEAST(power(2, retry_count), 30)),
             updated_at = now()
         WHERE id = $1 AND status IN (0, 1)
         RETURNING status",
    )
    .bind(id)
    .bind(error)
    .fetch_optional(pool)
    .await
}

/// Devices with at least one ripe pending message.
pub async fn devices_with_pending(pool: &PgPool) -> Result<Vec<(i64, String)>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT DISTINCT device_internal_id, phy_id FROM outbound_queue
         WHERE status = 0 AND not_before <= now()",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows
        .iter()
        .map(|row| (row.get("device_internal_id"), row.get("phy_id")))
        .collect())
}

pub async fn get(pool: &PgPool, id: i64) -> Result<Option<OutboundRow>, sqlx::Error> {
    let row = sqlx::query(&format!("SELECT {COLUMNS} FROM outbound_queue WHERE id = $1"))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(from_row))
}
