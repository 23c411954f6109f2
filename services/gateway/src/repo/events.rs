//! The durable event table.
//!
//! One row per (subject, sequence_no); order-scoped events use the order
//! number as subject, device-scoped events the gateway phy id. Sequence
//! numbers are dense from 1 within a subject, allocated with `MAX+1` under
//! the unique constraint; an insert race retries.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

pub const STATUS_PENDING: i16 = 0;
pub const STATUS_PUSHED: i16 = 1;
pub const STATUS_FAILED: i16 = 2;

pub const MAX_PUSH_RETRIES: i32 = 5;

const COLUMNS: &str = "id, order_no, sequence_no, event_type, payload_json, status, retry_count, \
                       pushed_at, error_message, test_session_id, next_attempt_at, created_at";

#[derive(Debug, Clone)]
pub struct EventRow {
    pub id: i64,
    pub order_no: String,
    pub sequence_no: i64,
    pub event_type: String,
    pub payload_json: serde_json::Value,
    pub status: i16,
    pub retry_count: i32,
    pub pushed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub test_session_id: Option<String>,
    pub next_attempt_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

fn from_row(row: &PgRow) -> EventRow {
    EventRow {
        id: row.get("id"),
        order_no: row.get("order_no"),
        sequence_no: row.get("sequence_no"),
        event_type: row.get("event_type"),
        payload_json: row.get("payload_json"),
        status: row.get("status"),
        retry_count: row.get("retry_count"),
        pushed_at: row.get("pushed_at"),
        error_message: row.get("error_message"),
        test_session_id: row.get("test_session_id"),
        next_attempt_at: row.get("next_attempt_at"),
        created_at: row.get("created_at"),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db)
            if matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation)
    )
}

/// Append an event with the next sequence number for its subject.
pub async fn append(
    pool: &PgPool,
    subject: &str,
    event_type: &str,
    payload: &serde_json::Value,
    test_session_id: Option<&str>,
) -> Result<i64, sqlx::Error> {
    let mut last_err = None;
    // Two writers may compute the same MAX+1; the unique constraint breaks
    // the tie and the loser recomputes.
    for _ in 0..3 {
        let result = sqlx::query_scalar::<_, i64>(
            "INSERT INTO events (order_no, sequence_no, event_type, payload_json, test_session_id)
             SELECT $1, COALESCE(MAX(sequence_no), 0) + 1, $2, $3, $4
             FROM events WHERE order_no = $1
             RETURNING sequence_no",
        )
        .bind(subject)
        .bind(event_type)
        .bind(payload)
        .bind(test_session_id)
        .fetch_one(pool)
        .await;
        match result {
            Ok(seq) => return Ok(seq),
            Err(err) if is_unique_violation(&err) => last_err = Some(err),
            Err(err) => return Err(err),
        }
    }
    Err(last_err.unwrap_or(sqlx::Error::RowNotFound))
}

/// Deliverable events in (subject, sequence) order.
///
/// An earlier unpushed-but-retryable event blocks everything after it for
/// the same subject, even while it waits out its backoff; a parked event
/// (five failures) stops blocking.
pub async fn fetch_pushable(pool: &PgPool, limit: i64) -> Result<Vec<EventRow>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM events e
         WHERE e.status IN (0, 2) AND e.retry_count < $2 AND e.next_attempt_at <= now()
           AND NOT EXISTS (
               SELECT 1 FROM events b
               WHERE b.order_no = e.order_no
                 AND b.sequence_no < e.sequence_no
                 AND b.status IN (0, 2)
                 AND b.retry_count < $2
           )
         ORDER BY e.order_no, e.sequence_no
         LIMIT $1"
    ))
    .bind(limit)
    .bind(MAX_PUSH_RETRIES)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(from_row).collect())
}

pub async fn mark_pushed(pool: &PgPool, id: i64) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE events SET status = 1, pushed_at = now() WHERE id = $1 AND status IN (0, 2)",
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn mark_push_failed(pool: &PgPool, id: i64, error: &str) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE events
         SET status = 2, retry_count = retry_count + 1, error_message = $2,
             next_attempt_at = now() + make_interval(secs => LEAST(power(2, retry_count) * 2, 60))
         WHERE id = $1 AND status IN (0, 2)",
    )
    .bind(id)
    .bind(error)
    .execute(pool)
    .await?;
    Ok(())
}

/// All events of one subject in sequence order (read API / tests).
pub async fn list_for_subject(
    pool: &PgPool,
    subject: &str,
) -> Result<Vec<EventRow>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM events WHERE order_no = $1 ORDER BY sequence_no"
    ))
    .bind(subject)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(from_row).collect())
}
