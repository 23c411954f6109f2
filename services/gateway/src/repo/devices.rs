//! Device rows: one per physical gateway, created on first contact, never
//! destroyed.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

#[derive(Debug, Clone)]
pub struct DeviceRow {
    pub internal_id: i64,
    pub phy_id: String,
    pub last_seen_at: Option<DateTime<Utc>>,
}

fn from_row(row: &sqlx::postgres::PgRow) -> DeviceRow {
    DeviceRow {
        internal_id: row.get("internal_id"),
        phy_id: row.get("phy_id"),
        last_seen_at: row.get("last_seen_at"),
    }
}

/// Idempotent insert by `phy_id`; returns the internal id either way.
pub async fn ensure(pool: &PgPool, phy_id: &str) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        "INSERT INTO devices (phy_id) VALUES ($1)
         ON CONFLICT (phy_id) DO UPDATE SET phy_id = EXCLUDED.phy_id
         RETURNING internal_id",
    )
    .bind(phy_id)
    .fetch_one(pool)
    .await
}

pub async fn touch_last_seen(
    pool: &PgPool,
    internal_id: i64,
    t: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE devices SET last_seen_at = $2
         WHERE internal_id = $1 AND (last_seen_at IS NULL OR last_seen_at < $2)",
    )
    .bind(internal_id)
    .bind(t)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_by_phy(pool: &PgPool, phy_id: &str) -> Result<Option<DeviceRow>, sqlx::Error> {
    let row = sqlx::query("SELECT internal_id, phy_id, last_seen_at FROM devices WHERE phy_id = $1")
        .bind(phy_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(from_row))
}

pub async fn get_by_id(pool: &PgPool, internal_id: i64) -> Result<Option<DeviceRow>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT internal_id, phy_id, last_seen_at FROM devices WHERE internal_id = $1",
    )
    .bind(internal_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.as_ref().map(from_row))
}
