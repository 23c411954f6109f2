//! Port rows, created lazily when a status frame first mentions them.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

#[derive(Debug, Clone)]
pub struct PortRow {
    pub device_internal_id: i64,
    pub port_no: i32,
    pub status_bits: i16,
    pub power_w: Option<i32>,
    pub updated_at: DateTime<Utc>,
}

impl PortRow {
    pub fn bits(&self) -> u8 {
        self.status_bits as u8
    }
}

fn from_row(row: &sqlx::postgres::PgRow) -> PortRow {
    PortRow {
        device_internal_id: row.get("device_internal_id"),
        port_no: row.get("port_no"),
        status_bits: row.get("status_bits"),
        power_w: row.get("power_w"),
        updated_at: row.get("updated_at"),
    }
}

/// Write a reading; returns the previous status bits, `None` when the port
/// row did not exist yet.
pub async fn upsert_status(
    pool: &PgPool,
    device_internal_id: i64,
    port_no: i32,
    status_bits: u8,
    power_w: Option<i32>,
) -> Result<Option<u8>, sqlx::Error> {
    let previous = sqlx::query_scalar::<_, i16>(
        "SELECT status_bits FROM ports WHERE device_internal_id = $1 AND port_no = $2",
    )
    .bind(device_internal_id)
    .bind(port_no)
    .fetch_optional(pool)
    .await?;

    sqlx::query(
        "INSERT INTO ports (device_internal_id, port_no, status_bits, power_w, updated_at)
         VALUES ($1, $2, $3, $4, now())
         ON CONFLICT (device_internal_id, port_no)
         DO UPDATE SET status_bits = EXCLUDED.status_bits,
                       power_w = EXCLUDED.power_w,
                       updated_at = now()",
    )
    .bind(device_internal_id)
    .bind(port_no)
    .bind(i16::from(status_bits))
    .bind(power_w)
    .execute(pool)
    .await?;

    Ok(previous.map(|bits| bits as u8))
}

pub async fn get(
    pool: &PgPool,
    device_internal_id: i64,
    port_no: i32,
) -> Result<Option<PortRow>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT device_internal_id, port_no, status_bits, power_w, updated_at
         FROM ports WHERE device_internal_id = $1 AND port_no = $2",
    )
    .bind(device_internal_id)
    .bind(port_no)
    .fetch_optional(pool)
    .await?;
    Ok(row.as_ref().map(from_row))
}

pub async fn list_for_device(
    pool: &PgPool,
    device_internal_id: i64,
) -> Result<Vec<PortRow>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT device_internal_id, port_no, status_bits, power_w, updated_at
         FROM ports WHERE device_internal_id = $1 ORDER BY port_no",
    )
    .bind(device_internal_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(from_row).collect())
}

/// A port still reporting charging bits though no order claims it.
#[derive(Debug, Clone)]
pub struct HealCandidate {
    pub device_internal_id: i64,
    pub phy_id: String,
    pub port_no: i32,
}

/// Self-heal scan: ports whose bits say charging, whose reading is older
/// than the grace period, and whose (device, port) has no order in
/// {1,2,8,9,10}.
pub async fn charging_without_active_order(
    pool: &PgPool,
    grace: Duration,
) -> Result<Vec<HealCandidate>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT p.device_internal_id, d.phy_id, p.port_no
         FROM ports p
         JOIN devices d ON d.internal_id = p.device_internal_id
         WHERE (p.status_bits & 128) <> 0
           AND p.updated_at < now() - make_interval(secs => $1)
           AND NOT EXISTS (
               SELECT 1 FROM orders o
               WHERE o.device_internal_id = p.device_internal_id
                 AND o.port_no = p.port_no
                 AND o.status IN (1, 2, 8, 9, 10)
           )",
    )
    .bind(grace.as_secs_f64())
    .fetch_all(pool)
    .await?;
    Ok(rows
        .iter()
        .map(|row| HealCandidate {
            device_internal_id: row.get("device_internal_id"),
            phy_id: row.get("phy_id"),
            port_no: row.get("port_no"),
        })
        .collect())
}
