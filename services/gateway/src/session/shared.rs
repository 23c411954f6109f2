//! Shared session store backed by the `sessions` table.
//!
//! One JSON record per gateway, refreshed with a TTL of twice the heartbeat
//! timeout on every write. Expired rows are filtered on read and lazily
//! reaped; a missing or expired row means "never seen".

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{SessionError, SessionRecord, SessionStore};

pub struct PgSessionStore {
    pool: PgPool,
    instance_id: String,
    ttl: Duration,
}

impl PgSessionStore {
    pub fn new(pool: PgPool, instance_id: String, ttl: Duration) -> PgSessionStore {
        PgSessionStore {
            pool,
            instance_id,
            ttl,
        }
    }

    async fn load(&self, phy_id: &str) -> Result<Option<SessionRecord>, SessionError> {
        let row = sqlx::query(
            "SELECT record FROM sessions WHERE phy_id = $1 AND expires_at > now()",
        )
        .bind(phy_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            None => Ok(None),
            Some(row) => {
                let value: serde_json::Value = row.get("record");
                serde_json::from_value(value)
                    .map(Some)
                    .map_err(|_| SessionError::Corrupt(phy_id.to_owned()))
            }
        }
    }

    async fn store(&self, record: &SessionRecord) -> Result<(), SessionError> {
        let value = serde_json::to_value(record)
            .map_err(|_| SessionError::Corrupt(record.phy_id.clone()))?;
        sqlx::query(
            "INSERT INTO sessions (phy_id, record, expires_at)
             VALUES ($1, $2, now() + make_interval(secs => $3))
             ON CONFLICT (phy_id)
             DO UPDATE SET record = EXCLUDED.record, expires_at = EXCLUDED.expires_at",
        )
        .bind(&record.phy_id)
        .bind(value)
        .bind(self.ttl.as_secs_f64())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Load-or-default, apply, publish.
    async fn update(
        &self,
        phy_id: &str,
        apply: impl FnOnce(&mut SessionRecord),
    ) -> Result<(), SessionError> {
        let mut record = self
            .load(phy_id)
            .await?
            .unwrap_or_else(|| SessionRecord::new(phy_id));
        apply(&mut record);
        self.store(&record).await
    }
}

#[async_trait::async_trait]
impl SessionStore for PgSessionStore {
    async fn bind(&self, phy_id: &str, conn_id: Uuid) -> Result<(), SessionError> {
        self.update(phy_id, |record| {
            record.conn_id = conn_id;
            record.owning_instance = self.instance_id.clone();
        })
        .await
    }

    async fn unbind(&self, phy_id: &str, conn_id: Uuid) -> Result<bool, SessionError> {
        let Some(mut record) = self.load(phy_id).await? else {
            return Ok(false);
        };
        if record.conn_id != conn_id {
            return Ok(false);
        }
        record.conn_id = Uuid::nil();
        record.owning_instance = String::new();
        self.store(&record).await?;
        Ok(true)
    }

    async fn unbind_by_phy(&self, phy_id: &str) -> Result<(), SessionError> {
        sqlx::query("DELETE FROM sessions WHERE phy_id = $1")
            .bind(phy_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn on_heartbeat(&self, phy_id: &str, t: DateTime<Utc>) -> Result<(), SessionError> {
        self.update(phy_id, |record| {
            if record.last_seen.is_none_or(|seen| seen < t) {
                record.last_seen = Some(t);
            }
        })
        .await
    }

    async fn on_tcp_closed(&self, phy_id: &str, t: DateTime<Utc>) -> Result<(), SessionError> {
        self.update(phy_id, |record| record.last_tcp_down = Some(t)).await
    }

    async fn on_ack_timeout(&self, phy_id: &str, t: DateTime<Utc>) -> Result<(), SessionError> {
        self.update(phy_id, |record| record.last_ack_timeout = Some(t))
            .await
    }

    async fn get(&self, phy_id: &str) -> Result<Option<SessionRecord>, SessionError> {
        self.load(phy_id).await
    }

    async fn all(&self) -> Result<Vec<SessionRecord>, SessionError> {
        // Reap dead rows opportunistically so the scan stays bounded.
        sqlx::query("DELETE FROM sessions WHERE expires_at <= now()")
            .execute(&self.pool)
            .await?;
        let rows = sqlx::query("SELECT phy_id, record FROM sessions WHERE expires_at > now()")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                let phy_id: String = row.get("phy_id");
                let value: serde_json::Value = row.get("record");
                serde_json::from_value(value).map_err(|_| SessionError::Corrupt(phy_id))
            })
            .collect()
    }
}
