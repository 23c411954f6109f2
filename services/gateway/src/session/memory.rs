//! In-memory session store for single-instance deployments.
//!
//! Entries expire by TTL just like the shared store so the two
//! implementations answer "never seen" identically.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{chrono_dur, SessionError, SessionRecord, SessionStore};

struct Entry {
    record: SessionRecord,
    touched: DateTime<Utc>,
}

pub struct InMemorySessionStore {
    instance_id: String,
    ttl: Duration,
    inner: RwLock<HashMap<String, Entry>>,
}

impl InMemorySessionStore {
    pub fn new(instance_id: String, ttl: Duration) -> InMemorySessionStore {
        InMemorySessionStore {
            instance_id,
            ttl,
            inner: RwLock::new(HashMap::new()),
        }
    }

    fn expired(&self, entry: &Entry, now: DateTime<Utc>) -> bool {
        now - entry.touched > chrono_dur(self.ttl)
    }

    /// Load-or-default, apply, and re-touch one record.
    async fn update(
        &self,
        phy_id: &str,
        apply: impl FnOnce(&mut SessionRecord),
    ) -> Result<(), SessionError> {
        let now = Utc::now();
        let mut map = self.inner.write().await;
        let entry = map.entry(phy_id.to_owned()).or_insert_with(|| Entry {
            record: SessionRecord::new(phy_id),
            touched: now,
        });
        if self.expired(entry, now) {
            entry.record = SessionRecord::new(phy_id);
        }
        apply(&mut entry.record);
        entry.touched = now;
        Ok(())
    }
}

#[async_trait::async_trait]
impl SessionStore for InMemorySessionStore {
    async fn bind(&self, phy_id: &str, conn_id: Uuid) -> Result<(), SessionError> {
        let instance = self.instance_id.clone();
        self.update(phy_id, |record| {
            record.conn_id = conn_id;
            record.owning_instance = instance;
        })
        .await
    }

    async fn unbind(&self, phy_id: &str, conn_id: Uuid) -> Result<bool, SessionError> {
        let mut map = self.inner.write().await;
        if let Some(entry) = map.get_mut(phy_id) {
            if entry.record.conn_id == conn_id {
                entry.record.conn_id = Uuid::nil();
                entry.record.owning_instance = String::new();
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn unbind_by_phy(&self, phy_id: &str) -> Result<(), SessionError> {
        self.inner.write().await.remove(phy_id);
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
        let now = Utc::now();
        let map = self.inner.read().await;
        Ok(map
            .get(phy_id)
            .filter(|entry| !self.expired(entry, now))
            .map(|entry| entry.record.clone()))
    }

    async fn all(&self) -> Result<Vec<SessionRecord>, SessionError> {
        let now = Utc::now();
        let map = self.inner.read().await;
        Ok(map
            .values()
            .filter(|entry| !self.expired(entry, now))
            .map(|entry| entry.record.clone())
            .collect())
    }
}
