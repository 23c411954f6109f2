//! Device sessions.
//!
//! A session is the store-level projection of one live gateway connection.
//! The store is an interface with two implementations: an in-memory map for
//! single-instance deployments and a shared Postgres-backed record for
//! fleets. Everything else in the service depends only on the trait.
//!
//! The local connection cache (`ConnRegistry` in `tcp::conn`) is NOT part of
//! the store: raw byte handles never cross instances.

pub mod memory;
pub mod shared;

pub use memory::InMemorySessionStore;
pub use shared::PgSessionStore;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::Config;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session store: {0}")]
    Store(#[from] sqlx::Error),
    #[error("corrupt session record for {0}")]
    Corrupt(String),
}

/// The shared record for one gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub phy_id: String,
    /// Nil when no connection currently owns the session.
    pub conn_id: Uuid,
    pub owning_instance: String,
    pub last_seen: Option<DateTime<Utc>>,
    pub last_tcp_down: Option<DateTime<Utc>>,
    pub last_ack_timeout: Option<DateTime<Utc>>,
}

impl SessionRecord {
    pub fn new(phy_id: &str) -> SessionRecord {
        SessionRecord {
            phy_id: phy_id.to_owned(),
            conn_id: Uuid::nil(),
            owning_instance: String::new(),
            last_seen: None,
            last_tcp_down: None,
            last_ack_timeout: None,
        }
    }

    pub fn is_online(&self, now: DateTime<Utc>, heartbeat_timeout: Duration) -> bool {
        let timeout = chrono_dur(heartbeat_timeout);
        self.last_seen.is_some_and(|seen| now - seen <= timeout)
    }

    /// Heartbeat freshness minus penalties for recent transport trouble.
    pub fn weighted_score(&self, now: DateTime<Utc>, policy: &WeightedPolicy) -> f64 {
        let mut score = if self.is_online(now, policy.heartbeat_timeout) {
            1.0
        } else {
            0.0
        };
        let window = chrono_dur(policy.event_window);
        if self.last_tcp_down.is_some_and(|t| now - t <= window) {
            score -= policy.tcp_down_penalty;
        }
        if self.last_ack_timeout.is_some_and(|t| now - t <= window) {
            score -= policy.ack_timeout_penalty;
        }
        score
    }

    pub fn is_online_weighted(&self, now: DateTime<Utc>, policy: &WeightedPolicy) -> bool {
        self.weighted_score(now, policy) >= policy.threshold
    }

    /// The newest timestamp on the record, for TTL bookkeeping.
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        [self.last_seen, self.last_tcp_down, self.last_ack_timeout]
            .into_iter()
            .flatten()
            .max()
    }
}

/// Knobs for the weighted-online judgement.
#[derive(Debug, Clone)]
pub struct WeightedPolicy {
    pub heartbeat_timeout: Duration,
    /// How far back a TCP drop or ACK timeout still counts against a device.
    pub event_window: Duration,
    pub tcp_down_penalty: f64,
    pub ack_timeout_penalty: f64,
    pub threshold: f64,
}

impl WeightedPolicy {
    pub fn from_config(config: &Config) -> WeightedPolicy {
        WeightedPolicy {
            heartbeat_timeout: config.heartbeat_timeout,
            event_window: Duration::from_secs(120),
            tcp_down_penalty: 0.3,
            ack_timeout_penalty: 0.2,
            threshold: 0.5,
        }
    }
}

pub(crate) fn chrono_dur(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

/// The session store contract. Record operations only; byte handles live
/// in the per-instance connection registry instead.
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync {
    /// Claim the session for a new connection. Any prior binding is
    /// overwritten (the new connection wins) but activity timestamps are
    /// carried over.
    async fn bind(&self, phy_id: &str, conn_id: Uuid) -> Result<(), SessionError>;

    /// Release ownership iff `conn_id` still holds it. Timestamps survive so
    /// the weighted judgement keeps its history; the record itself expires
    /// by TTL.
    async fn unbind(&self, phy_id: &str, conn_id: Uuid) -> Result<bool, SessionError>;

    /// Remove the record entirely.
    async fn unbind_by_phy(&self, phy_id: &str) -> Result<(), SessionError>;

    async fn on_heartbeat(&self, phy_id: &str, t: DateTime<Utc>) -> Result<(), SessionError>;
    async fn on_tcp_closed(&self, phy_id: &str, t: DateTime<Utc>) -> Result<(), SessionError>;
    async fn on_ack_timeout(&self, phy_id: &str, t: DateTime<Utc>) -> Result<(), SessionError>;

    /// A record absent from the store means "never seen".
    async fn get(&self, phy_id: &str) -> Result<Option<SessionRecord>, SessionError>;

    async fn all(&self) -> Result<Vec<SessionRecord>, SessionError>;

    async fn is_online(
        &self,
        phy_id: &str,
        now: DateTime<Utc>,
        heartbeat_timeout: Duration,
    ) -> Result<bool, SessionError> {
        Ok(self
            .get(phy_id)
            .await?
            .is_some_and(|r| r.is_online(now, heartbeat_timeout)))
    }

    async fn is_online_weighted(
        &self,
        phy_id: &str,
        now: DateTime<Utc>,
        policy: &WeightedPolicy,
    ) -> Result<bool, SessionError> {
        Ok(self
            .get(phy_id)
            .await?
            .is_some_and(|r| r.is_online_weighted(now, policy)))
    }

    async fn online_count(
        &self,
        now: DateTime<Utc>,
        heartbeat_timeout: Duration,
    ) -> Result<usize, SessionError> {
        Ok(self
            .all()
            .await?
            .iter()
            .filter(|r| r.is_online(now, heartbeat_timeout))
            .count())
    }

    async fn online_count_weighted(
        &self,
        now: DateTime<Utc>,
        policy: &WeightedPolicy,
    ) -> Result<usize, SessionError> {
        Ok(self
            .all()
            .await?
            .iter()
            .filter(|r| r.is_online_weighted(now, policy))
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> WeightedPolicy {
        WeightedPolicy {
            heartbeat_timeout: Duration::from_secs(300),
            event_window: Duration::from_secs(120),
            tcp_down_penalty: 0.3,
            ack_timeout_penalty: 0.2,
            threshold: 0.5,
        }
    }

    #[test]
    fn fresh_heartbeat_is_online() {
        let now = Utc::now();
        let mut record = SessionRecord::new("82241218000382");
        assert!(!record.is_online(now, Duration::from_secs(300)));

        record.last_seen = Some(now - chrono::Duration::seconds(299));
        assert!(record.is_online(now, Duration::from_secs(300)));

        record.last_seen = Some(now - chrono::Duration::seconds(301));
        assert!(!record.is_online(now, Duration::from_secs(300)));
    }

    #[test]
    fn weighted_score_subtracts_recent_trouble() {
        let now = Utc::now();
        let mut record = SessionRecord::new("82241218000382");
        record.last_seen = Some(now);
        assert!((record.weighted_score(now, &policy()) - 1.0).abs() < f64::EPSILON);
        assert!(record.is_online_weighted(now, &policy()));

        record.last_tcp_down = Some(now - chrono::Duration::seconds(10));
        assert!((record.weighted_score(now, &policy()) - 0.7).abs() < 1e-9);
        assert!(record.is_online_weighted(now, &policy()));

        record.last_ack_timeout = Some(now - chrono::Duration::seconds(10));
        assert!((record.weighted_score(now, &policy()) - 0.5).abs() < 1e-9);
        // Exactly at threshold still counts as online.
        assert!(record.is_online_weighted(now, &policy()));
    }

    #[test]
    fn stale_heartbeat_fails_weighted_even_without_penalties() {
        let now = Utc::now();
        let mut record = SessionRecord::new("82241218000382");
        record.last_seen = Some(now - chrono::Duration::seconds(600));
        assert!(!record.is_online_weighted(now, &policy()));
    }

    #[test]
    fn penalties_expire_with_the_window() {
        let now = Utc::now();
        let mut record = SessionRecord::new("82241218000382");
        record.last_seen = Some(now);
        record.last_tcp_down = Some(now - chrono::Duration::seconds(121));
        record.last_ack_timeout = Some(now - chrono::Duration::seconds(500));
        assert!((record.weighted_score(now, &policy()) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn last_activity_is_the_newest_timestamp() {
        let now = Utc::now();
        let mut record = SessionRecord::new("x");
        assert!(record.last_activity().is_none());
        record.last_seen = Some(now - chrono::Duration::seconds(60));
        record.last_tcp_down = Some(now);
        assert_eq!(record.last_activity(), Some(now));
    }
}
