//! Environment-driven configuration.
//!
//! All knobs come from the process environment; a parse failure is a startup
//! error (exit code 1), never a silent default. `from_lookup` exists so tests
//! can exercise parsing without mutating the real environment.

use std::env;
use std::time::Duration;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStoreKind {
    Memory,
    Shared,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub tcp_listen_addr: String,
    pub http_listen_addr: String,
    pub webhook_url: Option<String>,
    pub api_keys: Vec<String>,
    pub instance_id: String,
    pub session_store: SessionStoreKind,

    /// A device with no heartbeat-bearing frame for this long is offline.
    pub heartbeat_timeout: Duration,
    /// How long an interrupted order may wait for the device to come back.
    pub recovery_window: Duration,
    /// How long a pending order may wait for its control ACK.
    pub pending_timeout: Duration,
    /// Reader deadline that records an ACK-timeout event without closing.
    pub idle_read_timeout: Duration,
    /// Pending orders older than this are swept before a new reservation.
    pub stale_pending_sweep: Duration,
    /// Cancelling/stopping orders resolve on their own after this long.
    pub middle_state_timeout: Duration,
    /// Devices silent for this long get their in-flight orders interrupted.
    pub device_stale_after: Duration,
    /// Confirmed orders that never start charging time out after this long.
    pub confirm_timeout: Duration,
    /// Grace before a charging port without an active order is re-queried.
    pub port_heal_grace: Duration,
    /// Control ACKs later than this are logged and ignored.
    pub ack_window: Duration,

    pub reconciler_interval: Duration,
    pub dispatcher_interval: Duration,
    pub event_push_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Config, ConfigError> {
        Config::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Config, ConfigError> {
        let database_url = lookup("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let session_store = match lookup("SESSION_STORE").as_deref() {
            None | Some("shared") => SessionStoreKind::Shared,
            Some("memory") => SessionStoreKind::Memory,
            Some(other) => {
                return Err(ConfigError::Invalid("SESSION_STORE", other.to_owned()));
            }
        };

        let api_keys = lookup("API_KEYS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|k| !k.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Config {
            tcp_listen_addr: lookup("TCP_LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0:7100".to_owned()),
            http_listen_addr: lookup("HTTP_LISTEN_ADDR")
                .unwrap_or_else(|| "0.0.0.0:8080".to_owned()),
            webhook_url: lookup("WEBHOOK_URL").filter(|u| !u.is_empty()),
            api_keys,
            instance_id: lookup("INSTANCE_ID")
                .unwrap_or_else(|| format!("gateway-{}", uuid::Uuid::new_v4())),
            session_store,
            heartbeat_timeout: secs(&lookup, "HEARTBEAT_TIMEOUT", 300)?,
            recovery_window: secs(&lookup, "RECOVERY_WINDOW", 60)?,
            pending_timeout: secs(&lookup, "PENDING_TIMEOUT", 10)?,
            idle_read_timeout: secs(&lookup, "IDLE_READ_TIMEOUT", 120)?,
            stale_pending_sweep: secs(&lookup, "STALE_PENDING_SWEEP", 300)?,
            middle_state_timeout: secs(&lookup, "MIDDLE_STATE_TIMEOUT", 30)?,
            device_stale_after: secs(&lookup, "DEVICE_STALE_AFTER", 60)?,
            confirm_timeout: secs(&lookup, "CONFIRM_TIMEOUT", 300)?,
            port_heal_grace: secs(&lookup, "PORT_HEAL_GRACE", 30)?,
            ack_window: secs(&lookup, "ACK_WINDOW", 10)?,
            reconciler_interval: millis(&lookup, "RECONCILER_INTERVAL_MS", 5_000)?,
            dispatcher_interval: millis(&lookup, "DISPATCHER_INTERVAL_MS", 500)?,
            event_push_interval: millis(&lookup, "EVENT_PUSH_INTERVAL_MS", 1_000)?,
            database_url,
        })
    }

    /// Shared-store record TTL.
    pub fn session_ttl(&self) -> Duration {
        self.heartbeat_timeout * 2
    }
}

fn secs(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: u64,
) -> Result<Duration, ConfigError> {
    parse_u64(lookup, key, default).map(Duration::from_secs)
}

fn millis(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: u64,
) -> Result<Duration, ConfigError> {
    parse_u64(lookup, key, default).map(Duration::from_millis)
}

fn parse_u64(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: u64,
) -> Result<u64, ConfigError> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map_err(|_| ConfigError::Invalid(key, raw)),
    }
}
