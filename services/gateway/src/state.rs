//! Shared application state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use sqlx::PgPool;
use tokio::sync::{oneshot, Mutex};
use tracing::warn;

use crate::config::{Config, SessionStoreKind};
use crate::metrics::Metrics;
use crate::session::{InMemorySessionStore, PgSessionStore, SessionStore};
use crate::tcp::conn::{ConnHandle, ConnRegistry};

/// What an awaited device acknowledgement said.
#[derive(Debug, Clone)]
pub struct AckOutcome {
    pub success: bool,
    pub detail: Option<String>,
}

type WaiterMap = HashMap<u32, oneshot::Sender<AckOutcome>>;

/// Outbound msg_id → waiting dispatcher worker. Control downlinks put the
/// order's business number in the low half of the msg_id, so the device's
/// echo resolves the same key the dispatcher registered.
#[derive(Clone, Default)]
pub struct AckWaiters {
    inner: Arc<Mutex<WaiterMap>>,
}

impl AckWaiters {
    pub async fn register(&self, msg_id: u32) -> oneshot::Receiver<AckOutcome> {
        let (tx, rx) = oneshot::channel();
        // Latest registration wins; a displaced waiter reads it as a timeout.
        self.inner.lock().await.insert(msg_id, tx);
        rx
    }

    pub async fn resolve(&self, msg_id: u32, outcome: AckOutcome) -> bool {
        match self.inner.lock().await.remove(&msg_id) {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    pub async fn drop_waiter(&self, msg_id: u32) {
        self.inner.lock().await.remove(&msg_id);
    }
}

/// Allocator for msg_ids of non-order downlinks. Starts above the 16-bit
/// range so it can never collide with a business number.
pub struct MsgIdAllocator(AtomicU32);

impl MsgIdAllocator {
    const FLOOR: u32 = 0x0001_0000;

    pub fn new() -> MsgIdAllocator {
        MsgIdAllocator(AtomicU32::new(Self::FLOOR))
    }

    pub fn next(&self) -> u32 {
        let id = self.0.fetch_add(1, Ordering::Relaxed);
        if id < Self::FLOOR {
            // Wrapped around u32::MAX; push back above the business range.
            self.0.store(Self::FLOOR, Ordering::Relaxed);
            return Self::FLOOR;
        }
        id
    }
}

impl Default for MsgIdAllocator {
    fn default() -> Self {
        MsgIdAllocator::new()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<Config>,
    pub metrics: Arc<Metrics>,
    pub sessions: Arc<dyn SessionStore>,
    pub conns: ConnRegistry,
    pub ack_waiters: AckWaiters,
    pub msg_ids: Arc<MsgIdAllocator>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> AppState {
        let sessions: Arc<dyn SessionStore> = match config.session_store {
            SessionStoreKind::Memory => Arc::new(InMemorySessionStore::new(
                config.instance_id.clone(),
                config.session_ttl(),
            )),
            SessionStoreKind::Shared => Arc::new(PgSessionStore::new(
                pool.clone(),
                config.instance_id.clone(),
                config.session_ttl(),
            )),
        };
        AppState {
            pool,
            config: Arc::new(config),
            metrics: Arc::new(Metrics::new()),
            sessions,
            conns: ConnRegistry::default(),
            ack_waiters: AckWaiters::default(),
            msg_ids: Arc::new(MsgIdAllocator::new()),
        }
    }

    /// The local write handle for a gateway, only while the shared store
    /// still records this instance as the session owner. A stale local
    /// entry (the device reconnected elsewhere before our reader noticed)
    /// answers "not here" so the row stays pending for the real owner.
    pub async fn get_conn(&self, phy_id: &str) -> Option<ConnHandle> {
        let handle = self.conns.get(phy_id).await?;
        match self.sessions.get(phy_id).await {
            Ok(Some(record)) if record.owning_instance == self.config.instance_id => Some(handle),
            Ok(_) => None,
            Err(e) => {
                warn!(%phy_id, error = %e, "session ownership lookup failed");
                None
            }
        }
    }
}
