//! Per-connection context and the local connection registry.
//!
//! Each accepted socket gets exactly one reader task; writes from the router
//! and the outbound dispatcher are serialised by the write-half mutex. The
//! registry is strictly per-instance: it maps `phy_id` to the live write
//! handle and never crosses processes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bkv_protocol::frame::Decoded;
use bkv_protocol::BkvCodec;
use chrono::Utc;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex, RwLock};
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::repo;
use crate::session::SessionStore;
use crate::state::AppState;
use crate::tcp::router;

/// A clonable handle for writing whole frames to one connection.
#[derive(Clone)]
pub struct ConnHandle {
    pub conn_id: Uuid,
    pub phy_id: String,
    pub peer: SocketAddr,
    writer: Arc<Mutex<OwnedWriteHalf>>,
}

impl ConnHandle {
    /// Write one complete frame under the connection's write mutex.
    pub async fn write_frame(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await
    }
}

/// phy_id → live handle, private to this instance.
#[derive(Clone, Default)]
pub struct ConnRegistry {
    inner: Arc<RwLock<HashMap<String, ConnHandle>>>,
}

impl ConnRegistry {
    /// Install a handle; a previous one for the same gateway is displaced
    /// (the new connection wins).
    pub async fn insert(&self, handle: ConnHandle) -> Option<ConnHandle> {
        self.inner
            .write()
            .await
            .insert(handle.phy_id.clone(), handle)
    }

    pub async fn get(&self, phy_id: &str) -> Option<ConnHandle> {
        self.inner.read().await.get(phy_id).cloned()
    }

    /// Remove the entry only if `conn_id` still owns it.
    pub async fn remove_if(&self, phy_id: &str, conn_id: Uuid) -> bool {
        let mut map = self.inner.write().await;
        if map.get(phy_id).is_some_and(|h| h.conn_id == conn_id) {
            map.remove(phy_id);
            return true;
        }
        false
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

/// Run one connection to completion. Returns after close-once cleanup.
pub async fn handle_connection(
    state: AppState,
    stream: TcpStream,
    peer: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) {
    let conn_id = Uuid::new_v4();
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "set_nodelay failed");
    }
    let (read_half, write_half) = stream.into_split();
    let writer = Arc::new(Mutex::new(write_half));
    let mut framed = FramedRead::new(read_half, BkvCodec::default());
    let mut bound: Option<ConnHandle> = None;
    let idle = state.config.idle_read_timeout;

    debug!(%conn_id, %peer, "connection accepted");

    let cause: &'static str = loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break "shutdown";
                }
                continue;
            }
            next = tokio::time::timeout(idle, framed.next()) => next,
        };
        match next {
            // Idle-read deadline: record trouble, keep the socket.
            Err(_elapsed) => {
                if let Some(handle) = &bound {
                    debug!(phy_id = %handle.phy_id, "idle read deadline");
                    if let Err(e) = state.sessions.on_ack_timeout(&handle.phy_id, Utc::now()).await
                    {
                        warn!(error = %e, "recording ack timeout failed");
                    }
                }
            }
            Ok(None) => break "eof",
            Ok(Some(Err(e))) => {
                warn!(%conn_id, error = %e, "read error");
                break "io_error";
            }
            Ok(Some(Ok(Decoded::Bad(bad)))) => {
                state.metrics.bad_frame(bad.kind);
                warn!(
                    %conn_id,
                    kind = bad.kind.label(),
                    position = bad.position,
                    "dropped bad frame"
                );
            }
            Ok(Some(Ok(Decoded::Frame(frame)))) => {
                let phy_id = frame.gateway_id.to_string();
                let rebind = bound.as_ref().is_none_or(|h| h.phy_id != phy_id);
                if rebind {
                    let handle = ConnHandle {
                        conn_id,
                        phy_id: phy_id.clone(),
                        peer,
                        writer: writer.clone(),
                    };
                    if state.conns.insert(handle.clone()).await.is_some() {
                        info!(%phy_id, "displacing previous connection");
                    }
                    if let Err(e) = state.sessions.bind(&phy_id, conn_id).await {
                        warn!(%phy_id, error = %e, "session bind failed");
                    }
                    info!(%conn_id, %phy_id, %peer, "session bound");
                    bound = Some(handle);
                }
                if let Some(handle) = &bound {
                    router::dispatch(&state, handle, frame).await;
                }
            }
        }
    };

    // Close exactly once: the loop is the only exit path. A connection that
    // was displaced by a newer one for the same gateway cleans up nothing
    // but itself: the device is not offline, it moved.
    if let Some(handle) = &bound {
        let owned = state.conns.remove_if(&handle.phy_id, conn_id).await;
        if owned {
            let now = Utc::now();
            if let Err(e) = state.sessions.on_tcp_closed(&handle.phy_id, now).await {
                warn!(error = %e, "recording tcp_down failed");
            }
            if let Err(e) = state.sessions.unbind(&handle.phy_id, conn_id).await {
                warn!(error = %e, "session unbind failed");
            }
            match repo::devices::get_by_phy(&state.pool, &handle.phy_id).await {
                Ok(Some(device)) => {
                    match repo::orders::interrupt_for_device(&state.pool, device.internal_id).await
                    {
                        Ok(interrupted) => {
                            for (from, order) in &interrupted {
                                state.metrics.order_transition(
                                    *from,
                                    crate::orders::OrderStatus::Interrupted,
                                );
                                info!(order_no = %order.order_no, "order interrupted by disconnect");
                            }
                        }
                        Err(e) => warn!(error = %e, "interrupting in-flight orders failed"),
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "device lookup on close failed"),
            }
            crate::events::emit_device(
                &state,
                &handle.phy_id,
                crate::events::kind::DEVICE_OFFLINE,
                serde_json::json!({ "cause": cause }),
            )
            .await;
        } else {
            debug!(%conn_id, phy_id = %handle.phy_id, "connection was already displaced");
        }
    }
    state.metrics.session_offline(cause);
    info!(%conn_id, %peer, cause, "connection closed");
}
