//! Business event emission.
//!
//! Events are pure table appends; the push worker (`push`) is the only
//! consumer. Emission never fails a business flow: an append error is
//! logged and dropped, the reconciler's self-healing keeps state converging
//! regardless.

pub mod push;

use tracing::warn;

use crate::repo;
use crate::repo::orders::OrderRow;
use crate::state::AppState;

pub mod kind {
    pub const ORDER_CREATED: &str = "order.created";
    pub const ORDER_CONFIRMED: &str = "order.confirmed";
    pub const ORDER_COMPLETED: &str = "order.completed";
    pub const CHARGING_STARTED: &str = "charging.started";
    pub const CHARGING_ENDED: &str = "charging.ended";
    pub const DEVICE_HEARTBEAT: &str = "device.heartbeat";
    pub const DEVICE_ALARM: &str = "device.alarm";
    pub const DEVICE_ONLINE: &str = "device.online";
    pub const DEVICE_OFFLINE: &str = "device.offline";
    pub const SOCKET_STATE_CHANGED: &str = "socket.state_changed";
    pub const OTA_PROGRESS_UPDATE: &str = "ota.progress_update";
}

/// Append an order-scoped event, sequenced within the order number.
pub async fn emit_order(
    state: &AppState,
    order: &OrderRow,
    event_type: &str,
    mut payload: serde_json::Value,
) {
    if let Some(map) = payload.as_object_mut() {
        map.insert("order_no".to_owned(), order.order_no.clone().into());
        map.insert("port_no".to_owned(), order.port_no.into());
    }
    emit(
        state,
        &order.order_no,
        event_type,
        payload,
        order.test_session_id.as_deref(),
    )
    .await;
}

/// Append a device-scoped event, sequenced within the gateway phy id.
pub async fn emit_device(
    state: &AppState,
    phy_id: &str,
    event_type: &str,
    mut payload: serde_json::Value,
) {
    if let Some(map) = payload.as_object_mut() {
        map.insert("phy_id".to_owned(), phy_id.into());
    }
    emit(state, phy_id, event_type, payload, None).await;
}

async fn emit(
    state: &AppState,
    subject: &str,
    event_type: &str,
    payload: serde_json::Value,
    test_session_id: Option<&str>,
) {
    if let Err(e) =
        repo::events::append(&state.pool, subject, event_type, &payload, test_session_id).await
    {
        warn!(subject, event_type, error = %e, "event append failed");
    }
}
