//! Command router.
//!
//! Maps a decoded frame to its handler. Two side effects happen for every
//! frame before dispatch: the device row exists and, for heartbeat-bearing
//! commands, `last_seen` advances. Handler errors are counted and logged;
//! the connection stays open, only the transport may close it.

use bkv_protocol::frame::Frame;
use bkv_protocol::command;
use chrono::Utc;
use tracing::{info, warn, Instrument};

use crate::events;
use crate::repo;
use crate::repo::devices::DeviceRow;
use crate::session::SessionStore;
use crate::state::AppState;
use crate::tcp::conn::ConnHandle;
use crate::tcp::handlers;

pub async fn dispatch(state: &AppState, conn: &ConnHandle, frame: Frame) {
    // The msg_id is the correlation id for everything on this path.
    let span = tracing::info_span!(
        "frame",
        phy_id = %conn.phy_id,
        command = command::name(frame.command),
        msg_id = frame.msg_id,
    );
    dispatch_inner(state, conn, frame).instrument(span).await;
}

async fn dispatch_inner(state: &AppState, conn: &ConnHandle, frame: Frame) {
    state.metrics.frame_decoded(frame.command);

    let device = match ensure_device(state, conn, frame.command).await {
        Ok(device) => device,
        Err(e) => {
            warn!(error = %e, "device bookkeeping failed");
            return;
        }
    };

    let result = match frame.command {
        command::HEARTBEAT => handlers::heartbeat(state, &device, conn, &frame).await,
        command::REGISTER => handlers::register(state, &device, conn, &frame).await,
        command::STATUS_REPORT => handlers::status_report(state, &device, &frame).await,
        command::CONTROL => handlers::control_ack(state, &device, &frame).await,
        command::SETTLEMENT => handlers::settlement(state, &device, conn, &frame).await,
        command::ALARM => handlers::alarm(state, &device, &frame).await,
        command::OTA_PROGRESS => handlers::ota_progress(state, &device, &frame).await,
        command::PARAM_SET | command::OTA_PUSH | command::NETWORK_CONFIG => {
            handlers::generic_ack(state, &frame).await
        }
        other => {
            state.metrics.unknown_command(other);
            warn!(command = format!("{other:#06x}"), "unknown command");
            Ok(())
        }
    };
    if let Err(e) = result {
        state.metrics.handler_error(frame.command);
        warn!(error = %e, "handler failed");
    }
}

/// Idempotent device-row creation plus presence bookkeeping.
async fn ensure_device(
    state: &AppState,
    conn: &ConnHandle,
    cmd: u16,
) -> Result<DeviceRow, handlers::HandlerError> {
    let now = Utc::now();
    let before = repo::devices::get_by_phy(&state.pool, &conn.phy_id).await?;
    let was_online = before
        .as_ref()
        .and_then(|d| d.last_seen_at)
        .is_some_and(|seen| {
            now - seen <= crate::session::chrono_dur(state.config.heartbeat_timeout)
        });

    let internal_id = match &before {
        Some(device) => device.internal_id,
        None => repo::devices::ensure(&state.pool, &conn.phy_id).await?,
    };
    // Any upstream frame proves the device row is alive.
    repo::devices::touch_last_seen(&state.pool, internal_id, now).await?;

    if command::is_heartbeat_bearing(cmd) {
        if cmd == command::HEARTBEAT {
            state.metrics.heartbeat();
        }
        if let Err(e) = state.sessions.on_heartbeat(&conn.phy_id, now).await {
            warn!(error = %e, "session heartbeat failed");
        }
        if !was_online {
            info!(phy_id = %conn.phy_id, "device back online");
            events::emit_device(
                state,
                &conn.phy_id,
                events::kind::DEVICE_ONLINE,
                serde_json::json!({}),
            )
            .await;
            events::emit_device(
                state,
                &conn.phy_id,
                events::kind::DEVICE_HEARTBEAT,
                serde_json::json!({ "at": now.to_rfc3339() }),
            )
            .await;
        }
    }

    Ok(DeviceRow {
        internal_id,
        phy_id: conn.phy_id.clone(),
        last_seen_at: Some(now),
    })
}
