//! Frame handlers.
//!
//! Handlers parse the inner payload and apply the business effect through
//! the order lifecycle, the session store, or the ACK waiter map. Replies
//! to the device go through the connection's write handle; queued commands
//! go through the outbound queue.

use bkv_protocol::command;
use bkv_protocol::frame::Frame;
use bkv_protocol::payload::{
    self, Alarm, ControlAck, OtaProgress, PayloadError, Register, Settlement,
};
use bkv_protocol::port_status;
use tracing::{debug, info, warn};

use crate::events;
use crate::orders::lifecycle::{self, OrderError};
use crate::repo;
use crate::repo::devices::DeviceRow;
use crate::state::{AckOutcome, AppState};
use crate::tcp::conn::ConnHandle;

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("payload: {0}")]
    Payload(#[from] PayloadError),
    #[error("order: {0}")]
    Order(#[from] OrderError),
    #[error("database: {0}")]
    Db(#[from] sqlx::Error),
    #[error("write: {0}")]
    Write(#[from] std::io::Error),
    #[error("frame: {0}")]
    Frame(#[from] bkv_protocol::frame::FrameError),
}

/// Heartbeats carry no payload worth parsing; presence bookkeeping already
/// ran in the router.
pub async fn heartbeat(
    _state: &AppState,
    _device: &DeviceRow,
    _conn: &ConnHandle,
    frame: &Frame,
) -> Result<(), HandlerError> {
    debug!(msg_id = frame.msg_id, "heartbeat");
    Ok(())
}

/// Boot registration: log the firmware, acknowledge so the device settles
/// into its heartbeat cadence.
pub async fn register(
    _state: &AppState,
    _device: &DeviceRow,
    conn: &ConnHandle,
    frame: &Frame,
) -> Result<(), HandlerError> {
    let register = Register::decode(&frame.payload)?;
    info!(
        firmware = %register.firmware,
        socket_count = register.socket_count,
        "device registered"
    );
    let reply = Frame::downlink(
        command::REGISTER,
        frame.msg_id,
        frame.gateway_id,
        payload::encode_generic_ack(0),
    );
    conn.write_frame(&reply.to_bytes()?).await?;
    Ok(())
}

/// Per-port status. Updates port rows, emits state-change events, and lets
/// the lifecycle promote confirmed/interrupted orders that show charging.
pub async fn status_report(
    state: &AppState,
    device: &DeviceRow,
    frame: &Frame,
) -> Result<(), HandlerError> {
    let readings = payload::decode_status_report(&frame.payload)?;
    for reading in readings {
        let port_no = i32::from(reading.port_no);
        let previous = repo::ports::upsert_status(
            &state.pool,
            device.internal_id,
            port_no,
            reading.status_bits,
            Some(i32::from(reading.power_w)),
        )
        .await?;

        if previous != Some(reading.status_bits) {
            let old_state = previous.map(|bits| port_status::classify(bits).label());
            events::emit_device(
                state,
                &device.phy_id,
                events::kind::SOCKET_STATE_CHANGED,
                serde_json::json!({
                    "port_no": port_no,
                    "old_state": old_state,
                    "new_state": port_status::classify(reading.status_bits).label(),
                    "status_bits": reading.status_bits,
                }),
            )
            .await;
        }

        lifecycle::on_port_status(
            state,
            device,
            port_no,
            port_status::classify(reading.status_bits),
        )
        .await?;
    }
    Ok(())
}

/// Uplink `0x0015`: the device acknowledging a control downlink. Resolves
/// the dispatcher's waiter and drives the order machine.
pub async fn control_ack(
    state: &AppState,
    device: &DeviceRow,
    frame: &Frame,
) -> Result<(), HandlerError> {
    let ack = ControlAck::decode(&frame.payload)?;
    let outcome = AckOutcome {
        success: ack.success(),
        detail: (!ack.success()).then(|| format!("device_result_{}", ack.result)),
    };
    state.ack_waiters.resolve(frame.msg_id, outcome).await;

    let business_no = (frame.msg_id & 0xFFFF) as u16;
    lifecycle::on_control_ack(state, device, business_no, &ack).await?;
    Ok(())
}

/// Device-initiated settlement. Acknowledged back so the device stops
/// re-sending it.
pub async fn settlement(
    state: &AppState,
    device: &DeviceRow,
    conn: &ConnHandle,
    frame: &Frame,
) -> Result<(), HandlerError> {
    let settlement = Settlement::decode(&frame.payload)?;
    lifecycle::on_settlement(state, device, &settlement).await?;
    let reply = Frame::downlink(
        command::SETTLEMENT,
        frame.msg_id,
        frame.gateway_id,
        payload::encode_generic_ack(0),
    );
    conn.write_frame(&reply.to_bytes()?).await?;
    Ok(())
}

pub async fn alarm(
    state: &AppState,
    device: &DeviceRow,
    frame: &Frame,
) -> Result<(), HandlerError> {
    let alarm = Alarm::decode(&frame.payload)?;
    warn!(
        socket_no = alarm.socket_no,
        code = alarm.code,
        "device alarm"
    );
    events::emit_device(
        state,
        &device.phy_id,
        events::kind::DEVICE_ALARM,
        serde_json::json!({
            "port_no": alarm.socket_no,
            "alarm_code": alarm.code,
        }),
    )
    .await;
    Ok(())
}

pub async fn ota_progress(
    state: &AppState,
    device: &DeviceRow,
    frame: &Frame,
) -> Result<(), HandlerError> {
    let progress = OtaProgress::decode(&frame.payload)?;
    info!(
        progress = progress.progress,
        status = progress.status,
        "ota progress"
    );
    events::emit_device(
        state,
        &device.phy_id,
        events::kind::OTA_PROGRESS_UPDATE,
        serde_json::json!({
            "progress": progress.progress,
            "status": progress.status,
        }),
    )
    .await;
    Ok(())
}

/// Uplink echoes of param/OTA/network downlinks: just resolve the waiter.
pub async fn generic_ack(state: &AppState, frame: &Frame) -> Result<(), HandlerError> {
    let result = payload::decode_generic_ack(&frame.payload)?;
    let resolved = state
        .ack_waiters
        .resolve(
            frame.msg_id,
            AckOutcome {
                success: result == 0,
                detail: (result != 0).then(|| format!("device_result_{result}")),
            },
        )
        .await;
    if !resolved {
        debug!(msg_id = frame.msg_id, "ack with no waiter");
    }
    Ok(())
}
