//! Order lifecycle operations.
//!
//! API entry points (create/stop/cancel) and device-driven progressions
//! (ACK, status, settlement). Every transition goes through a guarded
//! repo update; a zero-row result means a concurrent writer won and the
//! operation degrades to a no-op.

use bkv_protocol::business;
use bkv_protocol::command;
use bkv_protocol::frame::Frame;
use bkv_protocol::payload::{ControlAck, ControlBlock, SettleReason, Settlement};
use bkv_protocol::port_status::PortState;
use chrono::Utc;
use tracing::{info, warn};

use crate::events;
use crate::outbound::{self, EnqueueError};
use crate::repo;
use crate::repo::devices::DeviceRow;
use crate::repo::orders::{NewOrder, OrderRow};
use crate::repo::outbound::NewOutbound;
use crate::session::{SessionError, SessionStore, WeightedPolicy};
use crate::state::AppState;

use super::{generate_order_no, ChargeMode, OrderStatus};

#[derive(Debug, thiserror::Error)]
pub enum OrderError {
    #[error("device {0} has never been seen")]
    UnknownDevice(String),
    #[error("device {0} is offline")]
    DeviceOffline(String),
    #[error("port {port_no} is busy with order {current_order}")]
    PortBusy { port_no: i32, current_order: String },
    #[error("no active order on port {0}")]
    NoActiveOrder(i32),
    #[error("order {order_no} is {status:?}, operation not applicable")]
    IllegalState {
        order_no: String,
        status: OrderStatus,
    },
    #[error("session: {0}")]
    Session(#[from] SessionError),
    #[error("enqueue: {0}")]
    Enqueue(#[from] EnqueueError),
    #[error("database: {0}")]
    Db(#[from] sqlx::Error),
}

#[derive(Debug, Clone)]
pub struct ChargeRequest {
    pub port_no: u8,
    pub charge_mode: ChargeMode,
    pub amount_cent: Option<i64>,
    pub duration_min: Option<u16>,
    pub power_w: Option<u16>,
    pub energy_0p01: Option<u16>,
    pub test_session_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CreatedOrder {
    pub order_no: String,
    pub business_no: u16,
    pub port_no: u8,
    pub amount_cent: Option<i64>,
}

// ---------------------------------------------------------------------------
// API entry points
// ---------------------------------------------------------------------------

/// Reserve the port and queue the start command.
pub async fn create_order(
    state: &AppState,
    phy_id: &str,
    req: ChargeRequest,
) -> Result<CreatedOrder, OrderError> {
    let now = Utc::now();
    let policy = WeightedPolicy::from_config(&state.config);
    if !state
        .sessions
        .is_online_weighted(phy_id, now, &policy)
        .await?
    {
        return Err(OrderError::DeviceOffline(phy_id.to_owned()));
    }
    let device = repo::devices::get_by_phy(&state.pool, phy_id)
        .await?
        .ok_or_else(|| OrderError::UnknownDevice(phy_id.to_owned()))?;

    // Stale reservations must not block the port forever.
    let swept = repo::orders::sweep_stale_pending_for_device(
        &state.pool,
        device.internal_id,
        state.config.stale_pending_sweep,
    )
    .await?;
    for order in &swept {
        state
            .metrics
            .order_transition(OrderStatus::Pending, OrderStatus::TimedOut);
        info!(order_no = %order.order_no, "stale pending order swept before reservation");
    }

    let port_no = i32::from(req.port_no);
    if let Some(existing) =
        repo::orders::find_active_for_port(&state.pool, device.internal_id, port_no).await?
    {
        return Err(OrderError::PortBusy {
            port_no,
            current_order: existing.order_no,
        });
    }

    let order_no = generate_order_no(now, req.port_no);
    let business_no = business::business_no(&order_no);
    let order = repo::orders::insert(
        &state.pool,
        &NewOrder {
            order_no: order_no.clone(),
            business_no,
            device_internal_id: device.internal_id,
            port_no,
            charge_mode: i16::from(req.charge_mode.as_u8()),
            amount_cent: req.amount_cent,
            duration_min: req.duration_min.map(i32::from),
            power_w: req.power_w.map(i32::from),
            test_session_id: req.test_session_id.clone(),
        },
    )
    .await?;
    info!(%order_no, business_no, port_no, "order created");
    events::emit_order(
        state,
        &order,
        events::kind::ORDER_CREATED,
        serde_json::json!({
            "charge_mode": req.charge_mode.as_u8(),
            "amount_cent": req.amount_cent,
            "duration_min": req.duration_min,
        }),
    )
    .await;

    // The business number rides in the msg_id so the device's ACK echo
    // correlates without any extra bookkeeping.
    let gw = outbound::gateway_id(phy_id)?;
    let block = ControlBlock {
        socket_no: req.port_no,
        jack_no: 0,
        switch_on: true,
        mode: req.charge_mode.as_u8(),
        duration_min: req.duration_min.unwrap_or(0),
        energy_0p01: req.energy_0p01.unwrap_or(0),
    };
    let frame = Frame::downlink(
        command::CONTROL,
        u32::from(business_no),
        gw,
        block.encode(),
    );
    let msg = NewOutbound::new(device.internal_id, phy_id, frame.to_bytes().map_err(EnqueueError::from)?)
        .priority(outbound::PRIORITY_START)
        .timeout_ms(10_000);
    outbound::submit_idempotent(state, &format!("start:{order_no}"), msg).await?;

    // Companion query pulls a fresh status report right behind the start.
    outbound::submit_port_query(state, device.internal_id, phy_id, req.port_no, None).await?;

    Ok(CreatedOrder {
        order_no,
        business_no,
        port_no: req.port_no,
        amount_cent: req.amount_cent,
    })
}

/// charging → stopping plus a stop command. Never fabricates an order.
pub async fn stop_order(
    state: &AppState,
    phy_id: &str,
    port_no: u8,
) -> Result<OrderRow, OrderError> {
    let device = repo::devices::get_by_phy(&state.pool, phy_id)
        .await?
        .ok_or_else(|| OrderError::UnknownDevice(phy_id.to_owned()))?;
    let order =
        repo::orders::find_active_for_port(&state.pool, device.internal_id, i32::from(port_no))
            .await?
            .ok_or(OrderError::NoActiveOrder(i32::from(port_no)))?;
    if order.status != OrderStatus::Charging {
        return Err(OrderError::IllegalState {
            order_no: order.order_no,
            status: order.status,
        });
    }
    if !repo::orders::mark_stopping(&state.pool, order.id).await? {
        // A settle or sweep got there first.
        return Err(OrderError::NoActiveOrder(i32::from(port_no)));
    }
    state
        .metrics
        .order_transition(OrderStatus::Charging, OrderStatus::Stopping);
    enqueue_switch_off(
        state,
        &device,
        &order,
        port_no,
        &format!("stop:{}", order.order_no),
    )
    .await?;
    info!(order_no = %order.order_no, "stop issued");
    Ok(order)
}

/// pending → cancelling plus a cancel command.
pub async fn cancel_order(
    state: &AppState,
    phy_id: &str,
    port_no: u8,
) -> Result<OrderRow, OrderError> {
    let device = repo::devices::get_by_phy(&state.pool, phy_id)
        .await?
        .ok_or_else(|| OrderError::UnknownDevice(phy_id.to_owned()))?;
    let order =
        repo::orders::find_active_for_port(&state.pool, device.internal_id, i32::from(port_no))
            .await?
            .ok_or(OrderError::NoActiveOrder(i32::from(port_no)))?;
    if order.status != OrderStatus::Pending {
        return Err(OrderError::IllegalState {
            order_no: order.order_no,
            status: order.status,
        });
    }
    if !repo::orders::mark_cancelling(&state.pool, order.id).await? {
        return Err(OrderError::NoActiveOrder(i32::from(port_no)));
    }
    state
        .metrics
        .order_transition(OrderStatus::Pending, OrderStatus::Cancelling);
    enqueue_switch_off(
        state,
        &device,
        &order,
        port_no,
        &format!("cancel:{}", order.order_no),
    )
    .await?;
    info!(order_no = %order.order_no, "cancel issued");
    Ok(order)
}

async fn enqueue_switch_off(
    state: &AppState,
    device: &DeviceRow,
    order: &OrderRow,
    port_no: u8,
    correlation_id: &str,
) -> Result<(), OrderError> {
    let gw = outbound::gateway_id(&device.phy_id)?;
    let block = ControlBlock {
        socket_no: port_no,
        jack_no: 0,
        switch_on: false,
        mode: order.charge_mode as u8,
        duration_min: 0,
        energy_0p01: 0,
    };
    let frame = Frame::downlink(
        command::CONTROL,
        order.business_no as u32,
        gw,
        block.encode(),
    );
    let msg = NewOutbound::new(
        device.internal_id,
        &device.phy_id,
        frame.to_bytes().map_err(EnqueueError::from)?,
    )
    .priority(outbound::PRIORITY_STOP)
    .timeout_ms(10_000);
    outbound::submit_idempotent(state, correlation_id, msg).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Device-driven progressions
// ---------------------------------------------------------------------------

/// Control ACK from the device, correlated by business number.
pub async fn on_control_ack(
    state: &AppState,
    device: &DeviceRow,
    business_no: u16,
    ack: &ControlAck,
) -> Result<(), OrderError> {
    let Some(order) = repo::orders::find_active_by_business(
        &state.pool,
        device.internal_id,
        i32::from(business_no),
    )
    .await?
    else {
        info!(business_no, "control ack without a matching active order");
        return Ok(());
    };

    let now = Utc::now();
    match order.status {
        OrderStatus::Pending if !ack.success() => {
            if repo::orders::mark_failed_ack(
                &state.pool,
                order.id,
                &format!("device_result_{}", ack.result),
            )
            .await?
            {
                state
                    .metrics
                    .order_transition(OrderStatus::Pending, OrderStatus::Failed);
                events::emit_order(
                    state,
                    &order,
                    events::kind::ORDER_COMPLETED,
                    serde_json::json!({
                        "final_status": OrderStatus::Failed.label(),
                        "end_reason": format!("device_result_{}", ack.result),
                    }),
                )
                .await;
            }
        }
        OrderStatus::Pending => {
            let age = now - order.created_at;
            if age > crate::session::chrono_dur(state.config.ack_window) {
                warn!(
                    order_no = %order.order_no,
                    age_ms = age.num_milliseconds(),
                    "late_ack"
                );
                return Ok(());
            }
            if repo::orders::mark_confirmed(&state.pool, order.id).await? {
                state
                    .metrics
                    .order_transition(OrderStatus::Pending, OrderStatus::Confirmed);
                events::emit_order(
                    state,
                    &order,
                    events::kind::ORDER_CONFIRMED,
                    serde_json::json!({}),
                )
                .await;
                info!(order_no = %order.order_no, "order confirmed");
            }
        }
        OrderStatus::Cancelling if ack.success() => {
            if repo::orders::settle(
                &state.pool,
                order.id,
                OrderStatus::Cancelled,
                &[OrderStatus::Cancelling],
                None,
                "cancelled",
            )
            .await?
            {
                state
                    .metrics
                    .order_transition(OrderStatus::Cancelling, OrderStatus::Cancelled);
                events::emit_order(
                    state,
                    &order,
                    events::kind::ORDER_COMPLETED,
                    serde_json::json!({
                        "final_status": OrderStatus::Cancelled.label(),
                        "end_reason": "cancelled",
                    }),
                )
                .await;
            }
        }
        status => {
            info!(order_no = %order.order_no, ?status, "control ack in steady state");
        }
    }
    Ok(())
}

/// One port reading from a status frame: drives confirmed → charging and
/// interrupted → charging.
pub async fn on_port_status(
    state: &AppState,
    device: &DeviceRow,
    port_no: i32,
    port_state: PortState,
) -> Result<(), OrderError> {
    if port_state != PortState::Charging {
        return Ok(());
    }
    let Some(order) =
        repo::orders::find_active_for_port(&state.pool, device.internal_id, port_no).await?
    else {
        return Ok(());
    };
    match order.status {
        OrderStatus::Confirmed => {
            if repo::orders::mark_charging(&state.pool, order.id).await? {
                state
                    .metrics
                    .order_transition(OrderStatus::Confirmed, OrderStatus::Charging);
                events::emit_order(
                    state,
                    &order,
                    events::kind::CHARGING_STARTED,
                    serde_json::json!({}),
                )
                .await;
                info!(order_no = %order.order_no, "charging started");
            }
        }
        OrderStatus::Interrupted => {
            if repo::orders::recover_interrupted(
                &state.pool,
                order.id,
                state.config.recovery_window,
            )
            .await?
            {
                state
                    .metrics
                    .order_transition(OrderStatus::Interrupted, OrderStatus::Charging);
                // Recovery is not a second start: no charging.started here.
                events::emit_order(
                    state,
                    &order,
                    events::kind::SOCKET_STATE_CHANGED,
                    serde_json::json!({ "recovered": true }),
                )
                .await;
                info!(order_no = %order.order_no, "order recovered from interruption");
            }
        }
        _ => {}
    }
    Ok(())
}

/// Device-initiated settlement (natural end or forced stop).
pub async fn on_settlement(
    state: &AppState,
    device: &DeviceRow,
    settlement: &Settlement,
) -> Result<(), OrderError> {
    let by_business = repo::orders::find_active_by_business(
        &state.pool,
        device.internal_id,
        i32::from(settlement.business_no),
    )
    .await?;

    // Compat path: no active match but the frame names the order.
    let order = match by_business {
        Some(order) => order,
        None => match &settlement.order_no {
            Some(order_no) => match repo::orders::get_by_order_no(&state.pool, order_no).await? {
                Some(order) => order,
                None => {
                    info!(business_no = settlement.business_no, "settlement for unknown order");
                    return Ok(());
                }
            },
            None => {
                info!(business_no = settlement.business_no, "settlement without active order");
                return Ok(());
            }
        },
    };

    let (to, end_reason) = match (order.status, settlement.reason) {
        (OrderStatus::Stopping, _) => (OrderStatus::Stopped, "stopped"),
        (_, SettleReason::Completed) => (OrderStatus::Completed, "completed"),
        (_, SettleReason::Stopped) => (OrderStatus::Stopped, "device_stop"),
    };

    let settled = repo::orders::settle(
        &state.pool,
        order.id,
        to,
        &[OrderStatus::Charging, OrderStatus::Stopping],
        Some(i64::from(settlement.kwh_0p01)),
        end_reason,
    )
    .await?;
    if !settled {
        // Already terminal: the device re-sent a settle we have applied.
        info!(order_no = %order.order_no, "duplicate settlement ignored");
        return Ok(());
    }
    state.metrics.order_transition(order.status, to);
    events::emit_order(
        state,
        &order,
        events::kind::CHARGING_ENDED,
        serde_json::json!({
            "end_reason": end_reason,
            "kwh_0p01": settlement.kwh_0p01,
            "duration_min": settlement.duration_min,
        }),
    )
    .await;
    events::emit_order(
        state,
        &order,
        events::kind::ORDER_COMPLETED,
        serde_json::json!({
            "final_status": to.label(),
            "end_reason": end_reason,
            "kwh_0p01": settlement.kwh_0p01,
        }),
    )
    .await;
    info!(order_no = %order.order_no, to = to.label(), "order settled");
    Ok(())
}
