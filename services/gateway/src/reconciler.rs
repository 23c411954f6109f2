//! Periodic reconciliation sweeps.
//!
//! One scheduled task per instance. Every sweep is a bounded guarded update;
//! running two instances concurrently is safe because the second pass
//! observes zero affected rows. Affected-row counts surface as
//! `reconciler_rows{sweep}`.

use tokio::sync::watch;
use tracing::{info, warn};

use crate::events;
use crate::orders::OrderStatus;
use crate::outbound;
use crate::repo;
use crate::repo::orders::OrderRow;
use crate::session::SessionStore;
use crate::state::AppState;

pub async fn run(state: AppState, mut shutdown: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(state.config.reconciler_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("reconciler stopping");
                    return;
                }
            }
            _ = tick.tick() => {
                if let Err(e) = tick_once(&state).await {
                    warn!(error = %e, "reconciler tick failed");
                }
            }
        }
    }
}

/// One full pass over all sweeps. Public so tests can drive it directly.
pub async fn tick_once(state: &AppState) -> Result<(), sqlx::Error> {
    let config = &state.config;

    // 1. pending past the ACK window → timeout.
    let rows = repo::orders::sweep_pending_timeout(&state.pool, config.pending_timeout).await?;
    state.metrics.reconciler_rows("pending_timeout", rows.len() as u64);
    for order in &rows {
        state
            .metrics
            .order_transition(OrderStatus::Pending, OrderStatus::TimedOut);
        emit_terminal(state, order, OrderStatus::TimedOut, "pending_timeout", false).await;
    }

    // 2. orders on silent devices → interrupted.
    let rows =
        repo::orders::sweep_interrupt_stale_devices(&state.pool, config.device_stale_after).await?;
    state.metrics.reconciler_rows("interrupt_stale", rows.len() as u64);
    for (from, order) in &rows {
        state.metrics.order_transition(*from, OrderStatus::Interrupted);
        info!(order_no = %order.order_no, "interrupted: device silent");
    }

    // 3. interrupted past the recovery window → failed, and ask the port
    //    what it thinks it is doing.
    let rows = repo::orders::sweep_recovery_timeout(&state.pool, config.recovery_window).await?;
    state.metrics.reconciler_rows("recovery_timeout", rows.len() as u64);
    for order in &rows {
        state
            .metrics
            .order_transition(OrderStatus::Interrupted, OrderStatus::Failed);
        emit_terminal(state, order, OrderStatus::Failed, "recovery_timeout", true).await;
        request_port_heal(state, order.device_internal_id, order.port_no).await;
    }

    // 4. cancelling past the window → cancelled.
    let rows =
        repo::orders::sweep_cancelling_timeout(&state.pool, config.middle_state_timeout).await?;
    state.metrics.reconciler_rows("cancelling_timeout", rows.len() as u64);
    for order in &rows {
        state
            .metrics
            .order_transition(OrderStatus::Cancelling, OrderStatus::Cancelled);
        emit_terminal(state, order, OrderStatus::Cancelled, "cancel_timeout", false).await;
    }

    // 5. stopping past the window → stopped.
    let rows =
        repo::orders::sweep_stopping_timeout(&state.pool, config.middle_state_timeout).await?;
    state.metrics.reconciler_rows("stopping_timeout", rows.len() as u64);
    for order in &rows {
        state
            .metrics
            .order_transition(OrderStatus::Stopping, OrderStatus::Stopped);
        emit_terminal(state, order, OrderStatus::Stopped, "stop_timeout", true).await;
    }

    // 6. ports claiming to charge with no order that says so.
    let candidates =
        repo::ports::charging_without_active_order(&state.pool, config.port_heal_grace).await?;
    state.metrics.reconciler_rows("port_heal", candidates.len() as u64);
    for candidate in &candidates {
        info!(
            phy_id = %candidate.phy_id,
            port_no = candidate.port_no,
            "port self-heal query"
        );
        request_port_heal(state, candidate.device_internal_id, candidate.port_no).await;
    }

    // 7. confirmed that never started charging → timeout.
    let rows = repo::orders::sweep_confirmed_timeout(&state.pool, config.confirm_timeout).await?;
    state.metrics.reconciler_rows("confirm_timeout", rows.len() as u64);
    for order in &rows {
        state
            .metrics
            .order_transition(OrderStatus::Confirmed, OrderStatus::TimedOut);
        emit_terminal(state, order, OrderStatus::TimedOut, "confirm_timeout", false).await;
    }

    // Presence gauge rides along with the sweep cadence.
    match state
        .sessions
        .online_count(chrono::Utc::now(), config.heartbeat_timeout)
        .await
    {
        Ok(count) => state.metrics.online(count),
        Err(e) => warn!(error = %e, "online count failed"),
    }

    Ok(())
}

/// Terminal sweep events: `charging.ended` first when a charge had begun,
/// then the closing `order.completed`.
async fn emit_terminal(
    state: &AppState,
    order: &OrderRow,
    to: OrderStatus,
    end_reason: &str,
    charged: bool,
) {
    if charged {
        events::emit_order(
            state,
            order,
            events::kind::CHARGING_ENDED,
            serde_json::json!({ "end_reason": end_reason }),
        )
        .await;
    }
    events::emit_order(
        state,
        order,
        events::kind::ORDER_COMPLETED,
        serde_json::json!({
            "final_status": to.label(),
            "end_reason": end_reason,
        }),
    )
    .await;
    info!(order_no = %order.order_no, to = to.label(), end_reason, "order resolved by sweep");
}

/// Queue a status query, deduplicated per port per minute so overlapping
/// reconcilers do not pile queries up.
async fn request_port_heal(state: &AppState, device_internal_id: i64, port_no: i32) {
    let phy_id = match repo::devices::get_by_id(&state.pool, device_internal_id).await {
        Ok(Some(device)) => device.phy_id,
        Ok(None) => return,
        Err(e) => {
            warn!(error = %e, "device lookup for port heal failed");
            return;
        }
    };
    let bucket = chrono::Utc::now().timestamp() / 60;
    let correlation = format!("heal:{device_internal_id}:{port_no}:{bucket}");
    if let Err(e) = outbound::submit_port_query(
        state,
        device_internal_id,
        &phy_id,
        port_no as u8,
        Some(correlation),
    )
    .await
    {
        warn!(error = %e, "port heal enqueue failed");
    }
}
