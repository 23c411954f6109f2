//! Outbound dispatcher: one worker per locally-owned online device.
//!
//! The poll loop finds devices with ripe pending messages and lazily spawns
//! a worker for each whose session this instance owns. A worker drains the
//! device's queue strictly in (priority, created_at) order, waiting for each
//! ACK before the next write; the per-device ordering guarantee lives here.
//! Devices owned elsewhere are left alone; their rows stay pending for the
//! owning instance.
//!
//! The queue tracks delivery only: any received ACK completes the row, and
//! `mark_failed` is reserved for transport-level non-delivery (write error,
//! ACK timeout, closed channel). What a negative result byte means for the
//! order is the lifecycle's business, not the queue's.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bkv_protocol::frame::Frame;
use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::outbound::expects_ack;
use crate::repo;
use crate::session::SessionStore;
use crate::state::AppState;

pub async fn run(state: AppState, mut shutdown: watch::Receiver<bool>) {
    let workers: Arc<Mutex<HashSet<i64>>> = Arc::new(Mutex::new(HashSet::new()));
    let mut tick = tokio::time::interval(state.config.dispatcher_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("outbound dispatcher stopping");
                    return;
                }
            }
            _ = tick.tick() => {
                if let Err(e) = spawn_ready_workers(&state, &workers).await {
                    warn!(error = %e, "dispatcher poll failed");
                }
            }
        }
    }
}

async fn spawn_ready_workers(
    state: &AppState,
    workers: &Arc<Mutex<HashSet<i64>>>,
) -> Result<(), sqlx::Error> {
    let pending = repo::outbound::devices_with_pending(&state.pool).await?;
    for (device_id, phy_id) in pending {
        if state.get_conn(&phy_id).await.is_none() {
            continue;
        }
        {
            let mut running = workers.lock().await;
            if !running.insert(device_id) {
                continue;
            }
        }
        let state = state.clone();
        let workers = workers.clone();
        tokio::spawn(async move {
            if let Err(e) = device_worker(&state, device_id, &phy_id).await {
                warn!(device_id, error = %e, "device worker failed");
            }
            workers.lock().await.remove(&device_id);
        });
    }
    Ok(())
}

/// Drain one device's queue. Exits when the queue is empty or the
/// connection goes away; the poll loop respawns as needed.
async fn device_worker(state: &AppState, device_id: i64, phy_id: &str) -> Result<(), sqlx::Error> {
    loop {
        let batch = repo::outbound::dequeue_for_device(&state.pool, device_id, 1).await?;
        let Some(msg) = batch.into_iter().next() else {
            return Ok(());
        };
        let Some(conn) = state.get_conn(phy_id).await else {
            return Ok(());
        };

        let frame = match Frame::from_bytes(&msg.command_bytes) {
            Ok(frame) => frame,
            Err(e) => {
                // The row can never be delivered; burn its retries at once.
                warn!(id = msg.id, error = %e, "unparseable queued command");
                for _ in 0..msg.max_retry.max(1) {
                    let status =
                        repo::outbound::mark_failed(&state.pool, msg.id, "unparseable command")
                            .await?;
                    if status != Some(repo::outbound::STATUS_PENDING) {
                        break;
                    }
                }
                debug!(id = msg.id, "poisoned row retired");
                continue;
            }
        };

        let waiter = if expects_ack(frame.command) {
            Some(state.ack_waiters.register(frame.msg_id).await)
        } else {
            None
        };

        if !repo::outbound::mark_sent(&state.pool, msg.id).await? {
            // Another instance took it between dequeue and here.
            state.ack_waiters.drop_waiter(frame.msg_id).await;
            continue;
        }

        if let Err(e) = conn.write_frame(&msg.command_bytes).await {
            state.ack_waiters.drop_waiter(frame.msg_id).await;
            repo::outbound::mark_failed(&state.pool, msg.id, &format!("write: {e}")).await?;
            // The reader task will notice the dead socket and clean up.
            return Ok(());
        }
        debug!(id = msg.id, msg_id = frame.msg_id, "command written");

        let Some(waiter) = waiter else {
            repo::outbound::mark_done(&state.pool, msg.id).await?;
            continue;
        };

        let timeout = Duration::from_millis(msg.timeout_ms.max(1) as u64);
        match tokio::time::timeout(timeout, waiter).await {
            Ok(Ok(outcome)) => {
                // Delivered. A refusal is still a delivery; resending the
                // identical frame would not change the device's mind.
                if !outcome.success {
                    debug!(
                        id = msg.id,
                        detail = outcome.detail.as_deref().unwrap_or("device_rejected"),
                        "command delivered but refused"
                    );
                }
                repo::outbound::mark_done(&state.pool, msg.id).await?;
            }
            Ok(Err(_closed)) => {
                repo::outbound::mark_failed(&state.pool, msg.id, "ack channel closed").await?;
            }
            Err(_elapsed) => {
                state.ack_waiters.drop_waiter(frame.msg_id).await;
                state.metrics.outbound_ack_timeout();
                if let Err(e) = state.sessions.on_ack_timeout(phy_id, Utc::now()).await {
                    warn!(error = %e, "recording ack timeout failed");
                }
                repo::outbound::mark_failed(&state.pool, msg.id, "ack_timeout").await?;
            }
        }
    }
}
