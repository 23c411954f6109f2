//! Outbound command submission.
//!
//! Thin helpers over the queue repo that frame the payload, pick the
//! priority and account the enqueue metric. The queue and its dispatcher
//! know nothing about orders: correlation ids and msg_ids are their whole
//! world.

pub mod dispatcher;

use bkv_protocol::frame::{Frame, FrameError, GatewayId};
use bkv_protocol::{command, payload};

use crate::repo;
use crate::repo::outbound::NewOutbound;
use crate::state::AppState;

pub const PRIORITY_QUERY: i32 = 4;
pub const PRIORITY_START: i32 = 5;
pub const PRIORITY_PARAM: i32 = 6;
pub const PRIORITY_OTA: i32 = 7;
pub const PRIORITY_STOP: i32 = 8;
pub const PRIORITY_NETWORK: i32 = 10;

#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("invalid gateway id {0}")]
    BadGatewayId(String),
    #[error("frame: {0}")]
    Frame(#[from] FrameError),
    #[error("database: {0}")]
    Db(#[from] sqlx::Error),
}

pub fn gateway_id(phy_id: &str) -> Result<GatewayId, EnqueueError> {
    GatewayId::parse(phy_id).map_err(|_| EnqueueError::BadGatewayId(phy_id.to_owned()))
}

/// Persist a framed command; returns the queue row id.
pub async fn submit(state: &AppState, msg: NewOutbound) -> Result<i64, EnqueueError> {
    let priority = msg.priority;
    let id = repo::outbound::enqueue(&state.pool, &msg).await?;
    state.metrics.outbound_enqueued(priority);
    Ok(id)
}

/// Persist with idempotency by correlation id; `(id, created)`.
pub async fn submit_idempotent(
    state: &AppState,
    correlation_id: &str,
    msg: NewOutbound,
) -> Result<(i64, bool), EnqueueError> {
    let priority = msg.priority;
    let (id, created) =
        repo::outbound::enqueue_idempotent(&state.pool, correlation_id, &msg).await?;
    if created {
        state.metrics.outbound_enqueued(priority);
    }
    Ok((id, created))
}

/// Build and queue a single-socket status query (`0x001D`).
///
/// Used as the companion of a start command and by the self-heal sweeps;
/// the sweeps pass a time-bucketed correlation id so one query per port per
/// bucket is enough however many reconcilers fire.
pub async fn submit_port_query(
    state: &AppState,
    device_internal_id: i64,
    phy_id: &str,
    port_no: u8,
    correlation_id: Option<String>,
) -> Result<i64, EnqueueError> {
    let gw = gateway_id(phy_id)?;
    let frame = Frame::downlink(
        command::QUERY_SOCKET,
        state.msg_ids.next(),
        gw,
        payload::QuerySocket { socket_no: port_no }.encode(),
    );
    let msg = NewOutbound::new(device_internal_id, phy_id, frame.to_bytes()?)
        .priority(PRIORITY_QUERY)
        .timeout_ms(5_000);
    match correlation_id {
        Some(correlation_id) => Ok(submit_idempotent(state, &correlation_id, msg).await?.0),
        None => submit(state, msg).await,
    }
}

/// Commands that expect a device acknowledgement correlated by msg_id.
/// Queries are answered by a status report instead and complete on write.
pub fn expects_ack(cmd: u16) -> bool {
    matches!(
        cmd,
        command::CONTROL | command::PARAM_SET | command::OTA_PUSH | command::NETWORK_CONFIG
    )
}
