//! Device endpoints: charge/stop/cancel, state reads, parameter pushes,
//! firmware upgrades and mesh configuration.

use axum::extract::{Path, State};
use axum::response::Response;
use axum::Json;
use bkv_protocol::frame::Frame;
use bkv_protocol::port_status::{self, PortState};
use bkv_protocol::{command, payload};
use chrono::Utc;
use serde::Deserialize;
use tracing::warn;

use crate::consistency::{self, Consistency};
use crate::http::response::{self, RequestId};
use crate::orders::lifecycle::{self, ChargeRequest, OrderError};
use crate::orders::{ChargeMode, OrderStatus};
use crate::outbound;
use crate::repo;
use crate::repo::outbound::NewOutbound;
use crate::session::{SessionStore, WeightedPolicy};
use crate::state::AppState;

fn order_error_response(err: OrderError, request_id: &RequestId) -> Response {
    match err {
        OrderError::DeviceOffline(phy) | OrderError::UnknownDevice(phy) => {
            response::service_unavailable(request_id, format!("device {phy} is offline"))
        }
        OrderError::PortBusy {
            port_no,
            current_order,
        } => response::conflict(
            request_id,
            format!("port {port_no} is busy"),
            serde_json::json!({ "current_order": current_order }),
        ),
        OrderError::NoActiveOrder(port_no) => {
            response::not_found(request_id, format!("no active order on port {port_no}"))
        }
        OrderError::IllegalState { order_no, status } => response::conflict(
            request_id,
            format!("order {order_no} is {}", status.label()),
            serde_json::json!({ "order_no": order_no, "status": status.label() }),
        ),
        err @ (OrderError::Session(_) | OrderError::Enqueue(_) | OrderError::Db(_)) => {
            warn!(error = %err, "order operation failed");
            response::internal_error(request_id, err)
        }
    }
}

// ---------------------------------------------------------------------------
// POST /devices/{phy_id}/charge
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ChargeBody {
    pub port_no: u8,
    pub charge_mode: u8,
    pub amount: Option<i64>,
    pub duration_minutes: Option<u16>,
    pub duration: Option<u16>,
    pub power: Option<u16>,
    pub energy: Option<u16>,
    // Pricing inputs are pass-through for the billing collaborator.
    pub price_per_kwh: Option<i64>,
    pub service_fee: Option<i64>,
    pub test_session_id: Option<String>,
}

pub async fn charge(
    State(state): State<AppState>,
    Path(phy_id): Path<String>,
    request_id: RequestId,
    Json(body): Json<ChargeBody>,
) -> Response {
    let Some(charge_mode) = ChargeMode::from_u8(body.charge_mode) else {
        return response::bad_request(
            &request_id,
            format!("charge_mode {} is not one of 1..=4", body.charge_mode),
        );
    };
    let request = ChargeRequest {
        port_no: body.port_no,
        charge_mode,
        amount_cent: body.amount,
        duration_min: body.duration_minutes.or(body.duration),
        power_w: body.power,
        energy_0p01: body.energy,
        test_session_id: body.test_session_id,
    };
    match lifecycle::create_order(&state, &phy_id, request).await {
        Ok(created) => response::ok(
            &request_id,
            serde_json::json!({
                "order_no": created.order_no,
                "online": true,
                "port_no": created.port_no,
                "amount": created.amount_cent,
            }),
        ),
        Err(err) => order_error_response(err, &request_id),
    }
}

// ---------------------------------------------------------------------------
// POST /devices/{phy_id}/stop and /cancel
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct PortBody {
    pub port_no: u8,
}

pub async fn stop(
    State(state): State<AppState>,
    Path(phy_id): Path<String>,
    request_id: RequestId,
    Json(body): Json<PortBody>,
) -> Response {
    match lifecycle::stop_order(&state, &phy_id, body.port_no).await {
        Ok(order) => response::ok(
            &request_id,
            serde_json::json!({
                "order_no": order.order_no,
                "port_no": order.port_no,
            }),
        ),
        Err(err) => order_error_response(err, &request_id),
    }
}

pub async fn cancel(
    State(state): State<AppState>,
    Path(phy_id): Path<String>,
    request_id: RequestId,
    Json(body): Json<PortBody>,
) -> Response {
    match lifecycle::cancel_order(&state, &phy_id, body.port_no).await {
        Ok(order) => response::ok(
            &request_id,
            serde_json::json!({
                "order_no": order.order_no,
                "port_no": order.port_no,
            }),
        ),
        Err(err) => order_error_response(err, &request_id),
    }
}

// ---------------------------------------------------------------------------
// GET /devices/{phy_id}
// ---------------------------------------------------------------------------

pub async fn get_device(
    State(state): State<AppState>,
    Path(phy_id): Path<String>,
    request_id: RequestId,
) -> Response {
    let device = match repo::devices::get_by_phy(&state.pool, &phy_id).await {
        Ok(Some(device)) => device,
        Ok(None) => return response::not_found(&request_id, format!("unknown device {phy_id}")),
        Err(e) => return response::internal_error(&request_id, e),
    };

    let now = Utc::now();
    let policy = WeightedPolicy::from_config(&state.config);
    let record = match state.sessions.get(&phy_id).await {
        Ok(record) => record,
        Err(e) => return response::internal_error(&request_id, e),
    };
    let online = record
        .as_ref()
        .is_some_and(|r| r.is_online(now, state.config.heartbeat_timeout));
    let online_weighted = record
        .as_ref()
        .is_some_and(|r| r.is_online_weighted(now, &policy));

    let ports = match repo::ports::list_for_device(&state.pool, device.internal_id).await {
        Ok(ports) => ports,
        Err(e) => return response::internal_error(&request_id, e),
    };

    let mut port_views = Vec::with_capacity(ports.len());
    let mut device_consistency = Consistency::Ok;
    for port in &ports {
        let port_state = port_status::classify(port.bits());
        let active =
            match repo::orders::find_active_for_port(&state.pool, device.internal_id, port.port_no)
                .await
            {
                Ok(active) => active,
                Err(e) => return response::internal_error(&request_id, e),
            };
        let verdict = match &active {
            Some(order) => consistency::evaluate(online, port_state, order.status),
            // No order on the books: a charging port is the self-heal case.
            None if port_state == PortState::Charging => consistency::evaluate(
                online,
                port_state,
                OrderStatus::Completed,
            ),
            None => Consistency::Ok,
        };
        if device_consistency.is_ok() && !verdict.is_ok() {
            device_consistency = verdict;
        }
        port_views.push(serde_json::json!({
            "port_no": port.port_no,
            "status_bits": port.bits(),
            "state": port_state.label(),
            "power_w": port.power_w,
            "updated_at": port.updated_at.to_rfc3339(),
            "active_order": active.as_ref().map(|o| o.order_no.clone()),
            "consistency_status": verdict.label(),
        }));
    }

    response::ok(
        &request_id,
        serde_json::json!({
            "phy_id": device.phy_id,
            "internal_id": device.internal_id,
            "online": online,
            "online_weighted": online_weighted,
            "last_seen_at": device.last_seen_at.map(|t| t.to_rfc3339()),
            "consistency_status": device_consistency.label(),
            "ports": port_views,
        }),
    )
}

// ---------------------------------------------------------------------------
// POST /devices/{phy_id}/params
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ParamsBody {
    pub params: Vec<ParamItem>,
}

#[derive(Debug, Deserialize)]
pub struct ParamItem {
    pub id: u8,
    pub value: u32,
}

pub async fn set_params(
    State(state): State<AppState>,
    Path(phy_id): Path<String>,
    request_id: RequestId,
    Json(body): Json<ParamsBody>,
) -> Response {
    if body.params.is_empty() {
        return response::bad_request(&request_id, "params must not be empty");
    }
    let params: Vec<payload::Param> = body
        .params
        .iter()
        .map(|p| payload::Param {
            id: p.id,
            value: p.value,
        })
        .collect();
    queue_command(
        &state,
        &request_id,
        &phy_id,
        command::PARAM_SET,
        payload::encode_param_set(&params),
        outbound::PRIORITY_PARAM,
        10_000,
    )
    .await
}

// ---------------------------------------------------------------------------
// POST /devices/{phy_id}/ota
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct OtaBody {
    pub firmware_url: String,
    pub version: String,
    pub md5: String,
    pub size: u32,
    pub target_type: u8,
    pub target_socket: Option<u8>,
}

pub async fn push_ota(
    State(state): State<AppState>,
    Path(phy_id): Path<String>,
    request_id: RequestId,
    Json(body): Json<OtaBody>,
) -> Response {
    let md5: [u8; 16] = match hex::decode(&body.md5).ok().and_then(|b| b.try_into().ok()) {
        Some(md5) => md5,
        None => return response::bad_request(&request_id, "md5 must be 32 hex characters"),
    };
    if !matches!(body.target_type, 1 | 2) {
        return response::bad_request(&request_id, "target_type must be 1 or 2");
    }
    let push = payload::OtaPush {
        url: body.firmware_url,
        version: body.version,
        md5,
        size: body.size,
        target_type: body.target_type,
        target_socket: body.target_socket.unwrap_or(0),
    };
    queue_command(
        &state,
        &request_id,
        &phy_id,
        command::OTA_PUSH,
        push.encode(),
        outbound::PRIORITY_OTA,
        15_000,
    )
    .await
}

// ---------------------------------------------------------------------------
// POST /devices/{phy_id}/network
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct NetworkBody {
    pub channel: u8,
    pub nodes: Vec<NetworkNodeBody>,
}

#[derive(Debug, Deserialize)]
pub struct NetworkNodeBody {
    pub socket_no: u8,
    pub mac: String,
}

fn parse_mac(raw: &str) -> Option<[u8; 6]> {
    let cleaned: String = raw.chars().filter(|c| *c != ':' && *c != '-').collect();
    hex::decode(cleaned).ok()?.try_into().ok()
}

pub async fn configure_network(
    State(state): State<AppState>,
    Path(phy_id): Path<String>,
    request_id: RequestId,
    Json(body): Json<NetworkBody>,
) -> Response {
    let mut nodes = Vec::with_capacity(body.nodes.len());
    for node in &body.nodes {
        let Some(mac) = parse_mac(&node.mac) else {
            return response::bad_request(
                &request_id,
                format!("mac {} is not 6 hex bytes", node.mac),
            );
        };
        nodes.push(payload::NetworkNode {
            socket_no: node.socket_no,
            mac,
        });
    }
    let config = payload::NetworkConfig {
        channel: body.channel,
        nodes,
    };
    queue_command(
        &state,
        &request_id,
        &phy_id,
        command::NETWORK_CONFIG,
        config.encode(),
        outbound::PRIORITY_NETWORK,
        10_000,
    )
    .await
}

// ---------------------------------------------------------------------------
// Shared plumbing
// ---------------------------------------------------------------------------

async fn queue_command(
    state: &AppState,
    request_id: &RequestId,
    phy_id: &str,
    cmd: u16,
    payload_bytes: Vec<u8>,
    priority: i32,
    timeout_ms: i32,
) -> Response {
    let device = match repo::devices::get_by_phy(&state.pool, phy_id).await {
        Ok(Some(device)) => device,
        Ok(None) => {
            return response::not_found(request_id, format!("unknown device {phy_id}"));
        }
        Err(e) => return response::internal_error(request_id, e),
    };
    let gw = match outbound::gateway_id(phy_id) {
        Ok(gw) => gw,
        Err(e) => return response::bad_request(request_id, e.to_string()),
    };
    let frame = Frame::downlink(cmd, state.msg_ids.next(), gw, payload_bytes);
    let bytes = match frame.to_bytes() {
        Ok(bytes) => bytes,
        Err(e) => return response::bad_request(request_id, e.to_string()),
    };
    let msg = NewOutbound::new(device.internal_id, phy_id, bytes)
        .priority(priority)
        .timeout_ms(timeout_ms);
    match outbound::submit(state, msg).await {
        Ok(id) => response::ok(
            request_id,
            serde_json::json!({
                "message_id": id,
                "command": command::name(cmd),
            }),
        ),
        Err(e) => response::internal_error(request_id, e),
    }
}
