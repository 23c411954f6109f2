//! Order read endpoints.

use axum::extract::{Path, Query, State};
use axum::response::Response;
use serde::Deserialize;

use crate::http::response::{self, RequestId};
use crate::orders::OrderStatus;
use crate::repo;
use crate::repo::orders::{OrderFilter, OrderRow};
use crate::state::AppState;

pub fn order_json(order: &OrderRow) -> serde_json::Value {
    serde_json::json!({
        "order_no": order.order_no,
        "business_no": order.business_no,
        "device_internal_id": order.device_internal_id,
        "port_no": order.port_no,
        "charge_mode": order.charge_mode,
        "amount_cent": order.amount_cent,
        "duration_min": order.duration_min,
        "power_w": order.power_w,
        "status": order.status.as_i16(),
        "status_label": order.status.label(),
        "end_reason": order.end_reason,
        "start_time": order.start_time.map(|t| t.to_rfc3339()),
        "end_time": order.end_time.map(|t| t.to_rfc3339()),
        "kwh_0p01": order.kwh_0p01,
        "test_session_id": order.test_session_id,
        "created_at": order.created_at.to_rfc3339(),
        "updated_at": order.updated_at.to_rfc3339(),
    })
}

pub async fn get_order(
    State(state): State<AppState>,
    Path(order_no): Path<String>,
    request_id: RequestId,
) -> Response {
    match repo::orders::get_by_order_no(&state.pool, &order_no).await {
        Ok(Some(order)) => response::ok(&request_id, order_json(&order)),
        Ok(None) => response::not_found(&request_id, format!("unknown order {order_no}")),
        Err(e) => response::internal_error(&request_id, e),
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub status: Option<i16>,
    pub phy_id: Option<String>,
}

pub async fn list_orders(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
    request_id: RequestId,
) -> Response {
    let status = match query.status {
        None => None,
        Some(raw) => match OrderStatus::from_i16(raw) {
            Some(status) => Some(status),
            None => {
                return response::bad_request(&request_id, format!("unknown status {raw}"));
            }
        },
    };

    let device_internal_id = match &query.phy_id {
        None => None,
        Some(phy_id) => match repo::devices::get_by_phy(&state.pool, phy_id).await {
            Ok(Some(device)) => Some(device.internal_id),
            Ok(None) => {
                return response::not_found(&request_id, format!("unknown device {phy_id}"));
            }
            Err(e) => return response::internal_error(&request_id, e),
        },
    };

    let filter = OrderFilter {
        device_internal_id,
        status,
        limit: query.limit.unwrap_or(50).clamp(1, 200),
        offset: query.offset.unwrap_or(0).max(0),
    };
    match repo::orders::list(&state.pool, &filter).await {
        Ok((orders, total)) => response::ok(
            &request_id,
            serde_json::json!({
                "orders": orders.iter().map(order_json).collect::<Vec<_>>(),
                "total": total,
                "limit": filter.limit,
                "offset": filter.offset,
            }),
        ),
        Err(e) => response::internal_error(&request_id, e),
    }
}
