//! Charging-socket gateway service.
//!
//! Terminates long-lived TCP connections from field gateways, decodes the
//! BKV wire protocol, keeps authoritative runtime state (presence, port
//! status, orders), and mediates between devices and the business API:
//! durable outbound commands with per-device ordering, an eleven-state
//! order machine with reconciliation sweeps, and an ordered webhook event
//! pipeline.

pub mod config;
pub mod consistency;
pub mod db;
pub mod events;
pub mod http;
pub mod metrics;
pub mod orders;
pub mod outbound;
pub mod reconciler;
pub mod repo;
pub mod session;
pub mod state;
pub mod tcp;

pub use state::AppState;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/devices/{phy_id}/charge", post(http::devices::charge))
        .route("/devices/{phy_id}/stop", post(http::devices::stop))
        .route("/devices/{phy_id}/cancel", post(http::devices::cancel))
        .route("/devices/{phy_id}", get(http::devices::get_device))
        .route("/devices/{phy_id}/params", post(http::devices::set_params))
        .route("/devices/{phy_id}/ota", post(http::devices::push_ota))
        .route(
            "/devices/{phy_id}/network",
            post(http::devices::configure_network),
        )
        .route("/orders/{order_no}", get(http::orders::get_order))
        .route("/orders", get(http::orders::list_orders))
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            http::api_key_middleware,
        ))
        .layer(middleware::from_fn(http::request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Spawn the long-running workers: outbound dispatcher, reconciler and the
/// webhook push worker. The TCP listener is spawned separately because it
/// owns a bound socket.
pub fn spawn_workers(state: &AppState, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
    vec![
        tokio::spawn(outbound::dispatcher::run(state.clone(), shutdown.clone())),
        tokio::spawn(reconciler::run(state.clone(), shutdown.clone())),
        tokio::spawn(events::push::run(state.clone(), shutdown.clone())),
    ]
}

mod health {
    use axum::response::IntoResponse;

    pub async fn healthz() -> impl IntoResponse {
        "ok"
    }

    pub async fn readyz() -> impl IntoResponse {
        "ok"
    }
}
