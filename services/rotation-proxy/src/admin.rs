//! Status and control surface
//!
//! Runs on a separate loopback listener (default 127.0.0.1:9190), kept off
//! the proxy port so pool introspection and admin actions are never
//! exposed alongside client traffic.
//!
//! Endpoints:
//! - GET  /admin/pool                      — pool snapshot with totals
//! - GET  /admin/accounts                  — per-account records
//! - POST /admin/accounts/{name}/refresh   — force an immediate refresh
//! - POST /admin/accounts/{name}/enable    — restore to available
//! - POST /admin/accounts/{name}/disable   — take out of rotation

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use tracing::info;

use claude_pool::Pool;

/// Shared state for admin handlers.
#[derive(Clone)]
pub struct AdminState {
    pub pool: Arc<Pool>,
}

/// Build the admin router.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/pool", get(pool_status))
        .route("/admin/accounts", get(list_accounts))
        .route("/admin/accounts/{name}/refresh", post(force_refresh))
        .route("/admin/accounts/{name}/enable", post(enable_account))
        .route("/admin/accounts/{name}/disable", post(disable_account))
        .with_state(state)
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

fn not_found(name: &str) -> Response {
    json_response(
        StatusCode::NOT_FOUND,
        serde_json::json!({ "error": format!("no such account: {name}") }),
    )
}

/// GET /admin/pool — totals, next selection, and per-account records.
/// Token material never appears here.
async fn pool_status(State(state): State<AdminState>) -> Response {
    let view = state.pool.snapshot().await;
    json_response(
        StatusCode::OK,
        serde_json::to_value(&view).unwrap_or_else(|_| serde_json::json!({})),
    )
}

/// GET /admin/accounts — just the per-account records.
async fn list_accounts(State(state): State<AdminState>) -> Response {
    let view = state.pool.snapshot().await;
    json_response(
        StatusCode::OK,
        serde_json::json!({
            "accounts": serde_json::to_value(&view.accounts).unwrap_or_default()
        }),
    )
}

/// POST /admin/accounts/{name}/refresh — queue an immediate refresh.
///
/// Accepted (202) rather than performed inline: the refresh scheduler
/// owns the grant and its single-flight guarantee.
async fn force_refresh(State(state): State<AdminState>, Path(name): Path<String>) -> Response {
    match state.pool.request_refresh(&name).await {
        Ok(()) => {
            info!(account = %name, "force refresh requested");
            json_response(
                StatusCode::ACCEPTED,
                serde_json::json!({ "account": name, "status": "refresh_requested" }),
            )
        }
        Err(_) => not_found(&name),
    }
}

/// POST /admin/accounts/{name}/enable — any state back to available.
async fn enable_account(State(state): State<AdminState>, Path(name): Path<String>) -> Response {
    match state.pool.enable(&name).await {
        Ok(()) => json_response(
            StatusCode::OK,
            serde_json::json!({ "account": name, "status": "available" }),
        ),
        Err(_) => not_found(&name),
    }
}

/// POST /admin/accounts/{name}/disable — take out of rotation.
async fn disable_account(State(state): State<AdminState>, Path(name): Path<String>) -> Response {
    match state.pool.disable(&name).await {
        Ok(()) => json_response(
            StatusCode::OK,
            serde_json::json!({ "account": name, "status": "disabled" }),
        ),
        Err(_) => not_found(&name),
    }
}
