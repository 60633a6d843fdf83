//! Device presence endpoints

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{required, ApiError, ApiState};
use crate::presence::OnlineDevice;

type ApiResult<T> = Result<T, ApiError>;

/// Register/heartbeat body
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceBody {
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub info: Option<Value>,
}

/// Build presence routes
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/register", post(register))
        .route("/heartbeat", post(heartbeat))
        .route("/devices", get(list_devices))
        .route("/device/{device_id}", delete(remove_device))
        .route("/clear/{device_id}", delete(clear_device))
        .with_state(state)
}

async fn register(
    State(state): State<Arc<ApiState>>,
    body: Result<Json<PresenceBody>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(body) = body?;
    let device_id = required(body.device_id, "deviceId")?;
    state.broker.presence().register(&device_id, body.info).await?;
    Ok(Json(json!({ "status": "registered", "deviceId": device_id })))
}

async fn heartbeat(
    State(state): State<Arc<ApiState>>,
    body: Result<Json<PresenceBody>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(body) = body?;
    let device_id = required(body.device_id, "deviceId")?;
    state.broker.presence().heartbeat(&device_id, body.info).await?;
    Ok(Json(json!({ "status": "alive" })))
}

/// Devices seen inside the presence window
async fn list_devices(State(state): State<Arc<ApiState>>) -> ApiResult<Json<Vec<OnlineDevice>>> {
    Ok(Json(state.broker.presence().list_online().await?))
}

async fn remove_device(
    State(state): State<Arc<ApiState>>,
    Path(device_id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.broker.presence().remove(&device_id).await?;
    Ok(Json(json!({ "status": "removed" })))
}

/// Wipe queued commands, requests and answers for a device
async fn clear_device(
    State(state): State<Arc<ApiState>>,
    Path(device_id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.broker.clear(&device_id).await?;
    Ok(Json(json!({ "status": "cleared", "deviceId": device_id })))
}
