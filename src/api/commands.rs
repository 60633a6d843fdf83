//! Fire-and-forget command endpoints

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    routing::post,
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{required, ApiError, ApiState, DeviceBody};
use crate::Error;

type ApiResult<T> = Result<T, ApiError>;

/// Arbitrary command body
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandBody {
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub extra: Option<Value>,
}

/// On/off toggle body
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToggleBody {
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToastBody {
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Build command routes
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/command", post(command))
        .route("/flashlight", post(flashlight))
        .route("/hotspot", post(hotspot))
        .route("/toast", post(toast))
        .route("/dismissToast", post(dismiss_toast))
        .with_state(state)
}

async fn queue(
    state: &ApiState,
    device_id: &str,
    verb: &str,
    payload: Option<Value>,
) -> ApiResult<Json<Value>> {
    let key = state.broker.dispatch(device_id, verb, payload).await?;
    Ok(Json(json!({
        "status": "queued",
        "deviceId": device_id,
        "command": verb,
        "key": key,
    })))
}

async fn command(
    State(state): State<Arc<ApiState>>,
    body: Result<Json<CommandBody>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(body) = body?;
    let device_id = required(body.device_id, "deviceId")?;
    let verb = required(body.command, "command")?;
    queue(&state, &device_id, &verb, body.extra).await
}

/// `flashlight on|off`
async fn flashlight(
    State(state): State<Arc<ApiState>>,
    body: Result<Json<ToggleBody>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(body) = body?;
    let device_id = required(body.device_id, "deviceId")?;
    let toggle = on_off(body.state)?;
    queue(&state, &device_id, &format!("flashlight {toggle}"), None).await
}

/// `hotspot on|off`
async fn hotspot(
    State(state): State<Arc<ApiState>>,
    body: Result<Json<ToggleBody>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(body) = body?;
    let device_id = required(body.device_id, "deviceId")?;
    let toggle = on_off(body.state)?;
    queue(&state, &device_id, &format!("hotspot {toggle}"), None).await
}

async fn toast(
    State(state): State<Arc<ApiState>>,
    body: Result<Json<ToastBody>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(body) = body?;
    let device_id = required(body.device_id, "deviceId")?;
    let message = required(body.message, "message")?;
    queue(&state, &device_id, "showToast", Some(Value::String(message))).await
}

async fn dismiss_toast(
    State(state): State<Arc<ApiState>>,
    body: Result<Json<DeviceBody>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(body) = body?;
    let device_id = required(body.device_id, "deviceId")?;
    queue(&state, &device_id, "dismissToast", None).await
}

fn on_off(state: Option<String>) -> ApiResult<&'static str> {
    match required(state, "state")?.to_ascii_lowercase().as_str() {
        "on" | "true" | "1" => Ok("on"),
        "off" | "false" | "0" => Ok("off"),
        other => Err(Error::Validation(format!("state must be on or off, got '{other}'")).into()),
    }
}
