//! Request/response endpoints
//!
//! Each route writes one request for the device and holds the HTTP call
//! open until the device answers or the wait window closes.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{rejection::JsonRejection, rejection::PathRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::{required, ApiError, ApiState};
use crate::correlator::{Reply, RequestKind};
use crate::Error;

type ApiResult<T> = Result<T, ApiError>;

/// Longest wait a caller may ask for
const MAX_TIMEOUT: Duration = Duration::from_secs(300);

/// Kinds served by `GET /api/{kind}/{deviceId}`
const FETCH_KINDS: [RequestKind; 6] = [
    RequestKind::Sms,
    RequestKind::Calls,
    RequestKind::Gallery,
    RequestKind::InstalledApps,
    RequestKind::SimInfo,
    RequestKind::HotspotStatus,
];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallBody {
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellBody {
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendSmsBody {
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Body of the generic request route
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenericBody {
    /// Members written next to the request ID
    #[serde(default)]
    pub params: Value,
    /// Wait window override in milliseconds
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Build request routes
pub fn router(state: Arc<ApiState>) -> Router {
    let mut router = Router::new();
    for kind in FETCH_KINDS {
        router = router.route(
            &format!("/{kind}/{{device_id}}"),
            get(move |State(state): State<Arc<ApiState>>, Path(device_id): Path<String>| async move {
                fetch(&state, &device_id, kind).await
            }),
        );
    }

    router
        .route("/installApk", post(install_apk))
        .route("/cmd", post(shell))
        .route("/sendSms", post(send_sms))
        .route("/request/{device_id}/{kind}", post(generic))
        .with_state(state)
}

/// Read-only fetch; the answer's result member is returned under its own name
async fn fetch(state: &ApiState, device_id: &str, kind: RequestKind) -> ApiResult<Json<Value>> {
    let reply = state.broker.request(device_id, kind, Value::Null, None).await?;
    let result = reply.result(kind).cloned().unwrap_or_else(|| {
        if kind.is_listing() {
            Value::Array(Vec::new())
        } else {
            Value::Null
        }
    });

    let mut body = Map::new();
    body.insert(kind.result_field().to_string(), result);
    Ok(Json(Value::Object(body)))
}

/// Download and install a package; a timeout means the install is still running
async fn install_apk(
    State(state): State<Arc<ApiState>>,
    body: Result<Json<InstallBody>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(body) = body?;
    let device_id = required(body.device_id, "deviceId")?;
    let url = required(body.url, "url")?;

    let outcome = state
        .broker
        .request(&device_id, RequestKind::InstallApk, json!({ "url": url }), None)
        .await;
    Ok(match outcome {
        Ok(reply) => Json(json!({
            "status": "success",
            "result": reply.result(RequestKind::InstallApk),
        }))
        .into_response(),
        Err(e) => still_running(RequestKind::InstallApk, e)?,
    })
}

/// Run a shell command on the device
async fn shell(
    State(state): State<Arc<ApiState>>,
    body: Result<Json<ShellBody>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(body) = body?;
    let device_id = required(body.device_id, "deviceId")?;
    let command = required(body.command, "command")?;

    let reply = state
        .broker
        .request(&device_id, RequestKind::Cmd, json!({ "command": command }), None)
        .await?;
    Ok(Json(json!({ "output": reply.result(RequestKind::Cmd) })))
}

async fn send_sms(
    State(state): State<Arc<ApiState>>,
    body: Result<Json<SendSmsBody>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(body) = body?;
    let device_id = required(body.device_id, "deviceId")?;
    let to = required(body.to, "to")?;
    let message = required(body.message, "message")?;

    let reply = state
        .broker
        .request(
            &device_id,
            RequestKind::SendSms,
            json!({ "to": to, "message": message }),
            None,
        )
        .await?;
    Ok(Json(json!({
        "status": "success",
        "result": reply.result(RequestKind::SendSms),
    })))
}

/// Any kind, with caller-supplied params and wait window
async fn generic(
    State(state): State<Arc<ApiState>>,
    path: Result<Path<(String, String)>, PathRejection>,
    body: Result<Json<GenericBody>, JsonRejection>,
) -> ApiResult<Response> {
    let Path((device_id, kind)) = path?;
    let kind: RequestKind = kind.parse()?;
    // Both members are optional, so a request without a JSON body is fine
    let body = match body {
        Ok(Json(body)) => body,
        Err(JsonRejection::MissingJsonContentType(_)) => GenericBody::default(),
        Err(e) => return Err(e.into()),
    };

    let timeout = body
        .timeout_ms
        .map(|ms| {
            let timeout = Duration::from_millis(ms);
            if timeout.is_zero() || timeout > MAX_TIMEOUT {
                Err(Error::Validation(format!(
                    "timeoutMs must be between 1 and {}",
                    MAX_TIMEOUT.as_millis()
                )))
            } else {
                Ok(timeout)
            }
        })
        .transpose()?;

    match state.broker.request(&device_id, kind, body.params, timeout).await {
        Ok(reply) => Ok(Json(reply_body(&reply)).into_response()),
        Err(e) => still_running(kind, e),
    }
}

fn reply_body(reply: &Reply) -> Value {
    json!({
        "requestId": reply.request_id.to_string(),
        "elapsedMs": u64::try_from(reply.elapsed.as_millis()).unwrap_or(u64::MAX),
        "response": reply.payload,
    })
}

/// Turn a timeout of a long-running kind into 202; pass everything else on
fn still_running(kind: RequestKind, error: Error) -> ApiResult<Response> {
    match error {
        Error::TimedOut { .. } if kind.outlives_wait() => {
            tracing::info!(kind = %kind, "no answer yet, reporting as queued");
            Ok((
                StatusCode::ACCEPTED,
                Json(json!({
                    "status": "queued",
                    "message": "started on device, not confirmed yet",
                    "error": error.to_string(),
                })),
            )
                .into_response())
        }
        other => Err(other.into()),
    }
}
