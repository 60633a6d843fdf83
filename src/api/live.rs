//! Live view endpoints
//!
//! Operators open `multipart/x-mixed-replace` streams; devices post frames
//! which are fanned out to every open stream for that device.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{
        rejection::{JsonRejection, QueryRejection},
        DefaultBodyLimit, Path, Query, State,
    },
    http::header,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{required, ApiError, ApiState};
use crate::relay::{multipart, CameraFacing};

type ApiResult<T> = Result<T, ApiError>;

/// Largest accepted frame upload (base64 inflates frames by a third)
const FRAME_BODY_LIMIT: usize = 16 * 1024 * 1024;

#[derive(Debug, Default, Deserialize)]
pub struct CameraQuery {
    #[serde(default)]
    pub camera: Option<String>,
}

impl CameraQuery {
    fn facing(self) -> ApiResult<CameraFacing> {
        Ok(self
            .camera
            .filter(|c| !c.is_empty())
            .map(|c| c.parse::<CameraFacing>())
            .transpose()?
            .unwrap_or_default())
    }
}

/// Frame upload from a device
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameBody {
    #[serde(default)]
    pub device_id: Option<String>,
    /// Base64 image
    #[serde(default)]
    pub frame: Option<String>,
}

/// Build live view routes
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/live/{device_id}", get(live))
        .route(
            "/frame",
            post(frame).layer(DefaultBodyLimit::max(FRAME_BODY_LIMIT)),
        )
        .route("/snapshot/{device_id}", get(snapshot))
        .with_state(state)
}

/// Stream frames until the client goes away
async fn live(
    State(state): State<Arc<ApiState>>,
    Path(device_id): Path<String>,
    query: Result<Query<CameraQuery>, QueryRejection>,
) -> ApiResult<Response> {
    let Query(query) = query?;
    let camera = query.facing()?;

    let viewer = state.broker.watch(&device_id, camera).await?;
    tracing::info!(device_id = %device_id, viewer = %viewer.id(), camera = %camera, "live view opened");

    // Dropping the body drops the viewer, which unsubscribes it
    let body = Body::from_stream(viewer.map(Ok::<_, Infallible>));
    Ok((
        [
            (header::CONTENT_TYPE, multipart::CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache, no-store"),
            (header::CONNECTION, "keep-alive"),
        ],
        body,
    )
        .into_response())
}

/// Device frame ingress
async fn frame(
    State(state): State<Arc<ApiState>>,
    body: Result<Json<FrameBody>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(body) = body?;
    let device_id = required(body.device_id, "deviceId")?;
    let encoded = required(body.frame, "frame")?;
    crate::store::validate_segment(&device_id)?;

    let image = multipart::decode_image(&encoded)?;
    let delivered = state.broker.relay().relay_frame(&device_id, &image);
    tracing::trace!(device_id = %device_id, bytes = image.len(), delivered, "frame relayed");

    Ok(Json(json!({ "deliveredTo": delivered })))
}

/// One still image
async fn snapshot(
    State(state): State<Arc<ApiState>>,
    Path(device_id): Path<String>,
    query: Result<Query<CameraQuery>, QueryRejection>,
) -> ApiResult<Response> {
    let Query(query) = query?;
    let camera = query.facing()?;

    let image = state.broker.snapshot(&device_id, camera, None).await?;
    Ok((
        [(header::CONTENT_TYPE, multipart::PART_CONTENT_TYPE)],
        image,
    )
        .into_response())
}
