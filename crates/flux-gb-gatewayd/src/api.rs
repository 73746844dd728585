use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use flux_gb_gateway::{GatewayError, PlayOutcome, QueryService, RecordQuery, SessionOrchestrator};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<SessionOrchestrator>,
    pub queries: Arc<QueryService>,
}

/// 媒体服务器 hook 请求体
#[derive(Debug, Deserialize)]
pub struct HookEvent {
    pub stream: String,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub remote_addr: String,
}

#[derive(Debug, Deserialize)]
pub struct RecordListRequest {
    pub device_id: String,
    pub channel_id: String,
    #[serde(default)]
    pub start_time: String,
    #[serde(default)]
    pub end_time: String,
    /// 秒
    #[serde(default)]
    pub timeout: u64,
    #[serde(default, rename = "type")]
    pub record_type: String,
}

#[derive(Debug, Deserialize)]
pub struct CatalogRequest {
    pub device_id: String,
}

#[derive(Debug, Deserialize)]
pub struct PositionSubRequest {
    pub device_id: String,
    pub channel_id: String,
}

/// JSON 应答信封
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub code: i32,
    pub msg: String,
    pub data: Option<T>,
}

fn ok<T: Serialize>(data: T) -> Response {
    Json(ApiResponse {
        code: 0,
        msg: "ok".to_string(),
        data: Some(data),
    })
    .into_response()
}

fn fail(status: StatusCode, code: i32, msg: impl Into<String>) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            code,
            msg: msg.into(),
            data: None,
        }),
    )
        .into_response()
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/api/v1/hook/on_play", post(on_play))
        .route("/api/v1/hook/on_play_done", post(on_play_done))
        .route("/api/v1/hook/on_publish", post(on_publish))
        .route("/api/v1/hook/on_publish_done", post(on_publish_done))
        .route("/api/v1/hook/on_idle_timeout", post(on_stream_timeout))
        .route("/api/v1/hook/on_receive_timeout", post(on_stream_timeout))
        .route("/api/v1/device/list", get(device_list).post(device_list))
        .route("/api/v1/record/list", post(record_list))
        .route("/api/v1/catalog/query", post(catalog_query))
        .route("/api/v1/position/sub", post(position_sub))
        .route("/api/v1/playback/seek", post(not_implemented))
        .route("/api/v1/ptz/control", post(not_implemented))
        .route("/api/v1/broadcast", post(not_implemented))
        .route("/api/v1/talk", post(not_implemented))
        .with_state(state)
}

/// 请求体无法解析时返回 400
fn hook_event(body: Result<Json<HookEvent>, JsonRejection>) -> Result<HookEvent, StatusCode> {
    match body {
        Ok(Json(event)) => Ok(event),
        Err(e) => {
            tracing::warn!(target: "gb_gateway", "Invalid hook body: {}", e);
            Err(StatusCode::BAD_REQUEST)
        }
    }
}

async fn on_play(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    body: Result<Json<HookEvent>, JsonRejection>,
) -> StatusCode {
    let event = match hook_event(body) {
        Ok(event) => event,
        Err(status) => return status,
    };

    tracing::info!(target: "gb_gateway", stream_id = %event.stream, protocol = %event.protocol, "play");

    match state.orchestrator.play(&event.stream, &query).await {
        PlayOutcome::DeviceOffline => StatusCode::BAD_REQUEST,
        _ => StatusCode::OK,
    }
}

async fn on_play_done(body: Result<Json<HookEvent>, JsonRejection>) -> StatusCode {
    match hook_event(body) {
        Ok(event) => {
            tracing::info!(target: "gb_gateway", stream_id = %event.stream, protocol = %event.protocol, "play done");
            StatusCode::OK
        }
        Err(status) => status,
    }
}

async fn on_publish(State(state): State<AppState>, body: Result<Json<HookEvent>, JsonRejection>) -> StatusCode {
    let event = match hook_event(body) {
        Ok(event) => event,
        Err(status) => return status,
    };

    tracing::info!(
        target: "gb_gateway",
        stream_id = %event.stream,
        protocol = %event.protocol,
        remote_addr = %event.remote_addr,
        "publish"
    );
    state.orchestrator.on_publish(&event.stream).await;
    StatusCode::OK
}

async fn on_publish_done(State(state): State<AppState>, body: Result<Json<HookEvent>, JsonRejection>) -> StatusCode {
    let event = match hook_event(body) {
        Ok(event) => event,
        Err(status) => return status,
    };

    tracing::info!(target: "gb_gateway", stream_id = %event.stream, protocol = %event.protocol, "publish done");
    state.orchestrator.on_publish_done(&event.stream).await;
    StatusCode::OK
}

/// on_idle_timeout / on_receive_timeout
async fn on_stream_timeout(State(state): State<AppState>, body: Result<Json<HookEvent>, JsonRejection>) -> StatusCode {
    let event = match hook_event(body) {
        Ok(event) => event,
        Err(status) => return status,
    };

    tracing::info!(target: "gb_gateway", stream_id = %event.stream, protocol = %event.protocol, "stream timeout");

    if state.orchestrator.on_stream_timeout(&event.stream, &event.protocol).await {
        StatusCode::FORBIDDEN
    } else {
        StatusCode::OK
    }
}

async fn device_list(State(state): State<AppState>) -> Response {
    ok(state.queries.devices().list_devices().await)
}

async fn record_list(State(state): State<AppState>, body: Result<Json<RecordListRequest>, JsonRejection>) -> Response {
    let req = match body {
        Ok(Json(req)) => req,
        Err(e) => return fail(StatusCode::BAD_REQUEST, 400, e.to_string()),
    };

    let query = RecordQuery {
        device_id: req.device_id,
        channel_id: req.channel_id,
        start_time: req.start_time,
        end_time: req.end_time,
        record_type: req.record_type,
        timeout: Duration::from_secs(req.timeout),
    };

    match state.queries.query_records(query).await {
        Ok(list) => ok(list),
        Err(GatewayError::DeviceNotFound(device_id)) => fail(StatusCode::OK, 404, format!("device offline: {}", device_id)),
        Err(e) => fail(StatusCode::OK, 500, format!("record query failed: {}", e)),
    }
}

/// 目录应答异步到达，由 SIP 端点写入设备通道列表
async fn catalog_query(State(state): State<AppState>, body: Result<Json<CatalogRequest>, JsonRejection>) -> Response {
    let req = match body {
        Ok(Json(req)) => req,
        Err(e) => return fail(StatusCode::BAD_REQUEST, 400, e.to_string()),
    };

    match state.queries.query_catalog(&req.device_id).await {
        Ok(()) => ok(()),
        Err(GatewayError::DeviceNotFound(device_id)) => fail(StatusCode::OK, 404, format!("device offline: {}", device_id)),
        Err(e) => fail(StatusCode::OK, 500, format!("catalog query failed: {}", e)),
    }
}

async fn position_sub(State(state): State<AppState>, body: Result<Json<PositionSubRequest>, JsonRejection>) -> Response {
    let req = match body {
        Ok(Json(req)) => req,
        Err(e) => return fail(StatusCode::BAD_REQUEST, 400, e.to_string()),
    };

    match state.queries.subscribe_position(&req.device_id, &req.channel_id).await {
        Ok(()) => ok(()),
        Err(GatewayError::DeviceNotFound(device_id)) => fail(StatusCode::OK, 404, format!("device offline: {}", device_id)),
        Err(e) => fail(StatusCode::OK, 500, format!("position subscription failed: {}", e)),
    }
}

async fn not_implemented() -> Response {
    fail(StatusCode::NOT_IMPLEMENTED, 501, "not implemented")
}
