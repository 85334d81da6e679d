//! Admin route handlers. Thin: validation and status mapping live here,
//! call semantics live in the orchestrator.

use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::allowlist::AllowlistEntries;
use crate::calls::{OriginateRequest, SpeakParams};
use crate::registry::BridgeRecord;
use crate::server::{ApiError, AppState};

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

// ------------------------------------------------------------------- calls

pub async fn list_calls(State(state): State<AppState>) -> Json<serde_json::Value> {
    let calls = state.manager.registry().snapshot();
    Json(serde_json::json!({ "calls": calls }))
}

pub async fn get_call(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let record = state
        .manager
        .registry()
        .get(&id)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "call not found"))?;
    Ok(Json(serde_json::to_value(record).unwrap_or_default()))
}

pub async fn originate(
    State(state): State<AppState>,
    Json(req): Json<OriginateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.endpoint.is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "endpoint is required"));
    }
    let record = state.manager.originate(req).await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::to_value(record).unwrap_or_default()),
    ))
}

#[derive(Deserialize)]
pub struct HangupBody {
    reason: Option<String>,
}

pub async fn hangup(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<HangupBody>>,
) -> Result<StatusCode, ApiError> {
    let reason = body.and_then(|Json(b)| b.reason);
    state.manager.hangup(&id, reason).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
#[serde(untagged)]
pub enum MediaSpec {
    One(String),
    Sequence(Vec<String>),
}

#[derive(Deserialize)]
pub struct PlayBody {
    media: MediaSpec,
}

pub async fn play(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<PlayBody>,
) -> Result<StatusCode, ApiError> {
    let uris = match body.media {
        MediaSpec::One(uri) => vec![uri],
        MediaSpec::Sequence(uris) => uris,
    };
    state.manager.play_media(&id, uris).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn speak(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(params): Json<SpeakParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let result = state.manager.speak(&id, params).await?;
    Ok(Json(serde_json::to_value(result).unwrap_or_default()))
}

#[derive(Deserialize)]
pub struct DtmfBody {
    digits: String,
}

pub async fn dtmf(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<DtmfBody>,
) -> Result<StatusCode, ApiError> {
    state.manager.send_dtmf(&id, &body.digits).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct TransferBody {
    endpoint: String,
    #[serde(rename = "callerId")]
    caller_id: Option<String>,
    #[serde(rename = "timeoutMs")]
    timeout_ms: Option<u64>,
}

pub async fn transfer(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<TransferBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let result = state
        .manager
        .transfer(
            &id,
            body.endpoint,
            body.caller_id,
            body.timeout_ms.map(Duration::from_millis),
        )
        .await
        .map_err(ApiError::from_transfer)?;
    Ok(Json(serde_json::to_value(result).unwrap_or_default()))
}

pub async fn capture_start(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let info = state.manager.start_capture(&id).await?;
    Ok(Json(serde_json::to_value(info).unwrap_or_default()))
}

pub async fn capture_stop(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.manager.stop_capture(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize, Default)]
pub struct RecordBody {
    name: Option<String>,
    format: Option<String>,
    #[serde(rename = "maxDurationSeconds")]
    max_duration_seconds: Option<u32>,
    #[serde(default)]
    beep: bool,
}

pub async fn record_start(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<RecordBody>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let name = state
        .manager
        .start_recording(&id, body.name, body.format, body.max_duration_seconds, body.beep)
        .await?;
    Ok(Json(serde_json::json!({ "name": name })))
}

pub async fn record_stop(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.manager.stop_recording(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ----------------------------------------------------------------- bridges

#[derive(Deserialize, Default)]
pub struct CreateBridgeBody {
    name: Option<String>,
}

pub async fn list_bridges(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "bridges": state.manager.bridges().list() }))
}

pub async fn create_bridge(
    State(state): State<AppState>,
    body: Option<Json<CreateBridgeBody>>,
) -> Result<impl IntoResponse, ApiError> {
    let name = body.and_then(|Json(b)| b.name);
    let bridge_id = format!("admin-{}", Uuid::new_v4());
    let bridge = state
        .manager
        .switch()
        .create_bridge(&bridge_id, name.as_deref())
        .await?;
    let record = BridgeRecord {
        bridge_id: bridge.id.clone(),
        name,
        channel_ids: bridge.channels,
        created_at: Utc::now(),
    };
    state.manager.bridges().insert(record.clone());
    state.manager.registry().emit(crate::registry::CallEvent::new(
        "bridge.created",
        "",
        serde_json::json!({ "bridgeID": record.bridge_id }),
    ));
    Ok((
        StatusCode::CREATED,
        Json(serde_json::to_value(record).unwrap_or_default()),
    ))
}

pub async fn get_bridge(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let record = state
        .manager
        .bridges()
        .get(&id)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "bridge not found"))?;
    Ok(Json(serde_json::to_value(record).unwrap_or_default()))
}

pub async fn destroy_bridge(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.manager.bridges().get(&id).is_none() {
        return Err(ApiError::new(StatusCode::NOT_FOUND, "bridge not found"));
    }
    state.manager.switch().destroy_bridge(&id).await?;
    state.manager.bridges().remove(&id);
    state.manager.registry().emit(crate::registry::CallEvent::new(
        "bridge.destroyed",
        "",
        serde_json::json!({ "bridgeID": id }),
    ));
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct BridgeChannelBody {
    #[serde(rename = "channelId")]
    channel_id: String,
}

pub async fn bridge_add_channel(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<BridgeChannelBody>,
) -> Result<StatusCode, ApiError> {
    if state.manager.bridges().get(&id).is_none() {
        return Err(ApiError::new(StatusCode::NOT_FOUND, "bridge not found"));
    }
    state
        .manager
        .switch()
        .add_channel_to_bridge(&id, &body.channel_id)
        .await?;
    if let Ok(bridge) = state.manager.switch().get_bridge(&id).await {
        state.manager.bridges().set_channels(&id, bridge.channels);
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn bridge_remove_channel(
    State(state): State<AppState>,
    Path((id, channel_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    if state.manager.bridges().get(&id).is_none() {
        return Err(ApiError::new(StatusCode::NOT_FOUND, "bridge not found"));
    }
    state
        .manager
        .switch()
        .remove_channel_from_bridge(&id, &channel_id)
        .await?;
    if let Ok(bridge) = state.manager.switch().get_bridge(&id).await {
        state.manager.bridges().set_channels(&id, bridge.channels);
    }
    Ok(StatusCode::NO_CONTENT)
}

// -------------------------------------------------------------- recordings

pub async fn list_recordings(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let recordings = state.manager.switch().list_stored_recordings().await?;
    Ok(Json(serde_json::json!({ "recordings": recordings })))
}

pub async fn get_recording(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let recording = state.manager.switch().get_stored_recording(&name).await?;
    Ok(Json(serde_json::to_value(recording).unwrap_or_default()))
}

pub async fn recording_file(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let bytes = state
        .manager
        .switch()
        .get_stored_recording_bytes(&name)
        .await?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        bytes,
    ))
}

pub async fn delete_recording(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.manager.switch().delete_stored_recording(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct CopyRecordingBody {
    destination: String,
}

pub async fn copy_recording(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<CopyRecordingBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let copied = state
        .manager
        .switch()
        .copy_stored_recording(&name, &body.destination)
        .await?;
    Ok(Json(serde_json::to_value(copied).unwrap_or_default()))
}

// --------------------------------------------------------------- endpoints

pub async fn list_endpoints(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let endpoints = state.manager.switch().list_endpoints().await?;
    Ok(Json(serde_json::json!({ "endpoints": endpoints })))
}

pub async fn get_endpoint(
    State(state): State<AppState>,
    Path((technology, resource)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let endpoint = state
        .manager
        .switch()
        .get_endpoint(&technology, &resource)
        .await?;
    Ok(Json(serde_json::to_value(endpoint).unwrap_or_default()))
}

// --------------------------------------------------------------- allowlist

pub async fn get_allowlist(State(state): State<AppState>) -> Json<AllowlistEntries> {
    Json(state.manager.allowlist().entries())
}

pub async fn put_allowlist(
    State(state): State<AppState>,
    Json(entries): Json<AllowlistEntries>,
) -> Result<StatusCode, ApiError> {
    state
        .manager
        .allowlist()
        .replace(entries)
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}
