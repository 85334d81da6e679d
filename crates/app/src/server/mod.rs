//! Admin REST surface and the subscriber event stream.

mod events_ws;
mod handlers;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use tower_http::trace::TraceLayer;

use crate::calls::CallManager;
use crate::error::CallError;

#[derive(Clone)]
pub struct AppState {
    pub manager: CallManager,
    pub api_key: Option<Arc<String>>,
}

/// Build the admin router.
pub fn router(manager: CallManager, api_key: Option<String>) -> Router {
    let state = AppState {
        manager,
        api_key: api_key.map(Arc::new),
    };

    Router::new()
        .route("/health", get(handlers::health))
        .route("/calls", get(handlers::list_calls).post(handlers::originate))
        .route("/calls/{id}", get(handlers::get_call).delete(handlers::hangup))
        .route("/calls/{id}/play", post(handlers::play))
        .route("/calls/{id}/speak", post(handlers::speak))
        .route("/calls/{id}/dtmf", post(handlers::dtmf))
        .route("/calls/{id}/transfer", post(handlers::transfer))
        .route("/calls/{id}/capture/start", post(handlers::capture_start))
        .route("/calls/{id}/capture/stop", post(handlers::capture_stop))
        .route("/calls/{id}/record/start", post(handlers::record_start))
        .route("/calls/{id}/record/stop", post(handlers::record_stop))
        .route("/bridges", get(handlers::list_bridges).post(handlers::create_bridge))
        .route(
            "/bridges/{id}",
            get(handlers::get_bridge).delete(handlers::destroy_bridge),
        )
        .route("/bridges/{id}/channels", post(handlers::bridge_add_channel))
        .route(
            "/bridges/{id}/channels/{channel_id}",
            delete(handlers::bridge_remove_channel),
        )
        .route("/recordings", get(handlers::list_recordings))
        .route(
            "/recordings/{name}",
            get(handlers::get_recording).delete(handlers::delete_recording),
        )
        .route("/recordings/{name}/file", get(handlers::recording_file))
        .route("/recordings/{name}/copy", post(handlers::copy_recording))
        .route("/endpoints", get(handlers::list_endpoints))
        .route(
            "/endpoints/{technology}/{resource}",
            get(handlers::get_endpoint),
        )
        .route(
            "/allowlist",
            get(handlers::get_allowlist).put(handlers::put_allowlist),
        )
        .route("/events", get(events_ws::events_ws))
        .layer(middleware::from_fn_with_state(state.clone(), require_api_key))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Reject requests without the configured key. The event stream is guarded
/// the same way as the REST routes.
async fn require_api_key(
    axum::extract::State(state): axum::extract::State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(expected) = &state.api_key else {
        return Ok(next.run(req).await);
    };
    let provided = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok());
    if provided == Some(expected.as_str()) {
        Ok(next.run(req).await)
    } else {
        Err(StatusCode::UNAUTHORIZED)
    }
}

/// An orchestrator error plus the context needed to choose a status code:
/// a timeout means 408 for a transfer but 504 for synthesis.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// Default mapping for switch-facing operations.
    pub fn from_call(err: CallError) -> Self {
        Self::map(err, StatusCode::GATEWAY_TIMEOUT)
    }

    /// Mapping for the transfer route, where a timeout is the target not
    /// answering.
    pub fn from_transfer(err: CallError) -> Self {
        Self::map(err, StatusCode::REQUEST_TIMEOUT)
    }

    fn map(err: CallError, timeout_status: StatusCode) -> Self {
        let status = match &err {
            CallError::NotFound(_) => StatusCode::NOT_FOUND,
            CallError::Forbidden(_) => StatusCode::FORBIDDEN,
            CallError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            CallError::Timeout(_) => timeout_status,
            CallError::Validation(_) => StatusCode::BAD_REQUEST,
            CallError::Protocol(_) => StatusCode::BAD_GATEWAY,
            CallError::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            CallError::Cancelled => StatusCode::CONFLICT,
            CallError::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

impl From<CallError> for ApiError {
    fn from(err: CallError) -> Self {
        ApiError::from_call(err)
    }
}

impl From<voxbridge_switch::SwitchError> for ApiError {
    fn from(err: voxbridge_switch::SwitchError) -> Self {
        ApiError::from_call(err.into())
    }
}
