//! In-process stand-in for the switch: the REST surface the adapter calls,
//! the event WebSocket, and media sockets for external-media channels.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{OriginalUri, Path, Query, RawQuery, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use voxbridge_switch::SwitchConfig;

#[derive(Default)]
pub struct MockState {
    /// Every REST request, as "METHOD path?query".
    pub requests: Mutex<Vec<String>>,
    /// Event-socket subscribers.
    event_clients: Mutex<Vec<mpsc::UnboundedSender<String>>>,
    /// Endpoints the switch claims to know, as "TECH/resource".
    pub endpoints: Mutex<HashSet<String>>,
    /// PCM received on media sockets, per connection id.
    pub media_frames: Mutex<HashMap<String, Vec<Vec<u8>>>>,
    /// Outbound feeders for media sockets, per connection id.
    media_tx: Mutex<HashMap<String, mpsc::UnboundedSender<Vec<u8>>>>,
    /// Push StasisStart automatically when an external-media channel is
    /// created, as the real switch does once the app is subscribed.
    pub auto_stasis: AtomicBool,
    /// Push PlaybackFinished shortly after each play request.
    pub playback_autofinish: AtomicBool,
}

pub struct MockSwitch {
    pub addr: SocketAddr,
    pub state: Arc<MockState>,
}

impl MockSwitch {
    pub async fn start() -> Self {
        let state = Arc::new(MockState {
            auto_stasis: AtomicBool::new(true),
            playback_autofinish: AtomicBool::new(true),
            ..MockState::default()
        });

        let router = Router::new()
            .route("/ari/events", get(events_ws))
            .route("/ari/channels", post(originate))
            .route("/ari/channels/externalMedia", post(external_media))
            .route("/ari/channels/{id}", delete(logged_no_content))
            .route("/ari/channels/{id}/answer", post(logged_no_content))
            .route("/ari/channels/{id}/ring", post(logged_no_content))
            .route("/ari/channels/{id}/dtmf", post(logged_no_content))
            .route("/ari/channels/{id}/play/{playback_id}", post(play))
            .route("/ari/channels/{id}/record", post(record))
            .route("/ari/channels/{id}/snoop/{snoop_id}", post(snoop))
            .route("/ari/bridges", post(create_bridge))
            .route("/ari/bridges/{id}", delete(logged_no_content))
            .route("/ari/bridges/{id}/addChannel", post(logged_no_content))
            .route("/ari/bridges/{id}/removeChannel", post(logged_no_content))
            .route("/ari/endpoints", get(list_endpoints))
            .route("/ari/endpoints/{tech}/{resource}", get(get_endpoint))
            .route("/media/{connection_id}", get(media_ws))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { addr, state }
    }

    pub fn config(&self) -> SwitchConfig {
        SwitchConfig {
            url: format!("http://{}", self.addr),
            username: "vox".into(),
            password: "secret".into(),
            app: "voxbridge".into(),
        }
    }

    pub fn add_endpoint(&self, technology: &str, resource: &str) {
        self.state
            .endpoints
            .lock()
            .insert(format!("{technology}/{resource}"));
    }

    /// Push a raw switch event to every connected event subscriber.
    pub fn push_event(&self, event: serde_json::Value) {
        push(&self.state, event);
    }

    /// Announce a new inbound channel.
    pub fn push_inbound_channel(&self, channel_id: &str, caller_number: &str) {
        self.push_event(serde_json::json!({
            "type": "StasisStart",
            "args": [],
            "channel": {
                "id": channel_id,
                "state": "Ring",
                "caller": { "name": "", "number": caller_number },
                "dialplan": { "exten": "100", "context": "default" },
            },
        }));
    }

    pub fn push_stasis_end(&self, channel_id: &str) {
        self.push_event(serde_json::json!({
            "type": "StasisEnd",
            "channel": { "id": channel_id },
        }));
    }

    pub fn requests(&self) -> Vec<String> {
        self.state.requests.lock().clone()
    }

    pub fn requests_matching(&self, needle: &str) -> usize {
        self.state
            .requests
            .lock()
            .iter()
            .filter(|r| r.contains(needle))
            .count()
    }

    /// Feed PCM into a media socket, as the switch would for captured audio.
    pub fn send_media(&self, connection_id: &str, frame: Vec<u8>) -> bool {
        match self.state.media_tx.lock().get(connection_id) {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    /// Total PCM bytes received on a media socket.
    pub fn media_bytes_received(&self, connection_id: &str) -> usize {
        self.state
            .media_frames
            .lock()
            .get(connection_id)
            .map(|frames| frames.iter().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// Wait until at least one event subscriber is connected.
    pub async fn wait_for_event_client(&self) {
        for _ in 0..100 {
            if !self.state.event_clients.lock().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("no event subscriber connected to mock switch");
    }
}

fn push(state: &Arc<MockState>, event: serde_json::Value) {
    let text = event.to_string();
    state
        .event_clients
        .lock()
        .retain(|tx| tx.send(text.clone()).is_ok());
}

fn log(state: &Arc<MockState>, method: &str, path: &str, query: &Option<String>) {
    let entry = match query {
        Some(q) if !q.is_empty() => format!("{method} {path}?{q}"),
        _ => format!("{method} {path}"),
    };
    state.requests.lock().push(entry);
}

// ------------------------------------------------------------------ routes

async fn events_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<MockState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_events(socket, state))
}

async fn handle_events(socket: WebSocket, state: Arc<MockState>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    state.event_clients.lock().push(tx);
    let (mut sender, mut receiver) = socket.split();
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(text) => {
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            inbound = receiver.next() => match inbound {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}

async fn originate(
    State(state): State<Arc<MockState>>,
    RawQuery(query): RawQuery,
) -> Json<serde_json::Value> {
    log(&state, "POST", "/ari/channels", &query);
    let channel_id = format!("out-{}", uuid::Uuid::new_v4());
    Json(serde_json::json!({ "id": channel_id, "state": "Down" }))
}

async fn external_media(
    State(state): State<Arc<MockState>>,
    Query(params): Query<HashMap<String, String>>,
    RawQuery(query): RawQuery,
) -> Json<serde_json::Value> {
    log(&state, "POST", "/ari/channels/externalMedia", &query);
    let channel_id = params
        .get("channelId")
        .cloned()
        .unwrap_or_else(|| "em-unknown".into());
    let connection_id = format!("conn-{channel_id}");
    if state.auto_stasis.load(Ordering::SeqCst) {
        push(
            &state,
            serde_json::json!({
                "type": "StasisStart",
                "args": [],
                "channel": { "id": channel_id, "state": "Down" },
            }),
        );
    }
    Json(serde_json::json!({
        "id": channel_id,
        "state": "Down",
        "channelvars": { "MEDIA_WEBSOCKET_CONNECTION_ID": connection_id },
    }))
}

async fn snoop(
    State(state): State<Arc<MockState>>,
    Path((id, snoop_id)): Path<(String, String)>,
    RawQuery(query): RawQuery,
) -> Json<serde_json::Value> {
    log(&state, "POST", &format!("/ari/channels/{id}/snoop/{snoop_id}"), &query);
    Json(serde_json::json!({ "id": snoop_id, "state": "Up" }))
}

async fn play(
    State(state): State<Arc<MockState>>,
    Path((id, playback_id)): Path<(String, String)>,
    RawQuery(query): RawQuery,
) -> Json<serde_json::Value> {
    log(&state, "POST", &format!("/ari/channels/{id}/play/{playback_id}"), &query);
    if state.playback_autofinish.load(Ordering::SeqCst) {
        let state = state.clone();
        let pb = playback_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            push(
                &state,
                serde_json::json!({
                    "type": "PlaybackFinished",
                    "playback": { "id": pb, "state": "done" },
                }),
            );
        });
    }
    Json(serde_json::json!({ "id": playback_id, "state": "playing" }))
}

async fn record(
    State(state): State<Arc<MockState>>,
    Path(id): Path<String>,
    RawQuery(query): RawQuery,
) -> Json<serde_json::Value> {
    log(&state, "POST", &format!("/ari/channels/{id}/record"), &query);
    let name = query
        .as_deref()
        .and_then(|q| {
            q.split('&')
                .find_map(|kv| kv.strip_prefix("name="))
                .map(str::to_string)
        })
        .unwrap_or_else(|| "rec".into());
    Json(serde_json::json!({ "name": name, "format": "wav", "state": "recording" }))
}

async fn create_bridge(
    State(state): State<Arc<MockState>>,
    RawQuery(query): RawQuery,
) -> Json<serde_json::Value> {
    log(&state, "POST", "/ari/bridges", &query);
    let bridge_id = query
        .as_deref()
        .and_then(|q| {
            q.split('&')
                .find_map(|kv| kv.strip_prefix("bridgeId="))
                .map(str::to_string)
        })
        .unwrap_or_else(|| "bridge".into());
    Json(serde_json::json!({
        "id": bridge_id,
        "bridge_type": "mixing",
        "channels": [],
    }))
}

async fn list_endpoints(State(state): State<Arc<MockState>>) -> Json<serde_json::Value> {
    log(&state, "GET", "/ari/endpoints", &None);
    let endpoints: Vec<serde_json::Value> = state
        .endpoints
        .lock()
        .iter()
        .filter_map(|e| e.split_once('/'))
        .map(|(tech, res)| {
            serde_json::json!({ "technology": tech, "resource": res, "state": "online" })
        })
        .collect();
    Json(serde_json::json!(endpoints))
}

async fn get_endpoint(
    State(state): State<Arc<MockState>>,
    Path((tech, resource)): Path<(String, String)>,
) -> impl IntoResponse {
    log(&state, "GET", &format!("/ari/endpoints/{tech}/{resource}"), &None);
    if state.endpoints.lock().contains(&format!("{tech}/{resource}")) {
        Json(serde_json::json!({
            "technology": tech,
            "resource": resource,
            "state": "online",
        }))
        .into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "message": "Endpoint not found" })),
        )
            .into_response()
    }
}

async fn media_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<MockState>>,
    Path(connection_id): Path<String>,
) -> impl IntoResponse {
    ws.protocols(["media"])
        .on_upgrade(move |socket| handle_media(socket, state, connection_id))
}

async fn handle_media(socket: WebSocket, state: Arc<MockState>, connection_id: String) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    state.media_tx.lock().insert(connection_id.clone(), tx);
    let (mut sender, mut receiver) = socket.split();
    loop {
        tokio::select! {
            outbound = rx.recv() => match outbound {
                Some(frame) => {
                    if sender.send(Message::Binary(frame.into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            inbound = receiver.next() => match inbound {
                Some(Ok(Message::Binary(data))) => {
                    state
                        .media_frames
                        .lock()
                        .entry(connection_id.clone())
                        .or_default()
                        .push(data.to_vec());
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    state.media_tx.lock().remove(&connection_id);
}

/// Catch-all for routes whose only job is to be observed by assertions:
/// logs "METHOD /path?query" and answers 204.
async fn logged_no_content(
    State(state): State<Arc<MockState>>,
    method: axum::http::Method,
    OriginalUri(uri): OriginalUri,
) -> StatusCode {
    state.requests.lock().push(format!("{method} {uri}"));
    StatusCode::NO_CONTENT
}
