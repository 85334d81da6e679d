//! REST wrappers and the event-link lifecycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use reqwest::Method;
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{normalize_error, SwitchError};
use crate::events::SwitchEvent;
use crate::types::{
    Bridge, Channel, Endpoint, ExternalMediaParams, LiveRecording, OriginateParams, Playback,
    RecordParams, StoredRecording, Variable, MEDIA_CONNECTION_VAR,
};
use crate::{is_synthetic_channel, RECONNECT_DELAY, SETUP_DEADLINE};

#[derive(Debug, Clone)]
pub struct SwitchConfig {
    /// Base HTTP URL of the switch, e.g. `http://pbx:8088`.
    pub url: String,
    pub username: String,
    pub password: String,
    /// Stasis application name; calls enter our control when the dialplan
    /// routes them here.
    pub app: String,
}

/// One-shot waiters keyed by id, fulfilled by the event dispatcher.
///
/// Pipelines park here while waiting for a synthetic channel to enter the
/// app, a playback to finish, or a recording to complete.
#[derive(Default)]
struct Waiters {
    stasis: Mutex<HashMap<String, oneshot::Sender<Channel>>>,
    playback: Mutex<HashMap<String, oneshot::Sender<Playback>>>,
    recording: Mutex<HashMap<String, oneshot::Sender<Result<LiveRecording, String>>>>,
}

pub struct SwitchClient {
    cfg: SwitchConfig,
    http: reqwest::Client,
    waiters: Arc<Waiters>,
    connected_rx: watch::Receiver<bool>,
    connected_tx: watch::Sender<bool>,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl SwitchClient {
    pub fn new(cfg: SwitchConfig) -> Self {
        let (connected_tx, connected_rx) = watch::channel(false);
        Self {
            cfg,
            http: reqwest::Client::new(),
            waiters: Arc::new(Waiters::default()),
            connected_rx,
            connected_tx,
            event_task: Mutex::new(None),
        }
    }

    pub fn app(&self) -> &str {
        &self.cfg.app
    }

    /// Whether the event link is currently up.
    pub fn is_connected(&self) -> bool {
        *self.connected_rx.borrow()
    }

    /// Watch the event-link state; flips to false on disconnect.
    pub fn connected_watch(&self) -> watch::Receiver<bool> {
        self.connected_rx.clone()
    }

    // ---------------------------------------------------------------- events

    /// Start the event link. Returns the receiver for call-relevant events.
    ///
    /// The link reconnects forever with a fixed delay. Each attempt builds a
    /// fresh socket and a fresh reader, all writing into the single sender
    /// handed out here, so a stale reader can never double-deliver events.
    pub fn start_events(&self) -> mpsc::Receiver<SwitchEvent> {
        let (tx, rx) = mpsc::channel(256);
        let ws_url = self.events_url();
        let waiters = self.waiters.clone();
        let connected = self.connected_tx.clone();

        let handle = tokio::spawn(async move {
            loop {
                match connect_async(ws_url.as_str()).await {
                    Ok((mut stream, _resp)) => {
                        info!("switch event link established");
                        let _ = connected.send(true);
                        while let Some(msg) = stream.next().await {
                            match msg {
                                Ok(m) if m.is_text() => {
                                    let text = m.into_text().unwrap_or_default();
                                    dispatch_event(&text, &waiters, &tx).await;
                                }
                                Ok(m) if m.is_close() => break,
                                Ok(_) => {}
                                Err(e) => {
                                    warn!("switch event link read error: {e}");
                                    break;
                                }
                            }
                        }
                        let _ = connected.send(false);
                        warn!("switch event link dropped");
                    }
                    Err(e) => {
                        let _ = connected.send(false);
                        warn!("switch event link connect failed: {e}");
                    }
                }
                if tx.is_closed() {
                    debug!("event receiver gone, stopping event link");
                    return;
                }
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        });
        *self.event_task.lock() = Some(handle);
        rx
    }

    /// Stop the event link task.
    pub fn shutdown(&self) {
        if let Some(handle) = self.event_task.lock().take() {
            handle.abort();
        }
        let _ = self.connected_tx.send(false);
    }

    /// Register to be woken when `channel_id` enters the application.
    /// Must be registered before the operation that creates the channel.
    pub fn wait_for_stasis(&self, channel_id: &str) -> oneshot::Receiver<Channel> {
        let (tx, rx) = oneshot::channel();
        self.waiters.stasis.lock().insert(channel_id.to_string(), tx);
        rx
    }

    /// Register to be woken when playback `playback_id` finishes.
    pub fn wait_for_playback(&self, playback_id: &str) -> oneshot::Receiver<Playback> {
        let (tx, rx) = oneshot::channel();
        self.waiters
            .playback
            .lock()
            .insert(playback_id.to_string(), tx);
        rx
    }

    /// Register to be woken when recording `name` finishes or fails.
    pub fn wait_for_recording(
        &self,
        name: &str,
    ) -> oneshot::Receiver<Result<LiveRecording, String>> {
        let (tx, rx) = oneshot::channel();
        self.waiters.recording.lock().insert(name.to_string(), tx);
        rx
    }

    /// Drop a stasis waiter that is no longer needed.
    pub fn cancel_stasis_wait(&self, channel_id: &str) {
        self.waiters.stasis.lock().remove(channel_id);
    }

    /// Drop a playback waiter after a cancelled or timed-out wait.
    pub fn cancel_playback_wait(&self, playback_id: &str) {
        self.waiters.playback.lock().remove(playback_id);
    }

    /// Drop a recording waiter that will never be consumed.
    pub fn cancel_recording_wait(&self, name: &str) {
        self.waiters.recording.lock().remove(name);
    }

    // -------------------------------------------------------------- channels

    pub async fn originate(&self, params: &OriginateParams) -> Result<Channel, SwitchError> {
        let mut query: Vec<(&str, String)> = vec![
            ("endpoint", params.endpoint.clone()),
            ("app", self.cfg.app.clone()),
        ];
        if let Some(cid) = &params.caller_id {
            query.push(("callerId", cid.clone()));
        }
        if let Some(t) = params.timeout {
            query.push(("timeout", t.to_string()));
        }
        let body = serde_json::json!({ "variables": params.variables });
        self.request_json(Method::POST, "channels", &query, Some(body), "originate")
            .await
    }

    pub async fn answer(&self, channel_id: &str) -> Result<(), SwitchError> {
        self.request_empty(
            Method::POST,
            &format!("channels/{channel_id}/answer"),
            &[],
            "answer",
        )
        .await
    }

    /// Start a ringing indication on an unanswered channel.
    pub async fn ring(&self, channel_id: &str) -> Result<(), SwitchError> {
        self.request_empty(
            Method::POST,
            &format!("channels/{channel_id}/ring"),
            &[],
            "ring",
        )
        .await
    }

    /// Hang a channel up. Callers on the teardown path are expected to
    /// ignore the result; the channel may already be gone.
    pub async fn hangup(&self, channel_id: &str, reason: Option<&str>) -> Result<(), SwitchError> {
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(r) = reason {
            query.push(("reason", r.to_string()));
        }
        self.request_empty(
            Method::DELETE,
            &format!("channels/{channel_id}"),
            &query,
            "hangup",
        )
        .await
    }

    /// Start playback of `media_uri` with a caller-chosen playback id.
    pub async fn play(
        &self,
        channel_id: &str,
        playback_id: &str,
        media_uri: &str,
    ) -> Result<Playback, SwitchError> {
        self.request_json(
            Method::POST,
            &format!("channels/{channel_id}/play/{playback_id}"),
            &[("media", media_uri.to_string())],
            None,
            "play",
        )
        .await
    }

    pub async fn record(
        &self,
        channel_id: &str,
        params: &RecordParams,
    ) -> Result<LiveRecording, SwitchError> {
        let mut query: Vec<(&str, String)> = vec![
            ("name", params.name.clone()),
            ("format", params.format.clone()),
            ("beep", params.beep.to_string()),
        ];
        if let Some(max) = params.max_duration_seconds {
            query.push(("maxDurationSeconds", max.to_string()));
        }
        self.request_json(
            Method::POST,
            &format!("channels/{channel_id}/record"),
            &query,
            None,
            "record",
        )
        .await
    }

    pub async fn stop_recording(&self, name: &str) -> Result<(), SwitchError> {
        self.request_empty(
            Method::POST,
            &format!("recordings/live/{name}/stop"),
            &[],
            "stop recording",
        )
        .await
    }

    pub async fn send_dtmf(&self, channel_id: &str, digits: &str) -> Result<(), SwitchError> {
        self.request_empty(
            Method::POST,
            &format!("channels/{channel_id}/dtmf"),
            &[("dtmf", digits.to_string())],
            "send dtmf",
        )
        .await
    }

    /// Create a mirror (snoop) channel with a caller-chosen id, spying on
    /// the given direction of `channel_id`.
    pub async fn snoop_with_id(
        &self,
        channel_id: &str,
        snoop_id: &str,
        spy: &str,
    ) -> Result<Channel, SwitchError> {
        self.request_json(
            Method::POST,
            &format!("channels/{channel_id}/snoop/{snoop_id}"),
            &[("app", self.cfg.app.clone()), ("spy", spy.to_string())],
            None,
            "snoop",
        )
        .await
    }

    /// Create an external-media channel in server mode: the switch opens a
    /// media socket and reports the connection id for us to dial in.
    pub async fn external_media(
        &self,
        params: &ExternalMediaParams,
    ) -> Result<Channel, SwitchError> {
        self.request_json(
            Method::POST,
            "channels/externalMedia",
            &[
                ("channelId", params.channel_id.clone()),
                ("app", self.cfg.app.clone()),
                ("external_host", "INCOMING".to_string()),
                ("transport", "websocket".to_string()),
                ("encapsulation", "none".to_string()),
                ("format", params.format.clone()),
            ],
            None,
            "external media",
        )
        .await
    }

    pub async fn get_channel_var(
        &self,
        channel_id: &str,
        name: &str,
    ) -> Result<String, SwitchError> {
        let var: Variable = self
            .request_json(
                Method::GET,
                &format!("channels/{channel_id}/variable"),
                &[("variable", name.to_string())],
                None,
                "get variable",
            )
            .await?;
        Ok(var.value)
    }

    /// Connection id of a server-mode external-media channel: from the
    /// creation payload when present, else via a variable lookup.
    pub async fn media_connection_id(&self, channel: &Channel) -> Result<String, SwitchError> {
        if let Some(id) = channel.media_connection_id() {
            return Ok(id);
        }
        self.get_channel_var(&channel.id, MEDIA_CONNECTION_VAR).await
    }

    // --------------------------------------------------------------- bridges

    pub async fn create_bridge(
        &self,
        bridge_id: &str,
        name: Option<&str>,
    ) -> Result<Bridge, SwitchError> {
        let mut query: Vec<(&str, String)> = vec![
            ("type", "mixing".to_string()),
            ("bridgeId", bridge_id.to_string()),
        ];
        if let Some(n) = name {
            query.push(("name", n.to_string()));
        }
        self.request_json(Method::POST, "bridges", &query, None, "create bridge")
            .await
    }

    pub async fn get_bridge(&self, bridge_id: &str) -> Result<Bridge, SwitchError> {
        self.request_json(
            Method::GET,
            &format!("bridges/{bridge_id}"),
            &[],
            None,
            "get bridge",
        )
        .await
    }

    pub async fn list_bridges(&self) -> Result<Vec<Bridge>, SwitchError> {
        self.request_json(Method::GET, "bridges", &[], None, "list bridges")
            .await
    }

    pub async fn destroy_bridge(&self, bridge_id: &str) -> Result<(), SwitchError> {
        self.request_empty(
            Method::DELETE,
            &format!("bridges/{bridge_id}"),
            &[],
            "destroy bridge",
        )
        .await
    }

    pub async fn add_channel_to_bridge(
        &self,
        bridge_id: &str,
        channel_id: &str,
    ) -> Result<(), SwitchError> {
        self.request_empty(
            Method::POST,
            &format!("bridges/{bridge_id}/addChannel"),
            &[("channel", channel_id.to_string())],
            "add channel to bridge",
        )
        .await
    }

    pub async fn remove_channel_from_bridge(
        &self,
        bridge_id: &str,
        channel_id: &str,
    ) -> Result<(), SwitchError> {
        self.request_empty(
            Method::POST,
            &format!("bridges/{bridge_id}/removeChannel"),
            &[("channel", channel_id.to_string())],
            "remove channel from bridge",
        )
        .await
    }

    // ------------------------------------------------------------ recordings

    pub async fn list_stored_recordings(&self) -> Result<Vec<StoredRecording>, SwitchError> {
        self.request_json(Method::GET, "recordings/stored", &[], None, "list recordings")
            .await
    }

    pub async fn get_stored_recording(&self, name: &str) -> Result<StoredRecording, SwitchError> {
        self.request_json(
            Method::GET,
            &format!("recordings/stored/{name}"),
            &[],
            None,
            "get recording",
        )
        .await
    }

    pub async fn get_stored_recording_bytes(&self, name: &str) -> Result<Vec<u8>, SwitchError> {
        let url = self.rest_url(&format!("recordings/stored/{name}/file"), &[])?;
        let fut = self
            .http
            .get(url)
            .basic_auth(&self.cfg.username, Some(&self.cfg.password))
            .send();
        let resp = tokio::time::timeout(SETUP_DEADLINE, fut)
            .await
            .map_err(|_| SwitchError::Timeout { operation: "get recording file" })??;
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(normalize_error(status, &body));
        }
        Ok(resp.bytes().await?.to_vec())
    }

    pub async fn delete_stored_recording(&self, name: &str) -> Result<(), SwitchError> {
        self.request_empty(
            Method::DELETE,
            &format!("recordings/stored/{name}"),
            &[],
            "delete recording",
        )
        .await
    }

    pub async fn copy_stored_recording(
        &self,
        name: &str,
        destination: &str,
    ) -> Result<StoredRecording, SwitchError> {
        self.request_json(
            Method::POST,
            &format!("recordings/stored/{name}/copy"),
            &[("destinationRecordingName", destination.to_string())],
            None,
            "copy recording",
        )
        .await
    }

    // ------------------------------------------------------------- endpoints

    pub async fn list_endpoints(&self) -> Result<Vec<Endpoint>, SwitchError> {
        self.request_json(Method::GET, "endpoints", &[], None, "list endpoints")
            .await
    }

    pub async fn get_endpoint(
        &self,
        technology: &str,
        resource: &str,
    ) -> Result<Endpoint, SwitchError> {
        self.request_json(
            Method::GET,
            &format!("endpoints/{technology}/{resource}"),
            &[],
            None,
            "get endpoint",
        )
        .await
    }

    // ----------------------------------------------------------------- urls

    fn rest_url(&self, path: &str, query: &[(&str, String)]) -> Result<Url, SwitchError> {
        let base = self.cfg.url.trim_end_matches('/');
        let mut url = Url::parse(&format!("{base}/ari/{path}"))
            .map_err(|e| SwitchError::Protocol(format!("bad switch url: {e}")))?;
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in query {
                pairs.append_pair(k, v);
            }
        }
        Ok(url)
    }

    fn events_url(&self) -> String {
        let base = http_to_ws(&self.cfg.url);
        format!(
            "{base}/ari/events?app={}&api_key={}:{}",
            self.cfg.app, self.cfg.username, self.cfg.password
        )
    }

    /// URL of the media socket for a server-mode external-media channel.
    pub fn media_socket_url(&self, connection_id: &str) -> String {
        format!("{}/media/{connection_id}", http_to_ws(&self.cfg.url))
    }

    // -------------------------------------------------------------- plumbing

    async fn request_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<serde_json::Value>,
        operation: &'static str,
    ) -> Result<T, SwitchError> {
        let text = self.request_text(method, path, query, body, operation).await?;
        serde_json::from_str(&text)
            .map_err(|e| SwitchError::Protocol(format!("{operation}: bad response body: {e}")))
    }

    async fn request_empty(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        operation: &'static str,
    ) -> Result<(), SwitchError> {
        self.request_text(method, path, query, None, operation)
            .await
            .map(|_| ())
    }

    async fn request_text(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<serde_json::Value>,
        operation: &'static str,
    ) -> Result<String, SwitchError> {
        let url = self.rest_url(path, query)?;
        debug!(%url, operation, "switch request");
        let mut req = self
            .http
            .request(method, url)
            .basic_auth(&self.cfg.username, Some(&self.cfg.password));
        if let Some(b) = body {
            req = req.json(&b);
        }
        let resp = tokio::time::timeout(SETUP_DEADLINE, req.send())
            .await
            .map_err(|_| SwitchError::Timeout { operation })??;

        let status = resp.status().as_u16();
        let text = resp.text().await.unwrap_or_default();
        if !(200..300).contains(&status) {
            return Err(normalize_error(status, &text));
        }
        Ok(text)
    }
}

fn http_to_ws(url: &str) -> String {
    let base = url.trim_end_matches('/');
    if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    }
}

/// Parse one event-link message and route it.
///
/// Synthetic channels (snoop/capture/playback legs we created) never reach
/// the orchestrator as calls; their StasisStart only fulfils a waiter.
async fn dispatch_event(
    text: &str,
    waiters: &Waiters,
    tx: &mpsc::Sender<SwitchEvent>,
) {
    let event: SwitchEvent = match serde_json::from_str(text) {
        Ok(ev) => ev,
        Err(e) => {
            debug!("unparseable switch event ({e}): {text}");
            return;
        }
    };

    match &event {
        SwitchEvent::StasisStart { channel, .. } if is_synthetic_channel(&channel.id) => {
            if let Some(waiter) = waiters.stasis.lock().remove(&channel.id) {
                let _ = waiter.send(channel.clone());
            } else {
                debug!(channel = %channel.id, "synthetic channel entered app with no waiter");
            }
            return;
        }
        SwitchEvent::StasisEnd { channel }
        | SwitchEvent::ChannelStateChange { channel }
        | SwitchEvent::ChannelDestroyed { channel, .. }
            if is_synthetic_channel(&channel.id) =>
        {
            return;
        }
        SwitchEvent::PlaybackFinished { playback } => {
            if let Some(waiter) = waiters.playback.lock().remove(&playback.id) {
                let _ = waiter.send(playback.clone());
            }
        }
        SwitchEvent::RecordingFinished { recording } => {
            if let Some(waiter) = waiters.recording.lock().remove(&recording.name) {
                let _ = waiter.send(Ok(recording.clone()));
            }
        }
        SwitchEvent::RecordingFailed { recording } => {
            if let Some(waiter) = waiters.recording.lock().remove(&recording.name) {
                let _ = waiter.send(Err(format!("recording {} failed", recording.name)));
            }
        }
        SwitchEvent::Other => return,
        _ => {}
    }

    if tx.send(event).await.is_err() {
        debug!("orchestrator event receiver closed");
    }
}
