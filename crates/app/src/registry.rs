//! In-memory call registry: value store, state machine and event bus.
//!
//! The registry owns the `CallID -> CallRecord` map and the single ordered
//! event stream. All mutations go through it; readers get clones, never
//! live references. Ended records linger for a grace period so late
//! subscribers and the admin surface can still observe them, then a tracked
//! timer removes them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long an ended record stays visible before removal.
pub const GC_DELAY: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    /// Outbound only: originate request in flight.
    Initiating,
    Ringing,
    Answered,
    /// Audio pipeline live, waiting for input (inbound path).
    Ready,
    Playing,
    Speaking,
    Recording,
    Bridged,
    Ended,
    Failed,
}

impl CallState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CallState::Ended | CallState::Failed)
    }

    /// Transient work states that return to the state held before entry.
    pub fn is_transient_work(self) -> bool {
        matches!(
            self,
            CallState::Playing | CallState::Speaking | CallState::Recording | CallState::Bridged
        )
    }

    /// Whether `self -> to` is a permitted transition.
    pub fn can_transition(self, to: CallState) -> bool {
        use CallState::*;
        if self == to {
            return false;
        }
        match (self, to) {
            // Any live state may end.
            (from, Ended) => !from.is_terminal(),
            (Initiating, Ringing) | (Initiating, Failed) => true,
            (Ringing, Answered) => true,
            (Answered, Ready) => true,
            (Answered, t) | (Ready, t) if t.is_transient_work() => true,
            // Work states return to whichever of answered/ready they came from.
            (f, Answered) | (f, Ready) if f.is_transient_work() => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CallState::Initiating => "initiating",
            CallState::Ringing => "ringing",
            CallState::Answered => "answered",
            CallState::Ready => "ready",
            CallState::Playing => "playing",
            CallState::Speaking => "speaking",
            CallState::Recording => "recording",
            CallState::Bridged => "bridged",
            CallState::Ended => "ended",
            CallState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Switch resources held by a live capture session.
#[derive(Debug, Clone, Serialize)]
pub struct CaptureInfo {
    pub snoop_channel_id: String,
    pub external_media_channel_id: String,
    pub bridge_id: String,
    pub format: String,
    pub sample_rate: u32,
    pub started_at: DateTime<Utc>,
}

/// Switch resources held by a live playback session.
#[derive(Debug, Clone, Serialize)]
pub struct PlaybackInfo {
    pub external_media_channel_id: String,
    pub bridge_id: String,
    pub format: String,
    pub sample_rate: u32,
    pub streaming: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallRecord {
    #[serde(rename = "callID")]
    pub call_id: String,
    #[serde(rename = "channelID")]
    pub channel_id: String,
    pub direction: Direction,
    pub caller_number: String,
    pub callee_number: String,
    pub created_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub hangup_cause: Option<String>,
    pub state: CallState,
    pub capture: Option<CaptureInfo>,
    pub playback: Option<PlaybackInfo>,
    pub asr_active: bool,
    #[serde(rename = "bridgeID")]
    pub bridge_id: Option<String>,
}

impl CallRecord {
    pub fn new(
        call_id: impl Into<String>,
        channel_id: impl Into<String>,
        direction: Direction,
        caller_number: impl Into<String>,
        callee_number: impl Into<String>,
        state: CallState,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            channel_id: channel_id.into(),
            direction,
            caller_number: caller_number.into(),
            callee_number: callee_number.into(),
            created_at: Utc::now(),
            answered_at: None,
            ended_at: None,
            hangup_cause: None,
            state,
            capture: None,
            playback: None,
            asr_active: false,
            bridge_id: None,
        }
    }
}

/// One entry on the ordered event stream.
#[derive(Debug, Clone, Serialize)]
pub struct CallEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "callID")]
    pub call_id: String,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl CallEvent {
    pub fn new(kind: &str, call_id: &str, data: serde_json::Value) -> Self {
        Self {
            kind: kind.to_string(),
            call_id: call_id.to_string(),
            timestamp: Utc::now(),
            data,
        }
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("call not found: {0}")]
    NotFound(String),

    #[error("invalid state transition for {call_id}: {from} -> {to}")]
    InvalidTransition {
        call_id: String,
        from: CallState,
        to: CallState,
    },

    #[error("call {0} has ended")]
    Terminal(String),
}

struct RegistryInner {
    calls: RwLock<HashMap<String, CallRecord>>,
    by_channel: RwLock<HashMap<String, String>>,
    event_tx: broadcast::Sender<CallEvent>,
    /// Deferred-removal timers, tracked so shutdown can evict them.
    gc_timers: Mutex<HashMap<String, JoinHandle<()>>>,
    op_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    gc_delay: Duration,
}

/// Cheaply cloneable handle to the shared registry.
#[derive(Clone)]
pub struct CallRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for CallRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CallRegistry {
    pub fn new() -> Self {
        Self::with_gc_delay(GC_DELAY)
    }

    pub fn with_gc_delay(gc_delay: Duration) -> Self {
        let (event_tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(RegistryInner {
                calls: RwLock::new(HashMap::new()),
                by_channel: RwLock::new(HashMap::new()),
                event_tx,
                gc_timers: Mutex::new(HashMap::new()),
                op_locks: Mutex::new(HashMap::new()),
                gc_delay,
            }),
        }
    }

    /// Subscribe to the ordered event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Emit an event on the stream. Held-lock emission elsewhere in this
    /// file is what gives per-call ordering; this entry point is for events
    /// that do not accompany a record mutation (audio frames, transcriptions).
    pub fn emit(&self, event: CallEvent) {
        let _ = self.inner.event_tx.send(event);
    }

    /// Insert a new record and announce it.
    pub fn insert(&self, record: CallRecord) {
        let mut calls = self.inner.calls.write();
        self.inner
            .by_channel
            .write()
            .insert(record.channel_id.clone(), record.call_id.clone());
        let event = CallEvent::new(
            "call.created",
            &record.call_id,
            serde_json::to_value(&record).unwrap_or_default(),
        );
        calls.insert(record.call_id.clone(), record);
        let _ = self.inner.event_tx.send(event);
    }

    pub fn get(&self, call_id: &str) -> Option<CallRecord> {
        self.inner.calls.read().get(call_id).cloned()
    }

    pub fn by_channel(&self, channel_id: &str) -> Option<CallRecord> {
        let call_id = self.inner.by_channel.read().get(channel_id).cloned()?;
        self.get(&call_id)
    }

    /// Snapshot of every record still in the map, ended included.
    pub fn snapshot(&self) -> Vec<CallRecord> {
        self.inner.calls.read().values().cloned().collect()
    }

    /// Records that have not reached a terminal state.
    pub fn active(&self) -> Vec<CallRecord> {
        self.inner
            .calls
            .read()
            .values()
            .filter(|r| !r.state.is_terminal())
            .cloned()
            .collect()
    }

    /// Apply a mutation to a live record. Terminal records are immutable.
    pub fn update<F>(&self, call_id: &str, mutate: F) -> Result<CallRecord, RegistryError>
    where
        F: FnOnce(&mut CallRecord),
    {
        let mut calls = self.inner.calls.write();
        let record = calls
            .get_mut(call_id)
            .ok_or_else(|| RegistryError::NotFound(call_id.to_string()))?;
        if record.state.is_terminal() {
            return Err(RegistryError::Terminal(call_id.to_string()));
        }
        mutate(record);
        Ok(record.clone())
    }

    /// Attach the switch channel to a call once originate has produced it,
    /// keeping the channel index consistent.
    pub fn set_channel(&self, call_id: &str, channel_id: &str) {
        let mut calls = self.inner.calls.write();
        let Some(record) = calls.get_mut(call_id) else { return };
        let mut by_channel = self.inner.by_channel.write();
        if !record.channel_id.is_empty() {
            by_channel.remove(&record.channel_id);
        }
        record.channel_id = channel_id.to_string();
        by_channel.insert(channel_id.to_string(), call_id.to_string());
    }

    /// Validated state transition; emits `call.state_changed`.
    pub fn transition(&self, call_id: &str, to: CallState) -> Result<CallRecord, RegistryError> {
        let mut calls = self.inner.calls.write();
        let record = calls
            .get_mut(call_id)
            .ok_or_else(|| RegistryError::NotFound(call_id.to_string()))?;
        let from = record.state;
        if !from.can_transition(to) {
            return Err(RegistryError::InvalidTransition {
                call_id: call_id.to_string(),
                from,
                to,
            });
        }
        record.state = to;
        if to == CallState::Answered && record.answered_at.is_none() {
            record.answered_at = Some(Utc::now());
        }
        debug!(call_id, %from, %to, "call state transition");
        let snapshot = record.clone();
        let _ = self.inner.event_tx.send(CallEvent::new(
            "call.state_changed",
            call_id,
            serde_json::json!({ "from": from, "to": to }),
        ));
        Ok(snapshot)
    }

    /// Terminate a call. Returns the record the first time only; later
    /// calls are no-ops, which makes the hangup paths idempotent.
    pub fn mark_ended(&self, call_id: &str, cause: Option<String>) -> Option<CallRecord> {
        self.terminate(call_id, CallState::Ended, cause)
    }

    /// Record a failure (originate rejected, inbound denied).
    pub fn mark_failed(&self, call_id: &str, cause: impl Into<String>) -> Option<CallRecord> {
        self.terminate(call_id, CallState::Failed, Some(cause.into()))
    }

    fn terminate(
        &self,
        call_id: &str,
        state: CallState,
        cause: Option<String>,
    ) -> Option<CallRecord> {
        let snapshot = {
            let mut calls = self.inner.calls.write();
            let record = calls.get_mut(call_id)?;
            if record.state.is_terminal() {
                return None;
            }
            let from = record.state;
            record.state = state;
            record.ended_at = Some(Utc::now());
            record.hangup_cause = cause;
            info!(call_id, %from, %state, cause = ?record.hangup_cause, "call terminated");
            let snapshot = record.clone();
            let _ = self.inner.event_tx.send(CallEvent::new(
                "call.state_changed",
                call_id,
                serde_json::json!({ "from": from, "to": state }),
            ));
            let _ = self.inner.event_tx.send(CallEvent::new(
                "call.ended",
                call_id,
                serde_json::json!({
                    "cause": snapshot.hangup_cause,
                    "state": state,
                    "callerNumber": snapshot.caller_number,
                    "calleeNumber": snapshot.callee_number,
                }),
            ));
            snapshot
        };
        self.schedule_gc(call_id);
        Some(snapshot)
    }

    /// Per-call operation lock: everything that mutates one call across an
    /// await point serializes on this.
    pub fn op_lock(&self, call_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.inner
            .op_locks
            .lock()
            .entry(call_id.to_string())
            .or_default()
            .clone()
    }

    fn schedule_gc(&self, call_id: &str) {
        let registry = self.clone();
        let id = call_id.to_string();
        let delay = self.inner.gc_delay;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            registry.remove(&id);
        });
        if let Some(old) = self.inner.gc_timers.lock().insert(call_id.to_string(), handle) {
            old.abort();
        }
    }

    fn remove(&self, call_id: &str) {
        let removed = self.inner.calls.write().remove(call_id);
        if let Some(record) = removed {
            self.inner.by_channel.write().remove(&record.channel_id);
            debug!(call_id, "call record removed");
        }
        self.inner.gc_timers.lock().remove(call_id);
        self.inner.op_locks.lock().remove(call_id);
    }

    /// Drop every deferred-removal timer so they cannot keep the process
    /// alive past shutdown.
    pub fn shutdown(&self) {
        let mut timers = self.inner.gc_timers.lock();
        if !timers.is_empty() {
            info!(count = timers.len(), "evicting deferred cleanup timers");
        }
        for (_, handle) in timers.drain() {
            handle.abort();
        }
    }
}

/// Administratively created mixing bridges. Bridges owned by capture and
/// playback pipelines are deliberately not tracked here.
#[derive(Debug, Clone, Serialize)]
pub struct BridgeRecord {
    #[serde(rename = "bridgeID")]
    pub bridge_id: String,
    pub name: Option<String>,
    #[serde(rename = "channelIDs")]
    pub channel_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Default)]
pub struct BridgeRegistry {
    inner: Arc<RwLock<HashMap<String, BridgeRecord>>>,
}

impl BridgeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: BridgeRecord) {
        self.inner.write().insert(record.bridge_id.clone(), record);
    }

    pub fn get(&self, bridge_id: &str) -> Option<BridgeRecord> {
        self.inner.read().get(bridge_id).cloned()
    }

    pub fn remove(&self, bridge_id: &str) -> Option<BridgeRecord> {
        self.inner.write().remove(bridge_id)
    }

    pub fn list(&self) -> Vec<BridgeRecord> {
        self.inner.read().values().cloned().collect()
    }

    pub fn set_channels(&self, bridge_id: &str, channel_ids: Vec<String>) {
        if let Some(record) = self.inner.write().get_mut(bridge_id) {
            record.channel_ids = channel_ids;
        } else {
            warn!(bridge_id, "set_channels on unknown bridge");
        }
    }
}
