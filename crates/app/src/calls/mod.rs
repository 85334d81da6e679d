//! The per-call orchestrator: owns live resource handles, drives the call
//! state machine, and ties switch, recognizer and synthesizer together.
//!
//! Ownership layout: the registry is a value store and event bus; sockets
//! belong to their pipeline handles; pipelines refer back to calls by id
//! only. The manager's `live` map is the single place resource handles
//! live, so teardown order is always the same: cancel synthesis, drain the
//! scheduler, flush-close recognition, release capture and playback.

mod lifecycle;
mod ops;

pub use ops::{OriginateRequest, SpeakParams, SpeakResult, TransferResult};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use voxbridge_asr::{AsrConfig, AsrEvent, AsrSession};
use voxbridge_switch::{SwitchClient, SwitchEvent};
use voxbridge_tts::TtsClient;

use crate::allowlist::Allowlist;
use crate::audio::capture::CaptureHandle;
use crate::audio::playback::PlaybackHandle;
use crate::registry::{BridgeRegistry, CallEvent, CallRegistry, CallState};

/// Orchestrator tuning knobs, split from the full service config so tests
/// can construct managers directly.
#[derive(Debug, Clone)]
pub struct CallsConfig {
    pub ring_delay: Duration,
    pub greeting_media: String,
    pub beep_media: String,
    /// How long a transfer target may ring before 408.
    pub transfer_timeout: Duration,
    /// Safety bound on waiting for a single media playback to finish.
    pub playback_deadline: Duration,
}

impl Default for CallsConfig {
    fn default() -> Self {
        Self {
            ring_delay: Duration::from_secs(3),
            greeting_media: "sound:hello-world".into(),
            beep_media: "sound:beep".into(),
            transfer_timeout: Duration::from_secs(30),
            playback_deadline: Duration::from_secs(600),
        }
    }
}

/// Resource handles for one live call. Only the manager touches these; the
/// registry carries the serializable projection.
#[derive(Default)]
pub(crate) struct LiveCall {
    capture: Option<CaptureHandle>,
    playback: Option<PlaybackHandle>,
    asr: Option<AsrSession>,
    asr_task: Option<JoinHandle<()>>,
    /// Most recent speak's cancellation slot; a newer speak or call end
    /// flips the sender.
    speak_cancel: Option<(u64, watch::Sender<bool>)>,
    speak_seq: u64,
    /// State to restore when the current transient work state completes.
    prev_state: Option<CallState>,
    ring_timer: Option<JoinHandle<()>>,
    recording: Option<String>,
}

pub(crate) struct ManagerInner {
    pub switch: Arc<SwitchClient>,
    pub registry: CallRegistry,
    pub bridges: BridgeRegistry,
    pub allowlist: Allowlist,
    pub tts: TtsClient,
    pub asr_cfg: Option<AsrConfig>,
    pub cfg: CallsConfig,
    live: Mutex<HashMap<String, LiveCall>>,
}

#[derive(Clone)]
pub struct CallManager {
    inner: Arc<ManagerInner>,
}

impl CallManager {
    pub fn new(
        switch: Arc<SwitchClient>,
        registry: CallRegistry,
        allowlist: Allowlist,
        tts: TtsClient,
        asr_cfg: Option<AsrConfig>,
        cfg: CallsConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                switch,
                registry,
                bridges: BridgeRegistry::new(),
                allowlist,
                tts,
                asr_cfg,
                cfg,
                live: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn registry(&self) -> &CallRegistry {
        &self.inner.registry
    }

    pub fn bridges(&self) -> &BridgeRegistry {
        &self.inner.bridges
    }

    pub fn switch(&self) -> &Arc<SwitchClient> {
        &self.inner.switch
    }

    pub fn allowlist(&self) -> &Allowlist {
        &self.inner.allowlist
    }

    /// Run the switch event dispatch loop until the event stream ends.
    /// A dropped event link ends every live call: the switch owns all call
    /// state, and without it none of our channels are controllable.
    pub async fn run(&self, mut events: mpsc::Receiver<SwitchEvent>) {
        let mut connected = self.inner.switch.connected_watch();
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                changed = connected.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if !*connected.borrow() {
                        warn!("switch event link lost, ending all calls");
                        self.end_all("switch disconnected").await;
                    }
                }
            }
        }
        debug!("call manager event loop finished");
    }

    /// Access the live entry for a call, creating it on first touch. Setup
    /// paths only: callers must have checked the call is not terminal.
    pub(crate) fn with_live<R>(&self, call_id: &str, f: impl FnOnce(&mut LiveCall) -> R) -> R {
        let mut live = self.inner.live.lock();
        f(live.entry(call_id.to_string()).or_default())
    }

    /// Access the live entry without creating one; `None` once the call has
    /// been torn down.
    pub(crate) fn try_live<R>(
        &self,
        call_id: &str,
        f: impl FnOnce(&mut LiveCall) -> R,
    ) -> Option<R> {
        let mut live = self.inner.live.lock();
        live.get_mut(call_id).map(f)
    }

    pub(crate) fn inner(&self) -> &ManagerInner {
        &self.inner
    }

    /// Terminate a call and run the full cancellation cascade. Idempotent:
    /// only the first caller per call does the work.
    pub async fn end_call(&self, call_id: &str, cause: Option<String>) {
        // Flip cancellation flags before waiting on the op lock so any
        // in-flight synthesis or stream resolves promptly.
        {
            let mut live = self.inner.live.lock();
            if let Some(lc) = live.get_mut(call_id) {
                if let Some((_, cancel)) = &lc.speak_cancel {
                    let _ = cancel.send(true);
                }
                if let Some(playback) = &lc.playback {
                    playback.cancel();
                }
                if let Some(timer) = lc.ring_timer.take() {
                    timer.abort();
                }
            }
        }

        let lock = self.inner.registry.op_lock(call_id);
        let _guard = lock.lock().await;

        if self.inner.registry.mark_ended(call_id, cause).is_none() {
            // Already terminated by another path.
            self.inner.live.lock().remove(call_id);
            return;
        }

        let lc = self.inner.live.lock().remove(call_id);
        if let Some(mut lc) = lc {
            // Recognition first: flush-and-close so the last utterance is
            // emitted before the capture socket goes away.
            if let Some(asr) = lc.asr.take() {
                asr.close().await;
            }
            if let Some(task) = lc.asr_task.take() {
                // The forwarder drains its channel and exits once the
                // session is gone; bound the wait in case it is wedged.
                if tokio::time::timeout(Duration::from_secs(1), task).await.is_err() {
                    warn!(call_id, "recognition forwarder did not drain in time");
                }
            }
            if let Some(capture) = lc.capture.take() {
                capture.stop(&self.inner.switch).await;
            }
            if let Some(playback) = lc.playback.take() {
                playback.teardown(&self.inner.switch).await;
            }
        }
        // A racing operation may have recreated an (empty) entry.
        self.inner.live.lock().remove(call_id);
        info!(call_id, "call resources released");
    }

    /// End every live call, e.g. on switch disconnect or process shutdown.
    pub async fn end_all(&self, cause: &str) {
        let ids: Vec<String> = self
            .inner
            .registry
            .active()
            .into_iter()
            .map(|r| r.call_id)
            .collect();
        for call_id in ids {
            self.end_call(&call_id, Some(cause.to_string())).await;
        }
    }

    /// Full shutdown: cancel every call, then evict deferred timers so the
    /// process can exit without waiting out the record grace period.
    pub async fn shutdown(&self) {
        self.end_all("shutdown").await;
        self.inner.registry.shutdown();
        self.inner.switch.shutdown();
    }

    /// Forward recognizer events onto the call event stream. Exhausted
    /// reconnects drop the session.
    pub(crate) fn spawn_asr_forwarder(
        &self,
        call_id: String,
        mut rx: mpsc::Receiver<AsrEvent>,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    AsrEvent::Transcription(t) => {
                        manager.inner.registry.emit(CallEvent::new(
                            "call.transcription",
                            &call_id,
                            serde_json::json!({
                                "text": t.text,
                                "is_partial": t.is_partial,
                                "is_final": t.is_final,
                            }),
                        ));
                    }
                    AsrEvent::ServerError(error) => {
                        manager.inner.registry.emit(CallEvent::new(
                            "call.asr_error",
                            &call_id,
                            serde_json::json!({ "error": error }),
                        ));
                    }
                    AsrEvent::Disconnected { attempts } => {
                        warn!(call_id, attempts, "recognition reconnects exhausted");
                        manager.inner.registry.emit(CallEvent::new(
                            "call.asr_disconnected",
                            &call_id,
                            serde_json::json!({ "attempts": attempts }),
                        ));
                        manager.try_live(&call_id, |lc| {
                            lc.asr = None;
                        });
                        let _ = manager
                            .inner
                            .registry
                            .update(&call_id, |r| r.asr_active = false);
                        break;
                    }
                }
            }
        })
    }
}
