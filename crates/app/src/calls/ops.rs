//! Operations the orchestrator exposes to collaborators: originate,
//! hangup, media playback, speak, capture, DTMF, transfer and recording.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use voxbridge_asr::AsrSession;
use voxbridge_audio::{codec_for_rate, nearest_standard_rate, parse_wav, resample_linear};
use voxbridge_switch::types::{OriginateParams, RecordParams};
use voxbridge_tts::SpeakRequest;

use crate::audio::capture::CaptureHandle;
use crate::audio::playback::PlaybackHandle;
use crate::audio::scheduler::{stream_pcm, OutboundSink, StreamOutcome};
use crate::calls::CallManager;
use crate::error::CallError;
use crate::registry::{CallEvent, CallRecord, CallState, CaptureInfo, Direction};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OriginateRequest {
    pub endpoint: String,
    pub caller_id: Option<String>,
    /// Seconds the far end may ring.
    pub timeout: Option<u32>,
    #[serde(default)]
    pub variables: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpeakParams {
    pub text: String,
    pub voice: Option<String>,
    pub language: Option<String>,
    pub speed: Option<f32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpeakResult {
    pub voice: String,
    pub language: String,
    #[serde(rename = "durationSeconds")]
    pub duration_seconds: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferResult {
    #[serde(rename = "newBridgeID")]
    pub new_bridge_id: String,
    #[serde(rename = "newCallID")]
    pub new_call_id: String,
}

impl CallManager {
    // ------------------------------------------------------------ originate

    /// Start an outbound call. The endpoint must exist on the switch and
    /// pass the outbound allowlist before anything is created.
    pub async fn originate(&self, req: OriginateRequest) -> Result<CallRecord, CallError> {
        if !self.inner().switch.is_connected() {
            return Err(CallError::Unavailable);
        }
        let (technology, resource) = req
            .endpoint
            .split_once('/')
            .ok_or_else(|| CallError::Validation("endpoint must be TECH/resource".into()))?;

        match self.inner().switch.get_endpoint(technology, resource).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => return Err(CallError::NotFound("endpoint")),
            Err(e) => return Err(e.into()),
        }
        if !self.inner().allowlist.allows_outbound(resource) {
            return Err(CallError::Forbidden(format!(
                "destination {resource} is not on the outbound allowlist"
            )));
        }

        let call_id = Uuid::new_v4().to_string();
        let record = CallRecord::new(
            call_id.clone(),
            String::new(),
            Direction::Outbound,
            req.caller_id.clone().unwrap_or_default(),
            req.endpoint.clone(),
            CallState::Initiating,
        );
        self.inner().registry.insert(record);

        let params = OriginateParams {
            endpoint: req.endpoint.clone(),
            caller_id: req.caller_id.clone(),
            timeout: req.timeout,
            variables: req.variables.clone(),
        };
        match self.inner().switch.originate(&params).await {
            Ok(channel) => {
                info!(call_id, endpoint = %req.endpoint, channel = %channel.id, "originated");
                self.inner().registry.set_channel(&call_id, &channel.id);
                self.inner()
                    .registry
                    .transition(&call_id, CallState::Ringing)
                    .map_err(|e| CallError::Protocol(e.to_string()))?;
                Ok(self
                    .inner()
                    .registry
                    .get(&call_id)
                    .ok_or(CallError::NotFound("call"))?)
            }
            Err(e) => {
                self.inner()
                    .registry
                    .mark_failed(&call_id, format!("originate rejected: {e}"));
                Err(e.into())
            }
        }
    }

    // -------------------------------------------------------------- hangup

    /// Hang up a call. Switch errors are swallowed: the channel may already
    /// be gone, and the cleanup must run regardless.
    pub async fn hangup(&self, call_id: &str, reason: Option<String>) -> Result<(), CallError> {
        let record = self
            .inner()
            .registry
            .get(call_id)
            .ok_or(CallError::NotFound("call"))?;
        if record.state.is_terminal() {
            return Ok(());
        }
        if let Err(e) = self
            .inner()
            .switch
            .hangup(&record.channel_id, reason.as_deref())
            .await
        {
            debug!(call_id, "hangup request swallowed: {e}");
        }
        self.end_call(call_id, Some(reason.unwrap_or_else(|| "hangup requested".into())))
            .await;
        Ok(())
    }

    // ---------------------------------------------------------- play media

    /// Play one or more media URIs in sequence. Sequential playback fails
    /// fast: the first failure aborts the remainder.
    pub async fn play_media(&self, call_id: &str, uris: Vec<String>) -> Result<(), CallError> {
        if uris.is_empty() {
            return Err(CallError::Validation("no media to play".into()));
        }
        let channel_id;
        let prev;
        {
            let lock = self.inner().registry.op_lock(call_id);
            let _guard = lock.lock().await;
            let record = self.live_record(call_id)?;
            if !matches!(record.state, CallState::Answered | CallState::Ready) {
                return Err(CallError::Validation(format!(
                    "cannot play media in state {}",
                    record.state
                )));
            }
            channel_id = record.channel_id.clone();
            prev = record.state;
            self.inner()
                .registry
                .transition(call_id, CallState::Playing)
                .map_err(|e| CallError::Protocol(e.to_string()))?;
            self.with_live(call_id, |lc| lc.prev_state = Some(prev));
        }

        let mut result = Ok(());
        for uri in &uris {
            if let Err(e) = self.play_and_wait(call_id, &channel_id, uri).await {
                result = Err(e);
                break;
            }
        }

        {
            let lock = self.inner().registry.op_lock(call_id);
            let _guard = lock.lock().await;
            let restore = self.try_live(call_id, |lc| lc.prev_state.take()).flatten();
            if let Some(record) = self.inner().registry.get(call_id) {
                if record.state == CallState::Playing {
                    let _ = self
                        .inner()
                        .registry
                        .transition(call_id, restore.unwrap_or(prev));
                }
            }
        }
        result
    }

    /// Start a playback on the switch and wait for it to finish, the call
    /// to end, or the safety deadline.
    pub(crate) async fn play_and_wait(
        &self,
        call_id: &str,
        channel_id: &str,
        media_uri: &str,
    ) -> Result<(), CallError> {
        let playback_id = Uuid::new_v4().to_string();
        let finished = self.inner().switch.wait_for_playback(&playback_id);
        // Subscribe before starting so an immediate hangup is not missed.
        let events = self.inner().registry.subscribe();

        if let Err(e) = self
            .inner()
            .switch
            .play(channel_id, &playback_id, media_uri)
            .await
        {
            self.inner().switch.cancel_playback_wait(&playback_id);
            return Err(e.into());
        }

        let result = tokio::select! {
            _ = finished => {
                self.inner().registry.emit(CallEvent::new(
                    "call.playback_finished",
                    call_id,
                    serde_json::json!({ "playbackID": playback_id, "media": media_uri }),
                ));
                Ok(())
            }
            _ = wait_for_end(events, call_id) => Err(CallError::Cancelled),
            _ = tokio::time::sleep(self.inner().cfg.playback_deadline) => {
                Err(CallError::Timeout(format!("playback of {media_uri}")))
            }
        };
        if result.is_err() {
            self.inner().switch.cancel_playback_wait(&playback_id);
        }
        result
    }

    // --------------------------------------------------------------- speak

    /// Synthesize `text` and stream it into the call in real time. A newer
    /// speak on the same call cancels this one; so does the call ending.
    pub async fn speak(&self, call_id: &str, params: SpeakParams) -> Result<SpeakResult, CallError> {
        if !self.inner().tts.is_configured() {
            return Err(CallError::NotImplemented("speech synthesis"));
        }
        if params.text.trim().is_empty() {
            return Err(CallError::Validation("nothing to speak".into()));
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let channel_id;
        let token;
        {
            let lock = self.inner().registry.op_lock(call_id);
            let _guard = lock.lock().await;
            let record = self.live_record(call_id)?;
            if !matches!(
                record.state,
                CallState::Answered | CallState::Ready | CallState::Speaking
            ) {
                return Err(CallError::Validation(format!(
                    "cannot speak in state {}",
                    record.state
                )));
            }
            channel_id = record.channel_id.clone();
            token = self.with_live(call_id, |lc| {
                lc.speak_seq += 1;
                // Most recent speak wins: cancel whatever was in flight.
                if let Some((_, old)) = lc.speak_cancel.replace((lc.speak_seq, cancel_tx)) {
                    let _ = old.send(true);
                }
                if lc.prev_state.is_none() {
                    lc.prev_state = Some(record.state);
                }
                lc.speak_seq
            });
            if record.state != CallState::Speaking {
                self.inner()
                    .registry
                    .transition(call_id, CallState::Speaking)
                    .map_err(|e| CallError::Protocol(e.to_string()))?;
            }
            self.inner().registry.emit(CallEvent::new(
                "call.speak_started",
                call_id,
                serde_json::json!({ "chars": params.text.len() }),
            ));
        }

        let request = SpeakRequest {
            text: params.text.clone(),
            voice: params.voice.clone(),
            language: params.language.clone(),
            speed: params.speed,
        };
        let synthesis = match self.inner().tts.synthesize(&request, cancel_rx.clone()).await {
            Ok(s) => s,
            Err(e) => return self.fail_speak(call_id, token, e.into()).await,
        };

        // Normalize to mono 16-bit at a rate the switch has a codec for.
        let pcm = match parse_wav(&synthesis.wav) {
            Ok(p) => p,
            Err(e) => return self.fail_speak(call_id, token, e.into()).await,
        };
        let target_rate = if codec_for_rate(pcm.sample_rate).is_some() {
            pcm.sample_rate
        } else {
            nearest_standard_rate(pcm.sample_rate)
        };
        let samples = resample_linear(&pcm.samples, pcm.sample_rate, target_rate);
        let duration_seconds = samples.len() as f64 / target_rate as f64;

        let (sink, playback_cancelled) =
            match self.ensure_playback(call_id, &channel_id, target_rate).await {
                Ok(pair) => pair,
                Err(e) => {
                    if !matches!(e, CallError::Cancelled) {
                        self.inner().registry.emit(CallEvent::new(
                            "call.playback_stream_error",
                            call_id,
                            serde_json::json!({ "error": e.to_string() }),
                        ));
                    }
                    return self.fail_speak(call_id, token, e).await;
                }
            };

        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        let _ = self.inner().registry.update(call_id, |r| {
            if let Some(p) = &mut r.playback {
                p.streaming = true;
            }
        });
        self.inner().registry.emit(CallEvent::new(
            "call.playback_stream_started",
            call_id,
            serde_json::json!({ "sampleRate": target_rate, "bytes": bytes.len() }),
        ));

        let cancelled = {
            let rx = cancel_rx.clone();
            move || *rx.borrow() || playback_cancelled.load(Ordering::SeqCst)
        };
        let outcome = stream_pcm(&sink, &bytes, target_rate, cancelled).await;

        let _ = self.inner().registry.update(call_id, |r| {
            if let Some(p) = &mut r.playback {
                p.streaming = false;
            }
        });
        self.inner().registry.emit(CallEvent::new(
            "call.playback_stream_finished",
            call_id,
            serde_json::json!({ "outcome": format!("{outcome:?}") }),
        ));

        self.restore_after_speak(call_id, token).await;

        let result = SpeakResult {
            voice: synthesis.voice,
            language: synthesis.language,
            duration_seconds: Some(duration_seconds),
        };
        if outcome == StreamOutcome::Completed {
            self.inner().registry.emit(CallEvent::new(
                "call.speak_finished",
                call_id,
                serde_json::json!({
                    "voice": result.voice,
                    "language": result.language,
                    "durationSeconds": result.duration_seconds,
                }),
            ));
        }
        Ok(result)
    }

    async fn fail_speak(
        &self,
        call_id: &str,
        token: u64,
        error: CallError,
    ) -> Result<SpeakResult, CallError> {
        // Cancellation is an ordinary outcome (newer speak or hangup), not
        // a speak error.
        if !matches!(error, CallError::Cancelled) {
            warn!(call_id, "speak failed: {error}");
            self.inner().registry.emit(CallEvent::new(
                "call.speak_error",
                call_id,
                serde_json::json!({ "error": error.to_string() }),
            ));
        }
        self.restore_after_speak(call_id, token).await;
        Err(error)
    }

    /// Restore the pre-speak state, but only if this speak is still the
    /// most recent one; a newer speak owns the state now.
    async fn restore_after_speak(&self, call_id: &str, token: u64) {
        let lock = self.inner().registry.op_lock(call_id);
        let _guard = lock.lock().await;
        let is_current = self.try_live(call_id, |lc| {
            lc.speak_cancel.as_ref().map(|(t, _)| *t) == Some(token)
        });
        if is_current != Some(true) {
            return;
        }
        let Some(restore) = self.try_live(call_id, |lc| {
            lc.speak_cancel = None;
            lc.prev_state.take()
        }) else {
            return;
        };
        if let Some(record) = self.inner().registry.get(call_id) {
            if record.state == CallState::Speaking {
                let _ = self
                    .inner()
                    .registry
                    .transition(call_id, restore.unwrap_or(CallState::Ready));
            }
        }
    }

    /// Reuse the call's playback pipeline when it matches the target rate,
    /// otherwise (re)build it.
    async fn ensure_playback(
        &self,
        call_id: &str,
        channel_id: &str,
        sample_rate: u32,
    ) -> Result<(OutboundSink, std::sync::Arc<std::sync::atomic::AtomicBool>), CallError> {
        // Held across the whole (re)build so a concurrent call end cannot
        // miss a handle installed mid-teardown.
        let lock = self.inner().registry.op_lock(call_id);
        let _guard = lock.lock().await;

        let existing = self
            .try_live(call_id, |lc| {
                lc.playback
                    .as_ref()
                    .map(|p| (p.info.sample_rate, p.sink(), p.cancel_flag()))
            })
            .flatten();
        if let Some((rate, sink, flag)) = existing {
            if rate == sample_rate && sink.is_open() && !flag.load(Ordering::SeqCst) {
                return Ok((sink, flag));
            }
            if let Some(old) = self.try_live(call_id, |lc| lc.playback.take()).flatten() {
                old.teardown(self.switch()).await;
            }
            let _ = self.inner().registry.update(call_id, |r| r.playback = None);
        }

        let handle =
            PlaybackHandle::start(self.switch(), call_id, channel_id, sample_rate).await?;
        let sink = handle.sink();
        let flag = handle.cancel_flag();
        let info = handle.info.clone();
        if self
            .inner()
            .registry
            .update(call_id, |r| r.playback = Some(info))
            .is_err()
        {
            // The call ended while we were setting up.
            handle.teardown(self.switch()).await;
            return Err(CallError::Cancelled);
        }
        self.with_live(call_id, |lc| lc.playback = Some(handle));
        Ok((sink, flag))
    }

    // ------------------------------------------------------------- capture

    /// Start the capture pipeline (and a recognition session when one is
    /// configured).
    pub async fn start_capture(&self, call_id: &str) -> Result<CaptureInfo, CallError> {
        let lock = self.inner().registry.op_lock(call_id);
        let _guard = lock.lock().await;
        let record = self.live_record(call_id)?;
        if self.with_live(call_id, |lc| lc.capture.is_some()) {
            return Err(CallError::Validation("already capturing".into()));
        }

        let asr_sender = match &self.inner().asr_cfg {
            Some(cfg) => {
                let existing = self.with_live(call_id, |lc| {
                    lc.asr.as_ref().map(|s| s.audio_sender())
                });
                match existing {
                    Some(sender) => Some(sender),
                    None => {
                        let (tx, rx) = mpsc::channel(64);
                        let session = AsrSession::connect(cfg.clone(), call_id, tx).await?;
                        let task = self.spawn_asr_forwarder(call_id.to_string(), rx);
                        let sender = session.audio_sender();
                        self.with_live(call_id, |lc| {
                            lc.asr = Some(session);
                            lc.asr_task = Some(task);
                        });
                        let _ = self
                            .inner()
                            .registry
                            .update(call_id, |r| r.asr_active = true);
                        Some(sender)
                    }
                }
            }
            None => None,
        };

        match CaptureHandle::start(
            self.switch(),
            self.registry(),
            call_id,
            &record.channel_id,
            asr_sender,
        )
        .await
        {
            Ok(handle) => {
                let info = handle.info.clone();
                if self
                    .inner()
                    .registry
                    .update(call_id, |r| r.capture = Some(info.clone()))
                    .is_err()
                {
                    handle.stop(self.switch()).await;
                    return Err(CallError::NotFound("call"));
                }
                self.with_live(call_id, |lc| lc.capture = Some(handle));
                self.inner().registry.emit(CallEvent::new(
                    "call.audio_capture_started",
                    call_id,
                    serde_json::json!({
                        "format": info.format,
                        "sampleRate": info.sample_rate,
                        "bridgeID": info.bridge_id,
                    }),
                ));
                Ok(info)
            }
            Err(e) => {
                // The recognition session opened for this capture is of no
                // use without frames; close it again.
                let (asr, task) =
                    self.with_live(call_id, |lc| (lc.asr.take(), lc.asr_task.take()));
                if let Some(asr) = asr {
                    asr.close().await;
                }
                if let Some(task) = task {
                    let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
                }
                let _ = self
                    .inner()
                    .registry
                    .update(call_id, |r| r.asr_active = false);
                Err(e)
            }
        }
    }

    /// Stop capturing. A no-op on a call that is not capturing.
    pub async fn stop_capture(&self, call_id: &str) -> Result<(), CallError> {
        let lock = self.inner().registry.op_lock(call_id);
        let _guard = lock.lock().await;
        let (capture, asr, task) = self
            .try_live(call_id, |lc| {
                (lc.capture.take(), lc.asr.take(), lc.asr_task.take())
            })
            .unwrap_or((None, None, None));
        if let Some(asr) = asr {
            // Flush-and-close so the last utterance still comes through.
            asr.close().await;
        }
        if let Some(task) = task {
            let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
        }
        if let Some(capture) = capture {
            capture.stop(self.switch()).await;
            let _ = self.inner().registry.update(call_id, |r| {
                r.capture = None;
                r.asr_active = false;
            });
            self.inner().registry.emit(CallEvent::new(
                "call.audio_capture_stopped",
                call_id,
                serde_json::json!({}),
            ));
        }
        Ok(())
    }

    // ---------------------------------------------------------------- dtmf

    pub async fn send_dtmf(&self, call_id: &str, digits: &str) -> Result<(), CallError> {
        if digits.is_empty()
            || !digits
                .chars()
                .all(|c| c.is_ascii_digit() || matches!(c, '*' | '#' | 'A'..='D' | 'w'))
        {
            return Err(CallError::Validation(format!("invalid DTMF digits: {digits}")));
        }
        let record = self.live_record(call_id)?;
        self.inner()
            .switch
            .send_dtmf(&record.channel_id, digits)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------ transfer

    /// Originate a new leg to `endpoint` and bridge it with this call once
    /// it answers. A target that never answers within the timeout leaves no
    /// bridge behind.
    pub async fn transfer(
        &self,
        call_id: &str,
        endpoint: String,
        caller_id: Option<String>,
        timeout: Option<Duration>,
    ) -> Result<TransferResult, CallError> {
        let record = self.live_record(call_id)?;
        let timeout = timeout.unwrap_or(self.inner().cfg.transfer_timeout);

        // Subscribe before originating so the answer event cannot slip by.
        let events = self.inner().registry.subscribe();
        let target = self
            .originate(OriginateRequest {
                endpoint,
                caller_id,
                timeout: Some(timeout.as_secs() as u32),
                variables: HashMap::new(),
            })
            .await?;
        let new_call_id = target.call_id.clone();

        match wait_for_answer(events, &new_call_id, timeout).await {
            AnswerOutcome::Answered => {}
            AnswerOutcome::Ended => {
                return Err(CallError::Upstream {
                    status: 502,
                    message: "transfer target ended before answering".into(),
                });
            }
            AnswerOutcome::TimedOut => {
                let _ = self
                    .hangup(&new_call_id, Some("transfer timeout".into()))
                    .await;
                return Err(CallError::Timeout("transfer target did not answer".into()));
            }
        }

        let bridge_id = format!("transfer-{}", Uuid::new_v4());
        let target_channel = self
            .inner()
            .registry
            .get(&new_call_id)
            .ok_or(CallError::NotFound("call"))?
            .channel_id;
        let build: Result<(), CallError> = async {
            self.inner().switch.create_bridge(&bridge_id, None).await?;
            self.inner()
                .switch
                .add_channel_to_bridge(&bridge_id, &record.channel_id)
                .await?;
            self.inner()
                .switch
                .add_channel_to_bridge(&bridge_id, &target_channel)
                .await?;
            Ok(())
        }
        .await;
        if let Err(e) = build {
            if let Err(destroy_err) = self.inner().switch.destroy_bridge(&bridge_id).await {
                debug!("transfer bridge cleanup: {destroy_err}");
            }
            let _ = self.hangup(&new_call_id, Some("transfer failed".into())).await;
            return Err(e);
        }

        {
            let lock = self.inner().registry.op_lock(call_id);
            let _guard = lock.lock().await;
            if let Some(r) = self.inner().registry.get(call_id) {
                if !r.state.is_terminal() && !r.state.is_transient_work() {
                    self.with_live(call_id, |lc| lc.prev_state = Some(r.state));
                    let _ = self.inner().registry.transition(call_id, CallState::Bridged);
                }
            }
            let _ = self
                .inner()
                .registry
                .update(call_id, |r| r.bridge_id = Some(bridge_id.clone()));
        }
        let _ = self.inner().registry.transition(&new_call_id, CallState::Bridged);
        let _ = self
            .inner()
            .registry
            .update(&new_call_id, |r| r.bridge_id = Some(bridge_id.clone()));

        self.inner().registry.emit(CallEvent::new(
            "bridge.created",
            call_id,
            serde_json::json!({
                "bridgeID": bridge_id,
                "channels": [record.channel_id, target_channel],
            }),
        ));

        info!(call_id, new_call_id, bridge_id, "transfer bridged");
        Ok(TransferResult {
            new_bridge_id: bridge_id,
            new_call_id,
        })
    }

    // ----------------------------------------------------------- recording

    /// Record the call to a named file on the switch.
    pub async fn start_recording(
        &self,
        call_id: &str,
        name: Option<String>,
        format: Option<String>,
        max_duration_seconds: Option<u32>,
        beep: bool,
    ) -> Result<String, CallError> {
        let lock = self.inner().registry.op_lock(call_id);
        let _guard = lock.lock().await;
        let record = self.live_record(call_id)?;
        if !matches!(record.state, CallState::Answered | CallState::Ready) {
            return Err(CallError::Validation(format!(
                "cannot record in state {}",
                record.state
            )));
        }
        if self.with_live(call_id, |lc| lc.recording.is_some()) {
            return Err(CallError::Validation("already recording".into()));
        }

        let name = name.unwrap_or_else(|| format!("vox-{}-{}", call_id, Uuid::new_v4()));
        let finished = self.inner().switch.wait_for_recording(&name);
        let started = self
            .inner()
            .switch
            .record(
                &record.channel_id,
                &RecordParams {
                    name: name.clone(),
                    format: format.unwrap_or_else(|| "wav".into()),
                    max_duration_seconds,
                    beep,
                },
            )
            .await;
        if let Err(e) = started {
            self.inner().switch.cancel_recording_wait(&name);
            return Err(e.into());
        }

        let prev = record.state;
        self.with_live(call_id, |lc| {
            lc.recording = Some(name.clone());
            lc.prev_state = Some(prev);
        });
        self.inner()
            .registry
            .transition(call_id, CallState::Recording)
            .map_err(|e| CallError::Protocol(e.to_string()))?;

        // Completion (or failure) restores the previous state.
        let manager = self.clone();
        let done_call_id = call_id.to_string();
        let done_name = name.clone();
        tokio::spawn(async move {
            match finished.await {
                Ok(Ok(recording)) => {
                    manager.inner().registry.emit(CallEvent::new(
                        "call.recording_finished",
                        &done_call_id,
                        serde_json::json!({ "name": recording.name, "format": recording.format }),
                    ));
                }
                Ok(Err(error)) => {
                    manager.inner().registry.emit(CallEvent::new(
                        "call.recording_failed",
                        &done_call_id,
                        serde_json::json!({ "name": done_name, "error": error }),
                    ));
                }
                // Waiter dropped: the switch connection went away.
                Err(_) => {}
            }
            manager.finish_recording(&done_call_id).await;
        });

        Ok(name)
    }

    /// Stop an in-progress recording; the switch then emits the completion
    /// that restores call state.
    pub async fn stop_recording(&self, call_id: &str) -> Result<(), CallError> {
        let name = self
            .try_live(call_id, |lc| lc.recording.clone())
            .flatten()
            .ok_or_else(|| CallError::Validation("not recording".into()))?;
        self.inner().switch.stop_recording(&name).await?;
        Ok(())
    }

    async fn finish_recording(&self, call_id: &str) {
        let lock = self.inner().registry.op_lock(call_id);
        let _guard = lock.lock().await;
        let restore = self
            .try_live(call_id, |lc| {
                lc.recording = None;
                lc.prev_state.take()
            })
            .flatten();
        if let Some(record) = self.inner().registry.get(call_id) {
            if record.state == CallState::Recording {
                let _ = self
                    .inner()
                    .registry
                    .transition(call_id, restore.unwrap_or(CallState::Ready));
            }
        }
    }

    // ------------------------------------------------------------- helpers

    /// Fetch a record that is still live; terminal and unknown calls both
    /// surface as not-found.
    fn live_record(&self, call_id: &str) -> Result<CallRecord, CallError> {
        let record = self
            .inner()
            .registry
            .get(call_id)
            .ok_or(CallError::NotFound("call"))?;
        if record.state.is_terminal() {
            return Err(CallError::NotFound("call"));
        }
        Ok(record)
    }
}

enum AnswerOutcome {
    Answered,
    Ended,
    TimedOut,
}

/// Watch the event stream for the target call answering or dying.
async fn wait_for_answer(
    mut events: broadcast::Receiver<CallEvent>,
    call_id: &str,
    timeout: Duration,
) -> AnswerOutcome {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let event = match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Ok(ev)) => ev,
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(broadcast::error::RecvError::Closed)) => return AnswerOutcome::Ended,
            Err(_) => return AnswerOutcome::TimedOut,
        };
        if event.call_id != call_id {
            continue;
        }
        match event.kind.as_str() {
            "call.state_changed" => {
                if event.data.get("to").and_then(|v| v.as_str()) == Some("answered") {
                    return AnswerOutcome::Answered;
                }
            }
            "call.ended" => return AnswerOutcome::Ended,
            _ => {}
        }
    }
}

/// Resolve once `call.ended` is observed for `call_id`.
async fn wait_for_end(mut events: broadcast::Receiver<CallEvent>, call_id: &str) {
    loop {
        match events.recv().await {
            Ok(ev) if ev.call_id == call_id && ev.kind == "call.ended" => return,
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
