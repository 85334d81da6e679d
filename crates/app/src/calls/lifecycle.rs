//! Switch event handling: inbound call admission, answer flow, hangups,
//! DTMF and outbound progress.

use tracing::{debug, info, warn};
use uuid::Uuid;

use voxbridge_switch::types::Channel;
use voxbridge_switch::SwitchEvent;

use crate::calls::CallManager;
use crate::registry::{CallEvent, CallRecord, CallState, Direction};

impl CallManager {
    pub(crate) async fn handle_event(&self, event: SwitchEvent) {
        match event {
            SwitchEvent::StasisStart { channel, .. } => {
                match self.inner().registry.by_channel(&channel.id) {
                    // A channel we originated has entered the app: the far
                    // end answered.
                    Some(record) => self.on_outbound_answered(&record.call_id).await,
                    None => self.on_inbound(channel).await,
                }
            }
            SwitchEvent::StasisEnd { channel } => {
                self.spawn_end(&channel.id, "remote hangup".to_string());
            }
            SwitchEvent::ChannelDestroyed {
                channel,
                cause,
                cause_txt,
            } => {
                let cause = if cause_txt.is_empty() {
                    format!("cause {cause}")
                } else {
                    cause_txt
                };
                self.spawn_end(&channel.id, cause);
            }
            SwitchEvent::ChannelStateChange { channel } => {
                // Inbound answers are driven by our own answer request; only
                // outbound legs learn of the far end from state changes.
                if channel.state == "Up" {
                    if let Some(record) = self.inner().registry.by_channel(&channel.id) {
                        if record.direction == Direction::Outbound
                            && record.state == CallState::Ringing
                        {
                            self.on_outbound_answered(&record.call_id).await;
                        }
                    }
                }
            }
            SwitchEvent::ChannelDtmfReceived { channel, digit } => {
                if let Some(record) = self.inner().registry.by_channel(&channel.id) {
                    debug!(call_id = %record.call_id, digit, "dtmf received");
                    self.inner().registry.emit(CallEvent::new(
                        "call.dtmf",
                        &record.call_id,
                        serde_json::json!({ "digit": digit }),
                    ));
                }
            }
            // Playback and recording completions are consumed through
            // waiters registered by the operation that started them.
            SwitchEvent::PlaybackStarted { .. }
            | SwitchEvent::PlaybackFinished { .. }
            | SwitchEvent::RecordingFinished { .. }
            | SwitchEvent::RecordingFailed { .. }
            | SwitchEvent::Other => {}
        }
    }

    /// End a call off the dispatch loop: teardown can take a moment (ASR
    /// flush, switch releases) and must not stall other calls' events.
    fn spawn_end(&self, channel_id: &str, cause: String) {
        let Some(record) = self.inner().registry.by_channel(channel_id) else {
            return;
        };
        let manager = self.clone();
        tokio::spawn(async move {
            manager.end_call(&record.call_id, Some(cause)).await;
        });
    }

    /// New inbound channel: consult the allowlist, then ring for the
    /// configured delay before answering.
    async fn on_inbound(&self, channel: Channel) {
        let caller = channel.caller.number.clone();
        let callee = channel.dialplan.exten.clone();
        let call_id = Uuid::new_v4().to_string();

        if !self.inner().allowlist.allows_inbound(&caller) {
            info!(caller, "inbound call denied by allowlist");
            if let Err(e) = self.inner().switch.hangup(&channel.id, Some("busy")).await {
                debug!("hangup of denied caller failed: {e}");
            }
            let record = CallRecord::new(
                call_id.clone(),
                channel.id.clone(),
                Direction::Inbound,
                caller,
                callee,
                CallState::Ringing,
            );
            self.inner().registry.insert(record);
            self.inner()
                .registry
                .mark_failed(&call_id, "denied by allowlist");
            return;
        }

        info!(call_id, caller, callee, channel = %channel.id, "inbound call");
        let record = CallRecord::new(
            call_id.clone(),
            channel.id.clone(),
            Direction::Inbound,
            caller.clone(),
            callee.clone(),
            CallState::Ringing,
        );
        self.inner().registry.insert(record);
        self.inner().registry.emit(CallEvent::new(
            "call.inbound",
            &call_id,
            serde_json::json!({ "callerNumber": caller, "calleeNumber": callee }),
        ));

        // The caller hears ringing until the answer timer fires.
        if let Err(e) = self.inner().switch.ring(&channel.id).await {
            warn!(call_id, "ring indication failed: {e}");
        }

        let manager = self.clone();
        let timer_call_id = call_id.clone();
        let channel_id = channel.id.clone();
        let delay = self.inner().cfg.ring_delay;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.answer_inbound(&timer_call_id, &channel_id).await;
        });
        self.with_live(&call_id, |lc| lc.ring_timer = Some(timer));
    }

    /// Ring timer fired: answer, play greeting and beep, go ready, start
    /// the capture pipeline and recognition session.
    async fn answer_inbound(&self, call_id: &str, channel_id: &str) {
        {
            let lock = self.inner().registry.op_lock(call_id);
            let _guard = lock.lock().await;
            let Some(record) = self.inner().registry.get(call_id) else {
                return;
            };
            // The call may have ended while the timer was pending; in that
            // case no answer is attempted.
            if record.state != CallState::Ringing {
                return;
            }
            if let Err(e) = self.inner().switch.answer(channel_id).await {
                warn!(call_id, "answer failed: {e}");
                self.inner()
                    .registry
                    .mark_failed(call_id, format!("answer failed: {e}"));
                return;
            }
            match self.inner().registry.transition(call_id, CallState::Answered) {
                Ok(_) => {
                    self.inner().registry.emit(CallEvent::new(
                        "call.answered",
                        call_id,
                        serde_json::json!({}),
                    ));
                }
                // A racing switch event may have advanced the record already;
                // continue with the greeting either way.
                Err(_) => {
                    let still_answered = self
                        .inner()
                        .registry
                        .get(call_id)
                        .is_some_and(|r| r.state == CallState::Answered);
                    if !still_answered {
                        return;
                    }
                }
            }
        }

        // Greeting and beep play in the answered state, outside the op
        // lock so a hangup can interrupt them.
        let media = [
            self.inner().cfg.greeting_media.clone(),
            self.inner().cfg.beep_media.clone(),
        ];
        for uri in media {
            if let Err(e) = self.play_and_wait(call_id, channel_id, &uri).await {
                debug!(call_id, uri, "greeting playback stopped: {e}");
                return;
            }
        }

        {
            let lock = self.inner().registry.op_lock(call_id);
            let _guard = lock.lock().await;
            match self.inner().registry.get(call_id) {
                Some(r) if r.state == CallState::Answered => {}
                _ => return,
            }
            if self
                .inner()
                .registry
                .transition(call_id, CallState::Ready)
                .is_err()
            {
                return;
            }
            self.inner().registry.emit(CallEvent::new(
                "call.ready",
                call_id,
                serde_json::json!({}),
            ));
        }

        if let Err(e) = self.start_capture(call_id).await {
            warn!(call_id, "auto capture start failed: {e}");
            self.inner().registry.emit(CallEvent::new(
                "call.audio_capture_error",
                call_id,
                serde_json::json!({ "error": e.to_string() }),
            ));
        }
    }

    async fn on_outbound_answered(&self, call_id: &str) {
        let lock = self.inner().registry.op_lock(call_id);
        let _guard = lock.lock().await;
        let Some(record) = self.inner().registry.get(call_id) else {
            return;
        };
        match record.state {
            CallState::Ringing => {}
            // Originate raced its own events; catch the record up.
            CallState::Initiating => {
                if self
                    .inner()
                    .registry
                    .transition(call_id, CallState::Ringing)
                    .is_err()
                {
                    return;
                }
            }
            _ => return,
        }
        if self
            .inner()
            .registry
            .transition(call_id, CallState::Answered)
            .is_ok()
        {
            info!(call_id, "outbound call answered");
            self.inner().registry.emit(CallEvent::new(
                "call.answered",
                call_id,
                serde_json::json!({}),
            ));
        }
    }
}
