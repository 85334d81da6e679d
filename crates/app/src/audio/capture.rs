//! Audio capture pipeline: mirror a call's inbound audio onto a media
//! socket and fan the frames out.
//!
//! Switch resources acquired per capture, in order: a snoop (mirror)
//! channel on the call, an external-media channel in server mode, and a
//! mixing bridge joining the two. The media socket is connected after the
//! external-media channel has entered the application: server-mode channels
//! refuse bridging until their socket is up.

use std::sync::Arc;

use base64::Engine;
use chrono::Utc;
use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use voxbridge_asr::AsrAudioSender;
use voxbridge_switch::media::connect_media_socket;
use voxbridge_switch::types::ExternalMediaParams;
use voxbridge_switch::{SwitchClient, SETUP_DEADLINE};

use crate::audio::AudioFrame;
use crate::error::CallError;
use crate::registry::{CallEvent, CallRegistry, CaptureInfo};

/// Default capture codec: signed-linear 16-bit at 16 kHz, which is what the
/// recognizer expects.
pub const CAPTURE_FORMAT: &str = "slin16";
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// Live capture session; owns the reader task and the switch resource ids.
pub struct CaptureHandle {
    pub info: CaptureInfo,
    reader: JoinHandle<()>,
}

impl CaptureHandle {
    /// Acquire switch resources and start mirroring. On any failure the
    /// partially acquired resources are released before the error returns.
    pub async fn start(
        switch: &Arc<SwitchClient>,
        registry: &CallRegistry,
        call_id: &str,
        channel_id: &str,
        asr: Option<AsrAudioSender>,
    ) -> Result<Self, CallError> {
        let snoop_id = format!("snoop-{}", Uuid::new_v4());
        let capture_channel_id = format!("audiocap-{}", Uuid::new_v4());
        let bridge_id = format!("capbridge-{}", Uuid::new_v4());

        let mut acquired = Teardown::new(switch.clone());

        // 1a. Mirror channel carrying the caller's inbound audio.
        switch
            .snoop_with_id(channel_id, &snoop_id, "in")
            .await
            .map_err(CallError::from)?;
        acquired.snoop = Some(snoop_id.clone());

        // 1b. External-media channel in server mode. Register the app-entry
        // waiter first: the event can arrive before the create call returns.
        let stasis_rx = switch.wait_for_stasis(&capture_channel_id);
        let create = switch
            .external_media(&ExternalMediaParams {
                channel_id: capture_channel_id.clone(),
                format: CAPTURE_FORMAT.to_string(),
            })
            .await;
        let media_channel = match create {
            Ok(ch) => ch,
            Err(e) => {
                switch.cancel_stasis_wait(&capture_channel_id);
                acquired.run().await;
                return Err(e.into());
            }
        };
        acquired.media_channel = Some(capture_channel_id.clone());

        // 1c. Wait for the channel to enter the app; it will not accept
        // bridging before its socket side is ready.
        let entered = tokio::time::timeout(SETUP_DEADLINE, stasis_rx).await;
        if entered.is_err() || entered.as_ref().is_ok_and(|r| r.is_err()) {
            switch.cancel_stasis_wait(&capture_channel_id);
            acquired.run().await;
            return Err(CallError::Timeout(
                "external media channel never entered application".into(),
            ));
        }

        // 2. Dial into the media socket the switch opened for us.
        let connection_id = match switch.media_connection_id(&media_channel).await {
            Ok(id) => id,
            Err(e) => {
                acquired.run().await;
                return Err(e.into());
            }
        };
        let socket = match connect_media_socket(&switch.media_socket_url(&connection_id)).await {
            Ok(s) => s,
            Err(e) => {
                acquired.run().await;
                return Err(e.into());
            }
        };

        // 3. Bridge the mirror and the media channel together.
        let bridged: Result<(), CallError> = async {
            switch.create_bridge(&bridge_id, None).await?;
            acquired.bridge = Some(bridge_id.clone());
            switch.add_channel_to_bridge(&bridge_id, &snoop_id).await?;
            switch
                .add_channel_to_bridge(&bridge_id, &capture_channel_id)
                .await?;
            Ok(())
        }
        .await;
        if let Err(e) = bridged {
            acquired.run().await;
            return Err(e);
        }

        let info = CaptureInfo {
            snoop_channel_id: snoop_id,
            external_media_channel_id: capture_channel_id,
            bridge_id,
            format: CAPTURE_FORMAT.to_string(),
            sample_rate: CAPTURE_SAMPLE_RATE,
            started_at: Utc::now(),
        };

        let reader = spawn_frame_reader(socket, registry.clone(), call_id.to_string(), asr);
        info!(call_id, bridge = %info.bridge_id, "audio capture started");

        Ok(Self { info, reader })
    }

    /// Release everything. Best-effort and concurrent: individual release
    /// failures are logged, never propagated.
    pub async fn stop(self, switch: &Arc<SwitchClient>) {
        self.reader.abort();
        let mut teardown = Teardown::new(switch.clone());
        teardown.snoop = Some(self.info.snoop_channel_id);
        teardown.media_channel = Some(self.info.external_media_channel_id);
        teardown.bridge = Some(self.info.bridge_id);
        teardown.run().await;
    }
}

/// Tracks partially or fully acquired switch resources for release.
struct Teardown {
    switch: Arc<SwitchClient>,
    snoop: Option<String>,
    media_channel: Option<String>,
    bridge: Option<String>,
}

impl Teardown {
    fn new(switch: Arc<SwitchClient>) -> Self {
        Self {
            switch,
            snoop: None,
            media_channel: None,
            bridge: None,
        }
    }

    async fn run(self) {
        let switch = self.switch;
        let remove = async {
            if let (Some(bridge), Some(ch)) = (&self.bridge, &self.media_channel) {
                if let Err(e) = switch.remove_channel_from_bridge(bridge, ch).await {
                    debug!("capture teardown: remove from bridge: {e}");
                }
            }
            if let Some(bridge) = &self.bridge {
                if let Err(e) = switch.destroy_bridge(bridge).await {
                    debug!("capture teardown: destroy bridge: {e}");
                }
            }
        };
        let hangup_snoop = async {
            if let Some(snoop) = &self.snoop {
                if let Err(e) = switch.hangup(snoop, None).await {
                    debug!("capture teardown: hangup snoop: {e}");
                }
            }
        };
        let hangup_media = async {
            if let Some(ch) = &self.media_channel {
                if let Err(e) = switch.hangup(ch, None).await {
                    debug!("capture teardown: hangup media channel: {e}");
                }
            }
        };
        tokio::join!(remove, hangup_snoop, hangup_media);
    }
}

/// Read binary PCM frames off the media socket, fan them out to the event
/// stream (base64) and the recognizer (raw). A dispatch failure is logged
/// and reported; the call continues.
fn spawn_frame_reader(
    mut socket: voxbridge_switch::media::MediaSocket,
    registry: CallRegistry,
    call_id: String,
    asr: Option<AsrAudioSender>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = socket.next().await {
            match msg {
                Ok(m) if m.is_binary() => {
                    let data = m.into_data();
                    let frame = AudioFrame {
                        call_id: call_id.clone(),
                        timestamp: Utc::now(),
                        data: data.to_vec(),
                        format: CAPTURE_FORMAT.to_string(),
                        sample_rate: CAPTURE_SAMPLE_RATE,
                        channels: 1,
                        sample_count: data.len() / 2,
                    };
                    dispatch_frame(&registry, &asr, frame);
                }
                Ok(m) if m.is_close() => break,
                Ok(_) => {}
                Err(e) => {
                    warn!(call_id, "capture socket error: {e}");
                    registry.emit(CallEvent::new(
                        "call.audio_capture_error",
                        &call_id,
                        serde_json::json!({ "error": e.to_string() }),
                    ));
                    break;
                }
            }
        }
        debug!(call_id, "capture frame reader finished");
    })
}

fn dispatch_frame(registry: &CallRegistry, asr: &Option<AsrAudioSender>, frame: AudioFrame) {
    let encoded = base64::engine::general_purpose::STANDARD.encode(&frame.data);
    registry.emit(CallEvent::new(
        "call.audio_frame",
        &frame.call_id,
        serde_json::json!({
            "audio": encoded,
            "format": frame.format,
            "sampleRate": frame.sample_rate,
            "channels": frame.channels,
            "sampleCount": frame.sample_count,
        }),
    ));
    if let Some(asr) = asr {
        asr.send(frame.data);
    }
}
