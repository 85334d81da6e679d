//! Audio playback pipeline: inject synthesized PCM into a call.
//!
//! Symmetric to capture but outbound: an external-media channel in server
//! mode plus a mixing bridge joining it to the call channel itself. The
//! media socket must be connected before bridging. Frames are paced by the
//! real-time scheduler and written by a single owner, the writer task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info};
use uuid::Uuid;

use voxbridge_audio::codec_for_rate;
use voxbridge_switch::media::connect_media_socket;
use voxbridge_switch::types::ExternalMediaParams;
use voxbridge_switch::SwitchClient;

use crate::audio::scheduler::{OutboundSink, SinkQueue};
use crate::error::CallError;
use crate::registry::PlaybackInfo;

/// Live playback session.
pub struct PlaybackHandle {
    pub info: PlaybackInfo,
    sink: OutboundSink,
    cancelled: Arc<AtomicBool>,
    writer: JoinHandle<()>,
}

impl PlaybackHandle {
    /// Acquire switch resources, connect the outbound socket and bridge the
    /// call channel to it.
    pub async fn start(
        switch: &Arc<SwitchClient>,
        call_id: &str,
        channel_id: &str,
        sample_rate: u32,
    ) -> Result<Self, CallError> {
        let format = codec_for_rate(sample_rate)
            .ok_or_else(|| {
                CallError::Validation(format!("no linear codec for {sample_rate} Hz"))
            })?
            .to_string();

        let media_channel_id = format!("ttsplay-{}", Uuid::new_v4());
        let bridge_id = format!("playbridge-{}", Uuid::new_v4());

        // 1. External-media channel; its connection id names the socket the
        // switch is holding open for us.
        let media_channel = switch
            .external_media(&ExternalMediaParams {
                channel_id: media_channel_id.clone(),
                format: format.clone(),
            })
            .await?;
        let connection_id = match switch.media_connection_id(&media_channel).await {
            Ok(id) => id,
            Err(e) => {
                release(switch, &media_channel_id, None).await;
                return Err(e.into());
            }
        };

        // 2. Connect the outbound socket before bridging; a server-mode
        // channel is not bridgeable until its socket side is up.
        let socket = match connect_media_socket(&switch.media_socket_url(&connection_id)).await {
            Ok(s) => s,
            Err(e) => {
                release(switch, &media_channel_id, None).await;
                return Err(e.into());
            }
        };

        // 3. Bridge the call channel itself with the media channel.
        let bridged: Result<(), CallError> = async {
            switch.create_bridge(&bridge_id, None).await?;
            switch.add_channel_to_bridge(&bridge_id, channel_id).await?;
            switch
                .add_channel_to_bridge(&bridge_id, &media_channel_id)
                .await?;
            Ok(())
        }
        .await;
        if let Err(e) = bridged {
            release(switch, &media_channel_id, Some(&bridge_id)).await;
            return Err(e);
        }

        let (sink, queue) = OutboundSink::channel();
        let writer = spawn_socket_writer(socket, queue);
        info!(call_id, bridge = %bridge_id, %format, "audio playback pipeline started");

        Ok(Self {
            info: PlaybackInfo {
                external_media_channel_id: media_channel_id,
                bridge_id,
                format,
                sample_rate,
                streaming: false,
            },
            sink,
            cancelled: Arc::new(AtomicBool::new(false)),
            writer,
        })
    }

    /// Scheduler-side handle for streaming into this pipeline.
    pub fn sink(&self) -> OutboundSink {
        self.sink.clone()
    }

    /// Cooperative cancellation flag, observed by the scheduler at every
    /// frame boundary.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Release switch resources, best-effort and concurrent.
    pub async fn teardown(self, switch: &Arc<SwitchClient>) {
        self.cancel();
        self.writer.abort();
        release(
            switch,
            &self.info.external_media_channel_id,
            Some(&self.info.bridge_id),
        )
        .await;
        debug!("playback pipeline torn down");
    }
}

async fn release(switch: &Arc<SwitchClient>, media_channel_id: &str, bridge_id: Option<&str>) {
    let remove = async {
        if let Some(bridge) = bridge_id {
            if let Err(e) = switch
                .remove_channel_from_bridge(bridge, media_channel_id)
                .await
            {
                debug!("playback teardown: remove from bridge: {e}");
            }
            if let Err(e) = switch.destroy_bridge(bridge).await {
                debug!("playback teardown: destroy bridge: {e}");
            }
        }
    };
    let hangup = async {
        if let Err(e) = switch.hangup(media_channel_id, None).await {
            debug!("playback teardown: hangup media channel: {e}");
        }
    };
    tokio::join!(remove, hangup);
}

/// Single owner of the outbound socket: pulls queued frames, writes them,
/// and keeps the shared byte counter honest for the scheduler.
fn spawn_socket_writer(
    socket: voxbridge_switch::media::MediaSocket,
    mut queue: SinkQueue,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (mut write, mut read) = socket.split();
        loop {
            tokio::select! {
                frame = queue.rx.recv() => match frame {
                    Some(frame) => {
                        let len = frame.len();
                        let result = write.send(Message::binary(frame)).await;
                        queue.complete_write(len);
                        if let Err(e) = result {
                            debug!("playback socket write failed: {e}");
                            queue.mark_closed();
                            break;
                        }
                    }
                    None => {
                        let _ = write.close().await;
                        break;
                    }
                },
                // Drain whatever the switch sends back (mixed bridge audio);
                // a closed read side means the socket is gone.
                inbound = read.next() => match inbound {
                    Some(Ok(_)) => {}
                    Some(Err(_)) | None => {
                        queue.mark_closed();
                        break;
                    }
                },
            }
        }
        // Account for anything still queued so a draining scheduler is not
        // left waiting on bytes that will never be written.
        while let Ok(frame) = queue.rx.try_recv() {
            queue.complete_write(frame.len());
        }
    })
}
