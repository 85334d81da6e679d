//! Event shapes pushed over the switch's WebSocket event link.

use serde::Deserialize;

use crate::types::{Channel, LiveRecording, Playback};

/// Events the orchestrator reacts to. Everything else the switch pushes is
/// parsed as `Other` and dropped after a trace line.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum SwitchEvent {
    /// A channel entered our application.
    StasisStart {
        channel: Channel,
        #[serde(default)]
        args: Vec<String>,
    },
    /// A channel left our application (hangup or transfer away).
    StasisEnd { channel: Channel },
    ChannelStateChange { channel: Channel },
    ChannelDtmfReceived { channel: Channel, digit: String },
    ChannelDestroyed {
        channel: Channel,
        #[serde(default)]
        cause: i32,
        #[serde(default)]
        cause_txt: String,
    },
    PlaybackStarted { playback: Playback },
    PlaybackFinished { playback: Playback },
    RecordingFinished { recording: LiveRecording },
    RecordingFailed { recording: LiveRecording },
    #[serde(other)]
    Other,
}

impl SwitchEvent {
    /// The channel id this event concerns, when it concerns one.
    pub fn channel_id(&self) -> Option<&str> {
        match self {
            SwitchEvent::StasisStart { channel, .. }
            | SwitchEvent::StasisEnd { channel }
            | SwitchEvent::ChannelStateChange { channel }
            | SwitchEvent::ChannelDtmfReceived { channel, .. }
            | SwitchEvent::ChannelDestroyed { channel, .. } => Some(&channel.id),
            _ => None,
        }
    }
}
