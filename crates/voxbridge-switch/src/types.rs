//! Wire shapes for the slice of the switch protocol the orchestrator reads.
//!
//! Only the fields the core actually consumes are modelled; everything else
//! in the switch's payloads is ignored by serde.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Channel variable carrying the media-socket connection identifier for
/// server-mode external-media channels.
pub const MEDIA_CONNECTION_VAR: &str = "MEDIA_WEBSOCKET_CONNECTION_ID";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallerId {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub number: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dialplan {
    #[serde(default)]
    pub exten: String,
    #[serde(default)]
    pub context: String,
}

/// A channel as the switch reports it.
#[derive(Debug, Clone, Deserialize)]
pub struct Channel {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub caller: CallerId,
    #[serde(default)]
    pub dialplan: Dialplan,
    #[serde(default)]
    pub channelvars: Option<HashMap<String, serde_json::Value>>,
}

impl Channel {
    /// Media-socket connection id for a server-mode external-media channel,
    /// when the switch included channel variables in the payload.
    pub fn media_connection_id(&self) -> Option<String> {
        self.channelvars
            .as_ref()?
            .get(MEDIA_CONNECTION_VAR)?
            .as_str()
            .map(str::to_string)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Bridge {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub bridge_type: String,
    #[serde(default)]
    pub channels: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub technology: String,
    pub resource: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub channel_ids: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Playback {
    pub id: String,
    #[serde(default)]
    pub media_uri: String,
    #[serde(default)]
    pub state: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LiveRecording {
    pub name: String,
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRecording {
    pub name: String,
    #[serde(default)]
    pub format: String,
}

/// Variable lookup response.
#[derive(Debug, Clone, Deserialize)]
pub struct Variable {
    pub value: String,
}

/// Options for originating a channel.
#[derive(Debug, Clone, Default)]
pub struct OriginateParams {
    pub endpoint: String,
    pub caller_id: Option<String>,
    /// Seconds to wait for the far end before giving up.
    pub timeout: Option<u32>,
    pub variables: HashMap<String, String>,
}

/// Options for creating an external-media channel.
#[derive(Debug, Clone)]
pub struct ExternalMediaParams {
    /// Channel id to assign, so events for it can be recognized.
    pub channel_id: String,
    /// slin codec name, e.g. `slin16`.
    pub format: String,
}

/// Options for starting a channel recording.
#[derive(Debug, Clone)]
pub struct RecordParams {
    pub name: String,
    pub format: String,
    pub max_duration_seconds: Option<u32>,
    pub beep: bool,
}
