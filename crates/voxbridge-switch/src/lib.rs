//! Typed adapter over the switch's REST + event-stream control interface.
//!
//! The switch (an Asterisk-style PBX) exposes channel, bridge, recording and
//! endpoint operations over REST and pushes call events over a WebSocket.
//! This crate narrows that surface to exactly the operations the
//! orchestrator needs, normalizes errors into `{status, message}` pairs,
//! wraps every setup-path call in a deadline, and keeps the event link
//! alive with a fixed-delay reconnect loop.

pub mod client;
pub mod error;
pub mod events;
pub mod media;
pub mod types;

pub use client::{SwitchClient, SwitchConfig};
pub use error::SwitchError;
pub use events::SwitchEvent;
pub use types::{Bridge, CallerId, Channel, Endpoint, Playback, StoredRecording};

use std::time::Duration;

/// Deadline for every setup-path REST call.
pub const SETUP_DEADLINE: Duration = Duration::from_secs(10);

/// Deadline for connecting a media socket once the switch has offered one.
pub const MEDIA_CONNECT_DEADLINE: Duration = Duration::from_secs(5);

/// Fixed delay between event-link reconnect attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Channel-ID prefixes of synthetic channels created by the orchestrator.
/// Events for these never correspond to real calls and are kept away from
/// call dispatch; their StasisStart instead fulfils registered waiters.
pub const SYNTHETIC_PREFIXES: [&str; 3] = ["snoop-", "audiocap-", "ttsplay-"];

/// True when `channel_id` names an internal synthetic channel.
pub fn is_synthetic_channel(channel_id: &str) -> bool {
    SYNTHETIC_PREFIXES.iter().any(|p| channel_id.starts_with(p))
}
