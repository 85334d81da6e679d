use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct AsrConfig {
    /// WebSocket URL of the recognition server.
    pub url: String,
    /// Language to lock on open.
    pub language: String,
    /// Base delay before a reconnect attempt.
    pub reconnect_delay: Duration,
    /// Reconnect attempt cap; 0 means retry forever.
    pub max_reconnect_attempts: u32,
}

impl AsrConfig {
    pub fn new(url: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            language: language.into(),
            reconnect_delay: Duration::from_secs(2),
            max_reconnect_attempts: 10,
        }
    }
}

/// A transcription result from the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transcription {
    pub text: String,
    #[serde(default)]
    pub is_partial: bool,
    #[serde(default)]
    pub is_final: bool,
}

/// Events surfaced to the session owner.
#[derive(Debug, Clone)]
pub enum AsrEvent {
    Transcription(Transcription),
    /// The server reported an error for this session.
    ServerError(String),
    /// Reconnect attempts are exhausted; the session is dead and should be
    /// dropped by its owner.
    Disconnected { attempts: u32 },
}

#[derive(Debug, Error)]
pub enum AsrError {
    #[error("failed to connect to recognition server: {0}")]
    Connect(String),

    #[error("recognition session already closed")]
    Closed,
}
