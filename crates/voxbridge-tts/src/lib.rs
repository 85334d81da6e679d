//! HTTP client for the speech-synthesis service.
//!
//! One POST per utterance, returning a WAV body. Requests are raced against
//! a cooperative cancellation signal owned by the call lifecycle: a newer
//! `speak` on the same call, or the call ending, flips the signal and the
//! in-flight request resolves as `Cancelled`.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct TtsConfig {
    /// Synthesis endpoint; `None` means synthesis is not configured and
    /// every request fails with `NotConfigured`.
    pub url: Option<String>,
    pub default_voice: String,
    pub default_language: String,
    pub timeout: Duration,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            url: None,
            default_voice: "alloy".into(),
            default_language: "en".into(),
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SpeakRequest {
    pub text: String,
    pub voice: Option<String>,
    pub language: Option<String>,
    pub speed: Option<f32>,
}

/// A completed synthesis: the WAV body plus the voice/language actually used.
#[derive(Debug, Clone)]
pub struct Synthesis {
    pub wav: Vec<u8>,
    pub voice: String,
    pub language: String,
}

#[derive(Debug, Error)]
pub enum TtsError {
    #[error("speech synthesis is not configured")]
    NotConfigured,

    #[error("speech synthesis timed out after {0:?}")]
    Timeout(Duration),

    #[error("speech synthesis cancelled")]
    Cancelled,

    #[error("synthesis server returned {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("synthesis transport error: {0}")]
    Transport(String),
}

#[derive(Serialize)]
struct WireRequest<'a> {
    input: &'a str,
    voice: &'a str,
    response_format: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    speed: Option<f32>,
    language: &'a str,
}

pub struct TtsClient {
    cfg: TtsConfig,
    http: reqwest::Client,
}

impl TtsClient {
    pub fn new(cfg: TtsConfig) -> Self {
        Self {
            cfg,
            http: reqwest::Client::new(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.cfg.url.is_some()
    }

    pub fn default_voice(&self) -> &str {
        &self.cfg.default_voice
    }

    pub fn default_language(&self) -> &str {
        &self.cfg.default_language
    }

    /// Synthesize `req`, racing the request against `cancel` flipping true.
    pub async fn synthesize(
        &self,
        req: &SpeakRequest,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<Synthesis, TtsError> {
        let url = self.cfg.url.as_deref().ok_or(TtsError::NotConfigured)?;
        let voice = req.voice.clone().unwrap_or_else(|| self.cfg.default_voice.clone());
        let language = req
            .language
            .clone()
            .unwrap_or_else(|| self.cfg.default_language.clone());

        let wire = WireRequest {
            input: &req.text,
            voice: &voice,
            response_format: "wav",
            speed: req.speed,
            language: &language,
        };

        debug!(voice, language, chars = req.text.len(), "synthesis request");
        let request = self
            .http
            .post(url)
            .timeout(self.cfg.timeout)
            .json(&wire)
            .send();

        let resp = tokio::select! {
            resp = request => resp,
            _ = cancel.wait_for(|&c| c) => return Err(TtsError::Cancelled),
        };

        let resp = resp.map_err(|e| {
            if e.is_timeout() {
                TtsError::Timeout(self.cfg.timeout)
            } else {
                TtsError::Transport(e.to_string())
            }
        })?;

        let status = resp.status().as_u16();
        if !(200..300).contains(&status) {
            let message = resp.text().await.unwrap_or_default();
            return Err(TtsError::Upstream { status, message });
        }

        let body = tokio::select! {
            body = resp.bytes() => body.map_err(|e| TtsError::Transport(e.to_string()))?,
            _ = cancel.wait_for(|&c| c) => return Err(TtsError::Cancelled),
        };

        Ok(Synthesis {
            wav: body.to_vec(),
            voice,
            language,
        })
    }
}
