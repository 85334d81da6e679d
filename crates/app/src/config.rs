//! Service configuration: a TOML file plus a handful of environment
//! overrides for deployment secrets.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct SwitchSection {
    pub url: String,
    pub username: String,
    pub password: String,
    /// Stasis application name on the switch.
    #[serde(default = "default_app")]
    pub app: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub api_key: Option<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InboundSection {
    /// Delay between the inbound ring indication and the answer.
    #[serde(default = "default_ring_delay_ms")]
    pub ring_delay_ms: u64,
    #[serde(default = "default_greeting")]
    pub greeting_media: String,
    #[serde(default = "default_beep")]
    pub beep_media: String,
}

impl Default for InboundSection {
    fn default() -> Self {
        Self {
            ring_delay_ms: default_ring_delay_ms(),
            greeting_media: default_greeting(),
            beep_media: default_beep(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AsrSection {
    pub url: String,
    #[serde(default = "default_language")]
    pub language: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TtsSection {
    pub url: Option<String>,
    #[serde(default = "default_voice")]
    pub default_voice: String,
    #[serde(default = "default_tts_language")]
    pub default_language: String,
    #[serde(default = "default_tts_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct WebhookSection {
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AllowlistSection {
    /// JSON file with `{"inbound": [...], "outbound": [...]}`; hot-reloaded
    /// on change. Absent means allow everything.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub switch: SwitchSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub inbound: InboundSection,
    pub asr: Option<AsrSection>,
    #[serde(default)]
    pub tts: TtsSection,
    #[serde(default)]
    pub webhook: WebhookSection,
    #[serde(default)]
    pub allowlist: AllowlistSection,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config =
            toml::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Secrets and endpoints may be supplied by the environment instead of
    /// the file.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("VOXBRIDGE_SWITCH_URL") {
            self.switch.url = v;
        }
        if let Ok(v) = std::env::var("VOXBRIDGE_SWITCH_PASSWORD") {
            self.switch.password = v;
        }
        if let Ok(v) = std::env::var("VOXBRIDGE_ASR_URL") {
            match &mut self.asr {
                Some(asr) => asr.url = v,
                None => {
                    self.asr = Some(AsrSection {
                        url: v,
                        language: default_language(),
                    })
                }
            }
        }
        if let Ok(v) = std::env::var("VOXBRIDGE_TTS_URL") {
            self.tts.url = Some(v);
        }
        if let Ok(v) = std::env::var("VOXBRIDGE_API_KEY") {
            self.server.api_key = Some(v);
        }
    }

    pub fn ring_delay(&self) -> Duration {
        Duration::from_millis(self.inbound.ring_delay_ms)
    }

    pub fn tts_timeout(&self) -> Duration {
        Duration::from_millis(self.tts.timeout_ms)
    }
}

fn default_app() -> String {
    "voxbridge".into()
}
fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8090
}
fn default_ring_delay_ms() -> u64 {
    3000
}
fn default_greeting() -> String {
    "sound:hello-world".into()
}
fn default_beep() -> String {
    "sound:beep".into()
}
fn default_language() -> String {
    "English".into()
}
fn default_voice() -> String {
    "alloy".into()
}
fn default_tts_language() -> String {
    "en".into()
}
fn default_tts_timeout_ms() -> u64 {
    30_000
}
