use thiserror::Error;
use voxbridge_switch::SwitchError;
use voxbridge_tts::TtsError;

/// The orchestrator's error taxonomy. Every operation exposed to
/// collaborators resolves to a result or one of these; the admin surface
/// maps them onto HTTP status codes.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("switch is not connected")]
    Unavailable,

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("upstream failure ({status}): {message}")]
    Upstream { status: u16, message: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("{0} is not configured")]
    NotImplemented(&'static str),
}

impl From<SwitchError> for CallError {
    fn from(err: SwitchError) -> Self {
        match err {
            SwitchError::Api { status: 404, .. } => CallError::NotFound("switch resource"),
            SwitchError::Api { status, message } => CallError::Upstream { status, message },
            SwitchError::Unavailable(_) => CallError::Unavailable,
            SwitchError::Timeout { operation } => CallError::Timeout(operation.to_string()),
            SwitchError::Protocol(msg) => CallError::Protocol(msg),
        }
    }
}

impl From<TtsError> for CallError {
    fn from(err: TtsError) -> Self {
        match err {
            TtsError::NotConfigured => CallError::NotImplemented("speech synthesis"),
            TtsError::Timeout(d) => CallError::Timeout(format!("speech synthesis after {d:?}")),
            TtsError::Cancelled => CallError::Cancelled,
            TtsError::Upstream { status, message } => CallError::Upstream { status, message },
            TtsError::Transport(msg) => CallError::Upstream {
                status: 502,
                message: msg,
            },
        }
    }
}

impl From<voxbridge_audio::AudioError> for CallError {
    fn from(err: voxbridge_audio::AudioError) -> Self {
        CallError::Protocol(format!("synthesized audio: {err}"))
    }
}

impl From<voxbridge_asr::AsrError> for CallError {
    fn from(err: voxbridge_asr::AsrError) -> Self {
        CallError::Upstream {
            status: 502,
            message: err.to_string(),
        }
    }
}
