use serde::Deserialize;
use thiserror::Error;

/// Errors from the switch adapter, normalized to `{status, message}` where a
/// REST response is involved.
#[derive(Debug, Error)]
pub enum SwitchError {
    /// The switch answered with a non-success status.
    #[error("switch returned {status}: {message}")]
    Api { status: u16, message: String },

    /// The switch could not be reached at all.
    #[error("switch unavailable: {0}")]
    Unavailable(String),

    /// A per-operation deadline elapsed.
    #[error("switch operation timed out: {operation}")]
    Timeout { operation: &'static str },

    /// The switch sent something we could not make sense of.
    #[error("switch protocol error: {0}")]
    Protocol(String),
}

impl SwitchError {
    /// Status code of an API error, if this is one.
    pub fn status(&self) -> Option<u16> {
        match self {
            SwitchError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }
}

/// Error bodies come back as JSON with either a `message` or an `error`
/// field, depending on the endpoint. Anything else falls through to the raw
/// body text.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
    error: Option<String>,
}

pub(crate) fn normalize_error(status: u16, body: &str) -> SwitchError {
    let message = serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.message.or(b.error))
        .unwrap_or_else(|| body.trim().to_string());
    SwitchError::Api { status, message }
}

impl From<reqwest::Error> for SwitchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() {
            SwitchError::Unavailable(err.to_string())
        } else {
            SwitchError::Protocol(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_message_field_is_extracted() {
        let err = normalize_error(404, r#"{"message":"Channel not found"}"#);
        assert!(matches!(
            err,
            SwitchError::Api { status: 404, ref message } if message == "Channel not found"
        ));
    }

    #[test]
    fn json_error_field_is_extracted() {
        let err = normalize_error(409, r#"{"error":"Channel not in Stasis"}"#);
        assert!(matches!(
            err,
            SwitchError::Api { status: 409, ref message } if message == "Channel not in Stasis"
        ));
    }

    #[test]
    fn raw_body_is_kept_when_not_json() {
        let err = normalize_error(500, "Internal Server Error\n");
        assert!(matches!(
            err,
            SwitchError::Api { status: 500, ref message } if message == "Internal Server Error"
        ));
    }
}
