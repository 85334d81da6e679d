//! Streaming client for the speech-recognition service.
//!
//! One socket per call. On open the client locks the recognition language
//! with a config action (the server otherwise auto-detects per chunk and
//! flips between languages on silence), then streams raw signed-linear
//! 16-bit mono PCM as binary frames. The server answers with JSON: status
//! notes, errors, and partial/final transcriptions.
//!
//! Closing is ordered so the last utterance is never dropped: a `flush`
//! action is sent, then the client waits (bounded) for a final result and
//! emits it before the socket goes down.

mod client;
mod types;

pub use client::{AsrAudioSender, AsrSession};
pub use types::{AsrConfig, AsrError, AsrEvent, Transcription};
