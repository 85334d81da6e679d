//! Per-call audio pipelines: capture (switch -> us), playback (us ->
//! switch) and the real-time scheduler that paces outbound PCM.

pub mod capture;
pub mod playback;
pub mod scheduler;

use chrono::{DateTime, Utc};

/// One chunk of captured audio, fanned out to the event stream (base64)
/// and the recognizer (raw). Never stored.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub call_id: String,
    pub timestamp: DateTime<Utc>,
    pub data: Vec<u8>,
    pub format: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_count: usize,
}
