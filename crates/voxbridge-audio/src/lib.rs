//! WAV/PCM codec utilities for the VoxBridge media pipeline.
//!
//! Everything here operates on signed-linear PCM, which is the only format
//! the switch's external-media channels speak. The conversion chain for
//! synthesized audio is: parse RIFF/WAVE -> downmix to mono -> widen to
//! 16-bit -> resample down to the nearest standard slin rate.

pub mod resample;
pub mod slin;
pub mod wav;

pub use resample::resample_linear;
pub use slin::{codec_for_rate, nearest_standard_rate, STANDARD_RATES};
pub use wav::{downmix_to_mono, parse_wav, write_wav, PcmAudio};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("malformed WAV data: {0}")]
    Malformed(#[from] hound::Error),

    #[error("unsupported sample format: {bits}-bit {format}")]
    UnsupportedFormat { bits: u16, format: &'static str },

    #[error("WAV contains no audio channels")]
    NoChannels,
}
