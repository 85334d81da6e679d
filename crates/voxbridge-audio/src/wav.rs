//! RIFF/WAVE parsing and writing on top of `hound`, plus channel downmix
//! and bit-depth widening.

use std::io::Cursor;

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};

use crate::AudioError;

/// Decoded PCM audio, always mono signed 16-bit after [`parse_wav`].
#[derive(Debug, Clone, PartialEq)]
pub struct PcmAudio {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

impl PcmAudio {
    /// Duration of the buffer in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Interpret the samples as little-endian bytes for the wire.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.samples.len() * 2);
        for s in &self.samples {
            out.extend_from_slice(&s.to_le_bytes());
        }
        out
    }
}

/// Parse a RIFF/WAVE byte buffer into mono 16-bit PCM.
///
/// Multi-channel input is downmixed by averaging; 8-bit input is widened to
/// 16-bit. Other widths and float formats are rejected: the switch only
/// speaks signed-linear, and the TTS server is asked for plain WAV.
pub fn parse_wav(bytes: &[u8]) -> Result<PcmAudio, AudioError> {
    let mut reader = WavReader::new(Cursor::new(bytes))?;
    let spec = reader.spec();

    if spec.channels == 0 {
        return Err(AudioError::NoChannels);
    }

    let samples: Vec<i16> = match (spec.sample_format, spec.bits_per_sample) {
        (SampleFormat::Int, 16) => reader.samples::<i16>().collect::<Result<_, _>>()?,
        (SampleFormat::Int, 8) => {
            // hound presents 8-bit samples as signed; widen into the full
            // 16-bit range.
            reader
                .samples::<i16>()
                .map(|s| s.map(|v| v << 8))
                .collect::<Result<_, _>>()?
        }
        (format, bits) => {
            return Err(AudioError::UnsupportedFormat {
                bits,
                format: match format {
                    SampleFormat::Int => "int",
                    SampleFormat::Float => "float",
                },
            })
        }
    };

    let mono = if spec.channels == 1 {
        samples
    } else {
        downmix_to_mono(&samples, spec.channels)
    };

    Ok(PcmAudio {
        samples: mono,
        sample_rate: spec.sample_rate,
    })
}

/// Average interleaved channels down to mono.
///
/// For stereo this is `round((L + R) / 2)` clamped to i16; a trailing
/// partial frame is dropped.
pub fn downmix_to_mono(interleaved: &[i16], channels: u16) -> Vec<i16> {
    let n = channels as usize;
    if n <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(n)
        .map(|frame| {
            let sum: i64 = frame.iter().map(|&s| s as i64).sum();
            let avg = (sum as f64 / n as f64).round() as i64;
            avg.clamp(i16::MIN as i64, i16::MAX as i64) as i16
        })
        .collect()
}

/// Wrap mono 16-bit PCM in a RIFF/WAVE header.
pub fn write_wav(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>, AudioError> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = WavWriter::new(&mut cursor, spec)?;
        for &s in samples {
            writer.write_sample(s)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slin::STANDARD_RATES;

    #[test]
    fn wav_round_trip_is_byte_identical() {
        // Wrapping PCM in a header and re-parsing must yield the same
        // samples for every standard slin rate.
        let samples: Vec<i16> = (0..1600).map(|i| ((i * 37) % 20001 - 10000) as i16).collect();
        for rate in STANDARD_RATES {
            let wav = write_wav(&samples, rate).unwrap();
            let parsed = parse_wav(&wav).unwrap();
            assert_eq!(parsed.sample_rate, rate);
            assert_eq!(parsed.samples, samples, "round trip at {rate} Hz");
        }
    }

    #[test]
    fn stereo_downmix_is_rounded_average() {
        let interleaved = vec![100i16, 200, -100, -201, 7, 8, i16::MAX, i16::MAX];
        let mono = downmix_to_mono(&interleaved, 2);
        assert_eq!(mono[0], 150);
        // (-100 + -201) / 2 = -150.5 -> rounds away from zero to -151
        assert_eq!(mono[1], -151);
        // (7 + 8) / 2 = 7.5 -> 8
        assert_eq!(mono[2], 8);
        assert_eq!(mono[3], i16::MAX);
    }

    #[test]
    fn stereo_wav_parses_to_mono() {
        let spec = WavSpec {
            channels: 2,
            sample_rate: 16_000,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = WavWriter::new(&mut cursor, spec).unwrap();
            for pair in [(1000i16, 2000i16), (-500, -500), (0, 1)] {
                writer.write_sample(pair.0).unwrap();
                writer.write_sample(pair.1).unwrap();
            }
            writer.finalize().unwrap();
        }
        let parsed = parse_wav(&cursor.into_inner()).unwrap();
        assert_eq!(parsed.samples, vec![1500, -500, 1]);
    }

    #[test]
    fn eight_bit_input_is_widened() {
        let spec = WavSpec {
            channels: 1,
            sample_rate: 8_000,
            bits_per_sample: 8,
            sample_format: SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = WavWriter::new(&mut cursor, spec).unwrap();
            for v in [0i8, 1, -1, 127, -128] {
                writer.write_sample(v).unwrap();
            }
            writer.finalize().unwrap();
        }
        let parsed = parse_wav(&cursor.into_inner()).unwrap();
        assert_eq!(parsed.samples, vec![0, 256, -256, 127 << 8, -128 << 8]);
    }

    #[test]
    fn float_wav_is_rejected() {
        let spec = WavSpec {
            channels: 1,
            sample_rate: 16_000,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = WavWriter::new(&mut cursor, spec).unwrap();
            writer.write_sample(0.5f32).unwrap();
            writer.finalize().unwrap();
        }
        assert!(matches!(
            parse_wav(&cursor.into_inner()),
            Err(AudioError::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn truncated_header_is_malformed() {
        assert!(matches!(
            parse_wav(&[0x52, 0x49, 0x46, 0x46]),
            Err(AudioError::Malformed(_))
        ));
    }
}
