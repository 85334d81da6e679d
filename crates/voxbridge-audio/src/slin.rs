//! Sample-rate to switch codec-name mapping.
//!
//! The switch names its linear signed-PCM codecs `slin` (8 kHz), `slin16`,
//! `slin24` and so on. Rates without an exact entry are resampled down to
//! the nearest standard rate before streaming.

/// Sample rates the switch has a native slin codec for, ascending.
pub const STANDARD_RATES: [u32; 8] = [
    8_000, 16_000, 24_000, 32_000, 44_100, 48_000, 96_000, 192_000,
];

/// Codec name for an exactly-supported sample rate, `None` otherwise.
pub fn codec_for_rate(rate: u32) -> Option<&'static str> {
    match rate {
        8_000 => Some("slin"),
        16_000 => Some("slin16"),
        24_000 => Some("slin24"),
        32_000 => Some("slin32"),
        44_100 => Some("slin44"),
        48_000 => Some("slin48"),
        96_000 => Some("slin96"),
        192_000 => Some("slin192"),
        _ => None,
    }
}

/// Nearest standard rate at or below `rate`.
///
/// Rates below 8 kHz have no lower neighbour and map up to 8 kHz, the
/// lowest codec the switch offers.
pub fn nearest_standard_rate(rate: u32) -> u32 {
    STANDARD_RATES
        .iter()
        .rev()
        .copied()
        .find(|&r| r <= rate)
        .unwrap_or(STANDARD_RATES[0])
}
