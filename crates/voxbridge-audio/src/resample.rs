//! Linear-interpolation resampler for mono i16 PCM.
//!
//! Speech headed for the recognizer or the caller does not warrant a sinc
//! filter bank; a straight-line interpolation keeps the math exact enough
//! to test and cheap enough to run per call.

/// Resample `input` from `from_rate` to `to_rate` by linear interpolation.
///
/// When the rates are equal the input is returned unchanged. Output length
/// is `floor(len * to / from)`, and each output sample is interpolated
/// between its two nearest input neighbours on the source timeline.
pub fn resample_linear(input: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    assert!(from_rate > 0 && to_rate > 0, "sample rates must be nonzero");

    if from_rate == to_rate || input.is_empty() {
        return input.to_vec();
    }

    let out_len = (input.len() as u64 * to_rate as u64 / from_rate as u64) as usize;
    let ratio = from_rate as f64 / to_rate as f64;

    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let pos = i as f64 * ratio;
        let idx = pos as usize;
        let frac = pos - idx as f64;

        let a = input[idx] as f64;
        let b = if idx + 1 < input.len() {
            input[idx + 1] as f64
        } else {
            a
        };

        let v = (a + (b - a) * frac).round();
        out.push(v.clamp(i16::MIN as f64, i16::MAX as f64) as i16);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_when_rates_match() {
        let input: Vec<i16> = (0..4096).map(|i| (i % 1000) as i16 - 500).collect();
        assert_eq!(resample_linear(&input, 16_000, 16_000), input);
        assert_eq!(resample_linear(&input, 44_100, 44_100), input);
    }

    #[test]
    fn empty_input_stays_empty() {
        assert!(resample_linear(&[], 24_000, 16_000).is_empty());
    }

    #[test]
    fn halving_rate_halves_length() {
        let input = vec![0i16; 3200];
        let out = resample_linear(&input, 16_000, 8_000);
        assert_eq!(out.len(), 1600);
    }

    #[test]
    fn downsample_ramp_stays_on_the_line() {
        // A linear ramp resampled linearly must remain on the original line.
        let input: Vec<i16> = (0..4800).map(|i| (i / 2) as i16).collect();
        let out = resample_linear(&input, 48_000, 16_000);
        assert_eq!(out.len(), 1600);
        for (i, &s) in out.iter().enumerate() {
            // Output sample i sits at source position i * 3.
            let expected = ((i * 3) / 2) as i16;
            assert!(
                (s - expected).abs() <= 1,
                "sample {i}: got {s}, expected ~{expected}"
            );
        }
    }

    #[test]
    fn constant_signal_survives_odd_ratio() {
        let input = vec![1234i16; 2205];
        let out = resample_linear(&input, 22_050, 16_000);
        assert_eq!(out.len(), 1600);
        assert!(out.iter().all(|&s| s == 1234));
    }

    #[test]
    fn last_sample_does_not_read_out_of_bounds() {
        let input = vec![100i16, 200, 300];
        // Upsampling pushes interpolation positions past the last pair.
        let out = resample_linear(&input, 8_000, 48_000);
        assert_eq!(out.len(), 18);
        assert_eq!(*out.last().unwrap(), 300);
    }
}
