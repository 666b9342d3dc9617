//! Linear gain over s16le PCM

/// Scale interleaved signed 16-bit little-endian samples in place.
///
/// Samples are multiplied by `volume`, truncated toward zero and clamped to the i16
/// range. A trailing odd byte is left untouched.
pub fn apply_gain(pcm: &mut [u8], volume: f64) {
    for sample in pcm.chunks_exact_mut(2) {
        let s = i16::from_le_bytes([sample[0], sample[1]]);
        let scaled = (f64::from(s) * volume) as i32;
        let clamped = scaled.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16;
        sample.copy_from_slice(&clamped.to_le_bytes());
    }
}

/// Whether a volume needs the gain pass at all
pub fn is_unity(volume: f64) -> bool {
    volume >= 0.999
}
