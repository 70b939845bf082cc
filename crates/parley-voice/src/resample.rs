//! Linear-interpolation resampler from the device rate to the endpoint's input rate.
//!
//! Works block by block with no look-ahead or carried state, so latency is bounded by
//! the capture block size. Voice content tolerates the interpolation artifacts.

use crate::codec::quantize;

/// A block of normalized samples as delivered by the capture device.
///
/// Multi-channel blocks are interleaved. Created per capture callback and consumed
/// immediately.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBlock {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioBlock {
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples,
            sample_rate,
            channels,
        }
    }

    /// Mono block at `sample_rate`.
    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self::new(samples, sample_rate, 1)
    }

    /// Number of frames (samples per channel).
    pub fn frames(&self) -> usize {
        match self.channels {
            0 => 0,
            n => self.samples.len() / n as usize,
        }
    }

    /// Average interleaved channels down to one. Mono samples are returned as-is.
    pub fn to_mono(&self) -> Vec<f32> {
        let channels = self.channels.max(1) as usize;
        if channels == 1 {
            return self.samples.clone();
        }
        self.samples
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    }
}

/// Number of output samples for `input_len` samples converted `input_rate -> target_rate`.
///
/// Equal to `ceil(input_len / (input_rate / target_rate))`, computed in integers.
pub fn output_len(input_len: usize, input_rate: u32, target_rate: u32) -> usize {
    if input_len == 0 || input_rate == 0 {
        return 0;
    }
    let num = input_len as u64 * target_rate as u64;
    num.div_ceil(input_rate as u64) as usize
}

/// Convert a block to quantized mono samples at `target_rate`.
///
/// When the rates match the samples are quantized directly. Otherwise output sample
/// `i` interpolates between input `floor(i * ratio)` and `ceil(i * ratio)`, with both
/// indices clamped to the last input sample.
pub fn resample(block: &AudioBlock, target_rate: u32) -> Vec<i16> {
    let input = block.to_mono();
    if input.is_empty() || target_rate == 0 || block.sample_rate == 0 {
        return Vec::new();
    }

    if block.sample_rate == target_rate {
        return input.iter().map(|&s| quantize(s)).collect();
    }

    let ratio = block.sample_rate as f64 / target_rate as f64;
    let last = input.len() - 1;
    let out_len = output_len(input.len(), block.sample_rate, target_rate);

    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let pos = i as f64 * ratio;
        let lo = (pos.floor() as usize).min(last);
        let hi = (pos.ceil() as usize).min(last);
        let frac = (pos - pos.floor()) as f32;
        let value = input[lo] + (input[hi] - input[lo]) * frac;
        out.push(quantize(value));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(len: usize) -> Vec<f32> {
        (0..len).map(|i| (i as f32 / len as f32) * 2.0 - 1.0).collect()
    }

    #[test]
    fn identity_rate_matches_direct_quantization() {
        let samples = ramp(512);
        let block = AudioBlock::mono(samples.clone(), 16_000);
        let direct: Vec<i16> = samples.iter().map(|&s| quantize(s)).collect();
        assert_eq!(resample(&block, 16_000), direct);
    }

    #[test]
    fn downsample_48k_block_length() {
        let block = AudioBlock::mono(vec![0.1; 4096], 48_000);
        let out = resample(&block, 16_000);
        assert_eq!(out.len(), 1366);
        assert_eq!(crate::codec::pack_i16(&out).len(), 2732);
    }

    #[test]
    fn downsample_by_three_picks_every_third_sample() {
        let input: Vec<f32> = (0..9).map(|i| i as f32 / 10.0).collect();
        let block = AudioBlock::mono(input.clone(), 48_000);
        let out = resample(&block, 16_000);
        assert_eq!(out, vec![quantize(0.0), quantize(0.3), quantize(0.6)]);
    }

    #[test]
    fn upsample_interpolates_and_clamps_tail() {
        let block = AudioBlock::mono(vec![0.0, 0.5], 8_000);
        let out = resample(&block, 16_000);
        // Positions 0.0, 0.5, 1.0, 1.5 -> the last reads past the end and clamps.
        assert_eq!(out.len(), 4);
        assert_eq!(out[0], 0);
        assert_eq!(out[1], quantize(0.25));
        assert_eq!(out[2], quantize(0.5));
        assert_eq!(out[3], quantize(0.5));
    }

    #[test]
    fn non_integer_ratio_44100() {
        let block = AudioBlock::mono(vec![0.0; 4096], 44_100);
        assert_eq!(resample(&block, 16_000).len(), output_len(4096, 44_100, 16_000));
        assert_eq!(output_len(4096, 44_100, 16_000), 1487);
    }

    #[test]
    fn stereo_is_downmixed_before_resampling() {
        let block = AudioBlock::new(vec![1.0, 0.0, 1.0, 0.0], 16_000, 2);
        assert_eq!(block.frames(), 2);
        assert_eq!(resample(&block, 16_000), vec![quantize(0.5), quantize(0.5)]);
    }

    #[test]
    fn empty_block_produces_nothing() {
        let block = AudioBlock::mono(Vec::new(), 48_000);
        assert!(resample(&block, 16_000).is_empty());
    }
}
