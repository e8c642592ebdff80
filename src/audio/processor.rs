//! # Audio Preprocessing
//!
//! Converts decoded audio into the canonical form Whisper expects:
//! 16 kHz, mono, `f32` in `[-1.0, 1.0]`, centred on zero.
//!
//! ## Steps:
//! 1. **Down-mix**: average interleaved channels into one
//! 2. **Resample**: band-limited sinc interpolation (rubato) to 16 kHz
//! 3. **Remove DC offset**: subtract the mean so silence sits at 0.0

use crate::audio::decoder::DecodedAudio;
use crate::error::{CoreResult, TranscriptionError};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use tracing::debug;

/// Sample rate of every model input.
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Audio preprocessing utilities.
pub struct AudioProcessor;

impl AudioProcessor {
    /// Run the whole preprocessing chain.
    pub fn to_canonical(audio: DecodedAudio) -> CoreResult<Vec<f32>> {
        let mono = Self::downmix(&audio.samples, audio.channels);
        let mut resampled = Self::resample(&mono, audio.sample_rate, TARGET_SAMPLE_RATE)?;
        Self::remove_dc_offset(&mut resampled);

        debug!(
            source_rate = audio.sample_rate,
            source_channels = audio.channels,
            output_samples = resampled.len(),
            "Audio converted to 16 kHz mono"
        );

        Ok(resampled)
    }

    /// Average interleaved channels into a single channel.
    pub fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
        if channels <= 1 {
            return interleaved.to_vec();
        }
        interleaved
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    }

    /// Resample mono audio. Identity when the rates already match.
    pub fn resample(input: &[f32], from_rate: u32, to_rate: u32) -> CoreResult<Vec<f32>> {
        if from_rate == to_rate || input.is_empty() {
            return Ok(input.to_vec());
        }

        let ratio = to_rate as f64 / from_rate as f64;
        let params = SincInterpolationParameters {
            sinc_len: 256,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 256,
            window: WindowFunction::BlackmanHarris2,
        };

        let mut resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, input.len(), 1)
            .map_err(|e| TranscriptionError::DecodeFailure(format!("resampler setup: {}", e)))?;

        let waves_in = vec![input.to_vec()];
        let waves_out = resampler
            .process(&waves_in, None)
            .map_err(|e| TranscriptionError::DecodeFailure(format!("resampling: {}", e)))?;

        Ok(waves_out.into_iter().next().unwrap_or_default())
    }

    /// Subtract the mean from every sample.
    pub fn remove_dc_offset(samples: &mut [f32]) {
        if samples.is_empty() {
            return;
        }
        let mean = samples.iter().map(|&s| s as f64).sum::<f64>() / samples.len() as f64;
        let mean = mean as f32;
        for sample in samples.iter_mut() {
            *sample -= mean;
        }
    }

    /// Duration in seconds of canonical audio.
    pub fn duration_secs(samples: &[f32]) -> f64 {
        samples.len() as f64 / TARGET_SAMPLE_RATE as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downmix() {
        let stereo = vec![1.0, 0.0, 0.5, 0.5, -1.0, 1.0];
        assert_eq!(AudioProcessor::downmix(&stereo, 2), vec![0.5, 0.5, 0.0]);
        assert_eq!(AudioProcessor::downmix(&stereo, 1), stereo);
    }

    #[test]
    fn test_dc_offset_removal() {
        let mut samples = vec![0.25, 0.75, 0.25, 0.75];
        AudioProcessor::remove_dc_offset(&mut samples);
        let mean: f32 = samples.iter().sum::<f32>() / samples.len() as f32;
        assert!(mean.abs() < 1e-6);
        assert!((samples[0] + 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_resample_identity_and_upsample() {
        let input: Vec<f32> = (0..8000).map(|i| (i as f32 * 0.01).sin() * 0.5).collect();
        assert_eq!(AudioProcessor::resample(&input, 16000, 16000).unwrap(), input);

        let upsampled = AudioProcessor::resample(&input, 8000, 16000).unwrap();
        let expected = 16000.0;
        let deviation = (upsampled.len() as f64 - expected).abs() / expected;
        assert!(deviation < 0.05, "got {} samples", upsampled.len());
    }

    #[test]
    fn test_to_canonical_stereo_8k() {
        let samples: Vec<f32> = (0..1600).map(|i| if i % 2 == 0 { 0.5 } else { 0.3 }).collect();
        let audio = DecodedAudio {
            samples,
            sample_rate: 8000,
            channels: 2,
        };
        let canonical = AudioProcessor::to_canonical(audio).unwrap();
        assert!((AudioProcessor::duration_secs(&canonical) - 0.1).abs() < 0.01);
        let mean: f32 = canonical.iter().sum::<f32>() / canonical.len() as f32;
        assert!(mean.abs() < 1e-4);
    }
}
