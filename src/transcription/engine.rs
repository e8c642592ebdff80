//! # Transcription Engine
//!
//! Turns a validated upload into timed transcript segments using a leased
//! model.
//!
//! ## Key Responsibilities:
//! - **Decoding**: upload bytes to canonical 16 kHz mono PCM
//! - **Windowing**: fixed 30 second windows, one segment per window, so
//!   segments are contiguous, ordered and never overlap
//! - **Silence handling**: windows the model considers speech-free become
//!   empty segments instead of hallucinated text
//! - **Performance monitoring**: request counts, audio seconds, processing time
//!
//! Both decoding and inference are CPU-heavy and run on the blocking pool.
//! Inference holds the model instance lock for the whole file, which
//! serialises requests sharing one instance.

use crate::audio::{self, AudioProcessor, ValidatedAudio, TARGET_SAMPLE_RATE};
use crate::error::{CoreResult, TranscriptionError};
use crate::transcription::manager::ModelHandle;
use crate::transcription::model::SpeechModel;
use crate::transcription::profile::{DecodingParams, LanguageDetection};
use serde::Serialize;
use std::time::Instant;
use tokio::sync::RwLock;

/// Length of one decoding window.
pub const WINDOW_SECONDS: usize = 30;

const WINDOW_SAMPLES: usize = WINDOW_SECONDS * TARGET_SAMPLE_RATE as usize;

/// A timed piece of transcript. Times are seconds from the start of the file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// Performance tracking for the transcription engine.
#[derive(Debug, Default)]
struct EngineMetrics {
    /// Total number of transcription requests processed
    total_requests: u64,

    /// Total audio duration processed (seconds)
    total_audio_duration: f64,

    /// Total processing time (milliseconds)
    total_processing_time: u64,

    /// Number of failed transcriptions
    failed_requests: u64,

    /// Windows dropped as silence
    silent_windows: u64,
}

/// Stateless apart from its metrics; shared by every request.
#[derive(Default)]
pub struct TranscriptionEngine {
    metrics: RwLock<EngineMetrics>,
}

impl TranscriptionEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transcribe `audio` with the leased model.
    ///
    /// ## Errors:
    /// - `DecodeFailure`: the container or codec could not be decoded
    /// - `InferenceFailure`: the model failed on some window
    pub async fn transcribe(
        &self,
        audio: &ValidatedAudio,
        handle: &ModelHandle,
        decoding: &DecodingParams,
    ) -> CoreResult<Vec<TranscriptSegment>> {
        let started = Instant::now();
        let result = self.run(audio, handle, decoding).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let mut metrics = self.metrics.write().await;
        metrics.total_requests += 1;
        metrics.total_processing_time += elapsed_ms;
        match &result {
            Ok(segments) => {
                let duration = segments.last().map(|s| s.end).unwrap_or(0.0);
                metrics.total_audio_duration += duration;
                metrics.silent_windows +=
                    segments.iter().filter(|s| s.text.is_empty()).count() as u64;

                tracing::info!(
                    file_name = %audio.file_name,
                    model = %handle.model_size(),
                    device = %handle.device(),
                    audio_secs = duration,
                    segments = segments.len(),
                    elapsed_ms,
                    "Transcription completed"
                );
            }
            Err(e) => {
                metrics.failed_requests += 1;
                tracing::warn!(file_name = %audio.file_name, "Transcription failed: {}", e);
            }
        }

        result
    }

    async fn run(
        &self,
        audio: &ValidatedAudio,
        handle: &ModelHandle,
        decoding: &DecodingParams,
    ) -> CoreResult<Vec<TranscriptSegment>> {
        let upload = audio.clone();
        let pcm = tokio::task::spawn_blocking(move || audio::load_canonical_pcm(&upload))
            .await
            .map_err(|e| TranscriptionError::DecodeFailure(format!("decoder task failed: {}", e)))??;

        tracing::debug!(
            file_name = %audio.file_name,
            audio_secs = AudioProcessor::duration_secs(&pcm),
            "Decoded upload to canonical PCM"
        );
        if pcm.is_empty() {
            return Ok(Vec::new());
        }

        let loaded = handle.loaded();
        let params = decoding.clone();
        tokio::task::spawn_blocking(move || {
            loaded.with_instance_blocking(|model| decode_windows(model, &pcm, &params))
        })
        .await
        .map_err(|e| TranscriptionError::InferenceFailure(format!("inference task failed: {}", e)))?
    }

    /// Get performance statistics for the transcription engine.
    pub async fn get_performance_stats(&self) -> EnginePerformanceStats {
        let metrics = self.metrics.read().await;

        EnginePerformanceStats {
            total_requests: metrics.total_requests,
            failed_requests: metrics.failed_requests,
            total_audio_hours: metrics.total_audio_duration / 3600.0,
            average_processing_time_ms: if metrics.total_requests > 0 {
                metrics.total_processing_time / metrics.total_requests
            } else {
                0
            },
            success_rate: if metrics.total_requests > 0 {
                (metrics.total_requests - metrics.failed_requests) as f32
                    / metrics.total_requests as f32
            } else {
                0.0
            },
            silent_windows: metrics.silent_windows,
            throughput_factor: if metrics.total_processing_time > 0 {
                (metrics.total_audio_duration * 1000.0) / metrics.total_processing_time as f64
            } else {
                0.0
            },
        }
    }
}

/// Decode every window of `pcm` in order.
fn decode_windows(
    model: &mut dyn SpeechModel,
    pcm: &[f32],
    params: &DecodingParams,
) -> CoreResult<Vec<TranscriptSegment>> {
    let mut language = params.language.clone();
    let mut segments = Vec::with_capacity(pcm.len().div_ceil(WINDOW_SAMPLES));

    for (index, window) in pcm.chunks(WINDOW_SAMPLES).enumerate() {
        let start = (index * WINDOW_SAMPLES) as f64 / TARGET_SAMPLE_RATE as f64;
        let end = start + window.len() as f64 / TARGET_SAMPLE_RATE as f64;

        let forced = match params.language_detection {
            LanguageDetection::Once => language.as_deref(),
            LanguageDetection::PerSegment => params.language.as_deref(),
        };
        let output = model
            .decode_window(window, params, forced)
            .map_err(|e| TranscriptionError::InferenceFailure(format!("{:#}", e)))?;

        if language.is_none() && params.language_detection == LanguageDetection::Once {
            language = output.language.clone();
        }

        let silent = output.no_speech_prob > params.no_speech_threshold
            && output.avg_logprob < params.logprob_threshold;
        if silent {
            tracing::debug!(
                start,
                no_speech_prob = output.no_speech_prob,
                avg_logprob = output.avg_logprob,
                "Window classified as silence"
            );
        }

        segments.push(TranscriptSegment {
            start,
            end,
            text: if silent { String::new() } else { output.text },
        });
    }

    Ok(segments)
}

/// Performance statistics for the transcription engine.
#[derive(Debug, Serialize)]
pub struct EnginePerformanceStats {
    pub total_requests: u64,
    pub failed_requests: u64,
    pub total_audio_hours: f64,
    pub average_processing_time_ms: u64,
    pub success_rate: f32,
    pub silent_windows: u64,
    /// Ratio of audio time to processing time (>1.0 = faster than real time)
    pub throughput_factor: f64,
}
