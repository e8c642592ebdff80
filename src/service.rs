//! # Transcription Service
//!
//! Orchestrates one request from upload to transcript:
//!
//! ```text
//! Received → Validated → Resolved → ModelAcquired → Transcribed → Cleaned → Completed
//!     └──────────────┴───────────┴───────────────┴─────────────┴─────────→ Failed(kind)
//! ```
//!
//! Each transition is traced with the request id. Failures keep the kind
//! raised by the stage that failed; nothing is retried here (the only retry
//! is the device fallback inside the model manager).
//!
//! ## Concurrency:
//! - A semaphore caps requests being processed, including requests whose
//!   caller already gave up
//! - The pipeline runs in its own task. The caller waits on it under a
//!   deadline; on expiry it gets `Timeout` while the task runs to
//!   completion, releases its permit and lease, and its result is dropped

use crate::audio::FileValidator;
use crate::config::AppConfig;
use crate::error::{CoreResult, TranscriptionError};
use crate::text::TextProcessor;
use crate::transcription::engine::{EnginePerformanceStats, TranscriptionEngine};
use crate::transcription::manager::{FallbackEvent, ModelLoader, ModelManager, ResidentModel};
use crate::transcription::profile::QualityProfileResolver;
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{info, warn};
use uuid::Uuid;

/// One transcription request, immutable once built.
#[derive(Debug, Clone)]
pub struct TranscriptionRequest {
    pub audio_bytes: Bytes,
    /// Only used to pick an error kind when the content is not recognised
    pub file_name: String,
    pub quality: String,
    pub model_size: Option<String>,
    /// Overrides the configured deadline
    pub timeout: Option<Duration>,
}

impl TranscriptionRequest {
    pub fn new(audio_bytes: impl Into<Bytes>, file_name: &str, quality: &str) -> Self {
        Self {
            audio_bytes: audio_bytes.into(),
            file_name: file_name.to_string(),
            quality: quality.to_string(),
            model_size: None,
            timeout: None,
        }
    }

    pub fn with_model_size(mut self, model_size: &str) -> Self {
        self.model_size = Some(model_size.to_string());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// What the caller gets back.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptionResult {
    pub transcript: String,
    pub model_used: String,
    pub device: String,
}

/// Request lifecycle stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Validated,
    Resolved,
    ModelAcquired,
    Transcribed,
    Cleaned,
    Completed,
    Failed(&'static str),
}

impl Stage {
    fn is_terminal(&self) -> bool {
        matches!(self, Stage::Completed | Stage::Failed(_))
    }
}

/// Traces stage transitions of one request.
struct StageTracker {
    request_id: Uuid,
    file_name: String,
    stage: Stage,
    started: Instant,
}

impl StageTracker {
    fn new(request_id: Uuid, file_name: &str) -> Self {
        info!(%request_id, file_name = %file_name, "Transcription request received");
        Self {
            request_id,
            file_name: file_name.to_string(),
            stage: Stage::Received,
            started: Instant::now(),
        }
    }

    fn advance(&mut self, next: Stage) {
        if self.stage.is_terminal() {
            return;
        }
        tracing::debug!(
            request_id = %self.request_id,
            from = ?self.stage,
            to = ?next,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "Stage transition"
        );
        self.stage = next;
    }

    fn fail(&mut self, error: &TranscriptionError) {
        let from = self.stage;
        self.advance(Stage::Failed(error.kind()));
        warn!(
            request_id = %self.request_id,
            file_name = %self.file_name,
            failed_in = ?from,
            kind = error.kind(),
            "Transcription request failed: {}",
            error
        );
    }
}

/// Components shared by every request.
struct Pipeline {
    validator: FileValidator,
    resolver: QualityProfileResolver,
    manager: ModelManager,
    engine: TranscriptionEngine,
    text: TextProcessor,
}

impl Pipeline {
    async fn run(&self, request: TranscriptionRequest, request_id: Uuid) -> CoreResult<TranscriptionResult> {
        let mut tracker = StageTracker::new(request_id, &request.file_name);
        let result = self.run_stages(request, &mut tracker).await;
        match &result {
            Ok(result) => info!(
                %request_id,
                model = %result.model_used,
                device = %result.device,
                chars = result.transcript.len(),
                elapsed_ms = tracker.started.elapsed().as_millis() as u64,
                "Transcription request completed"
            ),
            Err(e) => tracker.fail(e),
        }
        result
    }

    async fn run_stages(
        &self,
        request: TranscriptionRequest,
        tracker: &mut StageTracker,
    ) -> CoreResult<TranscriptionResult> {
        let audio = self
            .validator
            .validate(&request.file_name, request.audio_bytes)?;
        tracker.advance(Stage::Validated);

        let profile = self
            .resolver
            .resolve(&request.quality, request.model_size.as_deref())?;
        tracker.advance(Stage::Resolved);

        let handle = self.manager.acquire(profile.model, profile.device).await?;
        if handle.fell_back() {
            info!(
                request_id = %tracker.request_id,
                model = %profile.model,
                "Serving on CPU after accelerated device failure"
            );
        }
        tracker.advance(Stage::ModelAcquired);

        let segments = self
            .engine
            .transcribe(&audio, &handle, &profile.decoding)
            .await?;
        tracker.advance(Stage::Transcribed);

        let transcript = self.text.clean(&segments);
        tracker.advance(Stage::Cleaned);

        let result = TranscriptionResult {
            transcript,
            model_used: handle.model_size().to_string(),
            device: handle.device().as_str().to_string(),
        };
        tracker.advance(Stage::Completed);
        Ok(result)
    }
}

/// Entry point of the transcription core.
pub struct TranscriptionService {
    pipeline: Arc<Pipeline>,
    permits: Arc<Semaphore>,
    max_in_flight: usize,
    default_timeout: Duration,
}

impl TranscriptionService {
    /// Build the service from startup configuration and a model loader.
    pub fn new(config: &AppConfig, loader: Arc<dyn ModelLoader>) -> anyhow::Result<Self> {
        let max_in_flight = config.performance.max_in_flight_requests;
        Ok(Self {
            pipeline: Arc::new(Pipeline {
                validator: FileValidator::new(config.max_file_size_bytes()),
                resolver: QualityProfileResolver::from_config(config),
                manager: ModelManager::new(loader, config.performance.max_resident_models),
                engine: TranscriptionEngine::new(),
                text: TextProcessor::new()?,
            }),
            permits: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
            default_timeout: config.request_timeout(),
        })
    }

    /// Run one request to completion or until its deadline.
    pub async fn transcribe(&self, request: TranscriptionRequest) -> CoreResult<TranscriptionResult> {
        let request_id = Uuid::new_v4();
        let deadline = request.timeout.unwrap_or(self.default_timeout);
        let pipeline = Arc::clone(&self.pipeline);
        let permits = Arc::clone(&self.permits);

        let work = async move {
            let permit = permits.acquire_owned().await.map_err(|_| {
                TranscriptionError::InferenceFailure("service is shutting down".to_string())
            })?;

            // Detached on timeout: the task keeps its permit until it finishes.
            let task = tokio::spawn(async move {
                let _permit = permit;
                pipeline.run(request, request_id).await
            });

            task.await.map_err(|e| {
                TranscriptionError::InferenceFailure(format!("request task failed: {}", e))
            })?
        };

        match tokio::time::timeout(deadline, work).await {
            Ok(result) => result,
            Err(_) => {
                warn!(%request_id, timeout_secs = deadline.as_secs_f64(), "Request timed out, finishing in background");
                Err(TranscriptionError::Timeout(deadline))
            }
        }
    }

    /// Models currently resident.
    pub async fn resident_models(&self) -> Vec<ResidentModel> {
        self.pipeline.manager.resident_models().await
    }

    /// Recent accelerated-to-CPU fallbacks.
    pub async fn fallback_events(&self) -> Vec<FallbackEvent> {
        self.pipeline.manager.fallback_events().await
    }

    pub async fn engine_stats(&self) -> EnginePerformanceStats {
        self.pipeline.engine.get_performance_stats().await
    }

    /// Requests currently holding a permit (including abandoned ones).
    pub fn in_flight(&self) -> usize {
        self.max_in_flight - self.permits.available_permits()
    }

    pub fn accelerated_usable(&self) -> bool {
        self.pipeline.manager.accelerated_usable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::validator::encode_wav;
    use crate::transcription::manager::testing::CountingLoader;
    use crate::transcription::profile::ModelSize;
    use std::collections::HashMap;

    fn service(loader: Arc<CountingLoader>, config: AppConfig) -> TranscriptionService {
        TranscriptionService::new(&config, loader).unwrap()
    }

    /// Square wave at `level`, 16 kHz mono.
    fn tone(seconds: usize, level: f32) -> Vec<u8> {
        let amplitude = (level * i16::MAX as f32) as i16;
        let samples: Vec<i16> = (0..seconds * 16000)
            .map(|i| if (i / 40) % 2 == 0 { amplitude } else { -amplitude })
            .collect();
        encode_wav(&samples, 16000, 1)
    }

    #[tokio::test]
    async fn test_silent_wav_on_fast_tier() {
        let loader = Arc::new(CountingLoader::default());
        let service = service(loader.clone(), AppConfig::default());

        let wav = encode_wav(&vec![0i16; 5 * 16000], 16000, 1);
        let result = service
            .transcribe(TranscriptionRequest::new(wav, "silence.wav", "fast"))
            .await
            .unwrap();

        assert!(result.transcript.trim().is_empty());
        assert_eq!(result.model_used, "tiny");
        assert_eq!(result.device, "cpu");
        assert_eq!(loader.total_loads(), 1);
    }

    #[tokio::test]
    async fn test_text_file_never_touches_a_model() {
        let loader = Arc::new(CountingLoader::default());
        let service = service(loader.clone(), AppConfig::default());

        let err = service
            .transcribe(TranscriptionRequest::new(
                b"just some notes, not audio".to_vec(),
                "notes.txt",
                "balanced",
            ))
            .await
            .unwrap_err();

        assert!(matches!(err, TranscriptionError::UnsupportedCodec(_)));
        assert_eq!(loader.total_loads(), 0);
        assert!(service.resident_models().await.is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_containers_never_touch_a_model() {
        let loader = Arc::new(CountingLoader::default());
        let service = service(loader.clone(), AppConfig::default());

        let mut asf = vec![0x30, 0x26, 0xB2, 0x75, 0x8E, 0x66, 0xCF, 0x11];
        asf.resize(64, 0);
        let mut avi = b"RIFF\x24\x00\x00\x00AVI LIST".to_vec();
        avi.resize(64, 0);
        let mut opus = b"OggS\x00\x02".to_vec();
        opus.resize(26, 0);
        opus.extend_from_slice(&[1, 19]);
        opus.extend_from_slice(b"OpusHead\x01\x01\x38\x01\x80\xBB\x00\x00\x00\x00\x00");

        for (name, data) in [
            ("call.wma", asf),
            ("clip.avi", avi),
            ("memo.opus", opus),
            ("talk.webm", b"\x1A\x45\xDF\xA3 webm A_OPUS".to_vec()),
        ] {
            let err = service
                .transcribe(TranscriptionRequest::new(data, name, "balanced"))
                .await
                .unwrap_err();
            assert!(matches!(err, TranscriptionError::UnsupportedCodec(_)), "{}", name);
        }

        assert_eq!(loader.total_loads(), 0);
        assert!(service.resident_models().await.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_requests_on_one_model() {
        let mut inference_delay = HashMap::new();
        inference_delay.insert(ModelSize::Base, Duration::from_millis(300));
        let loader = Arc::new(CountingLoader {
            text: "speech".to_string(),
            inference_delay,
            ..Default::default()
        });
        let service = Arc::new(service(loader.clone(), AppConfig::default()));

        let slow = {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .transcribe(TranscriptionRequest::new(tone(40, 0.2), "long.wav", "balanced"))
                    .await
            })
        };
        let quick = {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .transcribe(TranscriptionRequest::new(tone(2, 0.6), "short.wav", "balanced"))
                    .await
            })
        };

        let slow = slow.await.unwrap().unwrap();
        let quick = quick.await.unwrap().unwrap();

        assert_eq!(slow.transcript, "Speech base level 0.2 speech base level 0.2");
        assert_eq!(quick.transcript, "Speech base level 0.6");
        assert_eq!(loader.total_loads(), 1);
        assert_eq!(loader.max_parallel(ModelSize::Base), 1);
    }

    #[tokio::test]
    async fn test_timeout_leaves_work_running() {
        let mut inference_delay = HashMap::new();
        inference_delay.insert(ModelSize::Tiny, Duration::from_millis(400));
        let loader = Arc::new(CountingLoader {
            inference_delay,
            ..Default::default()
        });
        let service = service(loader.clone(), AppConfig::default());

        let request = TranscriptionRequest::new(tone(1, 0.5), "clip.wav", "fast")
            .with_timeout(Duration::from_millis(50));
        let err = service.transcribe(request).await.unwrap_err();
        assert_eq!(err, TranscriptionError::Timeout(Duration::from_millis(50)));
        assert_eq!(service.in_flight(), 1);

        // the abandoned request still finishes and frees its permit
        for _ in 0..100 {
            if service.in_flight() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(service.in_flight(), 0);
        assert_eq!(service.engine_stats().await.total_requests, 1);
        assert_eq!(service.resident_models().await[0].active_leases, 0);
    }

    #[tokio::test]
    async fn test_invalid_quality_and_size() {
        let loader = Arc::new(CountingLoader::default());
        let service = service(loader.clone(), AppConfig::default());

        let err = service
            .transcribe(TranscriptionRequest::new(tone(1, 0.5), "a.wav", "ultra"))
            .await
            .unwrap_err();
        assert_eq!(err, TranscriptionError::InvalidQuality("ultra".to_string()));

        let err = service
            .transcribe(TranscriptionRequest::new(tone(1, 0.5), "a.wav", "fast").with_model_size("huge"))
            .await
            .unwrap_err();
        assert_eq!(err, TranscriptionError::InvalidModelSize("huge".to_string()));
        assert_eq!(loader.total_loads(), 0);
    }

    #[tokio::test]
    async fn test_fallback_is_transparent_to_caller() {
        let loader = Arc::new(CountingLoader {
            fail_accelerated_init: true,
            text: "hello".to_string(),
            ..Default::default()
        });
        let mut config = AppConfig::default();
        config.device.accelerated_available = true;
        let service = service(loader.clone(), config);

        let result = service
            .transcribe(TranscriptionRequest::new(tone(1, 0.5), "a.wav", "high").with_model_size("small"))
            .await
            .unwrap();
        assert_eq!(result.device, "cpu");
        assert_eq!(result.model_used, "small");
        assert_eq!(result.transcript, "Hello small level 0.5");
        assert_eq!(service.fallback_events().await.len(), 1);
        assert!(!service.accelerated_usable());
    }

    #[test]
    fn test_stage_tracker_stops_at_terminal() {
        let mut tracker = StageTracker::new(Uuid::new_v4(), "a.wav");
        tracker.advance(Stage::Validated);
        tracker.fail(&TranscriptionError::InvalidQuality("x".into()));
        assert_eq!(tracker.stage, Stage::Failed("invalid_quality"));
        tracker.advance(Stage::Completed);
        assert_eq!(tracker.stage, Stage::Failed("invalid_quality"));
    }
}
