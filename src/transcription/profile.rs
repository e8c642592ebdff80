//! # Quality Profiles
//!
//! Maps a caller's `(quality, model_size)` request onto a concrete decoding
//! configuration: which Whisper checkpoint to run, on which device, and with
//! which decoding parameters.
//!
//! ## Quality Tiers:
//! | tier       | default size | beam | language detection |
//! |------------|--------------|------|--------------------|
//! | `fast`     | tiny         | 1    | once               |
//! | `balanced` | base         | 2    | once               |
//! | `high`     | small        | 4    | per segment        |
//! | `best`     | medium       | 5    | per segment        |
//!
//! An explicit model size replaces the tier's size but never its decoding
//! parameters. Unknown strings are rejected at this boundary, so nothing
//! deeper in the pipeline ever sees an unvalidated quality or size.

use crate::config::AppConfig;
use crate::device::ComputeDevice;
use crate::error::{CoreResult, TranscriptionError};
use serde::{Deserialize, Serialize};

/// Caller-facing speed/accuracy trade-off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Fast,
    Balanced,
    High,
    Best,
}

impl Quality {
    pub const ALL: [Quality; 4] = [Quality::Fast, Quality::Balanced, Quality::High, Quality::Best];

    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Fast => "fast",
            Quality::Balanced => "balanced",
            Quality::High => "high",
            Quality::Best => "best",
        }
    }

    /// Model size used when the request does not name one.
    pub fn default_model_size(&self) -> ModelSize {
        match self {
            Quality::Fast => ModelSize::Tiny,
            Quality::Balanced => ModelSize::Base,
            Quality::High => ModelSize::Small,
            Quality::Best => ModelSize::Medium,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Quality::Fast => "Fast (less accurate, tiny model)",
            Quality::Balanced => "Balanced (recommended, base model)",
            Quality::High => "High quality (small model)",
            Quality::Best => "Best quality (very slow, medium model)",
        }
    }

    fn beam_size(&self) -> usize {
        match self {
            Quality::Fast => 1,
            Quality::Balanced => 2,
            Quality::High => 4,
            Quality::Best => 5,
        }
    }

    fn language_detection(&self) -> LanguageDetection {
        match self {
            Quality::Fast | Quality::Balanced => LanguageDetection::Once,
            Quality::High | Quality::Best => LanguageDetection::PerSegment,
        }
    }
}

impl std::str::FromStr for Quality {
    type Err = TranscriptionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fast" => Ok(Quality::Fast),
            "balanced" => Ok(Quality::Balanced),
            "high" => Ok(Quality::High),
            "best" | "accurate" => Ok(Quality::Best),
            _ => Err(TranscriptionError::InvalidQuality(s.to_string())),
        }
    }
}

impl std::fmt::Display for Quality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Available Whisper model sizes.
///
/// ## Trade-offs:
/// - **Size vs Accuracy**: Larger models are more accurate but slower
/// - **Memory vs Speed**: Larger models need far more memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelSize {
    Tiny,
    Base,
    Small,
    Medium,
    #[serde(rename = "large-v3", alias = "large")]
    LargeV3,
}

impl ModelSize {
    pub const ALL: [ModelSize; 5] = [
        ModelSize::Tiny,
        ModelSize::Base,
        ModelSize::Small,
        ModelSize::Medium,
        ModelSize::LargeV3,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelSize::Tiny => "tiny",
            ModelSize::Base => "base",
            ModelSize::Small => "small",
            ModelSize::Medium => "medium",
            ModelSize::LargeV3 => "large-v3",
        }
    }

    /// Hugging Face repository holding the checkpoint.
    pub fn repo_name(&self) -> &'static str {
        match self {
            ModelSize::Tiny => "openai/whisper-tiny",
            ModelSize::Base => "openai/whisper-base",
            ModelSize::Small => "openai/whisper-small",
            ModelSize::Medium => "openai/whisper-medium",
            ModelSize::LargeV3 => "openai/whisper-large-v3",
        }
    }

    /// Approximate checkpoint size in MB.
    pub fn size_mb(&self) -> u32 {
        match self {
            ModelSize::Tiny => 39,
            ModelSize::Base => 74,
            ModelSize::Small => 244,
            ModelSize::Medium => 769,
            ModelSize::LargeV3 => 1550,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ModelSize::Tiny => "Tiny (fastest, basic accuracy)",
            ModelSize::Base => "Base (fast, good for short clips)",
            ModelSize::Small => "Small (fast, good accuracy)",
            ModelSize::Medium => "Medium (balanced speed/accuracy)",
            ModelSize::LargeV3 => "Large v3 (best accuracy, slower)",
        }
    }
}

impl std::str::FromStr for ModelSize {
    type Err = TranscriptionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "tiny" => Ok(ModelSize::Tiny),
            "base" => Ok(ModelSize::Base),
            "small" => Ok(ModelSize::Small),
            "medium" => Ok(ModelSize::Medium),
            "large-v3" | "large" => Ok(ModelSize::LargeV3),
            _ => Err(TranscriptionError::InvalidModelSize(s.to_string())),
        }
    }
}

impl std::fmt::Display for ModelSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When the decoder runs language identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LanguageDetection {
    /// Detect on the first window and reuse the result for the whole file.
    Once,
    /// Detect again for every 30 second window.
    PerSegment,
}

/// Deterministic decoding parameters handed to the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodingParams {
    /// Number of beams; 1 means greedy decoding.
    pub beam_size: usize,
    /// 0.0 decodes deterministically; anything above samples from a seeded RNG.
    pub temperature: f32,
    /// Fixed language (ISO 639-1). `None` lets the model detect it.
    pub language: Option<String>,
    pub language_detection: LanguageDetection,
    /// Windows whose no-speech probability is above this...
    pub no_speech_threshold: f32,
    /// ...and whose mean token log-probability is below this are treated as silence.
    pub logprob_threshold: f32,
    /// Longest run of one repeated n-gram the decoder tolerates before stopping.
    pub max_repeat_run: usize,
    /// Seed for sampling when `temperature > 0`.
    pub seed: u64,
}

/// Fully resolved configuration for one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityProfile {
    pub quality: Quality,
    pub model: ModelSize,
    pub device: ComputeDevice,
    pub decoding: DecodingParams,
}

impl QualityProfile {
    /// Identifier of the checkpoint (Hugging Face repo).
    pub fn model_identifier(&self) -> &'static str {
        self.model.repo_name()
    }
}

/// Resolves `(quality, model_size)` pairs into profiles.
///
/// Holds only startup configuration, so resolution is pure: the same
/// inputs always produce the same profile.
#[derive(Debug, Clone)]
pub struct QualityProfileResolver {
    default_model_size: Option<ModelSize>,
    accelerated_available: bool,
    language: Option<String>,
}

impl QualityProfileResolver {
    pub fn new(
        default_model_size: Option<ModelSize>,
        accelerated_available: bool,
        language: Option<String>,
    ) -> Self {
        Self {
            default_model_size,
            accelerated_available,
            language,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.models.default_model_size,
            config.device.accelerated_available,
            config.models.language.clone(),
        )
    }

    /// Resolve a request into a profile.
    ///
    /// The quality is parsed first, so an unknown quality always wins over
    /// an unknown model size. An empty model size counts as absent (HTML
    /// forms send empty fields).
    pub fn resolve(&self, quality: &str, model_size: Option<&str>) -> CoreResult<QualityProfile> {
        let quality: Quality = quality.parse()?;

        let model = match model_size.map(str::trim).filter(|s| !s.is_empty()) {
            Some(raw) => raw.parse::<ModelSize>()?,
            None => self
                .default_model_size
                .unwrap_or_else(|| quality.default_model_size()),
        };

        let device = if self.accelerated_available {
            ComputeDevice::Accelerated
        } else {
            ComputeDevice::Cpu
        };

        Ok(QualityProfile {
            quality,
            model,
            device,
            decoding: DecodingParams {
                beam_size: quality.beam_size(),
                temperature: 0.0,
                language: self.language.clone(),
                language_detection: quality.language_detection(),
                no_speech_threshold: 0.6,
                logprob_threshold: -1.0,
                max_repeat_run: 3,
                seed: 299_792_458,
            },
        })
    }
}

/// `(value, description)` pairs for every quality tier.
pub fn quality_options() -> Vec<(&'static str, &'static str)> {
    Quality::ALL.iter().map(|q| (q.as_str(), q.description())).collect()
}

/// `(value, description)` pairs for every model size.
pub fn model_options() -> Vec<(&'static str, &'static str)> {
    ModelSize::ALL.iter().map(|m| (m.as_str(), m.description())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> QualityProfileResolver {
        QualityProfileResolver::new(None, false, None)
    }

    #[test]
    fn test_tier_defaults() {
        let r = resolver();
        assert_eq!(r.resolve("fast", None).unwrap().model, ModelSize::Tiny);
        assert_eq!(r.resolve("balanced", None).unwrap().model, ModelSize::Base);
        assert_eq!(r.resolve("high", None).unwrap().model, ModelSize::Small);
        assert_eq!(r.resolve("best", None).unwrap().model, ModelSize::Medium);
        assert_eq!(r.resolve("accurate", None).unwrap().quality, Quality::Best);
    }

    #[test]
    fn test_explicit_size_keeps_tier_decoding() {
        let r = resolver();
        let fast_large = r.resolve("fast", Some("large-v3")).unwrap();
        let fast_default = r.resolve("fast", None).unwrap();

        assert_eq!(fast_large.model, ModelSize::LargeV3);
        assert_eq!(fast_large.decoding, fast_default.decoding);
        assert_eq!(fast_large.model_identifier(), "openai/whisper-large-v3");
    }

    #[test]
    fn test_resolution_is_total_and_deterministic() {
        let r = resolver();
        for quality in Quality::ALL {
            for size in ModelSize::ALL {
                let first = r.resolve(quality.as_str(), Some(size.as_str())).unwrap();
                let second = r.resolve(quality.as_str(), Some(size.as_str())).unwrap();
                assert_eq!(first, second);
                assert_eq!(first.model, size);
                assert_eq!(first.quality, quality);
            }
            assert_eq!(
                r.resolve(quality.as_str(), None).unwrap(),
                r.resolve(quality.as_str(), None).unwrap()
            );
        }
    }

    #[test]
    fn test_invalid_inputs() {
        let r = resolver();
        assert_eq!(
            r.resolve("ultra", Some("tiny")),
            Err(TranscriptionError::InvalidQuality("ultra".to_string()))
        );
        assert_eq!(
            r.resolve("fast", Some("gigantic")),
            Err(TranscriptionError::InvalidModelSize("gigantic".to_string()))
        );
        // quality is checked before size
        assert!(matches!(
            r.resolve("ultra", Some("gigantic")),
            Err(TranscriptionError::InvalidQuality(_))
        ));
    }

    #[test]
    fn test_empty_size_counts_as_absent() {
        let r = resolver();
        assert_eq!(r.resolve("high", Some("  ")).unwrap().model, ModelSize::Small);
    }

    #[test]
    fn test_configured_default_and_device() {
        let r = QualityProfileResolver::new(Some(ModelSize::Small), true, Some("en".into()));
        let profile = r.resolve("fast", None).unwrap();
        assert_eq!(profile.model, ModelSize::Small);
        assert_eq!(profile.device, ComputeDevice::Accelerated);
        assert_eq!(profile.decoding.language.as_deref(), Some("en"));
        assert_eq!(profile.decoding.beam_size, 1);
    }

    #[test]
    fn test_model_size_parsing() {
        assert_eq!("medium".parse::<ModelSize>().unwrap(), ModelSize::Medium);
        assert_eq!("LARGE".parse::<ModelSize>().unwrap(), ModelSize::LargeV3);
        assert!("invalid".parse::<ModelSize>().is_err());
    }

    #[test]
    fn test_option_listings() {
        assert_eq!(quality_options().len(), 4);
        assert_eq!(model_options()[4].0, "large-v3");
    }
}
