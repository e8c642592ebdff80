//! # Whisper Model
//!
//! Loads Whisper checkpoints from Hugging Face and decodes 30 second windows
//! of 16 kHz audio with candle.
//!
//! ## Model Loading Process:
//! 1. Open the compute device (a failure here is a device init error)
//! 2. Download `config.json`, `tokenizer.json` and `model.safetensors` (cached)
//! 3. Build the mel filter bank for the model's mel bin count
//! 4. Memory-map the weights onto the device
//!
//! ## Decoding:
//! - **temperature 0**: beam search (beam size 1 is plain greedy decoding)
//! - **temperature > 0**: sampling from a `StdRng` seeded per window, so
//!   the same input and seed always give the same text
//!
//! The decoder stops at end-of-text, at the context limit, or when the
//! newest token would extend a degenerate repetition.

use crate::device::{ComputeDevice, DeviceManager};
use crate::transcription::manager::{LoadError, ModelLoader};
use crate::transcription::profile::{DecodingParams, ModelSize};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use candle_core::{Device, IndexOp, Tensor, D};
use candle_nn::VarBuilder;
use candle_transformers::models::whisper::{self as m, Config};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::PathBuf;
use tokenizers::Tokenizer;

/// Language codes Whisper was trained on, in token order.
const LANGUAGES: &[&str] = &[
    "en", "zh", "de", "es", "ru", "ko", "fr", "ja", "pt", "tr", "pl", "ca", "nl", "ar", "sv",
    "it", "id", "hi", "fi", "vi", "he", "uk", "el", "ms", "cs", "ro", "da", "hu", "ta", "no",
    "th", "ur", "hr", "bg", "lt", "la", "mi", "ml", "cy", "sk", "te", "fa", "lv", "bn", "sr",
    "az", "sl", "kn", "et", "mk", "br", "eu", "is", "hy", "ne", "mn", "bs", "kk", "sq", "sw",
    "gl", "mr", "pa", "si", "km", "sn", "yo", "so", "af", "oc", "ka", "be", "tg", "sd", "gu",
    "am", "yi", "lo", "uz", "fo", "ht", "ps", "tk", "nn", "mt", "sa", "lb", "my", "bo", "tl",
    "mg", "as", "tt", "haw", "ln", "ha", "ba", "jw", "su",
];

/// Result of decoding one window.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowOutput {
    pub text: String,
    /// Probability the window contains no speech at all
    pub no_speech_prob: f32,
    /// Mean log-probability of the decoded tokens
    pub avg_logprob: f32,
    /// Language the window was decoded in, when known
    pub language: Option<String>,
}

/// A speech recognition model bound to a device.
///
/// Implementations are blocking and stateful (KV caches), hence `&mut self`.
/// Callers serialise access per instance.
pub trait SpeechModel: Send {
    /// Decode one window of at most 30 s of canonical PCM.
    ///
    /// `language` forces the decoding language; `None` detects it from
    /// this window.
    fn decode_window(
        &mut self,
        pcm: &[f32],
        params: &DecodingParams,
        language: Option<&str>,
    ) -> Result<WindowOutput>;
}

/// Downloads checkpoints with hf-hub and builds `WhisperModel`s.
pub struct WhisperLoader {
    cache_dir: Option<PathBuf>,
}

impl WhisperLoader {
    pub fn new(cache_dir: Option<String>) -> Self {
        Self {
            cache_dir: cache_dir.map(PathBuf::from),
        }
    }

    /// Build the hub client, honouring `HF_TOKEN` and the cache settings.
    fn api(&self) -> Result<hf_hub::api::tokio::Api> {
        use hf_hub::api::tokio::ApiBuilder;

        let mut builder = ApiBuilder::new()
            .with_token(std::env::var("HF_TOKEN").ok())
            .with_progress(false);

        let cache_dir = self
            .cache_dir
            .clone()
            .or_else(|| std::env::var("HF_HUB_CACHE").ok().map(PathBuf::from))
            .or_else(|| {
                std::env::var("HF_HOME")
                    .ok()
                    .map(|home| PathBuf::from(home).join("hub"))
            });
        if let Some(dir) = cache_dir {
            tracing::debug!("Using Hugging Face cache dir: {:?}", dir);
            builder = builder.with_cache_dir(dir);
        }

        builder.build().context("failed to create Hugging Face API client")
    }

    async fn fetch(&self, size: ModelSize) -> Result<ModelFiles> {
        let repo = self.api()?.model(size.repo_name().to_string());
        tracing::info!("Fetching model files from {}", size.repo_name());

        let config = repo
            .get("config.json")
            .await
            .with_context(|| format!("failed to download config.json from {}", size.repo_name()))?;
        let tokenizer = repo
            .get("tokenizer.json")
            .await
            .with_context(|| format!("failed to download tokenizer.json from {}", size.repo_name()))?;
        let weights = repo.get("model.safetensors").await.with_context(|| {
            format!("failed to download model.safetensors from {}", size.repo_name())
        })?;

        Ok(ModelFiles {
            config,
            tokenizer,
            weights,
        })
    }
}

#[async_trait]
impl ModelLoader for WhisperLoader {
    async fn load(
        &self,
        model: ModelSize,
        device: ComputeDevice,
    ) -> Result<Box<dyn SpeechModel>, LoadError> {
        let candle_device = DeviceManager::open(device).map_err(LoadError::DeviceInit)?;
        let files = self
            .fetch(model)
            .await
            .map_err(|e| LoadError::Load(format!("{:#}", e)))?;

        let whisper = tokio::task::spawn_blocking(move || {
            WhisperModel::from_files(model, &files, candle_device)
        })
        .await
        .map_err(|e| LoadError::Load(format!("loader task failed: {}", e)))?
        .map_err(|e| LoadError::Load(format!("{:#}", e)))?;

        Ok(Box::new(whisper))
    }
}

/// Local paths of one checkpoint.
struct ModelFiles {
    config: PathBuf,
    tokenizer: PathBuf,
    weights: PathBuf,
}

/// Special token ids resolved from the tokenizer.
struct SpecialTokens {
    sot: u32,
    eot: u32,
    transcribe: u32,
    no_timestamps: u32,
    no_speech: Option<u32>,
    languages: Vec<(&'static str, u32)>,
}

impl SpecialTokens {
    fn resolve(tokenizer: &Tokenizer) -> Result<Self> {
        let id = |token: &str| {
            tokenizer
                .token_to_id(token)
                .ok_or_else(|| anyhow!("tokenizer has no {} token", token))
        };

        Ok(Self {
            sot: id(m::SOT_TOKEN)?,
            eot: id(m::EOT_TOKEN)?,
            transcribe: id(m::TRANSCRIBE_TOKEN)?,
            no_timestamps: id(m::NO_TIMESTAMPS_TOKEN)?,
            no_speech: m::NO_SPEECH_TOKENS
                .iter()
                .find_map(|token| tokenizer.token_to_id(token)),
            languages: LANGUAGES
                .iter()
                .filter_map(|code| {
                    tokenizer
                        .token_to_id(&format!("<|{}|>", code))
                        .map(|id| (*code, id))
                })
                .collect(),
        })
    }
}

#[derive(Clone)]
struct Beam {
    tokens: Vec<u32>,
    logprob: f32,
    steps: usize,
    done: bool,
}

/// Token sequence produced for one window.
struct Decoded {
    tokens: Vec<u32>,
    avg_logprob: f32,
    no_speech_prob: f32,
}

/// A loaded Whisper checkpoint ready for decoding.
pub struct WhisperModel {
    model: m::model::Whisper,
    config: Config,
    device: Device,
    size: ModelSize,
    tokenizer: Tokenizer,
    mel_filters: Vec<f32>,
    suppress: Tensor,
    tokens: SpecialTokens,
}

impl WhisperModel {
    fn from_files(size: ModelSize, files: &ModelFiles, device: Device) -> Result<Self> {
        let started = std::time::Instant::now();

        let config: Config = serde_json::from_reader(std::fs::File::open(&files.config)?)
            .context("failed to parse config.json")?;
        let tokenizer = Tokenizer::from_file(&files.tokenizer)
            .map_err(|e| anyhow!("failed to load tokenizer: {}", e))?;
        let tokens = SpecialTokens::resolve(&tokenizer)?;
        let mel_filters = mel_filter_bank(config.num_mel_bins);

        // SAFETY: the safetensors file is owned by the hub cache and not
        // modified while mapped.
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[&files.weights], m::DTYPE, &device)?
        };
        let model = m::model::Whisper::load(&vb, config.clone())?;

        let suppress: Vec<f32> = (0..config.vocab_size as u32)
            .map(|i| {
                if config.suppress_tokens.contains(&i) {
                    f32::NEG_INFINITY
                } else {
                    0.0
                }
            })
            .collect();
        let suppress = Tensor::new(suppress.as_slice(), &device)?;

        tracing::info!(
            "Whisper {} ready on {} in {:.2}s",
            size,
            DeviceManager::get_device_info(&device),
            started.elapsed().as_secs_f64()
        );

        Ok(Self {
            model,
            config,
            device,
            size,
            tokenizer,
            mel_filters,
            suppress,
            tokens,
        })
    }

    /// Log-mel spectrogram of one window, shaped `(1, n_mels, frames)`.
    fn mel(&self, pcm: &[f32]) -> Result<Tensor> {
        let n_mels = self.config.num_mel_bins;
        let mel = m::audio::pcm_to_mel(&self.config, pcm, &self.mel_filters);
        let frames = mel.len() / n_mels;
        let mel = Tensor::from_vec(mel, (1, n_mels, frames), &self.device)?;

        let content = (pcm.len() / m::HOP_LENGTH).clamp(1, m::N_FRAMES).min(frames);
        Ok(mel.narrow(2, 0, content)?)
    }

    fn forward(&mut self, tokens: &[u32], features: &Tensor, flush: bool) -> Result<Tensor> {
        let tokens = Tensor::new(tokens, &self.device)?.unsqueeze(0)?;
        Ok(self.model.decoder.forward(&tokens, features, flush)?)
    }

    /// Vocabulary logits at sequence position `pos`.
    fn logits_at(&self, ys: &Tensor, pos: usize) -> Result<Tensor> {
        Ok(self
            .model
            .decoder
            .final_linear(&ys.i((..1, pos..pos + 1))?)?
            .i(0)?
            .i(0)?)
    }

    fn no_speech_prob(&self, ys: &Tensor) -> Result<f32> {
        let Some(token) = self.tokens.no_speech else {
            return Ok(0.0);
        };
        let logits = self.logits_at(ys, 0)?;
        let probs = candle_nn::ops::softmax(&logits, D::Minus1)?;
        Ok(probs.i(token as usize)?.to_scalar::<f32>()?)
    }

    fn detect_language(&mut self, features: &Tensor) -> Result<Option<(&'static str, u32)>> {
        if self.tokens.languages.is_empty() {
            return Ok(None);
        }

        let ys = self.forward(&[self.tokens.sot], features, true)?;
        let logits = self.logits_at(&ys, 0)?;
        let ids: Vec<u32> = self.tokens.languages.iter().map(|(_, id)| *id).collect();
        let ids = Tensor::new(ids.as_slice(), &self.device)?;
        let probs: Vec<f32> =
            candle_nn::ops::softmax(&logits.index_select(&ids, 0)?, D::Minus1)?.to_vec1()?;

        let best = probs
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| self.tokens.languages[i]);

        if let Some((code, _)) = best {
            tracing::debug!("Detected language: {}", code);
        }
        Ok(best)
    }

    fn language_token(&self, code: &str) -> Option<u32> {
        let code = code.to_lowercase();
        self.tokens
            .languages
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, id)| *id)
    }

    /// Beam search; a single beam is greedy decoding.
    fn beam_search(
        &mut self,
        prompt: &[u32],
        features: &Tensor,
        params: &DecodingParams,
    ) -> Result<Decoded> {
        let beam_size = params.beam_size.max(1);
        let max_len = self.config.max_target_positions / 2;
        let mut beams = vec![Beam {
            tokens: prompt.to_vec(),
            logprob: 0.0,
            steps: 0,
            done: false,
        }];
        let mut no_speech_prob = 0.0;
        let mut first = true;

        for _ in 0..max_len {
            let mut candidates: Vec<Beam> = Vec::with_capacity(beam_size * beam_size);

            for beam in &beams {
                if beam.done {
                    candidates.push(beam.clone());
                    continue;
                }

                let ys = self.forward(&beam.tokens, features, first)?;
                if first {
                    no_speech_prob = self.no_speech_prob(&ys)?;
                    first = false;
                }

                let logits = self
                    .logits_at(&ys, beam.tokens.len() - 1)?
                    .broadcast_add(&self.suppress)?;
                let logprobs: Vec<f32> =
                    candle_nn::ops::log_softmax(&logits, D::Minus1)?.to_vec1()?;

                for (token, logprob) in top_k(&logprobs, beam_size) {
                    let generated = &beam.tokens[prompt.len()..];
                    let stop = token == self.tokens.eot
                        || is_repetitive(generated, token, params.max_repeat_run);
                    let mut tokens = beam.tokens.clone();
                    if !stop {
                        tokens.push(token);
                    }
                    candidates.push(Beam {
                        tokens,
                        logprob: beam.logprob + logprob,
                        steps: beam.steps + 1,
                        done: stop || beam.tokens.len() + 1 >= self.config.max_target_positions,
                    });
                }
            }

            candidates.sort_by(|a, b| b.logprob.total_cmp(&a.logprob));
            candidates.truncate(beam_size);
            beams = candidates;

            if beams.iter().all(|b| b.done) {
                break;
            }
        }

        let best = beams
            .into_iter()
            .max_by(|a, b| {
                let a = a.logprob / a.steps.max(1) as f32;
                let b = b.logprob / b.steps.max(1) as f32;
                a.total_cmp(&b)
            })
            .ok_or_else(|| anyhow!("beam search produced no hypotheses"))?;

        Ok(Decoded {
            avg_logprob: best.logprob / best.steps.max(1) as f32,
            tokens: best.tokens[prompt.len()..].to_vec(),
            no_speech_prob,
        })
    }

    /// Temperature sampling with a seeded RNG.
    fn sample(
        &mut self,
        prompt: &[u32],
        features: &Tensor,
        params: &DecodingParams,
    ) -> Result<Decoded> {
        let mut rng = StdRng::seed_from_u64(params.seed);
        let max_len = self.config.max_target_positions / 2;
        let mut tokens = prompt.to_vec();
        let mut sum_logprob = 0.0f32;
        let mut steps = 0usize;
        let mut no_speech_prob = 0.0;

        for i in 0..max_len {
            let ys = self.forward(&tokens, features, i == 0)?;
            if i == 0 {
                no_speech_prob = self.no_speech_prob(&ys)?;
            }

            let logits = self
                .logits_at(&ys, tokens.len() - 1)?
                .broadcast_add(&self.suppress)?;
            let scaled = (&logits / params.temperature as f64)?;
            let probs: Vec<f32> = candle_nn::ops::softmax(&scaled, D::Minus1)?.to_vec1()?;
            let token = WeightedIndex::new(&probs)?.sample(&mut rng) as u32;

            sum_logprob += probs[token as usize].max(f32::MIN_POSITIVE).ln();
            steps += 1;

            if token == self.tokens.eot
                || is_repetitive(&tokens[prompt.len()..], token, params.max_repeat_run)
            {
                break;
            }
            tokens.push(token);
            if tokens.len() >= self.config.max_target_positions {
                break;
            }
        }

        Ok(Decoded {
            avg_logprob: sum_logprob / steps.max(1) as f32,
            tokens: tokens[prompt.len()..].to_vec(),
            no_speech_prob,
        })
    }

    /// Decode tokens to text using the tokenizer.
    fn decode_tokens(&self, tokens: &[u32]) -> Result<String> {
        let text = self
            .tokenizer
            .decode(tokens, true)
            .map_err(|e| anyhow!("Tokenizer decode error: {}", e))?;

        let cleaned = text
            .replace(m::SOT_TOKEN, "")
            .replace(m::EOT_TOKEN, "")
            .replace(m::NO_TIMESTAMPS_TOKEN, "");
        Ok(cleaned.trim().to_string())
    }
}

impl SpeechModel for WhisperModel {
    fn decode_window(
        &mut self,
        pcm: &[f32],
        params: &DecodingParams,
        language: Option<&str>,
    ) -> Result<WindowOutput> {
        if pcm.is_empty() {
            return Ok(WindowOutput {
                text: String::new(),
                no_speech_prob: 1.0,
                avg_logprob: 0.0,
                language: language.map(str::to_string),
            });
        }

        let mel = self.mel(pcm)?;
        let features = self.model.encoder.forward(&mel, true)?;

        let (language_token, language) = match language {
            Some(code) => (self.language_token(code), Some(code.to_string())),
            None => match self.detect_language(&features)? {
                Some((code, id)) => (Some(id), Some(code.to_string())),
                None => (None, None),
            },
        };

        let mut prompt = vec![self.tokens.sot];
        prompt.extend(language_token);
        prompt.push(self.tokens.transcribe);
        prompt.push(self.tokens.no_timestamps);

        let decoded = if params.temperature > 0.0 {
            self.sample(&prompt, &features, params)?
        } else {
            self.beam_search(&prompt, &features, params)?
        };
        let text = self.decode_tokens(&decoded.tokens)?;

        tracing::debug!(
            model = %self.size,
            seconds = pcm.len() as f64 / m::SAMPLE_RATE as f64,
            no_speech_prob = decoded.no_speech_prob,
            avg_logprob = decoded.avg_logprob,
            "Decoded window"
        );

        Ok(WindowOutput {
            text,
            no_speech_prob: decoded.no_speech_prob,
            avg_logprob: decoded.avg_logprob,
            language,
        })
    }
}

/// Indices and values of the `k` largest finite entries.
fn top_k(values: &[f32], k: usize) -> Vec<(u32, f32)> {
    let mut indexed: Vec<(u32, f32)> = values
        .iter()
        .enumerate()
        .filter(|(_, v)| v.is_finite())
        .map(|(i, v)| (i as u32, *v))
        .collect();
    indexed.sort_by(|a, b| b.1.total_cmp(&a.1));
    indexed.truncate(k);
    indexed
}

/// Whether appending `next` would continue a degenerate loop: the same token
/// more than `max_run` times in a row, or the last three tokens repeating
/// the three before them.
fn is_repetitive(tokens: &[u32], next: u32, max_run: usize) -> bool {
    let max_run = max_run.max(1);
    if tokens.len() >= max_run && tokens[tokens.len() - max_run..].iter().all(|t| *t == next) {
        return true;
    }

    if tokens.len() >= 5 {
        let mut window: Vec<u32> = tokens[tokens.len() - 5..].to_vec();
        window.push(next);
        if window[..3] == window[3..] {
            return true;
        }
    }

    false
}

/// Slaney-style mel filter bank (librosa defaults), laid out as
/// `n_mels` rows of `N_FFT / 2 + 1` frequency weights.
fn mel_filter_bank(n_mels: usize) -> Vec<f32> {
    let n_freqs = m::N_FFT / 2 + 1;
    let sample_rate = m::SAMPLE_RATE as f64;

    let min_mel = hz_to_mel(0.0);
    let max_mel = hz_to_mel(sample_rate / 2.0);
    let points: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_to_hz(min_mel + (max_mel - min_mel) * i as f64 / (n_mels + 1) as f64))
        .collect();

    let mut filters = vec![0.0f32; n_mels * n_freqs];
    for mel in 0..n_mels {
        let (lower, center, upper) = (points[mel], points[mel + 1], points[mel + 2]);
        let norm = 2.0 / (upper - lower);
        for bin in 0..n_freqs {
            let freq = bin as f64 * sample_rate / m::N_FFT as f64;
            let rising = (freq - lower) / (center - lower);
            let falling = (upper - freq) / (upper - center);
            let weight = rising.min(falling).max(0.0);
            filters[mel * n_freqs + bin] = (weight * norm) as f32;
        }
    }
    filters
}

const F_SP: f64 = 200.0 / 3.0;
const MIN_LOG_HZ: f64 = 1000.0;
const MIN_LOG_MEL: f64 = MIN_LOG_HZ / F_SP;

fn log_step() -> f64 {
    6.4f64.ln() / 27.0
}

fn hz_to_mel(hz: f64) -> f64 {
    if hz >= MIN_LOG_HZ {
        MIN_LOG_MEL + (hz / MIN_LOG_HZ).ln() / log_step()
    } else {
        hz / F_SP
    }
}

fn mel_to_hz(mel: f64) -> f64 {
    if mel >= MIN_LOG_MEL {
        MIN_LOG_HZ * (log_step() * (mel - MIN_LOG_MEL)).exp()
    } else {
        F_SP * mel
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mel_scale_round_trip() {
        for hz in [0.0, 440.0, 1000.0, 4000.0, 8000.0] {
            assert!((mel_to_hz(hz_to_mel(hz)) - hz).abs() < 1e-6);
        }
        assert!((hz_to_mel(1000.0) - 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_mel_filter_bank_shape() {
        let filters = mel_filter_bank(80);
        assert_eq!(filters.len(), 80 * 201);
        // every filter covers at least one bin
        for row in filters.chunks(201) {
            assert!(row.iter().any(|w| *w > 0.0));
            assert!(row.iter().all(|w| *w >= 0.0));
        }
    }

    #[test]
    fn test_repetition_guard() {
        assert!(is_repetitive(&[1, 7, 7, 7], 7, 3));
        assert!(!is_repetitive(&[1, 2, 7, 7], 7, 3));
        assert!(is_repetitive(&[1, 2, 3, 1, 2], 3, 3));
        assert!(!is_repetitive(&[1, 2, 3, 4, 5], 6, 3));
    }

    #[test]
    fn test_top_k_skips_suppressed() {
        let values = [0.1, f32::NEG_INFINITY, 0.5, 0.3];
        assert_eq!(top_k(&values, 2), vec![(2, 0.5), (3, 0.3)]);
        assert_eq!(top_k(&values, 10).len(), 3);
    }
}
