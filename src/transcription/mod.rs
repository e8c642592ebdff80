//! # Transcription Module
//!
//! Speech-to-text with Whisper models via the Candle-rs framework.
//!
//! ## Key Components:
//! - **Profiles**: quality tier and model size strings resolved to closed enums
//!   plus decoding parameters
//! - **Model Manager**: loading, sharing and evicting Whisper instances
//! - **Model**: the candle Whisper decoder behind the `SpeechModel` trait
//! - **Engine**: 30 second windowing, language handling and silence filtering
//!
//! ## Whisper Model Sizes:
//! - **tiny**: ~39MB, fastest but least accurate
//! - **base**: ~74MB, good balance
//! - **small**: ~244MB, better accuracy
//! - **medium**: ~769MB, good technical vocabulary
//! - **large-v3**: ~1550MB, best accuracy but slowest

pub mod engine;
pub mod manager;
pub mod model;
pub mod profile;

pub use engine::{TranscriptSegment, TranscriptionEngine};
pub use manager::{ModelHandle, ModelLoader, ModelManager};
pub use model::{SpeechModel, WhisperLoader};
pub use profile::{ModelSize, Quality, QualityProfile, QualityProfileResolver};
