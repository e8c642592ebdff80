//! # Audio Input Module
//!
//! Everything between an uploaded file and the samples the model consumes.
//!
//! ## Key Components:
//! - **Validator**: Byte-signature sniffing and header sanity checks
//! - **Decoder**: Container demuxing and codec decoding (symphonia)
//! - **Processor**: Down-mix, resampling and DC removal to canonical PCM
//!
//! ## Canonical Format:
//! - **Sample Rate**: 16kHz (16,000 Hz)
//! - **Channels**: Mono (1 channel)
//! - **Encoding**: 32-bit float in `[-1.0, 1.0]`

pub mod decoder; // In-memory symphonia decoding
pub mod processor; // Canonical PCM conversion
pub mod validator; // Upload validation

pub use decoder::DecodedAudio;
pub use processor::{AudioProcessor, TARGET_SAMPLE_RATE};
pub use validator::{AudioFormat, FileValidator, ValidatedAudio};

use crate::error::CoreResult;

/// Decode a validated upload and convert it to canonical PCM.
pub fn load_canonical_pcm(audio: &ValidatedAudio) -> CoreResult<Vec<f32>> {
    let decoded = decoder::decode(audio)?;
    AudioProcessor::to_canonical(decoded)
}
