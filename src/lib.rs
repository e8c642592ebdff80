//! # Transcription Backend
//!
//! Local speech-to-text service for a desktop application: an audio upload
//! goes in, a cleaned transcript comes out.
//!
//! ## Module Layout:
//! - **audio**: upload validation, in-memory decoding, 16 kHz mono conversion
//! - **transcription**: quality profiles, model manager, Whisper model, engine
//! - **text**: transcript cleanup
//! - **service**: request orchestration, deadlines and concurrency limits
//! - **config / error / state**: ambient application plumbing
//! - **handlers / health / middleware**: the actix-web transport

pub mod audio;
pub mod config;
pub mod device;
pub mod error;
pub mod handlers;
pub mod health;
pub mod middleware;
pub mod service;
pub mod state;
pub mod text;
pub mod transcription;

pub use service::{TranscriptionRequest, TranscriptionResult, TranscriptionService};
