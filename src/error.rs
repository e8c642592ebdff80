//! # Error Handling
//!
//! Two layers of errors live here:
//!
//! - **TranscriptionError**: the request-scoped failure taxonomy of the
//!   transcription core. Every component fails fast with one specific kind,
//!   and the orchestrator passes the kind through untouched.
//! - **AppError**: HTTP-facing errors. Wraps `TranscriptionError` and adds the
//!   transport-level cases (malformed multipart bodies, unknown routes).
//!
//! ## JSON Response Format:
//! All errors leave the server with the same envelope:
//! ```json
//! {
//!   "error": {
//!     "type": "unsupported_codec",
//!     "message": "Unsupported codec: '.txt' is not an accepted audio or video container",
//!     "timestamp": "2025-01-01T12:00:00Z"
//!   }
//! }
//! ```

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Failure kinds of a single transcription request.
///
/// All of them are recoverable by the caller resubmitting; none of them
/// take the process down.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TranscriptionError {
    /// The upload contained zero bytes.
    #[error("Empty payload: the uploaded file contains no data")]
    EmptyPayload,

    /// The payload claims a supported container but is malformed, or breaks
    /// a size limit.
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// The container/codec is not on the allow-list.
    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),

    /// The quality tier is not one of the known tiers.
    #[error("Invalid quality '{0}': expected one of fast, balanced, high, best")]
    InvalidQuality(String),

    /// The model size is not one of the known sizes.
    #[error("Invalid model size '{0}': expected one of tiny, base, small, medium, large-v3")]
    InvalidModelSize(String),

    /// The file passed validation but could not be decoded into samples.
    #[error("Decode failure: {0}")]
    DecodeFailure(String),

    /// No device could load the requested model.
    #[error("Model load failure: {0}")]
    ModelLoadFailure(String),

    /// The forward pass failed (out of memory, internal model error).
    #[error("Inference failure: {0}")]
    InferenceFailure(String),

    /// The request did not finish within its deadline.
    #[error("Timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),
}

impl TranscriptionError {
    /// Machine-readable kind, used as the `type` field of error responses.
    pub fn kind(&self) -> &'static str {
        match self {
            TranscriptionError::EmptyPayload => "empty_payload",
            TranscriptionError::InvalidFormat(_) => "invalid_format",
            TranscriptionError::UnsupportedCodec(_) => "unsupported_codec",
            TranscriptionError::InvalidQuality(_) => "invalid_quality",
            TranscriptionError::InvalidModelSize(_) => "invalid_model_size",
            TranscriptionError::DecodeFailure(_) => "decode_failure",
            TranscriptionError::ModelLoadFailure(_) => "model_load_failure",
            TranscriptionError::InferenceFailure(_) => "inference_failure",
            TranscriptionError::Timeout(_) => "timeout",
        }
    }

    /// HTTP status used when this failure reaches a client.
    pub fn status_code(&self) -> StatusCode {
        match self {
            TranscriptionError::EmptyPayload
            | TranscriptionError::InvalidFormat(_)
            | TranscriptionError::InvalidQuality(_)
            | TranscriptionError::InvalidModelSize(_) => StatusCode::BAD_REQUEST,
            TranscriptionError::UnsupportedCodec(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            TranscriptionError::DecodeFailure(_) => StatusCode::UNPROCESSABLE_ENTITY,
            TranscriptionError::ModelLoadFailure(_) => StatusCode::SERVICE_UNAVAILABLE,
            TranscriptionError::InferenceFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            TranscriptionError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

/// Custom error types for the HTTP layer.
///
/// ## Error Categories:
/// - **BadRequest**: Client sent a malformed request body (400 errors)
/// - **NotFound**: Requested resource doesn't exist (404 errors)
/// - **ValidationError**: Request fields failed validation (400 errors)
/// - **Transcription**: A failure from the transcription core, status per kind
#[derive(Debug)]
pub enum AppError {
    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Requested resource was not found
    NotFound(String),

    /// User input failed validation rules
    ValidationError(String),

    /// The transcription pipeline rejected or failed the request
    Transcription(TranscriptionError),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::Transcription(err) => write!(f, "{}", err),
        }
    }
}

/// Converts errors into JSON HTTP responses.
///
/// ## HTTP Status Code Mapping:
/// - BadRequest/ValidationError → 400
/// - NotFound → 404
/// - Transcription → per failure kind (see `TranscriptionError::status_code`)
impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) | AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Transcription(err) => err.status_code(),
        }
    }

    fn error_response(&self) -> HttpResponse {
        let (error_type, message) = match self {
            AppError::BadRequest(msg) => ("bad_request", msg.clone()),
            AppError::NotFound(msg) => ("not_found", msg.clone()),
            AppError::ValidationError(msg) => ("validation_error", msg.clone()),
            AppError::Transcription(err) => (err.kind(), err.to_string()),
        };

        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// Transcription failures keep their kind all the way to the client.
impl From<TranscriptionError> for AppError {
    fn from(err: TranscriptionError) -> Self {
        AppError::Transcription(err)
    }
}

/// Shorthand for `Result<T, AppError>`.
pub type AppResult<T> = Result<T, AppError>;

/// Shorthand for results of the transcription core.
pub type CoreResult<T> = Result<T, TranscriptionError>;
