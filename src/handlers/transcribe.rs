//! # Transcription HTTP Handler
//!
//! `POST /api/v1/transcribe` (also mounted at `/transcribe`)
//!
//! ## Multipart Fields:
//! - `file` (or `audio`): the recording, any supported container
//! - `quality`: fast | balanced | high | best, defaults to `balanced`
//! - `model_size`: optional explicit Whisper size, overrides the tier's default
//!
//! ## Response:
//! ```json
//! { "transcript": "Hello there.", "modelUsed": "base", "device": "cpu" }
//! ```
//!
//! Failures use the standard error envelope with the failure kind as `type`.

use crate::error::{AppError, AppResult};
use crate::service::TranscriptionRequest;
use crate::state::AppState;
use actix_multipart::{Field, Multipart};
use actix_web::{web, HttpResponse};
use bytes::BytesMut;
use futures_util::stream::StreamExt;

const DEFAULT_QUALITY: &str = "balanced";

/// Fields collected from the upload form.
#[derive(Debug, Default)]
struct UploadForm {
    file: Option<(String, BytesMut)>,
    quality: Option<String>,
    model_size: Option<String>,
}

pub async fn transcribe_upload(
    state: web::Data<AppState>,
    mut payload: Multipart,
) -> AppResult<HttpResponse> {
    let max_bytes = state.config.max_file_size_bytes();
    let mut form = UploadForm::default();

    while let Some(item) = payload.next().await {
        let mut field: Field =
            item.map_err(|e| AppError::BadRequest(format!("Multipart error: {}", e)))?;

        let content_disposition = field
            .content_disposition()
            .ok_or_else(|| AppError::BadRequest("Missing content disposition".to_string()))?;
        let field_name = content_disposition
            .get_name()
            .ok_or_else(|| AppError::BadRequest("Missing field name".to_string()))?
            .to_string();

        match field_name.as_str() {
            "file" | "audio" => {
                let file_name = content_disposition
                    .get_filename()
                    .unwrap_or("upload")
                    .to_string();
                let bytes = read_field(&mut field, max_bytes).await?;
                form.file = Some((file_name, bytes));
            }
            "quality" => form.quality = Some(read_text(&mut field).await?),
            "model_size" => form.model_size = Some(read_text(&mut field).await?),
            other => {
                tracing::debug!(field = %other, "Ignoring unknown multipart field");
                while let Some(chunk) = field.next().await {
                    chunk.map_err(|e| AppError::BadRequest(format!("Chunk error: {}", e)))?;
                }
            }
        }
    }

    let (file_name, bytes) = form
        .file
        .ok_or_else(|| AppError::ValidationError("No audio file provided".to_string()))?;

    let mut request = TranscriptionRequest::new(
        bytes.freeze(),
        &file_name,
        form.quality.as_deref().unwrap_or(DEFAULT_QUALITY),
    );
    if let Some(model_size) = form.model_size.as_deref() {
        request = request.with_model_size(model_size);
    }

    state.transcription_started();
    let result = state.service.transcribe(request).await;
    state.transcription_finished(result.as_ref().err().map(|e| e.kind()));

    Ok(HttpResponse::Ok().json(result?))
}

/// Read a file field, stopping one byte past the limit so the validator can
/// reject it without buffering the rest of an oversized upload.
async fn read_field(field: &mut Field, max_bytes: usize) -> Result<BytesMut, AppError> {
    let mut bytes = BytesMut::new();
    while let Some(chunk) = field.next().await {
        let chunk = chunk.map_err(|e| AppError::BadRequest(format!("Chunk error: {}", e)))?;
        if bytes.len() + chunk.len() > max_bytes {
            let room = max_bytes + 1 - bytes.len();
            bytes.extend_from_slice(&chunk[..room.min(chunk.len())]);
            break;
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}

async fn read_text(field: &mut Field) -> Result<String, AppError> {
    let mut bytes = Vec::new();
    while let Some(chunk) = field.next().await {
        let chunk = chunk.map_err(|e| AppError::BadRequest(format!("Chunk error: {}", e)))?;
        bytes.extend_from_slice(&chunk);
    }
    String::from_utf8(bytes)
        .map(|s| s.trim().to_string())
        .map_err(|_| AppError::BadRequest("Form field is not valid UTF-8".to_string()))
}
