//! # Model Diagnostics REST API Handlers
//!
//! Read-only views of the transcription core for the desktop shell.
//!
//! ## Available Endpoints:
//! - `GET /api/v1/diagnostics/models` - Resident models and recent device fallbacks
//! - `GET /api/v1/diagnostics/engine` - Engine throughput and failure counters
//! - `GET /api/v1/options` - Quality tiers and model sizes with descriptions

use crate::device::DeviceManager;
use crate::error::AppResult;
use crate::state::AppState;
use crate::transcription::profile::{model_options, quality_options, ModelSize};
use actix_web::{web, HttpResponse};
use serde::Serialize;
use serde_json::json;

/// One entry of an option listing.
#[derive(Debug, Serialize)]
pub struct OptionInfo {
    pub value: &'static str,
    pub description: &'static str,
}

/// Model size with its download footprint.
#[derive(Debug, Serialize)]
pub struct ModelInfoResponse {
    pub size: &'static str,
    pub repo: &'static str,
    pub description: &'static str,
    pub size_mb: u32,
    pub resident: bool,
}

/// List resident models and the most recent device fallbacks.
///
/// ## Response:
/// ```json
/// {
///   "resident": [
///     { "model": "base", "device": "cpu", "active_leases": 0, "requests_served": 12, ... }
///   ],
///   "fallbacks": [
///     { "model": "small", "from": "gpu", "to": "cpu", "cause": "...", "at": "..." }
///   ],
///   "accelerated_usable": false,
///   "in_flight": 1
/// }
/// ```
pub async fn model_diagnostics(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let resident = state.service.resident_models().await;
    let fallbacks = state.service.fallback_events().await;

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "resident": resident,
        "fallbacks": fallbacks,
        "max_resident_models": state.config.performance.max_resident_models,
        "accelerated_usable": state.service.accelerated_usable(),
        "in_flight": state.service.in_flight(),
        "devices": DeviceManager::get_device_summary(),
    })))
}

pub async fn engine_diagnostics(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let stats = state.service.engine_stats().await;

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "engine": stats,
    })))
}

/// Quality tiers and model sizes a client may choose from.
pub async fn list_options(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let resident: Vec<ModelSize> = state
        .service
        .resident_models()
        .await
        .into_iter()
        .map(|m| m.model)
        .collect();

    let models: Vec<ModelInfoResponse> = ModelSize::ALL
        .iter()
        .map(|size| ModelInfoResponse {
            size: size.as_str(),
            repo: size.repo_name(),
            description: size.description(),
            size_mb: size.size_mb(),
            resident: resident.contains(size),
        })
        .collect();

    Ok(HttpResponse::Ok().json(json!({
        "qualities": to_options(quality_options()),
        "model_sizes": to_options(model_options()),
        "models": models,
        "default_quality": "balanced",
        "default_model_size": state.config.models.default_model_size,
    })))
}

fn to_options(pairs: Vec<(&'static str, &'static str)>) -> Vec<OptionInfo> {
    pairs
        .into_iter()
        .map(|(value, description)| OptionInfo { value, description })
        .collect()
}
