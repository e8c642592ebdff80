use crate::{error::AppResult, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Read-only view of the configuration the process started with.
///
/// There is no update endpoint: model and device settings feed the model
/// manager at startup and cannot change under running requests.
pub async fn get_config(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let config = &state.config;

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": {
            "server": {
                "host": config.server.host,
                "port": config.server.port
            },
            "models": {
                "default_model_size": config.models.default_model_size,
                "cache_dir": config.models.cache_dir,
                "language": config.models.language
            },
            "device": {
                "accelerated_available": config.device.accelerated_available
            },
            "performance": {
                "max_resident_models": config.performance.max_resident_models,
                "max_in_flight_requests": config.performance.max_in_flight_requests,
                "request_timeout_secs": config.performance.request_timeout_secs
            },
            "limits": {
                "max_file_size_mb": config.limits.max_file_size_mb
            }
        }
    })))
}
