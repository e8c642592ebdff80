use crate::audio::validator::SUPPORTED_EXTENSIONS;
use crate::device::DeviceManager;
use crate::state::{AppMetrics, AppState};
use crate::transcription::profile::{model_options, quality_options};
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::process;

/// Liveness plus everything the desktop shell needs to render its options.
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = &state.config;
    let resident = state.service.resident_models().await;
    let in_flight = state.service.in_flight();

    let device = if config.device.accelerated_available && state.service.accelerated_usable() {
        "gpu"
    } else {
        "cpu"
    };

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": "transcription-backend",
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "models": {
            "resident": resident,
            "default_model_size": config.models.default_model_size,
            "device": device,
            "devices": DeviceManager::get_device_summary()
        },
        "quality_options": quality_options()
            .into_iter()
            .map(|(value, description)| json!({ "value": value, "description": description }))
            .collect::<Vec<_>>(),
        "model_sizes": model_options()
            .into_iter()
            .map(|(value, _)| value)
            .collect::<Vec<_>>(),
        "supported_formats": SUPPORTED_EXTENSIONS,
        "memory": get_memory_info(),
        "system": get_system_status(in_flight, config.performance.max_in_flight_requests, &metrics)
    }))
}

/// HTTP and transcription counters (`GET /api/v1/metrics`).
pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let mut endpoint_stats = Vec::new();
    for (endpoint, metric) in metrics.endpoint_metrics.iter() {
        endpoint_stats.push(json!({
            "endpoint": endpoint,
            "request_count": metric.request_count,
            "error_count": metric.error_count,
            "error_rate": metric.error_rate(),
            "average_duration_ms": metric.average_duration_ms(),
            "total_duration_ms": metric.total_duration_ms
        }));
    }
    endpoint_stats.sort_by(|a, b| a["endpoint"].as_str().cmp(&b["endpoint"].as_str()));

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            },
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "transcriptions": {
            "active": metrics.active_transcriptions,
            "completed": metrics.completed_transcriptions,
            "failures_by_kind": metrics.failures_by_kind
        },
        "endpoints": endpoint_stats,
        "memory": get_memory_info(),
        "performance": {
            "max_in_flight_requests": state.config.performance.max_in_flight_requests,
            "max_resident_models": state.config.performance.max_resident_models,
            "request_timeout_secs": state.config.performance.request_timeout_secs
        }
    }))
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", process::id())) {
            let mut vm_rss = 0;
            let mut vm_size = 0;

            for line in status.lines() {
                let kb = || {
                    line.split_whitespace()
                        .nth(1)
                        .and_then(|v| v.parse::<u64>().ok())
                        .unwrap_or(0)
                        * 1024
                };
                if line.starts_with("VmRSS:") {
                    vm_rss = kb();
                } else if line.starts_with("VmSize:") {
                    vm_size = kb();
                }
            }

            return json!({
                "resident_memory_bytes": vm_rss,
                "virtual_memory_bytes": vm_size,
                "available": true
            });
        }
    }

    json!({
        "pid": process::id(),
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false
    })
}

fn get_system_status(in_flight: usize, max_in_flight: usize, metrics: &AppMetrics) -> serde_json::Value {
    let usage = if max_in_flight > 0 {
        in_flight as f64 / max_in_flight as f64
    } else {
        0.0
    };

    let status = if usage >= 1.0 {
        "saturated"
    } else if usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "in_flight_requests": in_flight,
        "max_in_flight_requests": max_in_flight,
        "waiting_callers": metrics.active_transcriptions,
        "load_warnings": if usage >= 1.0 {
            vec!["All transcription slots busy - new requests are queued"]
        } else {
            vec![]
        }
    })
}
