//! # Application State Management
//!
//! Shared state handed to every HTTP handler through `web::Data`.
//!
//! ## Ownership Pattern:
//! - **Arc<AppConfig>**: configuration is a startup snapshot, read-only
//! - **Arc<TranscriptionService>**: one service (and one model manager) per
//!   process; handlers only borrow it
//! - **Arc<RwLock<AppMetrics>>**: HTTP metrics updated by middleware on every
//!   request. Many readers OR one writer.
//!
//! Locks here are `std::sync::RwLock` because no guard is ever held across
//! an `.await`.

use crate::config::AppConfig;
use crate::service::TranscriptionService;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

/// The main application state shared across all HTTP request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Configuration loaded at startup
    pub config: Arc<AppConfig>,

    /// The transcription core
    pub service: Arc<TranscriptionService>,

    /// HTTP metrics, updated by `MetricsMiddleware`
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started
    pub start_time: Instant,
}

/// Metrics collected across all HTTP requests.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of 4xx/5xx responses since server start
    pub error_count: u64,

    /// Transcription requests currently waiting on the service
    pub active_transcriptions: u32,

    /// Transcriptions that returned a transcript
    pub completed_transcriptions: u64,

    /// Failed transcriptions, keyed by failure kind
    pub failures_by_kind: HashMap<String, u64>,

    /// Per-endpoint statistics, keyed by "METHOD /path"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Detailed performance metrics for a specific API endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig, service: TranscriptionService) -> Self {
        Self {
            config: Arc::new(config),
            service: Arc::new(service),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    // A panic while holding the metrics lock leaves plain counters behind,
    // so a poisoned lock is still safe to use.
    fn read_metrics(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_metrics(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Increment the total request counter (called by middleware for every request).
    pub fn increment_request_count(&self) {
        self.write_metrics().request_count += 1;
    }

    /// Increment the total error counter (called when any request fails).
    pub fn increment_error_count(&self) {
        self.write_metrics().error_count += 1;
    }

    /// Record detailed metrics for a specific endpoint.
    ///
    /// ## Parameters:
    /// - **endpoint**: The API endpoint (e.g., "GET /health", "POST /api/v1/transcribe")
    /// - **duration_ms**: How long the request took to process (in milliseconds)
    /// - **is_error**: Whether this request resulted in an error
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.write_metrics();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn transcription_started(&self) {
        self.write_metrics().active_transcriptions += 1;
    }

    /// Record the outcome of a transcription. `failure` is the error kind, if any.
    pub fn transcription_finished(&self, failure: Option<&str>) {
        let mut metrics = self.write_metrics();
        metrics.active_transcriptions = metrics.active_transcriptions.saturating_sub(1);
        match failure {
            None => metrics.completed_transcriptions += 1,
            Some(kind) => *metrics.failures_by_kind.entry(kind.to_string()).or_default() += 1,
        }
    }

    /// Get a snapshot of current metrics (used for the /metrics endpoint).
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.read_metrics().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    /// Average response time for this endpoint.
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Error rate for this endpoint, 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::transcription::manager::testing::CountingLoader;

    /// State backed by a `CountingLoader`, for handler tests.
    pub fn test_state(loader: Arc<CountingLoader>) -> AppState {
        let config = AppConfig::default();
        let service = TranscriptionService::new(&config, loader).unwrap();
        AppState::new(config, service)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::test_state;
    use super::*;
    use crate::transcription::manager::testing::CountingLoader;

    #[test]
    fn test_endpoint_metrics() {
        let state = test_state(Arc::new(CountingLoader::default()));
        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);

        let snapshot = state.get_metrics_snapshot();
        let metric = &snapshot.endpoint_metrics["GET /health"];
        assert_eq!(metric.request_count, 2);
        assert_eq!(metric.average_duration_ms(), 20.0);
        assert_eq!(metric.error_rate(), 0.5);
    }

    #[test]
    fn test_transcription_counters() {
        let state = test_state(Arc::new(CountingLoader::default()));
        state.transcription_started();
        state.transcription_started();
        assert_eq!(state.get_metrics_snapshot().active_transcriptions, 2);

        state.transcription_finished(None);
        state.transcription_finished(Some("timeout"));
        state.transcription_finished(Some("timeout"));

        let snapshot = state.get_metrics_snapshot();
        assert_eq!(snapshot.active_transcriptions, 0);
        assert_eq!(snapshot.completed_transcriptions, 1);
        assert_eq!(snapshot.failures_by_kind["timeout"], 2);
    }
}
