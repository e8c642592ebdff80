//! # Configuration Management
//!
//! This module handles loading application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! Configuration is read once at process start. Nothing in the transcription
//! core observes a configuration change mid-request; the service is built from
//! an immutable snapshot.
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` environment variables (deployment platforms)
//! 2. Environment variables (`APP_SERVER__PORT`, `APP_PERFORMANCE__MAX_RESIDENT_MODELS`, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use crate::transcription::profile::ModelSize;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub models: ModelsConfig,
    pub device: DeviceConfig,
    pub performance: PerformanceConfig,
    pub limits: LimitsConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (the desktop shell)
/// - `host = "0.0.0.0"`: Accept connections from any IP address
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Whisper model configuration.
///
/// ## Fields:
/// - `default_model_size`: Size used when a request names no model size.
///   When unset, each quality tier picks its own size.
/// - `cache_dir`: Where Hugging Face downloads are cached (falls back to
///   `HF_HUB_CACHE` / `HF_HOME` / the hf-hub default)
/// - `language`: Language hint passed to the decoder; `None` means detect
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(default)]
    pub default_model_size: Option<ModelSize>,
    #[serde(default)]
    pub cache_dir: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
}

/// Compute device configuration.
///
/// `accelerated_available` tells the resolver whether to prefer the GPU.
/// Even when it is set, a failing GPU initialisation degrades to the CPU.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub accelerated_available: bool,
}

/// Performance tuning configuration.
///
/// ## Fields:
/// - `max_resident_models`: Ceiling on models kept in memory. `None` keeps
///   every model loaded for the lifetime of the process.
/// - `max_in_flight_requests`: Upper bound on requests being processed,
///   including timed-out requests still finishing in the background
/// - `request_timeout_secs`: Default per-request deadline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    #[serde(default)]
    pub max_resident_models: Option<usize>,
    pub max_in_flight_requests: usize,
    pub request_timeout_secs: u64,
}

/// Upload limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub max_file_size_mb: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8000,
            },
            models: ModelsConfig::default(),
            device: DeviceConfig {
                accelerated_available: cfg!(any(feature = "cuda", feature = "metal")),
            },
            performance: PerformanceConfig {
                max_resident_models: None,
                max_in_flight_requests: 4,
                request_timeout_secs: 600,
            },
            limits: LimitsConfig {
                max_file_size_mb: 100,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__HOST=0.0.0.0`: Override server host
    /// - `APP_MODELS__DEFAULT_MODEL_SIZE=small`: Default Whisper size
    /// - `APP_DEVICE__ACCELERATED_AVAILABLE=false`: Never try the GPU
    /// - `APP_PERFORMANCE__MAX_RESIDENT_MODELS=2`: Enable LRU eviction
    /// - `HOST=0.0.0.0` / `PORT=3000`: Deployment platform overrides
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.performance.max_in_flight_requests == 0 {
            return Err(anyhow::anyhow!("Max in-flight requests must be greater than 0"));
        }

        if self.performance.request_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Request timeout must be greater than 0"));
        }

        if self.performance.max_resident_models == Some(0) {
            return Err(anyhow::anyhow!(
                "Max resident models must be greater than 0 (leave it unset for no limit)"
            ));
        }

        if self.limits.max_file_size_mb == 0 {
            return Err(anyhow::anyhow!("Max file size must be greater than 0"));
        }

        Ok(())
    }

    /// Default per-request deadline.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.performance.request_timeout_secs)
    }

    /// Upload size limit in bytes.
    pub fn max_file_size_bytes(&self) -> usize {
        (self.limits.max_file_size_mb as usize).saturating_mul(1024 * 1024)
    }

    /// Render the effective configuration as TOML (logged at startup).
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8000);
        assert!(config.models.default_model_size.is_none());
        assert!(config.performance.max_resident_models.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.performance.max_in_flight_requests = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.performance.max_resident_models = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip_keeps_model_size() {
        let mut config = AppConfig::default();
        config.models.default_model_size = Some(ModelSize::LargeV3);
        config.performance.max_resident_models = Some(2);

        let rendered = config.to_toml().unwrap();
        assert!(rendered.contains("large-v3"));

        let parsed: AppConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.models.default_model_size, Some(ModelSize::LargeV3));
        assert_eq!(parsed.performance.max_resident_models, Some(2));
    }

    #[test]
    fn test_size_and_timeout_helpers() {
        let config = AppConfig::default();
        assert_eq!(config.max_file_size_bytes(), 100 * 1024 * 1024);
        assert_eq!(config.request_timeout(), Duration::from_secs(600));
    }
}
