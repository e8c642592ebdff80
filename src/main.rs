//! # Transcription Backend - Main Application Entry Point
//!
//! Sets up the Actix-web HTTP server in front of the transcription service.
//!
//! ## Startup Sequence:
//! 1. Load `.env`, install the tracing subscriber
//! 2. Load and validate configuration (defaults, config.toml, environment)
//! 3. Build the Whisper loader and the transcription service
//! 4. Serve until SIGINT/SIGTERM, then drain in-flight HTTP requests

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use std::sync::Arc;
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transcription_backend::config::AppConfig;
use transcription_backend::device::DeviceManager;
use transcription_backend::state::AppState;
use transcription_backend::transcription::WhisperLoader;
use transcription_backend::{handlers, health, middleware, TranscriptionService};

#[actix_web::main]
async fn main() -> Result<()> {
    // It's fine if there's no .env file
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting transcription-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    tracing::debug!("Effective configuration:\n{}", config.to_toml()?);

    let devices = DeviceManager::get_device_summary();
    info!(
        cuda = devices.cuda_compiled,
        metal = devices.metal_compiled,
        accelerated_available = config.device.accelerated_available,
        "Compute backends"
    );

    let loader = Arc::new(WhisperLoader::new(config.models.cache_dir.clone()));
    let service = TranscriptionService::new(&config, loader)?;
    let app_state = AppState::new(config.clone(), service);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            // Middleware executes in reverse order for responses
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .service(
                web::scope("/api/v1")
                    .route("/transcribe", web::post().to(handlers::transcribe_upload))
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/options", web::get().to(handlers::list_options))
                    .route("/diagnostics/models", web::get().to(handlers::model_diagnostics))
                    .route("/diagnostics/engine", web::get().to(handlers::engine_diagnostics)),
            )
            .route("/transcribe", web::post().to(handlers::transcribe_upload))
            .route("/health", web::get().to(health::health_check))
            .default_service(web::to(handlers::route_not_found))
    })
    .bind(&bind_addr)?
    .disable_signals()
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        signal = wait_for_shutdown() => {
            match signal {
                Ok(name) => info!("Received {}, stopping server...", name),
                Err(e) => error!("Failed to listen for shutdown signals: {}", e),
            }
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Install the tracing subscriber.
///
/// `RUST_LOG` controls what gets logged; the default is
/// `transcription_backend=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "transcription_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Resolve on SIGTERM or SIGINT, returning the signal name.
#[cfg(unix)]
async fn wait_for_shutdown() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => Ok("SIGTERM"),
        _ = sigint.recv() => Ok("SIGINT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("Ctrl+C")
}
