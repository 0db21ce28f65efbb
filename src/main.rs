//! # Transcription Backend - Main Application Entry Point
//!
//! HTTP service turning remote audio URLs into diarized transcripts.
//!
//! ## Application Architecture:
//! - **config**: configuration (TOML file + environment variables)
//! - **device**: compute device and precision selection
//! - **pipeline**: fetch, recognition, alignment, diarization, assignment
//! - **state**: shared application state and metrics
//! - **health**: health and metrics endpoints
//! - **middleware**: request logging and metrics collection
//! - **handlers**: the transcription endpoint
//! - **error**: error types and HTTP error responses
//!
//! Models are loaded once here, before the server binds; requests share
//! them through [`state::AppState`]. A process that cannot load its models
//! exits instead of serving requests that can only fail.

mod config;
mod device;
mod error;
mod handlers;
mod health;
mod middleware;
mod pipeline;
mod state;

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::{Context, Result};
use config::AppConfig;
use device::{ComputeContext, DevicePreference};
use pipeline::{
    EnergyAligner, HttpAudioFetcher, ModelSize, PipelineOrchestrator, RemoteDiarizer,
    WhisperEngine, WhisperModel,
};
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Global shutdown flag set by the signal handler task.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting transcribe-backend v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Configuration loaded: {}:{}",
        config.server.host, config.server.port
    );

    // Resolve the compute device once; everything downstream receives this
    // context explicitly.
    let preference: DevicePreference = config
        .models
        .device
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;
    let compute = ComputeContext::detect(preference);
    info!(
        device = compute.device_name(),
        compute_type = compute.compute_type.as_str(),
        "Compute context resolved"
    );

    // Load models before binding the listener. Startup cost, not
    // per-request cost.
    let pipeline = build_pipeline(&config, &compute)
        .await
        .context("building transcription pipeline")?;

    let app_state = AppState::new(config.clone(), compute, pipeline);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(Logger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .route("/transcribe", web::post().to(handlers::transcribe))
            .route("/health", web::get().to(health::health_check))
            .route("/metrics", web::get().to(health::detailed_metrics))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Construct the pipeline: load the recognition model, build the aligner
/// and the fetch client, and attach the diarizer when a credential exists.
async fn build_pipeline(
    config: &AppConfig,
    compute: &ComputeContext,
) -> Result<PipelineOrchestrator> {
    let size: ModelSize = config
        .models
        .whisper_model
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;

    let model = WhisperModel::load(size, compute).await?;
    let engine = WhisperEngine::new(model, config.models.batch_size);
    let aligner = EnergyAligner::new(config.models.char_alignments);
    let fetcher = HttpAudioFetcher::new(&config.fetch)?;

    // A process without a credential still serves transcription; only
    // diarization-enabled requests are rejected, at request time.
    let diarizer: Option<Arc<dyn pipeline::Diarize>> = if config.diarization_available() {
        Some(Arc::new(RemoteDiarizer::new(&config.diarization)?))
    } else {
        warn!("No diarization credential configured, diarization requests will be rejected");
        None
    };

    Ok(PipelineOrchestrator::new(
        Arc::new(fetcher),
        Arc::new(engine),
        Arc::new(aligner),
        diarizer,
        config.models.alignment_failure,
    ))
}

fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "transcribe_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Listen for SIGTERM/SIGINT and flip the shutdown flag.
fn setup_signal_handlers() {
    tokio::spawn(async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("Failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
