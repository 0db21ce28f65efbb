//! # Application State Management
//!
//! Shared state accessed by every HTTP request handler. Configuration and
//! metrics sit behind `Arc<RwLock<T>>` so concurrent requests can read
//! without blocking each other; the pipeline orchestrator and compute
//! context are immutable after startup and shared through plain `Arc`.

use crate::config::AppConfig;
use crate::device::ComputeContext;
use crate::pipeline::PipelineOrchestrator;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// The main application state shared across all HTTP request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (readable at runtime).
    pub config: Arc<RwLock<AppConfig>>,

    /// Performance metrics, updated by the metrics middleware.
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// Compute device and precision resolved once at startup.
    pub compute: Arc<ComputeContext>,

    /// The transcription pipeline, with models loaded at startup.
    pub pipeline: Arc<PipelineOrchestrator>,

    /// When the server started.
    pub start_time: Instant,
}

/// Performance metrics collected across all HTTP requests.
#[derive(Debug, Default)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start.
    pub request_count: u64,

    /// Total number of errors encountered since server start.
    pub error_count: u64,

    /// Transcription requests currently in flight.
    pub active_transcriptions: u32,

    /// Per-endpoint statistics, keyed by "METHOD /path".
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
    pub fn new(
        config: AppConfig,
        compute: ComputeContext,
        pipeline: PipelineOrchestrator,
    ) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            compute: Arc::new(compute),
            pipeline: Arc::new(pipeline),
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration. Cloning releases the lock
    /// immediately so other threads are not blocked.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap().clone()
    }

    pub fn increment_request_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.request_count += 1;
    }

    pub fn increment_error_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.error_count += 1;
    }

    /// Record detailed metrics for a specific endpoint.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap();

        let endpoint_metric = metrics
            .endpoint_metrics
            .entry(endpoint.to_string())
            .or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;

        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn transcription_started(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.active_transcriptions += 1;
    }

    pub fn transcription_finished(&self) {
        let mut metrics = self.metrics.write().unwrap();
        // Underflow guard: u32 would panic on wrap in debug builds.
        if metrics.active_transcriptions > 0 {
            metrics.active_transcriptions -= 1;
        }
    }

    /// Snapshot of current metrics. Clones so no lock is held while the
    /// response is serialized.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let metrics = self.metrics.read().unwrap();
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            active_transcriptions: metrics.active_transcriptions,
            endpoint_metrics: metrics.endpoint_metrics.clone(),
        }
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
