//! # Error Handling
//!
//! Two layers of errors live here:
//!
//! - [`PipelineError`] is the typed taxonomy for the transcription pipeline
//!   itself: fetch, model init, inference, alignment coverage and
//!   diarization configuration failures. No variant is retried internally;
//!   retry policy belongs to the caller.
//! - [`AppError`] is the HTTP-facing error the handlers return. Every
//!   pipeline failure surfaces to the client as a single opaque 500 with a
//!   human-readable cause string.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;
use thiserror::Error;

/// Failures the transcription pipeline can produce.
///
/// Each variant corresponds to one stage of the pipeline; any of them is
/// terminal for the request that hit it.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Network/transport failure while retrieving the source audio
    /// (unreachable host, non-2xx status, timeout, undecodable payload).
    #[error("audio fetch failed: {0}")]
    Fetch(String),

    /// The recognition/alignment/diarization backend could not be
    /// initialized for the target device.
    #[error("model initialization failed: {0}")]
    ModelLoad(String),

    /// A model invocation failed at runtime.
    #[error("inference failed: {0}")]
    Inference(String),

    /// No alignment profile exists for the detected language.
    #[error("no alignment model available for language '{0}'")]
    UnsupportedLanguage(String),

    /// Diarization was requested but the service has no valid credential
    /// for the diarization model. Surfaced before any audio is processed.
    #[error("diarization is not configured: {0}")]
    DiarizationConfig(String),
}

impl PipelineError {
    /// Machine-readable tag used in error responses and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Fetch(_) => "fetch_error",
            PipelineError::ModelLoad(_) => "model_load_error",
            PipelineError::Inference(_) => "inference_error",
            PipelineError::UnsupportedLanguage(_) => "unsupported_language_error",
            PipelineError::DiarizationConfig(_) => "diarization_config_error",
        }
    }
}

/// Custom error types for the HTTP layer.
///
/// ## Error Categories:
/// - **Pipeline**: any transcription pipeline failure (500, with cause)
/// - **Internal**: other server-side problems (500 errors)
/// - **BadRequest**: client sent invalid data (400 errors)
/// - **ConfigError**: configuration problems (500 errors)
#[derive(Debug)]
pub enum AppError {
    /// A transcription pipeline stage failed.
    Pipeline(PipelineError),

    /// Internal server errors outside the pipeline.
    Internal(String),

    /// Client sent invalid or malformed data.
    BadRequest(String),

    /// Configuration file or environment variable problems.
    ConfigError(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Pipeline(err) => write!(f, "Transcription failed: {}", err),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

/// Converts errors to HTTP responses.
///
/// ## HTTP Status Code Mapping:
/// - Pipeline/Internal/ConfigError → 500 (Internal Server Error)
/// - BadRequest → 400 (Bad Request)
///
/// All error responses share the same JSON shape:
/// ```json
/// {
///   "error": {
///     "type": "fetch_error",
///     "detail": "Transcription failed: audio fetch failed: ...",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type) = match self {
            AppError::Pipeline(err) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                err.kind(),
            ),
            AppError::Internal(_) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
            ),
            AppError::BadRequest(_) => {
                (actix_web::http::StatusCode::BAD_REQUEST, "bad_request")
            }
            AppError::ConfigError(_) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
            ),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "detail": self.to_string(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        AppError::Pipeline(err)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
