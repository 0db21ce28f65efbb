//! # Transcription Handler
//!
//! `POST /transcribe`: accepts an audio URL, runs the full pipeline and
//! returns the diarized transcript. Synchronous from the client's point of
//! view; the connection stays open until the transcript is ready or a
//! stage fails.

use crate::error::{AppError, AppResult};
use crate::pipeline::TranscribeOptions;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use tracing::info;

/// Request body for `POST /transcribe`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscribeRequest {
    /// URL of the audio to transcribe. Any format the decoder understands.
    pub audio_url: String,

    /// Language hint for recognition. Used when the model trusts it,
    /// otherwise the detected language wins.
    #[serde(default = "default_language")]
    pub language: Option<String>,

    /// Whether to run speaker diarization. On by default.
    #[serde(default = "default_diarization")]
    pub enable_diarization: bool,
}

fn default_language() -> Option<String> {
    Some("en".to_string())
}

fn default_diarization() -> bool {
    true
}

pub async fn transcribe(
    state: web::Data<AppState>,
    request: web::Json<TranscribeRequest>,
) -> AppResult<HttpResponse> {
    let request = request.into_inner();

    if request.audio_url.trim().is_empty() {
        return Err(AppError::BadRequest("audioUrl cannot be empty".to_string()));
    }
    if !request.audio_url.starts_with("http://") && !request.audio_url.starts_with("https://") {
        return Err(AppError::BadRequest(
            "audioUrl must be an http(s) URL".to_string(),
        ));
    }

    info!(
        audio_url = %request.audio_url,
        diarization = request.enable_diarization,
        "Transcription request received"
    );

    let options = TranscribeOptions {
        audio_url: request.audio_url,
        language_hint: request.language.filter(|l| !l.trim().is_empty()),
        diarize: request.enable_diarization,
    };

    state.transcription_started();
    let result = state.pipeline.run(&options).await;
    state.transcription_finished();

    let transcript = result?;
    Ok(HttpResponse::Ok().json(transcript))
}
