//! # Speaker Diarization
//!
//! Detects speaker-change intervals over the raw audio, independent of the
//! transcription branch. The diarization model is hosted; the stage ships
//! the audio as WAV to the configured endpoint and authenticates with an
//! access credential injected through the environment.
//!
//! A missing credential is a configuration error surfaced when the stage
//! is constructed at startup: a request asking for diarization against a
//! process without a credential fails before any audio is processed, never
//! mid-pipeline.

use crate::config::DiarizationConfig;
use crate::error::PipelineError;
use crate::pipeline::fetch::AudioResource;
use crate::pipeline::types::DiarizationInterval;
use async_trait::async_trait;
use serde::Deserialize;
use std::io::Cursor;
use tracing::{debug, info};

/// The diarization seam of the pipeline.
#[async_trait]
pub trait Diarize: Send + Sync {
    /// Detect speaker intervals over the audio, ordered by start time.
    async fn diarize(&self, audio: &AudioResource)
        -> Result<Vec<DiarizationInterval>, PipelineError>;
}

/// Client for a hosted pyannote-style diarization model.
#[derive(Debug)]
pub struct RemoteDiarizer {
    client: reqwest::Client,
    endpoint: String,
    auth_token: String,
}

impl RemoteDiarizer {
    /// Build the diarizer, validating that a credential is present.
    pub fn new(config: &DiarizationConfig) -> Result<Self, PipelineError> {
        let auth_token = config
            .auth_token
            .clone()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| {
                PipelineError::DiarizationConfig(
                    "no access credential provided (set DIARIZATION_AUTH_TOKEN)".to_string(),
                )
            })?;

        let client = reqwest::Client::new();
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            auth_token,
        })
    }
}

#[async_trait]
impl Diarize for RemoteDiarizer {
    async fn diarize(
        &self,
        audio: &AudioResource,
    ) -> Result<Vec<DiarizationInterval>, PipelineError> {
        info!(
            duration_secs = audio.duration_secs(),
            "Starting diarization pass"
        );

        let wav = encode_wav(audio.samples(), audio.sample_rate())
            .map_err(|e| PipelineError::Inference(format!("WAV encode for diarization: {}", e)))?;

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.auth_token)
            .header(reqwest::header::CONTENT_TYPE, "audio/wav")
            .body(wav)
            .send()
            .await
            .map_err(|e| {
                PipelineError::Inference(format!("diarization request failed: {}", e))
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            // The credential exists but the model rejected it.
            return Err(PipelineError::DiarizationConfig(format!(
                "diarization model rejected the credential (HTTP {})",
                status
            )));
        }
        if !status.is_success() {
            return Err(PipelineError::Inference(format!(
                "diarization model returned HTTP {}",
                status
            )));
        }

        let body = response.bytes().await.map_err(|e| {
            PipelineError::Inference(format!("reading diarization response: {}", e))
        })?;
        let mut intervals = parse_intervals(&body)?;
        intervals.sort_by(|a, b| a.start.total_cmp(&b.start));

        debug!(intervals = intervals.len(), "Diarization pass complete");
        Ok(intervals)
    }
}

/// Wire shape of one diarization interval. `label` is accepted as an alias
/// because pyannote-style endpoints differ on the field name.
#[derive(Deserialize)]
struct WireInterval {
    start: f64,
    end: f64,
    #[serde(alias = "label")]
    speaker: String,
}

/// Envelope variants seen in the wild: a bare array or `{"segments": [...]}`.
#[derive(Deserialize)]
#[serde(untagged)]
enum WireResponse {
    Bare(Vec<WireInterval>),
    Enveloped { segments: Vec<WireInterval> },
}

fn parse_intervals(body: &[u8]) -> Result<Vec<DiarizationInterval>, PipelineError> {
    let parsed: WireResponse = serde_json::from_slice(body)
        .map_err(|e| PipelineError::Inference(format!("parsing diarization response: {}", e)))?;
    let wire = match parsed {
        WireResponse::Bare(intervals) => intervals,
        WireResponse::Enveloped { segments } => segments,
    };
    Ok(wire
        .into_iter()
        .map(|w| DiarizationInterval::new(w.start, w.end, w.speaker))
        .collect())
}

/// Encode samples as 16-bit PCM WAV in memory.
fn encode_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>, hound::Error> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for &sample in samples {
            let scaled = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer.write_sample(scaled)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}
