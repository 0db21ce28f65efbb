//! # Transcription Engine
//!
//! Runs the recognition pass over fetched audio: the audio is split into
//! Whisper's 30-second windows, windows are encoded in fixed-size batches,
//! and each window is decoded into coarse timestamped segments.
//!
//! The engine owns the process-wide model handle; requests share it
//! read-only through the orchestrator and serialize decoder access behind
//! a lock (the decoder KV cache is stateful across steps).
//!
//! Batch size affects throughput and memory only, never output content;
//! the default of 16 windows per encoder pass is configurable via
//! `models.batch_size`.

use crate::error::PipelineError;
use crate::pipeline::fetch::AudioResource;
use crate::pipeline::model::WhisperModel;
use crate::pipeline::types::Segment;
use async_trait::async_trait;
use candle_core::Tensor;
use candle_transformers::models::whisper as m;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// The recognition seam of the pipeline.
#[async_trait]
pub trait Transcribe: Send + Sync {
    /// Transcribe audio into coarse segments plus the language actually
    /// used. `language_hint` is an override when the model knows the
    /// language; otherwise the language is detected from the audio.
    async fn transcribe(
        &self,
        audio: &AudioResource,
        language_hint: Option<&str>,
    ) -> Result<(Vec<Segment>, String), PipelineError>;
}

/// Whisper-backed transcription engine.
pub struct WhisperEngine {
    model: Mutex<WhisperModel>,
    batch_size: usize,
}

impl WhisperEngine {
    pub fn new(model: WhisperModel, batch_size: usize) -> Self {
        Self {
            model: Mutex::new(model),
            batch_size: batch_size.max(1),
        }
    }
}

#[async_trait]
impl Transcribe for WhisperEngine {
    async fn transcribe(
        &self,
        audio: &AudioResource,
        language_hint: Option<&str>,
    ) -> Result<(Vec<Segment>, String), PipelineError> {
        let samples = audio.samples();
        let window_len = m::CHUNK_LENGTH * m::SAMPLE_RATE;
        let spans = window_spans(samples.len(), window_len);

        let mut model = self.model.lock().await;

        if spans.is_empty() {
            // Silent/empty audio: nothing to decode, nothing to detect.
            let language = language_hint.unwrap_or("en").to_string();
            return Ok((Vec::new(), language));
        }

        info!(
            duration_secs = audio.duration_secs(),
            windows = spans.len(),
            batch_size = self.batch_size,
            "Starting recognition pass"
        );

        let mut segments = Vec::new();
        let mut language: Option<(String, u32)> = language_hint
            .and_then(|hint| model.language_token(hint).map(|id| (hint.to_string(), id)));

        for batch in spans.chunks(self.batch_size) {
            let mels = batch
                .iter()
                .map(|&(start, end)| model.mel_spectrogram(&samples[start..end]))
                .collect::<Result<Vec<Tensor>, _>>()?;
            let mel_refs: Vec<&Tensor> = mels.iter().collect();
            let mel_batch = Tensor::cat(&mel_refs, 0)
                .map_err(|e| PipelineError::Inference(format!("stacking mel batch: {}", e)))?;

            let features = model.encode(&mel_batch)?;

            // Language is resolved once, from the first window, unless a
            // valid hint already fixed it.
            if language.is_none() {
                let detected = model.detect_language(&features)?;
                let token = model.language_token(&detected).ok_or_else(|| {
                    PipelineError::Inference(format!(
                        "detected language '{}' has no model token",
                        detected
                    ))
                })?;
                language = Some((detected, token));
            }
            let (_, language_token) = language.as_ref().expect("language resolved above");

            for (batch_idx, &(start, end)) in batch.iter().enumerate() {
                let window_features = features
                    .narrow(0, batch_idx, 1)
                    .map_err(|e| PipelineError::Inference(format!("slicing features: {}", e)))?;
                let offset = start as f64 / m::SAMPLE_RATE as f64;
                let window_secs = (end - start) as f64 / m::SAMPLE_RATE as f64;
                let window_segments = model.decode_segments(
                    &window_features,
                    *language_token,
                    offset,
                    window_secs,
                )?;
                debug!(
                    offset_secs = offset,
                    segments = window_segments.len(),
                    "Decoded window"
                );
                segments.extend(window_segments);
            }
        }

        let (language, _) = language.expect("at least one window was decoded");
        info!(
            segments = segments.len(),
            language = %language,
            "Recognition pass complete"
        );
        Ok((segments, language))
    }
}

/// Split `n_samples` into consecutive `(start, end)` windows of at most
/// `window_len` samples. The last window may be shorter.
fn window_spans(n_samples: usize, window_len: usize) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = 0;
    while start < n_samples {
        let end = (start + window_len).min(n_samples);
        spans.push((start, end));
        start = end;
    }
    spans
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_spans_exact_multiple() {
        let spans = window_spans(200, 100);
        assert_eq!(spans, vec![(0, 100), (100, 200)]);
    }

    #[test]
    fn test_window_spans_with_remainder() {
        let spans = window_spans(250, 100);
        assert_eq!(spans, vec![(0, 100), (100, 200), (200, 250)]);
    }

    #[test]
    fn test_window_spans_empty() {
        assert!(window_spans(0, 100).is_empty());
    }

    #[test]
    fn test_window_spans_shorter_than_window() {
        assert_eq!(window_spans(42, 100), vec![(0, 42)]);
    }
}
