//! # Audio Fetch and Resource Lifecycle
//!
//! Retrieves the source audio from a remote URL into an [`AudioResource`]:
//! the payload is persisted to an exclusively-owned temp file and decoded
//! into 16 kHz mono f32 samples, the format the recognition model consumes.
//!
//! The temp file is owned by the resource and reclaimed by its `Drop`
//! impl, so release happens exactly once on every exit path of the request
//! that owns it, including failures in later pipeline stages.
//!
//! The fetch talks to an untrusted remote endpoint and is the one stage
//! bounded by an explicit timeout (configured in `[fetch]`).

use crate::config::FetchConfig;
use crate::error::PipelineError;
use async_trait::async_trait;
use futures_util::StreamExt;
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// Sample rate the recognition model expects.
pub const SAMPLE_RATE: u32 = 16_000;

/// Decoded audio for one request, plus the scoped temp file backing it.
///
/// Exclusively owned by the pipeline run for the request that fetched it;
/// never shared with or reused by another request.
#[derive(Debug)]
pub struct AudioResource {
    samples: Vec<f32>,
    sample_rate: u32,
    temp: Option<NamedTempFile>,
}

impl AudioResource {
    /// Build a resource from raw samples, with no backing temp file.
    /// Used by tests and mock stages.
    pub fn from_samples(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            temp: None,
        }
    }

    /// Build a resource that owns a backing temp file.
    pub(crate) fn backed_by_temp(samples: Vec<f32>, sample_rate: u32, temp: NamedTempFile) -> Self {
        Self {
            samples,
            sample_rate,
            temp: Some(temp),
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Path of the backing temp file, when one exists.
    pub fn temp_path(&self) -> Option<&Path> {
        self.temp.as_ref().map(|t| t.path())
    }
}

impl Drop for AudioResource {
    fn drop(&mut self) {
        if let Some(temp) = &self.temp {
            debug!(path = %temp.path().display(), "Releasing temp audio resource");
        }
        // NamedTempFile removes the file when dropped.
    }
}

/// The fetch seam of the pipeline.
#[async_trait]
pub trait FetchAudio: Send + Sync {
    /// Retrieve the audio behind `url` into a locally owned resource.
    ///
    /// Fails with [`PipelineError::Fetch`] on any transport failure,
    /// non-2xx status, oversized or undecodable payload; no partial
    /// resource is ever returned.
    async fn fetch(&self, url: &str) -> Result<AudioResource, PipelineError>;
}

/// HTTP fetcher backed by a shared `reqwest` client.
pub struct HttpAudioFetcher {
    client: reqwest::Client,
    max_bytes: usize,
}

impl HttpAudioFetcher {
    pub fn new(config: &FetchConfig) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PipelineError::Fetch(format!("HTTP client init failed: {}", e)))?;
        Ok(Self {
            client,
            max_bytes: config.max_bytes,
        })
    }
}

#[async_trait]
impl FetchAudio for HttpAudioFetcher {
    async fn fetch(&self, url: &str) -> Result<AudioResource, PipelineError> {
        info!(url = %url, "Fetching source audio");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| PipelineError::Fetch(format!("request to {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::Fetch(format!(
                "{} returned HTTP {}",
                url, status
            )));
        }

        // The size cap bounds what gets buffered, not just what gets
        // returned: reject on the declared length up front, then stream the
        // body and abort the moment the running total crosses the cap.
        if let Some(declared) = response.content_length() {
            if declared > self.max_bytes as u64 {
                return Err(PipelineError::Fetch(format!(
                    "declared payload of {} bytes exceeds the {} byte cap",
                    declared, self.max_bytes
                )));
            }
        }

        let mut bytes: Vec<u8> = Vec::new();
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| {
                PipelineError::Fetch(format!("reading body from {} failed: {}", url, e))
            })?;
            if bytes.len() + chunk.len() > self.max_bytes {
                return Err(PipelineError::Fetch(format!(
                    "payload exceeds the {} byte cap",
                    self.max_bytes
                )));
            }
            bytes.extend_from_slice(&chunk);
        }

        let mut temp = NamedTempFile::new()
            .map_err(|e| PipelineError::Fetch(format!("temp file creation failed: {}", e)))?;
        temp.write_all(&bytes)
            .map_err(|e| PipelineError::Fetch(format!("temp file write failed: {}", e)))?;

        let (samples, sample_rate) = decode_wav(temp.path())?;
        let samples = resample_linear(&samples, sample_rate, SAMPLE_RATE);

        debug!(
            bytes = bytes.len(),
            duration_secs = samples.len() as f64 / SAMPLE_RATE as f64,
            "Fetched and decoded audio"
        );

        Ok(AudioResource::backed_by_temp(samples, SAMPLE_RATE, temp))
    }
}

/// Decode a WAV file into mono f32 samples at its native rate.
///
/// Multi-channel audio is down-mixed by averaging channels. Integer PCM is
/// scaled into [-1.0, 1.0].
fn decode_wav(path: &Path) -> Result<(Vec<f32>, u32), PipelineError> {
    let reader = hound::WavReader::open(path)
        .map_err(|e| PipelineError::Fetch(format!("payload is not decodable WAV audio: {}", e)))?;
    let spec = reader.spec();

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<Result<_, _>>()
            .map_err(|e| PipelineError::Fetch(format!("WAV sample decode failed: {}", e)))?,
        hound::SampleFormat::Int => {
            let bits = spec.bits_per_sample;
            if bits == 0 || bits > 32 {
                return Err(PipelineError::Fetch(format!(
                    "unsupported WAV bit depth: {}",
                    bits
                )));
            }
            let scale = (1i64 << (bits - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()
                .map_err(|e| PipelineError::Fetch(format!("WAV sample decode failed: {}", e)))?
        }
    };

    let channels = spec.channels.max(1) as usize;
    let samples = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    };

    Ok((samples, spec.sample_rate))
}

/// Linear resampling between sample rates. Whisper expects 16 kHz; the
/// sources in the wild are commonly 44.1/48 kHz.
fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((samples.len() as f64) / ratio).floor() as usize;
    let mut out = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let pos = i as f64 * ratio;
        let idx = pos.floor() as usize;
        let frac = (pos - idx as f64) as f32;
        let a = samples[idx];
        let b = samples.get(idx + 1).copied().unwrap_or(a);
        out.push(a + (b - a) * frac);
    }

    out
}
