//! # Whisper Model Management
//!
//! Loads and drives the Whisper recognition model via candle. Model files
//! come from HuggingFace (cached locally by hf-hub), weights are loaded in
//! the precision chosen by the compute context, and decoding produces
//! coarse segments with timing parsed from Whisper's timestamp tokens.
//!
//! ## Model Loading Process:
//! 1. Download config/tokenizer/weights from HuggingFace if not cached
//! 2. Load weights on the target device in the target precision
//! 3. Build the mel filter bank for the model's mel-bin count
//!
//! Loading failures are [`PipelineError::ModelLoad`]; decode failures at
//! request time are [`PipelineError::Inference`].

use crate::device::ComputeContext;
use crate::error::PipelineError;
use crate::pipeline::types::Segment;
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::whisper::{self as m, audio, Config};
use tokenizers::Tokenizer;

/// Seconds per Whisper timestamp-token step.
const TIMESTAMP_STEP: f64 = 0.02;

/// Greedy decode retries, in order, when a pass degenerates into
/// repetition.
const TEMPERATURES: &[f32] = &[0.0, 0.2, 0.4, 0.6, 0.8, 1.0];

/// Hard cap on decoded tokens per 30-second window.
const MAX_DECODE_TOKENS: usize = 224;

/// Language codes Whisper has tokens for. Used to restrict the language
/// detection step to valid candidates.
const LANGUAGE_CODES: &[&str] = &[
    "en", "zh", "de", "es", "ru", "ko", "fr", "ja", "pt", "tr", "pl", "ca", "nl", "ar", "sv",
    "it", "id", "hi", "fi", "vi", "he", "uk", "el", "ms", "cs", "ro", "da", "hu", "ta", "no",
    "th", "ur", "hr", "bg", "lt", "la", "mi", "ml", "cy", "sk", "te", "fa", "lv", "bn", "sr",
    "az", "sl", "kn", "et", "mk", "br", "eu", "is", "hy", "ne", "mn", "bs", "kk", "sq", "sw",
    "gl", "mr", "pa", "si", "km", "sn", "yo", "so", "af", "oc", "ka", "be", "tg", "sd", "gu",
    "am", "yi", "lo", "uz", "fo", "ht", "ps", "tk", "nn", "mt", "sa", "lb", "my", "bo", "tl",
    "mg", "as", "tt", "haw", "ln", "ha", "ba", "jw", "su",
];

/// Available Whisper model sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ModelSize {
    Tiny,
    Base,
    Small,
    Medium,
    LargeV2,
}

impl ModelSize {
    /// HuggingFace model repository for this size.
    pub fn repo_name(&self) -> &'static str {
        match self {
            ModelSize::Tiny => "openai/whisper-tiny",
            ModelSize::Base => "openai/whisper-base",
            ModelSize::Small => "openai/whisper-small",
            ModelSize::Medium => "openai/whisper-medium",
            ModelSize::LargeV2 => "openai/whisper-large-v2",
        }
    }
}

impl std::str::FromStr for ModelSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tiny" => Ok(ModelSize::Tiny),
            "base" => Ok(ModelSize::Base),
            "small" => Ok(ModelSize::Small),
            "medium" => Ok(ModelSize::Medium),
            "large" | "large-v2" => Ok(ModelSize::LargeV2),
            _ => Err(format!("Unknown model size: {}", s)),
        }
    }
}

impl std::fmt::Display for ModelSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ModelSize::Tiny => "tiny",
            ModelSize::Base => "base",
            ModelSize::Small => "small",
            ModelSize::Medium => "medium",
            ModelSize::LargeV2 => "large-v2",
        };
        write!(f, "{}", name)
    }
}

/// A loaded Whisper model plus the fixed token ids the decoder needs.
pub struct WhisperModel {
    model: m::model::Whisper,
    config: Config,
    device: Device,
    dtype: DType,
    tokenizer: Tokenizer,
    mel_filters: Vec<f32>,
    size: ModelSize,

    sot_token: u32,
    eot_token: u32,
    transcribe_token: u32,
    timestamp_begin: u32,
    /// (language code, token id), for the detection step.
    language_tokens: Vec<(&'static str, u32)>,
}

fn load_err(context: &str, err: impl std::fmt::Display) -> PipelineError {
    PipelineError::ModelLoad(format!("{}: {}", context, err))
}

fn infer_err(context: &str, err: impl std::fmt::Display) -> PipelineError {
    PipelineError::Inference(format!("{}: {}", context, err))
}

impl WhisperModel {
    /// Load a Whisper model from HuggingFace onto the given compute context.
    pub async fn load(size: ModelSize, compute: &ComputeContext) -> Result<Self, PipelineError> {
        tracing::info!(model = %size, device = compute.device_name(), "Loading Whisper model");
        let start_time = std::time::Instant::now();

        let api = {
            use hf_hub::api::tokio::ApiBuilder;
            let mut builder = ApiBuilder::new().with_progress(false);
            if let Ok(token) = std::env::var("HF_TOKEN") {
                builder = builder.with_token(Some(token));
            }
            builder
                .build()
                .map_err(|e| load_err("HuggingFace API init failed", e))?
        };
        let repo = api.model(size.repo_name().to_string());

        let config_filename = repo
            .get("config.json")
            .await
            .map_err(|e| load_err("downloading config.json failed", e))?;
        let tokenizer_filename = repo
            .get("tokenizer.json")
            .await
            .map_err(|e| load_err("downloading tokenizer.json failed", e))?;
        let weights_filename = repo
            .get("model.safetensors")
            .await
            .map_err(|e| load_err("downloading model weights failed", e))?;

        let config: Config = serde_json::from_reader(
            std::fs::File::open(config_filename).map_err(|e| load_err("opening config", e))?,
        )
        .map_err(|e| load_err("parsing config.json", e))?;

        let tokenizer = Tokenizer::from_file(tokenizer_filename)
            .map_err(|e| load_err("loading tokenizer", e))?;

        let dtype = compute.compute_type.dtype();
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights_filename], dtype, &compute.device)
                .map_err(|e| load_err("mapping model weights", e))?
        };
        let model = m::model::Whisper::load(&vb, config.clone())
            .map_err(|e| load_err("initializing model", e))?;

        let mel_filters = mel_filter_bank(config.num_mel_bins as usize);

        let token = |name: &str| -> Result<u32, PipelineError> {
            tokenizer
                .token_to_id(name)
                .ok_or_else(|| load_err("tokenizer is missing token", name))
        };
        let sot_token = token("<|startoftranscript|>")?;
        let eot_token = token("<|endoftext|>")?;
        let transcribe_token = token("<|transcribe|>")?;
        // Timestamp tokens occupy the id range right after <|notimestamps|>,
        // starting at <|0.00|>.
        let timestamp_begin = token("<|notimestamps|>")? + 1;

        let language_tokens = LANGUAGE_CODES
            .iter()
            .filter_map(|&code| {
                tokenizer
                    .token_to_id(&format!("<|{}|>", code))
                    .map(|id| (code, id))
            })
            .collect::<Vec<_>>();
        if language_tokens.is_empty() {
            return Err(load_err("tokenizer", "no language tokens found"));
        }

        tracing::info!(
            model = %size,
            elapsed_secs = start_time.elapsed().as_secs_f64(),
            "Whisper model loaded"
        );

        Ok(Self {
            model,
            config,
            device: compute.device.clone(),
            dtype,
            tokenizer,
            mel_filters,
            size,
            sot_token,
            eot_token,
            transcribe_token,
            timestamp_begin,
            language_tokens,
        })
    }

    pub fn size(&self) -> ModelSize {
        self.size
    }

    /// Token id for a language code, when the model knows the language.
    pub fn language_token(&self, code: &str) -> Option<u32> {
        self.language_tokens
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, id)| *id)
    }

    /// Compute the log-mel spectrogram for one 30-second window of samples,
    /// padded to the model's fixed frame count. Shape: (1, n_mels, frames).
    pub fn mel_spectrogram(&self, samples: &[f32]) -> Result<Tensor, PipelineError> {
        let mut window = samples.to_vec();
        window.resize(m::CHUNK_LENGTH * m::SAMPLE_RATE, 0.0);

        let mel = audio::pcm_to_mel(&self.config, &window, &self.mel_filters);
        let n_mels = self.config.num_mel_bins as usize;
        let n_frames = mel.len() / n_mels;
        Tensor::from_vec(mel, (1, n_mels, n_frames), &self.device)
            .and_then(|t| t.to_dtype(self.dtype))
            .map_err(|e| infer_err("building mel tensor", e))
    }

    /// Run the encoder over a batch of stacked mel windows.
    pub fn encode(&mut self, mel_batch: &Tensor) -> Result<Tensor, PipelineError> {
        self.model
            .encoder
            .forward(mel_batch, true)
            .map_err(|e| infer_err("encoder forward failed", e))
    }

    /// Detect the spoken language from the audio features of the first
    /// window: one decoder step from <|startoftranscript|>, argmax
    /// restricted to the language-token set.
    pub fn detect_language(&mut self, audio_features: &Tensor) -> Result<String, PipelineError> {
        let tokens = Tensor::new(&[[self.sot_token]], &self.device)
            .map_err(|e| infer_err("building detection tokens", e))?;
        let features = audio_features
            .i(0..1)
            .map_err(|e| infer_err("slicing audio features", e))?;
        let ys = self
            .model
            .decoder
            .forward(&tokens, &features, true)
            .map_err(|e| infer_err("language detection forward failed", e))?;
        let logits = self
            .model
            .decoder
            .final_linear(&ys)
            .and_then(|l| l.i((0, 0)))
            .and_then(|l| l.to_dtype(DType::F32))
            .and_then(|l| l.to_vec1::<f32>())
            .map_err(|e| infer_err("language detection logits failed", e))?;

        let detected = self
            .language_tokens
            .iter()
            .max_by(|(_, a), (_, b)| {
                logits[*a as usize]
                    .partial_cmp(&logits[*b as usize])
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(code, _)| code.to_string())
            .unwrap_or_else(|| "en".to_string());

        tracing::debug!(language = %detected, "Detected spoken language");
        Ok(detected)
    }

    /// Decode one window's audio features into timestamped segments.
    ///
    /// `window_offset` is the window's position in the full audio, used to
    /// shift timestamp tokens into absolute time; `window_secs` bounds the
    /// last segment when the decoder omits a closing timestamp.
    pub fn decode_segments(
        &mut self,
        audio_features: &Tensor,
        language_token: u32,
        window_offset: f64,
        window_secs: f64,
    ) -> Result<Vec<Segment>, PipelineError> {
        let tokens = self.decode_tokens_with_fallback(audio_features, language_token)?;
        let runs = segment_token_runs(&tokens, self.timestamp_begin, self.eot_token);

        let mut segments = Vec::with_capacity(runs.len());
        for run in runs {
            if run.tokens.is_empty() {
                continue;
            }
            let text = self
                .tokenizer
                .decode(&run.tokens, true)
                .map_err(|e| infer_err("token decode failed", e))?;
            let text = text.trim().to_string();
            if text.is_empty() {
                continue;
            }

            let start = window_offset
                + run
                    .start_ts
                    .map(|t| (t - self.timestamp_begin) as f64 * TIMESTAMP_STEP)
                    .unwrap_or(0.0);
            let end = window_offset
                + run
                    .end_ts
                    .map(|t| (t - self.timestamp_begin) as f64 * TIMESTAMP_STEP)
                    .unwrap_or(window_secs);
            let end = end.min(window_offset + window_secs).max(start);

            segments.push(Segment::new(start, end, text));
        }

        Ok(segments)
    }

    /// Greedy decode with the temperature-fallback ladder. Each attempt
    /// feeds the full token prefix back through the decoder (KV cache
    /// flushed at step 0) and bails to the next temperature when output
    /// degenerates into repetition.
    fn decode_tokens_with_fallback(
        &mut self,
        audio_features: &Tensor,
        language_token: u32,
    ) -> Result<Vec<u32>, PipelineError> {
        let mut output_tokens: Vec<u32> = Vec::new();

        for &temperature in TEMPERATURES {
            output_tokens.clear();
            let mut tokens = vec![self.sot_token, language_token, self.transcribe_token];
            let mut degenerate = false;

            for step in 0..MAX_DECODE_TOKENS {
                let token_tensor = Tensor::new(tokens.as_slice(), &self.device)
                    .and_then(|t| t.unsqueeze(0))
                    .map_err(|e| infer_err("building decoder input", e))?;

                let ys = self
                    .model
                    .decoder
                    .forward(&token_tensor, audio_features, step == 0)
                    .map_err(|e| infer_err("decoder forward failed", e))?;
                let logits = self
                    .model
                    .decoder
                    .final_linear(&ys)
                    .and_then(|l| l.i((0, tokens.len() - 1)))
                    .and_then(|l| l.to_dtype(DType::F32))
                    .map_err(|e| infer_err("decoder logits failed", e))?;

                let next_token = if temperature > 0.0 {
                    sample_token(&logits, temperature)?
                } else {
                    logits
                        .argmax(0)
                        .and_then(|t| t.to_scalar::<u32>())
                        .map_err(|e| infer_err("argmax failed", e))?
                };

                if next_token == self.eot_token {
                    break;
                }

                if is_repetitive(&output_tokens, next_token) {
                    degenerate = true;
                    break;
                }

                tokens.push(next_token);
                output_tokens.push(next_token);
            }

            if !degenerate {
                return Ok(output_tokens);
            }
            tracing::debug!(temperature, "Decode degenerated, retrying at higher temperature");
        }

        // All temperatures degenerated; return the last attempt rather
        // than failing the request over a noisy window.
        Ok(output_tokens)
    }
}

/// Sample a token from logits softened by `temperature`. Greedy over the
/// softened distribution; the temperature ladder's purpose here is to break
/// repetition loops, not to add diversity.
fn sample_token(logits: &Tensor, temperature: f32) -> Result<u32, PipelineError> {
    (logits / temperature as f64)
        .and_then(|l| candle_nn::ops::softmax_last_dim(&l))
        .and_then(|p| p.argmax(0))
        .and_then(|t| t.to_scalar::<u32>())
        .map_err(|e| infer_err("token sampling failed", e))
}

/// Detect immediate or short-pattern repetition in decoded output.
fn is_repetitive(tokens: &[u32], new_token: u32) -> bool {
    let n = tokens.len();
    if n >= 2 && tokens[n - 1] == new_token && tokens[n - 2] == new_token {
        return true;
    }
    if n >= 6 && tokens[n - 3..] == tokens[n - 6..n - 3] {
        return true;
    }
    false
}

/// A run of text tokens bracketed by timestamp tokens.
#[derive(Debug, PartialEq)]
pub(crate) struct TokenRun {
    pub start_ts: Option<u32>,
    pub end_ts: Option<u32>,
    pub tokens: Vec<u32>,
}

/// Split a decoded token stream into timestamp-delimited runs.
///
/// Whisper emits `<|t0|> text <|t1|><|t1|> text <|t2|> ...`; consecutive
/// timestamp tokens close one run and open the next. Runs with no opening
/// or closing timestamp (the decoder sometimes drops them) keep `None`
/// and are bounded by the window edges by the caller. Tokens at or above
/// `specials_from` (EOT and later special ids) are dropped.
pub(crate) fn segment_token_runs(
    tokens: &[u32],
    timestamp_begin: u32,
    specials_from: u32,
) -> Vec<TokenRun> {
    let mut runs = Vec::new();
    let mut start_ts: Option<u32> = None;
    let mut buffer: Vec<u32> = Vec::new();

    for &token in tokens {
        if token >= timestamp_begin {
            if !buffer.is_empty() {
                runs.push(TokenRun {
                    start_ts,
                    end_ts: Some(token),
                    tokens: std::mem::take(&mut buffer),
                });
            }
            start_ts = Some(token);
        } else if token < specials_from {
            buffer.push(token);
        }
    }

    if !buffer.is_empty() {
        runs.push(TokenRun {
            start_ts,
            end_ts: None,
            tokens: buffer,
        });
    }

    runs
}

/// Build a triangular mel filter bank for Whisper's STFT layout
/// (n_fft = 400, so 201 frequency bins per filter row).
fn mel_filter_bank(n_mels: usize) -> Vec<f32> {
    const N_FREQS: usize = 201;
    const SAMPLE_RATE: f32 = 16_000.0;

    fn hz_to_mel(hz: f32) -> f32 {
        2595.0 * (1.0 + hz / 700.0).log10()
    }
    fn mel_to_hz(mel: f32) -> f32 {
        700.0 * (10f32.powf(mel / 2595.0) - 1.0)
    }

    let max_mel = hz_to_mel(SAMPLE_RATE / 2.0);
    let mel_points: Vec<f32> = (0..n_mels + 2)
        .map(|i| mel_to_hz(max_mel * i as f32 / (n_mels + 1) as f32))
        .collect();
    let freq_step = SAMPLE_RATE / 2.0 / (N_FREQS - 1) as f32;

    let mut filters = vec![0.0f32; n_mels * N_FREQS];
    for mel_idx in 0..n_mels {
        let (lower, center, upper) = (
            mel_points[mel_idx],
            mel_points[mel_idx + 1],
            mel_points[mel_idx + 2],
        );
        for freq_idx in 0..N_FREQS {
            let freq = freq_idx as f32 * freq_step;
            let weight = if freq <= center {
                (freq - lower) / (center - lower).max(f32::EPSILON)
            } else {
                (upper - freq) / (upper - center).max(f32::EPSILON)
            };
            if weight > 0.0 {
                // Slaney-style area normalization.
                filters[mel_idx * N_FREQS + freq_idx] = weight * 2.0 / (upper - lower);
            }
        }
    }

    filters
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_size_parsing() {
        assert_eq!("tiny".parse::<ModelSize>().unwrap(), ModelSize::Tiny);
        assert_eq!("large-v2".parse::<ModelSize>().unwrap(), ModelSize::LargeV2);
        assert_eq!("LARGE".parse::<ModelSize>().unwrap(), ModelSize::LargeV2);
        assert!("invalid".parse::<ModelSize>().is_err());
    }

    #[test]
    fn test_repetition_guard() {
        assert!(is_repetitive(&[5, 5], 5));
        assert!(is_repetitive(&[1, 2, 3, 1, 2, 3], 9));
        assert!(!is_repetitive(&[1, 2, 3], 4));
        assert!(!is_repetitive(&[], 7));
    }

    #[test]
    fn test_segment_token_runs_basic() {
        // <|0.00|> a b <|1.00|><|1.00|> c <|2.00|>
        let ts = 1000u32;
        let tokens = [ts, 1, 2, ts + 50, ts + 50, 3, ts + 100];
        let runs = segment_token_runs(&tokens, ts, 900);
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].start_ts, Some(ts));
        assert_eq!(runs[0].end_ts, Some(ts + 50));
        assert_eq!(runs[0].tokens, vec![1, 2]);
        assert_eq!(runs[1].start_ts, Some(ts + 50));
        assert_eq!(runs[1].end_ts, Some(ts + 100));
        assert_eq!(runs[1].tokens, vec![3]);
    }

    #[test]
    fn test_segment_token_runs_missing_timestamps() {
        let ts = 1000u32;
        // No timestamps at all: one open-ended run.
        let runs = segment_token_runs(&[1, 2, 3], ts, 900);
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].start_ts, None);
        assert_eq!(runs[0].end_ts, None);

        // Opening timestamp but no closing one.
        let runs = segment_token_runs(&[ts + 10, 4, 5], ts, 900);
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].start_ts, Some(ts + 10));
        assert_eq!(runs[0].end_ts, None);
    }

    #[test]
    fn test_segment_token_runs_drops_specials() {
        let ts = 1000u32;
        let runs = segment_token_runs(&[ts, 1, 950, 2, ts + 10], ts, 900);
        assert_eq!(runs[0].tokens, vec![1, 2]);
    }

    #[test]
    fn test_mel_filter_bank_shape() {
        let filters = mel_filter_bank(80);
        assert_eq!(filters.len(), 80 * 201);
        assert!(filters.iter().all(|&w| w >= 0.0));
        // Every filter row has some mass.
        for row in filters.chunks(201) {
            assert!(row.iter().sum::<f32>() > 0.0);
        }
    }
}
