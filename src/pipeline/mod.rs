//! # Transcription Pipeline
//!
//! Turns a remote audio URL into a diarized transcript. The pipeline is a
//! fixed sequence of stages, each behind a small trait so the orchestrator
//! can be tested against stubs:
//!
//! - **fetch**: download, decode and resample the source audio
//! - **engine**: batched Whisper recognition via the Candle-rs framework
//! - **align**: refine segment timing to word-level timestamps
//! - **diarize**: speaker-change detection against a hosted model
//! - **assign**: merge diarization intervals onto segments and words
//! - **orchestrator**: sequencing, failure policy and resource lifetime
//!
//! Models are loaded once at process start and shared across requests;
//! per-request state is confined to the stage invocations.

pub mod align;
pub mod assign;
pub mod diarize;
pub mod engine;
pub mod fetch;
pub mod model;
pub mod orchestrator;
pub mod types;

pub use align::{Align, EnergyAligner};
pub use diarize::{Diarize, RemoteDiarizer};
pub use engine::{Transcribe, WhisperEngine};
pub use fetch::{AudioResource, FetchAudio, HttpAudioFetcher};
pub use model::{ModelSize, WhisperModel};
pub use orchestrator::{PipelineOrchestrator, TranscribeOptions};
pub use types::{DiarizationInterval, Segment, TranscriptResult, Word};
