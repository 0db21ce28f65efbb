//! # Pipeline Orchestrator
//!
//! Sequences the transcription pipeline for one request:
//!
//! ```text
//! Fetching → Transcribing → Aligning → [Diarizing] → [Assigning] → Done | Failed
//! ```
//!
//! The orchestrator owns the fetched [`AudioResource`] end to end. Release
//! of its temp storage is the resource's `Drop` impl, so it runs as the
//! terminal step of both `Done` and `Failed` paths unconditionally; no
//! stage failure can leak it.
//!
//! Diarization only depends on the raw audio, so it runs concurrently with
//! the transcribe+align branch; the branches are joined before speaker
//! assignment, and the first failure cancels the other branch and falls
//! through to cleanup. No stage is retried here; retry policy belongs to
//! the external caller.

use crate::config::AlignmentFailurePolicy;
use crate::error::PipelineError;
use crate::pipeline::align::Align;
use crate::pipeline::assign::assign_speakers;
use crate::pipeline::diarize::Diarize;
use crate::pipeline::engine::Transcribe;
use crate::pipeline::fetch::{AudioResource, FetchAudio};
use crate::pipeline::types::{Segment, TranscriptResult};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// Per-request options, decoded from the transcribe request body.
#[derive(Debug, Clone)]
pub struct TranscribeOptions {
    pub audio_url: String,
    /// Language hint; an override when the model knows it, otherwise the
    /// detected language wins.
    pub language_hint: Option<String>,
    pub diarize: bool,
}

/// Pipeline state for one request, used for stage-transition logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Fetching,
    Transcribing,
    Aligning,
    Diarizing,
    Assigning,
    Done,
    Failed,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineStage::Fetching => "fetching",
            PipelineStage::Transcribing => "transcribing",
            PipelineStage::Aligning => "aligning",
            PipelineStage::Diarizing => "diarizing",
            PipelineStage::Assigning => "assigning",
            PipelineStage::Done => "done",
            PipelineStage::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

fn enter(stage: PipelineStage) {
    info!(stage = %stage, "Pipeline stage");
}

/// Sequences the pipeline stages and assembles the final transcript.
///
/// Stage implementations are injected once at process start and shared
/// read-only across requests; the orchestrator itself keeps no per-request
/// state.
pub struct PipelineOrchestrator {
    fetcher: Arc<dyn FetchAudio>,
    transcriber: Arc<dyn Transcribe>,
    aligner: Arc<dyn Align>,
    /// Absent when the process was started without a diarization
    /// credential; diarization-enabled requests then fail up front.
    diarizer: Option<Arc<dyn Diarize>>,
    alignment_failure: AlignmentFailurePolicy,
}

impl PipelineOrchestrator {
    pub fn new(
        fetcher: Arc<dyn FetchAudio>,
        transcriber: Arc<dyn Transcribe>,
        aligner: Arc<dyn Align>,
        diarizer: Option<Arc<dyn Diarize>>,
        alignment_failure: AlignmentFailurePolicy,
    ) -> Self {
        Self {
            fetcher,
            transcriber,
            aligner,
            diarizer,
            alignment_failure,
        }
    }

    pub fn diarization_available(&self) -> bool {
        self.diarizer.is_some()
    }

    /// Run the full pipeline for one request.
    pub async fn run(&self, options: &TranscribeOptions) -> Result<TranscriptResult, PipelineError> {
        // Configuration problems surface before any audio is touched.
        let diarizer = if options.diarize {
            Some(self.diarizer.as_ref().ok_or_else(|| {
                PipelineError::DiarizationConfig(
                    "diarization requested but no credential is configured".to_string(),
                )
            })?)
        } else {
            None
        };

        enter(PipelineStage::Fetching);
        let audio = self.fetcher.fetch(&options.audio_url).await?;

        let result = self.run_stages(&audio, options, diarizer).await;
        match &result {
            Ok(transcript) => {
                enter(PipelineStage::Done);
                info!(
                    segments = transcript.segments.len(),
                    duration = transcript.duration,
                    language = %transcript.language,
                    "Transcription complete"
                );
            }
            Err(err) => {
                enter(PipelineStage::Failed);
                warn!(error = %err, kind = err.kind(), "Transcription failed");
            }
        }

        // Terminal step of both outcomes: the resource (and its temp
        // storage) is released here, exactly once.
        drop(audio);
        result
    }

    async fn run_stages(
        &self,
        audio: &AudioResource,
        options: &TranscribeOptions,
        diarizer: Option<&Arc<dyn Diarize>>,
    ) -> Result<TranscriptResult, PipelineError> {
        let (segments, language) = match diarizer {
            Some(diarizer) => {
                let recognition = self.recognize(audio, options);
                let diarization = async {
                    enter(PipelineStage::Diarizing);
                    diarizer.diarize(audio).await
                };
                // First failure cancels the other branch.
                let ((segments, language), intervals) =
                    tokio::try_join!(recognition, diarization)?;

                enter(PipelineStage::Assigning);
                (assign_speakers(&intervals, segments), language)
            }
            None => self.recognize(audio, options).await?,
        };

        Ok(TranscriptResult::assemble(segments, language))
    }

    /// The transcribe+align branch. Alignment is keyed by the detected
    /// language; when no alignment model exists for it the configured
    /// policy decides between degrading to segment-level timestamps and
    /// failing the request.
    async fn recognize(
        &self,
        audio: &AudioResource,
        options: &TranscribeOptions,
    ) -> Result<(Vec<Segment>, String), PipelineError> {
        enter(PipelineStage::Transcribing);
        let (segments, language) = self
            .transcriber
            .transcribe(audio, options.language_hint.as_deref())
            .await?;

        enter(PipelineStage::Aligning);
        match self.aligner.align(&segments, &language, audio).await {
            Ok(aligned) => Ok((aligned, language)),
            Err(PipelineError::UnsupportedLanguage(lang))
                if self.alignment_failure == AlignmentFailurePolicy::Degrade =>
            {
                warn!(
                    language = %lang,
                    "No alignment model for detected language, returning segment-level timestamps"
                );
                Ok((segments, language))
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{DiarizationInterval, Word};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    /// Fetcher returning a temp-backed resource, recording the temp path
    /// so tests can verify it was reclaimed.
    struct StubFetcher {
        calls: AtomicUsize,
        last_temp_path: Mutex<Option<PathBuf>>,
    }

    impl StubFetcher {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                last_temp_path: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl FetchAudio for StubFetcher {
        async fn fetch(&self, _url: &str) -> Result<AudioResource, PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let temp = NamedTempFile::new().unwrap();
            *self.last_temp_path.lock().unwrap() = Some(temp.path().to_path_buf());
            Ok(AudioResource::backed_by_temp(vec![0.0; 16_000], 16_000, temp))
        }
    }

    struct FailingFetcher;

    #[async_trait]
    impl FetchAudio for FailingFetcher {
        async fn fetch(&self, url: &str) -> Result<AudioResource, PipelineError> {
            Err(PipelineError::Fetch(format!("{} returned HTTP 404", url)))
        }
    }

    struct StubTranscriber {
        segments: Vec<Segment>,
        language: String,
        fail: bool,
    }

    impl StubTranscriber {
        fn ok(segments: Vec<Segment>, language: &str) -> Self {
            Self {
                segments,
                language: language.to_string(),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                segments: Vec::new(),
                language: "en".to_string(),
                fail: true,
            }
        }
    }

    #[async_trait]
    impl Transcribe for StubTranscriber {
        async fn transcribe(
            &self,
            _audio: &AudioResource,
            _language_hint: Option<&str>,
        ) -> Result<(Vec<Segment>, String), PipelineError> {
            if self.fail {
                return Err(PipelineError::Inference("decode blew up".to_string()));
            }
            Ok((self.segments.clone(), self.language.clone()))
        }
    }

    /// Aligner that attaches one word per segment spanning the segment.
    struct StubAligner {
        error: Option<fn() -> PipelineError>,
    }

    impl StubAligner {
        fn ok() -> Self {
            Self { error: None }
        }

        fn unsupported() -> Self {
            Self {
                error: Some(|| PipelineError::UnsupportedLanguage("xx".to_string())),
            }
        }

        fn failing() -> Self {
            Self {
                error: Some(|| PipelineError::Inference("alignment blew up".to_string())),
            }
        }
    }

    #[async_trait]
    impl Align for StubAligner {
        async fn align(
            &self,
            segments: &[Segment],
            _language: &str,
            _audio: &AudioResource,
        ) -> Result<Vec<Segment>, PipelineError> {
            if let Some(make_err) = self.error {
                return Err(make_err());
            }
            Ok(segments
                .iter()
                .map(|s| {
                    let mut s = s.clone();
                    s.words = Some(vec![Word {
                        text: s.text.clone(),
                        start: s.start,
                        end: s.end,
                        score: Some(1.0),
                        speaker: None,
                        chars: None,
                    }]);
                    s
                })
                .collect())
        }
    }

    struct StubDiarizer {
        intervals: Vec<DiarizationInterval>,
        calls: AtomicUsize,
        fail: bool,
    }

    impl StubDiarizer {
        fn ok(intervals: Vec<DiarizationInterval>) -> Self {
            Self {
                intervals,
                calls: AtomicUsize::new(0),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                intervals: Vec::new(),
                calls: AtomicUsize::new(0),
                fail: true,
            }
        }
    }

    #[async_trait]
    impl Diarize for StubDiarizer {
        async fn diarize(
            &self,
            _audio: &AudioResource,
        ) -> Result<Vec<DiarizationInterval>, PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(PipelineError::Inference("diarization blew up".to_string()));
            }
            Ok(self.intervals.clone())
        }
    }

    fn options(diarize: bool) -> TranscribeOptions {
        TranscribeOptions {
            audio_url: "http://example.com/audio.wav".to_string(),
            language_hint: Some("en".to_string()),
            diarize,
        }
    }

    fn two_segments() -> Vec<Segment> {
        vec![
            Segment::new(0.0, 2.0, "hello there"),
            Segment::new(2.0, 6.0, "general remarks"),
        ]
    }

    fn orchestrator(
        fetcher: Arc<dyn FetchAudio>,
        transcriber: Arc<dyn Transcribe>,
        aligner: Arc<dyn Align>,
        diarizer: Option<Arc<dyn Diarize>>,
        policy: AlignmentFailurePolicy,
    ) -> PipelineOrchestrator {
        PipelineOrchestrator::new(fetcher, transcriber, aligner, diarizer, policy)
    }

    #[tokio::test]
    async fn test_full_pipeline_with_diarization() {
        let fetcher = Arc::new(StubFetcher::new());
        let diarizer = Arc::new(StubDiarizer::ok(vec![
            DiarizationInterval::new(0.0, 5.0, "SPEAKER_00"),
            DiarizationInterval::new(5.0, 10.0, "SPEAKER_01"),
        ]));
        let orch = orchestrator(
            fetcher.clone(),
            Arc::new(StubTranscriber::ok(two_segments(), "en")),
            Arc::new(StubAligner::ok()),
            Some(diarizer.clone()),
            AlignmentFailurePolicy::Degrade,
        );

        let result = orch.run(&options(true)).await.unwrap();

        assert_eq!(result.text, "hello there general remarks");
        assert_eq!(result.language, "en");
        assert_eq!(result.duration, 6.0);
        // Segment [0,2] overlaps only SPEAKER_00; [2,6] overlaps it by 3s
        // vs 1s for SPEAKER_01.
        assert_eq!(result.segments[0].speaker.as_deref(), Some("SPEAKER_00"));
        assert_eq!(result.segments[1].speaker.as_deref(), Some("SPEAKER_00"));
        assert!(result.segments[0].words.is_some());
        assert_eq!(diarizer.calls.load(Ordering::SeqCst), 1);

        // Temp storage reclaimed after the run.
        let path = fetcher.last_temp_path.lock().unwrap().clone().unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_disabled_diarization_skips_both_stages() {
        let diarizer = Arc::new(StubDiarizer::ok(vec![DiarizationInterval::new(
            0.0, 10.0, "A",
        )]));
        let orch = orchestrator(
            Arc::new(StubFetcher::new()),
            Arc::new(StubTranscriber::ok(two_segments(), "en")),
            Arc::new(StubAligner::ok()),
            Some(diarizer.clone()),
            AlignmentFailurePolicy::Degrade,
        );

        let result = orch.run(&options(false)).await.unwrap();

        assert_eq!(diarizer.calls.load(Ordering::SeqCst), 0);
        for segment in &result.segments {
            assert!(segment.speaker.is_none());
            for word in segment.words.as_ref().unwrap() {
                assert!(word.speaker.is_none());
            }
        }
    }

    #[tokio::test]
    async fn test_diarization_without_credential_fails_before_fetch() {
        let fetcher = Arc::new(StubFetcher::new());
        let orch = orchestrator(
            fetcher.clone(),
            Arc::new(StubTranscriber::ok(two_segments(), "en")),
            Arc::new(StubAligner::ok()),
            None,
            AlignmentFailurePolicy::Degrade,
        );

        let err = orch.run(&options(true)).await.unwrap_err();
        assert!(matches!(err, PipelineError::DiarizationConfig(_)));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fetch_failure_propagates() {
        let orch = orchestrator(
            Arc::new(FailingFetcher),
            Arc::new(StubTranscriber::ok(two_segments(), "en")),
            Arc::new(StubAligner::ok()),
            None,
            AlignmentFailurePolicy::Degrade,
        );

        let err = orch.run(&options(false)).await.unwrap_err();
        match err {
            PipelineError::Fetch(msg) => assert!(msg.contains("404")),
            other => panic!("expected Fetch error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_resource_released_on_every_failing_stage() {
        // Inject a failure at each post-fetch stage and verify the temp
        // resource is reclaimed on the failure path too.
        let failing_setups: Vec<(
            Arc<dyn Transcribe>,
            Arc<dyn Align>,
            Option<Arc<dyn Diarize>>,
        )> = vec![
            // Transcription fails.
            (
                Arc::new(StubTranscriber::failing()),
                Arc::new(StubAligner::ok()),
                Some(Arc::new(StubDiarizer::ok(Vec::new()))),
            ),
            // Alignment fails hard (not a language gap).
            (
                Arc::new(StubTranscriber::ok(two_segments(), "en")),
                Arc::new(StubAligner::failing()),
                Some(Arc::new(StubDiarizer::ok(Vec::new()))),
            ),
            // Diarization fails.
            (
                Arc::new(StubTranscriber::ok(two_segments(), "en")),
                Arc::new(StubAligner::ok()),
                Some(Arc::new(StubDiarizer::failing())),
            ),
        ];

        for (transcriber, aligner, diarizer) in failing_setups {
            let fetcher = Arc::new(StubFetcher::new());
            let orch = orchestrator(
                fetcher.clone(),
                transcriber,
                aligner,
                diarizer,
                AlignmentFailurePolicy::Degrade,
            );

            let result = orch.run(&options(true)).await;
            assert!(result.is_err());

            let path = fetcher.last_temp_path.lock().unwrap().clone().unwrap();
            assert!(!path.exists(), "temp audio leaked on a failure path");
        }
    }

    #[tokio::test]
    async fn test_unsupported_language_degrades_when_configured() {
        let orch = orchestrator(
            Arc::new(StubFetcher::new()),
            Arc::new(StubTranscriber::ok(two_segments(), "xx")),
            Arc::new(StubAligner::unsupported()),
            None,
            AlignmentFailurePolicy::Degrade,
        );

        let result = orch.run(&options(false)).await.unwrap();
        // Segment-level results survive, without word timestamps.
        assert_eq!(result.segments.len(), 2);
        assert!(result.segments[0].words.is_none());
        assert_eq!(result.text, "hello there general remarks");
    }

    #[tokio::test]
    async fn test_unsupported_language_fatal_when_configured() {
        let fetcher = Arc::new(StubFetcher::new());
        let orch = orchestrator(
            fetcher.clone(),
            Arc::new(StubTranscriber::ok(two_segments(), "xx")),
            Arc::new(StubAligner::unsupported()),
            None,
            AlignmentFailurePolicy::Fatal,
        );

        let err = orch.run(&options(false)).await.unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedLanguage(_)));

        let path = fetcher.last_temp_path.lock().unwrap().clone().unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_empty_segments_yield_empty_transcript() {
        let orch = orchestrator(
            Arc::new(StubFetcher::new()),
            Arc::new(StubTranscriber::ok(Vec::new(), "en")),
            Arc::new(StubAligner::ok()),
            None,
            AlignmentFailurePolicy::Degrade,
        );

        let result = orch.run(&options(false)).await.unwrap();
        assert_eq!(result.text, "");
        assert!(result.segments.is_empty());
        assert_eq!(result.duration, 0.0);
        assert_eq!(result.language, "en");
    }

    #[tokio::test]
    async fn test_segments_stay_sorted_through_assignment() {
        let orch = orchestrator(
            Arc::new(StubFetcher::new()),
            Arc::new(StubTranscriber::ok(
                vec![
                    Segment::new(0.0, 1.0, "a"),
                    Segment::new(1.0, 2.5, "b"),
                    Segment::new(2.5, 4.0, "c"),
                ],
                "en",
            )),
            Arc::new(StubAligner::ok()),
            Some(Arc::new(StubDiarizer::ok(vec![DiarizationInterval::new(
                0.0, 4.0, "A",
            )]))),
            AlignmentFailurePolicy::Degrade,
        );

        let result = orch.run(&options(true)).await.unwrap();
        let starts: Vec<f64> = result.segments.iter().map(|s| s.start).collect();
        let mut sorted = starts.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        assert_eq!(starts, sorted);
        assert_eq!(result.text, "a b c");
        assert_eq!(result.duration, 4.0);
    }
}
