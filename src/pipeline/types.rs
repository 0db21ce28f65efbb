//! # Transcript Data Model
//!
//! Shared types flowing between the pipeline stages: coarse segments from
//! the recognition pass, word timestamps from alignment, speaker intervals
//! from diarization, and the assembled transcript returned to the caller.
//!
//! ## Ordering invariants:
//! - Segments within one transcript are sorted by non-decreasing `start`.
//! - Words within a segment are sorted the same way and nest inside their
//!   parent segment's time span (with a small tolerance for alignment slack).
//! - Diarization intervals are sorted by `start`; intervals for one speaker
//!   need not be contiguous and may, rarely, overlap across speakers.

use serde::{Deserialize, Serialize};

/// A coarse transcript segment produced by the recognition pass.
///
/// `speaker` is filled in by the speaker assignment stage when diarization
/// is enabled; `words` is filled in by the alignment stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    /// Segment start, seconds from the beginning of the audio.
    pub start: f64,

    /// Segment end, seconds. Always >= `start`.
    pub end: f64,

    /// Transcribed text for this time span.
    pub text: String,

    /// Speaker label from diarization, when one overlapped this span.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,

    /// Word-level timestamps from the alignment pass.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub words: Option<Vec<Word>>,
}

impl Segment {
    pub fn new(start: f64, end: f64, text: impl Into<String>) -> Self {
        Self {
            start,
            end,
            text: text.into(),
            speaker: None,
            words: None,
        }
    }
}

/// A single word with refined timing, nested within a segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Word {
    /// The word text. Serialized as `word` on the wire.
    #[serde(rename = "word")]
    pub text: String,

    pub start: f64,

    pub end: f64,

    /// Alignment confidence in [0, 1], when the aligner produces one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,

    /// Character-level spans, only present when character alignment is
    /// explicitly enabled (off by default as a latency trade-off).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chars: Option<Vec<CharSpan>>,
}

/// Timing for a single character inside an aligned word.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharSpan {
    #[serde(rename = "char")]
    pub text: String,
    pub start: f64,
    pub end: f64,
}

/// A span of audio attributed to one speaker by the diarization stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiarizationInterval {
    pub start: f64,
    pub end: f64,
    pub speaker: String,
}

impl DiarizationInterval {
    pub fn new(start: f64, end: f64, speaker: impl Into<String>) -> Self {
        Self {
            start,
            end,
            speaker: speaker.into(),
        }
    }
}

/// The final assembled transcript for one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptResult {
    /// Space-joined concatenation of segment texts, in segment order.
    pub text: String,

    pub segments: Vec<Segment>,

    /// Language actually detected/used by the recognition stage. This is
    /// not an echo of the request hint.
    pub language: String,

    /// End time of the last segment, or 0.0 when no segments were produced.
    pub duration: f64,
}

impl TranscriptResult {
    /// Assemble the final result from ordered segments.
    ///
    /// `text` is the space-joined concatenation of trimmed segment texts and
    /// `duration` is the end of the last segment (0.0 for empty transcripts,
    /// the silent-audio case).
    pub fn assemble(segments: Vec<Segment>, language: String) -> Self {
        let text = segments
            .iter()
            .map(|s| s.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        let duration = segments.last().map(|s| s.end).unwrap_or(0.0);
        Self {
            text,
            segments,
            language,
            duration,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assemble_joins_text_in_order() {
        let segments = vec![
            Segment::new(0.0, 1.5, " Hello there."),
            Segment::new(1.5, 3.0, "How are you?"),
        ];
        let result = TranscriptResult::assemble(segments, "en".to_string());
        assert_eq!(result.text, "Hello there. How are you?");
        assert_eq!(result.duration, 3.0);
        assert_eq!(result.language, "en");
    }

    #[test]
    fn test_assemble_empty_segments() {
        let result = TranscriptResult::assemble(Vec::new(), "en".to_string());
        assert_eq!(result.text, "");
        assert!(result.segments.is_empty());
        assert_eq!(result.duration, 0.0);
    }

    #[test]
    fn test_speaker_omitted_when_unset() {
        let segment = Segment::new(0.0, 1.0, "hi");
        let json = serde_json::to_value(&segment).unwrap();
        assert!(json.get("speaker").is_none());
        assert!(json.get("words").is_none());
    }

    #[test]
    fn test_word_wire_name() {
        let word = Word {
            text: "hello".to_string(),
            start: 0.0,
            end: 0.4,
            score: Some(0.9),
            speaker: None,
            chars: None,
        };
        let json = serde_json::to_value(&word).unwrap();
        assert_eq!(json["word"], "hello");
    }
}
