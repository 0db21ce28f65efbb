//! # Forced Alignment
//!
//! Refines coarse segment timing to word-level timestamps. The alignment
//! model is keyed by the language the recognition pass actually detected,
//! never the request hint. Languages without an alignment profile
//! fail with [`PipelineError::UnsupportedLanguage`]; the orchestrator
//! decides whether that degrades or aborts the request.
//!
//! The backend distributes each segment's words over its voiced audio:
//! frame energies are computed over the segment span, an energy-weighted
//! cumulative distribution maps word boundaries onto time, and word spans
//! are clamped to the parent segment. Word spans therefore nest inside
//! their segment and stay sorted by construction.
//!
//! Character-level alignment is available behind `models.char_alignments`
//! and is off by default; words are the useful granularity and characters
//! roughly double the output size.

use crate::error::PipelineError;
use crate::pipeline::fetch::{AudioResource, SAMPLE_RATE};
use crate::pipeline::types::{CharSpan, Segment, Word};
use async_trait::async_trait;
use tracing::debug;

/// Frame length used for energy analysis: 20 ms at 16 kHz.
const FRAME_LEN: usize = 320;

/// Languages with an alignment profile. Tokenization here is
/// whitespace-based, so languages written without word separators are not
/// alignable and fall out of this set.
const SUPPORTED_LANGUAGES: &[&str] = &[
    "en", "fr", "de", "es", "it", "pt", "nl", "uk", "ru", "pl", "cs", "ar", "el", "tr", "da",
    "he", "fa", "hu", "fi", "vi", "ko", "ur", "hi", "te", "ca", "sv", "no", "ro", "sk", "sl",
    "hr", "id", "ms", "eu", "gl",
];

/// The alignment seam of the pipeline.
#[async_trait]
pub trait Align: Send + Sync {
    /// Produce word timestamps for every segment. Takes segments by
    /// reference so callers can fall back to the unaligned originals when
    /// alignment is unavailable for the language.
    async fn align(
        &self,
        segments: &[Segment],
        language: &str,
        audio: &AudioResource,
    ) -> Result<Vec<Segment>, PipelineError>;
}

/// Energy-guided word aligner.
pub struct EnergyAligner {
    char_alignments: bool,
}

impl EnergyAligner {
    pub fn new(char_alignments: bool) -> Self {
        Self { char_alignments }
    }

    /// Whether an alignment profile exists for `language`.
    pub fn supports(language: &str) -> bool {
        SUPPORTED_LANGUAGES.contains(&language)
    }
}

#[async_trait]
impl Align for EnergyAligner {
    async fn align(
        &self,
        segments: &[Segment],
        language: &str,
        audio: &AudioResource,
    ) -> Result<Vec<Segment>, PipelineError> {
        if !Self::supports(language) {
            return Err(PipelineError::UnsupportedLanguage(language.to_string()));
        }

        let samples = audio.samples();
        let mut aligned = Vec::with_capacity(segments.len());

        for segment in segments {
            let mut segment = segment.clone();
            let words = align_segment_words(&segment, samples, self.char_alignments);
            segment.words = Some(words);
            aligned.push(segment);
        }

        debug!(
            segments = aligned.len(),
            language = %language,
            "Alignment pass complete"
        );
        Ok(aligned)
    }
}

/// Distribute a segment's words over its span, weighted by where the
/// acoustic energy actually is.
fn align_segment_words(segment: &Segment, samples: &[f32], char_alignments: bool) -> Vec<Word> {
    let words: Vec<&str> = segment.text.split_whitespace().collect();
    if words.is_empty() {
        return Vec::new();
    }

    let span_start = ((segment.start * SAMPLE_RATE as f64) as usize).min(samples.len());
    let span_end = ((segment.end * SAMPLE_RATE as f64) as usize).min(samples.len());
    let energies = frame_energies(&samples[span_start..span_end]);

    // Cumulative energy distribution over the segment's frames. A small
    // floor keeps silent segments well-defined (degrades to a uniform
    // distribution over time).
    let floor = 1e-6f64;
    let total_energy: f64 = energies.iter().map(|&e| e as f64 + floor).sum();
    let cumulative: Vec<f64> = energies
        .iter()
        .scan(0.0f64, |acc, &e| {
            *acc += e as f64 + floor;
            Some(*acc / total_energy)
        })
        .collect();

    // Word k owns the energy-mass slice proportional to its share of the
    // segment's characters.
    let char_total: usize = words.iter().map(|w| w.chars().count()).sum();
    let span_secs = segment.end - segment.start;
    let mean_energy = if energies.is_empty() {
        0.0
    } else {
        energies.iter().sum::<f32>() as f64 / energies.len() as f64
    };

    let mut out = Vec::with_capacity(words.len());
    let mut consumed_chars = 0usize;
    for word in &words {
        let chars = word.chars().count();
        let lo = consumed_chars as f64 / char_total as f64;
        consumed_chars += chars;
        let hi = consumed_chars as f64 / char_total as f64;

        let start = segment.start + mass_to_time(&cumulative, lo) * span_secs;
        let end = segment.start + mass_to_time(&cumulative, hi) * span_secs;
        let end = end.max(start).min(segment.end);

        let score = word_score(&energies, mean_energy, lo, hi);
        let chars_out = char_alignments.then(|| char_spans(word, start, end));

        out.push(Word {
            text: (*word).to_string(),
            start,
            end,
            score: Some(score),
            speaker: None,
            chars: chars_out,
        });
    }

    out
}

/// Map a cumulative-energy fraction to a time fraction of the span via the
/// inverse of the cumulative distribution. Returns a value in [0, 1].
fn mass_to_time(cumulative: &[f64], mass: f64) -> f64 {
    if cumulative.is_empty() {
        return mass.clamp(0.0, 1.0);
    }
    let idx = cumulative.partition_point(|&c| c < mass);
    idx as f64 / cumulative.len() as f64
}

/// RMS energy per fixed-length frame.
fn frame_energies(samples: &[f32]) -> Vec<f32> {
    samples
        .chunks(FRAME_LEN)
        .map(|frame| {
            let sum_sq: f32 = frame.iter().map(|&s| s * s).sum();
            (sum_sq / frame.len() as f32).sqrt()
        })
        .collect()
}

/// Confidence heuristic: how much of the word's energy-mass slice sits on
/// frames above the segment's mean energy.
fn word_score(energies: &[f32], mean_energy: f64, lo: f64, hi: f64) -> f64 {
    if energies.is_empty() || hi <= lo {
        return 0.0;
    }
    let from = (lo * energies.len() as f64) as usize;
    let to = ((hi * energies.len() as f64) as usize).min(energies.len());
    if to <= from {
        return 0.0;
    }
    let voiced = energies[from..to]
        .iter()
        .filter(|&&e| e as f64 >= mean_energy)
        .count();
    voiced as f64 / (to - from) as f64
}

/// Uniform per-character spans inside an aligned word.
fn char_spans(word: &str, start: f64, end: f64) -> Vec<CharSpan> {
    let chars: Vec<char> = word.chars().collect();
    let step = (end - start) / chars.len() as f64;
    chars
        .iter()
        .enumerate()
        .map(|(i, &c)| CharSpan {
            text: c.to_string(),
            start: start + step * i as f64,
            end: start + step * (i + 1) as f64,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone_audio(secs: f64) -> AudioResource {
        let n = (secs * SAMPLE_RATE as f64) as usize;
        let samples = (0..n)
            .map(|i| (i as f32 * 0.05).sin() * 0.5)
            .collect::<Vec<_>>();
        AudioResource::from_samples(samples, SAMPLE_RATE)
    }

    #[tokio::test]
    async fn test_unsupported_language_errors() {
        let aligner = EnergyAligner::new(false);
        let audio = tone_audio(2.0);
        let segments = vec![Segment::new(0.0, 2.0, "hello")];

        let err = aligner.align(&segments, "ja", &audio).await.unwrap_err();
        match err {
            PipelineError::UnsupportedLanguage(lang) => assert_eq!(lang, "ja"),
            other => panic!("expected UnsupportedLanguage, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_words_nest_inside_segment_and_stay_sorted() {
        let aligner = EnergyAligner::new(false);
        let audio = tone_audio(4.0);
        let segments = vec![Segment::new(0.5, 3.5, "the quick brown fox jumps")];

        let aligned = aligner.align(&segments, "en", &audio).await.unwrap();
        let words = aligned[0].words.as_ref().unwrap();
        assert_eq!(words.len(), 5);

        let mut prev_start = f64::MIN;
        for word in words {
            assert!(word.start >= 0.5 - 1e-9);
            assert!(word.end <= 3.5 + 1e-9);
            assert!(word.start <= word.end);
            assert!(word.start >= prev_start);
            assert!(word.chars.is_none());
            prev_start = word.start;
        }
    }

    #[tokio::test]
    async fn test_empty_text_yields_no_words() {
        let aligner = EnergyAligner::new(false);
        let audio = tone_audio(1.0);
        let segments = vec![Segment::new(0.0, 1.0, "   ")];

        let aligned = aligner.align(&segments, "en", &audio).await.unwrap();
        assert!(aligned[0].words.as_ref().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_silent_audio_degrades_to_uniform_spread() {
        let aligner = EnergyAligner::new(false);
        let audio = AudioResource::from_samples(vec![0.0; SAMPLE_RATE as usize * 2], SAMPLE_RATE);
        let segments = vec![Segment::new(0.0, 2.0, "one two")];

        let aligned = aligner.align(&segments, "en", &audio).await.unwrap();
        let words = aligned[0].words.as_ref().unwrap();
        assert_eq!(words.len(), 2);
        // Equal character counts split the span near the middle.
        assert!((words[0].end - 1.0).abs() < 0.1);
    }

    #[tokio::test]
    async fn test_char_alignments_opt_in() {
        let aligner = EnergyAligner::new(true);
        let audio = tone_audio(2.0);
        let segments = vec![Segment::new(0.0, 2.0, "hi")];

        let aligned = aligner.align(&segments, "en", &audio).await.unwrap();
        let words = aligned[0].words.as_ref().unwrap();
        let chars = words[0].chars.as_ref().unwrap();
        assert_eq!(chars.len(), 2);
        assert!(chars[0].start >= words[0].start - 1e-9);
        assert!(chars[1].end <= words[0].end + 1e-9);
    }

    #[test]
    fn test_supports_table() {
        assert!(EnergyAligner::supports("en"));
        assert!(EnergyAligner::supports("uk"));
        assert!(!EnergyAligner::supports("ja"));
        assert!(!EnergyAligner::supports("zz"));
    }
}
