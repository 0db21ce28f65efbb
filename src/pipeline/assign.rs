//! # Speaker Assignment
//!
//! Merges diarization intervals onto aligned segments and words. This is a
//! pure, stateless pass over two start-sorted sequences: for every segment
//! (and every word inside it) we pick the speaker of the diarization
//! interval with maximal temporal overlap.
//!
//! ## Rules:
//! - Maximal overlap wins.
//! - Equal overlap resolves to the interval with the earlier `start` (the
//!   first speaker to begin talking owns the ambiguous boundary).
//! - Zero overlap leaves the speaker unset; we never guess.
//!
//! Both inputs are sorted by `start`, so the merge runs as a single
//! coordinated sweep: a cursor into the interval list only moves forward as
//! segments advance, instead of rescanning all intervals per segment.
//! Overlapping intervals (simultaneous speech) are handled by the same
//! maximal-overlap rule; that is a known simplification of the speaker
//! model, not a guarantee of correctness for crosstalk.

use crate::pipeline::types::{DiarizationInterval, Segment};

/// Assign speaker labels to segments and their words.
///
/// `intervals` and `segments` must both be sorted by `start`; the
/// diarization stage and the recognition stage guarantee that for their
/// outputs. Returns the segments with `speaker` filled in wherever some
/// interval overlapped.
pub fn assign_speakers(
    intervals: &[DiarizationInterval],
    mut segments: Vec<Segment>,
) -> Vec<Segment> {
    let mut cursor = 0usize;

    for segment in &mut segments {
        // Intervals that end at or before this segment's start can never
        // overlap this segment nor any later one (segment starts are
        // non-decreasing), so the cursor is safe to advance past them.
        while cursor < intervals.len() && intervals[cursor].end <= segment.start {
            cursor += 1;
        }

        segment.speaker = dominant_speaker(&intervals[cursor..], segment.start, segment.end);

        if let Some(words) = segment.words.as_mut() {
            // Words are sorted within the segment; they all live inside the
            // segment span, so the same remaining slice covers them.
            for word in words.iter_mut() {
                word.speaker = dominant_speaker(&intervals[cursor..], word.start, word.end);
            }
        }
    }

    segments
}

/// Find the speaker whose interval overlaps `[start, end]` the most.
///
/// `intervals` must be sorted by interval start. Scanning stops at the
/// first interval starting at or after `end`; because of the sort order,
/// nothing past that point can overlap. Ties keep the first candidate
/// seen, which is the earliest-starting interval.
fn dominant_speaker(intervals: &[DiarizationInterval], start: f64, end: f64) -> Option<String> {
    let mut best: Option<(&str, f64)> = None;

    for interval in intervals {
        if interval.start >= end {
            break;
        }
        let overlap = interval.end.min(end) - interval.start.max(start);
        if overlap <= 0.0 {
            continue;
        }
        match best {
            Some((_, best_overlap)) if overlap <= best_overlap => {}
            _ => best = Some((interval.speaker.as_str(), overlap)),
        }
    }

    best.map(|(speaker, _)| speaker.to_string())
}
