//! WebVTT caption parsing.
//!
//! Parses VTT caption files into transcript segments matching the
//! transcription schema. YouTube auto-captions often carry overlapping cues
//! where text is revealed incrementally; those are merged into clean,
//! non-overlapping segments.

use crate::models::TranscriptSegment;
use regex::Regex;
use std::sync::OnceLock;
use tracing::debug;

fn timestamp_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(\d{1,2}:)?(\d{2}):(\d{2}[.,]\d{3})\s*-->\s*(\d{1,2}:)?(\d{2}):(\d{2}[.,]\d{3})",
        )
        .expect("valid VTT timestamp regex")
    })
}

fn tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<[^>]+>").expect("valid tag regex"))
}

/// Parse a `HH:MM:SS.mmm` or `MM:SS.mmm` timestamp to seconds.
/// A comma is accepted in place of the dot.
pub fn parse_vtt_timestamp(raw: &str) -> Option<f64> {
    let cleaned = raw.trim().replace(',', ".");
    let parts: Vec<&str> = cleaned.split(':').collect();
    match parts.len() {
        3 => {
            let hours: f64 = parts[0].parse().ok()?;
            let minutes: f64 = parts[1].parse().ok()?;
            let seconds: f64 = parts[2].parse().ok()?;
            Some(hours * 3600.0 + minutes * 60.0 + seconds)
        }
        2 => {
            let minutes: f64 = parts[0].parse().ok()?;
            let seconds: f64 = parts[1].parse().ok()?;
            Some(minutes * 60.0 + seconds)
        }
        1 => parts[0].parse().ok(),
        _ => None,
    }
}

/// Strip inline tags and collapse whitespace in cue text.
fn clean_cue_text(text: &str) -> String {
    let without_tags = tag_regex().replace_all(text, "");
    without_tags.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Parse raw VTT content into merged transcript segments.
pub fn parse_vtt(content: &str) -> Vec<TranscriptSegment> {
    let lines: Vec<&str> = content.lines().collect();
    let mut segments = Vec::new();

    let mut current_start: Option<f64> = None;
    let mut current_end: f64 = 0.0;
    let mut current_text: Vec<String> = Vec::new();

    let mut flush = |start: &mut Option<f64>, end: f64, text: &mut Vec<String>| {
        if let Some(s) = start.take() {
            let cleaned = clean_cue_text(&text.join(" "));
            if !cleaned.is_empty() {
                segments.push(TranscriptSegment::new(s, end, cleaned));
            }
        }
        text.clear();
    };

    for line in lines {
        let trimmed = line.trim();

        // Header and metadata lines
        if trimmed.starts_with("WEBVTT")
            || trimmed.starts_with("Kind:")
            || trimmed.starts_with("Language:")
        {
            continue;
        }

        // Blank lines, bare cue numbers, and NOTE blocks end the current cue.
        if trimmed.is_empty()
            || trimmed.chars().all(|c| c.is_ascii_digit())
            || trimmed.starts_with("NOTE")
        {
            flush(&mut current_start, current_end, &mut current_text);
            continue;
        }

        if timestamp_line_regex().is_match(trimmed) {
            flush(&mut current_start, current_end, &mut current_text);

            let parts: Vec<&str> = trimmed.split("-->").collect();
            if parts.len() == 2 {
                let start_raw = parts[0].trim().split_whitespace().next().unwrap_or("");
                // Style metadata may follow the end timestamp
                let end_raw = parts[1].trim().split_whitespace().next().unwrap_or("");
                if let (Some(start), Some(end)) =
                    (parse_vtt_timestamp(start_raw), parse_vtt_timestamp(end_raw))
                {
                    current_start = Some(start);
                    current_end = end;
                }
            }
            continue;
        }

        if current_start.is_some() {
            current_text.push(trimmed.to_string());
        }
    }

    flush(&mut current_start, current_end, &mut current_text);

    let merged = merge_overlapping_segments(segments);
    debug!("Parsed VTT into {} merged segments", merged.len());
    merged
}

/// First `n` characters of a string, respecting char boundaries.
fn char_prefix(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Merge overlapping or near-duplicate cues.
///
/// Two cues merge when their start times are within 0.5s AND one text is a
/// prefix/superset of the other; the longer text wins and the end extends.
pub fn merge_overlapping_segments(mut segments: Vec<TranscriptSegment>) -> Vec<TranscriptSegment> {
    if segments.is_empty() {
        return segments;
    }

    segments.sort_by(|a, b| {
        a.start
            .partial_cmp(&b.start)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.end.partial_cmp(&b.end).unwrap_or(std::cmp::Ordering::Equal))
    });

    let mut merged: Vec<TranscriptSegment> = Vec::with_capacity(segments.len());
    let mut current = segments.remove(0);

    for segment in segments {
        let time_overlap = (segment.start - current.start).abs() < 0.5;

        let current_lower = current.text.to_lowercase();
        let new_lower = segment.text.to_lowercase();
        let text_overlap = new_lower.starts_with(char_prefix(&current_lower, 20))
            || current_lower.starts_with(char_prefix(&new_lower, 20))
            || current_lower.contains(&new_lower)
            || new_lower.contains(&current_lower);

        if time_overlap && text_overlap {
            if segment.text.len() > current.text.len() {
                current.text = segment.text;
            }
            current.end = current.end.max(segment.end);
        } else {
            merged.push(current);
            current = segment;
        }
    }
    merged.push(current);

    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE_VTT: &str = "\
WEBVTT
Kind: captions
Language: en

00:00:00.000 --> 00:00:02.500
Hello world

00:00:02.500 --> 00:00:05.000
this is a test
";

    #[test]
    fn test_parse_simple_vtt() {
        let segments = parse_vtt(SIMPLE_VTT);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].text, "Hello world");
        assert_eq!(segments[0].start, 0.0);
        assert_eq!(segments[0].end, 2.5);
        assert_eq!(segments[1].text, "this is a test");
    }

    #[test]
    fn test_parse_timestamp_forms() {
        assert_eq!(parse_vtt_timestamp("00:01:23.456"), Some(83.456));
        assert_eq!(parse_vtt_timestamp("01:23.456"), Some(83.456));
        // Comma accepted in place of the dot
        assert_eq!(parse_vtt_timestamp("00:01:23,456"), Some(83.456));
    }

    #[test]
    fn test_strips_inline_tags() {
        let vtt = "\
WEBVTT

00:00.000 --> 00:02.000
<c>Hello</c> <00:00:01.000>there
";
        let segments = parse_vtt(vtt);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].text, "Hello there");
    }

    #[test]
    fn test_skips_cue_numbers_and_notes() {
        let vtt = "\
WEBVTT

1
00:00.000 --> 00:02.000
First cue

NOTE this is a comment

2
00:02.000 --> 00:04.000
Second cue
";
        let segments = parse_vtt(vtt);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].text, "First cue");
        assert_eq!(segments[1].text, "Second cue");
    }

    #[test]
    fn test_merges_incremental_reveal() {
        // YouTube-style incremental captions: same start, growing text.
        let vtt = "\
WEBVTT

00:00:00.000 --> 00:00:01.500
so today

00:00:00.200 --> 00:00:03.000
so today we are going to talk
";
        let segments = parse_vtt(vtt);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].text, "so today we are going to talk");
        assert_eq!(segments[0].end, 3.0);
    }

    #[test]
    fn test_distinct_cues_stay_separate() {
        let vtt = "\
WEBVTT

00:00:00.000 --> 00:00:02.000
completely different opening

00:00:05.000 --> 00:00:07.000
another topic entirely
";
        let segments = parse_vtt(vtt);
        assert_eq!(segments.len(), 2);
    }

    #[test]
    fn test_parsed_segments_are_monotonic() {
        let segments = parse_vtt(SIMPLE_VTT);
        for pair in segments.windows(2) {
            assert!(pair[0].start <= pair[1].start);
        }
        for segment in &segments {
            assert!(segment.end >= segment.start);
        }
    }

    #[test]
    fn test_empty_input() {
        assert!(parse_vtt("").is_empty());
        assert!(parse_vtt("WEBVTT\n").is_empty());
    }
}
