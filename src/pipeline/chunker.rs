//! Token-aware semantic chunking of transcripts.
//!
//! Splits an ordered segment sequence into chunks bounded by token count and
//! wall-clock duration, cutting at natural boundaries (sentence ends, speaker
//! changes), grouping by source chapters when present, and prepending a
//! sentence-aligned overlap to each chunk after the first in a group.

use crate::config::ChunkingSettings;
use crate::error::{Result, ViskaError};
use crate::models::{Chapter, TranscriptSegment};

/// A chunk produced by the chunker, prior to enrichment and persistence.
#[derive(Debug, Clone)]
pub struct TranscriptChunk {
    pub text: String,
    pub start_timestamp: f64,
    pub end_timestamp: f64,
    pub token_count: u32,
    pub speakers: Vec<String>,
    pub chapter_title: Option<String>,
    pub chapter_index: Option<u32>,
    pub chunk_index: u32,
}

/// Approximate token count: whitespace word count scaled by 1.3.
pub fn count_tokens(text: &str) -> u32 {
    (text.split_whitespace().count() as f64 * 1.3) as u32
}

const ABBREVIATIONS: [&str; 12] = [
    "dr", "mr", "mrs", "ms", "prof", "sr", "jr", "st", "vs", "etc", "e.g", "i.e",
];

/// Split text into sentences on `.!?` followed by whitespace and a capital
/// letter, skipping abbreviations and decimal numbers.
pub fn split_sentences(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut sentences = Vec::new();
    let mut start = 0usize;
    let mut i = 0usize;

    while i < chars.len() {
        let c = chars[i];
        if c == '.' || c == '!' || c == '?' {
            // Decimal number: digit on both sides of the dot
            if c == '.'
                && i > 0
                && i + 1 < chars.len()
                && chars[i - 1].is_ascii_digit()
                && chars[i + 1].is_ascii_digit()
            {
                i += 1;
                continue;
            }

            // Abbreviation: the word right before the dot
            if c == '.' {
                let mut w = i;
                while w > 0 && (chars[w - 1].is_alphanumeric() || chars[w - 1] == '.') {
                    w -= 1;
                }
                let word: String = chars[w..i]
                    .iter()
                    .collect::<String>()
                    .to_lowercase()
                    .trim_end_matches('.')
                    .to_string();
                if ABBREVIATIONS.contains(&word.as_str()) {
                    i += 1;
                    continue;
                }
            }

            // Boundary: whitespace then a capital letter
            let mut k = i + 1;
            while k < chars.len() && chars[k].is_whitespace() {
                k += 1;
            }
            if k > i + 1 && k < chars.len() && chars[k].is_uppercase() {
                let sentence: String = chars[start..=i].iter().collect();
                let trimmed = sentence.trim();
                if !trimmed.is_empty() {
                    sentences.push(trimmed.to_string());
                }
                start = k;
                i = k;
                continue;
            }
        }
        i += 1;
    }

    let tail: String = chars[start..].iter().collect();
    let trimmed = tail.trim();
    if !trimmed.is_empty() {
        sentences.push(trimmed.to_string());
    }

    if sentences.is_empty() && !text.trim().is_empty() {
        sentences.push(text.trim().to_string());
    }
    sentences
}

fn ends_sentence(text: &str) -> bool {
    text.trim_end()
        .chars()
        .last()
        .map(|c| c == '.' || c == '!' || c == '?')
        .unwrap_or(false)
}

/// Transcript chunker.
pub struct Chunker {
    config: ChunkingSettings,
}

impl Chunker {
    pub fn new(config: &ChunkingSettings) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Chunk transcript segments, grouping by chapters when present.
    ///
    /// Each chapter yields its own chunk sequence with its own overlap; the
    /// chunk index is contiguous across the whole video.
    pub fn chunk_transcript(
        &self,
        segments: &[TranscriptSegment],
        chapters: Option<&[Chapter]>,
    ) -> Vec<TranscriptChunk> {
        if segments.is_empty() {
            return Vec::new();
        }

        let groups = group_by_chapter(segments, chapters);
        let mut all_chunks = Vec::new();
        let mut chunk_index = 0u32;

        for (chapter_index, chapter_title, group) in groups {
            if group.is_empty() {
                continue;
            }
            let mut chunks =
                self.chunk_group(&group, chunk_index, chapter_title, chapter_index);
            self.add_overlap(&mut chunks);
            chunk_index += chunks.len() as u32;
            all_chunks.extend(chunks);
        }

        all_chunks
    }

    /// Build a single chunk covering all segments. Used as a fallback for
    /// clips too short to produce any regular chunk.
    pub fn single_chunk(&self, segments: &[TranscriptSegment]) -> Option<TranscriptChunk> {
        if segments.is_empty() {
            return None;
        }
        Some(make_chunk(segments, 0, None, None))
    }

    fn chunk_group(
        &self,
        segments: &[TranscriptSegment],
        start_index: u32,
        chapter_title: Option<String>,
        chapter_index: Option<u32>,
    ) -> Vec<TranscriptChunk> {
        let mut chunks: Vec<TranscriptChunk> = Vec::new();
        let mut current: Vec<TranscriptSegment> = Vec::new();
        let mut current_tokens = 0u32;
        let mut index = start_index;

        for segment in segments {
            let segment_tokens = count_tokens(&segment.text);

            let would_exceed_tokens = current_tokens + segment_tokens > self.config.max_tokens;
            let would_exceed_duration = current
                .first()
                .map(|first| segment.end - first.start > self.config.max_duration_seconds as f64)
                .unwrap_or(false);

            let speaker_changed = match (current.last(), &segment.speaker) {
                (Some(last), Some(new_speaker)) => last
                    .speaker
                    .as_ref()
                    .map(|s| s != new_speaker)
                    .unwrap_or(false),
                _ => false,
            };

            let natural_boundary = current
                .last()
                .map(|last| ends_sentence(&last.text))
                .unwrap_or(false)
                || speaker_changed;

            let forced = would_exceed_tokens || would_exceed_duration;
            let should_cut = forced || (current_tokens >= self.config.target_tokens && natural_boundary);

            if should_cut && !current.is_empty() && current_tokens >= self.config.min_tokens {
                chunks.push(make_chunk(
                    &current,
                    index,
                    chapter_title.clone(),
                    chapter_index,
                ));
                index += 1;
                current.clear();
                current_tokens = 0;
            }

            current.push(segment.clone());
            current_tokens += segment_tokens;
        }

        // Leftover tail: its own chunk when big enough, else merged backward.
        if !current.is_empty() {
            if current_tokens >= self.config.min_tokens {
                chunks.push(make_chunk(&current, index, chapter_title, chapter_index));
            } else if let Some(last) = chunks.last_mut() {
                merge_into(last, &current);
            }
        }

        chunks
    }

    /// Prepend a tail-overlap to every chunk after the first: the previous
    /// chunk's last whole sentences totalling at most `overlap_tokens`.
    fn add_overlap(&self, chunks: &mut [TranscriptChunk]) {
        if chunks.len() <= 1 {
            return;
        }

        // Overlap sources come from pre-overlap text, so collect them first.
        let overlaps: Vec<String> = chunks
            .iter()
            .map(|c| extract_overlap(&c.text, self.config.overlap_tokens))
            .collect();

        for i in 1..chunks.len() {
            let overlap = &overlaps[i - 1];
            if overlap.is_empty() {
                continue;
            }
            let chunk = &mut chunks[i];
            chunk.text = format!("{} {}", overlap, chunk.text);
            chunk.token_count = count_tokens(&chunk.text);
        }
    }

    /// Assert the chunk invariants. Violations are fatal to the pipeline.
    pub fn validate(&self, chunks: &[TranscriptChunk]) -> Result<()> {
        for (i, chunk) in chunks.iter().enumerate() {
            if chunk.token_count < self.config.min_tokens {
                return Err(ViskaError::Chunking(format!(
                    "Chunk {} has {} tokens (min: {})",
                    i, chunk.token_count, self.config.min_tokens
                )));
            }
            // Overlap may legitimately push counts past max; allow 20%.
            let cap = (self.config.max_tokens as f64 * 1.2) as u32;
            if chunk.token_count > cap {
                return Err(ViskaError::Chunking(format!(
                    "Chunk {} has {} tokens (max: {})",
                    i, chunk.token_count, self.config.max_tokens
                )));
            }
            if chunk.start_timestamp >= chunk.end_timestamp {
                return Err(ViskaError::Chunking(format!(
                    "Chunk {} has invalid timestamps: {} >= {}",
                    i, chunk.start_timestamp, chunk.end_timestamp
                )));
            }
            if chunk.text.trim().is_empty() {
                return Err(ViskaError::Chunking(format!("Chunk {} has empty text", i)));
            }
        }
        Ok(())
    }
}

/// Build a chunk from accumulated segments.
fn make_chunk(
    segments: &[TranscriptSegment],
    chunk_index: u32,
    chapter_title: Option<String>,
    chapter_index: Option<u32>,
) -> TranscriptChunk {
    let text = segments
        .iter()
        .map(|s| s.text.trim())
        .collect::<Vec<_>>()
        .join(" ");

    let mut speakers: Vec<String> = Vec::new();
    for segment in segments {
        if let Some(speaker) = &segment.speaker {
            if !speakers.contains(speaker) {
                speakers.push(speaker.clone());
            }
        }
    }

    TranscriptChunk {
        token_count: count_tokens(&text),
        text,
        start_timestamp: segments[0].start,
        end_timestamp: segments[segments.len() - 1].end,
        speakers,
        chapter_title,
        chapter_index,
        chunk_index,
    }
}

/// Fold a too-small tail into the previous chunk.
fn merge_into(chunk: &mut TranscriptChunk, tail: &[TranscriptSegment]) {
    let tail_text = tail
        .iter()
        .map(|s| s.text.trim())
        .collect::<Vec<_>>()
        .join(" ");
    chunk.text = format!("{} {}", chunk.text, tail_text);
    chunk.token_count = count_tokens(&chunk.text);
    chunk.end_timestamp = tail[tail.len() - 1].end;
    for segment in tail {
        if let Some(speaker) = &segment.speaker {
            if !chunk.speakers.contains(speaker) {
                chunk.speakers.push(speaker.clone());
            }
        }
    }
}

/// Last whole sentences of `text` totalling at most `overlap_tokens`.
fn extract_overlap(text: &str, overlap_tokens: u32) -> String {
    let sentences = split_sentences(text);
    let mut picked: Vec<&str> = Vec::new();
    let mut tokens = 0u32;

    for sentence in sentences.iter().rev() {
        let sentence_tokens = count_tokens(sentence);
        if tokens + sentence_tokens <= overlap_tokens {
            picked.insert(0, sentence);
            tokens += sentence_tokens;
        } else {
            break;
        }
    }

    picked.join(" ")
}

/// Group segments into per-chapter runs; one run when no chapters exist.
fn group_by_chapter(
    segments: &[TranscriptSegment],
    chapters: Option<&[Chapter]>,
) -> Vec<(Option<u32>, Option<String>, Vec<TranscriptSegment>)> {
    let Some(chapters) = chapters.filter(|c| !c.is_empty()) else {
        return vec![(None, None, segments.to_vec())];
    };

    let mut groups = Vec::new();
    for (i, chapter) in chapters.iter().enumerate() {
        let end = if chapter.end_time > 0.0 {
            chapter.end_time
        } else {
            f64::INFINITY
        };
        let group: Vec<TranscriptSegment> = segments
            .iter()
            .filter(|s| s.start >= chapter.start_time && s.start < end)
            .cloned()
            .collect();
        if !group.is_empty() {
            groups.push((Some(i as u32), Some(chapter.title.clone()), group));
        }
    }

    if groups.is_empty() {
        return vec![(None, None, segments.to_vec())];
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> ChunkingSettings {
        ChunkingSettings {
            target_tokens: 50,
            min_tokens: 10,
            max_tokens: 100,
            overlap_tokens: 15,
            max_duration_seconds: 300,
        }
    }

    /// Segments of ~13 tokens each (10 words), ending with periods.
    fn make_segments(count: usize) -> Vec<TranscriptSegment> {
        (0..count)
            .map(|i| {
                TranscriptSegment::new(
                    i as f64 * 10.0,
                    (i + 1) as f64 * 10.0,
                    format!(
                        "Segment number {} contains exactly ten words for testing purposes.",
                        i
                    ),
                )
            })
            .collect()
    }

    #[test]
    fn test_count_tokens_estimate() {
        assert_eq!(count_tokens("one two three four"), 5); // 4 * 1.3 = 5.2
        assert_eq!(count_tokens(""), 0);
    }

    #[test]
    fn test_split_sentences_basic() {
        let s = split_sentences("First sentence. Second sentence! Third one?");
        assert_eq!(s.len(), 3);
        assert_eq!(s[0], "First sentence.");
        assert_eq!(s[2], "Third one?");

        let s = split_sentences("First sentence. Second here! And a third. Done");
        assert_eq!(s[0], "First sentence.");
        assert_eq!(s[1], "Second here!");
    }

    #[test]
    fn test_split_sentences_abbreviations_and_decimals() {
        let s = split_sentences("Dr. Smith measured 3.14 units. Then he left.");
        assert_eq!(s.len(), 2);
        assert_eq!(s[0], "Dr. Smith measured 3.14 units.");
    }

    #[test]
    fn test_chunk_invariants_hold() {
        let config = settings();
        let chunker = Chunker::new(&config);
        let chunks = chunker.chunk_transcript(&make_segments(40), None);

        assert!(!chunks.is_empty());
        chunker.validate(&chunks).unwrap();

        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_index, i as u32);
            assert!(chunk.start_timestamp < chunk.end_timestamp);
            assert!(chunk.token_count >= config.min_tokens);
            assert!(chunk.token_count <= (config.max_tokens as f64 * 1.2) as u32);
        }
    }

    #[test]
    fn test_overlap_law() {
        let config = settings();
        let chunker = Chunker::new(&config);
        let chunks = chunker.chunk_transcript(&make_segments(40), None);
        assert!(chunks.len() >= 2);

        // Each chunk after the first starts with whole sentences drawn from
        // the previous chunk's tail, within the overlap budget.
        for pair in chunks.windows(2) {
            let overlap_candidate = split_sentences(&pair[1].text);
            let first_sentence = &overlap_candidate[0];
            assert!(
                pair[0].text.ends_with(first_sentence.as_str())
                    || pair[0].text.contains(first_sentence.as_str()),
                "overlap sentence not found in previous chunk"
            );
            assert!(count_tokens(first_sentence) <= config.overlap_tokens);
        }
    }

    #[test]
    fn test_duration_cap_forces_cut() {
        let config = ChunkingSettings {
            target_tokens: 10_000,
            min_tokens: 5,
            max_tokens: 20_000,
            overlap_tokens: 0,
            max_duration_seconds: 25,
        };
        let chunker = Chunker::new(&config);
        let chunks = chunker.chunk_transcript(&make_segments(10), None);

        assert!(chunks.len() > 1, "duration cap should force multiple chunks");
        for chunk in &chunks {
            // Each cut happened once the span passed the cap; spans stay close to it.
            assert!(chunk.end_timestamp - chunk.start_timestamp <= 40.0);
        }
    }

    #[test]
    fn test_speaker_change_is_natural_boundary() {
        let config = ChunkingSettings {
            target_tokens: 10,
            min_tokens: 5,
            max_tokens: 1000,
            overlap_tokens: 0,
            max_duration_seconds: 10_000,
        };
        let chunker = Chunker::new(&config);

        // No sentence punctuation anywhere; only the speaker changes.
        let mut segments: Vec<TranscriptSegment> = (0..4)
            .map(|i| {
                let mut s = TranscriptSegment::new(
                    i as f64 * 10.0,
                    (i + 1) as f64 * 10.0,
                    "ten words of unpunctuated speech flowing on and on here".to_string(),
                );
                s.speaker = Some("alice".to_string());
                s
            })
            .collect();
        segments[2].speaker = Some("bob".to_string());
        segments[3].speaker = Some("bob".to_string());

        let chunks = chunker.chunk_transcript(&segments, None);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].speakers, vec!["alice".to_string()]);
        assert_eq!(chunks[1].speakers, vec!["bob".to_string()]);
    }

    #[test]
    fn test_small_tail_merges_into_previous() {
        let config = settings();
        let chunker = Chunker::new(&config);

        let mut segments = make_segments(8);
        // Tiny trailing segment, well under min_tokens.
        segments.push(TranscriptSegment::new(80.0, 82.0, "Bye.".to_string()));

        let chunks = chunker.chunk_transcript(&segments, None);
        chunker.validate(&chunks).unwrap();
        let last = chunks.last().unwrap();
        assert!(last.text.ends_with("Bye."));
        assert_eq!(last.end_timestamp, 82.0);
    }

    #[test]
    fn test_chapter_grouping() {
        let config = settings();
        let chunker = Chunker::new(&config);
        let segments = make_segments(20);
        let chapters = vec![
            Chapter {
                title: "Intro".to_string(),
                start_time: 0.0,
                end_time: 100.0,
            },
            Chapter {
                title: "Main".to_string(),
                start_time: 100.0,
                end_time: 200.0,
            },
        ];

        let chunks = chunker.chunk_transcript(&segments, Some(&chapters));
        assert!(!chunks.is_empty());

        let intro: Vec<_> = chunks
            .iter()
            .filter(|c| c.chapter_title.as_deref() == Some("Intro"))
            .collect();
        let main: Vec<_> = chunks
            .iter()
            .filter(|c| c.chapter_title.as_deref() == Some("Main"))
            .collect();
        assert!(!intro.is_empty());
        assert!(!main.is_empty());
        assert!(intro.iter().all(|c| c.chapter_index == Some(0)));
        assert!(main.iter().all(|c| c.chapter_index == Some(1)));

        // Index stays contiguous across chapters
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_index, i as u32);
        }
    }

    #[test]
    fn test_empty_segments() {
        let chunker = Chunker::new(&settings());
        assert!(chunker.chunk_transcript(&[], None).is_empty());
        assert!(chunker.single_chunk(&[]).is_none());
    }

    #[test]
    fn test_single_chunk_fallback() {
        let chunker = Chunker::new(&settings());
        let segments = make_segments(1);
        let chunk = chunker.single_chunk(&segments).unwrap();
        assert_eq!(chunk.chunk_index, 0);
        assert_eq!(chunk.start_timestamp, 0.0);
    }
}
