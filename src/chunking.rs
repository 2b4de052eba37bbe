//! Token-bounded semantic splitter.
//!
//! Splits record content into ordered chunks under three character budgets
//! (`min`, `target`, `max`): hierarchical separator splitting, greedy
//! packing up to `max`, hard splits at `target` for pathological segments,
//! and a short-tail merge pass. Separators stay attached to their segment
//! (inclusive splitting), so concatenating the output reproduces the input
//! exactly.
//!
//! Properties the tests pin down:
//! - output is non-empty iff the input has any non-whitespace content;
//! - no produced chunk is empty;
//! - source order is preserved;
//! - content of length `max` yields one chunk, `max + 1` yields at least
//!   two.

use crate::config::ChunkingConfig;

/// Separator hierarchy, coarse to fine.
const SEPARATORS: [&str; 5] = ["\n\n", "\n", ". ", "? ", "! "];

/// Estimate the token count of a chunk (chars/4, floored at 1).
///
/// A budget hint for downstream consumers, not a billing figure; every
/// produced chunk has a strictly positive count.
#[must_use]
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.chars().count();
    (chars.div_ceil(4)).max(1) as u32
}

/// Character-budgeted splitter. Cheap to construct and `Copy`-like; hold
/// one per pipeline.
#[derive(Clone, Debug)]
pub struct Chunker {
    config: ChunkingConfig,
}

impl Chunker {
    #[must_use]
    pub fn new(config: ChunkingConfig) -> Self {
        Self { config }
    }

    /// Split `content` into ordered chunks.
    ///
    /// Whitespace-only input yields an empty list. Content within the
    /// `max` budget is returned whole.
    #[must_use]
    pub fn chunk(&self, content: &str) -> Vec<String> {
        if content.trim().is_empty() {
            return Vec::new();
        }
        let max = self.config.max_chars;
        if char_len(content) <= max {
            return vec![content.to_string()];
        }

        let segments = self.split_hierarchically(content);
        let mut chunks = self.pack(segments);
        self.merge_short_tail(&mut chunks);
        chunks
    }

    /// Apply the separator hierarchy; a segment is split further only
    /// while it exceeds the `min` budget.
    fn split_hierarchically(&self, content: &str) -> Vec<String> {
        let min = self.config.min_chars;
        let mut segments = vec![content.to_string()];
        for sep in SEPARATORS {
            let mut next = Vec::with_capacity(segments.len());
            for segment in segments {
                if char_len(&segment) > min {
                    next.extend(segment.split_inclusive(sep).map(str::to_string));
                } else {
                    next.push(segment);
                }
            }
            segments = next;
        }
        segments
    }

    /// Greedily pack segments up to `max` characters; a single segment
    /// over `max` is hard-split at `target` boundaries.
    fn pack(&self, segments: Vec<String>) -> Vec<String> {
        let max = self.config.max_chars;
        let target = self.config.target_chars;
        let mut chunks: Vec<String> = Vec::new();
        let mut current = String::new();
        let mut current_len = 0usize;

        for segment in segments {
            let seg_len = char_len(&segment);
            if seg_len > max {
                if !current.is_empty() {
                    chunks.push(std::mem::take(&mut current));
                    current_len = 0;
                }
                let mut pieces = hard_split(&segment, target);
                // The final piece stays open so following segments can
                // still pack onto it.
                if let Some(last) = pieces.pop() {
                    chunks.extend(pieces);
                    current_len = char_len(&last);
                    current = last;
                }
            } else if current_len + seg_len <= max {
                current.push_str(&segment);
                current_len += seg_len;
            } else {
                chunks.push(std::mem::take(&mut current));
                current = segment;
                current_len = seg_len;
            }
        }
        if !current.is_empty() {
            chunks.push(current);
        }
        chunks
    }

    /// Fold a short tail (or head) chunk into its neighbor when the merge
    /// stays within the `max` budget.
    fn merge_short_tail(&self, chunks: &mut Vec<String>) {
        let min = self.config.min_chars;
        let max = self.config.max_chars;
        if chunks.len() >= 2 {
            let last_len = char_len(&chunks[chunks.len() - 1]);
            let prev_len = char_len(&chunks[chunks.len() - 2]);
            if last_len < min && last_len + prev_len <= max {
                let tail = chunks.pop().unwrap_or_default();
                if let Some(prev) = chunks.last_mut() {
                    prev.push_str(&tail);
                }
            }
        }
        if chunks.len() >= 2 {
            let first_len = char_len(&chunks[0]);
            let next_len = char_len(&chunks[1]);
            if first_len < min && first_len + next_len <= max {
                let head = chunks.remove(0);
                chunks[0].insert_str(0, &head);
            }
        }
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Split on character boundaries into pieces of `size` chars; the final
/// piece carries the remainder.
fn hard_split(segment: &str, size: usize) -> Vec<String> {
    let size = size.max(1);
    let mut pieces = Vec::new();
    let mut piece = String::new();
    let mut count = 0usize;
    for c in segment.chars() {
        piece.push(c);
        count += 1;
        if count == size {
            pieces.push(std::mem::take(&mut piece));
            count = 0;
        }
    }
    if !piece.is_empty() {
        pieces.push(piece);
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn chunker() -> Chunker {
        Chunker::new(ChunkingConfig::default())
    }

    fn sentence_soup(total: usize) -> String {
        // "A. " repeated, trimmed to exactly `total` characters.
        "A. ".repeat(total / 3 + 1).chars().take(total).collect()
    }

    #[test]
    fn whitespace_only_yields_nothing() {
        assert!(chunker().chunk("").is_empty());
        assert!(chunker().chunk("   \n\t  ").is_empty());
    }

    #[test]
    fn short_content_is_one_chunk() {
        let chunks = chunker().chunk("hello world");
        assert_eq!(chunks, vec!["hello world".to_string()]);
    }

    #[test]
    fn content_at_max_is_exactly_one_chunk() {
        let content = sentence_soup(1999);
        assert_eq!(content.chars().count(), 1999);
        assert_eq!(chunker().chunk(&content).len(), 1);

        let content = sentence_soup(2000);
        assert_eq!(chunker().chunk(&content).len(), 1);
    }

    #[test]
    fn content_over_max_splits_and_concatenation_is_lossless() {
        let content = sentence_soup(2001);
        let chunks = chunker().chunk(&content);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks.concat(), content);
        assert!(chunks.iter().all(|c| !c.is_empty()));
    }

    #[test]
    fn paragraphs_split_before_sentences() {
        let paragraph = "Sentence one. Sentence two. ".repeat(40); // ~1120 chars
        let content = format!("{paragraph}\n\n{paragraph}\n\n{paragraph}");
        let chunks = chunker().chunk(&content);
        assert!(chunks.len() >= 2);
        assert_eq!(chunks.concat(), content);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 2000);
        }
    }

    #[test]
    fn oversize_unbroken_segment_hard_splits_at_target() {
        let content = "x".repeat(4100); // no separators at all
        let chunks = chunker().chunk(&content);
        assert_eq!(chunks.concat(), content);
        assert!(chunks.len() >= 2);
        // Hard-split bodies come out at the target budget.
        assert!(chunks[0].chars().count() == 800);
    }

    #[test]
    fn trailing_short_chunk_merges_when_room_allows() {
        // 4085 unbroken chars: five 800-char hard-split pieces plus an
        // 85-char tail that folds into the final piece.
        let content = "x".repeat(4085);
        let chunks = chunker().chunk(&content);
        assert_eq!(chunks.concat(), content);
        assert_eq!(chunks.len(), 5);
        assert_eq!(chunks.last().unwrap().chars().count(), 885);
    }

    #[test]
    fn token_estimate_is_positive() {
        assert_eq!(estimate_tokens(""), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    proptest! {
        // Order and content preservation across arbitrary inputs.
        #[test]
        fn concatenation_always_reproduces_input(
            content in "[ -~\\n]{0,6000}"
        ) {
            let chunks = chunker().chunk(&content);
            if content.trim().is_empty() {
                prop_assert!(chunks.is_empty());
            } else {
                prop_assert_eq!(chunks.concat(), content);
                prop_assert!(chunks.iter().all(|c| !c.is_empty()));
            }
        }
    }
}
