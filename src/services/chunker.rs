//! Token-window chunking for a fixed-context encoder.

use tokenizers::Tokenizer;
use tracing::warn;

use crate::error::ModelError;
use crate::models::{ChunkingConfig, EmbeddingConfig};

/// Splits document text into overlapping, token-count-bounded segments
/// using the embedding model's own tokenizer.
pub struct TokenChunker {
    tokenizer: Tokenizer,
    max_tokens: usize,
    overlap: usize,
    safety_buffer: usize,
    special_tokens: usize,
}

impl TokenChunker {
    /// Load the tokenizer from `model_dir/tokenizer.json`.
    pub fn load(
        embedding: &EmbeddingConfig,
        chunking: &ChunkingConfig,
    ) -> Result<Self, ModelError> {
        let tokenizer_path = embedding.model_dir.join("tokenizer.json");
        if !tokenizer_path.exists() {
            return Err(ModelError::NotFound(format!(
                "tokenizer not found: {}",
                tokenizer_path.display()
            )));
        }

        let mut tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| ModelError::TokenizerError(e.to_string()))?;

        // The chunker must see the full token sequence: no truncation, no
        // padding, no framing tokens. The encoder re-applies framing later.
        tokenizer
            .with_truncation(None)
            .map_err(|e| ModelError::TokenizerError(e.to_string()))?;
        tokenizer.with_padding(None);

        // Measure the framing overhead once by encoding a probe with and
        // without special tokens.
        let framed = tokenizer
            .encode("a", true)
            .map_err(|e| ModelError::TokenizerError(e.to_string()))?
            .get_ids()
            .len();
        let bare = tokenizer
            .encode("a", false)
            .map_err(|e| ModelError::TokenizerError(e.to_string()))?
            .get_ids()
            .len();

        Ok(Self {
            tokenizer,
            max_tokens: embedding.max_tokens as usize,
            overlap: chunking.overlap as usize,
            safety_buffer: chunking.safety_buffer as usize,
            special_tokens: framed.saturating_sub(bare),
        })
    }

    /// Token budget left for document text after framing tokens and the
    /// safety cushion.
    pub fn effective_max(&self) -> usize {
        self.max_tokens
            .saturating_sub(self.special_tokens + self.safety_buffer)
    }

    /// Split `text` into decoded chunk strings. Empty input, a degenerate
    /// token budget, or a tokenizer failure all yield an empty sequence
    /// rather than an error.
    pub fn chunk(&self, text: &str) -> Vec<String> {
        if text.is_empty() {
            return Vec::new();
        }

        let effective_max = self.effective_max();
        if effective_max == 0 {
            warn!(
                "max_tokens {} leaves no room after {} framing tokens and a {}-token safety buffer; skipping text",
                self.max_tokens, self.special_tokens, self.safety_buffer
            );
            return Vec::new();
        }

        let encoding = match self.tokenizer.encode(text, false) {
            Ok(e) => e,
            Err(e) => {
                warn!("failed to tokenize text of {} chars: {}", text.len(), e);
                return Vec::new();
            }
        };
        let tokens = encoding.get_ids();

        let mut chunks = Vec::new();
        for (start, end) in window_spans(tokens.len(), effective_max, self.overlap) {
            match self.tokenizer.decode(&tokens[start..end], true) {
                Ok(decoded) => chunks.push(decoded),
                Err(e) => warn!("failed to decode chunk at token {}: {}", start, e),
            }
        }
        chunks
    }
}

/// Compute the half-open token ranges `[start, end)` of each chunk window.
///
/// A sequence that fits in one window produces a single span; otherwise a
/// window of `effective_max` slides with stride `effective_max - overlap`
/// (clamped to at least 1). The final span is clipped to the sequence end
/// and no span starts past it.
pub(crate) fn window_spans(
    total: usize,
    effective_max: usize,
    overlap: usize,
) -> Vec<(usize, usize)> {
    if total == 0 || effective_max == 0 {
        return Vec::new();
    }
    if total <= effective_max {
        return vec![(0, total)];
    }

    let mut stride = effective_max.saturating_sub(overlap);
    if stride == 0 {
        stride = (effective_max / 2).max(1);
        warn!(
            "overlap {} consumes the whole {}-token window; clamping stride to {}",
            overlap, effective_max, stride
        );
    }

    let mut spans = Vec::new();
    let mut start = 0;
    while start < total {
        let end = (start + effective_max).min(total);
        spans.push((start, end));
        if end >= total {
            break;
        }
        let next = start + stride;
        if next <= start {
            // Stall guard; unreachable with stride >= 1 but cheap to keep.
            break;
        }
        start = next;
    }
    spans
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_sequence_is_one_span() {
        assert_eq!(window_spans(10, 16, 4), vec![(0, 10)]);
        assert_eq!(window_spans(16, 16, 4), vec![(0, 16)]);
    }

    #[test]
    fn empty_sequence_has_no_spans() {
        assert!(window_spans(0, 16, 4).is_empty());
    }

    #[test]
    fn zero_budget_fails_closed() {
        assert!(window_spans(100, 0, 4).is_empty());
    }

    #[test]
    fn span_count_matches_ceiling_formula() {
        // count = ceil((total - effective_max) / stride) + 1
        for (total, max, overlap) in [
            (10usize, 4usize, 1usize),
            (11, 4, 1),
            (12, 4, 1),
            (1000, 241, 50),
            (242, 241, 50),
            (5000, 100, 0),
        ] {
            let stride = max - overlap;
            let expected = (total - max).div_ceil(stride) + 1;
            let spans = window_spans(total, max, overlap);
            assert_eq!(spans.len(), expected, "total={total} max={max} overlap={overlap}");
        }
    }

    #[test]
    fn spans_cover_sequence_without_gaps() {
        let spans = window_spans(1000, 241, 50);
        assert_eq!(spans[0].0, 0);
        assert_eq!(spans.last().unwrap().1, 1000);
        for pair in spans.windows(2) {
            // Next window starts inside the previous one (the overlap).
            assert!(pair[1].0 < pair[0].1);
            assert_eq!(pair[1].0, pair[0].0 + (241 - 50));
        }
    }

    #[test]
    fn concatenated_fresh_portions_reconstruct_sequence() {
        let total = 777;
        let spans = window_spans(total, 100, 30);
        let mut covered = 0;
        for (i, (start, end)) in spans.iter().enumerate() {
            let fresh_start = if i == 0 { *start } else { covered };
            assert_eq!(fresh_start, *start + if i == 0 { 0 } else { 30 });
            covered = *end;
        }
        assert_eq!(covered, total);
    }

    #[test]
    fn no_trailing_duplicate_window() {
        // 8 tokens, window 4, stride 4: exactly two spans, not three.
        let spans = window_spans(8, 4, 0);
        assert_eq!(spans, vec![(0, 4), (4, 8)]);
    }

    #[test]
    fn oversized_overlap_clamps_stride() {
        // overlap >= window would stall; stride clamps to max/2.
        let spans = window_spans(10, 4, 9);
        assert_eq!(spans[0], (0, 4));
        assert_eq!(spans[1].0, 2);
        assert_eq!(spans.last().unwrap().1, 10);
    }

    #[test]
    fn single_token_window_still_advances() {
        let spans = window_spans(5, 1, 3);
        assert_eq!(spans.len(), 5);
        assert_eq!(spans[4], (4, 5));
    }
}
