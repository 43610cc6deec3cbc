//! Paragraph-boundary text chunker.
//!
//! The [`Chunker`] trait is the seam for custom splitting strategies; the
//! default [`ParagraphChunker`] packs `\n\n`-separated paragraphs into
//! chunks of roughly `size` tokens and repeats the last `overlap` tokens
//! of each chunk at the start of the next.
//!
//! # Algorithm
//!
//! 1. Convert `size` and `overlap` to characters using a 4 chars/token ratio.
//! 2. Split text on `\n\n` paragraph boundaries.
//! 3. Accumulate paragraphs until adding the next one would exceed the
//!    packing budget (`size - overlap`), then flush.
//! 4. Hard-split paragraphs larger than the budget at the nearest newline
//!    or space.
//! 5. Prefix every chunk after the first with the word-aligned tail of
//!    its predecessor.
//!
//! # Example
//!
//! ```rust
//! use ragweave_core::chunk::{Chunker, ParagraphChunker};
//!
//! let chunks = ParagraphChunker.split("Hello world.\n\nSecond paragraph.", 500, 50);
//! assert_eq!(chunks.len(), 1);
//! ```

/// Approximate characters-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Splits text into chunks of roughly `size` tokens with `overlap` tokens
/// shared between neighbours.
pub trait Chunker: Send + Sync {
    /// Returns chunks in document order. Empty or whitespace-only text
    /// yields no chunks.
    fn split(&self, text: &str, size: usize, overlap: usize) -> Vec<String>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ParagraphChunker;

impl Chunker for ParagraphChunker {
    fn split(&self, text: &str, size: usize, overlap: usize) -> Vec<String> {
        let max_chars = size.max(1) * CHARS_PER_TOKEN;
        let overlap_chars = (overlap * CHARS_PER_TOKEN).min(max_chars / 2);
        let budget = (max_chars - overlap_chars).max(1);

        let packed = pack_paragraphs(text, budget);
        if overlap_chars == 0 || packed.len() < 2 {
            return packed;
        }

        let mut chunks = Vec::with_capacity(packed.len());
        for (i, chunk) in packed.iter().enumerate() {
            if i == 0 {
                chunks.push(chunk.clone());
                continue;
            }
            let tail = word_tail(&packed[i - 1], overlap_chars);
            if tail.is_empty() {
                chunks.push(chunk.clone());
            } else {
                chunks.push(format!("{tail} {chunk}"));
            }
        }
        chunks
    }
}

fn pack_paragraphs(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current_buf = String::new();

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        let would_be = if current_buf.is_empty() {
            trimmed.len()
        } else {
            current_buf.len() + 2 + trimmed.len()
        };

        if would_be > max_chars && !current_buf.is_empty() {
            chunks.push(std::mem::take(&mut current_buf));
        }

        if trimmed.len() > max_chars {
            hard_split(trimmed, max_chars, &mut chunks);
        } else {
            if !current_buf.is_empty() {
                current_buf.push_str("\n\n");
            }
            current_buf.push_str(trimmed);
        }
    }

    if !current_buf.is_empty() {
        chunks.push(current_buf);
    }
    chunks
}

/// Split an oversized paragraph at newline/space boundaries.
fn hard_split(paragraph: &str, max_chars: usize, out: &mut Vec<String>) {
    let mut remaining = paragraph;
    while !remaining.is_empty() {
        let mut split_at = snap_to_char_boundary(remaining, max_chars);
        if split_at < remaining.len() {
            if let Some(pos) = remaining[..split_at]
                .rfind('\n')
                .or_else(|| remaining[..split_at].rfind(' '))
            {
                if pos > 0 {
                    split_at = pos + 1;
                }
            }
        }
        if split_at == 0 {
            // A single char wider than the budget.
            split_at = remaining
                .char_indices()
                .nth(1)
                .map(|(i, _)| i)
                .unwrap_or(remaining.len());
        }
        let piece = remaining[..split_at].trim();
        if !piece.is_empty() {
            out.push(piece.to_string());
        }
        remaining = &remaining[split_at..];
    }
}

/// Last `max_chars` of `text`, starting on a word boundary.
fn word_tail(text: &str, max_chars: usize) -> &str {
    if text.len() <= max_chars {
        return text.trim();
    }
    let start = text.len() - max_chars;
    let mut start = start;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    let tail = &text[start..];
    match tail.find(char::is_whitespace) {
        Some(pos) => tail[pos..].trim(),
        None => tail.trim(),
    }
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = ParagraphChunker.split("Hello, world!", 500, 50);
        assert_eq!(chunks, vec!["Hello, world!".to_string()]);
    }

    #[test]
    fn test_empty_text_yields_nothing() {
        assert!(ParagraphChunker.split("", 500, 0).is_empty());
        assert!(ParagraphChunker.split("  \n\n  ", 500, 0).is_empty());
    }

    #[test]
    fn test_paragraphs_exceeding_limit_split() {
        let text = "This is paragraph one.\n\nThis is paragraph two.\n\nThis is paragraph three.";
        let chunks = ParagraphChunker.split(text, 6, 0);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[1], "This is paragraph two.");
    }

    #[test]
    fn test_overlap_repeats_tail_of_previous_chunk() {
        let text = "alpha beta gamma delta\n\nepsilon zeta eta theta";
        let chunks = ParagraphChunker.split(text, 8, 2);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[1].starts_with("delta"), "got {:?}", chunks[1]);
        assert!(chunks[1].ends_with("theta"));
    }

    #[test]
    fn test_oversized_paragraph_hard_split_on_spaces() {
        let text = (0..40).map(|i| format!("w{i}")).collect::<Vec<_>>().join(" ");
        let chunks = ParagraphChunker.split(&text, 5, 0);
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.len() <= 20, "chunk too long: {c:?}");
            assert!(!c.starts_with(' '));
        }
        assert_eq!(chunks.join(" "), text);
    }

    #[test]
    fn test_multibyte_utf8_chars() {
        let text = "┌──────────────────┐\n│ Hello world      │\n└──────────────────┘";
        let chunks = ParagraphChunker.split(text, 3, 1);
        assert!(!chunks.is_empty());
        assert!(chunks.iter().all(|c| !c.is_empty()));
    }

    #[test]
    fn test_deterministic() {
        let text = "Alpha\n\nBeta\n\nGamma\n\nDelta";
        assert_eq!(
            ParagraphChunker.split(text, 2, 1),
            ParagraphChunker.split(text, 2, 1)
        );
    }
}
