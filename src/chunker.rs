//! Boundary-aware sliding-window text chunker.
//!
//! Splits document text into overlapping windows of a target size,
//! preferring to cut at a paragraph break, line break, or sentence end
//! found within a small lookahead past the target. Deterministic and a
//! pure function of its input, so re-ingesting a document always yields
//! the same chunk sequence.

use crate::config::ChunkingConfig;
use crate::models::TextChunk;

/// Boundary tokens, strongest first. A boundary is only accepted past
/// half the target size to avoid pathologically short chunks.
const BOUNDARIES: [&str; 5] = ["\n\n", "\n", ". ", "! ", "? "];

/// Split `text` into ordered, overlapping chunks.
///
/// Windows advance by `chunk_size - overlap`; the final window ends at
/// the end of the text. Each window's slice is trimmed, and slices at or
/// below `min_chunk_chars` are dropped without consuming an index.
/// Empty input yields no chunks.
pub fn chunk_text(text: &str, opts: &ChunkingConfig) -> Vec<TextChunk> {
    let mut chunks = Vec::new();
    let len = text.len();
    let mut start = 0usize;
    let mut index: i64 = 0;

    while start < len {
        let mut end = floor_char_boundary(text, (start + opts.chunk_size).min(len));

        if start + opts.chunk_size < len {
            let window_end =
                floor_char_boundary(text, (start + opts.chunk_size + opts.lookahead).min(len));
            let slice = &text[start..window_end];

            for bp in BOUNDARIES {
                // Last occurrence starting at or before the target size.
                let search_end =
                    floor_char_boundary(slice, (opts.chunk_size + bp.len()).min(slice.len()));
                if let Some(pos) = slice[..search_end].rfind(bp) {
                    if pos > opts.chunk_size / 2 {
                        end = start + pos + bp.len();
                        break;
                    }
                }
            }
        } else {
            end = len;
        }

        let content = text[start..end].trim();
        if content.chars().count() > opts.min_chunk_chars {
            chunks.push(TextChunk {
                content: content.to_string(),
                index,
            });
            index += 1;
        }

        if end >= len {
            break;
        }

        let next = floor_char_boundary(text, end.saturating_sub(opts.overlap));
        // The overlap never reaches back past the current window start as
        // long as overlap < chunk_size / 2; guard the general case anyway.
        start = if next > start { next } else { end };
    }

    chunks
}

/// Rough token estimate used for accounting only (~4 chars per token).
pub fn estimate_tokens(text: &str) -> i64 {
    let chars = text.chars().count();
    ((chars + 3) / 4) as i64
}

fn floor_char_boundary(text: &str, mut idx: usize) -> usize {
    if idx >= text.len() {
        return text.len();
    }
    while !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}
