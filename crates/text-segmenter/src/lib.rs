//! Bounded text segmentation.
//!
//! [`segment`] splits a text into ordered, non-overlapping chunks of at most
//! `max_chars` characters. Cut points are chosen in the last fifth of each
//! window, preferring sentence ends and paragraph breaks, then any
//! punctuation or whitespace, and only as a last resort the window edge.
//!
//! Lengths are measured in `char`s, so a cut never lands inside a UTF-8
//! sequence.

/// Default chunk size, roughly 1200 tokens of English text.
pub const DEFAULT_MAX_CHARS: usize = 4800;

/// Cut points are never searched for closer than this to the chunk start.
const MIN_SEARCH_OFFSET: usize = 100;

/// Fraction of the window skipped before searching for a cut point.
const SEARCH_FROM_RATIO: f64 = 0.8;

/// Split `text` into chunks of at most `max_chars` characters.
///
/// A text that already fits is returned unchanged as a single chunk. Longer
/// texts are cut and every chunk is trimmed; chunks that trim to nothing are
/// dropped. A `max_chars` of zero is treated as one.
pub fn segment(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);

    // Byte offset of every char, plus the end of the text.
    let offsets: Vec<usize> = text
        .char_indices()
        .map(|(offset, _)| offset)
        .chain(std::iter::once(text.len()))
        .collect();
    let chars: Vec<char> = text.chars().collect();
    let len = chars.len();

    if len <= max_chars {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut pos = 0;

    while pos < len {
        let end = (pos + max_chars).min(len);
        let cut = if end < len {
            find_cut(&chars, pos, end, max_chars)
        } else {
            end
        };

        let chunk = text[offsets[pos]..offsets[cut]].trim();
        if !chunk.is_empty() {
            chunks.push(chunk.to_string());
        }
        pos = cut;
    }

    chunks
}

/// Choose a cut in `(search_start, end]` for the window starting at `pos`.
fn find_cut(chars: &[char], pos: usize, end: usize, max_chars: usize) -> usize {
    let search_start = (pos + (max_chars as f64 * SEARCH_FROM_RATIO) as usize)
        .max(pos + MIN_SEARCH_OFFSET);
    if search_start >= end {
        return end;
    }

    // Sentence end followed by whitespace, or a blank line. The cut keeps the
    // terminator in this chunk.
    if let Some(i) = (search_start + 1..=end)
        .rev()
        .find(|&i| is_sentence_break(chars[i - 1], chars[i]))
    {
        return i;
    }

    // Any punctuation or whitespace; cut just after it.
    if let Some(i) = (search_start..end).rev().find(|&i| is_soft_break(chars[i])) {
        return i + 1;
    }

    end
}

fn is_sentence_break(prev: char, next: char) -> bool {
    (matches!(prev, '.' | '!' | '?') && next.is_whitespace()) || (prev == '\n' && next == '\n')
}

fn is_soft_break(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | ',' | ';' | ':') || c.is_whitespace()
}
