//! Text chunking for document-store entries.
//!
//! Documents longer than the configured size are split into chunks that
//! concatenate back to the exact original text: no trimming and no overlap.
//! Splits prefer a word or sentence boundary near the size limit and always
//! fall on a UTF-8 character boundary.

/// Configuration for document chunking.
#[derive(Debug, Clone)]
pub struct ChunkConfig {
    /// Maximum bytes per chunk.
    /// Default: 2000.
    pub max_chars: usize,

    /// How far back from the limit to look for a boundary.
    /// Default: 200.
    pub boundary_window: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_chars: 2000,
            boundary_window: 200,
        }
    }
}

impl ChunkConfig {
    #[must_use]
    pub fn with_max_chars(max_chars: usize) -> Self {
        let max_chars = max_chars.max(1);
        Self {
            max_chars,
            boundary_window: (max_chars / 10).min(200),
        }
    }
}

/// Split `text` into contiguous chunks.
///
/// Empty text yields a single empty chunk so every document has at least one
/// entry.
#[must_use]
pub fn chunk_text<'a>(text: &'a str, config: &ChunkConfig) -> Vec<&'a str> {
    if text.len() <= config.max_chars {
        return vec![text];
    }

    let mut chunks = Vec::new();
    let mut start = 0;
    while start < text.len() {
        let mut end = floor_char_boundary(text, (start + config.max_chars).min(text.len()));
        if end <= start {
            // A single character wider than the limit.
            end = ceil_char_boundary(text, start + 1);
        }
        if end < text.len() {
            end = find_word_boundary(text, start, end, config.boundary_window);
        }
        chunks.push(&text[start..end]);
        start = end;
    }
    chunks
}

/// Search backward from `end` for whitespace or punctuation, staying within
/// `window` bytes. Returns the position just past the boundary character.
fn find_word_boundary(text: &str, start: usize, end: usize, window: usize) -> usize {
    let min_pos = end.saturating_sub(window).max(start + 1);
    let bytes = text.as_bytes();
    for i in (min_pos..end).rev() {
        let c = bytes[i];
        if c.is_ascii_whitespace() || matches!(c, b'.' | b'!' | b'?' | b';' | b',') {
            return i + 1;
        }
    }
    end
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn ceil_char_boundary(text: &str, mut index: usize) -> usize {
    while index < text.len() && !text.is_char_boundary(index) {
        index += 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_text_is_one_chunk() {
        let config = ChunkConfig::default();
        assert_eq!(chunk_text("hello", &config), vec!["hello"]);
        assert_eq!(chunk_text("", &config), vec![""]);
    }

    #[test]
    fn test_chunks_concatenate_to_original() {
        let config = ChunkConfig::with_max_chars(50);
        let text = "The quick brown fox jumps over the lazy dog. ".repeat(20);
        let chunks = chunk_text(&text, &config);

        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.len() <= 50));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_prefers_word_boundaries() {
        let config = ChunkConfig {
            max_chars: 12,
            boundary_window: 6,
        };
        let chunks = chunk_text("alpha beta gamma delta", &config);
        assert_eq!(chunks[0], "alpha beta ");
        assert_eq!(chunks.concat(), "alpha beta gamma delta");
    }

    #[test]
    fn test_multibyte_text_splits_on_char_boundaries() {
        let config = ChunkConfig::with_max_chars(5);
        let text = "ééééééééé";
        let chunks = chunk_text(text, &config);
        assert_eq!(chunks.concat(), text);
        assert!(chunks.iter().all(|c| !c.is_empty()));
    }
}
