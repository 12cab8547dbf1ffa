//! Splits a streamed reply into speakable units for TTS.

/// Characters that end a speakable unit.
const BOUNDARIES: [char; 4] = ['.', '!', '?', '\n'];

pub const DEFAULT_MAX_CHARS: usize = 60;

/// Accumulates LLM fragments and emits a chunk at each sentence terminator,
/// or once the buffer grows past `max_chars`.
///
/// Nothing is ever dropped: the concatenation of every emitted chunk plus the
/// final [`TextChunker::flush`] equals the concatenation of every pushed fragment.
#[derive(Debug, Clone)]
pub struct TextChunker {
    buffer: String,
    max_chars: usize,
}

impl Default for TextChunker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CHARS)
    }
}

impl TextChunker {
    pub fn new(max_chars: usize) -> Self {
        Self {
            buffer: String::new(),
            max_chars: max_chars.max(1),
        }
    }

    /// Append a fragment and return every chunk that became complete.
    pub fn push(&mut self, fragment: &str) -> Vec<String> {
        self.buffer.push_str(fragment);
        let mut chunks = Vec::new();
        while let Some(end) = self.next_cut() {
            let rest = self.buffer.split_off(end);
            chunks.push(std::mem::replace(&mut self.buffer, rest));
        }
        chunks
    }

    /// Take whatever is left in the buffer.
    pub fn flush(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }

    pub fn pending(&self) -> &str {
        &self.buffer
    }

    /// Byte offset where the next chunk ends, if one is complete.
    fn next_cut(&self) -> Option<usize> {
        let mut seen = 0;
        for (idx, ch) in self.buffer.char_indices() {
            seen += 1;
            if seen > self.max_chars {
                return Some(self.length_cut());
            }
            if BOUNDARIES.contains(&ch) {
                return Some(idx + ch.len_utf8());
            }
        }
        None
    }

    /// Cut after the last whitespace within the first `max_chars` characters,
    /// or exactly at the limit when there is none.
    fn length_cut(&self) -> usize {
        let limit = self
            .buffer
            .char_indices()
            .nth(self.max_chars)
            .map(|(idx, _)| idx)
            .unwrap_or(self.buffer.len());
        let head = &self.buffer[..limit];
        match head.rfind(char::is_whitespace) {
            Some(ws) if ws > 0 => {
                let width = head[ws..].chars().next().map(char::len_utf8).unwrap_or(1);
                ws + width
            }
            _ => limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emits_at_sentence_end_and_keeps_remainder() {
        let mut chunker = TextChunker::default();
        assert_eq!(chunker.push("The sky is blue. It is"), vec!["The sky is blue."]);
        assert_eq!(chunker.pending(), " It is");
        assert_eq!(chunker.flush().as_deref(), Some(" It is"));
        assert_eq!(chunker.flush(), None);
    }

    #[test]
    fn test_short_text_waits_for_flush() {
        let mut chunker = TextChunker::default();
        assert!(chunker.push("Hello").is_empty());
        assert_eq!(chunker.flush().as_deref(), Some("Hello"));
    }

    #[test]
    fn test_multiple_terminators_in_one_fragment() {
        let mut chunker = TextChunker::default();
        let chunks = chunker.push("Yes! Really? Ok.\nNext");
        assert_eq!(chunks, vec!["Yes!", " Really?", " Ok.", "\n"]);
        assert_eq!(chunker.pending(), "Next");
    }

    #[test]
    fn test_length_threshold_breaks_on_whitespace() {
        let mut chunker = TextChunker::new(10);
        let chunks = chunker.push("alpha beta gamma delta");
        assert_eq!(chunks, vec!["alpha ", "beta ", "gamma "]);
        assert_eq!(chunker.flush().as_deref(), Some("delta"));
    }

    #[test]
    fn test_length_threshold_without_whitespace() {
        let mut chunker = TextChunker::new(4);
        let chunks = chunker.push("abcdefghij");
        assert_eq!(chunks, vec!["abcd", "efgh"]);
        assert_eq!(chunker.flush().as_deref(), Some("ij"));
    }

    #[test]
    fn test_terminator_past_limit_uses_length_cut() {
        let mut chunker = TextChunker::new(5);
        let chunks = chunker.push("abcdefg.");
        assert_eq!(chunks, vec!["abcde", "fg."]);
    }

    #[test]
    fn test_multibyte_text_is_cut_on_char_boundaries() {
        let mut chunker = TextChunker::new(3);
        let chunks = chunker.push("héllö wörld");
        let joined: String = chunks.concat() + chunker.pending();
        assert_eq!(joined, "héllö wörld");
        assert!(chunks.iter().all(|c| c.chars().count() <= 3));
    }

    #[test]
    fn test_concatenation_is_preserved_for_any_fragmentation() {
        let text = "Dr. Rao sees patients Monday to Friday, ten to four! \
                    Would you like me to book a slot?\nThe fee is five hundred rupees and \
                    parking is available on site for all visitors";
        for size in 1..=9 {
            for max in [4, 17, 60] {
                let mut chunker = TextChunker::new(max);
                let mut out = String::new();
                let chars: Vec<char> = text.chars().collect();
                for piece in chars.chunks(size) {
                    let fragment: String = piece.iter().collect();
                    for chunk in chunker.push(&fragment) {
                        assert!(!chunk.is_empty());
                        assert!(chunk.chars().count() <= max);
                        out.push_str(&chunk);
                    }
                }
                if let Some(rest) = chunker.flush() {
                    out.push_str(&rest);
                }
                assert_eq!(out, text, "size={size} max={max}");
            }
        }
    }
}
