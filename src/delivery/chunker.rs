//! Chunk accumulation and boundary-aware splitting.

/// Buffers incoming deltas and decides split points. A flush is emitted for
/// the largest prefix that fits the payload ceiling and ends at a safe
/// boundary: the last paragraph break in the window, else the last line
/// break, else the last sentence end, else a hard cut at the nearest char
/// boundary. Splits never land inside a multi-byte code point.
#[derive(Debug)]
pub struct ChunkAccumulator {
    buffer: String,
    max_payload: usize,
}

impl ChunkAccumulator {
    pub fn new(max_payload: usize) -> Self {
        Self {
            buffer: String::new(),
            max_payload,
        }
    }

    /// Feed one delta; returns the chunks that became ready, in order.
    ///
    /// A delta that alone exceeds the payload ceiling is drained completely
    /// into max-size chunks, short tail included; otherwise the buffer is
    /// flushed down past the ceiling and the remainder is retained for the
    /// next delta.
    pub fn ingest(&mut self, delta: &str) -> Vec<String> {
        if delta.is_empty() {
            return Vec::new();
        }

        let oversized = delta.len() > self.max_payload;
        self.buffer.push_str(delta);

        let mut flushes = Vec::new();
        while self.buffer.len() > self.max_payload {
            let at = split_point(&self.buffer, self.max_payload);
            let rest = self.buffer.split_off(at);
            flushes.push(std::mem::replace(&mut self.buffer, rest));
        }
        if oversized && !self.buffer.is_empty() {
            flushes.push(std::mem::take(&mut self.buffer));
        }
        flushes
    }

    /// Flush any residual buffer unconditionally, even below the ceiling.
    /// Guarantees short answers still produce a chunk.
    pub fn finalize(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }
}

/// Byte index to split `text` at so the prefix fits `max_payload`.
/// Always returns a non-zero index: a ceiling narrower than the first code
/// point yields that code point whole, as the one oversize chunk, so the
/// ingest loop never stalls.
fn split_point(text: &str, max_payload: usize) -> usize {
    debug_assert!(text.len() > max_payload);
    let window = floor_char_boundary(text, max_payload);
    if window == 0 {
        return ceil_char_boundary(text, max_payload);
    }
    let head = &text[..window];

    if let Some(index) = head.rfind("\n\n") {
        return index + 2;
    }
    if let Some(index) = head.rfind('\n') {
        if index > 0 {
            return index + 1;
        }
    }
    if let Some(index) = last_sentence_end(head) {
        return index;
    }
    window
}

/// Index just past the last sentence terminator (`.`, `!`, `?` followed by
/// whitespace) in `head`, if any. The trailing whitespace stays with the
/// prefix so the remainder starts on the next sentence.
fn last_sentence_end(head: &str) -> Option<usize> {
    let bytes = head.as_bytes();
    let mut best = None;
    for (index, byte) in bytes.iter().enumerate() {
        if matches!(byte, b'.' | b'!' | b'?') {
            if let Some(next) = bytes.get(index + 1) {
                if next.is_ascii_whitespace() {
                    best = Some(index + 2);
                }
            }
        }
    }
    best
}

/// Smallest char-boundary index at or past `index`.
fn ceil_char_boundary(text: &str, index: usize) -> usize {
    let mut index = index.min(text.len());
    while !text.is_char_boundary(index) {
        index += 1;
    }
    index
}

/// Largest char-boundary index not past `index`.
fn floor_char_boundary(text: &str, index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    let mut index = index;
    while !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_deltas_stay_buffered_until_finalize() {
        let mut accumulator = ChunkAccumulator::new(100);
        assert!(accumulator.ingest("hello ").is_empty());
        assert!(accumulator.ingest("world").is_empty());
        assert_eq!(accumulator.finalize().as_deref(), Some("hello world"));
        assert_eq!(accumulator.finalize(), None);
    }

    #[test]
    fn overflow_splits_at_hard_boundary_without_sentence_marks() {
        let mut accumulator = ChunkAccumulator::new(8);
        assert!(accumulator.ingest("Hel").is_empty());
        assert!(accumulator.ingest("lo ").is_empty());
        let flushes = accumulator.ingest("world");
        assert_eq!(flushes, vec!["Hello wo".to_string()]);
        assert_eq!(accumulator.finalize().as_deref(), Some("rld"));
    }

    #[test]
    fn oversized_delta_is_drained_completely() {
        let mut accumulator = ChunkAccumulator::new(8);
        let flushes = accumulator.ingest(&"a".repeat(20));
        let lengths: Vec<usize> = flushes.iter().map(String::len).collect();
        assert_eq!(lengths, vec![8, 8, 4]);
        assert_eq!(accumulator.finalize(), None);
    }

    #[test]
    fn prefers_sentence_end_over_hard_cut() {
        let mut accumulator = ChunkAccumulator::new(20);
        assert!(accumulator.ingest("One sentence. Then").is_empty());
        let flushes = accumulator.ingest(" end");
        assert_eq!(flushes, vec!["One sentence. ".to_string()]);
        assert_eq!(accumulator.finalize().as_deref(), Some("Then end"));
    }

    #[test]
    fn prefers_paragraph_break_over_sentence_end() {
        let mut accumulator = ChunkAccumulator::new(30);
        assert!(accumulator.ingest("First part. Done.\n\nSecond part").is_empty());
        let flushes = accumulator.ingest(" continues");
        assert_eq!(flushes, vec!["First part. Done.\n\n".to_string()]);
        assert_eq!(accumulator.finalize().as_deref(), Some("Second part continues"));
    }

    #[test]
    fn never_splits_inside_a_code_point() {
        let mut accumulator = ChunkAccumulator::new(5);
        // Cyrillic characters are two bytes each; a naive cut at 5 would
        // land mid-character.
        let flushes = accumulator.ingest("привет");
        for flush in &flushes {
            assert!(flush.len() <= 5);
            assert!(!flush.is_empty());
        }
        let mut total = flushes.concat();
        if let Some(residual) = accumulator.finalize() {
            total.push_str(&residual);
        }
        assert_eq!(total, "привет");
    }

    #[test]
    fn payload_narrower_than_a_code_point_still_advances() {
        // A 4-byte emoji against a 3-byte ceiling has no fitting prefix;
        // the character is emitted whole instead of looping on an empty
        // split.
        let mut accumulator = ChunkAccumulator::new(3);
        let flushes = accumulator.ingest("😀x");
        assert_eq!(flushes, vec!["😀".to_string(), "x".to_string()]);
        assert_eq!(accumulator.finalize(), None);
    }

    #[test]
    fn empty_stream_yields_no_flushes() {
        let mut accumulator = ChunkAccumulator::new(8);
        assert!(accumulator.ingest("").is_empty());
        assert_eq!(accumulator.finalize(), None);
    }
}
