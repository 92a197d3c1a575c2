//! Sentence chunking for streamed LLM output.
//!
//! Tokens are accumulated until a sentence boundary is confirmed, then the
//! span is emitted as a [`TextChunk`] so synthesis can start before the full
//! response exists. A boundary is `.`, `!` or `?` followed by whitespace;
//! punctuation at the very end of the buffer waits for the next fragment so
//! that `3.` + `14` is not split. Text that grows past `max_chars` without a
//! boundary is cut at the last word break.

use crate::pipeline::messages::{SequenceId, TextChunk};

/// Incremental sentence splitter for one response.
#[derive(Debug)]
pub struct SentenceChunker {
    sequence_id: SequenceId,
    next_index: u64,
    buffer: String,
    max_chars: usize,
}

impl SentenceChunker {
    /// Create a chunker; `max_chars` of 0 disables the length cap.
    pub fn new(sequence_id: SequenceId, max_chars: usize) -> Self {
        Self {
            sequence_id,
            next_index: 0,
            buffer: String::new(),
            max_chars,
        }
    }

    /// Append a streamed fragment and return every chunk it completes.
    pub fn push(&mut self, fragment: &str) -> Vec<TextChunk> {
        self.buffer.push_str(fragment);
        let mut chunks = Vec::new();
        loop {
            let split_at = match find_sentence_boundary(&self.buffer) {
                Some(pos) => pos,
                None => match self.overflow_split() {
                    Some(pos) => pos,
                    None => break,
                },
            };
            let rest = self.buffer.split_off(split_at);
            let span = std::mem::replace(&mut self.buffer, rest);
            if let Some(chunk) = self.make_chunk(&span) {
                chunks.push(chunk);
            }
        }
        chunks
    }

    /// Flush whatever is left once the token stream has ended.
    pub fn finish(&mut self) -> Option<TextChunk> {
        let span = std::mem::take(&mut self.buffer);
        self.make_chunk(&span)
    }

    /// Chunks emitted so far.
    pub fn emitted(&self) -> u64 {
        self.next_index
    }

    /// Text accumulated but not yet emitted.
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    fn make_chunk(&mut self, span: &str) -> Option<TextChunk> {
        let text = span.trim();
        if !text.chars().any(char::is_alphanumeric) {
            return None;
        }
        let chunk = TextChunk {
            sequence_id: self.sequence_id,
            index: self.next_index,
            text: text.to_owned(),
        };
        self.next_index += 1;
        Some(chunk)
    }

    /// Byte offset to cut at when the buffer exceeds the cap.
    fn overflow_split(&self) -> Option<usize> {
        if self.max_chars == 0 {
            return None;
        }
        let (cap_byte, _) = self.buffer.char_indices().nth(self.max_chars)?;
        let head = &self.buffer[..cap_byte];
        match head.rfind(char::is_whitespace) {
            Some(ws) if !head[..ws].trim().is_empty() => Some(ws),
            _ => Some(cap_byte),
        }
    }
}

/// Byte offset just past the first confirmed sentence terminator.
///
/// A terminator counts only when whitespace follows it, so `.`, `!` or `?`
/// at the very end of `text` is not a boundary yet: the next fragment may
/// continue it (`3.` + `14`, `..` + `.`). That chunk is released by the next
/// fragment that starts with whitespace, or by [`SentenceChunker::finish`].
pub fn find_sentence_boundary(text: &str) -> Option<usize> {
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if !matches!(c, '.' | '!' | '?') {
            continue;
        }
        if chars.peek().is_some_and(|&(_, next)| next.is_whitespace()) {
            return Some(i + c.len_utf8());
        }
    }
    None
}
