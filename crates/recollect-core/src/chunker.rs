//! Sentence-aware text chunking.
//!
//! Documents are split into sentence-like units at `.` `!` `?` followed by
//! whitespace, then consecutive units are greedily packed into chunks of at
//! most `max_chars` characters. The packer never splits inside a sentence: a
//! single sentence longer than the cap is emitted as its own oversized chunk.
//! Deterministic and stateless, so re-running it on the same text yields the
//! same chunks.

/// Split `text` into ordered chunks of at most `max_chars` characters.
///
/// Sentences inside a chunk are joined with a single space. Empty or
/// whitespace-only input produces no chunks.
pub fn chunk(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut buf = String::new();
    let mut buf_chars = 0usize;

    for sentence in split_sentences(text) {
        let sentence_chars = sentence.chars().count();
        if buf.is_empty() {
            buf.push_str(sentence);
            buf_chars = sentence_chars;
        } else if buf_chars + 1 + sentence_chars > max_chars {
            chunks.push(std::mem::take(&mut buf));
            buf.push_str(sentence);
            buf_chars = sentence_chars;
        } else {
            buf.push(' ');
            buf.push_str(sentence);
            buf_chars += 1 + sentence_chars;
        }
    }

    if !buf.is_empty() {
        chunks.push(buf);
    }
    chunks
}

/// Split text into trimmed sentence-like units.
///
/// A boundary is a `.` `!` or `?` whose next character is whitespace (or end
/// of input). Runs of terminators like `...` stay attached to their sentence.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut iter = text.char_indices().peekable();

    while let Some((i, c)) = iter.next() {
        if matches!(c, '.' | '!' | '?') {
            let at_boundary = match iter.peek() {
                Some(&(_, next)) => next.is_whitespace(),
                None => true,
            };
            if at_boundary {
                let end = i + c.len_utf8();
                let unit = text[start..end].trim();
                if !unit.is_empty() {
                    sentences.push(unit);
                }
                start = end;
            }
        }
    }

    let tail = text[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail);
    }
    sentences
}
