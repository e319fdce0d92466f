//! Incremental `<thinking>` tag parser.
//!
//! The upstream interleaves reasoning inside `<thinking>...</thinking>`
//! tags in the plain text stream. This parser splits arbitrary chunk
//! boundaries into thinking and text segments with the same result the
//! joined input would give:
//!
//! * a `</thinking>` only closes the block when followed by a blank line
//!   (`\n\n`) or when it sits at the very end of the stream;
//! * tags directly preceded by a quote or backtick are quoted content,
//!   not markup;
//! * a partial tag at the end of a chunk is held until the next chunk;
//! * runaway blocks are force-closed after 100 000 chars of thinking.

const OPEN_TAG: &str = "<thinking>";
const CLOSE_TAG: &str = "</thinking>";
const MAX_THINKING_CHARS: usize = 100_000;

const QUOTE_GUARDS: &[char] = &[
    '"', '\'', '`', '“', '”', '‘', '’', '「', '」', '『', '』',
];

#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Text(String),
    Thinking(String),
}

#[derive(Debug, Default)]
pub struct ThinkingParser {
    buffer: String,
    in_thinking: bool,
    thinking_chars: usize,
    overflowed: bool,
    /// Last char consumed before the current buffer; needed for the
    /// quote-guard when a tag lands exactly on a chunk boundary.
    prev_char: Option<char>,
}

impl ThinkingParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &str) -> Vec<Segment> {
        if chunk.is_empty() {
            return Vec::new();
        }
        self.buffer.push_str(chunk);

        let mut out = Vec::new();
        loop {
            let progressed = if self.in_thinking {
                self.scan_thinking(&mut out)
            } else {
                self.scan_text(&mut out)
            };
            if !progressed {
                break;
            }
        }
        out
    }

    /// End of stream: whatever is buffered is final. A trailing
    /// `</thinking>` with nothing after it counts as a real close here.
    pub fn flush(&mut self) -> Vec<Segment> {
        let mut out = Vec::new();
        if self.buffer.is_empty() {
            return out;
        }
        let rest = std::mem::take(&mut self.buffer);
        if self.in_thinking {
            if let Some(stripped) = rest.strip_suffix(CLOSE_TAG) {
                self.emit_thinking(stripped.to_string(), &mut out);
            } else {
                tracing::warn!(
                    chars = rest.len(),
                    "thinking block never closed, flushing as thinking"
                );
                self.emit_thinking(rest, &mut out);
            }
            self.in_thinking = false;
        } else if !rest.is_empty() {
            out.push(Segment::Text(rest));
        }
        out
    }

    // ── text mode ───────────────────────────────────────────────

    fn scan_text(&mut self, out: &mut Vec<Segment>) -> bool {
        let mut search = 0;
        let open_at = loop {
            match self.buffer[search..].find(OPEN_TAG) {
                Some(rel) => {
                    let pos = search + rel;
                    if self.is_quoted_at(pos) {
                        search = pos + 1;
                        continue;
                    }
                    break Some(pos);
                }
                None => break None,
            }
        };

        if let Some(pos) = open_at {
            let before = self.consume(pos);
            if !before.is_empty() {
                out.push(Segment::Text(before));
            }
            self.consume(OPEN_TAG.len());
            self.in_thinking = true;
            self.thinking_chars = 0;
            return true;
        }

        // No complete tag. Hold back a tail that is a strict prefix of the
        // open tag; everything before it is plain text.
        let hold = self.partial_tag_holdback(OPEN_TAG);
        let emit_len = self.buffer.len() - hold;
        if emit_len > 0 {
            let text = self.consume(emit_len);
            out.push(Segment::Text(text));
        }
        false
    }

    // ── thinking mode ───────────────────────────────────────────

    fn scan_thinking(&mut self, out: &mut Vec<Segment>) -> bool {
        let mut search = 0;
        loop {
            let Some(rel) = self.buffer[search..].find(CLOSE_TAG) else {
                break;
            };
            let pos = search + rel;
            if self.is_quoted_at(pos) {
                search = pos + 1;
                continue;
            }

            let after = pos + CLOSE_TAG.len();
            let tail = &self.buffer[after..];
            if tail.len() < 2 && tail.chars().all(|c| c == '\n') {
                // Might become "\n\n"; emit the content we are sure about
                // and wait for more input.
                let content = self.consume(pos);
                self.emit_thinking(content, out);
                return false;
            }
            if tail.starts_with("\n\n") {
                let content = self.consume(pos);
                self.emit_thinking(content, out);
                self.consume(CLOSE_TAG.len());
                let newlines = self.buffer.chars().take_while(|c| *c == '\n').count();
                self.consume(newlines);
                self.in_thinking = false;
                return true;
            }

            // Not followed by a blank line: quoted-looking tag inside the
            // thinking body. Keep scanning past it.
            search = pos + 1;
        }

        if self.thinking_chars + self.buffer.chars().count() > MAX_THINKING_CHARS {
            tracing::warn!("thinking overflow, forcing block closed");
            self.overflowed = true;
            self.in_thinking = false;
            let rest = std::mem::take(&mut self.buffer);
            self.emit_thinking(rest, out);
            return false;
        }

        // Emit everything that cannot be part of a straddling close tag.
        let hold = (CLOSE_TAG.len() + 1).min(self.buffer.len());
        let safe = self.char_boundary(self.buffer.len() - hold);
        if safe > 0 {
            let content = self.consume(safe);
            self.emit_thinking(content, out);
        }
        false
    }

    // ── helpers ─────────────────────────────────────────────────

    fn emit_thinking(&mut self, content: String, out: &mut Vec<Segment>) {
        if !content.is_empty() {
            self.thinking_chars += content.chars().count();
            out.push(Segment::Thinking(content));
        }
    }

    /// Remove and return the first `len` bytes of the buffer, remembering
    /// the final char for the boundary quote-guard.
    fn consume(&mut self, len: usize) -> String {
        let taken: String = self.buffer.drain(..len).collect();
        if let Some(c) = taken.chars().last() {
            self.prev_char = Some(c);
        }
        taken
    }

    fn is_quoted_at(&self, pos: usize) -> bool {
        let preceding = if pos == 0 {
            self.prev_char
        } else {
            self.buffer[..pos].chars().last()
        };
        preceding.is_some_and(|c| QUOTE_GUARDS.contains(&c))
    }

    /// Length of the buffer tail that is a strict prefix of `tag`.
    fn partial_tag_holdback(&self, tag: &str) -> usize {
        let max = (tag.len() - 1).min(self.buffer.len());
        for take in (1..=max).rev() {
            let start = self.buffer.len() - take;
            if !self.buffer.is_char_boundary(start) {
                continue;
            }
            if tag.starts_with(&self.buffer[start..]) {
                return take;
            }
        }
        0
    }

    fn char_boundary(&self, mut idx: usize) -> usize {
        while idx > 0 && !self.buffer.is_char_boundary(idx) {
            idx -= 1;
        }
        idx
    }
}
