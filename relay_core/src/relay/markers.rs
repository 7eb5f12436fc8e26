//! In-band markers the upstream embeds in its text stream.
use std::borrow::Cow;

/// Wraps segments that must never reach the caller.
pub const SEGMENT_DELIMITER: &str = "$@$";
/// Upstream attached search results and expects a follow-up request.
pub const CONTINUATION_MARKER: &str = "$~~~$";

/// Removes every `$@$...$@$` segment from one fragment.
///
/// Matching is shortest-first, needs at least one character between the
/// delimiters and never crosses a line break. An unterminated delimiter is
/// left in place. Segments split across fragments are not recognised.
pub fn strip_segments(fragment: &str) -> Cow<'_, str> {
    if !fragment.contains(SEGMENT_DELIMITER) {
        return Cow::Borrowed(fragment);
    }
    let width = SEGMENT_DELIMITER.len();
    let mut out = String::with_capacity(fragment.len());
    let mut rest = fragment;
    while let Some(open) = rest.find(SEGMENT_DELIMITER) {
        let inner = &rest[open + width..];
        match closing_delimiter(inner) {
            Some(end) => {
                out.push_str(&rest[..open]);
                rest = &inner[end + width..];
            }
            None => {
                // no segment starts here, retry from the next character
                out.push_str(&rest[..=open]);
                rest = &rest[open + 1..];
            }
        }
    }
    out.push_str(rest);
    Cow::Owned(out)
}

fn closing_delimiter(inner: &str) -> Option<usize> {
    for (idx, ch) in inner.char_indices() {
        if is_line_terminator(ch) {
            return None;
        }
        let after = idx + ch.len_utf8();
        if inner[after..].starts_with(SEGMENT_DELIMITER) {
            return Some(after);
        }
    }
    None
}

fn is_line_terminator(ch: char) -> bool {
    matches!(ch, '\n' | '\r' | '\u{2028}' | '\u{2029}')
}

pub fn has_continuation(fragment: &str) -> bool {
    fragment.contains(CONTINUATION_MARKER)
}

/// Turns network fragments into text without splitting multi-byte characters.
///
/// An incomplete trailing sequence is held back until the next fragment;
/// genuinely invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let complete = complete_prefix_len(&self.pending);
        let tail = self.pending.split_off(complete);
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending = tail;
        text
    }

    /// Whatever is still held back once the body has ended.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(text)
    }
}

fn complete_prefix_len(bytes: &[u8]) -> usize {
    let mut start = 0;
    loop {
        match std::str::from_utf8(&bytes[start..]) {
            Ok(_) => return bytes.len(),
            Err(e) => match e.error_len() {
                Some(len) => start += e.valid_up_to() + len,
                None => return start + e.valid_up_to(),
            },
        }
    }
}
