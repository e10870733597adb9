//! Reveal buffer: the received reply text and how much of it is on screen
//!
//! Lengths are counted in characters, so a reveal never cuts a multi-byte
//! character in half.

/// Advance a reveal position by one character.
///
/// Never goes backwards and never passes the end of `full_text`.
pub fn advance(full_text: &str, revealed_len: usize) -> usize {
    next_revealed(full_text.chars().count(), revealed_len, 1)
}

/// Advance a reveal position by `step` characters within `total` characters
pub fn next_revealed(total: usize, revealed_len: usize, step: usize) -> usize {
    revealed_len.saturating_add(step).min(total)
}

#[derive(Debug, Default, Clone)]
pub struct RevealBuffer {
    full_text: String,
    total_chars: usize,
    revealed_chars: usize,
    revealed_bytes: usize,
    source_exhausted: bool,
}

impl RevealBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, text: &str) {
        self.full_text.push_str(text);
        self.total_chars += text.chars().count();
    }

    /// Swap in a whole new text, used when an error arrives before any content
    pub fn replace(&mut self, text: &str) {
        self.full_text = text.to_string();
        self.total_chars = self.full_text.chars().count();
        self.revealed_chars = 0;
        self.revealed_bytes = 0;
    }

    pub fn mark_exhausted(&mut self) {
        self.source_exhausted = true;
    }

    /// Reveal up to `step` more characters. Returns whether anything changed.
    pub fn tick(&mut self, step: usize) -> bool {
        let next = next_revealed(self.total_chars, self.revealed_chars, step);
        if next == self.revealed_chars {
            return false;
        }

        let extra = next - self.revealed_chars;
        let rest = &self.full_text[self.revealed_bytes..];
        self.revealed_bytes += rest
            .char_indices()
            .nth(extra)
            .map(|(offset, _)| offset)
            .unwrap_or(rest.len());
        self.revealed_chars = next;
        true
    }

    pub fn revealed(&self) -> &str {
        &self.full_text[..self.revealed_bytes]
    }

    pub fn full_text(&self) -> &str {
        &self.full_text
    }

    pub fn into_full_text(self) -> String {
        self.full_text
    }

    pub fn revealed_len(&self) -> usize {
        self.revealed_chars
    }

    pub fn total_len(&self) -> usize {
        self.total_chars
    }

    pub fn is_empty(&self) -> bool {
        self.full_text.is_empty()
    }

    pub fn source_exhausted(&self) -> bool {
        self.source_exhausted
    }

    pub fn is_caught_up(&self) -> bool {
        self.revealed_chars >= self.total_chars
    }

    /// Everything received is on screen and nothing more will come
    pub fn is_drained(&self) -> bool {
        self.source_exhausted && self.is_caught_up()
    }
}
