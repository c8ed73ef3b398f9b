//! Incremental UTF-8 validation for a fragmented byte stream.
//!
//! Table-driven DFA after Bjoern Hoehrmann's "Flexible and Economical UTF-8
//! Decoder". The validator can be fed arbitrary chunk boundaries; the state
//! carried between chunks makes the result independent of the chunking.

const ACCEPT: u32 = 0;
const REJECT: u32 = 12;

// First 256 entries map a byte to its character class, the remainder maps
// (state, class) to the next state.
#[rustfmt::skip]
static UTF8_TABLE: [u8; 364] = [
    // Character classes.
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1,
    9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9,
    7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7,
    7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7,
    8, 8, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2,
    2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2, 2,
    10, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 3, 4, 3, 3,
    11, 6, 6, 6, 5, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8, 8,
    // Transitions: state * 12 + class -> next state.
    0, 12, 24, 36, 60, 96, 84, 12, 12, 12, 48, 72,
    12, 12, 12, 12, 12, 12, 12, 12, 12, 12, 12, 12,
    12, 0, 12, 12, 12, 12, 12, 0, 12, 0, 12, 12,
    12, 24, 12, 12, 12, 12, 12, 24, 12, 24, 12, 12,
    12, 12, 12, 12, 12, 12, 12, 24, 12, 12, 12, 12,
    12, 24, 12, 12, 12, 12, 12, 12, 12, 24, 12, 12,
    12, 12, 12, 12, 12, 12, 12, 36, 12, 36, 12, 12,
    12, 36, 12, 12, 12, 12, 12, 36, 12, 36, 12, 12,
    12, 36, 12, 12, 12, 12, 12, 12, 12, 12, 12, 12,
];

#[inline]
fn step(state: u32, byte: u8) -> u32 {
    let class = UTF8_TABLE[byte as usize] as u32;
    UTF8_TABLE[(256 + state + class) as usize] as u32
}

/// Validation state carried across the fragments of one text message.
#[derive(Debug, Clone)]
pub struct Utf8Validator {
    state: u32,
}

impl Default for Utf8Validator {
    fn default() -> Self {
        Self::new()
    }
}

impl Utf8Validator {
    pub fn new() -> Self {
        Self { state: ACCEPT }
    }

    /// Feeds one chunk. Once rejected the state is sticky; further input is
    /// ignored.
    pub fn advance(&mut self, data: &[u8]) {
        for &byte in data {
            if self.state == REJECT {
                return;
            }
            self.state = step(self.state, byte);
        }
    }

    /// True if everything fed so far forms complete, valid UTF-8.
    pub fn is_accept(&self) -> bool {
        self.state == ACCEPT
    }

    /// True if no continuation of the input can be valid UTF-8.
    pub fn is_reject(&self) -> bool {
        self.state == REJECT
    }

    pub fn reset(&mut self) {
        self.state = ACCEPT;
    }
}

/// One-shot check of a complete byte string.
pub fn validate(data: &[u8]) -> bool {
    let mut validator = Utf8Validator::new();
    validator.advance(data);
    validator.is_accept()
}
