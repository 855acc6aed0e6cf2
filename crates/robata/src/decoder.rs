//! Incremental token-to-text decoding.
//!
//! Token byte sequences routinely end mid-character: a multi-byte UTF-8
//! scalar can be split across two or three tokens. The decoder buffers raw
//! bytes and only renders complete text units, so readers never observe a
//! malformed partial character.

use std::sync::Arc;

use crate::model::{TokenId, TokenTable};

/// Accumulates generated tokens and renders them to text incrementally.
///
/// [`TokenDecoder::read`] holds back a trailing incomplete multi-byte
/// sequence; [`TokenDecoder::flush`] force-decodes everything at the end of a
/// turn. One decoder serves exactly one generation request; state is never
/// reused across turns.
#[derive(Debug)]
pub struct TokenDecoder {
    table: Arc<TokenTable>,
    buf: Vec<u8>,
}

impl TokenDecoder {
    /// A fresh decoder over the model's token table.
    pub fn new(table: Arc<TokenTable>) -> Self {
        Self {
            table,
            buf: Vec::new(),
        }
    }

    /// Appends a token's bytes to the pending buffer.
    pub fn add(&mut self, token: TokenId) {
        self.buf.extend_from_slice(self.table.bytes(token));
    }

    /// Renders all complete text decoded so far.
    ///
    /// A trailing partial multi-byte sequence is held back until later
    /// tokens complete it. Invalid interior bytes decode to U+FFFD rather
    /// than corrupting the output.
    pub fn read(&self) -> String {
        let complete = self.buf.len() - trailing_incomplete(&self.buf);
        String::from_utf8_lossy(&self.buf[..complete]).into_owned()
    }

    /// Force-decodes every buffered byte, replacing any dangling partial
    /// sequence. Used once, at the end of a generation request.
    pub fn flush(self) -> String {
        String::from_utf8_lossy(&self.buf).into_owned()
    }
}

/// Number of trailing bytes that form an incomplete UTF-8 sequence, if any.
fn trailing_incomplete(buf: &[u8]) -> usize {
    // Walk back over at most 3 continuation bytes looking for a lead byte.
    for back in 1..=buf.len().min(4) {
        let byte = buf[buf.len() - back];
        if byte & 0b1100_0000 == 0b1000_0000 {
            continue; // continuation, keep scanning
        }
        let expected = match byte {
            b if b & 0b1000_0000 == 0 => 1,
            b if b & 0b1110_0000 == 0b1100_0000 => 2,
            b if b & 0b1111_0000 == 0b1110_0000 => 3,
            b if b & 0b1111_1000 == 0b1111_0000 => 4,
            // Stray invalid lead; nothing is pending completion.
            _ => return 0,
        };
        return if expected > back { back } else { 0 };
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::mock::MockModel;

    fn byte_decoder() -> TokenDecoder {
        TokenDecoder::new(Arc::new(TokenTable::from_model(&MockModel::echo())))
    }

    #[test]
    fn ascii_decodes_immediately() {
        let mut decoder = byte_decoder();
        for byte in b"hello" {
            decoder.add(*byte as TokenId);
        }
        assert_eq!(decoder.read(), "hello");
        assert_eq!(decoder.flush(), "hello");
    }

    #[test]
    fn split_multibyte_character_is_held_back() {
        // "é" is 0xC3 0xA9; feed it one byte per token.
        let mut decoder = byte_decoder();
        decoder.add(b'a' as TokenId);
        decoder.add(0xC3);
        assert_eq!(decoder.read(), "a");

        decoder.add(0xA9);
        assert_eq!(decoder.read(), "aé");
    }

    #[test]
    fn split_four_byte_character_is_held_back() {
        // U+1F600 is 0xF0 0x9F 0x98 0x80.
        let mut decoder = byte_decoder();
        for byte in [0xF0u8, 0x9F, 0x98] {
            decoder.add(byte as TokenId);
            assert_eq!(decoder.read(), "");
        }
        decoder.add(0x80);
        assert_eq!(decoder.read(), "😀");
    }

    #[test]
    fn read_never_emits_malformed_text() {
        let mut decoder = byte_decoder();
        for byte in "日本語".bytes() {
            decoder.add(byte as TokenId);
            // Every intermediate read must be valid, complete text.
            let text = decoder.read();
            assert_eq!(text, String::from_utf8_lossy(text.as_bytes()));
            assert!(!text.contains('\u{FFFD}'));
        }
        assert_eq!(decoder.read(), "日本語");
    }

    #[test]
    fn flush_replaces_dangling_partial_sequence() {
        let mut decoder = byte_decoder();
        decoder.add(b'x' as TokenId);
        decoder.add(0xE2); // first byte of a 3-byte sequence, never completed
        assert_eq!(decoder.read(), "x");
        assert_eq!(decoder.flush(), "x\u{FFFD}");
    }

    #[test]
    fn invalid_interior_bytes_do_not_poison_later_output() {
        let mut decoder = byte_decoder();
        decoder.add(0xFF); // not valid anywhere in UTF-8
        decoder.add(b'k' as TokenId);
        assert_eq!(decoder.read(), "\u{FFFD}k");
    }
}
