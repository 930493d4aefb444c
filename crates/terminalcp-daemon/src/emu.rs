//! Terminal emulator adapter: raw PTY bytes in, logical screen out.
//!
//! Wraps a `vt100::Parser` (xterm-256color semantics, scrollback built in).
//! The parser buffers partial escape sequences internally, so `feed` may be
//! called with arbitrary byte boundaries.

/// An emulated terminal screen with scrollback history.
pub struct ScreenEmulator {
    parser: vt100::Parser,
}

impl ScreenEmulator {
    pub fn new(cols: u16, rows: u16, scrollback_lines: usize) -> Self {
        Self {
            parser: vt100::Parser::new(rows, cols, scrollback_lines),
        }
    }

    /// Advance the emulator state with a chunk of raw output bytes.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.parser.process(bytes);
    }

    /// Resize the screen grid. Scrollback is preserved.
    pub fn resize(&mut self, cols: u16, rows: u16) {
        self.parser.set_size(rows, cols);
    }

    /// Current dimensions as (cols, rows).
    pub fn size(&self) -> (u16, u16) {
        let (rows, cols) = self.parser.screen().size();
        (cols, rows)
    }

    /// The currently visible screen as text: rows joined by newlines,
    /// per-row trailing whitespace and trailing blank lines trimmed.
    /// Attributes, cursor position, and colors are not represented.
    pub fn snapshot(&self) -> String {
        let contents = self.parser.screen().contents();
        let mut lines: Vec<&str> = contents.lines().map(|l| l.trim_end()).collect();
        while lines.last().is_some_and(|l| l.is_empty()) {
            lines.pop();
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Feed a translated key token into the emulator. The daemon itself
    /// feeds keys to the child, never to the emulator; this only checks
    /// the bytes don't wedge an xterm-compatible state machine.
    fn feed_key(emulator: &mut ScreenEmulator, token: &str) {
        let bytes = crate::keys::key_to_bytes(token).unwrap();
        emulator.feed(&bytes);
    }

    fn emu() -> ScreenEmulator {
        ScreenEmulator::new(80, 24, 100)
    }

    #[test]
    fn test_plain_text() {
        let mut e = emu();
        e.feed(b"hello");
        assert_eq!(e.snapshot(), "hello");
    }

    #[test]
    fn test_multiple_lines() {
        let mut e = emu();
        e.feed(b"first\r\nsecond\r\nthird");
        assert_eq!(e.snapshot(), "first\nsecond\nthird");
    }

    #[test]
    fn test_trailing_blank_lines_trimmed() {
        let mut e = emu();
        e.feed(b"only\r\n\r\n\r\n");
        assert_eq!(e.snapshot(), "only");
    }

    #[test]
    fn test_empty_screen() {
        let e = emu();
        assert_eq!(e.snapshot(), "");
    }

    #[test]
    fn test_sgr_attributes_not_rendered() {
        let mut e = emu();
        e.feed(b"\x1b[1;31mred\x1b[0m plain");
        assert_eq!(e.snapshot(), "red plain");
    }

    #[test]
    fn test_partial_escape_sequence_across_feeds() {
        let mut e = emu();
        e.feed(b"\x1b[3");
        e.feed(b"1mred\x1b[0m");
        assert_eq!(e.snapshot(), "red");
    }

    #[test]
    fn test_cursor_movement() {
        let mut e = emu();
        e.feed(b"ab\x1b[1;1Hc");
        assert_eq!(e.snapshot(), "cb");
    }

    #[test]
    fn test_carriage_return_overwrite() {
        let mut e = emu();
        e.feed(b"12345\rab");
        assert_eq!(e.snapshot(), "ab345");
    }

    #[test]
    fn test_clear_screen() {
        let mut e = emu();
        e.feed(b"old contents\x1b[2J\x1b[H");
        assert_eq!(e.snapshot(), "");
    }

    #[test]
    fn test_resize_dimensions() {
        let mut e = emu();
        assert_eq!(e.size(), (80, 24));
        e.resize(100, 30);
        assert_eq!(e.size(), (100, 30));
    }

    #[test]
    fn test_resize_keeps_content() {
        let mut e = emu();
        e.feed(b"keep me");
        e.resize(100, 30);
        assert!(e.snapshot().contains("keep me"));
    }

    #[test]
    fn test_wide_characters_do_not_corrupt() {
        let mut e = emu();
        e.feed("宽字符 ok".as_bytes());
        assert!(e.snapshot().contains("ok"));
    }

    #[test]
    fn test_scrolling_keeps_visible_tail() {
        let mut e = ScreenEmulator::new(20, 4, 100);
        for i in 0..10 {
            e.feed(format!("line{}\r\n", i).as_bytes());
        }
        let snap = e.snapshot();
        assert!(snap.contains("line9"));
        assert!(!snap.contains("line0"));
    }

    #[test]
    fn test_key_bytes_are_valid_terminal_input() {
        // Arrow keys and chords must parse cleanly as input to an
        // xterm-compatible emulator without wedging the state machine.
        let mut e = emu();
        for token in ["Up", "Down", "Left", "Right", "F5", "C-c", "M-x"] {
            feed_key(&mut e, token);
        }
        e.feed(b"still alive");
        assert!(e.snapshot().contains("still alive"));
    }
}
