//! ANSI/VT100 escape sequence processor for NVT mode
//!
//! When the host negotiates plain telnet (or the TN3270E NVT submode), its
//! output is rendered into the same [`ScreenBuffer`] the 3270 side uses,
//! one unformatted cell per character. The key-sequence helpers at the
//! bottom produce what the keyboard sends for cursor and function keys.

use log::trace;

use crate::ebcdic::unicode_to_ebcdic;
use crate::lib3270::codes::EBC_SPACE;
use crate::lib3270::display::{CharSet, ScreenBuffer};

#[derive(Debug, Clone, Default)]
pub struct AnsiProcessor {
    /// Bytes of an escape sequence collected so far
    escape_buffer: Vec<u8>,

    /// Whether we're currently in an escape sequence
    in_escape: bool,

    /// Cursor keys send `ESC O x` instead of `ESC [ x`
    app_cursor: bool,

    /// Saved cursor address (`ESC 7` / `ESC [ s`)
    saved_cursor: Option<usize>,
}

impl AnsiProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether DECCKM (application cursor keys) is in effect
    pub fn app_cursor(&self) -> bool {
        self.app_cursor
    }

    /// Render NVT output into the screen
    pub fn process_data(&mut self, data: &[u8], screen: &mut ScreenBuffer) {
        for &byte in data {
            match byte {
                0x1B => {
                    self.in_escape = true;
                    self.escape_buffer.clear();
                }
                _ if self.in_escape => {
                    self.escape_buffer.push(byte);
                    if self.is_complete_sequence() {
                        let seq = std::mem::take(&mut self.escape_buffer);
                        self.in_escape = false;
                        self.process_escape_sequence(&seq, screen);
                    }
                }
                0x0A | 0x0B | 0x0C => self.line_feed(screen),
                0x0D => {
                    let row = screen.row_of(screen.cursor());
                    screen.set_cursor(screen.address(row, 0));
                }
                0x08 => {
                    let cursor = screen.cursor();
                    if screen.col_of(cursor) > 0 {
                        screen.set_cursor(cursor - 1);
                    }
                }
                0x09 => {
                    let cursor = screen.cursor();
                    let row = screen.row_of(cursor);
                    let col = ((screen.col_of(cursor) / 8) + 1) * 8;
                    screen.set_cursor(screen.address(row, col.min(screen.cols() - 1)));
                }
                0x07 => trace!("NVT bell"),
                0x20..=0x7E => self.write_char_at_cursor(byte as char, screen),
                0xA0..=0xFF => self.write_char_at_cursor(char::from(byte), screen),
                _ => {}
            }
        }
    }

    /// Check if the current escape sequence is complete
    fn is_complete_sequence(&self) -> bool {
        match self.escape_buffer.first() {
            None => false,
            Some(b'[') => self.escape_buffer.len() >= 2 && self.escape_buffer[self.escape_buffer.len() - 1] >= 0x40,
            // ESC ( B and friends carry one argument byte
            Some(b'(') | Some(b')') | Some(b'#') => self.escape_buffer.len() >= 2,
            Some(_) => true,
        }
    }

    fn process_escape_sequence(&mut self, seq: &[u8], screen: &mut ScreenBuffer) {
        match seq[0] {
            b'[' => {
                let params = String::from_utf8_lossy(&seq[1..seq.len() - 1]).into_owned();
                self.process_csi_sequence(&params, seq[seq.len() - 1], screen);
            }
            b'M' => {
                // Reverse Index
                let cursor = screen.cursor();
                if screen.row_of(cursor) > 0 {
                    screen.set_cursor(cursor - screen.cols());
                }
            }
            b'D' => self.line_feed(screen),
            b'E' => {
                self.line_feed(screen);
                let row = screen.row_of(screen.cursor());
                screen.set_cursor(screen.address(row, 0));
            }
            b'7' => self.saved_cursor = Some(screen.cursor()),
            b'8' => {
                if let Some(addr) = self.saved_cursor {
                    screen.set_cursor(addr);
                }
            }
            b'c' => {
                screen.clear();
                self.app_cursor = false;
            }
            _ => trace!("NVT: ignoring ESC {:?}", String::from_utf8_lossy(seq)),
        }
    }

    /// Process Control Sequence Introducer (CSI) sequences
    fn process_csi_sequence(&mut self, params: &str, command: u8, screen: &mut ScreenBuffer) {
        let private = params.starts_with('?');
        let nums: Vec<usize> = params
            .trim_start_matches('?')
            .split(';')
            .map(|p| p.parse().unwrap_or(0))
            .collect();
        let arg = |i: usize, default: usize| match nums.get(i) {
            Some(&0) | None => default,
            Some(&n) => n,
        };
        let cursor = screen.cursor();
        let (row, col) = (screen.row_of(cursor), screen.col_of(cursor));
        let (rows, cols) = (screen.rows(), screen.cols());

        match command {
            b'H' | b'f' => {
                let r = arg(0, 1).min(rows) - 1;
                let c = arg(1, 1).min(cols) - 1;
                screen.set_cursor(screen.address(r, c));
            }
            b'A' => screen.set_cursor(screen.address(row.saturating_sub(arg(0, 1)), col)),
            b'B' => screen.set_cursor(screen.address((row + arg(0, 1)).min(rows - 1), col)),
            b'C' => screen.set_cursor(screen.address(row, (col + arg(0, 1)).min(cols - 1))),
            b'D' => screen.set_cursor(screen.address(row, col.saturating_sub(arg(0, 1)))),
            b'J' => match arg(0, 0) {
                0 => screen.erase(cursor, screen.len() - cursor),
                1 => screen.erase(0, cursor + 1),
                2 => screen.erase(0, screen.len()),
                _ => {}
            },
            b'K' => {
                let line = screen.address(row, 0);
                match arg(0, 0) {
                    0 => screen.erase(cursor, cols - col),
                    1 => screen.erase(line, col + 1),
                    2 => screen.erase(line, cols),
                    _ => {}
                }
            }
            b's' => self.saved_cursor = Some(cursor),
            b'u' => {
                if let Some(addr) = self.saved_cursor {
                    screen.set_cursor(addr);
                }
            }
            b'h' | b'l' if private => {
                if nums.first() == Some(&1) {
                    self.app_cursor = command == b'h';
                }
            }
            // Graphic rendition and modes do not change the buffer contents
            b'm' | b'h' | b'l' | b'r' => {}
            _ => trace!("NVT: ignoring CSI {}{}", params, command as char),
        }
    }

    fn line_feed(&mut self, screen: &mut ScreenBuffer) {
        let cursor = screen.cursor();
        if screen.row_of(cursor) + 1 >= screen.rows() {
            screen.scroll_up();
        } else {
            screen.set_cursor(cursor + screen.cols());
        }
    }

    /// Write character at current cursor position
    fn write_char_at_cursor(&mut self, ch: char, screen: &mut ScreenBuffer) {
        let cursor = screen.cursor();
        let ebc = unicode_to_ebcdic(ch).unwrap_or(EBC_SPACE);
        screen.remove_fa(cursor);
        screen.add(cursor, ebc, CharSet::Base);

        if screen.col_of(cursor) + 1 >= screen.cols() {
            let row = screen.row_of(cursor);
            if row + 1 >= screen.rows() {
                screen.scroll_up();
                screen.set_cursor(screen.address(row, 0));
            } else {
                screen.set_cursor(screen.address(row + 1, 0));
            }
        } else {
            screen.set_cursor(cursor + 1);
        }
    }

    /// Cursor position, 1-based (row, col)
    pub fn get_cursor_position(&self, screen: &ScreenBuffer) -> (usize, usize) {
        let cursor = screen.cursor();
        (screen.row_of(cursor) + 1, screen.col_of(cursor) + 1)
    }
}

/// Cursor keys in NVT mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorKey {
    Up,
    Down,
    Right,
    Left,
}

/// Bytes sent for a cursor key
pub fn nvt_cursor_key(key: CursorKey, app_cursor: bool) -> Vec<u8> {
    let c = match key {
        CursorKey::Up => b'A',
        CursorKey::Down => b'B',
        CursorKey::Right => b'C',
        CursorKey::Left => b'D',
    };
    vec![0x1B, if app_cursor { b'O' } else { b'[' }, c]
}

/// Bytes sent for the Home key
pub fn nvt_home() -> Vec<u8> {
    b"\x1b[H".to_vec()
}

/// Bytes sent for the Clear key
pub fn nvt_clear() -> Vec<u8> {
    b"\x1b[r\x1b[H\x1b[2J".to_vec()
}

/// VT220 function key for PF`n` (1-24); `None` outside that range
pub fn nvt_pf(n: u8) -> Option<Vec<u8>> {
    const CODES: [&str; 20] = [
        "15", "17", "18", "19", "20", "21", "23", "24", "25", "26", "28", "29", "31", "32", "33", "34", "35", "36",
        "37", "38",
    ];
    match n {
        1..=4 => Some(vec![0x1B, b'O', b'P' + (n - 1)]),
        5..=24 => Some(format!("\x1b[{}~", CODES[(n - 5) as usize]).into_bytes()),
        _ => None,
    }
}

/// Bytes sent for PA`n` (1-3); `None` outside that range
pub fn nvt_pa(n: u8) -> Option<Vec<u8>> {
    match n {
        1..=3 => Some(vec![0x1B, b'O', b'p' + (n - 1)]),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lib3270::display::ScreenSize;

    #[test]
    fn test_plain_text_and_newline() {
        let mut screen = ScreenBuffer::new(ScreenSize::Model2);
        let mut ansi = AnsiProcessor::new();
        ansi.process_data(b"login:\r\nok", &mut screen);
        assert_eq!(screen.row_text(0).trim_end(), "login:");
        assert_eq!(screen.row_text(1).trim_end(), "ok");
        assert_eq!(ansi.get_cursor_position(&screen), (2, 3));
    }

    #[test]
    fn test_cursor_position_and_erase() {
        let mut screen = ScreenBuffer::new(ScreenSize::Model2);
        let mut ansi = AnsiProcessor::new();
        ansi.process_data(b"XXXX\x1b[1;3HY\x1b[1;2H\x1b[K", &mut screen);
        assert_eq!(screen.row_text(0).trim_end(), "X");
        ansi.process_data(b"\x1b[2J", &mut screen);
        assert_eq!(screen.row_text(0).trim_end(), "");
    }

    #[test]
    fn test_scroll_at_bottom() {
        let mut screen = ScreenBuffer::with_geometry(2, 10);
        let mut ansi = AnsiProcessor::new();
        ansi.process_data(b"one\r\ntwo\r\nthree", &mut screen);
        assert_eq!(screen.row_text(0).trim_end(), "two");
        assert_eq!(screen.row_text(1).trim_end(), "three");
    }

    #[test]
    fn test_application_cursor_mode() {
        let mut screen = ScreenBuffer::new(ScreenSize::Model2);
        let mut ansi = AnsiProcessor::new();
        ansi.process_data(b"\x1b[?1h", &mut screen);
        assert!(ansi.app_cursor());
        assert_eq!(nvt_cursor_key(CursorKey::Up, ansi.app_cursor()), b"\x1bOA".to_vec());
        ansi.process_data(b"\x1b[?1l", &mut screen);
        assert_eq!(nvt_cursor_key(CursorKey::Left, ansi.app_cursor()), b"\x1b[D".to_vec());
    }

    #[test]
    fn test_function_key_sequences() {
        assert_eq!(nvt_pf(1), Some(b"\x1bOP".to_vec()));
        assert_eq!(nvt_pf(5), Some(b"\x1b[15~".to_vec()));
        assert_eq!(nvt_pf(12), Some(b"\x1b[24~".to_vec()));
        assert_eq!(nvt_pf(25), None);
        assert_eq!(nvt_pa(2), Some(b"\x1bOq".to_vec()));
        assert_eq!(nvt_pa(4), None);
    }
}
